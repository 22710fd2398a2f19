//! Device, pinned host and managed memory buffers

use std::any::Any;
use std::ffi::c_void;
use std::sync::Arc;

use cudarc::driver::{self, result, sys};

use super::{driver_call, driver_error, BACKEND};
use crate::backend::{validate_regions, Buffer, CopyRoute, DeviceId};
use crate::backends::cpu::CpuBuffer;
use crate::error::{Result, RuntimeError};
use crate::log::Diagnostics;
use crate::types::{BufferCopy, BufferFlags, GetBufferPointerInfo};

/// `cuMemHostAlloc` flag mapping the allocation into the device address space.
const MEMHOSTALLOC_DEVICEMAP: u32 = 0x02;

/// Where the bytes of a buffer live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Placement {
    Device,
    /// Pinned host memory mapped into the device; holds the host address.
    PinnedHost(usize),
    Managed,
}

pub struct CudaBuffer {
    context: Arc<driver::CudaDevice>,
    diagnostics: Arc<Diagnostics>,
    device: DeviceId,
    ptr: sys::CUdeviceptr,
    placement: Placement,
    size: usize,
    flags: BufferFlags,
}

impl CudaBuffer {
    /// `HOST` buffers get pinned, device-mapped host memory and `MANAGED`
    /// buffers unified memory, so both have a valid host pointer.
    pub(crate) fn new(
        context: Arc<driver::CudaDevice>,
        diagnostics: Arc<Diagnostics>,
        device: DeviceId,
        size: usize,
        flags: BufferFlags,
    ) -> Result<Self> {
        if size == 0 {
            return Err(RuntimeError::invalid_value("CUDA buffers cannot be empty"));
        }
        context
            .bind_to_thread()
            .map_err(|err| driver_error(&diagnostics, "cuCtxSetCurrent", err))?;

        let (ptr, placement) = if flags.contains(BufferFlags::HOST) {
            Self::alloc_pinned(&diagnostics, size)?
        } else if flags.contains(BufferFlags::MANAGED) {
            Self::alloc_managed(&context, &diagnostics, size)?
        } else {
            // SAFETY: the device context is current on this thread.
            let ptr = unsafe { result::malloc_sync(size) }
                .map_err(|err| alloc_error(&diagnostics, "cuMemAlloc", size, err))?;
            (ptr, Placement::Device)
        };
        tracing::trace!(device = %device, size, ?placement, "allocated CUDA buffer");

        Ok(Self {
            context,
            diagnostics,
            device,
            ptr,
            placement,
            size,
            flags,
        })
    }

    fn alloc_pinned(diagnostics: &Diagnostics, size: usize) -> Result<(sys::CUdeviceptr, Placement)> {
        let mut host: *mut c_void = std::ptr::null_mut();
        // SAFETY: the device context is current and `host` is a valid out slot.
        let status = unsafe { sys::lib().cuMemHostAlloc(&mut host, size, MEMHOSTALLOC_DEVICEMAP) };
        if status != sys::CUresult::CUDA_SUCCESS {
            return Err(alloc_error(diagnostics, "cuMemHostAlloc", size, driver::DriverError(status)));
        }

        let mut ptr: sys::CUdeviceptr = 0;
        // SAFETY: `host` was just allocated with the device-map flag.
        let status = unsafe { sys::lib().cuMemHostGetDevicePointer_v2(&mut ptr, host, 0) };
        if let Err(err) = driver_call(diagnostics, "cuMemHostGetDevicePointer", status) {
            // SAFETY: `host` came from cuMemHostAlloc above and is not used again.
            let _ = unsafe { sys::lib().cuMemFreeHost(host) };
            return Err(err);
        }
        Ok((ptr, Placement::PinnedHost(host as usize)))
    }

    fn alloc_managed(
        context: &driver::CudaDevice,
        diagnostics: &Diagnostics,
        size: usize,
    ) -> Result<(sys::CUdeviceptr, Placement)> {
        let supported = context
            .attribute(sys::CUdevice_attribute::CU_DEVICE_ATTRIBUTE_MANAGED_MEMORY)
            .map_err(|err| driver_error(diagnostics, "cuDeviceGetAttribute", err))?;
        if supported == 0 {
            return Err(RuntimeError::not_supported("managed memory on this CUDA device"));
        }
        // SAFETY: the device context is current on this thread.
        let ptr = unsafe { result::malloc_managed(size, sys::CUmemAttach_flags::CU_MEM_ATTACH_GLOBAL) }
            .map_err(|err| alloc_error(diagnostics, "cuMemAllocManaged", size, err))?;
        Ok((ptr, Placement::Managed))
    }

    fn bind(&self) -> Result<()> {
        self.context
            .bind_to_thread()
            .map_err(|err| driver_error(&self.diagnostics, "cuCtxSetCurrent", err))
    }

    fn address(&self, offset: usize) -> sys::CUdeviceptr {
        self.ptr + offset as sys::CUdeviceptr
    }

    fn primary_context(&self) -> sys::CUcontext {
        *self.context.cu_primary_ctx()
    }
}

fn alloc_error(diagnostics: &Diagnostics, what: &str, size: usize, err: driver::DriverError) -> RuntimeError {
    match err.0 {
        sys::CUresult::CUDA_ERROR_OUT_OF_MEMORY => RuntimeError::OutOfDeviceMemory { requested: size },
        sys::CUresult::CUDA_ERROR_NOT_SUPPORTED => RuntimeError::not_supported(format!("{what} on this CUDA device")),
        _ => driver_error(diagnostics, what, err),
    }
}

impl Drop for CudaBuffer {
    fn drop(&mut self) {
        if self.context.bind_to_thread().is_err() {
            return;
        }
        match self.placement {
            Placement::PinnedHost(host) => {
                // SAFETY: the address came from cuMemHostAlloc and is freed once.
                let status = unsafe { sys::lib().cuMemFreeHost(host as *mut c_void) };
                if status != sys::CUresult::CUDA_SUCCESS {
                    tracing::warn!(device = %self.device, ?status, "cuMemFreeHost failed");
                }
            }
            Placement::Device | Placement::Managed => {
                // SAFETY: ptr came from cuMemAlloc/cuMemAllocManaged and is freed once.
                if let Err(err) = unsafe { result::free_sync(self.ptr) } {
                    tracing::warn!(device = %self.device, error = %err, "cuMemFree failed");
                }
            }
        }
    }
}

impl Buffer for CudaBuffer {
    fn size(&self) -> usize {
        self.size
    }

    fn flags(&self) -> BufferFlags {
        self.flags
    }

    fn pointer(&self) -> Result<GetBufferPointerInfo> {
        let host_pointer = match self.placement {
            Placement::Device => std::ptr::null_mut(),
            Placement::PinnedHost(host) => host as *mut c_void,
            Placement::Managed => self.ptr as usize as *mut c_void,
        };
        Ok(GetBufferPointerInfo {
            host_pointer,
            device_pointer: self.ptr,
            ..Default::default()
        })
    }

    fn fill(&self, offset: usize, count: usize, word: u32) -> Result<()> {
        let bytes = count
            .checked_mul(4)
            .ok_or_else(|| RuntimeError::invalid_value(format!("fill count {count} overflows")))?;
        RuntimeError::check_bounds(offset, bytes, self.size)?;
        self.bind()?;

        // SAFETY: the destination range was bounds-checked above.
        let status = unsafe { sys::lib().cuMemsetD32_v2(self.address(offset), word, count) };
        driver_call(&self.diagnostics, "cuMemsetD32", status)
    }

    fn copy_from_host(&self, offset: usize, data: &[u8]) -> Result<()> {
        RuntimeError::check_bounds(offset, data.len(), self.size)?;
        self.bind()?;
        // SAFETY: the destination range was bounds-checked above.
        unsafe { result::memcpy_htod_sync(self.address(offset), data) }
            .map_err(|err| driver_error(&self.diagnostics, "cuMemcpyHtoD", err))
    }

    fn copy_to_host(&self, offset: usize, data: &mut [u8]) -> Result<()> {
        RuntimeError::check_bounds(offset, data.len(), self.size)?;
        self.bind()?;
        // SAFETY: the source range was bounds-checked above.
        unsafe { result::memcpy_dtoh_sync(data, self.address(offset)) }
            .map_err(|err| driver_error(&self.diagnostics, "cuMemcpyDtoH", err))
    }

    fn copy_to(&self, dst: &dyn Buffer, route: CopyRoute, regions: &[BufferCopy]) -> Result<()> {
        validate_regions(self.size, dst.size(), regions)?;
        self.bind()?;

        match route {
            CopyRoute::IntraDevice => {
                let dst = as_cuda(dst)?;
                for region in regions {
                    // SAFETY: both ranges were validated against their buffers.
                    unsafe {
                        result::memcpy_dtod_sync(
                            dst.address(region.offset_dst),
                            self.address(region.offset_src),
                            region.size,
                        )
                    }
                    .map_err(|err| driver_error(&self.diagnostics, "cuMemcpyDtoD", err))?;
                }
                Ok(())
            }
            CopyRoute::PeerToPeer => {
                let dst = as_cuda(dst)?;
                for region in regions {
                    // SAFETY: both ranges were validated against their buffers and
                    // each address belongs to the context passed with it.
                    let status = unsafe {
                        sys::lib().cuMemcpyPeer(
                            dst.address(region.offset_dst),
                            dst.primary_context(),
                            self.address(region.offset_src),
                            self.primary_context(),
                            region.size,
                        )
                    };
                    driver_call(&self.diagnostics, "cuMemcpyPeer", status)?;
                }
                Ok(())
            }
            CopyRoute::DeviceToHost => {
                let dst = dst
                    .as_any()
                    .downcast_ref::<CpuBuffer>()
                    .ok_or_else(|| RuntimeError::platform(BACKEND, "host destination is not host memory"))?;
                dst.with_bytes_mut(|bytes| {
                    for region in regions {
                        let target = &mut bytes[region.offset_dst..region.offset_dst + region.size];
                        // SAFETY: the source range was validated against this buffer.
                        unsafe { result::memcpy_dtoh_sync(target, self.address(region.offset_src)) }
                            .map_err(|err| driver_error(&self.diagnostics, "cuMemcpyDtoH", err))?;
                    }
                    Ok(())
                })
            }
        }
    }

    fn sync(&self) -> Result<()> {
        self.bind()?;
        self.context
            .synchronize()
            .map_err(|err| driver_error(&self.diagnostics, "cuCtxSynchronize", err))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

fn as_cuda(buffer: &dyn Buffer) -> Result<&CudaBuffer> {
    buffer
        .as_any()
        .downcast_ref::<CudaBuffer>()
        .ok_or_else(|| RuntimeError::not_supported("CUDA copy into a non-CUDA buffer"))
}
