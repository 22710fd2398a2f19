//! One CUDA GPU

use std::collections::HashSet;
use std::ffi::{c_void, CString};
use std::path::Path;
use std::sync::Arc;

use cudarc::driver::{self, result, sys};
use cudarc::nvrtc::{self, CompileOptions};
use parking_lot::Mutex;

use super::buffer::CudaBuffer;
use super::event::CudaEvent;
use super::{driver_error, BACKEND};
use crate::backend::{Buffer, Device, DeviceId, Event};
use crate::cache::CompilationCache;
use crate::chain::expect;
use crate::error::{Result, RuntimeError};
use crate::kernel::{KernelCache, KernelCompiler, ModuleLoader};
use crate::log::Diagnostics;
use crate::types::{
    CreateBufferInfo, CreateEventInfo, CudaDeviceFeatures, CudaDeviceOptions, DeviceFeatures, DeviceInfo,
    DeviceOptions, DeviceType, LaunchKernelInfo,
};

/// `.cu` sources go through NVRTC, `.ptx` files are used as they are.
pub struct NvrtcCompiler {
    compute_capability: (i32, i32),
    diagnostics: Arc<Diagnostics>,
}

impl KernelCompiler for NvrtcCompiler {
    fn target_tag(&self) -> String {
        format!("sm_{}{}", self.compute_capability.0, self.compute_capability.1)
    }

    fn source_extensions(&self) -> &[&str] {
        &[".cu", ".ptx"]
    }

    fn image_extension(&self) -> &str {
        ".ptx"
    }

    fn compile(&self, path: &Path, source: &[u8]) -> Result<Vec<u8>> {
        if path.extension().is_some_and(|ext| ext == "ptx") {
            return Ok(source.to_vec());
        }

        let source = std::str::from_utf8(source)
            .map_err(|_| RuntimeError::invalid_value(format!("'{}' is not UTF-8", path.display())))?;
        let options = CompileOptions {
            options: vec![format!(
                "--gpu-architecture=compute_{}{}",
                self.compute_capability.0, self.compute_capability.1
            )],
            ..Default::default()
        };
        tracing::debug!(file = %path.display(), target = %self.target_tag(), "compiling with NVRTC");

        let ptx = nvrtc::compile_ptx_with_opts(source, options).map_err(|err| {
            let message = format!("NVRTC failed on '{}': {err:?}", path.display());
            self.diagnostics.error(&message);
            RuntimeError::platform(BACKEND, message)
        })?;
        Ok(ptx.to_src().into_bytes())
    }
}

pub struct ModuleRef(sys::CUmodule);
#[derive(Clone, Copy)]
pub struct FunctionRef(sys::CUfunction);

// SAFETY: modules and functions are context-bound handles usable from any
// thread that binds the owning context.
unsafe impl Send for ModuleRef {}
unsafe impl Send for FunctionRef {}

/// Loads PTX images into the device's primary context.
pub struct DriverLoader {
    context: Arc<driver::CudaDevice>,
    diagnostics: Arc<Diagnostics>,
}

impl ModuleLoader for DriverLoader {
    type Module = ModuleRef;
    type Function = FunctionRef;

    fn backend(&self) -> &'static str {
        BACKEND
    }

    fn load_module(&self, name: &Path, image: &[u8]) -> Result<ModuleRef> {
        self.context
            .bind_to_thread()
            .map_err(|err| driver_error(&self.diagnostics, "cuCtxSetCurrent", err))?;

        let mut image = image.to_vec();
        if image.last() != Some(&0) {
            image.push(0);
        }
        tracing::debug!(module = %name.display(), bytes = image.len(), "loading CUDA module");
        // SAFETY: the image is NUL-terminated and outlives the call.
        let module = unsafe { result::module::load_data(image.as_ptr().cast::<c_void>()) }
            .map_err(|err| driver_error(&self.diagnostics, "cuModuleLoadData", err))?;
        Ok(ModuleRef(module))
    }

    fn get_function(&self, module: &ModuleRef, name: &str) -> Result<Option<FunctionRef>> {
        let symbol = CString::new(name)
            .map_err(|_| RuntimeError::invalid_value(format!("kernel name '{name}' contains NUL")))?;
        // SAFETY: the module is loaded in the bound context.
        match unsafe { result::module::get_function(module.0, symbol) } {
            Ok(function) => Ok(Some(FunctionRef(function))),
            Err(err) if err.0 == sys::CUresult::CUDA_ERROR_NOT_FOUND => Ok(None),
            Err(err) => Err(driver_error(&self.diagnostics, "cuModuleGetFunction", err)),
        }
    }
}

pub struct CudaDevice {
    index: u32,
    context: Arc<driver::CudaDevice>,
    diagnostics: Arc<Diagnostics>,
    name: String,
    total_memory: u64,
    compute_capability: (i32, i32),
    kernels: KernelCache<NvrtcCompiler, DriverLoader>,
    options: Mutex<CudaDeviceOptions>,
    allocations: Mutex<HashSet<sys::CUdeviceptr>>,
}

impl CudaDevice {
    pub(crate) fn new(index: u32, cache: Arc<CompilationCache>, diagnostics: Arc<Diagnostics>) -> Result<Self> {
        let context = driver::CudaDevice::new(index as usize)
            .map_err(|err| driver_error(&diagnostics, "cuDevicePrimaryCtxRetain", err))?;

        let name = context
            .name()
            .map_err(|err| driver_error(&diagnostics, "cuDeviceGetName", err))?;
        let attribute = |attr| {
            context
                .attribute(attr)
                .map_err(|err| driver_error(&diagnostics, "cuDeviceGetAttribute", err))
        };
        let compute_capability = (
            attribute(sys::CUdevice_attribute::CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MAJOR)?,
            attribute(sys::CUdevice_attribute::CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MINOR)?,
        );
        // SAFETY: the device ordinal was just validated by context creation.
        let total_memory = unsafe { result::device::total_mem(*context.cu_device()) }
            .map_err(|err| driver_error(&diagnostics, "cuDeviceTotalMem", err))? as u64;

        tracing::info!(
            index,
            name = %name,
            compute_capability = ?compute_capability,
            total_memory,
            "CUDA device detected"
        );

        let kernels = KernelCache::new(
            NvrtcCompiler {
                compute_capability,
                diagnostics: Arc::clone(&diagnostics),
            },
            DriverLoader {
                context: Arc::clone(&context),
                diagnostics: Arc::clone(&diagnostics),
            },
            cache,
            Arc::clone(&diagnostics),
        );

        Ok(Self {
            index,
            context,
            diagnostics,
            name,
            total_memory,
            compute_capability,
            kernels,
            options: Mutex::new(CudaDeviceOptions::default()),
            allocations: Mutex::new(HashSet::new()),
        })
    }

    fn bind(&self) -> Result<()> {
        self.context
            .bind_to_thread()
            .map_err(|err| driver_error(&self.diagnostics, "cuCtxSetCurrent", err))
    }

    fn attribute(&self, attr: sys::CUdevice_attribute) -> Result<u32> {
        self.context
            .attribute(attr)
            .map(|value| value.max(0) as u32)
            .map_err(|err| driver_error(&self.diagnostics, "cuDeviceGetAttribute", err))
    }

    /// Options last applied through [`Device::set_options`].
    pub fn options(&self) -> CudaDeviceOptions {
        self.options.lock().clone()
    }
}

impl Drop for CudaDevice {
    fn drop(&mut self) {
        if self.context.bind_to_thread().is_err() {
            return;
        }
        for ptr in self.allocations.get_mut().drain() {
            // SAFETY: tracked pointers came from cuMemAlloc and were not released.
            let _ = unsafe { result::free_sync(ptr) };
        }
    }
}

impl Device for CudaDevice {
    fn id(&self) -> DeviceId {
        DeviceId::new(DeviceType::Cuda, self.index)
    }

    fn info(&self) -> DeviceInfo {
        DeviceInfo {
            device_type: DeviceType::Cuda,
            device_number: self.index,
            name: self.name.clone(),
            version: (self.compute_capability.0 * 10 + self.compute_capability.1) as u32,
            is_host: false,
            total_memory: self.total_memory,
            ..Default::default()
        }
    }

    fn native_handle(&self) -> *mut c_void {
        (*self.context.cu_primary_ctx()).cast::<c_void>()
    }

    fn features(&self, features: &mut DeviceFeatures) -> Result<()> {
        expect(Some(&*features))?;
        let Some(cuda) = features.next.get_mut::<CudaDeviceFeatures>()? else {
            return Ok(());
        };

        use sys::CUdevice_attribute::*;
        cuda.max_threads_per_block = self.attribute(CU_DEVICE_ATTRIBUTE_MAX_THREADS_PER_BLOCK)?;
        cuda.max_block_dim = [
            self.attribute(CU_DEVICE_ATTRIBUTE_MAX_BLOCK_DIM_X)?,
            self.attribute(CU_DEVICE_ATTRIBUTE_MAX_BLOCK_DIM_Y)?,
            self.attribute(CU_DEVICE_ATTRIBUTE_MAX_BLOCK_DIM_Z)?,
        ];
        cuda.max_grid_dim = [
            self.attribute(CU_DEVICE_ATTRIBUTE_MAX_GRID_DIM_X)?,
            self.attribute(CU_DEVICE_ATTRIBUTE_MAX_GRID_DIM_Y)?,
            self.attribute(CU_DEVICE_ATTRIBUTE_MAX_GRID_DIM_Z)?,
        ];
        cuda.max_shared_mem_per_block = self.attribute(CU_DEVICE_ATTRIBUTE_MAX_SHARED_MEMORY_PER_BLOCK)?;
        cuda.max_registers_per_block = self.attribute(CU_DEVICE_ATTRIBUTE_MAX_REGISTERS_PER_BLOCK)?;

        self.bind()?;
        let (free, _total) = result::mem_get_info().map_err(|err| driver_error(&self.diagnostics, "cuMemGetInfo", err))?;
        cuda.free_memory = free as u64;
        Ok(())
    }

    fn set_options(&self, options: &DeviceOptions) -> Result<()> {
        expect(Some(options))?;
        let Some(cuda) = options.next.get::<CudaDeviceOptions>()? else {
            return Ok(());
        };

        let mut current = self.options.lock();
        current.dump_cubin = cuda.dump_cubin;
        current.use_nvptx = cuda.use_nvptx;
        self.kernels.set_dump_images(cuda.dump_cubin);
        tracing::debug!(device = self.index, dump = cuda.dump_cubin, nvptx = cuda.use_nvptx, "CUDA options set");
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.bind()?;
        self.context
            .synchronize()
            .map_err(|err| driver_error(&self.diagnostics, "cuCtxSynchronize", err))
    }

    fn create_buffer(&self, info: &CreateBufferInfo) -> Result<Arc<dyn Buffer>> {
        expect(Some(info))?;
        Ok(Arc::new(CudaBuffer::new(
            Arc::clone(&self.context),
            Arc::clone(&self.diagnostics),
            self.id(),
            info.size,
            info.flags,
        )?))
    }

    fn create_event(&self, _info: &CreateEventInfo) -> Result<Arc<dyn Event>> {
        Ok(Arc::new(CudaEvent::new(
            Arc::clone(&self.context),
            Arc::clone(&self.diagnostics),
        )?))
    }

    fn launch_kernel(&self, info: &LaunchKernelInfo) -> Result<()> {
        expect(Some(info))?;
        if info.block.contains(&0) {
            return Err(RuntimeError::invalid_value("block dimensions must be non-zero"));
        }
        let function = self.kernels.function(&info.file_name, &info.kernel_name)?;

        // `grid` counts threads, the driver wants blocks.
        let grid = (
            info.grid[0] / info.block[0],
            info.grid[1] / info.block[1],
            info.grid[2] / info.block[2],
        );
        let block = (info.block[0], info.block[1], info.block[2]);
        let mut params = info.kernel_params.clone();

        self.bind()?;
        tracing::trace!(kernel = %info.kernel_name, ?grid, ?block, "launching CUDA kernel");
        // SAFETY: the caller provides one valid pointer per kernel parameter.
        unsafe { result::launch_kernel(function.0, grid, block, 0, *self.context.cu_stream(), &mut params) }
            .map_err(|err| driver_error(&self.diagnostics, "cuLaunchKernel", err))
    }

    fn allocate_memory(&self, size: usize) -> Result<*mut c_void> {
        self.bind()?;
        // SAFETY: the context is bound.
        let ptr = unsafe { result::malloc_sync(size) }.map_err(|err| {
            if err.0 == sys::CUresult::CUDA_ERROR_OUT_OF_MEMORY {
                RuntimeError::OutOfDeviceMemory { requested: size }
            } else {
                driver_error(&self.diagnostics, "cuMemAlloc", err)
            }
        })?;
        self.allocations.lock().insert(ptr);
        Ok(ptr as usize as *mut c_void)
    }

    fn release_memory(&self, ptr: *mut c_void) -> Result<()> {
        let address = ptr as usize as sys::CUdeviceptr;
        if !self.allocations.lock().remove(&address) {
            return Err(RuntimeError::invalid_value(format!(
                "{ptr:p} was not allocated on CUDA device {}",
                self.index
            )));
        }
        self.bind()?;
        // SAFETY: the pointer was allocated on this device and is freed once.
        unsafe { result::free_sync(address) }.map_err(|err| driver_error(&self.diagnostics, "cuMemFree", err))
    }
}
