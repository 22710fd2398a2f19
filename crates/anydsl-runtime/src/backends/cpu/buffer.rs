//! Host memory buffers

use std::any::Any;
use std::ffi::c_void;
use std::ptr;

use parking_lot::RwLock;

use crate::backend::{validate_regions, Buffer, CopyRoute};
use crate::error::{Result, RuntimeError};
use crate::types::{BufferCopy, BufferFlags, GetBufferPointerInfo};

/// Buffer backed by a heap allocation that never moves.
pub struct CpuBuffer {
    data: RwLock<Box<[u8]>>,
    flags: BufferFlags,
}

impl CpuBuffer {
    /// Allocate `size` zeroed bytes.
    pub fn new(size: usize, flags: BufferFlags) -> Result<Self> {
        let mut data = Vec::new();
        data.try_reserve_exact(size)
            .map_err(|_| RuntimeError::OutOfHostMemory { requested: size })?;
        data.resize(size, 0);

        Ok(Self {
            data: RwLock::new(data.into_boxed_slice()),
            flags,
        })
    }

    fn copy_regions(src: &[u8], dst: &mut [u8], regions: &[BufferCopy]) {
        for region in regions {
            dst[region.offset_dst..region.offset_dst + region.size]
                .copy_from_slice(&src[region.offset_src..region.offset_src + region.size]);
        }
    }

    /// Run `f` on this buffer's bytes while holding the write lock.
    ///
    /// Used by other backends' device-to-host copies.
    #[cfg_attr(not(feature = "cuda"), allow(dead_code))]
    pub(crate) fn with_bytes_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        f(&mut self.data.write())
    }
}

impl Buffer for CpuBuffer {
    fn size(&self) -> usize {
        self.data.read().len()
    }

    fn flags(&self) -> BufferFlags {
        self.flags
    }

    fn pointer(&self) -> Result<GetBufferPointerInfo> {
        let host_pointer = self.data.write().as_mut_ptr().cast::<c_void>();
        Ok(GetBufferPointerInfo {
            host_pointer,
            device_pointer: host_pointer as u64,
            ..Default::default()
        })
    }

    fn fill(&self, offset: usize, count: usize, word: u32) -> Result<()> {
        let mut data = self.data.write();
        let bytes = count
            .checked_mul(4)
            .ok_or_else(|| RuntimeError::invalid_value(format!("fill count {count} overflows")))?;
        RuntimeError::check_bounds(offset, bytes, data.len())?;

        let pattern = word.to_ne_bytes();
        for chunk in data[offset..offset + bytes].chunks_exact_mut(4) {
            chunk.copy_from_slice(&pattern);
        }
        Ok(())
    }

    fn copy_from_host(&self, offset: usize, src: &[u8]) -> Result<()> {
        let mut data = self.data.write();
        RuntimeError::check_bounds(offset, src.len(), data.len())?;
        data[offset..offset + src.len()].copy_from_slice(src);
        Ok(())
    }

    fn copy_to_host(&self, offset: usize, dst: &mut [u8]) -> Result<()> {
        let data = self.data.read();
        RuntimeError::check_bounds(offset, dst.len(), data.len())?;
        dst.copy_from_slice(&data[offset..offset + dst.len()]);
        Ok(())
    }

    fn copy_to(&self, dst: &dyn Buffer, route: CopyRoute, regions: &[BufferCopy]) -> Result<()> {
        // The host has a single device, so only same-device and host
        // destinations are reachable from here.
        if route == CopyRoute::PeerToPeer {
            return Err(RuntimeError::not_supported("peer-to-peer copy from host memory"));
        }
        let dst = dst
            .as_any()
            .downcast_ref::<CpuBuffer>()
            .ok_or_else(|| RuntimeError::not_supported("host buffer copy into non-host memory"))?;
        validate_regions(self.size(), dst.size(), regions)?;

        if ptr::eq(self, dst) {
            let mut data = self.data.write();
            for region in regions {
                data.copy_within(region.offset_src..region.offset_src + region.size, region.offset_dst);
            }
            return Ok(());
        }

        // Lock in address order so opposite copies cannot deadlock.
        if (self as *const Self) < (dst as *const Self) {
            let src_data = self.data.read();
            let mut dst_data = dst.data.write();
            Self::copy_regions(&src_data, &mut dst_data, regions);
        } else {
            let mut dst_data = dst.data.write();
            let src_data = self.data.read();
            Self::copy_regions(&src_data, &mut dst_data, regions);
        }
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_fill_repeats_word() {
        let buffer = CpuBuffer::new(16, BufferFlags::empty()).unwrap();
        buffer.fill(4, 2, 0xDEADBEEF).unwrap();

        let mut out = [0u8; 16];
        buffer.copy_to_host(0, &mut out).unwrap();

        let word = 0xDEADBEEFu32.to_ne_bytes();
        assert_eq!(&out[0..4], &[0; 4]);
        assert_eq!(&out[4..8], &word);
        assert_eq!(&out[8..12], &word);
        assert_eq!(&out[12..16], &[0; 4]);
    }

    #[test]
    fn test_fill_out_of_range() {
        let buffer = CpuBuffer::new(8, BufferFlags::empty()).unwrap();
        let err = buffer.fill(4, 2, 1).unwrap_err();
        assert!(matches!(err, RuntimeError::BufferOutOfBounds { .. }));
        assert!(buffer.fill(0, usize::MAX, 1).is_err());
    }

    #[test]
    fn test_copy_between_buffers() {
        let src = CpuBuffer::new(8, BufferFlags::empty()).unwrap();
        let dst = CpuBuffer::new(8, BufferFlags::empty()).unwrap();
        src.copy_from_host(0, &[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();

        src.copy_to(&dst, CopyRoute::IntraDevice, &[BufferCopy::new(2, 0, 4)]).unwrap();

        let mut out = [0u8; 8];
        dst.copy_to_host(0, &mut out).unwrap();
        assert_eq!(out, [3, 4, 5, 6, 0, 0, 0, 0]);
    }

    #[test]
    fn test_copy_within_same_buffer() {
        let buffer = CpuBuffer::new(8, BufferFlags::empty()).unwrap();
        buffer.copy_from_host(0, &[1, 2, 3, 4, 0, 0, 0, 0]).unwrap();
        buffer
            .copy_to(&buffer, CopyRoute::IntraDevice, &[BufferCopy::new(0, 4, 4)])
            .unwrap();

        let mut out = [0u8; 8];
        buffer.copy_to_host(0, &mut out).unwrap();
        assert_eq!(out, [1, 2, 3, 4, 1, 2, 3, 4]);
    }

    #[test]
    fn test_peer_route_rejected() {
        let src = CpuBuffer::new(4, BufferFlags::empty()).unwrap();
        let dst = CpuBuffer::new(4, BufferFlags::empty()).unwrap();
        let err = src.copy_to(&dst, CopyRoute::PeerToPeer, &[BufferCopy::whole(4)]).unwrap_err();
        assert!(matches!(err, RuntimeError::NotSupported(_)));
    }

    #[test]
    fn test_pointer_is_stable() {
        let buffer = CpuBuffer::new(32, BufferFlags::HOST).unwrap();
        let first = buffer.pointer().unwrap().host_pointer;
        buffer.fill(0, 8, 7).unwrap();
        assert_eq!(buffer.pointer().unwrap().host_pointer, first);
        assert!(!first.is_null());
    }

    proptest! {
        #[test]
        fn prop_host_round_trip(data in proptest::collection::vec(any::<u8>(), 0..256), pad in 0usize..32) {
            let buffer = CpuBuffer::new(data.len() + pad, BufferFlags::HOST).unwrap();
            buffer.copy_from_host(pad, &data).unwrap();

            let mut out = vec![0u8; data.len()];
            buffer.copy_to_host(pad, &mut out).unwrap();
            prop_assert_eq!(out, data);
        }
    }
}
