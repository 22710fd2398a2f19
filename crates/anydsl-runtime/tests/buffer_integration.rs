//! Buffer lifecycle, host transfers, fills and routed copies.

use std::any::Any;

use anydsl_runtime::backend::copy_between;
use anydsl_runtime::backends::cpu::{CpuBuffer, CpuEvent};
use anydsl_runtime::{
    Buffer, BufferCopy, BufferFlags, CreateBufferInfo, CreateEventInfo, DeviceHandle, DeviceId, DeviceType, Event,
    EventStatus, QueryEventInfo, Result, Runtime, RuntimeConfig, RuntimeError,
};
use proptest::prelude::*;
use tempfile::TempDir;

fn runtime() -> Result<(Runtime, TempDir)> {
    let dir = TempDir::new()?;
    let mut config = RuntimeConfig::default().with_cache_dir(dir.path());
    config.enable_cuda = false;
    Ok((Runtime::new(config)?, dir))
}

#[test]
fn test_host_round_trip() -> Result<()> {
    let (runtime, _dir) = runtime()?;
    let buffer = runtime.create_buffer(DeviceHandle::NULL, &CreateBufferInfo::new(64, BufferFlags::HOST))?;

    let data: Vec<u8> = (0..64).collect();
    runtime.copy_buffer_from_host(buffer, 0, &data)?;

    let mut out = vec![0u8; 64];
    runtime.copy_buffer_to_host(buffer, 0, &mut out)?;
    assert_eq!(out, data);

    let mut tail = [0u8; 8];
    runtime.copy_buffer_to_host(buffer, 56, &mut tail)?;
    assert_eq!(tail, [56, 57, 58, 59, 60, 61, 62, 63]);

    runtime.destroy_buffer(buffer)?;
    Ok(())
}

#[test]
fn test_fill_repeats_word() -> Result<()> {
    let (runtime, _dir) = runtime()?;
    let buffer = runtime.create_buffer(DeviceHandle::NULL, &CreateBufferInfo::new(32, BufferFlags::empty()))?;

    runtime.fill_buffer(buffer, 8, 4, 0x0102_0304)?;

    let mut words = [0u32; 8];
    runtime.read_buffer(buffer, 0, &mut words)?;
    assert_eq!(words, [0, 0, 0x0102_0304, 0x0102_0304, 0x0102_0304, 0x0102_0304, 0, 0]);
    Ok(())
}

#[test]
fn test_out_of_range_access_rejected() -> Result<()> {
    let (runtime, _dir) = runtime()?;
    let buffer = runtime.create_buffer(DeviceHandle::NULL, &CreateBufferInfo::new(16, BufferFlags::empty()))?;

    let err = runtime.fill_buffer(buffer, 12, 2, 1).unwrap_err();
    assert_eq!(err.code(), anydsl_runtime::ResultCode::InvalidValue);

    let err = runtime.copy_buffer_from_host(buffer, 10, &[0; 8]).unwrap_err();
    assert!(matches!(err, RuntimeError::BufferOutOfBounds { .. }));
    Ok(())
}

#[test]
fn test_copy_between_host_buffers() -> Result<()> {
    let (runtime, _dir) = runtime()?;
    let info = CreateBufferInfo::new(16, BufferFlags::HOST);
    let src = runtime.create_buffer(DeviceHandle::NULL, &info)?;
    let dst = runtime.create_buffer(DeviceHandle::NULL, &info)?;

    runtime.write_buffer(src, 0, &[10u32, 20, 30, 40])?;
    runtime.copy_buffer(src, dst, &[BufferCopy::new(4, 0, 8), BufferCopy::new(0, 12, 4)])?;

    let mut out = [0u32; 4];
    runtime.read_buffer(dst, 0, &mut out)?;
    assert_eq!(out, [20, 30, 0, 10]);

    let err = runtime.copy_buffer(src, dst, &[BufferCopy::new(8, 0, 16)]).unwrap_err();
    assert!(matches!(err, RuntimeError::BufferOutOfBounds { .. }));
    Ok(())
}

#[test]
fn test_buffer_pointer_and_sync() -> Result<()> {
    let (runtime, _dir) = runtime()?;
    let buffer = runtime.create_buffer(DeviceHandle::NULL, &CreateBufferInfo::new(8, BufferFlags::HOST))?;
    let pointer = runtime.get_buffer_pointer(buffer)?;
    assert!(!pointer.host_pointer.is_null());
    assert_eq!(pointer.device_pointer, pointer.host_pointer as u64);
    runtime.synchronize_buffer(buffer)?;
    Ok(())
}

#[test]
fn test_destroyed_buffer_is_stale() -> Result<()> {
    let (runtime, _dir) = runtime()?;
    let info = CreateBufferInfo::new(8, BufferFlags::empty());
    let first = runtime.create_buffer(DeviceHandle::NULL, &info)?;
    runtime.destroy_buffer(first)?;

    // The slot is reused, the old handle stays dead.
    let second = runtime.create_buffer(DeviceHandle::NULL, &info)?;
    assert_ne!(first, second);
    assert!(matches!(runtime.buffer_size(first), Err(RuntimeError::InvalidHandle(_))));
    assert_eq!(runtime.buffer_size(second)?, 8);
    Ok(())
}

#[test]
fn test_cross_family_copy_leaves_destination_untouched() -> Result<()> {
    let src = CpuBuffer::new(8, BufferFlags::empty())?;
    let dst = CpuBuffer::new(8, BufferFlags::empty())?;
    src.copy_from_host(0, &[1; 8])?;
    dst.copy_from_host(0, &[9; 8])?;

    let cuda0 = DeviceId::new(DeviceType::Cuda, 0);
    let opencl0 = DeviceId::new(DeviceType::OpenCl, 0);
    for (from, to) in [(DeviceId::HOST, cuda0), (cuda0, opencl0)] {
        let err = copy_between(&src, from, &dst, to, &[BufferCopy::whole(8)]).unwrap_err();
        assert!(matches!(err, RuntimeError::NotSupported(_)));
    }

    let mut out = [0u8; 8];
    dst.copy_to_host(0, &mut out)?;
    assert_eq!(out, [9; 8]);
    Ok(())
}

#[test]
fn test_host_events() -> Result<()> {
    let (runtime, _dir) = runtime()?;
    let start = runtime.create_event(DeviceHandle::NULL, &CreateEventInfo::default())?;
    let end = runtime.create_event(DeviceHandle::NULL, &CreateEventInfo::default())?;

    assert_eq!(runtime.query_event(start, end, None)?, EventStatus::NotReady);

    runtime.record_event(start)?;
    std::thread::sleep(std::time::Duration::from_millis(5));
    runtime.record_event(end)?;
    runtime.synchronize_event(end)?;

    let mut info = QueryEventInfo::default();
    assert!(runtime.query_event(start, end, Some(&mut info))?.is_complete());
    assert!(info.elapsed_time_ms >= 4.0);

    runtime.destroy_event(start)?;
    assert!(matches!(runtime.record_event(start), Err(RuntimeError::InvalidHandle(_))));
    Ok(())
}

/// Event from a device other than the host.
struct ForeignEvent;

impl Event for ForeignEvent {
    fn record(&self) -> Result<()> {
        Ok(())
    }

    fn query(&self, _other: Option<&dyn Event>, _elapsed: bool) -> Result<EventStatus> {
        Ok(EventStatus::Complete { elapsed_ms: None })
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[test]
fn test_cross_device_event_query_is_mismatch() -> Result<()> {
    let host = CpuEvent::new();
    host.record()?;
    let err = host.query(Some(&ForeignEvent as &dyn Event), true).unwrap_err();
    assert!(matches!(err, RuntimeError::DeviceMismatch { .. }));
    Ok(())
}

#[test]
fn test_raw_memory_on_host() -> Result<()> {
    let (runtime, _dir) = runtime()?;
    let ptr = runtime.allocate_memory(DeviceHandle::NULL, 1000)?;
    assert_eq!(ptr as usize % anydsl_runtime::host::ALIGNMENT, 0);

    let mut foreign = 0u64;
    let err = runtime
        .release_memory(DeviceHandle::NULL, (&mut foreign as *mut u64).cast())
        .unwrap_err();
    assert!(matches!(err, RuntimeError::InvalidValue(_)));

    runtime.release_memory(DeviceHandle::NULL, ptr)?;
    Ok(())
}

proptest! {
    #[test]
    fn test_round_trip_any_region(data in proptest::collection::vec(any::<u8>(), 1..256), pad in 0usize..64) {
        let (runtime, _dir) = runtime().unwrap();
        let size = data.len() + pad;
        let buffer = runtime
            .create_buffer(DeviceHandle::NULL, &CreateBufferInfo::new(size, BufferFlags::HOST))
            .unwrap();

        runtime.copy_buffer_from_host(buffer, pad, &data).unwrap();
        let mut out = vec![0u8; data.len()];
        runtime.copy_buffer_to_host(buffer, pad, &mut out).unwrap();
        prop_assert_eq!(out, data);
    }

    #[test]
    fn test_fill_any_word(word in any::<u32>(), count in 0usize..16, offset_words in 0usize..16) {
        let (runtime, _dir) = runtime().unwrap();
        let buffer = runtime
            .create_buffer(DeviceHandle::NULL, &CreateBufferInfo::new(128, BufferFlags::empty()))
            .unwrap();

        runtime.fill_buffer(buffer, offset_words * 4, count, word).unwrap();
        let mut words = [0u32; 32];
        runtime.read_buffer(buffer, 0, &mut words).unwrap();
        for (index, value) in words.iter().enumerate() {
            let expected = if (offset_words..offset_words + count).contains(&index) { word } else { 0 };
            prop_assert_eq!(*value, expected);
        }
    }
}
