//! Backend traits
//!
//! Every backend provides four object kinds. The runtime only ever talks to
//! them through these traits:
//!
//! ```text
//!                 ┌──────────────┐
//!                 │   Runtime    │  handle tables, validation
//!                 └──────┬───────┘
//!                        │ Arc<dyn Platform>
//!         ┌──────────────┼──────────────┬──────────────┐
//!         ▼              ▼              ▼              ▼
//!    ┌─────────┐   ┌──────────┐   ┌──────────┐   ┌──────────┐
//!    │   CPU   │   │   CUDA   │   │  OpenCL  │   │   HSA    │
//!    │Platform │   │ Platform │   │ (dummy)  │   │ (dummy)  │
//!    └────┬────┘   └────┬─────┘   └──────────┘   └──────────┘
//!         │ Arc<dyn Device>
//!         ▼
//!    Buffer / Event
//! ```
//!
//! Backends implement interior mutability: every method takes `&self` so the
//! runtime can hand out shared references from its handle tables without
//! holding a table lock during device work.

use std::any::Any;
use std::ffi::c_void;
use std::sync::Arc;

use super::copy::{CopyRoute, DeviceId};
use crate::chain::expect;
use crate::error::{Result, RuntimeError};
use crate::types::{
    BufferCopy, BufferFlags, CreateBufferInfo, CreateEventInfo, DeviceFeatures, DeviceInfo, DeviceOptions, DeviceType,
    GetBufferPointerInfo, GetDeviceRequest, LaunchKernelInfo,
};

/// A linear allocation bound to one device.
///
/// Offsets and sizes are in bytes. The runtime checks every region against
/// [`Buffer::size`] before calling into the backend.
pub trait Buffer: Send + Sync {
    /// Size in bytes
    fn size(&self) -> usize;

    /// Flags the buffer was created with
    fn flags(&self) -> BufferFlags;

    /// Host and device addresses of the allocation
    fn pointer(&self) -> Result<GetBufferPointerInfo>;

    /// Write `word` `count` times starting at `offset`.
    fn fill(&self, offset: usize, count: usize, word: u32) -> Result<()>;

    /// Copy `data` into the buffer at `offset`.
    fn copy_from_host(&self, offset: usize, data: &[u8]) -> Result<()>;

    /// Copy `data.len()` bytes starting at `offset` into `data`.
    fn copy_to_host(&self, offset: usize, data: &mut [u8]) -> Result<()>;

    /// Copy `regions` into `dst` along `route`.
    ///
    /// `route` has already been chosen by [`CopyRoute::select`]; a backend
    /// returns `NotSupported` for routes it cannot serve.
    fn copy_to(&self, dst: &dyn Buffer, route: CopyRoute, regions: &[BufferCopy]) -> Result<()>;

    /// Wait for outstanding work touching this buffer.
    fn sync(&self) -> Result<()> {
        Ok(())
    }

    /// Concrete type access for copy routing.
    fn as_any(&self) -> &dyn Any;
}

/// Result of an event query
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EventStatus {
    /// At least one of the events has not completed.
    NotReady,
    /// All queried events completed; `elapsed_ms` is set when requested.
    Complete { elapsed_ms: Option<f32> },
}

impl EventStatus {
    pub fn is_complete(self) -> bool {
        matches!(self, EventStatus::Complete { .. })
    }
}

/// Completion marker on a device's stream.
pub trait Event: Send + Sync {
    /// Move the completion point to "now" in device order.
    fn record(&self) -> Result<()>;

    /// Query completion of `self` (and `other` if given).
    ///
    /// With `elapsed` set, `other` is required and the elapsed time
    /// `other - self` is reported in milliseconds. `other` always belongs to
    /// the same device as `self`. Never blocks.
    fn query(&self, other: Option<&dyn Event>, elapsed: bool) -> Result<EventStatus>;

    /// Block until the event has completed.
    fn sync(&self) -> Result<()>;

    fn as_any(&self) -> &dyn Any;
}

/// One compute device.
pub trait Device: Send + Sync {
    /// Position of this device in the runtime.
    fn id(&self) -> DeviceId;

    fn info(&self) -> DeviceInfo;

    /// Backend-native handle (a CUDA context, for instance). Null when the
    /// backend has none.
    fn native_handle(&self) -> *mut c_void {
        std::ptr::null_mut()
    }

    /// Fill `features` and any backend blocks chained to it.
    fn features(&self, features: &mut DeviceFeatures) -> Result<()> {
        expect(Some(&*features))?;
        Ok(())
    }

    /// Apply `options` and any backend blocks chained to it.
    fn set_options(&self, options: &DeviceOptions) -> Result<()> {
        expect(Some(options))?;
        Ok(())
    }

    /// Wait for all outstanding work on the device.
    fn sync(&self) -> Result<()>;

    fn create_buffer(&self, info: &CreateBufferInfo) -> Result<Arc<dyn Buffer>>;

    fn create_event(&self, info: &CreateEventInfo) -> Result<Arc<dyn Event>>;

    fn launch_kernel(&self, info: &LaunchKernelInfo) -> Result<()>;

    /// Raw allocation outside of the buffer API.
    fn allocate_memory(&self, size: usize) -> Result<*mut c_void>;

    /// Release memory returned by [`Device::allocate_memory`].
    fn release_memory(&self, ptr: *mut c_void) -> Result<()>;
}

/// One backend family and its devices.
pub trait Platform: Send + Sync {
    fn name(&self) -> &str;

    fn device_type(&self) -> DeviceType;

    /// Discover devices. Calling it again is a no-op. Returns `NotAvailable`
    /// when the backend driver is absent.
    fn init(&mut self) -> Result<()>;

    fn device_count(&self) -> usize;

    /// Device by its index within this platform.
    fn device(&self, index: u32) -> Result<Arc<dyn Device>>;

    /// Resolve a device request. `InvalidValue` when the index is out of range.
    fn get_device(&self, request: &GetDeviceRequest) -> Result<Arc<dyn Device>> {
        expect(Some(request))?;
        if request.device_type != self.device_type() {
            return Err(RuntimeError::invalid_value(format!(
                "{} platform cannot serve {} devices",
                self.name(),
                request.device_type
            )));
        }
        if request.device_number as usize >= self.device_count() {
            return Err(RuntimeError::invalid_value(format!(
                "{} device {} out of range ({} available)",
                self.name(),
                request.device_number,
                self.device_count()
            )));
        }
        self.device(request.device_number)
    }

    /// Count devices, or append up to `max_count` descriptions to `out`.
    /// Returns the number of devices counted or appended.
    fn append_device_infos(&self, out: Option<&mut Vec<DeviceInfo>>, max_count: usize) -> Result<usize> {
        let Some(out) = out else {
            return Ok(self.device_count());
        };

        let count = self.device_count().min(max_count);
        for index in 0..count {
            out.push(self.device(index as u32)?.info());
        }
        Ok(count)
    }
}
