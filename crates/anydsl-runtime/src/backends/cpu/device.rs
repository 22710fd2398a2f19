//! The host device

use std::collections::HashSet;
use std::ffi::c_void;
use std::sync::Arc;

use parking_lot::Mutex;

use super::buffer::CpuBuffer;
use super::event::CpuEvent;
use super::sysinfo::{self, ALIGNMENT};
use crate::backend::{Buffer, Device, DeviceId, Event};
use crate::chain::expect;
use crate::error::{Result, RuntimeError};
use crate::types::{CreateBufferInfo, CreateEventInfo, DeviceInfo, DeviceType, LaunchKernelInfo};

/// The machine the runtime runs on.
pub struct CpuDevice {
    name: String,
    total_memory: u64,
    /// Live raw allocations, so foreign pointers are rejected on release.
    allocations: Mutex<HashSet<usize>>,
}

impl CpuDevice {
    pub fn new() -> Self {
        let name = sysinfo::cpu_name();
        let total_memory = sysinfo::total_memory();
        tracing::debug!(name = %name, total_memory, "host device detected");

        Self {
            name,
            total_memory,
            allocations: Mutex::new(HashSet::new()),
        }
    }
}

impl Default for CpuDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for CpuDevice {
    fn drop(&mut self) {
        for ptr in self.allocations.get_mut().drain() {
            // SAFETY: every tracked pointer came from aligned_alloc and was not released.
            unsafe { sysinfo::aligned_free(ptr as *mut c_void) };
        }
    }
}

impl Device for CpuDevice {
    fn id(&self) -> DeviceId {
        DeviceId::HOST
    }

    fn info(&self) -> DeviceInfo {
        DeviceInfo {
            device_type: DeviceType::Host,
            device_number: 0,
            name: self.name.clone(),
            version: 1,
            is_host: true,
            total_memory: self.total_memory,
            ..Default::default()
        }
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }

    fn create_buffer(&self, info: &CreateBufferInfo) -> Result<Arc<dyn Buffer>> {
        Ok(Arc::new(CpuBuffer::new(info.size, info.flags)?))
    }

    fn create_event(&self, _info: &CreateEventInfo) -> Result<Arc<dyn Event>> {
        Ok(Arc::new(CpuEvent::new()))
    }

    fn launch_kernel(&self, info: &LaunchKernelInfo) -> Result<()> {
        expect(Some(info))?;
        Err(RuntimeError::not_supported(format!(
            "kernel launch on the host device ({})",
            info.kernel_name
        )))
    }

    fn allocate_memory(&self, size: usize) -> Result<*mut c_void> {
        let ptr = sysinfo::aligned_alloc(size, ALIGNMENT)?;
        self.allocations.lock().insert(ptr as usize);
        Ok(ptr)
    }

    fn release_memory(&self, ptr: *mut c_void) -> Result<()> {
        if !self.allocations.lock().remove(&(ptr as usize)) {
            return Err(RuntimeError::invalid_value(format!(
                "{ptr:p} was not allocated on the host device"
            )));
        }
        // SAFETY: the pointer was produced by aligned_alloc and is released once.
        unsafe { sysinfo::aligned_free(ptr) };
        Ok(())
    }
}
