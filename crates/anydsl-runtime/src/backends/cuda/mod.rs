//! CUDA backend for NVIDIA GPUs
//!
//! Built with the `cuda` feature. Contexts come from cudarc's primary-context
//! wrapper; allocation, modules, launches and events go through the driver
//! API directly.
//!
//! ```text
//! CudaPlatform
//! └── CudaDevice                - one per GPU, owns the primary context
//!     ├── KernelCache           - NVRTC compiler + driver module loader
//!     ├── CudaBuffer            - device, pinned host or managed allocation
//!     └── CudaEvent             - timing-enabled driver event
//! ```

mod buffer;
mod device;
mod event;

use std::sync::Arc;

use cudarc::driver::{self, sys, DriverError};

pub use buffer::CudaBuffer;
pub use device::CudaDevice;
pub use event::CudaEvent;

use crate::backend::{Device, Platform};
use crate::cache::CompilationCache;
use crate::error::{Result, RuntimeError};
use crate::log::Diagnostics;
use crate::types::DeviceType;

pub(crate) const BACKEND: &str = "CUDA";

/// Map a driver failure to a platform error, publishing it first.
pub(crate) fn driver_error(diagnostics: &Diagnostics, what: &str, err: DriverError) -> RuntimeError {
    let message = format!("{what}: {err}");
    diagnostics.error(&message);
    RuntimeError::platform(BACKEND, message)
}

/// Check the status of a raw driver call.
pub(crate) fn driver_call(diagnostics: &Diagnostics, what: &str, status: sys::CUresult) -> Result<()> {
    match status {
        sys::CUresult::CUDA_SUCCESS => Ok(()),
        status => Err(driver_error(diagnostics, what, DriverError(status))),
    }
}

pub struct CudaPlatform {
    devices: Vec<Arc<CudaDevice>>,
    initialized: bool,
    cache: Arc<CompilationCache>,
    diagnostics: Arc<Diagnostics>,
}

impl CudaPlatform {
    pub fn new(cache: Arc<CompilationCache>, diagnostics: Arc<Diagnostics>) -> Self {
        Self {
            devices: Vec::new(),
            initialized: false,
            cache,
            diagnostics,
        }
    }
}

impl Platform for CudaPlatform {
    fn name(&self) -> &str {
        BACKEND
    }

    fn device_type(&self) -> DeviceType {
        DeviceType::Cuda
    }

    fn init(&mut self) -> Result<()> {
        if self.initialized {
            return Ok(());
        }

        let count = driver::CudaDevice::count()
            .map_err(|err| RuntimeError::not_available(format!("CUDA driver unavailable: {err}")))?;
        tracing::info!(devices = count, "initializing CUDA platform");

        let mut devices = Vec::with_capacity(count.max(0) as usize);
        for index in 0..count.max(0) as u32 {
            devices.push(Arc::new(CudaDevice::new(
                index,
                Arc::clone(&self.cache),
                Arc::clone(&self.diagnostics),
            )?));
        }
        self.devices = devices;
        self.initialized = true;
        Ok(())
    }

    fn device_count(&self) -> usize {
        self.devices.len()
    }

    fn device(&self, index: u32) -> Result<Arc<dyn Device>> {
        self.devices
            .get(index as usize)
            .map(|device| Arc::clone(device) as Arc<dyn Device>)
            .ok_or_else(|| RuntimeError::invalid_value(format!("CUDA device {index} out of range")))
    }
}
