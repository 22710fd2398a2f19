//! Host backend
//!
//! Always present. Provides exactly one device, the machine itself, whose
//! buffers are plain heap memory and whose events complete on record.
//!
//! ```text
//! CpuPlatform
//! └── CpuDevice        - name, memory size, aligned raw allocations
//!     ├── CpuBuffer    - RwLock'd heap bytes
//!     └── CpuEvent     - Mutex + Condvar completion marker
//! ```

mod buffer;
mod device;
mod event;
pub(crate) mod sysinfo;

use std::sync::Arc;

pub use buffer::CpuBuffer;
pub use device::CpuDevice;
pub use event::CpuEvent;

use crate::backend::{Device, Platform};
use crate::error::{Result, RuntimeError};
use crate::types::DeviceType;

/// Platform owning the host device
#[derive(Default)]
pub struct CpuPlatform {
    device: Option<Arc<CpuDevice>>,
}

impl CpuPlatform {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Platform for CpuPlatform {
    fn name(&self) -> &str {
        "Host"
    }

    fn device_type(&self) -> DeviceType {
        DeviceType::Host
    }

    fn init(&mut self) -> Result<()> {
        if self.device.is_none() {
            tracing::debug!("initializing host platform");
            self.device = Some(Arc::new(CpuDevice::new()));
        }
        Ok(())
    }

    fn device_count(&self) -> usize {
        usize::from(self.device.is_some())
    }

    fn device(&self, index: u32) -> Result<Arc<dyn Device>> {
        match (&self.device, index) {
            (Some(device), 0) => Ok(Arc::clone(device) as Arc<dyn Device>),
            (None, _) => Err(RuntimeError::not_available("host platform not initialized")),
            (Some(_), index) => Err(RuntimeError::invalid_value(format!("host device {index} out of range"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DeviceInfo, GetDeviceRequest};

    #[test]
    fn test_init_is_idempotent() {
        let mut platform = CpuPlatform::new();
        assert_eq!(platform.device_count(), 0);

        platform.init().unwrap();
        let first = platform.device(0).unwrap();
        platform.init().unwrap();
        let second = platform.device(0).unwrap();

        assert_eq!(platform.device_count(), 1);
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_get_device_range() {
        let mut platform = CpuPlatform::new();
        platform.init().unwrap();

        assert!(platform.get_device(&GetDeviceRequest::new(DeviceType::Host, 0)).is_ok());
        let err = platform
            .get_device(&GetDeviceRequest::new(DeviceType::Host, 1))
            .err()
            .unwrap();
        assert!(matches!(err, RuntimeError::InvalidValue(_)));
    }

    #[test]
    fn test_append_device_infos() {
        let mut platform = CpuPlatform::new();
        platform.init().unwrap();

        assert_eq!(platform.append_device_infos(None, 0).unwrap(), 1);

        let mut infos: Vec<DeviceInfo> = Vec::new();
        assert_eq!(platform.append_device_infos(Some(&mut infos), 0).unwrap(), 0);
        assert_eq!(platform.append_device_infos(Some(&mut infos), 4).unwrap(), 1);
        assert!(infos[0].is_host);
    }
}
