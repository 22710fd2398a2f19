//! Placeholder for backends that are not compiled in or are disabled

use std::sync::Arc;

use crate::backend::{Device, Platform};
use crate::error::{Result, RuntimeError};
use crate::types::DeviceType;

/// Platform with no devices. `init` reports `NotAvailable`.
pub struct DummyPlatform {
    name: String,
    device_type: DeviceType,
}

impl DummyPlatform {
    pub fn new(name: impl Into<String>, device_type: DeviceType) -> Self {
        Self {
            name: name.into(),
            device_type,
        }
    }
}

impl Platform for DummyPlatform {
    fn name(&self) -> &str {
        &self.name
    }

    fn device_type(&self) -> DeviceType {
        self.device_type
    }

    fn init(&mut self) -> Result<()> {
        Err(RuntimeError::not_available(format!("{} platform is not available", self.name)))
    }

    fn device_count(&self) -> usize {
        0
    }

    fn device(&self, index: u32) -> Result<Arc<dyn Device>> {
        Err(RuntimeError::invalid_value(format!("{} has no device {index}", self.name)))
    }
}
