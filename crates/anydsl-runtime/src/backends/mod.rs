//! Backend implementations
//!
//! The host backend is always built. CUDA needs the `cuda` feature; OpenCL
//! and HSA are registered as empty placeholders so every [`DeviceType`] has
//! a platform.

pub mod cpu;
#[cfg(feature = "cuda")]
pub mod cuda;
pub mod dummy;

use std::sync::Arc;

use crate::backend::Platform;
use crate::cache::CompilationCache;
use crate::config::RuntimeConfig;
use crate::log::Diagnostics;
use crate::types::DeviceType;

pub use cpu::CpuPlatform;
#[cfg(feature = "cuda")]
pub use cuda::CudaPlatform;
pub use dummy::DummyPlatform;

/// One uninitialized platform per device type, in [`DeviceType::ALL`] order.
pub fn create_platforms(
    config: &RuntimeConfig,
    cache: &Arc<CompilationCache>,
    diagnostics: &Arc<Diagnostics>,
) -> Vec<Box<dyn Platform>> {
    DeviceType::ALL
        .iter()
        .map(|&device_type| create_platform(device_type, config, cache, diagnostics))
        .collect()
}

#[cfg_attr(not(feature = "cuda"), allow(unused_variables))]
fn create_platform(
    device_type: DeviceType,
    config: &RuntimeConfig,
    cache: &Arc<CompilationCache>,
    diagnostics: &Arc<Diagnostics>,
) -> Box<dyn Platform> {
    match device_type {
        DeviceType::Host => Box::new(CpuPlatform::new()),
        #[cfg(feature = "cuda")]
        DeviceType::Cuda if config.enable_cuda => {
            Box::new(CudaPlatform::new(Arc::clone(cache), Arc::clone(diagnostics)))
        }
        DeviceType::Cuda => Box::new(DummyPlatform::new("CUDA", DeviceType::Cuda)),
        DeviceType::OpenCl => Box::new(DummyPlatform::new("OpenCL", DeviceType::OpenCl)),
        DeviceType::Hsa => Box::new(DummyPlatform::new("HSA", DeviceType::Hsa)),
    }
}
