//! Heterogeneous-compute runtime
//!
//! One API for the host CPU and accelerators:
//! - **Devices**: enumeration and acquisition per device type
//! - **Buffers**: device memory with host transfers and routed copies
//! - **Events**: completion markers with elapsed-time queries
//! - **Kernels**: source loading, compilation caching and launch
//! - **JIT**: compiling programs into host modules and looking up symbols
//! - **Diagnostics**: leveled log subscriptions
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                        Runtime                           │
//! │       handle tables · validation · error reporting       │
//! └──────┬───────────────────┬───────────────────┬──────────┘
//!        │                   │                   │
//!        ▼                   ▼                   ▼
//! ┌─────────────┐   ┌─────────────────┐   ┌─────────────┐
//! │  Platforms  │   │ CompilationCache│   │ JitManager  │
//! │ CPU · CUDA  │◀──│ files · overlay │──▶│ generator   │
//! │ OpenCL · HSA│   └─────────────────┘   └─────────────┘
//! └─────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust
//! use anydsl_runtime::{BufferFlags, CreateBufferInfo, DeviceHandle, Runtime, RuntimeConfig};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let dir = std::env::temp_dir().join("anydsl-doc-cache");
//! let runtime = Runtime::new(RuntimeConfig::default().with_cache_dir(dir))?;
//!
//! // The null device handle is the host.
//! let buffer = runtime.create_buffer(DeviceHandle::NULL, &CreateBufferInfo::new(16, BufferFlags::HOST))?;
//! runtime.write_buffer(buffer, 0, &[1u32, 2, 3, 4])?;
//!
//! let mut out = [0u32; 4];
//! runtime.read_buffer(buffer, 0, &mut out)?;
//! assert_eq!(out, [1, 2, 3, 4]);
//!
//! runtime.destroy_buffer(buffer)?;
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod backends;
pub mod cache;
pub mod chain;
pub mod config;
pub mod error;
pub mod handle;
pub mod host;
pub mod jit;
pub mod kernel;
pub mod log;
pub mod runtime;
pub mod types;

// Re-export public API
pub use backend::{Buffer, CopyRoute, Device, DeviceId, Event, EventStatus, Platform};
pub use cache::CompilationCache;
pub use chain::{Chain, Extension, Structure, StructureType};
pub use config::RuntimeConfig;
pub use error::{Result, ResultCode, RuntimeError};
pub use handle::{BufferHandle, DeviceHandle, EventHandle, ModuleHandle};
pub use jit::{CodeGenerator, CodeImage, CommandCodegen, JitManager};
pub use log::{Diagnostics, LogCallbackHandle, LogLevel, LogReportCallbackCreateInfo};
pub use runtime::{Runtime, VERSION};
pub use types::{
    BufferCopy, BufferFlags, CompileLanguages, CreateBufferInfo, CreateEventInfo, CudaDeviceFeatures,
    CudaDeviceOptions, DeviceFeatures, DeviceHandleInfo, DeviceInfo, DeviceOptions, DeviceType, Features,
    GetBufferPointerInfo, GetDeviceRequest, JitCompileOptions, JitCompileResult, JitLinkInfo, JitLookupInfo,
    LaunchKernelInfo, Options, QueryEventInfo, Version,
};
