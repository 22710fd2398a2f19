//! Enums, flag sets and the tagged structures passed through the API

use std::ffi::c_void;
use std::fmt;
use std::path::PathBuf;

use crate::chain::structure;
use crate::handle::ModuleHandle;

/// Declare a `u32` flag set with the usual bit operators.
macro_rules! flag_set {
    (
        $(#[$meta:meta])*
        pub struct $name:ident {
            $($(#[$fmeta:meta])* const $flag:ident = $value:expr;)*
        }
    ) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
        pub struct $name(u32);

        impl $name {
            $($(#[$fmeta])* pub const $flag: $name = $name($value);)*

            const NAMES: &'static [(&'static str, u32)] = &[$((stringify!($flag), $value)),*];

            pub const fn empty() -> Self {
                Self(0)
            }

            pub const fn all() -> Self {
                Self(0 $(| $value)*)
            }

            pub const fn from_bits_truncate(bits: u32) -> Self {
                Self(bits & Self::all().0)
            }

            pub const fn bits(self) -> u32 {
                self.0
            }

            pub const fn is_empty(self) -> bool {
                self.0 == 0
            }

            /// Every bit of `other` is set in `self`.
            pub const fn contains(self, other: Self) -> bool {
                self.0 & other.0 == other.0
            }

            /// At least one bit is shared.
            pub const fn intersects(self, other: Self) -> bool {
                self.0 & other.0 != 0
            }
        }

        impl std::ops::BitOr for $name {
            type Output = Self;

            fn bitor(self, rhs: Self) -> Self {
                Self(self.0 | rhs.0)
            }
        }

        impl std::ops::BitOrAssign for $name {
            fn bitor_assign(&mut self, rhs: Self) {
                self.0 |= rhs.0;
            }
        }

        impl std::ops::BitAnd for $name {
            type Output = Self;

            fn bitand(self, rhs: Self) -> Self {
                Self(self.0 & rhs.0)
            }
        }

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                let mut first = true;
                write!(f, "{}(", stringify!($name))?;
                for (name, bit) in Self::NAMES {
                    if self.0 & bit != 0 {
                        if !first {
                            write!(f, " | ")?;
                        }
                        write!(f, "{name}")?;
                        first = false;
                    }
                }
                write!(f, ")")
            }
        }
    };
}

pub(crate) use flag_set;

/// Kind of compute device
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DeviceType {
    #[default]
    Host = 0,
    Cuda = 1,
    OpenCl = 2,
    Hsa = 3,
}

impl DeviceType {
    pub const ALL: [DeviceType; 4] = [DeviceType::Host, DeviceType::Cuda, DeviceType::OpenCl, DeviceType::Hsa];

    pub const fn name(self) -> &'static str {
        match self {
            DeviceType::Host => "host",
            DeviceType::Cuda => "cuda",
            DeviceType::OpenCl => "opencl",
            DeviceType::Hsa => "hsa",
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

flag_set! {
    /// Buffer creation flags
    pub struct BufferFlags {
        /// Host-dereferenceable memory
        const HOST = 0x1;
        /// Coherent host/device memory
        const MANAGED = 0x2;
    }
}

flag_set! {
    /// Source languages accepted by the JIT
    pub struct CompileLanguages {
        const ARTIC = 0x1;
        const IMPALA = 0x2;
    }
}

/// Runtime version triple
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// One region of a buffer-to-buffer copy, in bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BufferCopy {
    pub offset_src: usize,
    pub offset_dst: usize,
    pub size: usize,
}

impl BufferCopy {
    pub const fn new(offset_src: usize, offset_dst: usize, size: usize) -> Self {
        Self {
            offset_src,
            offset_dst,
            size,
        }
    }

    /// Copy of `size` bytes from the start of one buffer to the start of another.
    pub const fn whole(size: usize) -> Self {
        Self::new(0, 0, size)
    }
}

structure! {
    /// Runtime-wide capabilities
    pub struct Features => Features {
        pub has_jit: bool = false,
        pub supported_languages: CompileLanguages = CompileLanguages::empty(),
    }
}

structure! {
    /// Runtime-wide options
    pub struct Options => Options {
        /// Directory for the compilation cache. `None` keeps the current one.
        pub global_cache_dir: Option<PathBuf> = None,
    }
}

structure! {
    /// Description of one device, as returned by enumeration.
    pub struct DeviceInfo => DeviceInfo {
        pub device_type: DeviceType = DeviceType::Host,
        pub device_number: u32 = 0,
        pub name: String = String::new(),
        pub version: u32 = 0,
        pub is_host: bool = false,
        /// In bytes
        pub total_memory: u64 = 0,
    }
}

structure! {
    pub struct GetDeviceRequest => GetDeviceRequest {
        pub device_type: DeviceType = DeviceType::Host,
        pub device_number: u32 = 0,
    }
}

impl GetDeviceRequest {
    pub fn new(device_type: DeviceType, device_number: u32) -> Self {
        Self {
            device_type,
            device_number,
            ..Default::default()
        }
    }
}

structure! {
    /// Backend-native device handle (e.g. a CUDA context). Null on the host.
    pub struct DeviceHandleInfo => DeviceHandleInfo {
        pub handle: *mut c_void = std::ptr::null_mut(),
    }
}

structure! {
    /// Generic device features. Backend blocks hang off `next`.
    pub struct DeviceFeatures => DeviceFeatures {}
}

structure! {
    /// Generic device options. Backend blocks hang off `next`.
    pub struct DeviceOptions => DeviceOptions {}
}

structure! {
    /// CUDA limits, filled in when chained to [`DeviceFeatures`].
    pub struct CudaDeviceFeatures => DeviceFeaturesCuda {
        pub free_memory: u64 = 0,
        pub max_threads_per_block: u32 = 0,
        pub max_block_dim: [u32; 3] = [0; 3],
        pub max_grid_dim: [u32; 3] = [0; 3],
        pub max_shared_mem_per_block: u32 = 0,
        pub max_registers_per_block: u32 = 0,
    }
}

structure! {
    /// CUDA options, read when chained to [`DeviceOptions`].
    pub struct CudaDeviceOptions => DeviceOptionsCuda {
        /// Write compiled binaries next to the cache entries
        pub dump_cubin: bool = false,
        /// Prefer PTX over NVVM input for kernel files
        pub use_nvptx: bool = false,
    }
}

structure! {
    /// Kernel launch request.
    ///
    /// `kernel_params` holds one pointer per kernel argument, each pointing
    /// at the argument's value.
    pub struct LaunchKernelInfo => DeviceLaunchKernelInfo {
        pub file_name: PathBuf = PathBuf::new(),
        pub kernel_name: String = String::new(),
        pub grid: [u32; 3] = [1; 3],
        pub block: [u32; 3] = [1; 3],
        pub kernel_params: Vec<*mut c_void> = Vec::new(),
    }
}

structure! {
    pub struct CreateBufferInfo => CreateBufferInfo {
        /// In bytes
        pub size: usize = 0,
        pub flags: BufferFlags = BufferFlags::empty(),
    }
}

impl CreateBufferInfo {
    pub fn new(size: usize, flags: BufferFlags) -> Self {
        Self {
            size,
            flags,
            ..Default::default()
        }
    }
}

structure! {
    /// Addresses of a buffer's memory. A pointer is null when the memory is
    /// not reachable from that side.
    pub struct GetBufferPointerInfo => GetBufferPointerInfo {
        pub host_pointer: *mut c_void = std::ptr::null_mut(),
        pub device_pointer: u64 = 0,
    }
}

structure! {
    pub struct CreateEventInfo => CreateEventInfo {}
}

structure! {
    pub struct QueryEventInfo => QueryEventInfo {
        pub elapsed_time_ms: f32 = 0.0,
    }
}

structure! {
    /// JIT compilation options
    pub struct JitCompileOptions => JitCompileOptions {
        /// 0 = debug, up to 3
        pub opt_level: u32 = 3,
        /// 4 = errors only, 3 = warn, 2 = info, 1 = verbose, 0 = debug
        pub log_level: u32 = 3,
        /// Exactly one supported language
        pub language: CompileLanguages = CompileLanguages::ARTIC,
        pub use_cache: bool = true,
        /// Overrides the cache directory for this call only
        pub cache_dir: Option<PathBuf> = None,
    }
}

structure! {
    /// Filled by a JIT compilation when provided.
    pub struct JitCompileResult => JitCompileResult {
        pub module: ModuleHandle = ModuleHandle::NULL,
        pub log_output: String = String::new(),
    }
}

structure! {
    pub struct JitLookupInfo => JitLookupInfo {
        pub function: *const c_void = std::ptr::null(),
    }
}

structure! {
    pub struct JitLinkInfo => JitLinkInfo {
        pub library_filename: PathBuf = PathBuf::new(),
    }
}

impl JitLinkInfo {
    pub fn new(library_filename: impl Into<PathBuf>) -> Self {
        Self {
            library_filename: library_filename.into(),
            ..Default::default()
        }
    }
}
