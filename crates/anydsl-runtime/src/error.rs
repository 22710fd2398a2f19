//! Result codes and the error type shared by every runtime operation

use std::fmt;

/// Result type for runtime operations
pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Numeric status codes exchanged at the API boundary.
///
/// Negative values are errors, zero is success, positive values are
/// non-error states. `Incomplete` keeps its historical value of -1.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResultCode {
    Success = 0,
    NotReady = 1,
    Incomplete = -1,
    NotAvailable = -2,
    NotSupported = -3,
    OutOfHostMemory = -4,
    OutOfDeviceMemory = -5,
    InvalidPointer = -6,
    InvalidValue = -7,
    InvalidHandle = -8,
    DeviceMismatch = -9,
    PlatformError = -10,
    JitError = -100,
    JitNoFunction = -101,
}

impl ResultCode {
    pub const fn as_i32(self) -> i32 {
        self as i32
    }

    /// `Incomplete` and `NotReady` are in-progress states, not failures.
    pub const fn is_error(self) -> bool {
        !matches!(self, Self::Success | Self::NotReady | Self::Incomplete)
    }

    pub fn from_i32(value: i32) -> Option<Self> {
        Some(match value {
            0 => Self::Success,
            1 => Self::NotReady,
            -1 => Self::Incomplete,
            -2 => Self::NotAvailable,
            -3 => Self::NotSupported,
            -4 => Self::OutOfHostMemory,
            -5 => Self::OutOfDeviceMemory,
            -6 => Self::InvalidPointer,
            -7 => Self::InvalidValue,
            -8 => Self::InvalidHandle,
            -9 => Self::DeviceMismatch,
            -10 => Self::PlatformError,
            -100 => Self::JitError,
            -101 => Self::JitNoFunction,
            _ => return None,
        })
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Success => "SUCCESS",
            Self::NotReady => "NOT_READY",
            Self::Incomplete => "INCOMPLETE",
            Self::NotAvailable => "NOT_AVAILABLE",
            Self::NotSupported => "NOT_SUPPORTED",
            Self::OutOfHostMemory => "OUT_OF_HOST_MEMORY",
            Self::OutOfDeviceMemory => "OUT_OF_DEVICE_MEMORY",
            Self::InvalidPointer => "INVALID_POINTER",
            Self::InvalidValue => "INVALID_VALUE",
            Self::InvalidHandle => "INVALID_HANDLE",
            Self::DeviceMismatch => "DEVICE_MISMATCH",
            Self::PlatformError => "PLATFORM_ERROR",
            Self::JitError => "JIT_ERROR",
            Self::JitNoFunction => "JIT_NO_FUNCTION",
        };
        write!(f, "{name} ({})", self.as_i32())
    }
}

/// Errors that can occur in the runtime
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// Backend or feature absent from this installation
    #[error("not available: {0}")]
    NotAvailable(String),

    /// Valid request for an unsupported combination
    #[error("unsupported operation: {0}")]
    NotSupported(String),

    /// Host allocation failed
    #[error("out of host memory: requested {requested} bytes")]
    OutOfHostMemory { requested: usize },

    /// Device allocation failed
    #[error("out of device memory: requested {requested} bytes")]
    OutOfDeviceMemory { requested: usize },

    /// Missing required argument
    #[error("invalid pointer: {0}")]
    InvalidPointer(String),

    /// Argument outside its domain
    #[error("invalid value: {0}")]
    InvalidValue(String),

    /// Unknown, stale or mis-typed handle
    #[error("invalid handle: {0:#x}")]
    InvalidHandle(u64),

    /// Region outside of a buffer
    #[error("buffer access out of bounds: offset {offset} + size {size} > buffer size {buffer_size}")]
    BufferOutOfBounds {
        offset: usize,
        size: usize,
        buffer_size: usize,
    },

    /// Operation spans two devices that must match
    #[error("device mismatch: {first} vs {second}")]
    DeviceMismatch { first: String, second: String },

    /// Native backend reported a failure
    #[error("{backend} error: {message}")]
    Platform { backend: &'static str, message: String },

    /// Filesystem failure inside the cache or JIT
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Code generation or image loading failed
    #[error("jit error: {0}")]
    Jit(String),

    /// Symbol not present in a JIT module
    #[error("jit function not found: {0}")]
    JitNoFunction(String),
}

impl RuntimeError {
    /// Status code reported for this error
    pub fn code(&self) -> ResultCode {
        match self {
            Self::NotAvailable(_) => ResultCode::NotAvailable,
            Self::NotSupported(_) => ResultCode::NotSupported,
            Self::OutOfHostMemory { .. } => ResultCode::OutOfHostMemory,
            Self::OutOfDeviceMemory { .. } => ResultCode::OutOfDeviceMemory,
            Self::InvalidPointer(_) => ResultCode::InvalidPointer,
            Self::InvalidValue(_) | Self::BufferOutOfBounds { .. } => ResultCode::InvalidValue,
            Self::InvalidHandle(_) => ResultCode::InvalidHandle,
            Self::DeviceMismatch { .. } => ResultCode::DeviceMismatch,
            Self::Platform { .. } | Self::Io(_) => ResultCode::PlatformError,
            Self::Jit(_) => ResultCode::JitError,
            Self::JitNoFunction(_) => ResultCode::JitNoFunction,
        }
    }

    pub fn not_available(msg: impl Into<String>) -> Self {
        Self::NotAvailable(msg.into())
    }

    pub fn not_supported(msg: impl Into<String>) -> Self {
        Self::NotSupported(msg.into())
    }

    pub fn invalid_pointer(msg: impl Into<String>) -> Self {
        Self::InvalidPointer(msg.into())
    }

    pub fn invalid_value(msg: impl Into<String>) -> Self {
        Self::InvalidValue(msg.into())
    }

    pub fn platform(backend: &'static str, msg: impl Into<String>) -> Self {
        Self::Platform {
            backend,
            message: msg.into(),
        }
    }

    pub fn jit(msg: impl Into<String>) -> Self {
        Self::Jit(msg.into())
    }

    pub fn device_mismatch(first: impl fmt::Display, second: impl fmt::Display) -> Self {
        Self::DeviceMismatch {
            first: first.to_string(),
            second: second.to_string(),
        }
    }

    /// Reject `offset..offset + size` when it does not fit in `buffer_size`.
    pub fn check_bounds(offset: usize, size: usize, buffer_size: usize) -> Result<()> {
        match offset.checked_add(size) {
            Some(end) if end <= buffer_size => Ok(()),
            _ => Err(Self::BufferOutOfBounds {
                offset,
                size,
                buffer_size,
            }),
        }
    }
}

impl From<&RuntimeError> for ResultCode {
    fn from(err: &RuntimeError) -> Self {
        err.code()
    }
}
