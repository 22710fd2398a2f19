//! Extensible structures
//!
//! Configuration and result values all start with a structure-type tag and
//! an extension chain. The tag lets every entry point reject a value of the
//! wrong kind before reading it; the chain carries optional backend-specific
//! blocks (e.g. CUDA feature limits) that a generic caller can ignore.
//!
//! Unlike a raw `pNext` pointer list, the chain is a closed set of typed
//! [`Extension`] records, so walking it never has to trust an untyped tag.

use crate::error::{Result, RuntimeError};
use crate::types::{CudaDeviceFeatures, CudaDeviceOptions};

/// Structure-type tags
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StructureType {
    Features = 0x0,
    DeviceInfo = 0x1,
    Options = 0x2,

    GetDeviceRequest = 0x10,
    DeviceHandleInfo = 0x11,
    DeviceFeatures = 0x12,
    DeviceOptions = 0x13,
    DeviceLaunchKernelInfo = 0x1F,

    CreateBufferInfo = 0x20,
    GetBufferPointerInfo = 0x21,

    CreateEventInfo = 0x30,
    QueryEventInfo = 0x31,

    JitCompileOptions = 0x100,
    JitCompileResult = 0x101,
    JitLookupInfo = 0x102,
    JitLinkInfo = 0x103,

    LogReportCallbackCreateInfo = 0x1000,

    DeviceFeaturesCuda = 0x10000,
    DeviceOptionsCuda = 0x10001,
}

impl StructureType {
    pub const fn as_u32(self) -> u32 {
        self as u32
    }
}

/// A value carrying a structure-type tag.
pub trait Structure {
    /// Tag a well-formed value of this type carries.
    const TYPE: StructureType;

    /// Tag this value actually carries.
    fn s_type(&self) -> StructureType;
}

/// Validate a structure argument.
///
/// `InvalidPointer` when it is absent, `InvalidValue` when its tag does not
/// match `S::TYPE`.
pub fn expect<S: Structure>(value: Option<&S>) -> Result<&S> {
    let value = value.ok_or_else(|| RuntimeError::invalid_pointer(format!("missing {:?}", S::TYPE)))?;
    if value.s_type() != S::TYPE {
        return Err(RuntimeError::invalid_value(format!(
            "expected structure {:?}, got {:?}",
            S::TYPE,
            value.s_type()
        )));
    }
    Ok(value)
}

/// Mutable variant of [`expect`] for output structures.
pub fn expect_mut<S: Structure>(value: Option<&mut S>) -> Result<&mut S> {
    let value = value.ok_or_else(|| RuntimeError::invalid_pointer(format!("missing {:?}", S::TYPE)))?;
    if value.s_type() != S::TYPE {
        return Err(RuntimeError::invalid_value(format!(
            "expected structure {:?}, got {:?}",
            S::TYPE,
            value.s_type()
        )));
    }
    Ok(value)
}

/// Backend-specific block attached to a base structure.
#[derive(Debug, Clone)]
pub enum Extension {
    CudaFeatures(CudaDeviceFeatures),
    CudaOptions(CudaDeviceOptions),
}

impl Extension {
    pub fn s_type(&self) -> StructureType {
        match self {
            Extension::CudaFeatures(ext) => ext.s_type(),
            Extension::CudaOptions(ext) => ext.s_type(),
        }
    }
}

/// Typed access to one [`Extension`] variant.
pub trait ExtensionPayload: Structure + Sized {
    fn from_extension(ext: &Extension) -> Option<&Self>;
    fn from_extension_mut(ext: &mut Extension) -> Option<&mut Self>;
    fn into_extension(self) -> Extension;
}

impl ExtensionPayload for CudaDeviceFeatures {
    fn from_extension(ext: &Extension) -> Option<&Self> {
        match ext {
            Extension::CudaFeatures(value) => Some(value),
            _ => None,
        }
    }

    fn from_extension_mut(ext: &mut Extension) -> Option<&mut Self> {
        match ext {
            Extension::CudaFeatures(value) => Some(value),
            _ => None,
        }
    }

    fn into_extension(self) -> Extension {
        Extension::CudaFeatures(self)
    }
}

impl ExtensionPayload for CudaDeviceOptions {
    fn from_extension(ext: &Extension) -> Option<&Self> {
        match ext {
            Extension::CudaOptions(value) => Some(value),
            _ => None,
        }
    }

    fn from_extension_mut(ext: &mut Extension) -> Option<&mut Self> {
        match ext {
            Extension::CudaOptions(value) => Some(value),
            _ => None,
        }
    }

    fn into_extension(self) -> Extension {
        Extension::CudaOptions(self)
    }
}

fn mistagged<T: ExtensionPayload>(ext: &Extension) -> RuntimeError {
    RuntimeError::invalid_value(format!(
        "extension tagged {:?} does not match expected {:?}",
        ext.s_type(),
        T::TYPE
    ))
}

/// Ordered list of extensions hanging off a base structure.
#[derive(Debug, Clone, Default)]
pub struct Chain(Vec<Extension>);

impl Chain {
    pub const fn new() -> Self {
        Self(Vec::new())
    }

    pub fn push(&mut self, ext: impl ExtensionPayload) {
        self.0.push(ext.into_extension());
    }

    /// Builder form of [`Chain::push`].
    pub fn with(mut self, ext: impl ExtensionPayload) -> Self {
        self.push(ext);
        self
    }

    /// First node tagged `s_type`. Skipped nodes are only inspected for
    /// their tag.
    pub fn find(&self, s_type: StructureType) -> Option<&Extension> {
        self.0.iter().find(|ext| ext.s_type() == s_type)
    }

    pub fn find_mut(&mut self, s_type: StructureType) -> Option<&mut Extension> {
        self.0.iter_mut().find(|ext| ext.s_type() == s_type)
    }

    /// First extension of kind `T`.
    ///
    /// `InvalidValue` when a node carries `T`'s tag but holds another kind,
    /// or holds a `T` under another tag.
    pub fn get<T: ExtensionPayload>(&self) -> Result<Option<&T>> {
        for ext in &self.0 {
            let tagged = ext.s_type() == T::TYPE;
            match (tagged, T::from_extension(ext)) {
                (true, Some(value)) => return Ok(Some(value)),
                (false, None) => continue,
                _ => return Err(mistagged::<T>(ext)),
            }
        }
        Ok(None)
    }

    pub fn get_mut<T: ExtensionPayload>(&mut self) -> Result<Option<&mut T>> {
        for ext in &mut self.0 {
            let tagged = ext.s_type() == T::TYPE;
            if !tagged && T::from_extension(ext).is_none() {
                continue;
            }
            if !tagged {
                return Err(mistagged::<T>(ext));
            }
            let s_type = ext.s_type();
            return T::from_extension_mut(ext).map(Some).ok_or_else(|| {
                RuntimeError::invalid_value(format!("extension tagged {s_type:?} is not a {:?}", T::TYPE))
            });
        }
        Ok(None)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Extension> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Declare a tagged structure: adds the `s_type` / `next` header, a
/// [`Structure`] impl and a `Default` that sets the correct tag.
macro_rules! structure {
    (
        $(#[$meta:meta])*
        pub struct $name:ident => $tag:ident {
            $(
                $(#[$fmeta:meta])*
                pub $field:ident : $ty:ty = $default:expr
            ),* $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone)]
        pub struct $name {
            pub s_type: $crate::chain::StructureType,
            pub next: $crate::chain::Chain,
            $(
                $(#[$fmeta])*
                pub $field: $ty,
            )*
        }

        impl Default for $name {
            fn default() -> Self {
                Self {
                    s_type: $crate::chain::StructureType::$tag,
                    next: $crate::chain::Chain::new(),
                    $($field: $default,)*
                }
            }
        }

        impl $crate::chain::Structure for $name {
            const TYPE: $crate::chain::StructureType = $crate::chain::StructureType::$tag;

            fn s_type(&self) -> $crate::chain::StructureType {
                self.s_type
            }
        }
    };
}

pub(crate) use structure;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CreateBufferInfo, DeviceFeatures, QueryEventInfo};

    #[test]
    fn test_expect_absent_is_invalid_pointer() {
        let err = expect::<CreateBufferInfo>(None).unwrap_err();
        assert!(matches!(err, RuntimeError::InvalidPointer(_)));
    }

    #[test]
    fn test_expect_wrong_tag_is_invalid_value() {
        let info = CreateBufferInfo {
            s_type: StructureType::QueryEventInfo,
            ..Default::default()
        };
        let err = expect(Some(&info)).unwrap_err();
        assert!(matches!(err, RuntimeError::InvalidValue(_)));
    }

    #[test]
    fn test_expect_accepts_default() {
        let mut query = QueryEventInfo::default();
        assert!(expect(Some(&query)).is_ok());
        assert!(expect_mut(Some(&mut query)).is_ok());
    }

    #[test]
    fn test_find_skips_other_extensions() {
        let mut features = DeviceFeatures::default();
        features.next.push(CudaDeviceOptions::default());
        features.next.push(CudaDeviceFeatures::default());

        assert_eq!(features.next.len(), 2);
        assert!(features.next.find(StructureType::DeviceFeaturesCuda).is_some());
        assert!(features.next.find(StructureType::JitLinkInfo).is_none());

        let cuda = features.next.get_mut::<CudaDeviceFeatures>().unwrap().unwrap();
        cuda.max_threads_per_block = 1024;
        assert_eq!(
            features.next.get::<CudaDeviceFeatures>().unwrap().unwrap().max_threads_per_block,
            1024
        );
    }

    #[test]
    fn test_empty_chain() {
        let chain = Chain::new();
        assert!(chain.is_empty());
        assert!(chain.get::<CudaDeviceOptions>().unwrap().is_none());
    }

    #[test]
    fn test_mistagged_extension_is_invalid_value() {
        let mut features = DeviceFeatures::default();
        features.next.push(CudaDeviceOptions {
            s_type: StructureType::DeviceFeaturesCuda,
            ..Default::default()
        });
        assert!(features.next.find(StructureType::DeviceFeaturesCuda).is_some());

        let err = features.next.get::<CudaDeviceFeatures>().unwrap_err();
        assert!(matches!(err, RuntimeError::InvalidValue(_)));
        let err = features.next.get_mut::<CudaDeviceFeatures>().unwrap_err();
        assert!(matches!(err, RuntimeError::InvalidValue(_)));
    }

    #[test]
    fn test_payload_under_wrong_tag_is_invalid_value() {
        let mut options = crate::types::DeviceOptions::default();
        options.next.push(CudaDeviceOptions {
            s_type: StructureType::JitLinkInfo,
            ..Default::default()
        });
        let err = options.next.get::<CudaDeviceOptions>().unwrap_err();
        assert!(matches!(err, RuntimeError::InvalidValue(_)));
        assert!(options.next.get::<CudaDeviceFeatures>().unwrap().is_none());
    }

    #[test]
    fn test_tag_values() {
        assert_eq!(StructureType::DeviceLaunchKernelInfo.as_u32(), 0x1F);
        assert_eq!(StructureType::LogReportCallbackCreateInfo.as_u32(), 0x1000);
        assert_eq!(StructureType::DeviceOptionsCuda.as_u32(), 0x10001);
    }
}
