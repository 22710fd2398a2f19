//! Cross-device copy routing

use std::fmt;
use std::time::Instant;

use anydsl_tracing::performance::record_transfer;

use super::traits::Buffer;
use crate::error::{Result, RuntimeError};
use crate::types::{BufferCopy, DeviceType};

/// Position of a device in the runtime: backend family plus index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceId {
    pub device_type: DeviceType,
    pub index: u32,
}

impl DeviceId {
    /// The host device
    pub const HOST: DeviceId = DeviceId::new(DeviceType::Host, 0);

    pub const fn new(device_type: DeviceType, index: u32) -> Self {
        Self { device_type, index }
    }

    pub fn is_host(self) -> bool {
        self.device_type == DeviceType::Host
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.device_type, self.index)
    }
}

/// Path a buffer copy takes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CopyRoute {
    /// Source and destination live on the same device
    IntraDevice,
    /// Destination is host memory
    DeviceToHost,
    /// Different devices of the same backend family
    PeerToPeer,
}

impl CopyRoute {
    /// Choose the route for a copy from `src` to `dst`.
    ///
    /// Rules apply in order: same device, host destination, same family.
    /// Anything else is `NotSupported`.
    pub fn select(src: DeviceId, dst: DeviceId) -> Result<Self> {
        if src == dst {
            Ok(CopyRoute::IntraDevice)
        } else if dst.is_host() {
            Ok(CopyRoute::DeviceToHost)
        } else if src.device_type == dst.device_type {
            Ok(CopyRoute::PeerToPeer)
        } else {
            Err(RuntimeError::not_supported(format!("buffer copy from {src} to {dst}")))
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            CopyRoute::IntraDevice => "intra_device",
            CopyRoute::DeviceToHost => "device_to_host",
            CopyRoute::PeerToPeer => "peer_to_peer",
        }
    }
}

impl fmt::Display for CopyRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Check every region against both buffer sizes.
pub fn validate_regions(src_size: usize, dst_size: usize, regions: &[BufferCopy]) -> Result<()> {
    for region in regions {
        RuntimeError::check_bounds(region.offset_src, region.size, src_size)?;
        RuntimeError::check_bounds(region.offset_dst, region.size, dst_size)?;
    }
    Ok(())
}

/// Route, validate and issue a copy from the source buffer.
///
/// Nothing is written when routing or validation fails.
pub fn copy_between(
    src: &dyn Buffer,
    src_device: DeviceId,
    dst: &dyn Buffer,
    dst_device: DeviceId,
    regions: &[BufferCopy],
) -> Result<()> {
    let route = CopyRoute::select(src_device, dst_device)?;
    validate_regions(src.size(), dst.size(), regions)?;

    let start = Instant::now();
    src.copy_to(dst, route, regions)?;

    let bytes = regions.iter().map(|region| region.size).sum();
    record_transfer(bytes, route.name(), start.elapsed().as_micros() as u64);
    Ok(())
}
