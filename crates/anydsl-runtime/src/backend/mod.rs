//! Backend traits and copy routing

mod copy;
mod traits;

pub use copy::{copy_between, validate_regions, CopyRoute, DeviceId};
pub use traits::{Buffer, Device, Event, EventStatus, Platform};
