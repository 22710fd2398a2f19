//! Generational handle tables
//!
//! Every runtime object crossing the API boundary is referenced by an opaque
//! 64-bit handle. A handle packs three fields:
//!
//! ```text
//!  63        56 55                 32 31                    0
//! ┌────────────┬─────────────────────┬───────────────────────┐
//! │    kind    │     generation      │      slot index + 1   │
//! └────────────┴─────────────────────┴───────────────────────┘
//! ```
//!
//! The raw value 0 is the null handle. A handle of the wrong kind, one whose
//! generation no longer matches its slot, or one pointing past the arena is
//! rejected with [`RuntimeError::InvalidHandle`] instead of being
//! reinterpreted.

use std::fmt;

use crate::error::{Result, RuntimeError};

const INDEX_BITS: u32 = 32;
const GENERATION_BITS: u32 = 24;
const GENERATION_MASK: u32 = (1 << GENERATION_BITS) - 1;
const KIND_SHIFT: u32 = INDEX_BITS + GENERATION_BITS;

/// Object family a handle belongs to.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandleKind {
    Device = 1,
    Buffer = 2,
    Event = 3,
    Module = 4,
}

impl HandleKind {
    fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            1 => Some(Self::Device),
            2 => Some(Self::Buffer),
            3 => Some(Self::Event),
            4 => Some(Self::Module),
            _ => None,
        }
    }

    fn prefix(self) -> &'static str {
        match self {
            Self::Device => "dev",
            Self::Buffer => "buf",
            Self::Event => "evt",
            Self::Module => "mod",
        }
    }
}

/// Untyped packed handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Handle(u64);

impl Handle {
    pub const NULL: Handle = Handle(0);

    const fn pack(kind: HandleKind, generation: u32, index: u32) -> Self {
        let generation = (generation & GENERATION_MASK) as u64;
        Self(((kind as u64) << KIND_SHIFT) | (generation << INDEX_BITS) | (index as u64 + 1))
    }

    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }

    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    pub fn kind(self) -> Option<HandleKind> {
        HandleKind::from_bits((self.0 >> KIND_SHIFT) as u8)
    }

    fn generation(self) -> u32 {
        ((self.0 >> INDEX_BITS) as u32) & GENERATION_MASK
    }

    fn index(self) -> Option<usize> {
        (self.0 as u32).checked_sub(1).map(|index| index as usize)
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind() {
            Some(kind) => write!(f, "{}{}.{}", kind.prefix(), self.0 as u32, self.generation()),
            None if self.is_null() => write!(f, "null"),
            None => write!(f, "{:#x}", self.0),
        }
    }
}

/// Typed wrapper around [`Handle`].
pub trait TypedHandle: Copy + fmt::Display {
    const KIND: HandleKind;

    fn from_handle(handle: Handle) -> Self;
    fn handle(self) -> Handle;
}

macro_rules! typed_handle {
    ($(#[$meta:meta])* $name:ident => $kind:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
        pub struct $name(Handle);

        impl $name {
            pub const NULL: $name = $name(Handle::NULL);

            pub const fn from_raw(raw: u64) -> Self {
                Self(Handle::from_raw(raw))
            }

            pub const fn raw(self) -> u64 {
                self.0.raw()
            }

            pub const fn is_null(self) -> bool {
                self.0.is_null()
            }
        }

        impl TypedHandle for $name {
            const KIND: HandleKind = HandleKind::$kind;

            fn from_handle(handle: Handle) -> Self {
                Self(handle)
            }

            fn handle(self) -> Handle {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.0, f)
            }
        }
    };
}

typed_handle!(
    /// Device handle. The null handle denotes the host device.
    DeviceHandle => Device
);
typed_handle!(
    /// Buffer handle
    BufferHandle => Buffer
);
typed_handle!(
    /// Event handle
    EventHandle => Event
);
typed_handle!(
    /// JIT module handle
    ModuleHandle => Module
);

struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

/// Arena of slots addressed by generational handles of one kind.
pub struct HandleTable<H: TypedHandle, T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    live: usize,
    _marker: std::marker::PhantomData<H>,
}

impl<H: TypedHandle, T> Default for HandleTable<H, T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H: TypedHandle, T> HandleTable<H, T> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            live: 0,
            _marker: std::marker::PhantomData,
        }
    }

    /// Store `value` and return a fresh handle for it.
    pub fn insert(&mut self, value: T) -> H {
        let index = match self.free.pop() {
            Some(index) => {
                self.slots[index as usize].value = Some(value);
                index
            }
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    value: Some(value),
                });
                (self.slots.len() - 1) as u32
            }
        };
        self.live += 1;

        let generation = self.slots[index as usize].generation;
        H::from_handle(Handle::pack(H::KIND, generation, index))
    }

    fn locate(&self, handle: H) -> Result<usize> {
        let raw = handle.handle();
        let invalid = || RuntimeError::InvalidHandle(raw.raw());

        if raw.kind() != Some(H::KIND) {
            return Err(invalid());
        }
        let index = raw.index().ok_or_else(invalid)?;
        let slot = self.slots.get(index).ok_or_else(invalid)?;
        if slot.generation != raw.generation() || slot.value.is_none() {
            return Err(invalid());
        }
        Ok(index)
    }

    pub fn get(&self, handle: H) -> Result<&T> {
        let index = self.locate(handle)?;
        self.slots[index]
            .value
            .as_ref()
            .ok_or(RuntimeError::InvalidHandle(handle.handle().raw()))
    }

    pub fn get_mut(&mut self, handle: H) -> Result<&mut T> {
        let index = self.locate(handle)?;
        self.slots[index]
            .value
            .as_mut()
            .ok_or(RuntimeError::InvalidHandle(handle.handle().raw()))
    }

    pub fn contains(&self, handle: H) -> bool {
        self.locate(handle).is_ok()
    }

    /// Take the value out and retire the handle. The slot's generation is
    /// bumped so the old handle can never resolve again.
    pub fn remove(&mut self, handle: H) -> Result<T> {
        let index = self.locate(handle)?;
        let slot = &mut self.slots[index];
        let value = slot
            .value
            .take()
            .ok_or(RuntimeError::InvalidHandle(handle.handle().raw()))?;
        slot.generation = (slot.generation + 1) & GENERATION_MASK;
        self.free.push(index as u32);
        self.live -= 1;
        Ok(value)
    }

    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Live entries in slot order.
    pub fn iter(&self) -> impl Iterator<Item = (H, &T)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.value
                .as_ref()
                .map(|value| (H::from_handle(Handle::pack(H::KIND, slot.generation, index as u32)), value))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_insert_and_get() {
        let mut table: HandleTable<BufferHandle, &str> = HandleTable::new();
        let a = table.insert("a");
        let b = table.insert("b");

        assert_ne!(a, b);
        assert!(!a.is_null());
        assert_eq!(*table.get(a).unwrap(), "a");
        assert_eq!(*table.get(b).unwrap(), "b");
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_stale_handle_rejected() {
        let mut table: HandleTable<EventHandle, u32> = HandleTable::new();
        let first = table.insert(1);
        assert_eq!(table.remove(first).unwrap(), 1);

        let second = table.insert(2);
        assert_ne!(first, second, "slot reuse must change the handle");
        assert!(matches!(table.get(first), Err(RuntimeError::InvalidHandle(_))));
        assert!(matches!(table.remove(first), Err(RuntimeError::InvalidHandle(_))));
        assert_eq!(*table.get(second).unwrap(), 2);
    }

    #[test]
    fn test_wrong_kind_rejected() {
        let mut buffers: HandleTable<BufferHandle, u8> = HandleTable::new();
        let events: HandleTable<EventHandle, u8> = HandleTable::new();
        let buffer = buffers.insert(0);

        let as_event = EventHandle::from_raw(buffer.raw());
        assert!(events.get(as_event).is_err());

        let mut other_events: HandleTable<EventHandle, u8> = HandleTable::new();
        other_events.insert(9);
        assert!(other_events.get(as_event).is_err());
    }

    #[test]
    fn test_null_and_garbage_rejected() {
        let table: HandleTable<DeviceHandle, ()> = HandleTable::new();
        assert!(table.get(DeviceHandle::NULL).is_err());
        assert!(table.get(DeviceHandle::from_raw(u64::MAX)).is_err());
    }

    #[test]
    fn test_display() {
        let mut table: HandleTable<ModuleHandle, ()> = HandleTable::new();
        let handle = table.insert(());
        assert_eq!(handle.to_string(), "mod1.0");
        assert_eq!(ModuleHandle::NULL.to_string(), "null");
    }

    proptest! {
        #[test]
        fn prop_live_handles_always_resolve(ops in proptest::collection::vec(any::<bool>(), 1..64)) {
            let mut table: HandleTable<BufferHandle, usize> = HandleTable::new();
            let mut live = Vec::new();
            let mut dead = Vec::new();

            for (step, insert) in ops.into_iter().enumerate() {
                if insert || live.is_empty() {
                    live.push((table.insert(step), step));
                } else {
                    let (handle, _) = live.remove(step % live.len());
                    table.remove(handle).unwrap();
                    dead.push(handle);
                }
            }

            prop_assert_eq!(table.len(), live.len());
            for (handle, value) in &live {
                prop_assert_eq!(*table.get(*handle).unwrap(), *value);
            }
            for handle in &dead {
                prop_assert!(table.get(*handle).is_err());
            }
        }
    }
}
