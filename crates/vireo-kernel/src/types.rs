//! Identifiers shared across the kernel object, process, and thread subsystems.

use std::num::NonZeroU64;

/// Process identifier. PID 0 is reserved for the kernel process; all other
/// PIDs are assigned monotonically starting from 1.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct Pid(u64);

impl Pid {
    pub const KERNEL: Pid = Pid(0);

    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn val(&self) -> u64 {
        self.0
    }
}

/// Thread identifier, monotonically assigned from 1.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct Tid(NonZeroU64);

impl Tid {
    pub fn new(id: u64) -> Option<Self> {
        NonZeroU64::new(id).map(Self)
    }

    pub fn val(&self) -> u64 {
        self.0.get()
    }
}

/// Per-process integer naming a capability. `HANDLE_NONE` is the sentinel for
/// "no handle"; index 0 is a legitimate handle.
pub type Handle = i64;

pub const HANDLE_NONE: Handle = -1;

/// Discriminant for the concrete kind of a kernel [`crate::object::Object`].
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum ObjectType {
    Thread,
    Process,
    Vmo,
    ChannelEndpoint,
    Device,
    File,
    Directory,
}
