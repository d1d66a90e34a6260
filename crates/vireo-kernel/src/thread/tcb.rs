//! The thread control block and the states a thread moves through.

use crate::types::{Pid, Tid};

/// Where a thread should start running. Kernel threads resume directly at
/// a Rust entry point via the trampoline; user threads resume via
/// interrupt-return into ring 3 at a userspace virtual address, so they
/// never go through the trampoline.
#[derive(Debug, Clone)]
pub enum Entry {
    Kernel { label: &'static str },
    User { entry_vaddr: u64, user_stack: u64 },
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ThreadState {
    Ready,
    Running,
    Blocked,
    Dead { exit_code: i32 },
}

/// 16 KiB, matching the source's fixed kernel-stack allocation per thread.
pub const KERNEL_STACK_SIZE: usize = 16 * 1024;

pub struct ThreadControlBlock {
    pub tid: Tid,
    pub owner: Pid,
    pub state: ThreadState,
    pub entry: Entry,
    /// Owned kernel stack; freed (by `Drop`) when the TCB is reaped.
    pub kernel_stack: Vec<u8>,
    pub is_idle: bool,
    pub ticks_run: u32,
}

impl ThreadControlBlock {
    pub fn new(tid: Tid, owner: Pid, entry: Entry) -> Self {
        Self {
            tid,
            owner,
            state: ThreadState::Ready,
            entry,
            kernel_stack: vec![0u8; KERNEL_STACK_SIZE],
            is_idle: false,
            ticks_run: 0,
        }
    }
}
