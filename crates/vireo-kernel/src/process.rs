//! Processes: a handle table, a pagemap, and a thread list bound together
//! under one PID.

use crate::error::{KernelError, KernelResult};
use crate::handle::HandleTable;
use crate::mmu::Pagemap;
use crate::object::Object;
use crate::types::{Pid, Tid};
use crate::vmo::Vma;
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ProcessState {
    Ready,
    Running,
    Blocked,
    Dead,
}

/// Default first virtual address handed out by `vmo_map` when the caller
/// doesn't supply a hint, chosen well clear of a typical ELF's low segments.
const USER_VAS_BASE: u64 = 0x2000_0000;

pub struct Process {
    pub pid: Pid,
    pub name: String,
    pub state: ProcessState,
    pub handles: HandleTable,
    /// `None` for the kernel process; every user process owns one.
    pub pagemap: Option<Pagemap>,
    pub threads: Vec<Tid>,
    next_vaddr: u64,
    /// Live VMO mappings in this address space, so `vmo_unmap` can find
    /// which VMO backs a given range without searching every handle.
    pub vmo_mappings: Vec<(Vma, Arc<Object>)>,
}

impl Process {
    fn new(pid: Pid, name: impl Into<String>, pagemap: Option<Pagemap>) -> Self {
        Self {
            pid,
            name: name.into(),
            state: ProcessState::Ready,
            handles: HandleTable::new(),
            pagemap,
            threads: Vec::new(),
            next_vaddr: USER_VAS_BASE,
            vmo_mappings: Vec::new(),
        }
    }

    /// Bump-allocate the next unused VA range for a mapping of `pages`
    /// pages, when the caller didn't supply an explicit hint.
    pub fn alloc_vaddr(&mut self, pages: u64) -> u64 {
        let addr = self.next_vaddr;
        self.next_vaddr += pages * crate::pmm::PAGE_SIZE;
        addr
    }

    /// Remove and return the `(Vma, vmo)` pair covering `[vaddr, vaddr+len)`.
    pub fn take_vmo_mapping(&mut self, vaddr: u64, len: u64) -> Option<(Vma, Arc<Object>)> {
        let idx = self
            .vmo_mappings
            .iter()
            .position(|(vma, _)| vma.vaddr == vaddr && vma.len == len)?;
        Some(self.vmo_mappings.remove(idx))
    }
}

/// Owns every live process, including the kernel process (PID 0, created
/// at boot and never destroyed).
pub struct ProcessTable {
    processes: BTreeMap<Pid, Process>,
    next_pid: u64,
}

impl ProcessTable {
    /// `proc_init`: create the kernel process.
    pub fn new() -> Self {
        let mut processes = BTreeMap::new();
        let mut kernel = Process::new(Pid::KERNEL, "kernel", None);
        kernel.state = ProcessState::Running;
        processes.insert(Pid::KERNEL, kernel);
        Self { processes, next_pid: 1 }
    }

    pub fn get(&self, pid: Pid) -> KernelResult<&Process> {
        self.processes.get(&pid).ok_or(KernelError::NotFound)
    }

    pub fn get_mut(&mut self, pid: Pid) -> KernelResult<&mut Process> {
        self.processes.get_mut(&pid).ok_or(KernelError::NotFound)
    }

    /// `process_create(name, pagemap)`.
    pub fn create(&mut self, name: impl Into<String>, pagemap: Pagemap) -> Pid {
        let pid = Pid::new(self.next_pid);
        self.next_pid += 1;
        self.processes.insert(pid, Process::new(pid, name, Some(pagemap)));
        pid
    }

    /// `process_destroy`: the caller (the kernel's `Kernel` struct) must
    /// terminate all of the process's threads and destroy its pagemap
    /// before calling this, since both require access to subsystems
    /// (`ThreadManager`, `Mmu`) the process table doesn't own.
    pub fn destroy(&mut self, pid: Pid) -> KernelResult<Process> {
        if pid == Pid::KERNEL {
            return Err(KernelError::PermissionDenied);
        }
        self.processes.remove(&pid).ok_or(KernelError::NotFound)
    }
}

impl Default for ProcessTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mmu::Pagemap;
    use crate::pmm::PhysAddr;

    fn dummy_pagemap() -> Pagemap {
        Pagemap { top_level: PhysAddr(0x1000) }
    }

    #[test]
    fn kernel_process_exists_at_pid_zero() {
        let table = ProcessTable::new();
        assert!(table.get(Pid::KERNEL).is_ok());
    }

    #[test]
    fn pids_assigned_monotonically_from_one() {
        let mut table = ProcessTable::new();
        let p1 = table.create("a", dummy_pagemap());
        let p2 = table.create("b", dummy_pagemap());
        assert_eq!(p1.val(), 1);
        assert_eq!(p2.val(), 2);
    }

    #[test]
    fn kernel_process_cannot_be_destroyed() {
        let mut table = ProcessTable::new();
        assert!(table.destroy(Pid::KERNEL).is_err());
    }

    #[test]
    fn vaddr_allocator_advances_by_page_count() {
        let mut proc = Process::new(Pid::new(5), "p", Some(dummy_pagemap()));
        let a = proc.alloc_vaddr(2);
        let b = proc.alloc_vaddr(1);
        assert_eq!(b, a + 2 * crate::pmm::PAGE_SIZE);
    }
}
