pub mod channel;
pub mod error;
pub mod handle;
pub mod mmu;
pub mod namespace;
pub mod object;
pub mod pmm;
pub mod process;
pub mod rights;
pub mod syscall;
pub mod thread;
pub mod types;
pub mod vmo;

use crate::channel::ChannelEndpointObject;
use crate::error::{KernelError, KernelResult};
use crate::mmu::{MapFlags, Mmu, Pagemap};
use crate::namespace::Namespace;
use crate::object::{Object, ObjectKind};
use crate::pmm::{PhysicalMemory, Pmm, VirtAddr, PAGE_SIZE};
use crate::process::ProcessTable;
use crate::rights::Rights;
use crate::syscall::{Fd, Syscall, SyscallReturn, Whence};
use crate::thread::tcb::Entry as ThreadEntry;
use crate::thread::wait::WaitQueue;
use crate::thread::ThreadManager;
use crate::types::{Handle, Pid, Tid};
use crate::vmo::{rights_to_map_flags, Vma, VmoFlags, VmoObject};
use goblin::elf::program_header::{PF_W, PF_X, PT_LOAD};
use goblin::elf::Elf;
use log::{debug, info, warn};
use std::sync::{Arc, Mutex};

/// 64 KiB, fixed, identical for every user thread in this design.
const USER_STACK_PAGES: u64 = 16;
const USER_STACK_TOP: u64 = 0x0000_7fff_ffff_f000;

/// Everything one instance of this kernel owns: the physical frame pool and
/// its byte-addressable backing store, the MMU and the kernel's own
/// pagemap, every process and thread, and the `/`-rooted object namespace.
/// A `Kernel` is the single point every syscall is dispatched through.
pub struct Kernel {
    mem: PhysicalMemory,
    pmm: Pmm,
    mmu: Mmu,
    kernel_pagemap: Pagemap,
    pub processes: ProcessTable,
    pub threads: ThreadManager,
    pub namespace: Namespace,
}

impl Kernel {
    /// `proc_init` / `sched_init` / boot-time setup: carve out `ram_bytes` of
    /// physical memory, build the kernel pagemap, and bring up the process
    /// table (kernel process at PID 0) and scheduler (idle thread at TID 1).
    pub fn new(ram_bytes: u64) -> KernelResult<Self> {
        let mut mem = PhysicalMemory::new(ram_bytes);
        let mut pmm = Pmm::new(0, ram_bytes);
        let mmu = Mmu::new();
        let kernel_pagemap = mmu.kernel_pagemap_create(&mut mem, &mut pmm)?;
        info!("kernel pagemap created at {:?}", kernel_pagemap.top_level);

        Ok(Self {
            mem,
            pmm,
            mmu,
            kernel_pagemap,
            processes: ProcessTable::new(),
            threads: ThreadManager::new(Pid::KERNEL),
            namespace: Namespace::new(),
        })
    }

    // ---------------------------------------------------------------
    // Process and thread lifecycle
    // ---------------------------------------------------------------

    /// `process_create` + `thread_create` + ELF load: parse `elf_data`, map
    /// every `PT_LOAD` segment into a fresh pagemap, carve out a user stack,
    /// and create the process's first thread at the ELF entry point.
    pub fn spawn(&mut self, elf_data: &[u8], name: &str) -> KernelResult<Pid> {
        let elf = Elf::parse(elf_data).map_err(|e| {
            warn!("spawn {name}: invalid ELF: {e}");
            KernelError::InvalidArgument
        })?;

        let pagemap = self.mmu.pagemap_create(&mut self.mem, &mut self.pmm, self.kernel_pagemap)?;
        let pid = self.processes.create(name, pagemap);

        for ph in elf.program_headers.iter().filter(|ph| ph.p_type == PT_LOAD) {
            let vaddr_start = ph.p_vaddr;
            let mem_len = ph.p_memsz;
            let file_len = ph.p_filesz as usize;
            let file_off = ph.p_offset as usize;
            let segment_flags = ph.p_flags;

            let result = (|| -> KernelResult<()> {
                if mem_len == 0 {
                    return Ok(());
                }
                let page_base = vaddr_start & !(PAGE_SIZE - 1);
                let span = (vaddr_start - page_base) + mem_len;
                let pages = span.div_ceil(PAGE_SIZE);

                let frames = self.pmm.alloc(pages)?;
                self.mem.zero(frames, pages * PAGE_SIZE)?;
                if file_len > 0 {
                    let dst = frames.offset(vaddr_start - page_base);
                    self.mem.write_bytes(dst, &elf_data[file_off..file_off + file_len])?;
                }

                let mut flags = MapFlags::USER;
                if segment_flags & PF_W != 0 {
                    flags |= MapFlags::WRITE;
                }
                if segment_flags & PF_X != 0 {
                    flags |= MapFlags::EXEC;
                }
                self.mmu.map_range(&mut self.mem, &mut self.pmm, pagemap, VirtAddr(page_base), frames, pages, flags)
            })();

            if let Err(e) = result {
                let _ = self.mmu.pagemap_destroy(&mut self.mem, &mut self.pmm, pagemap);
                self.processes.destroy(pid).ok();
                return Err(e);
            }
        }

        let stack_frames = self.pmm.alloc(USER_STACK_PAGES)?;
        self.mem.zero(stack_frames, USER_STACK_PAGES * PAGE_SIZE)?;
        let stack_base = VirtAddr(USER_STACK_TOP - USER_STACK_PAGES * PAGE_SIZE);
        self.mmu.map_range(
            &mut self.mem,
            &mut self.pmm,
            pagemap,
            stack_base,
            stack_frames,
            USER_STACK_PAGES,
            MapFlags::WRITE | MapFlags::USER,
        )?;

        let entry = ThreadEntry::User { entry_vaddr: elf.entry, user_stack: USER_STACK_TOP };
        let tid = self.threads.create_thread(pid, entry);
        let process = self.processes.get_mut(pid)?;
        process.threads.push(tid);

        info!("spawned {name} as pid {} (entry {:#x})", pid.val(), elf.entry);
        Ok(pid)
    }

    /// `process_exit`: tear down every thread owned by `pid`, free its
    /// pagemap (never the VMO leaf frames mapped through it), and record the
    /// exit code for a later `wait`.
    fn finalize_process(&mut self, pid: Pid, exit_code: i32) -> KernelResult<()> {
        self.threads.terminate_owned_by(pid);
        let mut process = self.processes.destroy(pid)?;
        if let Some(pagemap) = process.pagemap.take() {
            self.mmu.pagemap_destroy(&mut self.mem, &mut self.pmm, pagemap)?;
        }
        debug!("process {} exited with code {exit_code}", pid.val());
        Ok(())
    }

    fn threads_alive(&self, pid: Pid) -> KernelResult<bool> {
        let process = self.processes.get(pid)?;
        Ok(process
            .threads
            .iter()
            .any(|tid| !matches!(self.threads.get(*tid).map(|t| &t.state), Some(crate::thread::tcb::ThreadState::Dead { .. }) | None)))
    }

    // ---------------------------------------------------------------
    // Syscall dispatch
    // ---------------------------------------------------------------

    /// Dispatch one syscall on behalf of `caller`. Mirrors the `ecall`
    /// handler in the source, minus the register decode: a caller here
    /// already has a parsed [`Syscall`].
    pub fn handle_syscall(&mut self, caller: Pid, call: Syscall) -> KernelResult<SyscallReturn> {
        match call {
            Syscall::Exit { code } => self.sys_exit(caller, code).map(|_| SyscallReturn::Status(0)),
            Syscall::GetPid => Ok(SyscallReturn::Pid(caller.val())),
            Syscall::Yield => {
                self.threads.yield_current();
                Ok(SyscallReturn::Status(0))
            }
            Syscall::Spawn { path, argv } => {
                self.sys_spawn(caller, &path, &argv).map(|pid| SyscallReturn::Pid(pid.val()))
            }
            Syscall::Wait { pid } => self.sys_wait(Pid::new(pid)).map(|code| SyscallReturn::Status(code as i64)),

            Syscall::GetObj { parent, path, rights } => {
                self.sys_get_obj(caller, parent, &path, rights).map(SyscallReturn::Handle)
            }

            Syscall::HandleRead { handle, len } => self.sys_handle_read(caller, handle, len).map(SyscallReturn::Data),
            Syscall::HandleWrite { handle, data } => self.sys_handle_write(caller, handle, &data).map(SyscallReturn::Count),
            Syscall::HandleSeek { handle, offset, whence } => {
                self.sys_handle_seek(caller, handle, offset, whence).map(SyscallReturn::Offset)
            }
            Syscall::HandleClose { handle } => self.sys_handle_close(caller, handle).map(|_| SyscallReturn::Status(0)),
            Syscall::HandleDuplicate { handle, rights } => {
                self.sys_handle_duplicate(caller, handle, rights).map(SyscallReturn::Handle)
            }

            Syscall::ChannelCreate { rights } => {
                let (a, b) = self.sys_channel_create(caller, rights)?;
                Ok(SyscallReturn::Handles(a, b))
            }
            Syscall::ChannelSend { handle, data, handles } => {
                self.sys_channel_send(caller, handle, data, handles).map(|_| SyscallReturn::Status(0))
            }
            Syscall::ChannelRecv { handle, max_len } => {
                let (data, handles) = self.sys_channel_recv(caller, handle, max_len)?;
                Ok(SyscallReturn::Message { data, handles })
            }

            Syscall::VmoCreate { size, flags, rights } => {
                self.sys_vmo_create(caller, size, flags, rights).map(SyscallReturn::Handle)
            }
            Syscall::VmoMap { handle, vaddr_hint, offset, len, rights } => {
                self.sys_vmo_map(caller, handle, vaddr_hint, offset, len, rights).map(SyscallReturn::Addr)
            }
            Syscall::VmoUnmap { vaddr, len } => self.sys_vmo_unmap(caller, vaddr, len).map(|_| SyscallReturn::Status(0)),
            Syscall::VmoResize { handle, size } => self.sys_vmo_resize(caller, handle, size).map(|_| SyscallReturn::Status(0)),
        }
    }

    fn sys_exit(&mut self, caller: Pid, code: i32) -> KernelResult<()> {
        self.threads.exit_current(code);
        self.threads.schedule();
        if !self.threads_alive(caller)? {
            self.finalize_process(caller, code)?;
        }
        Ok(())
    }

    fn sys_spawn(&mut self, caller: Pid, path: &str, _argv: &[String]) -> KernelResult<Pid> {
        let (object, rights) = self.namespace.lookup(path, Rights::READ)?;
        if !rights.contains(Rights::READ) {
            return Err(KernelError::PermissionDenied);
        }
        let size = {
            let mut buf = Vec::new();
            let mut chunk = [0u8; 4096];
            loop {
                let n = object.read(buf.len() as u64, &mut chunk)?;
                if n == 0 {
                    break;
                }
                buf.extend_from_slice(&chunk[..n]);
            }
            buf
        };
        let _ = caller;
        self.spawn(&size, path)
    }

    fn sys_wait(&mut self, target: Pid) -> KernelResult<i32> {
        // This simulation reaps a process's threads (and its exit code with
        // them) the moment its last thread exits, so a caller can only
        // observe the exit code of a process that is still mid-exit. A full
        // implementation would keep a zombie entry around until `wait`
        // collects it; tracked as a known simplification.
        for tid in self.processes.get(target)?.threads.clone() {
            if let Some(code) = self.threads.exit_code_of(tid) {
                return Ok(code);
            }
        }
        Err(KernelError::WouldBlock)
    }

    fn sys_get_obj(&mut self, caller: Pid, _parent: Fd, path: &str, rights: u32) -> KernelResult<Handle> {
        let requested = Rights::from_bits_truncate(rights);
        let (object, granted) = self.namespace.lookup(path, requested)?;
        let process = self.processes.get_mut(caller)?;
        Ok(process.handles.grant(object, granted))
    }

    fn sys_handle_read(&mut self, caller: Pid, handle: Handle, len: usize) -> KernelResult<Vec<u8>> {
        let process = self.processes.get_mut(caller)?;
        let entry = process.handles.get_mut(handle)?;
        if !entry.rights.contains(Rights::READ) {
            return Err(KernelError::PermissionDenied);
        }
        let object = entry.object.as_ref().ok_or(KernelError::BadHandle)?;
        let mut buf = vec![0u8; len];
        let n = object.read(entry.offset, &mut buf)?;
        entry.offset += n as u64;
        buf.truncate(n);
        Ok(buf)
    }

    fn sys_handle_write(&mut self, caller: Pid, handle: Handle, data: &[u8]) -> KernelResult<usize> {
        let process = self.processes.get_mut(caller)?;
        let entry = process.handles.get_mut(handle)?;
        if !entry.rights.contains(Rights::WRITE) {
            return Err(KernelError::PermissionDenied);
        }
        let object = entry.object.as_ref().ok_or(KernelError::BadHandle)?;
        let n = object.write(entry.offset, data)?;
        entry.offset += n as u64;
        Ok(n)
    }

    fn sys_handle_seek(&mut self, caller: Pid, handle: Handle, offset: i64, whence: Whence) -> KernelResult<u64> {
        let process = self.processes.get_mut(caller)?;
        let entry = process.handles.get_mut(handle)?;
        let object = entry.object.as_ref().ok_or(KernelError::BadHandle)?;
        let base = match whence {
            Whence::Start => 0,
            Whence::Current => entry.offset as i64,
            Whence::End => object.as_vmo().map(|v| v.lock().unwrap().size()).unwrap_or(0) as i64,
        };
        let new_offset = base.checked_add(offset).ok_or(KernelError::InvalidArgument)?;
        if new_offset < 0 {
            return Err(KernelError::InvalidArgument);
        }
        entry.offset = new_offset as u64;
        Ok(entry.offset)
    }

    fn sys_handle_close(&mut self, caller: Pid, handle: Handle) -> KernelResult<()> {
        self.processes.get_mut(caller)?.handles.close(handle)
    }

    fn sys_handle_duplicate(&mut self, caller: Pid, handle: Handle, rights: u32) -> KernelResult<Handle> {
        self.processes.get_mut(caller)?.handles.duplicate(handle, Rights::from_bits_truncate(rights))
    }

    // -------- channels --------

    fn sys_channel_create(&mut self, caller: Pid, rights: u32) -> KernelResult<(Handle, Handle)> {
        let rights = Rights::from_bits_truncate(rights);
        let (ep0, ep1) = ChannelEndpointObject::create_pair();
        let obj0 = Arc::new(Object::new(ObjectKind::ChannelEndpoint(ep0)));
        let obj1 = Arc::new(Object::new(ObjectKind::ChannelEndpoint(ep1)));
        let process = self.processes.get_mut(caller)?;
        let h0 = process.handles.grant(obj0, rights);
        let h1 = process.handles.grant(obj1, rights);
        Ok((h0, h1))
    }

    /// `channel_send`: validate fully against the sender's table and the
    /// peer's queue state, clone references for every transferred handle,
    /// enqueue, and only *then* remove the handles from the sender's table.
    /// A validation failure never touches the sender's table.
    fn sys_channel_send(&mut self, caller: Pid, handle: Handle, data: Vec<u8>, transfer: Vec<Handle>) -> KernelResult<()> {
        let endpoint_obj = {
            let process = self.processes.get(caller)?;
            process.handles.get(handle)?.object.clone().ok_or(KernelError::BadHandle)?
        };
        let endpoint = endpoint_obj.as_channel_endpoint()?;

        if endpoint.peer_closed() {
            return Err(KernelError::PeerClosed);
        }
        if data.len() > channel::MAX_MSG_SIZE {
            return Err(KernelError::MessageTooLarge);
        }
        if transfer.len() > channel::MAX_MSG_HANDLES {
            return Err(KernelError::TooManyHandles);
        }
        if endpoint.peer_queue_len() >= channel::MAX_QUEUE {
            return Err(KernelError::QueueFull);
        }

        let process = self.processes.get_mut(caller)?;
        let mut moved = Vec::with_capacity(transfer.len());
        for h in &transfer {
            let entry = process.handles.get(*h)?;
            if !entry.rights.contains(Rights::TRANSFER) {
                return Err(KernelError::PermissionDenied);
            }
            let object = entry.object.clone().expect("validated non-free above");
            moved.push((object, entry.rights));
        }

        endpoint.send(if data.is_empty() { None } else { Some(data) }, moved, &mut self.threads)?;

        for h in transfer {
            let _ = process.handles.take(h);
        }
        Ok(())
    }

    /// `channel_recv`: non-blocking dequeue. Returns `WouldBlock` (the
    /// caller's cue to retry, optionally after parking itself) when the
    /// queue is empty and the peer is still open.
    fn sys_channel_recv(&mut self, caller: Pid, handle: Handle, max_len: usize) -> KernelResult<(Vec<u8>, Vec<Handle>)> {
        let endpoint_obj = {
            let process = self.processes.get(caller)?;
            process.handles.get(handle)?.object.clone().ok_or(KernelError::BadHandle)?
        };
        let endpoint = endpoint_obj.as_channel_endpoint()?;
        let entry = endpoint.try_recv()?;

        let process = self.processes.get_mut(caller)?;
        let granted = entry.handles.into_iter().map(|(object, rights)| process.handles.grant(object, rights)).collect();
        let mut data = entry.data.unwrap_or_default();
        data.truncate(max_len);
        Ok((data, granted))
    }

    /// Block the calling thread in a receive on `handle`, returning the
    /// sleeping thread's TID. The caller is expected to have already
    /// observed `WouldBlock` from a non-blocking `channel_recv`.
    pub fn channel_recv_block(&mut self, caller: Pid, handle: Handle) -> KernelResult<Tid> {
        let endpoint_obj = {
            let process = self.processes.get(caller)?;
            process.handles.get(handle)?.object.clone().ok_or(KernelError::BadHandle)?
        };
        let tid = endpoint_obj.as_channel_endpoint()?.block_current_recv(&mut self.threads)?;
        self.threads.schedule();
        Ok(tid)
    }

    // -------- VMOs --------

    fn sys_vmo_create(&mut self, caller: Pid, size: u64, flags: u32, rights: u32) -> KernelResult<Handle> {
        let vmo = VmoObject::new(size, VmoFlags::from_bits_truncate(flags));
        let object = Arc::new(Object::new(ObjectKind::Vmo(Mutex::new(vmo))));
        let process = self.processes.get_mut(caller)?;
        Ok(process.handles.grant(object, Rights::from_bits_truncate(rights)))
    }

    /// `vmo_map`: requires `MAP` on the handle. The kernel process (no
    /// pagemap of its own) is served a pointer directly into the VMO's
    /// buffer rather than a real translated address; every other process
    /// gets fresh physical frames, seeded from the VMO's current contents
    /// and mapped into its pagemap with rights translated via
    /// [`rights_to_map_flags`].
    fn sys_vmo_map(
        &mut self,
        caller: Pid,
        handle: Handle,
        vaddr_hint: Option<u64>,
        offset: u64,
        len: u64,
        rights: u32,
    ) -> KernelResult<u64> {
        let requested = Rights::from_bits_truncate(rights);
        let (object, entry_rights) = {
            let process = self.processes.get(caller)?;
            let entry = process.handles.get(handle)?;
            (entry.object.clone().ok_or(KernelError::BadHandle)?, entry.rights)
        };
        if !entry_rights.contains(Rights::MAP) {
            return Err(KernelError::PermissionDenied);
        }
        let map_rights = entry_rights.reduce(requested);
        let vmo_mutex = object.as_vmo()?;

        let pages = len.div_ceil(PAGE_SIZE);
        let process = self.processes.get_mut(caller)?;

        let Some(pagemap) = process.pagemap else {
            // Kernel process: no MMU involved, hand back the offset itself
            // as the "address" a direct buffer access would index with.
            let mut vmo = vmo_mutex.lock().unwrap();
            vmo.record_mapping(Vma { vaddr: offset, offset, len });
            return Ok(offset);
        };

        let vaddr = vaddr_hint.unwrap_or_else(|| process.alloc_vaddr(pages));
        let frames = self.pmm.alloc(pages)?;
        {
            let mut vmo = vmo_mutex.lock().unwrap();
            let src = vmo.data_ptr(offset, len)?.to_vec();
            self.mem.zero(frames, pages * PAGE_SIZE)?;
            self.mem.write_bytes(frames, &src)?;
            vmo.record_mapping(Vma { vaddr, offset, len });
        }

        let flags = rights_to_map_flags(map_rights);
        if let Err(e) = self.mmu.map_range(&mut self.mem, &mut self.pmm, pagemap, VirtAddr(vaddr), frames, pages, flags) {
            self.pmm.free(frames, pages);
            return Err(e);
        }

        let process = self.processes.get_mut(caller)?;
        process.vmo_mappings.push((Vma { vaddr, offset, len }, object));
        Ok(vaddr)
    }

    fn sys_vmo_unmap(&mut self, caller: Pid, vaddr: u64, len: u64) -> KernelResult<()> {
        let process = self.processes.get_mut(caller)?;
        let Some(pagemap) = process.pagemap else {
            return Err(KernelError::InvalidArgument);
        };
        let (_, object) = process.take_vmo_mapping(vaddr, len).ok_or(KernelError::NotFound)?;

        let pages = len.div_ceil(PAGE_SIZE);
        self.mmu.unmap_range(&mut self.mem, &mut self.pmm, pagemap, VirtAddr(vaddr), pages)?;

        if let Ok(vmo_mutex) = object.as_vmo() {
            vmo_mutex.lock().unwrap().take_mapping(vaddr, len);
        }
        Ok(())
    }

    fn sys_vmo_resize(&mut self, caller: Pid, handle: Handle, size: u64) -> KernelResult<()> {
        let process = self.processes.get(caller)?;
        let entry = process.handles.get(handle)?;
        if !entry.rights.contains(Rights::WRITE) {
            return Err(KernelError::PermissionDenied);
        }
        let object = entry.object.as_ref().ok_or(KernelError::BadHandle)?;
        object.as_vmo()?.lock().unwrap().resize(size)
    }

    /// `sched_tick(from_usermode)`: advance the scheduler's notion of time.
    /// Called by whatever drives this kernel (a test, a demo loop) once per
    /// simulated timer interrupt.
    pub fn tick(&mut self, from_usermode: bool) -> bool {
        self.threads.sched_tick(from_usermode)
    }

    /// Wake every thread parked on `wq` — used by device drivers and the
    /// namespace layer for object kinds with their own internal wait
    /// queues, outside of channels (which manage their own).
    pub fn wake_all(&mut self, wq: &mut WaitQueue) -> Vec<Tid> {
        self.threads.thread_wake_all(wq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kernel() -> Kernel {
        let _ = env_logger::try_init();
        Kernel::new(16 * 1024 * 1024).unwrap()
    }

    #[test]
    fn kernel_boots_with_kernel_process_and_idle_thread() {
        let k = kernel();
        assert!(k.processes.get(Pid::KERNEL).is_ok());
        assert_eq!(k.threads.current(), Some(Tid::new(1).unwrap()));
    }

    #[test]
    fn handle_lifecycle_vmo_create_map_unmap_close() {
        let mut k = kernel();
        let h = k
            .handle_syscall(
                Pid::KERNEL,
                Syscall::VmoCreate { size: 4096, flags: 0, rights: (Rights::READ | Rights::WRITE | Rights::MAP).bits() },
            )
            .unwrap();
        let SyscallReturn::Handle(handle) = h else { panic!("expected handle") };

        let pagemap = k.mmu.pagemap_create(&mut k.mem, &mut k.pmm, k.kernel_pagemap).unwrap();
        let pid = k.processes.create("child", pagemap);
        let object = k.processes.get_mut(Pid::KERNEL).unwrap().handles.get(handle).unwrap().object.clone().unwrap();
        let moved_rights = Rights::READ | Rights::WRITE | Rights::MAP;
        let new_handle = k.processes.get_mut(pid).unwrap().handles.grant(object, moved_rights);

        let addr = k.handle_syscall(pid, Syscall::VmoMap { handle: new_handle, vaddr_hint: None, offset: 0, len: 4096, rights: moved_rights.bits() }).unwrap();
        let SyscallReturn::Addr(vaddr) = addr else { panic!("expected addr") };
        assert!(vaddr >= 0x2000_0000);

        k.handle_syscall(pid, Syscall::VmoUnmap { vaddr, len: 4096 }).unwrap();
        k.handle_syscall(pid, Syscall::HandleClose { handle: new_handle }).unwrap();
    }

    #[test]
    fn channel_transfer_moves_handle_between_processes() {
        let mut k = kernel();
        let pagemap_a = k.mmu.pagemap_create(&mut k.mem, &mut k.pmm, k.kernel_pagemap).unwrap();
        let a = k.processes.create("a", pagemap_a);
        let pagemap_b = k.mmu.pagemap_create(&mut k.mem, &mut k.pmm, k.kernel_pagemap).unwrap();
        let b = k.processes.create("b", pagemap_b);

        let rights = (Rights::READ | Rights::WRITE | Rights::TRANSFER).bits();
        let (h0, h1) = match k.handle_syscall(a, Syscall::ChannelCreate { rights }).unwrap() {
            SyscallReturn::Handles(x, y) => (x, y),
            _ => panic!("expected handles"),
        };

        // Move a freshly-created VMO handle from A to B over the channel.
        let vmo_rights = (Rights::READ | Rights::TRANSFER).bits();
        let vmo_handle = match k.handle_syscall(a, Syscall::VmoCreate { size: 16, flags: 0, rights: vmo_rights }).unwrap() {
            SyscallReturn::Handle(h) => h,
            _ => panic!("expected handle"),
        };

        k.handle_syscall(a, Syscall::ChannelSend { handle: h0, data: vec![1, 2, 3], handles: vec![vmo_handle] }).unwrap();
        assert!(k.processes.get(a).unwrap().handles.get(vmo_handle).is_err());

        // B holds h1 via its own table, not a's — grant it directly as if
        // ChannelCreate had targeted both processes (exercised end-to-end
        // through syscalls in the runtime layer; here we only move the vmo).
        let ep1_object = k.processes.get(a).unwrap().handles.get(h1).unwrap().object.clone().unwrap();
        let b_h1 = k.processes.get_mut(b).unwrap().handles.grant(ep1_object, Rights::from_bits_truncate(rights));

        let (data, handles) = match k.handle_syscall(b, Syscall::ChannelRecv { handle: b_h1, max_len: 64 }).unwrap() {
            SyscallReturn::Message { data, handles } => (data, handles),
            _ => panic!("expected message"),
        };
        assert_eq!(data, vec![1, 2, 3]);
        assert_eq!(handles.len(), 1);
        assert!(k.processes.get(b).unwrap().handles.get(handles[0]).is_ok());
    }

    #[test]
    fn peer_closed_surfaces_through_syscall_layer() {
        let mut k = kernel();
        let rights = (Rights::READ | Rights::WRITE).bits();
        let (h0, h1) = match k.handle_syscall(Pid::KERNEL, Syscall::ChannelCreate { rights }).unwrap() {
            SyscallReturn::Handles(x, y) => (x, y),
            _ => panic!("expected handles"),
        };
        k.handle_syscall(Pid::KERNEL, Syscall::HandleClose { handle: h1 }).unwrap();
        let err = k.handle_syscall(Pid::KERNEL, Syscall::ChannelSend { handle: h0, data: vec![], handles: vec![] }).unwrap_err();
        assert_eq!(err, KernelError::PeerClosed);
    }

    #[test]
    fn wait_wake_through_channel_blocks_and_resumes() {
        let mut k = kernel();
        let rights = (Rights::READ | Rights::WRITE).bits();
        let (h0, h1) = match k.handle_syscall(Pid::KERNEL, Syscall::ChannelCreate { rights }).unwrap() {
            SyscallReturn::Handles(x, y) => (x, y),
            _ => panic!("expected handles"),
        };

        let waiter = k.threads.create_thread(Pid::KERNEL, ThreadEntry::Kernel { label: "waiter" });
        k.threads.schedule();
        assert_eq!(k.threads.current(), Some(waiter));

        assert_eq!(
            k.handle_syscall(Pid::KERNEL, Syscall::ChannelRecv { handle: h1, max_len: 16 }).unwrap_err(),
            KernelError::WouldBlock
        );
        k.channel_recv_block(Pid::KERNEL, h1).unwrap();

        k.handle_syscall(Pid::KERNEL, Syscall::ChannelSend { handle: h0, data: vec![9], handles: vec![] }).unwrap();
        assert_eq!(k.threads.get(waiter).unwrap().state, crate::thread::tcb::ThreadState::Ready);
    }

    #[test]
    fn pagemap_isolation_between_processes() {
        let mut k = kernel();
        let pagemap_a = k.mmu.pagemap_create(&mut k.mem, &mut k.pmm, k.kernel_pagemap).unwrap();
        let a = k.processes.create("a", pagemap_a);
        let pagemap_b = k.mmu.pagemap_create(&mut k.mem, &mut k.pmm, k.kernel_pagemap).unwrap();
        let b = k.processes.create("b", pagemap_b);

        let vmo_rights = (Rights::READ | Rights::WRITE | Rights::MAP).bits();
        let h = match k.handle_syscall(a, Syscall::VmoCreate { size: 4096, flags: 0, rights: vmo_rights }).unwrap() {
            SyscallReturn::Handle(h) => h,
            _ => panic!("expected handle"),
        };
        let vaddr = match k.handle_syscall(a, Syscall::VmoMap { handle: h, vaddr_hint: None, offset: 0, len: 4096, rights: vmo_rights }).unwrap() {
            SyscallReturn::Addr(a) => a,
            _ => panic!("expected addr"),
        };

        let resolved_a = k.mmu.virt_to_phys(&mut k.mem, &mut k.pmm, pagemap_a, VirtAddr(vaddr)).unwrap();
        let resolved_b = k.mmu.virt_to_phys(&mut k.mem, &mut k.pmm, pagemap_b, VirtAddr(vaddr)).unwrap();
        assert!(resolved_a.is_some());
        assert!(resolved_b.is_none());
    }

    #[test]
    fn preemption_switches_thread_after_time_slice() {
        let mut k = kernel();
        let a = k.threads.create_thread(Pid::KERNEL, ThreadEntry::Kernel { label: "a" });
        let b = k.threads.create_thread(Pid::KERNEL, ThreadEntry::Kernel { label: "b" });
        assert_eq!(k.threads.schedule(), a);
        for _ in 0..crate::thread::DEFAULT_TIME_SLICE - 1 {
            assert!(!k.tick(true));
        }
        assert!(k.tick(true));
        assert_eq!(k.threads.current(), Some(b));
    }
}
