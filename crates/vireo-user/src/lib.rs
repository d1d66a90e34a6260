//! A typed client over the kernel's syscall surface.
//!
//! Real userland reaches the kernel through a trap and a handful of
//! registers; this crate plays that role for code hosted in the same
//! process as the kernel (demos, the CLI, tests exercising a whole
//! scenario end to end) by constructing [`Syscall`] values and reading back
//! [`SyscallReturn`] instead of decoding an ABI. Every method takes the
//! `Kernel` it should be dispatched against, since a `Client` is just a
//! remembered `Pid`, not a handle to the kernel itself.

use vireo_kernel::error::{KernelError, KernelResult};
use vireo_kernel::rights::Rights;
use vireo_kernel::syscall::{Syscall, SyscallReturn, Whence};
use vireo_kernel::types::{Handle, Pid, Tid};
use vireo_kernel::vmo::VmoFlags;
use vireo_kernel::Kernel;

/// A process's view of its own syscall surface, identified by the `Pid`
/// the kernel assigned it at spawn time.
#[derive(Debug, Clone, Copy)]
pub struct Client {
    pid: Pid,
}

/// Unwraps a specific `SyscallReturn` variant, translating a mismatch into
/// a `KernelError` instead of panicking — a well-behaved kernel never
/// returns the wrong shape for a given syscall, but this crate doesn't
/// assume that blindly.
macro_rules! expect_return {
    ($call:expr, $variant:ident) => {
        match $call? {
            SyscallReturn::$variant(v) => Ok(v),
            _ => Err(KernelError::InvalidArgument),
        }
    };
}

impl Client {
    pub fn new(pid: Pid) -> Self {
        Self { pid }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn getpid(&self, kernel: &mut Kernel) -> KernelResult<Pid> {
        expect_return!(kernel.handle_syscall(self.pid, Syscall::GetPid), Pid).map(Pid::new)
    }

    pub fn yield_now(&self, kernel: &mut Kernel) -> KernelResult<()> {
        kernel.handle_syscall(self.pid, Syscall::Yield).map(|_| ())
    }

    pub fn exit(&self, kernel: &mut Kernel, code: i32) -> KernelResult<()> {
        kernel.handle_syscall(self.pid, Syscall::Exit { code }).map(|_| ())
    }

    pub fn spawn(&self, kernel: &mut Kernel, path: &str, argv: Vec<String>) -> KernelResult<Pid> {
        expect_return!(
            kernel.handle_syscall(self.pid, Syscall::Spawn { path: path.to_string(), argv }),
            Pid
        )
        .map(Pid::new)
    }

    pub fn wait(&self, kernel: &mut Kernel, target: Pid) -> KernelResult<i32> {
        expect_return!(
            kernel.handle_syscall(self.pid, Syscall::Wait { pid: target.val() }),
            Status
        )
        .map(|s| s as i32)
    }

    pub fn get_obj(&self, kernel: &mut Kernel, path: &str, rights: Rights) -> KernelResult<Handle> {
        expect_return!(
            kernel.handle_syscall(
                self.pid,
                Syscall::GetObj { parent: -1, path: path.to_string(), rights: rights.bits() }
            ),
            Handle
        )
    }

    pub fn handle_read(&self, kernel: &mut Kernel, handle: Handle, len: usize) -> KernelResult<Vec<u8>> {
        expect_return!(kernel.handle_syscall(self.pid, Syscall::HandleRead { handle, len }), Data)
    }

    pub fn handle_write(&self, kernel: &mut Kernel, handle: Handle, data: Vec<u8>) -> KernelResult<usize> {
        expect_return!(kernel.handle_syscall(self.pid, Syscall::HandleWrite { handle, data }), Count)
    }

    pub fn handle_seek(&self, kernel: &mut Kernel, handle: Handle, offset: i64, whence: Whence) -> KernelResult<u64> {
        expect_return!(kernel.handle_syscall(self.pid, Syscall::HandleSeek { handle, offset, whence }), Offset)
    }

    pub fn handle_close(&self, kernel: &mut Kernel, handle: Handle) -> KernelResult<()> {
        kernel.handle_syscall(self.pid, Syscall::HandleClose { handle }).map(|_| ())
    }

    pub fn handle_duplicate(&self, kernel: &mut Kernel, handle: Handle, rights: Rights) -> KernelResult<Handle> {
        expect_return!(
            kernel.handle_syscall(self.pid, Syscall::HandleDuplicate { handle, rights: rights.bits() }),
            Handle
        )
    }

    pub fn channel_create(&self, kernel: &mut Kernel, rights: Rights) -> KernelResult<(Handle, Handle)> {
        match kernel.handle_syscall(self.pid, Syscall::ChannelCreate { rights: rights.bits() })? {
            SyscallReturn::Handles(a, b) => Ok((a, b)),
            _ => Err(KernelError::InvalidArgument),
        }
    }

    pub fn channel_send(
        &self,
        kernel: &mut Kernel,
        handle: Handle,
        data: Vec<u8>,
        handles: Vec<Handle>,
    ) -> KernelResult<()> {
        kernel.handle_syscall(self.pid, Syscall::ChannelSend { handle, data, handles }).map(|_| ())
    }

    pub fn channel_recv(&self, kernel: &mut Kernel, handle: Handle, max_len: usize) -> KernelResult<(Vec<u8>, Vec<Handle>)> {
        match kernel.handle_syscall(self.pid, Syscall::ChannelRecv { handle, max_len })? {
            SyscallReturn::Message { data, handles } => Ok((data, handles)),
            _ => Err(KernelError::InvalidArgument),
        }
    }

    /// Block until a message arrives on `handle`, retrying the non-blocking
    /// recv after each wake the way a libOS loop has to: wakes on a wait
    /// queue are spurious-wake-safe, never delivery-guaranteed.
    pub fn channel_recv_blocking(&self, kernel: &mut Kernel, handle: Handle, max_len: usize) -> KernelResult<(Vec<u8>, Vec<Handle>)> {
        loop {
            match self.channel_recv(kernel, handle, max_len) {
                Ok(result) => return Ok(result),
                Err(KernelError::WouldBlock) => {
                    let _: Tid = kernel.channel_recv_block(self.pid, handle)?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub fn vmo_create(&self, kernel: &mut Kernel, size: u64, flags: VmoFlags, rights: Rights) -> KernelResult<Handle> {
        expect_return!(
            kernel.handle_syscall(
                self.pid,
                Syscall::VmoCreate { size, flags: flags.bits(), rights: rights.bits() }
            ),
            Handle
        )
    }

    pub fn vmo_map(
        &self,
        kernel: &mut Kernel,
        handle: Handle,
        vaddr_hint: Option<u64>,
        offset: u64,
        len: u64,
        rights: Rights,
    ) -> KernelResult<u64> {
        expect_return!(
            kernel.handle_syscall(
                self.pid,
                Syscall::VmoMap { handle, vaddr_hint, offset, len, rights: rights.bits() }
            ),
            Addr
        )
    }

    pub fn vmo_unmap(&self, kernel: &mut Kernel, vaddr: u64, len: u64) -> KernelResult<()> {
        kernel.handle_syscall(self.pid, Syscall::VmoUnmap { vaddr, len }).map(|_| ())
    }

    pub fn vmo_resize(&self, kernel: &mut Kernel, handle: Handle, size: u64) -> KernelResult<()> {
        kernel.handle_syscall(self.pid, Syscall::VmoResize { handle, size }).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vireo_kernel::Kernel;

    fn boot() -> Kernel {
        Kernel::new(16 * 1024 * 1024).unwrap()
    }

    #[test]
    fn getpid_roundtrips_through_the_syscall_layer() {
        let mut kernel = boot();
        let client = Client::new(Pid::KERNEL);
        assert_eq!(client.getpid(&mut kernel).unwrap(), Pid::KERNEL);
    }

    #[test]
    fn vmo_create_map_unmap_close_roundtrips() {
        let mut kernel = boot();
        let client = Client::new(Pid::KERNEL);
        let rights = Rights::READ | Rights::WRITE | Rights::MAP;
        let handle = client.vmo_create(&mut kernel, 4096, VmoFlags::empty(), rights).unwrap();
        let vaddr = client.vmo_map(&mut kernel, handle, None, 0, 4096, rights).unwrap();
        client.vmo_unmap(&mut kernel, vaddr, 4096).unwrap();
        client.handle_close(&mut kernel, handle).unwrap();
    }

    #[test]
    fn channel_transfer_delivers_handle_to_the_other_endpoint() {
        let mut kernel = boot();
        let client = Client::new(Pid::KERNEL);
        let rights = Rights::READ | Rights::WRITE | Rights::TRANSFER;
        let (h0, h1) = client.channel_create(&mut kernel, rights).unwrap();
        let vmo = client
            .vmo_create(&mut kernel, 16, VmoFlags::empty(), Rights::READ | Rights::TRANSFER)
            .unwrap();

        client.channel_send(&mut kernel, h0, vec![1, 2, 3], vec![vmo]).unwrap();
        let (data, handles) = client.channel_recv(&mut kernel, h1, 64).unwrap();
        assert_eq!(data, vec![1, 2, 3]);
        assert_eq!(handles.len(), 1);
    }

    #[test]
    fn recv_on_empty_channel_would_block() {
        let mut kernel = boot();
        let client = Client::new(Pid::KERNEL);
        let (_h0, h1) = client.channel_create(&mut kernel, Rights::READ | Rights::WRITE).unwrap();
        assert_eq!(client.channel_recv(&mut kernel, h1, 16).unwrap_err(), KernelError::WouldBlock);
    }
}
