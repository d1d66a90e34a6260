//! Boots a [`vireo_kernel::Kernel`] and drives it the way a bootloader and
//! init process would in a real deployment: load binaries, register them
//! where `sys_spawn` can find them, and pump the scheduler forward.
//!
//! There is no CPU emulation layer here or in the kernel crate — processes
//! are scheduled and their handle tables/address spaces are real, but a
//! thread never actually executes the instructions mapped into it. That
//! piece belongs to a hosted execution backend this crate doesn't provide.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use log::info;
use vireo_kernel::error::KernelError;
use vireo_kernel::object::{FileObject, Object, ObjectKind};
use vireo_kernel::rights::Rights;
use vireo_kernel::types::Pid;
use vireo_kernel::Kernel;

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Kernel(#[from] KernelError),
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

pub type RuntimeResult<T> = Result<T, RuntimeError>;

pub struct Runtime {
    kernel: Kernel,
}

impl Runtime {
    pub fn boot(ram_bytes: u64) -> RuntimeResult<Self> {
        info!("booting with {ram_bytes} bytes of RAM");
        Ok(Self { kernel: Kernel::new(ram_bytes)? })
    }

    pub fn kernel(&self) -> &Kernel {
        &self.kernel
    }

    pub fn kernel_mut(&mut self) -> &mut Kernel {
        &mut self.kernel
    }

    /// Read an ELF binary off the host filesystem and spawn it directly,
    /// the way a bootloader hands off the first binaries named in its boot
    /// manifest before any namespace service exists to look them up.
    pub fn spawn_from_disk(&mut self, path: &Path) -> RuntimeResult<Pid> {
        let data = fs::read(path).map_err(|source| RuntimeError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("unnamed");
        info!("spawning {name} ({} bytes)", data.len());
        Ok(self.kernel.spawn(&data, name)?)
    }

    /// Publish a binary's bytes under `$files/<path>` so a running process
    /// can `sys_spawn` it by name instead of the bootloader doing it by
    /// host path.
    pub fn register_file(&mut self, path: &str, contents: Vec<u8>) -> RuntimeResult<()> {
        let name = path.rsplit('/').next().unwrap_or(path).to_string();
        let object = Arc::new(Object::new(ObjectKind::File(FileObject { name, contents })));
        self.kernel.namespace.register(path, object, Rights::READ)?;
        Ok(())
    }

    /// Advance the scheduler by `ticks` time slices, as a cooperating timer
    /// interrupt would. Every tick is charged as kernel-mode, since there's
    /// no usermode execution backend to source a real preemption point from.
    pub fn run_ticks(&mut self, ticks: u64) {
        for _ in 0..ticks {
            self.kernel.tick(false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn boot() -> Runtime {
        let _ = env_logger::try_init();
        Runtime::boot(1024 * 1024).unwrap()
    }

    #[test]
    fn boot_creates_kernel_process() {
        let rt = boot();
        assert!(rt.kernel().processes.get(Pid::KERNEL).is_ok());
    }

    #[test]
    fn register_file_is_reachable_by_namespace_lookup() {
        let mut rt = boot();
        rt.register_file("$files/hello", vec![1, 2, 3]).unwrap();
        let (obj, rights) = rt.kernel().namespace.lookup("$files/hello", Rights::READ).unwrap();
        assert_eq!(rights, Rights::READ);
        let mut buf = [0u8; 3];
        obj.read(0, &mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3]);
    }

    #[test]
    fn spawn_from_disk_reports_missing_file() {
        let mut rt = boot();
        let err = rt.spawn_from_disk(Path::new("/no/such/binary")).unwrap_err();
        assert!(matches!(err, RuntimeError::Io { .. }));
    }
}
