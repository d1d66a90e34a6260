//! The kernel object: a typed, reference-counted resource every handle
//! ultimately points at.
//!
//! The source represents this as a function-pointer table over an opaque
//! `void *data`. Here it is a tagged enum of concrete object kinds; `Arc`
//! supplies the atomic refcount and `Drop` supplies "`ops.close` fires
//! exactly once when the count reaches zero" for free — no object is ever
//! reachable through a handle table or channel entry with a refcount of
//! zero, because reaching zero is precisely when the last such reference
//! was dropped.

use crate::channel::ChannelEndpointObject;
use crate::error::{KernelError, KernelResult};
use crate::types::{ObjectType, Pid, Tid};
use crate::vmo::VmoObject;
use std::sync::{Arc, Mutex};

pub struct DeviceObject {
    pub name: String,
    pub contents: Vec<u8>,
}

pub struct FileObject {
    pub name: String,
    pub contents: Vec<u8>,
}

pub struct DirectoryObject {
    pub name: String,
    pub children: Vec<(String, Arc<Object>)>,
}

impl DirectoryObject {
    pub fn lookup(&self, name: &str) -> Option<Arc<Object>> {
        self.children.iter().find(|(n, _)| n == name).map(|(_, o)| o.clone())
    }
}

/// The concrete payload behind an [`Object`]. `Thread` and `Process`
/// variants are thin: the live state lives in `ThreadManager`/the process
/// table, and the object here only exists so a thread or process can be
/// named by a handle.
pub enum ObjectKind {
    Thread(Tid),
    Process(Pid),
    /// A VMO's buffer is mutated through a shared `Arc<Object>` (every
    /// handle onto it, and the kernel's own mapping code, holds one), so
    /// it needs interior mutability even with only one CPU ever running.
    Vmo(Mutex<VmoObject>),
    ChannelEndpoint(ChannelEndpointObject),
    Device(DeviceObject),
    File(FileObject),
    Directory(DirectoryObject),
}

pub struct Object {
    pub kind: ObjectKind,
}

impl Object {
    pub fn new(kind: ObjectKind) -> Self {
        Self { kind }
    }

    pub fn object_type(&self) -> ObjectType {
        match &self.kind {
            ObjectKind::Thread(_) => ObjectType::Thread,
            ObjectKind::Process(_) => ObjectType::Process,
            ObjectKind::Vmo(_) => ObjectType::Vmo,
            ObjectKind::ChannelEndpoint(_) => ObjectType::ChannelEndpoint,
            ObjectKind::Device(_) => ObjectType::Device,
            ObjectKind::File(_) => ObjectType::File,
            ObjectKind::Directory(_) => ObjectType::Directory,
        }
    }

    pub fn as_vmo(&self) -> KernelResult<&Mutex<VmoObject>> {
        match &self.kind {
            ObjectKind::Vmo(v) => Ok(v),
            _ => Err(KernelError::WrongType),
        }
    }

    pub fn as_channel_endpoint(&self) -> KernelResult<&ChannelEndpointObject> {
        match &self.kind {
            ObjectKind::ChannelEndpoint(c) => Ok(c),
            _ => Err(KernelError::WrongType),
        }
    }

    pub fn as_directory(&self) -> KernelResult<&DirectoryObject> {
        match &self.kind {
            ObjectKind::Directory(d) => Ok(d),
            _ => Err(KernelError::WrongType),
        }
    }

    /// `read` op: only readable object kinds (VMO, File, Device) accept it.
    pub fn read(&self, offset: u64, buf: &mut [u8]) -> KernelResult<usize> {
        match &self.kind {
            ObjectKind::Vmo(v) => Ok(v.lock().unwrap().read(offset, buf)),
            ObjectKind::File(f) => Ok(read_slice(&f.contents, offset, buf)),
            ObjectKind::Device(d) => Ok(read_slice(&d.contents, offset, buf)),
            _ => Err(KernelError::WrongType),
        }
    }

    /// `write` op: only writable object kinds accept it.
    pub fn write(&self, offset: u64, data: &[u8]) -> KernelResult<usize> {
        match &self.kind {
            ObjectKind::Vmo(v) => Ok(v.lock().unwrap().write(offset, data)),
            _ => Err(KernelError::WrongType),
        }
    }
}

fn read_slice(src: &[u8], offset: u64, buf: &mut [u8]) -> usize {
    let start = offset as usize;
    if start >= src.len() {
        return 0;
    }
    let n = buf.len().min(src.len() - start);
    buf[..n].copy_from_slice(&src[start..start + n]);
    n
}
