//! Per-process handle tables: an ordered sparse vector of capability slots
//! with low-index-first free-slot search and doubling growth.

use crate::error::{KernelError, KernelResult};
use crate::object::Object;
use crate::rights::Rights;
use crate::types::{Handle, HANDLE_NONE};
use std::sync::Arc;

const INITIAL_CAPACITY: usize = 16;

/// A tuple `(object, offset, rights)`. `offset` is the seek cursor used by
/// read/write on seekable objects. An entry with `object = None` is free.
pub struct HandleTableEntry {
    pub object: Option<Arc<Object>>,
    pub offset: u64,
    pub rights: Rights,
}

impl HandleTableEntry {
    fn free() -> Self {
        Self {
            object: None,
            offset: 0,
            rights: Rights::empty(),
        }
    }
}

pub struct HandleTable {
    entries: Vec<HandleTableEntry>,
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}

impl HandleTable {
    pub fn new() -> Self {
        let mut entries = Vec::with_capacity(INITIAL_CAPACITY);
        entries.resize_with(INITIAL_CAPACITY, HandleTableEntry::free);
        Self { entries }
    }

    fn find_free_slot(&self) -> Option<usize> {
        self.entries.iter().position(|e| e.object.is_none())
    }

    /// `grant(proc, object, rights)`: find the lowest free slot, growing by
    /// doubling if the table is full, and install the object there.
    pub fn grant(&mut self, object: Arc<Object>, rights: Rights) -> Handle {
        let slot = match self.find_free_slot() {
            Some(slot) => slot,
            None => {
                let old_len = self.entries.len();
                self.entries.resize_with(old_len * 2, HandleTableEntry::free);
                old_len
            }
        };
        self.entries[slot] = HandleTableEntry {
            object: Some(object),
            offset: 0,
            rights,
        };
        slot as Handle
    }

    fn slot(&self, handle: Handle) -> KernelResult<usize> {
        if handle == HANDLE_NONE || handle < 0 {
            return Err(KernelError::BadHandle);
        }
        let idx = handle as usize;
        if idx >= self.entries.len() || self.entries[idx].object.is_none() {
            return Err(KernelError::BadHandle);
        }
        Ok(idx)
    }

    pub fn get(&self, handle: Handle) -> KernelResult<&HandleTableEntry> {
        let idx = self.slot(handle)?;
        Ok(&self.entries[idx])
    }

    pub fn get_mut(&mut self, handle: Handle) -> KernelResult<&mut HandleTableEntry> {
        let idx = self.slot(handle)?;
        Ok(&mut self.entries[idx])
    }

    /// `close(proc, handle)`: decrement the object's refcount (by dropping
    /// this table's `Arc`) and clear the slot.
    pub fn close(&mut self, handle: Handle) -> KernelResult<()> {
        let idx = self.slot(handle)?;
        self.entries[idx] = HandleTableEntry::free();
        Ok(())
    }

    /// `duplicate(proc, handle, new_rights)`: requires `DUPLICATE` in the
    /// source rights; yields a new handle with `src_rights ∩ new_rights`
    /// (monotonic reduction only — rights can never be expanded this way).
    pub fn duplicate(&mut self, handle: Handle, new_rights: Rights) -> KernelResult<Handle> {
        let idx = self.slot(handle)?;
        let entry = &self.entries[idx];
        if !entry.rights.contains(Rights::DUPLICATE) {
            return Err(KernelError::PermissionDenied);
        }
        let object = entry.object.clone().expect("slot validated non-free above");
        let rights = entry.rights.reduce(new_rights);
        Ok(self.grant(object, rights))
    }

    /// Remove and return the object+rights at `handle` without dropping the
    /// reference, for move-semantics transfer (channel send). The caller is
    /// responsible for the object's fate.
    pub fn take(&mut self, handle: Handle) -> KernelResult<(Arc<Object>, Rights)> {
        let idx = self.slot(handle)?;
        let entry = std::mem::replace(&mut self.entries[idx], HandleTableEntry::free());
        Ok((entry.object.expect("slot validated non-free above"), entry.rights))
    }
}
