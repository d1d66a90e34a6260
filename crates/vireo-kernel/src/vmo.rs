//! Virtual memory objects: capability-addressable regions of kernel-owned
//! memory, mappable into one or more address spaces via [`crate::mmu`].

use crate::error::{KernelError, KernelResult};
use crate::mmu::MapFlags;
use crate::rights::Rights;

bitflags::bitflags! {
    #[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
    pub struct VmoFlags: u32 {
        const RESIZABLE = 1 << 0;
    }
}

/// A mapping of this VMO into some process's address space, recorded so
/// `vmo_unmap` can find and tear it down later.
#[derive(Debug, Copy, Clone)]
pub struct Vma {
    pub vaddr: u64,
    pub offset: u64,
    pub len: u64,
}

/// Memory-owning object backing the `VMO` kernel object kind. `committed`
/// always equals `size`: this design never lazily commits pages.
pub struct VmoObject {
    buffer: Vec<u8>,
    flags: VmoFlags,
    mappings: Vec<Vma>,
}

impl VmoObject {
    pub fn new(size: u64, flags: VmoFlags) -> Self {
        Self {
            buffer: vec![0u8; size as usize],
            flags,
            mappings: Vec::new(),
        }
    }

    pub fn size(&self) -> u64 {
        self.buffer.len() as u64
    }

    pub fn flags(&self) -> VmoFlags {
        self.flags
    }

    /// Bounds-checked copy out of the backing buffer starting at `offset`.
    /// Reads past the end return 0 bytes; a read overlapping the end is
    /// truncated to what remains.
    pub fn read(&self, offset: u64, buf: &mut [u8]) -> usize {
        let start = offset as usize;
        if start >= self.buffer.len() {
            return 0;
        }
        let n = buf.len().min(self.buffer.len() - start);
        buf[..n].copy_from_slice(&self.buffer[start..start + n]);
        n
    }

    /// Bounds-checked copy into the backing buffer. Writes past the end are
    /// truncated the same way reads are.
    pub fn write(&mut self, offset: u64, data: &[u8]) -> usize {
        let start = offset as usize;
        if start >= self.buffer.len() {
            return 0;
        }
        let n = data.len().min(self.buffer.len() - start);
        self.buffer[start..start + n].copy_from_slice(&data[..n]);
        n
    }

    pub fn resize(&mut self, new_size: u64) -> KernelResult<()> {
        if !self.flags.contains(VmoFlags::RESIZABLE) && new_size != self.size() {
            return Err(KernelError::PermissionDenied);
        }
        self.buffer.resize(new_size as usize, 0);
        Ok(())
    }

    pub fn record_mapping(&mut self, vma: Vma) {
        self.mappings.push(vma);
    }

    /// Remove and return the mapping covering `[vaddr, vaddr+len)`, if any.
    pub fn take_mapping(&mut self, vaddr: u64, len: u64) -> Option<Vma> {
        let idx = self
            .mappings
            .iter()
            .position(|m| m.vaddr == vaddr && m.len == len)?;
        Some(self.mappings.remove(idx))
    }

    /// Physical-style pointer into the backing buffer at `offset`, used by
    /// `vmo_map` to compute the frame(s) installed into a pagemap. This
    /// plays the role of `vmo.pages + offset` translated through the HHDM
    /// in the source design.
    pub fn data_ptr(&mut self, offset: u64, len: u64) -> KernelResult<&mut [u8]> {
        let start = offset as usize;
        let end = start
            .checked_add(len as usize)
            .ok_or(KernelError::InvalidArgument)?;
        self.buffer
            .get_mut(start..end)
            .ok_or(KernelError::InvalidArgument)
    }
}

/// Translate the READ/WRITE/EXECUTE subset of `rights` into MMU mapping
/// flags. `USER` is always requested: kernel-process mappings are served
/// directly from the buffer rather than through the MMU (see `vmo_map`).
pub fn rights_to_map_flags(rights: Rights) -> MapFlags {
    let mut flags = MapFlags::USER;
    if rights.contains(Rights::WRITE) {
        flags |= MapFlags::WRITE;
    }
    if rights.contains(Rights::EXECUTE) {
        flags |= MapFlags::EXEC;
    }
    flags
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_write_roundtrip() {
        let mut vmo = VmoObject::new(16, VmoFlags::empty());
        let data = [1, 2, 3, 4];
        assert_eq!(vmo.write(4, &data), 4);
        let mut out = [0u8; 4];
        assert_eq!(vmo.read(4, &mut out), 4);
        assert_eq!(out, data);
    }

    #[test]
    fn read_past_end_returns_zero() {
        let vmo = VmoObject::new(8, VmoFlags::empty());
        let mut out = [0u8; 4];
        assert_eq!(vmo.read(8, &mut out), 0);
        assert_eq!(vmo.read(100, &mut out), 0);
    }

    #[test]
    fn write_overlapping_end_truncates() {
        let mut vmo = VmoObject::new(4, VmoFlags::empty());
        let data = [1, 2, 3, 4, 5, 6];
        assert_eq!(vmo.write(2, &data), 2);
    }

    #[test]
    fn resize_rejected_without_flag() {
        let mut vmo = VmoObject::new(4, VmoFlags::empty());
        assert!(vmo.resize(8).is_err());
        let mut resizable = VmoObject::new(4, VmoFlags::RESIZABLE);
        assert!(resizable.resize(8).is_ok());
        assert_eq!(resizable.size(), 8);
    }

    proptest::proptest! {
        /// Writing a buffer and reading the same range back always yields
        /// the bytes just written, for any offset and payload that fit
        /// inside a fixed-size VMO.
        #[test]
        fn write_then_read_roundtrips(offset in 0u64..64, data in proptest::collection::vec(proptest::prelude::any::<u8>(), 0..64)) {
            let mut vmo = VmoObject::new(128, VmoFlags::empty());
            let written = vmo.write(offset, &data);
            let mut out = vec![0u8; written];
            let read = vmo.read(offset, &mut out);
            proptest::prop_assert_eq!(read, written);
            proptest::prop_assert_eq!(&out[..read], &data[..written]);
        }
    }
}
