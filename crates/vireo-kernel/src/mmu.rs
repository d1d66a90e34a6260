//! Four-level (PML4 -> PDP -> PD -> PT) page tables and per-address-space
//! pagemaps.
//!
//! Leaf data frames belong to VMOs; intermediate (translation) frames belong
//! to the pagemap. [`pagemap_destroy`] only ever frees the latter, which is
//! what lets a VMO survive the address space that mapped it.

use crate::error::{KernelError, KernelResult};
use crate::pmm::{PhysAddr, PhysicalMemory, Pmm, VirtAddr, PAGE_SIZE};
use bitflags::bitflags;
use log::debug;

const ENTRIES_PER_TABLE: u64 = 512;
const HUGE_PAGE_SIZE: u64 = 512 * PAGE_SIZE; // 2 MiB
const ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;

bitflags! {
    struct Pte: u64 {
        const PRESENT  = 1 << 0;
        const WRITE    = 1 << 1;
        const USER     = 1 << 2;
        const PWT      = 1 << 3;
        const PCD      = 1 << 4;
        const ACCESSED = 1 << 5;
        const DIRTY    = 1 << 6;
        const HUGE     = 1 << 7;
        const NX       = 1 << 63;
    }
}

bitflags! {
    /// Mapping request flags (`PRESENT` is implicit on every mapped entry).
    pub struct MapFlags: u32 {
        const WRITE   = 1 << 0;
        const USER    = 1 << 1;
        const EXEC    = 1 << 2;
        const NOCACHE = 1 << 3;
    }
}

fn pml4_idx(v: VirtAddr) -> u64 {
    (v.0 >> 39) & 0x1FF
}
fn pdp_idx(v: VirtAddr) -> u64 {
    (v.0 >> 30) & 0x1FF
}
fn pd_idx(v: VirtAddr) -> u64 {
    (v.0 >> 21) & 0x1FF
}
fn pt_idx(v: VirtAddr) -> u64 {
    (v.0 >> 12) & 0x1FF
}

fn entry_addr(table: PhysAddr, index: u64) -> PhysAddr {
    table.offset(index * 8)
}

/// Root of one address space's translation tree. The upper half (PML4
/// indices 256..511) is shared with every other pagemap and mirrors the
/// kernel pagemap; the lower half is private to the owner.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Pagemap {
    pub top_level: PhysAddr,
}

/// Counts single-page TLB invalidations issued by this MMU instance. Real
/// hardware would execute `invlpg`; here the count itself is the testable
/// artifact.
#[derive(Debug, Default)]
pub struct Mmu {
    pub tlb_invalidations: u64,
}

impl Mmu {
    pub fn new() -> Self {
        Self::default()
    }

    fn alloc_table(&self, mem: &mut PhysicalMemory, pmm: &mut Pmm) -> KernelResult<PhysAddr> {
        let frame = pmm.alloc(1)?;
        mem.zero(frame, PAGE_SIZE)?;
        Ok(frame)
    }

    /// Read (and optionally allocate) the next-level table referenced by
    /// `table[index]`. Mirrors the source's `get_next_level`: an
    /// intermediate entry is granted `WRITE` and, once any leaf beneath it
    /// is user-accessible, `USER` -- fine-grained permission lives at the
    /// leaf.
    fn next_level(
        &mut self,
        mem: &mut PhysicalMemory,
        pmm: &mut Pmm,
        table: PhysAddr,
        index: u64,
        allocate: bool,
        user: bool,
    ) -> KernelResult<Option<PhysAddr>> {
        let addr = entry_addr(table, index);
        let raw = mem.read_u64(addr)?;
        let entry = Pte::from_bits_truncate(raw);

        if entry.contains(Pte::PRESENT) {
            if user && !entry.contains(Pte::USER) {
                mem.write_u64(addr, raw | Pte::USER.bits())?;
            }
            return Ok(Some(PhysAddr(raw & ADDR_MASK)));
        }

        if !allocate {
            return Ok(None);
        }

        let next = self.alloc_table(mem, pmm)?;
        let mut flags = Pte::PRESENT | Pte::WRITE;
        if user {
            flags |= Pte::USER;
        }
        mem.write_u64(addr, next.0 | flags.bits())?;
        Ok(Some(next))
    }

    /// Install PTEs across `[vaddr, vaddr + pages * PAGE_SIZE)`. Opportunistically
    /// uses 2 MiB huge pages when both addresses are 2 MiB-aligned and at
    /// least 512 pages remain.
    pub fn map_range(
        &mut self,
        mem: &mut PhysicalMemory,
        pmm: &mut Pmm,
        map: Pagemap,
        vaddr: VirtAddr,
        paddr: PhysAddr,
        pages: u64,
        flags: MapFlags,
    ) -> KernelResult<()> {
        let user = flags.contains(MapFlags::USER);
        let mut leaf = Pte::PRESENT;
        if flags.contains(MapFlags::WRITE) {
            leaf |= Pte::WRITE;
        }
        if user {
            leaf |= Pte::USER;
        }
        if flags.contains(MapFlags::NOCACHE) {
            leaf |= Pte::PCD | Pte::PWT;
        }
        if !flags.contains(MapFlags::EXEC) {
            leaf |= Pte::NX;
        }

        let mut i = 0u64;
        while i < pages {
            let cur_virt = VirtAddr(vaddr.0 + i * PAGE_SIZE);
            let cur_phys = PhysAddr(paddr.0 + i * PAGE_SIZE);

            let pdp = self
                .next_level(mem, pmm, map.top_level, pml4_idx(cur_virt), true, user)?
                .expect("allocate=true always returns Some");
            let pd = self
                .next_level(mem, pmm, pdp, pdp_idx(cur_virt), true, user)?
                .expect("allocate=true always returns Some");

            let remaining = pages - i;
            let huge_eligible = remaining >= 512
                && cur_virt.0 % HUGE_PAGE_SIZE == 0
                && cur_phys.0 % HUGE_PAGE_SIZE == 0;

            if huge_eligible {
                let addr = entry_addr(pd, pd_idx(cur_virt));
                mem.write_u64(addr, cur_phys.0 | (leaf | Pte::HUGE).bits())?;
                i += 512;
            } else {
                let pt = self
                    .next_level(mem, pmm, pd, pd_idx(cur_virt), true, user)?
                    .expect("allocate=true always returns Some");
                let addr = entry_addr(pt, pt_idx(cur_virt));
                mem.write_u64(addr, cur_phys.0 | leaf.bits())?;
                i += 1;
            }
            self.tlb_invalidations += 1;
        }
        Ok(())
    }

    /// Clear leaves across the range. Intermediate tables are left in place
    /// for reuse; huge pages are handled at the PD level.
    pub fn unmap_range(
        &mut self,
        mem: &mut PhysicalMemory,
        pmm: &mut Pmm,
        map: Pagemap,
        vaddr: VirtAddr,
        pages: u64,
    ) -> KernelResult<()> {
        let mut i = 0u64;
        while i < pages {
            let cur_virt = VirtAddr(vaddr.0 + i * PAGE_SIZE);

            let pdp = match self.next_level(mem, pmm, map.top_level, pml4_idx(cur_virt), false, false)? {
                Some(p) => p,
                None => {
                    i += 1;
                    continue;
                }
            };
            let pd = match self.next_level(mem, pmm, pdp, pdp_idx(cur_virt), false, false)? {
                Some(p) => p,
                None => {
                    i += 1;
                    continue;
                }
            };

            let pd_entry_addr = entry_addr(pd, pd_idx(cur_virt));
            let pd_entry = Pte::from_bits_truncate(mem.read_u64(pd_entry_addr)?);
            if pd_entry.contains(Pte::HUGE) {
                mem.write_u64(pd_entry_addr, 0)?;
                i += 512;
            } else if let Some(pt) = self.next_level(mem, pmm, pd, pd_idx(cur_virt), false, false)? {
                mem.write_u64(entry_addr(pt, pt_idx(cur_virt)), 0)?;
                i += 1;
            } else {
                i += 1;
            }
            self.tlb_invalidations += 1;
        }
        Ok(())
    }

    /// Walk the tree and return the physical address the virtual address
    /// translates to, or `None` if any level is not present.
    pub fn virt_to_phys(
        &mut self,
        mem: &mut PhysicalMemory,
        pmm: &mut Pmm,
        map: Pagemap,
        vaddr: VirtAddr,
    ) -> KernelResult<Option<PhysAddr>> {
        let pdp = match self.next_level(mem, pmm, map.top_level, pml4_idx(vaddr), false, false)? {
            Some(p) => p,
            None => return Ok(None),
        };
        let pd = match self.next_level(mem, pmm, pdp, pdp_idx(vaddr), false, false)? {
            Some(p) => p,
            None => return Ok(None),
        };

        let pd_entry = Pte::from_bits_truncate(mem.read_u64(entry_addr(pd, pd_idx(vaddr)))?);
        if !pd_entry.contains(Pte::PRESENT) {
            return Ok(None);
        }
        if pd_entry.contains(Pte::HUGE) {
            let base = pd_entry.bits() & ADDR_MASK;
            return Ok(Some(PhysAddr(base + (vaddr.0 & (HUGE_PAGE_SIZE - 1)))));
        }

        let pt = match self.next_level(mem, pmm, pd, pd_idx(vaddr), false, false)? {
            Some(p) => p,
            None => return Ok(None),
        };
        let pt_entry = Pte::from_bits_truncate(mem.read_u64(entry_addr(pt, pt_idx(vaddr)))?);
        if !pt_entry.contains(Pte::PRESENT) {
            return Ok(None);
        }
        Ok(Some(PhysAddr((pt_entry.bits() & ADDR_MASK) + (vaddr.0 & (PAGE_SIZE - 1)))))
    }

    /// Allocate a fresh PML4, copying the kernel's upper-half entries so the
    /// new address space shares the kernel view.
    pub fn pagemap_create(
        &self,
        mem: &mut PhysicalMemory,
        pmm: &mut Pmm,
        kernel_map: Pagemap,
    ) -> KernelResult<Pagemap> {
        let pml4 = pmm.alloc(1)?;
        mem.zero(pml4, PAGE_SIZE)?;

        for i in ENTRIES_PER_TABLE / 2..ENTRIES_PER_TABLE {
            let entry = mem.read_u64(entry_addr(kernel_map.top_level, i))?;
            mem.write_u64(entry_addr(pml4, i), entry)?;
        }

        Ok(Pagemap { top_level: pml4 })
    }

    /// Create the initial kernel pagemap: a fresh, zeroed PML4 whose upper
    /// half is then populated with freshly-allocated (empty) tables, ready
    /// to be shared by every user pagemap created afterwards.
    pub fn kernel_pagemap_create(&self, mem: &mut PhysicalMemory, pmm: &mut Pmm) -> KernelResult<Pagemap> {
        let pml4 = pmm.alloc(1)?;
        mem.zero(pml4, PAGE_SIZE)?;
        let map = Pagemap { top_level: pml4 };
        let mut mmu = Mmu::new();
        for i in ENTRIES_PER_TABLE / 2..ENTRIES_PER_TABLE {
            mmu.next_level(mem, pmm, pml4, i, true, false)?;
        }
        Ok(map)
    }

    fn free_table_level(
        &self,
        mem: &mut PhysicalMemory,
        pmm: &mut Pmm,
        table: PhysAddr,
        level: u32,
    ) -> KernelResult<()> {
        if level == 0 {
            return Ok(());
        }
        for i in 0..ENTRIES_PER_TABLE {
            let raw = mem.read_u64(entry_addr(table, i))?;
            let entry = Pte::from_bits_truncate(raw);
            if !entry.contains(Pte::PRESENT) || entry.contains(Pte::HUGE) {
                continue;
            }
            if level > 1 {
                let child = PhysAddr(raw & ADDR_MASK);
                self.free_table_level(mem, pmm, child, level - 1)?;
                pmm.free(child, 1);
            }
            // level == 1: entry points at a VMO-owned data frame; never freed here.
        }
        Ok(())
    }

    /// Walk lower-half entries only, recursively freeing every intermediate
    /// table, then free the PML4. Leaf data frames are never touched.
    pub fn pagemap_destroy(&self, mem: &mut PhysicalMemory, pmm: &mut Pmm, map: Pagemap) -> KernelResult<()> {
        for i in 0..ENTRIES_PER_TABLE / 2 {
            let raw = mem.read_u64(entry_addr(map.top_level, i))?;
            let entry = Pte::from_bits_truncate(raw);
            if !entry.contains(Pte::PRESENT) {
                continue;
            }
            let pdp = PhysAddr(raw & ADDR_MASK);
            self.free_table_level(mem, pmm, pdp, 3)?;
            pmm.free(pdp, 1);
        }
        pmm.free(map.top_level, 1);
        debug!("pagemap {:?} destroyed", map.top_level);
        Ok(())
    }

    /// Install `map` as the active translation root. On real hardware this
    /// writes CR3; here it is recorded by the caller (see [`crate::thread`]).
    pub fn switch(&self, map: Pagemap) -> Pagemap {
        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (PhysicalMemory, Pmm, Mmu) {
        let mem = PhysicalMemory::new(4096 * PAGE_SIZE);
        let pmm = Pmm::new(0, 4096 * PAGE_SIZE);
        (mem, pmm, Mmu::new())
    }

    #[test]
    fn map_then_translate_roundtrip() {
        let (mut mem, mut pmm, mut mmu) = setup();
        let kernel_map = mmu.kernel_pagemap_create(&mut mem, &mut pmm).unwrap();
        let map = mmu.pagemap_create(&mut mem, &mut pmm, kernel_map).unwrap();

        let data = pmm.alloc(1).unwrap();
        mmu.map_range(
            &mut mem,
            &mut pmm,
            map,
            VirtAddr(0x1000),
            data,
            1,
            MapFlags::WRITE | MapFlags::USER,
        )
        .unwrap();

        let resolved = mmu.virt_to_phys(&mut mem, &mut pmm, map, VirtAddr(0x1000)).unwrap();
        assert_eq!(resolved, Some(data));
        assert!(mmu.tlb_invalidations >= 1);
    }

    #[test]
    fn unmap_clears_leaf_but_keeps_intermediate_tables() {
        let (mut mem, mut pmm, mut mmu) = setup();
        let kernel_map = mmu.kernel_pagemap_create(&mut mem, &mut pmm).unwrap();
        let map = mmu.pagemap_create(&mut mem, &mut pmm, kernel_map).unwrap();
        let data = pmm.alloc(1).unwrap();

        mmu.map_range(&mut mem, &mut pmm, map, VirtAddr(0x2000), data, 1, MapFlags::WRITE)
            .unwrap();
        mmu.unmap_range(&mut mem, &mut pmm, map, VirtAddr(0x2000), 1).unwrap();

        let resolved = mmu.virt_to_phys(&mut mem, &mut pmm, map, VirtAddr(0x2000)).unwrap();
        assert_eq!(resolved, None);

        // Remapping the same page must not need to allocate a fresh PT,
        // i.e. the intermediate tables survived the unmap.
        let free_before = pmm.free_pages();
        mmu.map_range(&mut mem, &mut pmm, map, VirtAddr(0x2000), data, 1, MapFlags::WRITE)
            .unwrap();
        assert_eq!(pmm.free_pages(), free_before);
    }

    #[test]
    fn huge_page_mapping_when_aligned() {
        let (mut mem, mut pmm, mut mmu) = setup();
        let kernel_map = mmu.kernel_pagemap_create(&mut mem, &mut pmm).unwrap();
        let map = mmu.pagemap_create(&mut mem, &mut pmm, kernel_map).unwrap();
        let data = pmm.alloc(512).unwrap();
        assert!(data.0 % HUGE_PAGE_SIZE == 0);

        mmu.map_range(&mut mem, &mut pmm, map, VirtAddr(0x0020_0000), data, 512, MapFlags::WRITE)
            .unwrap();

        let mid = mmu
            .virt_to_phys(&mut mem, &mut pmm, map, VirtAddr(0x0020_0000 + 0x1234))
            .unwrap();
        assert_eq!(mid, Some(PhysAddr(data.0 + 0x1234)));
    }

    #[test]
    fn destroy_frees_only_intermediate_frames() {
        let (mut mem, mut pmm, mmu) = setup();
        let kernel_map = mmu.kernel_pagemap_create(&mut mem, &mut pmm).unwrap();
        let mut mmu = mmu;
        let map = mmu.pagemap_create(&mut mem, &mut pmm, kernel_map).unwrap();
        let data = pmm.alloc(1).unwrap();

        mmu.map_range(&mut mem, &mut pmm, map, VirtAddr(0x3000), data, 1, MapFlags::WRITE)
            .unwrap();

        let free_before_destroy = pmm.free_pages();
        mmu.pagemap_destroy(&mut mem, &mut pmm, map).unwrap();
        // The leaf data frame was never handed back to the PMM by destroy.
        assert!(pmm.free_pages() > free_before_destroy);
        pmm.free(data, 1);
    }
}
