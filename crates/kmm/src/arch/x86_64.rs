//! x86_64 4-level page tables.
//!
//! Tables are reached through the boot loader's direct map, so the mapper never needs
//! the tables themselves to be mapped in the kernel heap.

use ::x86_64::{
    PhysAddr, VirtAddr,
    instructions::tlb,
    registers::control::{Cr3, Cr3Flags},
    structures::paging::{PageTable, PageTableFlags, PhysFrame, page_table::PageTableEntry},
};

use super::{ArchMapper, FrameAllocator, MapError, MapFlags, MAX_VIRTUAL_BITS, PAGE_SIZE};
use crate::{DirectMap, PhysicalAddress, VirtualAddress};

/// First PML4 slot of the kernel half.
const KERNEL_PML4_START: usize = 256;

/// Entries per table.
const ENTRY_COUNT: usize = 512;

/// Software bit recording that the translation backs an allocation.
const USED_BIT: PageTableFlags = PageTableFlags::BIT_9;

#[inline]
const fn table_index(addr: usize, level: usize) -> usize {
    (addr >> (12 + 9 * level)) & (ENTRY_COUNT - 1)
}

fn leaf_flags(flags: MapFlags) -> PageTableFlags {
    let mut out = PageTableFlags::empty();
    if flags.contains(MapFlags::USABLE) {
        out |= PageTableFlags::PRESENT | PageTableFlags::WRITABLE;
    }
    if flags.contains(MapFlags::USED) {
        out |= USED_BIT;
    }
    if flags.contains(MapFlags::SUPERPAGE) {
        out |= PageTableFlags::HUGE_PAGE;
    }
    if flags.contains(MapFlags::GLOBAL) {
        out |= PageTableFlags::GLOBAL;
    }
    if flags.contains(MapFlags::USER) {
        out |= PageTableFlags::USER_ACCESSIBLE;
    }
    out
}

/// Page-table driver for one x86_64 address space.
pub struct X86Mapper {
    root: PhysicalAddress,
    direct_map: DirectMap,
}

// SAFETY: the mapper only holds physical addresses; the tables they name are owned by
// the address space and mutated under the caller's lock.
unsafe impl Send for X86Mapper {}

impl X86Mapper {
    /// Wraps the page tables currently loaded in CR3.
    ///
    /// # Safety
    ///
    /// All physical memory must be reachable through `direct_map`.
    pub unsafe fn active(direct_map: DirectMap) -> Self {
        let (frame, _) = Cr3::read();
        Self {
            root: PhysicalAddress::new(frame.start_address().as_u64() as usize),
            direct_map,
        }
    }

    /// Loads this address space into CR3.
    ///
    /// # Safety
    ///
    /// The tables must map the running kernel.
    pub unsafe fn activate(&self) {
        let frame = PhysFrame::containing_address(PhysAddr::new(self.root.as_usize() as u64));
        // SAFETY: forwarded to the caller.
        unsafe { Cr3::write(frame, Cr3Flags::empty()) };
    }

    #[allow(clippy::mut_from_ref)]
    fn table(&self, phys: PhysicalAddress) -> &mut PageTable {
        // SAFETY: every table frame is reachable through the direct map and is only
        // touched while the owning space is locked.
        unsafe { &mut *self.direct_map.as_mut_ptr::<PageTable>(phys) }
    }

    fn entry_address(entry: &PageTableEntry) -> PhysicalAddress {
        PhysicalAddress::new(entry.addr().as_u64() as usize)
    }

    /// Returns the table behind `entry`, creating it when absent.
    fn next_table_or_create(
        &self,
        entry: &mut PageTableEntry,
        user: bool,
        frames: &mut dyn FrameAllocator,
    ) -> Result<PhysicalAddress, MapError> {
        if entry.is_unused() {
            let frame = frames.allocate_frame().ok_or(MapError::OutOfTables)?;
            self.table(frame).zero();
            let mut flags = PageTableFlags::PRESENT | PageTableFlags::WRITABLE;
            if user {
                flags |= PageTableFlags::USER_ACCESSIBLE;
            }
            entry.set_addr(PhysAddr::new(frame.as_usize() as u64), flags);
            return Ok(frame);
        }
        if entry.flags().contains(PageTableFlags::HUGE_PAGE) {
            return Err(MapError::Conflict);
        }
        if user && !entry.flags().contains(PageTableFlags::USER_ACCESSIBLE) {
            entry.set_flags(entry.flags() | PageTableFlags::USER_ACCESSIBLE);
        }
        Ok(Self::entry_address(entry))
    }

    /// Walks to the page directory covering `vaddr`.
    fn directory(&self, vaddr: usize, user: bool, frames: &mut dyn FrameAllocator) -> Result<PhysicalAddress, MapError> {
        let pml4 = self.table(self.root);
        let pdpt = self.next_table_or_create(&mut pml4[table_index(vaddr, 3)], user, frames)?;
        self.next_table_or_create(&mut self.table(pdpt)[table_index(vaddr, 2)], user, frames)
    }

    /// Walks to the page directory covering `vaddr` without creating anything.
    fn find_directory(&self, vaddr: usize) -> Option<PhysicalAddress> {
        let mut table = self.root;
        for level in [3, 2] {
            let entry = &self.table(table)[table_index(vaddr, level)];
            if entry.is_unused() || entry.flags().contains(PageTableFlags::HUGE_PAGE) {
                return None;
            }
            table = Self::entry_address(entry);
        }
        Some(table)
    }

    fn is_empty(&self, table: PhysicalAddress) -> bool {
        self.table(table).iter().all(|entry| entry.is_unused())
    }

    fn free_tables(&self, table: PhysicalAddress, level: usize, frames: &mut dyn FrameAllocator) {
        if level > 0 {
            for entry in self.table(table).iter() {
                if !entry.is_unused() && !entry.flags().contains(PageTableFlags::HUGE_PAGE) {
                    self.free_tables(Self::entry_address(entry), level - 1, frames);
                }
            }
        }
        frames.deallocate_frame(table);
    }
}

impl ArchMapper for X86Mapper {
    fn map(
        &mut self,
        vaddr: VirtualAddress,
        paddr: PhysicalAddress,
        flags: MapFlags,
        frames: &mut dyn FrameAllocator,
    ) -> Result<(), MapError> {
        let granule = flags.granule();
        if !vaddr.is_aligned(granule) || !paddr.is_aligned(granule) {
            return Err(MapError::Misaligned);
        }

        let user = flags.contains(MapFlags::USER);
        let va = vaddr.as_usize();
        let directory = self.directory(va, user, frames)?;
        let pd_entry = &mut self.table(directory)[table_index(va, 1)];

        if flags.contains(MapFlags::SUPERPAGE) {
            if !pd_entry.is_unused() && !pd_entry.flags().contains(PageTableFlags::HUGE_PAGE) {
                // A demoted superpage that has since been fully released leaves an empty
                // page table behind; anything else still in use is a conflict.
                let table = Self::entry_address(pd_entry);
                if !self.is_empty(table) {
                    return Err(MapError::Conflict);
                }
                frames.deallocate_frame(table);
            }
            pd_entry.set_addr(PhysAddr::new(paddr.as_usize() as u64), leaf_flags(flags));
        } else {
            let table = self.next_table_or_create(pd_entry, user, frames)?;
            self.table(table)[table_index(va, 0)]
                .set_addr(PhysAddr::new(paddr.as_usize() as u64), leaf_flags(flags));
        }

        tlb::flush(VirtAddr::new(va as u64));
        Ok(())
    }

    fn unmap(&mut self, vaddr: VirtualAddress, flags: MapFlags) -> Result<PhysicalAddress, MapError> {
        if !vaddr.is_aligned(flags.granule()) {
            return Err(MapError::Misaligned);
        }

        let va = vaddr.as_usize();
        let directory = self.find_directory(va).ok_or(MapError::NotMapped)?;
        let pd_entry = &mut self.table(directory)[table_index(va, 1)];
        if pd_entry.is_unused() {
            return Err(MapError::NotMapped);
        }

        let huge = pd_entry.flags().contains(PageTableFlags::HUGE_PAGE);
        let entry = match (flags.contains(MapFlags::SUPERPAGE), huge) {
            (true, true) => pd_entry,
            (false, false) => &mut self.table(Self::entry_address(pd_entry))[table_index(va, 0)],
            _ => return Err(MapError::Conflict),
        };
        if entry.is_unused() {
            return Err(MapError::NotMapped);
        }

        let paddr = Self::entry_address(entry);
        entry.set_unused();
        tlb::flush(VirtAddr::new(va as u64));
        Ok(paddr)
    }

    fn v2p(&self, vaddr: VirtualAddress) -> Option<PhysicalAddress> {
        let va = vaddr.as_usize();
        let pml4 = &self.table(self.root)[table_index(va, 3)];
        if pml4.is_unused() {
            return None;
        }
        let pdpt = &self.table(Self::entry_address(pml4))[table_index(va, 2)];
        if pdpt.is_unused() {
            return None;
        }
        if pdpt.flags().contains(PageTableFlags::HUGE_PAGE) {
            return Some(Self::entry_address(pdpt) + (va & ((1 << 30) - 1)));
        }
        let pd = &self.table(Self::entry_address(pdpt))[table_index(va, 1)];
        if pd.is_unused() {
            return None;
        }
        if pd.flags().contains(PageTableFlags::HUGE_PAGE) {
            return Some(Self::entry_address(pd) + (va & (super::SUPERPAGE_SIZE - 1)));
        }
        let pt = &self.table(Self::entry_address(pd))[table_index(va, 0)];
        if pt.is_unused() {
            return None;
        }
        Some(Self::entry_address(pt) + (va & (PAGE_SIZE - 1)))
    }

    fn addr_width(&self) -> u32 {
        MAX_VIRTUAL_BITS as u32
    }

    fn root(&self) -> PhysicalAddress {
        self.root
    }

    fn prepare_kernel_window(
        &mut self,
        start: VirtualAddress,
        end: usize,
        frames: &mut dyn FrameAllocator,
    ) -> Result<(), MapError> {
        let first = table_index(start.as_usize(), 3);
        if end <= start.as_usize() || first < KERNEL_PML4_START {
            return Err(MapError::Misaligned);
        }
        let pml4 = self.table(self.root);
        for index in first..=table_index(end - 1, 3) {
            self.next_table_or_create(&mut pml4[index], false, frames)?;
        }
        log::trace!("kernel window {}..{:#x} has its top-level tables", start, end);
        Ok(())
    }

    fn new_space(&self, root: PhysicalAddress) -> Self {
        let space = Self {
            root,
            direct_map: self.direct_map,
        };
        let source = self.table(self.root);
        let target = space.table(root);
        target.zero();
        for index in KERNEL_PML4_START..ENTRY_COUNT {
            target[index] = source[index].clone();
        }
        space
    }

    fn release(&mut self, frames: &mut dyn FrameAllocator) {
        for index in 0..KERNEL_PML4_START {
            let entry = &mut self.table(self.root)[index];
            if entry.is_unused() {
                continue;
            }
            self.free_tables(Self::entry_address(entry), 2, frames);
            entry.set_unused();
        }
        log::trace!("released user page tables of space {}", self.root);
    }
}

const _: () = assert!(table_index(0xFFFF_8000_0000_0000, 3) == KERNEL_PML4_START);
