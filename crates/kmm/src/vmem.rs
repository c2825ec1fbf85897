//! Virtual memory regions and address spaces.
//!
//! A [`VirtualMemorySpace`] owns a list of [`Region`]s, each a superpage-aligned window of
//! virtual addresses with two sets of buddy lists: one over its superpages and one over
//! the base pages of superpages that were demoted to page-granular tracking. Every piece
//! of bookkeeping lives in pool pages, so growing a space never calls back into the
//! allocator that is being grown.
//!
//! Nothing here maps memory. The space only hands out and takes back address ranges and
//! remembers which physical superpage backs a superpage; mapping is driven from `kmem`.

use core::mem;

use crate::arch::{
    ArchMapper, PAGE_MAX_ORDER, PAGE_SIZE, PAGES_PER_SUPERPAGE, SUPERPAGE_MAX_ORDER, SUPERPAGE_SIZE,
};
use crate::buddy::{BuddyBlocks, FreeLists, INVALID_INDEX, INVALID_ORDER, largest_order};
use crate::pool::{PagePool, PoolArray, PoolBox, pages_for};
use crate::{AllocError, ByteSize, PhysicalAddress, VirtualAddress};

type SuperpageLists = FreeLists<{ SUPERPAGE_MAX_ORDER as usize + 1 }>;
type PageLists = FreeLists<{ PAGE_MAX_ORDER as usize + 1 }>;

/// Buddy record of one base page of a demoted superpage.
///
/// The owning superpage is the array the record lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct VirtualPage {
    next: u32,
    order: u8,
    free: bool,
    _reserved: [u8; 2],
}

impl VirtualPage {
    const UNTRACKED: VirtualPage = VirtualPage {
        next: INVALID_INDEX,
        order: INVALID_ORDER,
        free: false,
        _reserved: [0; 2],
    };

    /// Order of the block the page belongs to.
    pub fn order(&self) -> Option<u8> {
        (self.order != INVALID_ORDER).then_some(self.order)
    }

    pub fn is_free(&self) -> bool {
        self.free
    }
}

/// Page records of one demoted superpage; exactly one pool page.
pub type PageArray = [VirtualPage; PAGES_PER_SUPERPAGE];

/// What a superpage currently stands for.
pub enum SuperpageState {
    /// The span is handled as one large translation, backed by `paddr` once mapped.
    Superpage { paddr: Option<PhysicalAddress> },
    /// The span is tracked page by page.
    DemotedPages { pages: PoolBox<PageArray> },
}

/// Buddy record of one superpage of a region.
pub struct Superpage {
    next: u32,
    order: u8,
    free: bool,
    /// Permanently owned by the metadata pool.
    pinned: bool,
    state: SuperpageState,
}

impl Superpage {
    fn new() -> Self {
        Self {
            next: INVALID_INDEX,
            order: INVALID_ORDER,
            free: false,
            pinned: false,
            state: SuperpageState::Superpage { paddr: None },
        }
    }

    /// Order of the block the superpage belongs to.
    pub fn order(&self) -> Option<u8> {
        (self.order != INVALID_ORDER).then_some(self.order)
    }

    pub fn is_free(&self) -> bool {
        self.free
    }

    pub fn is_pinned(&self) -> bool {
        self.pinned
    }

    pub fn is_demoted(&self) -> bool {
        matches!(self.state, SuperpageState::DemotedPages { .. })
    }

    /// Physical superpage backing a non-demoted superpage.
    pub fn paddr(&self) -> Option<PhysicalAddress> {
        match self.state {
            SuperpageState::Superpage { paddr } => paddr,
            SuperpageState::DemotedPages { .. } => None,
        }
    }

    /// Page records, if the superpage is demoted.
    pub fn pages(&self) -> Option<&PageArray> {
        match &self.state {
            SuperpageState::DemotedPages { pages } => Some(&**pages),
            SuperpageState::Superpage { .. } => None,
        }
    }

    fn pages_mut(&mut self) -> Option<&mut PageArray> {
        match &mut self.state {
            SuperpageState::DemotedPages { pages } => Some(&mut **pages),
            SuperpageState::Superpage { .. } => None,
        }
    }
}

impl BuddyBlocks for [Superpage] {
    fn len(&self) -> usize {
        <[Superpage]>::len(self)
    }

    fn order(&self, index: u32) -> u8 {
        self[index as usize].order
    }

    fn set_order(&mut self, index: u32, order: u8) {
        self[index as usize].order = order;
    }

    fn next(&self, index: u32) -> u32 {
        self[index as usize].next
    }

    fn set_next(&mut self, index: u32, next: u32) {
        self[index as usize].next = next;
    }

    fn is_free(&self, index: u32) -> bool {
        self[index as usize].free
    }

    fn set_free(&mut self, index: u32, free: bool) {
        self[index as usize].free = free;
    }

    fn same_pool(&self, _: u32, _: u32) -> bool {
        true
    }
}

/// Page-granular view of a region: unit `i` is page `i % 512` of superpage `i / 512`.
///
/// Pages of superpages that are not demoted read as untracked and are never buddies.
struct RegionPages<'a>(&'a mut [Superpage]);

impl RegionPages<'_> {
    fn page(&self, index: u32) -> Option<&VirtualPage> {
        let index = index as usize;
        self.0[index / PAGES_PER_SUPERPAGE]
            .pages()
            .map(|pages| &pages[index % PAGES_PER_SUPERPAGE])
    }

    fn page_mut(&mut self, index: u32) -> &mut VirtualPage {
        let index = index as usize;
        match self.0[index / PAGES_PER_SUPERPAGE].pages_mut() {
            Some(pages) => &mut pages[index % PAGES_PER_SUPERPAGE],
            None => unreachable!("page {} of a superpage that is not demoted", index),
        }
    }
}

impl BuddyBlocks for RegionPages<'_> {
    fn len(&self) -> usize {
        self.0.len() * PAGES_PER_SUPERPAGE
    }

    fn order(&self, index: u32) -> u8 {
        self.page(index).map_or(INVALID_ORDER, |page| page.order)
    }

    fn set_order(&mut self, index: u32, order: u8) {
        self.page_mut(index).order = order;
    }

    fn next(&self, index: u32) -> u32 {
        self.page(index).map_or(INVALID_INDEX, |page| page.next)
    }

    fn set_next(&mut self, index: u32, next: u32) {
        self.page_mut(index).next = next;
    }

    fn is_free(&self, index: u32) -> bool {
        self.page(index).is_some_and(|page| page.free)
    }

    fn set_free(&mut self, index: u32, free: bool) {
        self.page_mut(index).free = free;
    }

    fn same_pool(&self, a: u32, b: u32) -> bool {
        let (a, b) = (a as usize / PAGES_PER_SUPERPAGE, b as usize / PAGES_PER_SUPERPAGE);
        a == b && self.0[a].is_demoted()
    }
}

/// A live allocation found at an address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Allocation {
    /// `2^order` superpages.
    Superpages { order: u8 },
    /// `2^order` base pages inside one demoted superpage.
    Pages { order: u8 },
}

/// A contiguous window of virtual addresses with its own buddy lists.
pub struct Region {
    start: VirtualAddress,
    superpages: PoolArray<Superpage>,
    spages: SuperpageLists,
    pages: PageLists,
    next: Option<PoolBox<Region>>,
}

impl Region {
    /// Creates a region covering `[start, start + len)` with every superpage free.
    pub fn new(pool: &mut PagePool, start: VirtualAddress, len: usize) -> Result<PoolBox<Region>, AllocError> {
        if len == 0 || !start.is_aligned(SUPERPAGE_SIZE) || len % SUPERPAGE_SIZE != 0 {
            return Err(AllocError::Misaligned);
        }
        let count = len / SUPERPAGE_SIZE;
        if count * PAGES_PER_SUPERPAGE >= INVALID_INDEX as usize {
            return Err(AllocError::InvalidOrder);
        }

        let mut superpages = PoolArray::new(pool, count, |_| Superpage::new())?;
        let mut spages = SuperpageLists::new();
        let mut index = 0;
        while index < count {
            let order = largest_order(index, count - index, SUPERPAGE_MAX_ORDER);
            spages.insert(&mut *superpages, index as u32, order);
            index += 1 << order;
        }

        let region = Region {
            start,
            superpages,
            spages,
            pages: PageLists::new(),
            next: None,
        };
        match PoolBox::new(pool, region) {
            Ok(region) => {
                log::debug!("vmem: new region {}..{} ({})", start, start + len, ByteSize(len));
                Ok(region)
            }
            Err(region) => {
                region.superpages.release(pool);
                Err(AllocError::OutOfMemory)
            }
        }
    }

    /// Pool pages taken by the description of a region of `len` bytes.
    pub fn metadata_pages(len: usize) -> usize {
        pages_for(len / SUPERPAGE_SIZE * mem::size_of::<Superpage>()) + pages_for(mem::size_of::<Region>())
    }

    pub fn start(&self) -> VirtualAddress {
        self.start
    }

    /// Exclusive end of the region.
    pub fn end(&self) -> VirtualAddress {
        self.start + self.len()
    }

    /// Size of the region in bytes.
    pub fn len(&self) -> usize {
        self.superpages.len() * SUPERPAGE_SIZE
    }

    pub fn is_empty(&self) -> bool {
        self.superpages.is_empty()
    }

    pub fn contains(&self, vaddr: VirtualAddress) -> bool {
        vaddr >= self.start && vaddr < self.end()
    }

    /// Record of the superpage containing `vaddr`.
    pub fn superpage(&self, vaddr: VirtualAddress) -> Option<&Superpage> {
        self.contains(vaddr).then(|| &self.superpages[self.superpage_index(vaddr)])
    }

    /// Number of free superpages.
    pub fn free_superpages(&self) -> usize {
        self.spages.free_units(&*self.superpages)
    }

    /// Number of free base pages inside demoted superpages.
    pub fn free_pages(&self) -> usize {
        self.superpages
            .iter()
            .filter_map(Superpage::pages)
            .map(|pages| pages.iter().filter(|page| page.free).count())
            .sum()
    }

    /// Number of demoted superpages.
    pub fn demoted(&self) -> usize {
        self.superpages.iter().filter(|superpage| superpage.is_demoted()).count()
    }

    /// First free superpage block of `order`.
    pub fn superpage_head(&self, order: u8) -> Option<VirtualAddress> {
        self.spages
            .head(order)
            .map(|index| self.start + index as usize * SUPERPAGE_SIZE)
    }

    /// First free page block of `order`.
    pub fn page_head(&self, order: u8) -> Option<VirtualAddress> {
        self.pages.head(order).map(|index| self.start + index as usize * PAGE_SIZE)
    }

    /// Takes `2^order` contiguous superpages.
    pub fn grab_superpages(&mut self, order: u8) -> Result<VirtualAddress, AllocError> {
        let index = self.spages.alloc(&mut *self.superpages, order)?;
        Ok(self.start + index as usize * SUPERPAGE_SIZE)
    }

    /// Returns a superpage block; backing records of the block are cleared.
    pub fn release_superpages(&mut self, vaddr: VirtualAddress) -> Result<(), AllocError> {
        if !vaddr.is_aligned(SUPERPAGE_SIZE) {
            return Err(AllocError::Misaligned);
        }
        if !self.contains(vaddr) {
            return Err(AllocError::InvalidAddress);
        }
        let index = self.superpage_index(vaddr);
        let superpage = &self.superpages[index];
        if superpage.is_demoted() || superpage.pinned {
            return Err(AllocError::InvalidAddress);
        }

        let order = superpage.order;
        self.spages.free(&mut *self.superpages, index as u32)?;
        for superpage in &mut self.superpages[index..index + (1 << order)] {
            superpage.state = SuperpageState::Superpage { paddr: None };
        }
        Ok(())
    }

    /// Takes `2^order` contiguous base pages from demoted superpages.
    ///
    /// `OutOfMemory` means no demoted superpage has room; demote one and retry.
    pub fn grab_pages(&mut self, order: u8) -> Result<VirtualAddress, AllocError> {
        let index = self.pages.alloc(&mut RegionPages(&mut self.superpages), order)?;
        Ok(self.start + index as usize * PAGE_SIZE)
    }

    /// Turns a free superpage into 512 free pages and returns its address.
    ///
    /// The page array comes from `pool`.
    pub fn demote(&mut self, pool: &mut PagePool) -> Result<VirtualAddress, AllocError> {
        let array = PoolBox::new(pool, [VirtualPage::UNTRACKED; PAGES_PER_SUPERPAGE])
            .map_err(|_| AllocError::OutOfMemory)?;
        let index = match self.spages.alloc(&mut *self.superpages, 0) {
            Ok(index) => index,
            Err(error) => {
                array.release(pool);
                return Err(error);
            }
        };

        self.superpages[index as usize].state = SuperpageState::DemotedPages { pages: array };
        let first = index * PAGES_PER_SUPERPAGE as u32;
        self.pages.insert(&mut RegionPages(&mut self.superpages), first, PAGE_MAX_ORDER);

        let vaddr = self.start + index as usize * SUPERPAGE_SIZE;
        log::trace!("vmem: demoted superpage {}", vaddr);
        Ok(vaddr)
    }

    /// Returns a page block. A superpage whose pages are all free again is promoted back.
    pub fn release_pages(&mut self, vaddr: VirtualAddress, pool: &mut PagePool) -> Result<(), AllocError> {
        if !vaddr.is_aligned(PAGE_SIZE) {
            return Err(AllocError::Misaligned);
        }
        if !self.contains(vaddr) {
            return Err(AllocError::InvalidAddress);
        }
        if !self.superpages[self.superpage_index(vaddr)].is_demoted() {
            return Err(AllocError::InvalidAddress);
        }

        let index = ((vaddr - self.start) / PAGE_SIZE) as u32;
        let (block, order) = self.pages.free(&mut RegionPages(&mut self.superpages), index)?;
        if order == PAGE_MAX_ORDER {
            self.promote(block / PAGES_PER_SUPERPAGE as u32, pool)?;
        }
        Ok(())
    }

    /// Records the physical superpage backing the superpage at `vaddr`.
    pub fn set_backing(&mut self, vaddr: VirtualAddress, paddr: Option<PhysicalAddress>) {
        let index = self.superpage_index(vaddr);
        debug_assert!(!self.superpages[index].is_demoted());
        self.superpages[index].state = SuperpageState::Superpage { paddr };
    }

    /// Hands the allocated superpage at `vaddr` to the metadata pool for good.
    pub fn pin(&mut self, vaddr: VirtualAddress) {
        let index = self.superpage_index(vaddr);
        self.superpages[index].pinned = true;
    }

    /// Identifies the live allocation starting at `vaddr`.
    pub fn allocation_at(&self, vaddr: VirtualAddress) -> Option<Allocation> {
        if !self.contains(vaddr) || !vaddr.is_aligned(PAGE_SIZE) {
            return None;
        }
        let superpage = &self.superpages[self.superpage_index(vaddr)];
        match &superpage.state {
            SuperpageState::DemotedPages { pages } => {
                let offset = vaddr.as_usize() % SUPERPAGE_SIZE / PAGE_SIZE;
                let page = &pages[offset];
                let order = page.order()?;
                (!page.free && offset % (1 << order) == 0).then_some(Allocation::Pages { order })
            }
            SuperpageState::Superpage { .. } => {
                let order = superpage.order()?;
                let index = self.superpage_index(vaddr);
                let live = vaddr.is_aligned(SUPERPAGE_SIZE)
                    && !superpage.free
                    && !superpage.pinned
                    && index % (1 << order) == 0;
                live.then_some(Allocation::Superpages { order })
            }
        }
    }

    /// Walks every backed allocation, then returns all metadata of the region to `pool`.
    ///
    /// `backing` is called with the physical superpage of every backed superpage and with
    /// the virtual address of every allocated base page.
    fn release(mut self, pool: &mut PagePool, mut backing: impl FnMut(Backing)) {
        let start = self.start;
        for (index, superpage) in self.superpages.iter_mut().enumerate() {
            let base = start + index * SUPERPAGE_SIZE;
            match mem::replace(&mut superpage.state, SuperpageState::Superpage { paddr: None }) {
                SuperpageState::Superpage { paddr: Some(paddr) } if !superpage.pinned => {
                    backing(Backing::Superpage(paddr));
                }
                SuperpageState::Superpage { .. } => {}
                SuperpageState::DemotedPages { pages } => {
                    for (offset, page) in pages.iter().enumerate() {
                        if !page.free {
                            backing(Backing::Page(base + offset * PAGE_SIZE));
                        }
                    }
                    pages.release(pool);
                }
            }
        }
        self.superpages.release(pool);
    }

    fn promote(&mut self, index: u32, pool: &mut PagePool) -> Result<(), AllocError> {
        let first = index * PAGES_PER_SUPERPAGE as u32;
        self.pages.take(&mut RegionPages(&mut self.superpages), first, PAGE_MAX_ORDER);

        let superpage = &mut self.superpages[index as usize];
        let state = mem::replace(&mut superpage.state, SuperpageState::Superpage { paddr: None });
        if let SuperpageState::DemotedPages { pages } = state {
            pages.release(pool);
        }
        self.spages.free(&mut *self.superpages, index)?;
        log::trace!("vmem: promoted superpage {}", self.start + index as usize * SUPERPAGE_SIZE);
        Ok(())
    }

    fn superpage_index(&self, vaddr: VirtualAddress) -> usize {
        (vaddr - self.start) / SUPERPAGE_SIZE
    }
}

/// Memory still attached to a space being torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backing {
    /// A physical superpage.
    Superpage(PhysicalAddress),
    /// A mapped base page, by virtual address.
    Page(VirtualAddress),
}

/// An address space: regions plus the page tables that translate them.
pub struct VirtualMemorySpace<A> {
    regions: Option<PoolBox<Region>>,
    arch: A,
    limit: usize,
}

impl<A: ArchMapper> VirtualMemorySpace<A> {
    /// Creates a space without regions. No region may extend past `limit`.
    pub fn new(arch: A, limit: usize) -> Self {
        Self {
            regions: None,
            arch,
            limit,
        }
    }

    pub fn arch(&self) -> &A {
        &self.arch
    }

    pub fn arch_mut(&mut self) -> &mut A {
        &mut self.arch
    }

    /// Exclusive upper bound for region addresses.
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Regions in the order they are searched.
    pub fn regions(&self) -> impl Iterator<Item = &Region> {
        core::iter::successors(self.regions.as_deref(), |region| region.next.as_deref())
    }

    pub fn region_containing(&self, vaddr: VirtualAddress) -> Option<&Region> {
        self.regions().find(|region| region.contains(vaddr))
    }

    fn region_containing_mut(&mut self, vaddr: VirtualAddress) -> Option<&mut Region> {
        let mut cursor = self.regions.as_deref_mut();
        while let Some(region) = cursor {
            if region.contains(vaddr) {
                return Some(region);
            }
            cursor = region.next.as_deref_mut();
        }
        None
    }

    /// Appends a region covering `[start, start + len)`.
    pub fn add_region(&mut self, pool: &mut PagePool, start: VirtualAddress, len: usize) -> Result<(), AllocError> {
        let end = start.as_usize().checked_add(len).ok_or(AllocError::InvalidAddress)?;
        if end > self.limit {
            return Err(AllocError::InvalidAddress);
        }
        let overlaps = self
            .regions()
            .any(|region| start < region.end() && region.start().as_usize() < end);
        if overlaps {
            return Err(AllocError::InvalidAddress);
        }

        let region = Region::new(pool, start, len)?;
        append(&mut self.regions, region);
        Ok(())
    }

    /// Address right after the highest region, if a region of `size` still fits there.
    pub fn search_available_region(&self, size: usize) -> Option<VirtualAddress> {
        let end = self.regions().map(Region::end).max()?;
        let limit = end.as_usize().checked_add(size)?;
        (limit <= self.limit).then_some(end)
    }

    /// Takes `2^order` superpages from the first region that has them.
    pub fn grab_superpages(&mut self, order: u8) -> Result<VirtualAddress, AllocError> {
        if order > SUPERPAGE_MAX_ORDER {
            return Err(AllocError::InvalidOrder);
        }
        let mut cursor = self.regions.as_deref_mut();
        while let Some(region) = cursor {
            match region.grab_superpages(order) {
                Err(AllocError::OutOfMemory) => {}
                result => return result,
            }
            cursor = region.next.as_deref_mut();
        }
        Err(AllocError::OutOfMemory)
    }

    /// Takes `2^order` pages from the first region with a demoted superpage that has them.
    pub fn grab_pages(&mut self, order: u8) -> Result<VirtualAddress, AllocError> {
        if order > PAGE_MAX_ORDER {
            return Err(AllocError::InvalidOrder);
        }
        let mut cursor = self.regions.as_deref_mut();
        while let Some(region) = cursor {
            match region.grab_pages(order) {
                Err(AllocError::OutOfMemory) => {}
                result => return result,
            }
            cursor = region.next.as_deref_mut();
        }
        Err(AllocError::OutOfMemory)
    }

    /// Demotes a free superpage of the first region that has one.
    pub fn demote(&mut self, pool: &mut PagePool) -> Result<VirtualAddress, AllocError> {
        let mut cursor = self.regions.as_deref_mut();
        while let Some(region) = cursor {
            if region.free_superpages() > 0 {
                return region.demote(pool);
            }
            cursor = region.next.as_deref_mut();
        }
        Err(AllocError::OutOfMemory)
    }

    pub fn release_superpages(&mut self, vaddr: VirtualAddress) -> Result<(), AllocError> {
        self.region_containing_mut(vaddr)
            .ok_or(AllocError::InvalidAddress)?
            .release_superpages(vaddr)
    }

    pub fn release_pages(&mut self, vaddr: VirtualAddress, pool: &mut PagePool) -> Result<(), AllocError> {
        self.region_containing_mut(vaddr)
            .ok_or(AllocError::InvalidAddress)?
            .release_pages(vaddr, pool)
    }

    pub fn set_backing(&mut self, vaddr: VirtualAddress, paddr: Option<PhysicalAddress>) {
        if let Some(region) = self.region_containing_mut(vaddr) {
            region.set_backing(vaddr, paddr);
        }
    }

    pub fn pin(&mut self, vaddr: VirtualAddress) {
        if let Some(region) = self.region_containing_mut(vaddr) {
            region.pin(vaddr);
        }
    }

    pub fn allocation_at(&self, vaddr: VirtualAddress) -> Option<Allocation> {
        self.region_containing(vaddr)?.allocation_at(vaddr)
    }

    /// Number of free superpages across all regions.
    pub fn free_superpages(&self) -> usize {
        self.regions().map(Region::free_superpages).sum()
    }

    /// Removes every region, reporting each physical frame still backing an allocation.
    ///
    /// Base pages are resolved through the page tables, so this must run before they
    /// are released.
    pub fn release_all(&mut self, pool: &mut PagePool, mut release_frame: impl FnMut(PhysicalAddress)) {
        let arch = &self.arch;
        let mut cursor = self.regions.take();
        while let Some(region) = cursor {
            let mut region = region.into_inner(pool);
            cursor = region.next.take();
            region.release(pool, |backing| match backing {
                Backing::Superpage(paddr) => release_frame(paddr),
                Backing::Page(vaddr) => {
                    if let Some(paddr) = arch.v2p(vaddr) {
                        release_frame(paddr);
                    }
                }
            });
        }
    }
}

fn append(slot: &mut Option<PoolBox<Region>>, region: PoolBox<Region>) {
    match slot {
        Some(existing) => append(&mut existing.next, region),
        None => *slot = Some(region),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::SoftwareMapper;
    use crate::testing::HostArena;

    const REGION_START: usize = 0x4000_0000;

    fn pool(arena: &HostArena) -> PagePool {
        let mut pool = PagePool::new();
        unsafe { pool.donate(arena.start(), arena.len() / PAGE_SIZE) };
        pool
    }

    fn space() -> VirtualMemorySpace<SoftwareMapper> {
        VirtualMemorySpace::new(SoftwareMapper::new(PhysicalAddress::new(0x1000)), 1 << 47)
    }

    fn at(superpages: usize) -> VirtualAddress {
        VirtualAddress::new(REGION_START + superpages * SUPERPAGE_SIZE)
    }

    #[test]
    fn records_are_compact() {
        assert_eq!(mem::size_of::<VirtualPage>(), 8);
        assert_eq!(mem::size_of::<PageArray>(), PAGE_SIZE);
    }

    #[test]
    fn new_region_is_carved_into_aligned_blocks() {
        let arena = HostArena::new(16 * PAGE_SIZE);
        let mut pool = pool(&arena);
        let region = Region::new(&mut pool, at(0), 6 * SUPERPAGE_SIZE).unwrap();

        assert_eq!(region.free_superpages(), 6);
        assert_eq!(region.superpage_head(2), Some(at(0)));
        assert_eq!(region.superpage_head(1), Some(at(4)));
        assert_eq!(region.superpage_head(0), None);
        assert_eq!(region.len(), 6 * SUPERPAGE_SIZE);
    }

    #[test]
    fn rejects_unaligned_regions() {
        let arena = HostArena::new(16 * PAGE_SIZE);
        let mut pool = pool(&arena);
        assert!(matches!(
            Region::new(&mut pool, VirtualAddress::new(REGION_START + PAGE_SIZE), SUPERPAGE_SIZE),
            Err(AllocError::Misaligned)
        ));
        assert!(matches!(
            Region::new(&mut pool, at(0), SUPERPAGE_SIZE + PAGE_SIZE),
            Err(AllocError::Misaligned)
        ));
    }

    #[test]
    fn superpage_split_and_merge() {
        let arena = HostArena::new(16 * PAGE_SIZE);
        let mut pool = pool(&arena);
        let mut region = Region::new(&mut pool, at(0), 8 * SUPERPAGE_SIZE).unwrap();

        assert_eq!(region.grab_superpages(1), Ok(at(0)));
        assert_eq!(region.superpage_head(2), Some(at(4)));
        assert_eq!(region.superpage_head(1), Some(at(2)));
        assert_eq!(region.allocation_at(at(0)), Some(Allocation::Superpages { order: 1 }));
        assert_eq!(region.allocation_at(at(1)), None);

        region.release_superpages(at(0)).unwrap();
        assert_eq!(region.superpage_head(3), Some(at(0)));
        assert_eq!(region.free_superpages(), 8);
        assert_eq!(region.release_superpages(at(0)), Err(AllocError::InvalidAddress));
    }

    #[test]
    fn pages_require_a_demoted_superpage() {
        let arena = HostArena::new(16 * PAGE_SIZE);
        let mut pool = pool(&arena);
        let mut region = Region::new(&mut pool, at(0), 2 * SUPERPAGE_SIZE).unwrap();

        assert_eq!(region.grab_pages(0), Err(AllocError::OutOfMemory));
        let free_pool = pool.free_pages();

        let demoted = region.demote(&mut pool).unwrap();
        assert_eq!(demoted, at(0));
        assert_eq!(pool.free_pages(), free_pool - 1);
        assert!(region.superpage(demoted).unwrap().is_demoted());
        assert_eq!(region.free_pages(), PAGES_PER_SUPERPAGE);

        let page = region.grab_pages(3).unwrap();
        assert_eq!(page, at(0));
        assert_eq!(region.allocation_at(page), Some(Allocation::Pages { order: 3 }));
        assert_eq!(region.page_head(3), Some(at(0) + 8 * PAGE_SIZE));
        assert_eq!(region.free_pages(), PAGES_PER_SUPERPAGE - 8);
    }

    #[test]
    fn fully_released_superpage_is_promoted() {
        let arena = HostArena::new(16 * PAGE_SIZE);
        let mut pool = pool(&arena);
        let mut region = Region::new(&mut pool, at(0), 2 * SUPERPAGE_SIZE).unwrap();
        let free_pool = pool.free_pages();

        region.demote(&mut pool).unwrap();
        let a = region.grab_pages(0).unwrap();
        let b = region.grab_pages(4).unwrap();
        assert_eq!(region.free_superpages(), 1);

        region.release_pages(a, &mut pool).unwrap();
        assert_eq!(region.demoted(), 1);
        region.release_pages(b, &mut pool).unwrap();

        assert_eq!(region.demoted(), 0);
        assert_eq!(region.free_superpages(), 2);
        assert_eq!(region.superpage_head(1), Some(at(0)));
        assert_eq!(region.page_head(PAGE_MAX_ORDER), None);
        assert_eq!(pool.free_pages(), free_pool);
    }

    #[test]
    fn rejects_bad_page_releases() {
        let arena = HostArena::new(16 * PAGE_SIZE);
        let mut pool = pool(&arena);
        let mut region = Region::new(&mut pool, at(0), 2 * SUPERPAGE_SIZE).unwrap();
        region.demote(&mut pool).unwrap();
        let page = region.grab_pages(1).unwrap();

        assert_eq!(region.release_pages(page + 8, &mut pool), Err(AllocError::Misaligned));
        assert_eq!(region.release_pages(page + PAGE_SIZE, &mut pool), Err(AllocError::Misaligned));
        assert_eq!(region.release_pages(at(1), &mut pool), Err(AllocError::InvalidAddress));
        assert_eq!(region.release_pages(at(2), &mut pool), Err(AllocError::InvalidAddress));
        region.release_pages(page, &mut pool).unwrap();
        assert_eq!(region.release_pages(page, &mut pool), Err(AllocError::InvalidAddress));
    }

    #[test]
    fn demotion_fails_without_pool_pages() {
        let arena = HostArena::new(2 * PAGE_SIZE);
        let mut pool = pool(&arena);
        let mut region = Region::new(&mut pool, at(0), 2 * SUPERPAGE_SIZE).unwrap();
        assert_eq!(pool.free_pages(), 0);

        assert_eq!(region.demote(&mut pool), Err(AllocError::OutOfMemory));
        assert_eq!(region.free_superpages(), 2);
    }

    #[test]
    fn space_walks_regions_in_order() {
        let arena = HostArena::new(16 * PAGE_SIZE);
        let mut pool = pool(&arena);
        let mut space = space();
        space.add_region(&mut pool, at(0), SUPERPAGE_SIZE).unwrap();
        space.add_region(&mut pool, at(8), 4 * SUPERPAGE_SIZE).unwrap();

        assert_eq!(space.grab_superpages(0), Ok(at(0)));
        assert_eq!(space.grab_superpages(0), Ok(at(8)));
        assert_eq!(space.grab_superpages(1), Ok(at(10)));
        assert_eq!(space.grab_superpages(2), Err(AllocError::OutOfMemory));
        assert_eq!(space.grab_superpages(SUPERPAGE_MAX_ORDER + 1), Err(AllocError::InvalidOrder));
        assert_eq!(space.regions().count(), 2);
        assert_eq!(space.free_superpages(), 1);
    }

    #[test]
    fn space_rejects_overlapping_regions() {
        let arena = HostArena::new(16 * PAGE_SIZE);
        let mut pool = pool(&arena);
        let mut space = space();
        space.add_region(&mut pool, at(4), 4 * SUPERPAGE_SIZE).unwrap();

        assert_eq!(space.add_region(&mut pool, at(6), SUPERPAGE_SIZE), Err(AllocError::InvalidAddress));
        assert_eq!(space.add_region(&mut pool, at(0), 5 * SUPERPAGE_SIZE), Err(AllocError::InvalidAddress));
        space.add_region(&mut pool, at(0), 4 * SUPERPAGE_SIZE).unwrap();
    }

    #[test]
    fn searches_past_the_highest_region() {
        let arena = HostArena::new(16 * PAGE_SIZE);
        let mut pool = pool(&arena);
        let limit = REGION_START + 16 * SUPERPAGE_SIZE;
        let mut space = VirtualMemorySpace::new(SoftwareMapper::new(PhysicalAddress::new(0x1000)), limit);

        assert_eq!(space.search_available_region(SUPERPAGE_SIZE), None);
        space.add_region(&mut pool, at(8), 4 * SUPERPAGE_SIZE).unwrap();
        space.add_region(&mut pool, at(0), 2 * SUPERPAGE_SIZE).unwrap();

        assert_eq!(space.search_available_region(4 * SUPERPAGE_SIZE), Some(at(12)));
        assert_eq!(space.search_available_region(5 * SUPERPAGE_SIZE), None);
        assert_eq!(space.add_region(&mut pool, at(12), 8 * SUPERPAGE_SIZE), Err(AllocError::InvalidAddress));
    }

    #[test]
    fn space_demotes_in_the_first_region_with_room() {
        let arena = HostArena::new(16 * PAGE_SIZE);
        let mut pool = pool(&arena);
        let mut space = space();
        space.add_region(&mut pool, at(0), SUPERPAGE_SIZE).unwrap();
        space.add_region(&mut pool, at(4), SUPERPAGE_SIZE).unwrap();
        space.grab_superpages(0).unwrap();

        assert_eq!(space.grab_pages(0), Err(AllocError::OutOfMemory));
        assert_eq!(space.demote(&mut pool), Ok(at(4)));
        assert_eq!(space.grab_pages(0), Ok(at(4)));
        assert_eq!(space.demote(&mut pool), Err(AllocError::OutOfMemory));
    }

    #[test]
    fn release_all_reports_backing_and_returns_metadata() {
        let arena = HostArena::new(16 * PAGE_SIZE);
        let mut pool = pool(&arena);
        let free_pool = pool.free_pages();
        let mut space = space();
        space.add_region(&mut pool, at(0), 4 * SUPERPAGE_SIZE).unwrap();

        let backed = space.grab_superpages(0).unwrap();
        space.set_backing(backed, Some(PhysicalAddress::new(0x4000_0000)));
        let pinned = space.grab_superpages(0).unwrap();
        space.set_backing(pinned, Some(PhysicalAddress::new(0x4020_0000)));
        space.pin(pinned);
        assert_eq!(space.allocation_at(pinned), None);

        space.demote(&mut pool).unwrap();
        let page = space.grab_pages(0).unwrap();
        let mut frames = crate::testing::SequentialFrames::new();
        space
            .arch_mut()
            .map(page, PhysicalAddress::new(0x10_0000), crate::arch::MapFlags::USABLE, &mut frames)
            .unwrap();

        let mut released = alloc::vec::Vec::new();
        space.release_all(&mut pool, |paddr| released.push(paddr));

        assert_eq!(released, [PhysicalAddress::new(0x4000_0000), PhysicalAddress::new(0x10_0000)]);
        assert_eq!(space.regions().count(), 0);
        assert_eq!(pool.free_pages(), free_pool);
    }
}
