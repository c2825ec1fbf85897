//! Kernel memory.
//!
//! [`Kmem`] ties the kernel's virtual memory space, the metadata pool and the slab
//! allocator together and turns "give me `n` pages" into virtual allocation, physical
//! allocation and page-table mapping. [`KernelMemory`] puts it behind a lock together with
//! the physical memory manager and is what the rest of the kernel talks to.
//!
//! Two granularities are served:
//!
//! - Requests of at least one superpage take `2^k` virtual superpages, each backed by its
//!   own physical superpage and mapped with a single large translation.
//! - Smaller requests take `2^k` base pages from a demoted superpage, each backed by its
//!   own physical frame.
//!
//! A composite allocation that fails halfway is unwound completely before the error is
//! returned: the virtual block goes back first, then every mapping and frame acquired so
//! far.

use core::ptr::{self, NonNull};

use spin::Mutex;

use crate::arch::{ArchMapper, MapFlags, PAGE_SIZE, PAGES_PER_SUPERPAGE, SUPERPAGE_ORDER, SUPERPAGE_SIZE};
use crate::pool::PagePool;
use crate::slab::{PageSource, Slab};
use crate::vmem::{Allocation, Region, VirtualMemorySpace};
use crate::{AllocError, ByteSize, PhysicalAddress, PhysicalMemoryManager, VirtualAddress, Zone};

/// Runtime parameters of kernel memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KmemConfig {
    /// Start of the first kernel heap region.
    pub region_start: VirtualAddress,
    /// Size of the first region and of every region added when the heap grows.
    pub region_size: usize,
    /// Exclusive upper bound of the kernel heap window.
    pub region_limit: usize,
    /// The pool is refilled whenever it holds fewer free pages than this.
    pub pool_reserve: usize,
    /// Start of the region every process space begins with.
    pub user_region_start: VirtualAddress,
    /// Size of process regions.
    pub user_region_size: usize,
    /// Zone backing heap and process memory.
    pub zone: Zone,
}

impl Default for KmemConfig {
    fn default() -> Self {
        Self {
            region_start: VirtualAddress::new(0xFFFF_C000_0000_0000),
            region_size: 1 << 30,
            region_limit: 0xFFFF_E000_0000_0000,
            pool_reserve: 16,
            user_region_start: VirtualAddress::new(0x4000_0000),
            user_region_size: 1 << 30,
            zone: Zone::Low,
        }
    }
}

/// How allocations of one space are backed and mapped.
#[derive(Debug, Clone, Copy)]
struct Placement {
    /// Base-page flags; superpages add [`MapFlags::SUPERPAGE`].
    flags: MapFlags,
    zone: Zone,
    region_size: usize,
}

impl Placement {
    fn kernel(config: &KmemConfig) -> Self {
        Self {
            flags: MapFlags::KERNEL_PAGE,
            zone: config.zone,
            region_size: config.region_size,
        }
    }

    fn user(config: &KmemConfig) -> Self {
        Self {
            flags: MapFlags::USER_PAGE,
            zone: config.zone,
            region_size: config.user_region_size,
        }
    }
}

/// Smallest order whose block holds `count` units.
fn order_for(count: usize) -> Result<u8, AllocError> {
    let count = count.checked_next_power_of_two().ok_or(AllocError::InvalidOrder)?;
    Ok(count.trailing_zeros() as u8)
}

/// Allocates `pages` mapped pages in `space`.
fn alloc_in_space<A: ArchMapper>(
    space: &mut VirtualMemorySpace<A>,
    pool: &mut PagePool,
    pmem: &mut PhysicalMemoryManager,
    placement: Placement,
    pages: usize,
) -> Result<VirtualAddress, AllocError> {
    if pages == 0 {
        return Err(AllocError::InvalidOrder);
    }
    if pages >= PAGES_PER_SUPERPAGE {
        let order = order_for(pages.div_ceil(PAGES_PER_SUPERPAGE))?;
        alloc_superpages(space, pool, pmem, placement, order)
    } else {
        alloc_pages(space, pool, pmem, placement, order_for(pages)?)
    }
}

fn alloc_superpages<A: ArchMapper>(
    space: &mut VirtualMemorySpace<A>,
    pool: &mut PagePool,
    pmem: &mut PhysicalMemoryManager,
    placement: Placement,
    order: u8,
) -> Result<VirtualAddress, AllocError> {
    let count = 1usize << order;
    let vaddr = match space.grab_superpages(order) {
        Err(AllocError::OutOfMemory) => {
            grow(space, pool, placement.region_size, count * SUPERPAGE_SIZE)?;
            space.grab_superpages(order)?
        }
        result => result?,
    };

    let flags = placement.flags | MapFlags::SUPERPAGE;
    for index in 0..count {
        let unit = vaddr + index * SUPERPAGE_SIZE;
        match back(space, pmem, unit, flags, placement.zone) {
            Ok(paddr) => space.set_backing(unit, Some(paddr)),
            Err(error) => {
                log::warn!("kmem: superpage {} of {} at {} failed ({}), rolling back", index, count, vaddr, error);
                if let Err(error) = space.release_superpages(vaddr) {
                    log::error!("kmem: cannot return superpages at {}: {}", vaddr, error);
                }
                unmap_range(space, pmem, vaddr, index, flags);
                return Err(error);
            }
        }
    }
    Ok(vaddr)
}

fn alloc_pages<A: ArchMapper>(
    space: &mut VirtualMemorySpace<A>,
    pool: &mut PagePool,
    pmem: &mut PhysicalMemoryManager,
    placement: Placement,
    order: u8,
) -> Result<VirtualAddress, AllocError> {
    let vaddr = match space.grab_pages(order) {
        Err(AllocError::OutOfMemory) => {
            demote(space, pool, placement.region_size)?;
            space.grab_pages(order)?
        }
        result => result?,
    };

    let count = 1usize << order;
    for index in 0..count {
        let page = vaddr + index * PAGE_SIZE;
        if let Err(error) = back(space, pmem, page, placement.flags, placement.zone) {
            log::warn!("kmem: page {} of {} at {} failed ({}), rolling back", index, count, vaddr, error);
            if let Err(error) = space.release_pages(vaddr, pool) {
                log::error!("kmem: cannot return pages at {}: {}", vaddr, error);
            }
            unmap_range(space, pmem, vaddr, index, placement.flags);
            return Err(error);
        }
    }
    Ok(vaddr)
}

/// Backs the unit at `vaddr` with a fresh block of its granule and maps it.
fn back<A: ArchMapper>(
    space: &mut VirtualMemorySpace<A>,
    pmem: &mut PhysicalMemoryManager,
    vaddr: VirtualAddress,
    flags: MapFlags,
    zone: Zone,
) -> Result<PhysicalAddress, AllocError> {
    let order = if flags.contains(MapFlags::SUPERPAGE) { SUPERPAGE_ORDER } else { 0 };
    let paddr = pmem.alloc_pages(zone, order)?;
    if let Err(error) = space.arch_mut().map(vaddr, paddr, flags, pmem) {
        free_frame(pmem, paddr);
        return Err(error.into());
    }
    Ok(paddr)
}

/// Demotes a superpage, adding a region first when none is left.
fn demote<A: ArchMapper>(
    space: &mut VirtualMemorySpace<A>,
    pool: &mut PagePool,
    region_size: usize,
) -> Result<VirtualAddress, AllocError> {
    match space.demote(pool) {
        Err(AllocError::OutOfMemory) if space.free_superpages() == 0 => {
            grow(space, pool, region_size, SUPERPAGE_SIZE)?;
            space.demote(pool)
        }
        result => result,
    }
}

/// Adds a region of at least `needed` bytes after the highest existing one.
fn grow<A: ArchMapper>(
    space: &mut VirtualMemorySpace<A>,
    pool: &mut PagePool,
    region_size: usize,
    needed: usize,
) -> Result<(), AllocError> {
    let len = region_size.max(needed).next_multiple_of(SUPERPAGE_SIZE);
    let start = space.search_available_region(len).ok_or(AllocError::OutOfMemory)?;
    space.add_region(pool, start, len)?;
    log::debug!("kmem: space grown by {} at {}", ByteSize(len), start);
    Ok(())
}

/// Unmaps `count` units starting at `vaddr` and frees their frames.
fn unmap_range<A: ArchMapper>(
    space: &mut VirtualMemorySpace<A>,
    pmem: &mut PhysicalMemoryManager,
    vaddr: VirtualAddress,
    count: usize,
    flags: MapFlags,
) {
    for index in 0..count {
        let unit = vaddr + index * flags.granule();
        match space.arch_mut().unmap(unit, flags) {
            Ok(paddr) => free_frame(pmem, paddr),
            Err(error) => log::error!("kmem: cannot unmap {}: {}", unit, error),
        }
    }
}

fn free_frame(pmem: &mut PhysicalMemoryManager, paddr: PhysicalAddress) {
    if let Err(error) = pmem.free_pages(paddr) {
        log::error!("kmem: cannot free frame {}: {}", paddr, error);
    }
}

/// Releases the allocation starting at `vaddr`, mappings and backing included.
fn free_in_space<A: ArchMapper>(
    space: &mut VirtualMemorySpace<A>,
    pool: &mut PagePool,
    pmem: &mut PhysicalMemoryManager,
    vaddr: VirtualAddress,
    flags: MapFlags,
) -> Result<(), AllocError> {
    match space.allocation_at(vaddr).ok_or(AllocError::InvalidAddress)? {
        Allocation::Superpages { order } => {
            space.release_superpages(vaddr)?;
            unmap_range(space, pmem, vaddr, 1 << order, flags | MapFlags::SUPERPAGE);
        }
        Allocation::Pages { order } => {
            space.release_pages(vaddr, pool)?;
            unmap_range(space, pmem, vaddr, 1 << order, flags);
        }
    }
    Ok(())
}

/// Pages handed to the slab allocator come from the kernel heap.
struct HeapPages<'a, A> {
    space: &'a mut VirtualMemorySpace<A>,
    pool: &'a mut PagePool,
    pmem: &'a mut PhysicalMemoryManager,
    placement: Placement,
}

impl<A: ArchMapper> PageSource for HeapPages<'_, A> {
    fn alloc_pages(&mut self, pages: usize) -> Result<VirtualAddress, AllocError> {
        alloc_in_space(self.space, self.pool, self.pmem, self.placement, pages)
    }

    fn free_pages(&mut self, vaddr: VirtualAddress) -> Result<(), AllocError> {
        free_in_space(self.space, self.pool, self.pmem, vaddr, self.placement.flags)
    }
}

/// The address space of a process.
pub struct ProcessSpace<A> {
    space: VirtualMemorySpace<A>,
    /// Kernel page holding the root table.
    root: VirtualAddress,
}

impl<A: ArchMapper> ProcessSpace<A> {
    pub fn space(&self) -> &VirtualMemorySpace<A> {
        &self.space
    }

    /// Physical address of the root table.
    pub fn root(&self) -> PhysicalAddress {
        self.space.arch().root()
    }
}

/// The kernel's heap space, metadata pool and slabs.
pub struct Kmem<A> {
    space: VirtualMemorySpace<A>,
    pool: PagePool,
    slab: Slab,
    config: KmemConfig,
}

impl<A: ArchMapper> Kmem<A> {
    /// Builds kernel memory on top of the boot address space `arch`.
    ///
    /// The metadata pool starts out with `pages` pages at `bootstrap`; the first heap
    /// region is described with them and the pool is then refilled from the heap.
    ///
    /// # Safety
    ///
    /// `[bootstrap, bootstrap + pages * PAGE_SIZE)` must be mapped, writable and unused,
    /// and must stay that way for the lifetime of the returned value.
    pub unsafe fn new(
        arch: A,
        bootstrap: VirtualAddress,
        pages: usize,
        config: KmemConfig,
        pmem: &mut PhysicalMemoryManager,
    ) -> Result<Self, AllocError> {
        let mut config = config;
        let metadata = Region::metadata_pages(config.region_size) + 1;
        if config.pool_reserve < metadata {
            log::warn!(
                "kmem: pool reserve of {} pages cannot describe a region, raising it to {}",
                config.pool_reserve,
                metadata
            );
            config.pool_reserve = metadata;
        }

        let mut pool = PagePool::new();
        unsafe { pool.donate(bootstrap, pages) };

        let mut space = VirtualMemorySpace::new(arch, config.region_limit);
        space
            .arch_mut()
            .prepare_kernel_window(config.region_start, config.region_limit, pmem)?;
        space.add_region(&mut pool, config.region_start, config.region_size)?;

        let mut kmem = Self {
            space,
            pool,
            slab: Slab::new(),
            config,
        };
        kmem.replenish(pmem)?;
        log::info!(
            "kmem: heap at {} ({}), {} pool pages",
            config.region_start,
            ByteSize(config.region_size),
            kmem.pool.free_pages()
        );
        Ok(kmem)
    }

    pub fn space(&self) -> &VirtualMemorySpace<A> {
        &self.space
    }

    pub fn pool(&self) -> &PagePool {
        &self.pool
    }

    pub fn slab(&self) -> &Slab {
        &self.slab
    }

    pub fn config(&self) -> &KmemConfig {
        &self.config
    }

    /// Tops the pool up to the reserve with pinned heap superpages.
    pub fn replenish(&mut self, pmem: &mut PhysicalMemoryManager) -> Result<(), AllocError> {
        let placement = Placement::kernel(&self.config);
        while self.pool.free_pages() < self.config.pool_reserve {
            let vaddr = alloc_superpages(&mut self.space, &mut self.pool, pmem, placement, 0)?;
            self.space.pin(vaddr);
            unsafe { self.pool.donate(vaddr, PAGES_PER_SUPERPAGE) };
            log::debug!("kmem: pool refilled from {}, {} pages free", vaddr, self.pool.free_pages());
        }
        Ok(())
    }

    /// Refills the pool, leaving any failure to the allocation that follows.
    fn refill(&mut self, pmem: &mut PhysicalMemoryManager) {
        if let Err(error) = self.replenish(pmem) {
            log::warn!("kmem: pool refill failed: {}", error);
        }
    }

    /// Allocates `pages` mapped kernel pages.
    pub fn alloc_pages(&mut self, pmem: &mut PhysicalMemoryManager, pages: usize) -> Result<VirtualAddress, AllocError> {
        self.refill(pmem);
        let placement = Placement::kernel(&self.config);
        alloc_in_space(&mut self.space, &mut self.pool, pmem, placement, pages)
    }

    /// Releases pages obtained from [`Kmem::alloc_pages`].
    pub fn free_pages(&mut self, pmem: &mut PhysicalMemoryManager, vaddr: VirtualAddress) -> Result<(), AllocError> {
        free_in_space(&mut self.space, &mut self.pool, pmem, vaddr, MapFlags::KERNEL_PAGE)
    }

    /// Allocates `size` bytes of kernel memory.
    pub fn kmalloc(&mut self, pmem: &mut PhysicalMemoryManager, size: usize) -> Option<NonNull<u8>> {
        self.refill(pmem);
        let placement = Placement::kernel(&self.config);
        let mut source = HeapPages {
            space: &mut self.space,
            pool: &mut self.pool,
            pmem,
            placement,
        };
        self.slab.alloc(size, &mut source)
    }

    /// Releases memory obtained from [`Kmem::kmalloc`].
    ///
    /// # Safety
    ///
    /// `ptr` must not be used after this call.
    pub unsafe fn kfree(&mut self, pmem: &mut PhysicalMemoryManager, ptr: NonNull<u8>) {
        let placement = Placement::kernel(&self.config);
        let mut source = HeapPages {
            space: &mut self.space,
            pool: &mut self.pool,
            pmem,
            placement,
        };
        unsafe { self.slab.free(ptr, &mut source) };
    }

    /// Creates a process space sharing the kernel's global translations.
    pub fn create_space(&mut self, pmem: &mut PhysicalMemoryManager) -> Result<ProcessSpace<A>, AllocError> {
        let root = self.alloc_pages(pmem, 1)?;
        unsafe { ptr::write_bytes(root.as_mut_ptr::<u8>(), 0, PAGE_SIZE) };
        match self.build_space(root) {
            Ok(space) => {
                log::debug!("kmem: created space with root {}", space.root());
                Ok(space)
            }
            Err(error) => {
                if let Err(error) = self.free_pages(pmem, root) {
                    log::error!("kmem: cannot free root page {}: {}", root, error);
                }
                Err(error)
            }
        }
    }

    fn build_space(&mut self, root: VirtualAddress) -> Result<ProcessSpace<A>, AllocError> {
        let root_phys = self.space.arch().v2p(root).ok_or(AllocError::InvalidAddress)?;
        let arch = self.space.arch().new_space(root_phys);
        let limit = 1usize << (arch.addr_width() - 1);
        let mut space = VirtualMemorySpace::new(arch, limit);
        space.add_region(&mut self.pool, self.config.user_region_start, self.config.user_region_size)?;
        Ok(ProcessSpace { space, root })
    }

    /// Tears a process space down: its memory, its metadata, its page tables and its root.
    pub fn delete_space(&mut self, pmem: &mut PhysicalMemoryManager, mut space: ProcessSpace<A>) {
        let root = space.root();
        space.space.release_all(&mut self.pool, |paddr| free_frame(pmem, paddr));
        space.space.arch_mut().release(pmem);
        if let Err(error) = self.free_pages(pmem, space.root) {
            log::error!("kmem: cannot free root page {}: {}", space.root, error);
        }
        log::debug!("kmem: deleted space with root {}", root);
    }

    /// Allocates `pages` user pages in `space`.
    pub fn alloc_space_pages(
        &mut self,
        pmem: &mut PhysicalMemoryManager,
        space: &mut ProcessSpace<A>,
        pages: usize,
    ) -> Result<VirtualAddress, AllocError> {
        self.refill(pmem);
        let placement = Placement::user(&self.config);
        alloc_in_space(&mut space.space, &mut self.pool, pmem, placement, pages)
    }

    /// Releases pages obtained from [`Kmem::alloc_space_pages`].
    pub fn free_space_pages(
        &mut self,
        pmem: &mut PhysicalMemoryManager,
        space: &mut ProcessSpace<A>,
        vaddr: VirtualAddress,
    ) -> Result<(), AllocError> {
        free_in_space(&mut space.space, &mut self.pool, pmem, vaddr, MapFlags::USER_PAGE)
    }
}

/// Kernel memory context: the two allocator locks and every entry point.
///
/// Locks are always taken kmem first, then pmem.
pub struct KernelMemory<A> {
    kmem: Mutex<Kmem<A>>,
    pmem: Mutex<PhysicalMemoryManager>,
}

impl<A: ArchMapper> KernelMemory<A> {
    /// See [`Kmem::new`].
    ///
    /// # Safety
    ///
    /// Same contract as [`Kmem::new`] for the bootstrap pages.
    pub unsafe fn new(
        arch: A,
        bootstrap: VirtualAddress,
        pages: usize,
        config: KmemConfig,
        mut pmem: PhysicalMemoryManager,
    ) -> Result<Self, AllocError> {
        let kmem = unsafe { Kmem::new(arch, bootstrap, pages, config, &mut pmem)? };
        Ok(Self {
            kmem: Mutex::new(kmem),
            pmem: Mutex::new(pmem),
        })
    }

    pub fn kmalloc(&self, size: usize) -> Option<NonNull<u8>> {
        let mut kmem = self.kmem.lock();
        kmem.kmalloc(&mut self.pmem.lock(), size)
    }

    /// # Safety
    ///
    /// `ptr` must come from [`KernelMemory::kmalloc`] and must not be used afterwards.
    pub unsafe fn kfree(&self, ptr: NonNull<u8>) {
        let mut kmem = self.kmem.lock();
        unsafe { kmem.kfree(&mut self.pmem.lock(), ptr) };
    }

    pub fn alloc_pages(&self, pages: usize) -> Option<VirtualAddress> {
        let mut kmem = self.kmem.lock();
        kmem.alloc_pages(&mut self.pmem.lock(), pages).ok()
    }

    pub fn free_pages(&self, vaddr: VirtualAddress) -> Result<(), AllocError> {
        let mut kmem = self.kmem.lock();
        kmem.free_pages(&mut self.pmem.lock(), vaddr)
    }

    pub fn alloc_physical(&self, zone: Zone, order: u8) -> Option<PhysicalAddress> {
        self.pmem.lock().alloc_pages(zone, order).ok()
    }

    pub fn alloc_physical_page(&self, zone: Zone) -> Option<PhysicalAddress> {
        self.pmem.lock().alloc_page(zone).ok()
    }

    pub fn alloc_physical_superpage(&self, zone: Zone) -> Option<PhysicalAddress> {
        self.pmem.lock().alloc_superpage(zone).ok()
    }

    pub fn free_physical(&self, paddr: PhysicalAddress) -> Result<(), AllocError> {
        self.pmem.lock().free_pages(paddr)
    }

    pub fn create_space(&self) -> Option<ProcessSpace<A>> {
        let mut kmem = self.kmem.lock();
        kmem.create_space(&mut self.pmem.lock()).ok()
    }

    pub fn delete_space(&self, space: ProcessSpace<A>) {
        let mut kmem = self.kmem.lock();
        kmem.delete_space(&mut self.pmem.lock(), space);
    }

    pub fn alloc_space_pages(&self, space: &mut ProcessSpace<A>, pages: usize) -> Option<VirtualAddress> {
        let mut kmem = self.kmem.lock();
        kmem.alloc_space_pages(&mut self.pmem.lock(), space, pages).ok()
    }

    pub fn free_space_pages(&self, space: &mut ProcessSpace<A>, vaddr: VirtualAddress) -> Result<(), AllocError> {
        let mut kmem = self.kmem.lock();
        kmem.free_space_pages(&mut self.pmem.lock(), space, vaddr)
    }

    /// Free frames of `zone`.
    pub fn free_frames(&self, zone: Zone) -> usize {
        self.pmem.lock().free_frames(zone)
    }

    /// Free pages of the metadata pool.
    pub fn pool_pages(&self) -> usize {
        self.kmem.lock().pool.free_pages()
    }

    /// Runs `f` with kernel memory locked, for inspection.
    pub fn with_kmem<R>(&self, f: impl FnOnce(&Kmem<A>) -> R) -> R {
        f(&self.kmem.lock())
    }
}
