//! Host stand-ins for kernel memory.
//!
//! Tests and tools run the allocators against ordinary heap buffers. A [`HostArena`] plays
//! the part of a pre-mapped kernel window, [`SequentialFrames`] hands out page-table frames
//! and [`TestKernel`] assembles a complete [`KernelMemory`] on top of a
//! [`SoftwareMapper`]. Physical addresses are only ever compared, never dereferenced.

use std::alloc::{Layout, alloc_zeroed, dealloc};
use std::collections::BTreeMap;
use std::vec::Vec;

use crate::arch::{FrameAllocator, PAGE_SIZE, SUPERPAGE_SIZE, SoftwareMapper};
use crate::memmap::SystemAddressMapEntry;
use crate::numa::NumaTopology;
use crate::slab::PageSource;
use crate::{AllocError, KernelMemory, KmemConfig, MemoryMap, PhysicalAddress, PhysicalMemoryManager, VirtualAddress};

/// Zeroed, superpage-aligned host memory.
pub struct HostArena {
    ptr: *mut u8,
    layout: Layout,
}

unsafe impl Send for HostArena {}
unsafe impl Sync for HostArena {}

impl HostArena {
    /// Allocates `size` bytes, rounded up to whole pages.
    pub fn new(size: usize) -> Self {
        let size = size.max(PAGE_SIZE).next_multiple_of(PAGE_SIZE);
        let layout = Layout::from_size_align(size, SUPERPAGE_SIZE).expect("arena layout");
        let ptr = unsafe { alloc_zeroed(layout) };
        assert!(!ptr.is_null(), "host arena of {} bytes", size);
        Self { ptr, layout }
    }

    pub fn start(&self) -> VirtualAddress {
        VirtualAddress::from_ptr(self.ptr)
    }

    pub fn end(&self) -> VirtualAddress {
        self.start() + self.len()
    }

    pub fn len(&self) -> usize {
        self.layout.size()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, vaddr: VirtualAddress) -> bool {
        vaddr >= self.start() && vaddr < self.end()
    }
}

impl Drop for HostArena {
    fn drop(&mut self) {
        unsafe { dealloc(self.ptr, self.layout) };
    }
}

/// Hands out consecutive page-table frames and remembers what came back.
pub struct SequentialFrames {
    next: PhysicalAddress,
    freed: Vec<PhysicalAddress>,
}

impl SequentialFrames {
    pub fn new() -> Self {
        Self {
            next: PhysicalAddress::new(0x10_0000),
            freed: Vec::new(),
        }
    }

    pub fn freed(&self) -> &[PhysicalAddress] {
        &self.freed
    }
}

impl Default for SequentialFrames {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameAllocator for SequentialFrames {
    fn allocate_frame(&mut self) -> Option<PhysicalAddress> {
        let frame = self.next;
        self.next = frame + PAGE_SIZE;
        Some(frame)
    }

    fn deallocate_frame(&mut self, frame: PhysicalAddress) {
        self.freed.push(frame);
    }
}

/// Page source for slab tests, backed by the host heap.
pub struct HostPages {
    live: BTreeMap<usize, Layout>,
    requests: Vec<usize>,
    limit: Option<usize>,
}

impl HostPages {
    pub fn new() -> Self {
        Self {
            live: BTreeMap::new(),
            requests: Vec::new(),
            limit: None,
        }
    }

    /// A source that fails once `requests` allocations were served.
    pub fn with_limit(requests: usize) -> Self {
        let mut pages = Self::new();
        pages.limit = Some(requests);
        pages
    }

    /// Page counts of every successful request, in order.
    pub fn requests(&self) -> &[usize] {
        &self.requests
    }

    /// Number of allocations not yet freed.
    pub fn live(&self) -> usize {
        self.live.len()
    }
}

impl Default for HostPages {
    fn default() -> Self {
        Self::new()
    }
}

impl PageSource for HostPages {
    fn alloc_pages(&mut self, pages: usize) -> Result<VirtualAddress, AllocError> {
        if self.limit.is_some_and(|limit| self.requests.len() >= limit) {
            return Err(AllocError::OutOfMemory);
        }
        let align = (pages.next_power_of_two() * PAGE_SIZE).min(SUPERPAGE_SIZE);
        let layout = Layout::from_size_align(pages * PAGE_SIZE, align).map_err(|_| AllocError::InvalidOrder)?;
        let ptr = unsafe { alloc_zeroed(layout) };
        if ptr.is_null() {
            return Err(AllocError::OutOfMemory);
        }
        self.live.insert(ptr as usize, layout);
        self.requests.push(pages);
        Ok(VirtualAddress::from_ptr(ptr))
    }

    fn free_pages(&mut self, vaddr: VirtualAddress) -> Result<(), AllocError> {
        let layout = self.live.remove(&vaddr.as_usize()).ok_or(AllocError::InvalidAddress)?;
        unsafe { dealloc(vaddr.as_mut_ptr::<u8>(), layout) };
        Ok(())
    }
}

impl Drop for HostPages {
    fn drop(&mut self) {
        for (&addr, &layout) in &self.live {
            unsafe { dealloc(addr as *mut u8, layout) };
        }
    }
}

/// Physical memory of a [`TestKernel`]: 64 MiB of usable RAM at 16 MiB.
pub const TEST_RAM_BASE: usize = 16 << 20;
pub const TEST_RAM_SIZE: usize = 64 << 20;

/// Pages of the arena given to the metadata pool at startup.
pub const TEST_BOOTSTRAP_PAGES: usize = SUPERPAGE_SIZE / PAGE_SIZE;

/// A complete kernel memory context on host memory.
///
/// The first superpage of the arena seeds the metadata pool; the rest is the kernel heap
/// window, grown in regions of `region_size`.
pub struct TestKernel {
    // Dropped before the arena it points into.
    pub memory: KernelMemory<SoftwareMapper>,
    pub arena: HostArena,
}

impl TestKernel {
    /// A kernel with a 16 MiB heap window growing in 4 MiB regions.
    pub fn new() -> Self {
        Self::with_window(16 << 20, 4 << 20)
    }

    pub fn with_window(window: usize, region_size: usize) -> Self {
        let ram = [SystemAddressMapEntry {
            base: TEST_RAM_BASE as u64,
            length: TEST_RAM_SIZE as u64,
            kind: SystemAddressMapEntry::USABLE,
            attributes: 0,
        }];
        let pmem = PhysicalMemoryManager::new(MemoryMap::from_boot_map(&ram, &NumaTopology::new()));
        Self::with_pmem(pmem, window, region_size)
    }

    /// A kernel over an existing physical memory manager.
    pub fn with_pmem(pmem: PhysicalMemoryManager, window: usize, region_size: usize) -> Self {
        let arena = HostArena::new(SUPERPAGE_SIZE + window);
        let config = KmemConfig {
            region_start: arena.start() + SUPERPAGE_SIZE,
            region_size,
            region_limit: arena.end().as_usize(),
            ..KmemConfig::default()
        };
        let arch = SoftwareMapper::new(PhysicalAddress::new(0x1000));
        let memory = unsafe { KernelMemory::new(arch, arena.start(), TEST_BOOTSTRAP_PAGES, config, pmem) }
            .expect("test kernel memory");
        Self { memory, arena }
    }
}

impl Default for TestKernel {
    fn default() -> Self {
        Self::new()
    }
}
