//! Boot-time block allocator.
//!
//! Before the page-record array exists there is nowhere to keep per-frame state, so early
//! allocations are served memblock style: one sorted list of usable physical ranges and one
//! of reserved ranges, both in fixed arrays. Free memory is whatever is usable but not
//! reserved. When the buddy allocators take over, every reserved range is copied into the
//! [`MemoryMap`] so that nothing handed out here is ever handed out again.

use core::fmt;

use crate::arch::PAGE_SIZE;
use crate::{MemoryMap, PhysicalAddress};

/// Maximum number of ranges tracked per list.
const MAX_REGIONS: usize = 128;

/// Failures of the block allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockError {
    /// No usable range has room for the request.
    OutOfMemory,
    /// The alignment is zero or not a power of two.
    InvalidAlignment,
    /// A range list is full.
    RegionsFull,
}

impl fmt::Display for BlockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockError::OutOfMemory => f.write_str("no usable range has room"),
            BlockError::InvalidAlignment => f.write_str("alignment is not a power of two"),
            BlockError::RegionsFull => f.write_str("too many memory ranges"),
        }
    }
}

/// A page-granular range of physical memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
    base: PhysicalAddress,
    size: usize,
}

impl MemoryRegion {
    pub const fn new(base: PhysicalAddress, size: usize) -> Self {
        Self { base, size }
    }

    pub const fn base(&self) -> PhysicalAddress {
        self.base
    }

    pub const fn size(&self) -> usize {
        self.size
    }

    /// Exclusive end address.
    pub const fn end(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.base.as_usize() + self.size)
    }

    pub fn overlaps(&self, other: &MemoryRegion) -> bool {
        self.base < other.end() && other.base < self.end()
    }

    /// Overlapping or touching ranges can be combined into one.
    pub fn mergeable(&self, other: &MemoryRegion) -> bool {
        self.base <= other.end() && other.base <= self.end()
    }

    /// Smallest range covering both.
    pub fn merge(&self, other: &MemoryRegion) -> MemoryRegion {
        let base = self.base.min(other.base);
        let end = self.end().max(other.end());
        MemoryRegion::new(base, end - base)
    }
}

/// Sorted, non-overlapping ranges in a fixed array.
#[derive(Debug)]
struct RegionArray {
    regions: [MemoryRegion; MAX_REGIONS],
    count: usize,
}

impl RegionArray {
    const EMPTY: MemoryRegion = MemoryRegion::new(PhysicalAddress::new(0), 0);

    const fn new() -> Self {
        Self {
            regions: [Self::EMPTY; MAX_REGIONS],
            count: 0,
        }
    }

    fn len(&self) -> usize {
        self.count
    }

    fn iter(&self) -> impl Iterator<Item = &MemoryRegion> {
        self.regions[..self.count].iter()
    }

    fn insert(&mut self, index: usize, region: MemoryRegion) -> Result<(), BlockError> {
        if self.count == MAX_REGIONS {
            return Err(BlockError::RegionsFull);
        }
        self.regions.copy_within(index..self.count, index + 1);
        self.regions[index] = region;
        self.count += 1;
        Ok(())
    }

    fn remove(&mut self, index: usize) {
        self.regions.copy_within(index + 1..self.count, index);
        self.count -= 1;
        self.regions[self.count] = Self::EMPTY;
    }

    /// Adds a range, merging it with every range it overlaps or touches.
    fn add(&mut self, region: MemoryRegion) -> Result<(), BlockError> {
        if region.size() == 0 {
            return Ok(());
        }

        let mut merged = region;
        let mut index = 0;
        while index < self.count {
            let existing = self.regions[index];
            if existing.end() < merged.base() {
                index += 1;
            } else if merged.end() < existing.base() {
                break;
            } else {
                merged = merged.merge(&existing);
                self.remove(index);
            }
        }
        self.insert(index, merged)
    }

    /// Removes a range, splitting the ranges it cuts through.
    fn subtract(&mut self, region: MemoryRegion) -> Result<(), BlockError> {
        if region.size() == 0 {
            return Ok(());
        }

        let mut index = 0;
        while index < self.count {
            let existing = self.regions[index];
            if !existing.overlaps(&region) {
                index += 1;
                continue;
            }

            self.remove(index);
            if existing.base() < region.base() {
                self.insert(index, MemoryRegion::new(existing.base(), region.base() - existing.base()))?;
                index += 1;
            }
            if existing.end() > region.end() {
                self.insert(index, MemoryRegion::new(region.end(), existing.end() - region.end()))?;
                index += 1;
            }
        }
        Ok(())
    }

    fn total_size(&self) -> usize {
        self.iter().map(MemoryRegion::size).sum()
    }
}

/// Rounds `[base, base + size)` outward to whole pages.
fn page_cover(base: PhysicalAddress, size: usize) -> MemoryRegion {
    let start = base.align_down(PAGE_SIZE);
    let end = (base + size).align_up(PAGE_SIZE);
    MemoryRegion::new(start, end - start)
}

/// First-fit allocator of physical pages for early boot.
///
/// All methods take `&self`: the lists sit behind `spin::Mutex`es so that a `static`
/// instance can serve the global allocator before anything else is set up.
pub struct BlockAllocator {
    memory: spin::Mutex<RegionArray>,
    reserved: spin::Mutex<RegionArray>,
}

impl BlockAllocator {
    pub const fn new() -> Self {
        Self {
            memory: spin::Mutex::new(RegionArray::new()),
            reserved: spin::Mutex::new(RegionArray::new()),
        }
    }

    /// Adds usable memory; partial pages at either end are dropped.
    pub fn add(&self, base: PhysicalAddress, size: usize) -> Result<(), BlockError> {
        let start = base.align_up(PAGE_SIZE);
        let end = (base + size).align_down(PAGE_SIZE);
        if end <= start {
            return Ok(());
        }
        self.memory.lock().add(MemoryRegion::new(start, end - start))
    }

    /// Marks memory as unavailable, rounding out to whole pages.
    pub fn reserve(&self, base: PhysicalAddress, size: usize) -> Result<(), BlockError> {
        if size == 0 {
            return Ok(());
        }
        self.reserved.lock().add(page_cover(base, size))
    }

    /// Allocates at least `size` bytes aligned to `align` and reserves them.
    ///
    /// The size is rounded up to whole pages.
    pub fn allocate(&self, size: usize, align: usize) -> Result<PhysicalAddress, BlockError> {
        if size == 0 {
            return Err(BlockError::OutOfMemory);
        }
        if !align.is_power_of_two() {
            return Err(BlockError::InvalidAlignment);
        }
        let align = align.max(PAGE_SIZE);
        let size = size.next_multiple_of(PAGE_SIZE);

        let memory = self.memory.lock();
        let mut reserved = self.reserved.lock();
        for range in memory.iter() {
            let mut current = range.base();
            loop {
                let candidate = MemoryRegion::new(current.align_up(align), size);
                if candidate.end() > range.end() {
                    break;
                }
                let overlap = reserved.iter().find(|taken| taken.overlaps(&candidate)).map(|taken| taken.end());
                match overlap {
                    Some(end) => current = end,
                    None => {
                        reserved.add(candidate)?;
                        log::trace!("block: allocated {} bytes at {}", size, candidate.base());
                        return Ok(candidate.base());
                    }
                }
            }
        }

        log::error!("block: out of memory for {} bytes", size);
        Err(BlockError::OutOfMemory)
    }

    /// Releases a range obtained from [`BlockAllocator::allocate`].
    pub fn free(&self, base: PhysicalAddress, size: usize) -> Result<(), BlockError> {
        if size == 0 {
            return Ok(());
        }
        self.reserved.lock().subtract(page_cover(base, size))
    }

    /// Number of usable ranges.
    pub fn memory_regions(&self) -> usize {
        self.memory.lock().len()
    }

    /// Number of reserved ranges.
    pub fn reserved_regions(&self) -> usize {
        self.reserved.lock().len()
    }

    pub fn total_memory(&self) -> usize {
        self.memory.lock().total_size()
    }

    pub fn reserved_memory(&self) -> usize {
        self.reserved.lock().total_size()
    }

    pub fn available_memory(&self) -> usize {
        self.total_memory().saturating_sub(self.reserved_memory())
    }

    /// Copies every reserved range into `map`, handing ownership to the buddy allocators.
    pub fn hand_over(&self, map: &mut MemoryMap) {
        let reserved = self.reserved.lock();
        for range in reserved.iter() {
            map.reserve(range.base(), range.size());
        }
        log::debug!("block: handed {} reserved ranges to the memory map", reserved.len());
    }
}

impl Default for BlockAllocator {
    fn default() -> Self {
        Self::new()
    }
}
