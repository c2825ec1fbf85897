//! Physical memory manager.
//!
//! Page frames are tracked in one dense [`Frame`] array indexed by frame number. Each
//! [`Zone`] owns a set of buddy free lists over that array; blocks never span two zones
//! because frames of different zones are never considered buddies.

use alloc::boxed::Box;

use crate::arch::{self, FrameAllocator, PMEM_MAX_ORDER};
use crate::buddy::{BuddyBlocks, FreeLists, largest_order};
use crate::frame::{Frame, FrameFlags, NUM_ZONES, Zone};
use crate::memmap::MemoryMap;
use crate::numa::MAX_NUMA_DOMAINS;
use crate::{AllocError, ByteSize, FrameNumber, PhysicalAddress};

/// Free lists of one zone, orders `0..=PMEM_MAX_ORDER`.
type ZoneLists = FreeLists<{ PMEM_MAX_ORDER as usize + 1 }>;

impl BuddyBlocks for [Frame] {
    fn len(&self) -> usize {
        <[Frame]>::len(self)
    }

    fn order(&self, index: u32) -> u8 {
        self[index as usize].raw_order()
    }

    fn set_order(&mut self, index: u32, order: u8) {
        self[index as usize].set_raw_order(order);
    }

    fn next(&self, index: u32) -> u32 {
        self[index as usize].next()
    }

    fn set_next(&mut self, index: u32, next: u32) {
        self[index as usize].set_next(next);
    }

    fn is_free(&self, index: u32) -> bool {
        self[index as usize].is_available()
    }

    fn set_free(&mut self, index: u32, free: bool) {
        let frame = &mut self[index as usize];
        let mut flags = frame.flags();
        flags.set(FrameFlags::USED, !free);
        frame.set_flags(flags);
    }

    fn same_pool(&self, a: u32, b: u32) -> bool {
        let (a, b) = (&self[a as usize], &self[b as usize]);
        a.zone() == b.zone() && a.flags().contains(FrameFlags::USABLE) && b.flags().contains(FrameFlags::USABLE)
    }
}

/// Zoned buddy allocator over all physical memory.
pub struct PhysicalMemoryManager {
    frames: Box<[Frame]>,
    zones: [ZoneLists; NUM_ZONES],
}

impl PhysicalMemoryManager {
    /// Takes over a memory map and queues every available frame in its zone.
    ///
    /// Each maximal run of available frames in one zone is cut into the largest blocks
    /// its alignment allows.
    pub fn new(map: MemoryMap) -> Self {
        let mut frames = map.into_frames();
        debug_assert!(frames.len() < u32::MAX as usize);
        let mut zones = [const { ZoneLists::new() }; NUM_ZONES];

        let mut pfn = 0;
        while pfn < frames.len() {
            if !frames[pfn].is_available() {
                pfn += 1;
                continue;
            }

            let zone = frames[pfn].zone();
            let end = frames[pfn..]
                .iter()
                .position(|frame| !frame.is_available() || frame.zone() != zone)
                .map_or(frames.len(), |offset| pfn + offset);

            while pfn < end {
                let order = largest_order(pfn, end - pfn, PMEM_MAX_ORDER);
                zones[zone.index()].insert(&mut *frames, pfn as u32, order);
                pfn += 1 << order;
            }
        }

        let pmem = Self { frames, zones };
        pmem.log_summary();
        pmem
    }

    /// Allocates `2^order` contiguous frames from `zone`.
    pub fn alloc_pages(&mut self, zone: Zone, order: u8) -> Result<PhysicalAddress, AllocError> {
        let lists = self.zones.get_mut(zone.index()).ok_or(AllocError::OutOfMemory)?;
        let index = lists.alloc(&mut *self.frames, order)?;
        log::trace!("pmem: alloc {} order {} -> frame {:#x}", zone, order, index);
        Ok(FrameNumber::new(index as usize).start())
    }

    /// Allocates a single frame from `zone`.
    pub fn alloc_page(&mut self, zone: Zone) -> Result<PhysicalAddress, AllocError> {
        self.alloc_pages(zone, 0)
    }

    /// Allocates a superpage-sized, superpage-aligned block from `zone`.
    pub fn alloc_superpage(&mut self, zone: Zone) -> Result<PhysicalAddress, AllocError> {
        self.alloc_pages(zone, arch::SUPERPAGE_ORDER)
    }

    /// Returns the block starting at `paddr` to its zone.
    ///
    /// The block's order and zone are read from its frame records; every frame of the block
    /// must still carry them.
    pub fn free_pages(&mut self, paddr: PhysicalAddress) -> Result<(), AllocError> {
        if !paddr.is_aligned(arch::PAGE_SIZE) {
            return Err(AllocError::Misaligned);
        }
        let pfn = paddr.frame_number().as_usize();
        let zone = self.frames.get(pfn).ok_or(AllocError::InvalidAddress)?.zone();
        let lists = self.zones.get_mut(zone.index()).ok_or(AllocError::InvalidAddress)?;
        let (block, order) = lists.free(&mut *self.frames, pfn as u32)?;
        log::trace!("pmem: free {} -> {} block {:#x} order {}", paddr, zone, block, order);
        Ok(())
    }

    /// Number of free frames in `zone`.
    pub fn free_frames(&self, zone: Zone) -> usize {
        self.zones
            .get(zone.index())
            .map_or(0, |lists| lists.free_units(&*self.frames))
    }

    /// Number of free blocks of exactly `order` in `zone`.
    pub fn free_blocks(&self, zone: Zone, order: u8) -> usize {
        self.zones
            .get(zone.index())
            .map_or(0, |lists| lists.count(&*self.frames, order))
    }

    /// First free block of the `order` list of `zone`.
    pub fn head(&self, zone: Zone, order: u8) -> Option<PhysicalAddress> {
        self.zones
            .get(zone.index())?
            .head(order)
            .map(|index| FrameNumber::new(index as usize).start())
    }

    /// Record of the frame containing `paddr`.
    pub fn frame(&self, paddr: PhysicalAddress) -> Option<&Frame> {
        self.frames.get(paddr.frame_number().as_usize())
    }

    /// Number of frame records, holes included.
    pub fn total_frames(&self) -> usize {
        self.frames.len()
    }

    fn log_summary(&self) {
        for index in 0..NUM_ZONES {
            let Some(zone) = Zone::from_index(index) else {
                continue;
            };
            let free = self.free_frames(zone);
            if free > 0 {
                log::info!("pmem: zone {}: {} free", zone, ByteSize::pages(free));
            }
        }
    }
}

impl FrameAllocator for PhysicalMemoryManager {
    fn allocate_frame(&mut self) -> Option<PhysicalAddress> {
        // DMA memory is scarce and only used when everything else is gone.
        let numa = (0..MAX_NUMA_DOMAINS as u8).map(Zone::Numa);
        [Zone::Low, Zone::Uma]
            .into_iter()
            .chain(numa)
            .chain([Zone::Dma])
            .find_map(|zone| self.alloc_page(zone).ok())
    }

    fn deallocate_frame(&mut self, frame: PhysicalAddress) {
        if let Err(error) = self.free_pages(frame) {
            log::error!("pmem: failed to release table frame {}: {}", frame, error);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memmap::tests::TestRegion;
    use crate::buddy::INVALID_ORDER;
    use crate::numa::NumaTopology;
    use alloc::vec::Vec;

    const MIB: usize = 1 << 20;

    fn pmem(regions: &[TestRegion]) -> PhysicalMemoryManager {
        PhysicalMemoryManager::new(MemoryMap::from_boot_map(regions, &NumaTopology::new()))
    }

    fn heads(pmem: &PhysicalMemoryManager, zone: Zone) -> Vec<Option<PhysicalAddress>> {
        (0..=PMEM_MAX_ORDER).map(|order| pmem.head(zone, order)).collect()
    }

    #[test]
    fn split_leaves_expected_heads() {
        // One order-3 block at frame 0x1000 and nothing else.
        let mut pmem = pmem(&[TestRegion::usable(16 * MIB, 8 * arch::PAGE_SIZE)]);
        let base = 16 * MIB;
        let page = |n: usize| Some(PhysicalAddress::new(base + n * arch::PAGE_SIZE));
        assert_eq!(pmem.head(Zone::Low, 3), page(0));

        assert_eq!(pmem.alloc_pages(Zone::Low, 1), Ok(PhysicalAddress::new(base)));
        assert_eq!(pmem.head(Zone::Low, 3), None);
        assert_eq!(pmem.head(Zone::Low, 2), page(4));
        assert_eq!(pmem.head(Zone::Low, 1), page(2));
        assert_eq!(pmem.head(Zone::Low, 0), None);

        assert_eq!(pmem.alloc_pages(Zone::Low, 1), page(2).ok_or(AllocError::OutOfMemory));
        assert_eq!(pmem.head(Zone::Low, 2), page(4));
        assert_eq!(pmem.head(Zone::Low, 1), None);

        assert_eq!(pmem.alloc_pages(Zone::Low, 0), page(4).ok_or(AllocError::OutOfMemory));
        assert_eq!(pmem.head(Zone::Low, 2), None);
        assert_eq!(pmem.head(Zone::Low, 1), page(6));
        assert_eq!(pmem.head(Zone::Low, 0), page(5));
        assert_eq!(pmem.free_frames(Zone::Low), 3);
    }

    #[test]
    fn alloc_then_free_restores_zone() {
        let mut pmem = pmem(&[TestRegion::usable(16 * MIB, 4 * MIB)]);
        for order in 0..=10 {
            let before_heads = heads(&pmem, Zone::Low);
            let before_frames = pmem.frames.clone();

            let paddr = pmem.alloc_pages(Zone::Low, order).unwrap();
            pmem.free_pages(paddr).unwrap();

            assert_eq!(heads(&pmem, Zone::Low), before_heads);
            assert_eq!(pmem.frames, before_frames);
        }
    }

    #[test]
    fn allocations_never_overlap() {
        let mut pmem = pmem(&[TestRegion::usable(16 * MIB, 2 * MIB)]);
        let mut live: Vec<(usize, usize)> = Vec::new();
        for round in 0..64u8 {
            let order = round % 4;
            let Ok(paddr) = pmem.alloc_pages(Zone::Low, order) else {
                break;
            };
            let range = (paddr.as_usize(), paddr.as_usize() + (arch::PAGE_SIZE << order));
            assert!(live.iter().all(|&(start, end)| range.1 <= start || end <= range.0));
            live.push(range);
        }
        assert!(!live.is_empty());
    }

    #[test]
    fn blocks_come_from_the_requested_zone() {
        let mut numa = NumaTopology::new();
        numa.add(4 << 30, 2 * MIB, 5, true).unwrap();
        let regions = [
            TestRegion::usable(2 * MIB, 2 * MIB),
            TestRegion::usable(16 * MIB, 2 * MIB),
            TestRegion::usable(4 << 30, 4 * MIB),
        ];
        let mut pmem = PhysicalMemoryManager::new(MemoryMap::from_boot_map(&regions, &numa));

        for zone in [Zone::Dma, Zone::Low, Zone::Numa(0), Zone::Uma] {
            for order in 0..=arch::SUPERPAGE_ORDER {
                let paddr = pmem.alloc_pages(zone, order).unwrap();
                for n in 0..1usize << order {
                    let frame = pmem.frame(paddr + n * arch::PAGE_SIZE).unwrap();
                    assert_eq!(frame.zone(), zone);
                }
                pmem.free_pages(paddr).unwrap();
            }
        }
        assert_eq!(pmem.alloc_pages(Zone::Numa(1), 0), Err(AllocError::OutOfMemory));
    }

    #[test]
    fn zones_never_merge() {
        // 8 MiB straddling the DMA limit: one order-10 block on each side.
        let mut pmem = pmem(&[TestRegion::usable(12 * MIB, 8 * MIB)]);
        assert_eq!(pmem.free_frames(Zone::Dma), 1024);
        assert_eq!(pmem.free_frames(Zone::Low), 1024);
        assert_eq!(pmem.alloc_pages(Zone::Dma, 11), Err(AllocError::OutOfMemory));
    }

    #[test]
    fn exhaustion_is_recoverable() {
        let mut pmem = pmem(&[TestRegion::usable(16 * MIB, 64 * arch::PAGE_SIZE)]);
        let mut pages = Vec::new();
        while let Ok(paddr) = pmem.alloc_page(Zone::Low) {
            pages.push(paddr);
        }
        assert_eq!(pages.len(), 64);
        assert_eq!(pmem.alloc_page(Zone::Low), Err(AllocError::OutOfMemory));
        assert_eq!(pmem.alloc_pages(Zone::Low, 3), Err(AllocError::OutOfMemory));

        let victim = pages[17];
        pmem.free_pages(victim).unwrap();
        assert_eq!(pmem.alloc_page(Zone::Low), Ok(victim));

        for paddr in pages {
            pmem.free_pages(paddr).unwrap();
        }
        assert_eq!(pmem.free_blocks(Zone::Low, 6), 1);
    }

    #[test]
    fn rejects_invalid_frees() {
        let mut pmem = pmem(&[TestRegion::usable(16 * MIB, 8 * arch::PAGE_SIZE)]);
        let paddr = pmem.alloc_pages(Zone::Low, 2).unwrap();

        assert_eq!(pmem.free_pages(paddr + 8), Err(AllocError::Misaligned));
        assert_eq!(pmem.free_pages(paddr + arch::PAGE_SIZE), Err(AllocError::Misaligned));
        assert_eq!(pmem.free_pages(PhysicalAddress::new(64 * MIB)), Err(AllocError::InvalidAddress));
        assert_eq!(pmem.free_pages(PhysicalAddress::new(0)), Err(AllocError::InvalidAddress));

        pmem.free_pages(paddr).unwrap();
        assert_eq!(pmem.free_pages(paddr), Err(AllocError::InvalidAddress));
        assert_eq!(pmem.free_frames(Zone::Low), 8);
    }

    #[test]
    fn rejects_orders_above_maximum() {
        let mut pmem = pmem(&[TestRegion::usable(16 * MIB, MIB)]);
        assert_eq!(pmem.alloc_pages(Zone::Low, PMEM_MAX_ORDER + 1), Err(AllocError::InvalidOrder));
        assert_eq!(pmem.free_blocks(Zone::Low, PMEM_MAX_ORDER + 1), 0);
        assert_eq!(pmem.head(Zone::Low, u8::MAX), None);
    }

    #[test]
    fn unknown_numa_zones_are_empty() {
        let mut pmem = pmem(&[TestRegion::usable(16 * MIB, MIB)]);
        let before = pmem.free_frames(Zone::Low);
        let zone = Zone::Numa(200);

        assert_eq!(pmem.alloc_pages(zone, 0), Err(AllocError::OutOfMemory));
        assert_eq!(pmem.alloc_superpage(zone), Err(AllocError::OutOfMemory));
        assert_eq!(pmem.free_frames(zone), 0);
        assert_eq!(pmem.free_blocks(zone, 0), 0);
        assert_eq!(pmem.head(zone, 0), None);
        assert_eq!(pmem.free_frames(Zone::Low), before);
    }

    #[test]
    fn reserved_frames_are_never_handed_out() {
        let regions = [TestRegion::usable(16 * MIB, 16 * arch::PAGE_SIZE)];
        let mut map = MemoryMap::from_boot_map(&regions, &NumaTopology::new());
        map.reserve(PhysicalAddress::new(16 * MIB + 4 * arch::PAGE_SIZE), arch::PAGE_SIZE);
        let mut pmem = PhysicalMemoryManager::new(map);

        assert_eq!(pmem.free_frames(Zone::Low), 15);
        while let Ok(paddr) = pmem.alloc_page(Zone::Low) {
            assert_ne!(paddr, PhysicalAddress::new(16 * MIB + 4 * arch::PAGE_SIZE));
        }
        let reserved = pmem.frame(PhysicalAddress::new(16 * MIB + 4 * arch::PAGE_SIZE)).unwrap();
        assert_eq!(reserved.raw_order(), INVALID_ORDER);
    }

    #[test]
    fn serves_page_table_frames() {
        let mut pmem = pmem(&[TestRegion::usable(MIB, MIB), TestRegion::usable(16 * MIB, MIB)]);
        let frame = pmem.allocate_frame().unwrap();
        assert_eq!(pmem.frame(frame).unwrap().zone(), Zone::Low);
        pmem.deallocate_frame(frame);
        assert_eq!(pmem.free_frames(Zone::Low), 256);
    }
}
