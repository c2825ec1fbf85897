//! Dense physical frame map built from the boot memory map.
//!
//! One [`Frame`] record exists for every page frame from physical address zero up to the
//! end of the highest usable range. Frames outside usable ranges are holes: they keep a
//! record, so buddy arithmetic can stay index-based, but are never handed out.
//!
//! # Building a Memory Map
//!
//! Implement [`BootMemoryRegion`] on the boot loader's entry type and call
//! [`MemoryMap::from_boot_map`]:
//!
//! ```ignore
//! impl BootMemoryRegion for MyBootEntry {
//!     fn base(&self) -> PhysicalAddress { /* ... */ }
//!     fn size(&self) -> usize { /* ... */ }
//!     fn is_usable(&self) -> bool { /* ... */ }
//! }
//!
//! let memory_map = MemoryMap::from_boot_map(boot_entries, &numa);
//! ```

use alloc::boxed::Box;
use alloc::vec;

use crate::frame::{Frame, FrameFlags, Zone};
use crate::numa::NumaTopology;
use crate::{ByteSize, FrameNumber, PhysicalAddress, arch};

/// A single entry in a boot-time memory map.
pub trait BootMemoryRegion {
    /// Returns the base physical address of this region.
    fn base(&self) -> PhysicalAddress;

    /// Returns the size of this region in bytes.
    fn size(&self) -> usize;

    /// Returns whether this region contains RAM the kernel may allocate.
    fn is_usable(&self) -> bool;
}

/// Firmware address-range descriptor (`base`, `length`, `type`, extended attributes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct SystemAddressMapEntry {
    pub base: u64,
    pub length: u64,
    pub kind: u32,
    pub attributes: u32,
}

impl SystemAddressMapEntry {
    /// Descriptor type of usable RAM.
    pub const USABLE: u32 = 1;
}

impl BootMemoryRegion for SystemAddressMapEntry {
    fn base(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.base as usize)
    }

    fn size(&self) -> usize {
        self.length as usize
    }

    fn is_usable(&self) -> bool {
        self.kind == Self::USABLE
    }
}

/// Frame records for all physical memory up to the highest usable address.
pub struct MemoryMap {
    frames: Box<[Frame]>,
}

impl MemoryMap {
    /// Builds the frame map from boot entries.
    ///
    /// Entries are applied in order and later entries override earlier ones. Usable ranges
    /// are shrunk to whole frames and reserved ranges are grown to whole frames, so a
    /// frame only partially covered by RAM is never usable.
    pub fn from_boot_map<R: BootMemoryRegion>(boot_map: &[R], numa: &NumaTopology) -> Self {
        let end = boot_map
            .iter()
            .filter(|region| region.is_usable())
            .map(|region| (region.base().as_usize() + region.size()) / arch::PAGE_SIZE)
            .max()
            .unwrap_or(0);

        let mut frames = vec![Frame::HOLE; end].into_boxed_slice();
        for (pfn, frame) in frames.iter_mut().enumerate() {
            frame.set_zone(Zone::containing(FrameNumber::new(pfn).start(), numa));
        }

        for region in boot_map {
            let base = region.base().as_usize();
            let limit = base + region.size();
            if region.is_usable() {
                let first = base.div_ceil(arch::PAGE_SIZE);
                let last = (limit / arch::PAGE_SIZE).min(end);
                for frame in frames.iter_mut().take(last).skip(first) {
                    frame.set_flags(FrameFlags::USABLE);
                }
            } else {
                let first = base / arch::PAGE_SIZE;
                let last = limit.div_ceil(arch::PAGE_SIZE).min(end);
                for frame in frames.iter_mut().take(last).skip(first) {
                    frame.set_flags(FrameFlags::empty());
                }
            }
        }

        let map = Self { frames };
        log::debug!(
            "memory map: {} frames, {} usable",
            map.frames.len(),
            ByteSize::pages(map.usable_frames())
        );
        map
    }

    /// Marks `[base, base + size)` as in use so it is never handed to the buddies.
    ///
    /// Used for memory taken before the buddies exist: the frame array itself, boot-time
    /// allocations and the metadata pool.
    pub fn reserve(&mut self, base: PhysicalAddress, size: usize) {
        let first = base.as_usize() / arch::PAGE_SIZE;
        let last = (base.as_usize() + size).div_ceil(arch::PAGE_SIZE).min(self.frames.len());
        for frame in self.frames.iter_mut().take(last).skip(first) {
            let flags = frame.flags() | FrameFlags::USED;
            frame.set_flags(flags);
        }
    }

    /// Returns the record of a frame, or `None` beyond the end of the map.
    pub fn frame(&self, frame: FrameNumber) -> Option<&Frame> {
        self.frames.get(frame.as_usize())
    }

    /// Number of frame records.
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Whether the map holds no frames at all.
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Number of usable frames not reserved.
    pub fn usable_frames(&self) -> usize {
        self.frames.iter().filter(|frame| frame.is_available()).count()
    }

    pub(crate) fn into_frames(self) -> Box<[Frame]> {
        self.frames
    }
}
