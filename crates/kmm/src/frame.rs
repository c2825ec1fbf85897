//! Per-frame bookkeeping for physical memory.

use core::fmt;

use crate::PhysicalAddress;
use crate::buddy::{INVALID_INDEX, INVALID_ORDER};
use crate::numa::{MAX_NUMA_DOMAINS, NumaTopology};

/// Physical memory below this address belongs to [`Zone::Dma`].
pub const DMA_LIMIT: usize = 16 << 20;

/// Physical memory below this address (and above [`DMA_LIMIT`]) belongs to [`Zone::Low`].
pub const LOW_LIMIT: usize = 4 << 30;

/// Number of distinct zones: DMA, low memory, UMA and one per NUMA domain.
pub const NUM_ZONES: usize = 3 + MAX_NUMA_DOMAINS;

/// Classification of physical memory by capability and locality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Zone {
    /// Below 16 MiB, reachable by legacy DMA engines.
    Dma,
    /// Below 4 GiB, reachable by 32-bit devices.
    Low,
    /// Above 4 GiB on machines without NUMA information.
    Uma,
    /// Above 4 GiB, owned by the given NUMA domain.
    Numa(u8),
}

impl Zone {
    /// Dense index of the zone, `0..NUM_ZONES`.
    pub const fn index(self) -> usize {
        match self {
            Zone::Dma => 0,
            Zone::Low => 1,
            Zone::Uma => 2,
            Zone::Numa(domain) => 3 + domain as usize,
        }
    }

    /// Inverse of [`Zone::index`].
    pub const fn from_index(index: usize) -> Option<Self> {
        match index {
            0 => Some(Zone::Dma),
            1 => Some(Zone::Low),
            2 => Some(Zone::Uma),
            _ if index < NUM_ZONES => Some(Zone::Numa((index - 3) as u8)),
            _ => None,
        }
    }

    /// Zone owning the physical address `addr`.
    pub fn containing(addr: PhysicalAddress, numa: &NumaTopology) -> Self {
        let addr = addr.as_usize();
        if addr < DMA_LIMIT {
            Zone::Dma
        } else if addr < LOW_LIMIT {
            Zone::Low
        } else if let Some(domain) = numa.domain_of(addr) {
            Zone::Numa(domain)
        } else {
            Zone::Uma
        }
    }
}

impl fmt::Display for Zone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Zone::Dma => f.write_str("DMA"),
            Zone::Low => f.write_str("Low"),
            Zone::Uma => f.write_str("UMA"),
            Zone::Numa(domain) => write!(f, "NUMA{}", domain),
        }
    }
}

bitflags::bitflags! {
    /// State bits of a physical frame.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FrameFlags: u8 {
        /// Backed by RAM the kernel may hand out.
        const USABLE = 1 << 0;
        /// Currently handed out, or reserved before the buddies were built.
        const USED = 1 << 1;
    }
}

/// Metadata for one physical page frame.
///
/// Eight bytes per frame; the successor in a buddy list is a frame number rather than a
/// pointer. `order` is meaningful only while the frame belongs to a buddy block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct Frame {
    next: u32,
    order: u8,
    flags: FrameFlags,
    zone: u8,
    _reserved: u8,
}

impl Frame {
    /// A frame with no backing memory.
    pub const HOLE: Frame = Frame {
        next: INVALID_INDEX,
        order: INVALID_ORDER,
        flags: FrameFlags::empty(),
        zone: 0,
        _reserved: 0,
    };

    /// Returns the frame's state bits.
    pub const fn flags(&self) -> FrameFlags {
        self.flags
    }

    pub fn set_flags(&mut self, flags: FrameFlags) {
        self.flags = flags;
    }

    /// Whether the frame is usable RAM that is not handed out.
    pub fn is_available(&self) -> bool {
        self.flags.contains(FrameFlags::USABLE) && !self.flags.contains(FrameFlags::USED)
    }

    /// Order of the buddy block the frame belongs to, if any.
    pub fn order(&self) -> Option<u8> {
        (self.order != INVALID_ORDER).then_some(self.order)
    }

    pub(crate) fn raw_order(&self) -> u8 {
        self.order
    }

    pub(crate) fn set_raw_order(&mut self, order: u8) {
        self.order = order;
    }

    pub(crate) fn next(&self) -> u32 {
        self.next
    }

    pub(crate) fn set_next(&mut self, next: u32) {
        self.next = next;
    }

    /// Zone of the frame. Fixed once the memory map is built.
    pub fn zone(&self) -> Zone {
        Zone::from_index(self.zone as usize).unwrap_or(Zone::Uma)
    }

    pub(crate) fn set_zone(&mut self, zone: Zone) {
        self.zone = zone.index() as u8;
    }
}

impl Default for Frame {
    fn default() -> Self {
        Self::HOLE
    }
}
