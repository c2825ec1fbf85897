//! Architecture contract for the memory core.
//!
//! The buddy allocators never touch page tables themselves. They describe translations
//! with [`MapFlags`] and hand them to an [`ArchMapper`], which owns the hardware (or
//! emulated) page-table encoding for one address space. Page-table pages are requested
//! from a [`FrameAllocator`], normally the physical memory manager.
//!
//! Two mappers exist:
//! - `X86Mapper` drives real x86_64 4-level page tables through the direct map.
//! - `SoftwareMapper` records translations in ordinary host memory, for tests and tools.

#[cfg(target_arch = "x86_64")]
mod x86_64;
#[cfg(target_arch = "x86_64")]
pub use self::x86_64::X86Mapper;

#[cfg(any(test, feature = "software-emulation"))]
mod software;
#[cfg(any(test, feature = "software-emulation"))]
pub use software::SoftwareMapper;

use core::fmt;

use crate::{PhysicalAddress, VirtualAddress};

/// Maximum number of bits in a physical address on x86_64.
pub const MAX_PHYSICAL_BITS: usize = 52;

/// Number of bits in a virtual address with 4-level paging.
pub const MAX_VIRTUAL_BITS: usize = 48;

/// log2 of [`PAGE_SIZE`].
pub const PAGE_SHIFT: usize = 12;

/// Base page size in bytes (4 KiB).
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

/// log2 of [`SUPERPAGE_SIZE`].
pub const SUPERPAGE_SHIFT: usize = 21;

/// Large page size in bytes (2 MiB).
pub const SUPERPAGE_SIZE: usize = 1 << SUPERPAGE_SHIFT;

/// Number of base pages covered by one superpage.
pub const PAGES_PER_SUPERPAGE: usize = SUPERPAGE_SIZE / PAGE_SIZE;

/// Buddy order of a superpage when counted in base pages.
pub const SUPERPAGE_ORDER: u8 = (SUPERPAGE_SHIFT - PAGE_SHIFT) as u8;

/// Largest block order of the physical allocator (1 GiB of frames).
pub const PMEM_MAX_ORDER: u8 = 18;

/// Largest block order of a region's superpage buddy lists.
pub const SUPERPAGE_MAX_ORDER: u8 = 18;

/// Largest block order of a demoted superpage's page buddy lists.
pub const PAGE_MAX_ORDER: u8 = SUPERPAGE_ORDER;

/// Validates a physical address against the architectural width.
#[inline]
pub const fn validate_physical(addr: usize) -> bool {
    addr < (1usize << MAX_PHYSICAL_BITS)
}

/// Validates that a virtual address is canonical (bits 48-63 copy bit 47).
#[inline]
pub const fn validate_virtual(addr: usize) -> bool {
    canonicalize_virtual(addr) == addr
}

/// Sign-extends bit 47 of `addr` into the upper bits.
#[inline]
pub const fn canonicalize_virtual(addr: usize) -> usize {
    if addr & (1 << (MAX_VIRTUAL_BITS - 1)) != 0 {
        addr | !((1usize << MAX_VIRTUAL_BITS) - 1)
    } else {
        addr & ((1usize << MAX_VIRTUAL_BITS) - 1)
    }
}

bitflags::bitflags! {
    /// Attributes of a translation handed to [`ArchMapper::map`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MapFlags: u8 {
        /// The translation is valid.
        const USABLE = 1 << 0;
        /// The backing memory is owned by an allocation.
        const USED = 1 << 1;
        /// The translation covers a whole superpage.
        const SUPERPAGE = 1 << 2;
        /// The translation is shared by every address space.
        const GLOBAL = 1 << 3;
        /// The translation is reachable from user mode.
        const USER = 1 << 4;
    }
}

impl MapFlags {
    /// Flags for kernel heap memory backed at base-page granularity.
    pub const KERNEL_PAGE: Self = Self::USABLE.union(Self::USED).union(Self::GLOBAL);

    /// Flags for kernel heap memory backed by a superpage.
    pub const KERNEL_SUPERPAGE: Self = Self::KERNEL_PAGE.union(Self::SUPERPAGE);

    /// Flags for process memory backed at base-page granularity.
    pub const USER_PAGE: Self = Self::USABLE.union(Self::USED).union(Self::USER);

    /// Returns the size of the span described by these flags.
    #[inline]
    pub const fn granule(self) -> usize {
        if self.contains(Self::SUPERPAGE) {
            SUPERPAGE_SIZE
        } else {
            PAGE_SIZE
        }
    }
}

/// Failures reported by an [`ArchMapper`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapError {
    /// The virtual or physical address is not aligned to the granule implied by the flags.
    Misaligned,
    /// An intermediate page table could not be allocated.
    OutOfTables,
    /// The span is already covered by a translation of a different granularity.
    Conflict,
    /// No translation exists at the address.
    NotMapped,
}

impl fmt::Display for MapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MapError::Misaligned => f.write_str("address is not aligned to the mapping granule"),
            MapError::OutOfTables => f.write_str("no frame available for a page table"),
            MapError::Conflict => f.write_str("span is mapped at a different granularity"),
            MapError::NotMapped => f.write_str("address is not mapped"),
        }
    }
}

/// A source of physical frames for page tables.
pub trait FrameAllocator {
    /// Allocates one base-page frame, or `None` when exhausted.
    fn allocate_frame(&mut self) -> Option<PhysicalAddress>;

    /// Returns a frame obtained from [`FrameAllocator::allocate_frame`].
    fn deallocate_frame(&mut self, frame: PhysicalAddress);
}

/// Page-table driver for one address space.
pub trait ArchMapper: Send {
    /// Installs or replaces the translation of `vaddr` to `paddr`.
    ///
    /// Both addresses must be aligned to [`MapFlags::granule`]. Stale translations of
    /// `vaddr` are invalidated before returning.
    fn map(
        &mut self,
        vaddr: VirtualAddress,
        paddr: PhysicalAddress,
        flags: MapFlags,
        frames: &mut dyn FrameAllocator,
    ) -> Result<(), MapError>;

    /// Removes the translation of `vaddr` and returns the physical address it pointed to.
    fn unmap(&mut self, vaddr: VirtualAddress, flags: MapFlags) -> Result<PhysicalAddress, MapError>;

    /// Resolves `vaddr` to the physical address currently backing it.
    fn v2p(&self, vaddr: VirtualAddress) -> Option<PhysicalAddress>;

    /// Number of significant virtual address bits.
    fn addr_width(&self) -> u32;

    /// Physical address of the root table, as loaded into the translation base register.
    fn root(&self) -> PhysicalAddress;

    /// Creates the top-level tables spanning the kernel window `[start, end)`.
    ///
    /// Spaces created afterwards share these tables, so kernel translations added
    /// anywhere in the window later on are visible from every space.
    fn prepare_kernel_window(
        &mut self,
        start: VirtualAddress,
        end: usize,
        frames: &mut dyn FrameAllocator,
    ) -> Result<(), MapError>;

    /// Creates the mapper of a fresh address space rooted at the zeroed page `root`.
    ///
    /// Kernel translations of `self` are shared with the new space.
    fn new_space(&self, root: PhysicalAddress) -> Self
    where
        Self: Sized;

    /// Frees every intermediate table owned exclusively by this space.
    ///
    /// The root page itself is left to the caller, which allocated it.
    fn release(&mut self, frames: &mut dyn FrameAllocator);
}
