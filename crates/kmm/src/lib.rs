#![cfg_attr(not(any(test, feature = "software-emulation")), no_std)]

//! # Kestrel Memory Manager (KMM)
//!
//! The Kestrel Memory Manager is the memory core of the Kestrel kernel. It provides:
//!
//! - A zoned physical buddy allocator (DMA, low memory, UMA and one zone per NUMA domain).
//! - Virtual address spaces built from regions of superpages, demoted to base pages on
//!   demand, with their own buddy lists.
//! - Kernel memory: mapped pages on request, a metadata pool that breaks the bootstrap
//!   cycle and a slab allocator for small objects.
//! - Process address spaces that share the kernel's global translations.
//! - A boot-time block allocator and the boot memory map the buddies are built from.
//! - Software emulation of the page tables, for testing in non-kernel environments.

extern crate alloc;

mod address;
mod arch;
mod block_allocator;
mod buddy;
mod error;
mod frame;
mod kmem;
mod memmap;
mod numa;
mod pmem;
mod pool;
mod size;
mod slab;
mod vmem;

#[cfg(any(test, feature = "software-emulation"))]
pub mod testing;

pub use address::{DirectMap, FrameNumber, PhysicalAddress, VirtualAddress};
pub use block_allocator::{BlockAllocator, BlockError, MemoryRegion};
pub use error::AllocError;
pub use frame::{DMA_LIMIT, Frame, FrameFlags, LOW_LIMIT, NUM_ZONES, Zone};
pub use kmem::{KernelMemory, Kmem, KmemConfig, ProcessSpace};
pub use memmap::{BootMemoryRegion, MemoryMap, SystemAddressMapEntry};
pub use numa::{MAX_NUMA_DOMAINS, MemoryAffinity, NumaError, NumaTopology};
pub use pmem::PhysicalMemoryManager;
pub use pool::PagePool;
pub use size::ByteSize;
pub use slab::{ClassStats, MAX_OBJECT_SIZE, MIN_OBJECT_SIZE, OBJECT_ALIGN, PageSource, Slab};
pub use vmem::{Allocation, Region, VirtualMemorySpace};

pub use arch::{
    ArchMapper, FrameAllocator, MapError, MapFlags, PAGE_SIZE, PAGES_PER_SUPERPAGE, PMEM_MAX_ORDER, SUPERPAGE_ORDER,
    SUPERPAGE_SIZE,
};

#[cfg(target_arch = "x86_64")]
pub use arch::X86Mapper;

#[cfg(any(test, feature = "software-emulation"))]
pub use arch::SoftwareMapper;
