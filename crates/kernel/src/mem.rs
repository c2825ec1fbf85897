//! Memory bring-up and the kernel's global allocator.
//!
//! Boot runs in three phases:
//!
//! 1. **Early**: the [`BlockAllocator`] is fed from the boot loader's memory map and serves
//!    heap requests through the direct map.
//! 2. **Hand-over**: every range the block allocator gave out is reserved in the frame map,
//!    which then seeds the physical buddy allocator. Heap requests fail in this window.
//! 3. **Ready**: [`KernelMemory`] owns all memory; heap requests go to `kmalloc`.

// cSpell:ignore Hhdm

use core::{
    alloc::{GlobalAlloc, Layout},
    ptr::NonNull,
    sync::atomic::{AtomicU8, Ordering},
};

use kmm::{
    BlockAllocator, BootMemoryRegion, ByteSize, DirectMap, KernelMemory, KmemConfig, MAX_OBJECT_SIZE, MemoryMap,
    NumaTopology, OBJECT_ALIGN, PAGE_SIZE, PAGES_PER_SUPERPAGE, PhysicalAddress, PhysicalMemoryManager,
    SUPERPAGE_SIZE, VirtualAddress, X86Mapper, Zone,
};
use limine::{
    memory_map::{self, Entry},
    request::{HhdmRequest, MemoryMapRequest, StackSizeRequest},
};
use spin::Once;

#[used]
#[unsafe(link_section = ".requests")]
static MEMORY_MAP_REQUEST: MemoryMapRequest = MemoryMapRequest::new();

#[used]
#[unsafe(link_section = ".requests")]
static HIGHER_HALF_DIRECT_MAP: HhdmRequest = HhdmRequest::new();

#[used]
#[unsafe(link_section = ".requests")]
static STACK_SIZE: StackSizeRequest = StackSizeRequest::new().with_size(65536); // 64 KiB stack

/// Boot-time allocator, retired once the buddies take over.
static BLOCKS: BlockAllocator = BlockAllocator::new();

static DIRECT_MAP: Once<DirectMap> = Once::new();

static KERNEL_MEMORY: Once<KernelMemory<X86Mapper>> = Once::new();

/// Bounds of the kernel heap window, `[start, limit)`.
static HEAP_WINDOW: Once<(usize, usize)> = Once::new();

const PHASE_EARLY: u8 = 0;
const PHASE_HAND_OVER: u8 = 1;
const PHASE_READY: u8 = 2;

static PHASE: AtomicU8 = AtomicU8::new(PHASE_EARLY);

pub fn type_name(entry_type: memory_map::EntryType) -> &'static str {
    match entry_type {
        memory_map::EntryType::USABLE => "USABLE",
        memory_map::EntryType::RESERVED => "RESERVED",
        memory_map::EntryType::ACPI_RECLAIMABLE => "ACPI_RECLAIMABLE",
        memory_map::EntryType::ACPI_NVS => "ACPI_NVS",
        memory_map::EntryType::BAD_MEMORY => "BAD_MEMORY",
        memory_map::EntryType::BOOTLOADER_RECLAIMABLE => "BOOTLOADER_RECLAIMABLE",
        memory_map::EntryType::EXECUTABLE_AND_MODULES => "EXECUTABLE_AND_MODULES",
        memory_map::EntryType::FRAMEBUFFER => "FRAMEBUFFER",
        _ => "UNKNOWN",
    }
}

/// Wrapper around Limine's memory map entry to implement kmm's `BootMemoryRegion` trait.
#[repr(transparent)]
struct LimineMemoryRegion<'a>(&'a Entry);

impl<'a> LimineMemoryRegion<'a> {
    /// Converts a slice of Entry references to a slice of LimineMemoryRegion.
    fn wrap_slice(entries: &'a [&'a Entry]) -> &'a [LimineMemoryRegion<'a>] {
        // SAFETY: LimineMemoryRegion is #[repr(transparent)] over &Entry
        unsafe { core::mem::transmute(entries) }
    }
}

impl BootMemoryRegion for LimineMemoryRegion<'_> {
    fn base(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.0.base as usize)
    }

    fn size(&self) -> usize {
        self.0.length as usize
    }

    fn is_usable(&self) -> bool {
        self.0.entry_type == memory_map::EntryType::USABLE
    }
}

fn boot_entries() -> &'static [&'static Entry] {
    MEMORY_MAP_REQUEST
        .get_response()
        .expect("Memory map request should have been answered")
        .entries()
}

/// Returns the boot loader's direct map of physical memory.
pub fn direct_map() -> DirectMap {
    *DIRECT_MAP.call_once(|| {
        let offset = HIGHER_HALF_DIRECT_MAP
            .get_response()
            .expect("Higher-half direct map request should have been answered")
            .offset();
        DirectMap::new(offset as usize)
    })
}

/// Feeds the block allocator from the boot memory map and enables the early heap.
pub fn init_early() -> DirectMap {
    let direct_map = direct_map();

    for entry in boot_entries() {
        let start = PhysicalAddress::new(entry.base as usize);
        log::trace!(
            "mem: {:#x}..{:#x} {}",
            entry.base,
            entry.base + entry.length,
            type_name(entry.entry_type)
        );
        let result = match entry.entry_type {
            memory_map::EntryType::USABLE => BLOCKS.add(start, entry.length as usize),
            _ => BLOCKS.reserve(start, entry.length as usize),
        };
        if let Err(err) = result {
            log::warn!("mem: dropping boot range at {}: {}", start, err);
        }
    }

    log::info!(
        "mem: {} usable in {} ranges",
        ByteSize(BLOCKS.available_memory()),
        BLOCKS.memory_regions()
    );
    direct_map
}

/// Builds the physical allocator and kernel memory, then retires the block allocator.
pub fn init(direct_map: DirectMap, numa: &NumaTopology) {
    let mut map = MemoryMap::from_boot_map(LimineMemoryRegion::wrap_slice(boot_entries()), numa);

    let bootstrap = BLOCKS
        .allocate(SUPERPAGE_SIZE, PAGE_SIZE)
        .expect("no memory for the kernel memory pool");

    BLOCKS.hand_over(&mut map);
    PHASE.store(PHASE_HAND_OVER, Ordering::SeqCst);

    let pmem = PhysicalMemoryManager::new(map);

    // SAFETY: Limine maps all physical memory at the direct map offset, and the tables
    // in CR3 are the ones the kernel runs on.
    let arch = unsafe { X86Mapper::active(direct_map) };

    let config = KmemConfig::default();
    HEAP_WINDOW.call_once(|| (config.region_start.as_usize(), config.region_limit));

    // SAFETY: the bootstrap pages were taken from the block allocator and are now
    // reserved in the frame map, so nothing else will ever use them.
    let kernel_memory = unsafe {
        KernelMemory::new(
            arch,
            direct_map.to_virtual(bootstrap),
            PAGES_PER_SUPERPAGE,
            config,
            pmem,
        )
    }
    .expect("failed to set up kernel memory");

    KERNEL_MEMORY.call_once(|| kernel_memory);
    PHASE.store(PHASE_READY, Ordering::SeqCst);

    log::info!(
        "mem: {} free in the low zone, {} pool pages",
        ByteSize::pages(memory().free_frames(Zone::Low)),
        memory().pool_pages()
    );
}

/// The kernel memory context, once [`init`] has run.
pub fn memory() -> &'static KernelMemory<X86Mapper> {
    KERNEL_MEMORY.get().expect("kernel memory is not initialized")
}

/// Exercises the allocators once at boot.
pub fn self_test() {
    use alloc::{boxed::Box, vec::Vec};

    let numbers: Vec<u64> = (0..1024).collect();
    let boxed = Box::new([0u8; 3000]);
    log::debug!(
        "mem: heap vector at {:p}, boxed array at {:p}",
        numbers.as_ptr(),
        boxed.as_ptr()
    );
    drop(boxed);
    drop(numbers);

    let memory = memory();
    let Some(mut space) = memory.create_space() else {
        log::error!("mem: could not create a process space");
        return;
    };
    match memory.alloc_space_pages(&mut space, 4) {
        Some(vaddr) => {
            log::debug!("mem: process pages at {}", vaddr);
            if let Err(err) = memory.free_space_pages(&mut space, vaddr) {
                log::error!("mem: freeing process pages failed: {}", err);
            }
        }
        None => log::error!("mem: could not allocate process pages"),
    }
    memory.delete_space(space);
}

#[global_allocator]
static KERNEL_ALLOCATOR: KernelAllocator = KernelAllocator;

/// Routes heap requests to the allocator of the current boot phase.
struct KernelAllocator;

impl KernelAllocator {
    fn in_heap(ptr: *mut u8) -> bool {
        HEAP_WINDOW
            .get()
            .is_some_and(|&(start, limit)| (start..limit).contains(&(ptr as usize)))
    }

    fn alloc_ready(memory: &KernelMemory<X86Mapper>, layout: Layout) -> *mut u8 {
        let ptr = if layout.align() <= OBJECT_ALIGN && layout.size() <= MAX_OBJECT_SIZE {
            memory.kmalloc(layout.size().max(1))
        } else if layout.align() <= SUPERPAGE_SIZE {
            // Page blocks are aligned to their own size.
            let pages = layout.size().div_ceil(PAGE_SIZE).max(layout.align() / PAGE_SIZE);
            memory.alloc_pages(pages).map(|vaddr| {
                // SAFETY: the heap never hands out address zero.
                unsafe { NonNull::new_unchecked(vaddr.as_mut_ptr::<u8>()) }
            })
        } else {
            None
        };
        ptr.map_or(core::ptr::null_mut(), NonNull::as_ptr)
    }
}

unsafe impl GlobalAlloc for KernelAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        match PHASE.load(Ordering::SeqCst) {
            PHASE_EARLY => BLOCKS
                .allocate(layout.size(), layout.align())
                .map(|paddr| direct_map().as_mut_ptr::<u8>(paddr))
                .inspect_err(|e| log::error!("block allocator error: {}", e))
                .unwrap_or(core::ptr::null_mut()),
            PHASE_READY => match KERNEL_MEMORY.get() {
                Some(memory) => Self::alloc_ready(memory, layout),
                None => core::ptr::null_mut(),
            },
            _ => {
                log::error!("mem: heap request of {} bytes during hand-over", layout.size());
                core::ptr::null_mut()
            }
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        let Some(ptr_nn) = NonNull::new(ptr) else {
            return;
        };

        if Self::in_heap(ptr) {
            // SAFETY: the pointer came from `alloc_ready`.
            unsafe { memory().kfree(ptr_nn) };
            return;
        }

        // Early allocations are reserved in the frame map once handed over; they stay put.
        if PHASE.load(Ordering::SeqCst) == PHASE_EARLY {
            let paddr = direct_map().to_physical(VirtualAddress::from_ptr(ptr));
            if let Err(err) = BLOCKS.free(paddr, layout.size()) {
                log::warn!("mem: early free of {} failed: {}", paddr, err);
            }
        }
    }
}
