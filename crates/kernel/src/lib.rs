// cSpell:ignore kenter

#![cfg_attr(not(test), no_std)]

extern crate alloc;

#[cfg(feature = "acpi")]
mod acpi;
mod arch;
mod console;
mod mem;
mod serial;

use limine::BaseRevision;

#[used]
#[unsafe(link_section = ".requests")]
static BASE_REVISION: BaseRevision = BaseRevision::with_revision(4);

pub fn kernel_main(stack_start: usize) -> ! {
    assert!(BASE_REVISION.is_supported());

    let console = console::Console::init();
    serial::init(console);
    arch::init();
    log::debug!("kernel stack at {:#x}", stack_start);

    let direct_map = mem::init_early();
    log::debug!("Block allocator initialized");

    #[cfg(feature = "acpi")]
    let numa = acpi::numa_topology(direct_map);
    #[cfg(not(feature = "acpi"))]
    let numa = kmm::NumaTopology::new();

    mem::init(direct_map, &numa);
    log::debug!("Kernel memory initialized and in use");

    mem::self_test();

    log::info!("boot complete");
    arch::park();
}

/// Reports a panic and stops this processor.
pub fn handle_panic(info: &core::panic::PanicInfo) -> ! {
    log::error!("PANIC: {}", info.message());
    if let Some(location) = info.location() {
        log::error!(" at {}", location)
    }

    log::error!("CPU parked");
    arch::park();
}
