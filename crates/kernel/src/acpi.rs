//! Firmware tables needed by memory bring-up.
//!
//! Only the SRAT is read: it tells the physical allocator which NUMA domain each range of
//! RAM belongs to.

use core::ptr::NonNull;

use acpi::{
    AcpiHandler, AcpiTable, AcpiTables, PhysicalMapping,
    sdt::{SdtHeader, Signature},
};
use kmm::{DirectMap, NumaTopology, PhysicalAddress, VirtualAddress};
use limine::request::RsdpRequest;

#[used]
#[unsafe(link_section = ".requests")]
static RSDP_REQUEST: RsdpRequest = RsdpRequest::new();

/// Hands out firmware tables through the boot loader's direct map.
#[derive(Clone, Copy)]
struct DirectMapHandler(DirectMap);

impl core::fmt::Debug for DirectMapHandler {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DirectMapHandler")
            .field("offset", &format_args!("{:#x}", self.0.offset()))
            .finish()
    }
}

impl AcpiHandler for DirectMapHandler {
    unsafe fn map_physical_region<T>(&self, physical_address: usize, size: usize) -> PhysicalMapping<Self, T> {
        let virt = self.0.as_mut_ptr::<T>(PhysicalAddress::new(physical_address));
        // The direct map never places anything at address zero.
        let virt = unsafe { NonNull::new_unchecked(virt) };
        unsafe { PhysicalMapping::new(physical_address, virt, size, size, *self) }
    }

    fn unmap_physical_region<T>(_region: &PhysicalMapping<Self, T>) {
        // Direct-mapped tables stay mapped.
    }
}

/// System Resource Affinity Table, header only; entries are read as raw bytes.
#[repr(C)]
struct Srat {
    header: SdtHeader,
}

unsafe impl AcpiTable for Srat {
    const SIGNATURE: Signature = Signature::SRAT;

    fn header(&self) -> &SdtHeader {
        &self.header
    }
}

/// Reads the memory affinity of the machine.
///
/// Machines without ACPI or without an SRAT are treated as a single memory domain.
pub fn numa_topology(direct_map: DirectMap) -> NumaTopology {
    let Some(rsdp) = RSDP_REQUEST.get_response() else {
        log::debug!("acpi: no RSDP from the boot loader");
        return NumaTopology::new();
    };

    // Limine Base Revision 4 returns the RSDP address as virtual
    // However, the ACPI crate works in physical addresses, so we need to translate it
    let rsdp_addr = match rsdp.address() {
        addr if addr >= direct_map.offset() => direct_map.to_physical(VirtualAddress::new(addr)).as_usize(),
        addr => addr,
    };

    let tables = match unsafe { AcpiTables::from_rsdp(DirectMapHandler(direct_map), rsdp_addr) } {
        Ok(tables) => tables,
        Err(err) => {
            log::warn!("acpi: failed to read tables: {:?}", err);
            return NumaTopology::new();
        }
    };

    let srat = match tables.find_table::<Srat>() {
        Ok(srat) => srat,
        Err(_) => {
            log::debug!("acpi: no SRAT, assuming uniform memory");
            return NumaTopology::new();
        }
    };

    let length = srat.header.length as usize;
    // SAFETY: the whole table is reachable through the direct map and firmware tables are
    // never written.
    let bytes = unsafe { core::slice::from_raw_parts(srat.virtual_start().as_ptr().cast::<u8>(), length) };

    match NumaTopology::from_srat(bytes) {
        Ok(topology) => {
            log::info!("acpi: {} memory domains", topology.domain_count());
            topology
        }
        Err(err) => {
            log::warn!("acpi: ignoring SRAT: {}", err);
            NumaTopology::new()
        }
    }
}
