//! Software page tables for host testing.
//!
//! Translations are recorded in ordered maps instead of hardware tables, but the mapper
//! enforces the same contract as the x86_64 implementation: granule alignment, no mixing
//! of superpage and base-page translations over the same span, and one table frame
//! consumed for every page directory or page table that would exist in hardware.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::Mutex;

use super::{ArchMapper, FrameAllocator, MapError, MapFlags, MAX_VIRTUAL_BITS, PAGE_SIZE, SUPERPAGE_SIZE};
use crate::{PhysicalAddress, VirtualAddress};

/// Span covered by one emulated page directory.
const DIRECTORY_SPAN: usize = 1 << 30;

/// Span covered by one top-level entry.
const TOP_LEVEL_SPAN: usize = 1 << 39;

/// Translations shared by every space created from the same boot mapper.
type SharedTranslations = Arc<Mutex<BTreeMap<usize, (PhysicalAddress, MapFlags)>>>;

/// An emulated address space.
pub struct SoftwareMapper {
    root: PhysicalAddress,
    width: u32,
    /// Translations private to this space, keyed by virtual address.
    translations: BTreeMap<usize, (PhysicalAddress, MapFlags)>,
    /// Global translations, visible from every space.
    global: SharedTranslations,
    /// Emulated intermediate tables, keyed by the span they cover.
    directories: BTreeMap<usize, PhysicalAddress>,
    page_tables: BTreeMap<usize, PhysicalAddress>,
    /// Top-level tables of the kernel window, keyed by slot and shared by every space.
    kernel_slots: BTreeMap<usize, PhysicalAddress>,
    invalidations: usize,
}

impl SoftwareMapper {
    /// Creates the boot address space.
    pub fn new(root: PhysicalAddress) -> Self {
        Self::with_width(root, MAX_VIRTUAL_BITS as u32)
    }

    /// Creates a boot address space with a custom virtual width.
    pub fn with_width(root: PhysicalAddress, width: u32) -> Self {
        Self {
            root,
            width,
            translations: BTreeMap::new(),
            global: Arc::new(Mutex::new(BTreeMap::new())),
            directories: BTreeMap::new(),
            page_tables: BTreeMap::new(),
            kernel_slots: BTreeMap::new(),
            invalidations: 0,
        }
    }

    /// Number of translation invalidations performed so far.
    pub fn invalidations(&self) -> usize {
        self.invalidations
    }

    /// Number of emulated table frames held by this space.
    pub fn table_frames(&self) -> usize {
        self.directories.len() + self.page_tables.len()
    }

    /// Number of top-level kernel slots this space shares.
    pub fn kernel_slots(&self) -> usize {
        self.kernel_slots.len()
    }

    /// Number of translations private to this space.
    pub fn private_mappings(&self) -> usize {
        self.translations.len()
    }

    /// Returns the recorded translation starting exactly at `vaddr`.
    pub fn translation(&self, vaddr: VirtualAddress) -> Option<(PhysicalAddress, MapFlags)> {
        let key = vaddr.as_usize();
        self.translations
            .get(&key)
            .copied()
            .or_else(|| self.global.lock().get(&key).copied())
    }

    /// Finds the translation covering `vaddr`, at either granularity.
    fn covering(&self, vaddr: usize) -> Option<(usize, PhysicalAddress, MapFlags)> {
        let lookup = |map: &BTreeMap<usize, (PhysicalAddress, MapFlags)>| {
            map.range(..=vaddr)
                .next_back()
                .filter(|(start, (_, flags))| vaddr < **start + flags.granule())
                .map(|(start, (paddr, flags))| (*start, *paddr, *flags))
        };
        lookup(&self.translations).or_else(|| lookup(&self.global.lock()))
    }

    fn has_page_inside(&self, superpage: usize) -> bool {
        let range = superpage..superpage + SUPERPAGE_SIZE;
        let inside = |map: &BTreeMap<usize, (PhysicalAddress, MapFlags)>| {
            map.range(range.clone())
                .any(|(_, (_, flags))| !flags.contains(MapFlags::SUPERPAGE))
        };
        inside(&self.translations) || inside(&self.global.lock())
    }

    fn ensure_table(
        tables: &mut BTreeMap<usize, PhysicalAddress>,
        key: usize,
        frames: &mut dyn FrameAllocator,
    ) -> Result<(), MapError> {
        if !tables.contains_key(&key) {
            let frame = frames.allocate_frame().ok_or(MapError::OutOfTables)?;
            tables.insert(key, frame);
        }
        Ok(())
    }
}

impl ArchMapper for SoftwareMapper {
    fn map(
        &mut self,
        vaddr: VirtualAddress,
        paddr: PhysicalAddress,
        flags: MapFlags,
        frames: &mut dyn FrameAllocator,
    ) -> Result<(), MapError> {
        let granule = flags.granule();
        if !vaddr.is_aligned(granule) || !paddr.is_aligned(granule) {
            return Err(MapError::Misaligned);
        }

        let va = vaddr.as_usize();
        let superpage = va & !(SUPERPAGE_SIZE - 1);
        if flags.contains(MapFlags::SUPERPAGE) {
            if self.has_page_inside(superpage) {
                return Err(MapError::Conflict);
            }
        } else if let Some((_, _, existing)) = self.covering(va) {
            if existing.contains(MapFlags::SUPERPAGE) {
                return Err(MapError::Conflict);
            }
        }

        Self::ensure_table(&mut self.directories, va & !(DIRECTORY_SPAN - 1), frames)?;
        if flags.contains(MapFlags::SUPERPAGE) {
            // An emptied page table is replaced by the large translation.
            if let Some(table) = self.page_tables.remove(&superpage) {
                frames.deallocate_frame(table);
            }
        } else {
            Self::ensure_table(&mut self.page_tables, superpage, frames)?;
        }

        if flags.contains(MapFlags::GLOBAL) {
            self.global.lock().insert(va, (paddr, flags));
        } else {
            self.translations.insert(va, (paddr, flags));
        }
        self.invalidations += 1;
        Ok(())
    }

    fn unmap(&mut self, vaddr: VirtualAddress, flags: MapFlags) -> Result<PhysicalAddress, MapError> {
        if !vaddr.is_aligned(flags.granule()) {
            return Err(MapError::Misaligned);
        }

        let va = vaddr.as_usize();
        let (start, paddr, existing) = self.covering(va).ok_or(MapError::NotMapped)?;
        if start != va
            || existing.contains(MapFlags::SUPERPAGE) != flags.contains(MapFlags::SUPERPAGE)
        {
            return Err(MapError::Conflict);
        }

        if self.translations.remove(&va).is_none() {
            self.global.lock().remove(&va);
        }
        self.invalidations += 1;
        Ok(paddr)
    }

    fn v2p(&self, vaddr: VirtualAddress) -> Option<PhysicalAddress> {
        let va = vaddr.as_usize();
        self.covering(va)
            .map(|(start, paddr, _)| paddr + (va - start))
    }

    fn addr_width(&self) -> u32 {
        self.width
    }

    fn root(&self) -> PhysicalAddress {
        self.root
    }

    fn prepare_kernel_window(
        &mut self,
        start: VirtualAddress,
        end: usize,
        frames: &mut dyn FrameAllocator,
    ) -> Result<(), MapError> {
        if end <= start.as_usize() {
            return Err(MapError::Misaligned);
        }
        for slot in start.as_usize() / TOP_LEVEL_SPAN..=(end - 1) / TOP_LEVEL_SPAN {
            Self::ensure_table(&mut self.kernel_slots, slot, frames)?;
        }
        Ok(())
    }

    fn new_space(&self, root: PhysicalAddress) -> Self {
        Self {
            root,
            width: self.width,
            translations: BTreeMap::new(),
            global: self.global.clone(),
            directories: BTreeMap::new(),
            page_tables: BTreeMap::new(),
            kernel_slots: self.kernel_slots.clone(),
            invalidations: 0,
        }
    }

    fn release(&mut self, frames: &mut dyn FrameAllocator) {
        let tables: Vec<PhysicalAddress> = self
            .directories
            .values()
            .chain(self.page_tables.values())
            .copied()
            .collect();
        for table in tables {
            frames.deallocate_frame(table);
        }
        self.directories.clear();
        self.page_tables.clear();
        self.translations.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Hands out consecutive frames and remembers what came back.
    struct CountingFrames {
        next: usize,
        freed: Vec<PhysicalAddress>,
    }

    impl CountingFrames {
        fn new() -> Self {
            Self {
                next: 0x10_0000,
                freed: Vec::new(),
            }
        }
    }

    impl FrameAllocator for CountingFrames {
        fn allocate_frame(&mut self) -> Option<PhysicalAddress> {
            let frame = PhysicalAddress::new(self.next);
            self.next += PAGE_SIZE;
            Some(frame)
        }

        fn deallocate_frame(&mut self, frame: PhysicalAddress) {
            self.freed.push(frame);
        }
    }

    #[test]
    fn maps_and_resolves_pages() {
        let mut frames = CountingFrames::new();
        let mut mapper = SoftwareMapper::new(PhysicalAddress::new(0x1000));
        let vaddr = VirtualAddress::new(0x4000_3000);
        let paddr = PhysicalAddress::new(0x20_5000);

        mapper.map(vaddr, paddr, MapFlags::USABLE | MapFlags::USED, &mut frames).unwrap();

        assert_eq!(mapper.v2p(vaddr + 0x12), Some(paddr + 0x12));
        assert_eq!(mapper.table_frames(), 2);
        assert_eq!(mapper.invalidations(), 1);
    }

    #[test]
    fn rejects_misaligned_superpages() {
        let mut frames = CountingFrames::new();
        let mut mapper = SoftwareMapper::new(PhysicalAddress::new(0x1000));
        let result = mapper.map(
            VirtualAddress::new(0x4000_1000),
            PhysicalAddress::new(0x40_0000),
            MapFlags::KERNEL_SUPERPAGE,
            &mut frames,
        );
        assert_eq!(result, Err(MapError::Misaligned));

        let result = mapper.map(
            VirtualAddress::new(0x4000_0000),
            PhysicalAddress::new(0x40_1000),
            MapFlags::KERNEL_SUPERPAGE,
            &mut frames,
        );
        assert_eq!(result, Err(MapError::Misaligned));
    }

    #[test]
    fn refuses_mixed_granularity() {
        let mut frames = CountingFrames::new();
        let mut mapper = SoftwareMapper::new(PhysicalAddress::new(0x1000));
        let base = VirtualAddress::new(0x4000_0000);
        mapper
            .map(base, PhysicalAddress::new(0x40_0000), MapFlags::KERNEL_SUPERPAGE, &mut frames)
            .unwrap();

        let page = mapper.map(base + PAGE_SIZE, PhysicalAddress::new(0x1000), MapFlags::KERNEL_PAGE, &mut frames);
        assert_eq!(page, Err(MapError::Conflict));
        assert_eq!(mapper.unmap(base, MapFlags::KERNEL_PAGE), Err(MapError::Conflict));
    }

    #[test]
    fn remapping_replaces_translation() {
        let mut frames = CountingFrames::new();
        let mut mapper = SoftwareMapper::new(PhysicalAddress::new(0x1000));
        let vaddr = VirtualAddress::new(0x4000_0000);
        mapper.map(vaddr, PhysicalAddress::new(0x5000), MapFlags::USABLE, &mut frames).unwrap();
        mapper.map(vaddr, PhysicalAddress::new(0x9000), MapFlags::USABLE, &mut frames).unwrap();

        assert_eq!(mapper.v2p(vaddr), Some(PhysicalAddress::new(0x9000)));
        assert_eq!(mapper.invalidations(), 2);
    }

    #[test]
    fn superpage_replaces_empty_page_table() {
        let mut frames = CountingFrames::new();
        let mut mapper = SoftwareMapper::new(PhysicalAddress::new(0x1000));
        let base = VirtualAddress::new(0x4000_0000);
        mapper.map(base, PhysicalAddress::new(0x5000), MapFlags::KERNEL_PAGE, &mut frames).unwrap();
        assert_eq!(mapper.unmap(base, MapFlags::KERNEL_PAGE), Ok(PhysicalAddress::new(0x5000)));
        assert_eq!(mapper.v2p(base), None);

        mapper
            .map(base, PhysicalAddress::new(0x40_0000), MapFlags::KERNEL_SUPERPAGE, &mut frames)
            .unwrap();
        assert_eq!(frames.freed.len(), 1);
        assert_eq!(mapper.v2p(base + 0x1234), Some(PhysicalAddress::new(0x40_1234)));
    }

    #[test]
    fn spaces_share_global_translations() {
        let mut frames = CountingFrames::new();
        let mut kernel = SoftwareMapper::new(PhysicalAddress::new(0x1000));
        let kernel_va = VirtualAddress::new(0xFFFF_C000_0000_0000);
        kernel
            .map(kernel_va, PhysicalAddress::new(0x40_0000), MapFlags::KERNEL_SUPERPAGE, &mut frames)
            .unwrap();

        let mut user = kernel.new_space(PhysicalAddress::new(0x2000));
        let user_va = VirtualAddress::new(0x4000_0000);
        user.map(user_va, PhysicalAddress::new(0x7000), MapFlags::USABLE | MapFlags::USER, &mut frames)
            .unwrap();

        assert_eq!(user.v2p(kernel_va), Some(PhysicalAddress::new(0x40_0000)));
        assert_eq!(kernel.v2p(user_va), None);

        let before = frames.freed.len();
        user.release(&mut frames);
        assert_eq!(frames.freed.len() - before, 2);
        assert_eq!(user.table_frames(), 0);
    }

    #[test]
    fn kernel_window_slots_are_shared_and_kept() {
        let mut frames = CountingFrames::new();
        let mut kernel = SoftwareMapper::new(PhysicalAddress::new(0x1000));
        let start = VirtualAddress::new(0xFFFF_C000_0000_0000);
        kernel
            .prepare_kernel_window(start, 0xFFFF_C000_0000_0000 + 3 * TOP_LEVEL_SPAN, &mut frames)
            .unwrap();
        assert_eq!(kernel.kernel_slots(), 3);
        assert_eq!(kernel.table_frames(), 0);

        // Preparing an overlapping window again takes no new frames.
        let taken = frames.next;
        kernel.prepare_kernel_window(start, start.as_usize() + 1, &mut frames).unwrap();
        assert_eq!(frames.next, taken);

        let mut user = kernel.new_space(PhysicalAddress::new(0x2000));
        assert_eq!(user.kernel_slots(), 3);
        user.release(&mut frames);
        assert!(frames.freed.is_empty());
        assert_eq!(
            kernel.prepare_kernel_window(start, start.as_usize(), &mut frames),
            Err(MapError::Misaligned)
        );
    }
}
