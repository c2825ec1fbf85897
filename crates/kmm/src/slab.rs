//! Slab allocator for small kernel objects.
//!
//! Objects are grouped in power-of-two size classes from [`MIN_OBJECT_SIZE`] to
//! [`MAX_OBJECT_SIZE`]. A slab is a run of pages starting with a [`SlabHeader`], followed
//! by one occupancy mark per slot and then the slots themselves. Each class keeps its
//! headers on one of three lists:
//!
//! - `partial`: some slots free, served first
//! - `full`: no slot free
//! - `free`: every slot free, kept for reuse
//!
//! Larger requests bypass the slabs and go straight to the page allocator.

use core::mem::size_of;
use core::ptr::{self, NonNull};

use crate::arch::{PAGE_SIZE, SUPERPAGE_SIZE};
use crate::{AllocError, VirtualAddress};

/// Smallest object size; smaller requests are rounded up.
pub const MIN_OBJECT_SIZE: usize = 32;

/// Largest object size served from slabs.
pub const MAX_OBJECT_SIZE: usize = 2048;

/// Minimum number of slots a slab is sized for.
pub const MIN_OBJECTS_PER_SLAB: usize = 8;

/// Alignment of every object.
pub const OBJECT_ALIGN: usize = 16;

const NUM_CLASSES: usize = (MAX_OBJECT_SIZE.trailing_zeros() - MIN_OBJECT_SIZE.trailing_zeros()) as usize + 1;

/// Source of whole pages for slabs and for large requests.
pub trait PageSource {
    /// Allocates `pages` contiguous, mapped pages.
    fn alloc_pages(&mut self, pages: usize) -> Result<VirtualAddress, AllocError>;

    /// Releases an allocation made by [`PageSource::alloc_pages`].
    fn free_pages(&mut self, vaddr: VirtualAddress) -> Result<(), AllocError>;
}

/// Bookkeeping at the front of every slab.
#[repr(C)]
struct SlabHeader {
    next: Option<NonNull<SlabHeader>>,
    /// Address of slot 0.
    obj_head: usize,
    /// Number of slots.
    nr: u32,
    nused: u32,
    /// Lowest slot known to be free, `nr` when full.
    free: u32,
    pages: u32,
}

const HEADER_SIZE: usize = size_of::<SlabHeader>();

impl SlabHeader {
    /// Writes a header for `nr` slots of `size` bytes at `base`.
    unsafe fn init(base: VirtualAddress, pages: usize, nr: usize) -> NonNull<SlabHeader> {
        let marks = base + HEADER_SIZE;
        let obj_head = (marks + nr).align_up(OBJECT_ALIGN);
        let header = base.as_mut_ptr::<SlabHeader>();
        unsafe {
            header.write(SlabHeader {
                next: None,
                obj_head: obj_head.as_usize(),
                nr: nr as u32,
                nused: 0,
                free: 0,
                pages: pages as u32,
            });
            ptr::write_bytes(marks.as_mut_ptr::<u8>(), 0, nr);
            NonNull::new_unchecked(header)
        }
    }

    fn marks(&self) -> &[u8] {
        let marks = unsafe { (self as *const SlabHeader).add(1) as *const u8 };
        unsafe { core::slice::from_raw_parts(marks, self.nr as usize) }
    }

    fn marks_mut(&mut self) -> &mut [u8] {
        let marks = unsafe { (self as *mut SlabHeader).add(1) as *mut u8 };
        unsafe { core::slice::from_raw_parts_mut(marks, self.nr as usize) }
    }

    fn contains(&self, addr: usize, size: usize) -> bool {
        addr >= self.obj_head && addr < self.obj_head + self.nr as usize * size
    }

    /// Whether `addr` lies in the pages of this slab, header included.
    fn spans(&self, addr: usize) -> bool {
        let base = self.base().as_usize();
        addr >= base && addr < base + self.pages as usize * PAGE_SIZE
    }

    fn base(&self) -> VirtualAddress {
        VirtualAddress::from_ptr(self as *const SlabHeader)
    }

    /// First slot without a mark, `nr` when every slot is taken.
    fn scan_free(&self) -> u32 {
        self.marks()
            .iter()
            .position(|&mark| mark == 0)
            .map_or(self.nr, |slot| slot as u32)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum List {
    Partial,
    Full,
    Free,
}

/// Headers of one size class.
struct SizeClass {
    size: usize,
    /// Pages per slab.
    pages: usize,
    /// Slots per slab.
    nr: usize,
    partial: Option<NonNull<SlabHeader>>,
    full: Option<NonNull<SlabHeader>>,
    free: Option<NonNull<SlabHeader>>,
}

impl SizeClass {
    fn new(size: usize) -> Self {
        let mut pages = 1;
        while slots(size, pages) < MIN_OBJECTS_PER_SLAB {
            pages *= 2;
        }
        Self {
            size,
            pages,
            nr: slots(size, pages),
            partial: None,
            full: None,
            free: None,
        }
    }

    fn list(&mut self, list: List) -> &mut Option<NonNull<SlabHeader>> {
        match list {
            List::Partial => &mut self.partial,
            List::Full => &mut self.full,
            List::Free => &mut self.free,
        }
    }

    fn push(&mut self, list: List, mut header: NonNull<SlabHeader>) {
        let head = self.list(list);
        unsafe { header.as_mut().next = *head };
        *head = Some(header);
    }

    fn unlink(&mut self, list: List, header: NonNull<SlabHeader>) {
        let head = self.list(list);
        let mut cursor = *head;
        let mut prev: Option<NonNull<SlabHeader>> = None;
        while let Some(mut current) = cursor {
            let next = unsafe { current.as_ref().next };
            if current == header {
                match prev {
                    Some(mut prev) => unsafe { prev.as_mut().next = next },
                    None => *head = next,
                }
                unsafe { current.as_mut().next = None };
                return;
            }
            prev = cursor;
            cursor = next;
        }
    }

    fn find(&self, list: List, addr: usize) -> Option<NonNull<SlabHeader>> {
        let mut cursor = match list {
            List::Partial => self.partial,
            List::Full => self.full,
            List::Free => self.free,
        };
        while let Some(header) = cursor {
            let header_ref = unsafe { header.as_ref() };
            if header_ref.contains(addr, self.size) {
                return Some(header);
            }
            cursor = header_ref.next;
        }
        None
    }

    fn headers(&self, list: List) -> impl Iterator<Item = &SlabHeader> {
        let head = match list {
            List::Partial => self.partial,
            List::Full => self.full,
            List::Free => self.free,
        };
        core::iter::successors(head.map(|header| unsafe { &*header.as_ptr() }), |header| {
            header.next.map(|next| unsafe { &*next.as_ptr() })
        })
    }
}

/// Number of slots a slab of `pages` pages holds for objects of `size` bytes.
///
/// Every slot costs its size plus one mark byte; the slots start at the first aligned
/// address after the marks.
const fn slots(size: usize, pages: usize) -> usize {
    (pages * PAGE_SIZE - HEADER_SIZE - (OBJECT_ALIGN - 1)) / (size + 1)
}

/// Size class index serving `size` bytes.
fn class_index(size: usize) -> usize {
    let size = size.max(MIN_OBJECT_SIZE).next_power_of_two();
    (size.trailing_zeros() - MIN_OBJECT_SIZE.trailing_zeros()) as usize
}

/// Occupancy of one size class.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClassStats {
    pub size: usize,
    pub pages_per_slab: usize,
    pub objects_per_slab: usize,
    pub partial: usize,
    pub full: usize,
    pub free: usize,
    /// Objects handed out across every slab of the class.
    pub used: usize,
}

/// All size classes.
pub struct Slab {
    classes: [SizeClass; NUM_CLASSES],
}

// Slab headers are only reachable through the slab, which is always behind the kmem lock.
unsafe impl Send for Slab {}

impl Slab {
    pub fn new() -> Self {
        Self {
            classes: core::array::from_fn(|index| SizeClass::new(MIN_OBJECT_SIZE << index)),
        }
    }

    /// Allocates `size` bytes.
    ///
    /// Requests above [`MAX_OBJECT_SIZE`] take whole pages from `source`. Returns `None`
    /// for zero-sized requests and on exhaustion.
    pub fn alloc(&mut self, size: usize, source: &mut dyn PageSource) -> Option<NonNull<u8>> {
        if size == 0 {
            return None;
        }
        if size > MAX_OBJECT_SIZE {
            let vaddr = source.alloc_pages(size.div_ceil(PAGE_SIZE)).ok()?;
            return NonNull::new(vaddr.as_mut_ptr::<u8>());
        }

        let class = &mut self.classes[class_index(size)];
        let mut header = match class.partial {
            Some(header) => header,
            None => {
                if class.free.is_none() {
                    let base = source.alloc_pages(class.pages).ok()?;
                    let header = unsafe { SlabHeader::init(base, class.pages, class.nr) };
                    log::trace!("slab: new {}-byte slab at {} ({} slots)", class.size, base, class.nr);
                    class.push(List::Free, header);
                }
                let header = class.free?;
                class.unlink(List::Free, header);
                class.push(List::Partial, header);
                header
            }
        };

        let (object, full) = {
            let header_ref = unsafe { header.as_mut() };
            let slot = header_ref.free as usize;
            debug_assert!(slot < header_ref.nr as usize);
            header_ref.marks_mut()[slot] = 1;
            header_ref.nused += 1;
            header_ref.free = header_ref.scan_free();
            (header_ref.obj_head + slot * class.size, header_ref.nused == header_ref.nr)
        };

        if full {
            class.unlink(List::Partial, header);
            class.push(List::Full, header);
        }
        NonNull::new(object as *mut u8)
    }

    /// Releases memory obtained from [`Slab::alloc`].
    ///
    /// Pointers that belong to no slab and to no page allocation are ignored.
    ///
    /// # Safety
    ///
    /// `ptr` must not be used after this call.
    pub unsafe fn free(&mut self, ptr: NonNull<u8>, source: &mut dyn PageSource) {
        let addr = ptr.as_ptr() as usize;
        let vaddr = VirtualAddress::from_ptr(ptr.as_ptr());
        if vaddr.is_aligned(SUPERPAGE_SIZE) && !self.owns(addr) {
            if let Err(error) = source.free_pages(vaddr) {
                log::warn!("slab: free of {} failed: {}", vaddr, error);
            }
            return;
        }

        for class in &mut self.classes {
            let found = [List::Partial, List::Full]
                .into_iter()
                .find_map(|list| class.find(list, addr).map(|header| (list, header)));
            let Some((list, mut header)) = found else {
                continue;
            };

            let target = {
                let header_ref = unsafe { header.as_mut() };
                let offset = addr - header_ref.obj_head;
                let slot = offset / class.size;
                if offset % class.size != 0 || header_ref.marks()[slot] == 0 {
                    log::warn!("slab: ignoring free of {} (not a live {}-byte object)", vaddr, class.size);
                    return;
                }

                header_ref.marks_mut()[slot] = 0;
                header_ref.nused -= 1;
                header_ref.free = header_ref.free.min(slot as u32);
                if header_ref.nused == 0 { List::Free } else { List::Partial }
            };
            if target != list {
                class.unlink(list, header);
                class.push(target, header);
            }
            return;
        }

        if self.owns(addr) {
            log::warn!("slab: ignoring free of {} inside a slab", vaddr);
        } else if vaddr.is_aligned(PAGE_SIZE) {
            if let Err(error) = source.free_pages(vaddr) {
                log::warn!("slab: ignoring free of unknown pointer {}: {}", vaddr, error);
            }
        } else {
            log::warn!("slab: ignoring free of unknown pointer {}", vaddr);
        }
    }

    /// Whether `addr` lies in the pages of any slab, on any list.
    fn owns(&self, addr: usize) -> bool {
        self.classes.iter().any(|class| {
            [List::Partial, List::Full, List::Free]
                .into_iter()
                .any(|list| class.headers(list).any(|header| header.spans(addr)))
        })
    }

    /// Occupancy of the class serving `size`, `None` when no class does.
    pub fn class_stats(&self, size: usize) -> Option<ClassStats> {
        if size == 0 || size > MAX_OBJECT_SIZE {
            return None;
        }
        let class = &self.classes[class_index(size)];
        Some(ClassStats {
            size: class.size,
            pages_per_slab: class.pages,
            objects_per_slab: class.nr,
            partial: class.headers(List::Partial).count(),
            full: class.headers(List::Full).count(),
            free: class.headers(List::Free).count(),
            used: [List::Partial, List::Full]
                .into_iter()
                .flat_map(|list| class.headers(list))
                .map(|header| header.nused as usize)
                .sum(),
        })
    }

    /// Checks that every header sits on the list its occupancy calls for.
    pub fn is_consistent(&self) -> bool {
        self.classes.iter().all(|class| {
            [List::Partial, List::Full, List::Free].into_iter().all(|list| {
                class.headers(list).all(|header| {
                    let marked = header.marks().iter().filter(|&&mark| mark != 0).count();
                    let expected = match header.nused {
                        0 => List::Free,
                        n if n == header.nr => List::Full,
                        _ => List::Partial,
                    };
                    marked == header.nused as usize
                        && header.nused <= header.nr
                        && header.pages as usize == class.pages
                        && header.base().is_aligned(PAGE_SIZE)
                        && expected == list
                })
            })
        })
    }
}

impl Default for Slab {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::HostPages;
    use alloc::vec::Vec;

    #[test]
    fn classes_hold_enough_objects() {
        let slab = Slab::new();
        for class in &slab.classes {
            assert!(class.nr >= MIN_OBJECTS_PER_SLAB);
            assert!(class.pages.is_power_of_two());
            let end = HEADER_SIZE + class.nr + (OBJECT_ALIGN - 1) + class.nr * class.size;
            assert!(end <= class.pages * PAGE_SIZE);
        }
        assert_eq!(slab.classes[0].size, MIN_OBJECT_SIZE);
        assert_eq!(slab.classes[NUM_CLASSES - 1].size, MAX_OBJECT_SIZE);
        assert_eq!(slab.classes[NUM_CLASSES - 1].pages, 8);
    }

    #[test]
    fn sizes_map_to_classes() {
        assert_eq!(class_index(1), 0);
        assert_eq!(class_index(32), 0);
        assert_eq!(class_index(33), 1);
        assert_eq!(class_index(40), 1);
        assert_eq!(class_index(2048), NUM_CLASSES - 1);
    }

    #[test]
    fn two_small_objects_share_a_fresh_slab() {
        let mut pages = HostPages::new();
        let mut slab = Slab::new();
        assert_eq!(slab.class_stats(40).unwrap().partial, 0);

        let a = slab.alloc(40, &mut pages).unwrap();
        let stats = slab.class_stats(40).unwrap();
        assert_eq!((stats.partial, stats.full, stats.free), (1, 0, 0));

        let b = slab.alloc(40, &mut pages).unwrap();
        assert_ne!(a, b);
        assert_eq!(b.as_ptr() as usize - a.as_ptr() as usize, 64);
        assert_eq!(pages.requests(), [1]);
        assert_eq!(a.as_ptr() as usize % OBJECT_ALIGN, 0);

        let stats = slab.class_stats(40).unwrap();
        assert_eq!((stats.partial, stats.used), (1, 2));
        assert!(slab.is_consistent());
    }

    #[test]
    fn large_requests_go_to_pages() {
        let mut pages = HostPages::new();
        let mut slab = Slab::new();

        let ptr = slab.alloc(MAX_OBJECT_SIZE + 1, &mut pages).unwrap();
        assert_eq!(pages.requests(), [1]);
        let ptr2 = slab.alloc(3 * PAGE_SIZE + 1, &mut pages).unwrap();
        assert_eq!(pages.requests(), [1, 4]);

        unsafe {
            slab.free(ptr, &mut pages);
            slab.free(ptr2, &mut pages);
        }
        assert_eq!(pages.live(), 0);
    }

    #[test]
    fn emptied_slab_is_reused() {
        let mut pages = HostPages::new();
        let mut slab = Slab::new();
        let nr = slab.class_stats(256).unwrap().objects_per_slab;

        let objects: Vec<_> = (0..nr).map(|_| slab.alloc(256, &mut pages).unwrap()).collect();
        let stats = slab.class_stats(256).unwrap();
        assert_eq!((stats.partial, stats.full, stats.free), (0, 1, 0));

        for &object in &objects {
            unsafe { slab.free(object, &mut pages) };
            assert!(slab.is_consistent());
        }
        let stats = slab.class_stats(256).unwrap();
        assert_eq!((stats.partial, stats.full, stats.free), (0, 0, 1));

        let again = slab.alloc(200, &mut pages).unwrap();
        assert_eq!(again, objects[0]);
        assert_eq!(pages.requests().len(), 1);
        assert_eq!(slab.class_stats(256).unwrap().free, 0);
    }

    #[test]
    fn freed_slots_are_found_again() {
        let mut pages = HostPages::new();
        let mut slab = Slab::new();

        let objects: Vec<_> = (0..5).map(|_| slab.alloc(64, &mut pages).unwrap()).collect();
        unsafe { slab.free(objects[2], &mut pages) };
        assert_eq!(slab.alloc(64, &mut pages), Some(objects[2]));
        assert_eq!(slab.alloc(64, &mut pages).map(|p| p.as_ptr() as usize), Some(objects[4].as_ptr() as usize + 64));
    }

    #[test]
    fn second_slab_when_first_is_full() {
        let mut pages = HostPages::new();
        let mut slab = Slab::new();
        let nr = slab.class_stats(2048).unwrap().objects_per_slab;

        let objects: Vec<_> = (0..nr + 1).map(|_| slab.alloc(2048, &mut pages).unwrap()).collect();
        assert_eq!(pages.requests(), [8, 8]);
        let stats = slab.class_stats(2048).unwrap();
        assert_eq!((stats.partial, stats.full), (1, 1));

        unsafe { slab.free(objects[0], &mut pages) };
        let stats = slab.class_stats(2048).unwrap();
        assert_eq!((stats.partial, stats.full), (2, 0));
        assert!(slab.is_consistent());
    }

    #[test]
    fn unknown_pointers_are_ignored() {
        let mut pages = HostPages::new();
        let mut slab = Slab::new();
        let object = slab.alloc(128, &mut pages).unwrap();

        let mut outside = [0u8; 64];
        let stray = NonNull::new(outside.as_mut_ptr().wrapping_add(1)).unwrap();
        let inside = NonNull::new(object.as_ptr().wrapping_add(8)).unwrap();
        unsafe {
            slab.free(stray, &mut pages);
            slab.free(inside, &mut pages);
            slab.free(object, &mut pages);
            slab.free(object, &mut pages);
        }

        let stats = slab.class_stats(128).unwrap();
        assert_eq!((stats.free, stats.used), (1, 0));
        assert!(slab.is_consistent());
    }

    #[test]
    fn slab_pages_are_not_released_by_address() {
        let mut pages = HostPages::new();
        let mut slab = Slab::new();
        let object = slab.alloc(64, &mut pages).unwrap();
        let base = VirtualAddress::from_ptr(object.as_ptr()).align_down(PAGE_SIZE);
        assert_eq!(pages.live(), 1);

        unsafe { slab.free(NonNull::new(base.as_mut_ptr::<u8>()).unwrap(), &mut pages) };
        assert_eq!(pages.live(), 1);
        assert_eq!(slab.class_stats(64).unwrap().used, 1);

        unsafe { slab.free(object, &mut pages) };
        assert_eq!(slab.class_stats(64).unwrap().used, 0);
        unsafe { slab.free(NonNull::new(base.as_mut_ptr::<u8>()).unwrap(), &mut pages) };
        assert_eq!(pages.live(), 1);
        assert!(slab.is_consistent());
    }

    #[test]
    fn zero_sized_requests_fail() {
        let mut pages = HostPages::new();
        let mut slab = Slab::new();
        assert_eq!(slab.alloc(0, &mut pages), None);
        assert!(pages.requests().is_empty());
    }

    #[test]
    fn exhausted_source_fails_softly() {
        let mut pages = HostPages::with_limit(1);
        let mut slab = Slab::new();
        let nr = slab.class_stats(32).unwrap().objects_per_slab;

        for _ in 0..nr {
            slab.alloc(32, &mut pages).unwrap();
        }
        assert_eq!(slab.alloc(32, &mut pages), None);
        assert_eq!(slab.alloc(4096 * 2, &mut pages), None);
        assert!(slab.is_consistent());
    }
}
