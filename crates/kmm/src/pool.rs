//! Pool of pre-mapped pages for allocator metadata.
//!
//! Region descriptors, superpage arrays and the page arrays of demoted superpages cannot
//! be allocated through the allocator they describe. They are carved from this pool
//! instead, which only ever holds pages that are already mapped in the kernel space.
//!
//! Free runs are linked through their own first page, sorted by address and coalesced on
//! release, so the pool needs no storage of its own.

use core::marker::PhantomData;
use core::mem::{align_of, size_of};
use core::ops::{Deref, DerefMut};
use core::ptr::{self, NonNull};

use crate::arch::PAGE_SIZE;
use crate::{AllocError, VirtualAddress};

/// Header written into the first page of every free run.
struct PoolRun {
    next: Option<NonNull<PoolRun>>,
    pages: usize,
}

/// First-fit allocator of whole, zeroed, kernel-mapped pages.
pub struct PagePool {
    head: Option<NonNull<PoolRun>>,
    free: usize,
    donated: usize,
}

// Runs are only reachable through the pool, which is always behind the kmem lock.
unsafe impl Send for PagePool {}

impl PagePool {
    pub const fn new() -> Self {
        Self {
            head: None,
            free: 0,
            donated: 0,
        }
    }

    /// Number of free pages.
    pub fn free_pages(&self) -> usize {
        self.free
    }

    /// Number of pages ever given to the pool.
    pub fn donated_pages(&self) -> usize {
        self.donated
    }

    /// Number of separate free runs.
    pub fn runs(&self) -> usize {
        let mut count = 0;
        let mut cursor = self.head;
        while let Some(run) = cursor {
            count += 1;
            cursor = unsafe { run.as_ref().next };
        }
        count
    }

    /// Hands `pages` pages starting at `start` to the pool.
    ///
    /// # Safety
    ///
    /// The range must be mapped, writable, page-aligned and not used by anything else for
    /// as long as the pool lives.
    pub unsafe fn donate(&mut self, start: VirtualAddress, pages: usize) {
        debug_assert!(start.is_aligned(PAGE_SIZE));
        if pages == 0 {
            return;
        }
        self.donated += pages;
        unsafe { self.insert(start, pages) };
        log::debug!("pool: donated {} pages at {}, {} free", pages, start, self.free);
    }

    /// Takes `pages` contiguous zeroed pages.
    pub fn take(&mut self, pages: usize) -> Result<VirtualAddress, AllocError> {
        debug_assert!(pages > 0);
        let mut prev: Option<NonNull<PoolRun>> = None;
        let mut cursor = self.head;
        while let Some(mut run) = cursor {
            let run_ref = unsafe { run.as_mut() };
            if run_ref.pages >= pages {
                let start = VirtualAddress::from_ptr(run.as_ptr());
                let taken = if run_ref.pages == pages {
                    let next = run_ref.next;
                    match prev {
                        Some(mut prev) => unsafe { prev.as_mut().next = next },
                        None => self.head = next,
                    }
                    start
                } else {
                    // Carve from the tail so the run header stays put.
                    run_ref.pages -= pages;
                    start + run_ref.pages * PAGE_SIZE
                };
                self.free -= pages;
                unsafe { ptr::write_bytes(taken.as_mut_ptr::<u8>(), 0, pages * PAGE_SIZE) };
                return Ok(taken);
            }
            prev = cursor;
            cursor = run_ref.next;
        }
        Err(AllocError::OutOfMemory)
    }

    /// Returns pages obtained from [`PagePool::take`].
    ///
    /// # Safety
    ///
    /// `start` and `pages` must describe a range taken from this pool that is no longer
    /// referenced.
    pub unsafe fn release(&mut self, start: VirtualAddress, pages: usize) {
        unsafe { self.insert(start, pages) };
    }

    unsafe fn insert(&mut self, start: VirtualAddress, pages: usize) {
        let end = start + pages * PAGE_SIZE;
        let mut prev: Option<NonNull<PoolRun>> = None;
        let mut cursor = self.head;
        while let Some(run) = cursor {
            if VirtualAddress::from_ptr(run.as_ptr()) > start {
                break;
            }
            prev = cursor;
            cursor = unsafe { run.as_ref().next };
        }

        self.free += pages;
        let mut new = match prev {
            Some(mut prev) if run_end(prev) == start => {
                unsafe { prev.as_mut().pages += pages };
                prev
            }
            _ => {
                let run = start.as_mut_ptr::<PoolRun>();
                unsafe { run.write(PoolRun { next: cursor, pages }) };
                let run = unsafe { NonNull::new_unchecked(run) };
                match prev {
                    Some(mut prev) => unsafe { prev.as_mut().next = Some(run) },
                    None => self.head = Some(run),
                }
                run
            }
        };

        if let Some(next) = cursor {
            if VirtualAddress::from_ptr(next.as_ptr()) == end {
                let new = unsafe { new.as_mut() };
                let next = unsafe { next.as_ref() };
                new.pages += next.pages;
                new.next = next.next;
            }
        }
    }
}

impl Default for PagePool {
    fn default() -> Self {
        Self::new()
    }
}

fn run_end(run: NonNull<PoolRun>) -> VirtualAddress {
    VirtualAddress::from_ptr(run.as_ptr()) + unsafe { run.as_ref().pages } * PAGE_SIZE
}

/// Number of pool pages needed to hold `bytes`.
pub(crate) const fn pages_for(bytes: usize) -> usize {
    if bytes == 0 { 1 } else { bytes.div_ceil(PAGE_SIZE) }
}

/// A single value stored in pool pages.
///
/// Not dropped automatically: hand it back with [`PoolBox::release`].
pub struct PoolBox<T> {
    ptr: NonNull<T>,
    _marker: PhantomData<T>,
}

unsafe impl<T: Send> Send for PoolBox<T> {}

impl<T> PoolBox<T> {
    /// Moves `value` into freshly taken pool pages.
    ///
    /// When the pool is exhausted the value is handed back, so that anything it owns can
    /// still be released.
    pub fn new(pool: &mut PagePool, value: T) -> Result<Self, T> {
        const { assert!(align_of::<T>() <= PAGE_SIZE) };
        let Ok(start) = pool.take(pages_for(size_of::<T>())) else {
            return Err(value);
        };
        let ptr = start.as_mut_ptr::<T>();
        unsafe { ptr.write(value) };
        Ok(Self {
            ptr: unsafe { NonNull::new_unchecked(ptr) },
            _marker: PhantomData,
        })
    }

    /// Address of the stored value.
    pub fn address(&self) -> VirtualAddress {
        VirtualAddress::from_ptr(self.ptr.as_ptr())
    }

    /// Moves the value out and gives its pages back to `pool`.
    pub fn into_inner(self, pool: &mut PagePool) -> T {
        unsafe {
            let value = ptr::read(self.ptr.as_ptr());
            pool.release(self.address(), pages_for(size_of::<T>()));
            value
        }
    }

    /// Drops the value and gives its pages back to `pool`.
    pub fn release(self, pool: &mut PagePool) {
        unsafe {
            ptr::drop_in_place(self.ptr.as_ptr());
            pool.release(self.address(), pages_for(size_of::<T>()));
        }
    }
}

impl<T> Deref for PoolBox<T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { self.ptr.as_ref() }
    }
}

impl<T> DerefMut for PoolBox<T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { self.ptr.as_mut() }
    }
}

/// A fixed-length array stored in pool pages.
pub struct PoolArray<T> {
    ptr: NonNull<T>,
    len: usize,
}

unsafe impl<T: Send> Send for PoolArray<T> {}

impl<T> PoolArray<T> {
    /// Creates an array of `len` elements, element `i` being `init(i)`.
    pub fn new(pool: &mut PagePool, len: usize, mut init: impl FnMut(usize) -> T) -> Result<Self, AllocError> {
        const { assert!(align_of::<T>() <= PAGE_SIZE) };
        let start = pool.take(pages_for(len * size_of::<T>()))?;
        let ptr = start.as_mut_ptr::<T>();
        for index in 0..len {
            unsafe { ptr.add(index).write(init(index)) };
        }
        Ok(Self {
            ptr: unsafe { NonNull::new_unchecked(ptr) },
            len,
        })
    }

    /// Drops every element and gives the pages back to `pool`.
    pub fn release(self, pool: &mut PagePool) {
        let start = VirtualAddress::from_ptr(self.ptr.as_ptr());
        unsafe {
            ptr::drop_in_place(ptr::slice_from_raw_parts_mut(self.ptr.as_ptr(), self.len));
            pool.release(start, pages_for(self.len * size_of::<T>()));
        }
    }
}

impl<T> Deref for PoolArray<T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        unsafe { core::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl<T> DerefMut for PoolArray<T> {
    fn deref_mut(&mut self) -> &mut [T] {
        unsafe { core::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}
