//! Address types for physical and virtual memory.
//!
//! Both types are thin newtypes over `usize`. Conversions between the two only happen
//! through an explicit [`DirectMap`], which describes where the boot loader placed its
//! linear mapping of all physical memory. There is no global translator: every component
//! that needs to reach physical memory is handed the mapping it should use.

use core::fmt;
use core::ops::{Add, Sub};

use crate::arch;

/// Generates the parts shared by [`PhysicalAddress`] and [`VirtualAddress`].
macro_rules! impl_address_common {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
        #[repr(transparent)]
        pub struct $name(usize);

        impl $name {
            /// Creates an address without validation.
            ///
            /// # Safety
            ///
            /// The caller must ensure that the address is valid for the current architecture.
            #[inline]
            pub const unsafe fn new_unchecked(addr: usize) -> Self {
                Self(addr)
            }

            /// Returns the raw address value.
            #[inline]
            pub const fn as_usize(self) -> usize {
                self.0
            }

            /// Checks if the address is aligned to `align`, which must be a power of two.
            #[inline]
            pub const fn is_aligned(self, align: usize) -> bool {
                debug_assert!(align.is_power_of_two());
                self.0 & (align - 1) == 0
            }

            /// Aligns the address down to `align`, which must be a power of two.
            #[inline]
            pub const fn align_down(self, align: usize) -> Self {
                debug_assert!(align.is_power_of_two());
                Self(self.0 & !(align - 1))
            }

            /// Aligns the address up to `align`, which must be a power of two.
            #[inline]
            pub const fn align_up(self, align: usize) -> Self {
                debug_assert!(align.is_power_of_two());
                Self((self.0 + align - 1) & !(align - 1))
            }
        }

        impl fmt::Pointer for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:p}", self.0 as *const u8)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({:#x})", stringify!($name), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:#x}", self.0)
            }
        }

        impl From<u64> for $name {
            #[inline]
            fn from(addr: u64) -> Self {
                Self::new(addr as usize)
            }
        }

        impl Add<usize> for $name {
            type Output = Self;

            #[inline]
            fn add(self, rhs: usize) -> Self::Output {
                Self(self.0 + rhs)
            }
        }

        impl Sub<usize> for $name {
            type Output = Self;

            #[inline]
            fn sub(self, rhs: usize) -> Self::Output {
                Self(self.0 - rhs)
            }
        }

        impl Sub<$name> for $name {
            type Output = usize;

            #[inline]
            fn sub(self, rhs: $name) -> Self::Output {
                self.0 - rhs.0
            }
        }
    };
}

impl_address_common!(
    PhysicalAddress,
    "A physical memory address.\n\n\
     Physical addresses are never dereferenced directly; they are translated through a\n\
     [`DirectMap`] or installed into page tables."
);

impl PhysicalAddress {
    /// Creates a new physical address.
    ///
    /// # Panics
    ///
    /// Panics if the address exceeds the architecture's physical address width.
    #[inline]
    pub const fn new(addr: usize) -> Self {
        assert!(
            arch::validate_physical(addr),
            "physical address exceeds maximum width"
        );
        Self(addr)
    }

    /// Returns the page frame number containing this address.
    #[inline]
    pub const fn frame_number(self) -> FrameNumber {
        FrameNumber(self.0 / arch::PAGE_SIZE)
    }
}

impl_address_common!(
    VirtualAddress,
    "A virtual memory address.\n\n\
     Virtual addresses are always canonical for the architecture's paging mode."
);

impl VirtualAddress {
    /// Creates a new virtual address.
    ///
    /// # Panics
    ///
    /// Panics if the address is not canonical.
    #[inline]
    pub const fn new(addr: usize) -> Self {
        assert!(arch::validate_virtual(addr), "address is not canonical");
        Self(addr)
    }

    /// Creates an address from a pointer.
    #[inline]
    pub fn from_ptr<T: ?Sized>(ptr: *const T) -> Self {
        Self::new(ptr as *const u8 as usize)
    }

    /// Converts the address to a pointer.
    #[inline]
    pub const fn as_ptr<T>(self) -> *const T {
        self.0 as *const T
    }

    /// Converts the address to a mutable pointer.
    #[inline]
    pub const fn as_mut_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }

    /// Returns the offset of the address within its base page.
    #[inline]
    pub const fn page_offset(self) -> usize {
        self.0 & (arch::PAGE_SIZE - 1)
    }
}

/// A physical page frame number.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct FrameNumber(usize);

impl FrameNumber {
    /// Creates a frame number.
    #[inline]
    pub const fn new(number: usize) -> Self {
        Self(number)
    }

    /// Returns the raw frame number.
    #[inline]
    pub const fn as_usize(self) -> usize {
        self.0
    }

    /// Returns the physical address at the start of this frame.
    #[inline]
    pub const fn start(self) -> PhysicalAddress {
        PhysicalAddress::new(self.0 * arch::PAGE_SIZE)
    }
}

impl fmt::Debug for FrameNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FrameNumber({})", self.0)
    }
}

impl From<PhysicalAddress> for FrameNumber {
    fn from(addr: PhysicalAddress) -> Self {
        addr.frame_number()
    }
}

/// The boot loader's linear mapping of all physical memory.
///
/// Physical address `p` is reachable at virtual address `p + offset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirectMap {
    offset: usize,
}

impl DirectMap {
    /// Creates a direct map with the given virtual offset.
    pub const fn new(offset: usize) -> Self {
        Self { offset }
    }

    /// Returns the virtual offset of the mapping.
    pub const fn offset(self) -> usize {
        self.offset
    }

    /// Returns the virtual address where `phys` is mapped.
    #[inline]
    pub const fn to_virtual(self, phys: PhysicalAddress) -> VirtualAddress {
        VirtualAddress::new(phys.as_usize().wrapping_add(self.offset))
    }

    /// Returns the physical address behind a direct-mapped virtual address.
    #[inline]
    pub const fn to_physical(self, virt: VirtualAddress) -> PhysicalAddress {
        PhysicalAddress::new(virt.as_usize().wrapping_sub(self.offset))
    }

    /// Returns a typed pointer to the direct-mapped copy of `phys`.
    #[inline]
    pub const fn as_mut_ptr<T>(self, phys: PhysicalAddress) -> *mut T {
        self.to_virtual(phys).as_mut_ptr()
    }
}
