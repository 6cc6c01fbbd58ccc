//! Address types for the translation core.
//!
//! Devices issue IO virtual addresses ([`Iova`]) which the page tables translate into
//! [`PhysicalAddress`]es. Both are kept as 64-bit values: the wide format reaches 36 bits on
//! either side, which no longer fits in a `u32`.

use core::fmt;
use core::ops::{Add, Sub};

use crate::format::MAX_PHYSICAL_BITS;

/// Macro to define common address type functionality.
///
/// Both address kinds share alignment helpers, formatting and offset arithmetic; only their
/// validation differs.
macro_rules! impl_address_common {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
        #[repr(transparent)]
        pub struct $name(u64);

        impl $name {
            /// Returns the raw address value.
            #[inline]
            pub const fn as_u64(self) -> u64 {
                self.0
            }

            /// Checks if the address is aligned to the given alignment.
            ///
            /// # Panics
            ///
            /// Panics if `align` is not a power of two.
            #[inline]
            pub const fn is_aligned(self, align: usize) -> bool {
                assert!(align.is_power_of_two(), "alignment must be a power of two");
                self.0 & (align as u64 - 1) == 0
            }

            /// Aligns the address down to the given alignment.
            ///
            /// # Panics
            ///
            /// Panics if `align` is not a power of two.
            #[inline]
            pub const fn align_down(self, align: usize) -> Self {
                assert!(align.is_power_of_two(), "alignment must be a power of two");
                Self(self.0 & !(align as u64 - 1))
            }

            /// Returns the offset of this address within a block of `align` bytes.
            #[inline]
            pub const fn offset_in(self, align: usize) -> u64 {
                assert!(align.is_power_of_two(), "alignment must be a power of two");
                self.0 & (align as u64 - 1)
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

        impl Add<u64> for $name {
            type Output = Self;

            #[inline]
            fn add(self, rhs: u64) -> Self::Output {
                Self(self.0 + rhs)
            }
        }

        impl Sub<$name> for $name {
            type Output = u64;

            #[inline]
            fn sub(self, rhs: $name) -> Self::Output {
                self.0 - rhs.0
            }
        }
    };
}

impl_address_common!(
    PhysicalAddress,
    "A physical memory address as seen by the translation unit's table walker.\n\n\
     Entries store physical addresses shifted right by four bits in 32-bit words, so the\n\
     unit reaches at most 36 bits of physical address space."
);

impl PhysicalAddress {
    /// Creates a new physical address.
    ///
    /// # Panics
    ///
    /// Panics if the address exceeds the table format's physical address width.
    #[inline]
    pub const fn new(addr: u64) -> Self {
        assert!(
            addr >> MAX_PHYSICAL_BITS == 0,
            "physical address exceeds maximum width"
        );
        Self(addr)
    }

    /// Creates a physical address if it fits the table format.
    #[inline]
    pub const fn try_new(addr: u64) -> Option<Self> {
        if addr >> MAX_PHYSICAL_BITS == 0 {
            Some(Self(addr))
        } else {
            None
        }
    }
}

impl_address_common!(
    Iova,
    "An IO virtual address: the address a device puts on the bus.\n\n\
     Whether a particular value is in range depends on the virtual address width of the\n\
     domain translating it; the page table rejects out-of-range addresses."
);

impl Iova {
    /// Creates a new IO virtual address.
    #[inline]
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    /// Adds `rhs` bytes, returning `None` on overflow.
    #[inline]
    pub const fn checked_add(self, rhs: u64) -> Option<Self> {
        match self.0.checked_add(rhs) {
            Some(addr) => Some(Self(addr)),
            None => None,
        }
    }
}
