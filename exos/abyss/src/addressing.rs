//! Physical and Virtual Memory Addressing Schemes.
//!
//! This module provides abstractions for virtual address and physical
//! address as seen by an environment running on top of the exokernel. Unlike
//! the kernel, an environment has no direct map of physical memory: a
//! physical address is only ever *observed* in a page-table entry, never
//! dereferenced.
//!
//! The module defines two primary types for memory addresses: [`Va`] for
//! virtual address and [`Pa`] for physical address, together with the
//! constants describing the x86_64 four-level paging geometry.
//!
//! ```text
//! 63          48 47            39 38            30 29            21 20         12 11         0
//! +-------------+----------------+----------------+----------------+-------------+------------+
//! | Sign Extend |    Page-Map    | Page-Directory | Page-directory |  Page-Table |    Page    |
//! |             | Level-4 Offset |    Pointer     |     Offset     |   Offset    |   Offset   |
//! +-------------+----------------+----------------+----------------+-------------+------------+
//!               |                |                |                |             |            |
//!               +------- 9 ------+------- 9 ------+------- 9 ------+----- 9 -----+---- 12 ----+
//!                                           Virtual Address
//! ```
//!
//! ## Example Usage:
//!
//! ```
//! use abyss::addressing::{Va, PAGE_SIZE};
//!
//! let va = Va::new(0x1234_5678).unwrap();
//! assert_eq!(va.page_down().into_usize(), 0x1234_5000);
//! assert_eq!((va.page_down() + PAGE_SIZE).into_usize(), 0x1234_6000);
//! ```

/// The size of a single page in memory, in bytes.
///
/// This constant represents the size of a memory page, which is 4 KiB
/// (kilobytes). It is also the span of a single page table entry.
pub const PAGE_SIZE: usize = 0x1000;

/// The shift amount to get the page index from a given address.
pub const PAGE_SHIFT: usize = 12; // 12 bits (log2 of 4 KB)

/// A mask for extracting the offset within a page from a given address.
pub const PAGE_MASK: usize = 0xfff;

/// The number of entries in a table of any level.
pub const NPTENTRIES: usize = 512;

/// The span of a page directory entry, in bytes (2 MiB).
///
/// A page directory entry with the page size bit maps a 2 MiB superpage
/// directly.
pub const PD_SIZE: usize = PAGE_SIZE * NPTENTRIES;

/// The span of a page directory pointer entry, in bytes (1 GiB).
pub const PDP_SIZE: usize = PD_SIZE * NPTENTRIES;

/// The span of a page map level 4 entry, in bytes (512 GiB).
pub const PML4_SIZE: usize = PDP_SIZE * NPTENTRIES;

const PTSHIFT: usize = PAGE_SHIFT;
const PDSHIFT: usize = PTSHIFT + 9;
const PDPSHIFT: usize = PDSHIFT + 9;
const PML4SHIFT: usize = PDPSHIFT + 9;

const SIGN_EXTEND: usize = 0xffff_0000_0000_0000;

/// Represents a physical address.
///
/// The `Pa` (Physical Address) struct is a wrapper around the `usize` type,
/// which represents a physical address in memory. In user space it is only
/// used to compare which frame backs a mapping.
#[repr(transparent)]
#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Ord, Hash)]
pub struct Pa(usize);

impl Pa {
    /// The physical address `0`.
    pub const ZERO: Self = Self(0);

    /// Creates a new physical address if the address is valid.
    ///
    /// The address must be less than `0xffff_0000_0000_0000`, which ensures it
    /// falls within the valid physical address range.
    #[inline]
    pub const fn new(addr: usize) -> Option<Self> {
        if addr < SIGN_EXTEND {
            Some(Self(addr))
        } else {
            None
        }
    }

    /// Cast the physical address into a raw `usize`.
    #[inline]
    pub const fn into_usize(self) -> usize {
        self.0
    }

    /// Extracts the page offset from the physical address.
    #[inline]
    pub const fn offset(self) -> usize {
        self.0 & PAGE_MASK
    }
}

/// Represents a virtual address.
///
/// A [`Va`] is always *canonical*: bits 63..=47 are copies of bit 47. The
/// lower half (`0x0000_0000_0000_0000..=0x0000_7fff_ffff_ffff`) belongs to
/// the environment, the upper half to the kernel.
#[repr(transparent)]
#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Ord, Hash)]
pub struct Va(usize);

impl Va {
    /// The virtual address `0`.
    pub const ZERO: Self = Self(0);

    /// Creates a new virtual address if the address is canonical.
    ///
    /// # Returns
    /// - `Some(Va)`: If the address is within the valid virtual memory range.
    /// - `None`: If the address is non-canonical.
    ///
    /// # Example
    /// ```
    /// use abyss::addressing::Va;
    ///
    /// assert!(Va::new(0xFFFF_8000_1234_5678).is_some());
    /// assert!(Va::new(0xFFFF_7000_1234_5678).is_none());
    /// ```
    #[inline(always)]
    pub const fn new(addr: usize) -> Option<Self> {
        match addr & 0xffff_8000_0000_0000 {
            m if m == 0xffff_8000_0000_0000 || m == 0 => Some(Self(addr)),
            _ => None,
        }
    }

    /// Composes a canonical virtual address from table indices and an offset.
    ///
    /// Indices are truncated to 9 bits and the offset to 12 bits. When the
    /// PML4 index selects the upper half (`>= 256`), the address is
    /// sign-extended.
    ///
    /// # Example
    /// ```
    /// use abyss::addressing::Va;
    ///
    /// let va = Va::from_indices(1, 2, 3, 4, 0x10);
    /// assert_eq!(va.pml4ei(), 1);
    /// assert_eq!(va.pdpei(), 2);
    /// assert_eq!(va.pdei(), 3);
    /// assert_eq!(va.ptei(), 4);
    /// assert_eq!(va.offset(), 0x10);
    /// assert_eq!(Va::from_indices(256, 0, 0, 0, 0).into_usize(), 0xffff_8000_0000_0000);
    /// ```
    #[inline]
    pub const fn from_indices(
        pml4ei: usize,
        pdpei: usize,
        pdei: usize,
        ptei: usize,
        offset: usize,
    ) -> Self {
        let addr = ((pml4ei & 0x1ff) << PML4SHIFT)
            | ((pdpei & 0x1ff) << PDPSHIFT)
            | ((pdei & 0x1ff) << PDSHIFT)
            | ((ptei & 0x1ff) << PTSHIFT)
            | (offset & PAGE_MASK);
        if pml4ei & 0x100 != 0 {
            Self(addr | SIGN_EXTEND)
        } else {
            Self(addr)
        }
    }

    /// Returns the raw `usize` representation of the virtual address.
    #[inline]
    pub const fn into_usize(self) -> usize {
        self.0
    }

    /// Aligns the virtual address down to the nearest page boundary.
    #[inline]
    pub const fn page_down(self) -> Self {
        Self(self.0 & !PAGE_MASK)
    }

    /// Aligns the virtual address up to the nearest page boundary.
    #[inline]
    pub const fn page_up(self) -> Self {
        Self((self.0 + PAGE_MASK) & !PAGE_MASK)
    }

    /// Extracts the offset within the memory page from the virtual address.
    #[inline]
    pub const fn offset(self) -> usize {
        self.0 & PAGE_MASK
    }

    /// Adds `len` bytes, saturating at the top of the address space.
    ///
    /// The result may be non-canonical; it is meant as the exclusive end of
    /// a range.
    #[inline]
    pub const fn saturating_add(self, len: usize) -> Self {
        Self(self.0.saturating_add(len))
    }

    /// Page Map Level 4 index of this address.
    #[inline]
    pub const fn pml4ei(self) -> usize {
        (self.0 >> PML4SHIFT) & 0x1ff
    }

    /// Page Directory Pointer table index of this address.
    #[inline]
    pub const fn pdpei(self) -> usize {
        (self.0 >> PDPSHIFT) & 0x1ff
    }

    /// Page Directory index of this address.
    #[inline]
    pub const fn pdei(self) -> usize {
        (self.0 >> PDSHIFT) & 0x1ff
    }

    /// Page Table index of this address.
    #[inline]
    pub const fn ptei(self) -> usize {
        (self.0 >> PTSHIFT) & 0x1ff
    }

    /// Linear page number of this address within the 48-bit space.
    ///
    /// This is the index of the address' page table entry in the recursively
    /// mapped virtual page table.
    #[inline]
    pub const fn vpn(self) -> usize {
        (self.0 >> PTSHIFT) & 0xf_ffff_ffff
    }

    /// Linear page directory number, i.e. the index of the address' page
    /// directory entry in the recursively mapped page directories.
    #[inline]
    pub const fn vpd(self) -> usize {
        (self.0 >> PDSHIFT) & 0x7ff_ffff
    }

    /// Linear page directory pointer number.
    #[inline]
    pub const fn vpdp(self) -> usize {
        (self.0 >> PDPSHIFT) & 0x3_ffff
    }
}

macro_rules! impl_arith {
    ($t: ty) => {
        impl core::ops::Add<usize> for $t {
            type Output = Self;

            fn add(self, other: usize) -> Self::Output {
                Self(self.0 + other)
            }
        }
        impl core::ops::AddAssign<usize> for $t {
            fn add_assign(&mut self, other: usize) {
                self.0 = self.0 + other
            }
        }
        impl core::ops::Sub<usize> for $t {
            type Output = Self;

            fn sub(self, other: usize) -> Self::Output {
                Self(self.0 - other)
            }
        }
        impl core::ops::Sub<Self> for $t {
            type Output = usize;

            fn sub(self, other: Self) -> Self::Output {
                self.0 - other.0
            }
        }
        impl core::ops::BitAnd<usize> for $t {
            type Output = Self;

            fn bitand(self, other: usize) -> Self {
                Self(self.0 & other)
            }
        }
    };
}

impl_arith!(Va);
impl_arith!(Pa);

impl core::fmt::Debug for Va {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Va(0x{:x})", self.0)
    }
}
impl core::fmt::Display for Va {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Va(0x{:x})", self.0)
    }
}
impl core::fmt::Debug for Pa {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Pa(0x{:x})", self.0)
    }
}
impl core::fmt::Display for Pa {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Pa(0x{:x})", self.0)
    }
}
