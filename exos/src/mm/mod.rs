//! Memory Management.
//!
//! An environment never edits its page table directly: the exokernel maps
//! the page table of every environment, read-only, into the environment's own
//! address space through a recursive entry of the PML4. Slot
//! [`UVPT_INDEX`] of the PML4 points back at the PML4 itself, which makes
//! every table of every level appear as an ordinary array:
//!
//! - [`UVPT`]: all page table entries, indexed by [`Va::vpn`].
//! - [`UVPD`]: all page directory entries, indexed by [`Va::vpd`].
//! - [`UVPDP`]: all page directory pointer entries, indexed by [`Va::vpdp`].
//! - [`UVPML4`]: the PML4 itself, indexed by [`Va::pml4ei`].
//!
//! [`Uvpt`] reads those arrays. [`PageTableView`] abstracts over it so that
//! code inspecting an address space also works on a heap-backed
//! [`PageTable`].
//!
//! ## Memory layout
//!
//! ```text
//!  0xffff_ffff_ffff_ffff  +------------------------------+
//!                         |        kernel (upper half)   |
//!  0xffff_8000_0000_0000  +------------------------------+
//!                         |   non-canonical hole         |
//!  0x0000_8000_0000_0000  +------------------------------+
//!                         | UVPT: recursive page tables  |  R-/R-
//!  0x0000_7f80_0000_0000  +------------------------------+ <- UVPT
//!                         |   unused                     |
//!  0x0000_7f7f_c000_0000  +------------------------------+ <- UENVS
//!                         | UENVS: environment table     |  R-/R- (at UENVS)
//!  MAX_USER_ADDRESS ----> +------------------------------+
//!                         |   environment memory         |  RW/RW
//!  0x0000_0000_0000_0000  +------------------------------+
//! ```
//!
//! [`PageTable`]: page_table::PageTable

pub mod page_table;

use abyss::addressing::{PAGE_SIZE, PD_SIZE, PDP_SIZE, PML4_SIZE, Va};
use page_table::{Pde, Pdpe, Pml4e, Pte};

/// PML4 slot holding the recursive mapping.
pub const UVPT_INDEX: usize = 255;

/// Base of the recursively mapped page table entries.
pub const UVPT: usize = Va::from_indices(UVPT_INDEX, 0, 0, 0, 0).into_usize();

/// Base of the recursively mapped page directory entries.
pub const UVPD: usize = Va::from_indices(UVPT_INDEX, UVPT_INDEX, 0, 0, 0).into_usize();

/// Base of the recursively mapped page directory pointer entries.
pub const UVPDP: usize = Va::from_indices(UVPT_INDEX, UVPT_INDEX, UVPT_INDEX, 0, 0).into_usize();

/// Address of the recursively mapped PML4.
pub const UVPML4: usize =
    Va::from_indices(UVPT_INDEX, UVPT_INDEX, UVPT_INDEX, UVPT_INDEX, 0).into_usize();

/// Read-only mapping of the kernel's environment table.
pub const UENVS: usize = UVPT - PDP_SIZE;

/// End of the memory an environment owns. Everything in
/// `0..MAX_USER_ADDRESS` belongs to the environment and is inherited by its
/// children.
pub const MAX_USER_ADDRESS: usize = UENVS;

/// A level of the four-level page table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Level {
    /// Page Map Level 4.
    Pml4,
    /// Page Directory Pointer table.
    Pdp,
    /// Page Directory.
    Pd,
    /// Page Table.
    Pt,
}

impl Level {
    /// Number of bytes governed by a single entry of this level.
    #[inline]
    pub const fn span(self) -> usize {
        match self {
            Level::Pml4 => PML4_SIZE,
            Level::Pdp => PDP_SIZE,
            Level::Pd => PD_SIZE,
            Level::Pt => PAGE_SIZE,
        }
    }
}

bitflags::bitflags! {
    /// Possible memory permissions for a region, in the exokernel's ABI.
    ///
    /// The same set describes what a page allows (as decoded from its page
    /// table entry) and what a mapping request asks for. The mapping-only
    /// modifiers are [`Permission::LAZY`] and [`Permission::COMBINE`].
    ///
    /// `AVL_0` and `AVL_2` carry the software-available bits of a page table
    /// entry through unchanged, at the same bit positions.
    pub struct Permission: usize {
        /// Page is readable.
        const READ = 1 << 0;

        /// Page is writable.
        const WRITE = 1 << 1;

        /// Page is executable.
        const EXECUTABLE = 1 << 2;

        /// Page is shared with other environments: writes are visible to all
        /// of them and the page is never copied on write.
        const SHARE = 1 << 6;

        /// When mapping a region with mixed permissions, union the permission
        /// of each page with the requested one instead of requiring the whole
        /// region to match.
        const COMBINE = 1 << 7;

        /// Defer the copy of each page until either side writes it.
        const LAZY = 1 << 8;

        /// User metadata, software-available entry bit 9.
        const AVL_0 = 1 << 9;

        /// User metadata, software-available entry bit 11.
        const AVL_2 = 1 << 11;
    }
}

impl Permission {
    /// Read, write and execute: preserve whatever each page allows.
    pub const ALL: Permission = Permission::READ
        .union(Permission::WRITE)
        .union(Permission::EXECUTABLE);
}

/// A read-only view of a four-level page table.
///
/// Each accessor returns the entry of its level that governs `va`. An
/// accessor may only be called when every upper-level entry governing `va`
/// is present and does not map a superpage; otherwise the recursive
/// mapping has nothing to show at that address.
pub trait PageTableView {
    /// The PML4 entry governing `va`.
    fn pml4e(&self, va: Va) -> Pml4e;

    /// The page directory pointer entry governing `va`.
    fn pdpe(&self, va: Va) -> Pdpe;

    /// The page directory entry governing `va`.
    fn pde(&self, va: Va) -> Pde;

    /// The page table entry governing `va`.
    fn pte(&self, va: Va) -> Pte;
}

impl<T: PageTableView + ?Sized> PageTableView for &T {
    fn pml4e(&self, va: Va) -> Pml4e {
        (**self).pml4e(va)
    }

    fn pdpe(&self, va: Va) -> Pdpe {
        (**self).pdpe(va)
    }

    fn pde(&self, va: Va) -> Pde {
        (**self).pde(va)
    }

    fn pte(&self, va: Va) -> Pte {
        (**self).pte(va)
    }
}

/// The page table of the running environment, as seen through the recursive
/// mapping.
///
/// Every read is volatile: the kernel updates the tables behind the
/// environment's back (e.g. when setting dirty bits or resolving a
/// copy-on-write fault), so two reads of the same entry may differ.
#[derive(Debug)]
pub struct Uvpt {
    _p: (),
}

impl Uvpt {
    /// Create a view of the running environment's page table.
    ///
    /// # Safety
    /// The kernel must have installed the recursive mapping at
    /// [`UVPT_INDEX`] for the running environment.
    pub const unsafe fn new() -> Self {
        Self { _p: () }
    }
}

impl PageTableView for Uvpt {
    #[inline]
    fn pml4e(&self, va: Va) -> Pml4e {
        unsafe { core::ptr::read_volatile((UVPML4 as *const Pml4e).add(va.pml4ei())) }
    }

    #[inline]
    fn pdpe(&self, va: Va) -> Pdpe {
        unsafe { core::ptr::read_volatile((UVPDP as *const Pdpe).add(va.vpdp())) }
    }

    #[inline]
    fn pde(&self, va: Va) -> Pde {
        unsafe { core::ptr::read_volatile((UVPD as *const Pde).add(va.vpd())) }
    }

    #[inline]
    fn pte(&self, va: Va) -> Pte {
        unsafe { core::ptr::read_volatile((UVPT as *const Pte).add(va.vpn())) }
    }
}
