//! User virtual page table helpers.
//!
//! The page table of the running environment is readable through the
//! recursive mapping ([`Uvpt`](exos::mm::Uvpt)). Looking up an address means
//! descending from the PML4 and stopping at the first entry that either is
//! absent or maps a superpage; [`walk`] performs that descent once and every
//! other helper here is a projection of its result.
//!
//! None of these functions fail: an unmapped address, address 0 and a
//! non-canonical address are all simply absent. Nothing is cached, so two
//! calls may observe different states if the kernel changed the table in
//! between (e.g. while resolving a copy-on-write fault).
//!
//! ```no_run
//! use exos::mm::Uvpt;
//! use exos_ulib::uvpt;
//!
//! let uvpt = unsafe { Uvpt::new() };
//! if uvpt::is_present(&uvpt, 0x40_0000) && !uvpt::is_dirty(&uvpt, 0x40_0000) {
//!     // ...
//! }
//! ```

use core::ops::Range;
use exos::{
    addressing::{NPTENTRIES, PAGE_SIZE, PD_SIZE, PDP_SIZE, Va},
    mm::{
        Level, PageTableView, Permission, UVPT_INDEX,
        page_table::{Entry, EntryFlags, PdeFlags, PdpeFlags, PteFlags},
    },
};

/// Where a walk of the page table stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkResult {
    /// The entry at this level is not present. The raw entry is kept, as the
    /// software-available bits may still carry information.
    Absent(Level, Entry),
    /// The entry at this level maps the address: a page at [`Level::Pt`], a
    /// superpage at [`Level::Pd`] or [`Level::Pdp`].
    Terminal(Level, Entry),
}

impl WalkResult {
    /// The level at which the walk stopped.
    pub fn level(&self) -> Level {
        match self {
            WalkResult::Absent(level, _) | WalkResult::Terminal(level, _) => *level,
        }
    }

    /// The entry at which the walk stopped.
    pub fn entry(&self) -> Entry {
        match self {
            WalkResult::Absent(_, entry) | WalkResult::Terminal(_, entry) => *entry,
        }
    }

    /// Whether the walk found a mapping.
    pub fn is_terminal(&self) -> bool {
        matches!(self, WalkResult::Terminal(..))
    }
}

/// Walk the page table down to the entry that governs `addr`.
///
/// Reads at most one entry per level. A non-canonical `addr` is reported as
/// `Absent(Level::Pml4, Entry(0))` without reading anything.
pub fn walk<V: PageTableView + ?Sized>(view: &V, addr: usize) -> WalkResult {
    let Some(va) = Va::new(addr) else {
        return WalkResult::Absent(Level::Pml4, Entry(0));
    };

    let pml4e = view.pml4e(va);
    if !pml4e.is_present() {
        return WalkResult::Absent(Level::Pml4, pml4e.into());
    }

    let pdpe = view.pdpe(va);
    if !pdpe.is_present() {
        return WalkResult::Absent(Level::Pdp, pdpe.into());
    }
    if pdpe.is_superpage() {
        return WalkResult::Terminal(Level::Pdp, pdpe.into());
    }

    let pde = view.pde(va);
    if !pde.is_present() {
        return WalkResult::Absent(Level::Pd, pde.into());
    }
    if pde.is_superpage() {
        return WalkResult::Terminal(Level::Pd, pde.into());
    }

    let pte = view.pte(va);
    if pte.is_present() {
        WalkResult::Terminal(Level::Pt, pte.into())
    } else {
        WalkResult::Absent(Level::Pt, pte.into())
    }
}

/// The raw entry that governs `addr`, at whatever level the walk stopped.
#[inline]
pub fn lookup_entry<V: PageTableView + ?Sized>(view: &V, addr: usize) -> Entry {
    walk(view, addr).entry()
}

/// Permissions of the page containing `addr`.
///
/// `READ` is granted by presence, `WRITE` mirrors `RW`, `EXECUTABLE` is
/// granted unless `XD` is set, and `SHARE` mirrors the share bit. The other
/// software-available bits are passed through as `AVL_0` and `AVL_2`.
///
/// Only `READ` depends on presence: the remaining bits are decoded from the
/// raw entry the walk stopped at, so an unmapped address with a zero entry
/// reports `EXECUTABLE`.
pub fn permissions_of<V: PageTableView + ?Sized>(view: &V, addr: usize) -> Permission {
    let entry = lookup_entry(view, addr);
    let mut perm = Permission::from_bits_truncate(entry.avail() & !EntryFlags::SHARE.bits());
    perm.set(Permission::READ, entry.is_present());
    perm.set(Permission::WRITE, entry.is_writable());
    perm.set(Permission::EXECUTABLE, !entry.is_no_exec());
    perm.set(Permission::SHARE, entry.is_shared());
    perm
}

/// Whether the page containing `addr` was written since it was mapped.
#[inline]
pub fn is_dirty<V: PageTableView + ?Sized>(view: &V, addr: usize) -> bool {
    lookup_entry(view, addr).is_dirty()
}

/// Whether `addr` is mapped.
#[inline]
pub fn is_present<V: PageTableView + ?Sized>(view: &V, addr: usize) -> bool {
    lookup_entry(view, addr).is_present()
}

fn region(start: Va, size: usize) -> Range<Va> {
    start..start.saturating_add(size)
}

/// Call `visit` for every region of the address space carrying the share
/// bit, in ascending address order.
///
/// A shared superpage is reported as a single region of its full size; its
/// range is never split into pages. Superpages without the share bit are
/// skipped. Entries of the upper half are reported with their canonical
/// (sign-extended) addresses.
///
/// PML4 slot [`UVPT_INDEX`] is skipped. Through the recursive mapping it
/// shows the page table itself, where every shared superpage would appear a
/// second time as a smaller region inside `UVPT`.
///
/// The first error returned by `visit` stops the traversal and is returned.
///
/// `visit` may do anything with a region except changing the layout of the
/// page table being traversed.
pub fn enumerate_shared_regions<V, E>(
    view: &V,
    mut visit: impl FnMut(Range<Va>) -> Result<(), E>,
) -> Result<(), E>
where
    V: PageTableView + ?Sized,
{
    for pml4ei in (0..NPTENTRIES).filter(|&i| i != UVPT_INDEX) {
        if view.pml4e(Va::from_indices(pml4ei, 0, 0, 0, 0)).is_present() {
            shared_in_pdp(view, pml4ei, &mut visit)?;
        }
    }
    Ok(())
}

fn shared_in_pdp<V, E>(
    view: &V,
    pml4ei: usize,
    visit: &mut impl FnMut(Range<Va>) -> Result<(), E>,
) -> Result<(), E>
where
    V: PageTableView + ?Sized,
{
    for pdpei in 0..NPTENTRIES {
        let va = Va::from_indices(pml4ei, pdpei, 0, 0, 0);
        let pdpe = view.pdpe(va);
        if !pdpe.is_present() {
            continue;
        }
        if pdpe.is_superpage() {
            if pdpe.flags().contains(PdpeFlags::SHARE) {
                visit(region(va, PDP_SIZE))?;
            }
            continue;
        }
        shared_in_pd(view, pml4ei, pdpei, visit)?;
    }
    Ok(())
}

fn shared_in_pd<V, E>(
    view: &V,
    pml4ei: usize,
    pdpei: usize,
    visit: &mut impl FnMut(Range<Va>) -> Result<(), E>,
) -> Result<(), E>
where
    V: PageTableView + ?Sized,
{
    for pdei in 0..NPTENTRIES {
        let va = Va::from_indices(pml4ei, pdpei, pdei, 0, 0);
        let pde = view.pde(va);
        if !pde.is_present() {
            continue;
        }
        if pde.is_superpage() {
            if pde.flags().contains(PdeFlags::SHARE) {
                visit(region(va, PD_SIZE))?;
            }
            continue;
        }
        for ptei in 0..NPTENTRIES {
            let va = Va::from_indices(pml4ei, pdpei, pdei, ptei, 0);
            if view.pte(va).flags().contains(PteFlags::P | PteFlags::SHARE) {
                visit(region(va, PAGE_SIZE))?;
            }
        }
    }
    Ok(())
}
