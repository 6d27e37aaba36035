//! Entries of Page Table and their permissions.
//!
//! Every level of the x86_64 four-level page table has its own entry type
//! ([`Pml4e`], [`Pdpe`], [`Pde`] and [`Pte`]) and its own set of flags. The
//! bits that matter to the library operating system are common to all of
//! them:
//!
//! - `P`: the entry is present.
//! - `RW`: writes are allowed.
//! - `D`: the page was written (terminal entries only).
//! - `PS`: the entry maps a superpage instead of pointing to a lower table
//!   (page directory pointer and page directory entries only).
//! - `AVL_0`, `SHARE`, `AVL_2`: the three bits that the hardware leaves to
//!   software. The exokernel reserves `SHARE` to mark frames that are shared
//!   with another environment; the other two are user metadata.
//! - `XD`: instruction fetches are not allowed.
//!
//! Once the level at which a walk stopped is known, the entry is handled as a
//! level-agnostic [`Entry`].
//!
//! This module also provides [`PageTable`], a heap-backed four-level page
//! table that can be inspected through [`PageTableView`] exactly like the
//! recursively mapped page table of the running environment.

use super::{Level, PageTableView};
use abyss::addressing::{NPTENTRIES, PAGE_MASK, PD_SIZE, PDP_SIZE, Pa, Va};
use alloc::boxed::Box;

/// Bits of an entry holding the physical address.
pub const ADDR_MASK: usize = 0x000f_ffff_ffff_f000;

/// Bits of an entry left to software.
pub const USER_AVAIL: usize = 0xe00;

bitflags::bitflags! {
    /// Flags for pml4e.
    pub struct Pml4eFlags: usize {
        /// Present; must be 1 to reference a page-directory-pointer table
        const P = 1 << 0;
        /// Read/write; if 0, writes may not be allowed to the 512-GByte region controlled by this entry
        const RW = 1 << 1;
        /// User/supervisor; if 0, user-mode accesses are not allowed to the 512-GByte region controlled by this entry
        const US = 1 << 2;
        /// Page-level write-through
        const PWT = 1 << 3;
        /// Page-level cache disable
        const PCD = 1 << 4;
        /// Accessed; indicates whether this entry has been used for linear-address translation
        const A = 1 << 5;
        /// Available to software.
        const AVL_0 = 1 << 9;
        /// Available to software; marks a region shared across environments.
        const SHARE = 1 << 10;
        /// Available to software.
        const AVL_2 = 1 << 11;
        /// Execute-disable
        const XD = 1 << 63;
    }
}

bitflags::bitflags! {
    /// Flags for pdpe.
    pub struct PdpeFlags: usize {
        /// Present; must be 1 to reference a page directory or map a 1-GByte page
        const P = 1 << 0;
        /// Read/write; if 0, writes may not be allowed to the 1-GByte region controlled by this entry
        const RW = 1 << 1;
        /// User/supervisor; if 0, user-mode accesses are not allowed to the 1-GByte region controlled by this entry
        const US = 1 << 2;
        /// Page-level write-through
        const PWT = 1 << 3;
        /// Page-level cache disable
        const PCD = 1 << 4;
        /// Accessed; indicates whether this entry has been used for linear-address translation
        const A = 1 << 5;
        /// Dirty; indicates whether software has written to the 1-GByte page referenced by this entry (only with `PS`)
        const D = 1 << 6;
        /// Page size; indicates whether this entry maps a 1-GByte page.
        const PS = 1 << 7;
        /// Global (only with `PS`)
        const G = 1 << 8;
        /// Available to software.
        const AVL_0 = 1 << 9;
        /// Available to software; marks a region shared across environments.
        const SHARE = 1 << 10;
        /// Available to software.
        const AVL_2 = 1 << 11;
        /// Execute-disable
        const XD = 1 << 63;
    }
}

bitflags::bitflags! {
    /// Flags for pde.
    pub struct PdeFlags: usize {
        /// Present; must be 1 to reference a page table or map a 2-MByte page
        const P = 1 << 0;
        /// Read/write; if 0, writes may not be allowed to the 2-MByte region controlled by this entry
        const RW = 1 << 1;
        /// User/supervisor; if 0, user-mode accesses are not allowed to the 2-MByte region controlled by this entry
        const US = 1 << 2;
        /// Page-level write-through
        const PWT = 1 << 3;
        /// Page-level cache disable
        const PCD = 1 << 4;
        /// Accessed; indicates whether this entry has been used for linear-address translation
        const A = 1 << 5;
        /// Dirty; indicates whether software has written to the 2-MByte page referenced by this entry (only with `PS`)
        const D = 1 << 6;
        /// Page size; indicates whether this entry is 2M page.
        const PS = 1 << 7;
        /// Global (only with `PS`)
        const G = 1 << 8;
        /// Available to software.
        const AVL_0 = 1 << 9;
        /// Available to software; marks a region shared across environments.
        const SHARE = 1 << 10;
        /// Available to software.
        const AVL_2 = 1 << 11;
        /// Execute-disable
        const XD = 1 << 63;
    }
}

bitflags::bitflags! {
    /// Flags for pte.
    pub struct PteFlags: usize {
        /// Present; must be 1 to map a 4-KByte page
        const P = 1 << 0;
        /// Read/write; if 0, writes may not be allowed to the 4-KByte page referenced by this entry
        const RW = 1 << 1;
        /// User/supervisor; if 0, user-mode accesses are not allowed to the 4-KByte page referenced by this entry
        const US = 1 << 2;
        /// Page-level write-through
        const PWT = 1 << 3;
        /// Page-level cache disable
        const PCD = 1 << 4;
        /// Accessed; indicates whether software has accessed the 4-KByte page referenced by this entry
        const A = 1 << 5;
        /// Dirty; indicates whether software has written to the 4-KByte page referenced by this entry
        const D = 1 << 6;
        /// Indirectly determines the memory type used to access the 4-KByte page referenced by this entry
        const PAT = 1 << 7;
        /// Global; determines whether the translation is global
        const G = 1 << 8;
        /// Available to software.
        const AVL_0 = 1 << 9;
        /// Available to software; marks a page shared across environments.
        const SHARE = 1 << 10;
        /// Available to software.
        const AVL_2 = 1 << 11;
        /// Execute-disable
        const XD = 1 << 63;
    }
}

bitflags::bitflags! {
    /// Flags of an [`Entry`] whose level is no longer tracked by the type.
    ///
    /// `PS` is only meaningful for page directory pointer and page directory
    /// entries; on a page table entry the same bit is `PAT`.
    pub struct EntryFlags: usize {
        /// Present.
        const P = 1 << 0;
        /// Read/write.
        const RW = 1 << 1;
        /// User/supervisor.
        const US = 1 << 2;
        /// Page-level write-through.
        const PWT = 1 << 3;
        /// Page-level cache disable.
        const PCD = 1 << 4;
        /// Accessed.
        const A = 1 << 5;
        /// Dirty.
        const D = 1 << 6;
        /// Page size.
        const PS = 1 << 7;
        /// Global.
        const G = 1 << 8;
        /// Available to software.
        const AVL_0 = 1 << 9;
        /// Shared across environments.
        const SHARE = 1 << 10;
        /// Available to software.
        const AVL_2 = 1 << 11;
        /// Execute-disable.
        const XD = 1 << 63;
    }
}

macro_rules! impl_entry {
    ($(#[$doc:meta])* $name:ident, $flags:ident) => {
        $(#[$doc])*
        #[derive(Clone, Copy, PartialEq, Eq)]
        #[repr(transparent)]
        pub struct $name(pub usize);

        impl $name {
            /// Get the physical address pointed to by this entry.
            ///
            /// # Returns
            /// - `Some(Pa)` if the entry is present.
            /// - `None` if the entry is not present (i.e., the "P" flag is not set).
            #[inline]
            pub const fn pa(&self) -> Option<Pa> {
                if self.flags().contains($flags::P) {
                    Pa::new(self.0 & ADDR_MASK)
                } else {
                    None
                }
            }

            /// Get the flags associated with this entry.
            #[inline]
            pub const fn flags(&self) -> $flags {
                $flags::from_bits_truncate(self.0)
            }

            /// Whether the entry is present.
            #[inline]
            pub const fn is_present(&self) -> bool {
                self.flags().contains($flags::P)
            }

            /// Set the physical address for this entry.
            ///
            /// The flags of the entry are preserved and the entry becomes
            /// present.
            ///
            /// # Returns
            /// - `Ok(&mut Self)` if the address is valid and the update is successful.
            /// - `Err(PageTableMappingError::Unaligned)` if the provided physical
            ///   address is not aligned.
            #[inline]
            pub fn set_pa(&mut self, pa: Pa) -> Result<&mut Self, PageTableMappingError> {
                let pa = pa.into_usize();
                if pa & PAGE_MASK != 0 {
                    Err(PageTableMappingError::Unaligned)
                } else {
                    self.0 = (pa & ADDR_MASK) | self.flags().bits() | $flags::P.bits();
                    Ok(self)
                }
            }

            /// Set the flags for this entry without modifying the physical
            /// address.
            #[inline]
            pub fn set_flags(&mut self, perm: $flags) -> &mut Self {
                self.0 = (self.0 & ADDR_MASK) | perm.bits();
                self
            }
        }

        impl core::fmt::Debug for $name {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                if let Some(pa) = self.pa() {
                    write!(f, "{}({:016x}, {:?})", stringify!($name), pa.into_usize(), self.flags())
                } else {
                    write!(f, ".")
                }
            }
        }

        impl From<$name> for Entry {
            fn from(e: $name) -> Entry {
                Entry(e.0)
            }
        }
    };
}

impl_entry!(
    /// Page Map Level 4 Entry (PML4E).
    ///
    /// The top-level entry of the 4-level page table. A present PML4E always
    /// points to a page directory pointer table.
    Pml4e,
    Pml4eFlags
);

impl_entry!(
    /// Page Directory Pointer Table Entry (PDPE).
    ///
    /// A present PDPE either points to a page directory or, with `PS`, maps a
    /// 1 GiB superpage.
    Pdpe,
    PdpeFlags
);

impl_entry!(
    /// Page Directory Entry (PDE).
    ///
    /// A present PDE either points to a page table or, with `PS`, maps a
    /// 2 MiB superpage.
    Pde,
    PdeFlags
);

impl_entry!(
    /// Page Table Entry (PTE).
    ///
    /// The last-level entry; a present PTE maps a single 4 KiB page.
    Pte,
    PteFlags
);

impl Pdpe {
    /// Whether this entry maps a 1 GiB superpage.
    #[inline]
    pub const fn is_superpage(&self) -> bool {
        self.flags().contains(PdpeFlags::P.union(PdpeFlags::PS))
    }
}

impl Pde {
    /// Whether this entry maps a 2 MiB superpage.
    #[inline]
    pub const fn is_superpage(&self) -> bool {
        self.flags().contains(PdeFlags::P.union(PdeFlags::PS))
    }
}

/// A raw page table entry of any level.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
#[repr(transparent)]
pub struct Entry(pub usize);

impl Entry {
    /// Get the flags of this entry.
    #[inline]
    pub const fn flags(&self) -> EntryFlags {
        EntryFlags::from_bits_truncate(self.0)
    }

    /// Whether the entry is present.
    #[inline]
    pub const fn is_present(&self) -> bool {
        self.flags().contains(EntryFlags::P)
    }

    /// Whether the entry allows writes.
    #[inline]
    pub const fn is_writable(&self) -> bool {
        self.flags().contains(EntryFlags::RW)
    }

    /// Whether the page was written.
    #[inline]
    pub const fn is_dirty(&self) -> bool {
        self.flags().contains(EntryFlags::D)
    }

    /// Whether the entry carries the share bit.
    #[inline]
    pub const fn is_shared(&self) -> bool {
        self.flags().contains(EntryFlags::SHARE)
    }

    /// Whether instruction fetches are denied.
    #[inline]
    pub const fn is_no_exec(&self) -> bool {
        self.flags().contains(EntryFlags::XD)
    }

    /// The software-available bits of this entry.
    #[inline]
    pub const fn avail(&self) -> usize {
        self.0 & USER_AVAIL
    }

    /// The physical address of the entry, if present.
    #[inline]
    pub const fn pa(&self) -> Option<Pa> {
        if self.is_present() {
            Pa::new(self.0 & ADDR_MASK)
        } else {
            None
        }
    }
}

impl core::fmt::Debug for Entry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Entry({:016x}, {:?})", self.0 & ADDR_MASK, self.flags())
    }
}

/// Page Table Mapping Error.
///
/// This enum represents errors that can occur when modifying a [`PageTable`].
#[derive(Debug, PartialEq, Eq)]
pub enum PageTableMappingError {
    /// Unaligned address.
    ///
    /// The virtual or physical address is not aligned to the size of the
    /// mapping.
    Unaligned,

    /// Not exist.
    ///
    /// No mapping governs the requested address.
    NotExist,

    /// Duplicated mapping.
    ///
    /// The address is already covered by a mapping, at this level or above.
    Duplicated,

    /// Invalid level.
    ///
    /// A superpage was requested at a level that cannot hold one.
    InvalidLevel,
}

#[repr(C, align(4096))]
struct PdpTable {
    entries: [Pdpe; NPTENTRIES],
    next: [Option<Box<PdTable>>; NPTENTRIES],
}

#[repr(C, align(4096))]
struct PdTable {
    entries: [Pde; NPTENTRIES],
    next: [Option<Box<PtTable>>; NPTENTRIES],
}

#[repr(C, align(4096))]
struct PtTable {
    entries: [Pte; NPTENTRIES],
}

#[repr(C, align(4096))]
struct Pml4Table {
    entries: [Pml4e; NPTENTRIES],
    next: [Option<Box<PdpTable>>; NPTENTRIES],
}

impl PdpTable {
    fn new_boxed() -> Box<Self> {
        Box::new(Self {
            entries: [Pdpe(0); NPTENTRIES],
            next: [const { None }; NPTENTRIES],
        })
    }
}

impl PdTable {
    fn new_boxed() -> Box<Self> {
        Box::new(Self {
            entries: [Pde(0); NPTENTRIES],
            next: [const { None }; NPTENTRIES],
        })
    }
}

impl PtTable {
    fn new_boxed() -> Box<Self> {
        Box::new(Self {
            entries: [Pte(0); NPTENTRIES],
        })
    }
}

/// The physical address of a heap-backed table, i.e. the address of its
/// first entry.
fn table_pa<T>(table: &T) -> Pa {
    Pa::new(table as *const T as usize).unwrap_or(Pa::ZERO)
}

const TABLE_FLAGS: usize = 0b111; // P | RW | US

/// A heap-backed x86_64 four-level page table.
///
/// The table is never loaded into `cr3`; it exists so that an address space
/// can be built, modified and inspected in memory. It implements
/// [`PageTableView`], so everything that inspects the running environment's
/// page table through the recursive mapping works on it unchanged.
///
/// Intermediate entries are created with `P | RW | US`, as the attributes of
/// all levels are ANDed together by the hardware; the effective permission is
/// the one of the terminal entry.
pub struct PageTable {
    root: Box<Pml4Table>,
}

impl PageTable {
    /// Create an empty page table.
    pub fn new() -> Self {
        Self {
            root: Box::new(Pml4Table {
                entries: [Pml4e(0); NPTENTRIES],
                next: [const { None }; NPTENTRIES],
            }),
        }
    }

    fn pdp_mut(&mut self, va: Va) -> &mut PdpTable {
        let i = va.pml4ei();
        let root = &mut *self.root;
        let table = root.next[i].get_or_insert_with(PdpTable::new_boxed);
        root.entries[i] = Pml4e((table_pa(&**table).into_usize() & ADDR_MASK) | TABLE_FLAGS);
        table
    }

    fn pd_mut(&mut self, va: Va) -> Result<&mut PdTable, PageTableMappingError> {
        let pdp = self.pdp_mut(va);
        let i = va.pdpei();
        if pdp.entries[i].is_superpage() {
            return Err(PageTableMappingError::Duplicated);
        }
        let table = pdp.next[i].get_or_insert_with(PdTable::new_boxed);
        pdp.entries[i] = Pdpe((table_pa(&**table).into_usize() & ADDR_MASK) | TABLE_FLAGS);
        Ok(&mut **table)
    }

    fn pt_mut(&mut self, va: Va) -> Result<&mut PtTable, PageTableMappingError> {
        let pd = self.pd_mut(va)?;
        let i = va.pdei();
        if pd.entries[i].is_superpage() {
            return Err(PageTableMappingError::Duplicated);
        }
        let table = pd.next[i].get_or_insert_with(PtTable::new_boxed);
        pd.entries[i] = Pde((table_pa(&**table).into_usize() & ADDR_MASK) | TABLE_FLAGS);
        Ok(&mut **table)
    }

    /// Map a 4 KiB page at `va` to `pa` with `flags`.
    ///
    /// `P` is always added to `flags`.
    ///
    /// # Errors
    /// - [`PageTableMappingError::Unaligned`] if `va` or `pa` is not page
    ///   aligned.
    /// - [`PageTableMappingError::Duplicated`] if `va` is already mapped,
    ///   either by a page or by a covering superpage.
    pub fn map(&mut self, va: Va, pa: Pa, flags: PteFlags) -> Result<(), PageTableMappingError> {
        if va.offset() != 0 || pa.offset() != 0 {
            return Err(PageTableMappingError::Unaligned);
        }
        let pte = &mut self.pt_mut(va)?.entries[va.ptei()];
        if pte.is_present() {
            return Err(PageTableMappingError::Duplicated);
        }
        pte.set_flags(flags | PteFlags::P).set_pa(pa)?;
        Ok(())
    }

    /// Map a superpage at `va` to `pa`.
    ///
    /// `level` selects the granularity: [`Level::Pdp`] for 1 GiB and
    /// [`Level::Pd`] for 2 MiB. `flags` are raw entry bits; `P` and `PS` are
    /// always added.
    ///
    /// # Errors
    /// - [`PageTableMappingError::InvalidLevel`] for [`Level::Pml4`] and
    ///   [`Level::Pt`].
    /// - [`PageTableMappingError::Unaligned`] if `va` or `pa` is not aligned
    ///   to the superpage size.
    /// - [`PageTableMappingError::Duplicated`] if any part of the range is
    ///   already mapped.
    pub fn map_superpage(
        &mut self,
        va: Va,
        level: Level,
        pa: Pa,
        flags: EntryFlags,
    ) -> Result<(), PageTableMappingError> {
        let size = match level {
            Level::Pdp => PDP_SIZE,
            Level::Pd => PD_SIZE,
            Level::Pml4 | Level::Pt => return Err(PageTableMappingError::InvalidLevel),
        };
        if va.into_usize() & (size - 1) != 0 || pa.into_usize() & (size - 1) != 0 {
            return Err(PageTableMappingError::Unaligned);
        }
        let raw = (pa.into_usize() & ADDR_MASK)
            | (flags | EntryFlags::P | EntryFlags::PS).bits();
        if level == Level::Pdp {
            let pdp = self.pdp_mut(va);
            let i = va.pdpei();
            if pdp.entries[i].is_present() {
                return Err(PageTableMappingError::Duplicated);
            }
            pdp.entries[i] = Pdpe(raw);
        } else {
            let pd = self.pd_mut(va)?;
            let i = va.pdei();
            if pd.entries[i].is_present() {
                return Err(PageTableMappingError::Duplicated);
            }
            pd.entries[i] = Pde(raw);
        }
        Ok(())
    }

    /// Find the terminal entry governing `va`.
    fn terminal_mut(&mut self, va: Va) -> Result<(Level, &mut usize), PageTableMappingError> {
        let root = &mut *self.root;
        let i = va.pml4ei();
        if !root.entries[i].is_present() {
            return Err(PageTableMappingError::NotExist);
        }
        let pdp = root.next[i].as_deref_mut().ok_or(PageTableMappingError::NotExist)?;
        let i = va.pdpei();
        if !pdp.entries[i].is_present() {
            return Err(PageTableMappingError::NotExist);
        }
        if pdp.entries[i].is_superpage() {
            return Ok((Level::Pdp, &mut pdp.entries[i].0));
        }
        let pd = pdp.next[i].as_deref_mut().ok_or(PageTableMappingError::NotExist)?;
        let i = va.pdei();
        if !pd.entries[i].is_present() {
            return Err(PageTableMappingError::NotExist);
        }
        if pd.entries[i].is_superpage() {
            return Ok((Level::Pd, &mut pd.entries[i].0));
        }
        let pt = pd.next[i].as_deref_mut().ok_or(PageTableMappingError::NotExist)?;
        let pte = &mut pt.entries[va.ptei()];
        if pte.is_present() {
            Ok((Level::Pt, &mut pte.0))
        } else {
            Err(PageTableMappingError::NotExist)
        }
    }

    /// Unmap the page or superpage starting at `va`, returning the physical
    /// address it mapped.
    ///
    /// # Errors
    /// - [`PageTableMappingError::NotExist`] if nothing maps `va`.
    /// - [`PageTableMappingError::Unaligned`] if `va` is not the first
    ///   address of the mapping governing it.
    pub fn unmap(&mut self, va: Va) -> Result<Pa, PageTableMappingError> {
        let (level, raw) = self.terminal_mut(va)?;
        if va.into_usize() & (level.span() - 1) != 0 {
            return Err(PageTableMappingError::Unaligned);
        }
        let pa = Entry(*raw).pa().ok_or(PageTableMappingError::NotExist)?;
        *raw = 0;
        Ok(pa)
    }

    /// Modify the raw bits of the terminal entry governing `va`.
    ///
    /// The physical address and the present bit are preserved whatever `f`
    /// does to them.
    ///
    /// # Errors
    /// - [`PageTableMappingError::NotExist`] if nothing maps `va`.
    pub fn update(
        &mut self,
        va: Va,
        f: impl FnOnce(EntryFlags) -> EntryFlags,
    ) -> Result<Level, PageTableMappingError> {
        let (level, raw) = self.terminal_mut(va)?;
        let entry = Entry(*raw);
        let flags = f(entry.flags()) | EntryFlags::P;
        *raw = (entry.0 & ADDR_MASK) | flags.bits();
        Ok(level)
    }

    /// Visit every present terminal entry in ascending address order.
    ///
    /// `f` receives the first address covered by the entry, the level at
    /// which the entry lives and the entry itself.
    pub fn for_each_terminal(&self, mut f: impl FnMut(Va, Level, Entry)) {
        let root = &*self.root;
        for (i4, pdp) in root.next.iter().enumerate() {
            let Some(pdp) = pdp.as_deref().filter(|_| root.entries[i4].is_present()) else {
                continue;
            };
            for (i3, pdpe) in pdp.entries.iter().enumerate() {
                if !pdpe.is_present() {
                    continue;
                }
                if pdpe.is_superpage() {
                    f(Va::from_indices(i4, i3, 0, 0, 0), Level::Pdp, (*pdpe).into());
                    continue;
                }
                let Some(pd) = pdp.next[i3].as_deref() else {
                    continue;
                };
                for (i2, pde) in pd.entries.iter().enumerate() {
                    if !pde.is_present() {
                        continue;
                    }
                    if pde.is_superpage() {
                        f(Va::from_indices(i4, i3, i2, 0, 0), Level::Pd, (*pde).into());
                        continue;
                    }
                    let Some(pt) = pd.next[i2].as_deref() else {
                        continue;
                    };
                    for (i1, pte) in pt.entries.iter().enumerate() {
                        if pte.is_present() {
                            f(Va::from_indices(i4, i3, i2, i1, 0), Level::Pt, (*pte).into());
                        }
                    }
                }
            }
        }
    }
}

impl Default for PageTable {
    fn default() -> Self {
        Self::new()
    }
}

impl PageTableView for PageTable {
    fn pml4e(&self, va: Va) -> Pml4e {
        self.root.entries[va.pml4ei()]
    }

    fn pdpe(&self, va: Va) -> Pdpe {
        self.root.next[va.pml4ei()]
            .as_deref()
            .map_or(Pdpe(0), |pdp| pdp.entries[va.pdpei()])
    }

    fn pde(&self, va: Va) -> Pde {
        self.root.next[va.pml4ei()]
            .as_deref()
            .and_then(|pdp| pdp.next[va.pdpei()].as_deref())
            .map_or(Pde(0), |pd| pd.entries[va.pdei()])
    }

    fn pte(&self, va: Va) -> Pte {
        self.root.next[va.pml4ei()]
            .as_deref()
            .and_then(|pdp| pdp.next[va.pdpei()].as_deref())
            .and_then(|pd| pd.next[va.pdei()].as_deref())
            .map_or(Pte(0), |pt| pt.entries[va.ptei()])
    }
}
