//! # Page Directory (root level)
//!
//! - [`DirectoryIndex`]: index type for VA bits `[31:22]`.
//! - [`PdEntry`]: a directory entry pointing at a [`PageTable`](crate::PageTable).
//! - [`PageDirectory`]: a 4 KiB-aligned array of 1024 PDEs.
//!
//! 4 MiB pages (`PS=1`) are never created; [`PdEntry::make_table`] forces `PS=0`.

use crate::PageEntryBits;
use crate::info::RECURSIVE_SLOT;
use crate::page_table::ENTRIES;
use kernel_memory_addresses::{PageSize, PhysicalPage, Size4K, Size4M, VirtualAddress};

/// Index into the Page Directory (derived from VA bits `[31:22]`).
#[repr(transparent)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct DirectoryIndex(u16);

/// A single Page Directory entry (PDE).
#[doc(alias = "PDE")]
#[repr(transparent)]
#[derive(Copy, Clone, Debug)]
pub struct PdEntry(PageEntryBits);

/// The Page Directory: 1024 entries, 4 KiB-aligned.
#[doc(alias = "PD")]
#[repr(C, align(4096))]
pub struct PageDirectory {
    entries: [PdEntry; ENTRIES],
}

impl DirectoryIndex {
    /// The self-referencing slot.
    #[allow(clippy::cast_possible_truncation)]
    pub const RECURSIVE: Self = Self::new(RECURSIVE_SLOT as u16);

    /// Build an index from a virtual address (extracts bits `[31:22]`).
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn from(va: VirtualAddress) -> Self {
        Self::new((va.as_u32() >> Size4M::SHIFT) as u16)
    }

    /// Construct from a raw `u16`.
    ///
    /// ### Debug assertions
    /// - Asserts `v < 1024` in debug builds.
    #[inline]
    #[must_use]
    pub const fn new(v: u16) -> Self {
        debug_assert!((v as usize) < ENTRIES);
        Self(v)
    }

    #[inline]
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }

    /// First virtual address covered by this slot.
    #[inline]
    #[must_use]
    #[allow(clippy::cast_lossless)]
    pub const fn base(self) -> VirtualAddress {
        VirtualAddress::new((self.0 as u32) << Size4M::SHIFT)
    }
}

impl PdEntry {
    /// Create a zero (non-present) entry.
    #[inline]
    #[must_use]
    pub const fn zero() -> Self {
        Self(PageEntryBits::new())
    }

    #[inline]
    #[must_use]
    pub const fn is_present(self) -> bool {
        self.0.present()
    }

    /// Expose the underlying bitfield.
    #[inline]
    #[must_use]
    pub const fn flags(self) -> PageEntryBits {
        self.0
    }

    /// If present, the page table this entry points at.
    #[inline]
    #[must_use]
    pub fn next_table(self) -> Option<PhysicalPage<Size4K>> {
        if !self.is_present() {
            return None;
        }
        debug_assert!(!self.0.large_page(), "4 MiB pages are not used");
        Some(PhysicalPage::from_addr(self.0.physical_address()))
    }

    /// Point at a page table. Sets `present=1` and forces `PS=0`.
    #[inline]
    #[must_use]
    pub const fn make_table(table: PhysicalPage<Size4K>, mut flags: PageEntryBits) -> Self {
        flags.set_large_page(false);
        flags.set_present(true);
        flags.set_physical_address(table.base());
        Self(flags)
    }

    #[inline]
    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0.into_bits()
    }

    #[inline]
    #[must_use]
    pub const fn from_raw(v: u32) -> Self {
        Self(PageEntryBits::from_bits(v))
    }
}

impl PageDirectory {
    /// Create a fully zeroed directory (all entries non-present).
    #[inline]
    #[must_use]
    pub const fn zeroed() -> Self {
        Self {
            entries: [PdEntry::zero(); ENTRIES],
        }
    }

    /// Clear every entry in place.
    #[inline]
    pub fn zero(&mut self) {
        self.entries.fill(PdEntry::zero());
    }

    #[inline]
    #[must_use]
    pub const fn get(&self, i: DirectoryIndex) -> PdEntry {
        self.entries[i.as_usize()]
    }

    /// Write the entry at `i`.
    ///
    /// Caller must handle any required TLB invalidation when changing active mappings.
    #[inline]
    pub const fn set(&mut self, i: DirectoryIndex, e: PdEntry) {
        self.entries[i.as_usize()] = e;
    }

    #[inline]
    #[must_use]
    pub const fn index_of(va: VirtualAddress) -> DirectoryIndex {
        DirectoryIndex::from(va)
    }

    /// Point the last slot at the directory's own frame.
    ///
    /// Supervisor-only, so user code cannot see or edit the tables.
    #[inline]
    pub const fn install_recursive_slot(&mut self, own_frame: PhysicalPage<Size4K>) {
        self.set(
            DirectoryIndex::RECURSIVE,
            PdEntry::make_table(own_frame, PageEntryBits::kernel_rw()),
        );
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use kernel_memory_addresses::PhysicalAddress;

    #[test]
    fn index_from_address() {
        assert_eq!(DirectoryIndex::from(VirtualAddress::new(0xC010_0000)).as_usize(), 0x300);
        assert_eq!(DirectoryIndex::from(VirtualAddress::new(0xFFFF_F000)), DirectoryIndex::RECURSIVE);
        assert_eq!(DirectoryIndex::new(0x300).base().as_u32(), 0xC000_0000);
    }

    #[test]
    fn recursive_slot_points_at_itself() {
        let frame = PhysicalPage::<Size4K>::from_addr(PhysicalAddress::new(0x0010_5000));
        let mut pd = PageDirectory::zeroed();
        pd.install_recursive_slot(frame);
        let e = pd.get(DirectoryIndex::RECURSIVE);
        assert_eq!(e.next_table(), Some(frame));
        assert!(e.flags().writable());
        assert!(!e.flags().user_access());
    }
}
