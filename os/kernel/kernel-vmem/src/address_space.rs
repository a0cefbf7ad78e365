//! # Address Space (32-bit, directory-rooted)
//!
//! Strongly-typed helpers to edit a **single** virtual address space through a
//! [`TableWindow`].
//!
//! - [`AddressSpace::map_page`] installs one 4 KiB mapping, allocating and
//!   linking the page table on demand.
//! - [`AddressSpace::unmap_page`] clears one PTE and returns the frame.
//! - [`AddressSpace::translate`] resolves a VA to a PA.
//! - [`AddressSpace::identity_map_range`] maps `[start, end)` onto itself.
//!
//! Directory entries are created with caller-provided **table flags**; when an
//! existing table is reused, its entry is widened so it is at least as
//! permissive as the new leaf. Leaf flags come from the mapping call.

use crate::info::RECURSIVE_SLOT;
use crate::{
    DirectoryIndex, FrameAlloc, PageEntryBits, PageTable, PtEntry, RecursiveWindow, TableIndex,
    TableWindow, VirtualAccess,
};
use kernel_info::memory::PhysicalRange;
use kernel_memory_addresses::{
    PageSize, PhysicalAddress, PhysicalPage, Size4K, VirtualAddress, VirtualPage,
};
use log::trace;

#[derive(Debug, Clone, Copy, Eq, PartialEq, thiserror::Error)]
pub enum MapError {
    #[error("no frame available for a page table")]
    OutOfFrames,
    #[error("{va} is already mapped to {existing}")]
    AlreadyMapped {
        va: VirtualAddress,
        existing: PhysicalAddress,
    },
    #[error("{0} is not mapped")]
    NotMapped(VirtualAddress),
    #[error("{0} lies in the recursive slot")]
    RecursiveSlot(VirtualAddress),
    #[error("address {0:#010x} is not page aligned")]
    Unaligned(u32),
    #[error("range wraps around the address space")]
    Overflow,
}

/// Handle to a single address space, edited through the window `W`.
pub struct AddressSpace<W: TableWindow> {
    window: W,
}

/// The live address space, edited through its own recursive slot.
pub type RecursiveAddressSpace<V> = AddressSpace<RecursiveWindow<V>>;

impl<W: TableWindow> AddressSpace<W> {
    #[inline]
    pub const fn new(window: W) -> Self {
        Self { window }
    }

    #[inline]
    pub const fn window(&self) -> &W {
        &self.window
    }

    #[inline]
    pub fn into_window(self) -> W {
        self.window
    }

    /// Map one 4 KiB page `va -> pa`.
    ///
    /// Re-mapping a page onto the frame it already maps just replaces the
    /// flags.
    ///
    /// # Errors
    /// - [`MapError::RecursiveSlot`] for addresses under the self-map.
    /// - [`MapError::OutOfFrames`] if a page table had to be allocated and
    ///   `alloc` is exhausted.
    /// - [`MapError::AlreadyMapped`] if `va` maps a different frame.
    pub fn map_page<A: FrameAlloc>(
        &mut self,
        alloc: &mut A,
        va: VirtualPage<Size4K>,
        pa: PhysicalPage<Size4K>,
        table_flags: PageEntryBits,
        page_flags: PageEntryBits,
    ) -> Result<(), MapError> {
        let table = self.ensure_table(alloc, va.base(), table_flags)?;
        let ti = PageTable::index_of(va.base());
        if let Some((existing, _)) = table.get(ti).page_4k()
            && existing != pa
        {
            return Err(MapError::AlreadyMapped {
                va: va.base(),
                existing: existing.base(),
            });
        }

        table.set(ti, PtEntry::make_4k(pa, page_flags));
        self.window.flush(va.base());
        Ok(())
    }

    /// Map `pages` consecutive pages starting at `va` onto consecutive frames
    /// starting at `pa`.
    ///
    /// # Errors
    /// Whatever [`map_page`](Self::map_page) reports, plus
    /// [`MapError::Overflow`] if either range wraps.
    pub fn map_range<A: FrameAlloc>(
        &mut self,
        alloc: &mut A,
        va: VirtualPage<Size4K>,
        pa: PhysicalPage<Size4K>,
        pages: u32,
        table_flags: PageEntryBits,
        page_flags: PageEntryBits,
    ) -> Result<(), MapError> {
        let (mut va, mut pa) = (va, pa);
        for i in 0..pages {
            self.map_page(alloc, va, pa, table_flags, page_flags)?;
            if i + 1 < pages {
                va = va.checked_next().ok_or(MapError::Overflow)?;
                pa = pa.checked_next().ok_or(MapError::Overflow)?;
            }
        }
        Ok(())
    }

    /// Map every page touched by `range` onto itself.
    ///
    /// Returns the number of pages mapped.
    ///
    /// # Errors
    /// See [`map_range`](Self::map_range).
    pub fn identity_map_range<A: FrameAlloc>(
        &mut self,
        alloc: &mut A,
        range: PhysicalRange,
        table_flags: PageEntryBits,
        page_flags: PageEntryBits,
    ) -> Result<u32, MapError> {
        let pages = range.page_span();
        if pages == 0 {
            return Ok(0);
        }
        let first = range.first_page();
        let va = VirtualPage::<Size4K>::from_index(first.index());
        self.map_range(alloc, va, first, pages, table_flags, page_flags)?;
        Ok(pages)
    }

    /// Clear the mapping of `va` and return the frame it pointed at.
    ///
    /// Page tables are never freed, even when they become empty.
    ///
    /// # Errors
    /// [`MapError::NotMapped`] if no page is mapped at `va`.
    pub fn unmap_page(&mut self, va: VirtualPage<Size4K>) -> Result<PhysicalPage<Size4K>, MapError> {
        let di = DirectoryIndex::from(va.base());
        if di == DirectoryIndex::RECURSIVE {
            return Err(MapError::RecursiveSlot(va.base()));
        }
        let frame = self
            .window
            .directory()
            .get(di)
            .next_table()
            .ok_or(MapError::NotMapped(va.base()))?;
        let table = self.window.table(di, frame);
        let ti = PageTable::index_of(va.base());
        let (page, _) = table.get(ti).page_4k().ok_or(MapError::NotMapped(va.base()))?;
        table.set(ti, PtEntry::zero());
        self.window.flush(va.base());
        Ok(page)
    }

    /// Translate a virtual address to a physical one, if mapped.
    pub fn translate(&mut self, va: VirtualAddress) -> Option<PhysicalAddress> {
        let di = DirectoryIndex::from(va);
        let frame = self.window.directory().get(di).next_table()?;
        let table = self.window.table(di, frame);
        let (page, _) = table.get(PageTable::index_of(va)).page_4k()?;
        Some(page.join(va.offset::<Size4K>()))
    }

    /// The leaf flags for `va`, if mapped.
    pub fn leaf_flags(&mut self, va: VirtualAddress) -> Option<PageEntryBits> {
        let di = DirectoryIndex::from(va);
        let frame = self.window.directory().get(di).next_table()?;
        let table = self.window.table(di, frame);
        table.get(TableIndex::from(va)).page_4k().map(|(_, flags)| flags)
    }

    /// Find the table covering `va`, allocating and linking one if needed.
    fn ensure_table<A: FrameAlloc>(
        &mut self,
        alloc: &mut A,
        va: VirtualAddress,
        table_flags: PageEntryBits,
    ) -> Result<&mut PageTable, MapError> {
        let di = DirectoryIndex::from(va);
        if di.as_usize() == RECURSIVE_SLOT {
            return Err(MapError::RecursiveSlot(va));
        }

        let entry = self.window.directory().get(di);
        if let Some(frame) = entry.next_table() {
            let have = entry.flags();
            if (table_flags.user_access() && !have.user_access())
                || (table_flags.writable() && !have.writable())
            {
                let widened = have
                    .permissions()
                    .with_user_access(have.user_access() || table_flags.user_access())
                    .with_writable(have.writable() || table_flags.writable());
                self.window
                    .directory()
                    .set(di, crate::PdEntry::make_table(frame, widened));
            }
            return Ok(self.window.table(di, frame));
        }

        let frame = alloc.alloc_4k().ok_or(MapError::OutOfFrames)?;
        trace!("page table for slot {} at {}", di.as_usize(), frame);
        Ok(self.window.install_table(di, frame, table_flags))
    }
}

impl<V: VirtualAccess> AddressSpace<RecursiveWindow<V>> {
    /// Map `virtual -> physical` in the **active** address space.
    ///
    /// Walks the recursive slot to find the page table for `virtual`,
    /// allocating one from `alloc` when the directory slot is empty. This is
    /// the only mapping entry point once paging is live.
    ///
    /// # Errors
    /// [`MapError::Unaligned`] if either address is not 4 KiB aligned,
    /// otherwise as [`map_page`](Self::map_page).
    pub fn map_page_to_recursive_directory<A: FrameAlloc>(
        &mut self,
        alloc: &mut A,
        virtual_address: VirtualAddress,
        physical: PhysicalAddress,
        table_flags: PageEntryBits,
        page_flags: PageEntryBits,
    ) -> Result<(), MapError> {
        if !virtual_address.is_aligned::<Size4K>() {
            return Err(MapError::Unaligned(virtual_address.as_u32()));
        }
        if !physical.is_aligned::<Size4K>() {
            return Err(MapError::Unaligned(physical.as_u32()));
        }
        self.map_page(
            alloc,
            VirtualPage::containing_address(virtual_address),
            PhysicalPage::containing_address(physical),
            table_flags,
            page_flags,
        )
    }
}

/// Number of 4 KiB pages needed for `len` bytes starting at `offset` into a page.
#[inline]
#[must_use]
pub const fn pages_spanned(offset: u32, len: u32) -> u32 {
    if len == 0 {
        return 0;
    }
    (offset + len).div_ceil(Size4K::SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakePhysicalMemory, SoftMmu, BumpFrames};
    use crate::{PagingControl, PhysMapper, PhysicalWindow};

    const MIB: u32 = 1024 * 1024;

    #[test]
    fn map_translate_unmap_through_physical_window() {
        let mem = FakePhysicalMemory::new(4 * MIB);
        let mut alloc = BumpFrames::new(0x20_0000, 0x30_0000);
        let root = alloc.alloc_4k().expect("root");
        unsafe { mem.zero(root.base(), Size4K::SIZE) };

        let mut space = AddressSpace::new(PhysicalWindow::new(&mem, root));
        let va = VirtualPage::containing_address(VirtualAddress::new(0xC000_5000));
        let pa = PhysicalPage::containing_address(PhysicalAddress::new(0x0013_0000));
        space
            .map_page(&mut alloc, va, pa, PageEntryBits::kernel_table(), PageEntryBits::kernel_rw())
            .expect("map");

        assert_eq!(
            space.translate(VirtualAddress::new(0xC000_5123)),
            Some(PhysicalAddress::new(0x0013_0123))
        );
        assert_eq!(space.translate(VirtualAddress::new(0xC000_6000)), None);
        assert_eq!(space.unmap_page(va), Ok(pa));
        assert_eq!(space.translate(VirtualAddress::new(0xC000_5000)), None);
        assert_eq!(space.unmap_page(va), Err(MapError::NotMapped(va.base())));
    }

    #[test]
    fn conflicting_mapping_is_rejected() {
        let mem = FakePhysicalMemory::new(4 * MIB);
        let mut alloc = BumpFrames::new(0x20_0000, 0x30_0000);
        let root = alloc.alloc_4k().expect("root");
        unsafe { mem.zero(root.base(), Size4K::SIZE) };
        let mut space = AddressSpace::new(PhysicalWindow::new(&mem, root));

        let va = VirtualPage::containing_address(VirtualAddress::new(0x0040_0000));
        let a = PhysicalPage::containing_address(PhysicalAddress::new(0x0010_0000));
        let b = PhysicalPage::containing_address(PhysicalAddress::new(0x0010_1000));
        let flags = PageEntryBits::kernel_rw();
        space.map_page(&mut alloc, va, a, flags, flags).expect("first");
        space
            .map_page(&mut alloc, va, a, flags, PageEntryBits::kernel_ro())
            .expect("same frame, new flags");
        assert_eq!(
            space.map_page(&mut alloc, va, b, flags, flags),
            Err(MapError::AlreadyMapped {
                va: va.base(),
                existing: a.base()
            })
        );
    }

    #[test]
    fn user_leaf_widens_kernel_table() {
        let mem = FakePhysicalMemory::new(4 * MIB);
        let mut alloc = BumpFrames::new(0x20_0000, 0x30_0000);
        let root = alloc.alloc_4k().expect("root");
        unsafe { mem.zero(root.base(), Size4K::SIZE) };
        let mut space = AddressSpace::new(PhysicalWindow::new(&mem, root));

        let p0 = PhysicalPage::containing_address(PhysicalAddress::new(0x0010_0000));
        let p1 = PhysicalPage::containing_address(PhysicalAddress::new(0x0010_1000));
        let v0 = VirtualPage::containing_address(VirtualAddress::new(0x0800_0000));
        let v1 = VirtualPage::containing_address(VirtualAddress::new(0x0800_1000));
        space
            .map_page(&mut alloc, v0, p0, PageEntryBits::kernel_table(), PageEntryBits::kernel_ro())
            .expect("kernel page");
        space
            .map_page(&mut alloc, v1, p1, PageEntryBits::user_table(), PageEntryBits::user_ro())
            .expect("user page");

        let pde = space.window.directory().get(DirectoryIndex::from(v0.base()));
        assert!(pde.flags().user_access());
    }

    #[test]
    fn table_allocation_failure_is_reported() {
        let mem = FakePhysicalMemory::new(4 * MIB);
        let mut alloc = BumpFrames::new(0x20_0000, 0x20_1000);
        let root = alloc.alloc_4k().expect("root");
        unsafe { mem.zero(root.base(), Size4K::SIZE) };
        let mut space = AddressSpace::new(PhysicalWindow::new(&mem, root));
        let va = VirtualPage::containing_address(VirtualAddress::new(0x0040_0000));
        let pa = PhysicalPage::containing_address(PhysicalAddress::new(0x0010_0000));
        let flags = PageEntryBits::kernel_rw();
        assert_eq!(space.map_page(&mut alloc, va, pa, flags, flags), Err(MapError::OutOfFrames));
    }

    #[test]
    fn recursive_window_sees_the_same_tables() {
        let mem = FakePhysicalMemory::new(4 * MIB);
        let mut alloc = BumpFrames::new(0x20_0000, 0x30_0000);
        let root = alloc.alloc_4k().expect("root");
        unsafe { mem.zero(root.base(), Size4K::SIZE) };

        // Build an identity map of the first MiB while "unpaged".
        let mut space = AddressSpace::new(PhysicalWindow::new(&mem, root));
        space
            .identity_map_range(
                &mut alloc,
                PhysicalRange::from_raw(0, MIB),
                PageEntryBits::kernel_table(),
                PageEntryBits::kernel_rw(),
            )
            .expect("identity");
        space.window.directory().install_recursive_slot(root);

        let mmu = SoftMmu::new(&mem);
        unsafe {
            mmu.load_directory(root);
            mmu.enable_paging();
        }

        let mut live = AddressSpace::new(RecursiveWindow::new(&mmu));
        assert_eq!(
            live.translate(VirtualAddress::new(0x0008_0123)),
            Some(PhysicalAddress::new(0x0008_0123))
        );

        live.map_page_to_recursive_directory(
            &mut alloc,
            VirtualAddress::new(0xC000_0000),
            PhysicalAddress::new(0x0015_0000),
            PageEntryBits::kernel_table(),
            PageEntryBits::kernel_rw_global(),
        )
        .expect("map live");

        // The software MMU resolves the new mapping by walking the tables.
        assert_eq!(
            mmu.translate(VirtualAddress::new(0xC000_0010)),
            Some(PhysicalAddress::new(0x0015_0010))
        );
        // And the physical view agrees with the recursive one.
        let mut offline = AddressSpace::new(PhysicalWindow::new(&mem, root));
        assert_eq!(
            offline.translate(VirtualAddress::new(0xC000_0010)),
            Some(PhysicalAddress::new(0x0015_0010))
        );
        assert!(mmu.invalidations() > 0);
    }

    #[test]
    fn recursive_mapping_rejects_unaligned_and_self_slot() {
        let mem = FakePhysicalMemory::new(4 * MIB);
        let mut alloc = BumpFrames::new(0x20_0000, 0x30_0000);
        let root = alloc.alloc_4k().expect("root");
        unsafe { mem.zero(root.base(), Size4K::SIZE) };
        let mut space = AddressSpace::new(PhysicalWindow::new(&mem, root));
        space
            .identity_map_range(
                &mut alloc,
                PhysicalRange::from_raw(0, 4 * MIB),
                PageEntryBits::kernel_table(),
                PageEntryBits::kernel_rw(),
            )
            .expect("identity");
        space.window.directory().install_recursive_slot(root);

        let mmu = SoftMmu::new(&mem);
        unsafe {
            mmu.load_directory(root);
            mmu.enable_paging();
        }
        let mut live = AddressSpace::new(RecursiveWindow::new(&mmu));
        let flags = PageEntryBits::kernel_rw();
        assert_eq!(
            live.map_page_to_recursive_directory(
                &mut alloc,
                VirtualAddress::new(0xC000_0800),
                PhysicalAddress::new(0x0015_0000),
                flags,
                flags
            ),
            Err(MapError::Unaligned(0xC000_0800))
        );
        assert_eq!(
            live.map_page_to_recursive_directory(
                &mut alloc,
                VirtualAddress::new(0xFFC0_0000),
                PhysicalAddress::new(0x0015_0000),
                flags,
                flags
            ),
            Err(MapError::RecursiveSlot(VirtualAddress::new(0xFFC0_0000)))
        );
    }

    #[test]
    fn pages_spanned_counts_straddling_ranges() {
        assert_eq!(pages_spanned(0, 0), 0);
        assert_eq!(pages_spanned(0, 4096), 1);
        assert_eq!(pages_spanned(0xFFF, 2), 2);
    }
}
