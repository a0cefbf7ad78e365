//! # Table Windows
//!
//! How the directory and its tables are reached depends on whether paging is
//! active. A [`TableWindow`] hides that difference from
//! [`AddressSpace`](crate::AddressSpace).

use crate::info::{RECURSIVE_DIRECTORY, RECURSIVE_TABLES_BASE};
use crate::{DirectoryIndex, PageDirectory, PageEntryBits, PageTable, PdEntry, PhysMapper, VirtualAccess};
use kernel_memory_addresses::{PageSize, PhysicalPage, Size4K, VirtualAddress};

/// Access path to one page directory and its tables.
pub trait TableWindow {
    /// The directory being edited.
    fn directory(&mut self) -> &mut PageDirectory;

    /// The table linked at `index`, which lives in `frame`.
    fn table(&mut self, index: DirectoryIndex, frame: PhysicalPage<Size4K>) -> &mut PageTable;

    /// Link `frame` as the table for `index` and hand it back zeroed.
    fn install_table(
        &mut self,
        index: DirectoryIndex,
        frame: PhysicalPage<Size4K>,
        flags: PageEntryBits,
    ) -> &mut PageTable;

    /// A leaf for `va` changed.
    fn flush(&mut self, va: VirtualAddress);
}

/// Tables reached by physical address through a [`PhysMapper`].
///
/// Used while paging is off, and for address spaces that are not active.
pub struct PhysicalWindow<'m, M: PhysMapper> {
    mapper: &'m M,
    root: PhysicalPage<Size4K>,
}

impl<'m, M: PhysMapper> PhysicalWindow<'m, M> {
    #[inline]
    pub const fn new(mapper: &'m M, root: PhysicalPage<Size4K>) -> Self {
        Self { mapper, root }
    }

    /// Physical frame of the directory.
    #[inline]
    pub const fn root(&self) -> PhysicalPage<Size4K> {
        self.root
    }

    #[inline]
    pub const fn mapper(&self) -> &'m M {
        self.mapper
    }
}

impl<M: PhysMapper> TableWindow for PhysicalWindow<'_, M> {
    fn directory(&mut self) -> &mut PageDirectory {
        unsafe { self.mapper.phys_to_mut::<PageDirectory>(self.root.base()) }
    }

    fn table(&mut self, _index: DirectoryIndex, frame: PhysicalPage<Size4K>) -> &mut PageTable {
        unsafe { self.mapper.phys_to_mut::<PageTable>(frame.base()) }
    }

    fn install_table(
        &mut self,
        index: DirectoryIndex,
        frame: PhysicalPage<Size4K>,
        flags: PageEntryBits,
    ) -> &mut PageTable {
        // Zero before linking so the walk never sees stale entries.
        let table = unsafe { self.mapper.phys_to_mut::<PageTable>(frame.base()) };
        table.zero();
        self.directory().set(index, PdEntry::make_table(frame, flags));
        table
    }

    fn flush(&mut self, _va: VirtualAddress) {}
}

/// Tables reached through the recursive slot of the **active** directory.
///
/// Directory at `0xFFFF_F000`, table `i` at `0xFFC0_0000 + i * 4096`.
pub struct RecursiveWindow<V: VirtualAccess> {
    access: V,
}

impl<V: VirtualAccess> RecursiveWindow<V> {
    #[inline]
    pub const fn new(access: V) -> Self {
        Self { access }
    }

    /// Virtual address at which the table for `index` is visible.
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn table_address(index: DirectoryIndex) -> VirtualAddress {
        VirtualAddress::new(RECURSIVE_TABLES_BASE + (index.as_usize() as u32) * Size4K::SIZE)
    }

    #[inline]
    pub const fn access(&self) -> &V {
        &self.access
    }
}

impl<V: VirtualAccess> TableWindow for RecursiveWindow<V> {
    fn directory(&mut self) -> &mut PageDirectory {
        unsafe {
            self.access
                .virt_to_mut::<PageDirectory>(VirtualAddress::new(RECURSIVE_DIRECTORY))
        }
    }

    fn table(&mut self, index: DirectoryIndex, _frame: PhysicalPage<Size4K>) -> &mut PageTable {
        unsafe { self.access.virt_to_mut::<PageTable>(Self::table_address(index)) }
    }

    fn install_table(
        &mut self,
        index: DirectoryIndex,
        frame: PhysicalPage<Size4K>,
        flags: PageEntryBits,
    ) -> &mut PageTable {
        // The table only becomes addressable once the directory points at it.
        self.directory().set(index, PdEntry::make_table(frame, flags));
        let va = Self::table_address(index);
        self.access.invalidate(va);
        let table = unsafe { self.access.virt_to_mut::<PageTable>(va) };
        table.zero();
        table
    }

    fn flush(&mut self, va: VirtualAddress) {
        self.access.invalidate(va);
    }
}
