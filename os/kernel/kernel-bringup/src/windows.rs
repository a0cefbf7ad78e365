//! # Mapping Windows
//!
//! Once paging is on, physical memory outside the identity map is only
//! reachable through pages mapped for the purpose. Two fixed regions below
//! the recursive slot serve that:
//!
//! - the temporary window at [`TEMPORARY_WINDOW_BASE`] for firmware tables,
//!   read-only and released again after each walk;
//! - the MMIO window at [`MMIO_WINDOW_BASE`] for device registers, uncached
//!   and never released.

use crate::bootstrap::{Bootstrap, Mapped};
use alloc::vec::Vec;
use core::ptr::NonNull;
use kernel_acpi::PhysMapRo;
use kernel_alloc::BitmapFrameAlloc;
use kernel_apic::{Mmio, MmioMapper};
use kernel_info::memory::{
    MMIO_WINDOW_BASE, MMIO_WINDOW_PAGES, TEMPORARY_WINDOW_BASE, TEMPORARY_WINDOW_PAGES,
};
use kernel_memory_addresses::{
    PageSize, PhysicalAddress, PhysicalPage, Size4K, VirtualAddress, VirtualPage,
};
use kernel_vmem::{PageEntryBits, PhysMapper, RecursiveAddressSpace, VirtualAccess, pages_spanned};
use log::{trace, warn};

#[derive(Copy, Clone, Debug)]
struct OpenMapping {
    paddr: u64,
    len: usize,
    slot: u32,
    pages: u32,
}

/// Read-only mappings of arbitrary physical memory, stacked in the
/// temporary window. The window is reused once every mapping is released.
pub struct TemporaryMapper<'s, 'a, V: VirtualAccess> {
    frames: &'s mut BitmapFrameAlloc<'a>,
    space: &'s mut RecursiveAddressSpace<V>,
    cursor: u32,
    open: Vec<OpenMapping>,
}

impl<'s, 'a, V: VirtualAccess> TemporaryMapper<'s, 'a, V> {
    pub const fn new(frames: &'s mut BitmapFrameAlloc<'a>, space: &'s mut RecursiveAddressSpace<V>) -> Self {
        Self {
            frames,
            space,
            cursor: 0,
            open: Vec::new(),
        }
    }

    /// Window pages currently in use.
    #[must_use]
    pub const fn pages_in_use(&self) -> u32 {
        self.cursor
    }

    const fn window_page(slot: u32) -> VirtualPage<Size4K> {
        VirtualPage::from_index(TEMPORARY_WINDOW_BASE / Size4K::SIZE + slot)
    }

    fn release(&mut self, mapping: OpenMapping) {
        for n in 0..mapping.pages {
            let page = Self::window_page(mapping.slot + n);
            if let Err(e) = self.space.unmap_page(page) {
                warn!("temporary window page {page} was not mapped: {e}");
            }
        }
        if self.open.is_empty() {
            self.cursor = 0;
        } else if mapping.slot + mapping.pages == self.cursor {
            self.cursor = mapping.slot;
        }
    }
}

impl<V: VirtualAccess> PhysMapRo for TemporaryMapper<'_, '_, V> {
    #[allow(clippy::cast_possible_truncation)]
    unsafe fn map_ro<'a>(&mut self, paddr: u64, len: usize) -> Option<&'a [u8]> {
        if len == 0 {
            return Some(&[]);
        }
        let end = paddr.checked_add(len as u64)?;
        if end > 1 << 32 {
            return None;
        }
        let start = PhysicalAddress::new(paddr as u32);
        let offset = start.as_u32() % Size4K::SIZE;
        let pages = pages_spanned(offset, len as u32);
        if self.cursor + pages > TEMPORARY_WINDOW_PAGES {
            warn!("temporary window exhausted mapping {start}+{len:#x}");
            return None;
        }

        let first = PhysicalPage::<Size4K>::containing_address(start);
        let slot = self.cursor;
        for n in 0..pages {
            let mapped = self.space.map_page(
                &mut *self.frames,
                Self::window_page(slot + n),
                PhysicalPage::from_index(first.index() + n),
                PageEntryBits::kernel_table(),
                PageEntryBits::kernel_ro(),
            );
            if let Err(e) = mapped {
                warn!("cannot map {start} into the temporary window: {e}");
                unmap_pages(self.space, Self::window_page(slot), n);
                return None;
            }
        }
        self.cursor += pages;
        self.open.push(OpenMapping {
            paddr,
            len,
            slot,
            pages,
        });

        let va = Self::window_page(slot).base() + offset;
        trace!("{start}+{len:#x} visible at {va}");
        let ptr = unsafe { self.space.window().access().virt_to_mut::<u8>(va) };
        Some(unsafe { core::slice::from_raw_parts(core::ptr::from_mut(ptr), len) })
    }

    fn unmap(&mut self, paddr: u64, len: usize) {
        if let Some(i) = self
            .open
            .iter()
            .rposition(|m| m.paddr == paddr && m.len == len)
        {
            let mapping = self.open.remove(i);
            self.release(mapping);
        }
    }
}

impl<V: VirtualAccess> Drop for TemporaryMapper<'_, '_, V> {
    fn drop(&mut self) {
        while let Some(mapping) = self.open.pop() {
            self.release(mapping);
        }
    }
}

/// Uncached device register windows, handed out consecutively.
pub struct MmioWindow<'s, 'a, V: VirtualAccess> {
    frames: &'s mut BitmapFrameAlloc<'a>,
    space: &'s mut RecursiveAddressSpace<V>,
    used: &'s mut u32,
}

impl<'s, 'a, V: VirtualAccess> MmioWindow<'s, 'a, V> {
    /// `used` counts the window pages already taken and is advanced on
    /// every mapping.
    pub const fn new(
        frames: &'s mut BitmapFrameAlloc<'a>,
        space: &'s mut RecursiveAddressSpace<V>,
        used: &'s mut u32,
    ) -> Self {
        Self { frames, space, used }
    }
}

impl<V: VirtualAccess> MmioMapper for MmioWindow<'_, '_, V> {
    type Registers = Mmio;

    fn map_registers(&mut self, pa: PhysicalAddress, len: usize) -> Option<Mmio> {
        let offset = pa.as_u32() % Size4K::SIZE;
        let pages = pages_spanned(offset, u32::try_from(len).ok()?);
        if pages == 0 || *self.used + pages > MMIO_WINDOW_PAGES {
            warn!("no room in the MMIO window for {pa}+{len:#x}");
            return None;
        }

        let slot = *self.used;
        let base = VirtualPage::<Size4K>::from_index(MMIO_WINDOW_BASE / Size4K::SIZE + slot);
        let first = PhysicalPage::<Size4K>::containing_address(pa);
        for n in 0..pages {
            if let Err(e) = self.space.map_page(
                &mut *self.frames,
                VirtualPage::from_index(base.index() + n),
                PhysicalPage::from_index(first.index() + n),
                PageEntryBits::kernel_table(),
                PageEntryBits::mmio(),
            ) {
                warn!("cannot map registers at {pa}: {e}");
                unmap_pages(self.space, base, n);
                return None;
            }
        }
        *self.used += pages;

        let va = VirtualAddress::new(MMIO_WINDOW_BASE + slot * Size4K::SIZE + offset);
        trace!("registers {pa}+{len:#x} at {va}");
        let ptr = unsafe { self.space.window().access().virt_to_mut::<u8>(va) };
        Some(unsafe { Mmio::new(NonNull::from(ptr), len) })
    }
}

/// Take back the first `count` pages of a mapping that failed part way.
fn unmap_pages<V: VirtualAccess>(space: &mut RecursiveAddressSpace<V>, first: VirtualPage<Size4K>, count: u32) {
    for n in 0..count {
        let page = VirtualPage::from_index(first.index() + n);
        if let Err(e) = space.unmap_page(page) {
            warn!("window page {page} could not be unmapped: {e}");
        }
    }
}

impl<'a, M: PhysMapper, V: VirtualAccess> Bootstrap<'_, M, Mapped<'a, V>> {
    /// Read-only access to physical memory for firmware table walks.
    pub fn temporary_mapper(&mut self) -> TemporaryMapper<'_, 'a, V> {
        let (frames, space) = self.parts();
        TemporaryMapper::new(frames, space)
    }

    /// Register windows for interrupt controllers.
    pub fn mmio_window(&mut self) -> MmioWindow<'_, 'a, V> {
        let Mapped {
            frames,
            space,
            mmio_used,
            ..
        } = self.state_mut();
        MmioWindow::new(frames, space, mmio_used)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixture::paged;
    use kernel_apic::RegisterBlock;
    use kernel_vmem::testing::{FakePhysicalMemory, SoftMmu};

    const MIB: u32 = 1024 * 1024;

    #[test]
    fn temporary_mapping_spans_pages_and_is_released() {
        let mem = FakePhysicalMemory::new(8 * MIB);
        let mmu = SoftMmu::new(&mem);
        let mut storage = [0u32; 64];
        let mut boot = paged(&mem, &mmu, &mut storage);
        let pattern: Vec<u8> = (0..=255u8).cycle().take(0x1000).collect();
        mem.write(PhysicalAddress::new(0x7F_F800), &pattern);

        {
            let mut mapper = boot.temporary_mapper();
            let bytes = unsafe { mapper.map_ro(0x7F_F800, 0x1000) }.expect("mapped");
            assert_eq!(bytes, &pattern[..]);
            assert_eq!(mapper.pages_in_use(), 2);
            assert_eq!(
                mmu.translate(VirtualAddress::new(TEMPORARY_WINDOW_BASE + 0x800)),
                Some(PhysicalAddress::new(0x7F_F800))
            );
            mapper.unmap(0x7F_F800, 0x1000);
            assert_eq!(mapper.pages_in_use(), 0);
        }
        assert_eq!(mmu.translate(VirtualAddress::new(TEMPORARY_WINDOW_BASE)), None);
    }

    #[test]
    fn nested_mappings_stack_and_drop_cleans_up() {
        let mem = FakePhysicalMemory::new(8 * MIB);
        let mmu = SoftMmu::new(&mem);
        let mut storage = [0u32; 64];
        let mut boot = paged(&mem, &mmu, &mut storage);

        {
            let mut mapper = boot.temporary_mapper();
            let outer = unsafe { mapper.map_ro(0x50_0010, 0x20) }.expect("outer");
            let inner = unsafe { mapper.map_ro(0x60_0000, 0x1001) }.expect("inner");
            assert_eq!(outer.len(), 0x20);
            assert_eq!(inner.len(), 0x1001);
            assert_eq!(mapper.pages_in_use(), 3);
            mapper.unmap(0x60_0000, 0x1001);
            assert_eq!(mapper.pages_in_use(), 1);
        }
        for page in 0..3 {
            let va = VirtualAddress::new(TEMPORARY_WINDOW_BASE + page * Size4K::SIZE);
            assert_eq!(mmu.translate(va), None);
        }
    }

    #[test]
    fn memory_above_four_gib_is_unreachable() {
        let mem = FakePhysicalMemory::new(8 * MIB);
        let mmu = SoftMmu::new(&mem);
        let mut storage = [0u32; 64];
        let mut boot = paged(&mem, &mmu, &mut storage);
        let mut mapper = boot.temporary_mapper();
        assert!(unsafe { mapper.map_ro(0x1_0000_0000, 16) }.is_none());
        assert!(unsafe { mapper.map_ro(0xFFFF_FFF0, 0x20) }.is_none());
        assert_eq!(mapper.pages_in_use(), 0);
    }

    #[test]
    fn register_windows_are_uncached_and_consecutive() {
        let mem = FakePhysicalMemory::new(8 * MIB);
        let mmu = SoftMmu::new(&mem);
        let mut storage = [0u32; 64];
        let mut boot = paged(&mem, &mmu, &mut storage);

        {
            let mut window = boot.mmio_window();
            let mut regs = window
                .map_registers(PhysicalAddress::new(0x70_0000), 0x400)
                .expect("mapped");
            regs.write32(0x20, 0x0F00_0000);
            assert_eq!(regs.read32(0x20), 0x0F00_0000);
            let _io = window
                .map_registers(PhysicalAddress::new(0x71_0000), 0x20)
                .expect("mapped");
        }
        assert_eq!(mem.read_u32(PhysicalAddress::new(0x70_0020)), 0x0F00_0000);

        let first = VirtualAddress::new(MMIO_WINDOW_BASE);
        let flags = boot.leaf_flags(first).expect("mapped");
        assert!(flags.cache_disabled() && flags.writable());
        assert_eq!(
            boot.translate(first + Size4K::SIZE),
            Some(PhysicalAddress::new(0x71_0000))
        );
    }

    fn block(boot: &mut crate::fixture::Paged<'_, '_>, va: u32) {
        boot.map_page_to_recursive_directory(
            VirtualAddress::new(va),
            PhysicalAddress::new(0x40_0000),
            PageEntryBits::kernel_table(),
            PageEntryBits::kernel_ro(),
        )
        .expect("blocker");
    }

    #[test]
    fn partial_temporary_mapping_is_taken_back() {
        let mem = FakePhysicalMemory::new(8 * MIB);
        let mmu = SoftMmu::new(&mem);
        let mut storage = [0u32; 64];
        let mut boot = paged(&mem, &mmu, &mut storage);
        block(&mut boot, TEMPORARY_WINDOW_BASE + Size4K::SIZE);

        {
            let mut mapper = boot.temporary_mapper();
            assert!(unsafe { mapper.map_ro(0x50_0000, 0x2000) }.is_none());
            assert_eq!(mapper.pages_in_use(), 0);
        }
        assert_eq!(mmu.translate(VirtualAddress::new(TEMPORARY_WINDOW_BASE)), None);
    }

    #[test]
    fn partial_register_mapping_is_taken_back() {
        let mem = FakePhysicalMemory::new(8 * MIB);
        let mmu = SoftMmu::new(&mem);
        let mut storage = [0u32; 64];
        let mut boot = paged(&mem, &mmu, &mut storage);
        block(&mut boot, MMIO_WINDOW_BASE + Size4K::SIZE);

        assert!(
            boot.mmio_window()
                .map_registers(PhysicalAddress::new(0x70_0000), 0x2000)
                .is_none()
        );
        assert_eq!(boot.state_mut().mmio_used, 0);
        assert_eq!(mmu.translate(VirtualAddress::new(MMIO_WINDOW_BASE)), None);

        // The slot is free again for a request that fits.
        assert!(
            boot.mmio_window()
                .map_registers(PhysicalAddress::new(0x71_0000), 0x400)
                .is_some()
        );
        assert_eq!(
            mmu.translate(VirtualAddress::new(MMIO_WINDOW_BASE)),
            Some(PhysicalAddress::new(0x71_0000))
        );
    }

    #[test]
    fn full_register_window_refuses_more() {
        let mem = FakePhysicalMemory::new(8 * MIB);
        let mmu = SoftMmu::new(&mem);
        let mut storage = [0u32; 64];
        let mut boot = paged(&mem, &mmu, &mut storage);
        boot.state_mut().mmio_used = MMIO_WINDOW_PAGES;
        assert!(
            boot.mmio_window()
                .map_registers(PhysicalAddress::new(0x70_0000), 0x400)
                .is_none()
        );
    }
}
