//! Host-side stand-ins for RAM and the MMU.
//!
//! [`FakePhysicalMemory`] is a page-aligned heap buffer addressed by physical
//! address. [`SoftMmu`] walks the page directory in that buffer exactly like
//! the hardware does, so recursive mappings are exercised for real.

use crate::{FrameAlloc, PagingControl, PhysMapper, VirtualAccess};
use alloc::alloc::{Layout, alloc_zeroed, dealloc, handle_alloc_error};
use alloc::vec::Vec;
use core::cell::Cell;
use core::ptr::NonNull;
use kernel_memory_addresses::{PageSize, PhysicalAddress, PhysicalPage, Size4K, VirtualAddress};

/// Zero-initialised, 4 KiB-aligned buffer standing in for physical RAM
/// starting at address 0.
pub struct FakePhysicalMemory {
    base: NonNull<u8>,
    size: u32,
}

impl FakePhysicalMemory {
    /// `size` is rounded up to whole pages.
    #[must_use]
    pub fn new(size: u32) -> Self {
        let size = size.div_ceil(Size4K::SIZE) * Size4K::SIZE;
        let layout = Self::layout(size);
        let ptr = unsafe { alloc_zeroed(layout) };
        let Some(base) = NonNull::new(ptr) else {
            handle_alloc_error(layout)
        };
        Self { base, size }
    }

    fn layout(size: u32) -> Layout {
        Layout::from_size_align(size.max(Size4K::SIZE) as usize, Size4K::SIZE as usize)
            .unwrap_or_else(|_| panic!("bad fake memory size {size:#x}"))
    }

    #[must_use]
    pub const fn size(&self) -> u32 {
        self.size
    }

    fn ptr(&self, pa: PhysicalAddress, len: u32) -> *mut u8 {
        let end = u64::from(pa.as_u32()) + u64::from(len);
        assert!(
            end <= u64::from(self.size),
            "physical access {pa}+{len:#x} beyond fake memory ({:#x})",
            self.size
        );
        unsafe { self.base.as_ptr().add(pa.as_usize()) }
    }

    #[must_use]
    pub fn read(&self, pa: PhysicalAddress, len: u32) -> Vec<u8> {
        let src = self.ptr(pa, len);
        unsafe { core::slice::from_raw_parts(src, len as usize) }.to_vec()
    }

    pub fn write(&self, pa: PhysicalAddress, bytes: &[u8]) {
        #[allow(clippy::cast_possible_truncation)]
        let dst = self.ptr(pa, bytes.len() as u32);
        unsafe { core::ptr::copy_nonoverlapping(bytes.as_ptr(), dst, bytes.len()) };
    }

    pub fn fill(&self, pa: PhysicalAddress, len: u32, byte: u8) {
        let dst = self.ptr(pa, len);
        unsafe { core::ptr::write_bytes(dst, byte, len as usize) };
    }

    #[must_use]
    pub fn read_u32(&self, pa: PhysicalAddress) -> u32 {
        let b = self.read(pa, 4);
        u32::from_le_bytes([b[0], b[1], b[2], b[3]])
    }

    pub fn write_u32(&self, pa: PhysicalAddress, value: u32) {
        self.write(pa, &value.to_le_bytes());
    }
}

impl Drop for FakePhysicalMemory {
    fn drop(&mut self) {
        unsafe { dealloc(self.base.as_ptr(), Self::layout(self.size)) };
    }
}

impl PhysMapper for FakePhysicalMemory {
    unsafe fn phys_to_ptr(&self, pa: PhysicalAddress) -> *mut u8 {
        self.ptr(pa, 1)
    }
}

/// A two-level MMU in software. Before [`PagingControl::enable_paging`] every
/// virtual address is physical; afterwards accesses are translated by walking
/// the directory loaded with [`PagingControl::load_directory`].
pub struct SoftMmu<'m> {
    memory: &'m FakePhysicalMemory,
    directory: Cell<Option<PhysicalPage<Size4K>>>,
    paging: Cell<bool>,
    global_pages: Cell<bool>,
    invalidations: Cell<usize>,
}

impl<'m> SoftMmu<'m> {
    #[must_use]
    pub const fn new(memory: &'m FakePhysicalMemory) -> Self {
        Self {
            memory,
            directory: Cell::new(None),
            paging: Cell::new(false),
            global_pages: Cell::new(false),
            invalidations: Cell::new(0),
        }
    }

    #[must_use]
    pub const fn memory(&self) -> &'m FakePhysicalMemory {
        self.memory
    }

    #[must_use]
    pub fn paging_enabled(&self) -> bool {
        self.paging.get()
    }

    #[must_use]
    pub fn global_pages_enabled(&self) -> bool {
        self.global_pages.get()
    }

    #[must_use]
    pub fn directory(&self) -> Option<PhysicalPage<Size4K>> {
        self.directory.get()
    }

    /// Number of `invlpg` equivalents issued so far.
    #[must_use]
    pub fn invalidations(&self) -> usize {
        self.invalidations.get()
    }

    /// Resolve `va` the way the hardware would, or `None` for a page fault.
    #[must_use]
    pub fn translate(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        if !self.paging.get() {
            return Some(PhysicalAddress::new(va.as_u32()));
        }
        let dir = self.directory.get()?.base().as_u32();
        let pde = self
            .memory
            .read_u32(PhysicalAddress::new(dir + (va.as_u32() >> 22) * 4));
        if pde & 1 == 0 {
            return None;
        }
        let table = pde & !0xFFF;
        let pte = self
            .memory
            .read_u32(PhysicalAddress::new(table + ((va.as_u32() >> 12) & 0x3FF) * 4));
        if pte & 1 == 0 {
            return None;
        }
        Some(PhysicalAddress::new((pte & !0xFFF) | (va.as_u32() & 0xFFF)))
    }

    /// Bytes at `va`, read through the translation.
    #[must_use]
    pub fn read_virtual(&self, va: VirtualAddress, len: u32) -> Vec<u8> {
        (0..len)
            .map(|i| {
                let pa = self
                    .translate(va + i)
                    .unwrap_or_else(|| panic!("page fault reading {}", va + i));
                self.memory.read(pa, 1)[0]
            })
            .collect()
    }
}

impl VirtualAccess for SoftMmu<'_> {
    unsafe fn virt_to_mut<'a, T>(&self, va: VirtualAddress) -> &'a mut T {
        let pa = self
            .translate(va)
            .unwrap_or_else(|| panic!("page fault at {va}"));
        unsafe { self.memory.phys_to_mut(pa) }
    }

    fn invalidate(&self, _va: VirtualAddress) {
        self.invalidations.set(self.invalidations.get() + 1);
    }
}

impl PagingControl for SoftMmu<'_> {
    unsafe fn enable_global_pages(&self) {
        self.global_pages.set(true);
    }

    unsafe fn load_directory(&self, directory: PhysicalPage<Size4K>) {
        self.directory.set(Some(directory));
    }

    unsafe fn enable_paging(&self) {
        assert!(self.directory.get().is_some(), "CR3 not loaded");
        self.paging.set(true);
    }
}

/// Hands out consecutive frames from `[start, end)`.
pub struct BumpFrames {
    next: u32,
    end: u32,
}

impl BumpFrames {
    #[must_use]
    pub const fn new(start: u32, end: u32) -> Self {
        Self { next: start, end }
    }

    #[must_use]
    pub const fn next_free(&self) -> u32 {
        self.next
    }
}

impl FrameAlloc for BumpFrames {
    fn alloc_4k(&mut self) -> Option<PhysicalPage<Size4K>> {
        if self.next + Size4K::SIZE > self.end {
            return None;
        }
        let page = PhysicalPage::containing_address(PhysicalAddress::new(self.next));
        self.next += Size4K::SIZE;
        Some(page)
    }
}
