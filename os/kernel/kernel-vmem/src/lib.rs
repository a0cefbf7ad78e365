//! # 32-bit Paging (two-level, non-PAE)
//!
//! Typed page directories and page tables plus the machinery to edit them
//! before and after paging is switched on.
//!
//! ## Layout
//!
//! ```text
//!  31        22 21        12 11          0
//! ┌────────────┬────────────┬─────────────┐
//! │ directory  │   table    │   offset    │
//! └────────────┴────────────┴─────────────┘
//! ```
//!
//! * [`PageDirectory`]: 1024 [`PdEntry`] pointing at page tables.
//! * [`PageTable`]: 1024 [`PtEntry`] mapping 4 KiB pages.
//! * [`PageEntryBits`]: the flag/frame bit layout shared by both levels.
//!
//! ## Editing tables
//!
//! Every edit goes through a [`TableWindow`], which knows how to reach the
//! directory and its tables from the current execution context:
//!
//! * [`PhysicalWindow`]: paging is off (or the tables are identity-mapped);
//!   physical frames are reached through a [`PhysMapper`].
//! * [`RecursiveWindow`]: paging is on; the directory's last slot maps the
//!   directory itself, so table `i` is visible at `0xFFC0_0000 + i * 4096`
//!   and the directory at `0xFFFF_F000`.
//!
//! [`AddressSpace`] wraps a window and provides `map_page`, `unmap_page`,
//! `translate` and, for the live recursive case,
//! [`map_page_to_recursive_directory`](AddressSpace::map_page_to_recursive_directory).

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code, clippy::inline_always)]

#[cfg(any(test, feature = "testing"))]
extern crate alloc;

mod address_space;
mod cpu;
mod page_entry_bits;
mod page_table;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
mod window;

pub use crate::address_space::{AddressSpace, MapError, RecursiveAddressSpace, pages_spanned};
pub use crate::cpu::Cpu;
pub use crate::page_entry_bits::PageEntryBits;
pub use crate::page_table::pd::{DirectoryIndex, PageDirectory, PdEntry};
pub use crate::page_table::pt::{PageTable, PtEntry, TableIndex};
pub use crate::window::{PhysicalWindow, RecursiveWindow, TableWindow};

/// Re-export constants as info module.
pub use kernel_info::memory as info;

use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K, VirtualAddress};

/// Source of **physical** 4 KiB frames for page tables (and anything else
/// that needs a frame).
///
/// Returns `None` on out-of-memory.
pub trait FrameAlloc {
    /// Allocate one 4 KiB *physical* frame. Must return page-aligned frames.
    fn alloc_4k(&mut self) -> Option<PhysicalPage<Size4K>>;

    /// Give a frame back. Allocators that cannot reclaim ignore this.
    fn free_4k(&mut self, _page: PhysicalPage<Size4K>) {}
}

impl<A: FrameAlloc + ?Sized> FrameAlloc for &mut A {
    fn alloc_4k(&mut self) -> Option<PhysicalPage<Size4K>> {
        (**self).alloc_4k()
    }

    fn free_4k(&mut self, page: PhysicalPage<Size4K>) {
        (**self).free_4k(page);
    }
}

/// Converts physical addresses to usable references in the current address
/// space.
///
/// Typical patterns:
/// - **Loader**: paging is off, or low memory is identity-mapped; the
///   physical address *is* the pointer.
/// - **Tests**: an offset into a heap buffer standing in for RAM.
///
/// # Safety
/// - `pa` must be reachable and writable through the returned reference.
/// - Lifetime `'a` is purely borrow-checked; the mapping must remain valid
///   for `'a`.
/// - Type `T` must match the bytes at `pa` (no aliasing UB).
pub trait PhysMapper {
    /// Convert a *physical* address to a raw pointer in the current address space.
    ///
    /// # Safety
    /// See the trait documentation.
    unsafe fn phys_to_ptr(&self, pa: PhysicalAddress) -> *mut u8;

    /// Convert a *physical* address to a usable mutable reference.
    ///
    /// # Safety
    /// See the trait documentation.
    #[inline]
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        unsafe { &mut *self.phys_to_ptr(pa).cast::<T>() }
    }

    /// Copy `len` bytes between physical locations. Ranges must not overlap.
    ///
    /// # Safety
    /// Both ranges must be reachable through [`phys_to_ptr`](Self::phys_to_ptr).
    unsafe fn copy(&self, dst: PhysicalAddress, src: PhysicalAddress, len: u32) {
        unsafe {
            core::ptr::copy_nonoverlapping(self.phys_to_ptr(src), self.phys_to_ptr(dst), len as usize);
        }
    }

    /// Fill `len` bytes at `pa` with zero.
    ///
    /// # Safety
    /// The range must be reachable through [`phys_to_ptr`](Self::phys_to_ptr).
    unsafe fn zero(&self, pa: PhysicalAddress, len: u32) {
        unsafe { core::ptr::write_bytes(self.phys_to_ptr(pa), 0, len as usize) };
    }

    /// Borrow `len` bytes at `pa`.
    ///
    /// # Safety
    /// The range must be reachable and must not be written while borrowed.
    unsafe fn bytes<'a>(&self, pa: PhysicalAddress, len: u32) -> &'a [u8] {
        unsafe { core::slice::from_raw_parts(self.phys_to_ptr(pa), len as usize) }
    }
}

impl<T: PhysMapper + ?Sized> PhysMapper for &T {
    #[inline]
    unsafe fn phys_to_ptr(&self, pa: PhysicalAddress) -> *mut u8 {
        unsafe { (**self).phys_to_ptr(pa) }
    }
}

/// Access to memory through *virtual* addresses of the active address space.
///
/// On hardware this is a pointer cast plus `invlpg`; tests substitute a
/// software MMU that walks the directory.
pub trait VirtualAccess {
    /// # Safety
    /// `va` must be mapped and writable, and `T` must match the bytes there.
    unsafe fn virt_to_mut<'a, T>(&self, va: VirtualAddress) -> &'a mut T;

    /// Drop any cached translation for `va`.
    fn invalidate(&self, va: VirtualAddress);
}

impl<T: VirtualAccess + ?Sized> VirtualAccess for &T {
    #[inline]
    unsafe fn virt_to_mut<'a, U>(&self, va: VirtualAddress) -> &'a mut U {
        unsafe { (**self).virt_to_mut(va) }
    }

    #[inline]
    fn invalidate(&self, va: VirtualAddress) {
        (**self).invalidate(va);
    }
}

/// The three control-register steps that turn paging on.
pub trait PagingControl {
    /// Set CR4.PGE so `global` mappings survive CR3 reloads.
    ///
    /// # Safety
    /// Must run at CPL0.
    unsafe fn enable_global_pages(&self);

    /// Load CR3 with `directory`.
    ///
    /// # Safety
    /// `directory` must hold a valid page directory that maps the currently
    /// executing code.
    unsafe fn load_directory(&self, directory: PhysicalPage<Size4K>);

    /// Set CR0.PG.
    ///
    /// # Safety
    /// CR3 must already hold a directory that identity-maps the executing code.
    unsafe fn enable_paging(&self);
}

impl<T: PagingControl + ?Sized> PagingControl for &T {
    unsafe fn enable_global_pages(&self) {
        unsafe { (**self).enable_global_pages() }
    }

    unsafe fn load_directory(&self, directory: PhysicalPage<Size4K>) {
        unsafe { (**self).load_directory(directory) }
    }

    unsafe fn enable_paging(&self) {
        unsafe { (**self).enable_paging() }
    }
}
