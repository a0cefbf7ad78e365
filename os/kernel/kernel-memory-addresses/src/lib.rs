//! # Virtual and Physical Memory Address Types (IA-32)
//!
//! Strongly typed wrappers for raw 32-bit memory addresses and page bases used
//! in the bring-up paging and allocation code.
//!
//! ## Overview
//!
//! The types prevent mixing virtual and physical addresses at compile time
//! while remaining zero-cost wrappers around `u32` values.
//!
//! | Concept | Generic | Description |
//! |----------|----------|-------------|
//! | [`MemoryAddress`] | – | A raw 32-bit address, either physical or virtual. |
//! | [`MemoryPage<S>`] | [`S: PageSize`](PageSize) | A page-aligned base address of a page of size `S`. |
//! | [`MemoryAddressOffset<S>`] | [`S: PageSize`](PageSize) | An offset within a page of size `S`. |
//!
//! These are then wrapped to distinguish between virtual and physical spaces:
//!
//! | Wrapper | Meaning |
//! |----------|----------|
//! | [`VirtualAddress`] / [`VirtualPage<S>`] | Refer to virtual (page-table translated) memory. |
//! | [`PhysicalAddress`] / [`PhysicalPage<S>`] | Refer to physical memory or MMIO regions. |
//!
//! ## Page Sizes
//!
//! Non-PAE two-level paging knows two page sizes:
//!
//! - [`Size4K`] — 4 KiB pages mapped by a page-table entry
//! - [`Size4M`] — 4 MiB large pages (one page-directory slot)
//!
//! ## Typical Usage
//!
//! ```rust
//! # use kernel_memory_addresses::*;
//! let va = VirtualAddress::new(0xC010_1234);
//! let (page, off) = va.split::<Size4K>();
//! assert_eq!(page.base().as_u32(), 0xC010_1000);
//! assert_eq!(page.join(off), va);
//!
//! let pa = PhysicalAddress::new(0x0012_3456);
//! assert_eq!(pa.page::<Size4K>().index(), 0x123);
//! ```
//!
//! Physical memory handed over by firmware may describe addresses above 4 GiB;
//! use [`PhysicalAddress::try_from_u64`] to reject those explicitly instead of
//! truncating.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code, clippy::inline_always)]

mod memory_address;
mod memory_address_offset;
mod memory_page;
mod page_size;
mod physical_address;
mod physical_page;
mod virtual_address;
mod virtual_page;

pub use memory_address::MemoryAddress;
pub use memory_address_offset::MemoryAddressOffset;
pub use memory_page::MemoryPage;
pub use page_size::{PageSize, Size4K, Size4M};
pub use physical_address::PhysicalAddress;
pub use physical_page::PhysicalPage;
pub use virtual_address::VirtualAddress;
pub use virtual_page::VirtualPage;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_and_join_round_trip() {
        let va = VirtualAddress::new(0xC03F_F123);
        let (vp, off) = va.split::<Size4K>();
        assert_eq!(vp.base().as_u32(), 0xC03F_F000);
        assert_eq!(off.as_u32(), 0x123);
        assert_eq!(vp.join(off), va);

        let (big, off) = va.split::<Size4M>();
        assert_eq!(big.base().as_u32(), 0xC000_0000);
        assert_eq!(off.as_u32(), 0x3F_F123);
    }

    #[test]
    fn align_up_saturates_at_top_of_address_space() {
        assert_eq!(
            PhysicalAddress::new(0x1001).align_up::<Size4K>(),
            Some(PhysicalAddress::new(0x2000))
        );
        assert_eq!(
            PhysicalAddress::new(0x2000).align_up::<Size4K>(),
            Some(PhysicalAddress::new(0x2000))
        );
        assert_eq!(PhysicalAddress::new(0xFFFF_F001).align_up::<Size4K>(), None);
    }

    #[test]
    fn wide_physical_addresses_are_rejected() {
        assert_eq!(
            PhysicalAddress::try_from_u64(0xFEE0_0000),
            Some(PhysicalAddress::new(0xFEE0_0000))
        );
        assert_eq!(PhysicalAddress::try_from_u64(0x1_0000_0000), None);
    }

    #[test]
    fn page_index_round_trip() {
        let page = PhysicalPage::<Size4K>::from_index(0x130);
        assert_eq!(page.base().as_u32(), 0x13_0000);
        assert_eq!(page.index(), 0x130);
        assert_eq!(page.checked_next().map(PhysicalPage::index), Some(0x131));
        assert_eq!(PhysicalPage::<Size4K>::from_index(0xF_FFFF).checked_next(), None);
    }
}
