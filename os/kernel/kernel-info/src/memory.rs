//! # Memory Layout

use kernel_memory_addresses::{PageSize, PhysicalAddress, PhysicalPage, Size4K, Size4M};

/// Everything below 1 MiB belongs to the BIOS, the VGA window and option ROMs.
pub const LEGACY_AREA_END: u32 = 0x0010_0000;

/// Where the kernel executes (VMA). Everything below is user space.
pub const KERNEL_BASE: u32 = 0xC000_0000;

/// End of the user-accessible virtual range.
pub const USERSPACE_END: u32 = KERNEL_BASE;

/// Page-directory slot that points back at the directory itself.
pub const RECURSIVE_SLOT: usize = 1023;

/// With the recursive slot installed, page table `i` appears at
/// `RECURSIVE_TABLES_BASE + i * 4096`.
pub const RECURSIVE_TABLES_BASE: u32 = (RECURSIVE_SLOT as u32) << Size4M::SHIFT;

/// The page directory as seen through the recursive slot.
pub const RECURSIVE_DIRECTORY: u32 = RECURSIVE_TABLES_BASE + (RECURSIVE_SLOT as u32) * Size4K::SIZE;

/// Window for short-lived mappings of firmware tables (one directory slot).
pub const TEMPORARY_WINDOW_BASE: u32 = 0xFF80_0000;

/// Number of 4 KiB pages in the temporary window.
pub const TEMPORARY_WINDOW_PAGES: u32 = Size4M::SIZE / Size4K::SIZE;

/// Window for long-lived device register mappings (one directory slot).
pub const MMIO_WINDOW_BASE: u32 = 0xFF40_0000;

/// Number of 4 KiB pages in the MMIO window.
pub const MMIO_WINDOW_PAGES: u32 = Size4M::SIZE / Size4K::SIZE;

/// The size of the kernel stack.
pub const KERNEL_STACK_SIZE: u32 = 16 * 1024;

const _: () = {
    assert!(RECURSIVE_TABLES_BASE == 0xFFC0_0000);
    assert!(RECURSIVE_DIRECTORY == 0xFFFF_F000);
    assert!(KERNEL_BASE.is_multiple_of(Size4M::SIZE));
    assert!(MMIO_WINDOW_BASE.is_multiple_of(Size4M::SIZE));
    assert!(TEMPORARY_WINDOW_BASE.is_multiple_of(Size4M::SIZE));
    assert!(MMIO_WINDOW_BASE > KERNEL_BASE);
    assert!(TEMPORARY_WINDOW_BASE > MMIO_WINDOW_BASE);
    assert!(RECURSIVE_TABLES_BASE > TEMPORARY_WINDOW_BASE);
    assert!(KERNEL_STACK_SIZE.is_multiple_of(Size4K::SIZE));
    assert!(LEGACY_AREA_END.is_multiple_of(Size4K::SIZE));
};

/// Half-open physical range `[start, end)`.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct PhysicalRange {
    pub start: PhysicalAddress,
    pub end: PhysicalAddress,
}

impl PhysicalRange {
    #[must_use]
    pub const fn new(start: PhysicalAddress, end: PhysicalAddress) -> Self {
        Self { start, end }
    }

    #[must_use]
    pub const fn from_raw(start: u32, end: u32) -> Self {
        Self::new(PhysicalAddress::new(start), PhysicalAddress::new(end))
    }

    #[must_use]
    pub const fn len(&self) -> u32 {
        self.end.as_u32().saturating_sub(self.start.as_u32())
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub const fn contains(&self, addr: PhysicalAddress) -> bool {
        addr.as_u32() >= self.start.as_u32() && addr.as_u32() < self.end.as_u32()
    }

    #[must_use]
    pub const fn overlaps(&self, other: &Self) -> bool {
        !self.is_empty()
            && !other.is_empty()
            && self.start.as_u32() < other.end.as_u32()
            && other.start.as_u32() < self.end.as_u32()
    }

    /// First page touched by the range.
    #[must_use]
    pub const fn first_page(&self) -> PhysicalPage<Size4K> {
        PhysicalPage::containing_address(self.start)
    }

    /// Number of 4 KiB pages touched by the range, partial pages included.
    #[must_use]
    pub const fn page_span(&self) -> u32 {
        if self.is_empty() {
            return 0;
        }
        let first = self.start.as_u32() >> Size4K::SHIFT;
        let last = (self.end.as_u32() - 1) >> Size4K::SHIFT;
        last - first + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_span_counts_partial_pages() {
        assert_eq!(PhysicalRange::from_raw(0x1000, 0x2000).page_span(), 1);
        assert_eq!(PhysicalRange::from_raw(0x1800, 0x2001).page_span(), 2);
        assert_eq!(PhysicalRange::from_raw(0x1000, 0x1000).page_span(), 0);
    }

    #[test]
    fn overlap_is_half_open() {
        let a = PhysicalRange::from_raw(0x1000, 0x3000);
        assert!(a.overlaps(&PhysicalRange::from_raw(0x2FFF, 0x4000)));
        assert!(!a.overlaps(&PhysicalRange::from_raw(0x3000, 0x4000)));
        assert!(!a.overlaps(&PhysicalRange::from_raw(0x2000, 0x2000)));
    }
}
