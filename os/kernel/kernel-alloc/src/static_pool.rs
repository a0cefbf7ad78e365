//! # Static Frame Pool
//!
//! Frames for the very first page directory and tables come from a window
//! the loader reserved in its own image, because the bitmap may not describe
//! that memory as allocatable.

use kernel_info::memory::PhysicalRange;
use kernel_memory_addresses::{PageSize, PhysicalAddress, PhysicalPage, Size4K};
use kernel_vmem::FrameAlloc;

/// Bump allocator over `[start, end)`. Frames are never returned.
#[derive(Debug)]
pub struct StaticFrameAlloc {
    start: PhysicalAddress,
    next: PhysicalAddress,
    end: PhysicalAddress,
}

impl StaticFrameAlloc {
    /// Partial pages at either end of `window` are not used.
    #[must_use]
    pub fn new(window: PhysicalRange) -> Self {
        let start = window
            .start
            .align_up::<Size4K>()
            .unwrap_or(window.end);
        let end = window.end.align_down::<Size4K>();
        let start = if start > end { end } else { start };
        Self {
            start,
            next: start,
            end,
        }
    }

    /// Frames still available.
    #[must_use]
    pub const fn remaining(&self) -> u32 {
        (self.end.as_u32() - self.next.as_u32()) / Size4K::SIZE
    }

    /// The part of the window handed out so far.
    #[must_use]
    pub const fn consumed(&self) -> PhysicalRange {
        PhysicalRange::new(self.start, self.next)
    }
}

impl FrameAlloc for StaticFrameAlloc {
    fn alloc_4k(&mut self) -> Option<PhysicalPage<Size4K>> {
        if self.remaining() == 0 {
            return None;
        }
        let page = PhysicalPage::containing_address(self.next);
        self.next += Size4K::SIZE;
        Some(page)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hands_out_aligned_frames_until_exhausted() {
        let mut pool = StaticFrameAlloc::new(PhysicalRange::from_raw(0x10_0800, 0x10_3000));
        assert_eq!(pool.remaining(), 2);
        assert_eq!(pool.alloc_4k().map(|p| p.base().as_u32()), Some(0x10_1000));
        assert_eq!(pool.alloc_4k().map(|p| p.base().as_u32()), Some(0x10_2000));
        assert_eq!(pool.alloc_4k(), None);
        assert_eq!(pool.consumed(), PhysicalRange::from_raw(0x10_1000, 0x10_3000));
    }

    #[test]
    fn window_smaller_than_a_page_is_empty() {
        let mut pool = StaticFrameAlloc::new(PhysicalRange::from_raw(0x10_0010, 0x10_0FF0));
        assert_eq!(pool.remaining(), 0);
        assert_eq!(pool.alloc_4k(), None);
    }
}
