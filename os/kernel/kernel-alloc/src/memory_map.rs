//! # Memory-Map Interpreter
//!
//! Turns the bootloader's region and module lists into bitmap state.
//!
//! The pass is order-independent:
//!
//! 1. Everything starts out used, so holes in the map are never handed out.
//! 2. Usable regions are freed from `max(start, low_watermark)` on, shrunk to
//!    whole pages.
//! 3. Non-usable regions are marked used again, grown to whole pages. Where a
//!    reserved range overlaps a usable one, reserved wins.
//! 4. Module ranges are marked used regardless of the region they sit in.
//!
//! Because bits are set rather than counted, overlapping inputs are clipped
//! instead of double-counted.

use crate::frame_alloc::{BitmapFrameAlloc, FrameAllocError};
use kernel_info::boot::{MemoryRegion, ModuleDescriptor};
use kernel_info::memory::PhysicalRange;
use kernel_memory_addresses::{PageSize, PhysicalAddress, PhysicalPage, Size4K};
use log::{debug, info, warn};

#[derive(Debug, Clone, Copy, Eq, PartialEq, thiserror::Error)]
pub enum MemoryMapError {
    #[error("the memory map contains no usable RAM")]
    NoUsableMemory,
    #[error(transparent)]
    Allocator(#[from] FrameAllocError),
}

/// Result of [`MemoryMap::load`].
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct MemoryMapSummary {
    pub free_frames: u32,
    pub used_frames: u32,
    /// Frames at or above the watermark that the map described as usable
    /// but that hold modules.
    pub module_frames: u32,
}

/// The bootloader's view of physical memory.
#[derive(Debug, Clone, Copy)]
pub struct MemoryMap<'b> {
    regions: &'b [MemoryRegion],
    modules: &'b [ModuleDescriptor],
}

impl<'b> MemoryMap<'b> {
    #[must_use]
    pub const fn new(regions: &'b [MemoryRegion], modules: &'b [ModuleDescriptor]) -> Self {
        Self { regions, modules }
    }

    #[must_use]
    pub const fn regions(&self) -> &'b [MemoryRegion] {
        self.regions
    }

    #[must_use]
    pub const fn modules(&self) -> &'b [ModuleDescriptor] {
        self.modules
    }

    /// End of the highest usable region, clipped to 4 GiB.
    #[must_use]
    pub fn top_of_usable_memory(&self) -> u64 {
        self.regions
            .iter()
            .filter(|r| r.is_usable())
            .map(|r| r.end.min(1 << 32))
            .max()
            .unwrap_or(0)
    }

    /// Frames the bitmap has to track to cover every usable byte.
    #[must_use]
    pub fn frames_to_track(&self) -> u32 {
        BitmapFrameAlloc::frames_below(self.top_of_usable_memory())
    }

    /// Feed the map into `allocator`.
    ///
    /// Everything below `low_watermark` stays used: it holds the loader, its
    /// bitmap and the legacy area.
    ///
    /// # Errors
    /// - [`MemoryMapError::NoUsableMemory`] if nothing at or above the
    ///   watermark is usable.
    /// - [`MemoryMapError::Allocator`] for bitmap range violations, which the
    ///   clipping below rules out unless the bitmap is inconsistent.
    pub fn load(
        &self,
        allocator: &mut BitmapFrameAlloc<'_>,
        low_watermark: PhysicalAddress,
    ) -> Result<MemoryMapSummary, MemoryMapError> {
        let tracked = allocator.frame_count();
        allocator.mark_used(PhysicalPage::from_index(0), tracked)?;

        for region in self.regions.iter().filter(|r| r.is_usable()) {
            let Some(range) = region.clipped() else {
                debug!("skipping usable region above 4 GiB: {region:?}");
                continue;
            };
            let start = range.start.max(low_watermark);
            let Some((first, count)) = inner_pages(start, range.end, tracked) else {
                continue;
            };
            debug!(
                "usable {:#010x}..{:#010x} -> {count} frames from {first}",
                range.start.as_u32(),
                range.end.as_u32()
            );
            allocator.mark_free(first, count)?;
        }

        for region in self.regions.iter().filter(|r| !r.is_usable()) {
            let Some(range) = region.clipped() else {
                continue;
            };
            if let Some((first, count)) = outer_pages(range, tracked) {
                debug!(
                    "reserved {:#010x}..{:#010x} (kind {})",
                    range.start.as_u32(),
                    range.end.as_u32(),
                    region.kind
                );
                allocator.mark_used(first, count)?;
            }
        }

        let mut module_frames = 0;
        for module in self.modules {
            let range = module.range();
            if range.first_page().index() + range.page_span() > tracked {
                warn!("module {} extends past tracked memory", module.path());
            }
            if let Some((first, count)) = outer_pages(range, tracked) {
                debug!(
                    "module {} at {:#010x}..{:#010x}",
                    module.path(),
                    module.start,
                    module.end
                );
                module_frames += (first.index()..first.index() + count)
                    .filter(|&f| f << Size4K::SHIFT >= low_watermark.as_u32())
                    .fold(0, |n, _| n + 1);
                allocator.mark_used(first, count)?;
            }
        }

        if allocator.free_frames() == 0 {
            return Err(MemoryMapError::NoUsableMemory);
        }

        let summary = MemoryMapSummary {
            free_frames: allocator.free_frames(),
            used_frames: allocator.used_frames(),
            module_frames,
        };
        info!(
            "memory map: {} frames free, {} used, {} held by modules",
            summary.free_frames, summary.used_frames, summary.module_frames
        );
        Ok(summary)
    }
}

/// Whole pages inside `[start, end)`, clipped to `tracked` frames.
fn inner_pages(start: PhysicalAddress, end: PhysicalAddress, tracked: u32) -> Option<(PhysicalPage<Size4K>, u32)> {
    let first = start.align_up::<Size4K>()?.as_u32() >> Size4K::SHIFT;
    let last = (end.as_u32() >> Size4K::SHIFT).min(tracked);
    (last > first).then(|| (PhysicalPage::from_index(first), last - first))
}

/// Every page touched by `range`, clipped to `tracked` frames.
fn outer_pages(range: PhysicalRange, tracked: u32) -> Option<(PhysicalPage<Size4K>, u32)> {
    if range.is_empty() {
        return None;
    }
    let first = range.first_page().index();
    let last = (first + range.page_span()).min(tracked);
    (last > first).then(|| (PhysicalPage::from_index(first), last - first))
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: u64 = 1024 * 1024;

    fn page(addr: u32) -> PhysicalPage<Size4K> {
        PhysicalPage::containing_address(PhysicalAddress::new(addr))
    }

    #[test]
    fn sizing_follows_the_highest_usable_region() {
        let regions = [
            MemoryRegion::usable(0, 0x9_F000),
            MemoryRegion::reserved(0xFEC0_0000, 0xFEC0_1000),
            MemoryRegion::usable(MIB, 64 * MIB),
        ];
        let map = MemoryMap::new(&regions, &[]);
        assert_eq!(map.top_of_usable_memory(), 64 * MIB);
        assert_eq!(map.frames_to_track(), 16 * 1024);
    }

    #[test]
    fn everything_below_the_watermark_stays_used() {
        let regions = [MemoryRegion::usable(0, 64 * MIB)];
        let modules = [ModuleDescriptor::new(0x10_0000, 0x12_0000, "/boot/loader")];
        let map = MemoryMap::new(&regions, &modules);

        let mut storage = vec![0u32; BitmapFrameAlloc::words_for(64 * MIB)];
        let mut alloc =
            BitmapFrameAlloc::initialize(&mut storage, map.frames_to_track()).expect("init");
        let summary = map.load(&mut alloc, PhysicalAddress::new(0x13_0000)).expect("load");

        for f in 0..0x130 {
            assert!(alloc.is_used(PhysicalPage::from_index(f)), "frame {f:#x} should be used");
        }
        for f in 0x130..0x4000 {
            assert!(!alloc.is_used(PhysicalPage::from_index(f)), "frame {f:#x} should be free");
        }
        assert_eq!(summary.free_frames, 0x4000 - 0x130);
        assert_eq!(summary.module_frames, 0);
    }

    #[test]
    fn modules_stay_used_regardless_of_region_flags() {
        // Unsorted, overlapping, with a reserved hole punched into usable RAM.
        let regions = [
            MemoryRegion::usable(8 * MIB, 16 * MIB),
            MemoryRegion::reserved(0x0060_0000, 0x0090_0800),
            MemoryRegion::usable(0, 0x9_FC00),
            MemoryRegion::usable(MIB, 10 * MIB),
        ];
        let modules = [
            ModuleDescriptor::new(0x0040_0100, 0x0048_0000, "/boot/kernel"),
            ModuleDescriptor::new(0x00A0_0000, 0x00A0_0001, "/boot/init"),
            ModuleDescriptor::new(0x0070_0000, 0x0071_0000, "/boot/in-reserved"),
        ];
        let map = MemoryMap::new(&regions, &modules);
        let mut storage = vec![0u32; BitmapFrameAlloc::words_for(16 * MIB)];
        let mut alloc =
            BitmapFrameAlloc::initialize(&mut storage, map.frames_to_track()).expect("init");
        map.load(&mut alloc, PhysicalAddress::new(0x20_0000)).expect("load");

        for m in &modules {
            let range = m.range();
            for i in 0..range.page_span() {
                let p = PhysicalPage::from_index(range.first_page().index() + i);
                assert!(alloc.is_used(p), "{} frame {p} must stay used", m.path());
            }
        }
        // Reserved overlap wins, rounded outwards.
        assert!(alloc.is_used(page(0x0060_0000)));
        assert!(alloc.is_used(page(0x0090_0000)));
        assert!(!alloc.is_used(page(0x0090_1000)));
        // Low usable RAM is below the watermark.
        assert!(alloc.is_used(page(0x1000)));
        // Regions given out of order still free their pages.
        assert!(!alloc.is_used(page(0x00F0_0000)));
        assert!(!alloc.is_used(page(0x0020_0000)));

        // And nothing handed out afterwards touches a module.
        while let Ok(p) = alloc.allocate(1) {
            for m in &modules {
                assert!(!m.range().overlaps(&PhysicalRange::new(p.base(), p.base() + 4096)));
            }
        }
    }

    #[test]
    fn partial_pages_of_usable_regions_are_not_freed() {
        let regions = [MemoryRegion::usable(0x20_0800, 0x20_3800)];
        let map = MemoryMap::new(&regions, &[]);
        let mut storage = vec![0u32; BitmapFrameAlloc::words_for(4 * MIB)];
        let mut alloc = BitmapFrameAlloc::initialize(&mut storage, 1024).expect("init");
        let summary = map.load(&mut alloc, PhysicalAddress::new(0x10_0000)).expect("load");
        assert_eq!(summary.free_frames, 2);
        assert!(alloc.is_used(page(0x20_0000)));
        assert!(!alloc.is_used(page(0x20_1000)));
        assert!(!alloc.is_used(page(0x20_2000)));
        assert!(alloc.is_used(page(0x20_3000)));
    }

    #[test]
    fn nothing_usable_is_reported() {
        let regions = [
            MemoryRegion::usable(0, 0x9_F000),
            MemoryRegion::reserved(0x9_F000, 0x10_0000),
        ];
        let map = MemoryMap::new(&regions, &[]);
        let mut storage = vec![0u32; 8];
        let mut alloc = BitmapFrameAlloc::initialize(&mut storage, 256).expect("init");
        assert_eq!(
            map.load(&mut alloc, PhysicalAddress::new(0x10_0000)),
            Err(MemoryMapError::NoUsableMemory)
        );
    }

    #[test]
    fn allocations_never_fall_below_the_watermark() {
        let regions = [MemoryRegion::usable(0, 8 * MIB)];
        let map = MemoryMap::new(&regions, &[]);
        let mut storage = vec![0u32; BitmapFrameAlloc::words_for(8 * MIB)];
        let mut alloc =
            BitmapFrameAlloc::initialize(&mut storage, map.frames_to_track()).expect("init");
        map.load(&mut alloc, PhysicalAddress::new(0x18_0000)).expect("load");
        while let Ok(p) = alloc.allocate(3) {
            assert!(p.base().as_u32() >= 0x18_0000);
        }
    }
}
