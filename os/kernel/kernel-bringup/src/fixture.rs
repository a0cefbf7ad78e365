//! Shared setup for unit tests that need paging switched on.

use crate::bootstrap::{Bootstrap, LoaderLayout, Mapped};
use kernel_alloc::MemoryMap;
use kernel_info::boot::MemoryRegion;
use kernel_info::memory::PhysicalRange;
use kernel_memory_addresses::PhysicalAddress;
use kernel_vmem::testing::{FakePhysicalMemory, SoftMmu};

pub type Paged<'m, 'a> = Bootstrap<'m, FakePhysicalMemory, Mapped<'a, &'m SoftMmu<'m>>>;

/// A loader reserving `[0, 0x130000)` with paging on over all of `mem`.
pub fn paged<'m, 'a>(
    mem: &'m FakePhysicalMemory,
    mmu: &'m SoftMmu<'m>,
    storage: &'a mut [u32],
) -> Paged<'m, 'a> {
    let layout = LoaderLayout::new(
        PhysicalAddress::new(0x13_0000),
        PhysicalRange::from_raw(0x12_0000, 0x13_0000),
    )
    .expect("layout");
    let regions = [MemoryRegion::usable(0, u64::from(mem.size()))];
    Bootstrap::new(mem, layout)
        .expect("bootstrap")
        .load_memory_map(storage, &MemoryMap::new(&regions, &[]))
        .expect("memory map")
        .enable_paging(&[], mmu)
        .expect("paging")
}
