//! # Identity `PhysMapper`
//!
//! While paging is off, and afterwards for anything inside the identity-mapped
//! reserved area, a physical address can be dereferenced as is.

use kernel_memory_addresses::PhysicalAddress;
use kernel_vmem::PhysMapper;

/// [`PhysMapper`] for identity-mapped (or unpaged) memory.
///
/// # Safety
/// Only sound while the referenced physical range is reachable at the same
/// virtual address: always before paging, and inside the loader's reserved
/// area afterwards.
#[derive(Copy, Clone, Debug, Default)]
pub struct IdentityPhysMapper;

impl PhysMapper for IdentityPhysMapper {
    #[inline]
    unsafe fn phys_to_ptr(&self, pa: PhysicalAddress) -> *mut u8 {
        pa.as_usize() as *mut u8
    }
}
