use crate::{PagingControl, VirtualAccess};
use kernel_memory_addresses::{PhysicalPage, Size4K, VirtualAddress};
use kernel_registers::{Cr0, Cr3, Cr4, LoadRegisterUnsafe, StoreRegisterUnsafe};

/// The executing processor: virtual addresses are plain pointers and the
/// paging switches are control-register writes.
#[derive(Copy, Clone, Debug, Default)]
pub struct Cpu;

impl VirtualAccess for Cpu {
    #[inline]
    unsafe fn virt_to_mut<'a, T>(&self, va: VirtualAddress) -> &'a mut T {
        unsafe { &mut *va.as_mut_ptr::<T>() }
    }

    #[inline]
    fn invalidate(&self, va: VirtualAddress) {
        unsafe { kernel_registers::instructions::invlpg(va) }
    }
}

impl PagingControl for Cpu {
    unsafe fn enable_global_pages(&self) {
        unsafe {
            let cr4 = Cr4::load_unsafe().with_pge(true);
            cr4.store_unsafe();
        }
    }

    unsafe fn load_directory(&self, directory: PhysicalPage<Size4K>) {
        unsafe { Cr3::from_directory_phys(directory.base()).store_unsafe() }
    }

    unsafe fn enable_paging(&self) {
        unsafe {
            let cr0 = Cr0::load_unsafe().with_pg_paging(true);
            cr0.store_unsafe();
        }
    }
}
