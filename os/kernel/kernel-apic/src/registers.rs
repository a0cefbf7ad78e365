//! Register-window access.

use core::ptr::NonNull;
use kernel_memory_addresses::PhysicalAddress;

/// A window of 32-bit registers addressed by byte offset.
pub trait RegisterBlock {
    fn read32(&self, offset: usize) -> u32;
    fn write32(&mut self, offset: usize, value: u32);
}

impl<R: RegisterBlock + ?Sized> RegisterBlock for &mut R {
    #[inline]
    fn read32(&self, offset: usize) -> u32 {
        (**self).read32(offset)
    }

    #[inline]
    fn write32(&mut self, offset: usize, value: u32) {
        (**self).write32(offset, value);
    }
}

/// Volatile access to a mapped register window.
#[derive(Debug)]
pub struct Mmio {
    base: NonNull<u32>,
    len: usize,
}

impl Mmio {
    /// # Safety
    /// `base` must map `len` bytes of device registers, uncached, for as
    /// long as the returned value lives.
    #[must_use]
    pub const unsafe fn new(base: NonNull<u8>, len: usize) -> Self {
        Self {
            base: base.cast(),
            len,
        }
    }

    #[inline]
    fn register(&self, offset: usize) -> *mut u32 {
        debug_assert!(
            offset.is_multiple_of(4) && offset + 4 <= self.len,
            "register {offset:#x} outside window"
        );
        unsafe { self.base.as_ptr().byte_add(offset) }
    }
}

impl RegisterBlock for Mmio {
    #[inline]
    fn read32(&self, offset: usize) -> u32 {
        unsafe { self.register(offset).read_volatile() }
    }

    #[inline]
    fn write32(&mut self, offset: usize, value: u32) {
        unsafe { self.register(offset).write_volatile(value) }
    }
}

/// Maps a chip's physical register window into the address space.
pub trait MmioMapper {
    type Registers: RegisterBlock;

    /// Map `len` bytes at `pa` uncached. `None` if the window cannot be
    /// mapped.
    fn map_registers(&mut self, pa: PhysicalAddress, len: usize) -> Option<Self::Registers>;
}

impl<M: MmioMapper + ?Sized> MmioMapper for &mut M {
    type Registers = M::Registers;

    fn map_registers(&mut self, pa: PhysicalAddress, len: usize) -> Option<Self::Registers> {
        (**self).map_registers(pa, len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mmio_reads_and_writes_at_byte_offsets() {
        let mut page = [0u32; 0x100];
        let base = NonNull::new(page.as_mut_ptr().cast::<u8>()).expect("non-null");
        let mut regs = unsafe { Mmio::new(base, 0x400) };
        regs.write32(0xB0, 0xDEAD_BEEF);
        assert_eq!(regs.read32(0xB0), 0xDEAD_BEEF);
        drop(regs);
        assert_eq!(page[0xB0 / 4], 0xDEAD_BEEF);
    }
}
