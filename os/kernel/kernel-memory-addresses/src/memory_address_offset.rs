use crate::{MemoryAddress, MemoryPage, PageSize};
use core::fmt;
use core::marker::PhantomData;
use core::ops::Add;

/// The low [`S::SHIFT`](PageSize::SHIFT) bits of an address: where inside a
/// page of size `S` it points.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct MemoryAddressOffset<S: PageSize> {
    value: u32,
    _size: PhantomData<S>,
}

impl<S: PageSize> MemoryAddressOffset<S> {
    /// The first byte of a page.
    pub const ZERO: Self = Self::masked(0);

    /// Keeps only the offset bits of `value`. Debug builds reject anything
    /// that does not fit.
    #[inline]
    #[must_use]
    pub const fn new(value: u32) -> Self {
        debug_assert!(value <= S::MASK, "offset must be < page size");
        Self::masked(value)
    }

    #[inline]
    #[must_use]
    pub const fn from_addr(addr: MemoryAddress) -> Self {
        Self::masked(addr.as_u32())
    }

    const fn masked(value: u32) -> Self {
        Self {
            value: value & S::MASK,
            _size: PhantomData,
        }
    }

    #[inline]
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.value
    }

    /// Bytes left in the page from this offset on.
    #[inline]
    #[must_use]
    pub const fn remaining(self) -> u32 {
        S::SIZE - self.value
    }
}

impl<S: PageSize> fmt::Debug for MemoryAddressOffset<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "+{:#05X}/{}", self.value, S::as_str())
    }
}

impl<S: PageSize> Add<MemoryAddressOffset<S>> for MemoryPage<S> {
    type Output = MemoryAddress;

    #[inline]
    fn add(self, rhs: MemoryAddressOffset<S>) -> Self::Output {
        self.join(rhs)
    }
}

impl<S: PageSize> From<MemoryAddress> for MemoryAddressOffset<S> {
    #[inline]
    fn from(addr: MemoryAddress) -> Self {
        Self::from_addr(addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Size4K, Size4M};

    #[test]
    fn offset_keeps_the_low_bits() {
        let addr = MemoryAddress::new(0xC012_3456);
        assert_eq!(MemoryAddressOffset::<Size4K>::from(addr).as_u32(), 0x456);
        assert_eq!(MemoryAddressOffset::<Size4M>::from(addr).as_u32(), 0x12_3456);
        assert_eq!(MemoryAddressOffset::<Size4K>::from(addr).remaining(), 0xBAA);
        assert_eq!(MemoryAddressOffset::<Size4K>::ZERO.remaining(), 0x1000);
    }
}
