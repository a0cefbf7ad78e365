use core::fmt;
use core::hash::Hash;

mod sealed {
    pub trait Sealed {}
}

/// A page granularity of the two-level i386 scheme.
///
/// Only [`Size4K`] (a page-table entry) and [`Size4M`] (the span of one
/// page-directory entry) exist; the trait is sealed.
pub trait PageSize:
    sealed::Sealed + Clone + Copy + Eq + PartialEq + Ord + PartialOrd + Hash + fmt::Display + fmt::Debug
{
    /// `1 << SHIFT` bytes.
    const SIZE: u32;
    const SHIFT: u32;
    /// The offset bits of an address.
    const MASK: u32 = Self::SIZE - 1;

    fn as_str() -> &'static str;

    /// Pages needed to hold `bytes`.
    #[must_use]
    fn pages_for(bytes: u32) -> u32 {
        bytes.div_ceil(Self::SIZE)
    }
}

macro_rules! page_size {
    ($(#[$doc:meta])* $name:ident, $shift:literal, $label:literal) => {
        $(#[$doc])*
        #[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
        pub struct $name;

        impl sealed::Sealed for $name {}

        impl PageSize for $name {
            const SIZE: u32 = 1 << $shift;
            const SHIFT: u32 = $shift;

            fn as_str() -> &'static str {
                $label
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str($label)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str($label)
            }
        }
    };
}

page_size!(
    /// 4 KiB, the only size the loader maps.
    Size4K, 12, "4K"
);
page_size!(
    /// 4 MiB, what one directory entry covers.
    Size4M, 22, "4M"
);

const _: () = {
    assert!(Size4K::SIZE == 4096);
    assert!(Size4M::SIZE == Size4K::SIZE * 1024);
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pages_for_rounds_up() {
        assert_eq!(Size4K::pages_for(0), 0);
        assert_eq!(Size4K::pages_for(1), 1);
        assert_eq!(Size4K::pages_for(0x2001), 3);
        assert_eq!(Size4M::pages_for(0x40_0000), 1);
        assert_eq!(Size4K::MASK, 0xFFF);
    }
}
