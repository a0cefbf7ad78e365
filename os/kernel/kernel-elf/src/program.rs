//! # ELF32 Program Headers

use crate::header::PHDR_SIZE;
use crate::le32;
use bitfield_struct::bitfield;
use core::ops::Range;
use kernel_memory_addresses::{PageSize, PhysicalAddress, Size4K, VirtualAddress, VirtualPage};

pub const PT_LOAD: u32 = 1;
pub const PT_TLS: u32 = 7;

/// `Elf32_Phdr.p_flags` (SVr4): bit0=X, bit1=W, bit2=R.
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct PFlags {
    #[bits(1)]
    pub execute: bool, // PF_X = 1
    #[bits(1)]
    pub write: bool, // PF_W = 2
    #[bits(1)]
    pub read: bool, // PF_R = 4
    #[bits(29)]
    __: u32,
}

impl PFlags {
    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self::from_bits(self.into_bits() | other.into_bits())
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SegmentKind {
    Load,
    Tls,
    Other(u32),
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ProgramHeader {
    pub p_type: u32,
    pub p_offset: u32,
    pub p_vaddr: VirtualAddress,
    pub p_paddr: PhysicalAddress,
    pub p_filesz: u32,
    pub p_memsz: u32,
    pub p_flags: PFlags,
    pub p_align: u32,
}

impl ProgramHeader {
    /// Decode one entry. `s` must hold at least [`PHDR_SIZE`] bytes.
    fn read(s: &[u8]) -> Self {
        Self {
            p_type: le32(&s[0..4]),
            p_offset: le32(&s[4..8]),
            p_vaddr: VirtualAddress::new(le32(&s[8..12])),
            p_paddr: PhysicalAddress::new(le32(&s[12..16])),
            p_filesz: le32(&s[16..20]),
            p_memsz: le32(&s[20..24]),
            p_flags: PFlags::from_bits(le32(&s[24..28])),
            p_align: {
                let a = le32(&s[28..32]);
                if a == 0 { 1 } else { a } // 0 means no alignment requirement
            },
        }
    }

    #[must_use]
    pub const fn kind(&self) -> SegmentKind {
        match self.p_type {
            PT_LOAD => SegmentKind::Load,
            PT_TLS => SegmentKind::Tls,
            other => SegmentKind::Other(other),
        }
    }

    /// Bytes of the segment that are not backed by the file (BSS).
    #[must_use]
    pub const fn bss_len(&self) -> u32 {
        self.p_memsz.saturating_sub(self.p_filesz)
    }

    /// Byte range of the file image backing this segment.
    #[must_use]
    pub fn file_range(&self) -> Option<Range<usize>> {
        let start = self.p_offset as usize;
        let end = start.checked_add(self.p_filesz as usize)?;
        Some(start..end)
    }

    /// `p_vaddr + p_memsz`, or `None` if that wraps.
    #[must_use]
    pub const fn virtual_end(&self) -> Option<u32> {
        self.p_vaddr.as_u32().checked_add(self.p_memsz)
    }

    /// `p_paddr + p_memsz`, or `None` if that wraps.
    #[must_use]
    pub const fn physical_end(&self) -> Option<u32> {
        self.p_paddr.as_u32().checked_add(self.p_memsz)
    }

    /// First virtual page and number of pages touched by `[p_vaddr, p_vaddr + p_memsz)`.
    #[must_use]
    pub fn pages(&self) -> (VirtualPage<Size4K>, u32) {
        let first = self.p_vaddr.page::<Size4K>();
        if self.p_memsz == 0 {
            return (first, 0);
        }
        let last = (self.virtual_end().unwrap_or(u32::MAX) - 1) >> Size4K::SHIFT;
        (first, last - first.index() + 1)
    }

    /// Whether `page` lies inside this segment's memory image.
    #[must_use]
    pub fn covers(&self, page: VirtualPage<Size4K>) -> bool {
        let (first, count) = self.pages();
        page.index() >= first.index() && page.index() - first.index() < count
    }
}

/// Iterator over the program header table, without allocations.
#[derive(Copy, Clone, Debug)]
pub struct ProgramHeaders<'a> {
    bytes: &'a [u8],
    offset: usize,
    count: usize,
    next: usize,
}

impl<'a> ProgramHeaders<'a> {
    pub(crate) const fn new(bytes: &'a [u8], offset: usize, count: usize) -> Self {
        Self {
            bytes,
            offset,
            count,
            next: 0,
        }
    }
}

impl Iterator for ProgramHeaders<'_> {
    type Item = ProgramHeader;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.count {
            return None;
        }
        let at = self.offset + self.next * PHDR_SIZE;
        let s = self.bytes.get(at..at + PHDR_SIZE)?; // bounds-checked
        self.next += 1;
        Some(ProgramHeader::read(s))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = self.count - self.next;
        (left, Some(left))
    }
}

impl ExactSizeIterator for ProgramHeaders<'_> {}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(vaddr: u32, memsz: u32) -> ProgramHeader {
        ProgramHeader {
            p_type: PT_LOAD,
            p_offset: 0,
            p_vaddr: VirtualAddress::new(vaddr),
            p_paddr: PhysicalAddress::new(vaddr),
            p_filesz: 0,
            p_memsz: memsz,
            p_flags: PFlags::new().with_read(true),
            p_align: 0x1000,
        }
    }

    #[test]
    fn flag_bits_match_elf() {
        let f = PFlags::from_bits(0b101);
        assert!(f.execute() && f.read() && !f.write());
        let u = f.union(PFlags::new().with_write(true));
        assert_eq!(u.into_bits(), 0b111);
    }

    #[test]
    fn unaligned_segment_spans_partial_pages() {
        let ph = header(0x0804_8F00, 0x200);
        let (first, count) = ph.pages();
        assert_eq!(first.base(), VirtualAddress::new(0x0804_8000));
        assert_eq!(count, 2);
        assert!(ph.covers(VirtualPage::from_index(0x0804_9)));
        assert!(!ph.covers(VirtualPage::from_index(0x0804_A)));
    }

    #[test]
    fn empty_segment_has_no_pages() {
        assert_eq!(header(0x1000, 0).pages().1, 0);
    }

    #[test]
    fn bss_is_memsz_minus_filesz() {
        let mut ph = header(0x1000, 0x2000);
        ph.p_filesz = 0x1000;
        assert_eq!(ph.bss_len(), 0x1000);
    }
}
