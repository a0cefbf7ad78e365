//! # ELF32 File Header
//!
//! Field offsets follow the System V i386 ABI:
//!
//! | Offset | Field         | Offset | Field         |
//! |--------|---------------|--------|---------------|
//! | 0      | `e_ident[16]` | 36     | `e_flags`     |
//! | 16     | `e_type`      | 40     | `e_ehsize`    |
//! | 18     | `e_machine`   | 42     | `e_phentsize` |
//! | 20     | `e_version`   | 44     | `e_phnum`     |
//! | 24     | `e_entry`     | 46     | `e_shentsize` |
//! | 28     | `e_phoff`     | 48     | `e_shnum`     |
//! | 32     | `e_shoff`     | 50     | `e_shstrndx`  |

use crate::program::{ProgramHeader, ProgramHeaders, SegmentKind};
use crate::{le16, le32};
use kernel_info::memory::PhysicalRange;
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};

pub const ELF_MAGIC: [u8; 4] = *b"\x7FELF";
pub const ELFCLASS32: u8 = 1;
pub const ELFDATA2LSB: u8 = 1;
pub const EV_CURRENT: u8 = 1;
pub const ET_EXEC: u16 = 2;
pub const EM_386: u16 = 3;

/// `sizeof(Elf32_Ehdr)`.
pub const EHDR_SIZE: usize = 52;

/// `sizeof(Elf32_Phdr)`.
pub const PHDR_SIZE: usize = 32;

/// Largest `PT_TLS` memory image accepted. Every thread receives a copy.
pub const MAX_TLS_SIZE: u32 = 16 * 1024;

const EI_CLASS: usize = 4;
const EI_DATA: usize = 5;
const EI_VERSION: usize = 6;

#[derive(Debug, Clone, Copy, Eq, PartialEq, thiserror::Error)]
pub enum ElfError {
    #[error("missing ELF magic")]
    NotElf,
    #[error("image is shorter than an ELF32 header")]
    TooShort,
    #[error("not a 32-bit image (class {0})")]
    Not32Bit(u8),
    #[error("not a little-endian image (encoding {0})")]
    NotLittleEndian(u8),
    #[error("unsupported ELF version {0}")]
    BadVersion(u32),
    #[error("not an executable (e_type {0})")]
    NotExecutable(u16),
    #[error("wrong target architecture (e_machine {0})")]
    WrongArchitecture(u16),
    #[error("header length mismatch (e_ehsize {ehsize}, e_phentsize {phentsize})")]
    HeaderLengthMismatch { ehsize: u16, phentsize: u16 },
    #[error("program header table lies outside the image")]
    ProgramHeadersOutOfBounds,
    #[error("image has no loadable segment")]
    NoLoadableSegments,
    #[error("segment {index}: file bytes lie outside the image")]
    SegmentOutOfBounds { index: usize },
    #[error("segment {index}: p_filesz exceeds p_memsz")]
    FileSizeExceedsMemSize { index: usize },
    #[error("segment {index}: wraps the address space")]
    SegmentOverflow { index: usize },
    #[error("thread-local image of {size:#x} bytes is too large")]
    TlsTooLarge { size: u32 },
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[allow(clippy::struct_field_names)]
pub struct ElfHeader {
    pub e_type: u16,
    pub e_machine: u16,
    pub e_version: u32,
    pub e_entry: VirtualAddress,
    pub e_phoff: u32,
    pub e_shoff: u32,
    pub e_flags: u32,
    pub e_ehsize: u16,
    pub e_phentsize: u16,
    pub e_phnum: u16,
}

impl ElfHeader {
    /// Decode the fixed part. `bytes` must hold at least [`EHDR_SIZE`] bytes.
    fn read(bytes: &[u8]) -> Self {
        Self {
            e_type: le16(&bytes[16..18]),
            e_machine: le16(&bytes[18..20]),
            e_version: le32(&bytes[20..24]),
            e_entry: VirtualAddress::new(le32(&bytes[24..28])),
            e_phoff: le32(&bytes[28..32]),
            e_shoff: le32(&bytes[32..36]),
            e_flags: le32(&bytes[36..40]),
            e_ehsize: le16(&bytes[40..42]),
            e_phentsize: le16(&bytes[42..44]),
            e_phnum: le16(&bytes[44..46]),
        }
    }
}

/// A validated ELF32 executable borrowed from its backing bytes.
#[derive(Copy, Clone, Debug)]
pub struct ElfImage<'a> {
    bytes: &'a [u8],
    header: ElfHeader,
}

impl<'a> ElfImage<'a> {
    /// Validate `bytes` as an i386 little-endian executable.
    ///
    /// Checks run in a fixed order and the first failure is reported:
    /// magic, length, class, encoding, version, type, machine, header sizes,
    /// program header table bounds, then every `PT_LOAD`/`PT_TLS` segment.
    ///
    /// # Errors
    /// One [`ElfError`] variant per failed check.
    pub fn parse(bytes: &'a [u8]) -> Result<Self, ElfError> {
        if bytes.get(0..4) != Some(&ELF_MAGIC[..]) {
            return Err(ElfError::NotElf);
        }
        if bytes.len() < EHDR_SIZE {
            return Err(ElfError::TooShort);
        }
        if bytes[EI_CLASS] != ELFCLASS32 {
            return Err(ElfError::Not32Bit(bytes[EI_CLASS]));
        }
        if bytes[EI_DATA] != ELFDATA2LSB {
            return Err(ElfError::NotLittleEndian(bytes[EI_DATA]));
        }
        if bytes[EI_VERSION] != EV_CURRENT {
            return Err(ElfError::BadVersion(u32::from(bytes[EI_VERSION])));
        }

        let header = ElfHeader::read(bytes);
        if header.e_version != u32::from(EV_CURRENT) {
            return Err(ElfError::BadVersion(header.e_version));
        }
        if header.e_type != ET_EXEC {
            return Err(ElfError::NotExecutable(header.e_type));
        }
        if header.e_machine != EM_386 {
            return Err(ElfError::WrongArchitecture(header.e_machine));
        }
        if usize::from(header.e_ehsize) != EHDR_SIZE
            || usize::from(header.e_phentsize) != PHDR_SIZE
        {
            return Err(ElfError::HeaderLengthMismatch {
                ehsize: header.e_ehsize,
                phentsize: header.e_phentsize,
            });
        }

        let table_len = usize::from(header.e_phnum) * PHDR_SIZE;
        let table_end = (header.e_phoff as usize)
            .checked_add(table_len)
            .ok_or(ElfError::ProgramHeadersOutOfBounds)?;
        if table_end > bytes.len() {
            return Err(ElfError::ProgramHeadersOutOfBounds);
        }

        let image = Self { bytes, header };
        let mut loads = 0usize;
        for (index, ph) in image.program_headers().enumerate() {
            match ph.kind() {
                SegmentKind::Load => {
                    loads += 1;
                    image.check_segment(index, &ph)?;
                }
                SegmentKind::Tls => {
                    image.check_segment(index, &ph)?;
                    if ph.p_memsz > MAX_TLS_SIZE {
                        return Err(ElfError::TlsTooLarge { size: ph.p_memsz });
                    }
                }
                SegmentKind::Other(_) => {}
            }
        }
        if loads == 0 {
            return Err(ElfError::NoLoadableSegments);
        }

        Ok(image)
    }

    fn check_segment(&self, index: usize, ph: &ProgramHeader) -> Result<(), ElfError> {
        if ph.p_filesz > ph.p_memsz {
            return Err(ElfError::FileSizeExceedsMemSize { index });
        }
        match ph.file_range() {
            Some(range) if range.end <= self.bytes.len() => {}
            _ => return Err(ElfError::SegmentOutOfBounds { index }),
        }
        if ph.virtual_end().is_none() || ph.physical_end().is_none() {
            return Err(ElfError::SegmentOverflow { index });
        }
        Ok(())
    }

    #[must_use]
    pub const fn bytes(&self) -> &'a [u8] {
        self.bytes
    }

    #[must_use]
    pub const fn header(&self) -> &ElfHeader {
        &self.header
    }

    #[must_use]
    pub const fn entry(&self) -> VirtualAddress {
        self.header.e_entry
    }

    #[must_use]
    pub fn program_headers(&self) -> ProgramHeaders<'a> {
        ProgramHeaders::new(
            self.bytes,
            self.header.e_phoff as usize,
            usize::from(self.header.e_phnum),
        )
    }

    /// `PT_LOAD` segments with a non-zero memory size, in table order.
    pub fn load_segments(&self) -> impl Iterator<Item = ProgramHeader> + 'a {
        self.program_headers()
            .filter(|ph| ph.kind() == SegmentKind::Load && ph.p_memsz != 0)
    }

    /// The first `PT_TLS` segment, if any.
    #[must_use]
    pub fn tls_segment(&self) -> Option<ProgramHeader> {
        self.program_headers().find(|ph| ph.kind() == SegmentKind::Tls)
    }

    /// The `p_filesz` bytes backing `ph`.
    ///
    /// Segments were bounds-checked by [`parse`](Self::parse); a header that
    /// did not come from this image yields an empty slice.
    #[must_use]
    pub fn segment_bytes(&self, ph: &ProgramHeader) -> &'a [u8] {
        ph.file_range()
            .and_then(|range| self.bytes.get(range))
            .unwrap_or_default()
    }

    /// Physical range `[min p_paddr, max p_paddr + p_memsz)` over all
    /// loadable segments.
    #[must_use]
    pub fn physical_extent(&self) -> Option<PhysicalRange> {
        let mut extent: Option<(u32, u32)> = None;
        for ph in self.load_segments() {
            let start = ph.p_paddr.as_u32();
            let end = ph.physical_end()?;
            extent = Some(match extent {
                None => (start, end),
                Some((lo, hi)) => (lo.min(start), hi.max(end)),
            });
        }
        extent.map(|(lo, hi)| {
            PhysicalRange::new(PhysicalAddress::new(lo), PhysicalAddress::new(hi))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::{PT_LOAD, PT_TLS};
    use crate::testing::{ImageBuilder, rw, rx};

    fn sample() -> Vec<u8> {
        ImageBuilder::new(0x0804_8000)
            .segment(PT_LOAD, 0x0804_8000, 0x1000, rx(), &[0x90; 64])
            .build()
    }

    #[test]
    fn accepts_minimal_executable() {
        let bytes = sample();
        let image = ElfImage::parse(&bytes).expect("valid image");
        assert_eq!(image.entry(), VirtualAddress::new(0x0804_8000));
        assert_eq!(image.load_segments().count(), 1);
        assert!(image.tls_segment().is_none());
    }

    #[test]
    fn rejects_bad_magic_first() {
        let mut bytes = sample();
        bytes[0] = 0x7E;
        assert_eq!(ElfImage::parse(&bytes).unwrap_err(), ElfError::NotElf);
        assert_eq!(ElfImage::parse(b"MZ").unwrap_err(), ElfError::NotElf);
    }

    #[test]
    fn each_header_check_has_its_own_error() {
        let cases: [(usize, u8, ElfError); 3] = [
            (4, 2, ElfError::Not32Bit(2)),
            (5, 2, ElfError::NotLittleEndian(2)),
            (6, 0, ElfError::BadVersion(0)),
        ];
        for (offset, value, expected) in cases {
            let mut bytes = sample();
            bytes[offset] = value;
            assert_eq!(ElfImage::parse(&bytes).unwrap_err(), expected);
        }

        let mut bytes = sample();
        bytes[16..18].copy_from_slice(&3u16.to_le_bytes());
        assert_eq!(ElfImage::parse(&bytes).unwrap_err(), ElfError::NotExecutable(3));

        let mut bytes = sample();
        bytes[18..20].copy_from_slice(&62u16.to_le_bytes());
        assert_eq!(ElfImage::parse(&bytes).unwrap_err(), ElfError::WrongArchitecture(62));

        let mut bytes = sample();
        bytes[42..44].copy_from_slice(&56u16.to_le_bytes());
        assert_eq!(
            ElfImage::parse(&bytes).unwrap_err(),
            ElfError::HeaderLengthMismatch {
                ehsize: 52,
                phentsize: 56
            }
        );
    }

    #[test]
    fn truncated_header_is_too_short() {
        let bytes = sample();
        assert_eq!(ElfImage::parse(&bytes[..40]).unwrap_err(), ElfError::TooShort);
    }

    #[test]
    fn program_header_table_must_fit() {
        let mut bytes = sample();
        bytes[44..46].copy_from_slice(&200u16.to_le_bytes());
        assert_eq!(
            ElfImage::parse(&bytes).unwrap_err(),
            ElfError::ProgramHeadersOutOfBounds
        );
    }

    #[test]
    fn segment_checks() {
        let bytes = ImageBuilder::new(0x1000)
            .segment(PT_LOAD, 0x1000, 0x10, rw(), &[1; 0x20])
            .build();
        assert_eq!(
            ElfImage::parse(&bytes).unwrap_err(),
            ElfError::FileSizeExceedsMemSize { index: 0 }
        );

        let bytes = ImageBuilder::new(0x1000)
            .segment(PT_LOAD, 0xFFFF_F000, 0x2000, rw(), &[])
            .build();
        assert_eq!(
            ElfImage::parse(&bytes).unwrap_err(),
            ElfError::SegmentOverflow { index: 0 }
        );

        let mut bytes = sample();
        let len = bytes.len();
        bytes.truncate(len - 1);
        assert_eq!(
            ElfImage::parse(&bytes).unwrap_err(),
            ElfError::SegmentOutOfBounds { index: 0 }
        );

        let bytes = ImageBuilder::new(0x1000)
            .segment(PT_TLS, 0x2000, 0x10, rw(), &[1; 4])
            .build();
        assert_eq!(
            ElfImage::parse(&bytes).unwrap_err(),
            ElfError::NoLoadableSegments
        );
    }

    #[test]
    fn thread_local_image_is_bounded() {
        let bytes = ImageBuilder::new(0x1000)
            .segment(PT_LOAD, 0x1000, 0x10, rx(), &[0x90; 0x10])
            .segment(PT_TLS, 0x2000, 0xFFFF_0000, rw(), &[1; 4])
            .build();
        assert_eq!(
            ElfImage::parse(&bytes).unwrap_err(),
            ElfError::TlsTooLarge { size: 0xFFFF_0000 }
        );

        let bytes = ImageBuilder::new(0x1000)
            .segment(PT_LOAD, 0x1000, 0x10, rx(), &[0x90; 0x10])
            .segment(PT_TLS, 0x2000, MAX_TLS_SIZE, rw(), &[1; 4])
            .build();
        let image = ElfImage::parse(&bytes).expect("largest TLS image");
        assert_eq!(image.tls_segment().map(|ph| ph.p_memsz), Some(MAX_TLS_SIZE));
    }

    #[test]
    fn physical_extent_covers_all_loads() {
        let bytes = ImageBuilder::new(0xC010_0000)
            .segment(PT_LOAD, 0xC010_0000, 0x1800, rx(), &[0; 16])
            .at_physical(0x0010_0000)
            .segment(PT_LOAD, 0xC010_3000, 0x2000, rw(), &[])
            .at_physical(0x0010_3000)
            .build();
        let image = ElfImage::parse(&bytes).expect("valid image");
        assert_eq!(
            image.physical_extent(),
            Some(PhysicalRange::from_raw(0x0010_0000, 0x0010_5000))
        );
    }
}
