//! # System Description Table Header
//!
//! The 36-byte prefix shared by every ACPI table.
//!
//! | Offset | Size | Field              |
//! |--------|------|--------------------|
//! | 0      | 4    | `signature`        |
//! | 4      | 4    | `length`           |
//! | 8      | 1    | `revision`         |
//! | 9      | 1    | `checksum`         |
//! | 10     | 6    | `oem_id`           |
//! | 16     | 8    | `oem_table_id`     |
//! | 24     | 4    | `oem_revision`     |
//! | 28     | 4    | `creator_id`       |
//! | 32     | 4    | `creator_revision` |

use core::fmt;

pub const SDT_HEADER_LEN: usize = 36;

/// A 4-character table signature.
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Signature(pub [u8; 4]);

impl Signature {
    pub const RSDT: Self = Self(*b"RSDT");
    pub const XSDT: Self = Self(*b"XSDT");
    pub const MADT: Self = Self(*b"APIC");
    pub const FADT: Self = Self(*b"FACP");
    pub const HPET: Self = Self(*b"HPET");

    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 4] {
        &self.0
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for &b in &self.0 {
            let c = if b.is_ascii_graphic() || b == b' ' { b as char } else { '?' };
            write!(f, "{c}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SdtHeader {
    pub signature: Signature,
    pub length: u32,
    pub revision: u8,
    pub checksum: u8,
    pub oem_id: [u8; 6],
    pub oem_table_id: [u8; 8],
    pub oem_revision: u32,
    pub creator_id: u32,
    pub creator_revision: u32,
}

impl SdtHeader {
    /// Decode a header from the start of `bytes`.
    #[must_use]
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        let h = bytes.get(..SDT_HEADER_LEN)?;
        let u32_at = |o: usize| u32::from_le_bytes([h[o], h[o + 1], h[o + 2], h[o + 3]]);
        let mut oem_id = [0u8; 6];
        oem_id.copy_from_slice(&h[10..16]);
        let mut oem_table_id = [0u8; 8];
        oem_table_id.copy_from_slice(&h[16..24]);
        Some(Self {
            signature: Signature([h[0], h[1], h[2], h[3]]),
            length: u32_at(4),
            revision: h[8],
            checksum: h[9],
            oem_id,
            oem_table_id,
            oem_revision: u32_at(24),
            creator_id: u32_at(28),
            creator_revision: u32_at(32),
        })
    }

    /// The declared length, as a byte count.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.length as usize
    }

    /// `true` if the declared length cannot even hold the header.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len() < SDT_HEADER_LEN
    }
}
