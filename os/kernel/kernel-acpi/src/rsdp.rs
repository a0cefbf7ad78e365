//! # Root System Description Pointer
//!
//! ```text
//! offset  size  field
//!   0      8    "RSD PTR "
//!   8      1    checksum           (first 20 bytes)
//!   9      6    OEM id
//!  15      1    revision           (0 = ACPI 1.0, 2+ = extended)
//!  16      4    RSDT address
//!  ---------------------------------- revision >= 2
//!  20      4    length
//!  24      8    XSDT address
//!  32      1    extended checksum  (whole `length`)
//!  33      3    reserved
//! ```

use crate::checksum::is_valid_checksum;
use crate::{AcpiError, PhysMapRo, with_mapping};
use log::{debug, info, trace};

pub const RSDP_SIGNATURE: [u8; 8] = *b"RSD PTR ";
pub const RSDP_ALIGNMENT: usize = 16;
pub const RSDP_V1_LEN: usize = 20;
pub const RSDP_V2_LEN: usize = 36;

/// BIOS data area word holding the EBDA real-mode segment.
pub const EBDA_POINTER: u64 = 0x040E;

/// Bytes of the EBDA searched for the RSDP.
pub const EBDA_SEARCH_LEN: usize = 1024;

pub const BIOS_AREA_START: u64 = 0x000E_0000;
pub const BIOS_AREA_END: u64 = 0x0010_0000;

/// A validated RSDP.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Rsdp {
    /// Where it was found.
    pub paddr: u64,
    pub revision: u8,
    pub oem_id: [u8; 6],
    pub rsdt_address: u32,
    /// Present for revision 2 and later.
    pub xsdt_address: Option<u64>,
}

impl Rsdp {
    /// Validate a candidate at the start of `bytes`.
    ///
    /// Revision 0 needs the 20-byte checksum; revision 2 and later need it
    /// *and* the extended checksum over the declared length.
    #[must_use]
    pub fn parse(bytes: &[u8], paddr: u64) -> Option<Self> {
        let v1 = bytes.get(..RSDP_V1_LEN)?;
        if v1[..8] != RSDP_SIGNATURE || !is_valid_checksum(v1) {
            return None;
        }

        let revision = v1[15];
        let mut oem_id = [0u8; 6];
        oem_id.copy_from_slice(&v1[9..15]);
        let rsdt_address = u32::from_le_bytes([v1[16], v1[17], v1[18], v1[19]]);

        let xsdt_address = if revision >= 2 {
            let ext = bytes.get(..RSDP_V2_LEN)?;
            let length = u32::from_le_bytes([ext[20], ext[21], ext[22], ext[23]]) as usize;
            if length < RSDP_V2_LEN {
                return None;
            }
            if !is_valid_checksum(bytes.get(..length)?) {
                return None;
            }
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&ext[24..32]);
            Some(u64::from_le_bytes(raw))
        } else {
            None
        };

        Some(Self {
            paddr,
            revision,
            oem_id,
            rsdt_address,
            xsdt_address,
        })
    }

    /// Scan `bytes` (mapped from `base`) in 16-byte steps.
    #[must_use]
    pub fn scan(bytes: &[u8], base: u64) -> Option<Self> {
        (0..bytes.len())
            .step_by(RSDP_ALIGNMENT)
            .filter(|&off| bytes[off..].starts_with(&RSDP_SIGNATURE))
            .find_map(|off| {
                let found = Self::parse(&bytes[off..], base + off as u64);
                if found.is_none() {
                    trace!("rejected RSDP candidate at {:#x}", base + off as u64);
                }
                found
            })
    }

    /// The root table to walk: the XSDT if there is one, else the RSDT.
    #[must_use]
    pub fn root_address(&self) -> u64 {
        match self.xsdt_address {
            Some(x) if x != 0 => x,
            _ => u64::from(self.rsdt_address),
        }
    }
}

/// Locate the RSDP: first KiB of the EBDA, then `0xE0000..0x100000`.
///
/// # Errors
/// [`AcpiError::RsdpNotFound`] if neither area holds a valid RSDP.
#[allow(clippy::cast_possible_truncation)]
pub fn find_rsdp<M: PhysMapRo + ?Sized>(mapper: &mut M) -> Result<Rsdp, AcpiError> {
    let segment = with_mapping(mapper, EBDA_POINTER, 2, |b| u16::from_le_bytes([b[0], b[1]]))
        .unwrap_or(0);
    let ebda = u64::from(segment) << 4;

    if ebda != 0 {
        debug!("EBDA at {ebda:#x}");
        if let Ok(Some(rsdp)) = with_mapping(mapper, ebda, EBDA_SEARCH_LEN, |b| Rsdp::scan(b, ebda)) {
            info!("RSDP rev {} in EBDA at {:#x}", rsdp.revision, rsdp.paddr);
            return Ok(rsdp);
        }
    }

    let len = (BIOS_AREA_END - BIOS_AREA_START) as usize;
    if let Ok(Some(rsdp)) = with_mapping(mapper, BIOS_AREA_START, len, |b| {
        Rsdp::scan(b, BIOS_AREA_START)
    }) {
        info!("RSDP rev {} at {:#x}", rsdp.revision, rsdp.paddr);
        return Ok(rsdp);
    }

    Err(AcpiError::RsdpNotFound)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FirmwareMemory, rsdp_v1, rsdp_v2};

    #[test]
    fn revision_zero_checks_first_twenty_bytes() {
        let bytes = rsdp_v1(0x000F_1000);
        let rsdp = Rsdp::parse(&bytes, 0xF0000).expect("valid");
        assert_eq!(rsdp.rsdt_address, 0x000F_1000);
        assert_eq!(rsdp.xsdt_address, None);
        assert_eq!(rsdp.root_address(), 0x000F_1000);
    }

    #[test]
    fn revision_two_needs_both_checksums() {
        let good = rsdp_v2(0x000F_1000, 0x000F_2000);
        let rsdp = Rsdp::parse(&good, 0).expect("valid");
        assert_eq!(rsdp.root_address(), 0x000F_2000);

        // Extended area corrupted: legacy checksum still holds.
        let mut bad = good;
        bad[33] = bad[33].wrapping_add(1);
        assert!(is_valid_checksum(&bad[..RSDP_V1_LEN]));
        assert!(Rsdp::parse(&bad, 0).is_none());

        // Legacy area corrupted in a way the extended sum cannot see.
        let mut bad = good;
        bad[10] = bad[10].wrapping_add(1);
        bad[21] = bad[21].wrapping_sub(1);
        assert!(is_valid_checksum(&bad[..RSDP_V2_LEN]));
        assert!(Rsdp::parse(&bad, 0).is_none());
    }

    #[test]
    fn scan_skips_false_signatures() {
        let mut area = vec![0u8; 0x100];
        area[0x10..0x18].copy_from_slice(&RSDP_SIGNATURE); // no valid checksum
        area[0x28..0x28 + RSDP_V1_LEN].copy_from_slice(&rsdp_v1(0x1234)); // not 16-aligned
        area[0x40..0x40 + RSDP_V1_LEN].copy_from_slice(&rsdp_v1(0x5678));
        let rsdp = Rsdp::scan(&area, 0xE0000).expect("found");
        assert_eq!(rsdp.paddr, 0xE0040);
        assert_eq!(rsdp.rsdt_address, 0x5678);
    }

    #[test]
    fn ebda_is_searched_first() {
        let mut fw = FirmwareMemory::new(0x10_0000);
        fw.write(EBDA_POINTER, &0x9FC0u16.to_le_bytes());
        fw.write(0x9FC00 + 0x20, &rsdp_v1(0xAAAA));
        fw.write(0xF0000, &rsdp_v1(0xBBBB));

        let rsdp = find_rsdp(&mut fw).expect("rsdp");
        assert_eq!(rsdp.paddr, 0x9FC20);
        assert_eq!(rsdp.rsdt_address, 0xAAAA);
        assert!(fw.all_unmapped());
    }

    #[test]
    fn bios_area_is_the_fallback() {
        let mut fw = FirmwareMemory::new(0x10_0000);
        fw.write(0xFFFE0, &rsdp_v1(0xBBBB));
        let rsdp = find_rsdp(&mut fw).expect("rsdp");
        assert_eq!(rsdp.paddr, 0xFFFE0);
    }

    #[test]
    fn nothing_found_is_reported() {
        let mut fw = FirmwareMemory::new(0x10_0000);
        assert_eq!(find_rsdp(&mut fw), Err(AcpiError::RsdpNotFound));
    }
}
