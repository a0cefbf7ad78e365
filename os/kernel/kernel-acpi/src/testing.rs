//! Synthetic firmware for host-side tests.
//!
//! [`FirmwareMemory`] is a byte buffer standing in for the low physical
//! address space; the builders produce tables with correct checksums.

use crate::PhysMapRo;
use crate::checksum::fixup;
use crate::madt::MpsIntiFlags;
use crate::rsdp::{RSDP_SIGNATURE, RSDP_V1_LEN, RSDP_V2_LEN};
use crate::sdt::SDT_HEADER_LEN;
use alloc::vec::Vec;

/// Physical memory from address 0, with a log of every mapping.
pub struct FirmwareMemory {
    bytes: Vec<u8>,
    maps: Vec<(u64, usize)>,
    open: usize,
}

impl FirmwareMemory {
    #[must_use]
    pub fn new(size: usize) -> Self {
        Self {
            bytes: alloc::vec![0; size],
            maps: Vec::new(),
            open: 0,
        }
    }

    /// # Panics
    /// If the write runs past the buffer.
    #[allow(clippy::cast_possible_truncation)]
    pub fn write(&mut self, paddr: u64, data: &[u8]) {
        let at = paddr as usize;
        self.bytes[at..at + data.len()].copy_from_slice(data);
    }

    /// Every `(paddr, len)` passed to `map_ro`, in order.
    #[must_use]
    pub fn maps(&self) -> &[(u64, usize)] {
        &self.maps
    }

    /// `true` if every mapping was released again.
    #[must_use]
    pub const fn all_unmapped(&self) -> bool {
        self.open == 0
    }
}

impl PhysMapRo for FirmwareMemory {
    unsafe fn map_ro<'a>(&mut self, paddr: u64, len: usize) -> Option<&'a [u8]> {
        let start = usize::try_from(paddr).ok()?;
        let end = start.checked_add(len)?;
        if end > self.bytes.len() {
            return None;
        }
        self.maps.push((paddr, len));
        self.open += 1;
        Some(unsafe { core::slice::from_raw_parts(self.bytes.as_ptr().add(start), len) })
    }

    fn unmap(&mut self, _paddr: u64, _len: usize) {
        self.open -= 1;
    }
}

/// An ACPI 1.0 RSDP pointing at `rsdt`.
#[must_use]
pub fn rsdp_v1(rsdt: u32) -> [u8; RSDP_V1_LEN] {
    let mut b = [0u8; RSDP_V1_LEN];
    b[..8].copy_from_slice(&RSDP_SIGNATURE);
    b[9..15].copy_from_slice(b"TESTFW");
    b[16..20].copy_from_slice(&rsdt.to_le_bytes());
    b[8] = fixup(&b);
    b
}

/// An ACPI 2.0 RSDP with both checksums set.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn rsdp_v2(rsdt: u32, xsdt: u64) -> [u8; RSDP_V2_LEN] {
    let mut b = [0u8; RSDP_V2_LEN];
    b[..8].copy_from_slice(&RSDP_SIGNATURE);
    b[9..15].copy_from_slice(b"TESTFW");
    b[15] = 2;
    b[16..20].copy_from_slice(&rsdt.to_le_bytes());
    b[20..24].copy_from_slice(&(RSDP_V2_LEN as u32).to_le_bytes());
    b[24..32].copy_from_slice(&xsdt.to_le_bytes());
    b[8] = fixup(&b[..RSDP_V1_LEN]);
    b[32] = fixup(&b);
    b
}

/// A table with the given signature and body, checksum fixed up.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn sdt(signature: [u8; 4], body: &[u8]) -> Vec<u8> {
    let mut t = alloc::vec![0u8; SDT_HEADER_LEN];
    t[0..4].copy_from_slice(&signature);
    t[4..8].copy_from_slice(&((SDT_HEADER_LEN + body.len()) as u32).to_le_bytes());
    t[8] = 1;
    t[10..16].copy_from_slice(b"TESTFW");
    t.extend_from_slice(body);
    t[9] = fixup(&t);
    t
}

#[must_use]
pub fn rsdt(pointers: &[u32]) -> Vec<u8> {
    let body: Vec<u8> = pointers.iter().flat_map(|p| p.to_le_bytes()).collect();
    sdt(*b"RSDT", &body)
}

#[must_use]
pub fn xsdt(pointers: &[u64]) -> Vec<u8> {
    let body: Vec<u8> = pointers.iter().flat_map(|p| p.to_le_bytes()).collect();
    sdt(*b"XSDT", &body)
}

/// Builds a MADT record by record.
pub struct MadtBuilder {
    local_apic_address: u32,
    flags: u32,
    records: Vec<u8>,
}

impl MadtBuilder {
    #[must_use]
    pub const fn new(local_apic_address: u32) -> Self {
        Self {
            local_apic_address,
            flags: 0,
            records: Vec::new(),
        }
    }

    #[must_use]
    pub fn pcat_compat(mut self) -> Self {
        self.flags |= 1;
        self
    }

    #[must_use]
    pub fn processor(mut self, processor_id: u8, apic_id: u8, enabled: bool) -> Self {
        self.records.extend_from_slice(&[0, 8, processor_id, apic_id]);
        self.records.extend_from_slice(&u32::from(enabled).to_le_bytes());
        self
    }

    #[must_use]
    pub fn io_apic(mut self, id: u8, address: u32, gsi_base: u32) -> Self {
        self.records.extend_from_slice(&[1, 12, id, 0]);
        self.records.extend_from_slice(&address.to_le_bytes());
        self.records.extend_from_slice(&gsi_base.to_le_bytes());
        self
    }

    #[must_use]
    pub fn iso(mut self, source: u8, gsi: u32, flags: MpsIntiFlags) -> Self {
        self.records.extend_from_slice(&[2, 10, 0, source]);
        self.records.extend_from_slice(&gsi.to_le_bytes());
        self.records.extend_from_slice(&flags.into_bits().to_le_bytes());
        self
    }

    /// NMI on `lint` for `processor_id` (`0xFF` for every CPU).
    #[must_use]
    pub fn nmi(mut self, processor_id: u8, lint: u8) -> Self {
        self.records.extend_from_slice(&[4, 6, processor_id, 0, 0, lint]);
        self
    }

    #[must_use]
    pub fn local_apic_override(mut self, address: u64) -> Self {
        self.records.extend_from_slice(&[5, 12, 0, 0]);
        self.records.extend_from_slice(&address.to_le_bytes());
        self
    }

    /// A record of a type the decoder does not know.
    #[must_use]
    pub fn unknown(mut self, kind: u8, len: u8) -> Self {
        self.records.push(kind);
        self.records.push(len);
        self.records
            .extend(core::iter::repeat_n(0, usize::from(len).saturating_sub(2)));
        self
    }

    #[must_use]
    pub fn build(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(8 + self.records.len());
        body.extend_from_slice(&self.local_apic_address.to_le_bytes());
        body.extend_from_slice(&self.flags.to_le_bytes());
        body.extend_from_slice(&self.records);
        sdt(*b"APIC", &body)
    }
}
