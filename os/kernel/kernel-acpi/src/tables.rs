//! # Table Registry
//!
//! Walks the RSDT or XSDT and records every sub-table whose checksum holds.
//!
//! Tables are never kept mapped. Each one is read in two steps: map the
//! 36-byte header to learn the length, then map exactly that length to
//! verify the checksum and read the body.

use crate::checksum::is_valid_checksum;
use crate::madt::Madt;
use crate::rsdp::{Rsdp, find_rsdp};
use crate::sdt::{SDT_HEADER_LEN, SdtHeader, Signature};
use crate::{AcpiError, PhysMapRo, with_mapping};
use alloc::vec::Vec;
use log::{debug, info, warn};

/// The root table in use, by physical address.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RootTable {
    /// Array of 32-bit pointers.
    Rsdt(u64),
    /// Array of 64-bit pointers.
    Xsdt(u64),
}

impl RootTable {
    const fn signature(self) -> Signature {
        match self {
            Self::Rsdt(_) => Signature::RSDT,
            Self::Xsdt(_) => Signature::XSDT,
        }
    }

    /// Physical address of the root table.
    #[must_use]
    pub const fn paddr(self) -> u64 {
        match self {
            Self::Rsdt(p) | Self::Xsdt(p) => p,
        }
    }

    const fn pointer_width(self) -> usize {
        match self {
            Self::Rsdt(_) => 4,
            Self::Xsdt(_) => 8,
        }
    }
}

/// One validated ACPI table.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct AcpiEntry {
    pub signature: Signature,
    pub paddr: u64,
    pub length: u32,
    pub revision: u8,
    pub oem_id: [u8; 6],
}

/// Every table reachable from the RSDP, in root-table order.
#[derive(Clone, Debug)]
pub struct AcpiTables {
    rsdp: Rsdp,
    root: RootTable,
    entries: Vec<AcpiEntry>,
}

/// Map `paddr`, validate it as an ACPI table and hand header and bytes to `f`.
///
/// # Errors
/// - [`AcpiError::Unmappable`] if the mapper cannot reach the table.
/// - [`AcpiError::Truncated`] if the declared length is shorter than a header.
/// - [`AcpiError::BadChecksum`] if the bytes do not sum to zero.
pub fn load_table<M, R>(
    mapper: &mut M,
    paddr: u64,
    f: impl FnOnce(&SdtHeader, &[u8]) -> R,
) -> Result<R, AcpiError>
where
    M: PhysMapRo + ?Sized,
{
    let header = with_mapping(mapper, paddr, SDT_HEADER_LEN, SdtHeader::parse)?
        .ok_or(AcpiError::Truncated { paddr })?;
    if header.is_empty() {
        return Err(AcpiError::Truncated { paddr });
    }

    with_mapping(mapper, paddr, header.len(), |bytes| {
        if is_valid_checksum(bytes) {
            Ok(f(&header, bytes))
        } else {
            Err(AcpiError::BadChecksum {
                signature: header.signature,
                paddr,
            })
        }
    })?
}

impl AcpiTables {
    /// Find the RSDP and register every valid table.
    ///
    /// # Errors
    /// [`AcpiError::RsdpNotFound`], or any error of [`from_rsdp`](Self::from_rsdp).
    pub fn discover<M: PhysMapRo + ?Sized>(mapper: &mut M) -> Result<Self, AcpiError> {
        let rsdp = find_rsdp(mapper)?;
        Self::from_rsdp(mapper, rsdp)
    }

    /// Register every valid table reachable from `rsdp`.
    ///
    /// The XSDT is preferred; if it is absent or invalid the RSDT is used.
    /// Sub-tables that fail validation are logged and skipped.
    ///
    /// # Errors
    /// The root-table error if neither root validates, or
    /// [`AcpiError::NoTables`] if no sub-table does.
    pub fn from_rsdp<M: PhysMapRo + ?Sized>(mapper: &mut M, rsdp: Rsdp) -> Result<Self, AcpiError> {
        let candidates = [
            rsdp.xsdt_address.filter(|&x| x != 0).map(RootTable::Xsdt),
            Some(RootTable::Rsdt(u64::from(rsdp.rsdt_address))),
        ];

        let mut last_error = AcpiError::NoTables;
        for root in candidates.into_iter().flatten() {
            match read_pointers(mapper, root) {
                Ok(pointers) => return Self::register(mapper, rsdp, root, &pointers),
                Err(e) => {
                    warn!("{} unusable: {e}", root.signature());
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }

    fn register<M: PhysMapRo + ?Sized>(
        mapper: &mut M,
        rsdp: Rsdp,
        root: RootTable,
        pointers: &[u64],
    ) -> Result<Self, AcpiError> {
        let mut entries = Vec::with_capacity(pointers.len());
        for &paddr in pointers.iter().filter(|&&p| p != 0) {
            match load_table(mapper, paddr, |h, _| AcpiEntry {
                signature: h.signature,
                paddr,
                length: h.length,
                revision: h.revision,
                oem_id: h.oem_id,
            }) {
                Ok(entry) => {
                    debug!("{} at {paddr:#x}, {} bytes", entry.signature, entry.length);
                    entries.push(entry);
                }
                Err(e) => warn!("skipping table at {paddr:#x}: {e}"),
            }
        }

        if entries.is_empty() {
            return Err(AcpiError::NoTables);
        }
        info!(
            "ACPI rev {}: {} table(s) via {}",
            rsdp.revision,
            entries.len(),
            root.signature()
        );
        Ok(Self {
            rsdp,
            root,
            entries,
        })
    }

    #[must_use]
    pub const fn rsdp(&self) -> &Rsdp {
        &self.rsdp
    }

    #[must_use]
    pub const fn root(&self) -> RootTable {
        self.root
    }

    #[must_use]
    pub fn entries(&self) -> &[AcpiEntry] {
        &self.entries
    }

    #[must_use]
    pub fn get(&self, index: usize) -> Option<&AcpiEntry> {
        self.entries.get(index)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// First table with `signature`.
    #[must_use]
    pub fn find(&self, signature: Signature) -> Option<&AcpiEntry> {
        self.entries.iter().find(|e| e.signature == signature)
    }

    /// Every table with `signature` (SSDTs, for example, repeat).
    pub fn find_all(&self, signature: Signature) -> impl Iterator<Item = &AcpiEntry> {
        self.entries.iter().filter(move |e| e.signature == signature)
    }

    /// Map `entry` again, re-validate it and run `f` over its bytes.
    ///
    /// # Errors
    /// Any error of [`load_table`].
    pub fn read<M, R>(
        &self,
        mapper: &mut M,
        entry: &AcpiEntry,
        f: impl FnOnce(&[u8]) -> R,
    ) -> Result<R, AcpiError>
    where
        M: PhysMapRo + ?Sized,
    {
        load_table(mapper, entry.paddr, |_, bytes| f(bytes))
    }

    /// Decode the MADT.
    ///
    /// # Errors
    /// [`AcpiError::Missing`] if there is none, or a mapping or decoding error.
    pub fn madt<M: PhysMapRo + ?Sized>(&self, mapper: &mut M) -> Result<Madt, AcpiError> {
        let entry = self
            .find(Signature::MADT)
            .ok_or(AcpiError::Missing(Signature::MADT))?;
        self.read(mapper, entry, Madt::parse)?
    }
}

fn read_pointers<M: PhysMapRo + ?Sized>(
    mapper: &mut M,
    root: RootTable,
) -> Result<Vec<u64>, AcpiError> {
    let paddr = root.paddr();
    load_table(mapper, paddr, |header, bytes| {
        if header.signature != root.signature() {
            return Err(AcpiError::UnexpectedSignature {
                expected: root.signature(),
                found: header.signature,
                paddr,
            });
        }
        Ok(bytes[SDT_HEADER_LEN..]
            .chunks_exact(root.pointer_width())
            .map(|c| {
                let mut raw = [0u8; 8];
                raw[..c.len()].copy_from_slice(c);
                u64::from_le_bytes(raw)
            })
            .collect())
    })?
}
