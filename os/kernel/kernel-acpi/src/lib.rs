//! # ACPI (Advanced Configuration and Power Interface) Discovery
//!
//! Static table discovery for a BIOS-booted machine. No AML is interpreted.
//!
//! ## Architecture
//!
//! ```text
//! BIOS data area (0x40E) ──► EBDA (first KiB)  ─┐
//!                            0xE0000..0xFFFFF  ─┴─► RSDP ("RSD PTR ")
//!                                                     │
//!                                         RSDT (u32 ptrs) / XSDT (u64 ptrs)
//!                                                     │
//!                                   FACP, APIC (MADT), HPET, SSDT, ...
//! ```
//!
//! ## Key Components
//!
//! ### Physical Memory Mapping ([`PhysMapRo`])
//! Firmware tables live at physical addresses the kernel does not keep
//! mapped. Every read is a *map, read, unmap* cycle through this trait, so
//! the same code runs over an identity map, a temporary-mapping window, or a
//! test buffer.
//!
//! ### RSDP Discovery ([`rsdp`])
//! 16-byte-step scan of the EBDA and the BIOS read-only area. Candidates
//! with a matching signature but a bad checksum are skipped silently.
//!
//! ### Table Registry ([`tables`])
//! Walks the root table and records one [`AcpiEntry`] per sub-table whose
//! checksum holds. Entries are looked up by signature for the lifetime of
//! the kernel.
//!
//! ### MADT ([`madt`])
//! Decodes processor local APICs, IO-APICs, interrupt source overrides,
//! local-APIC NMIs and the local-APIC address override.
//!
//! ## Trust
//!
//! Every table is validated before use: a table is accepted only if its
//! bytes sum to zero over its declared length. Failing tables are discarded,
//! never repaired.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

pub mod checksum;
pub mod madt;
pub mod rsdp;
pub mod sdt;
pub mod tables;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use crate::checksum::{is_valid_checksum, sum};
pub use crate::madt::{
    InterruptSourceOverride, IsoPolarity, IsoTrigger, LocalApicNmi, Madt, MadtFlags, MadtIoApic,
    MpsIntiFlags, ProcessorLocalApic,
};
pub use crate::rsdp::{Rsdp, find_rsdp};
pub use crate::sdt::{SDT_HEADER_LEN, SdtHeader, Signature};
pub use crate::tables::{AcpiEntry, AcpiTables, RootTable};

/// Map a physical region and return a *read-only* byte slice for its contents.
/// You provide the implementation (identity map, temporary window, etc.).
pub trait PhysMapRo {
    /// Map `len` bytes at `paddr`. Returns `None` if the range cannot be
    /// reached (for instance above 4 GiB on a 32-bit kernel).
    ///
    /// # Safety
    /// The implementor must ensure the returned slice is valid for `len`
    /// bytes until the matching [`unmap`](Self::unmap). Callers must not
    /// use the slice after unmapping it.
    unsafe fn map_ro<'a>(&mut self, paddr: u64, len: usize) -> Option<&'a [u8]>;

    /// Release a mapping obtained from [`map_ro`](Self::map_ro).
    fn unmap(&mut self, _paddr: u64, _len: usize) {}
}

impl<T: PhysMapRo + ?Sized> PhysMapRo for &mut T {
    unsafe fn map_ro<'a>(&mut self, paddr: u64, len: usize) -> Option<&'a [u8]> {
        unsafe { (**self).map_ro(paddr, len) }
    }

    fn unmap(&mut self, paddr: u64, len: usize) {
        (**self).unmap(paddr, len);
    }
}

/// Map `len` bytes, run `f` over them, unmap.
///
/// # Errors
/// [`AcpiError::Unmappable`] if the mapper cannot reach the range.
pub fn with_mapping<M, R>(
    mapper: &mut M,
    paddr: u64,
    len: usize,
    f: impl FnOnce(&[u8]) -> R,
) -> Result<R, AcpiError>
where
    M: PhysMapRo + ?Sized,
{
    let bytes = unsafe { mapper.map_ro(paddr, len) }.ok_or(AcpiError::Unmappable { paddr, len })?;
    let result = f(bytes);
    mapper.unmap(paddr, len);
    Ok(result)
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, thiserror::Error)]
pub enum AcpiError {
    #[error("no valid RSDP in the EBDA or the BIOS area")]
    RsdpNotFound,
    #[error("cannot map {len:#x} bytes at {paddr:#x}")]
    Unmappable { paddr: u64, len: usize },
    #[error("table at {paddr:#x} is shorter than its header")]
    Truncated { paddr: u64 },
    #[error("table {signature} at {paddr:#x} fails its checksum")]
    BadChecksum { signature: Signature, paddr: u64 },
    #[error("expected {expected} at {paddr:#x}, found {found}")]
    UnexpectedSignature {
        expected: Signature,
        found: Signature,
        paddr: u64,
    },
    #[error("root table lists no valid tables")]
    NoTables,
    #[error("table {0} not present")]
    Missing(Signature),
    #[error("malformed MADT record at offset {offset}")]
    MalformedMadt { offset: usize },
}
