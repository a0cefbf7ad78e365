//! # Multiple APIC Description Table
//!
//! After the common header the MADT holds the local-APIC base, a flags word
//! and a sequence of variable-length records:
//!
//! | Type | Record                          | Length |
//! |------|---------------------------------|--------|
//! | 0    | Processor local APIC            | 8      |
//! | 1    | IO-APIC                         | 12     |
//! | 2    | Interrupt source override (ISO) | 10     |
//! | 4    | Local APIC NMI                  | 6      |
//! | 5    | Local APIC address override     | 12     |
//!
//! Unknown record types are skipped by length.

use crate::sdt::SDT_HEADER_LEN;
use crate::AcpiError;
use alloc::vec::Vec;
use bitfield_struct::bitfield;
use log::{debug, trace};

const RECORDS_OFFSET: usize = SDT_HEADER_LEN + 8;

const TYPE_LOCAL_APIC: u8 = 0;
const TYPE_IO_APIC: u8 = 1;
const TYPE_ISO: u8 = 2;
const TYPE_LOCAL_APIC_NMI: u8 = 4;
const TYPE_LOCAL_APIC_OVERRIDE: u8 = 5;

/// NMI records with this processor id apply to every processor.
pub const ALL_PROCESSORS: u8 = 0xFF;

#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct MadtFlags {
    /// A legacy dual-8259 PIC pair is installed and must be masked.
    pub pcat_compat: bool,
    #[bits(31)]
    __: u32,
}

/// Polarity field of [`MpsIntiFlags`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum IsoPolarity {
    ConformsToBus = 0,
    ActiveHigh = 1,
    Reserved = 2,
    ActiveLow = 3,
}

impl IsoPolarity {
    const fn into_bits(self) -> u8 {
        self as u8
    }

    const fn from_bits(value: u8) -> Self {
        match value & 0b11 {
            0 => Self::ConformsToBus,
            1 => Self::ActiveHigh,
            2 => Self::Reserved,
            _ => Self::ActiveLow,
        }
    }
}

/// Trigger-mode field of [`MpsIntiFlags`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum IsoTrigger {
    ConformsToBus = 0,
    Edge = 1,
    Reserved = 2,
    Level = 3,
}

impl IsoTrigger {
    const fn into_bits(self) -> u8 {
        self as u8
    }

    const fn from_bits(value: u8) -> Self {
        match value & 0b11 {
            0 => Self::ConformsToBus,
            1 => Self::Edge,
            2 => Self::Reserved,
            _ => Self::Level,
        }
    }
}

/// `MPS INTI` flags shared by ISO and NMI records.
#[bitfield(u16)]
#[derive(PartialEq, Eq)]
pub struct MpsIntiFlags {
    #[bits(2)]
    pub polarity: IsoPolarity,
    #[bits(2)]
    pub trigger: IsoTrigger,
    #[bits(12)]
    __: u16,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ProcessorLocalApic {
    pub processor_id: u8,
    pub apic_id: u8,
    pub flags: u32,
}

impl ProcessorLocalApic {
    #[must_use]
    pub const fn enabled(&self) -> bool {
        self.flags & 1 != 0
    }

    /// Disabled now, but may be brought online.
    #[must_use]
    pub const fn online_capable(&self) -> bool {
        self.flags & 2 != 0
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct MadtIoApic {
    pub id: u8,
    pub address: u32,
    /// First global system interrupt routed by this chip.
    pub gsi_base: u32,
}

/// An ISA IRQ that is not identity-mapped onto a GSI, or that has
/// non-default polarity or trigger mode.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct InterruptSourceOverride {
    pub bus: u8,
    pub source: u8,
    pub gsi: u32,
    pub flags: MpsIntiFlags,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct LocalApicNmi {
    pub processor_id: u8,
    pub flags: MpsIntiFlags,
    /// `LINT0` or `LINT1`.
    pub lint: u8,
}

impl LocalApicNmi {
    #[must_use]
    pub const fn applies_to(&self, processor_id: u8) -> bool {
        self.processor_id == ALL_PROCESSORS || self.processor_id == processor_id
    }
}

/// Decoded MADT.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Madt {
    pub local_apic_address: u32,
    pub flags: MadtFlags,
    pub local_apic_override: Option<u64>,
    pub processors: Vec<ProcessorLocalApic>,
    pub io_apics: Vec<MadtIoApic>,
    pub overrides: Vec<InterruptSourceOverride>,
    pub nmis: Vec<LocalApicNmi>,
}

impl Madt {
    /// Decode a checksum-validated MADT.
    ///
    /// # Errors
    /// [`AcpiError::MalformedMadt`] if a record is shorter than its type
    /// requires or runs past the end of the table.
    pub fn parse(table: &[u8]) -> Result<Self, AcpiError> {
        let fixed = table
            .get(SDT_HEADER_LEN..RECORDS_OFFSET)
            .ok_or(AcpiError::MalformedMadt { offset: SDT_HEADER_LEN })?;

        let mut madt = Self {
            local_apic_address: le32(&fixed[0..4]),
            flags: MadtFlags::from_bits(le32(&fixed[4..8])),
            ..Self::default()
        };

        let mut offset = RECORDS_OFFSET;
        while offset < table.len() {
            let malformed = AcpiError::MalformedMadt { offset };
            let head = table.get(offset..offset + 2).ok_or(malformed)?;
            let (kind, len) = (head[0], usize::from(head[1]));
            if len < 2 {
                return Err(malformed);
            }
            let r = table.get(offset..offset + len).ok_or(malformed)?;
            let need = |n: usize| if len >= n { Ok(()) } else { Err(malformed) };

            match kind {
                TYPE_LOCAL_APIC => {
                    need(8)?;
                    madt.processors.push(ProcessorLocalApic {
                        processor_id: r[2],
                        apic_id: r[3],
                        flags: le32(&r[4..8]),
                    });
                }
                TYPE_IO_APIC => {
                    need(12)?;
                    madt.io_apics.push(MadtIoApic {
                        id: r[2],
                        address: le32(&r[4..8]),
                        gsi_base: le32(&r[8..12]),
                    });
                }
                TYPE_ISO => {
                    need(10)?;
                    madt.overrides.push(InterruptSourceOverride {
                        bus: r[2],
                        source: r[3],
                        gsi: le32(&r[4..8]),
                        flags: MpsIntiFlags::from_bits(u16::from_le_bytes([r[8], r[9]])),
                    });
                }
                TYPE_LOCAL_APIC_NMI => {
                    need(6)?;
                    madt.nmis.push(LocalApicNmi {
                        processor_id: r[2],
                        flags: MpsIntiFlags::from_bits(u16::from_le_bytes([r[3], r[4]])),
                        lint: r[5],
                    });
                }
                TYPE_LOCAL_APIC_OVERRIDE => {
                    need(12)?;
                    let mut raw = [0u8; 8];
                    raw.copy_from_slice(&r[4..12]);
                    madt.local_apic_override = Some(u64::from_le_bytes(raw));
                }
                other => trace!("skipping MADT record type {other} ({len} bytes)"),
            }
            offset += len;
        }

        debug!(
            "MADT: {} cpu(s), {} IO-APIC(s), {} override(s), {} NMI(s)",
            madt.processors.len(),
            madt.io_apics.len(),
            madt.overrides.len(),
            madt.nmis.len()
        );
        Ok(madt)
    }

    /// The local-APIC base, honouring an address override record.
    #[must_use]
    pub fn local_apic_base(&self) -> u64 {
        self.local_apic_override
            .unwrap_or(u64::from(self.local_apic_address))
    }

    /// The override for ISA IRQ `source`, if the firmware lists one.
    #[must_use]
    pub fn isa_override(&self, source: u8) -> Option<&InterruptSourceOverride> {
        self.overrides
            .iter()
            .find(|o| o.bus == 0 && o.source == source)
    }
}

fn le32(b: &[u8]) -> u32 {
    u32::from_le_bytes([b[0], b[1], b[2], b[3]])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MadtBuilder;

    fn active_low_level() -> MpsIntiFlags {
        MpsIntiFlags::new()
            .with_polarity(IsoPolarity::ActiveLow)
            .with_trigger(IsoTrigger::Level)
    }

    #[test]
    fn decodes_every_record_kind() {
        let table = MadtBuilder::new(0xFEE0_0000)
            .pcat_compat()
            .processor(0, 0, true)
            .processor(1, 1, false)
            .io_apic(2, 0xFEC0_0000, 0)
            .io_apic(3, 0xFEC1_0000, 24)
            .iso(0, 2, MpsIntiFlags::new())
            .iso(9, 9, active_low_level())
            .nmi(ALL_PROCESSORS, 1)
            .unknown(0x7F, 6)
            .build();

        let madt = Madt::parse(&table).expect("valid");
        assert!(madt.flags.pcat_compat());
        assert_eq!(madt.local_apic_base(), 0xFEE0_0000);
        assert_eq!(madt.processors.len(), 2);
        assert!(madt.processors[0].enabled());
        assert!(!madt.processors[1].enabled());
        assert_eq!(
            madt.io_apics,
            vec![
                MadtIoApic { id: 2, address: 0xFEC0_0000, gsi_base: 0 },
                MadtIoApic { id: 3, address: 0xFEC1_0000, gsi_base: 24 },
            ]
        );
        assert_eq!(madt.overrides.len(), 2);
        assert_eq!(madt.isa_override(0).map(|o| o.gsi), Some(2));
        let sci = madt.isa_override(9).expect("sci override");
        assert_eq!(sci.flags.polarity(), IsoPolarity::ActiveLow);
        assert_eq!(sci.flags.trigger(), IsoTrigger::Level);
        assert!(madt.isa_override(1).is_none());
        assert_eq!(madt.nmis.len(), 1);
        assert!(madt.nmis[0].applies_to(7));
        assert_eq!(madt.nmis[0].lint, 1);
    }

    #[test]
    fn address_override_wins() {
        let table = MadtBuilder::new(0xFEE0_0000)
            .local_apic_override(0x1_FEE0_0000)
            .build();
        assert_eq!(Madt::parse(&table).expect("valid").local_apic_base(), 0x1_FEE0_0000);
    }

    #[test]
    fn truncated_record_is_rejected() {
        let mut table = MadtBuilder::new(0xFEE0_0000).io_apic(0, 0xFEC0_0000, 0).build();
        let len = table.len();
        table.truncate(len - 2);
        assert_eq!(
            Madt::parse(&table),
            Err(AcpiError::MalformedMadt { offset: RECORDS_OFFSET })
        );
    }

    #[test]
    fn zero_length_record_is_rejected() {
        let mut table = MadtBuilder::new(0xFEE0_0000).build();
        table.extend_from_slice(&[0, 0]);
        assert!(Madt::parse(&table).is_err());
    }
}
