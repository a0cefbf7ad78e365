//! # IO-APIC
//!
//! Each chip exposes two registers in its MMIO window: `IOREGSEL` selects an
//! internal register, `IOWIN` reads or writes it.
//!
//! | Index         | Register                                  |
//! |---------------|-------------------------------------------|
//! | `0x00`        | ID (bits 24..27)                          |
//! | `0x01`        | Version (max redirection entry in 16..23) |
//! | `0x10 + 2n`   | Redirection entry `n`, low dword          |
//! | `0x11 + 2n`   | Redirection entry `n`, high dword         |
//!
//! A chip owns the global system interrupts
//! `[gsi_base, gsi_base + entry_count)`.

use crate::registers::{MmioMapper, RegisterBlock};
use alloc::vec::Vec;
use bitfield_struct::bitfield;
use kernel_memory_addresses::PhysicalAddress;
use log::{debug, info, trace};

/// Byte offset of the register-select register.
pub const IOREGSEL: usize = 0x00;

/// Byte offset of the data window.
pub const IOWIN: usize = 0x10;

/// Bytes of the register window.
pub const IOAPIC_WINDOW: usize = 0x20;

const REG_ID: u32 = 0x00;
const REG_VERSION: u32 = 0x01;
const REG_REDIRECTION_BASE: u32 = 0x10;

/// Vector of ISA IRQ 0; IRQ `n` is delivered at `ISA_VECTOR_BASE + n`.
pub const ISA_VECTOR_BASE: u8 = 0x20;

/// Legacy ISA IRQs `0..16`.
pub const ISA_IRQ_COUNT: u8 = 16;

#[derive(Copy, Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum IoApicError {
    #[error("IO-APIC {id} register window at {address:#x} could not be mapped")]
    MapFailed { id: u8, address: u32 },
    #[error("no IO-APIC handles IRQ {0}")]
    NoChipForIrq(u32),
}

/// How an interrupt is delivered to its destination.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum DeliveryMode {
    Fixed = 0b000,
    LowestPriority = 0b001,
    Smi = 0b010,
    Reserved = 0b011,
    Nmi = 0b100,
    Init = 0b101,
    /// Inter-processor only.
    StartUp = 0b110,
    ExtInt = 0b111,
}

impl DeliveryMode {
    pub(crate) const fn into_bits(self) -> u8 {
        self as u8
    }

    pub(crate) const fn from_bits(value: u8) -> Self {
        match value & 0b111 {
            0b000 => Self::Fixed,
            0b001 => Self::LowestPriority,
            0b010 => Self::Smi,
            0b011 => Self::Reserved,
            0b100 => Self::Nmi,
            0b101 => Self::Init,
            0b110 => Self::StartUp,
            _ => Self::ExtInt,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum DestinationMode {
    /// Destination is an APIC id.
    Physical = 0,
    /// Destination is a logical set of APICs.
    Logical = 1,
}

impl DestinationMode {
    pub(crate) const fn into_bits(self) -> u8 {
        self as u8
    }

    pub(crate) const fn from_bits(value: u8) -> Self {
        if value & 1 == 0 { Self::Physical } else { Self::Logical }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum PinPolarity {
    ActiveHigh = 0,
    ActiveLow = 1,
}

impl PinPolarity {
    const fn into_bits(self) -> u8 {
        self as u8
    }

    const fn from_bits(value: u8) -> Self {
        if value & 1 == 0 { Self::ActiveHigh } else { Self::ActiveLow }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum TriggerMode {
    Edge = 0,
    Level = 1,
}

impl TriggerMode {
    pub(crate) const fn into_bits(self) -> u8 {
        self as u8
    }

    pub(crate) const fn from_bits(value: u8) -> Self {
        if value & 1 == 0 { Self::Edge } else { Self::Level }
    }
}

/// One 64-bit redirection-table entry.
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct RedirectionEntry {
    pub vector: u8,
    #[bits(3)]
    pub delivery_mode: DeliveryMode,
    #[bits(1)]
    pub destination_mode: DestinationMode,
    /// Read-only: the interrupt is waiting to be delivered.
    pub delivery_pending: bool,
    #[bits(1)]
    pub polarity: PinPolarity,
    /// Read-only: a level-triggered interrupt was accepted, EOI outstanding.
    pub remote_irr: bool,
    #[bits(1)]
    pub trigger_mode: TriggerMode,
    pub masked: bool,
    #[bits(39)]
    __: u64,
    /// APIC id in physical mode.
    pub destination: u8,
}

impl RedirectionEntry {
    /// Bit 16 of the low dword.
    pub const MASK_BIT: u32 = 1 << 16;

    /// Fixed delivery of `vector` to the local APIC `destination`, edge
    /// triggered, active high, masked.
    #[must_use]
    pub const fn fixed(vector: u8, destination: u8) -> Self {
        Self::new()
            .with_vector(vector)
            .with_delivery_mode(DeliveryMode::Fixed)
            .with_destination_mode(DestinationMode::Physical)
            .with_polarity(PinPolarity::ActiveHigh)
            .with_trigger_mode(TriggerMode::Edge)
            .with_masked(true)
            .with_destination(destination)
    }

    /// The default route for ISA IRQ `source`.
    #[must_use]
    pub const fn isa(source: u8, destination: u8) -> Self {
        Self::fixed(ISA_VECTOR_BASE.wrapping_add(source), destination)
    }

    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn low(self) -> u32 {
        self.into_bits() as u32
    }

    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn high(self) -> u32 {
        (self.into_bits() >> 32) as u32
    }

    #[must_use]
    pub fn from_dwords(low: u32, high: u32) -> Self {
        Self::from_bits((u64::from(high) << 32) | u64::from(low))
    }
}

/// One IO-APIC.
pub struct IoApic<R> {
    id: u8,
    address: PhysicalAddress,
    gsi_base: u32,
    entry_count: u32,
    version: u8,
    registers: R,
}

impl<R: RegisterBlock> IoApic<R> {
    /// Map the chip at `address` and read the size of its redirection table.
    ///
    /// # Errors
    /// [`IoApicError::MapFailed`] if the window cannot be mapped.
    pub fn create<M>(
        mapper: &mut M,
        id: u8,
        address: PhysicalAddress,
        gsi_base: u32,
    ) -> Result<Self, IoApicError>
    where
        M: MmioMapper<Registers = R> + ?Sized,
    {
        let registers = mapper
            .map_registers(address, IOAPIC_WINDOW)
            .ok_or(IoApicError::MapFailed {
                id,
                address: address.as_u32(),
            })?;
        Ok(Self::from_registers(registers, id, address, gsi_base))
    }

    /// Wrap an already mapped window.
    #[must_use]
    pub fn from_registers(registers: R, id: u8, address: PhysicalAddress, gsi_base: u32) -> Self {
        let mut chip = Self {
            id,
            address,
            gsi_base,
            entry_count: 0,
            version: 0,
            registers,
        };
        let version = chip.read_register(REG_VERSION);
        chip.entry_count = ((version >> 16) & 0xFF) + 1;
        chip.version = version.to_le_bytes()[0];
        info!(
            "IO-APIC {id} at {:#010x}: version {:#x}, GSIs {}..{}",
            address.as_u32(),
            chip.version,
            gsi_base,
            gsi_base.saturating_add(chip.entry_count)
        );
        chip
    }

    #[must_use]
    pub const fn id(&self) -> u8 {
        self.id
    }

    #[must_use]
    pub const fn address(&self) -> PhysicalAddress {
        self.address
    }

    #[must_use]
    pub const fn gsi_base(&self) -> u32 {
        self.gsi_base
    }

    /// Number of redirection entries.
    #[must_use]
    pub const fn entry_count(&self) -> u32 {
        self.entry_count
    }

    #[must_use]
    pub const fn version(&self) -> u8 {
        self.version
    }

    /// The ID register as the chip reports it.
    #[must_use]
    pub fn hardware_id(&mut self) -> u8 {
        self.read_register(REG_ID).to_be_bytes()[0] & 0x0F
    }

    #[must_use]
    pub const fn registers(&self) -> &R {
        &self.registers
    }

    /// `true` if `gsi` falls in `[gsi_base, gsi_base + entry_count)`.
    #[must_use]
    pub const fn handles(&self, gsi: u32) -> bool {
        gsi >= self.gsi_base && gsi - self.gsi_base < self.entry_count
    }

    fn read_register(&mut self, index: u32) -> u32 {
        self.registers.write32(IOREGSEL, index);
        self.registers.read32(IOWIN)
    }

    fn write_register(&mut self, index: u32, value: u32) {
        self.registers.write32(IOREGSEL, index);
        self.registers.write32(IOWIN, value);
    }

    const fn low_index(pin: u32) -> u32 {
        REG_REDIRECTION_BASE + 2 * pin
    }

    fn pin_of(&self, gsi: u32) -> Result<u32, IoApicError> {
        if self.handles(gsi) {
            Ok(gsi - self.gsi_base)
        } else {
            Err(IoApicError::NoChipForIrq(gsi))
        }
    }

    /// Read the entry for `gsi`.
    ///
    /// # Errors
    /// [`IoApicError::NoChipForIrq`] if this chip does not own `gsi`.
    pub fn read_entry(&mut self, gsi: u32) -> Result<RedirectionEntry, IoApicError> {
        let pin = self.pin_of(gsi)?;
        let low = self.read_register(Self::low_index(pin));
        let high = self.read_register(Self::low_index(pin) + 1);
        Ok(RedirectionEntry::from_dwords(low, high))
    }

    /// Write the entry for `gsi`: high dword first, then the low dword that
    /// carries the mask bit.
    ///
    /// # Errors
    /// [`IoApicError::NoChipForIrq`] if this chip does not own `gsi`.
    pub fn write_entry(&mut self, gsi: u32, entry: RedirectionEntry) -> Result<(), IoApicError> {
        let pin = self.pin_of(gsi)?;
        trace!("IO-APIC {} pin {pin}: {:#018x}", self.id, entry.into_bits());
        self.write_register(Self::low_index(pin) + 1, entry.high());
        self.write_register(Self::low_index(pin), entry.low());
        Ok(())
    }

    /// Set or clear the mask bit of `gsi`, leaving every other bit as read.
    ///
    /// # Errors
    /// [`IoApicError::NoChipForIrq`] if this chip does not own `gsi`.
    pub fn set_masked(&mut self, gsi: u32, masked: bool) -> Result<(), IoApicError> {
        let index = Self::low_index(self.pin_of(gsi)?);
        let low = self.read_register(index);
        let low = if masked {
            low | RedirectionEntry::MASK_BIT
        } else {
            low & !RedirectionEntry::MASK_BIT
        };
        self.write_register(index, low);
        Ok(())
    }

    /// Mask every entry. Firmware may leave entries live.
    pub fn mask_all(&mut self) {
        for pin in 0..self.entry_count {
            let index = Self::low_index(pin);
            let low = self.read_register(index);
            self.write_register(index, low | RedirectionEntry::MASK_BIT);
        }
    }
}

/// Index of a chip in an [`IoApicSet`].
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct IoApicHandle(usize);

impl IoApicHandle {
    #[must_use]
    pub const fn index(self) -> usize {
        self.0
    }
}

/// Every IO-APIC in the machine, in creation order.
pub struct IoApicSet<R> {
    chips: Vec<IoApic<R>>,
}

impl<R> Default for IoApicSet<R> {
    fn default() -> Self {
        Self { chips: Vec::new() }
    }
}

impl<R: RegisterBlock> IoApicSet<R> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Map and register a chip.
    ///
    /// # Errors
    /// [`IoApicError::MapFailed`] if the window cannot be mapped.
    pub fn create<M>(
        &mut self,
        mapper: &mut M,
        id: u8,
        address: PhysicalAddress,
        gsi_base: u32,
    ) -> Result<IoApicHandle, IoApicError>
    where
        M: MmioMapper<Registers = R> + ?Sized,
    {
        let chip = IoApic::create(mapper, id, address, gsi_base)?;
        Ok(self.push(chip))
    }

    pub fn push(&mut self, chip: IoApic<R>) -> IoApicHandle {
        self.chips.push(chip);
        IoApicHandle(self.chips.len() - 1)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.chips.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.chips.is_empty()
    }

    #[must_use]
    pub fn get(&self, handle: IoApicHandle) -> Option<&IoApic<R>> {
        self.chips.get(handle.0)
    }

    pub fn get_mut(&mut self, handle: IoApicHandle) -> Option<&mut IoApic<R>> {
        self.chips.get_mut(handle.0)
    }

    pub fn iter(&self) -> impl Iterator<Item = &IoApic<R>> {
        self.chips.iter()
    }

    /// Look a chip up by its MADT id.
    #[must_use]
    pub fn by_id(&self, id: u8) -> Option<IoApicHandle> {
        self.chips.iter().position(|c| c.id == id).map(IoApicHandle)
    }

    /// The chip whose GSI range contains `irq`.
    #[must_use]
    pub fn owner_of(&self, irq: u32) -> Option<IoApicHandle> {
        self.chips.iter().position(|c| c.handles(irq)).map(IoApicHandle)
    }

    fn owner_mut(&mut self, irq: u32) -> Result<&mut IoApic<R>, IoApicError> {
        self.chips
            .iter_mut()
            .find(|c| c.handles(irq))
            .ok_or(IoApicError::NoChipForIrq(irq))
    }

    /// Write `entry` for global interrupt `irq` on whichever chip owns it.
    ///
    /// # Errors
    /// [`IoApicError::NoChipForIrq`] if no chip owns `irq`. No register is
    /// written in that case.
    pub fn create_redirection_entry(
        &mut self,
        irq: u32,
        entry: RedirectionEntry,
    ) -> Result<IoApicHandle, IoApicError> {
        let handle = self.owner_of(irq).ok_or(IoApicError::NoChipForIrq(irq))?;
        self.chips[handle.0].write_entry(irq, entry)?;
        Ok(handle)
    }

    /// Route ISA IRQ `source`, arriving on global interrupt `irq`, to vector
    /// `ISA_VECTOR_BASE + source` on local APIC `destination`. The entry is
    /// left masked.
    ///
    /// # Errors
    /// [`IoApicError::NoChipForIrq`] if no chip owns `irq`. No register is
    /// written in that case.
    pub fn create_isa_redirection_entry(
        &mut self,
        source: u8,
        irq: u32,
        destination: u8,
    ) -> Result<IoApicHandle, IoApicError> {
        debug!("ISA IRQ {source} -> GSI {irq} -> APIC {destination}");
        self.create_redirection_entry(irq, RedirectionEntry::isa(source, destination))
    }

    /// # Errors
    /// [`IoApicError::NoChipForIrq`] if no chip owns `irq`.
    pub fn mask_irq(&mut self, irq: u32) -> Result<(), IoApicError> {
        self.owner_mut(irq)?.set_masked(irq, true)
    }

    /// # Errors
    /// [`IoApicError::NoChipForIrq`] if no chip owns `irq`.
    pub fn unmask_irq(&mut self, irq: u32) -> Result<(), IoApicError> {
        self.owner_mut(irq)?.set_masked(irq, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeIoApic;

    fn chip(id: u8, entries: u32, gsi_base: u32) -> IoApic<FakeIoApic> {
        IoApic::from_registers(
            FakeIoApic::new(id, entries),
            id,
            PhysicalAddress::new(0xFEC0_0000),
            gsi_base,
        )
    }

    #[test]
    fn entry_count_comes_from_version_register() {
        let mut c = chip(2, 24, 0);
        assert_eq!(c.entry_count(), 24);
        assert_eq!(c.version(), 0x20);
        assert_eq!(c.hardware_id(), 2);
        assert!(c.handles(0));
        assert!(c.handles(23));
        assert!(!c.handles(24));
    }

    #[test]
    fn gsi_base_near_the_top_does_not_overflow() {
        // Format the log arguments even without a logger.
        log::set_max_level(log::LevelFilter::Trace);
        let c = chip(3, 24, u32::MAX - 8);
        assert_eq!(c.entry_count(), 24);
        assert!(c.handles(u32::MAX - 8));
        assert!(c.handles(u32::MAX));
        assert!(!c.handles(u32::MAX - 9));
    }

    #[test]
    fn entry_layout_matches_hardware() {
        let e = RedirectionEntry::isa(1, 3)
            .with_polarity(PinPolarity::ActiveLow)
            .with_trigger_mode(TriggerMode::Level);
        assert_eq!(e.low(), 0x21 | (1 << 13) | (1 << 15) | (1 << 16));
        assert_eq!(e.high(), 3 << 24);
        assert_eq!(RedirectionEntry::from_dwords(e.low(), e.high()), e);
    }

    #[test]
    fn entry_is_written_as_two_dwords_high_first() {
        let mut c = chip(0, 24, 0);
        c.registers.clear_log();
        c.write_entry(4, RedirectionEntry::isa(4, 1)).expect("owned");
        assert_eq!(
            c.registers().data_writes(),
            &[(0x19, 1 << 24), (0x18, 0x24 | RedirectionEntry::MASK_BIT)]
        );
    }

    #[test]
    fn mask_toggles_only_bit_sixteen() {
        let mut set = IoApicSet::new();
        set.push(chip(0, 24, 0));
        let live = RedirectionEntry::fixed(0x41, 7)
            .with_trigger_mode(TriggerMode::Level)
            .with_masked(false);
        set.create_redirection_entry(9, live).expect("owned");

        set.mask_irq(9).expect("owned");
        let masked = set.chips[0].registers().redirection(9);
        assert_eq!(masked, live.into_bits() | u64::from(RedirectionEntry::MASK_BIT));

        set.unmask_irq(9).expect("owned");
        assert_eq!(set.chips[0].registers().redirection(9), live.into_bits());
    }

    #[test]
    fn irq_is_routed_to_the_owning_chip() {
        let mut set = IoApicSet::new();
        let a = set.push(chip(0, 24, 0));
        let b = set.push(chip(1, 8, 24));
        assert_eq!(set.owner_of(3), Some(a));
        assert_eq!(set.owner_of(30), Some(b));
        assert_eq!(set.by_id(1), Some(b));

        assert_eq!(set.create_isa_redirection_entry(5, 27, 0), Ok(b));
        let e = RedirectionEntry::from_bits(set.chips[1].registers().redirection(3));
        assert_eq!(e.vector(), ISA_VECTOR_BASE + 5);
        assert!(e.masked());
    }

    #[test]
    fn unowned_irq_fails_without_writes() {
        let mut set = IoApicSet::new();
        set.push(chip(0, 24, 0));
        set.push(chip(1, 8, 32));
        for c in &mut set.chips {
            c.registers.clear_log();
        }

        assert_eq!(
            set.create_isa_redirection_entry(0, 24, 0),
            Err(IoApicError::NoChipForIrq(24))
        );
        assert_eq!(set.mask_irq(40), Err(IoApicError::NoChipForIrq(40)));
        assert!(set.iter().all(|c| c.registers().window_writes() == 0));
    }

    #[test]
    fn mask_all_masks_every_pin() {
        let mut fake = FakeIoApic::new(0, 4);
        for pin in 0..4 {
            fake.set_redirection(pin, RedirectionEntry::fixed(0x30, 0).with_masked(false).into_bits());
        }
        let mut c = IoApic::from_registers(fake, 0, PhysicalAddress::new(0xFEC0_0000), 0);
        c.mask_all();
        for gsi in 0..4 {
            assert!(c.read_entry(gsi).expect("owned").masked());
        }
    }
}
