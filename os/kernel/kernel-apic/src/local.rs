//! # Local APIC (xAPIC, memory-mapped)
//!
//! Registers are 32 bits wide on 16-byte boundaries inside one 4 KiB page.
//!
//! ## Timer
//!
//! The timer decrements the current count at `bus clock / divisor`. In
//! periodic mode it reloads from the initial count and raises
//! [`TIMER_VECTOR`] every time it reaches zero. The initial count for a
//! [`TIMER_TICK_MS`] tick is either measured with
//! [`LocalApic::calibrate_timer`] or derived from [`ASSUMED_BUS_HZ`].

use crate::ioapic::{DeliveryMode, DestinationMode, TriggerMode};
use crate::registers::{MmioMapper, RegisterBlock};
use bitfield_struct::bitfield;
use kernel_memory_addresses::PhysicalAddress;
use log::{debug, info, warn};

/// The architectural default base of the local APIC.
pub const LOCAL_APIC_BASE: u64 = 0xFEE0_0000;

/// Bytes of the register window.
pub const LOCAL_APIC_WINDOW: usize = 0x1000;

pub const REG_ID: usize = 0x020;
pub const REG_VERSION: usize = 0x030;
pub const REG_TPR: usize = 0x080;
pub const REG_EOI: usize = 0x0B0;
pub const REG_SVR: usize = 0x0F0;
pub const REG_ESR: usize = 0x280;
pub const REG_ICR_LOW: usize = 0x300;
pub const REG_ICR_HIGH: usize = 0x310;
pub const REG_LVT_TIMER: usize = 0x320;
pub const REG_LVT_LINT0: usize = 0x350;
pub const REG_LVT_LINT1: usize = 0x360;
pub const REG_LVT_ERROR: usize = 0x370;
pub const REG_TIMER_INITIAL: usize = 0x380;
pub const REG_TIMER_CURRENT: usize = 0x390;
pub const REG_TIMER_DIVIDE: usize = 0x3E0;

/// SVR bit 8: APIC software enable.
const SVR_ENABLE: u32 = 1 << 8;

/// LVT bit 16.
const LVT_MASKED: u32 = 1 << 16;

/// LVT timer bit 17.
const LVT_TIMER_PERIODIC: u32 = 1 << 17;

/// ICR bit 12.
const ICR_DELIVERY_PENDING: u32 = 1 << 12;

pub const SPURIOUS_VECTOR: u8 = 0xFF;
pub const TIMER_VECTOR: u8 = 0xE0;

/// Period of the local-APIC timer.
pub const TIMER_TICK_MS: u32 = 1;

/// Bus clock used when the timer is not calibrated.
pub const ASSUMED_BUS_HZ: u32 = 100_000_000;

const CALIBRATION_MS: u32 = 10;

/// Timer divide configuration. Bit 2 of the ratio lives in bit 3 of the
/// register.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum ApicTimerDivide {
    By1 = 0b1011,
    By2 = 0b0000,
    By4 = 0b0001,
    By8 = 0b0010,
    By16 = 0b0011,
    By32 = 0b1000,
    By64 = 0b1001,
    By128 = 0b1010,
}

impl ApicTimerDivide {
    #[must_use]
    pub const fn ratio(self) -> u32 {
        match self {
            Self::By1 => 1,
            Self::By2 => 2,
            Self::By4 => 4,
            Self::By8 => 8,
            Self::By16 => 16,
            Self::By32 => 32,
            Self::By64 => 64,
            Self::By128 => 128,
        }
    }
}

/// Destination shorthand of an IPI.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum Shorthand {
    /// Use the destination field.
    None = 0b00,
    ToSelf = 0b01,
    AllIncludingSelf = 0b10,
    AllExcludingSelf = 0b11,
}

impl Shorthand {
    const fn into_bits(self) -> u8 {
        self as u8
    }

    const fn from_bits(value: u8) -> Self {
        match value & 0b11 {
            0b00 => Self::None,
            0b01 => Self::ToSelf,
            0b10 => Self::AllIncludingSelf,
            _ => Self::AllExcludingSelf,
        }
    }
}

/// Low dword of the interrupt command register.
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct IcrCommand {
    pub vector: u8,
    #[bits(3)]
    pub delivery_mode: DeliveryMode,
    #[bits(1)]
    pub destination_mode: DestinationMode,
    /// Read-only.
    pub delivery_pending: bool,
    #[bits(1)]
    __: u8,
    /// De-assert is only used by the legacy INIT level de-assert.
    pub assert: bool,
    #[bits(1)]
    pub trigger_mode: TriggerMode,
    #[bits(2)]
    __: u8,
    #[bits(2)]
    pub shorthand: Shorthand,
    #[bits(12)]
    __: u16,
}

impl IcrCommand {
    /// Fixed delivery of `vector` to the destination in ICR high.
    #[must_use]
    pub const fn fixed(vector: u8) -> Self {
        Self::new()
            .with_vector(vector)
            .with_delivery_mode(DeliveryMode::Fixed)
            .with_assert(true)
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum LocalApicError {
    #[error("local APIC reported at {0:#x}, expected 0xfee00000")]
    UnexpectedBase(u64),
    #[error("local APIC register window could not be mapped")]
    MapFailed,
}

/// The local APIC of the executing core.
pub struct LocalApic<R> {
    registers: R,
    timer_initial_count: u32,
}

impl<R: RegisterBlock> LocalApic<R> {
    /// Check `physical_address` against [`LOCAL_APIC_BASE`] and map the
    /// register page. The returned value is ready for
    /// [`initialize`](Self::initialize).
    ///
    /// # Errors
    /// [`LocalApicError::UnexpectedBase`] for any other address (nothing is
    /// mapped), [`LocalApicError::MapFailed`] if mapping fails.
    pub fn prepare<M>(mapper: &mut M, physical_address: u64) -> Result<Self, LocalApicError>
    where
        M: MmioMapper<Registers = R> + ?Sized,
    {
        if physical_address != LOCAL_APIC_BASE {
            warn!("local APIC at {physical_address:#x}, refusing");
            return Err(LocalApicError::UnexpectedBase(physical_address));
        }
        let base = PhysicalAddress::try_from_u64(physical_address).ok_or(LocalApicError::MapFailed)?;
        let registers = mapper
            .map_registers(base, LOCAL_APIC_WINDOW)
            .ok_or(LocalApicError::MapFailed)?;
        debug!("local APIC mapped from {physical_address:#x}");
        Ok(Self::from_registers(registers))
    }

    /// Wrap an already mapped register page.
    #[must_use]
    pub fn from_registers(registers: R) -> Self {
        Self {
            registers,
            timer_initial_count: uncalibrated_initial_count(),
        }
    }

    #[must_use]
    pub const fn registers(&self) -> &R {
        &self.registers
    }

    /// Initial count programmed by [`initialize`](Self::initialize).
    #[must_use]
    pub const fn timer_initial_count(&self) -> u32 {
        self.timer_initial_count
    }

    /// Software-enable the APIC with [`SPURIOUS_VECTOR`], accept every
    /// priority and start the periodic timer.
    pub fn initialize(&mut self) {
        self.registers.write32(REG_TPR, 0);

        let svr = self.registers.read32(REG_SVR);
        self.registers
            .write32(REG_SVR, (svr & !0xFF) | u32::from(SPURIOUS_VECTOR) | SVR_ENABLE);

        self.registers
            .write32(REG_TIMER_DIVIDE, ApicTimerDivide::By16 as u32);
        self.registers
            .write32(REG_LVT_TIMER, u32::from(TIMER_VECTOR) | LVT_TIMER_PERIODIC);
        self.registers
            .write32(REG_TIMER_INITIAL, self.timer_initial_count);

        info!(
            "local APIC {} up: timer vector {TIMER_VECTOR:#x}, every {TIMER_TICK_MS} ms ({} ticks /16)",
            self.read_id(),
            self.timer_initial_count
        );
    }

    /// Measure the timer against `wait_10ms`, which must busy-wait ten
    /// milliseconds on an independent clock. Returns the initial count used
    /// from now on.
    pub fn calibrate_timer(&mut self, wait_10ms: impl FnOnce()) -> u32 {
        self.registers
            .write32(REG_TIMER_DIVIDE, ApicTimerDivide::By16 as u32);
        self.registers
            .write32(REG_LVT_TIMER, u32::from(TIMER_VECTOR) | LVT_MASKED);
        self.registers.write32(REG_TIMER_INITIAL, u32::MAX);

        wait_10ms();

        let elapsed = u32::MAX - self.registers.read32(REG_TIMER_CURRENT);
        self.registers.write32(REG_TIMER_INITIAL, 0);

        let per_ms = elapsed / CALIBRATION_MS;
        if per_ms == 0 {
            warn!("local APIC timer did not advance, keeping {}", self.timer_initial_count);
            return self.timer_initial_count;
        }
        self.timer_initial_count = per_ms.saturating_mul(TIMER_TICK_MS);
        debug!(
            "local APIC bus clock ~{} kHz",
            u64::from(per_ms) * u64::from(ApicTimerDivide::By16.ratio())
        );
        self.timer_initial_count
    }

    /// Signal end of interrupt.
    #[inline]
    pub fn send_eoi(&mut self) {
        self.registers.write32(REG_EOI, 0);
    }

    #[inline]
    #[must_use]
    pub fn read_id(&self) -> u8 {
        self.registers.read32(REG_ID).to_be_bytes()[0]
    }

    #[must_use]
    pub fn version(&self) -> u8 {
        self.registers.read32(REG_VERSION).to_le_bytes()[0]
    }

    /// Spin until the previous IPI has left the ICR. There is no timeout.
    pub fn wait_for_icr_send(&self) {
        while self.registers.read32(REG_ICR_LOW) & ICR_DELIVERY_PENDING != 0 {
            core::hint::spin_loop();
        }
    }

    /// Send `command` to the APIC with id `destination`. Writing the low
    /// dword triggers the send, so the high dword goes first.
    pub fn send_ipi(&mut self, destination: u8, command: IcrCommand) {
        self.wait_for_icr_send();
        self.registers
            .write32(REG_ICR_HIGH, u32::from(destination) << 24);
        self.registers.write32(REG_ICR_LOW, command.into_bits());
    }

    /// Clear and return the error status. The register latches on write.
    pub fn error_status(&mut self) -> u32 {
        self.registers.write32(REG_ESR, 0);
        self.registers.read32(REG_ESR)
    }

    /// Program `LINT0`/`LINT1` as NMI inputs.
    pub fn set_lint_nmi(&mut self, lint: u8) {
        let register = if lint == 0 { REG_LVT_LINT0 } else { REG_LVT_LINT1 };
        self.registers
            .write32(register, u32::from(DeliveryMode::Nmi.into_bits()) << 8);
    }

    pub fn mask_error_vector(&mut self) {
        let lvt = self.registers.read32(REG_LVT_ERROR);
        self.registers.write32(REG_LVT_ERROR, lvt | LVT_MASKED);
    }
}

const fn uncalibrated_initial_count() -> u32 {
    ASSUMED_BUS_HZ / ApicTimerDivide::By16.ratio() / 1000 * TIMER_TICK_MS
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeChip, FakeLocalApic, FakeMmioBus};

    #[test]
    fn prepare_rejects_other_bases() {
        let mut bus = FakeMmioBus::new();
        let result = LocalApic::prepare(&mut bus, 0xFEC0_0000);
        assert!(matches!(result, Err(LocalApicError::UnexpectedBase(0xFEC0_0000))));
        assert!(bus.maps().is_empty());
    }

    #[test]
    fn prepare_maps_the_register_page() {
        let mut bus = FakeMmioBus::new();
        bus.attach(LOCAL_APIC_BASE, FakeChip::Local(FakeLocalApic::new(0)));
        let lapic = LocalApic::prepare(&mut bus, LOCAL_APIC_BASE).expect("default base");
        assert_eq!(bus.maps(), &[(LOCAL_APIC_BASE, LOCAL_APIC_WINDOW)]);
        assert_eq!(lapic.timer_initial_count(), 6250);
    }

    #[test]
    fn prepare_reports_unmappable_window() {
        let mut bus = FakeMmioBus::new();
        assert!(matches!(
            LocalApic::prepare(&mut bus, LOCAL_APIC_BASE),
            Err(LocalApicError::MapFailed)
        ));
    }

    #[test]
    fn initialize_enables_and_starts_periodic_timer() {
        let mut lapic = LocalApic::from_registers(FakeLocalApic::new(3));
        lapic.initialize();
        let regs = lapic.registers();
        assert_eq!(regs.get(REG_SVR), SVR_ENABLE | 0xFF);
        assert_eq!(regs.get(REG_TIMER_DIVIDE), 0b0011);
        assert_eq!(regs.get(REG_LVT_TIMER), 0xE0 | LVT_TIMER_PERIODIC);
        assert_eq!(regs.get(REG_TIMER_INITIAL), uncalibrated_initial_count());
        assert_eq!(regs.get(REG_TPR), 0);
    }

    #[test]
    fn eoi_and_id_are_single_accesses() {
        let mut lapic = LocalApic::from_registers(FakeLocalApic::new(5));
        assert_eq!(lapic.read_id(), 5);
        lapic.send_eoi();
        assert_eq!(lapic.registers().writes(), &[(REG_EOI, 0)]);
    }

    #[test]
    fn icr_wait_polls_until_delivered() {
        let mut fake = FakeLocalApic::new(0);
        fake.hold_icr_pending(3);
        let lapic = LocalApic::from_registers(fake);
        lapic.wait_for_icr_send();
        assert_eq!(lapic.registers().icr_reads(), 4);
        assert!(lapic.registers().writes().is_empty());
    }

    #[test]
    fn ipi_writes_destination_before_command() {
        let mut lapic = LocalApic::from_registers(FakeLocalApic::new(0));
        lapic.send_ipi(2, IcrCommand::fixed(0x40));
        assert_eq!(
            lapic.registers().writes(),
            &[(REG_ICR_HIGH, 2 << 24), (REG_ICR_LOW, 0x40 | (1 << 14))]
        );
    }

    #[test]
    fn calibration_scales_to_the_tick() {
        let mut fake = FakeLocalApic::new(0);
        fake.set_current_count(u32::MAX - 1_000_000);
        let mut lapic = LocalApic::from_registers(fake);
        let mut waited = false;
        let count = lapic.calibrate_timer(|| waited = true);
        assert!(waited);
        assert_eq!(count, 100_000 * TIMER_TICK_MS);
        assert_eq!(lapic.registers().get(REG_TIMER_INITIAL), 0);

        lapic.initialize();
        assert_eq!(lapic.registers().get(REG_TIMER_INITIAL), count);
    }

    #[test]
    fn stalled_timer_keeps_default() {
        let mut fake = FakeLocalApic::new(0);
        fake.set_current_count(u32::MAX);
        let mut lapic = LocalApic::from_registers(fake);
        assert_eq!(lapic.calibrate_timer(|| {}), uncalibrated_initial_count());
    }

    #[test]
    fn icr_layout() {
        let cmd = IcrCommand::new()
            .with_vector(0x08)
            .with_delivery_mode(DeliveryMode::Init)
            .with_destination_mode(DestinationMode::Physical)
            .with_trigger_mode(TriggerMode::Level)
            .with_assert(true)
            .with_shorthand(Shorthand::AllExcludingSelf);
        assert_eq!(cmd.into_bits(), 0x08 | (0b101 << 8) | (1 << 14) | (1 << 15) | (0b11 << 18));
    }
}
