//! # Interrupt Topology
//!
//! Reads the MADT and programs the interrupt controllers it lists: the local
//! APIC of the boot processor, then every IO-APIC with the sixteen ISA IRQs
//! routed to the boot processor, masked, honouring interrupt source
//! overrides.
//!
//! Missing firmware tables are not fatal. The caller keeps the legacy PIC.

use crate::bootstrap::{Bootstrap, Mapped};
use crate::error::TopologyError;
use crate::windows::{MmioWindow, TemporaryMapper};
use kernel_acpi::{AcpiTables, IsoPolarity, IsoTrigger, Madt, PhysMapRo};
use kernel_apic::{
    ISA_IRQ_COUNT, IoApicSet, LOCAL_APIC_BASE, LocalApic, Mmio, MmioMapper, PinPolarity,
    RedirectionEntry, RegisterBlock, TIMER_VECTOR, TriggerMode,
};
use kernel_info::setup::{
    AcpiTableRecord, IoApicRecord, MAX_ACPI_TABLES, MAX_IO_APICS, PlatformInfo,
};
use kernel_memory_addresses::PhysicalAddress;
use kernel_vmem::{PhysMapper, VirtualAccess};
use log::{debug, info, warn};

/// The programmed controllers.
pub struct InterruptTopology<R> {
    pub local_apic: LocalApic<R>,
    pub io_apics: IoApicSet<R>,
    /// APIC id of the boot processor, the destination of every ISA route.
    pub boot_apic_id: u8,
    /// ISA IRQs that received a redirection entry.
    pub routed_isa_irqs: u32,
}

impl<R: RegisterBlock> InterruptTopology<R> {
    /// Note the boot processor's APIC and every IO-APIC in `platform`.
    pub fn record(&self, platform: &mut PlatformInfo) {
        platform.local_apic_base = LOCAL_APIC_BASE;
        platform.boot_apic_id = self.boot_apic_id;
        platform.timer_vector = TIMER_VECTOR;
        platform.timer_initial_count = self.local_apic.timer_initial_count();
        for chip in self.io_apics.iter() {
            let record = IoApicRecord {
                id: chip.id(),
                address: chip.address(),
                gsi_base: chip.gsi_base(),
                entry_count: chip.entry_count(),
            };
            if !platform.push_io_apic(record) {
                warn!("only the first {MAX_IO_APICS} IO-APICs are handed over");
                break;
            }
        }
    }
}

/// Locate the RSDP, walk the root table, note every valid table in
/// `platform` and decode the MADT.
///
/// Returns `None`, after logging why, if the firmware provides no usable
/// MADT.
pub fn discover_madt<M: PhysMapRo + ?Sized>(mapper: &mut M, platform: &mut PlatformInfo) -> Option<Madt> {
    let tables = AcpiTables::discover(mapper)
        .inspect_err(|e| warn!("no ACPI tables: {e}"))
        .ok()?;
    debug!("{} ACPI table(s) listed", tables.len());
    record_tables(&tables, platform);
    tables
        .madt(mapper)
        .inspect_err(|e| warn!("no usable MADT: {e}"))
        .ok()
}

fn record_tables(tables: &AcpiTables, platform: &mut PlatformInfo) {
    platform.rsdp = tables.rsdp().paddr;
    platform.root_table = tables.root().paddr();
    for entry in tables.entries() {
        let record = AcpiTableRecord {
            signature: *entry.signature.as_bytes(),
            length: entry.length,
            address: entry.paddr,
        };
        if !platform.push_table(record) {
            warn!("only the first {MAX_ACPI_TABLES} ACPI tables are handed over");
            break;
        }
    }
}

/// Bring up the local APIC and every IO-APIC in `madt`.
///
/// # Errors
/// - [`TopologyError::LocalApic`] if the local APIC is not at the
///   architectural base or cannot be mapped.
/// - [`TopologyError::IoApic`] if an IO-APIC window cannot be mapped.
pub fn bring_up_interrupts<M>(
    madt: &Madt,
    mmio: &mut M,
) -> Result<InterruptTopology<M::Registers>, TopologyError>
where
    M: MmioMapper + ?Sized,
{
    let mut local_apic = LocalApic::prepare(mmio, madt.local_apic_base())?;
    local_apic.initialize();
    let boot_apic_id = local_apic.read_id();

    let processor_id = madt
        .processors
        .iter()
        .find(|p| p.apic_id == boot_apic_id)
        .map(|p| p.processor_id);
    if processor_id.is_none() {
        warn!("boot APIC {boot_apic_id} is not listed in the MADT");
    }
    for nmi in &madt.nmis {
        if processor_id.is_some_and(|id| nmi.applies_to(id)) {
            debug!("NMI on LINT{}", nmi.lint);
            local_apic.set_lint_nmi(nmi.lint);
        }
    }

    let mut io_apics = IoApicSet::new();
    for chip in &madt.io_apics {
        io_apics.create(
            mmio,
            chip.id,
            PhysicalAddress::new(chip.address),
            chip.gsi_base,
        )?;
    }

    let routed_isa_irqs = route_isa_irqs(&mut io_apics, madt, boot_apic_id);
    info!(
        "{} IO-APIC(s), {routed_isa_irqs} ISA IRQs routed to APIC {boot_apic_id}",
        io_apics.len()
    );
    Ok(InterruptTopology {
        local_apic,
        io_apics,
        boot_apic_id,
        routed_isa_irqs,
    })
}

/// Route ISA IRQs 0..16 to `destination`, masked. Returns how many were
/// routed.
///
/// An IRQ without a chip is logged and skipped. So is an IRQ whose identity
/// GSI another source was moved onto, which is how the PIC cascade line
/// usually disappears behind the timer.
pub fn route_isa_irqs<R: RegisterBlock>(set: &mut IoApicSet<R>, madt: &Madt, destination: u8) -> u32 {
    let mut routed = 0;
    for source in 0..ISA_IRQ_COUNT {
        let mut entry = RedirectionEntry::isa(source, destination);
        let gsi = match madt.isa_override(source) {
            Some(iso) => {
                entry = entry
                    .with_polarity(pin_polarity(iso.flags.polarity()))
                    .with_trigger_mode(trigger_mode(iso.flags.trigger()));
                iso.gsi
            }
            None => {
                let gsi = u32::from(source);
                if madt
                    .overrides
                    .iter()
                    .any(|o| o.bus == 0 && o.source != source && o.gsi == gsi)
                {
                    debug!("ISA IRQ {source}: GSI {gsi} taken by an override");
                    continue;
                }
                gsi
            }
        };

        match set.create_redirection_entry(gsi, entry) {
            Ok(_) => routed += 1,
            Err(e) => warn!("ISA IRQ {source}: {e}"),
        }
    }
    routed
}

impl<M: PhysMapper, V: VirtualAccess> Bootstrap<'_, M, Mapped<'_, V>> {
    /// [`discover_madt`] through the temporary window, recorded for the
    /// kernel.
    pub fn discover_madt(&mut self) -> Option<Madt> {
        let Mapped {
            frames,
            space,
            platform,
            ..
        } = self.state_mut();
        discover_madt(&mut TemporaryMapper::new(frames, space), platform)
    }

    /// [`bring_up_interrupts`] through the MMIO window, recorded for the
    /// kernel.
    ///
    /// # Errors
    /// See [`bring_up_interrupts`].
    pub fn bring_up_interrupts(&mut self, madt: &Madt) -> Result<InterruptTopology<Mmio>, TopologyError> {
        let Mapped {
            frames,
            space,
            mmio_used,
            platform,
        } = self.state_mut();
        let topology = bring_up_interrupts(madt, &mut MmioWindow::new(frames, space, mmio_used))?;
        topology.record(platform);
        Ok(topology)
    }
}

/// ISA lines are active high unless the firmware says otherwise.
const fn pin_polarity(polarity: IsoPolarity) -> PinPolarity {
    match polarity {
        IsoPolarity::ActiveLow => PinPolarity::ActiveLow,
        IsoPolarity::ConformsToBus | IsoPolarity::ActiveHigh | IsoPolarity::Reserved => {
            PinPolarity::ActiveHigh
        }
    }
}

/// ISA lines are edge triggered unless the firmware says otherwise.
const fn trigger_mode(trigger: IsoTrigger) -> TriggerMode {
    match trigger {
        IsoTrigger::Level => TriggerMode::Level,
        IsoTrigger::ConformsToBus | IsoTrigger::Edge | IsoTrigger::Reserved => TriggerMode::Edge,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_acpi::MpsIntiFlags;
    use kernel_acpi::testing::MadtBuilder;
    use kernel_apic::testing::{FakeChip, FakeIoApic, FakeLocalApic, FakeMmioBus};
    use kernel_apic::{ISA_VECTOR_BASE, LOCAL_APIC_BASE, LocalApicError};

    const IOAPIC_BASE: u32 = 0xFEC0_0000;

    fn level_low() -> MpsIntiFlags {
        MpsIntiFlags::new()
            .with_polarity(IsoPolarity::ActiveLow)
            .with_trigger(IsoTrigger::Level)
    }

    fn madt(builder: &MadtBuilder) -> Madt {
        Madt::parse(&builder.build()).expect("valid MADT")
    }

    #[test]
    fn isa_irqs_follow_the_overrides() {
        let madt = madt(
            &MadtBuilder::new(0xFEE0_0000)
                .processor(0, 3, true)
                .io_apic(1, IOAPIC_BASE, 0)
                .iso(0, 2, MpsIntiFlags::new())
                .iso(9, 9, level_low())
                .nmi(0xFF, 1),
        );
        let mut bus = FakeMmioBus::new();
        let lapic = bus.attach(LOCAL_APIC_BASE, FakeChip::Local(FakeLocalApic::new(3)));
        let ioapic = bus.attach(u64::from(IOAPIC_BASE), FakeChip::Io(FakeIoApic::new(1, 24)));

        let topology = bring_up_interrupts(&madt, &mut bus).expect("topology");
        assert_eq!(topology.boot_apic_id, 3);
        assert_eq!(topology.io_apics.len(), 1);
        // IRQ 2 loses its line to the timer.
        assert_eq!(topology.routed_isa_irqs, 15);

        ioapic.io(|chip| {
            let timer = RedirectionEntry::from_bits(chip.redirection(2));
            assert_eq!(timer.vector(), ISA_VECTOR_BASE);
            assert_eq!(timer.destination(), 3);
            assert!(timer.masked());
            assert_eq!(timer.trigger_mode(), TriggerMode::Edge);

            let sci = RedirectionEntry::from_bits(chip.redirection(9));
            assert_eq!(sci.vector(), ISA_VECTOR_BASE + 9);
            assert_eq!(sci.polarity(), PinPolarity::ActiveLow);
            assert_eq!(sci.trigger_mode(), TriggerMode::Level);

            let keyboard = RedirectionEntry::from_bits(chip.redirection(1));
            assert_eq!(keyboard.vector(), ISA_VECTOR_BASE + 1);
            assert_eq!(keyboard.polarity(), PinPolarity::ActiveHigh);

            // Pins past the ISA range stay untouched.
            assert!(RedirectionEntry::from_bits(chip.redirection(16)).masked());
            assert_eq!(RedirectionEntry::from_bits(chip.redirection(16)).vector(), 0);
        });
        lapic.local(|chip| {
            assert!(chip.writes().iter().any(|&(reg, _)| reg == 0x360));
            assert!(!chip.writes().iter().any(|&(reg, _)| reg == 0x350));
        });
    }

    #[test]
    fn irqs_without_a_chip_are_skipped() {
        let madt = madt(
            &MadtBuilder::new(0xFEE0_0000)
                .processor(0, 0, true)
                .io_apic(1, IOAPIC_BASE, 0),
        );
        let mut bus = FakeMmioBus::new();
        bus.attach(LOCAL_APIC_BASE, FakeChip::Local(FakeLocalApic::new(0)));
        let ioapic = bus.attach(u64::from(IOAPIC_BASE), FakeChip::Io(FakeIoApic::new(1, 8)));

        let topology = bring_up_interrupts(&madt, &mut bus).expect("topology");
        assert_eq!(topology.routed_isa_irqs, 8);
        ioapic.io(|chip| {
            assert_eq!(
                RedirectionEntry::from_bits(chip.redirection(7)).vector(),
                ISA_VECTOR_BASE + 7
            );
        });
    }

    #[test]
    fn relocated_local_apic_is_refused() {
        let madt = madt(&MadtBuilder::new(0xFEE0_0000).local_apic_override(0x1_0000_0000));
        let mut bus = FakeMmioBus::new();
        assert!(matches!(
            bring_up_interrupts(&madt, &mut bus),
            Err(TopologyError::LocalApic(LocalApicError::UnexpectedBase(0x1_0000_0000)))
        ));
        assert!(bus.maps().is_empty());
    }

    #[test]
    fn no_firmware_means_no_madt() {
        let mut firmware = kernel_acpi::testing::FirmwareMemory::new(0x10_0000);
        let mut platform = PlatformInfo::empty();
        assert!(discover_madt(&mut firmware, &mut platform).is_none());
        assert!(firmware.all_unmapped());
        assert!(!platform.has_acpi());
    }

    #[test]
    fn programmed_controllers_are_recorded() {
        let madt = madt(
            &MadtBuilder::new(0xFEE0_0000)
                .processor(0, 3, true)
                .io_apic(1, IOAPIC_BASE, 0)
                .io_apic(4, IOAPIC_BASE + 0x1000, 24),
        );
        let mut bus = FakeMmioBus::new();
        bus.attach(LOCAL_APIC_BASE, FakeChip::Local(FakeLocalApic::new(3)));
        bus.attach(u64::from(IOAPIC_BASE), FakeChip::Io(FakeIoApic::new(1, 24)));
        bus.attach(
            u64::from(IOAPIC_BASE + 0x1000),
            FakeChip::Io(FakeIoApic::new(4, 16)),
        );
        let topology = bring_up_interrupts(&madt, &mut bus).expect("topology");

        let mut platform = PlatformInfo::empty();
        topology.record(&mut platform);
        assert_eq!(platform.local_apic_base, LOCAL_APIC_BASE);
        assert_eq!(platform.boot_apic_id, 3);
        assert_eq!(platform.timer_vector, TIMER_VECTOR);
        assert_eq!(
            platform.timer_initial_count,
            topology.local_apic.timer_initial_count()
        );
        assert_eq!(
            platform.io_apics(),
            &[
                IoApicRecord {
                    id: 1,
                    address: PhysicalAddress::new(IOAPIC_BASE),
                    gsi_base: 0,
                    entry_count: 24,
                },
                IoApicRecord {
                    id: 4,
                    address: PhysicalAddress::new(IOAPIC_BASE + 0x1000),
                    gsi_base: 24,
                    entry_count: 16,
                },
            ]
        );
        assert_eq!(platform.io_apic_for_gsi(30).map(|c| c.id), Some(4));
    }
}
