//! In-memory register files for host-side tests.

use crate::ioapic::{IOREGSEL, IOWIN, RedirectionEntry};
use crate::local::{REG_ICR_LOW, REG_ID, REG_TIMER_CURRENT};
use crate::registers::{MmioMapper, RegisterBlock};
use alloc::rc::Rc;
use alloc::vec::Vec;
use core::cell::{Cell, RefCell};
use kernel_memory_addresses::PhysicalAddress;

const ICR_DELIVERY_PENDING: u32 = 1 << 12;

/// A local-APIC register page that records every write.
pub struct FakeLocalApic {
    registers: Vec<u32>,
    writes: Vec<(usize, u32)>,
    icr_pending_polls: Cell<u32>,
    icr_reads: Cell<u32>,
    current_count: u32,
}

impl FakeLocalApic {
    #[must_use]
    pub fn new(apic_id: u8) -> Self {
        let mut registers = alloc::vec![0; 0x400];
        registers[REG_ID / 4] = u32::from(apic_id) << 24;
        Self {
            registers,
            writes: Vec::new(),
            icr_pending_polls: Cell::new(0),
            icr_reads: Cell::new(0),
            current_count: 0,
        }
    }

    /// Report the ICR as busy for the next `polls` reads.
    pub fn hold_icr_pending(&mut self, polls: u32) {
        self.icr_pending_polls.set(polls);
    }

    pub const fn set_current_count(&mut self, count: u32) {
        self.current_count = count;
    }

    #[must_use]
    pub fn get(&self, offset: usize) -> u32 {
        self.registers[offset / 4]
    }

    #[must_use]
    pub fn writes(&self) -> &[(usize, u32)] {
        &self.writes
    }

    #[must_use]
    pub fn icr_reads(&self) -> u32 {
        self.icr_reads.get()
    }
}

impl RegisterBlock for FakeLocalApic {
    fn read32(&self, offset: usize) -> u32 {
        match offset {
            REG_TIMER_CURRENT => self.current_count,
            REG_ICR_LOW => {
                self.icr_reads.set(self.icr_reads.get() + 1);
                let pending = self.icr_pending_polls.get();
                let value = self.registers[offset / 4] & !ICR_DELIVERY_PENDING;
                if pending > 0 {
                    self.icr_pending_polls.set(pending - 1);
                    value | ICR_DELIVERY_PENDING
                } else {
                    value
                }
            }
            _ => self.registers[offset / 4],
        }
    }

    fn write32(&mut self, offset: usize, value: u32) {
        self.writes.push((offset, value));
        self.registers[offset / 4] = value;
    }
}

/// An IO-APIC honouring the `IOREGSEL`/`IOWIN` protocol.
pub struct FakeIoApic {
    select: u32,
    registers: Vec<u32>,
    data_writes: Vec<(u32, u32)>,
    window_writes: usize,
}

impl FakeIoApic {
    /// A chip with `entries` redirection entries, all masked.
    ///
    /// # Panics
    /// If `entries` is zero or above 256.
    #[must_use]
    pub fn new(id: u8, entries: u32) -> Self {
        assert!((1..=256).contains(&entries));
        let mut registers = alloc::vec![0; 0x10 + 2 * entries as usize];
        registers[0] = u32::from(id) << 24;
        registers[1] = ((entries - 1) << 16) | 0x20;
        for pin in 0..entries as usize {
            registers[0x10 + 2 * pin] = RedirectionEntry::MASK_BIT;
        }
        Self {
            select: 0,
            registers,
            data_writes: Vec::new(),
            window_writes: 0,
        }
    }

    /// The 64-bit entry of `pin`.
    #[must_use]
    pub fn redirection(&self, pin: u32) -> u64 {
        let low = self.registers[0x10 + 2 * pin as usize];
        let high = self.registers[0x11 + 2 * pin as usize];
        (u64::from(high) << 32) | u64::from(low)
    }

    #[allow(clippy::cast_possible_truncation)]
    pub fn set_redirection(&mut self, pin: u32, entry: u64) {
        self.registers[0x10 + 2 * pin as usize] = entry as u32;
        self.registers[0x11 + 2 * pin as usize] = (entry >> 32) as u32;
    }

    /// `(register index, value)` for every write through `IOWIN`.
    #[must_use]
    pub fn data_writes(&self) -> &[(u32, u32)] {
        &self.data_writes
    }

    /// Writes to either window register.
    #[must_use]
    pub const fn window_writes(&self) -> usize {
        self.window_writes
    }

    pub fn clear_log(&mut self) {
        self.data_writes.clear();
        self.window_writes = 0;
    }
}

impl RegisterBlock for FakeIoApic {
    fn read32(&self, offset: usize) -> u32 {
        match offset {
            IOREGSEL => self.select,
            IOWIN => self
                .registers
                .get(self.select as usize)
                .copied()
                .unwrap_or(0),
            _ => 0,
        }
    }

    fn write32(&mut self, offset: usize, value: u32) {
        self.window_writes += 1;
        match offset {
            IOREGSEL => self.select = value & 0xFF,
            IOWIN => {
                self.data_writes.push((self.select, value));
                // The version register is read-only.
                if self.select != 1
                    && let Some(r) = self.registers.get_mut(self.select as usize)
                {
                    *r = value;
                }
            }
            _ => {}
        }
    }
}

pub enum FakeChip {
    Local(FakeLocalApic),
    Io(FakeIoApic),
}

impl RegisterBlock for FakeChip {
    fn read32(&self, offset: usize) -> u32 {
        match self {
            Self::Local(l) => l.read32(offset),
            Self::Io(io) => io.read32(offset),
        }
    }

    fn write32(&mut self, offset: usize, value: u32) {
        match self {
            Self::Local(l) => l.write32(offset, value),
            Self::Io(io) => io.write32(offset, value),
        }
    }
}

/// A chip shared between the bus and the driver that mapped it.
#[derive(Clone)]
pub struct SharedChip(Rc<RefCell<FakeChip>>);

impl SharedChip {
    /// # Panics
    /// If the chip is not a local APIC.
    pub fn local<T>(&self, f: impl FnOnce(&FakeLocalApic) -> T) -> T {
        match &*self.0.borrow() {
            FakeChip::Local(l) => f(l),
            FakeChip::Io(_) => panic!("not a local APIC"),
        }
    }

    /// # Panics
    /// If the chip is not an IO-APIC.
    pub fn io<T>(&self, f: impl FnOnce(&FakeIoApic) -> T) -> T {
        match &*self.0.borrow() {
            FakeChip::Io(io) => f(io),
            FakeChip::Local(_) => panic!("not an IO-APIC"),
        }
    }
}

impl RegisterBlock for SharedChip {
    fn read32(&self, offset: usize) -> u32 {
        self.0.borrow().read32(offset)
    }

    fn write32(&mut self, offset: usize, value: u32) {
        self.0.borrow_mut().write32(offset, value);
    }
}

/// Physical address space with chips attached at fixed addresses.
#[derive(Default)]
pub struct FakeMmioBus {
    chips: Vec<(u64, SharedChip)>,
    maps: Vec<(u64, usize)>,
}

impl FakeMmioBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Place `chip` at `address` and return a handle for inspection.
    pub fn attach(&mut self, address: u64, chip: FakeChip) -> SharedChip {
        let shared = SharedChip(Rc::new(RefCell::new(chip)));
        self.chips.push((address, shared.clone()));
        shared
    }

    /// Every successful `(address, len)` mapping, in order.
    #[must_use]
    pub fn maps(&self) -> &[(u64, usize)] {
        &self.maps
    }
}

impl MmioMapper for FakeMmioBus {
    type Registers = SharedChip;

    fn map_registers(&mut self, pa: PhysicalAddress, len: usize) -> Option<SharedChip> {
        let chip = self
            .chips
            .iter()
            .find(|(address, _)| *address == pa.as_u64())
            .map(|(_, chip)| chip.clone())?;
        self.maps.push((pa.as_u64(), len));
        Some(chip)
    }
}
