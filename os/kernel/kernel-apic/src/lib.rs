//! # Interrupt Controllers
//!
//! Drivers for the per-core local APIC and the IO-APICs that route device
//! interrupts, both accessed through their memory-mapped register windows.
//!
//! ```text
//!   ISA IRQ ──► IO-APIC redirection entry ──► local APIC ──► CPU vector
//!               (IOREGSEL / IOWIN)             (EOI, timer, ICR)
//! ```
//!
//! Register access goes through [`RegisterBlock`]: [`Mmio`] performs the
//! volatile 32-bit loads and stores on hardware, the fakes in `testing`
//! record them on the host. Mapping a chip's physical window is delegated
//! to an [`MmioMapper`] supplied by the caller.
//!
//! IO-APICs are kept in an [`IoApicSet`], an arena in creation order, and
//! addressed by [`IoApicHandle`].

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

pub mod ioapic;
pub mod local;
pub mod registers;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use crate::ioapic::{
    DeliveryMode, DestinationMode, IOAPIC_WINDOW, ISA_IRQ_COUNT, ISA_VECTOR_BASE, IoApic,
    IoApicError, IoApicHandle, IoApicSet, PinPolarity, RedirectionEntry, TriggerMode,
};
pub use crate::local::{
    ApicTimerDivide, IcrCommand, LOCAL_APIC_BASE, LOCAL_APIC_WINDOW, LocalApic, LocalApicError,
    SPURIOUS_VECTOR, Shorthand, TIMER_TICK_MS, TIMER_VECTOR,
};
pub use crate::registers::{Mmio, MmioMapper, RegisterBlock};
