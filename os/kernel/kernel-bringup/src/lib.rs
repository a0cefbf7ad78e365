//! # Loader Bring-Up
//!
//! The second-stage loader: it runs unpaged from the multiboot handoff and
//! leaves with paging on, the kernel mapped at its virtual base and a
//! [`SetupInformation`](kernel_info::setup::SetupInformation) record
//! describing what it built.
//!
//! ```text
//! BootInformation
//!       │
//!       ▼
//! Bootstrap<Unpaged>      first directory from the static pool,
//!       │                 identity map of [0, reserved_area_end)
//!       ▼
//! Bootstrap<Relocating>   bitmap loaded from the memory map,
//!       │                 modules moved out of the kernel's frames
//!       ▼
//! Bootstrap<Mapped>       recursive slot, CR4.PGE, CR3, CR0.PG
//!       │
//!       ├── temporary window ──► ACPI ──► MADT
//!       ├── MMIO window ───────► local APIC, IO-APICs
//!       └── kernel ELF ────────► KernelImage::enter
//! ```
//!
//! ## Components
//! * [`bootstrap`]: the typed state machine and the recursive-directory
//!   mapping primitive.
//! * [`windows`]: the temporary and MMIO virtual windows carved out of the
//!   top of the address space.
//! * [`topology`]: MADT discovery and interrupt controller bring-up.
//! * [`handoff`]: kernel module lookup, placement and the jump.
//! * [`early_heap`]: the arena behind `alloc` while the loader runs.
//!
//! Every step is host-testable against
//! [`FakePhysicalMemory`](kernel_vmem::testing::FakePhysicalMemory) and
//! [`SoftMmu`](kernel_vmem::testing::SoftMmu); only `main.rs` touches the
//! machine.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

pub mod bootstrap;
pub mod early_heap;
pub mod error;
pub mod handoff;
pub mod topology;
pub mod windows;

#[cfg(test)]
mod fixture;

pub use bootstrap::{Bootstrap, LoaderLayout, Mapped, Relocating, Unpaged};
pub use early_heap::EarlyHeap;
pub use error::{BootError, HandoffError, TopologyError};
pub use handoff::{KERNEL_MODULE_NAME, KernelImage, find_kernel, kernel_extent};
pub use topology::{InterruptTopology, bring_up_interrupts, discover_madt, route_isa_irqs};
pub use windows::{MmioWindow, TemporaryMapper};
