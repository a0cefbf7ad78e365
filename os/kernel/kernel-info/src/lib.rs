//! # Boot Interface and Memory Layout
//!
//! Shared vocabulary between the boot-time loader and the kernel proper.
//!
//! ## Overview
//!
//! The loader runs with paging disabled, interprets the bootloader's memory
//! map, builds the first page directory and finally jumps into the kernel.
//! Both sides must agree on a handful of structures and constants; this crate
//! is where they live.
//!
//! ### Boot Information ([`boot`])
//! * **Handoff block**: [`BootInformation`](boot::BootInformation), written by the
//!   bootloader and validated through its magic value
//! * **Memory regions**: `(start, end, usable)` triples describing RAM
//! * **Modules**: files the bootloader placed in physical memory
//!
//! ### Setup Information ([`setup`])
//! The record the loader hands to the kernel entry point: the page directory,
//! the bitmap that tracks physical frames, and the (possibly relocated)
//! module list.
//!
//! ### Memory Layout ([`memory`])
//!
//! ```text
//! Virtual Address Space Layout (32-bit):
//!
//! 0x0000_0000 ┌─────────────────────────────────┐
//!             │ Identity map of the loader's    │
//!             │ reserved area (legacy + loader) │
//!             ├─────────────────────────────────┤
//!             │          User Space             │
//! KERNEL_BASE ├─────────────────────────────────┤ 0xC000_0000
//!             │     Kernel Text & Data          │
//! MMIO_WINDOW ├─────────────────────────────────┤ 0xFF40_0000
//!             │  Device registers (APICs)       │
//! TEMP_WINDOW ├─────────────────────────────────┤ 0xFF80_0000
//!             │  Short-lived firmware mappings  │
//! RECURSIVE   ├─────────────────────────────────┤ 0xFFC0_0000
//!             │  Page tables (slot 1023)        │
//! 0xFFFF_F000 │  Page directory itself          │
//! 0xFFFF_FFFF └─────────────────────────────────┘
//! ```
//!
//! All layout values are compile-time constants with `const` assertions
//! guarding their relationships.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

pub mod boot;
pub mod memory;
pub mod setup;
