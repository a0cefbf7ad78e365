//! # ELF32 Images
//!
//! Read-only views over i386 ELF executables that arrive as preloaded
//! bootloader modules, and the loader that turns one into a process.
//!
//! ```text
//!   module bytes ──► ElfImage::parse ──► program headers ──► spawn_from_module
//!                    (every check)       (PT_LOAD, PT_TLS)   (map, copy, zero)
//! ```
//!
//! [`ElfImage::parse`] performs *all* validation, including segment bounds,
//! before anything else happens. A spawn that fails validation never creates
//! an address space.
//!
//! The parser never allocates and is usable during bring-up; the
//! [`loader`] needs a heap for the TLS master copy and sits behind the
//! `alloc` feature.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

#[cfg(any(test, feature = "alloc", feature = "testing"))]
extern crate alloc;

mod header;
#[cfg(feature = "alloc")]
pub mod loader;
mod program;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use crate::header::{
    EHDR_SIZE, ELF_MAGIC, ELFCLASS32, ELFDATA2LSB, EM_386, ET_EXEC, EV_CURRENT, ElfError,
    ElfHeader, ElfImage, MAX_TLS_SIZE, PHDR_SIZE,
};
pub use crate::program::{
    PFlags, PT_LOAD, PT_TLS, ProgramHeader, ProgramHeaders, SegmentKind,
};

#[cfg(feature = "alloc")]
pub use crate::loader::{
    ModuleBytes, PhysicalModules, ProcessSpawner, SecurityLevel, SpawnError, Spawned, TlsMaster,
    page_flags_for, spawn_from_module,
};

#[inline]
pub(crate) fn le16(x: &[u8]) -> u16 {
    u16::from_le_bytes([x[0], x[1]])
}

#[inline]
pub(crate) fn le32(x: &[u8]) -> u32 {
    u32::from_le_bytes([x[0], x[1], x[2], x[3]])
}
