//! # Page Directory and Page Table
//!
//! - [`pd`]: the root level. Each present entry points at a page table.
//! - [`pt`]: the leaf level. Each present entry maps one 4 KiB page.
//!
//! Both are 4 KiB-aligned arrays of 1024 entries.

pub mod pd;
pub mod pt;

/// Number of entries at each level.
pub const ENTRIES: usize = 1024;
