//! # Boot Information
//!
//! The bootloader hands the loader a [`BootInformation`] block describing RAM
//! and the modules it placed in memory. The block is trusted only after its
//! [`magic`](BootInformation::magic) matches [`BOOT_INFORMATION_MAGIC`].

#![allow(unsafe_code)]

use crate::memory::PhysicalRange;
use core::ffi::CStr;
use kernel_memory_addresses::PhysicalAddress;

/// Value the bootloader stores in [`BootInformation::magic`].
pub const BOOT_INFORMATION_MAGIC: u32 = 0x2BAD_B002;

/// Maximum length of a module path, including the terminating NUL.
pub const MODULE_PATH_LEN: usize = 64;

/// Memory region kind for RAM the kernel may use.
pub const REGION_USABLE: u32 = 1;

/// Memory region kind for anything else (firmware, MMIO, ACPI, defective).
pub const REGION_RESERVED: u32 = 2;

/// Kernel function pointer.
///
/// # ABI
/// The loader and kernel are both 32-bit images and agree on the C calling
/// convention.
pub type KernelEntryFn = extern "C" fn(*const crate::setup::SetupInformation) -> !;

/// Handoff block written by the bootloader.
#[repr(C)]
#[derive(Debug)]
pub struct BootInformation {
    /// Must equal [`BOOT_INFORMATION_MAGIC`].
    pub magic: u32,
    /// Array of [`MemoryRegion`], `memory_region_count` entries long.
    pub memory_regions: *const MemoryRegion,
    pub memory_region_count: u32,
    /// Array of [`ModuleDescriptor`], `module_count` entries long.
    pub modules: *mut ModuleDescriptor,
    pub module_count: u32,
}

impl BootInformation {
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.magic == BOOT_INFORMATION_MAGIC
    }

    /// The memory regions reported by the bootloader.
    ///
    /// # Safety
    /// `memory_regions` must point to `memory_region_count` readable entries
    /// that stay alive for `'a`.
    #[must_use]
    pub unsafe fn memory_regions<'a>(&self) -> &'a [MemoryRegion] {
        if self.memory_regions.is_null() || self.memory_region_count == 0 {
            return &[];
        }
        unsafe { core::slice::from_raw_parts(self.memory_regions, self.memory_region_count as usize) }
    }

    /// The module descriptors; the loader rewrites them when it relocates modules.
    ///
    /// # Safety
    /// `modules` must point to `module_count` writable entries that stay alive
    /// for `'a` and are not aliased.
    #[must_use]
    pub unsafe fn modules_mut<'a>(&self) -> &'a mut [ModuleDescriptor] {
        if self.modules.is_null() || self.module_count == 0 {
            return &mut [];
        }
        unsafe { core::slice::from_raw_parts_mut(self.modules, self.module_count as usize) }
    }
}

/// One entry of the bootloader's memory map.
///
/// Firmware reports 64-bit bounds; anything above 4 GiB is unreachable
/// without PAE and gets clipped by the consumer.
#[repr(C)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct MemoryRegion {
    pub start: u64,
    pub end: u64,
    pub kind: u32,
}

impl MemoryRegion {
    #[must_use]
    pub const fn usable(start: u64, end: u64) -> Self {
        Self {
            start,
            end,
            kind: REGION_USABLE,
        }
    }

    #[must_use]
    pub const fn reserved(start: u64, end: u64) -> Self {
        Self {
            start,
            end,
            kind: REGION_RESERVED,
        }
    }

    #[must_use]
    pub const fn is_usable(&self) -> bool {
        self.kind == REGION_USABLE
    }

    /// The part of the region below 4 GiB, or `None` if nothing remains.
    ///
    /// A 32-bit exclusive end cannot name 4 GiB, so a region reaching it ends
    /// at `0xFFFF_FFFF` and its last frame is never handed out. That frame
    /// sits under the firmware ROM on every PC.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn clipped(&self) -> Option<PhysicalRange> {
        const LIMIT: u64 = 1 << 32;
        if self.start >= self.end || self.start >= LIMIT {
            return None;
        }
        let end = if self.end > u32::MAX as u64 { u32::MAX as u64 } else { self.end };
        Some(PhysicalRange::from_raw(self.start as u32, end as u32))
    }
}

/// A file the bootloader loaded into physical memory.
#[repr(C)]
#[derive(Copy, Clone, Eq, PartialEq)]
pub struct ModuleDescriptor {
    pub start: u32,
    pub end: u32,
    path: [u8; MODULE_PATH_LEN],
}

impl ModuleDescriptor {
    /// Paths longer than [`MODULE_PATH_LEN`] - 1 bytes are truncated.
    #[must_use]
    pub fn new(start: u32, end: u32, path: &str) -> Self {
        let mut buf = [0u8; MODULE_PATH_LEN];
        let len = path.len().min(MODULE_PATH_LEN - 1);
        buf[..len].copy_from_slice(&path.as_bytes()[..len]);
        Self {
            start,
            end,
            path: buf,
        }
    }

    #[must_use]
    pub const fn range(&self) -> PhysicalRange {
        PhysicalRange::new(PhysicalAddress::new(self.start), PhysicalAddress::new(self.end))
    }

    #[must_use]
    pub const fn len(&self) -> u32 {
        self.end.saturating_sub(self.start)
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The module path, or `"?"` if it is not valid UTF-8.
    #[must_use]
    pub fn path(&self) -> &str {
        CStr::from_bytes_until_nul(&self.path)
            .ok()
            .and_then(|s| s.to_str().ok())
            .unwrap_or("?")
    }

    /// Point the descriptor at a new physical location of the same length.
    pub const fn relocate(&mut self, start: PhysicalAddress) {
        let len = self.len();
        self.start = start.as_u32();
        self.end = start.as_u32() + len;
    }
}

impl core::fmt::Debug for ModuleDescriptor {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ModuleDescriptor")
            .field("start", &format_args!("{:#010x}", self.start))
            .field("end", &format_args!("{:#010x}", self.end))
            .field("path", &self.path())
            .finish()
    }
}
