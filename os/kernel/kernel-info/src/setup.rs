//! # Setup Information
//!
//! What the loader hands to the kernel entry point once paging is on.

#![allow(unsafe_code)]

use crate::boot::ModuleDescriptor;
use kernel_memory_addresses::PhysicalAddress;

/// Location and extent of the physical-frame bitmap.
///
/// The bitmap lives inside the loader's reserved area, which stays
/// identity-mapped, so `words` is valid both before and after paging.
#[repr(C)]
#[derive(Copy, Clone, Debug)]
pub struct BitmapBounds {
    pub words: *mut u32,
    pub word_count: u32,
    /// Number of 4 KiB frames the bitmap tracks.
    pub frame_count: u32,
}

impl BitmapBounds {
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            words: core::ptr::null_mut(),
            word_count: 0,
            frame_count: 0,
        }
    }
}

/// Capacity of the ACPI table list in [`PlatformInfo`].
pub const MAX_ACPI_TABLES: usize = 32;

/// Capacity of the IO-APIC list in [`PlatformInfo`].
pub const MAX_IO_APICS: usize = 8;

/// One ACPI table whose checksum held at discovery.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct AcpiTableRecord {
    pub signature: [u8; 4],
    pub length: u32,
    pub address: u64,
}

/// One IO-APIC as programmed by the loader.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct IoApicRecord {
    pub id: u8,
    pub address: PhysicalAddress,
    pub gsi_base: u32,
    /// Number of redirection entries.
    pub entry_count: u32,
}

impl IoApicRecord {
    /// `true` if `gsi` falls in `[gsi_base, gsi_base + entry_count)`.
    #[must_use]
    pub const fn handles(&self, gsi: u32) -> bool {
        gsi >= self.gsi_base && gsi - self.gsi_base < self.entry_count
    }
}

/// Firmware tables and interrupt controllers found during bring-up.
///
/// Zero addresses and counts mean the step did not happen: no ACPI, or the
/// local APIC left alone with the legacy PIC in charge.
#[repr(C)]
#[derive(Copy, Clone, Debug)]
pub struct PlatformInfo {
    /// Physical address of the RSDP.
    pub rsdp: u64,
    /// Physical address of the RSDT or XSDT the tables came from.
    pub root_table: u64,
    tables: [AcpiTableRecord; MAX_ACPI_TABLES],
    table_count: u32,
    pub local_apic_base: u64,
    pub boot_apic_id: u8,
    /// Vector of the periodic local APIC timer. It is armed, so the kernel
    /// must install a handler before enabling interrupts.
    pub timer_vector: u8,
    pub timer_initial_count: u32,
    io_apics: [IoApicRecord; MAX_IO_APICS],
    io_apic_count: u32,
    /// Pages of the MMIO window holding the controllers' registers.
    pub mmio_window_pages: u32,
}

impl Default for PlatformInfo {
    fn default() -> Self {
        Self::empty()
    }
}

impl PlatformInfo {
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            rsdp: 0,
            root_table: 0,
            tables: [AcpiTableRecord {
                signature: [0; 4],
                length: 0,
                address: 0,
            }; MAX_ACPI_TABLES],
            table_count: 0,
            local_apic_base: 0,
            boot_apic_id: 0,
            timer_vector: 0,
            timer_initial_count: 0,
            io_apics: [IoApicRecord {
                id: 0,
                address: PhysicalAddress::zero(),
                gsi_base: 0,
                entry_count: 0,
            }; MAX_IO_APICS],
            io_apic_count: 0,
            mmio_window_pages: 0,
        }
    }

    #[must_use]
    pub const fn has_acpi(&self) -> bool {
        self.rsdp != 0
    }

    #[must_use]
    pub const fn has_local_apic(&self) -> bool {
        self.local_apic_base != 0
    }

    /// Append `table`. Returns `false` once the list is full.
    pub fn push_table(&mut self, table: AcpiTableRecord) -> bool {
        let Some(slot) = self.tables.get_mut(self.table_count as usize) else {
            return false;
        };
        *slot = table;
        self.table_count += 1;
        true
    }

    /// Append `chip`. Returns `false` once the list is full.
    pub fn push_io_apic(&mut self, chip: IoApicRecord) -> bool {
        let Some(slot) = self.io_apics.get_mut(self.io_apic_count as usize) else {
            return false;
        };
        *slot = chip;
        self.io_apic_count += 1;
        true
    }

    #[must_use]
    pub fn tables(&self) -> &[AcpiTableRecord] {
        &self.tables[..self.table_count as usize]
    }

    /// First table with `signature`.
    #[must_use]
    pub fn table(&self, signature: [u8; 4]) -> Option<&AcpiTableRecord> {
        self.tables().iter().find(|t| t.signature == signature)
    }

    #[must_use]
    pub fn io_apics(&self) -> &[IoApicRecord] {
        &self.io_apics[..self.io_apic_count as usize]
    }

    #[must_use]
    pub fn io_apic(&self, id: u8) -> Option<&IoApicRecord> {
        self.io_apics().iter().find(|c| c.id == id)
    }

    /// The IO-APIC whose pins cover `gsi`.
    #[must_use]
    pub fn io_apic_for_gsi(&self, gsi: u32) -> Option<&IoApicRecord> {
        self.io_apics().iter().find(|c| c.handles(gsi))
    }
}

#[repr(C)]
#[derive(Debug)]
pub struct SetupInformation {
    /// Physical address of the active page directory.
    pub page_directory: PhysicalAddress,
    /// End of the identity-mapped region owned by the loader.
    pub reserved_area_end: PhysicalAddress,
    pub bitmap: BitmapBounds,
    pub platform: PlatformInfo,
    modules: *const ModuleDescriptor,
    module_count: u32,
}

impl SetupInformation {
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn new(
        page_directory: PhysicalAddress,
        reserved_area_end: PhysicalAddress,
        bitmap: BitmapBounds,
        platform: PlatformInfo,
        modules: &[ModuleDescriptor],
    ) -> Self {
        Self {
            page_directory,
            reserved_area_end,
            bitmap,
            platform,
            modules: modules.as_ptr(),
            module_count: modules.len() as u32,
        }
    }

    #[must_use]
    pub const fn module_count(&self) -> u32 {
        self.module_count
    }

    /// Module descriptors after relocation.
    ///
    /// # Safety
    /// The slice passed to [`SetupInformation::new`] must still be alive.
    #[must_use]
    pub unsafe fn modules<'a>(&self) -> &'a [ModuleDescriptor] {
        if self.module_count == 0 {
            return &[];
        }
        unsafe { core::slice::from_raw_parts(self.modules, self.module_count as usize) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chip(id: u8, gsi_base: u32, entry_count: u32) -> IoApicRecord {
        IoApicRecord {
            id,
            address: PhysicalAddress::new(0xFEC0_0000 + u32::from(id) * 0x1000),
            gsi_base,
            entry_count,
        }
    }

    #[test]
    fn empty_platform_reports_nothing() {
        let platform = PlatformInfo::default();
        assert!(!platform.has_acpi());
        assert!(!platform.has_local_apic());
        assert!(platform.tables().is_empty());
        assert!(platform.io_apic_for_gsi(0).is_none());
    }

    #[test]
    fn io_apics_are_found_by_id_and_gsi() {
        let mut platform = PlatformInfo::empty();
        assert!(platform.push_io_apic(chip(0, 0, 24)));
        assert!(platform.push_io_apic(chip(1, 24, 16)));
        assert_eq!(platform.io_apic(1).map(|c| c.gsi_base), Some(24));
        assert_eq!(platform.io_apic_for_gsi(23).map(|c| c.id), Some(0));
        assert_eq!(platform.io_apic_for_gsi(39).map(|c| c.id), Some(1));
        assert!(platform.io_apic_for_gsi(40).is_none());
    }

    #[test]
    fn lists_stop_at_capacity() {
        let mut platform = PlatformInfo::empty();
        for n in 0..MAX_ACPI_TABLES {
            let table = AcpiTableRecord {
                signature: *b"SSDT",
                length: 36,
                address: 0x1000 * n as u64,
            };
            assert!(platform.push_table(table));
        }
        assert!(!platform.push_table(AcpiTableRecord::default()));
        assert_eq!(platform.tables().len(), MAX_ACPI_TABLES);
        assert_eq!(platform.table(*b"SSDT").map(|t| t.address), Some(0));

        for id in 0u8..8 {
            assert!(platform.push_io_apic(chip(id, u32::from(id) * 24, 24)));
        }
        assert!(!platform.push_io_apic(chip(9, 0, 24)));
    }
}
