use bitfield_struct::bitfield;
use kernel_memory_addresses::PhysicalAddress;

/// A 32-bit page-directory or page-table entry in its raw bitfield form.
///
/// ### Bit layout
///
/// | Bits  | Name / Mnemonic | Meaning |
/// |-------|-----------------|---------|
/// | 0     | `P`             | Valid entry if set |
/// | 1     | `RW`            | Writable if set |
/// | 2     | `US`            | User-mode accessible if set |
/// | 3     | `PWT`           | Write-through caching |
/// | 4     | `PCD`           | Disable caching |
/// | 5     | `A`             | Accessed |
/// | 6     | `D`             | Dirty (leaf only) |
/// | 7     | `PS` / `PAT`    | 4 MiB page in a PDE; PAT in a PTE |
/// | 8     | `G`             | Global (leaf only, needs CR4.PGE) |
/// | 9–11  | OS avail        | Ignored by hardware |
/// | 12–31 | `addr`          | Physical frame bits [31:12] |
///
/// There is no NX bit without PAE: readable implies executable.
#[bitfield(u32)]
pub struct PageEntryBits {
    /// Present (P, bit 0).
    pub present: bool,

    /// Writable (RW, bit 1).
    pub writable: bool,

    /// User/Supervisor (US, bit 2). Clear restricts access to ring 0.
    pub user_access: bool,

    /// Page Write-Through (PWT, bit 3).
    pub write_through: bool,

    /// Page Cache Disable (PCD, bit 4).
    pub cache_disabled: bool,

    /// Accessed (A, bit 5). Set by the CPU.
    pub accessed: bool,

    /// Dirty (D, bit 6). Set by the CPU on first write through a leaf.
    pub dirty: bool,

    /// Page Size (PS, bit 7) in a PDE. We never map 4 MiB pages.
    pub large_page: bool,

    /// Global (G, bit 8): not flushed on CR3 reload.
    pub global_translation: bool,

    /// OS-available (bits 9..=11).
    #[bits(3)]
    pub os_available: u8,

    /// Physical address bits [31:12].
    #[bits(20)]
    phys_addr_bits_31_12: u32,
}

impl PageEntryBits {
    #[inline]
    pub const fn set_physical_address(&mut self, phys: PhysicalAddress) {
        self.set_phys_addr_bits_31_12(phys.as_u32() >> 12);
    }

    #[inline]
    #[must_use]
    pub const fn physical_address(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.phys_addr_bits_31_12() << 12)
    }

    /// Only the bits software chooses: no frame, no accessed/dirty.
    #[inline]
    #[must_use]
    pub const fn permissions(self) -> Self {
        self.with_phys_addr_bits_31_12(0)
            .with_accessed(false)
            .with_dirty(false)
    }

    /// Supervisor read/write, cached.
    #[inline]
    #[must_use]
    pub const fn kernel_rw() -> Self {
        Self::new().with_present(true).with_writable(true)
    }

    /// Supervisor read-only (and executable).
    #[inline]
    #[must_use]
    pub const fn kernel_ro() -> Self {
        Self::new().with_present(true)
    }

    /// Supervisor read/write mapping that survives CR3 reloads.
    #[inline]
    #[must_use]
    pub const fn kernel_rw_global() -> Self {
        Self::kernel_rw().with_global_translation(true)
    }

    #[inline]
    #[must_use]
    pub const fn user_rw() -> Self {
        Self::kernel_rw().with_user_access(true)
    }

    #[inline]
    #[must_use]
    pub const fn user_ro() -> Self {
        Self::kernel_ro().with_user_access(true)
    }

    /// Device registers: supervisor read/write, uncached, write-through.
    #[inline]
    #[must_use]
    pub const fn mmio() -> Self {
        Self::kernel_rw()
            .with_cache_disabled(true)
            .with_write_through(true)
    }

    /// Flags for a directory entry that leads to kernel-only tables.
    #[inline]
    #[must_use]
    pub const fn kernel_table() -> Self {
        Self::kernel_rw()
    }

    /// Flags for a directory entry whose table holds user pages.
    ///
    /// The effective permission is the intersection over the walk, so the
    /// directory entry must be at least as permissive as its leaves.
    #[inline]
    #[must_use]
    pub const fn user_table() -> Self {
        Self::user_rw()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_address_round_trip() {
        let mut e = PageEntryBits::kernel_rw();
        e.set_physical_address(PhysicalAddress::new(0x0013_0000));
        assert_eq!(e.physical_address().as_u32(), 0x0013_0000);
        assert_eq!(e.into_bits(), 0x0013_0003);
    }

    #[test]
    fn named_constructors() {
        assert_eq!(PageEntryBits::kernel_ro().into_bits(), 0b001);
        assert_eq!(PageEntryBits::user_rw().into_bits(), 0b111);
        assert_eq!(PageEntryBits::mmio().into_bits(), 0b1_1011);
        assert_eq!(PageEntryBits::kernel_rw_global().into_bits(), 0x103);
    }

    #[test]
    fn permissions_strip_frame_and_cpu_bits() {
        let e = PageEntryBits::user_ro()
            .with_accessed(true)
            .with_dirty(true)
            .with_phys_addr_bits_31_12(0x1234);
        assert_eq!(e.permissions().into_bits(), PageEntryBits::user_ro().into_bits());
    }
}
