//! Model-specific registers used during interrupt-controller bring-up.

use bitfield_struct::bitfield;
use kernel_memory_addresses::PhysicalAddress;

/// Address of the `IA32_APIC_BASE` MSR.
pub const IA32_APIC_BASE: u32 = 0x1B;

/// `IA32_APIC_BASE` — local APIC base address and enable bits.
#[bitfield(u64)]
pub struct Ia32ApicBase {
    #[bits(8)]
    _reserved0: u8,

    /// Bit 8 — BSP: set on the bootstrap processor.
    pub bsp: bool,

    _reserved9: bool,

    /// Bit 10 — EXTD: x2APIC mode.
    pub x2apic: bool,

    /// Bit 11 — EN: APIC global enable.
    pub enabled: bool,

    /// Bits 12–35 — APIC base >> 12.
    #[bits(24)]
    base_4k: u32,

    #[bits(28)]
    _reserved36: u32,
}

impl Ia32ApicBase {
    /// Physical base of the memory-mapped local APIC registers.
    #[must_use]
    pub fn base(&self) -> Option<PhysicalAddress> {
        PhysicalAddress::try_from_u64(u64::from(self.base_4k()) << 12)
    }

    /// Read the MSR.
    ///
    /// # Safety
    /// Must run at CPL0 on a CPU with an APIC.
    #[cfg(feature = "asm")]
    #[must_use]
    pub unsafe fn read() -> Self {
        Self::from_bits(unsafe { rdmsr(IA32_APIC_BASE) })
    }

    /// Write the MSR.
    ///
    /// # Safety
    /// Must run at CPL0; clearing `enabled` usually requires a reset to undo.
    #[cfg(feature = "asm")]
    pub unsafe fn write(self) {
        unsafe { wrmsr(IA32_APIC_BASE, self.into_bits()) }
    }
}

#[cfg(feature = "asm")]
#[inline]
unsafe fn rdmsr(msr: u32) -> u64 {
    let lo: u32;
    let hi: u32;
    unsafe {
        core::arch::asm!(
            "rdmsr",
            in("ecx") msr,
            out("eax") lo,
            out("edx") hi,
            options(nomem, nostack)
        );
    }
    (u64::from(hi) << 32) | u64::from(lo)
}

#[cfg(feature = "asm")]
#[inline]
#[allow(clippy::cast_possible_truncation)]
unsafe fn wrmsr(msr: u32, val: u64) {
    let lo = (val & 0xFFFF_FFFF) as u32;
    let hi = (val >> 32) as u32;
    unsafe {
        core::arch::asm!(
            "wrmsr",
            in("ecx") msr,
            in("eax") lo,
            in("edx") hi,
            options(nostack)
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_default_base() {
        let msr = Ia32ApicBase::from_bits(0xFEE0_0900);
        assert!(msr.enabled());
        assert!(msr.bsp());
        assert!(!msr.x2apic());
        assert_eq!(msr.base(), Some(PhysicalAddress::new(0xFEE0_0000)));
    }
}
