//! Privileged single instructions.

use kernel_memory_addresses::VirtualAddress;

/// Invalidate the TLB entry for the page containing `va` on this CPU.
///
/// # Safety
/// Must run at CPL0.
#[cfg(feature = "asm")]
#[inline]
pub unsafe fn invlpg(va: VirtualAddress) {
    unsafe {
        core::arch::asm!("invlpg [{}]", in(reg) va.as_usize(), options(nostack, preserves_flags));
    }
}

/// Mask maskable interrupts on this CPU.
///
/// # Safety
/// Must run at CPL0 (or with sufficient IOPL).
#[cfg(feature = "asm")]
#[inline]
pub unsafe fn cli() {
    unsafe {
        core::arch::asm!("cli", options(nomem, nostack));
    }
}

/// Disable interrupts and stop this CPU for good.
#[cfg(feature = "asm")]
pub fn halt_forever() -> ! {
    loop {
        unsafe {
            core::arch::asm!("cli", "hlt", options(nomem, nostack));
        }
    }
}

/// Without the `asm` feature there is nothing to halt; spin instead.
#[cfg(not(feature = "asm"))]
pub fn halt_forever() -> ! {
    loop {
        core::hint::spin_loop();
    }
}
