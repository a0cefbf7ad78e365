//! # Typed IA-32 Control Registers
//!
//! `CR0`, `CR3` and `CR4` modeled as `bitfield-struct` values, the
//! `IA32_APIC_BASE` MSR, and the handful of privileged instructions the
//! bring-up path needs (`invlpg`, `cli`, `hlt`).
//!
//! With the `asm` feature disabled the types still exist (and can be
//! constructed and inspected in tests), only the load/store implementations
//! are compiled out.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod cr0;
pub mod cr3;
pub mod cr4;
pub mod instructions;
pub mod msr;

pub use cr0::Cr0;
pub use cr3::Cr3;
pub use cr4::Cr4;

pub trait LoadRegisterUnsafe {
    /// # Safety
    /// The caller must uphold the implementation-specific safety requirements.
    /// For example, the register access might be privileged and require kernel mode (Ring 0).
    unsafe fn load_unsafe() -> Self;
}

pub trait StoreRegisterUnsafe {
    /// # Safety
    /// The caller must uphold the implementation-specific safety requirements.
    /// For example, the register access might be privileged and require kernel mode (Ring 0).
    unsafe fn store_unsafe(self);
}
