//! # Boot Diagnostics
//!
//! The only output channel the loader and early kernel have: bytes written to
//! an I/O port. Under QEMU that is the debug console (`-debugcon stdio`, port
//! `0x402`); with the `serial` feature it is COM1 (`0x3F8`) instead.
//!
//! ## Components
//!
//! * [`DiagnosticLogger`]: a `log::Log` backend that formats
//!   `"[LEVEL] target: message"` lines without allocating.
//! * [`diag_print!`]: direct formatted output, usable before the logger is
//!   installed.
//! * [`fatal`]: the single exit for unrecoverable bring-up errors. It prints
//!   one line of context and reason, disables interrupts and halts.
//!
//! ```rust,no_run
//! use kernel_diagnostics::DiagnosticLogger;
//! use log::{LevelFilter, info};
//!
//! static LOGGER: DiagnosticLogger = DiagnosticLogger::new(LevelFilter::Debug);
//!
//! LOGGER.init().ok();
//! info!("loader started");
//! ```
//!
//! Without the `enabled` feature all output compiles to nothing.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod fatal;
mod logger;

pub use fatal::{FatalError, fatal};
pub use logger::DiagnosticLogger;

/// I/O port the diagnostic sink writes to.
#[cfg(not(feature = "serial"))]
pub const DIAGNOSTIC_PORT: u16 = 0x402;

/// I/O port the diagnostic sink writes to.
#[cfg(feature = "serial")]
pub const DIAGNOSTIC_PORT: u16 = 0x3F8;

#[cfg(feature = "enabled")]
#[doc(hidden)]
pub mod port {
    use core::fmt::{self, Write};

    /// A `fmt::Write` sink that pushes every byte to an I/O port.
    pub struct PortSink {
        port: u16,
    }

    impl PortSink {
        #[must_use]
        pub const fn new(port: u16) -> Self {
            Self { port }
        }

        #[allow(clippy::inline_always)]
        #[inline(always)]
        fn putc(&self, c: u8) {
            unsafe { outb(self.port, c) }
        }
    }

    #[allow(clippy::inline_always)]
    #[inline(always)]
    unsafe fn outb(port: u16, val: u8) {
        unsafe {
            core::arch::asm!(
            "out dx, al",
            in("dx") port,
            in("al") val,
            options(nomem, nostack, preserves_flags)
            );
        }
    }

    impl Write for PortSink {
        #[inline]
        fn write_str(&mut self, s: &str) -> fmt::Result {
            for b in s.bytes() {
                self.putc(b);
            }
            Ok(())
        }
    }

    #[doc(hidden)]
    #[inline]
    pub fn write(args: fmt::Arguments) {
        // Best effort; there is nowhere to report a failed diagnostic.
        let _ = fmt::write(&mut PortSink::new(crate::DIAGNOSTIC_PORT), args);
    }
}

#[cfg(not(feature = "enabled"))]
#[doc(hidden)]
pub mod port {
    use core::fmt;

    #[doc(hidden)]
    #[inline(always)]
    #[allow(clippy::inline_always)]
    pub fn write(_: fmt::Arguments) {}
}

/// Formatted output straight to the diagnostic port, bypassing `log`.
#[macro_export]
macro_rules! diag_print {
    ($($arg:tt)*) => {{
        $crate::port::write(core::format_args!($($arg)*));
    }};
}
