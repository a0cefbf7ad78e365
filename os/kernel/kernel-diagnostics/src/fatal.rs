use core::fmt;

/// An unrecoverable bring-up failure: where it happened and why.
#[derive(Debug, thiserror::Error)]
#[error("{context}: {reason}")]
pub struct FatalError<R: fmt::Display + fmt::Debug> {
    pub context: &'static str,
    pub reason: R,
}

impl<R: fmt::Display + fmt::Debug> FatalError<R> {
    pub const fn new(context: &'static str, reason: R) -> Self {
        Self { context, reason }
    }

    /// Report and halt.
    pub fn halt(self) -> ! {
        fatal(self.context, &self.reason)
    }
}

/// Print one line of context and reason, then stop the machine.
///
/// The line goes through `log` and, in case no logger is installed yet,
/// straight to the diagnostic port as well.
pub fn fatal(context: &str, reason: &dyn fmt::Display) -> ! {
    log::error!("{context}: {reason}");
    crate::diag_print!("FATAL {context}: {reason}\n");
    kernel_registers::instructions::halt_forever()
}
