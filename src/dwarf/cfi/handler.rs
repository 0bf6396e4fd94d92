use core::ops::ControlFlow;

use super::{rule::Register, Error};

/// Receives the unwinding rules of each FDE as [`CallFrameInfo`] interprets
/// it.
///
/// For every FDE the parser calls [`Handler::entry`] first. If that returns
/// `true`, it reports the personality routine, LSDA and signal frame
/// augmentations the entry has, then every rule in the order the
/// instructions establish them, and finally [`Handler::end`].
///
/// Rules are reported for the address at which they take effect and stay in
/// effect until the handler hears otherwise for the same register. Returning
/// [`ControlFlow::Break`] from any callback abandons the rest of the entry.
///
/// [`CallFrameInfo`]: super::CallFrameInfo
pub trait Handler {
    /// The start of an FDE covering `length` bytes starting at `address`.
    /// `version`, `augmentation` and `return_address` come from its CIE.
    /// Returning `false` skips the entry.
    fn entry(
        &mut self,
        offset: u64,
        address: u64,
        length: u64,
        version: u8,
        augmentation: &str,
        return_address: u64,
    ) -> bool;

    /// `reg` has no recoverable value in the caller.
    fn undefined_rule(&mut self, address: u64, reg: Register) -> ControlFlow<()>;

    /// `reg` is unchanged from the caller.
    fn same_value_rule(&mut self, address: u64, reg: Register) -> ControlFlow<()>;

    /// The caller's `reg` is saved at `base + offset`.
    fn offset_rule(
        &mut self,
        address: u64,
        reg: Register,
        base: Register,
        offset: i64,
    ) -> ControlFlow<()>;

    /// The caller's `reg` is the value `base + offset`. This is how the CFA
    /// itself is usually described.
    fn val_offset_rule(
        &mut self,
        address: u64,
        reg: Register,
        base: Register,
        offset: i64,
    ) -> ControlFlow<()>;

    /// The caller's `reg` is held in `base_register`.
    fn register_rule(&mut self, address: u64, reg: Register, base_register: u64)
        -> ControlFlow<()>;

    /// The caller's `reg` is saved at the address `expression` computes.
    fn expression_rule(&mut self, address: u64, reg: Register, expression: &[u8])
        -> ControlFlow<()>;

    /// The caller's `reg` is the value `expression` computes.
    fn val_expression_rule(
        &mut self,
        address: u64,
        reg: Register,
        expression: &[u8],
    ) -> ControlFlow<()>;

    fn personality_routine(&mut self, _address: u64, _indirect: bool) -> ControlFlow<()> {
        ControlFlow::Continue(())
    }

    fn language_specific_data_area(&mut self, _address: u64, _indirect: bool) -> ControlFlow<()> {
        ControlFlow::Continue(())
    }

    /// The function is a signal trampoline.
    fn signal_handler(&mut self) -> ControlFlow<()> {
        ControlFlow::Continue(())
    }

    /// No more rules for the current entry. Called once the instructions have
    /// run, even if they failed.
    fn end(&mut self);
}

/// Receives every problem found in the CFI data.
pub trait Reporter {
    fn report(&mut self, error: &Error);
}

/// Sends problems to `tracing`, warnings as `warn` and errors as `error`.
#[derive(Debug, Clone, Copy)]
pub struct TracingReporter<'a> {
    filename: &'a str,
    section: &'a str,
}

impl<'a> TracingReporter<'a> {
    pub fn new(filename: &'a str, section: &'a str) -> Self {
        Self { filename, section }
    }
}

impl Reporter for TracingReporter<'_> {
    fn report(&mut self, error: &Error) {
        let offset = error.offset();
        if error.is_warning() {
            warn!(file = self.filename, section = self.section, offset, "{error}");
        } else {
            error!(file = self.filename, section = self.section, offset, "{error}");
        }
    }
}
