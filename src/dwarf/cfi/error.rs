use alloc::string::String;

use super::EntryKind;

/// Something wrong with the CFI data. Offsets are section offsets; `offset`
/// is always the start of the entry the problem was found in.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("CFI {kind} at offset {offset:#x}: entry ends early")]
    Incomplete { offset: u64, kind: EntryKind },

    #[error("CFI at offset {offset:#x}: saw end-of-data marker before end of section contents")]
    EarlyEhTerminator { offset: u64 },

    #[error(
        "CFI frame description entry at offset {offset:#x}: \
         CIE pointer is out of range: {cie_offset:#x}"
    )]
    CiePointerOutOfRange { offset: u64, cie_offset: u64 },

    #[error(
        "CFI frame description entry at offset {offset:#x}: \
         CIE pointer does not point to a CIE: {cie_offset:#x}"
    )]
    BadCieId { offset: u64, cie_offset: u64 },

    #[error("CFI common information entry at offset {offset:#x}: unrecognized version: {version}")]
    UnrecognizedVersion { offset: u64, version: u8 },

    #[error(
        "CFI common information entry at offset {offset:#x}: \
         unrecognized augmentation: '{augmentation}'"
    )]
    UnrecognizedAugmentation { offset: u64, augmentation: String },

    #[error(
        "CFI common information entry at offset {offset:#x}: \
         'z' augmentation specifies invalid pointer encoding: {encoding:#04x}"
    )]
    InvalidPointerEncoding { offset: u64, encoding: u8 },

    #[error(
        "CFI common information entry at offset {offset:#x}: \
         'z' augmentation specifies a pointer encoding for which we have no base address: \
         {encoding:#04x}"
    )]
    UnusablePointerEncoding { offset: u64, encoding: u8 },

    #[error(
        "CFI common information entry at offset {offset:#x}: \
         the DW_CFA_restore instruction at offset {insn_offset:#x} \
         cannot be used in a common information entry"
    )]
    RestoreInCie { offset: u64, insn_offset: u64 },

    #[error(
        "CFI {kind} at offset {offset:#x}: \
         the instruction at offset {insn_offset:#x} is unrecognized"
    )]
    BadInstruction {
        offset: u64,
        kind: EntryKind,
        insn_offset: u64,
    },

    #[error(
        "CFI {kind} at offset {offset:#x}: \
         the instruction at offset {insn_offset:#x} assumes that a CFA rule \
         has been set, but none has been set"
    )]
    NoCfaRule {
        offset: u64,
        kind: EntryKind,
        insn_offset: u64,
    },

    #[error(
        "CFI {kind} at offset {offset:#x}: \
         the DW_CFA_restore_state instruction at offset {insn_offset:#x} \
         should pop a saved state from the stack, but the stack is empty"
    )]
    EmptyStateStack {
        offset: u64,
        kind: EntryKind,
        insn_offset: u64,
    },

    #[error(
        "CFI {kind} at offset {offset:#x}: \
         the DW_CFA_restore_state instruction at offset {insn_offset:#x} \
         would clear the CFA rule in effect"
    )]
    ClearingCfaRule {
        offset: u64,
        kind: EntryKind,
        insn_offset: u64,
    },
}

impl Error {
    /// Warnings describe oddities that did not stop anything from being
    /// parsed.
    pub fn is_warning(&self) -> bool {
        matches!(self, Error::EarlyEhTerminator { .. })
    }

    /// Start of the entry the error was found in.
    pub fn offset(&self) -> u64 {
        match *self {
            Error::Incomplete { offset, .. }
            | Error::EarlyEhTerminator { offset }
            | Error::CiePointerOutOfRange { offset, .. }
            | Error::BadCieId { offset, .. }
            | Error::UnrecognizedVersion { offset, .. }
            | Error::UnrecognizedAugmentation { offset, .. }
            | Error::InvalidPointerEncoding { offset, .. }
            | Error::UnusablePointerEncoding { offset, .. }
            | Error::RestoreInCie { offset, .. }
            | Error::BadInstruction { offset, .. }
            | Error::NoCfaRule { offset, .. }
            | Error::EmptyStateStack { offset, .. }
            | Error::ClearingCfaRule { offset, .. } => offset,
        }
    }
}
