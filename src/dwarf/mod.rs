//! DWARF call frame information: the primitive readers, the `DW_EH_PE`
//! pointer encodings, section naming and the CFI parser itself.
//!
//! See https://dwarfstd.org/doc/DWARF5.pdf for more information if more information is desired.

pub mod cfi;
pub mod encoding;
pub mod reader;
pub mod section;
