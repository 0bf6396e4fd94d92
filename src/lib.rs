//! A parser and interpreter for DWARF call frame information, as found in
//! `.debug_frame` and `.eh_frame` sections.
//!
//! ```no_run
//! use dwarfcfi::dwarf::{
//!     cfi::{CallFrameInfo, TracingReporter},
//!     reader::{ByteReader, Endianness},
//!     section::CfiSection,
//! };
//! # fn handle(eh_frame: &[u8], handler: &mut impl dwarfcfi::dwarf::cfi::Handler) {
//! let reader = ByteReader::new(Endianness::Little, 8).with_section_base(0x1000);
//! let cfi = CallFrameInfo::new(eh_frame, reader, CfiSection::EhFrame);
//! let all_ok = cfi.start(handler, &mut TracingReporter::new("a.out", cfi.section().name()));
//! # let _ = all_ok;
//! # }
//! ```
#![cfg_attr(not(test), no_std)]

extern crate alloc;

#[macro_use]
extern crate tracing;

pub mod dwarf;

pub use dwarf::cfi::{CallFrameInfo, Error, Handler, Register, Reporter, Rule};
