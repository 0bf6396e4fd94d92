//! Parsing of DWARF call frame information.
//!
//! Source: https://dwarfstd.org/doc/DWARF5.pdf §6.4 Call Frame Information
//!
//! The CFI is a very large table of the following structure:
//! ```text
//! LOC CFA R0 R1 ... RN
//! L0
//! L1
//! ...
//! LN
//! ```
//!
//! The first column is the address for every location that contains code in a
//! program. The remaining columns contain unwinding rules that are associated
//! with the indicated location.
//!
//! The table is never materialized here. [`CallFrameInfo`] walks the section
//! entry by entry and, for every FDE, runs its CIE's initial instructions and
//! then its own, telling a [`Handler`] about each rule as it comes into
//! effect. Problems with the data go to a [`Reporter`]; a broken entry is
//! skipped and the walk continues with the next one whenever the entry's
//! length could be read.

#[cfg(test)]
mod tests;

mod error;
mod handler;
pub mod rule;
mod state;

use alloc::string::String;
use core::{fmt, ops::ControlFlow};

pub use error::Error;
pub use handler::{Handler, Reporter, TracingReporter};
pub use rule::{Register, Rule, RuleMap};

use self::state::State;
use super::{
    encoding::Encoding,
    reader::{ByteReader, Cursor, DecodeContext, ReadError},
    section::{CfiSection, SectionMap},
};

type Result<T, E = Error> = core::result::Result<T, E>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    /// Not yet known, because the entry's id could not be read.
    Unknown,
    Cie,
    Fde,
    /// A zero-length entry, which ends an `.eh_frame` section.
    Terminator,
}

impl EntryKind {
    pub fn name(self) -> &'static str {
        match self {
            EntryKind::Unknown => "entry",
            EntryKind::Cie => "common information entry",
            EntryKind::Fde => "frame description entry",
            EntryKind::Terminator => ".eh_frame sequence terminator",
        }
    }
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The framing every entry shares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Entry {
    /// Section offset of the initial length.
    offset: usize,
    /// Section offset just past the entry.
    end: usize,
    kind: EntryKind,
    /// For an FDE, the section offset of its CIE.
    cie_offset: usize,
    /// Where the kind-specific fields start.
    fields: usize,
}

/// A prologue that could not be read. Without an `end` the rest of the
/// section cannot be found either.
struct PrologueError {
    error: Error,
    end: Option<usize>,
}

/// A common information entry.
///
/// Holds the information shared by the FDEs that point to it, including the
/// initial instructions that set up the rules at the start of each of their
/// functions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cie<'a> {
    entry: Entry,
    /// Section offset of the CIE.
    pub offset: u64,
    /// 1 for `.eh_frame`, 1 or 3 for `.debug_frame` (2 is accepted too).
    pub version: u8,
    /// A NUL-terminated string identifying the augmentation to this CIE or to
    /// the FDEs that use it. Empty, or starting with `z`.
    pub augmentation: &'a str,
    /// Multiplied with the delta of every advance instruction.
    pub code_alignment_factor: u64,
    /// Multiplied with the factored offset of every offset instruction.
    pub data_alignment_factor: i64,
    /// The column of the return address in the rule table. May be any
    /// register number; it need not be a real machine register.
    pub return_address_register: u64,
    /// How FDE addresses and `DW_CFA_set_loc` operands are encoded.
    pub pointer_encoding: Encoding,
    /// Present for `z` augmentations.
    pub augmentation_data: Option<AugmentationData>,
    instructions: Cursor<'a>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AugmentationData {
    /// The encoding of the LSDA pointer in every FDE's augmentation data.
    pub lsda_pointer_encoding: Option<Encoding>,
    pub personality: Option<Personality>,
    /// The FDEs describe signal trampolines.
    pub signal_frame: bool,
}

/// The personality routine named by a `P` augmentation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Personality {
    pub encoding: Encoding,
    pub address: u64,
}

/// A frame description entry: the code range of one function and the
/// instructions that describe its frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fde<'c, 'a> {
    entry: Entry,
    /// Section offset of the FDE.
    pub offset: u64,
    pub cie: &'c Cie<'a>,
    pub address: u64,
    pub size: u64,
    /// The language-specific data area, if the CIE has an `L` augmentation.
    pub lsda_address: Option<u64>,
    instructions: Cursor<'a>,
}

/// Why interpretation of an entry stopped early.
#[derive(Debug)]
pub(crate) enum Halt {
    Error(Error),
    /// The handler asked to stop. Nothing gets reported.
    Abort,
}

impl From<Error> for Halt {
    fn from(error: Error) -> Self {
        Halt::Error(error)
    }
}

/// A parser over one CFI section.
#[derive(Debug, Clone, Copy)]
pub struct CallFrameInfo<'a> {
    buffer: &'a [u8],
    reader: ByteReader,
    section: CfiSection,
}

impl<'a> CallFrameInfo<'a> {
    pub fn new(buffer: &'a [u8], reader: ByteReader, section: CfiSection) -> Self {
        Self {
            buffer,
            reader,
            section,
        }
    }

    /// Looks `section` up in `sections`. For `.eh_frame` the reader is given
    /// the section's address as its section base unless it already has one.
    pub fn from_sections(
        sections: &SectionMap<'a>,
        reader: ByteReader,
        section: CfiSection,
    ) -> Option<Self> {
        let data = sections.get(section)?;
        let reader = if section.is_eh_frame() && reader.section_base().is_none() {
            reader.with_section_base(data.address)
        } else {
            reader
        };
        Some(Self::new(data.data, reader, section))
    }

    pub fn section(&self) -> CfiSection {
        self.section
    }

    /// Walks the whole section, sending the rules of every FDE to `handler`
    /// and every problem to `reporter`. Returns whether every entry was
    /// processed without error. Entries the handler declines to look at
    /// count as processed.
    #[instrument(skip_all, fields(section = %self.section, len = self.buffer.len()))]
    pub fn start<H, R>(&self, handler: &mut H, reporter: &mut R) -> bool
    where
        H: Handler + ?Sized,
        R: Reporter + ?Sized,
    {
        let mut all_ok = true;
        let mut cursor = 0;

        while cursor < self.buffer.len() {
            let entry = match self.read_entry_prologue(cursor) {
                Ok(entry) => entry,
                Err(PrologueError { error, end }) => {
                    reporter.report(&error);
                    all_ok = false;
                    match end {
                        Some(end) => {
                            cursor = end;
                            continue;
                        }
                        None => break,
                    }
                }
            };
            cursor = entry.end;

            match entry.kind {
                EntryKind::Terminator => {
                    if entry.end < self.buffer.len() {
                        reporter.report(&Error::EarlyEhTerminator {
                            offset: entry.offset as u64,
                        });
                    }
                    break;
                }
                // CIEs are read when an FDE refers to them.
                EntryKind::Cie | EntryKind::Unknown => continue,
                EntryKind::Fde => {}
            }

            match self.process_fde(entry, handler) {
                Ok(()) => {}
                Err(Halt::Error(error)) => {
                    debug!(offset = entry.offset, "skipping FDE: {error}");
                    reporter.report(&error);
                    all_ok = false;
                }
                Err(Halt::Abort) => {
                    debug!(offset = entry.offset, "handler abandoned FDE");
                    all_ok = false;
                }
            }
        }

        all_ok
    }

    fn process_fde<H: Handler + ?Sized>(&self, entry: Entry, handler: &mut H) -> Result<(), Halt> {
        if entry.cie_offset > self.buffer.len() {
            return Err(Error::CiePointerOutOfRange {
                offset: entry.offset as u64,
                cie_offset: entry.cie_offset as u64,
            }
            .into());
        }

        let cie_entry = self
            .read_entry_prologue(entry.cie_offset)
            .map_err(|e| e.error)?;
        if cie_entry.kind != EntryKind::Cie {
            return Err(Error::BadCieId {
                offset: entry.offset as u64,
                cie_offset: entry.cie_offset as u64,
            }
            .into());
        }
        let cie = self.read_cie_fields(cie_entry)?;
        let (fde, ctx) = self.read_fde_fields(entry, &cie)?;

        if !handler.entry(
            fde.offset,
            fde.address,
            fde.size,
            cie.version,
            cie.augmentation,
            cie.return_address_register,
        ) {
            trace!(address = fde.address, "handler skipped FDE");
            return Ok(());
        }

        if let Some(augmentation) = &cie.augmentation_data {
            if let Some(personality) = augmentation.personality {
                let indirect = personality.encoding.is_indirect();
                continue_or_abort(handler.personality_routine(personality.address, indirect))?;
            }
            let lsda = augmentation.lsda_pointer_encoding.zip(fde.lsda_address);
            if let Some((encoding, address)) = lsda {
                let indirect = encoding.is_indirect();
                continue_or_abort(handler.language_specific_data_area(address, indirect))?;
            }
            if augmentation.signal_frame {
                continue_or_abort(handler.signal_handler())?;
            }
        }

        let result = {
            let mut state = State::new(ctx, handler, &cie, fde.address);
            state.interpret_cie().and_then(|()| state.interpret_fde(&fde))
        };
        handler.end();
        result
    }

    /// Reads the length and id of the entry at `offset`.
    fn read_entry_prologue(&self, offset: usize) -> Result<Entry, PrologueError> {
        let incomplete = |end| PrologueError {
            error: Error::Incomplete {
                offset: offset as u64,
                kind: EntryKind::Unknown,
            },
            end,
        };

        let ctx = self.reader.context();
        let mut cursor = Cursor::range(self.buffer, offset, self.buffer.len());
        let (length, format) = ctx
            .read_initial_length(&mut cursor)
            .map_err(|_| incomplete(None))?;

        if length == 0 && self.section.is_eh_frame() {
            return Ok(Entry {
                offset,
                end: cursor.offset(),
                kind: EntryKind::Terminator,
                cie_offset: 0,
                fields: cursor.offset(),
            });
        }

        if length > cursor.remaining() as u64 {
            return Err(incomplete(None));
        }
        let end = cursor.offset() + length as usize;
        let mut cursor = cursor.limit(end);

        let id_offset = cursor.offset();
        let id = ctx
            .read_offset(&mut cursor, format)
            .map_err(|_| incomplete(Some(end)))?;

        let (kind, cie_offset) = if self.section.is_eh_frame() {
            // The id is the distance back from the id field to the CIE.
            if id == 0 {
                (EntryKind::Cie, 0)
            } else {
                (EntryKind::Fde, (id_offset as u64).wrapping_sub(id))
            }
        } else if id == format.all_ones() {
            (EntryKind::Cie, 0)
        } else {
            (EntryKind::Fde, id)
        };

        Ok(Entry {
            offset,
            end,
            kind,
            // Anything that does not fit is out of range either way.
            cie_offset: usize::try_from(cie_offset).unwrap_or(usize::MAX),
            fields: cursor.offset(),
        })
    }

    #[instrument(level = "trace", skip(self, entry), fields(offset = entry.offset))]
    fn read_cie_fields(&self, entry: Entry) -> Result<Cie<'a>> {
        let offset = entry.offset as u64;
        let incomplete = |_: ReadError| Error::Incomplete {
            offset,
            kind: EntryKind::Cie,
        };
        let ctx = self.reader.context();
        let mut data = Cursor::range(self.buffer, entry.fields, entry.end);

        let version = data.read_u8().map_err(incomplete)?;
        if !(1..=3).contains(&version) {
            return Err(Error::UnrecognizedVersion { offset, version });
        }

        let augmentation_bytes = data.read_cstr().map_err(incomplete)?;
        let augmentation = core::str::from_utf8(augmentation_bytes).map_err(|_| {
            Error::UnrecognizedAugmentation {
                offset,
                augmentation: String::from_utf8_lossy(augmentation_bytes).into_owned(),
            }
        })?;
        let has_z = match augmentation.as_bytes().first() {
            None => false,
            Some(b'z') => true,
            Some(_) => {
                return Err(Error::UnrecognizedAugmentation {
                    offset,
                    augmentation: augmentation.into(),
                })
            }
        };

        let code_alignment_factor = data.read_uleb128().map_err(incomplete)?;
        let data_alignment_factor = data.read_sleb128().map_err(incomplete)?;
        let return_address_register = if version == 1 {
            u64::from(data.read_u8().map_err(incomplete)?)
        } else {
            data.read_uleb128().map_err(incomplete)?
        };

        let mut pointer_encoding = Encoding::ABSPTR;
        let augmentation_data = if has_z {
            let len = data.read_uleb128().map_err(incomplete)?;
            let mut aug_data = data.split(len).map_err(incomplete)?;
            let parsed = parse_augmentation_data(
                offset,
                augmentation,
                &mut aug_data,
                &ctx,
                &mut pointer_encoding,
            )?;
            trace!(?parsed, "augmentation data");
            Some(parsed)
        } else {
            None
        };

        let cie = Cie {
            entry,
            offset,
            version,
            augmentation,
            code_alignment_factor,
            data_alignment_factor,
            return_address_register,
            pointer_encoding,
            augmentation_data,
            instructions: data,
        };
        trace!(?cie);
        Ok(cie)
    }

    fn read_fde_fields<'c>(
        &self,
        entry: Entry,
        cie: &'c Cie<'a>,
    ) -> Result<(Fde<'c, 'a>, DecodeContext)> {
        let offset = entry.offset as u64;
        let pointer_error = |error: ReadError| match error {
            ReadError::UnexpectedEnd { .. } => Error::Incomplete {
                offset,
                kind: EntryKind::Fde,
            },
            ReadError::InvalidEncoding(encoding) | ReadError::NoBase(encoding) => {
                Error::UnusablePointerEncoding {
                    offset: cie.offset,
                    encoding: encoding.0,
                }
            }
        };
        let mut data = Cursor::range(self.buffer, entry.fields, entry.end);

        let ctx = self.reader.context();
        let address = ctx
            .read_encoded_pointer(&mut data, cie.pointer_encoding)
            .map_err(pointer_error)?;
        let ctx = ctx.with_function_base(address);
        // The range has the address's format but no base.
        let size = ctx
            .read_encoded_pointer(&mut data, cie.pointer_encoding.without_application())
            .map_err(pointer_error)?;

        let mut lsda_address = None;
        if let Some(augmentation) = &cie.augmentation_data {
            let len = data.read_uleb128().map_err(pointer_error)?;
            let mut aug_data = data.split(len).map_err(pointer_error)?;
            if let Some(encoding) = augmentation.lsda_pointer_encoding {
                if !ctx.is_usable(encoding) {
                    return Err(Error::UnusablePointerEncoding {
                        offset: cie.offset,
                        encoding: encoding.0,
                    });
                }
                lsda_address = Some(
                    ctx.read_encoded_pointer(&mut aug_data, encoding)
                        .map_err(pointer_error)?,
                );
            }
        }

        let fde = Fde {
            entry,
            offset,
            cie,
            address,
            size,
            lsda_address,
            instructions: data,
        };
        trace!(offset, address, size, ?lsda_address, "FDE");
        Ok((fde, ctx))
    }
}

/// Reads the `z` augmentation data of a CIE, one argument per character
/// after the `z`. `pointer_encoding` is updated by an `R` argument.
fn parse_augmentation_data(
    offset: u64,
    augmentation: &str,
    data: &mut Cursor<'_>,
    ctx: &DecodeContext,
    pointer_encoding: &mut Encoding,
) -> Result<AugmentationData> {
    let incomplete = |_: ReadError| Error::Incomplete {
        offset,
        kind: EntryKind::Cie,
    };
    let checked = |encoding: Encoding| {
        if !encoding.is_valid() {
            Err(Error::InvalidPointerEncoding {
                offset,
                encoding: encoding.0,
            })
        } else if !ctx.is_usable(encoding) {
            Err(Error::UnusablePointerEncoding {
                offset,
                encoding: encoding.0,
            })
        } else {
            Ok(encoding)
        }
    };

    let mut aug_data = AugmentationData::default();

    for code in augmentation.bytes().skip(1) {
        match code {
            // The FDEs carry the address of a language-specific data area in
            // their augmentation data, in the encoding given here. Whether
            // the encoding is usable depends on the FDE, and `omit` never is.
            b'L' => {
                let encoding = Encoding(data.read_u8().map_err(incomplete)?);
                if !encoding.is_valid() {
                    return Err(Error::InvalidPointerEncoding {
                        offset,
                        encoding: encoding.0,
                    });
                }
                aug_data.lsda_pointer_encoding = Some(encoding);
            }
            // The encoding of the personality routine's address, then the
            // address itself.
            b'P' => {
                let encoding = checked(Encoding(data.read_u8().map_err(incomplete)?))?;
                let address = ctx
                    .read_encoded_pointer(data, encoding)
                    .map_err(incomplete)?;
                aug_data.personality = Some(Personality { encoding, address });
            }
            // The encoding of the addresses in the FDEs.
            b'R' => {
                *pointer_encoding = checked(Encoding(data.read_u8().map_err(incomplete)?))?;
            }
            b'S' => aug_data.signal_frame = true,
            _ => {
                return Err(Error::UnrecognizedAugmentation {
                    offset,
                    augmentation: augmentation.into(),
                })
            }
        }
    }

    Ok(aug_data)
}

fn continue_or_abort(flow: ControlFlow<()>) -> Result<(), Halt> {
    match flow {
        ControlFlow::Continue(()) => Ok(()),
        ControlFlow::Break(()) => Err(Halt::Abort),
    }
}
