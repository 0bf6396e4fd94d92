//! Primitive readers for DWARF data: fixed-size integers, LEB128, initial
//! lengths, offsets, addresses and `DW_EH_PE` encoded pointers.
//!
//! Nothing in here knows about CFI entries. [`ByteReader`] carries the
//! target's byte order, address size and the base addresses that encoded
//! pointers may be relative to. A [`DecodeContext`] is the per-entry view of
//! it, which may additionally know the start address of the function whose
//! FDE is being read.


use core::fmt;

use super::encoding::{Encoding, ValueApplication, ValueFormat};

type Result<T, E = ReadError> = core::result::Result<T, E>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endianness {
    Little,
    Big,
}

/// Whether an entry uses 32-bit or 64-bit DWARF offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Dwarf32,
    Dwarf64,
}

impl Format {
    /// The all-ones offset, which `.debug_frame` uses as the CIE id.
    pub(crate) fn all_ones(self) -> u64 {
        match self {
            Format::Dwarf32 => 0xffff_ffff,
            Format::Dwarf64 => u64::MAX,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ReadError {
    #[error("unexpected end of data at offset {offset:#x}")]
    UnexpectedEnd { offset: usize },
    #[error("pointer encoding {0:?} is invalid")]
    InvalidEncoding(Encoding),
    #[error("no base address is known for pointer encoding {0:?}")]
    NoBase(Encoding),
}

/// How to read multi-byte values out of a CFI section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteReader {
    endian: Endianness,
    address_size: u8,
    section_base: Option<u64>,
    text_base: Option<u64>,
    data_base: Option<u64>,
}

impl ByteReader {
    /// `address_size` is 4 or 8.
    pub fn new(endian: Endianness, address_size: u8) -> Self {
        debug_assert!(matches!(address_size, 4 | 8), "address size {address_size}");
        Self {
            endian,
            address_size,
            section_base: None,
            text_base: None,
            data_base: None,
        }
    }

    /// The address the first byte of the section will be loaded at. Needed by
    /// `pcrel` and `aligned` pointers.
    pub fn with_section_base(self, base: u64) -> Self {
        Self {
            section_base: Some(base),
            ..self
        }
    }

    pub fn with_text_base(self, base: u64) -> Self {
        Self {
            text_base: Some(base),
            ..self
        }
    }

    pub fn with_data_base(self, base: u64) -> Self {
        Self {
            data_base: Some(base),
            ..self
        }
    }

    pub fn endian(&self) -> Endianness {
        self.endian
    }

    pub fn address_size(&self) -> u8 {
        self.address_size
    }

    pub fn section_base(&self) -> Option<u64> {
        self.section_base
    }

    pub fn context(&self) -> DecodeContext {
        DecodeContext {
            reader: *self,
            function_base: None,
        }
    }
}

/// An immutable view of a [`ByteReader`], possibly knowing the address of
/// the function currently being described.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodeContext {
    reader: ByteReader,
    function_base: Option<u64>,
}

impl DecodeContext {
    pub fn with_function_base(self, base: u64) -> Self {
        Self {
            function_base: Some(base),
            ..self
        }
    }

    pub fn reader(&self) -> &ByteReader {
        &self.reader
    }

    pub fn address_size(&self) -> u8 {
        self.reader.address_size
    }

    /// Whether a pointer in this encoding can be decoded with the bases
    /// known here. Only meaningful for valid encodings.
    pub fn is_usable(&self, encoding: Encoding) -> bool {
        match encoding.application() {
            Some(ValueApplication::DW_EH_PE_absptr) => true,
            Some(ValueApplication::DW_EH_PE_pcrel | ValueApplication::DW_EH_PE_aligned) => {
                self.reader.section_base.is_some()
            }
            Some(ValueApplication::DW_EH_PE_textrel) => self.reader.text_base.is_some(),
            Some(ValueApplication::DW_EH_PE_datarel) => self.reader.data_base.is_some(),
            Some(ValueApplication::DW_EH_PE_funcrel) => self.function_base.is_some(),
            None => false,
        }
    }

    /// Reads a 4-byte initial length, or the `0xffffffff` escape followed by
    /// an 8-byte one.
    pub fn read_initial_length(&self, cursor: &mut Cursor<'_>) -> Result<(u64, Format)> {
        let length = cursor.read_u32(self.reader.endian)?;
        if length == 0xffff_ffff {
            Ok((cursor.read_u64(self.reader.endian)?, Format::Dwarf64))
        } else {
            Ok((u64::from(length), Format::Dwarf32))
        }
    }

    pub fn read_offset(&self, cursor: &mut Cursor<'_>, format: Format) -> Result<u64> {
        match format {
            Format::Dwarf32 => cursor.read_u32(self.reader.endian).map(u64::from),
            Format::Dwarf64 => cursor.read_u64(self.reader.endian),
        }
    }

    pub fn read_address(&self, cursor: &mut Cursor<'_>) -> Result<u64> {
        match self.reader.address_size {
            4 => cursor.read_u32(self.reader.endian).map(u64::from),
            _ => cursor.read_u64(self.reader.endian),
        }
    }

    /// Reads a pointer in `encoding`. The encoding must not be `omit`. The
    /// indirect bit is not followed; it only matters to the consumer.
    pub fn read_encoded_pointer(&self, cursor: &mut Cursor<'_>, encoding: Encoding) -> Result<u64> {
        if encoding == Encoding::ALIGNED {
            return self.read_aligned_pointer(cursor);
        }

        let application = encoding
            .application()
            .ok_or(ReadError::InvalidEncoding(encoding))?;
        let format = encoding
            .format()
            .ok_or(ReadError::InvalidEncoding(encoding))?;

        let base = match application {
            ValueApplication::DW_EH_PE_absptr => 0,
            ValueApplication::DW_EH_PE_pcrel => match self.reader.section_base {
                Some(base) => base.wrapping_add(cursor.offset() as u64),
                None => return Err(ReadError::NoBase(encoding)),
            },
            ValueApplication::DW_EH_PE_textrel => {
                self.reader.text_base.ok_or(ReadError::NoBase(encoding))?
            }
            ValueApplication::DW_EH_PE_datarel => {
                self.reader.data_base.ok_or(ReadError::NoBase(encoding))?
            }
            ValueApplication::DW_EH_PE_funcrel => {
                self.function_base.ok_or(ReadError::NoBase(encoding))?
            }
            // `aligned` only makes sense as the whole encoding byte.
            ValueApplication::DW_EH_PE_aligned => return Err(ReadError::InvalidEncoding(encoding)),
        };

        let endian = self.reader.endian;
        let offset = match format {
            ValueFormat::DW_EH_PE_absptr => self.read_address(cursor)?,
            ValueFormat::DW_EH_PE_uleb128 => cursor.read_uleb128()?,
            ValueFormat::DW_EH_PE_udata2 => u64::from(cursor.read_u16(endian)?),
            ValueFormat::DW_EH_PE_udata4 => u64::from(cursor.read_u32(endian)?),
            ValueFormat::DW_EH_PE_udata8 => cursor.read_u64(endian)?,
            ValueFormat::DW_EH_PE_sleb128 => cursor.read_sleb128()? as u64,
            ValueFormat::DW_EH_PE_sdata2 => cursor.read_u16(endian)? as i16 as u64,
            ValueFormat::DW_EH_PE_sdata4 => cursor.read_u32(endian)? as i32 as u64,
            ValueFormat::DW_EH_PE_sdata8 => cursor.read_u64(endian)?,
        };

        Ok(self.mask(base.wrapping_add(offset)))
    }

    /// An address-sized value at the next address-size boundary, where
    /// boundaries are measured in loaded addresses rather than section
    /// offsets.
    fn read_aligned_pointer(&self, cursor: &mut Cursor<'_>) -> Result<u64> {
        let base = self
            .reader
            .section_base
            .ok_or(ReadError::NoBase(Encoding::ALIGNED))?;
        let size = u64::from(self.reader.address_size);
        let skew = base & (size - 1);
        let offset = skew.wrapping_add(cursor.offset() as u64);
        let aligned = offset.wrapping_add(size - 1) & !(size - 1);
        let padding = aligned.wrapping_sub(offset);
        cursor.skip(padding)?;
        self.read_address(cursor)
    }

    fn mask(&self, value: u64) -> u64 {
        if self.reader.address_size == 4 {
            value & 0xffff_ffff
        } else {
            value
        }
    }
}

/// A bounded window into a section. Positions are always section offsets, so
/// a cursor that was narrowed to one entry still reports where it is in the
/// whole section.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Cursor<'a> {
    section: &'a [u8],
    pos: usize,
    end: usize,
}

impl fmt::Debug for Cursor<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Cursor({:#x}..{:#x})", self.pos, self.end)
    }
}

impl<'a> Cursor<'a> {
    pub fn new(section: &'a [u8]) -> Self {
        Self {
            section,
            pos: 0,
            end: section.len(),
        }
    }

    /// A cursor over `start..end` of `section`, clamped to its length.
    pub fn range(section: &'a [u8], start: usize, end: usize) -> Self {
        let end = end.min(section.len());
        Self {
            section,
            pos: start.min(end),
            end,
        }
    }

    pub fn offset(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.end - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.pos == self.end
    }

    /// Narrows the cursor so that it stops at `end`.
    pub fn limit(self, end: usize) -> Self {
        Self {
            end: end.clamp(self.pos, self.end),
            ..self
        }
    }

    /// Splits off the next `amount` bytes as their own cursor.
    pub fn split(&mut self, amount: u64) -> Result<Cursor<'a>> {
        let start = self.pos;
        self.skip(amount)?;
        Ok(Cursor {
            section: self.section,
            pos: start,
            end: self.pos,
        })
    }

    pub fn skip(&mut self, amount: u64) -> Result<()> {
        match usize::try_from(amount) {
            Ok(amount) if amount <= self.remaining() => {
                self.pos += amount;
                Ok(())
            }
            _ => Err(self.unexpected_end()),
        }
    }

    pub fn read_bytes(&mut self, amount: u64) -> Result<&'a [u8]> {
        let start = self.pos;
        self.skip(amount)?;
        Ok(&self.section[start..self.pos])
    }

    /// A ULEB128 length followed by that many bytes.
    pub fn read_block(&mut self) -> Result<&'a [u8]> {
        let length = self.read_uleb128()?;
        self.read_bytes(length)
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let bytes = self.read_bytes(N as u64)?;
        let mut array = [0; N];
        array.copy_from_slice(bytes);
        Ok(array)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        let [byte] = self.read_array()?;
        Ok(byte)
    }

    pub fn read_u16(&mut self, endian: Endianness) -> Result<u16> {
        let bytes = self.read_array()?;
        Ok(match endian {
            Endianness::Little => u16::from_le_bytes(bytes),
            Endianness::Big => u16::from_be_bytes(bytes),
        })
    }

    pub fn read_u32(&mut self, endian: Endianness) -> Result<u32> {
        let bytes = self.read_array()?;
        Ok(match endian {
            Endianness::Little => u32::from_le_bytes(bytes),
            Endianness::Big => u32::from_be_bytes(bytes),
        })
    }

    pub fn read_u64(&mut self, endian: Endianness) -> Result<u64> {
        let bytes = self.read_array()?;
        Ok(match endian {
            Endianness::Little => u64::from_le_bytes(bytes),
            Endianness::Big => u64::from_be_bytes(bytes),
        })
    }

    /// Bits past the 64th are dropped.
    pub fn read_uleb128(&mut self) -> Result<u64> {
        let mut result = 0;
        let mut shift = 0;
        loop {
            let byte = self.read_u8()?;
            if shift < 64 {
                result |= u64::from(byte & 0b0111_1111) << shift;
            }
            shift += 7;
            if (byte >> 7) == 0 {
                break;
            }
        }
        Ok(result)
    }

    pub fn read_sleb128(&mut self) -> Result<i64> {
        let mut result = 0;
        let mut shift = 0;
        let sign_bit_set = loop {
            let byte = self.read_u8()?;
            if shift < 64 {
                result |= i64::from(byte & 0b0111_1111) << shift;
            }
            shift += 7;
            if (byte >> 7) == 0 {
                break ((byte >> 6) & 1) == 1;
            }
        };
        if shift < 64 && sign_bit_set {
            result |= -1 << shift;
        }
        Ok(result)
    }

    /// A NUL-terminated string, without the terminator.
    pub fn read_cstr(&mut self) -> Result<&'a [u8]> {
        let rest = &self.section[self.pos..self.end];
        let len = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or(ReadError::UnexpectedEnd { offset: self.end })?;
        self.pos += len + 1;
        Ok(&rest[..len])
    }

    fn unexpected_end(&self) -> ReadError {
        ReadError::UnexpectedEnd { offset: self.end }
    }
}
