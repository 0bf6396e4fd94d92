//! `DW_EH_PE_*` pointer encodings, as used by `.eh_frame` augmentations.
//!
//! Source: https://refspecs.linuxfoundation.org/LSB_5.0.0/LSB-Core-generic/LSB-Core-generic/dwarfext.html

use core::fmt;

/// A pointer encoding byte. The low nybble is the value format, bits 4-6 the
/// application and the top bit marks an indirect pointer.
#[derive(PartialEq, Eq, Clone, Copy, Hash)]
#[repr(transparent)]
pub struct Encoding(pub u8);

impl Encoding {
    pub const ABSPTR: Encoding = Encoding(0x00);
    /// Not a pointer at all.
    pub const OMIT: Encoding = Encoding(0xff);
    /// Only valid as the whole byte, without any format or indirect bits.
    pub const ALIGNED: Encoding = Encoding(0x50);

    const INDIRECT: u8 = 0x80;

    pub fn format(self) -> Option<ValueFormat> {
        Some(match self.0 & 0b1111 {
            // 0x08 is `DW_EH_PE_signed` with no explicit size
            0x00 | 0x08 => ValueFormat::DW_EH_PE_absptr,
            0x01 => ValueFormat::DW_EH_PE_uleb128,
            0x02 => ValueFormat::DW_EH_PE_udata2,
            0x03 => ValueFormat::DW_EH_PE_udata4,
            0x04 => ValueFormat::DW_EH_PE_udata8,
            0x09 => ValueFormat::DW_EH_PE_sleb128,
            0x0A => ValueFormat::DW_EH_PE_sdata2,
            0x0B => ValueFormat::DW_EH_PE_sdata4,
            0x0C => ValueFormat::DW_EH_PE_sdata8,
            _ => return None,
        })
    }

    pub fn application(self) -> Option<ValueApplication> {
        Some(match self.0 & 0x70 {
            0x00 => ValueApplication::DW_EH_PE_absptr,
            0x10 => ValueApplication::DW_EH_PE_pcrel,
            0x20 => ValueApplication::DW_EH_PE_textrel,
            0x30 => ValueApplication::DW_EH_PE_datarel,
            0x40 => ValueApplication::DW_EH_PE_funcrel,
            0x50 => ValueApplication::DW_EH_PE_aligned,
            _ => return None,
        })
    }

    /// The pointer's value is the address of the actual value.
    pub fn is_indirect(self) -> bool {
        self.0 & Self::INDIRECT != 0
    }

    pub fn is_omit(self) -> bool {
        self == Self::OMIT
    }

    /// Structurally well-formed. Says nothing about whether the base address
    /// it needs is known.
    pub fn is_valid(self) -> bool {
        if self == Self::OMIT || self == Self::ALIGNED {
            return true;
        }
        (self.0 & 0x07) <= 0x04 && (self.0 & 0x70) <= 0x40
    }

    /// The same value format with an absolute application, used for FDE
    /// address ranges.
    pub(crate) fn without_application(self) -> Encoding {
        Encoding(self.0 & 0x0f)
    }
}

impl fmt::Debug for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_omit() {
            return f.write_str("DW_EH_PE_omit");
        }
        if *self == Self::ALIGNED {
            return f.write_str("DW_EH_PE_aligned");
        }
        if self.is_indirect() {
            f.write_str("DW_EH_PE_indirect | ")?;
        }
        match (self.application(), self.format()) {
            (Some(application), Some(format)) => write!(f, "{application:?} | {format:?}"),
            _ => write!(f, "{:#04x}", self.0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
#[allow(non_camel_case_types)]
pub enum ValueFormat {
    /// An address-sized value.
    DW_EH_PE_absptr = 0x00,
    /// Unsigned value is encoded using the Little Endian Base 128 (LEB128) as
    /// defined by DWARF Debugging Information Format, Revision 2.0.0 (July 27,
    /// 1993).
    DW_EH_PE_uleb128 = 0x01,
    /// A 2 bytes unsigned value.
    DW_EH_PE_udata2 = 0x02,
    /// A 4 bytes unsigned value.
    DW_EH_PE_udata4 = 0x03,
    /// An 8 bytes unsigned value.
    DW_EH_PE_udata8 = 0x04,
    /// Signed value is encoded using the Little Endian Base 128 (LEB128) as
    /// defined by DWARF Debugging Information Format, Revision 2.0.0 (July 27,
    /// 1993).
    DW_EH_PE_sleb128 = 0x09,
    /// A 2 bytes signed value.
    DW_EH_PE_sdata2 = 0x0A,
    /// A 4 bytes signed value.
    DW_EH_PE_sdata4 = 0x0B,
    /// An 8 bytes signed value.
    DW_EH_PE_sdata8 = 0x0C,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
#[allow(non_camel_case_types)]
pub enum ValueApplication {
    DW_EH_PE_absptr = 0x00,
    ///	Value is relative to the address of the pointer itself.
    DW_EH_PE_pcrel = 0x10,
    ///	Value is relative to the beginning of the .text section.
    DW_EH_PE_textrel = 0x20,
    ///	Value is relative to the beginning of the .got or .eh_frame_hdr
    /// section.
    DW_EH_PE_datarel = 0x30,
    ///	Value is relative to the beginning of the function.
    DW_EH_PE_funcrel = 0x40,
    ///	Value is aligned to an address unit sized boundary.
    DW_EH_PE_aligned = 0x50,
}
