//! Which flavour of CFI a buffer holds, and a small registry of the sections
//! pulled out of an object file.

use alloc::collections::BTreeMap;
use core::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CfiSection {
    /// `.debug_frame`, as described by the DWARF standard.
    DebugFrame,
    /// `.eh_frame`, the runtime unwinding tables described by the LSB. CIE
    /// pointers are relative, CIE ids are zero and a zero length ends the
    /// section.
    EhFrame,
}

impl CfiSection {
    pub const ALL: [CfiSection; 2] = [CfiSection::DebugFrame, CfiSection::EhFrame];

    pub fn name(self) -> &'static str {
        self.names()[0]
    }

    /// ELF names first, then Mach-O.
    pub fn names(self) -> &'static [&'static str] {
        match self {
            CfiSection::DebugFrame => &[".debug_frame", "__debug_frame"],
            CfiSection::EhFrame => &[".eh_frame", "__eh_frame"],
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|section| section.names().contains(&name))
    }

    pub fn is_eh_frame(self) -> bool {
        self == CfiSection::EhFrame
    }
}

impl fmt::Display for CfiSection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The contents of a CFI section together with the address it is loaded at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectionData<'a> {
    pub data: &'a [u8],
    pub address: u64,
}

/// CFI sections found in one object file, keyed by flavour.
#[derive(Debug, Clone, Default)]
pub struct SectionMap<'a> {
    sections: BTreeMap<CfiSection, SectionData<'a>>,
}

impl<'a> SectionMap<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a section under its object-file name. Returns `false` and
    /// drops it if the name is not a CFI section.
    pub fn insert(&mut self, name: &str, data: &'a [u8], address: u64) -> bool {
        match CfiSection::from_name(name) {
            Some(section) => {
                trace!(section = name, len = data.len(), address, "found CFI section");
                self.sections.insert(section, SectionData { data, address });
                true
            }
            None => false,
        }
    }

    pub fn get(&self, section: CfiSection) -> Option<SectionData<'a>> {
        self.sections.get(&section).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (CfiSection, SectionData<'a>)> + '_ {
        self.sections.iter().map(|(&section, &data)| (section, data))
    }

    pub fn is_empty(&self) -> bool {
        self.sections.is_empty()
    }
}
