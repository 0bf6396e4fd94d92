//! Entry framing, CIE and FDE headers, and what happens to broken entries.

use test_assembler::{Label, LabelMaker};

use super::{assembler::FrameSection, parse, r, Event, Recorder, Reports, Stock, CFA};
use crate::dwarf::{
    cfi::{state::*, CallFrameInfo, EntryKind, Error},
    reader::{ByteReader, Endianness},
    section::{CfiSection, SectionMap},
};

fn run(section: FrameSection) -> (bool, Vec<Event>, Vec<Error>) {
    run_with(section, Recorder::default())
}

fn run_with(section: FrameSection, mut handler: Recorder) -> (bool, Vec<Event>, Vec<Error>) {
    let mut reports = Reports::default();
    let ok = parse(section, &mut handler, &mut reports);
    (ok, handler.events, reports.0)
}

fn entry(offset: &Label, address: u64, length: u64, version: u8, return_address: u64) -> Event {
    Event::Entry {
        offset: offset.value().unwrap(),
        address,
        length,
        version,
        augmentation: String::new(),
        return_address,
    }
}

#[test]
fn empty_section() {
    let (ok, events, reports) = run(FrameSection::debug_frame(Endianness::Little, 4));
    assert!(ok);
    assert!(events.is_empty());
    assert!(reports.is_empty());
}

#[test]
fn incomplete_length() {
    let section = FrameSection::debug_frame(Endianness::Big, 4).d16(0xa3f1);
    let (ok, events, reports) = run(section);
    assert!(!ok);
    assert!(events.is_empty());
    assert_eq!(reports, [Error::Incomplete {
        offset: 0,
        kind: EntryKind::Unknown,
    }]);
}

#[test]
fn length_past_end_of_section() {
    let section = FrameSection::debug_frame(Endianness::Little, 8)
        .d32(0x100)
        .d32(0xffff_ffff)
        .d8(3);
    let (ok, events, reports) = run(section);
    assert!(!ok);
    assert!(events.is_empty());
    assert_eq!(reports, [Error::Incomplete {
        offset: 0,
        kind: EntryKind::Unknown,
    }]);
}

#[test]
fn incomplete_id_skips_to_next_entry() {
    let stock = Stock::new(4);
    let section = FrameSection::debug_frame(Endianness::Little, 4)
        .d32(2)
        .d16(0xffff);
    let section = stock.write(section).finish_entry();

    let mut handler = Recorder::default();
    let mut reports = Reports::default();
    assert!(!parse(section, &mut handler, &mut reports));
    assert_eq!(reports.0, [Error::Incomplete {
        offset: 0,
        kind: EntryKind::Unknown,
    }]);
    let mut expected = stock.prefix();
    expected.push(Event::End);
    assert_eq!(handler.events, expected);
}

#[test]
fn cie_pointer_to_fde() {
    let fde = Label::new();
    let section = FrameSection::debug_frame(Endianness::Big, 4)
        .mark(&fde)
        .fde(&fde, 0x2f5e2a71, 0x1ae8, false)
        .finish_entry();

    let (ok, events, reports) = run(section);
    assert!(!ok);
    assert!(events.is_empty());
    assert_eq!(reports, [Error::BadCieId {
        offset: 0,
        cie_offset: 0,
    }]);
}

#[test]
fn cie_pointer_out_of_range() {
    let stock = Stock::new(4);
    let nowhere = Label::new();
    nowhere.set_const(0x4b8c_5e21);
    let fde = Label::new();
    let section = stock
        .write(FrameSection::debug_frame(Endianness::Little, 4))
        .finish_entry()
        .mark(&fde)
        .fde(&nowhere, 0x2f5e2a71, 0x1ae8, false)
        .finish_entry();

    let (ok, events, reports) = run(section);
    assert!(!ok);
    // The stock FDE before the broken one is still delivered.
    let mut expected = stock.prefix();
    expected.push(Event::End);
    assert_eq!(events, expected);
    assert_eq!(reports, [Error::CiePointerOutOfRange {
        offset: fde.value().unwrap(),
        cie_offset: 0x4b8c_5e21,
    }]);
}

#[test]
fn unrecognized_version() {
    let cie = Label::new();
    let section = FrameSection::debug_frame(Endianness::Little, 8)
        .mark(&cie)
        .cie(1, -8, 16, 4, "", false)
        .finish_entry()
        .fde(&cie, 0x1000, 0x20, false)
        .finish_entry();

    let (ok, events, reports) = run(section);
    assert!(!ok);
    assert!(events.is_empty());
    assert_eq!(reports, [Error::UnrecognizedVersion {
        offset: 0,
        version: 4,
    }]);
}

#[test]
fn unrecognized_augmentation() {
    let cie = Label::new();
    let section = FrameSection::debug_frame(Endianness::Little, 8)
        .mark(&cie)
        .cie(1, -8, 16, 3, "tricky", false)
        .finish_entry()
        .fde(&cie, 0x1000, 0x20, false)
        .finish_entry();

    let (ok, _, reports) = run(section);
    assert!(!ok);
    assert_eq!(reports, [Error::UnrecognizedAugmentation {
        offset: 0,
        augmentation: "tricky".into(),
    }]);
}

#[test]
fn unrecognized_z_augmentation_character() {
    let cie = Label::new();
    let section = FrameSection::debug_frame(Endianness::Little, 8)
        .mark(&cie)
        .cie(1, -8, 16, 1, "zQ", false)
        .uleb(0)
        .finish_entry()
        .fde(&cie, 0x1000, 0x20, false)
        .uleb(0)
        .finish_entry();

    let (ok, _, reports) = run(section);
    assert!(!ok);
    assert_eq!(reports, [Error::UnrecognizedAugmentation {
        offset: 0,
        augmentation: "zQ".into(),
    }]);
}

#[test]
fn invalid_pointer_encoding() {
    let cie = Label::new();
    let section = FrameSection::debug_frame(Endianness::Little, 8)
        .mark(&cie)
        .cie(1, -8, 16, 1, "zR", false)
        .uleb(1)
        .d8(0x07)
        .finish_entry()
        .fde(&cie, 0x1000, 0x20, false)
        .uleb(0)
        .finish_entry();

    let (ok, _, reports) = run(section);
    assert!(!ok);
    assert_eq!(reports, [Error::InvalidPointerEncoding {
        offset: 0,
        encoding: 0x07,
    }]);
}

#[test]
fn unusable_pointer_encoding() {
    let cie = Label::new();
    // pcrel, but a .debug_frame reader knows no section base.
    let section = FrameSection::debug_frame(Endianness::Little, 8)
        .mark(&cie)
        .cie(1, -8, 16, 1, "zR", false)
        .uleb(1)
        .d8(0x10)
        .finish_entry()
        .fde(&cie, 0x1000, 0x20, false)
        .uleb(0)
        .finish_entry();

    let (ok, _, reports) = run(section);
    assert!(!ok);
    assert_eq!(reports, [Error::UnusablePointerEncoding {
        offset: 0,
        encoding: 0x10,
    }]);
}

#[test]
fn restore_in_cie() {
    let cie = Label::new();
    let insn = Label::new();
    let fde = Label::new();
    let section = FrameSection::debug_frame(Endianness::Big, 4)
        .mark(&cie)
        .cie(1, 4, 0x1e, 3, "", false)
        .d8(DW_CFA_def_cfa)
        .uleb(0x1d)
        .uleb(0)
        .mark(&insn)
        .d8((DW_CFA_restore_hi << 6) | 0x11)
        .finish_entry()
        .mark(&fde)
        .fde(&cie, 0x7a8, 0x1c, false)
        .finish_entry();

    let (ok, events, reports) = run(section);
    assert!(!ok);
    assert_eq!(events, [
        entry(&fde, 0x7a8, 0x1c, 3, 0x1e),
        Event::ValOffset(0x7a8, CFA, r(0x1d), 0),
        Event::End,
    ]);
    assert_eq!(reports, [Error::RestoreInCie {
        offset: 0,
        insn_offset: insn.value().unwrap(),
    }]);
}

#[test]
fn bad_instruction() {
    let stock = Stock::new(8);
    let insn = Label::new();
    let section = stock
        .write(FrameSection::debug_frame(Endianness::Little, 8))
        .mark(&insn)
        .d8(0x3f)
        .d8(DW_CFA_undefined)
        .uleb(3)
        .finish_entry();

    let (ok, events, reports) = run(section);
    assert!(!ok);
    let mut expected = stock.prefix();
    expected.push(Event::End);
    assert_eq!(events, expected);
    assert_eq!(reports, [Error::BadInstruction {
        offset: stock.fde.value().unwrap(),
        kind: EntryKind::Fde,
        insn_offset: insn.value().unwrap(),
    }]);
}

#[test]
fn no_cfa_rule() {
    let cie = Label::new();
    let fde = Label::new();
    let insn = Label::new();
    let section = FrameSection::debug_frame(Endianness::Little, 4)
        .mark(&cie)
        .cie(1, -4, 8, 1, "", false)
        .finish_entry()
        .mark(&fde)
        .fde(&cie, 0x400, 0x80, false)
        .d8(DW_CFA_undefined)
        .uleb(5)
        .mark(&insn)
        .d8((DW_CFA_offset_hi << 6) | 6)
        .uleb(2)
        .finish_entry();

    let (ok, events, reports) = run(section);
    assert!(!ok);
    assert_eq!(events, [
        entry(&fde, 0x400, 0x80, 1, 8),
        Event::Undefined(0x400, r(5)),
        Event::End,
    ]);
    assert_eq!(reports, [Error::NoCfaRule {
        offset: fde.value().unwrap(),
        kind: EntryKind::Fde,
        insn_offset: insn.value().unwrap(),
    }]);
}

#[test]
fn empty_state_stack() {
    let stock = Stock::new(4);
    let insn = Label::new();
    let section = stock
        .write(FrameSection::debug_frame(Endianness::Big, 4))
        .mark(&insn)
        .d8(DW_CFA_restore_state)
        .finish_entry();

    let (ok, events, reports) = run(section);
    assert!(!ok);
    let mut expected = stock.prefix();
    expected.push(Event::End);
    assert_eq!(events, expected);
    assert_eq!(reports, [Error::EmptyStateStack {
        offset: stock.fde.value().unwrap(),
        kind: EntryKind::Fde,
        insn_offset: insn.value().unwrap(),
    }]);
}

#[test]
fn clearing_cfa_rule() {
    let cie = Label::new();
    let fde = Label::new();
    let insn = Label::new();
    let section = FrameSection::debug_frame(Endianness::Little, 8)
        .mark(&cie)
        .cie(1, -8, 16, 3, "", false)
        .finish_entry()
        .mark(&fde)
        .fde(&cie, 0x9000, 0x40, false)
        .d8(DW_CFA_remember_state)
        .d8(DW_CFA_def_cfa)
        .uleb(7)
        .uleb(8)
        .mark(&insn)
        .d8(DW_CFA_restore_state)
        .finish_entry();

    let (ok, events, reports) = run(section);
    assert!(!ok);
    assert_eq!(events, [
        entry(&fde, 0x9000, 0x40, 3, 16),
        Event::ValOffset(0x9000, CFA, r(7), 8),
        Event::End,
    ]);
    assert_eq!(reports, [Error::ClearingCfaRule {
        offset: fde.value().unwrap(),
        kind: EntryKind::Fde,
        insn_offset: insn.value().unwrap(),
    }]);
}

#[test]
fn truncated_operand_leaves_rules_alone() {
    let stock = Stock::new(8);
    let section = stock
        .write(FrameSection::debug_frame(Endianness::Little, 8))
        .d8(DW_CFA_def_cfa)
        .uleb(0x11)
        .finish_entry();

    let (ok, events, reports) = run(section);
    assert!(!ok);
    let mut expected = stock.prefix();
    expected.push(Event::End);
    assert_eq!(events, expected);
    assert_eq!(reports, [Error::Incomplete {
        offset: stock.fde.value().unwrap(),
        kind: EntryKind::Fde,
    }]);
}

#[test]
fn broken_entry_does_not_stop_the_walk() {
    let cie = Label::new();
    let bad = Label::new();
    let good = Label::new();
    let section = FrameSection::debug_frame(Endianness::Little, 4)
        .mark(&cie)
        .cie(2, 4, 3, 3, "", false)
        .d8(DW_CFA_def_cfa)
        .uleb(4)
        .uleb(0)
        .finish_entry()
        .mark(&bad)
        .fde(&cie, 0x100, 0x10, false)
        .d8(DW_CFA_restore_state)
        .finish_entry()
        .mark(&good)
        .fde(&cie, 0x200, 0x10, false)
        .d8(DW_CFA_same_value)
        .uleb(9)
        .finish_entry();

    let (ok, events, reports) = run(section);
    assert!(!ok);
    assert_eq!(events, [
        entry(&bad, 0x100, 0x10, 3, 3),
        Event::ValOffset(0x100, CFA, r(4), 0),
        Event::End,
        entry(&good, 0x200, 0x10, 3, 3),
        Event::ValOffset(0x200, CFA, r(4), 0),
        Event::SameValue(0x200, r(9)),
        Event::End,
    ]);
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].offset(), bad.value().unwrap());
}

#[test]
fn personality_abort_skips_end() {
    let cie = Label::new();
    let fde = Label::new();
    let section = FrameSection::debug_frame(Endianness::Little, 8)
        .mark(&cie)
        .cie(1, -8, 16, 1, "zP", false)
        .uleb(9)
        .d8(0x00)
        .d64(0x5d1a_90c4)
        .d8(DW_CFA_def_cfa)
        .uleb(7)
        .uleb(8)
        .finish_entry()
        .mark(&fde)
        .fde(&cie, 0x6000, 0x30, false)
        .uleb(0)
        .finish_entry();

    let stop = Event::Personality(0x5d1a_90c4, false);
    let handler = Recorder {
        abort_on: Some(stop.clone()),
        ..Recorder::default()
    };
    let (ok, events, reports) = run_with(section, handler);
    assert!(!ok);
    assert!(reports.is_empty());
    assert_eq!(events, [
        Event::Entry {
            offset: fde.value().unwrap(),
            address: 0x6000,
            length: 0x30,
            version: 1,
            augmentation: "zP".into(),
            return_address: 16,
        },
        stop,
    ]);
}

#[test]
fn start_is_repeatable() {
    let stock = Stock::new(4);
    let section = stock
        .write(FrameSection::debug_frame(Endianness::Big, 4))
        .d8(DW_CFA_undefined)
        .uleb(0x44)
        .finish_entry();
    let (data, reader, kind) = section.finish();
    let cfi = CallFrameInfo::new(&data, reader, kind);

    let mut first = Recorder::default();
    let mut second = Recorder::default();
    let mut reports = Reports::default();
    assert!(cfi.start(&mut first, &mut reports));
    assert!(cfi.start(&mut second, &mut reports));
    assert!(reports.0.is_empty());
    assert_eq!(first.events, second.events);
}

#[test]
fn messages_name_entry_and_offsets() {
    let error = Error::NoCfaRule {
        offset: 0x18,
        kind: EntryKind::Fde,
        insn_offset: 0x2c,
    };
    assert_eq!(
        error.to_string(),
        "CFI frame description entry at offset 0x18: the instruction at offset 0x2c \
         assumes that a CFA rule has been set, but none has been set"
    );
    assert_eq!(error.offset(), 0x18);
    assert!(!error.is_warning());
    assert!(Error::EarlyEhTerminator { offset: 0 }.is_warning());
}

/// A CIE and FDE as emitted by a C compiler for x86_64.
#[rustfmt::skip]
const X86_64_EH_FRAME: [u8; 52] = [
    // CIE
    0x14, 0, 0, 0, // length
    0, 0, 0, 0, // id
    1, // version
    0x7a, 0x52, 0, // "zR"
    1, // code alignment factor
    0x78, // data alignment factor -8
    0x10, // return address register
    1, // augmentation length
    0x1b, // pcrel sdata4
    0x0c, 7, 8, // def_cfa rsp+8
    0x90, 1, // offset r16 at cfa-8
    0, 0,
    // FDE
    0x14, 0, 0, 0, // length
    0x1c, 0, 0, 0, // CIE pointer
    0xe0, 0xff, 0xff, 0xff, // pc begin, -32 from here
    0x10, 0, 0, 0, // pc range
    0, // augmentation length
    0x41, // advance_loc 1
    0x0e, 0x10, // def_cfa_offset 16
    0x86, 0x02, // offset rbp at cfa-16
    0, 0,
    // terminator
    0, 0, 0, 0,
];

fn x86_64_events() -> Vec<Event> {
    vec![
        Event::Entry {
            offset: 24,
            address: 0x1000,
            length: 16,
            version: 1,
            augmentation: "zR".into(),
            return_address: 16,
        },
        Event::ValOffset(0x1000, CFA, r(7), 8),
        Event::Offset(0x1000, r(16), CFA, -8),
        Event::ValOffset(0x1001, CFA, r(7), 16),
        Event::Offset(0x1001, r(6), CFA, -16),
        Event::End,
    ]
}

#[test]
fn x86_64_compiler_output() {
    let reader = ByteReader::new(Endianness::Little, 8).with_section_base(0x1000);
    let cfi = CallFrameInfo::new(&X86_64_EH_FRAME, reader, CfiSection::EhFrame);

    let mut handler = Recorder::default();
    let mut reports = Reports::default();
    assert!(cfi.start(&mut handler, &mut reports));
    assert!(reports.0.is_empty(), "{:?}", reports.0);
    assert_eq!(handler.events, x86_64_events());
}

#[test]
fn from_sections_uses_section_address() {
    let mut sections = SectionMap::new();
    assert!(sections.insert("__eh_frame", &X86_64_EH_FRAME, 0x1000));
    assert!(CallFrameInfo::from_sections(
        &sections,
        ByteReader::new(Endianness::Little, 8),
        CfiSection::DebugFrame
    )
    .is_none());

    let cfi = CallFrameInfo::from_sections(
        &sections,
        ByteReader::new(Endianness::Little, 8),
        CfiSection::EhFrame,
    )
    .unwrap();
    let mut handler = Recorder::default();
    let mut reports = Reports::default();
    assert!(cfi.start(&mut handler, &mut reports));
    assert_eq!(handler.events, x86_64_events());
}

#[test]
fn incomplete_64bit_length() {
    let section = FrameSection::debug_frame(Endianness::Little, 8)
        .d32(0xffff_ffff)
        .d32(0x18);
    let (ok, events, reports) = run(section);
    assert!(!ok);
    assert!(events.is_empty());
    assert_eq!(reports, [Error::Incomplete {
        offset: 0,
        kind: EntryKind::Unknown,
    }]);
}

#[test]
fn lone_cie() {
    let section = FrameSection::debug_frame(Endianness::Big, 8)
        .cie(1, -8, 16, 3, "", false)
        .d8(DW_CFA_def_cfa)
        .uleb(7)
        .uleb(8)
        .finish_entry();
    let (ok, events, reports) = run(section);
    assert!(ok);
    assert!(events.is_empty());
    assert!(reports.is_empty());
}

#[test]
fn fde_before_its_cie() {
    let cie = Label::new();
    let fde = Label::new();
    let section = FrameSection::debug_frame(Endianness::Little, 4)
        .mark(&fde)
        .fde(&cie, 0x3000, 0x20, false)
        .d8(DW_CFA_undefined)
        .uleb(2)
        .finish_entry()
        .mark(&cie)
        .cie(1, -4, 8, 1, "", false)
        .d8(DW_CFA_def_cfa)
        .uleb(4)
        .uleb(4)
        .finish_entry();

    let (ok, events, reports) = run(section);
    assert!(ok, "{reports:?}");
    assert_eq!(events, [
        entry(&fde, 0x3000, 0x20, 1, 8),
        Event::ValOffset(0x3000, CFA, r(4), 4),
        Event::Undefined(0x3000, r(2)),
        Event::End,
    ]);
}

#[test]
fn two_cies() {
    let first = Label::new();
    let second = Label::new();
    let (fde1, fde2) = (Label::new(), Label::new());
    let section = FrameSection::debug_frame(Endianness::Big, 8)
        .mark(&first)
        .cie(1, -8, 0x10, 3, "", false)
        .d8(DW_CFA_def_cfa)
        .uleb(7)
        .uleb(8)
        .finish_entry()
        .mark(&second)
        .cie(4, 4, 0x1e, 1, "", true)
        .d8(DW_CFA_def_cfa)
        .uleb(0x1d)
        .uleb(0)
        .finish_entry()
        .mark(&fde1)
        .fde(&second, 0x5000, 0x40, true)
        .d8((DW_CFA_advance_loc_hi << 6) | 2)
        .d8(DW_CFA_undefined)
        .uleb(1)
        .finish_entry()
        .mark(&fde2)
        .fde(&first, 0x6000, 0x40, false)
        .d8((DW_CFA_advance_loc_hi << 6) | 2)
        .d8(DW_CFA_undefined)
        .uleb(1)
        .finish_entry();

    let (ok, events, reports) = run(section);
    assert!(ok, "{reports:?}");
    assert_eq!(events, [
        entry(&fde1, 0x5000, 0x40, 1, 0x1e),
        Event::ValOffset(0x5000, CFA, r(0x1d), 0),
        Event::Undefined(0x5008, r(1)),
        Event::End,
        entry(&fde2, 0x6000, 0x40, 3, 0x10),
        Event::ValOffset(0x6000, CFA, r(7), 8),
        Event::Undefined(0x6002, r(1)),
        Event::End,
    ]);
}
