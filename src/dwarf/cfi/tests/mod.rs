mod entries;

use core::ops::ControlFlow;

use test_assembler::{Label, LabelMaker};

use self::assembler::FrameSection;
use super::{state::DW_CFA_def_cfa, CallFrameInfo, Error, Handler, Register, Reporter};

const CFA: Register = Register::Cfa;

fn r(reg: u64) -> Register {
    Register::Number(reg)
}

/// Everything a [`Recorder`] was told, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Event {
    Entry {
        offset: u64,
        address: u64,
        length: u64,
        version: u8,
        augmentation: String,
        return_address: u64,
    },
    Undefined(u64, Register),
    SameValue(u64, Register),
    Offset(u64, Register, Register, i64),
    ValOffset(u64, Register, Register, i64),
    Register(u64, Register, u64),
    Expression(u64, Register, Vec<u8>),
    ValExpression(u64, Register, Vec<u8>),
    Personality(u64, bool),
    Lsda(u64, bool),
    SignalHandler,
    End,
}

#[derive(Debug, Default)]
struct Recorder {
    pub events: Vec<Event>,
    /// Entries for functions starting at these addresses are declined.
    pub skip: Vec<u64>,
    /// Recording this event asks the parser to stop.
    pub abort_on: Option<Event>,
}

impl Recorder {
    fn record(&mut self, event: Event) -> ControlFlow<()> {
        let abort = self.abort_on.as_ref() == Some(&event);
        self.events.push(event);
        if abort {
            ControlFlow::Break(())
        } else {
            ControlFlow::Continue(())
        }
    }
}

impl Handler for Recorder {
    fn entry(
        &mut self,
        offset: u64,
        address: u64,
        length: u64,
        version: u8,
        augmentation: &str,
        return_address: u64,
    ) -> bool {
        self.events.push(Event::Entry {
            offset,
            address,
            length,
            version,
            augmentation: augmentation.into(),
            return_address,
        });
        !self.skip.contains(&address)
    }

    fn undefined_rule(&mut self, address: u64, reg: Register) -> ControlFlow<()> {
        self.record(Event::Undefined(address, reg))
    }

    fn same_value_rule(&mut self, address: u64, reg: Register) -> ControlFlow<()> {
        self.record(Event::SameValue(address, reg))
    }

    fn offset_rule(
        &mut self,
        address: u64,
        reg: Register,
        base: Register,
        offset: i64,
    ) -> ControlFlow<()> {
        self.record(Event::Offset(address, reg, base, offset))
    }

    fn val_offset_rule(
        &mut self,
        address: u64,
        reg: Register,
        base: Register,
        offset: i64,
    ) -> ControlFlow<()> {
        self.record(Event::ValOffset(address, reg, base, offset))
    }

    fn register_rule(
        &mut self,
        address: u64,
        reg: Register,
        base_register: u64,
    ) -> ControlFlow<()> {
        self.record(Event::Register(address, reg, base_register))
    }

    fn expression_rule(
        &mut self,
        address: u64,
        reg: Register,
        expression: &[u8],
    ) -> ControlFlow<()> {
        self.record(Event::Expression(address, reg, expression.to_vec()))
    }

    fn val_expression_rule(
        &mut self,
        address: u64,
        reg: Register,
        expression: &[u8],
    ) -> ControlFlow<()> {
        self.record(Event::ValExpression(address, reg, expression.to_vec()))
    }

    fn personality_routine(&mut self, address: u64, indirect: bool) -> ControlFlow<()> {
        self.record(Event::Personality(address, indirect))
    }

    fn language_specific_data_area(&mut self, address: u64, indirect: bool) -> ControlFlow<()> {
        self.record(Event::Lsda(address, indirect))
    }

    fn signal_handler(&mut self) -> ControlFlow<()> {
        self.record(Event::SignalHandler)
    }

    fn end(&mut self) {
        self.events.push(Event::End);
    }
}

#[derive(Debug, Default)]
struct Reports(pub Vec<Error>);

impl Reporter for Reports {
    fn report(&mut self, error: &Error) {
        self.0.push(error.clone());
    }
}

/// Runs the parser over `section`, returning its verdict.
fn parse(section: FrameSection, handler: &mut Recorder, reporter: &mut Reports) -> bool {
    let (data, reader, kind) = section.finish();
    CallFrameInfo::new(&data, reader, kind).start(handler, reporter)
}

/// A CIE that establishes a CFA rule and the header of an FDE using it. The
/// values match across tests so that only the instructions under test vary.
struct Stock {
    pub code_factor: u64,
    pub data_factor: i64,
    pub return_register: u64,
    pub version: u8,
    pub cfa_base_register: u64,
    pub cfa_offset: u64,
    pub fde_start: u64,
    pub fde_size: u64,
    pub fde: Label,
}

impl Stock {
    fn new(address_size: u8) -> Self {
        let (fde_start, fde_size, code_factor) = if address_size == 4 {
            (0xc628ecfb, 0x5dee04a2, 0x60b)
        } else {
            (0x0005c57ce7806bd3, 0x2699521b5e333100, 0x01008e32855274a8)
        };
        Self {
            code_factor,
            data_factor: 0xb6f,
            return_register: 0x9be1ed9f,
            version: 3,
            cfa_base_register: 0x383a3aa,
            cfa_offset: 0xf748,
            fde_start,
            fde_size,
            fde: Label::new(),
        }
    }

    /// Appends the CIE and the FDE header. The caller adds the FDE's
    /// instructions and finishes it.
    fn write(&self, section: FrameSection) -> FrameSection {
        let cie = Label::new();
        section
            .mark(&cie)
            .cie(
                self.code_factor,
                self.data_factor,
                self.return_register,
                self.version,
                "",
                false,
            )
            .d8(DW_CFA_def_cfa)
            .uleb(self.cfa_base_register)
            .uleb(self.cfa_offset)
            .finish_entry()
            .mark(&self.fde)
            .fde(&cie, self.fde_start, self.fde_size, false)
    }

    /// What the stock entries report before any FDE instruction runs.
    fn prefix(&self) -> Vec<Event> {
        vec![
            Event::Entry {
                offset: self.fde.value().unwrap(),
                address: self.fde_start,
                length: self.fde_size,
                version: self.version,
                augmentation: String::new(),
                return_address: self.return_register,
            },
            Event::ValOffset(
                self.fde_start,
                CFA,
                r(self.cfa_base_register),
                self.cfa_offset as i64,
            ),
        ]
    }

    /// The address `delta` code units into the function.
    fn at(&self, delta: u64) -> u64 {
        self.fde_start
            .wrapping_add(delta.wrapping_mul(self.code_factor))
    }

    fn offset(&self, factored: i64) -> i64 {
        factored.wrapping_mul(self.data_factor)
    }

    /// Parses `section` and checks that it succeeds with exactly the stock
    /// prefix, `events` and the end of the entry.
    fn assert_events(&self, section: FrameSection, events: Vec<Event>) {
        let mut handler = Recorder::default();
        let mut reports = Reports::default();
        assert!(parse(section, &mut handler, &mut reports));
        assert!(reports.0.is_empty(), "{:?}", reports.0);

        let mut expected = self.prefix();
        expected.extend(events);
        expected.push(Event::End);
        assert_eq!(handler.events, expected);
    }
}
