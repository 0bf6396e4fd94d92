//! Decoding and running CFA instructions.
//!
//! Source: https://dwarfstd.org/doc/DWARF5.pdf §6.4.2 Call Frame Instructions
#![allow(non_upper_case_globals)]

use alloc::vec::Vec;

use super::{
    rule::{Register, Rule, RuleMap},
    Cie, Entry, EntryKind, Error, Fde, Halt, Handler,
};
use crate::dwarf::{
    encoding::Encoding,
    reader::{Cursor, DecodeContext, ReadError},
};

pub(super) const DW_CFA_advance_loc_hi: u8 = 0x01;
pub(super) const DW_CFA_offset_hi: u8 = 0x02;
pub(super) const DW_CFA_restore_hi: u8 = 0x03;

pub(super) const DW_CFA_nop: u8 = 0;
pub(super) const DW_CFA_set_loc: u8 = 0x01;
pub(super) const DW_CFA_advance_loc1: u8 = 0x02;
pub(super) const DW_CFA_advance_loc2: u8 = 0x03;
pub(super) const DW_CFA_advance_loc4: u8 = 0x04;
pub(super) const DW_CFA_offset_extended: u8 = 0x05;
pub(super) const DW_CFA_restore_extended: u8 = 0x06;
pub(super) const DW_CFA_undefined: u8 = 0x07;
pub(super) const DW_CFA_same_value: u8 = 0x08;
pub(super) const DW_CFA_register: u8 = 0x09;
pub(super) const DW_CFA_remember_state: u8 = 0x0a;
pub(super) const DW_CFA_restore_state: u8 = 0x0b;
pub(super) const DW_CFA_def_cfa: u8 = 0x0c;
pub(super) const DW_CFA_def_cfa_register: u8 = 0x0d;
pub(super) const DW_CFA_def_cfa_offset: u8 = 0x0e;
pub(super) const DW_CFA_def_cfa_expression: u8 = 0x0f;
pub(super) const DW_CFA_expression: u8 = 0x10;
pub(super) const DW_CFA_offset_extended_sf: u8 = 0x11;
pub(super) const DW_CFA_def_cfa_sf: u8 = 0x12;
pub(super) const DW_CFA_def_cfa_offset_sf: u8 = 0x13;
pub(super) const DW_CFA_val_offset: u8 = 0x14;
pub(super) const DW_CFA_val_offset_sf: u8 = 0x15;
pub(super) const DW_CFA_val_expression: u8 = 0x16;
pub(super) const DW_CFA_MIPS_advance_loc8: u8 = 0x1d;
pub(super) const DW_CFA_GNU_window_save: u8 = 0x2d;
pub(super) const DW_CFA_GNU_args_size: u8 = 0x2e;
pub(super) const DW_CFA_GNU_negative_offset_extended: u8 = 0x2f;

/// One decoded instruction. Offsets and deltas are still unfactored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Instruction<'a> {
    // 6.4.2.1 Row Creation Instructions
    SetLoc(u64),
    AdvanceLoc(u8),
    AdvanceLoc1(u8),
    AdvanceLoc2(u16),
    AdvanceLoc4(u32),
    AdvanceLoc8(u64),

    // 6.4.2.2 CFA Definition Instructions
    DefCfa {
        register: u64,
        offset: u64,
    },
    DefCfaSf {
        register: u64,
        factored_offset: i64,
    },
    DefCfaRegister(u64),
    DefCfaOffset(u64),
    DefCfaOffsetSf(i64),
    DefCfaExpression(&'a [u8]),

    // 6.4.2.3 Register Rule Instructions
    Undefined(u64),
    SameValue(u64),
    Offset {
        register: u64,
        factored_offset: u64,
    },
    OffsetExtended {
        register: u64,
        factored_offset: u64,
    },
    OffsetExtendedSf {
        register: u64,
        factored_offset: i64,
    },
    NegativeOffsetExtended {
        register: u64,
        factored_offset: u64,
    },
    ValOffset {
        register: u64,
        factored_offset: u64,
    },
    ValOffsetSf {
        register: u64,
        factored_offset: i64,
    },
    Register {
        target_register: u64,
        from_register: u64,
    },
    Expression {
        register: u64,
        expr: &'a [u8],
    },
    ValExpression {
        register: u64,
        expr: &'a [u8],
    },
    Restore(u64),
    RestoreExtended(u64),

    // 6.4.2.4 Row State Instructions
    RememberState,
    RestoreState,

    // 6.4.2.5 Padding Instruction
    Nop,

    // GNU extensions
    WindowSave,
    ArgsSize(u64),
}

#[derive(Debug)]
enum DecodeError {
    Read(ReadError),
    Unrecognized,
}

impl From<ReadError> for DecodeError {
    fn from(error: ReadError) -> Self {
        DecodeError::Read(error)
    }
}

impl<'a> Instruction<'a> {
    /// Reads one whole instruction, operands included. `encoding` is the
    /// CIE's pointer encoding, which `DW_CFA_set_loc` uses.
    fn decode(
        data: &mut Cursor<'a>,
        ctx: &DecodeContext,
        encoding: Encoding,
    ) -> Result<Self, DecodeError> {
        let endian = ctx.reader().endian();
        let b = data.read_u8()?;
        let low_6 = b & (u8::MAX >> 2);
        Ok(match b >> 6 {
            DW_CFA_advance_loc_hi => Instruction::AdvanceLoc(low_6),
            DW_CFA_offset_hi => Instruction::Offset {
                register: u64::from(low_6),
                factored_offset: data.read_uleb128()?,
            },
            DW_CFA_restore_hi => Instruction::Restore(u64::from(low_6)),
            _ => match b {
                DW_CFA_nop => Instruction::Nop,
                DW_CFA_set_loc => Instruction::SetLoc(ctx.read_encoded_pointer(data, encoding)?),
                DW_CFA_advance_loc1 => Instruction::AdvanceLoc1(data.read_u8()?),
                DW_CFA_advance_loc2 => Instruction::AdvanceLoc2(data.read_u16(endian)?),
                DW_CFA_advance_loc4 => Instruction::AdvanceLoc4(data.read_u32(endian)?),
                DW_CFA_MIPS_advance_loc8 => Instruction::AdvanceLoc8(data.read_u64(endian)?),
                DW_CFA_offset_extended => Instruction::OffsetExtended {
                    register: data.read_uleb128()?,
                    factored_offset: data.read_uleb128()?,
                },
                DW_CFA_restore_extended => Instruction::RestoreExtended(data.read_uleb128()?),
                DW_CFA_undefined => Instruction::Undefined(data.read_uleb128()?),
                DW_CFA_same_value => Instruction::SameValue(data.read_uleb128()?),
                DW_CFA_register => Instruction::Register {
                    target_register: data.read_uleb128()?,
                    from_register: data.read_uleb128()?,
                },
                DW_CFA_remember_state => Instruction::RememberState,
                DW_CFA_restore_state => Instruction::RestoreState,
                DW_CFA_def_cfa => Instruction::DefCfa {
                    register: data.read_uleb128()?,
                    offset: data.read_uleb128()?,
                },
                DW_CFA_def_cfa_register => Instruction::DefCfaRegister(data.read_uleb128()?),
                DW_CFA_def_cfa_offset => Instruction::DefCfaOffset(data.read_uleb128()?),
                DW_CFA_def_cfa_expression => Instruction::DefCfaExpression(data.read_block()?),
                DW_CFA_expression => Instruction::Expression {
                    register: data.read_uleb128()?,
                    expr: data.read_block()?,
                },
                DW_CFA_offset_extended_sf => Instruction::OffsetExtendedSf {
                    register: data.read_uleb128()?,
                    factored_offset: data.read_sleb128()?,
                },
                DW_CFA_def_cfa_sf => Instruction::DefCfaSf {
                    register: data.read_uleb128()?,
                    factored_offset: data.read_sleb128()?,
                },
                DW_CFA_def_cfa_offset_sf => Instruction::DefCfaOffsetSf(data.read_sleb128()?),
                DW_CFA_val_offset => Instruction::ValOffset {
                    register: data.read_uleb128()?,
                    factored_offset: data.read_uleb128()?,
                },
                DW_CFA_val_offset_sf => Instruction::ValOffsetSf {
                    register: data.read_uleb128()?,
                    factored_offset: data.read_sleb128()?,
                },
                DW_CFA_val_expression => Instruction::ValExpression {
                    register: data.read_uleb128()?,
                    expr: data.read_block()?,
                },
                DW_CFA_GNU_window_save => Instruction::WindowSave,
                DW_CFA_GNU_args_size => Instruction::ArgsSize(data.read_uleb128()?),
                DW_CFA_GNU_negative_offset_extended => Instruction::NegativeOffsetExtended {
                    register: data.read_uleb128()?,
                    factored_offset: data.read_uleb128()?,
                },
                _ => return Err(DecodeError::Unrecognized),
            },
        })
    }
}

/// The interpreter for one FDE: the CIE's initial instructions, then the
/// FDE's own.
pub(crate) struct State<'h, 'c, 'a, H: ?Sized> {
    ctx: DecodeContext,
    handler: &'h mut H,
    cie: &'c Cie<'a>,
    /// The entry whose instructions are running.
    entry: Entry,
    cursor: Cursor<'a>,
    address: u64,
    rules: RuleMap<'a>,
    /// The rules once the CIE's instructions have run, for `DW_CFA_restore`.
    cie_rules: RuleMap<'a>,
    saved_rules: Vec<RuleMap<'a>>,
}

impl<'h, 'c, 'a, H: Handler + ?Sized> State<'h, 'c, 'a, H> {
    /// `ctx` must know the FDE's start address, which is also where the
    /// rules start applying.
    pub(crate) fn new(
        ctx: DecodeContext,
        handler: &'h mut H,
        cie: &'c Cie<'a>,
        address: u64,
    ) -> Self {
        Self {
            ctx,
            handler,
            cie,
            entry: cie.entry,
            cursor: cie.instructions,
            address,
            rules: RuleMap::new(),
            cie_rules: RuleMap::new(),
            saved_rules: Vec::new(),
        }
    }

    pub(crate) fn interpret_cie(&mut self) -> Result<(), Halt> {
        let cie = self.cie;
        self.interpret(cie.entry, cie.instructions)?;
        self.cie_rules = self.rules.clone();
        Ok(())
    }

    pub(crate) fn interpret_fde(&mut self, fde: &Fde<'_, 'a>) -> Result<(), Halt> {
        self.interpret(fde.entry, fde.instructions)
    }

    fn interpret(&mut self, entry: Entry, instructions: Cursor<'a>) -> Result<(), Halt> {
        self.entry = entry;
        self.cursor = instructions;
        while !self.cursor.is_empty() {
            self.do_instruction()?;
        }
        Ok(())
    }

    fn do_instruction(&mut self) -> Result<(), Halt> {
        let insn_offset = self.cursor.offset();
        let mut peek = self.cursor;
        let opcode = peek.read_u8().ok();
        let decoded = Instruction::decode(&mut self.cursor, &self.ctx, self.cie.pointer_encoding);
        let insn = match decoded {
            Ok(insn) => insn,
            Err(DecodeError::Unrecognized) => {
                return Err(Halt::Error(Error::BadInstruction {
                    offset: self.entry.offset as u64,
                    kind: self.entry.kind,
                    insn_offset: insn_offset as u64,
                }))
            }
            Err(DecodeError::Read(
                ReadError::NoBase(encoding) | ReadError::InvalidEncoding(encoding),
            )) => {
                return Err(Halt::Error(Error::UnusablePointerEncoding {
                    offset: self.cie.offset,
                    encoding: encoding.0,
                }))
            }
            // `def_cfa_register` checks for a CFA rule before reading its
            // operand.
            Err(DecodeError::Read(ReadError::UnexpectedEnd { .. }))
                if opcode == Some(DW_CFA_def_cfa_register) && self.rules.cfa_rule().is_none() =>
            {
                return Err(self.no_cfa_rule(insn_offset));
            }
            Err(DecodeError::Read(ReadError::UnexpectedEnd { .. })) => {
                return Err(Halt::Error(Error::Incomplete {
                    offset: self.entry.offset as u64,
                    kind: self.entry.kind,
                }))
            }
        };
        trace!(?insn, offset = insn_offset, address = self.address);
        self.execute(insn, insn_offset)
    }

    fn execute(&mut self, insn: Instruction<'a>, insn_offset: usize) -> Result<(), Halt> {
        let data_alignment_factor = self.cie.data_alignment_factor;

        match insn {
            Instruction::SetLoc(address) => self.address = address,
            Instruction::AdvanceLoc(delta) => self.advance(u64::from(delta)),
            Instruction::AdvanceLoc1(delta) => self.advance(u64::from(delta)),
            Instruction::AdvanceLoc2(delta) => self.advance(u64::from(delta)),
            Instruction::AdvanceLoc4(delta) => self.advance(u64::from(delta)),
            Instruction::AdvanceLoc8(delta) => self.advance(delta),

            Instruction::DefCfa { register, offset } => {
                self.def_cfa(Rule::ValOffset {
                    base: Register::Number(register),
                    offset: offset as i64,
                })?;
            }
            Instruction::DefCfaSf {
                register,
                factored_offset,
            } => {
                self.def_cfa(Rule::ValOffset {
                    base: Register::Number(register),
                    offset: factored_offset.wrapping_mul(data_alignment_factor),
                })?;
            }
            Instruction::DefCfaRegister(register) => {
                self.change_cfa(insn_offset, |rule| rule.set_base_register(register))?;
            }
            Instruction::DefCfaOffset(offset) => {
                self.change_cfa(insn_offset, |rule| rule.set_offset(offset as i64))?;
            }
            Instruction::DefCfaOffsetSf(factored_offset) => {
                let offset = factored_offset.wrapping_mul(data_alignment_factor);
                self.change_cfa(insn_offset, |rule| rule.set_offset(offset))?;
            }
            Instruction::DefCfaExpression(expr) => self.def_cfa(Rule::ValExpression(expr))?,

            Instruction::Undefined(register) => self.do_rule(register, Rule::Undefined)?,
            Instruction::SameValue(register) => self.do_rule(register, Rule::SameValue)?,
            Instruction::Offset {
                register,
                factored_offset,
            }
            | Instruction::OffsetExtended {
                register,
                factored_offset,
            } => {
                let offset = (factored_offset as i64).wrapping_mul(data_alignment_factor);
                self.do_cfa_relative_rule(insn_offset, register, Rule::Offset {
                    base: Register::Cfa,
                    offset,
                })?;
            }
            Instruction::OffsetExtendedSf {
                register,
                factored_offset,
            } => {
                let offset = factored_offset.wrapping_mul(data_alignment_factor);
                self.do_cfa_relative_rule(insn_offset, register, Rule::Offset {
                    base: Register::Cfa,
                    offset,
                })?;
            }
            Instruction::NegativeOffsetExtended {
                register,
                factored_offset,
            } => {
                let offset = (factored_offset as i64)
                    .wrapping_neg()
                    .wrapping_mul(data_alignment_factor);
                self.do_cfa_relative_rule(insn_offset, register, Rule::Offset {
                    base: Register::Cfa,
                    offset,
                })?;
            }
            Instruction::ValOffset {
                register,
                factored_offset,
            } => {
                let offset = (factored_offset as i64).wrapping_mul(data_alignment_factor);
                self.do_cfa_relative_rule(insn_offset, register, Rule::ValOffset {
                    base: Register::Cfa,
                    offset,
                })?;
            }
            Instruction::ValOffsetSf {
                register,
                factored_offset,
            } => {
                let offset = factored_offset.wrapping_mul(data_alignment_factor);
                self.do_cfa_relative_rule(insn_offset, register, Rule::ValOffset {
                    base: Register::Cfa,
                    offset,
                })?;
            }
            Instruction::Register {
                target_register,
                from_register,
            } => {
                let rule = Rule::Register(from_register);
                self.do_cfa_relative_rule(insn_offset, target_register, rule)?;
            }
            Instruction::Expression { register, expr } => {
                self.do_cfa_relative_rule(insn_offset, register, Rule::Expression(expr))?;
            }
            Instruction::ValExpression { register, expr } => {
                self.do_cfa_relative_rule(insn_offset, register, Rule::ValExpression(expr))?;
            }
            Instruction::Restore(register) | Instruction::RestoreExtended(register) => {
                self.restore(insn_offset, register)?;
            }

            Instruction::RememberState => self.saved_rules.push(self.rules.clone()),
            Instruction::RestoreState => self.restore_state(insn_offset)?,

            Instruction::Nop | Instruction::ArgsSize(_) => {}
            Instruction::WindowSave => self.window_save()?,
        }

        Ok(())
    }

    fn advance(&mut self, delta: u64) {
        self.address = self
            .address
            .wrapping_add(delta.wrapping_mul(self.cie.code_alignment_factor));
    }

    fn report(&mut self, reg: Register, rule: &Rule<'a>) -> Result<(), Halt> {
        if rule.handle(&mut *self.handler, self.address, reg).is_break() {
            return Err(Halt::Abort);
        }
        Ok(())
    }

    fn def_cfa(&mut self, rule: Rule<'a>) -> Result<(), Halt> {
        self.rules.set_cfa_rule(rule.clone());
        self.report(Register::Cfa, &rule)
    }

    /// Adjusts the existing CFA rule and reports it again, changed or not.
    fn change_cfa(
        &mut self,
        insn_offset: usize,
        change: impl FnOnce(&mut Rule<'a>),
    ) -> Result<(), Halt> {
        let Some(mut rule) = self.rules.cfa_rule().cloned() else {
            return Err(self.no_cfa_rule(insn_offset));
        };
        change(&mut rule);
        self.def_cfa(rule)
    }

    fn do_rule(&mut self, reg: u64, rule: Rule<'a>) -> Result<(), Halt> {
        self.rules.set_register_rule(reg, rule.clone());
        self.report(Register::Number(reg), &rule)
    }

    /// Rules that can only be evaluated once the CFA is known.
    fn do_cfa_relative_rule(
        &mut self,
        insn_offset: usize,
        reg: u64,
        rule: Rule<'a>,
    ) -> Result<(), Halt> {
        if self.rules.cfa_rule().is_none() {
            return Err(self.no_cfa_rule(insn_offset));
        }
        self.do_rule(reg, rule)
    }

    fn restore(&mut self, insn_offset: usize, reg: u64) -> Result<(), Halt> {
        if self.entry.kind == EntryKind::Cie {
            return Err(Halt::Error(Error::RestoreInCie {
                offset: self.entry.offset as u64,
                insn_offset: insn_offset as u64,
            }));
        }
        let rule = self
            .cie_rules
            .register_rule(reg)
            .cloned()
            .unwrap_or(Rule::SameValue);
        self.do_rule(reg, rule)
    }

    fn restore_state(&mut self, insn_offset: usize) -> Result<(), Halt> {
        let Some(saved) = self.saved_rules.pop() else {
            return Err(Halt::Error(Error::EmptyStateStack {
                offset: self.entry.offset as u64,
                kind: self.entry.kind,
                insn_offset: insn_offset as u64,
            }));
        };
        if self.rules.cfa_rule().is_some() && saved.cfa_rule().is_none() {
            self.saved_rules.push(saved);
            return Err(Halt::Error(Error::ClearingCfaRule {
                offset: self.entry.offset as u64,
                kind: self.entry.kind,
                insn_offset: insn_offset as u64,
            }));
        }
        if self
            .rules
            .handle_transition_to(&mut *self.handler, self.address, &saved)
            .is_break()
        {
            return Err(Halt::Abort);
        }
        self.rules = saved;
        Ok(())
    }

    /// SPARC register windows: the caller's out registers are the callee's
    /// in registers, and its locals and ins are saved at the CFA.
    fn window_save(&mut self) -> Result<(), Halt> {
        for reg in 8..16 {
            self.do_rule(reg, Rule::Register(reg + 16))?;
        }
        let address_size = i64::from(self.ctx.address_size());
        for reg in 16..32 {
            self.do_rule(reg, Rule::Offset {
                base: Register::Cfa,
                offset: (reg as i64 - 16) * address_size,
            })?;
        }
        Ok(())
    }

    fn no_cfa_rule(&self, insn_offset: usize) -> Halt {
        Halt::Error(Error::NoCfaRule {
            offset: self.entry.offset as u64,
            kind: self.entry.kind,
            insn_offset: insn_offset as u64,
        })
    }
}
