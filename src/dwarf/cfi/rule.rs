//! Register recovery rules and the sets of them in effect at an address.
//!
//! Source: https://dwarfstd.org/doc/DWARF5.pdf §6.4.1 Structure of Call Frame Information

use alloc::collections::BTreeMap;
use core::{fmt, ops::ControlFlow};

use super::Handler;

/// A register column: the CFA or a numbered machine register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Register {
    Cfa,
    Number(u64),
}

impl fmt::Display for Register {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Register::Cfa => f.write_str("CFA"),
            Register::Number(reg) => write!(f, "r{reg}"),
        }
    }
}

/// How to find a register's value in the caller's frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rule<'a> {
    /// A register that has this rule has no recoverable value in the previous
    /// frame. (By convention, it is not preserved by a callee.)
    Undefined,
    /// This register has not been modified from the previous frame.
    /// (By convention, it is preserved by the callee, but the callee has not
    /// modified it.)
    SameValue,
    /// The previous value of this register is saved at the address
    /// `base + offset`. `base` is the CFA for every rule the instructions can
    /// express.
    Offset { base: Register, offset: i64 },
    /// The previous value of this register is the value `base + offset`.
    ValOffset { base: Register, offset: i64 },
    /// The previous value of this register is stored in another register
    /// numbered R.
    Register(u64),
    /// The previous value of this register is located at the address produced
    /// by executing the DWARF expression.
    Expression(&'a [u8]),
    /// The previous value of this register is the value produced by executing
    /// the DWARF expression.
    ValExpression(&'a [u8]),
}

impl<'a> Rule<'a> {
    /// Tells `handler` that this rule applies to `reg` from `address` on.
    pub fn handle<H: Handler + ?Sized>(
        &self,
        handler: &mut H,
        address: u64,
        reg: Register,
    ) -> ControlFlow<()> {
        match *self {
            Rule::Undefined => handler.undefined_rule(address, reg),
            Rule::SameValue => handler.same_value_rule(address, reg),
            Rule::Offset { base, offset } => handler.offset_rule(address, reg, base, offset),
            Rule::ValOffset { base, offset } => handler.val_offset_rule(address, reg, base, offset),
            Rule::Register(base_register) => handler.register_rule(address, reg, base_register),
            Rule::Expression(expression) => handler.expression_rule(address, reg, expression),
            Rule::ValExpression(expression) => {
                handler.val_expression_rule(address, reg, expression)
            }
        }
    }

    /// Only a value-offset rule has a base register to change. Other rules
    /// are left alone.
    pub fn set_base_register(&mut self, reg: u64) {
        if let Rule::ValOffset { base, .. } = self {
            *base = Register::Number(reg);
        }
    }

    /// Only a value-offset rule has an offset to change. Other rules are left
    /// alone.
    pub fn set_offset(&mut self, new_offset: i64) {
        if let Rule::ValOffset { offset, .. } = self {
            *offset = new_offset;
        }
    }
}

/// The rules in effect at one address: an optional CFA rule and a rule for
/// each register that has one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleMap<'a> {
    cfa_rule: Option<Rule<'a>>,
    registers: BTreeMap<u64, Rule<'a>>,
}

impl<'a> RuleMap<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cfa_rule(&self) -> Option<&Rule<'a>> {
        self.cfa_rule.as_ref()
    }

    pub fn set_cfa_rule(&mut self, rule: Rule<'a>) {
        self.cfa_rule = Some(rule);
    }

    pub fn register_rule(&self, reg: u64) -> Option<&Rule<'a>> {
        self.registers.get(&reg)
    }

    pub fn set_register_rule(&mut self, reg: u64, rule: Rule<'a>) {
        self.registers.insert(reg, rule);
    }

    /// Registers with a rule, in ascending order.
    pub fn registers(&self) -> impl Iterator<Item = (u64, &Rule<'a>)> + '_ {
        self.registers.iter().map(|(&reg, rule)| (reg, rule))
    }

    /// Reports to `handler` what changes at `address` when `new_rules`
    /// replaces this map: the CFA rule if both have one and it differs, then
    /// in register order every rule that differs. A register that only this
    /// map has a rule for is reported as same-value, which is the usual
    /// default for callee-saved registers.
    ///
    /// `new_rules` is a previously remembered state, so it never has a
    /// register this map lacks.
    pub fn handle_transition_to<H: Handler + ?Sized>(
        &self,
        handler: &mut H,
        address: u64,
        new_rules: &RuleMap<'a>,
    ) -> ControlFlow<()> {
        if let (Some(old), Some(new)) = (&self.cfa_rule, &new_rules.cfa_rule) {
            if old != new {
                new.handle(handler, address, Register::Cfa)?;
            }
        }

        for (reg, old) in self.registers() {
            match new_rules.register_rule(reg) {
                None => handler.same_value_rule(address, Register::Number(reg))?,
                Some(new) if new != old => new.handle(handler, address, Register::Number(reg))?,
                Some(_) => {}
            }
        }

        ControlFlow::Continue(())
    }
}
