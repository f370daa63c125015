//! Call-frame rules.
//!
//! Unwinding one stack frame produces a *row*: for every register of the
//! caller's frame, a rule describing how to recover its value from the
//! callee's frame, plus a rule for the canonical frame address (CFA) the
//! register rules may reference.

use crate::platform::RegisterNumber;

/// A rule to recover one register value (or the CFA) of the previous frame.
///
/// Rules that carry a DWARF expression borrow the instruction bytes from the
/// debug section they were parsed from.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum CfiRule<'a> {
    /// The value cannot be recovered.
    #[default]
    Undefined,
    /// The value is the given register's value in this frame plus an
    /// offset.
    ///
    /// A register's "same value" rule is expressed as the register itself
    /// plus zero.
    RegisterPlusOffset {
        /// Register holding the base value.
        regno: RegisterNumber,
        /// Signed offset added to the register value.
        offset: i64,
    },
    /// The value is stored in memory at the CFA plus an offset.
    AtCfaPlusOffset {
        /// Signed offset added to the CFA.
        offset: i64,
    },
    /// The value is the CFA plus an offset.
    CfaPlusOffset {
        /// Signed offset added to the CFA.
        offset: i64,
    },
    /// The value is the result of evaluating a DWARF expression.
    DwarfExpression {
        /// Expression instruction bytes.
        expr: &'a [u8],
        /// Whether the CFA is pushed on the stack before evaluation.
        push_cfa: bool,
    },
    /// The value is stored in memory at the result of evaluating a DWARF
    /// expression.
    AtDwarfExpression {
        /// Expression instruction bytes.
        expr: &'a [u8],
        /// Whether the CFA is pushed on the stack before evaluation.
        push_cfa: bool,
    },
}

impl<'a> CfiRule<'a> {
    /// The rule stating that a register keeps its value across the call.
    pub fn same_value(regno: RegisterNumber) -> Self {
        CfiRule::RegisterPlusOffset { regno, offset: 0 }
    }
}

/// One row of the call-frame table: the unwind rules that hold at a
/// particular program counter.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CfiRow<'a> {
    cfa: CfiRule<'a>,
    registers: Vec<CfiRule<'a>>,
}

impl<'a> CfiRow<'a> {
    /// Creates a row with every rule undefined.
    pub fn new() -> Self {
        CfiRow::default()
    }

    /// Returns the CFA rule.
    pub fn cfa(&self) -> CfiRule<'a> {
        self.cfa
    }

    /// Replaces the CFA rule.
    pub fn set_cfa(&mut self, rule: CfiRule<'a>) {
        self.cfa = rule;
    }

    /// Returns the rule for a register.
    pub fn register(&self, regno: RegisterNumber) -> CfiRule<'a> {
        self.registers
            .get(usize::from(regno))
            .copied()
            .unwrap_or_default()
    }

    /// Replaces the rule for a register.
    pub fn set_register(&mut self, regno: RegisterNumber, rule: CfiRule<'a>) {
        let index = usize::from(regno);
        if index >= self.registers.len() {
            self.registers.resize(index + 1, CfiRule::Undefined);
        }
        self.registers[index] = rule;
    }

    /// Iterates over all registers with a defined rule.
    pub fn iter(&self) -> impl Iterator<Item = (RegisterNumber, CfiRule<'a>)> + '_ {
        self.registers
            .iter()
            .enumerate()
            .filter(|(_, rule)| !matches!(rule, CfiRule::Undefined))
            .map(|(regno, rule)| (regno as RegisterNumber, *rule))
    }
}
