//! # Instruction Module
//!
//! Fixed-width 32-bit instruction words for the Totem virtual machine, and
//! the tagged [`Operation`] form the compiler builds before finalizing.
//!
//! ## Layout
//! ```text
//!  31        23 22       14 13        5 4    0
//! +-----------+-----------+-----------+------+
//! |     C     |     B     |     A     |  op  |   ABC
//! +-----------+-----------+-----------+------+
//! |          Bx           |     A     |  op  |   ABX
//! +-----------------------+-----------+------+
//! |                 Ax                |  op  |   AX
//! +-----------------------------------+------+
//! ```
//!
//! ## Design Notes
//! - Register operands carry a scope bit (local/global) below an 8-bit index.
//! - Signed immediates use sign-magnitude packing, not two's complement.
//! - Every setter is range-checked and leaves the word untouched on failure.

use std::fmt;

use crate::error::{EvalError, EvalResult};

// -----------------------------------------------------------------------------
// FIELD LAYOUT
// -----------------------------------------------------------------------------

pub const OP_BITS: u32 = 5;
pub const A_BITS: u32 = 9;
pub const B_BITS: u32 = 9;
pub const C_BITS: u32 = 9;
pub const BX_BITS: u32 = B_BITS + C_BITS;
pub const AX_BITS: u32 = A_BITS + B_BITS + C_BITS;

const OP_SHIFT: u32 = 0;
const A_SHIFT: u32 = OP_BITS;
const B_SHIFT: u32 = A_SHIFT + A_BITS;
const C_SHIFT: u32 = B_SHIFT + B_BITS;
const BX_SHIFT: u32 = B_SHIFT;
const AX_SHIFT: u32 = A_SHIFT;

/// Bits used by a register index inside a register operand.
pub const REGISTER_INDEX_BITS: u32 = A_BITS - 1;
/// Registers addressable per scope.
pub const MAX_REGISTERS: usize = 1 << REGISTER_INDEX_BITS;

pub const BX_UNSIGNED_MAX: u32 = (1 << BX_BITS) - 1;
pub const BX_SIGNED_MAX: i32 = (1 << (BX_BITS - 1)) - 1;
pub const AX_UNSIGNED_MAX: u32 = (1 << AX_BITS) - 1;
pub const AX_SIGNED_MAX: i32 = (1 << (AX_BITS - 1)) - 1;

#[inline]
const fn mask(bits: u32) -> u32 {
    (1u32 << bits) - 1
}

// -----------------------------------------------------------------------------
// OPCODES
// -----------------------------------------------------------------------------

/// Every operation the VM understands. Fits in [`OP_BITS`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    /// `A = B`
    Move = 0,
    /// `A = B + C`
    Add,
    /// `A = B - C`
    Subtract,
    /// `A = B * C`
    Multiply,
    /// `A = B / C`
    Divide,
    /// `A = B ** C`
    Power,
    /// `A = B == C`
    Equals,
    /// `A = B != C`
    NotEquals,
    /// `A = B < C`
    LessThan,
    /// `A = B <= C`
    LessThanEquals,
    /// `A = B > C`
    MoreThan,
    /// `A = B >= C`
    MoreThanEquals,
    /// `A = B && C`
    LogicalAnd,
    /// `A = B || C`
    LogicalOr,
    /// Skip `Bx` instructions (relative to this one) when `A` is falsy.
    ConditionalGoto,
    /// Jump by `Ax` instructions relative to this one.
    Goto,
    /// Return `A` when `Bx` carries [`RETURN_REGISTER`].
    Return,
    /// Pass `A` as an argument; the first one carries the count in `Bx`.
    FunctionArg,
    /// Call native function `Bx`, result in `A`.
    NativeFunction,
    /// Call script function `Bx`, result in `A`.
    ScriptFunction,
    /// Call whatever callable value `B` holds, result in `A`.
    Invoke,
    /// `A = new array of size B`
    NewArray,
    /// `A = new object`
    NewObject,
    /// `A = B[C]`
    ComplexGet,
    /// `A[B] = C`
    ComplexSet,
    /// `A = B[C]`, removing the entry from `B`.
    ComplexShift,
    /// `A = typeof(B) == C`
    Is,
    /// `A = B as C`
    As,
}

impl Opcode {
    const ALL: [Opcode; 28] = [
        Opcode::Move,
        Opcode::Add,
        Opcode::Subtract,
        Opcode::Multiply,
        Opcode::Divide,
        Opcode::Power,
        Opcode::Equals,
        Opcode::NotEquals,
        Opcode::LessThan,
        Opcode::LessThanEquals,
        Opcode::MoreThan,
        Opcode::MoreThanEquals,
        Opcode::LogicalAnd,
        Opcode::LogicalOr,
        Opcode::ConditionalGoto,
        Opcode::Goto,
        Opcode::Return,
        Opcode::FunctionArg,
        Opcode::NativeFunction,
        Opcode::ScriptFunction,
        Opcode::Invoke,
        Opcode::NewArray,
        Opcode::NewObject,
        Opcode::ComplexGet,
        Opcode::ComplexSet,
        Opcode::ComplexShift,
        Opcode::Is,
        Opcode::As,
    ];

    /// Decodes a raw opcode number.
    #[inline]
    pub fn from_u8(raw: u8) -> Option<Opcode> {
        Self::ALL.get(raw as usize).copied()
    }

    /// All defined opcodes, in encoding order.
    pub fn all() -> &'static [Opcode] {
        &Self::ALL
    }
}

/// `Return` flag: copy register `A` into the caller's return slot.
pub const RETURN_REGISTER: u32 = 1;
/// `Return` flag: final return of the function body; coroutines reset.
pub const RETURN_LAST: u32 = 2;

// -----------------------------------------------------------------------------
// OPERANDS
// -----------------------------------------------------------------------------

/// Which register space an operand addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    /// The current call frame's registers.
    Local = 0,
    /// The current actor's global registers.
    Global = 1,
}

/// A register reference: scope plus index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Operand {
    pub scope: Scope,
    pub index: u32,
}

impl Operand {
    #[inline]
    pub fn local(index: u32) -> Self {
        Self {
            scope: Scope::Local,
            index,
        }
    }

    #[inline]
    pub fn global(index: u32) -> Self {
        Self {
            scope: Scope::Global,
            index,
        }
    }

    fn encode(self) -> EvalResult<u32> {
        if self.index > mask(REGISTER_INDEX_BITS) {
            return Err(EvalError::InstructionOverflow);
        }
        Ok((self.index << 1) | self.scope as u32)
    }

    fn decode(raw: u32) -> Self {
        let scope = if raw & 1 == 1 {
            Scope::Global
        } else {
            Scope::Local
        };
        Self {
            scope,
            index: raw >> 1,
        }
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.scope {
            Scope::Local => write!(f, "l{}", self.index),
            Scope::Global => write!(f, "g{}", self.index),
        }
    }
}

// -----------------------------------------------------------------------------
// SIGN-MAGNITUDE HELPERS
// -----------------------------------------------------------------------------

fn pack_signed(value: i32, bits: u32) -> EvalResult<u32> {
    let magnitude = value.unsigned_abs();
    if magnitude > mask(bits - 1) {
        return Err(EvalError::InstructionOverflow);
    }
    let sign = if value < 0 { 1 << (bits - 1) } else { 0 };
    Ok(sign | magnitude)
}

fn unpack_signed(raw: u32, bits: u32) -> i32 {
    let magnitude = (raw & mask(bits - 1)) as i32;
    if raw >> (bits - 1) & 1 == 1 {
        -magnitude
    } else {
        magnitude
    }
}

// -----------------------------------------------------------------------------
// INSTRUCTION
// -----------------------------------------------------------------------------

/// One packed VM instruction.
#[derive(Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct Instruction(u32);

impl Instruction {
    /// Wraps a raw word.
    #[inline]
    pub fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// The raw packed word.
    #[inline]
    pub fn raw(self) -> u32 {
        self.0
    }

    #[inline]
    fn get_field(self, shift: u32, bits: u32) -> u32 {
        (self.0 >> shift) & mask(bits)
    }

    #[inline]
    fn put_field(&mut self, shift: u32, bits: u32, value: u32) {
        let m = mask(bits) << shift;
        self.0 = (self.0 & !m) | ((value << shift) & m);
    }

    pub fn set_op(&mut self, op: Opcode) -> EvalResult<()> {
        let raw = op as u32;
        if raw > mask(OP_BITS) {
            return Err(EvalError::InstructionOverflow);
        }
        self.put_field(OP_SHIFT, OP_BITS, raw);
        Ok(())
    }

    pub fn set_register_a(&mut self, operand: Operand) -> EvalResult<()> {
        let raw = operand.encode()?;
        self.put_field(A_SHIFT, A_BITS, raw);
        Ok(())
    }

    pub fn set_register_b(&mut self, operand: Operand) -> EvalResult<()> {
        let raw = operand.encode()?;
        self.put_field(B_SHIFT, B_BITS, raw);
        Ok(())
    }

    pub fn set_register_c(&mut self, operand: Operand) -> EvalResult<()> {
        let raw = operand.encode()?;
        self.put_field(C_SHIFT, C_BITS, raw);
        Ok(())
    }

    pub fn set_bx_unsigned(&mut self, value: u32) -> EvalResult<()> {
        if value > BX_UNSIGNED_MAX {
            return Err(EvalError::InstructionOverflow);
        }
        self.put_field(BX_SHIFT, BX_BITS, value);
        Ok(())
    }

    pub fn set_bx_signed(&mut self, value: i32) -> EvalResult<()> {
        let raw = pack_signed(value, BX_BITS)?;
        self.put_field(BX_SHIFT, BX_BITS, raw);
        Ok(())
    }

    pub fn set_ax_unsigned(&mut self, value: u32) -> EvalResult<()> {
        if value > AX_UNSIGNED_MAX {
            return Err(EvalError::InstructionOverflow);
        }
        self.put_field(AX_SHIFT, AX_BITS, value);
        Ok(())
    }

    pub fn set_ax_signed(&mut self, value: i32) -> EvalResult<()> {
        let raw = pack_signed(value, AX_BITS)?;
        self.put_field(AX_SHIFT, AX_BITS, raw);
        Ok(())
    }

    /// The opcode, or `None` for an undefined opcode number.
    #[inline]
    pub fn op(self) -> Option<Opcode> {
        Opcode::from_u8(self.get_field(OP_SHIFT, OP_BITS) as u8)
    }

    #[inline]
    pub fn register_a(self) -> Operand {
        Operand::decode(self.get_field(A_SHIFT, A_BITS))
    }

    #[inline]
    pub fn register_b(self) -> Operand {
        Operand::decode(self.get_field(B_SHIFT, B_BITS))
    }

    #[inline]
    pub fn register_c(self) -> Operand {
        Operand::decode(self.get_field(C_SHIFT, C_BITS))
    }

    #[inline]
    pub fn bx_unsigned(self) -> u32 {
        self.get_field(BX_SHIFT, BX_BITS)
    }

    #[inline]
    pub fn bx_signed(self) -> i32 {
        unpack_signed(self.get_field(BX_SHIFT, BX_BITS), BX_BITS)
    }

    #[inline]
    pub fn ax_unsigned(self) -> u32 {
        self.get_field(AX_SHIFT, AX_BITS)
    }

    #[inline]
    pub fn ax_signed(self) -> i32 {
        unpack_signed(self.get_field(AX_SHIFT, AX_BITS), AX_BITS)
    }
}

impl fmt::Debug for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Some(op) = self.op() else {
            return write!(f, "<invalid {:#010x}>", self.0);
        };
        match op {
            Opcode::Goto => write!(f, "{:?} {}", op, self.ax_signed()),
            Opcode::ConditionalGoto => {
                write!(f, "{:?} {} {}", op, self.register_a(), self.bx_signed())
            }
            Opcode::Return
            | Opcode::FunctionArg
            | Opcode::NativeFunction
            | Opcode::ScriptFunction => {
                write!(f, "{:?} {} {}", op, self.register_a(), self.bx_unsigned())
            }
            _ => write!(
                f,
                "{:?} {} {} {}",
                op,
                self.register_a(),
                self.register_b(),
                self.register_c()
            ),
        }
    }
}

// -----------------------------------------------------------------------------
// OPERATION
// -----------------------------------------------------------------------------

/// A wide immediate, signed or unsigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Immediate {
    Signed(i32),
    Unsigned(u32),
}

/// An instruction before packing, one variant per word layout.
///
/// Jump offsets are patched on this form; [`Operation::encode`] re-validates
/// the result every time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Abc {
        op: Opcode,
        a: Operand,
        b: Operand,
        c: Operand,
    },
    Abx {
        op: Opcode,
        a: Operand,
        bx: Immediate,
    },
    Ax {
        op: Opcode,
        ax: Immediate,
    },
}

impl Operation {
    pub fn op(&self) -> Opcode {
        match *self {
            Operation::Abc { op, .. } | Operation::Abx { op, .. } | Operation::Ax { op, .. } => op,
        }
    }

    /// Packs this operation into a word, checking every field.
    pub fn encode(&self) -> EvalResult<Instruction> {
        let mut ins = Instruction::default();
        match *self {
            Operation::Abc { op, a, b, c } => {
                ins.set_op(op)?;
                ins.set_register_a(a)?;
                ins.set_register_b(b)?;
                ins.set_register_c(c)?;
            }
            Operation::Abx { op, a, bx } => {
                ins.set_op(op)?;
                ins.set_register_a(a)?;
                match bx {
                    Immediate::Signed(v) => ins.set_bx_signed(v)?,
                    Immediate::Unsigned(v) => ins.set_bx_unsigned(v)?,
                }
            }
            Operation::Ax { op, ax } => {
                ins.set_op(op)?;
                match ax {
                    Immediate::Signed(v) => ins.set_ax_signed(v)?,
                    Immediate::Unsigned(v) => ins.set_ax_unsigned(v)?,
                }
            }
        }
        Ok(ins)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcodes_fit_their_field() {
        for op in Opcode::all() {
            assert!((*op as u32) <= mask(OP_BITS));
            assert_eq!(Opcode::from_u8(*op as u8), Some(*op));
        }
        assert_eq!(Opcode::from_u8(31), None);
    }

    #[test]
    fn sign_magnitude_layout() {
        let mut ins = Instruction::default();
        ins.set_bx_signed(-1).unwrap();
        assert_eq!(ins.raw() >> BX_SHIFT, (1 << (BX_BITS - 1)) | 1);
        assert_eq!(ins.bx_signed(), -1);
    }

    #[test]
    fn register_scope_bit() {
        let mut ins = Instruction::default();
        ins.set_register_a(Operand::global(3)).unwrap();
        assert_eq!((ins.raw() >> A_SHIFT) & mask(A_BITS), 0b111);
        assert_eq!(ins.register_a(), Operand::global(3));
    }

    #[test]
    fn overflow_leaves_word_untouched() {
        let mut ins = Instruction::default();
        ins.set_op(Opcode::Goto).unwrap();
        let before = ins;
        assert_eq!(
            ins.set_ax_signed(AX_SIGNED_MAX + 1),
            Err(EvalError::InstructionOverflow)
        );
        assert_eq!(
            ins.set_register_b(Operand::local(MAX_REGISTERS as u32)),
            Err(EvalError::InstructionOverflow)
        );
        assert_eq!(ins, before);
    }

    #[test]
    fn fields_do_not_bleed() {
        let mut ins = Instruction::default();
        ins.set_op(Opcode::As).unwrap();
        ins.set_register_a(Operand::local(255)).unwrap();
        ins.set_register_b(Operand::global(255)).unwrap();
        ins.set_register_c(Operand::local(0)).unwrap();
        assert_eq!(ins.op(), Some(Opcode::As));
        assert_eq!(ins.register_a(), Operand::local(255));
        assert_eq!(ins.register_b(), Operand::global(255));
        assert_eq!(ins.register_c(), Operand::local(0));
    }
}
