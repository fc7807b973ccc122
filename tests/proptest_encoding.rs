//! Property-based tests for instruction packing.
//!
//! Tests the following properties:
//! - every field round-trips through its setter and getter
//! - setting one field leaves the others alone
//! - an out-of-range value is rejected and the word is unchanged

use proptest::prelude::*;

use totem::error::EvalError;
use totem::instruction::{
    Immediate, Instruction, Opcode, Operand, Operation, AX_SIGNED_MAX, AX_UNSIGNED_MAX,
    BX_SIGNED_MAX, BX_UNSIGNED_MAX, MAX_REGISTERS,
};

// =============================================================================
// Strategies
// =============================================================================

fn arb_opcode() -> impl Strategy<Value = Opcode> {
    prop::sample::select(Opcode::all().to_vec())
}

fn arb_operand() -> impl Strategy<Value = Operand> {
    (0..MAX_REGISTERS as u32, any::<bool>()).prop_map(|(index, global)| {
        if global {
            Operand::global(index)
        } else {
            Operand::local(index)
        }
    })
}

// =============================================================================
// Round trips
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(512))]

    #[test]
    fn abc_round_trip(op in arb_opcode(), a in arb_operand(), b in arb_operand(), c in arb_operand()) {
        let ins = Operation::Abc { op, a, b, c }.encode().unwrap();
        prop_assert_eq!(ins.op(), Some(op));
        prop_assert_eq!(ins.register_a(), a);
        prop_assert_eq!(ins.register_b(), b);
        prop_assert_eq!(ins.register_c(), c);
    }

    #[test]
    fn abx_unsigned_round_trip(op in arb_opcode(), a in arb_operand(), bx in 0..=BX_UNSIGNED_MAX) {
        let ins = Operation::Abx { op, a, bx: Immediate::Unsigned(bx) }.encode().unwrap();
        prop_assert_eq!(ins.op(), Some(op));
        prop_assert_eq!(ins.register_a(), a);
        prop_assert_eq!(ins.bx_unsigned(), bx);
    }

    #[test]
    fn abx_signed_round_trip(a in arb_operand(), bx in -BX_SIGNED_MAX..=BX_SIGNED_MAX) {
        let ins = Operation::Abx { op: Opcode::ConditionalGoto, a, bx: Immediate::Signed(bx) }
            .encode()
            .unwrap();
        prop_assert_eq!(ins.register_a(), a);
        prop_assert_eq!(ins.bx_signed(), bx);
    }

    #[test]
    fn ax_round_trip(unsigned in 0..=AX_UNSIGNED_MAX, signed in -AX_SIGNED_MAX..=AX_SIGNED_MAX) {
        let ins = Operation::Ax { op: Opcode::Goto, ax: Immediate::Unsigned(unsigned) }
            .encode()
            .unwrap();
        prop_assert_eq!(ins.ax_unsigned(), unsigned);

        let ins = Operation::Ax { op: Opcode::Goto, ax: Immediate::Signed(signed) }
            .encode()
            .unwrap();
        prop_assert_eq!(ins.op(), Some(Opcode::Goto));
        prop_assert_eq!(ins.ax_signed(), signed);
    }

    #[test]
    fn setting_b_keeps_a_and_c(raw in any::<u32>(), b in arb_operand()) {
        let mut ins = Instruction::from_raw(raw);
        let (op, a, c) = (ins.op(), ins.register_a(), ins.register_c());
        ins.set_register_b(b).unwrap();
        prop_assert_eq!(ins.op(), op);
        prop_assert_eq!(ins.register_a(), a);
        prop_assert_eq!(ins.register_c(), c);
        prop_assert_eq!(ins.register_b(), b);
    }
}

// =============================================================================
// Overflow
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn register_overflow_leaves_word(raw in any::<u32>(), index in MAX_REGISTERS as u32..4096) {
        let mut ins = Instruction::from_raw(raw);
        prop_assert_eq!(ins.set_register_a(Operand::local(index)), Err(EvalError::InstructionOverflow));
        prop_assert_eq!(ins.set_register_b(Operand::global(index)), Err(EvalError::InstructionOverflow));
        prop_assert_eq!(ins.set_register_c(Operand::local(index)), Err(EvalError::InstructionOverflow));
        prop_assert_eq!(ins.raw(), raw);
    }

    #[test]
    fn bx_overflow_leaves_word(raw in any::<u32>(), excess in 1u32..1 << 12) {
        let mut ins = Instruction::from_raw(raw);
        prop_assert_eq!(ins.set_bx_unsigned(BX_UNSIGNED_MAX + excess), Err(EvalError::InstructionOverflow));
        prop_assert_eq!(ins.set_bx_signed(BX_SIGNED_MAX + excess as i32), Err(EvalError::InstructionOverflow));
        prop_assert_eq!(ins.set_bx_signed(-BX_SIGNED_MAX - excess as i32), Err(EvalError::InstructionOverflow));
        prop_assert_eq!(ins.raw(), raw);
    }

    #[test]
    fn ax_overflow_leaves_word(raw in any::<u32>(), excess in 1u32..1 << 4) {
        let mut ins = Instruction::from_raw(raw);
        prop_assert_eq!(ins.set_ax_unsigned(AX_UNSIGNED_MAX + excess), Err(EvalError::InstructionOverflow));
        prop_assert_eq!(ins.set_ax_signed(AX_SIGNED_MAX + excess as i32), Err(EvalError::InstructionOverflow));
        prop_assert_eq!(ins.set_ax_signed(-AX_SIGNED_MAX - excess as i32), Err(EvalError::InstructionOverflow));
        prop_assert_eq!(ins.raw(), raw);
    }
}
