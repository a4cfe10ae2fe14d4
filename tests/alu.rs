use wasm_vm::opcode::Opcode;
use wasm_vm::prelude::*;

mod common;

use common::{Body, ModuleBuilder, F32, F64, I32, I64};

/// Instantiate a module whose single export applies `opcode` to its two
/// parameters.
fn binary_module(param: u8, result: u8, opcode: Opcode) -> Module {
    let mut builder = ModuleBuilder::new();
    let ty = builder.ty(&[param, param], &[result]);
    let func = builder.func(
        ty,
        Body::new().get_local(0).get_local(1).op(opcode).end(),
    );
    builder.export_func("op", func);

    Module::instantiate(&builder.build()).expect("instantiate")
}

fn unary_module(param: u8, result: u8, opcode: Opcode) -> Module {
    let mut builder = ModuleBuilder::new();
    let ty = builder.ty(&[param], &[result]);
    let func = builder.func(ty, Body::new().get_local(0).op(opcode).end());
    builder.export_func("op", func);

    Module::instantiate(&builder.build()).expect("instantiate")
}

fn i32_binary(opcode: Opcode, x: i32, y: i32) -> Result<i32, VmError> {
    let mut module = binary_module(I32, I32, opcode);
    let mut vm = Interpreter::new();
    assert!(vm.attach(&mut module));

    vm.push_i32(x).unwrap();
    vm.push_i32(y).unwrap();

    if vm.call(0) {
        Ok(vm.pop_i32().unwrap())
    } else {
        Err(vm.last_error().unwrap())
    }
}

fn i64_binary(opcode: Opcode, x: i64, y: i64) -> Result<i64, VmError> {
    let mut module = binary_module(I64, I64, opcode);
    let mut vm = Interpreter::new();
    assert!(vm.attach(&mut module));

    vm.push_i64(x).unwrap();
    vm.push_i64(y).unwrap();

    if vm.call(0) {
        Ok(vm.pop_i64().unwrap())
    } else {
        Err(vm.last_error().unwrap())
    }
}

fn f32_binary_bits(opcode: Opcode, x: u32, y: u32) -> u32 {
    let mut module = binary_module(F32, F32, opcode);
    let mut vm = Interpreter::new();
    assert!(vm.attach(&mut module));

    vm.push_f32(f32::from_bits(x)).unwrap();
    vm.push_f32(f32::from_bits(y)).unwrap();
    assert!(vm.call(0), "trapped: {:?}", vm.last_error());

    vm.pop_f32().unwrap().to_bits()
}

#[test]
fn i32_division() {
    assert_eq!(i32_binary(Opcode::I32DivS, 10, 3), Ok(3));
    assert_eq!(i32_binary(Opcode::I32DivS, -10, 3), Ok(-3));
    assert_eq!(
        i32_binary(Opcode::I32DivS, 10, 0),
        Err(VmError::I32DivideByZero)
    );
    assert_eq!(
        i32_binary(Opcode::I32DivS, i32::MIN, -1),
        Err(VmError::I32Overflow)
    );

    assert_eq!(i32_binary(Opcode::I32DivU, -1, 2), Ok(0x7FFF_FFFF));
    assert_eq!(
        i32_binary(Opcode::I32DivU, 1, 0),
        Err(VmError::I32DivideByZero)
    );
}

#[test]
fn i32_remainder() {
    assert_eq!(i32_binary(Opcode::I32RemS, 10, 3), Ok(1));
    assert_eq!(i32_binary(Opcode::I32RemS, -10, 3), Ok(-1));
    assert_eq!(
        i32_binary(Opcode::I32RemS, 7, 0),
        Err(VmError::I32DivideByZero)
    );

    // The MIN % -1 corner yields zero instead of trapping.
    assert_eq!(i32_binary(Opcode::I32RemS, i32::MIN, -1), Ok(0));

    assert_eq!(i32_binary(Opcode::I32RemU, -1, 10), Ok((u32::MAX % 10) as i32));
}

#[test]
fn i64_division() {
    assert_eq!(i64_binary(Opcode::I64DivS, 10, 3), Ok(3));
    assert_eq!(
        i64_binary(Opcode::I64DivS, 1, 0),
        Err(VmError::I64DivideByZero)
    );
    assert_eq!(
        i64_binary(Opcode::I64DivS, i64::MIN, -1),
        Err(VmError::I64Overflow)
    );
    assert_eq!(i64_binary(Opcode::I64RemS, i64::MIN, -1), Ok(0));
}

#[test]
fn integer_arithmetic_wraps() {
    assert_eq!(i32_binary(Opcode::I32Add, i32::MAX, 1), Ok(i32::MIN));
    assert_eq!(i32_binary(Opcode::I32Sub, i32::MIN, 1), Ok(i32::MAX));
    assert_eq!(i32_binary(Opcode::I32Mul, 0x4000_0000, 4), Ok(0));
    assert_eq!(i64_binary(Opcode::I64Add, i64::MAX, 1), Ok(i64::MIN));
}

#[test]
fn shifts_mask_their_amount() {
    assert_eq!(i32_binary(Opcode::I32Shl, 1, 33), Ok(2));
    assert_eq!(i32_binary(Opcode::I32ShrS, -8, 1), Ok(-4));
    assert_eq!(i32_binary(Opcode::I32ShrU, -8, 1), Ok(0x7FFF_FFFC));
    assert_eq!(i64_binary(Opcode::I64Shl, 1, 65), Ok(2));
}

#[test]
fn rotates_are_modulo_width() {
    assert_eq!(
        i32_binary(Opcode::I32Rotl, 0x8000_0001u32 as i32, 1),
        Ok(3)
    );
    assert_eq!(
        i32_binary(Opcode::I32Rotr, 3, 1),
        Ok(0x8000_0001u32 as i32)
    );
    assert_eq!(
        i32_binary(Opcode::I32Rotl, 0x8000_0001u32 as i32, 33),
        Ok(3)
    );
    assert_eq!(i64_binary(Opcode::I64Rotl, i64::MIN | 1, 1), Ok(3));
}

#[test]
fn bit_counting() {
    let mut module = unary_module(I32, I32, Opcode::I32Clz);
    let mut vm = Interpreter::new();
    assert!(vm.attach(&mut module));

    for (input, expected) in [(0, 32), (1, 31), (-1, 0), (0x0000_8000, 16)] {
        vm.push_i32(input).unwrap();
        assert!(vm.call(0));
        assert_eq!(vm.pop_i32().unwrap(), expected);
    }

    assert!(vm.detach());

    let mut module = unary_module(I32, I32, Opcode::I32Ctz);
    let mut vm = Interpreter::new();
    assert!(vm.attach(&mut module));

    for (input, expected) in [(0, 32), (1, 0), (0x0001_0000, 16)] {
        vm.push_i32(input).unwrap();
        assert!(vm.call(0));
        assert_eq!(vm.pop_i32().unwrap(), expected);
    }

    let mut module = unary_module(I32, I32, Opcode::I32Popcnt);
    let mut vm = Interpreter::new();
    assert!(vm.attach(&mut module));

    vm.push_i32(-1).unwrap();
    assert!(vm.call(0));
    assert_eq!(vm.pop_i32().unwrap(), 32);
}

#[test]
fn comparisons_are_sign_aware() {
    assert_eq!(i32_binary(Opcode::I32LtS, -1, 0), Ok(1));
    // As unsigned, -1 is the maximum.
    let mut module = binary_module(I32, I32, Opcode::I32LtU);
    let mut vm = Interpreter::new();
    assert!(vm.attach(&mut module));
    vm.push_i32(-1).unwrap();
    vm.push_i32(0).unwrap();
    assert!(vm.call(0));
    assert_eq!(vm.pop_i32().unwrap(), 0);
}

#[test]
fn nan_propagation_sets_quiet_bit() {
    // A signaling NaN payload comes out with the quiet bit OR-ed in,
    // everything else preserved.
    let signaling = 0x7FA0_0000;
    let result = f32_binary_bits(Opcode::F32Add, signaling, 1.0f32.to_bits());
    assert_eq!(result, 0x7FE0_0000);

    // The payload of the other operand is untouched when the first is
    // the NaN.
    let result = f32_binary_bits(Opcode::F32Mul, 1.0f32.to_bits(), signaling);
    assert_eq!(result, 0x7FE0_0000);
}

#[test]
fn min_max_distinguish_signed_zero() {
    let pos = 0.0f32.to_bits();
    let neg = (-0.0f32).to_bits();

    assert_eq!(f32_binary_bits(Opcode::F32Min, pos, neg), neg);
    assert_eq!(f32_binary_bits(Opcode::F32Min, neg, pos), neg);
    assert_eq!(f32_binary_bits(Opcode::F32Max, pos, neg), pos);
    assert_eq!(f32_binary_bits(Opcode::F32Max, neg, pos), pos);

    assert_eq!(
        f32_binary_bits(Opcode::F32Min, 1.0f32.to_bits(), 2.0f32.to_bits()),
        1.0f32.to_bits()
    );
}

#[test]
fn sqrt_edge_cases() {
    let mut module = unary_module(F32, F32, Opcode::F32Sqrt);
    let mut vm = Interpreter::new();
    assert!(vm.attach(&mut module));

    vm.push_f32(-0.0).unwrap();
    assert!(vm.call(0));
    assert_eq!(vm.pop_f32().unwrap().to_bits(), (-0.0f32).to_bits());

    vm.push_f32(-1.0).unwrap();
    assert!(vm.call(0));
    assert!(vm.pop_f32().unwrap().is_nan());

    vm.push_f32(9.0).unwrap();
    assert!(vm.call(0));
    assert_eq!(vm.pop_f32().unwrap(), 3.0);
}

#[test]
fn nearest_rounds_ties_to_even() {
    let mut module = unary_module(F64, F64, Opcode::F64Nearest);
    let mut vm = Interpreter::new();
    assert!(vm.attach(&mut module));

    for (input, expected) in [(2.5, 2.0), (3.5, 4.0), (-2.5, -2.0), (0.3, 0.0), (4.7, 5.0)] {
        vm.push_f64(input).unwrap();
        assert!(vm.call(0));
        assert_eq!(vm.pop_f64().unwrap(), expected);
    }

    // Negative fractions below one round to negative zero.
    vm.push_f64(-0.5).unwrap();
    assert!(vm.call(0));
    assert_eq!(vm.pop_f64().unwrap().to_bits(), (-0.0f64).to_bits());
}

#[test]
fn float_to_int_truncation_traps() {
    let mut module = unary_module(F32, I32, Opcode::I32TruncSF32);
    let mut vm = Interpreter::new();
    assert!(vm.attach(&mut module));

    vm.push_f32(-3.9).unwrap();
    assert!(vm.call(0));
    assert_eq!(vm.pop_i32().unwrap(), -3);

    vm.push_f32(f32::NAN).unwrap();
    assert!(!vm.call(0));
    assert_eq!(vm.last_error(), Some(VmError::InvalidIntegerConversion));

    vm.push_f32(3e9).unwrap();
    assert!(!vm.call(0));
    assert_eq!(vm.last_error(), Some(VmError::I32Overflow));

    assert!(vm.detach());

    let mut module = unary_module(F64, I32, Opcode::I32TruncUF64);
    let mut vm = Interpreter::new();
    assert!(vm.attach(&mut module));

    vm.push_f64(4294967295.0).unwrap();
    assert!(vm.call(0));
    assert_eq!(vm.pop_i32().unwrap(), -1);

    vm.push_f64(-0.7).unwrap();
    assert!(vm.call(0));
    assert_eq!(vm.pop_i32().unwrap(), 0);

    vm.push_f64(-1.0).unwrap();
    assert!(!vm.call(0));
    assert_eq!(vm.last_error(), Some(VmError::I32Overflow));
}

#[test]
fn widening_and_narrowing_conversions() {
    let mut module = unary_module(I32, I64, Opcode::I64ExtendUI32);
    let mut vm = Interpreter::new();
    assert!(vm.attach(&mut module));
    vm.push_i32(-1).unwrap();
    assert!(vm.call(0));
    assert_eq!(vm.pop_i64().unwrap(), 0xFFFF_FFFF);

    let mut module = unary_module(I32, I64, Opcode::I64ExtendSI32);
    let mut vm = Interpreter::new();
    assert!(vm.attach(&mut module));
    vm.push_i32(-1).unwrap();
    assert!(vm.call(0));
    assert_eq!(vm.pop_i64().unwrap(), -1);

    let mut module = unary_module(I64, I32, Opcode::I32WrapI64);
    let mut vm = Interpreter::new();
    assert!(vm.attach(&mut module));
    vm.push_i64(0x1_2345_6789).unwrap();
    assert!(vm.call(0));
    assert_eq!(vm.pop_i32().unwrap(), 0x2345_6789);

    let mut module = unary_module(I32, F32, Opcode::F32ConvertUI32);
    let mut vm = Interpreter::new();
    assert!(vm.attach(&mut module));
    vm.push_i32(-1).unwrap();
    assert!(vm.call(0));
    assert_eq!(vm.pop_f32().unwrap(), 4294967295.0f32);
}

#[test]
fn reinterpret_preserves_all_bits() {
    let mut module = unary_module(F32, I32, Opcode::I32ReinterpretF32);
    let mut vm = Interpreter::new();
    assert!(vm.attach(&mut module));

    for bits in [0u32, 0x8000_0000, 0x7FA0_0001, 0xFFC0_1234, 0x3F80_0000] {
        vm.push_f32(f32::from_bits(bits)).unwrap();
        assert!(vm.call(0));
        assert_eq!(vm.pop_i32().unwrap() as u32, bits);
    }

    let mut module = unary_module(I64, F64, Opcode::F64ReinterpretI64);
    let mut vm = Interpreter::new();
    assert!(vm.attach(&mut module));

    for bits in [0u64, 0x7FF4_0000_0000_0001, 0x8000_0000_0000_0000] {
        vm.push_i64(bits as i64).unwrap();
        assert!(vm.call(0));
        assert_eq!(vm.pop_f64().unwrap().to_bits(), bits);
    }
}

#[test]
fn copysign_moves_only_the_sign() {
    assert_eq!(
        f32_binary_bits(Opcode::F32Copysign, 1.5f32.to_bits(), (-2.0f32).to_bits()),
        (-1.5f32).to_bits()
    );
    assert_eq!(
        f32_binary_bits(Opcode::F32Copysign, (-1.5f32).to_bits(), 2.0f32.to_bits()),
        1.5f32.to_bits()
    );
}
