//! Restricted evaluator for initializer expressions.
//!
//! Only the four `*.const` opcodes, `get_global` and the terminating
//! `end` are legal. `get_global` may read only immutable imported
//! globals whose cells the host has already supplied.

use crate::error::VmError;
use crate::module::Module;
use crate::opcode::Opcode;
use crate::reader::Reader;
use crate::types::{Value, ValueType};

/// Evaluate one initializer expression to its single value, which must
/// have the declared type.
pub(crate) fn eval(
    module: &Module,
    bytes: &[u8],
    expected: ValueType,
) -> Result<Value, VmError> {
    let mut reader = Reader::new(bytes);
    let mut stack: Vec<Value> = Vec::new();

    loop {
        let opcode = Opcode::from_byte(reader.read_u8()?)?;

        if !opcode.is_init_expr() {
            return Err(VmError::InvalidInitExpression);
        }

        match opcode {
            Opcode::I32Const => stack.push(Value::from_i32(reader.read_vari32()?)),
            Opcode::I64Const => stack.push(Value::from_i64(reader.read_vari64()?)),
            Opcode::F32Const => stack.push(Value::from_f32(reader.read_f32_le()?)),
            Opcode::F64Const => stack.push(Value::from_f64(reader.read_f64_le()?)),

            Opcode::GetGlobal => {
                let global_idx = reader.read_varu32()?;
                let global = module
                    .globals
                    .get(global_idx as usize)
                    .ok_or(VmError::InvalidGlobalIndex)?;

                if !global.imported || global.mutable || !global.initialized {
                    return Err(VmError::InvalidInitExpression);
                }

                stack.push(Value::new(global.value, global.ty));
            }

            Opcode::End => break,

            _ => return Err(VmError::InvalidInitExpression),
        }
    }

    let value = stack.pop().ok_or(VmError::InvalidInitExpression)?;

    if !stack.is_empty() || !reader.at_end() {
        return Err(VmError::InvalidInitExpression);
    }

    if value.ty() != expected {
        return Err(VmError::StackTypeMismatch);
    }

    Ok(value)
}
