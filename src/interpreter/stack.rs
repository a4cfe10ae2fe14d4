//! Operand, control and call stack operations.
//!
//! The stacks have fixed configured maxima; exceeding one is a trap,
//! never a reallocation past the configured bound. Typed push/pop
//! helpers double as the host surface for staging call arguments and
//! collecting results.

use super::Interpreter;
use crate::consts::*;
use crate::error::VmError;
use crate::types::{BlockKind, Value, ValueType};

/// One `block`/`loop`/`if`/`func` scope on the executor's control
/// stack.
#[derive(Debug, Clone, Copy)]
pub struct ControlFrame {
    pub(crate) kind: BlockKind,
    pub(crate) signature: ValueType,
    /// Operand stack height on entry.
    pub(crate) entry_height: usize,
    /// Where a branch to this frame transfers: one past the matching
    /// `end` for blocks and ifs, the loop opcode itself for loops.
    pub(crate) branch_target: usize,
}

/// One function activation on the call stack.
#[derive(Debug, Clone, Copy)]
pub struct CallFrame {
    pub(crate) func_idx: u32,
    /// Caller cursor to restore on return.
    pub(crate) return_pc: usize,
    /// Operand stack index of local 0.
    pub(crate) frame_base: usize,
    /// Control stack height on entry.
    pub(crate) ctrl_base: usize,
}

impl CallFrame {
    pub const fn func_idx(&self) -> u32 {
        self.func_idx
    }
}

impl<'m> Interpreter<'m> {
    /* operand stack */

    pub(crate) fn push_value(&mut self, value: Value) -> Result<(), VmError> {
        if self.operand_stack.len() >= OPERAND_STACK_DEPTH {
            return Err(VmError::InvalidStackOperation);
        }
        self.operand_stack.push(value);
        Ok(())
    }

    pub(crate) fn pop_value(&mut self) -> Result<Value, VmError> {
        self.operand_stack
            .pop()
            .ok_or(VmError::InvalidStackOperation)
    }

    fn pop_expecting(&mut self, ty: ValueType) -> Result<Value, VmError> {
        let value = self.pop_value()?;
        if value.ty() != ty {
            return Err(VmError::StackTypeMismatch);
        }
        Ok(value)
    }

    /// Push an `i32` argument or intermediate value.
    pub fn push_i32(&mut self, value: i32) -> Result<(), VmError> {
        self.push_value(Value::from_i32(value))
    }

    /// Push an `i64` argument or intermediate value.
    pub fn push_i64(&mut self, value: i64) -> Result<(), VmError> {
        self.push_value(Value::from_i64(value))
    }

    /// Push an `f32` argument or intermediate value.
    pub fn push_f32(&mut self, value: f32) -> Result<(), VmError> {
        self.push_value(Value::from_f32(value))
    }

    /// Push an `f64` argument or intermediate value.
    pub fn push_f64(&mut self, value: f64) -> Result<(), VmError> {
        self.push_value(Value::from_f64(value))
    }

    /// Pop an `i32` result.
    pub fn pop_i32(&mut self) -> Result<i32, VmError> {
        self.pop_expecting(ValueType::I32).map(|v| v.as_i32())
    }

    /// Pop an `i64` result.
    pub fn pop_i64(&mut self) -> Result<i64, VmError> {
        self.pop_expecting(ValueType::I64).map(|v| v.as_i64())
    }

    /// Pop an `f32` result.
    pub fn pop_f32(&mut self) -> Result<f32, VmError> {
        self.pop_expecting(ValueType::F32).map(|v| v.as_f32())
    }

    /// Pop an `f64` result.
    pub fn pop_f64(&mut self) -> Result<f64, VmError> {
        self.pop_expecting(ValueType::F64).map(|v| v.as_f64())
    }

    /* control stack */

    pub(crate) fn push_frame(
        &mut self,
        kind: BlockKind,
        signature: ValueType,
        branch_target: usize,
    ) -> Result<(), VmError> {
        if self.control_stack.len() >= CONTROL_STACK_DEPTH {
            return Err(VmError::InvalidStackOperation);
        }

        self.control_stack.push(ControlFrame {
            kind,
            signature,
            entry_height: self.operand_stack.len(),
            branch_target,
        });

        Ok(())
    }

    /* call stack and locals */

    /// Operand stack slot of the current frame's local `local_idx`.
    ///
    /// Locals sit at the bottom of the frame's operand region:
    /// parameters first, then declared locals.
    pub(crate) fn local_slot(&self, local_idx: u32) -> Result<usize, VmError> {
        let frame = self
            .call_stack
            .last()
            .ok_or(VmError::InvalidStackOperation)?;

        let slot = frame.frame_base + local_idx as usize;
        let frame_entry = self
            .control_stack
            .get(frame.ctrl_base)
            .map(|ctrl| ctrl.entry_height)
            .ok_or(VmError::InvalidStackOperation)?;

        if slot >= frame_entry {
            return Err(VmError::InvalidLocalIndex);
        }

        Ok(slot)
    }

    /// Enter `func_idx`: consume its parameters off the operand stack
    /// as the leading locals, zero-fill the declared locals, and move
    /// the cursor to the callee's code.
    pub(crate) fn push_call(&mut self, func_idx: u32) -> Result<(), VmError> {
        if self.call_stack.len() >= CALL_STACK_DEPTH {
            return Err(VmError::InvalidStackOperation);
        }

        let module = self.module.as_deref().ok_or(VmError::InvalidInstructionStream)?;
        let func = *module.func(func_idx)?;
        let ty = *module.func_type(func_idx)?;

        let param_count = ty.param_count as usize;
        if self.operand_stack.len() < param_count {
            return Err(VmError::InvalidStackOperation);
        }
        let frame_base = self.operand_stack.len() - param_count;

        // Arguments double as the leading locals; their types were
        // fixed by validation for internal calls and are checked here
        // for host-staged top-level calls.
        let params = module.param_types(&ty);
        for (value, &expected) in self.operand_stack[frame_base..].iter().zip(params) {
            if value.ty() != expected {
                return Err(VmError::StackTypeMismatch);
            }
        }

        let local_types: Vec<ValueType> = module.local_types(&func).to_vec();
        let result = if ty.result_count == 0 {
            ValueType::Void
        } else {
            module.result_types(&ty)[0]
        };

        for ty in local_types {
            self.push_value(Value::zero(ty))?;
        }

        let ctrl_base = self.control_stack.len();
        self.call_stack.push(CallFrame {
            func_idx,
            return_pc: self.pc,
            frame_base,
            ctrl_base,
        });

        self.push_frame(BlockKind::Func, result, 0)?;
        self.pc = 0;

        Ok(())
    }

    /// Leave the current function: carry its results past the locals,
    /// unwind both stacks to the frame bases and restore the caller's
    /// cursor.
    pub(crate) fn pop_call(&mut self) -> Result<(), VmError> {
        let frame = self
            .call_stack
            .pop()
            .ok_or(VmError::InvalidStackOperation)?;

        let module = self.module.as_deref().ok_or(VmError::InvalidInstructionStream)?;
        let ty = *module.func_type(frame.func_idx)?;

        let result = if ty.result_count > 0 {
            Some(self.pop_value()?)
        } else {
            None
        };

        self.operand_stack.truncate(frame.frame_base);
        self.control_stack.truncate(frame.ctrl_base);

        if let Some(result) = result {
            self.push_value(result)?;
        }

        self.pc = frame.return_pc;
        Ok(())
    }
}
