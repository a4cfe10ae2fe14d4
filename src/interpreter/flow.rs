//! Control flow handlers.
//!
//! Every transfer consults the jump tables the validator recorded, so
//! `block`, `if`, `else`, `br` and friends move the cursor in O(1)
//! without rescanning code.

use super::Interpreter;
use crate::consts::*;
use crate::error::VmError;
use crate::types::{BlockKind, ValueType};

impl<'m> Interpreter<'m> {
    pub(crate) fn exec_block(&mut self) -> Result<(), VmError> {
        let address = self.pc - 1;
        let signature = self.read_imm_block_signature()?;

        let module = self.module.as_deref().ok_or(VmError::InvalidInstructionStream)?;
        let frame = self
            .call_stack
            .last()
            .ok_or(VmError::InvalidStackOperation)?;
        let func = module.func(frame.func_idx)?;
        let block_idx = module.block_idx(func, address)?;
        let target = module.block_labels[block_idx] + 1;

        self.push_frame(BlockKind::Block, signature, target)
    }

    pub(crate) fn exec_loop(&mut self) -> Result<(), VmError> {
        let address = self.pc - 1;
        let signature = self.read_imm_block_signature()?;

        // Branches to a loop re-enter it at the loop opcode itself.
        self.push_frame(BlockKind::Loop, signature, address)
    }

    pub(crate) fn exec_if(&mut self) -> Result<(), VmError> {
        let address = self.pc - 1;
        let signature = self.read_imm_block_signature()?;
        let condition = self.pop_i32()?;

        let module = self.module.as_deref().ok_or(VmError::InvalidInstructionStream)?;
        let frame = self
            .call_stack
            .last()
            .ok_or(VmError::InvalidStackOperation)?;
        let func = module.func(frame.func_idx)?;
        let if_idx = module.if_idx(func, address)?;
        let end_label = module.if_labels[if_idx];
        let else_addr = module.else_addrs[if_idx];

        if condition != 0 || else_addr != 0 {
            self.push_frame(BlockKind::If, signature, end_label + 1)?;
        }

        if condition == 0 {
            self.pc = if else_addr == 0 { end_label } else { else_addr } + 1;
        }

        Ok(())
    }

    /// Reaching `else` means the then-arm ran to completion; transfer
    /// past the matching `end`.
    pub(crate) fn exec_else(&mut self) -> Result<(), VmError> {
        self.branch(0)
    }

    pub(crate) fn exec_end(&mut self) -> Result<(), VmError> {
        let frame = self
            .control_stack
            .pop()
            .ok_or(VmError::InvalidStackOperation)?;

        if frame.kind == BlockKind::Func {
            self.pop_call()?;
        }

        Ok(())
    }

    pub(crate) fn exec_br(&mut self) -> Result<(), VmError> {
        let depth = self.read_imm_varu32()?;
        self.branch(depth)
    }

    pub(crate) fn exec_br_if(&mut self) -> Result<(), VmError> {
        let depth = self.read_imm_varu32()?;
        let condition = self.pop_i32()?;

        if condition != 0 {
            self.branch(depth)?;
        }

        Ok(())
    }

    pub(crate) fn exec_br_table(&mut self) -> Result<(), VmError> {
        let (targets, default_target) = self.read_imm(|reader| {
            let target_count = reader.read_varu32()?;
            if target_count > MAX_BRANCH_TABLE_SIZE {
                return Err(VmError::BranchTableOverflow);
            }

            let mut targets = Vec::with_capacity(target_count as usize);
            for _ in 0..target_count {
                targets.push(reader.read_varu32()?);
            }

            Ok((targets, reader.read_varu32()?))
        })?;

        let target_idx = self.pop_i32()?;

        // Out-of-range indices clamp to the default target.
        let depth = usize::try_from(target_idx)
            .ok()
            .and_then(|idx| targets.get(idx).copied())
            .unwrap_or(default_target);

        self.branch(depth)
    }

    pub(crate) fn exec_return(&mut self) -> Result<(), VmError> {
        self.pop_call()
    }

    pub(crate) fn exec_call(&mut self) -> Result<(), VmError> {
        let func_idx = self.read_imm_varu32()?;

        let module = self.module.as_deref().ok_or(VmError::InvalidInstructionStream)?;
        if func_idx >= module.num_funcs() {
            return Err(VmError::InvalidFuncIndex);
        }

        self.push_call(func_idx)
    }

    /// Unwind `depth + 1` control frames and transfer to the target
    /// frame's branch target, preserving the frame's result value for
    /// valueful non-loop targets.
    pub(crate) fn branch(&mut self, depth: u32) -> Result<(), VmError> {
        let target_idx = self
            .control_stack
            .len()
            .checked_sub(1 + depth as usize)
            .ok_or(VmError::InvalidStackOperation)?;
        let frame = self.control_stack[target_idx];

        // A branch to the function frame is a return.
        if frame.kind == BlockKind::Func {
            return self.pop_call();
        }

        let result = if frame.signature != ValueType::Void && frame.kind != BlockKind::Loop {
            Some(self.pop_value()?)
        } else {
            None
        };

        self.operand_stack.truncate(frame.entry_height);
        if let Some(result) = result {
            self.push_value(result)?;
        }

        self.control_stack.truncate(target_idx);
        self.pc = frame.branch_target;

        Ok(())
    }
}
