//! Structural validator / pre-compiler.
//!
//! One linear pass per function body performs stack-polymorphic type
//! checking and records the byte address of every `block`, `if`,
//! `else` and matching `end` into the module's jump tables, so control
//! transfers cost O(1) at run time.

use crate::consts::*;
use crate::error::VmError;
use crate::module::{Func, FuncType, Global, Module};
use crate::opcode::Opcode;
use crate::reader::Reader;
use crate::types::{BlockKind, ValueType};

/// Type-check every function body and fill in the jump tables.
pub fn validate(module: &mut Module) -> Result<(), VmError> {
    for func_idx in 0..module.funcs.len() {
        let block_offset = module.block_addrs.len() as u32;
        let if_offset = module.if_addrs.len() as u32;

        {
            let func = &mut module.funcs[func_idx];
            func.block_offset = block_offset;
            func.if_offset = if_offset;
        }

        FuncValidator::new(module, func_idx)?.run()?;

        let func = &mut module.funcs[func_idx];
        func.block_count = module.block_addrs.len() as u32 - block_offset;
        func.if_count = module.if_addrs.len() as u32 - if_offset;
    }

    Ok(())
}

/// A validator control frame.
#[derive(Debug, Clone, Copy)]
struct CtrlFrame {
    kind: BlockKind,
    signature: ValueType,
    entry_height: usize,
    unreachable: bool,
    /// Slot in the module's block or if table, for label recording.
    table_idx: usize,
}

/// Single-function validation state: a cursor over the body, read-only
/// views of the module, the jump tables under construction, and the
/// operand-type and control stacks.
struct FuncValidator<'m> {
    reader: Reader<'m>,
    func: Func,
    types: &'m [FuncType],
    param_types: &'m [ValueType],
    result_types: &'m [ValueType],
    local_types: &'m [ValueType],
    funcs: &'m [Func],
    globals: &'m [Global],
    block_addrs: &'m mut Vec<usize>,
    block_labels: &'m mut Vec<usize>,
    if_addrs: &'m mut Vec<usize>,
    if_labels: &'m mut Vec<usize>,
    else_addrs: &'m mut Vec<usize>,
    oprd: Vec<ValueType>,
    ctrl: Vec<CtrlFrame>,
}

impl<'m> FuncValidator<'m> {
    fn new(module: &'m mut Module, func_idx: usize) -> Result<Self, VmError> {
        let Module {
            param_types,
            result_types,
            types,
            funcs,
            local_types,
            code,
            block_addrs,
            block_labels,
            if_addrs,
            if_labels,
            else_addrs,
            globals,
            ..
        } = module;

        let func = funcs[func_idx];
        let code = &code[func.code_offset..func.code_offset + func.code_len];

        // A well-formed body terminates with `end` as its final byte.
        if code.last() != Some(&(Opcode::End as u8)) {
            return Err(VmError::InvalidEndOpcode);
        }

        let result = Self::func_result(types, result_types, func.type_idx)?;

        let mut validator = Self {
            reader: Reader::new(code),
            func,
            types,
            param_types,
            result_types,
            local_types,
            funcs,
            globals,
            block_addrs,
            block_labels,
            if_addrs,
            if_labels,
            else_addrs,
            oprd: Vec::new(),
            ctrl: Vec::new(),
        };

        validator.push_frame(BlockKind::Func, result, 0)?;
        Ok(validator)
    }

    fn func_result(
        types: &[FuncType],
        result_types: &[ValueType],
        type_idx: u32,
    ) -> Result<ValueType, VmError> {
        let ty = types
            .get(type_idx as usize)
            .ok_or(VmError::InvalidTypeIndex)?;

        Ok(if ty.result_count == 0 {
            ValueType::Void
        } else {
            result_types[ty.result_offset as usize]
        })
    }

    fn run(mut self) -> Result<(), VmError> {
        while !self.reader.at_end() {
            let address = self.reader.pos();
            let opcode = Opcode::from_byte(self.reader.read_u8()?)?;

            if self.check(opcode, address)? {
                break;
            }
        }

        if !self.reader.at_end() || !self.ctrl.is_empty() {
            return Err(VmError::InvalidBytes);
        }

        Ok(())
    }

    /// Check one opcode. Returns `true` once the function's own `end`
    /// has been consumed.
    fn check(&mut self, opcode: Opcode, address: usize) -> Result<bool, VmError> {
        use Opcode::*;
        use ValueType::{F32, F64, I32, I64, Unknown, Void};

        match opcode {
            Nop => {}
            Unreachable => self.mark_unreachable()?,

            Block => {
                let signature = self.read_block_signature()?;
                let table_idx = self.block_addrs.len();
                self.block_addrs.push(address);
                self.block_labels.push(0);
                self.push_frame(BlockKind::Block, signature, table_idx)?;
            }

            Loop => {
                let signature = self.read_block_signature()?;
                self.push_frame(BlockKind::Loop, signature, 0)?;
            }

            If => {
                let signature = self.read_block_signature()?;
                self.pop_op(I32)?;
                let table_idx = self.if_addrs.len();
                self.if_addrs.push(address);
                self.if_labels.push(0);
                self.else_addrs.push(0);
                self.push_frame(BlockKind::If, signature, table_idx)?;
            }

            Else => {
                let frame = *self.ctrl.last().ok_or(VmError::IfElseMismatch)?;
                if frame.kind != BlockKind::If {
                    return Err(VmError::IfElseMismatch);
                }

                // The then-arm must satisfy the frame signature before
                // the operand stack resets for the else-arm.
                self.check_frame_signature(&frame)?;
                self.else_addrs[frame.table_idx] = address;

                self.oprd.truncate(frame.entry_height);
                let frame = self.ctrl.last_mut().expect("frame just inspected");
                frame.unreachable = false;
            }

            End => {
                let frame = *self.ctrl.last().ok_or(VmError::InvalidStackOperation)?;

                match frame.kind {
                    BlockKind::Block => self.block_labels[frame.table_idx] = address,
                    BlockKind::If => {
                        self.if_labels[frame.table_idx] = address;
                        if self.else_addrs[frame.table_idx] == 0 && frame.signature != Void {
                            return Err(VmError::ValuefulIfWithoutElse);
                        }
                    }
                    _ => {}
                }

                self.end_frame(&frame)?;

                if frame.kind == BlockKind::Func {
                    if !self.reader.at_end() {
                        return Err(VmError::InvalidBytes);
                    }
                    return Ok(true);
                }
            }

            Br => {
                let depth = self.reader.read_varu32()?;
                self.check_branch_target(depth)?;
                self.mark_unreachable()?;
            }

            BrIf => {
                let depth = self.reader.read_varu32()?;
                self.pop_op(I32)?;
                self.check_branch_target(depth)?;
            }

            BrTable => {
                self.pop_op(I32)?;

                let target_count = self.reader.read_varu32()?;
                if target_count > MAX_BRANCH_TABLE_SIZE {
                    return Err(VmError::BranchTableOverflow);
                }

                let mut targets = [0u32; MAX_BRANCH_TABLE_SIZE as usize];
                for target in targets.iter_mut().take(target_count as usize) {
                    *target = self.reader.read_varu32()?;
                }
                let default_target = self.reader.read_varu32()?;

                let default_sig = self
                    .branch_signature(default_target)
                    .map_err(|_| VmError::InvalidBranchTable)?;

                for &target in targets.iter().take(target_count as usize) {
                    let sig = self
                        .branch_signature(target)
                        .map_err(|_| VmError::InvalidBranchTable)?;
                    if sig != default_sig {
                        return Err(VmError::InvalidBranchTable);
                    }
                }

                self.check_branch_target(default_target)?;
                self.mark_unreachable()?;
            }

            Return => {
                let depth = self.ctrl.len() as u32 - 1;
                self.check_branch_target(depth)?;
                self.mark_unreachable()?;
            }

            Call => {
                let func_idx = self.reader.read_varu32()?;
                let callee = self
                    .funcs
                    .get(func_idx as usize)
                    .ok_or(VmError::InvalidFuncIndex)?;
                let ty = self.types[callee.type_idx as usize];

                // Parameters leave the stack in reverse declaration order.
                for i in (0..ty.param_count as usize).rev() {
                    self.pop_op(self.param_types[ty.param_offset as usize + i])?;
                }

                if ty.result_count > 0 {
                    self.push_op(self.result_types[ty.result_offset as usize])?;
                }
            }

            CallIndirect => return Err(VmError::Unsupported),

            Drop => {
                self.pop_op(Unknown)?;
            }

            Select => {
                self.pop_op(I32)?;
                let ty = self.pop_op(Unknown)?;
                self.pop_op(ty)?;
                self.push_op(if ty == Unknown { Unknown } else { ty })?;
            }

            GetLocal => {
                let ty = self.local_type()?;
                self.push_op(ty)?;
            }

            SetLocal => {
                let ty = self.local_type()?;
                self.pop_op(ty)?;
            }

            TeeLocal => {
                let ty = self.local_type()?;
                self.pop_op(ty)?;
                self.push_op(ty)?;
            }

            GetGlobal => {
                let global_idx = self.reader.read_varu32()?;
                let global = self
                    .globals
                    .get(global_idx as usize)
                    .ok_or(VmError::InvalidGlobalIndex)?;
                self.push_op(global.ty)?;
            }

            SetGlobal => {
                let global_idx = self.reader.read_varu32()?;
                let global = self
                    .globals
                    .get(global_idx as usize)
                    .ok_or(VmError::InvalidGlobalIndex)?;
                if !global.mutable {
                    return Err(VmError::InvalidGlobalIndex);
                }
                self.pop_op(global.ty)?;
            }

            I32Load | I32Load8S | I32Load8U | I32Load16S | I32Load16U => {
                self.check_load(I32)?
            }
            I64Load | I64Load8S | I64Load8U | I64Load16S | I64Load16U | I64Load32S
            | I64Load32U => self.check_load(I64)?,
            F32Load => self.check_load(F32)?,
            F64Load => self.check_load(F64)?,

            I32Store | I32Store8 | I32Store16 => self.check_store(I32)?,
            I64Store | I64Store8 | I64Store16 | I64Store32 => self.check_store(I64)?,
            F32Store => self.check_store(F32)?,
            F64Store => self.check_store(F64)?,

            CurrentMemory => {
                self.check_reserved()?;
                self.push_op(I32)?;
            }

            GrowMemory => {
                self.check_reserved()?;
                self.pop_op(I32)?;
                self.push_op(I32)?;
            }

            I32Const => {
                self.reader.read_vari32()?;
                self.push_op(I32)?;
            }
            I64Const => {
                self.reader.read_vari64()?;
                self.push_op(I64)?;
            }
            F32Const => {
                self.reader.read_f32_le()?;
                self.push_op(F32)?;
            }
            F64Const => {
                self.reader.read_f64_le()?;
                self.push_op(F64)?;
            }

            I32Eqz => self.check_op(&[I32], I32)?,
            I32Eq | I32Ne | I32LtS | I32LtU | I32GtS | I32GtU | I32LeS | I32LeU | I32GeS
            | I32GeU => self.check_op(&[I32, I32], I32)?,
            I64Eqz => self.check_op(&[I64], I32)?,
            I64Eq | I64Ne | I64LtS | I64LtU | I64GtS | I64GtU | I64LeS | I64LeU | I64GeS
            | I64GeU => self.check_op(&[I64, I64], I32)?,
            F32Eq | F32Ne | F32Lt | F32Gt | F32Le | F32Ge => self.check_op(&[F32, F32], I32)?,
            F64Eq | F64Ne | F64Lt | F64Gt | F64Le | F64Ge => self.check_op(&[F64, F64], I32)?,

            I32Clz | I32Ctz | I32Popcnt => self.check_op(&[I32], I32)?,
            I32Add | I32Sub | I32Mul | I32DivS | I32DivU | I32RemS | I32RemU | I32And | I32Or
            | I32Xor | I32Shl | I32ShrS | I32ShrU | I32Rotl | I32Rotr => {
                self.check_op(&[I32, I32], I32)?
            }
            I64Clz | I64Ctz | I64Popcnt => self.check_op(&[I64], I64)?,
            I64Add | I64Sub | I64Mul | I64DivS | I64DivU | I64RemS | I64RemU | I64And | I64Or
            | I64Xor | I64Shl | I64ShrS | I64ShrU | I64Rotl | I64Rotr => {
                self.check_op(&[I64, I64], I64)?
            }
            F32Abs | F32Neg | F32Ceil | F32Floor | F32Trunc | F32Nearest | F32Sqrt => {
                self.check_op(&[F32], F32)?
            }
            F32Add | F32Sub | F32Mul | F32Div | F32Min | F32Max | F32Copysign => {
                self.check_op(&[F32, F32], F32)?
            }
            F64Abs | F64Neg | F64Ceil | F64Floor | F64Trunc | F64Nearest | F64Sqrt => {
                self.check_op(&[F64], F64)?
            }
            F64Add | F64Sub | F64Mul | F64Div | F64Min | F64Max | F64Copysign => {
                self.check_op(&[F64, F64], F64)?
            }

            I32WrapI64 => self.check_op(&[I64], I32)?,
            I32TruncSF32 | I32TruncUF32 | I32ReinterpretF32 => self.check_op(&[F32], I32)?,
            I32TruncSF64 | I32TruncUF64 => self.check_op(&[F64], I32)?,
            I64ExtendSI32 | I64ExtendUI32 => self.check_op(&[I32], I64)?,
            I64TruncSF32 | I64TruncUF32 => self.check_op(&[F32], I64)?,
            I64TruncSF64 | I64TruncUF64 | I64ReinterpretF64 => self.check_op(&[F64], I64)?,
            F32ConvertSI32 | F32ConvertUI32 | F32ReinterpretI32 => self.check_op(&[I32], F32)?,
            F32ConvertSI64 | F32ConvertUI64 => self.check_op(&[I64], F32)?,
            F32DemoteF64 => self.check_op(&[F64], F32)?,
            F64ConvertSI32 | F64ConvertUI32 => self.check_op(&[I32], F64)?,
            F64ConvertSI64 | F64ConvertUI64 | F64ReinterpretI64 => self.check_op(&[I64], F64)?,
            F64PromoteF32 => self.check_op(&[F32], F64)?,
        }

        Ok(false)
    }

    /* stack machinery */

    fn push_op(&mut self, ty: ValueType) -> Result<(), VmError> {
        if self.oprd.len() >= OPERAND_STACK_DEPTH {
            return Err(VmError::InvalidStackOperation);
        }
        self.oprd.push(ty);
        Ok(())
    }

    /// Pop one operand, expecting `expect` (`Unknown` accepts any).
    ///
    /// Inside an unreachable region the stack is polymorphic: popping
    /// past the frame's entry height yields `Unknown` instead of
    /// underflowing.
    fn pop_op(&mut self, expect: ValueType) -> Result<ValueType, VmError> {
        let frame = self.ctrl.last().ok_or(VmError::InvalidStackOperation)?;

        if self.oprd.len() == frame.entry_height {
            if frame.unreachable {
                return Ok(ValueType::Unknown);
            }
            return Err(VmError::InvalidStackOperation);
        }

        let actual = self.oprd.pop().ok_or(VmError::InvalidStackOperation)?;

        if expect != ValueType::Unknown && actual != ValueType::Unknown && actual != expect {
            return Err(VmError::StackTypeMismatch);
        }

        Ok(actual)
    }

    fn check_op(&mut self, pops: &[ValueType], push: ValueType) -> Result<(), VmError> {
        // Operands leave the stack in reverse order.
        for &ty in pops.iter().rev() {
            self.pop_op(ty)?;
        }
        self.push_op(push)
    }

    fn push_frame(
        &mut self,
        kind: BlockKind,
        signature: ValueType,
        table_idx: usize,
    ) -> Result<(), VmError> {
        if self.ctrl.len() >= CONTROL_STACK_DEPTH {
            return Err(VmError::InvalidStackOperation);
        }

        self.ctrl.push(CtrlFrame {
            kind,
            signature,
            entry_height: self.oprd.len(),
            unreachable: false,
            table_idx,
        });

        Ok(())
    }

    /// Verify the operand stack matches `frame`'s signature: exactly one
    /// value of the signature type above the entry height, or nothing
    /// for void. An unreachable frame may come up short, never long.
    fn check_frame_signature(&self, frame: &CtrlFrame) -> Result<(), VmError> {
        let valueful = frame.signature != ValueType::Void;
        let expected = frame.entry_height + usize::from(valueful);
        let height = self.oprd.len();

        if height > expected {
            return Err(VmError::InvalidStackOperation);
        }

        if height < expected {
            return if frame.unreachable {
                Ok(())
            } else {
                Err(VmError::InvalidStackOperation)
            };
        }

        if valueful {
            let actual = self.oprd[expected - 1];
            if actual != ValueType::Unknown && actual != frame.signature {
                return Err(VmError::StackTypeMismatch);
            }
        }

        Ok(())
    }

    /// Validate and pop the current frame, leaving its result behind.
    fn end_frame(&mut self, frame: &CtrlFrame) -> Result<(), VmError> {
        self.check_frame_signature(frame)?;

        self.oprd.truncate(frame.entry_height);
        self.ctrl.pop();

        if frame.signature != ValueType::Void {
            self.push_op(frame.signature)?;
        }

        Ok(())
    }

    fn mark_unreachable(&mut self) -> Result<(), VmError> {
        let frame = self.ctrl.last_mut().ok_or(VmError::InvalidStackOperation)?;
        let entry_height = frame.entry_height;
        frame.unreachable = true;
        self.oprd.truncate(entry_height);
        Ok(())
    }

    /// The value a branch to depth `d` must carry: the target frame's
    /// signature, except that branches to a loop re-enter it empty.
    fn branch_signature(&self, depth: u32) -> Result<ValueType, VmError> {
        let idx = self
            .ctrl
            .len()
            .checked_sub(1 + depth as usize)
            .ok_or(VmError::InvalidStackOperation)?;
        let frame = &self.ctrl[idx];

        Ok(if frame.kind == BlockKind::Loop {
            ValueType::Void
        } else {
            frame.signature
        })
    }

    /// Non-destructively check the top of stack against a branch
    /// target's signature.
    fn check_branch_target(&mut self, depth: u32) -> Result<(), VmError> {
        let signature = self.branch_signature(depth)?;

        if signature == ValueType::Void {
            return Ok(());
        }

        let frame = self.ctrl.last().ok_or(VmError::InvalidStackOperation)?;

        if self.oprd.len() == frame.entry_height {
            return if frame.unreachable {
                Ok(())
            } else {
                Err(VmError::InvalidStackOperation)
            };
        }

        let actual = *self.oprd.last().ok_or(VmError::InvalidStackOperation)?;
        if actual != ValueType::Unknown && actual != signature {
            return Err(VmError::StackTypeMismatch);
        }

        Ok(())
    }

    fn read_block_signature(&mut self) -> Result<ValueType, VmError> {
        let signature = ValueType::from_vari7(self.reader.read_vari7()?)
            .map_err(|_| VmError::InvalidBlockSignature)?;

        if !signature.is_block_signature() {
            return Err(VmError::InvalidBlockSignature);
        }

        Ok(signature)
    }

    /// Resolve a local index against the parameters-then-locals space.
    fn local_type(&mut self) -> Result<ValueType, VmError> {
        let local_idx = self.reader.read_varu32()?;
        let ty = self.types[self.func.type_idx as usize];

        if local_idx < ty.param_count {
            return Ok(self.param_types[(ty.param_offset + local_idx) as usize]);
        }

        let decl_idx = local_idx - ty.param_count;
        if decl_idx >= self.func.local_count {
            return Err(VmError::InvalidLocalIndex);
        }

        Ok(self.local_types[(self.func.local_offset + decl_idx) as usize])
    }

    fn check_load(&mut self, ty: ValueType) -> Result<(), VmError> {
        self.reader.read_varu32()?; // alignment hint
        self.reader.read_varu32()?; // offset
        self.pop_op(ValueType::I32)?;
        self.push_op(ty)
    }

    fn check_store(&mut self, ty: ValueType) -> Result<(), VmError> {
        self.reader.read_varu32()?; // alignment hint
        self.reader.read_varu32()?; // offset
        self.pop_op(ty)?;
        self.pop_op(ValueType::I32)?;
        Ok(())
    }

    fn check_reserved(&mut self) -> Result<(), VmError> {
        if self.reader.read_vari32()? != 0 {
            return Err(VmError::InvalidReserved);
        }
        Ok(())
    }
}
