//! The opcode fetch/dispatch loop.

use tracing::debug;

use super::Interpreter;
use crate::error::VmError;
use crate::opcode::Opcode;
use crate::reader::Reader;
use crate::types::{Value, ValueType};

impl<'m> Interpreter<'m> {
    /// Execute an exported or internal function by index.
    ///
    /// Arguments must have been staged on the operand stack in
    /// declaration order. On success the results remain on the stack
    /// for the host to pop in reverse; on trap the stacks are reset,
    /// the trap code is recorded, and the module stays attached for
    /// subsequent calls.
    pub fn call(&mut self, func_idx: u32) -> bool {
        match self.exec_func(func_idx) {
            Ok(()) => {
                self.last_error = None;
                true
            }
            Err(err) => {
                debug!("call to function {} trapped: {}", func_idx, err);
                self.reset_stacks();
                self.last_error = Some(err);
                false
            }
        }
    }

    fn exec_func(&mut self, func_idx: u32) -> Result<(), VmError> {
        let module = self.module.as_deref().ok_or(VmError::InvalidInstructionStream)?;
        if func_idx >= module.num_funcs() {
            return Err(VmError::InvalidFuncIndex);
        }

        self.push_call(func_idx)?;
        self.run()
    }

    /// The core loop: fetch, decode, dispatch until the outermost call
    /// frame pops. Any error unwinds straight out as a trap.
    pub(crate) fn run(&mut self) -> Result<(), VmError> {
        while self.call_depth() > 0 {
            let opcode = self.fetch_opcode()?;
            self.step(opcode)?;
        }

        Ok(())
    }

    fn fetch_opcode(&mut self) -> Result<Opcode, VmError> {
        let module = self.module.as_deref().ok_or(VmError::InvalidInstructionStream)?;
        let frame = self
            .call_stack
            .last()
            .ok_or(VmError::InvalidStackOperation)?;
        let code = module.code(module.func(frame.func_idx)?);

        let byte = *code.get(self.pc).ok_or(VmError::InstructionOverflow)?;
        self.pc += 1;

        Opcode::from_byte(byte)
    }

    /// Decode immediates at the cursor within the current function's
    /// code slice, advancing the cursor past them.
    pub(crate) fn read_imm<T>(
        &mut self,
        f: impl FnOnce(&mut Reader) -> Result<T, VmError>,
    ) -> Result<T, VmError> {
        let module = self.module.as_deref().ok_or(VmError::InvalidInstructionStream)?;
        let frame = self
            .call_stack
            .last()
            .ok_or(VmError::InvalidStackOperation)?;
        let code = module.code(module.func(frame.func_idx)?);

        let mut reader = Reader::new(code);
        reader.skip(self.pc)?;

        let value = f(&mut reader)?;
        let pos = reader.pos();

        self.pc = pos;
        Ok(value)
    }

    pub(crate) fn read_imm_varu32(&mut self) -> Result<u32, VmError> {
        self.read_imm(|reader| reader.read_varu32())
    }

    pub(crate) fn read_imm_block_signature(&mut self) -> Result<ValueType, VmError> {
        let value = self.read_imm(|reader| reader.read_vari7())?;
        ValueType::from_vari7(value).map_err(|_| VmError::InvalidBlockSignature)
    }

    fn step(&mut self, opcode: Opcode) -> Result<(), VmError> {
        use Opcode::*;

        match opcode {
            Unreachable => return Err(VmError::UnreachableCodeExecuted),
            Nop => {}

            Block => self.exec_block()?,
            Loop => self.exec_loop()?,
            If => self.exec_if()?,
            Else => self.exec_else()?,
            End => self.exec_end()?,
            Br => self.exec_br()?,
            BrIf => self.exec_br_if()?,
            BrTable => self.exec_br_table()?,
            Return => self.exec_return()?,
            Call => self.exec_call()?,

            // Encoded but not implemented by this VM.
            CallIndirect | TeeLocal => return Err(VmError::Unsupported),

            Drop => {
                self.pop_value()?;
            }

            Select => {
                let condition = self.pop_i32()?;
                let second = self.pop_value()?;
                let first = self.pop_value()?;
                self.push_value(if condition != 0 { first } else { second })?;
            }

            GetLocal => {
                let local_idx = self.read_imm_varu32()?;
                let slot = self.local_slot(local_idx)?;
                let value = self.operand_stack[slot];
                self.push_value(value)?;
            }

            SetLocal => {
                let local_idx = self.read_imm_varu32()?;
                let slot = self.local_slot(local_idx)?;
                let value = self.pop_value()?;
                self.operand_stack[slot] = value;
            }

            GetGlobal => {
                let global_idx = self.read_imm_varu32()?;
                let module = self.module.as_deref().ok_or(VmError::InvalidInstructionStream)?;
                let global = module
                    .globals
                    .get(global_idx as usize)
                    .ok_or(VmError::InvalidGlobalIndex)?;
                let value = Value::new(global.value, global.ty);
                self.push_value(value)?;
            }

            SetGlobal => {
                let global_idx = self.read_imm_varu32()?;
                let value = self.pop_value()?;
                let module = self
                    .module
                    .as_deref_mut()
                    .ok_or(VmError::InvalidInstructionStream)?;
                let global = module
                    .globals
                    .get_mut(global_idx as usize)
                    .ok_or(VmError::InvalidGlobalIndex)?;
                global.value = value.bits();
            }

            I32Load => self.exec_load(ValueType::I32, 4, false)?,
            I64Load => self.exec_load(ValueType::I64, 8, false)?,
            F32Load => self.exec_load(ValueType::F32, 4, false)?,
            F64Load => self.exec_load(ValueType::F64, 8, false)?,
            I32Load8S => self.exec_load(ValueType::I32, 1, true)?,
            I32Load8U => self.exec_load(ValueType::I32, 1, false)?,
            I32Load16S => self.exec_load(ValueType::I32, 2, true)?,
            I32Load16U => self.exec_load(ValueType::I32, 2, false)?,
            I64Load8S => self.exec_load(ValueType::I64, 1, true)?,
            I64Load8U => self.exec_load(ValueType::I64, 1, false)?,
            I64Load16S => self.exec_load(ValueType::I64, 2, true)?,
            I64Load16U => self.exec_load(ValueType::I64, 2, false)?,
            I64Load32S => self.exec_load(ValueType::I64, 4, true)?,
            I64Load32U => self.exec_load(ValueType::I64, 4, false)?,

            I32Store | F32Store => self.exec_store(4)?,
            I64Store | F64Store => self.exec_store(8)?,
            I32Store8 | I64Store8 => self.exec_store(1)?,
            I32Store16 | I64Store16 => self.exec_store(2)?,
            I64Store32 => self.exec_store(4)?,

            CurrentMemory => self.exec_current_memory()?,
            GrowMemory => self.exec_grow_memory()?,

            I32Const => {
                let value = self.read_imm(|reader| reader.read_vari32())?;
                self.push_i32(value)?;
            }
            I64Const => {
                let value = self.read_imm(|reader| reader.read_vari64())?;
                self.push_i64(value)?;
            }
            F32Const => {
                let value = self.read_imm(|reader| reader.read_f32_le())?;
                self.push_f32(value)?;
            }
            F64Const => {
                let value = self.read_imm(|reader| reader.read_f64_le())?;
                self.push_f64(value)?;
            }

            I32Eqz => {
                let x = self.pop_i32()?;
                self.push_i32((x == 0) as i32)?;
            }
            I32Eq => self.i32_cmp(|x, y| x == y)?,
            I32Ne => self.i32_cmp(|x, y| x != y)?,
            I32LtS => self.i32_cmp(|x, y| x < y)?,
            I32LtU => self.i32_cmp(|x, y| (x as u32) < y as u32)?,
            I32GtS => self.i32_cmp(|x, y| x > y)?,
            I32GtU => self.i32_cmp(|x, y| x as u32 > y as u32)?,
            I32LeS => self.i32_cmp(|x, y| x <= y)?,
            I32LeU => self.i32_cmp(|x, y| x as u32 <= y as u32)?,
            I32GeS => self.i32_cmp(|x, y| x >= y)?,
            I32GeU => self.i32_cmp(|x, y| x as u32 >= y as u32)?,

            I64Eqz => {
                let x = self.pop_i64()?;
                self.push_i32((x == 0) as i32)?;
            }
            I64Eq => self.i64_cmp(|x, y| x == y)?,
            I64Ne => self.i64_cmp(|x, y| x != y)?,
            I64LtS => self.i64_cmp(|x, y| x < y)?,
            I64LtU => self.i64_cmp(|x, y| (x as u64) < y as u64)?,
            I64GtS => self.i64_cmp(|x, y| x > y)?,
            I64GtU => self.i64_cmp(|x, y| x as u64 > y as u64)?,
            I64LeS => self.i64_cmp(|x, y| x <= y)?,
            I64LeU => self.i64_cmp(|x, y| x as u64 <= y as u64)?,
            I64GeS => self.i64_cmp(|x, y| x >= y)?,
            I64GeU => self.i64_cmp(|x, y| x as u64 >= y as u64)?,

            F32Eq => self.f32_cmp(|x, y| x == y)?,
            F32Ne => self.f32_cmp(|x, y| x != y)?,
            F32Lt => self.f32_cmp(|x, y| x < y)?,
            F32Gt => self.f32_cmp(|x, y| x > y)?,
            F32Le => self.f32_cmp(|x, y| x <= y)?,
            F32Ge => self.f32_cmp(|x, y| x >= y)?,

            F64Eq => self.f64_cmp(|x, y| x == y)?,
            F64Ne => self.f64_cmp(|x, y| x != y)?,
            F64Lt => self.f64_cmp(|x, y| x < y)?,
            F64Gt => self.f64_cmp(|x, y| x > y)?,
            F64Le => self.f64_cmp(|x, y| x <= y)?,
            F64Ge => self.f64_cmp(|x, y| x >= y)?,

            I32Clz => self.i32_unop(|x| (x as u32).leading_zeros() as i32)?,
            I32Ctz => self.i32_unop(|x| (x as u32).trailing_zeros() as i32)?,
            I32Popcnt => self.i32_unop(|x| x.count_ones() as i32)?,
            I32Add => self.i32_binop(i32::wrapping_add)?,
            I32Sub => self.i32_binop(i32::wrapping_sub)?,
            I32Mul => self.i32_binop(i32::wrapping_mul)?,
            I32DivS => self.exec_i32_div_s()?,
            I32DivU => self.exec_i32_div_u()?,
            I32RemS => self.exec_i32_rem_s()?,
            I32RemU => self.exec_i32_rem_u()?,
            I32And => self.i32_binop(|x, y| x & y)?,
            I32Or => self.i32_binop(|x, y| x | y)?,
            I32Xor => self.i32_binop(|x, y| x ^ y)?,
            I32Shl => self.i32_binop(|x, y| x.wrapping_shl(y as u32))?,
            I32ShrS => self.i32_binop(|x, y| x.wrapping_shr(y as u32))?,
            I32ShrU => self.i32_binop(|x, y| ((x as u32).wrapping_shr(y as u32)) as i32)?,
            I32Rotl => self.i32_binop(|x, y| (x as u32).rotate_left(y as u32) as i32)?,
            I32Rotr => self.i32_binop(|x, y| (x as u32).rotate_right(y as u32) as i32)?,

            I64Clz => self.i64_unop(|x| (x as u64).leading_zeros() as i64)?,
            I64Ctz => self.i64_unop(|x| (x as u64).trailing_zeros() as i64)?,
            I64Popcnt => self.i64_unop(|x| x.count_ones() as i64)?,
            I64Add => self.i64_binop(i64::wrapping_add)?,
            I64Sub => self.i64_binop(i64::wrapping_sub)?,
            I64Mul => self.i64_binop(i64::wrapping_mul)?,
            I64DivS => self.exec_i64_div_s()?,
            I64DivU => self.exec_i64_div_u()?,
            I64RemS => self.exec_i64_rem_s()?,
            I64RemU => self.exec_i64_rem_u()?,
            I64And => self.i64_binop(|x, y| x & y)?,
            I64Or => self.i64_binop(|x, y| x | y)?,
            I64Xor => self.i64_binop(|x, y| x ^ y)?,
            I64Shl => self.i64_binop(|x, y| x.wrapping_shl(y as u32))?,
            I64ShrS => self.i64_binop(|x, y| x.wrapping_shr(y as u32))?,
            I64ShrU => self.i64_binop(|x, y| ((x as u64).wrapping_shr(y as u32)) as i64)?,
            I64Rotl => self.i64_binop(|x, y| (x as u64).rotate_left(y as u32) as i64)?,
            I64Rotr => self.i64_binop(|x, y| (x as u64).rotate_right(y as u32) as i64)?,

            F32Abs => self.f32_unop(f32::abs)?,
            F32Neg => self.f32_unop(|x| -x)?,
            F32Ceil => self.f32_round(f32::ceil)?,
            F32Floor => self.f32_round(f32::floor)?,
            F32Trunc => self.f32_round(f32::trunc)?,
            F32Nearest => self.f32_round(Self::nearest_f32)?,
            F32Sqrt => self.f32_round(f32::sqrt)?,
            F32Add => self.f32_arith(|x, y| x + y)?,
            F32Sub => self.f32_arith(|x, y| x - y)?,
            F32Mul => self.f32_arith(|x, y| x * y)?,
            F32Div => self.f32_arith(|x, y| x / y)?,
            F32Min => self.f32_arith(Self::min_f32)?,
            F32Max => self.f32_arith(Self::max_f32)?,
            F32Copysign => self.f32_binop(f32::copysign)?,

            F64Abs => self.f64_unop(f64::abs)?,
            F64Neg => self.f64_unop(|x| -x)?,
            F64Ceil => self.f64_round(f64::ceil)?,
            F64Floor => self.f64_round(f64::floor)?,
            F64Trunc => self.f64_round(f64::trunc)?,
            F64Nearest => self.f64_round(Self::nearest_f64)?,
            F64Sqrt => self.f64_round(f64::sqrt)?,
            F64Add => self.f64_arith(|x, y| x + y)?,
            F64Sub => self.f64_arith(|x, y| x - y)?,
            F64Mul => self.f64_arith(|x, y| x * y)?,
            F64Div => self.f64_arith(|x, y| x / y)?,
            F64Min => self.f64_arith(Self::min_f64)?,
            F64Max => self.f64_arith(Self::max_f64)?,
            F64Copysign => self.f64_binop(f64::copysign)?,

            I32WrapI64 => {
                let x = self.pop_i64()?;
                self.push_i32(x as i32)?;
            }
            I32TruncSF32 => {
                let x = self.pop_f32()?;
                let value = Self::trunc_to_i32_s(x as f64, VmError::I32Overflow)?;
                self.push_i32(value)?;
            }
            I32TruncUF32 => {
                let x = self.pop_f32()?;
                let value = Self::trunc_to_i32_u(x as f64, VmError::I32Overflow)?;
                self.push_i32(value)?;
            }
            I32TruncSF64 => {
                let x = self.pop_f64()?;
                let value = Self::trunc_to_i32_s(x, VmError::I32Overflow)?;
                self.push_i32(value)?;
            }
            I32TruncUF64 => {
                let x = self.pop_f64()?;
                let value = Self::trunc_to_i32_u(x, VmError::I32Overflow)?;
                self.push_i32(value)?;
            }
            I64ExtendSI32 => {
                let x = self.pop_i32()?;
                self.push_i64(x as i64)?;
            }
            I64ExtendUI32 => {
                let x = self.pop_i32()?;
                self.push_i64(x as u32 as i64)?;
            }
            I64TruncSF32 => {
                let x = self.pop_f32()?;
                let value = Self::trunc_to_i64_s(x as f64, VmError::I64Overflow)?;
                self.push_i64(value)?;
            }
            I64TruncUF32 => {
                let x = self.pop_f32()?;
                let value = Self::trunc_to_i64_u(x as f64, VmError::I64Overflow)?;
                self.push_i64(value)?;
            }
            I64TruncSF64 => {
                let x = self.pop_f64()?;
                let value = Self::trunc_to_i64_s(x, VmError::I64Overflow)?;
                self.push_i64(value)?;
            }
            I64TruncUF64 => {
                let x = self.pop_f64()?;
                let value = Self::trunc_to_i64_u(x, VmError::I64Overflow)?;
                self.push_i64(value)?;
            }

            F32ConvertSI32 => {
                let x = self.pop_i32()?;
                self.push_f32(x as f32)?;
            }
            F32ConvertUI32 => {
                let x = self.pop_i32()?;
                self.push_f32(x as u32 as f32)?;
            }
            F32ConvertSI64 => {
                let x = self.pop_i64()?;
                self.push_f32(x as f32)?;
            }
            F32ConvertUI64 => {
                let x = self.pop_i64()?;
                self.push_f32(x as u64 as f32)?;
            }
            F32DemoteF64 => {
                let x = self.pop_f64()?;
                self.push_f32(x as f32)?;
            }
            F64ConvertSI32 => {
                let x = self.pop_i32()?;
                self.push_f64(x as f64)?;
            }
            F64ConvertUI32 => {
                let x = self.pop_i32()?;
                self.push_f64(x as u32 as f64)?;
            }
            F64ConvertSI64 => {
                let x = self.pop_i64()?;
                self.push_f64(x as f64)?;
            }
            F64ConvertUI64 => {
                let x = self.pop_i64()?;
                self.push_f64(x as u64 as f64)?;
            }
            F64PromoteF32 => {
                let x = self.pop_f32()?;
                self.push_f64(x as f64)?;
            }

            // Reinterpretations swap the tag and keep the payload.
            I32ReinterpretF32 => self.retag(ValueType::F32, ValueType::I32)?,
            I64ReinterpretF64 => self.retag(ValueType::F64, ValueType::I64)?,
            F32ReinterpretI32 => self.retag(ValueType::I32, ValueType::F32)?,
            F64ReinterpretI64 => self.retag(ValueType::I64, ValueType::F64)?,
        }

        Ok(())
    }

    fn retag(&mut self, from: ValueType, to: ValueType) -> Result<(), VmError> {
        let value = self.pop_value()?;
        if value.ty() != from {
            return Err(VmError::StackTypeMismatch);
        }
        self.push_value(Value::new(value.bits(), to))
    }
}
