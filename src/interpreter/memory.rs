//! Linear memory access.
//!
//! Effective addresses are computed in 32-bit unsigned arithmetic; a
//! wrapped addition or an access past `num_pages * PAGE_SIZE` traps
//! with `InvalidMemoryAccess`. The alignment hint in the immediate is
//! decoded and ignored.

use tracing::debug;

use super::Interpreter;
use crate::consts::PAGE_SIZE;
use crate::error::VmError;
use crate::types::{Value, ValueType};

impl<'m> Interpreter<'m> {
    pub(crate) fn exec_load(
        &mut self,
        ty: ValueType,
        num_bytes: usize,
        sign_extend: bool,
    ) -> Result<(), VmError> {
        let (_flags, offset) = self.read_imm(|r| Ok((r.read_varu32()?, r.read_varu32()?)))?;
        let address = self.pop_i32()? as u32;

        let effective = address
            .checked_add(offset)
            .ok_or(VmError::InvalidMemoryAccess)? as usize;

        let module = self.module.as_deref().ok_or(VmError::InvalidInstructionStream)?;
        let memory = module.memories.first().ok_or(VmError::InvalidMemoryAccess)?;

        if effective + num_bytes > memory.num_pages as usize * PAGE_SIZE as usize {
            return Err(VmError::InvalidMemoryAccess);
        }

        let mut buf = [0u8; 8];
        buf[..num_bytes].copy_from_slice(&memory.bytes[effective..effective + num_bytes]);
        let mut bits = u64::from_le_bytes(buf);

        if sign_extend {
            let shift = 64 - num_bytes as u32 * 8;
            bits = (((bits << shift) as i64) >> shift) as u64;
            if ty == ValueType::I32 {
                bits &= u32::MAX as u64;
            }
        }

        self.push_value(Value::new(bits, ty))
    }

    pub(crate) fn exec_store(&mut self, num_bytes: usize) -> Result<(), VmError> {
        let (_flags, offset) = self.read_imm(|r| Ok((r.read_varu32()?, r.read_varu32()?)))?;
        let value = self.pop_value()?;
        let address = self.pop_i32()? as u32;

        let effective = address
            .checked_add(offset)
            .ok_or(VmError::InvalidMemoryAccess)? as usize;

        let module = self
            .module
            .as_deref_mut()
            .ok_or(VmError::InvalidInstructionStream)?;
        let memory = module
            .memories
            .first_mut()
            .ok_or(VmError::InvalidMemoryAccess)?;

        if effective + num_bytes > memory.num_pages as usize * PAGE_SIZE as usize {
            return Err(VmError::InvalidMemoryAccess);
        }

        memory.bytes[effective..effective + num_bytes]
            .copy_from_slice(&value.bits().to_le_bytes()[..num_bytes]);

        Ok(())
    }

    pub(crate) fn exec_current_memory(&mut self) -> Result<(), VmError> {
        self.read_imm(|r| r.read_vari32())?;

        let module = self.module.as_deref().ok_or(VmError::InvalidInstructionStream)?;
        let memory = module.memories.first().ok_or(VmError::InvalidMemoryAccess)?;
        let num_pages = memory.num_pages() as i32;

        self.push_i32(num_pages)
    }

    pub(crate) fn exec_grow_memory(&mut self) -> Result<(), VmError> {
        self.read_imm(|r| r.read_vari32())?;
        let delta = self.pop_i32()?;

        let module = self
            .module
            .as_deref_mut()
            .ok_or(VmError::InvalidInstructionStream)?;
        let memory = module
            .memories
            .first_mut()
            .ok_or(VmError::InvalidMemoryAccess)?;

        let result = memory.grow(delta as u32);
        if result >= 0 {
            debug!("memory grown by {} pages to {}", delta, memory.num_pages());
        }

        self.push_i32(result)
    }
}
