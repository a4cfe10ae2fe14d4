//! Module attachment and start-up.

use tracing::debug;

use super::{init_expr, Interpreter};
use crate::error::VmError;
use crate::module::Module;
use crate::types::ValueType;

impl<'m> Interpreter<'m> {
    /// Install a borrowed module, reset the stacks and apply its data
    /// and element segments.
    ///
    /// Fails (returning `false`, with `last_error` set) if a module is
    /// already attached or a segment offset lands outside its target.
    pub fn attach(&mut self, module: &'m mut Module) -> bool {
        if self.module.is_some() {
            return false;
        }

        self.reset_stacks();

        if let Err(err) = Self::apply_segments(module) {
            self.last_error = Some(err);
            return false;
        }

        debug!(
            "module attached: {} functions, {} exports",
            module.num_funcs(),
            module.exports().len()
        );

        self.module = Some(module);
        true
    }

    /// Release the attached module. Returns `false` if none was
    /// attached.
    pub fn detach(&mut self) -> bool {
        if self.module.is_none() {
            return false;
        }

        self.module = None;
        self.reset_stacks();
        true
    }

    /// Run the module's start function, if it declares one.
    pub fn start(&mut self) -> bool {
        let start_func = match self.module.as_deref().and_then(Module::start_func) {
            Some(func_idx) => func_idx,
            None => return true,
        };

        self.call(start_func)
    }

    /// Evaluate every segment's offset expression and copy its payload
    /// into the target memory or table.
    fn apply_segments(module: &mut Module) -> Result<(), VmError> {
        for seg_idx in 0..module.data_segments.len() {
            let seg = module.data_segments[seg_idx].clone();
            let offset_bytes = module.init_expr_bytes(&seg.offset_expr).to_vec();
            let offset = init_expr::eval(module, &offset_bytes, ValueType::I32)?.as_i32() as u32;

            let end = (offset as usize)
                .checked_add(seg.data_len)
                .ok_or(VmError::InvalidMemoryAccess)?;

            let Module {
                memories, data_buf, ..
            } = module;
            let memory = memories
                .get_mut(seg.mem_idx as usize)
                .ok_or(VmError::InvalidMemoryAccess)?;

            if end > memory.bytes.len() {
                return Err(VmError::InvalidMemoryAccess);
            }

            memory.bytes[offset as usize..end]
                .copy_from_slice(&data_buf[seg.data_offset..seg.data_offset + seg.data_len]);
        }

        for seg_idx in 0..module.elem_segments.len() {
            let seg = module.elem_segments[seg_idx].clone();
            let offset_bytes = module.init_expr_bytes(&seg.offset_expr).to_vec();
            let offset = init_expr::eval(module, &offset_bytes, ValueType::I32)?.as_i32() as u32;

            let end = (offset as usize)
                .checked_add(seg.elem_count as usize)
                .ok_or(VmError::InvalidBytes)?;

            let Module {
                tables, elem_buf, ..
            } = module;
            let table = tables
                .get_mut(seg.table_idx as usize)
                .ok_or(VmError::InvalidBytes)?;

            if end > table.elems.len() {
                return Err(VmError::InvalidBytes);
            }

            let elems = &elem_buf
                [seg.elem_offset as usize..(seg.elem_offset + seg.elem_count) as usize];
            table.elems[offset as usize..end].copy_from_slice(elems);
        }

        Ok(())
    }
}
