//! Second pass over a module image.
//!
//! Driven by the scanner's [`ModuleSummary`], the loader allocates
//! every module buffer once and populates it: type signatures, expanded
//! local runs, raw code slices, evaluated global cells, names and
//! segment payloads. The loader decodes and places only; type checking
//! belongs to the validator.

use itertools::repeat_n;

use crate::consts::*;
use crate::error::VmError;
use crate::interpreter::init_expr;
use crate::module::{
    DataSegment, ElemSegment, Export, ExternalKind, Func, FuncType, Global, Import, InitExpr,
    Memory, Module, Table,
};
use crate::reader::Reader;
use crate::scanner::{self, ModuleSummary};
use crate::types::ValueType;

/// Populate a module record from a scanned image.
pub fn load(bytes: &[u8], summary: &ModuleSummary) -> Result<Module, VmError> {
    let mut module = Module {
        param_types: Vec::with_capacity(summary.num_type_params as usize),
        result_types: Vec::with_capacity(summary.num_type_results as usize),
        types: Vec::with_capacity(summary.num_types as usize),
        funcs: Vec::with_capacity(summary.num_funcs as usize),
        local_types: Vec::with_capacity(summary.num_code_locals as usize),
        code: Vec::with_capacity(summary.code_buf_sz),
        block_addrs: Vec::with_capacity(summary.num_block_ops as usize),
        block_labels: Vec::with_capacity(summary.num_block_ops as usize),
        if_addrs: Vec::with_capacity(summary.num_if_ops as usize),
        if_labels: Vec::with_capacity(summary.num_if_ops as usize),
        else_addrs: Vec::with_capacity(summary.num_if_ops as usize),
        globals: Vec::with_capacity(summary.num_globals as usize),
        memories: Vec::with_capacity(summary.num_memories as usize),
        tables: Vec::with_capacity(summary.num_tables as usize),
        elem_segments: Vec::with_capacity(summary.num_elem_segments as usize),
        elem_buf: Vec::with_capacity(summary.num_elems as usize),
        data_segments: Vec::with_capacity(summary.num_data_segments as usize),
        data_buf: Vec::with_capacity(summary.data_buf_sz),
        init_expr_buf: Vec::with_capacity(summary.elem_expr_buf_sz + summary.data_expr_buf_sz),
        imports: Vec::with_capacity(summary.num_imports as usize),
        exports: Vec::with_capacity(summary.num_exports as usize),
        start_func: None,
    };

    let mut reader = Reader::new(bytes);
    reader.skip(8)?; // magic and version, already checked

    while !reader.at_end() {
        let id = reader.read_u8()?;
        let payload_len = reader.read_varu32()? as usize;

        match id {
            scanner::SECTION_CUSTOM => reader.skip(payload_len)?,
            scanner::SECTION_TYPE => load_types(&mut reader, &mut module)?,
            scanner::SECTION_IMPORT => load_imports(&mut reader, &mut module)?,
            scanner::SECTION_FUNC => load_funcs(&mut reader, &mut module)?,
            scanner::SECTION_TABLE => load_tables(&mut reader, &mut module)?,
            scanner::SECTION_MEMORY => load_memories(&mut reader, &mut module)?,
            scanner::SECTION_GLOBAL => load_globals(&mut reader, &mut module)?,
            scanner::SECTION_EXPORT => load_exports(&mut reader, &mut module)?,
            scanner::SECTION_START => load_start(&mut reader, &mut module)?,
            scanner::SECTION_ELEMENT => load_elements(&mut reader, &mut module)?,
            scanner::SECTION_CODE => load_code(&mut reader, &mut module)?,
            scanner::SECTION_DATA => load_data(&mut reader, &mut module)?,
            _ => return Err(VmError::InvalidBytes),
        }
    }

    Ok(module)
}

fn load_types(reader: &mut Reader, module: &mut Module) -> Result<(), VmError> {
    let num_types = reader.read_varu32()?;

    for _ in 0..num_types {
        reader.read_vari7()?; // func form

        let param_offset = module.param_types.len() as u32;
        let param_count = reader.read_varu32()?;
        for _ in 0..param_count {
            module
                .param_types
                .push(ValueType::from_vari7(reader.read_vari7()?)?);
        }

        let result_offset = module.result_types.len() as u32;
        let result_count = reader.read_varu32()?;
        for _ in 0..result_count {
            module
                .result_types
                .push(ValueType::from_vari7(reader.read_vari7()?)?);
        }

        module.types.push(FuncType {
            param_offset,
            param_count,
            result_offset,
            result_count,
        });
    }

    Ok(())
}

fn load_imports(reader: &mut Reader, module: &mut Module) -> Result<(), VmError> {
    let num_imports = reader.read_varu32()?;

    for _ in 0..num_imports {
        let name = read_name(reader)?;
        let field = read_name(reader)?;
        let kind = ExternalKind::from_byte(reader.read_u8()?)?;

        let idx = match kind {
            ExternalKind::Func => reader.read_varu32()?,
            ExternalKind::Table => {
                reader.read_vari7()?;
                read_limits(reader)?;
                0
            }
            ExternalKind::Memory => {
                read_limits(reader)?;
                0
            }
            ExternalKind::Global => {
                let ty = ValueType::from_vari7(reader.read_vari7()?)?;
                let mutable = reader.read_u8()? != 0;
                let idx = module.globals.len() as u32;

                // Cell supplied by the host via `import_global`.
                module.globals.push(Global {
                    value: 0,
                    ty,
                    mutable,
                    imported: true,
                    initialized: false,
                });

                idx
            }
        };

        module.imports.push(Import {
            name,
            field,
            kind,
            idx,
        });
    }

    Ok(())
}

fn load_funcs(reader: &mut Reader, module: &mut Module) -> Result<(), VmError> {
    let num_funcs = reader.read_varu32()?;

    for _ in 0..num_funcs {
        let type_idx = reader.read_varu32()?;

        if type_idx as usize >= module.types.len() {
            return Err(VmError::InvalidTypeIndex);
        }

        module.funcs.push(Func {
            type_idx,
            ..Func::default()
        });
    }

    Ok(())
}

fn load_tables(reader: &mut Reader, module: &mut Module) -> Result<(), VmError> {
    let num_tables = reader.read_varu32()?;

    for _ in 0..num_tables {
        let elem_type = ValueType::from_vari7(reader.read_vari7()?)?;
        let (min, max) = read_limits(reader)?;

        module.tables.push(Table {
            elem_type,
            elems: vec![0; min as usize],
            max_elems: max.unwrap_or(u32::MAX),
        });
    }

    Ok(())
}

fn load_memories(reader: &mut Reader, module: &mut Module) -> Result<(), VmError> {
    let num_memories = reader.read_varu32()?;

    for _ in 0..num_memories {
        let (min, max) = read_limits(reader)?;
        let max = max.unwrap_or(MAX_PAGES);

        if min > MAX_PAGES || max > MAX_PAGES || min > max {
            return Err(VmError::InvalidBytes);
        }

        module.memories.push(Memory::new(min, max));
    }

    Ok(())
}

fn load_globals(reader: &mut Reader, module: &mut Module) -> Result<(), VmError> {
    let num_globals = reader.read_varu32()?;

    for _ in 0..num_globals {
        let ty = ValueType::from_vari7(reader.read_vari7()?)?;
        let mutable = reader.read_u8()? != 0;

        let expr_len = {
            let mut probe = reader.clone();
            scanner::skip_init_expr(&mut probe)?
        };
        let expr_bytes = reader.read_bytes(expr_len)?;

        let value = init_expr::eval(module, expr_bytes, ty)?;

        module.globals.push(Global {
            value: value.bits(),
            ty,
            mutable,
            imported: false,
            initialized: true,
        });
    }

    Ok(())
}

fn load_exports(reader: &mut Reader, module: &mut Module) -> Result<(), VmError> {
    let num_exports = reader.read_varu32()?;

    for _ in 0..num_exports {
        let name = read_name(reader)?;
        let kind = ExternalKind::from_byte(reader.read_u8()?)?;
        let idx = reader.read_varu32()?;

        module.exports.push(Export { name, kind, idx });
    }

    Ok(())
}

fn load_start(reader: &mut Reader, module: &mut Module) -> Result<(), VmError> {
    let func_idx = reader.read_varu32()?;

    if func_idx as usize >= module.funcs.len() {
        return Err(VmError::InvalidFuncIndex);
    }

    module.start_func = Some(func_idx);
    Ok(())
}

fn load_elements(reader: &mut Reader, module: &mut Module) -> Result<(), VmError> {
    let num_segments = reader.read_varu32()?;

    for _ in 0..num_segments {
        let table_idx = reader.read_varu32()?;
        if table_idx as usize >= module.tables.len() {
            return Err(VmError::InvalidBytes);
        }

        let offset_expr = read_init_expr(reader, module)?;

        let elem_offset = module.elem_buf.len() as u32;
        let elem_count = reader.read_varu32()?;
        for _ in 0..elem_count {
            let func_idx = reader.read_varu32()?;
            if func_idx as usize >= module.funcs.len() {
                return Err(VmError::InvalidFuncIndex);
            }
            module.elem_buf.push(func_idx);
        }

        module.elem_segments.push(ElemSegment {
            table_idx,
            offset_expr,
            elem_offset,
            elem_count,
        });
    }

    Ok(())
}

fn load_code(reader: &mut Reader, module: &mut Module) -> Result<(), VmError> {
    let num_bodies = reader.read_varu32()?;

    for body_idx in 0..num_bodies as usize {
        let body_sz = reader.read_varu32()? as usize;
        let body_start = reader.pos();

        let local_offset = module.local_types.len() as u32;
        let num_local_runs = reader.read_varu32()?;
        for _ in 0..num_local_runs {
            let run_len = reader.read_varu32()?;
            let ty = ValueType::from_vari7(reader.read_vari7()?)?;
            module.local_types.extend(repeat_n(ty, run_len as usize));
        }
        let local_count = module.local_types.len() as u32 - local_offset;

        let func_ty = module.types[module.funcs[body_idx].type_idx as usize];
        if func_ty.param_count + local_count > MAX_FUNC_LOCALS {
            return Err(VmError::InvalidBytes);
        }

        let locals_sz = reader.pos() - body_start;
        let code_len = body_sz.checked_sub(locals_sz).ok_or(VmError::InvalidBytes)?;

        let code_offset = module.code.len();
        module.code.extend_from_slice(reader.read_bytes(code_len)?);

        let func = &mut module.funcs[body_idx];
        func.local_offset = local_offset;
        func.local_count = local_count;
        func.code_offset = code_offset;
        func.code_len = code_len;
    }

    Ok(())
}

fn load_data(reader: &mut Reader, module: &mut Module) -> Result<(), VmError> {
    let num_segments = reader.read_varu32()?;

    for _ in 0..num_segments {
        let mem_idx = reader.read_varu32()?;
        if mem_idx as usize >= module.memories.len() {
            return Err(VmError::InvalidBytes);
        }

        let offset_expr = read_init_expr(reader, module)?;

        let data_offset = module.data_buf.len();
        let data_len = reader.read_varu32()? as usize;
        module.data_buf.extend_from_slice(reader.read_bytes(data_len)?);

        module.data_segments.push(DataSegment {
            mem_idx,
            offset_expr,
            data_offset,
            data_len,
        });
    }

    Ok(())
}

fn read_name(reader: &mut Reader) -> Result<String, VmError> {
    let len = reader.read_varu32()? as usize;
    let bytes = reader.read_bytes(len)?;

    String::from_utf8(bytes.to_vec()).map_err(|_| VmError::InvalidBytes)
}

fn read_limits(reader: &mut Reader) -> Result<(u32, Option<u32>), VmError> {
    let flags = reader.read_varu32()?;
    let min = reader.read_varu32()?;

    let max = if flags & 0x01 != 0 {
        Some(reader.read_varu32()?)
    } else {
        None
    };

    Ok((min, max))
}

/// Copy an initializer expression into the module's retained buffer for
/// deferred evaluation at attach time.
fn read_init_expr(reader: &mut Reader, module: &mut Module) -> Result<InitExpr, VmError> {
    let expr_len = {
        let mut probe = reader.clone();
        scanner::skip_init_expr(&mut probe)?
    };

    let offset = module.init_expr_buf.len();
    module
        .init_expr_buf
        .extend_from_slice(reader.read_bytes(expr_len)?);

    Ok(InitExpr {
        offset,
        len: expr_len,
    })
}
