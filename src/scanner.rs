//! First pass over a module image.
//!
//! The scanner walks every section, enforcing the structural rules of
//! the encoding, and counts what it sees without materializing
//! anything. The resulting [`ModuleSummary`] sizes every buffer the
//! loader will populate, so instantiation allocates each buffer exactly
//! once.

use crate::consts::*;
use crate::error::VmError;
use crate::module::ExternalKind;
use crate::opcode::Opcode;
use crate::reader::Reader;
use crate::types::ValueType;

/// Section IDs in the order the encoding requires them.
pub(crate) const SECTION_CUSTOM: u8 = 0x00;
pub(crate) const SECTION_TYPE: u8 = 0x01;
pub(crate) const SECTION_IMPORT: u8 = 0x02;
pub(crate) const SECTION_FUNC: u8 = 0x03;
pub(crate) const SECTION_TABLE: u8 = 0x04;
pub(crate) const SECTION_MEMORY: u8 = 0x05;
pub(crate) const SECTION_GLOBAL: u8 = 0x06;
pub(crate) const SECTION_EXPORT: u8 = 0x07;
pub(crate) const SECTION_START: u8 = 0x08;
pub(crate) const SECTION_ELEMENT: u8 = 0x09;
pub(crate) const SECTION_CODE: u8 = 0x0A;
pub(crate) const SECTION_DATA: u8 = 0x0B;

/// Counts and buffer sizes gathered by the scanner.
#[derive(Debug, Clone, Copy, Default)]
pub struct ModuleSummary {
    pub num_types: u32,
    pub num_type_params: u32,
    pub num_type_results: u32,
    pub num_imports: u32,
    pub import_name_buf_sz: usize,
    pub import_field_buf_sz: usize,
    pub num_funcs: u32,
    pub num_tables: u32,
    pub num_memories: u32,
    pub num_globals: u32,
    pub num_exports: u32,
    pub export_name_buf_sz: usize,
    pub num_elem_segments: u32,
    pub num_elems: u32,
    pub elem_expr_buf_sz: usize,
    pub num_code_locals: u32,
    pub code_buf_sz: usize,
    pub num_block_ops: u32,
    pub num_if_ops: u32,
    pub num_data_segments: u32,
    pub data_buf_sz: usize,
    pub data_expr_buf_sz: usize,
    pub start_func_present: bool,
}

impl ModuleSummary {
    /// Reject summaries that exceed the configured maxima.
    pub fn check(&self) -> Result<(), VmError> {
        if self.num_types > MAX_TYPES
            || self.num_funcs > MAX_FUNCS
            || self.num_imports > MAX_IMPORTS
            || self.num_exports > MAX_EXPORTS
            || self.num_globals > MAX_GLOBALS
            || self.num_tables > MAX_TABLES
            || self.num_memories > MAX_MEMORIES
            || self.num_elem_segments > MAX_ELEM_SEGMENTS
            || self.num_data_segments > MAX_DATA_SEGMENTS
        {
            return Err(VmError::InvalidBytes);
        }

        Ok(())
    }
}

/// Walk the image once, checking structure and counting.
pub fn scan(bytes: &[u8]) -> Result<ModuleSummary, VmError> {
    let mut reader = Reader::new(bytes);

    let magic = reader.read_bytes(4).map_err(|_| VmError::BadMagic)?;
    if magic != &WASM_MAGIC[..] {
        return Err(VmError::BadMagic);
    }

    if reader.read_u32_le().map_err(|_| VmError::BadVersion)? != WASM_VERSION {
        return Err(VmError::BadVersion);
    }

    let mut summary = ModuleSummary::default();
    let mut last_id = 0u8;

    while !reader.at_end() {
        let id = reader.read_u8()?;
        let payload_len = reader.read_varu32()? as usize;
        let payload_start = reader.pos();

        if id != SECTION_CUSTOM {
            if id == last_id {
                return Err(VmError::DuplicateSection);
            }
            if id < last_id {
                return Err(VmError::SectionOutOfOrder);
            }
            last_id = id;
        }

        match id {
            SECTION_CUSTOM => reader.skip(payload_len)?,
            SECTION_TYPE => scan_types(&mut reader, &mut summary)?,
            SECTION_IMPORT => scan_imports(&mut reader, &mut summary)?,
            SECTION_FUNC => scan_funcs(&mut reader, &mut summary)?,
            SECTION_TABLE => scan_tables(&mut reader, &mut summary)?,
            SECTION_MEMORY => scan_memories(&mut reader, &mut summary)?,
            SECTION_GLOBAL => scan_globals(&mut reader, &mut summary)?,
            SECTION_EXPORT => scan_exports(&mut reader, &mut summary)?,
            SECTION_START => scan_start(&mut reader, &mut summary)?,
            SECTION_ELEMENT => scan_elements(&mut reader, &mut summary)?,
            SECTION_CODE => scan_code(&mut reader, &mut summary)?,
            SECTION_DATA => scan_data(&mut reader, &mut summary)?,
            _ => return Err(VmError::InvalidBytes),
        }

        if reader.pos() - payload_start != payload_len {
            return Err(VmError::SectionSizeMismatch);
        }
    }

    Ok(summary)
}

fn scan_types(reader: &mut Reader, summary: &mut ModuleSummary) -> Result<(), VmError> {
    summary.num_types = reader.read_varu32()?;

    for _ in 0..summary.num_types {
        if ValueType::from_vari7(reader.read_vari7()?)? != ValueType::Func {
            return Err(VmError::InvalidBytes);
        }

        let param_count = reader.read_varu32()?;
        for _ in 0..param_count {
            let ty = ValueType::from_vari7(reader.read_vari7()?)?;
            if !ty.is_value() {
                return Err(VmError::InvalidBytes);
            }
        }
        summary.num_type_params += param_count;

        let result_count = reader.read_varu32()?;
        if result_count > MAX_RESULTS {
            return Err(VmError::InvalidBytes);
        }
        for _ in 0..result_count {
            let ty = ValueType::from_vari7(reader.read_vari7()?)?;
            if !ty.is_value() {
                return Err(VmError::InvalidBytes);
            }
        }
        summary.num_type_results += result_count;
    }

    Ok(())
}

fn scan_imports(reader: &mut Reader, summary: &mut ModuleSummary) -> Result<(), VmError> {
    summary.num_imports = reader.read_varu32()?;

    for _ in 0..summary.num_imports {
        let name_len = reader.read_varu32()? as usize;
        reader.skip(name_len)?;
        summary.import_name_buf_sz += name_len;

        let field_len = reader.read_varu32()? as usize;
        reader.skip(field_len)?;
        summary.import_field_buf_sz += field_len;

        match ExternalKind::from_byte(reader.read_u8()?)? {
            ExternalKind::Func => {
                reader.read_varu32()?;
            }
            ExternalKind::Table => {
                reader.read_vari7()?;
                skip_limits(reader)?;
            }
            ExternalKind::Memory => {
                skip_limits(reader)?;
            }
            ExternalKind::Global => {
                reader.read_vari7()?;
                reader.read_u8()?;
            }
        }
    }

    Ok(())
}

fn scan_funcs(reader: &mut Reader, summary: &mut ModuleSummary) -> Result<(), VmError> {
    summary.num_funcs = reader.read_varu32()?;

    for _ in 0..summary.num_funcs {
        reader.read_varu32()?;
    }

    Ok(())
}

fn scan_tables(reader: &mut Reader, summary: &mut ModuleSummary) -> Result<(), VmError> {
    summary.num_tables = reader.read_varu32()?;

    for _ in 0..summary.num_tables {
        if ValueType::from_vari7(reader.read_vari7()?)? != ValueType::AnyFunc {
            return Err(VmError::InvalidBytes);
        }
        skip_limits(reader)?;
    }

    Ok(())
}

fn scan_memories(reader: &mut Reader, summary: &mut ModuleSummary) -> Result<(), VmError> {
    summary.num_memories = reader.read_varu32()?;

    for _ in 0..summary.num_memories {
        skip_limits(reader)?;
    }

    Ok(())
}

fn scan_globals(reader: &mut Reader, summary: &mut ModuleSummary) -> Result<(), VmError> {
    summary.num_globals = reader.read_varu32()?;

    for _ in 0..summary.num_globals {
        let ty = ValueType::from_vari7(reader.read_vari7()?)?;
        if !ty.is_value() {
            return Err(VmError::InvalidBytes);
        }

        reader.read_u8()?;
        skip_init_expr(reader)?;
    }

    Ok(())
}

fn scan_exports(reader: &mut Reader, summary: &mut ModuleSummary) -> Result<(), VmError> {
    summary.num_exports = reader.read_varu32()?;

    for _ in 0..summary.num_exports {
        let name_len = reader.read_varu32()? as usize;
        reader.skip(name_len)?;
        summary.export_name_buf_sz += name_len;

        ExternalKind::from_byte(reader.read_u8()?)?;
        reader.read_varu32()?;
    }

    Ok(())
}

fn scan_start(reader: &mut Reader, summary: &mut ModuleSummary) -> Result<(), VmError> {
    reader.read_varu32()?;
    summary.start_func_present = true;
    Ok(())
}

fn scan_elements(reader: &mut Reader, summary: &mut ModuleSummary) -> Result<(), VmError> {
    summary.num_elem_segments = reader.read_varu32()?;

    for _ in 0..summary.num_elem_segments {
        reader.read_varu32()?;
        summary.elem_expr_buf_sz += skip_init_expr(reader)?;

        let num_elems = reader.read_varu32()?;
        summary.num_elems += num_elems;
        for _ in 0..num_elems {
            reader.read_varu32()?;
        }
    }

    Ok(())
}

fn scan_code(reader: &mut Reader, summary: &mut ModuleSummary) -> Result<(), VmError> {
    let num_bodies = reader.read_varu32()?;

    if num_bodies != summary.num_funcs {
        return Err(VmError::InvalidBytes);
    }

    for _ in 0..num_bodies {
        let body_sz = reader.read_varu32()? as usize;
        let body_start = reader.pos();

        let num_local_runs = reader.read_varu32()?;
        for _ in 0..num_local_runs {
            let run_len = reader.read_varu32()?;
            let ty = ValueType::from_vari7(reader.read_vari7()?)?;
            if !ty.is_value() {
                return Err(VmError::InvalidBytes);
            }
            summary.num_code_locals += run_len;
        }

        let locals_sz = reader.pos() - body_start;
        let code_sz = body_sz.checked_sub(locals_sz).ok_or(VmError::InvalidBytes)?;
        summary.code_buf_sz += code_sz;

        // Peek at every opcode to size the per-function jump tables.
        let code_end = reader.pos() + code_sz;
        while reader.pos() < code_end {
            let opcode = Opcode::from_byte(reader.read_u8()?)?;

            match opcode {
                Opcode::Block => summary.num_block_ops += 1,
                Opcode::If => summary.num_if_ops += 1,
                _ => {}
            }

            skip_immediates(reader, opcode)?;
        }

        // An immediate may not straddle the body boundary.
        if reader.pos() != code_end {
            return Err(VmError::InvalidBytes);
        }
    }

    Ok(())
}

fn scan_data(reader: &mut Reader, summary: &mut ModuleSummary) -> Result<(), VmError> {
    summary.num_data_segments = reader.read_varu32()?;

    for _ in 0..summary.num_data_segments {
        reader.read_varu32()?;
        summary.data_expr_buf_sz += skip_init_expr(reader)?;

        let data_len = reader.read_varu32()? as usize;
        reader.skip(data_len)?;
        summary.data_buf_sz += data_len;
    }

    Ok(())
}

fn skip_limits(reader: &mut Reader) -> Result<(), VmError> {
    let flags = reader.read_varu32()?;
    reader.read_varu32()?;

    if flags & 0x01 != 0 {
        reader.read_varu32()?;
    }

    Ok(())
}

/// Skip one initializer expression, returning its byte length
/// (terminating `end` included).
pub(crate) fn skip_init_expr(reader: &mut Reader) -> Result<usize, VmError> {
    let start = reader.pos();

    loop {
        let opcode = Opcode::from_byte(reader.read_u8()?)?;

        if !opcode.is_init_expr() {
            return Err(VmError::InvalidInitExpression);
        }

        if opcode == Opcode::End {
            return Ok(reader.pos() - start);
        }

        skip_immediates(reader, opcode)?;
    }
}

/// Consume the immediates of `opcode` without interpreting them.
pub(crate) fn skip_immediates(reader: &mut Reader, opcode: Opcode) -> Result<(), VmError> {
    use Opcode::*;

    match opcode {
        Block | Loop | If => {
            reader.read_vari7()?;
        }
        Br | BrIf | Call | GetLocal | SetLocal | TeeLocal | GetGlobal | SetGlobal => {
            reader.read_varu32()?;
        }
        BrTable => {
            let target_count = reader.read_varu32()?;
            for _ in 0..target_count {
                reader.read_varu32()?;
            }
            reader.read_varu32()?;
        }
        CallIndirect => {
            reader.read_varu32()?;
            reader.read_vari7()?;
        }
        I32Load | I64Load | F32Load | F64Load | I32Load8S | I32Load8U | I32Load16S
        | I32Load16U | I64Load8S | I64Load8U | I64Load16S | I64Load16U | I64Load32S
        | I64Load32U | I32Store | I64Store | F32Store | F64Store | I32Store8 | I32Store16
        | I64Store8 | I64Store16 | I64Store32 => {
            reader.read_varu32()?;
            reader.read_varu32()?;
        }
        CurrentMemory | GrowMemory => {
            reader.read_vari32()?;
        }
        I32Const => {
            reader.read_vari32()?;
        }
        I64Const => {
            reader.read_vari64()?;
        }
        F32Const => {
            reader.skip(4)?;
        }
        F64Const => {
            reader.skip(8)?;
        }
        _ => {}
    }

    Ok(())
}
