//! Programmatic WebAssembly binary builder for the test suites.

#![allow(dead_code)]

use wasm_vm::opcode::Opcode;

pub const I32: u8 = 0x7F;
pub const I64: u8 = 0x7E;
pub const F32: u8 = 0x7D;
pub const F64: u8 = 0x7C;
pub const ANY_FUNC: u8 = 0x70;
pub const VOID: u8 = 0x40;

pub const KIND_FUNC: u8 = 0x00;
pub const KIND_TABLE: u8 = 0x01;
pub const KIND_MEMORY: u8 = 0x02;
pub const KIND_GLOBAL: u8 = 0x03;

/* LEB128 emitters */

pub fn leb_u32(out: &mut Vec<u8>, mut value: u32) {
    loop {
        let mut byte = (value & 0x7F) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if value == 0 {
            return;
        }
    }
}

pub fn leb_i64(out: &mut Vec<u8>, mut value: i64) {
    loop {
        let byte = (value & 0x7F) as u8;
        value >>= 7;

        let done = (value == 0 && byte & 0x40 == 0) || (value == -1 && byte & 0x40 != 0);
        out.push(if done { byte } else { byte | 0x80 });
        if done {
            return;
        }
    }
}

pub fn leb_i32(out: &mut Vec<u8>, value: i32) {
    leb_i64(out, value as i64);
}

/* function body builder */

#[derive(Default, Clone)]
pub struct Body {
    locals: Vec<(u32, u8)>,
    code: Vec<u8>,
}

impl Body {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a run of `count` locals of type `ty`.
    pub fn local(mut self, count: u32, ty: u8) -> Self {
        self.locals.push((count, ty));
        self
    }

    /// Append a bare opcode.
    pub fn op(mut self, opcode: Opcode) -> Self {
        self.code.push(opcode as u8);
        self
    }

    /// Append a raw byte (for malformed-input tests).
    pub fn raw(mut self, byte: u8) -> Self {
        self.code.push(byte);
        self
    }

    pub fn i32_const(mut self, value: i32) -> Self {
        self.code.push(Opcode::I32Const as u8);
        leb_i32(&mut self.code, value);
        self
    }

    pub fn i64_const(mut self, value: i64) -> Self {
        self.code.push(Opcode::I64Const as u8);
        leb_i64(&mut self.code, value);
        self
    }

    pub fn f32_const(self, value: f32) -> Self {
        self.f32_const_bits(value.to_bits())
    }

    pub fn f32_const_bits(mut self, bits: u32) -> Self {
        self.code.push(Opcode::F32Const as u8);
        self.code.extend_from_slice(&bits.to_le_bytes());
        self
    }

    pub fn f64_const(self, value: f64) -> Self {
        self.f64_const_bits(value.to_bits())
    }

    pub fn f64_const_bits(mut self, bits: u64) -> Self {
        self.code.push(Opcode::F64Const as u8);
        self.code.extend_from_slice(&bits.to_le_bytes());
        self
    }

    pub fn block(mut self, signature: u8) -> Self {
        self.code.push(Opcode::Block as u8);
        self.code.push(signature);
        self
    }

    pub fn loop_(mut self, signature: u8) -> Self {
        self.code.push(Opcode::Loop as u8);
        self.code.push(signature);
        self
    }

    pub fn if_(mut self, signature: u8) -> Self {
        self.code.push(Opcode::If as u8);
        self.code.push(signature);
        self
    }

    pub fn else_(self) -> Self {
        self.op(Opcode::Else)
    }

    pub fn end(self) -> Self {
        self.op(Opcode::End)
    }

    pub fn br(mut self, depth: u32) -> Self {
        self.code.push(Opcode::Br as u8);
        leb_u32(&mut self.code, depth);
        self
    }

    pub fn br_if(mut self, depth: u32) -> Self {
        self.code.push(Opcode::BrIf as u8);
        leb_u32(&mut self.code, depth);
        self
    }

    pub fn br_table(mut self, targets: &[u32], default: u32) -> Self {
        self.code.push(Opcode::BrTable as u8);
        leb_u32(&mut self.code, targets.len() as u32);
        for &target in targets {
            leb_u32(&mut self.code, target);
        }
        leb_u32(&mut self.code, default);
        self
    }

    pub fn call(mut self, func_idx: u32) -> Self {
        self.code.push(Opcode::Call as u8);
        leb_u32(&mut self.code, func_idx);
        self
    }

    pub fn get_local(mut self, idx: u32) -> Self {
        self.code.push(Opcode::GetLocal as u8);
        leb_u32(&mut self.code, idx);
        self
    }

    pub fn set_local(mut self, idx: u32) -> Self {
        self.code.push(Opcode::SetLocal as u8);
        leb_u32(&mut self.code, idx);
        self
    }

    pub fn tee_local(mut self, idx: u32) -> Self {
        self.code.push(Opcode::TeeLocal as u8);
        leb_u32(&mut self.code, idx);
        self
    }

    pub fn get_global(mut self, idx: u32) -> Self {
        self.code.push(Opcode::GetGlobal as u8);
        leb_u32(&mut self.code, idx);
        self
    }

    pub fn set_global(mut self, idx: u32) -> Self {
        self.code.push(Opcode::SetGlobal as u8);
        leb_u32(&mut self.code, idx);
        self
    }

    /// A load or store opcode with its alignment-hint and offset
    /// immediates.
    pub fn mem_op(mut self, opcode: Opcode, align: u32, offset: u32) -> Self {
        self.code.push(opcode as u8);
        leb_u32(&mut self.code, align);
        leb_u32(&mut self.code, offset);
        self
    }

    pub fn current_memory(mut self) -> Self {
        self.code.push(Opcode::CurrentMemory as u8);
        self.code.push(0x00);
        self
    }

    pub fn grow_memory(mut self) -> Self {
        self.code.push(Opcode::GrowMemory as u8);
        self.code.push(0x00);
        self
    }

    fn emit(&self, out: &mut Vec<u8>) {
        let mut body = Vec::new();
        leb_u32(&mut body, self.locals.len() as u32);
        for &(count, ty) in &self.locals {
            leb_u32(&mut body, count);
            body.push(ty);
        }
        body.extend_from_slice(&self.code);

        leb_u32(out, body.len() as u32);
        out.extend_from_slice(&body);
    }
}

/* init expressions */

pub fn init_i32(value: i32) -> Vec<u8> {
    let mut expr = vec![Opcode::I32Const as u8];
    leb_i32(&mut expr, value);
    expr.push(Opcode::End as u8);
    expr
}

pub fn init_get_global(idx: u32) -> Vec<u8> {
    let mut expr = vec![Opcode::GetGlobal as u8];
    leb_u32(&mut expr, idx);
    expr.push(Opcode::End as u8);
    expr
}

/* module builder */

struct GlobalDecl {
    ty: u8,
    mutable: bool,
    init: Vec<u8>,
}

struct ImportDecl {
    name: String,
    field: String,
    kind: u8,
    payload: Vec<u8>,
}

#[derive(Default)]
pub struct ModuleBuilder {
    types: Vec<(Vec<u8>, Vec<u8>)>,
    imports: Vec<ImportDecl>,
    funcs: Vec<u32>,
    bodies: Vec<Body>,
    table: Option<(u32, Option<u32>)>,
    memory: Option<(u32, Option<u32>)>,
    globals: Vec<GlobalDecl>,
    exports: Vec<(String, u8, u32)>,
    start: Option<u32>,
    elems: Vec<(u32, Vec<u8>, Vec<u32>)>,
    data: Vec<(u32, Vec<u8>, Vec<u8>)>,
}

impl ModuleBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ty(&mut self, params: &[u8], results: &[u8]) -> u32 {
        self.types.push((params.to_vec(), results.to_vec()));
        self.types.len() as u32 - 1
    }

    pub fn func(&mut self, type_idx: u32, body: Body) -> u32 {
        self.funcs.push(type_idx);
        self.bodies.push(body);
        self.funcs.len() as u32 - 1
    }

    pub fn export_func(&mut self, name: &str, func_idx: u32) -> &mut Self {
        self.exports.push((name.to_string(), KIND_FUNC, func_idx));
        self
    }

    pub fn memory(&mut self, min: u32, max: Option<u32>) -> &mut Self {
        self.memory = Some((min, max));
        self
    }

    pub fn table(&mut self, min: u32, max: Option<u32>) -> &mut Self {
        self.table = Some((min, max));
        self
    }

    pub fn global(&mut self, ty: u8, mutable: bool, init: Vec<u8>) -> &mut Self {
        self.globals.push(GlobalDecl { ty, mutable, init });
        self
    }

    pub fn import_global(&mut self, name: &str, field: &str, ty: u8, mutable: bool) -> &mut Self {
        self.imports.push(ImportDecl {
            name: name.to_string(),
            field: field.to_string(),
            kind: KIND_GLOBAL,
            payload: vec![ty, mutable as u8],
        });
        self
    }

    pub fn start(&mut self, func_idx: u32) -> &mut Self {
        self.start = Some(func_idx);
        self
    }

    pub fn elem(&mut self, table_idx: u32, offset: Vec<u8>, funcs: &[u32]) -> &mut Self {
        self.elems.push((table_idx, offset, funcs.to_vec()));
        self
    }

    pub fn data(&mut self, mem_idx: u32, offset: Vec<u8>, bytes: &[u8]) -> &mut Self {
        self.data.push((mem_idx, offset, bytes.to_vec()));
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let mut out = vec![0x00, 0x61, 0x73, 0x6D, 0x01, 0x00, 0x00, 0x00];

        if !self.types.is_empty() {
            let mut payload = Vec::new();
            leb_u32(&mut payload, self.types.len() as u32);
            for (params, results) in &self.types {
                payload.push(0x60);
                leb_u32(&mut payload, params.len() as u32);
                payload.extend_from_slice(params);
                leb_u32(&mut payload, results.len() as u32);
                payload.extend_from_slice(results);
            }
            section(&mut out, 0x01, payload);
        }

        if !self.imports.is_empty() {
            let mut payload = Vec::new();
            leb_u32(&mut payload, self.imports.len() as u32);
            for import in &self.imports {
                name(&mut payload, &import.name);
                name(&mut payload, &import.field);
                payload.push(import.kind);
                payload.extend_from_slice(&import.payload);
            }
            section(&mut out, 0x02, payload);
        }

        if !self.funcs.is_empty() {
            let mut payload = Vec::new();
            leb_u32(&mut payload, self.funcs.len() as u32);
            for &type_idx in &self.funcs {
                leb_u32(&mut payload, type_idx);
            }
            section(&mut out, 0x03, payload);
        }

        if let Some((min, max)) = self.table {
            let mut payload = Vec::new();
            leb_u32(&mut payload, 1);
            payload.push(ANY_FUNC);
            limits(&mut payload, min, max);
            section(&mut out, 0x04, payload);
        }

        if let Some((min, max)) = self.memory {
            let mut payload = Vec::new();
            leb_u32(&mut payload, 1);
            limits(&mut payload, min, max);
            section(&mut out, 0x05, payload);
        }

        if !self.globals.is_empty() {
            let mut payload = Vec::new();
            leb_u32(&mut payload, self.globals.len() as u32);
            for global in &self.globals {
                payload.push(global.ty);
                payload.push(global.mutable as u8);
                payload.extend_from_slice(&global.init);
            }
            section(&mut out, 0x06, payload);
        }

        if !self.exports.is_empty() {
            let mut payload = Vec::new();
            leb_u32(&mut payload, self.exports.len() as u32);
            for (export_name, kind, idx) in &self.exports {
                name(&mut payload, export_name);
                payload.push(*kind);
                leb_u32(&mut payload, *idx);
            }
            section(&mut out, 0x07, payload);
        }

        if let Some(func_idx) = self.start {
            let mut payload = Vec::new();
            leb_u32(&mut payload, func_idx);
            section(&mut out, 0x08, payload);
        }

        if !self.elems.is_empty() {
            let mut payload = Vec::new();
            leb_u32(&mut payload, self.elems.len() as u32);
            for (table_idx, offset, funcs) in &self.elems {
                leb_u32(&mut payload, *table_idx);
                payload.extend_from_slice(offset);
                leb_u32(&mut payload, funcs.len() as u32);
                for &func_idx in funcs {
                    leb_u32(&mut payload, func_idx);
                }
            }
            section(&mut out, 0x09, payload);
        }

        if !self.bodies.is_empty() {
            let mut payload = Vec::new();
            leb_u32(&mut payload, self.bodies.len() as u32);
            for body in &self.bodies {
                body.emit(&mut payload);
            }
            section(&mut out, 0x0A, payload);
        }

        if !self.data.is_empty() {
            let mut payload = Vec::new();
            leb_u32(&mut payload, self.data.len() as u32);
            for (mem_idx, offset, bytes) in &self.data {
                leb_u32(&mut payload, *mem_idx);
                payload.extend_from_slice(offset);
                leb_u32(&mut payload, bytes.len() as u32);
                payload.extend_from_slice(bytes);
            }
            section(&mut out, 0x0B, payload);
        }

        out
    }
}

fn section(out: &mut Vec<u8>, id: u8, payload: Vec<u8>) {
    out.push(id);
    leb_u32(out, payload.len() as u32);
    out.extend_from_slice(&payload);
}

fn name(out: &mut Vec<u8>, text: &str) {
    leb_u32(out, text.len() as u32);
    out.extend_from_slice(text.as_bytes());
}

fn limits(out: &mut Vec<u8>, min: u32, max: Option<u32>) {
    match max {
        Some(max) => {
            out.push(0x01);
            leb_u32(out, min);
            leb_u32(out, max);
        }
        None => {
            out.push(0x00);
            leb_u32(out, min);
        }
    }
}
