//! Decoded module record.
//!
//! A [`Module`] is the immutable result of [`Module::instantiate`]:
//! flat, up-front sized buffers for every per-function and per-module
//! slice, with prefix-sum offset tables so the validator and executor
//! index contiguous storage instead of chasing per-item allocations.
//! Memories, tables and global cells are the only parts execution
//! mutates.

use num_enum::TryFromPrimitive;

use crate::consts::*;
use crate::error::VmError;
use crate::loader;
use crate::scanner;
use crate::types::ValueType;
use crate::validate;

/// What an import or export refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum ExternalKind {
    Func = 0x00,
    Table = 0x01,
    Memory = 0x02,
    Global = 0x03,
}

impl ExternalKind {
    pub fn from_byte(byte: u8) -> Result<Self, VmError> {
        Self::try_from(byte).map_err(|_| VmError::InvalidBytes)
    }
}

/// A function signature: ranges into the module's flat type buffers.
#[derive(Debug, Clone, Copy, Default)]
pub struct FuncType {
    pub(crate) param_offset: u32,
    pub(crate) param_count: u32,
    pub(crate) result_offset: u32,
    pub(crate) result_count: u32,
}

/// A function body: ranges into the module's flat code, local and
/// jump-table buffers. Block and if addresses are byte offsets into the
/// function's own code slice.
#[derive(Debug, Clone, Copy, Default)]
pub struct Func {
    pub(crate) type_idx: u32,
    pub(crate) local_offset: u32,
    pub(crate) local_count: u32,
    pub(crate) code_offset: usize,
    pub(crate) code_len: usize,
    pub(crate) block_offset: u32,
    pub(crate) block_count: u32,
    pub(crate) if_offset: u32,
    pub(crate) if_count: u32,
}

/// A global variable cell.
#[derive(Debug, Clone, Copy)]
pub struct Global {
    pub(crate) value: u64,
    pub(crate) ty: ValueType,
    pub(crate) mutable: bool,
    pub(crate) imported: bool,
    pub(crate) initialized: bool,
}

/// Linear memory: `num_pages * PAGE_SIZE` bytes.
#[derive(Debug, Clone)]
pub struct Memory {
    pub(crate) bytes: Vec<u8>,
    pub(crate) num_pages: u32,
    pub(crate) max_pages: u32,
}

impl Memory {
    pub(crate) fn new(num_pages: u32, max_pages: u32) -> Self {
        Self {
            bytes: vec![0; num_pages as usize * PAGE_SIZE as usize],
            num_pages,
            max_pages,
        }
    }

    pub const fn num_pages(&self) -> u32 {
        self.num_pages
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Grow by `delta` pages, preserving contents and zero-filling the
    /// extension. Returns the pre-growth page count, or -1 if the
    /// declared maximum would be exceeded.
    pub(crate) fn grow(&mut self, delta: u32) -> i32 {
        if delta == 0 {
            return self.num_pages as i32;
        }

        let total_pages = match self.num_pages.checked_add(delta) {
            Some(pages) if pages <= self.max_pages => pages,
            _ => return -1,
        };

        let prev_pages = self.num_pages;
        self.bytes.resize(total_pages as usize * PAGE_SIZE as usize, 0);
        self.num_pages = total_pages;

        prev_pages as i32
    }
}

/// A function table. The MVP restricts elements to `any-func`.
#[derive(Debug, Clone)]
pub struct Table {
    pub(crate) elem_type: ValueType,
    pub(crate) elems: Vec<u32>,
    pub(crate) max_elems: u32,
}

/// A deferred initializer expression: a range into the module's
/// init-expression byte buffer plus its declared result type.
#[derive(Debug, Clone, Copy, Default)]
pub struct InitExpr {
    pub(crate) offset: usize,
    pub(crate) len: usize,
}

/// An element segment: function indices destined for a table slot run.
#[derive(Debug, Clone)]
pub struct ElemSegment {
    pub(crate) table_idx: u32,
    pub(crate) offset_expr: InitExpr,
    pub(crate) elem_offset: u32,
    pub(crate) elem_count: u32,
}

/// A data segment: raw bytes destined for linear memory.
#[derive(Debug, Clone)]
pub struct DataSegment {
    pub(crate) mem_idx: u32,
    pub(crate) offset_expr: InitExpr,
    pub(crate) data_offset: usize,
    pub(crate) data_len: usize,
}

/// A declared import. Resolution across modules is out of scope; the
/// record carries the name pair, kind and index only.
#[derive(Debug, Clone)]
pub struct Import {
    pub name: String,
    pub field: String,
    pub kind: ExternalKind,
    pub idx: u32,
}

/// A named export.
#[derive(Debug, Clone)]
pub struct Export {
    pub name: String,
    pub kind: ExternalKind,
    pub idx: u32,
}

/// The decoded, validated form of a WebAssembly binary.
#[derive(Debug, Clone, Default)]
pub struct Module {
    // Flat type buffers, indexed through `FuncType` ranges.
    pub(crate) param_types: Vec<ValueType>,
    pub(crate) result_types: Vec<ValueType>,
    pub(crate) types: Vec<FuncType>,

    // Function bodies: expanded locals and raw code.
    pub(crate) funcs: Vec<Func>,
    pub(crate) local_types: Vec<ValueType>,
    pub(crate) code: Vec<u8>,

    // Jump tables the validator records, prefix-summed per function.
    // `else_addrs[i]` is zero when if `i` has no else branch.
    pub(crate) block_addrs: Vec<usize>,
    pub(crate) block_labels: Vec<usize>,
    pub(crate) if_addrs: Vec<usize>,
    pub(crate) if_labels: Vec<usize>,
    pub(crate) else_addrs: Vec<usize>,

    pub(crate) globals: Vec<Global>,
    pub(crate) memories: Vec<Memory>,
    pub(crate) tables: Vec<Table>,

    pub(crate) elem_segments: Vec<ElemSegment>,
    pub(crate) elem_buf: Vec<u32>,
    pub(crate) data_segments: Vec<DataSegment>,
    pub(crate) data_buf: Vec<u8>,
    pub(crate) init_expr_buf: Vec<u8>,

    pub(crate) imports: Vec<Import>,
    pub(crate) exports: Vec<Export>,
    pub(crate) start_func: Option<u32>,
}

impl Module {
    /// Decode and validate a module image.
    ///
    /// Walks the image twice (count, then populate), checks the counts
    /// against the configured maxima, and runs the type-checking
    /// pre-compiler over every function body. On any failure the
    /// partially-built record is dropped and the first error in file
    /// order is returned.
    pub fn instantiate(bytes: &[u8]) -> Result<Self, VmError> {
        let summary = scanner::scan(bytes)?;
        summary.check()?;

        let mut module = loader::load(bytes, &summary)?;
        validate::validate(&mut module)?;

        Ok(module)
    }

    pub fn num_funcs(&self) -> u32 {
        self.funcs.len() as u32
    }

    pub fn num_globals(&self) -> u32 {
        self.globals.len() as u32
    }

    pub fn exports(&self) -> &[Export] {
        &self.exports
    }

    pub fn imports(&self) -> &[Import] {
        &self.imports
    }

    pub fn start_func(&self) -> Option<u32> {
        self.start_func
    }

    /// Find an exported function by name.
    pub fn export_func(&self, name: &str) -> Result<u32, VmError> {
        self.exports
            .iter()
            .find(|export| export.kind == ExternalKind::Func && export.name == name)
            .map(|export| export.idx)
            .ok_or(VmError::InvalidFuncIndex)
    }

    /// Supply the cell value of an imported global before attaching.
    pub fn import_global(&mut self, value: u64, global_idx: u32) -> Result<(), VmError> {
        let global = self
            .globals
            .get_mut(global_idx as usize)
            .ok_or(VmError::InvalidGlobalIndex)?;

        if !global.imported {
            return Err(VmError::InvalidGlobalIndex);
        }

        global.value = value;
        global.initialized = true;
        Ok(())
    }

    pub(crate) fn func(&self, func_idx: u32) -> Result<&Func, VmError> {
        self.funcs
            .get(func_idx as usize)
            .ok_or(VmError::InvalidFuncIndex)
    }

    pub(crate) fn func_type(&self, func_idx: u32) -> Result<&FuncType, VmError> {
        let func = self.func(func_idx)?;
        self.types
            .get(func.type_idx as usize)
            .ok_or(VmError::InvalidTypeIndex)
    }

    pub(crate) fn param_types(&self, ty: &FuncType) -> &[ValueType] {
        let offset = ty.param_offset as usize;
        &self.param_types[offset..offset + ty.param_count as usize]
    }

    pub(crate) fn result_types(&self, ty: &FuncType) -> &[ValueType] {
        let offset = ty.result_offset as usize;
        &self.result_types[offset..offset + ty.result_count as usize]
    }

    pub(crate) fn local_types(&self, func: &Func) -> &[ValueType] {
        let offset = func.local_offset as usize;
        &self.local_types[offset..offset + func.local_count as usize]
    }

    pub(crate) fn code(&self, func: &Func) -> &[u8] {
        &self.code[func.code_offset..func.code_offset + func.code_len]
    }

    /// Resolve a `block` opcode address to its jump-table slot.
    pub(crate) fn block_idx(&self, func: &Func, address: usize) -> Result<usize, VmError> {
        let offset = func.block_offset as usize;
        let addrs = &self.block_addrs[offset..offset + func.block_count as usize];

        addrs
            .binary_search(&address)
            .map(|idx| offset + idx)
            .map_err(|_| VmError::InvalidInstructionStream)
    }

    /// Resolve an `if` opcode address to its jump-table slot.
    pub(crate) fn if_idx(&self, func: &Func, address: usize) -> Result<usize, VmError> {
        let offset = func.if_offset as usize;
        let addrs = &self.if_addrs[offset..offset + func.if_count as usize];

        addrs
            .binary_search(&address)
            .map(|idx| offset + idx)
            .map_err(|_| VmError::InvalidInstructionStream)
    }

    pub(crate) fn init_expr_bytes(&self, expr: &InitExpr) -> &[u8] {
        &self.init_expr_buf[expr.offset..expr.offset + expr.len]
    }
}
