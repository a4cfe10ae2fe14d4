//! WebAssembly MVP bytecode interpreter.
//!
//! Three cooperating parts over one data model: a module
//! decoder/scanner, a structural validator that doubles as a
//! pre-compiler (recording every branch target), and a stack-machine
//! executor with deterministic trap semantics.

pub mod consts;
pub mod error;
pub mod interpreter;
pub mod loader;
pub mod module;
pub mod opcode;
pub mod reader;
pub mod scanner;
pub mod types;
pub mod validate;

pub mod prelude {
    pub use crate::error::VmError;
    pub use crate::interpreter::Interpreter;
    pub use crate::module::{Export, ExternalKind, Import, Module};
    pub use crate::opcode::Opcode;
    pub use crate::reader::Reader;
    pub use crate::scanner::ModuleSummary;
    pub use crate::types::{Value, ValueType};
}
