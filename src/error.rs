//! Interpreter error implementation

use thiserror::Error;

/// Every failure the decoder, validator or executor can produce.
///
/// The taxonomy is flat on purpose: a single code travels from the
/// innermost helper to the host surface without wrapping, and the
/// container records the last one verbatim.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum VmError {
    /// The image doesn't start with the `\0asm` magic bytes.
    #[error("invalid module magic")]
    BadMagic,
    /// The module version field isn't 1.
    #[error("unsupported module version")]
    BadVersion,
    /// Non-custom section IDs must be strictly increasing.
    #[error("section out of order")]
    SectionOutOfOrder,
    /// A non-custom section ID appeared more than once.
    #[error("duplicate section")]
    DuplicateSection,
    /// A section's declared size doesn't match the bytes it consumed.
    #[error("section size mismatch")]
    SectionSizeMismatch,
    /// Malformed or trailing bytes where the format allows none.
    #[error("invalid bytes")]
    InvalidBytes,
    /// An opcode byte outside the MVP encoding, or a reserved slot.
    #[error("invalid opcode")]
    InvalidOpcode,
    /// A block signature byte that isn't a value type or `void`.
    #[error("invalid block signature")]
    InvalidBlockSignature,
    /// An initializer expression used an opcode outside the restricted set.
    #[error("invalid initializer expression")]
    InvalidInitExpression,
    /// A reserved immediate byte that must be zero wasn't.
    #[error("invalid reserved byte")]
    InvalidReserved,
    /// `else` without a matching `if` on the control stack.
    #[error("mismatched if/else")]
    IfElseMismatch,
    /// An `if` with a non-void signature but no `else` branch.
    #[error("valueful if with no else")]
    ValuefulIfWithoutElse,
    /// A `br_table` longer than the configured bound.
    #[error("branch table overflow")]
    BranchTableOverflow,
    /// A `br_table` entry with a bad depth or mismatched signature.
    #[error("invalid branch table")]
    InvalidBranchTable,
    /// A function body whose final byte isn't `end`.
    #[error("invalid end opcode")]
    InvalidEndOpcode,

    /// Function index outside the module's function space.
    #[error("invalid function index")]
    InvalidFuncIndex,
    /// Type index outside the type section.
    #[error("invalid type index")]
    InvalidTypeIndex,
    /// Local index outside the function's parameters and locals.
    #[error("invalid local index")]
    InvalidLocalIndex,
    /// Global index outside the module's global space.
    #[error("invalid global index")]
    InvalidGlobalIndex,

    /// An operand had the wrong type for the opcode consuming it.
    #[error("operand type mismatch")]
    StackTypeMismatch,
    /// Operand, control or call stack overflow or underflow.
    #[error("invalid stack operation")]
    InvalidStackOperation,

    /// The `unreachable` opcode was executed.
    #[error("unreachable code executed")]
    UnreachableCodeExecuted,
    /// `i32` division or remainder by zero.
    #[error("i32 divide by zero")]
    I32DivideByZero,
    /// `i64` division or remainder by zero.
    #[error("i64 divide by zero")]
    I64DivideByZero,
    /// `i32` arithmetic or conversion outside the representable range.
    #[error("i32 overflow")]
    I32Overflow,
    /// `i64` arithmetic or conversion outside the representable range.
    #[error("i64 overflow")]
    I64Overflow,
    /// Float-to-integer truncation of a NaN.
    #[error("invalid integer conversion")]
    InvalidIntegerConversion,
    /// A load or store outside the bounds of linear memory.
    #[error("invalid memory access")]
    InvalidMemoryAccess,
    /// The opcode cursor ran past the end of the code slice.
    #[error("instruction overflow")]
    InstructionOverflow,
    /// Execution was started without a code slice to execute.
    #[error("invalid instruction stream")]
    InvalidInstructionStream,
    /// A read past the end of the byte stream.
    #[error("read overflow")]
    ReadOverflow,

    /// An opcode that is encoded but not implemented by this VM.
    ///
    /// Distinct from [`VmError::InvalidOpcode`] so hosts can tell a
    /// well-formed module using `call_indirect`/`tee_local` from a
    /// corrupted image.
    #[error("unsupported operation")]
    Unsupported,
    /// The allocator refused a memory request.
    #[error("memory allocation failed")]
    MemoryAllocationFailed,
}

impl VmError {
    /// Whether this error is a runtime trap, as opposed to a decode or
    /// validation failure.
    pub const fn is_trap(&self) -> bool {
        matches!(
            self,
            Self::UnreachableCodeExecuted
                | Self::I32DivideByZero
                | Self::I64DivideByZero
                | Self::I32Overflow
                | Self::I64Overflow
                | Self::InvalidIntegerConversion
                | Self::InvalidMemoryAccess
                | Self::InstructionOverflow
                | Self::InvalidInstructionStream
                | Self::InvalidStackOperation
                | Self::Unsupported
        )
    }
}
