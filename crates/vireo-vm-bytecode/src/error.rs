//! Bytecode errors

use thiserror::Error;

/// Errors that can occur during bytecode operations
#[derive(Debug, Error)]
pub enum BytecodeError {
    /// Invalid magic bytes in bytecode file
    #[error("Invalid magic bytes")]
    InvalidMagic,

    /// Unsupported bytecode version
    #[error("Unsupported version: {0}")]
    UnsupportedVersion(u16),

    /// Unsupported endianness flag
    #[error("Invalid endianness flag: {0}")]
    InvalidEndianness(u8),

    /// Invalid opcode byte
    #[error("Invalid opcode: {0:#04x}")]
    InvalidOpcode(u8),

    /// Invalid constant tag in file
    #[error("Invalid constant tag: {0}")]
    InvalidConstantTag(u8),

    /// Invalid passing-convention byte in file
    #[error("Invalid passing convention: {0}")]
    InvalidConvention(u8),

    /// Unexpected end of bytecode
    #[error("Unexpected end of bytecode")]
    UnexpectedEnd,

    /// Symbol section contained non-UTF-8 data
    #[error("Symbol name is not valid UTF-8")]
    InvalidSymbolName,

    /// Symbol index not present in the table
    #[error("Unknown symbol: {0}")]
    UnknownSymbol(u32),

    /// Function index not present in the program
    #[error("Unknown function index: {0}")]
    UnknownFunction(u32),

    /// Two functions linked under the same name
    #[error("Duplicate function name (symbol {0})")]
    DuplicateFunction(u32),

    // ---- Verifier ----
    /// Jump target outside the function body
    #[error("Jump at {pc} targets out-of-bounds instruction {target}")]
    JumpOutOfBounds {
        /// Instruction index of the jump
        pc: usize,
        /// Computed target index
        target: i64,
    },

    /// Constant operand outside the pool
    #[error("Instruction at {pc} references missing constant {index}")]
    BadConstantIndex {
        /// Instruction index
        pc: usize,
        /// Offending constant index
        index: u16,
    },

    /// Local operand outside the frame
    #[error("Instruction at {pc} references missing local slot {index}")]
    BadLocalIndex {
        /// Instruction index
        pc: usize,
        /// Offending local index
        index: u16,
    },

    /// Operand stack would underflow
    #[error("Operand stack underflow at instruction {pc}")]
    StackUnderflow {
        /// Instruction index
        pc: usize,
    },

    /// Operand stack exceeds the declared maximum
    #[error("Operand stack exceeds declared max ({max}) at instruction {pc}")]
    MaxStackExceeded {
        /// Instruction index
        pc: usize,
        /// Declared maximum depth
        max: u16,
    },

    /// Same instruction reached with different stack depths
    #[error("Inconsistent stack depth at instruction {pc}: {first} vs {second}")]
    InconsistentStackDepth {
        /// Instruction index
        pc: usize,
        /// Depth recorded first
        first: u16,
        /// Conflicting depth
        second: u16,
    },

    /// Exception-table range outside the function body
    #[error("Exception table entry covers invalid range {start}..{end}")]
    BadExceptionRange {
        /// Range start
        start: u32,
        /// Range end
        end: u32,
    },

    /// IO error during serialization
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for bytecode operations
pub type Result<T> = std::result::Result<T, BytecodeError>;
