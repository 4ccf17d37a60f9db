//! # Vireo VM Bytecode
//!
//! This crate defines the bytecode format for the Vireo runtime core:
//! the opcode set, the fixed-width instruction encoding, constant pools,
//! compiled functions, and the on-disk program format.
//!
//! ## Design Principles
//!
//! - **Stack-based**: operations work on a contiguous operand stack
//! - **Fixed-width**: every instruction is 40 bits (opcode + two operands)
//! - **Feedback-aware**: specialization sites carry stable call-site ids
//! - **Serializable**: programs can be cached to disk for fast startup

#![warn(clippy::all)]
#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod constant;
pub mod error;
pub mod function;
pub mod instruction;
pub mod opcode;
pub mod program;
pub mod symbols;
pub mod verify;

pub use constant::{Constant, ConstantPool};
pub use error::BytecodeError;
pub use function::{
    CompiledFunction, ExceptionEntry, FunctionBuilder, LineEntry, ParamSpec, PassingConvention,
};
pub use instruction::Instruction;
pub use opcode::Opcode;
pub use program::Program;
pub use symbols::{Interner, SymbolId};
pub use verify::verify_function;

/// Bytecode format version
pub const BYTECODE_VERSION: u16 = 1;

/// Magic bytes for bytecode files
pub const BYTECODE_MAGIC: [u8; 4] = *b"VIRB";

/// Endianness flag stored in bytecode files (little-endian)
pub const BYTECODE_LITTLE_ENDIAN: u8 = 1;
