//! Compile errors

use thiserror::Error;
use vireo_vm_bytecode::BytecodeError;

/// Errors produced while compiling an AST to bytecode
#[derive(Debug, Error)]
pub enum CompileError {
    /// Call to a name that is neither a declared function nor a builtin
    #[error("Unknown function: {0}")]
    UnknownFunction(String),

    /// Reference to an unregistered class
    #[error("Unknown class: {0}")]
    UnknownClass(String),

    /// Closure refers to a function not declared in the program
    #[error("Unknown closure target: {0}")]
    UnknownClosureTarget(String),

    /// A by-reference parameter received a non-variable argument
    #[error("Argument {index} to {function} must be a variable (by-reference parameter)")]
    ByRefNeedsVariable {
        /// Callee name
        function: String,
        /// 0-indexed argument position
        index: usize,
    },

    /// Parameter default is not a literal
    #[error("Default value of parameter {0} must be a literal")]
    NonLiteralDefault(String),

    /// Jump distance exceeds the 16-bit instruction operand
    #[error("Jump offset out of range at instruction {0}")]
    JumpTooFar(usize),

    /// More locals than the frame can address
    #[error("Too many locals in function {0}")]
    TooManyLocals(String),

    /// More constants than the pool can address
    #[error("Constant pool overflow in function {0}")]
    TooManyConstants(String),

    /// The entry function is missing
    #[error("Entry function {0} is not declared")]
    MissingEntry(String),

    /// Emitted bytecode failed verification
    #[error("Generated bytecode failed verification: {0}")]
    Verification(#[from] BytecodeError),
}

/// Result type for compilation
pub type CompileResult<T> = Result<T, CompileError>;
