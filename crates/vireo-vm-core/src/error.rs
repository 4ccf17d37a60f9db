//! VM error types

use thiserror::Error;
use vireo_vm_bytecode::BytecodeError;

use crate::value::Value;

/// VM execution errors.
///
/// `Throw` carries a catchable user exception that reached the top frame;
/// everything else is fatal to the VM instance (the embedder may create a
/// fresh one).
#[derive(Debug, Error)]
pub enum VmError {
    /// Uncaught user exception
    #[error("Uncaught exception: {0}")]
    Throw(Box<ThrownValue>),

    /// Operand stack exhausted
    #[error("Stack overflow")]
    StackOverflow,

    /// Call depth exhausted
    #[error("Maximum call depth exceeded")]
    CallDepthExceeded,

    /// Allocation failed after the full collection ladder
    #[error("Out of memory")]
    OutOfMemory,

    /// Reference count saturated
    #[error("Reference count overflow")]
    RefCountOverflow,

    /// Bytecode failed verification or decoding
    #[error("Bytecode error: {0}")]
    Bytecode(#[from] BytecodeError),

    /// Execution cancelled via the cancel signal
    #[error("Execution cancelled")]
    Cancelled,

    /// Internal invariant breach
    #[error("Internal error: {0}")]
    Internal(String),
}

impl VmError {
    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Wrap a thrown value
    pub fn thrown(value: ThrownValue) -> Self {
        Self::Throw(Box::new(value))
    }
}

/// A thrown value with its reconstructed context
#[derive(Debug)]
pub struct ThrownValue {
    /// The thrown value
    pub value: Value,
    /// Human-readable message
    pub message: String,
    /// Error code
    pub code: i64,
    /// Source line of the throw site, when known
    pub line: Option<u32>,
    /// Stack trace, innermost first
    pub stack: Vec<StackFrame>,
}

impl std::fmt::Display for ThrownValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(line) = self.line {
            write!(f, " (line {line})")?;
        }
        Ok(())
    }
}

/// One frame of a reconstructed stack trace
#[derive(Debug, Clone)]
pub struct StackFrame {
    /// Function name
    pub function: String,
    /// Source line at the call site
    pub line: u32,
}

/// Result type for VM operations
pub type VmResult<T> = Result<T, VmError>;
