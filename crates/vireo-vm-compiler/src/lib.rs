//! # Vireo VM Compiler
//!
//! Compiles the front-end's AST into bytecode. The lexer and parser live in
//! the front-end; this crate consumes normalized AST nodes (stable node ids,
//! interned identifiers) and produces linked [`vireo_vm_bytecode::Program`]s.
//!
//! Three optimization decisions are embedded in emission:
//!
//! - **Escape analysis** assigns each allocation site heap, stack, or
//!   scalar-replaced storage
//! - **Parameter passing** selects by-value / by-const-ref / by-mut-ref /
//!   by-COW / by-move per parameter from size and mutability
//! - **Call-site ids** tag every arithmetic, comparison, and property access
//!   so the VM can accumulate type feedback and specialize

#![warn(clippy::all)]
#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod ast;
pub mod compiler;
pub mod error;
pub mod escape;
pub mod passing;

pub use ast::{AstNode, AstProgram, FunctionDecl, NodeId, NodeKind, ParamDecl, SourceLoc, TypeHint};
pub use compiler::{CompileOptions, Compiler};
pub use error::{CompileError, CompileResult};
pub use escape::{AllocDecision, EscapeAnalysis, EscapeState};
