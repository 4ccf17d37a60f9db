//! # Vireo VM Core
//!
//! The runtime core: dynamic values with explicit reference counting, the
//! memory manager over the generational GC, copy-on-write strings and
//! arrays, shapes with polymorphic inline caches, type-feedback-driven
//! specialization with deoptimization, the request arena, and the bytecode
//! interpreter itself.
//!
//! Front-end concerns (lexing, parsing, CLI) and standard-library bodies
//! live elsewhere; this crate exposes the embedding surface: load a
//! compiled program, register builtins and classes, run, and bracket
//! requests.

#![warn(clippy::all)]
#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod arena;
pub mod builtins;
pub mod class;
pub mod concurrent;
pub mod cow;
pub mod diagnostics;
pub mod error;
pub mod feedback;
pub mod heap;
pub mod interpreter;
pub mod memory;
pub mod object;
pub mod shape;
pub mod string;
pub mod value;

pub use arena::RequestArena;
pub use builtins::{BuiltinCtx, BuiltinFn, BuiltinRegistry};
pub use class::{ClassDef, ClassRegistry, MethodBody};
pub use concurrent::{SharedCounter, SharedMap, SharedMutex, SharedRwLock, SharedValue};
pub use cow::CowBuf;
pub use diagnostics::{Diagnostic, DiagnosticKind, DiagnosticSink, DisplayMode, Severity};
pub use error::{StackFrame, ThrownValue, VmError, VmResult};
pub use feedback::{Classification, Pic, TypeFeedback};
pub use heap::HeapData;
pub use interpreter::{Vm, VmConfig};
pub use memory::MemoryManager;
pub use object::{VmArray, VmClosure, VmObject, VmResource, VmStruct};
pub use shape::{ShapeId, ShapeRegistry};
pub use string::{SSO_MAX, VmString};
pub use value::{Value, ValueTag};
