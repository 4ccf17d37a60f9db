//! Compiled function representation

use serde::{Deserialize, Serialize};

use crate::constant::ConstantPool;
use crate::instruction::Instruction;
use crate::symbols::SymbolId;

/// Parameter passing convention, decided at compile time per parameter
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum PassingConvention {
    /// Retain a copy (primitives and small read-only values)
    #[default]
    ByValue = 0,
    /// Share the aggregate without a write path (read-only, 64-256+ bytes)
    ByConstRef = 1,
    /// Copy-in/copy-out through the caller's slot
    ByMutRef = 2,
    /// Share the buffer; first write clones (strings and arrays)
    ByCow = 3,
    /// Transfer ownership, invalidating the source (last use)
    ByMove = 4,
}

/// A declared parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamSpec {
    /// Parameter name
    pub name: SymbolId,
    /// Constant-pool index of the default value, if any
    pub default: Option<u16>,
    /// Passing convention chosen by the compiler
    pub convention: PassingConvention,
}

/// A try/catch range in the exception table.
///
/// Ranges are half-open over instruction indices; `handler` is the first
/// instruction of the catch block. Entries are ordered innermost-first so
/// the unwinder takes the first match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExceptionEntry {
    /// First covered instruction index
    pub start: u32,
    /// One past the last covered instruction index
    pub end: u32,
    /// Handler instruction index
    pub handler: u32,
    /// Class filter; `None` catches everything
    pub class_name: Option<SymbolId>,
}

/// One line-map entry: instructions at `offset..` were emitted for `line`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineEntry {
    /// Instruction index where the line begins
    pub offset: u32,
    /// 1-indexed source line
    pub line: u32,
}

/// A compiled function: immutable bytecode plus metadata.
///
/// Produced once by the compiler and never mutated afterwards; it outlives
/// every VM execution that references it. Runtime state (feedback vectors,
/// inline caches, quickened code) lives in the VM, not here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompiledFunction {
    /// Function name
    pub name: SymbolId,
    /// Bytecode instructions
    pub code: Vec<Instruction>,
    /// Constant pool
    pub constants: ConstantPool,
    /// Number of local slots (parameters first)
    pub local_count: u16,
    /// Maximum operand-stack depth, computed during emission
    pub max_stack: u16,
    /// Declared parameters
    pub params: Vec<ParamSpec>,
    /// Extra arguments are collected into an array instead of discarded
    pub is_variadic: bool,
    /// Number of feedback sites (arithmetic/comparison/property accesses)
    pub feedback_count: u16,
    /// Bytes of the frame's stack-allocation budget used by NewStruct sites
    pub stack_struct_bytes: u16,
    /// Try/catch ranges, innermost-first
    pub exception_table: Vec<ExceptionEntry>,
    /// Source line mapping, ascending by offset
    pub line_map: Vec<LineEntry>,
}

impl CompiledFunction {
    /// Create a new function builder
    pub fn builder(name: SymbolId) -> FunctionBuilder {
        FunctionBuilder::new(name)
    }

    /// Number of declared parameters
    #[inline]
    pub fn param_count(&self) -> u16 {
        self.params.len() as u16
    }

    /// Find the source line for an instruction index
    pub fn line_for_offset(&self, offset: u32) -> Option<u32> {
        let idx = self.line_map.binary_search_by_key(&offset, |e| e.offset);
        match idx {
            Ok(i) => Some(self.line_map[i].line),
            Err(i) if i > 0 => Some(self.line_map[i - 1].line),
            _ => None,
        }
    }

    /// Find the innermost exception handler covering `pc`, optionally
    /// filtered by thrown class name.
    pub fn find_handler(&self, pc: u32, thrown_class: Option<SymbolId>) -> Option<&ExceptionEntry> {
        self.exception_table.iter().find(|entry| {
            pc >= entry.start
                && pc < entry.end
                && match entry.class_name {
                    None => true,
                    Some(filter) => thrown_class == Some(filter),
                }
        })
    }
}

/// Builder for compiled functions
#[derive(Debug)]
pub struct FunctionBuilder {
    name: SymbolId,
    code: Vec<Instruction>,
    constants: ConstantPool,
    local_count: u16,
    max_stack: u16,
    params: Vec<ParamSpec>,
    is_variadic: bool,
    feedback_count: u16,
    stack_struct_bytes: u16,
    exception_table: Vec<ExceptionEntry>,
    line_map: Vec<LineEntry>,
}

impl FunctionBuilder {
    /// Create a new builder
    pub fn new(name: SymbolId) -> Self {
        Self {
            name,
            code: Vec::new(),
            constants: ConstantPool::new(),
            local_count: 0,
            max_stack: 0,
            params: Vec::new(),
            is_variadic: false,
            feedback_count: 0,
            stack_struct_bytes: 0,
            exception_table: Vec::new(),
            line_map: Vec::new(),
        }
    }

    /// Set local slot count
    pub fn local_count(mut self, count: u16) -> Self {
        self.local_count = count;
        self
    }

    /// Set maximum operand-stack depth
    pub fn max_stack(mut self, depth: u16) -> Self {
        self.max_stack = depth;
        self
    }

    /// Add a parameter
    pub fn param(mut self, spec: ParamSpec) -> Self {
        self.params.push(spec);
        self
    }

    /// Mark as variadic
    pub fn is_variadic(mut self, value: bool) -> Self {
        self.is_variadic = value;
        self
    }

    /// Set the number of feedback sites
    pub fn feedback_count(mut self, count: u16) -> Self {
        self.feedback_count = count;
        self
    }

    /// Set the stack-allocation bytes used by the frame
    pub fn stack_struct_bytes(mut self, bytes: u16) -> Self {
        self.stack_struct_bytes = bytes;
        self
    }

    /// Set the constant pool
    pub fn constants(mut self, constants: ConstantPool) -> Self {
        self.constants = constants;
        self
    }

    /// Get mutable access to the constant pool
    pub fn constants_mut(&mut self) -> &mut ConstantPool {
        &mut self.constants
    }

    /// Append a single instruction
    pub fn instruction(mut self, instruction: Instruction) -> Self {
        self.code.push(instruction);
        self
    }

    /// Set all instructions
    pub fn instructions(mut self, code: Vec<Instruction>) -> Self {
        self.code = code;
        self
    }

    /// Add an exception-table entry
    pub fn exception_entry(mut self, entry: ExceptionEntry) -> Self {
        self.exception_table.push(entry);
        self
    }

    /// Add a line-map entry
    pub fn line(mut self, offset: u32, line: u32) -> Self {
        self.line_map.push(LineEntry { offset, line });
        self
    }

    /// Build the function
    pub fn build(self) -> CompiledFunction {
        CompiledFunction {
            name: self.name,
            code: self.code,
            constants: self.constants,
            local_count: self.local_count,
            max_stack: self.max_stack,
            params: self.params,
            is_variadic: self.is_variadic,
            feedback_count: self.feedback_count,
            stack_struct_bytes: self.stack_struct_bytes,
            exception_table: self.exception_table,
            line_map: self.line_map,
        }
    }
}
