//! Program: the link unit of compiled functions
//!
//! A program bundles the compiled functions of one compilation session with
//! the symbol table that inter-function calls resolve through. Programs can
//! be persisted to a compact binary format and reloaded without recompiling.
//!
//! ## File layout (all integers little-endian)
//!
//! - magic (4 bytes), version (u16), endianness flag (u8), entry point (u32)
//! - symbol section: count + length-prefixed UTF-8 names
//! - function count, then per function: name, parameters (with default
//!   indices and passing conventions), arity flags, local_count, max_stack,
//!   constant pool (tagged entries), bytecode length + bytes, exception
//!   table, line map
//!
//! Symbols are stored as file-local indices and re-interned on load, so a
//! program file is portable across interner instances. There are no forward
//! references between functions; calls are resolved to indices at link time.

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::constant::{Constant, ConstantPool};
use crate::error::{BytecodeError, Result};
use crate::function::{
    CompiledFunction, ExceptionEntry, LineEntry, ParamSpec, PassingConvention,
};
use crate::instruction::{INSTRUCTION_SIZE, Instruction};
use crate::symbols::{Interner, SymbolId};
use crate::{BYTECODE_LITTLE_ENDIAN, BYTECODE_MAGIC, BYTECODE_VERSION};

/// A linked program
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Program {
    /// Compiled functions; call operands index this table
    pub functions: Vec<CompiledFunction>,
    /// Entry point function index
    pub entry: u32,
    /// Function name -> index, built at link time
    #[serde(skip)]
    symbol_table: FxHashMap<SymbolId, u32>,
}

impl Program {
    /// Link a set of compiled functions into a program.
    ///
    /// Duplicate function names are a link error.
    pub fn link(functions: Vec<CompiledFunction>, entry: u32) -> Result<Self> {
        if entry as usize >= functions.len() {
            return Err(BytecodeError::UnknownFunction(entry));
        }
        let mut symbol_table = FxHashMap::default();
        for (idx, func) in functions.iter().enumerate() {
            if symbol_table.insert(func.name, idx as u32).is_some() {
                return Err(BytecodeError::DuplicateFunction(func.name.index()));
            }
        }
        Ok(Self {
            functions,
            entry,
            symbol_table,
        })
    }

    /// Get a function by index
    #[inline]
    pub fn function(&self, index: u32) -> Option<&CompiledFunction> {
        self.functions.get(index as usize)
    }

    /// Get the entry point function
    pub fn entry_function(&self) -> Option<&CompiledFunction> {
        self.function(self.entry)
    }

    /// Resolve a function name to its index
    pub fn function_index(&self, name: SymbolId) -> Option<u32> {
        self.symbol_table.get(&name).copied()
    }

    /// Serialize to the bytecode file format
    pub fn to_bytes(&self, interner: &Interner) -> Result<Vec<u8>> {
        let mut w = Writer::new(interner);

        // Collect every symbol referenced by the program so the file is
        // self-contained.
        for func in &self.functions {
            w.symbol(func.name)?;
            for param in &func.params {
                w.symbol(param.name)?;
            }
            for constant in func.constants.iter() {
                if let Constant::Str(sym) = constant {
                    w.symbol(*sym)?;
                }
            }
            for entry in &func.exception_table {
                if let Some(sym) = entry.class_name {
                    w.symbol(sym)?;
                }
            }
        }

        let mut out = Vec::new();
        out.extend_from_slice(&BYTECODE_MAGIC);
        out.extend_from_slice(&BYTECODE_VERSION.to_le_bytes());
        out.push(BYTECODE_LITTLE_ENDIAN);
        out.extend_from_slice(&self.entry.to_le_bytes());

        // Symbol section
        out.extend_from_slice(&(w.names.len() as u32).to_le_bytes());
        for name in &w.names {
            out.extend_from_slice(&(name.len() as u32).to_le_bytes());
            out.extend_from_slice(name.as_bytes());
        }

        // Function section
        out.extend_from_slice(&(self.functions.len() as u32).to_le_bytes());
        for func in &self.functions {
            w.write_function(func, &mut out)?;
        }

        Ok(out)
    }

    /// Deserialize from the bytecode file format
    pub fn from_bytes(bytes: &[u8], interner: &Interner) -> Result<Self> {
        let mut r = Reader::new(bytes);

        let magic = r.take(4)?;
        if magic != BYTECODE_MAGIC {
            return Err(BytecodeError::InvalidMagic);
        }
        let version = r.u16()?;
        if version != BYTECODE_VERSION {
            return Err(BytecodeError::UnsupportedVersion(version));
        }
        let endian = r.u8()?;
        if endian != BYTECODE_LITTLE_ENDIAN {
            return Err(BytecodeError::InvalidEndianness(endian));
        }
        let entry = r.u32()?;

        // Symbol section: re-intern into the live table
        let symbol_count = r.u32()? as usize;
        let mut symbols = Vec::with_capacity(symbol_count);
        for _ in 0..symbol_count {
            let len = r.u32()? as usize;
            let raw = r.take(len)?;
            let name =
                std::str::from_utf8(raw).map_err(|_| BytecodeError::InvalidSymbolName)?;
            symbols.push(interner.intern(name));
        }

        let function_count = r.u32()? as usize;
        let mut functions = Vec::with_capacity(function_count);
        for _ in 0..function_count {
            functions.push(r.read_function(&symbols)?);
        }

        Self::link(functions, entry)
    }
}

/// Serialization state: maps live symbol ids to file-local indices
struct Writer<'a> {
    interner: &'a Interner,
    names: Vec<String>,
    file_index: FxHashMap<SymbolId, u32>,
}

impl<'a> Writer<'a> {
    fn new(interner: &'a Interner) -> Self {
        Self {
            interner,
            names: Vec::new(),
            file_index: FxHashMap::default(),
        }
    }

    /// Assign (or reuse) the file-local index of a symbol
    fn symbol(&mut self, sym: SymbolId) -> Result<u32> {
        if let Some(&idx) = self.file_index.get(&sym) {
            return Ok(idx);
        }
        let name = self
            .interner
            .resolve(sym)
            .ok_or(BytecodeError::UnknownSymbol(sym.index()))?;
        let idx = self.names.len() as u32;
        self.names.push(name.to_string());
        self.file_index.insert(sym, idx);
        Ok(idx)
    }

    fn write_function(&mut self, func: &CompiledFunction, out: &mut Vec<u8>) -> Result<()> {
        let name = self.symbol(func.name)?;
        out.extend_from_slice(&name.to_le_bytes());

        out.extend_from_slice(&(func.params.len() as u16).to_le_bytes());
        for param in &func.params {
            let pname = self.symbol(param.name)?;
            out.extend_from_slice(&pname.to_le_bytes());
            match param.default {
                Some(idx) => {
                    out.push(1);
                    out.extend_from_slice(&idx.to_le_bytes());
                }
                None => {
                    out.push(0);
                    out.extend_from_slice(&0u16.to_le_bytes());
                }
            }
            out.push(param.convention as u8);
        }
        out.push(func.is_variadic as u8);
        out.extend_from_slice(&func.local_count.to_le_bytes());
        out.extend_from_slice(&func.max_stack.to_le_bytes());
        out.extend_from_slice(&func.feedback_count.to_le_bytes());
        out.extend_from_slice(&func.stack_struct_bytes.to_le_bytes());

        // Constant pool
        out.extend_from_slice(&(func.constants.len() as u32).to_le_bytes());
        for constant in func.constants.iter() {
            match constant {
                Constant::Null => out.push(0),
                Constant::Bool(b) => {
                    out.push(1);
                    out.push(*b as u8);
                }
                Constant::Int(n) => {
                    out.push(2);
                    out.extend_from_slice(&n.to_le_bytes());
                }
                Constant::Float(f) => {
                    out.push(3);
                    out.extend_from_slice(&f.to_bits().to_le_bytes());
                }
                Constant::Str(sym) => {
                    let idx = self.symbol(*sym)?;
                    out.push(4);
                    out.extend_from_slice(&idx.to_le_bytes());
                }
            }
        }

        // Bytecode
        let byte_len = func.code.len() * INSTRUCTION_SIZE;
        out.extend_from_slice(&(byte_len as u32).to_le_bytes());
        for instr in &func.code {
            instr.encode(out);
        }

        // Exception table
        out.extend_from_slice(&(func.exception_table.len() as u32).to_le_bytes());
        for entry in &func.exception_table {
            out.extend_from_slice(&entry.start.to_le_bytes());
            out.extend_from_slice(&entry.end.to_le_bytes());
            out.extend_from_slice(&entry.handler.to_le_bytes());
            match entry.class_name {
                Some(sym) => {
                    let idx = self.symbol(sym)?;
                    out.push(1);
                    out.extend_from_slice(&idx.to_le_bytes());
                }
                None => {
                    out.push(0);
                    out.extend_from_slice(&0u32.to_le_bytes());
                }
            }
        }

        // Line map
        out.extend_from_slice(&(func.line_map.len() as u32).to_le_bytes());
        for entry in &func.line_map {
            out.extend_from_slice(&entry.offset.to_le_bytes());
            out.extend_from_slice(&entry.line.to_le_bytes());
        }

        Ok(())
    }
}

/// Bounds-checked little-endian reader
struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.pos + len > self.bytes.len() {
            return Err(BytecodeError::UnexpectedEnd);
        }
        let slice = &self.bytes[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64> {
        let b = self.take(8)?;
        Ok(u64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    fn file_symbol(&mut self, symbols: &[SymbolId]) -> Result<SymbolId> {
        let idx = self.u32()?;
        symbols
            .get(idx as usize)
            .copied()
            .ok_or(BytecodeError::UnknownSymbol(idx))
    }

    fn read_function(&mut self, symbols: &[SymbolId]) -> Result<CompiledFunction> {
        let name = self.file_symbol(symbols)?;

        let param_count = self.u16()? as usize;
        let mut params = Vec::with_capacity(param_count);
        for _ in 0..param_count {
            let pname = self.file_symbol(symbols)?;
            let has_default = self.u8()? != 0;
            let default_idx = self.u16()?;
            let convention = match self.u8()? {
                0 => PassingConvention::ByValue,
                1 => PassingConvention::ByConstRef,
                2 => PassingConvention::ByMutRef,
                3 => PassingConvention::ByCow,
                4 => PassingConvention::ByMove,
                other => return Err(BytecodeError::InvalidConvention(other)),
            };
            params.push(ParamSpec {
                name: pname,
                default: has_default.then_some(default_idx),
                convention,
            });
        }

        let is_variadic = self.u8()? != 0;
        let local_count = self.u16()?;
        let max_stack = self.u16()?;
        let feedback_count = self.u16()?;
        let stack_struct_bytes = self.u16()?;

        let constant_count = self.u32()? as usize;
        let mut constants = ConstantPool::new();
        for _ in 0..constant_count {
            let constant = match self.u8()? {
                0 => Constant::Null,
                1 => Constant::Bool(self.u8()? != 0),
                2 => Constant::Int(self.u64()? as i64),
                3 => Constant::Float(f64::from_bits(self.u64()?)),
                4 => Constant::Str(self.file_symbol(symbols)?),
                tag => return Err(BytecodeError::InvalidConstantTag(tag)),
            };
            constants.add(constant);
        }

        let byte_len = self.u32()? as usize;
        if byte_len % INSTRUCTION_SIZE != 0 {
            return Err(BytecodeError::UnexpectedEnd);
        }
        let raw = self.take(byte_len)?;
        let mut code = Vec::with_capacity(byte_len / INSTRUCTION_SIZE);
        for chunk in raw.chunks_exact(INSTRUCTION_SIZE) {
            code.push(Instruction::decode(chunk)?);
        }

        let exception_count = self.u32()? as usize;
        let mut exception_table = Vec::with_capacity(exception_count);
        for _ in 0..exception_count {
            let start = self.u32()?;
            let end = self.u32()?;
            let handler = self.u32()?;
            let has_class = self.u8()? != 0;
            let class_idx = self.u32()?;
            let class_name = if has_class {
                Some(
                    symbols
                        .get(class_idx as usize)
                        .copied()
                        .ok_or(BytecodeError::UnknownSymbol(class_idx))?,
                )
            } else {
                None
            };
            exception_table.push(ExceptionEntry {
                start,
                end,
                handler,
                class_name,
            });
        }

        let line_count = self.u32()? as usize;
        let mut line_map = Vec::with_capacity(line_count);
        for _ in 0..line_count {
            let offset = self.u32()?;
            let line = self.u32()?;
            line_map.push(LineEntry { offset, line });
        }

        Ok(CompiledFunction {
            name,
            code,
            constants,
            local_count,
            max_stack,
            params,
            is_variadic,
            feedback_count,
            stack_struct_bytes,
            exception_table,
            line_map,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opcode::Opcode;

    fn sample_program(interner: &Interner) -> Program {
        let name = interner.intern("main");
        let helper = interner.intern("helper");
        let greeting = interner.intern("hello");

        let mut main = CompiledFunction::builder(name).local_count(1).max_stack(2);
        let hello_idx = main.constants_mut().add_str(greeting);
        let main = main
            .instruction(Instruction::with_a(Opcode::PushConst, hello_idx))
            .instruction(Instruction::new(Opcode::Call, 1, 1))
            .instruction(Instruction::plain(Opcode::Ret))
            .line(0, 1)
            .line(2, 2)
            .build();

        let helper = CompiledFunction::builder(helper)
            .local_count(1)
            .max_stack(1)
            .param(ParamSpec {
                name: greeting,
                default: None,
                convention: PassingConvention::ByCow,
            })
            .instruction(Instruction::with_a(Opcode::PushLocal, 0))
            .instruction(Instruction::plain(Opcode::Ret))
            .build();

        Program::link(vec![main, helper], 0).unwrap()
    }

    #[test]
    fn test_link_symbol_table() {
        let interner = Interner::new();
        let program = sample_program(&interner);

        let main_sym = interner.lookup("main").unwrap();
        let helper_sym = interner.lookup("helper").unwrap();
        assert_eq!(program.function_index(main_sym), Some(0));
        assert_eq!(program.function_index(helper_sym), Some(1));
        assert!(program.entry_function().is_some());
    }

    #[test]
    fn test_link_rejects_duplicates() {
        let interner = Interner::new();
        let name = interner.intern("dup");
        let f1 = CompiledFunction::builder(name).build();
        let f2 = CompiledFunction::builder(name).build();
        let result = Program::link(vec![f1, f2], 0);
        assert!(matches!(result, Err(BytecodeError::DuplicateFunction(_))));
    }

    #[test]
    fn test_file_roundtrip() {
        let interner = Interner::new();
        let program = sample_program(&interner);
        let bytes = program.to_bytes(&interner).unwrap();

        // Reload into a fresh interner to exercise re-interning
        let fresh = Interner::new();
        let restored = Program::from_bytes(&bytes, &fresh).unwrap();

        assert_eq!(restored.functions.len(), 2);
        assert_eq!(restored.entry, 0);
        assert_eq!(restored.functions[0].code, program.functions[0].code);
        assert_eq!(
            restored.functions[1].params[0].convention,
            PassingConvention::ByCow
        );
        assert_eq!(fresh.resolve(restored.functions[0].name).as_deref(), Some("main"));
        assert_eq!(restored.functions[0].line_for_offset(1), Some(1));
    }

    #[test]
    fn test_invalid_magic() {
        let interner = Interner::new();
        let result = Program::from_bytes(b"NOPE\x01\x00\x01", &interner);
        assert!(matches!(result, Err(BytecodeError::InvalidMagic)));
    }

    #[test]
    fn test_unsupported_version() {
        let interner = Interner::new();
        let program = sample_program(&interner);
        let mut bytes = program.to_bytes(&interner).unwrap();
        bytes[4] = 0xFF;
        let result = Program::from_bytes(&bytes, &interner);
        assert!(matches!(result, Err(BytecodeError::UnsupportedVersion(_))));
    }
}
