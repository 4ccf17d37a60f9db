//! Bytecode interpreter
//!
//! Single-threaded cooperative execution. The inner loop indexes a
//! computed-dispatch table by opcode byte; each handler returns a
//! [`Dispatch`] action. Locals and operands share one contiguous value
//! stack: a frame's locals start at `base`, its operands at `operand_base`,
//! and every push is bounds-checked against the configured stack size.
//!
//! Safepoints sit at calls, returns, and the CheckGc back-edge opcode: the
//! cancel flag is checked and the GC gets a bounded slice of work.
//!
//! The VM executes a private copy of each function's code. The specializer
//! rewrites monomorphic arithmetic sites in that copy (the Nop slot the
//! compiler reserves becomes a GUARD, the generic op its typed variant);
//! guard failure reverts the site and clears its feedback. The
//! `CompiledFunction` itself is never touched.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;

use indexmap::IndexMap;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use vireo_vm_bytecode::{
    Constant, Instruction, Interner, Opcode, Program, SymbolId, verify_function,
};
use vireo_vm_gc::{GcConfig, Handle};

use crate::builtins::{BuiltinCtx, BuiltinFn, BuiltinRegistry};
use crate::class::{ClassDef, MethodBody};
use crate::diagnostics::{DiagnosticKind, DiagnosticSink, DisplayMode, Severity};
use crate::error::{StackFrame, ThrownValue, VmError, VmResult};
use crate::feedback::{Pic, TypeFeedback};
use crate::heap::HeapData;
use crate::memory::MemoryManager;
use crate::string::VmString;
use crate::value::{Value, ValueTag, div_zero_sentinel, int_add, int_mul, int_sub};

/// VM construction parameters
#[derive(Debug, Clone)]
pub struct VmConfig {
    /// Value-stack capacity (locals + operands across all frames)
    pub stack_size: usize,
    /// Maximum call depth
    pub max_frames: usize,
    /// Variable-name rendering in diagnostics
    pub display_mode: DisplayMode,
    /// GC configuration
    pub gc: GcConfig,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            stack_size: 64 * 1024,
            max_frames: 1024,
            display_mode: DisplayMode::default(),
            gc: GcConfig::default(),
        }
    }
}

/// Handler outcome
enum Dispatch {
    /// Advance to the next instruction
    Continue,
    /// Relative jump from the next instruction
    Jump(i16),
    /// Frames or pc changed; resume at the current frame's pc
    FrameChanged,
    /// Top frame returned
    Halt(Value),
}

/// A call frame
struct Frame {
    /// Function index in the program
    function: u32,
    /// Next instruction
    pc: usize,
    /// First local slot in the value stack
    base: usize,
    /// First operand slot (base + local_count)
    operand_base: usize,
    /// By-reference parameters: (param slot, caller slot)
    writebacks: SmallVec<[(u16, u16); 2]>,
}

/// Runtime state per function: the executable code copy plus feedback
struct FunctionState {
    code: Vec<Instruction>,
    feedback: Vec<TypeFeedback>,
    pics: FxHashMap<u16, Pic>,
    call_feedback: FxHashMap<usize, TypeFeedback>,
}

/// Either-width number produced by coercion
enum Numeric {
    Int(i64),
    Float(f64),
}

/// The virtual machine
pub struct Vm {
    /// Memory manager (heap, interner, shapes, classes, arena)
    pub memory: MemoryManager,
    stack: Vec<Value>,
    frames: Vec<Frame>,
    /// Globals in declaration order
    globals: IndexMap<SymbolId, Value>,
    builtins: BuiltinRegistry,
    /// Recoverable-diagnostic sink
    pub diagnostics: DiagnosticSink,
    cancel: Arc<AtomicBool>,
    program: Option<Arc<Program>>,
    states: Vec<FunctionState>,
    config: VmConfig,
    /// By-ref markers recorded between PASS ops and the CALL
    pending_refs: SmallVec<[(usize, u16); 4]>,
}

type Handler = fn(&mut Vm, Instruction) -> VmResult<Dispatch>;

impl Vm {
    /// Create a VM with a fresh interner
    pub fn new(config: VmConfig) -> Self {
        Self::with_interner(Arc::new(Interner::new()), config)
    }

    /// Create a VM sharing an interner with sibling VMs
    pub fn with_interner(interner: Arc<Interner>, config: VmConfig) -> Self {
        Self {
            memory: MemoryManager::new(interner, config.gc.clone()),
            stack: Vec::with_capacity(1024),
            frames: Vec::with_capacity(16),
            globals: IndexMap::new(),
            builtins: BuiltinRegistry::new(),
            diagnostics: DiagnosticSink::new(config.display_mode),
            cancel: Arc::new(AtomicBool::new(false)),
            program: None,
            states: Vec::new(),
            config,
            pending_refs: SmallVec::new(),
        }
    }

    /// The cancel signal: store `true` to request cancellation; the VM
    /// observes it at the next safepoint.
    pub fn cancel_signal(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    /// Register a builtin function
    pub fn register_builtin(
        &mut self,
        name: &str,
        arity_min: u8,
        arity_max: u8,
        func: BuiltinFn,
    ) -> u16 {
        let sym = self.memory.intern(name);
        self.builtins.register(sym, arity_min, arity_max, func)
    }

    /// Register a class, returning its id
    pub fn register_class(
        &mut self,
        name: &str,
        properties: &[&str],
        methods: Vec<(&str, MethodBody)>,
        constructor: Option<MethodBody>,
        destructor: Option<MethodBody>,
    ) -> u16 {
        let name_sym = self.memory.intern(name);
        let props: Vec<SymbolId> = properties.iter().map(|p| self.memory.intern(p)).collect();
        let shape = self.memory.shapes.shape_for(&props);
        let mut method_map = FxHashMap::default();
        for (mname, body) in methods {
            let msym = self.memory.intern(mname);
            method_map.insert(msym, body);
        }
        self.memory.classes.register(ClassDef {
            name: name_sym,
            properties: props,
            shape,
            methods: method_map,
            constructor,
            destructor,
        })
    }

    /// Builtin name table for compiler options
    pub fn builtin_table(&self) -> FxHashMap<SymbolId, u16> {
        self.builtins.name_table()
    }

    /// Class name table for compiler options
    pub fn class_table(&self) -> FxHashMap<SymbolId, u16> {
        let mut table = FxHashMap::default();
        for id in 0..self.memory.classes.len() as u16 {
            if let Some(def) = self.memory.classes.get(id) {
                table.insert(def.name, id);
            }
        }
        table
    }

    /// Load a program: verify every function and build runtime state.
    pub fn load(&mut self, program: Arc<Program>) -> VmResult<()> {
        self.states.clear();
        for func in &program.functions {
            verify_function(func)?;
            self.states.push(FunctionState {
                code: func.code.clone(),
                feedback: vec![TypeFeedback::new(); func.feedback_count as usize],
                pics: FxHashMap::default(),
                call_feedback: FxHashMap::default(),
            });
        }
        self.program = Some(program);
        Ok(())
    }

    /// Run the program's entry function with arguments.
    ///
    /// `Ok` carries the return value; an uncaught exception surfaces as
    /// [`VmError::Throw`]; other errors are fatal to this instance.
    pub fn run(&mut self, argv: &[Value]) -> VmResult<Value> {
        let entry = self
            .program
            .as_ref()
            .ok_or_else(|| VmError::internal("no program loaded"))?
            .entry;
        self.run_function(entry, argv)
    }

    /// Run a specific function with arguments
    pub fn run_function(&mut self, index: u32, argv: &[Value]) -> VmResult<Value> {
        self.stack.clear();
        self.frames.clear();
        self.pending_refs.clear();

        for &arg in argv {
            self.memory.retain_value(arg)?;
            self.push(arg)?;
        }
        self.call_function(index, argv.len())?;

        let result = self.run_loop();
        if result.is_err() {
            // Release whatever the aborted execution still owns.
            while let Some(v) = self.stack.pop() {
                self.release_value(v);
            }
            self.frames.clear();
        }
        result
    }

    /// Set a global (for embedding and tests); the global owns one count.
    pub fn set_global(&mut self, name: &str, value: Value) -> VmResult<()> {
        let sym = self.memory.intern(name);
        self.memory.retain_value(value)?;
        if let Some(old) = self.globals.insert(sym, value) {
            self.release_value(old);
        }
        // Globals are GC roots.
        if let Some(h) = value.handle() {
            self.memory.heap_mut().add_root(h);
        }
        Ok(())
    }

    /// Read a global
    pub fn get_global(&self, name: &str) -> Option<Value> {
        let sym = self.memory.interner().lookup(name)?;
        self.globals.get(&sym).copied()
    }

    /// Opcode currently installed at a code position (specialization state)
    pub fn code_at(&self, function: u32, pc: usize) -> Option<Opcode> {
        self.states
            .get(function as usize)
            .and_then(|s| s.code.get(pc))
            .map(|i| i.op)
    }

    /// Feedback classification of a site (for tests and introspection)
    pub fn site_classification(
        &self,
        function: u32,
        site: u16,
    ) -> Option<crate::feedback::Classification> {
        self.states
            .get(function as usize)?
            .feedback
            .get(site as usize)
            .map(|f| f.classify())
    }

    // ==================== Stack primitives ====================

    #[inline]
    fn push(&mut self, value: Value) -> VmResult<()> {
        if self.stack.len() >= self.config.stack_size {
            return Err(VmError::StackOverflow);
        }
        self.stack.push(value);
        Ok(())
    }

    #[inline]
    fn pop(&mut self) -> VmResult<Value> {
        self.stack
            .pop()
            .ok_or_else(|| VmError::internal("operand stack underflow"))
    }

    #[inline]
    fn peek(&self, depth: usize) -> VmResult<Value> {
        let len = self.stack.len();
        self.stack
            .get(len.checked_sub(1 + depth).ok_or_else(|| {
                VmError::internal("operand stack underflow")
            })?)
            .copied()
            .ok_or_else(|| VmError::internal("operand stack underflow"))
    }

    fn release_value(&mut self, value: Value) {
        // Destructor hook: last reference to an object with a registered
        // destructor runs it before the release.
        if let Value::Object(h) = value {
            let run_dtor = {
                let header = self.memory.heap().header(h);
                let class = match self.memory.heap().get(h) {
                    Some(HeapData::Object(o)) => Some(o.class),
                    _ => None,
                };
                match (header, class) {
                    (Some(hd), Some(class)) if hd.refcount == 1 => {
                        self.memory.classes.destructor(class)
                    }
                    _ => None,
                }
            };
            if let Some(MethodBody::Builtin(id)) = run_dtor {
                let _ = self.invoke_builtin_raw(id, &[value]);
            }
        }
        self.memory.release_value(value);
    }

    fn frame_ctx(&self) -> VmResult<(usize, usize)> {
        let frame = self
            .frames
            .last()
            .ok_or_else(|| VmError::internal("no frame"))?;
        Ok((frame.function as usize, frame.pc))
    }

    fn current_local_slot(&self, index: u16) -> VmResult<usize> {
        let frame = self
            .frames
            .last()
            .ok_or_else(|| VmError::internal("no frame"))?;
        Ok(frame.base + index as usize)
    }

    fn constant(&self, index: u16) -> VmResult<Constant> {
        let (fi, _) = self.frame_ctx()?;
        let program = self
            .program
            .as_ref()
            .ok_or_else(|| VmError::internal("no program"))?;
        program
            .function(fi as u32)
            .and_then(|f| f.constants.get(index))
            .ok_or_else(|| VmError::internal("bad constant index"))
    }

    fn constant_symbol(&self, index: u16) -> VmResult<SymbolId> {
        match self.constant(index)? {
            Constant::Str(sym) => Ok(sym),
            _ => Err(VmError::internal("constant is not a name")),
        }
    }

    fn collect_roots(&self) -> Vec<Handle> {
        let mut roots: Vec<Handle> = self.stack.iter().filter_map(|v| v.handle()).collect();
        roots.extend(self.globals.values().filter_map(|v| v.handle()));
        roots
    }

    fn alloc(&mut self, data: HeapData) -> VmResult<Handle> {
        let roots = self.collect_roots();
        self.memory.alloc(data, &roots)
    }

    fn safepoint(&mut self) -> VmResult<()> {
        if self.cancel.load(Ordering::Relaxed) {
            return Err(VmError::Cancelled);
        }
        let roots = self.collect_roots();
        self.memory.safepoint(&roots);
        Ok(())
    }

    // ==================== Run loop ====================

    fn run_loop(&mut self) -> VmResult<Value> {
        let table = dispatch_table();
        loop {
            let (fi, pc) = match self.frames.last() {
                Some(frame) => (frame.function as usize, frame.pc),
                None => return Err(VmError::internal("no frame in run loop")),
            };

            if pc >= self.states[fi].code.len() {
                // Implicit null return at the end of the body.
                match self.do_return(Value::Null)? {
                    Some(result) => return Ok(result),
                    None => continue,
                }
            }

            let instr = self.states[fi].code[pc];
            let handler = table[instr.op.to_byte() as usize];
            match handler(self, instr)? {
                Dispatch::Continue => {
                    if let Some(frame) = self.frames.last_mut() {
                        frame.pc += 1;
                    }
                }
                Dispatch::Jump(offset) => {
                    if let Some(frame) = self.frames.last_mut() {
                        frame.pc = (frame.pc as i64 + 1 + offset as i64) as usize;
                    }
                }
                Dispatch::FrameChanged => {}
                Dispatch::Halt(value) => return Ok(value),
            }
        }
    }

    // ==================== Calls ====================

    /// Push a frame for a function call. The top `argc` stack values are the
    /// arguments, becoming the first locals (closure captures, pushed after
    /// the arguments by the caller, land after the declared parameters).
    fn call_function(&mut self, func_index: u32, argc: usize) -> VmResult<()> {
        self.safepoint()?;
        if self.frames.len() >= self.config.max_frames {
            return Err(VmError::CallDepthExceeded);
        }

        let program = Arc::clone(
            self.program
                .as_ref()
                .ok_or_else(|| VmError::internal("no program"))?,
        );
        let func = program
            .function(func_index)
            .ok_or_else(|| VmError::internal(format!("missing function {func_index}")))?;

        let param_count = func.param_count() as usize;
        let args_start = self
            .stack
            .len()
            .checked_sub(argc)
            .ok_or_else(|| VmError::internal("missing call arguments"))?;

        // By-ref markers recorded while evaluating this call's arguments.
        let mut writebacks: SmallVec<[(u16, u16); 2]> = SmallVec::new();
        self.pending_refs.retain(|&mut (pos, caller_slot)| {
            if pos > args_start {
                let param_slot = (pos - 1 - args_start) as u16;
                writebacks.push((param_slot, caller_slot));
                false
            } else {
                true
            }
        });

        // Arity adjustment: collect or discard extras, fill defaults.
        let mut local_values = argc;
        if argc > param_count {
            if func.is_variadic {
                // The extras stay on the stack (rooted) while the rest
                // array allocates, then ownership transfers into it.
                let extras: Vec<Value> = self.stack[args_start + param_count..].to_vec();
                let roots = self.collect_roots();
                let rest = self.memory.alloc_array(extras, &roots)?;
                self.stack.truncate(args_start + param_count);
                self.push(rest)?;
                local_values = param_count + 1;
            } else {
                for _ in param_count..argc {
                    let extra = self.pop()?;
                    self.release_value(extra);
                }
                local_values = param_count;
            }
        } else if argc < param_count {
            for i in argc..param_count {
                let default = match func.params[i].default {
                    Some(idx) => match func.constants.get(idx) {
                        Some(Constant::Null) | None => Value::Null,
                        Some(Constant::Bool(b)) => Value::Bool(b),
                        Some(Constant::Int(n)) => Value::Int(n),
                        Some(Constant::Float(f)) => Value::Float(f),
                        Some(Constant::Str(sym)) => Value::InternedStr(sym),
                    },
                    None => Value::Null,
                };
                self.push(default)?;
            }
            local_values = param_count;
        }

        // Remaining local slots start null.
        let local_count = (func.local_count as usize).max(local_values);
        for _ in local_values..local_count {
            self.push(Value::Null)?;
        }

        // Resume the caller after the call instruction.
        if let Some(frame) = self.frames.last_mut() {
            frame.pc += 1;
        }

        self.frames.push(Frame {
            function: func_index,
            pc: 0,
            base: args_start,
            operand_base: args_start + local_count,
            writebacks,
        });
        Ok(())
    }

    /// Pop the current frame. Returns `Some(result)` when the top frame
    /// returned to the embedder.
    fn do_return(&mut self, result: Value) -> VmResult<Option<Value>> {
        let frame = self
            .frames
            .pop()
            .ok_or_else(|| VmError::internal("return without frame"))?;

        // Copy-out for by-reference parameters.
        let caller_base = self.frames.last().map(|caller| caller.base);
        if let Some(caller_base) = caller_base {
            for &(param_slot, caller_slot) in &frame.writebacks {
                let value = self.stack[frame.base + param_slot as usize];
                self.memory.retain_value(value)?;
                let old = std::mem::replace(
                    &mut self.stack[caller_base + caller_slot as usize],
                    value,
                );
                self.release_value(old);
            }
        }

        // Release locals and leftover operands. Frame-lifetime records die
        // here with their last reference.
        while self.stack.len() > frame.base {
            let value = self.pop()?;
            self.release_value(value);
        }

        if self.frames.is_empty() {
            Ok(Some(result))
        } else {
            self.push(result)?;
            Ok(None)
        }
    }

    // ==================== Exceptions ====================

    fn throw_value(&mut self, value: Value) -> VmResult<Dispatch> {
        let thrown_class = match value {
            Value::Object(h) => match self.memory.heap().get(h) {
                Some(HeapData::Object(o)) => {
                    self.memory.classes.get(o.class).map(|def| def.name)
                }
                _ => None,
            },
            _ => None,
        };

        let program = Arc::clone(
            self.program
                .as_ref()
                .ok_or_else(|| VmError::internal("no program"))?,
        );

        for depth in (0..self.frames.len()).rev() {
            let (function, pc) = {
                let frame = &self.frames[depth];
                (frame.function, frame.pc)
            };
            let Some(func) = program.function(function) else {
                continue;
            };
            if let Some(entry) = func.find_handler(pc as u32, thrown_class) {
                let handler = entry.handler as usize;

                // Unwind frames above the handler's frame.
                while self.frames.len() > depth + 1 {
                    let dead = self
                        .frames
                        .pop()
                        .ok_or_else(|| VmError::internal("unwind underflow"))?;
                    while self.stack.len() > dead.base {
                        let v = self.pop()?;
                        self.release_value(v);
                    }
                }

                // Discard the handler frame's operands.
                let operand_base = self.frames[depth].operand_base;
                while self.stack.len() > operand_base {
                    let v = self.pop()?;
                    self.release_value(v);
                }

                self.frames[depth].pc = handler;
                self.push(value)?;
                return Ok(Dispatch::FrameChanged);
            }
        }

        // Uncaught: surface to the embedder with a reconstructed trace.
        let thrown = self.make_thrown(value, &program);
        while let Some(v) = self.stack.pop() {
            self.release_value(v);
        }
        self.frames.clear();
        Err(VmError::thrown(thrown))
    }

    fn make_thrown(&self, value: Value, program: &Program) -> ThrownValue {
        let message = self.display_string(value);
        let code = match value {
            Value::Object(h) => {
                let code_sym = self.memory.interner().lookup("code");
                match (self.memory.heap().get(h), code_sym) {
                    (Some(HeapData::Object(o)), Some(sym)) => self
                        .memory
                        .shapes
                        .offset_of(o.shape, sym)
                        .and_then(|slot| o.slot(slot))
                        .and_then(|v| match v {
                            Value::Int(n) => Some(n),
                            _ => None,
                        })
                        .unwrap_or(0),
                    _ => 0,
                }
            }
            _ => 0,
        };

        let mut stack = Vec::new();
        let mut line = None;
        for frame in self.frames.iter().rev() {
            if let Some(func) = program.function(frame.function) {
                let frame_line = func.line_for_offset(frame.pc as u32).unwrap_or(0);
                if line.is_none() {
                    line = Some(frame_line);
                }
                stack.push(StackFrame {
                    function: self
                        .memory
                        .interner()
                        .resolve(func.name)
                        .map(|s| s.to_string())
                        .unwrap_or_else(|| "<unknown>".to_string()),
                    line: frame_line,
                });
            }
        }

        ThrownValue {
            value,
            message,
            code,
            line,
            stack,
        }
    }

    // ==================== Coercions ====================

    fn to_bool(&self, value: Value) -> bool {
        if let Some(b) = value.primitive_truthy() {
            return b;
        }
        match value {
            Value::InternedStr(sym) => match self.memory.interner().resolve(sym) {
                Some(s) => !(s.is_empty() || &*s == "0"),
                None => false,
            },
            Value::Str(h) => match self.memory.heap().get(h) {
                Some(HeapData::Str(s)) => !(s.is_empty() || s.as_bytes() == b"0"),
                _ => false,
            },
            Value::Array(h) => match self.memory.heap().get(h) {
                Some(HeapData::Array(a)) => !a.is_empty(),
                _ => false,
            },
            _ => true,
        }
    }

    fn string_bytes(&self, value: Value) -> Option<Vec<u8>> {
        match value {
            Value::InternedStr(sym) => self
                .memory
                .interner()
                .resolve(sym)
                .map(|s| s.as_bytes().to_vec()),
            Value::Str(h) => match self.memory.heap().get(h) {
                Some(HeapData::Str(s)) => Some(s.as_bytes().to_vec()),
                _ => None,
            },
            _ => None,
        }
    }

    /// Coerce to a number, reporting lossy conversions.
    fn to_numeric(&mut self, value: Value) -> Numeric {
        match value {
            Value::Int(n) => Numeric::Int(n),
            Value::Float(f) => Numeric::Float(f),
            Value::Null => Numeric::Int(0),
            Value::Bool(b) => Numeric::Int(b as i64),
            _ => {
                if let Some(bytes) = self.string_bytes(value) {
                    if let Some(parsed) = parse_numeric(&bytes) {
                        return parsed;
                    }
                }
                self.diagnostics.report(
                    Severity::Warning,
                    DiagnosticKind::CoercionLoss,
                    format!("{} used as a number", value.type_name()),
                    None,
                );
                Numeric::Int(0)
            }
        }
    }

    /// Human-readable rendering (for concat, messages)
    fn display_string(&self, value: Value) -> String {
        match value {
            Value::Null => String::new(),
            Value::Bool(true) => "1".to_string(),
            Value::Bool(false) => String::new(),
            Value::Int(n) => itoa::Buffer::new().format(n).to_string(),
            Value::Float(f) => {
                if f.is_finite() {
                    ryu::Buffer::new().format(f).to_string()
                } else if f.is_nan() {
                    "NAN".to_string()
                } else if f > 0.0 {
                    "INF".to_string()
                } else {
                    "-INF".to_string()
                }
            }
            Value::InternedStr(sym) => self
                .memory
                .interner()
                .resolve(sym)
                .map(|s| s.to_string())
                .unwrap_or_default(),
            Value::Str(h) => match self.memory.heap().get(h) {
                Some(HeapData::Str(s)) => s.to_display(),
                _ => String::new(),
            },
            Value::Array(_) => "Array".to_string(),
            Value::Object(h) => match self.memory.heap().get(h) {
                Some(HeapData::Object(o)) => self
                    .memory
                    .classes
                    .get(o.class)
                    .and_then(|def| self.memory.interner().resolve(def.name))
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "object".to_string()),
                _ => "object".to_string(),
            },
            Value::Struct(_) => "struct".to_string(),
            Value::Closure(_) | Value::Builtin(_) | Value::Function(_) => "callable".to_string(),
            Value::Resource(_) => "resource".to_string(),
        }
    }

    /// Coercing equality (`==`)
    fn values_equal(&mut self, a: Value, b: Value) -> bool {
        use Value::*;
        match (a, b) {
            (Null, Null) => true,
            (Bool(_), _) | (_, Bool(_)) => self.to_bool(a) == self.to_bool(b),
            (Int(x), Int(y)) => x == y,
            (Int(x), Float(y)) | (Float(y), Int(x)) => x as f64 == y,
            (Float(x), Float(y)) => x == y,
            _ if a.is_string() && b.is_string() => self.string_bytes(a) == self.string_bytes(b),
            _ if a.is_string() || b.is_string() => {
                let x = self.numeric_as_float(a);
                let y = self.numeric_as_float(b);
                x == y
            }
            (Array(x), Array(y)) => {
                if x == y {
                    return true;
                }
                let (Some(HeapData::Array(ax)), Some(HeapData::Array(ay))) =
                    (self.memory.heap().get(x), self.memory.heap().get(y))
                else {
                    return false;
                };
                if ax.len() != ay.len() {
                    return false;
                }
                let pairs: Vec<(Value, Value)> = ax
                    .as_slice()
                    .iter()
                    .copied()
                    .zip(ay.as_slice().iter().copied())
                    .collect();
                pairs.into_iter().all(|(va, vb)| self.values_equal(va, vb))
            }
            (Null, _) | (_, Null) => false,
            _ => a.identical(b),
        }
    }

    fn numeric_as_float(&mut self, value: Value) -> f64 {
        match self.to_numeric(value) {
            Numeric::Int(n) => n as f64,
            Numeric::Float(f) => f,
        }
    }

    /// Coercing order comparison
    fn compare(&mut self, a: Value, b: Value) -> std::cmp::Ordering {
        if a.is_string() && b.is_string() {
            let x = self.string_bytes(a).unwrap_or_default();
            let y = self.string_bytes(b).unwrap_or_default();
            return x.cmp(&y);
        }
        let x = self.numeric_as_float(a);
        let y = self.numeric_as_float(b);
        x.partial_cmp(&y).unwrap_or(std::cmp::Ordering::Equal)
    }

    // ==================== Arithmetic ====================

    fn observe_arith(&mut self, site: u16, a: Value, b: Value) -> VmResult<()> {
        let (fi, _) = self.frame_ctx()?;
        if let Some(feedback) = self.states[fi].feedback.get_mut(site as usize) {
            let (ta, tb) = (a.tag(), b.tag());
            if ta == tb {
                feedback.observe(ta);
            } else {
                feedback.observe(ta);
                feedback.observe(tb);
            }
        }
        Ok(())
    }

    /// Install GUARD + typed opcode when the site has proven monomorphic.
    fn maybe_specialize(&mut self, site: u16, typed_int: Opcode, typed_float: Opcode) -> VmResult<()> {
        let (fi, pc) = self.frame_ctx()?;
        let Some(feedback) = self.states[fi].feedback.get(site as usize) else {
            return Ok(());
        };

        let (guard, typed) = if feedback.ready_to_specialize(ValueTag::Int) {
            (Opcode::GuardInt, typed_int)
        } else if feedback.ready_to_specialize(ValueTag::Float) {
            (Opcode::GuardFloat, typed_float)
        } else {
            return Ok(());
        };

        // The compiler reserves a Nop patch slot before every generic
        // arithmetic site.
        let state = &mut self.states[fi];
        if pc >= 1 && state.code[pc - 1].op == Opcode::Nop {
            state.code[pc - 1] = Instruction::new(guard, site, 0);
            state.code[pc] = Instruction::with_a(typed, site);
        }
        Ok(())
    }

    /// Revert a specialized site to its generic form and clear feedback.
    fn deoptimize(&mut self, site: u16) -> VmResult<()> {
        let (fi, pc) = self.frame_ctx()?;
        let state = &mut self.states[fi];
        if let Some(next) = state.code.get(pc + 1).copied() {
            if let Some(generic) = generic_opcode(next.op) {
                state.code[pc + 1] = Instruction::with_a(generic, next.a);
            }
        }
        state.code[pc] = Instruction::plain(Opcode::Nop);
        if let Some(feedback) = state.feedback.get_mut(site as usize) {
            feedback.clear();
        }
        Ok(())
    }

    fn arith_any(
        &mut self,
        site: u16,
        int_op: fn(i64, i64) -> i64,
        float_op: fn(f64, f64) -> f64,
        typed_int: Opcode,
        typed_float: Opcode,
    ) -> VmResult<Dispatch> {
        let b = self.pop()?;
        let a = self.pop()?;
        self.observe_arith(site, a, b)?;
        let result = match (self.to_numeric(a), self.to_numeric(b)) {
            (Numeric::Int(x), Numeric::Int(y)) => Value::Int(int_op(x, y)),
            (x, y) => {
                let xf = match x {
                    Numeric::Int(n) => n as f64,
                    Numeric::Float(f) => f,
                };
                let yf = match y {
                    Numeric::Int(n) => n as f64,
                    Numeric::Float(f) => f,
                };
                Value::Float(float_op(xf, yf))
            }
        };
        self.release_value(a);
        self.release_value(b);
        self.push(result)?;
        self.maybe_specialize(site, typed_int, typed_float)?;
        Ok(Dispatch::Continue)
    }

    fn div_any(&mut self, site: u16) -> VmResult<Dispatch> {
        let b = self.pop()?;
        let a = self.pop()?;
        self.observe_arith(site, a, b)?;

        let result = match (self.to_numeric(a), self.to_numeric(b)) {
            (Numeric::Int(x), Numeric::Int(0)) => {
                self.report_division_by_zero();
                Value::Float(div_zero_sentinel(x as f64))
            }
            (Numeric::Int(x), Numeric::Int(y)) => {
                // Exact division keeps the integer type
                if x.wrapping_rem(y) == 0 {
                    Value::Int(x.wrapping_div(y))
                } else {
                    Value::Float(x as f64 / y as f64)
                }
            }
            (x, y) => {
                let xf = numeric_to_f64(x);
                let yf = numeric_to_f64(y);
                if yf == 0.0 {
                    self.report_division_by_zero();
                    Value::Float(div_zero_sentinel(xf))
                } else {
                    Value::Float(xf / yf)
                }
            }
        };
        self.release_value(a);
        self.release_value(b);
        self.push(result)?;
        Ok(Dispatch::Continue)
    }

    fn report_division_by_zero(&mut self) {
        self.diagnostics.report(
            Severity::Warning,
            DiagnosticKind::DivisionByZero,
            "Division by zero",
            None,
        );
    }

    fn comparison(&mut self, site: u16, op: Opcode) -> VmResult<Dispatch> {
        let b = self.pop()?;
        let a = self.pop()?;
        self.observe_arith(site, a, b)?;
        let result = match op {
            Opcode::Eq => self.values_equal(a, b),
            Opcode::Neq => !self.values_equal(a, b),
            Opcode::Lt => self.compare(a, b) == std::cmp::Ordering::Less,
            Opcode::Le => self.compare(a, b) != std::cmp::Ordering::Greater,
            Opcode::Gt => self.compare(a, b) == std::cmp::Ordering::Greater,
            Opcode::Ge => self.compare(a, b) != std::cmp::Ordering::Less,
            _ => return Err(VmError::internal("bad comparison opcode")),
        };
        self.release_value(a);
        self.release_value(b);
        self.push(Value::Bool(result))?;
        Ok(Dispatch::Continue)
    }

    // ==================== Builtins ====================

    fn invoke_builtin_raw(&mut self, id: u16, args: &[Value]) -> VmResult<Value> {
        let entry = self
            .builtins
            .get(id)
            .ok_or_else(|| VmError::internal(format!("missing builtin {id}")))?;
        let func: BuiltinFn = Arc::clone(&entry.func);
        let (min, max) = (entry.arity_min as usize, entry.arity_max as usize);
        if args.len() < min || args.len() > max {
            self.diagnostics.report(
                Severity::Warning,
                DiagnosticKind::ArityMismatch,
                format!(
                    "builtin expects {min}..={max} arguments, got {}",
                    args.len()
                ),
                None,
            );
            return Ok(Value::Null);
        }
        let roots = self.collect_roots();
        let mut ctx = BuiltinCtx {
            memory: &mut self.memory,
            diagnostics: &mut self.diagnostics,
            roots: &roots,
        };
        func(&mut ctx, args)
    }
}

fn numeric_to_f64(n: Numeric) -> f64 {
    match n {
        Numeric::Int(v) => v as f64,
        Numeric::Float(f) => f,
    }
}

/// Parse a numeric byte string (integer first, float fallback)
fn parse_numeric(bytes: &[u8]) -> Option<Numeric> {
    let text = std::str::from_utf8(bytes).ok()?.trim();
    if text.is_empty() {
        return None;
    }
    if let Ok(n) = text.parse::<i64>() {
        return Some(Numeric::Int(n));
    }
    text.parse::<f64>().ok().map(Numeric::Float)
}

/// Map a typed opcode back to its generic form (deoptimization)
fn generic_opcode(op: Opcode) -> Option<Opcode> {
    match op {
        Opcode::AddInt | Opcode::AddFloat => Some(Opcode::AddAny),
        Opcode::SubInt | Opcode::SubFloat => Some(Opcode::SubAny),
        Opcode::MulInt | Opcode::MulFloat => Some(Opcode::MulAny),
        Opcode::DivInt | Opcode::DivFloat => Some(Opcode::DivAny),
        _ => None,
    }
}

/// The computed-dispatch table, built once.
fn dispatch_table() -> &'static [Handler; 256] {
    static TABLE: OnceLock<[Handler; 256]> = OnceLock::new();
    TABLE.get_or_init(|| {
        let mut table: [Handler; 256] = [op_invalid; 256];
        let mut set = |op: Opcode, handler: Handler| {
            table[op.to_byte() as usize] = handler;
        };
        set(Opcode::PushConst, op_push_const);
        set(Opcode::PushInt, op_push_int);
        set(Opcode::PushNull, |vm, _| {
            vm.push(Value::Null)?;
            Ok(Dispatch::Continue)
        });
        set(Opcode::PushTrue, |vm, _| {
            vm.push(Value::Bool(true))?;
            Ok(Dispatch::Continue)
        });
        set(Opcode::PushFalse, |vm, _| {
            vm.push(Value::Bool(false))?;
            Ok(Dispatch::Continue)
        });
        set(Opcode::PushLocal, op_push_local);
        set(Opcode::StoreLocal, op_store_local);
        set(Opcode::PushGlobal, op_push_global);
        set(Opcode::StoreGlobal, op_store_global);
        set(Opcode::Pop, op_pop);
        set(Opcode::Dup, op_dup);
        set(Opcode::Swap, op_swap);

        set(Opcode::AddInt, op_add_int);
        set(Opcode::AddFloat, op_add_float);
        set(Opcode::AddAny, |vm, i| {
            vm.arith_any(i.a, int_add, |x, y| x + y, Opcode::AddInt, Opcode::AddFloat)
        });
        set(Opcode::SubInt, op_sub_int);
        set(Opcode::SubFloat, op_sub_float);
        set(Opcode::SubAny, |vm, i| {
            vm.arith_any(i.a, int_sub, |x, y| x - y, Opcode::SubInt, Opcode::SubFloat)
        });
        set(Opcode::MulInt, op_mul_int);
        set(Opcode::MulFloat, op_mul_float);
        set(Opcode::MulAny, |vm, i| {
            vm.arith_any(i.a, int_mul, |x, y| x * y, Opcode::MulInt, Opcode::MulFloat)
        });
        set(Opcode::DivInt, op_div_int);
        set(Opcode::DivFloat, op_div_float);
        set(Opcode::DivAny, |vm, i| vm.div_any(i.a));
        set(Opcode::ModInt, op_mod_int);
        set(Opcode::Concat, op_concat);
        set(Opcode::Neg, op_neg);

        set(Opcode::Eq, |vm, i| vm.comparison(i.a, Opcode::Eq));
        set(Opcode::Neq, |vm, i| vm.comparison(i.a, Opcode::Neq));
        set(Opcode::Lt, |vm, i| vm.comparison(i.a, Opcode::Lt));
        set(Opcode::Le, |vm, i| vm.comparison(i.a, Opcode::Le));
        set(Opcode::Gt, |vm, i| vm.comparison(i.a, Opcode::Gt));
        set(Opcode::Ge, |vm, i| vm.comparison(i.a, Opcode::Ge));
        set(Opcode::Identical, op_identical);
        set(Opcode::NotIdentical, op_not_identical);
        set(Opcode::Not, op_not);

        set(Opcode::Jmp, |_, i| Ok(Dispatch::Jump(i.a_signed())));
        set(Opcode::Jz, op_jz);
        set(Opcode::Jnz, op_jnz);
        set(Opcode::Call, op_call);
        set(Opcode::CallValue, op_call_value);
        set(Opcode::CallMethod, op_call_method);
        set(Opcode::CallBuiltin, op_call_builtin);
        set(Opcode::Ret, op_ret);
        set(Opcode::RetNull, op_ret_null);
        set(Opcode::CheckGc, op_check_gc);
        set(Opcode::Throw, op_throw);

        set(Opcode::NewObj, op_new_obj);
        set(Opcode::GetProp, op_get_prop);
        set(Opcode::SetProp, op_set_prop);
        set(Opcode::GetPropIc, op_get_prop);
        set(Opcode::SetPropIc, op_set_prop);
        set(Opcode::InstanceOf, op_instance_of);
        set(Opcode::CloneVal, op_clone);
        set(Opcode::MakeClosure, op_make_closure);

        set(Opcode::NewArray, op_new_array);
        set(Opcode::GetElem, op_get_elem);
        set(Opcode::SetElem, op_set_elem);
        set(Opcode::ArrayPush, op_array_push);
        set(Opcode::ArrayLen, op_array_len);

        set(Opcode::NewStruct, op_new_struct);
        set(Opcode::GetField, op_get_field);
        set(Opcode::SetField, op_set_field);

        set(Opcode::GuardInt, op_guard_int);
        set(Opcode::GuardFloat, op_guard_float);
        set(Opcode::GuardStr, |vm, i| op_guard_tag(vm, i, ValueTag::Str));
        set(Opcode::GuardArray, |vm, i| {
            op_guard_tag(vm, i, ValueTag::Array)
        });
        set(Opcode::GuardObj, |vm, i| {
            op_guard_tag(vm, i, ValueTag::Object)
        });

        set(Opcode::PassByValue, |_, _| Ok(Dispatch::Continue));
        set(Opcode::PassByRef, op_pass_by_ref);
        set(Opcode::PassByCow, |_, _| Ok(Dispatch::Continue));
        set(Opcode::PassByMove, op_pass_by_move);
        set(Opcode::CowCheck, |_, _| Ok(Dispatch::Continue));
        set(Opcode::CowCopy, op_cow_copy);

        set(Opcode::Nop, |_, _| Ok(Dispatch::Continue));
        table
    })
}

fn op_invalid(_vm: &mut Vm, i: Instruction) -> VmResult<Dispatch> {
    Err(VmError::internal(format!(
        "invalid opcode {:#04x}",
        i.op.to_byte()
    )))
}

// ==================== Stack handlers ====================

fn op_push_const(vm: &mut Vm, i: Instruction) -> VmResult<Dispatch> {
    let value = match vm.constant(i.a)? {
        Constant::Null => Value::Null,
        Constant::Bool(b) => Value::Bool(b),
        Constant::Int(n) => Value::Int(n),
        Constant::Float(f) => Value::Float(f),
        Constant::Str(sym) => Value::InternedStr(sym),
    };
    vm.push(value)?;
    Ok(Dispatch::Continue)
}

fn op_push_int(vm: &mut Vm, i: Instruction) -> VmResult<Dispatch> {
    vm.push(Value::Int(i.a_signed() as i64))?;
    Ok(Dispatch::Continue)
}

fn op_push_local(vm: &mut Vm, i: Instruction) -> VmResult<Dispatch> {
    let slot = vm.current_local_slot(i.a)?;
    let value = *vm
        .stack
        .get(slot)
        .ok_or_else(|| VmError::internal("local out of frame"))?;
    vm.memory.retain_value(value)?;
    vm.push(value)?;
    Ok(Dispatch::Continue)
}

fn op_store_local(vm: &mut Vm, i: Instruction) -> VmResult<Dispatch> {
    let value = vm.pop()?;
    let slot = vm.current_local_slot(i.a)?;
    let old = std::mem::replace(
        vm.stack
            .get_mut(slot)
            .ok_or_else(|| VmError::internal("local out of frame"))?,
        value,
    );
    vm.release_value(old);
    Ok(Dispatch::Continue)
}

fn op_push_global(vm: &mut Vm, i: Instruction) -> VmResult<Dispatch> {
    let name = vm.constant_symbol(i.a)?;
    match vm.globals.get(&name).copied() {
        Some(value) => {
            vm.memory.retain_value(value)?;
            vm.push(value)?;
        }
        None => {
            let display = vm
                .memory
                .interner()
                .resolve(name)
                .map(|s| vm.diagnostics.format_var(&s))
                .unwrap_or_else(|| "<unknown>".to_string());
            vm.diagnostics.report(
                Severity::Notice,
                DiagnosticKind::UndefinedVariable,
                format!("Undefined variable {display}"),
                None,
            );
            vm.push(Value::Null)?;
        }
    }
    Ok(Dispatch::Continue)
}

fn op_store_global(vm: &mut Vm, i: Instruction) -> VmResult<Dispatch> {
    let name = vm.constant_symbol(i.a)?;
    let value = vm.pop()?;
    // Globals are GC roots: pin the new value, unpin the old.
    if let Some(h) = value.handle() {
        vm.memory.heap_mut().add_root(h);
    }
    if let Some(old) = vm.globals.insert(name, value) {
        if let Some(h) = old.handle() {
            vm.memory.heap_mut().remove_root(h);
        }
        vm.release_value(old);
    }
    Ok(Dispatch::Continue)
}

fn op_pop(vm: &mut Vm, _i: Instruction) -> VmResult<Dispatch> {
    let value = vm.pop()?;
    vm.release_value(value);
    Ok(Dispatch::Continue)
}

fn op_dup(vm: &mut Vm, _i: Instruction) -> VmResult<Dispatch> {
    let top = vm.peek(0)?;
    vm.memory.retain_value(top)?;
    vm.push(top)?;
    Ok(Dispatch::Continue)
}

fn op_swap(vm: &mut Vm, _i: Instruction) -> VmResult<Dispatch> {
    let len = vm.stack.len();
    if len < 2 {
        return Err(VmError::internal("swap on short stack"));
    }
    vm.stack.swap(len - 1, len - 2);
    Ok(Dispatch::Continue)
}

// ==================== Typed arithmetic ====================

fn typed_int_op(vm: &mut Vm, op: fn(i64, i64) -> i64) -> VmResult<Dispatch> {
    let b = vm.pop()?;
    let a = vm.pop()?;
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => {
            vm.push(Value::Int(op(x, y)))?;
        }
        _ => {
            // Stale specialization: coerce and compute on the int path.
            let x = match vm.to_numeric(a) {
                Numeric::Int(n) => n,
                Numeric::Float(f) => f.round_ties_even() as i64,
            };
            let y = match vm.to_numeric(b) {
                Numeric::Int(n) => n,
                Numeric::Float(f) => f.round_ties_even() as i64,
            };
            vm.release_value(a);
            vm.release_value(b);
            vm.push(Value::Int(op(x, y)))?;
        }
    }
    Ok(Dispatch::Continue)
}

fn typed_float_op(vm: &mut Vm, op: fn(f64, f64) -> f64) -> VmResult<Dispatch> {
    let b = vm.pop()?;
    let a = vm.pop()?;
    match (a, b) {
        (Value::Float(x), Value::Float(y)) => {
            vm.push(Value::Float(op(x, y)))?;
        }
        _ => {
            let x = vm.numeric_as_float(a);
            let y = vm.numeric_as_float(b);
            vm.release_value(a);
            vm.release_value(b);
            vm.push(Value::Float(op(x, y)))?;
        }
    }
    Ok(Dispatch::Continue)
}

fn op_add_int(vm: &mut Vm, _i: Instruction) -> VmResult<Dispatch> {
    typed_int_op(vm, int_add)
}

fn op_sub_int(vm: &mut Vm, _i: Instruction) -> VmResult<Dispatch> {
    typed_int_op(vm, int_sub)
}

fn op_mul_int(vm: &mut Vm, _i: Instruction) -> VmResult<Dispatch> {
    typed_int_op(vm, int_mul)
}

fn op_add_float(vm: &mut Vm, _i: Instruction) -> VmResult<Dispatch> {
    typed_float_op(vm, |x, y| x + y)
}

fn op_sub_float(vm: &mut Vm, _i: Instruction) -> VmResult<Dispatch> {
    typed_float_op(vm, |x, y| x - y)
}

fn op_mul_float(vm: &mut Vm, _i: Instruction) -> VmResult<Dispatch> {
    typed_float_op(vm, |x, y| x * y)
}

fn op_div_int(vm: &mut Vm, _i: Instruction) -> VmResult<Dispatch> {
    let b = vm.pop()?;
    let a = vm.pop()?;
    let result = match (a, b) {
        (Value::Int(x), Value::Int(0)) => {
            vm.report_division_by_zero();
            Value::Float(div_zero_sentinel(x as f64))
        }
        (Value::Int(x), Value::Int(y)) => Value::Int(x.wrapping_div(y)),
        _ => {
            let x = vm.numeric_as_float(a);
            let y = vm.numeric_as_float(b);
            if y == 0.0 {
                vm.report_division_by_zero();
                Value::Float(div_zero_sentinel(x))
            } else {
                Value::Float(x / y)
            }
        }
    };
    vm.release_value(a);
    vm.release_value(b);
    vm.push(result)?;
    Ok(Dispatch::Continue)
}

fn op_div_float(vm: &mut Vm, _i: Instruction) -> VmResult<Dispatch> {
    let b = vm.pop()?;
    let a = vm.pop()?;
    let x = vm.numeric_as_float(a);
    let y = vm.numeric_as_float(b);
    let result = if y == 0.0 {
        vm.report_division_by_zero();
        Value::Float(div_zero_sentinel(x))
    } else {
        Value::Float(x / y)
    };
    vm.release_value(a);
    vm.release_value(b);
    vm.push(result)?;
    Ok(Dispatch::Continue)
}

fn op_mod_int(vm: &mut Vm, _i: Instruction) -> VmResult<Dispatch> {
    let b = vm.pop()?;
    let a = vm.pop()?;
    let result = match (vm.to_numeric(a), vm.to_numeric(b)) {
        (_, Numeric::Int(0)) => {
            vm.report_division_by_zero();
            Value::Float(f64::NAN)
        }
        (Numeric::Int(x), Numeric::Int(y)) => Value::Int(x.wrapping_rem(y)),
        (x, y) => {
            let yf = numeric_to_f64(y);
            if yf == 0.0 {
                vm.report_division_by_zero();
                Value::Float(f64::NAN)
            } else {
                Value::Float(numeric_to_f64(x) % yf)
            }
        }
    };
    vm.release_value(a);
    vm.release_value(b);
    vm.push(result)?;
    Ok(Dispatch::Continue)
}

fn op_concat(vm: &mut Vm, _i: Instruction) -> VmResult<Dispatch> {
    let b = vm.pop()?;
    let a = vm.pop()?;
    let mut bytes = match vm.string_bytes(a) {
        Some(raw) => raw,
        None => vm.display_string(a).into_bytes(),
    };
    let tail = match vm.string_bytes(b) {
        Some(raw) => raw,
        None => vm.display_string(b).into_bytes(),
    };
    bytes.extend_from_slice(&tail);
    vm.release_value(a);
    vm.release_value(b);
    let roots = vm.collect_roots();
    let result = vm.memory.alloc_string_bytes(&bytes, &roots)?;
    vm.push(result)?;
    Ok(Dispatch::Continue)
}

fn op_neg(vm: &mut Vm, _i: Instruction) -> VmResult<Dispatch> {
    let a = vm.pop()?;
    let result = match vm.to_numeric(a) {
        Numeric::Int(n) => Value::Int(n.wrapping_neg()),
        Numeric::Float(f) => Value::Float(-f),
    };
    vm.release_value(a);
    vm.push(result)?;
    Ok(Dispatch::Continue)
}

// ==================== Comparison / logic ====================

fn op_identical(vm: &mut Vm, _i: Instruction) -> VmResult<Dispatch> {
    let b = vm.pop()?;
    let a = vm.pop()?;
    let result = a.identical(b);
    vm.release_value(a);
    vm.release_value(b);
    vm.push(Value::Bool(result))?;
    Ok(Dispatch::Continue)
}

fn op_not_identical(vm: &mut Vm, _i: Instruction) -> VmResult<Dispatch> {
    let b = vm.pop()?;
    let a = vm.pop()?;
    let result = !a.identical(b);
    vm.release_value(a);
    vm.release_value(b);
    vm.push(Value::Bool(result))?;
    Ok(Dispatch::Continue)
}

fn op_not(vm: &mut Vm, _i: Instruction) -> VmResult<Dispatch> {
    let a = vm.pop()?;
    let result = !vm.to_bool(a);
    vm.release_value(a);
    vm.push(Value::Bool(result))?;
    Ok(Dispatch::Continue)
}

// ==================== Control flow ====================

fn op_jz(vm: &mut Vm, i: Instruction) -> VmResult<Dispatch> {
    let cond = vm.pop()?;
    let truthy = vm.to_bool(cond);
    vm.release_value(cond);
    if truthy {
        Ok(Dispatch::Continue)
    } else {
        Ok(Dispatch::Jump(i.a_signed()))
    }
}

fn op_jnz(vm: &mut Vm, i: Instruction) -> VmResult<Dispatch> {
    let cond = vm.pop()?;
    let truthy = vm.to_bool(cond);
    vm.release_value(cond);
    if truthy {
        Ok(Dispatch::Jump(i.a_signed()))
    } else {
        Ok(Dispatch::Continue)
    }
}

fn op_call(vm: &mut Vm, i: Instruction) -> VmResult<Dispatch> {
    // Callee feedback, keyed by call-site pc.
    let (fi, pc) = vm.frame_ctx()?;
    vm.states[fi]
        .call_feedback
        .entry(pc)
        .or_default()
        .observe(ValueTag::Function);
    vm.call_function(i.a as u32, i.b as usize)?;
    Ok(Dispatch::FrameChanged)
}

fn op_call_value(vm: &mut Vm, i: Instruction) -> VmResult<Dispatch> {
    let argc = i.b as usize;
    let callee_pos = vm
        .stack
        .len()
        .checked_sub(argc + 1)
        .ok_or_else(|| VmError::internal("missing callee"))?;
    let callee = vm.stack[callee_pos];

    let (fi, pc) = vm.frame_ctx()?;
    vm.states[fi]
        .call_feedback
        .entry(pc)
        .or_default()
        .observe(callee.tag());

    match callee {
        Value::Closure(h) => {
            let (function, captures) = match vm.memory.heap().get(h) {
                Some(HeapData::Closure(c)) => (c.function, c.captures.clone()),
                _ => return Err(VmError::internal("closure payload mismatch")),
            };
            // Captures become trailing arguments: push them (rooted) before
            // the callee slot is dropped from the stack.
            let capture_count = captures.len();
            for capture in captures {
                vm.memory.retain_value(capture)?;
                vm.push(capture)?;
            }
            vm.stack.remove(callee_pos);
            vm.release_value(callee);
            vm.call_function(function, argc + capture_count)?;
            Ok(Dispatch::FrameChanged)
        }
        Value::Function(function) => {
            vm.stack.remove(callee_pos);
            vm.call_function(function, argc)?;
            Ok(Dispatch::FrameChanged)
        }
        Value::Builtin(id) => {
            let args: Vec<Value> = vm.stack[callee_pos + 1..].to_vec();
            let result = vm.invoke_builtin_raw(id, &args)?;
            vm.push(result)?;
            // Drop callee and args from under the result.
            for idx in callee_pos..callee_pos + argc + 1 {
                let v = vm.stack[idx];
                vm.release_value(v);
            }
            vm.stack.drain(callee_pos..callee_pos + argc + 1);
            Ok(Dispatch::Continue)
        }
        _ => {
            let roots = vm.collect_roots();
            let msg = vm
                .memory
                .alloc_string("Value is not callable", &roots)?;
            vm.throw_value(msg)
        }
    }
}

fn op_call_method(vm: &mut Vm, i: Instruction) -> VmResult<Dispatch> {
    let argc = i.b as usize;
    let name = vm.constant_symbol(i.a)?;
    let recv_pos = vm
        .stack
        .len()
        .checked_sub(argc + 1)
        .ok_or_else(|| VmError::internal("missing receiver"))?;
    let receiver = vm.stack[recv_pos];

    let method = match receiver {
        Value::Object(h) => match vm.memory.heap().get(h) {
            Some(HeapData::Object(o)) => vm.memory.classes.method(o.class, name),
            _ => None,
        },
        _ => None,
    };

    match method {
        Some(MethodBody::User(function)) => {
            // The receiver is the method's first argument.
            vm.call_function(function, argc + 1)?;
            Ok(Dispatch::FrameChanged)
        }
        Some(MethodBody::Builtin(id)) => {
            let args: Vec<Value> = vm.stack[recv_pos..].to_vec();
            let result = vm.invoke_builtin_raw(id, &args)?;
            vm.push(result)?;
            for idx in recv_pos..recv_pos + argc + 1 {
                let v = vm.stack[idx];
                vm.release_value(v);
            }
            vm.stack.drain(recv_pos..recv_pos + argc + 1);
            Ok(Dispatch::Continue)
        }
        None => {
            let text = match vm.memory.interner().resolve(name) {
                Some(n) => format!("Call to undefined method {n}"),
                None => "Call to undefined method".to_string(),
            };
            let roots = vm.collect_roots();
            let msg = vm.memory.alloc_string(&text, &roots)?;
            vm.throw_value(msg)
        }
    }
}

fn op_call_builtin(vm: &mut Vm, i: Instruction) -> VmResult<Dispatch> {
    let argc = i.b as usize;
    let args_start = vm
        .stack
        .len()
        .checked_sub(argc)
        .ok_or_else(|| VmError::internal("missing builtin arguments"))?;
    let args: Vec<Value> = vm.stack[args_start..].to_vec();
    let result = vm.invoke_builtin_raw(i.a, &args)?;
    vm.push(result)?;
    for idx in args_start..args_start + argc {
        let v = vm.stack[idx];
        vm.release_value(v);
    }
    vm.stack.drain(args_start..args_start + argc);
    Ok(Dispatch::Continue)
}

fn op_ret(vm: &mut Vm, _i: Instruction) -> VmResult<Dispatch> {
    vm.safepoint()?;
    let result = vm.pop()?;
    match vm.do_return(result)? {
        Some(value) => Ok(Dispatch::Halt(value)),
        None => Ok(Dispatch::FrameChanged),
    }
}

fn op_ret_null(vm: &mut Vm, _i: Instruction) -> VmResult<Dispatch> {
    vm.safepoint()?;
    match vm.do_return(Value::Null)? {
        Some(value) => Ok(Dispatch::Halt(value)),
        None => Ok(Dispatch::FrameChanged),
    }
}

fn op_check_gc(vm: &mut Vm, _i: Instruction) -> VmResult<Dispatch> {
    vm.safepoint()?;
    Ok(Dispatch::Continue)
}

fn op_throw(vm: &mut Vm, _i: Instruction) -> VmResult<Dispatch> {
    let value = vm.pop()?;
    vm.throw_value(value)
}

// ==================== Objects ====================

fn op_new_obj(vm: &mut Vm, i: Instruction) -> VmResult<Dispatch> {
    let roots = vm.collect_roots();
    let object = vm.memory.alloc_object(i.a, &roots)?;
    vm.push(object)?;
    Ok(Dispatch::Continue)
}

fn op_get_prop(vm: &mut Vm, i: Instruction) -> VmResult<Dispatch> {
    let name = vm.constant_symbol(i.a)?;
    let obj = vm.pop()?;

    let result = match obj {
        Value::Object(h) => {
            let shape = match vm.memory.heap().get(h) {
                Some(HeapData::Object(o)) => o.shape,
                _ => return Err(VmError::internal("object payload mismatch")),
            };

            let slot = if i.op == Opcode::GetPropIc {
                let (fi, _) = vm.frame_ctx()?;
                let cached = vm.states[fi].pics.entry(i.b).or_default().lookup(shape);
                match cached {
                    Some(slot) => Some(slot),
                    None => {
                        // Full shape walk, then install for next time.
                        let resolved = vm.memory.shapes.offset_of(shape, name);
                        if let Some(slot) = resolved {
                            vm.states[fi]
                                .pics
                                .entry(i.b)
                                .or_default()
                                .install(shape, slot);
                        }
                        resolved
                    }
                }
            } else {
                vm.memory.shapes.offset_of(shape, name)
            };

            match slot {
                Some(slot) => {
                    let value = match vm.memory.heap().get(h) {
                        Some(HeapData::Object(o)) => o.slot(slot).unwrap_or(Value::Null),
                        _ => Value::Null,
                    };
                    vm.memory.retain_value(value)?;
                    value
                }
                None => {
                    vm.report_undefined_property(name);
                    Value::Null
                }
            }
        }
        Value::Struct(h) => {
            let value = match vm.memory.heap().get(h) {
                Some(HeapData::Struct(s)) => s
                    .offset_of(name)
                    .and_then(|idx| s.values.get(idx).copied()),
                _ => None,
            };
            match value {
                Some(value) => {
                    vm.memory.retain_value(value)?;
                    value
                }
                None => {
                    vm.report_undefined_property(name);
                    Value::Null
                }
            }
        }
        _ => {
            vm.report_undefined_property(name);
            Value::Null
        }
    };

    vm.release_value(obj);
    vm.push(result)?;
    Ok(Dispatch::Continue)
}

fn op_set_prop(vm: &mut Vm, i: Instruction) -> VmResult<Dispatch> {
    let name = vm.constant_symbol(i.a)?;
    let value = vm.pop()?;
    let obj = vm.pop()?;

    match obj {
        Value::Object(h) => {
            let shape = match vm.memory.heap().get(h) {
                Some(HeapData::Object(o)) => o.shape,
                _ => return Err(VmError::internal("object payload mismatch")),
            };

            let existing = vm.memory.shapes.offset_of(shape, name);
            match existing {
                Some(slot) => {
                    if i.op == Opcode::SetPropIc {
                        let (fi, _) = vm.frame_ctx()?;
                        let pic = vm.states[fi].pics.entry(i.b).or_default();
                        if pic.lookup(shape).is_none() {
                            pic.install(shape, slot);
                        }
                    }
                    let old = match vm.memory.heap_mut().get_mut(h) {
                        Some(HeapData::Object(o)) => {
                            std::mem::replace(&mut o.slots[slot as usize], value)
                        }
                        _ => Value::Null,
                    };
                    vm.release_value(old);
                }
                None => {
                    // New property: transition the shape and grow the slots.
                    let new_shape = vm.memory.shapes.transition(shape, name);
                    if let Some(HeapData::Object(o)) = vm.memory.heap_mut().get_mut(h) {
                        o.shape = new_shape;
                        o.slots.push(value);
                    }
                }
            }
            vm.memory.write_barrier(h, value);
        }
        Value::Struct(h) => {
            let offset = match vm.memory.heap().get(h) {
                Some(HeapData::Struct(s)) => s.offset_of(name),
                _ => None,
            };
            match offset {
                Some(idx) => {
                    let old = match vm.memory.heap_mut().get_mut(h) {
                        Some(HeapData::Struct(s)) => {
                            std::mem::replace(&mut s.values[idx], value)
                        }
                        _ => Value::Null,
                    };
                    vm.release_value(old);
                    vm.memory.write_barrier(h, value);
                }
                None => {
                    vm.report_undefined_property(name);
                    vm.release_value(value);
                }
            }
        }
        _ => {
            vm.report_undefined_property(name);
            vm.release_value(value);
        }
    }

    vm.release_value(obj);
    Ok(Dispatch::Continue)
}

fn op_instance_of(vm: &mut Vm, i: Instruction) -> VmResult<Dispatch> {
    let obj = vm.pop()?;
    let result = match obj {
        Value::Object(h) => match vm.memory.heap().get(h) {
            Some(HeapData::Object(o)) => o.class == i.a,
            _ => false,
        },
        _ => false,
    };
    vm.release_value(obj);
    vm.push(Value::Bool(result))?;
    Ok(Dispatch::Continue)
}

fn op_clone(vm: &mut Vm, _i: Instruction) -> VmResult<Dispatch> {
    // The original stays on the stack (rooted) while the copy allocates.
    let original = vm.peek(0)?;
    let cloned = match original {
        Value::Str(h) => {
            let payload = match vm.memory.heap().get(h) {
                Some(HeapData::Str(s)) => s.share(),
                _ => return Err(VmError::internal("string payload mismatch")),
            };
            let handle = vm.alloc(HeapData::Str(payload))?;
            Some(Value::Str(handle))
        }
        Value::Array(h) => {
            let payload = match vm.memory.heap().get(h) {
                Some(HeapData::Array(a)) => a.share(),
                _ => return Err(VmError::internal("array payload mismatch")),
            };
            let handle = vm.alloc(HeapData::Array(payload))?;
            Some(Value::Array(handle))
        }
        Value::Object(h) => {
            let payload = match vm.memory.heap().get(h) {
                Some(HeapData::Object(o)) => o.clone(),
                _ => return Err(VmError::internal("object payload mismatch")),
            };
            // Shallow clone: members are shared, so each gains a reference.
            for slot in &payload.slots {
                vm.memory.retain_value(*slot)?;
            }
            let handle = vm.alloc(HeapData::Object(payload))?;
            Some(Value::Object(handle))
        }
        Value::Struct(h) => {
            let payload = match vm.memory.heap().get(h) {
                Some(HeapData::Struct(s)) => s.clone(),
                _ => return Err(VmError::internal("struct payload mismatch")),
            };
            for value in &payload.values {
                vm.memory.retain_value(*value)?;
            }
            let handle = vm.alloc(HeapData::Struct(payload))?;
            Some(Value::Struct(handle))
        }
        _ => None,
    };

    let original = vm.pop()?;
    match cloned {
        Some(copy) => {
            vm.release_value(original);
            vm.push(copy)?;
        }
        None => {
            // Primitives clone to themselves.
            vm.push(original)?;
        }
    }
    Ok(Dispatch::Continue)
}

fn op_make_closure(vm: &mut Vm, i: Instruction) -> VmResult<Dispatch> {
    let count = i.b as usize;
    let start = vm
        .stack
        .len()
        .checked_sub(count)
        .ok_or_else(|| VmError::internal("missing captures"))?;
    // Captures stay rooted on the stack during allocation, then transfer.
    let captures: Vec<Value> = vm.stack[start..].to_vec();
    let roots = vm.collect_roots();
    let closure = vm.memory.alloc_closure(i.a as u32, captures, &roots)?;
    vm.stack.truncate(start);
    vm.push(closure)?;
    Ok(Dispatch::Continue)
}

// ==================== Arrays ====================

fn op_new_array(vm: &mut Vm, i: Instruction) -> VmResult<Dispatch> {
    let count = i.a as usize;
    let start = vm
        .stack
        .len()
        .checked_sub(count)
        .ok_or_else(|| VmError::internal("missing array elements"))?;
    let elements: Vec<Value> = vm.stack[start..].to_vec();
    let roots = vm.collect_roots();
    let array = vm.memory.alloc_array(elements, &roots)?;
    vm.stack.truncate(start);
    vm.push(array)?;
    Ok(Dispatch::Continue)
}

fn array_index(vm: &mut Vm, index: Value) -> Option<usize> {
    match vm.to_numeric(index) {
        Numeric::Int(n) if n >= 0 => Some(n as usize),
        Numeric::Float(f) if f >= 0.0 && f.fract() == 0.0 => Some(f as usize),
        _ => None,
    }
}

fn op_get_elem(vm: &mut Vm, _i: Instruction) -> VmResult<Dispatch> {
    let index = vm.pop()?;
    let container = vm.pop()?;

    let result = match container {
        Value::Array(h) => {
            let idx = array_index(vm, index);
            let value = idx.and_then(|idx| match vm.memory.heap().get(h) {
                Some(HeapData::Array(a)) => a.get(idx),
                _ => None,
            });
            match value {
                Some(value) => {
                    vm.memory.retain_value(value)?;
                    vm.release_value(container);
                    vm.release_value(index);
                    value
                }
                None => {
                    vm.report_undefined_index();
                    vm.release_value(container);
                    vm.release_value(index);
                    Value::Null
                }
            }
        }
        Value::Str(_) | Value::InternedStr(_) => {
            let idx = array_index(vm, index);
            let byte = idx.and_then(|idx| {
                vm.string_bytes(container)
                    .and_then(|bytes| bytes.get(idx).copied())
            });
            vm.release_value(container);
            vm.release_value(index);
            match byte {
                Some(byte) => {
                    let roots = vm.collect_roots();
                    vm.memory.alloc_string_bytes(&[byte], &roots)?
                }
                None => {
                    vm.report_undefined_index();
                    Value::Null
                }
            }
        }
        _ => {
            vm.report_undefined_index();
            vm.release_value(container);
            vm.release_value(index);
            Value::Null
        }
    };

    vm.push(result)?;
    Ok(Dispatch::Continue)
}

fn op_set_elem(vm: &mut Vm, _i: Instruction) -> VmResult<Dispatch> {
    let value = vm.pop()?;
    let index = vm.pop()?;
    let container = vm.pop()?;

    match container {
        Value::Array(h) => {
            let Some(idx) = array_index(vm, index) else {
                vm.report_undefined_index();
                vm.release_value(value);
                vm.release_value(index);
                vm.release_value(container);
                return Ok(Dispatch::Continue);
            };
            let (to_retain, old) = match vm.memory.heap_mut().get_mut(h) {
                Some(HeapData::Array(a)) => {
                    let (elements, cloned) = a.prepare_write();
                    let to_retain = if cloned { elements.clone() } else { Vec::new() };
                    // Insertion past the end grows the array, null-filled.
                    while elements.len() <= idx {
                        elements.push(Value::Null);
                    }
                    let old = std::mem::replace(&mut elements[idx], value);
                    (to_retain, old)
                }
                _ => (Vec::new(), Value::Null),
            };
            // A cloned element table holds a second reference to everything
            // it copied.
            for v in to_retain {
                vm.memory.retain_value(v)?;
            }
            vm.release_value(old);
            vm.memory.write_barrier(h, value);
        }
        Value::Str(h) => {
            let idx = array_index(vm, index);
            let byte = vm.string_bytes(value).and_then(|b| b.first().copied());
            match (idx, byte) {
                (Some(idx), Some(byte)) => {
                    let ok = match vm.memory.heap_mut().get_mut(h) {
                        Some(HeapData::Str(s)) => s.set_byte(idx, byte),
                        _ => false,
                    };
                    if !ok {
                        vm.report_undefined_index();
                    }
                }
                _ => vm.report_undefined_index(),
            }
            vm.release_value(value);
        }
        _ => {
            vm.report_undefined_index();
            vm.release_value(value);
        }
    }

    vm.release_value(index);
    vm.release_value(container);
    Ok(Dispatch::Continue)
}

fn op_array_push(vm: &mut Vm, _i: Instruction) -> VmResult<Dispatch> {
    let value = vm.pop()?;
    let container = vm.pop()?;

    match container {
        Value::Array(h) => {
            let to_retain = match vm.memory.heap_mut().get_mut(h) {
                Some(HeapData::Array(a)) => {
                    let (elements, cloned) = a.prepare_write();
                    let to_retain = if cloned { elements.clone() } else { Vec::new() };
                    elements.push(value);
                    to_retain
                }
                _ => Vec::new(),
            };
            for v in to_retain {
                vm.memory.retain_value(v)?;
            }
            vm.memory.write_barrier(h, value);
        }
        _ => {
            vm.report_undefined_index();
            vm.release_value(value);
        }
    }

    vm.release_value(container);
    Ok(Dispatch::Continue)
}

fn op_array_len(vm: &mut Vm, _i: Instruction) -> VmResult<Dispatch> {
    let container = vm.pop()?;
    let len = match container {
        Value::Array(h) => match vm.memory.heap().get(h) {
            Some(HeapData::Array(a)) => a.len() as i64,
            _ => 0,
        },
        Value::Str(_) | Value::InternedStr(_) => {
            vm.string_bytes(container).map(|b| b.len()).unwrap_or(0) as i64
        }
        _ => 0,
    };
    vm.release_value(container);
    vm.push(Value::Int(len))?;
    Ok(Dispatch::Continue)
}

// ==================== Structs ====================

fn op_new_struct(vm: &mut Vm, i: Instruction) -> VmResult<Dispatch> {
    let count = i.a as usize;
    let on_stack = i.b != 0;
    let start = vm
        .stack
        .len()
        .checked_sub(count * 2)
        .ok_or_else(|| VmError::internal("missing struct fields"))?;

    // (name, value) pairs were pushed in layout order and stay rooted on
    // the stack while the record allocates.
    let mut fields = Vec::with_capacity(count);
    let mut values = Vec::with_capacity(count);
    for pair in 0..count {
        let name = match vm.stack[start + pair * 2] {
            Value::InternedStr(sym) => sym,
            _ => return Err(VmError::internal("struct field name must be interned")),
        };
        fields.push(name);
        values.push(vm.stack[start + pair * 2 + 1]);
    }

    let roots = vm.collect_roots();
    let result = vm.memory.alloc_struct(fields, values, on_stack, &roots)?;
    vm.stack.truncate(start);
    vm.push(result)?;
    Ok(Dispatch::Continue)
}

fn op_get_field(vm: &mut Vm, i: Instruction) -> VmResult<Dispatch> {
    let container = vm.pop()?;
    let result = match container {
        Value::Struct(h) => match vm.memory.heap().get(h) {
            Some(HeapData::Struct(s)) => s.values.get(i.a as usize).copied(),
            _ => None,
        },
        _ => None,
    };
    match result {
        Some(value) => {
            vm.memory.retain_value(value)?;
            vm.release_value(container);
            vm.push(value)?;
        }
        None => {
            vm.diagnostics.report(
                Severity::Notice,
                DiagnosticKind::UndefinedProperty,
                "Undefined record field",
                None,
            );
            vm.release_value(container);
            vm.push(Value::Null)?;
        }
    }
    Ok(Dispatch::Continue)
}

fn op_set_field(vm: &mut Vm, i: Instruction) -> VmResult<Dispatch> {
    let value = vm.pop()?;
    let container = vm.pop()?;
    match container {
        Value::Struct(h) => {
            let old = match vm.memory.heap_mut().get_mut(h) {
                Some(HeapData::Struct(s)) if (i.a as usize) < s.values.len() => {
                    std::mem::replace(&mut s.values[i.a as usize], value)
                }
                _ => {
                    vm.release_value(value);
                    vm.release_value(container);
                    return Ok(Dispatch::Continue);
                }
            };
            vm.release_value(old);
            vm.memory.write_barrier(h, value);
        }
        _ => {
            vm.release_value(value);
        }
    }
    vm.release_value(container);
    Ok(Dispatch::Continue)
}

// ==================== Guards ====================

fn op_guard_int(vm: &mut Vm, i: Instruction) -> VmResult<Dispatch> {
    let ok = vm.stack.len() >= 2
        && matches!(vm.peek(0)?, Value::Int(_))
        && matches!(vm.peek(1)?, Value::Int(_));
    if ok {
        Ok(Dispatch::Continue)
    } else {
        vm.deoptimize(i.a)?;
        Ok(Dispatch::Jump(i.b_signed()))
    }
}

fn op_guard_float(vm: &mut Vm, i: Instruction) -> VmResult<Dispatch> {
    let ok = vm.stack.len() >= 2
        && matches!(vm.peek(0)?, Value::Float(_))
        && matches!(vm.peek(1)?, Value::Float(_));
    if ok {
        Ok(Dispatch::Continue)
    } else {
        vm.deoptimize(i.a)?;
        Ok(Dispatch::Jump(i.b_signed()))
    }
}

fn op_guard_tag(vm: &mut Vm, i: Instruction, tag: ValueTag) -> VmResult<Dispatch> {
    let ok = !vm.stack.is_empty() && vm.peek(0)?.tag() == tag;
    if ok {
        Ok(Dispatch::Continue)
    } else {
        vm.deoptimize(i.a)?;
        Ok(Dispatch::Jump(i.b_signed()))
    }
}

// ==================== Parameter passing ====================

fn op_pass_by_ref(vm: &mut Vm, i: Instruction) -> VmResult<Dispatch> {
    // Remember the caller slot; the upcoming CALL binds it to the matching
    // parameter for copy-out at return.
    let pos = vm.stack.len();
    vm.pending_refs.push((pos, i.a));
    Ok(Dispatch::Continue)
}

fn op_pass_by_move(vm: &mut Vm, i: Instruction) -> VmResult<Dispatch> {
    // Transfer ownership: the source slot is invalidated, so the argument
    // on the stack holds the only live reference from this frame.
    let slot = vm.current_local_slot(i.a)?;
    let old = std::mem::replace(
        vm.stack
            .get_mut(slot)
            .ok_or_else(|| VmError::internal("local out of frame"))?,
        Value::Null,
    );
    vm.release_value(old);
    Ok(Dispatch::Continue)
}

fn op_cow_copy(vm: &mut Vm, i: Instruction) -> VmResult<Dispatch> {
    // Ensure the local slot holds an exclusively owned aggregate before a
    // mutation, cloning the value box (buffer shared, copy-on-write) when
    // other references exist. Objects keep identity semantics.
    let slot = vm.current_local_slot(i.a)?;
    let value = *vm
        .stack
        .get(slot)
        .ok_or_else(|| VmError::internal("local out of frame"))?;

    let needs_copy = |vm: &Vm, h: Handle| {
        vm.memory
            .heap()
            .header(h)
            .map(|hd| hd.refcount > 1)
            .unwrap_or(false)
    };

    let replacement = match value {
        // Interned strings are immortal and shared: mutation always starts
        // from a private heap copy.
        Value::InternedStr(sym) => {
            let bytes = vm
                .memory
                .interner()
                .resolve(sym)
                .map(|s| s.as_bytes().to_vec())
                .unwrap_or_default();
            let fresh = vm.alloc(HeapData::Str(VmString::from_bytes(&bytes)))?;
            Some(Value::Str(fresh))
        }
        Value::Str(h) if needs_copy(vm, h) => {
            let payload = match vm.memory.heap().get(h) {
                Some(HeapData::Str(s)) => s.share(),
                _ => return Err(VmError::internal("string payload mismatch")),
            };
            let fresh = vm.alloc(HeapData::Str(payload))?;
            Some(Value::Str(fresh))
        }
        Value::Array(h) if needs_copy(vm, h) => {
            let payload = match vm.memory.heap().get(h) {
                Some(HeapData::Array(a)) => a.share(),
                _ => return Err(VmError::internal("array payload mismatch")),
            };
            let fresh = vm.alloc(HeapData::Array(payload))?;
            Some(Value::Array(fresh))
        }
        _ => None,
    };

    let result = match replacement {
        Some(fresh) => {
            // Rebind the local to the exclusive copy.
            let old = std::mem::replace(
                vm.stack
                    .get_mut(slot)
                    .ok_or_else(|| VmError::internal("local out of frame"))?,
                fresh,
            );
            vm.release_value(old);
            fresh
        }
        None => value,
    };

    vm.memory.retain_value(result)?;
    vm.push(result)?;
    Ok(Dispatch::Continue)
}

impl Vm {
    fn report_undefined_property(&mut self, name: SymbolId) {
        let display = self
            .memory
            .interner()
            .resolve(name)
            .map(|s| s.to_string())
            .unwrap_or_else(|| "<field>".to_string());
        self.diagnostics.report(
            Severity::Notice,
            DiagnosticKind::UndefinedProperty,
            format!("Undefined property: {display}"),
            None,
        );
    }

    fn report_undefined_index(&mut self) {
        self.diagnostics.report(
            Severity::Notice,
            DiagnosticKind::UndefinedIndex,
            "Undefined array index",
            None,
        );
    }
}
