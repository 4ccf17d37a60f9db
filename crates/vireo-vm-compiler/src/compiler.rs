//! AST to bytecode emission
//!
//! A single forward pass per function body. Forward jumps go through a
//! patch list; locals get slots on first sight; string constants intern
//! into the function's pool; statement lines land in the line map. The
//! escape analysis (run per function before emission) decides which record
//! allocations become NewStruct instructions or dissolve into locals, and
//! the passing module decides the PASS_* opcodes at call sites.

use indexmap::IndexMap;
use rustc_hash::FxHashMap;

use vireo_vm_bytecode::{
    CompiledFunction, Constant, ExceptionEntry, Instruction, Interner, Opcode, ParamSpec,
    PassingConvention, Program, SymbolId, verify_function,
};

use crate::ast::{
    AstNode, AstProgram, BinaryOp, FunctionDecl, NodeId, NodeKind, UnaryOp,
};
use crate::error::{CompileError, CompileResult};
use crate::escape::{self, AllocDecision, CalleeInfo, EscapeAnalysis};
use crate::passing;

/// Compilation options supplied by the embedder
#[derive(Debug, Default)]
pub struct CompileOptions {
    /// Entry function name; defaults to `main`
    pub entry: Option<String>,
    /// Registered builtin functions: name -> builtin id
    pub builtins: FxHashMap<SymbolId, u16>,
    /// Registered classes: name -> class id
    pub classes: FxHashMap<SymbolId, u16>,
}

/// Signature of a declared function, known before bodies are compiled
struct Signature {
    index: u16,
    conventions: Vec<PassingConvention>,
    runtime_check: Vec<bool>,
}

/// The compiler
pub struct Compiler<'a> {
    interner: &'a Interner,
    options: CompileOptions,
}

impl<'a> Compiler<'a> {
    /// Create a compiler over an interner
    pub fn new(interner: &'a Interner, options: CompileOptions) -> Self {
        Self { interner, options }
    }

    /// Compile a program: signatures first (no forward references at link
    /// time), then bodies, then verification.
    pub fn compile(&self, ast: &AstProgram) -> CompileResult<Program> {
        let mut signatures: FxHashMap<SymbolId, Signature> = FxHashMap::default();
        let mut callee_info = CalleeInfo::default();

        for (index, decl) in ast.functions.iter().enumerate() {
            let mut conventions = Vec::with_capacity(decl.params.len());
            let mut runtime_check = Vec::with_capacity(decl.params.len());
            for param in &decl.params {
                let mutated = passing::is_mutated(&decl.body, param.name);
                conventions.push(passing::convention(param, mutated));
                runtime_check.push(passing::needs_runtime_check(param));
            }
            callee_info.insert(
                decl.name,
                decl.params.iter().map(|p| p.by_ref).collect(),
            );
            signatures.insert(
                decl.name,
                Signature {
                    index: index as u16,
                    conventions,
                    runtime_check,
                },
            );
        }

        let mut functions = Vec::with_capacity(ast.functions.len());
        for decl in &ast.functions {
            let analysis = escape::analyze(decl, &callee_info);
            let func = FunctionCompiler::new(self, decl, &signatures, analysis).emit()?;
            verify_function(&func)?;
            functions.push(func);
        }

        let entry_name = self.options.entry.as_deref().unwrap_or("main");
        let entry_sym = self
            .interner
            .lookup(entry_name)
            .ok_or_else(|| CompileError::MissingEntry(entry_name.to_string()))?;
        let entry = signatures
            .get(&entry_sym)
            .map(|s| s.index as u32)
            .ok_or_else(|| CompileError::MissingEntry(entry_name.to_string()))?;

        Ok(Program::link(functions, entry)?)
    }

    fn name_of(&self, sym: SymbolId) -> String {
        self.interner
            .resolve(sym)
            .map(|s| s.to_string())
            .unwrap_or_else(|| format!("<sym {}>", sym.index()))
    }
}

/// Per-function emission state
struct FunctionCompiler<'a, 'b> {
    parent: &'b Compiler<'a>,
    decl: &'b FunctionDecl,
    signatures: &'b FxHashMap<SymbolId, Signature>,
    analysis: EscapeAnalysis,

    code: Vec<Instruction>,
    constants: vireo_vm_bytecode::ConstantPool,
    locals: IndexMap<SymbolId, u16>,
    scalar_slots: FxHashMap<(SymbolId, SymbolId), u16>,
    stack_structs: FxHashMap<SymbolId, NodeId>,
    exception_table: Vec<ExceptionEntry>,
    line_map: Vec<vireo_vm_bytecode::LineEntry>,
    last_line: u32,

    cur_stack: u16,
    max_stack: u16,
    site_counter: u16,
    movable_vars: FxHashMap<NodeId, bool>,
}

impl<'a, 'b> FunctionCompiler<'a, 'b> {
    fn new(
        parent: &'b Compiler<'a>,
        decl: &'b FunctionDecl,
        signatures: &'b FxHashMap<SymbolId, Signature>,
        analysis: EscapeAnalysis,
    ) -> Self {
        Self {
            parent,
            decl,
            signatures,
            analysis,
            code: Vec::new(),
            constants: vireo_vm_bytecode::ConstantPool::new(),
            locals: IndexMap::new(),
            scalar_slots: FxHashMap::default(),
            stack_structs: FxHashMap::default(),
            exception_table: Vec::new(),
            line_map: Vec::new(),
            last_line: 0,
            cur_stack: 0,
            max_stack: 0,
            site_counter: 0,
            movable_vars: FxHashMap::default(),
        }
    }

    fn emit(mut self) -> CompileResult<CompiledFunction> {
        // Parameters occupy the first local slots.
        for param in &self.decl.params {
            self.local_slot(param.name)?;
        }
        self.compute_movable_vars();

        let body: &[AstNode] = &self.decl.body;
        for stmt in body {
            self.stmt(stmt)?;
        }
        // Implicit null return closes every path.
        self.push_op(Instruction::plain(Opcode::RetNull));

        let mut params = Vec::with_capacity(self.decl.params.len());
        for param in &self.decl.params {
            let signature = &self.signatures[&self.decl.name];
            let i = params.len();
            let default = match &param.default {
                Some(node) => Some(self.literal_const(node)?),
                None => None,
            };
            params.push(ParamSpec {
                name: param.name,
                default,
                convention: signature.conventions[i],
            });
        }

        let local_count = self.locals.len() as u16;
        Ok(CompiledFunction {
            name: self.decl.name,
            code: self.code,
            constants: self.constants,
            local_count,
            max_stack: self.max_stack,
            params,
            is_variadic: self.decl.is_variadic,
            feedback_count: self.site_counter,
            stack_struct_bytes: self.analysis.frame_stack_bytes as u16,
            exception_table: self.exception_table,
            line_map: self.line_map,
        })
    }

    // ==================== Emission primitives ====================

    fn push_op(&mut self, instr: Instruction) {
        let (pops, pushes) = instr.stack_effect();
        debug_assert!(self.cur_stack >= pops, "operand stack underflow in emitter");
        self.cur_stack = self.cur_stack.saturating_sub(pops) + pushes;
        self.max_stack = self.max_stack.max(self.cur_stack);
        self.code.push(instr);
    }

    /// Emit a jump with a placeholder offset; returns the patch site.
    fn jump_placeholder(&mut self, op: Opcode) -> usize {
        let pc = self.code.len();
        self.push_op(Instruction::jump(op, 0));
        pc
    }

    /// Patch a recorded jump to land on `target`.
    fn patch_jump(&mut self, pc: usize, target: usize) -> CompileResult<()> {
        let offset = target as i64 - (pc as i64 + 1);
        let offset = i16::try_from(offset).map_err(|_| CompileError::JumpTooFar(pc))?;
        self.code[pc].a = offset as u16;
        Ok(())
    }

    fn here(&self) -> usize {
        self.code.len()
    }

    fn add_const(&mut self, constant: Constant) -> CompileResult<u16> {
        if self.constants.len() >= u16::MAX as usize {
            return Err(CompileError::TooManyConstants(
                self.parent.name_of(self.decl.name),
            ));
        }
        Ok(self.constants.add(constant))
    }

    fn name_const(&mut self, sym: SymbolId) -> CompileResult<u16> {
        self.add_const(Constant::Str(sym))
    }

    fn local_slot(&mut self, name: SymbolId) -> CompileResult<u16> {
        if let Some(&slot) = self.locals.get(&name) {
            return Ok(slot);
        }
        let slot = self.locals.len();
        if slot >= u16::MAX as usize {
            return Err(CompileError::TooManyLocals(
                self.parent.name_of(self.decl.name),
            ));
        }
        self.locals.insert(name, slot as u16);
        Ok(slot as u16)
    }

    /// Fresh anonymous slot (scalar-replaced fields)
    fn fresh_slot(&mut self, var: SymbolId, field: SymbolId) -> CompileResult<u16> {
        if let Some(&slot) = self.scalar_slots.get(&(var, field)) {
            return Ok(slot);
        }
        let slot = self.locals.len();
        if slot >= u16::MAX as usize {
            return Err(CompileError::TooManyLocals(
                self.parent.name_of(self.decl.name),
            ));
        }
        // Synthetic key: scalar slots never collide with named locals.
        let synthetic = SymbolId(u32::MAX - self.scalar_slots.len() as u32);
        self.locals.insert(synthetic, slot as u16);
        self.scalar_slots.insert((var, field), slot as u16);
        Ok(slot as u16)
    }

    fn next_site(&mut self) -> u16 {
        let site = self.site_counter;
        self.site_counter += 1;
        site
    }

    fn literal_const(&mut self, node: &AstNode) -> CompileResult<u16> {
        let constant = match node.kind {
            NodeKind::Null => Constant::Null,
            NodeKind::Bool(b) => Constant::Bool(b),
            NodeKind::Int(n) => Constant::Int(n),
            NodeKind::Float(f) => Constant::Float(f),
            NodeKind::Str(s) => Constant::Str(s),
            _ => {
                return Err(CompileError::NonLiteralDefault(
                    self.parent.name_of(self.decl.name),
                ));
            }
        };
        self.add_const(constant)
    }

    fn record_line(&mut self, node: &AstNode) {
        if node.loc.line != 0 && node.loc.line != self.last_line {
            self.last_line = node.loc.line;
            self.line_map.push(vireo_vm_bytecode::LineEntry {
                offset: self.here() as u32,
                line: node.loc.line,
            });
        }
    }

    /// Record the lexically last use of each variable outside loops, for
    /// the by-move passing decision.
    fn compute_movable_vars(&mut self) {
        let mut occurrences: FxHashMap<SymbolId, Vec<(NodeId, bool)>> = FxHashMap::default();
        fn walk(
            node: &AstNode,
            in_loop: bool,
            out: &mut FxHashMap<SymbolId, Vec<(NodeId, bool)>>,
        ) {
            if let NodeKind::Var(v) = node.kind {
                out.entry(v).or_default().push((node.id, in_loop));
            }
            let looping = in_loop || matches!(node.kind, NodeKind::While { .. });
            passing::for_each_child(node, &mut |child| walk(child, looping, out));
        }
        for stmt in &self.decl.body {
            walk(stmt, false, &mut occurrences);
        }
        for (_, uses) in occurrences {
            if let Some(&(last_id, in_loop)) = uses.last() {
                if !in_loop {
                    self.movable_vars.insert(last_id, true);
                }
            }
        }
    }

    // ==================== Statements ====================

    fn stmt(&mut self, node: &AstNode) -> CompileResult<()> {
        self.record_line(node);
        match &node.kind {
            NodeKind::ExprStmt(e) => self.expr_stmt(e),
            NodeKind::Block(stmts) => {
                for s in stmts {
                    self.stmt(s)?;
                }
                Ok(())
            }
            NodeKind::If { cond, then, els } => {
                self.expr(cond)?;
                let to_else = self.jump_placeholder(Opcode::Jz);
                for s in then {
                    self.stmt(s)?;
                }
                if els.is_empty() {
                    let target = self.here();
                    self.patch_jump(to_else, target)?;
                } else {
                    let to_end = self.jump_placeholder(Opcode::Jmp);
                    let else_start = self.here();
                    self.patch_jump(to_else, else_start)?;
                    for s in els {
                        self.stmt(s)?;
                    }
                    let target = self.here();
                    self.patch_jump(to_end, target)?;
                }
                Ok(())
            }
            NodeKind::While { cond, body } => {
                let loop_start = self.here();
                self.expr(cond)?;
                let to_end = self.jump_placeholder(Opcode::Jz);
                for s in body {
                    self.stmt(s)?;
                }
                // Safepoint on the back-edge.
                self.push_op(Instruction::plain(Opcode::CheckGc));
                let back = self.jump_placeholder(Opcode::Jmp);
                self.patch_jump(back, loop_start)?;
                let target = self.here();
                self.patch_jump(to_end, target)?;
                Ok(())
            }
            NodeKind::Return(value) => {
                match value {
                    Some(v) => {
                        self.expr(v)?;
                        self.push_op(Instruction::plain(Opcode::Ret));
                    }
                    None => self.push_op(Instruction::plain(Opcode::RetNull)),
                }
                Ok(())
            }
            NodeKind::Throw(value) => {
                self.expr(value)?;
                self.push_op(Instruction::plain(Opcode::Throw));
                Ok(())
            }
            NodeKind::TryCatch {
                body,
                catch_var,
                catch_class,
                handler,
            } => {
                let start = self.here();
                for s in body {
                    self.stmt(s)?;
                }
                let skip = self.jump_placeholder(Opcode::Jmp);
                let handler_pc = self.here();

                // The unwinder pushes the thrown value before entering.
                self.cur_stack += 1;
                self.max_stack = self.max_stack.max(self.cur_stack);
                let slot = self.local_slot(*catch_var)?;
                self.push_op(Instruction::with_a(Opcode::StoreLocal, slot));
                for s in handler {
                    self.stmt(s)?;
                }
                let end_target = self.here();
                self.patch_jump(skip, end_target)?;

                self.exception_table.push(ExceptionEntry {
                    start: start as u32,
                    end: skip as u32,
                    handler: handler_pc as u32,
                    class_name: *catch_class,
                });
                Ok(())
            }
            // Expression in statement position
            _ => self.expr_stmt(node),
        }
    }

    /// Statement-position expression: avoids result-value juggling for the
    /// store forms, otherwise evaluates and pops.
    fn expr_stmt(&mut self, node: &AstNode) -> CompileResult<()> {
        self.record_line(node);
        match &node.kind {
            NodeKind::Assign { name, value } => self.assign_no_result(*name, value),
            NodeKind::GlobalSet { name, value } => {
                self.expr(value)?;
                let idx = self.name_const(*name)?;
                self.push_op(Instruction::with_a(Opcode::StoreGlobal, idx));
                Ok(())
            }
            NodeKind::PropSet {
                object,
                name,
                value,
            } => self.prop_set(object, *name, value),
            NodeKind::IndexSet {
                array,
                index,
                value,
            } => {
                self.emit_container(array)?;
                self.expr(index)?;
                self.expr(value)?;
                self.push_op(Instruction::plain(Opcode::SetElem));
                Ok(())
            }
            NodeKind::ArrayAppend { array, value } => {
                self.emit_container(array)?;
                self.expr(value)?;
                self.push_op(Instruction::plain(Opcode::ArrayPush));
                Ok(())
            }
            _ => {
                self.expr(node)?;
                self.push_op(Instruction::plain(Opcode::Pop));
                Ok(())
            }
        }
    }

    /// `$name = value` without leaving the value on the stack.
    fn assign_no_result(&mut self, name: SymbolId, value: &AstNode) -> CompileResult<()> {
        // Binding a record allocation: the escape decision may dissolve it.
        if let NodeKind::StructLit { fields } = &value.kind {
            match self.analysis.decision(value.id) {
                AllocDecision::ScalarReplace => {
                    for (field, init) in fields {
                        self.expr(init)?;
                        let slot = self.fresh_slot(name, *field)?;
                        self.push_op(Instruction::with_a(Opcode::StoreLocal, slot));
                    }
                    return Ok(());
                }
                AllocDecision::Stack => {
                    self.emit_struct(value.id, fields, true)?;
                    // Static field offsets only hold while the variable is
                    // the record's sole binding.
                    if self.analysis.bindings.get(&value.id) == Some(&name) {
                        self.stack_structs.insert(name, value.id);
                    }
                    let slot = self.local_slot(name)?;
                    self.push_op(Instruction::with_a(Opcode::StoreLocal, slot));
                    return Ok(());
                }
                AllocDecision::Heap => {}
            }
        }
        self.expr(value)?;
        let slot = self.local_slot(name)?;
        self.push_op(Instruction::with_a(Opcode::StoreLocal, slot));
        Ok(())
    }

    fn prop_set(
        &mut self,
        object: &AstNode,
        name: SymbolId,
        value: &AstNode,
    ) -> CompileResult<()> {
        if let NodeKind::Var(var) = object.kind {
            // Scalar-replaced record: the field is a local slot.
            if let Some(&slot) = self.scalar_slots.get(&(var, name)) {
                self.expr(value)?;
                self.push_op(Instruction::with_a(Opcode::StoreLocal, slot));
                return Ok(());
            }
            // Stack record: static offset store.
            if let Some(offset) = self.struct_offset(var, name) {
                let slot = self.local_slot(var)?;
                self.push_op(Instruction::with_a(Opcode::PushLocal, slot));
                self.expr(value)?;
                self.push_op(Instruction::with_a(Opcode::SetField, offset));
                return Ok(());
            }
        }
        self.expr(object)?;
        self.expr(value)?;
        let idx = self.name_const(name)?;
        let site = self.next_site();
        self.push_op(Instruction::new(Opcode::SetPropIc, idx, site));
        Ok(())
    }

    /// Push a container for mutation. A variable container goes through
    /// CowCopy so the mutated value is exclusively owned (strings and
    /// arrays copy on write; objects keep identity semantics).
    fn emit_container(&mut self, node: &AstNode) -> CompileResult<()> {
        if let NodeKind::Var(var) = node.kind {
            let slot = self.local_slot(var)?;
            self.push_op(Instruction::with_a(Opcode::CowCopy, slot));
            return Ok(());
        }
        self.expr(node)
    }

    fn struct_offset(&self, var: SymbolId, field: SymbolId) -> Option<u16> {
        let site = self.stack_structs.get(&var)?;
        let fields = self.analysis.struct_fields.get(site)?;
        fields.iter().position(|f| *f == field).map(|i| i as u16)
    }

    /// Push name/value pairs and allocate a record. `on_stack` selects the
    /// frame-lifetime flavor (operand b carries the byte size).
    fn emit_struct(
        &mut self,
        site: NodeId,
        fields: &[(SymbolId, AstNode)],
        on_stack: bool,
    ) -> CompileResult<()> {
        for (field, init) in fields {
            let idx = self.name_const(*field)?;
            self.push_op(Instruction::with_a(Opcode::PushConst, idx));
            self.expr(init)?;
        }
        let size = if on_stack {
            let est = 16 + 16 * fields.len();
            debug_assert!(self.analysis.decision(site) == AllocDecision::Stack);
            est as u16
        } else {
            0
        };
        self.push_op(Instruction::new(
            Opcode::NewStruct,
            fields.len() as u16,
            size,
        ));
        Ok(())
    }

    // ==================== Expressions ====================

    /// Emit an expression; exactly one value is left on the stack.
    fn expr(&mut self, node: &AstNode) -> CompileResult<()> {
        match &node.kind {
            NodeKind::Null => {
                self.push_op(Instruction::plain(Opcode::PushNull));
            }
            NodeKind::Bool(true) => {
                self.push_op(Instruction::plain(Opcode::PushTrue));
            }
            NodeKind::Bool(false) => {
                self.push_op(Instruction::plain(Opcode::PushFalse));
            }
            NodeKind::Int(n) => {
                if let Ok(small) = i16::try_from(*n) {
                    self.push_op(Instruction::with_a(Opcode::PushInt, small as u16));
                } else {
                    let idx = self.add_const(Constant::Int(*n))?;
                    self.push_op(Instruction::with_a(Opcode::PushConst, idx));
                }
            }
            NodeKind::Float(f) => {
                let idx = self.add_const(Constant::Float(*f))?;
                self.push_op(Instruction::with_a(Opcode::PushConst, idx));
            }
            NodeKind::Str(s) => {
                let idx = self.add_const(Constant::Str(*s))?;
                self.push_op(Instruction::with_a(Opcode::PushConst, idx));
            }

            NodeKind::Var(name) => {
                let slot = self.local_slot(*name)?;
                self.push_op(Instruction::with_a(Opcode::PushLocal, slot));
            }
            NodeKind::Assign { name, value } => {
                self.expr(value)?;
                self.push_op(Instruction::plain(Opcode::Dup));
                let slot = self.local_slot(*name)?;
                self.push_op(Instruction::with_a(Opcode::StoreLocal, slot));
            }
            NodeKind::GlobalGet(name) => {
                let idx = self.name_const(*name)?;
                self.push_op(Instruction::with_a(Opcode::PushGlobal, idx));
            }
            NodeKind::GlobalSet { name, value } => {
                self.expr(value)?;
                self.push_op(Instruction::plain(Opcode::Dup));
                let idx = self.name_const(*name)?;
                self.push_op(Instruction::with_a(Opcode::StoreGlobal, idx));
            }

            NodeKind::Binary { op, lhs, rhs } => {
                self.expr(lhs)?;
                self.expr(rhs)?;
                self.binary_op(*op);
            }
            NodeKind::Unary { op, operand } => {
                self.expr(operand)?;
                match op {
                    UnaryOp::Neg => self.push_op(Instruction::plain(Opcode::Neg)),
                    UnaryOp::Not => self.push_op(Instruction::plain(Opcode::Not)),
                }
            }

            NodeKind::Call { callee, args } => self.call(*callee, args)?,
            NodeKind::CallValue { target, args } => {
                self.expr(target)?;
                for arg in args {
                    self.expr(arg)?;
                    // Closure signatures are dynamic: dispatch size at runtime.
                    self.push_op(Instruction::plain(Opcode::CowCheck));
                }
                self.push_op(Instruction::new(Opcode::CallValue, 0, args.len() as u16));
            }
            NodeKind::MethodCall {
                receiver,
                method,
                args,
            } => {
                self.expr(receiver)?;
                for arg in args {
                    self.expr(arg)?;
                }
                let idx = self.name_const(*method)?;
                self.push_op(Instruction::new(Opcode::CallMethod, idx, args.len() as u16));
            }

            NodeKind::New { class } => {
                let id = self.parent.options.classes.get(class).copied().ok_or_else(
                    || CompileError::UnknownClass(self.parent.name_of(*class)),
                )?;
                self.push_op(Instruction::with_a(Opcode::NewObj, id));
            }
            NodeKind::StructLit { fields } => {
                let on_stack = self.analysis.decision(node.id) == AllocDecision::Stack;
                self.emit_struct(node.id, fields, on_stack)?;
            }
            NodeKind::ArrayLit { elements } => {
                for element in elements {
                    self.expr(element)?;
                }
                self.push_op(Instruction::with_a(
                    Opcode::NewArray,
                    elements.len() as u16,
                ));
            }
            NodeKind::Closure { function, captures } => {
                let signature = self.signatures.get(function).ok_or_else(|| {
                    CompileError::UnknownClosureTarget(self.parent.name_of(*function))
                })?;
                let index = signature.index;
                for capture in captures {
                    let slot = self.local_slot(*capture)?;
                    self.push_op(Instruction::with_a(Opcode::PushLocal, slot));
                }
                self.push_op(Instruction::new(
                    Opcode::MakeClosure,
                    index,
                    captures.len() as u16,
                ));
            }

            NodeKind::PropGet { object, name } => {
                if let NodeKind::Var(var) = object.kind {
                    if let Some(&slot) = self.scalar_slots.get(&(var, *name)) {
                        self.push_op(Instruction::with_a(Opcode::PushLocal, slot));
                        return Ok(());
                    }
                    if let Some(offset) = self.struct_offset(var, *name) {
                        let slot = self.local_slot(var)?;
                        self.push_op(Instruction::with_a(Opcode::PushLocal, slot));
                        self.push_op(Instruction::with_a(Opcode::GetField, offset));
                        return Ok(());
                    }
                }
                self.expr(object)?;
                let idx = self.name_const(*name)?;
                let site = self.next_site();
                self.push_op(Instruction::new(Opcode::GetPropIc, idx, site));
            }
            NodeKind::PropSet {
                object,
                name,
                value,
            } => {
                // Expression position: keep the stored value as the result.
                self.expr(value)?;
                self.push_op(Instruction::plain(Opcode::Dup));
                self.expr(object)?;
                self.push_op(Instruction::plain(Opcode::Swap));
                let idx = self.name_const(*name)?;
                let site = self.next_site();
                self.push_op(Instruction::new(Opcode::SetPropIc, idx, site));
            }
            NodeKind::IndexGet { array, index } => {
                self.expr(array)?;
                self.expr(index)?;
                self.push_op(Instruction::plain(Opcode::GetElem));
            }
            NodeKind::IndexSet { .. } | NodeKind::ArrayAppend { .. } => {
                // Store forms in expression position: store, result is null.
                self.expr_stmt(node)?;
                self.push_op(Instruction::plain(Opcode::PushNull));
            }
            NodeKind::InstanceOf { object, class } => {
                self.expr(object)?;
                let id = self.parent.options.classes.get(class).copied().ok_or_else(
                    || CompileError::UnknownClass(self.parent.name_of(*class)),
                )?;
                self.push_op(Instruction::with_a(Opcode::InstanceOf, id));
            }
            NodeKind::Clone { operand } => {
                self.expr(operand)?;
                self.push_op(Instruction::plain(Opcode::CloneVal));
            }

            // Statement kinds have no value; evaluate and produce null so
            // expression positions stay balanced.
            _ => {
                self.stmt(node)?;
                self.push_op(Instruction::plain(Opcode::PushNull));
            }
        }
        Ok(())
    }

    fn binary_op(&mut self, op: BinaryOp) {
        match op {
            // Specializable arithmetic: a Nop patch slot precedes the
            // generic op so the runtime can install GUARD_* + typed variant.
            BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div => {
                let site = self.next_site();
                self.push_op(Instruction::plain(Opcode::Nop));
                let opcode = match op {
                    BinaryOp::Add => Opcode::AddAny,
                    BinaryOp::Sub => Opcode::SubAny,
                    BinaryOp::Mul => Opcode::MulAny,
                    _ => Opcode::DivAny,
                };
                self.push_op(Instruction::with_a(opcode, site));
            }
            BinaryOp::Mod => self.push_op(Instruction::with_a(Opcode::ModInt, 0)),
            BinaryOp::Concat => self.push_op(Instruction::plain(Opcode::Concat)),
            BinaryOp::Eq
            | BinaryOp::Neq
            | BinaryOp::Lt
            | BinaryOp::Le
            | BinaryOp::Gt
            | BinaryOp::Ge => {
                let site = self.next_site();
                let opcode = match op {
                    BinaryOp::Eq => Opcode::Eq,
                    BinaryOp::Neq => Opcode::Neq,
                    BinaryOp::Lt => Opcode::Lt,
                    BinaryOp::Le => Opcode::Le,
                    BinaryOp::Gt => Opcode::Gt,
                    _ => Opcode::Ge,
                };
                self.push_op(Instruction::with_a(opcode, site));
            }
            BinaryOp::Identical => self.push_op(Instruction::plain(Opcode::Identical)),
            BinaryOp::NotIdentical => {
                self.push_op(Instruction::plain(Opcode::NotIdentical));
            }
        }
    }

    /// Named call: user function (with PASS_* conventions) or builtin.
    fn call(&mut self, callee: SymbolId, args: &[AstNode]) -> CompileResult<()> {
        if let Some(signature) = self.signatures.get(&callee) {
            let index = signature.index;
            let conventions = signature.conventions.clone();
            let runtime_check = signature.runtime_check.clone();
            for (i, arg) in args.iter().enumerate() {
                self.expr(arg)?;
                self.emit_pass(&conventions, &runtime_check, i, arg, callee)?;
            }
            self.push_op(Instruction::new(Opcode::Call, index, args.len() as u16));
            return Ok(());
        }

        if let Some(&builtin) = self.parent.options.builtins.get(&callee) {
            for arg in args {
                self.expr(arg)?;
            }
            self.push_op(Instruction::new(
                Opcode::CallBuiltin,
                builtin,
                args.len() as u16,
            ));
            return Ok(());
        }

        Err(CompileError::UnknownFunction(self.parent.name_of(callee)))
    }

    fn emit_pass(
        &mut self,
        conventions: &[PassingConvention],
        runtime_check: &[bool],
        index: usize,
        arg: &AstNode,
        callee: SymbolId,
    ) -> CompileResult<()> {
        // Variadic extras are collected by the callee; no convention applies.
        let Some(&convention) = conventions.get(index) else {
            return Ok(());
        };

        match convention {
            PassingConvention::ByValue => {}
            PassingConvention::ByConstRef => {
                // Read-only share: the handle passes as a value.
                self.push_op(Instruction::plain(Opcode::PassByValue));
            }
            PassingConvention::ByMutRef => {
                let NodeKind::Var(var) = arg.kind else {
                    return Err(CompileError::ByRefNeedsVariable {
                        function: self.parent.name_of(callee),
                        index,
                    });
                };
                let slot = self.local_slot(var)?;
                self.push_op(Instruction::with_a(Opcode::PassByRef, slot));
            }
            PassingConvention::ByCow => {
                if runtime_check.get(index).copied().unwrap_or(false) {
                    self.push_op(Instruction::plain(Opcode::CowCheck));
                } else if let NodeKind::Var(var) = arg.kind {
                    // Last use of the variable: transfer instead of sharing.
                    if self.movable_vars.get(&arg.id).copied().unwrap_or(false) {
                        let slot = self.local_slot(var)?;
                        self.push_op(Instruction::with_a(Opcode::PassByMove, slot));
                    } else {
                        self.push_op(Instruction::plain(Opcode::PassByCow));
                    }
                } else {
                    self.push_op(Instruction::plain(Opcode::PassByCow));
                }
            }
            PassingConvention::ByMove => {
                if let NodeKind::Var(var) = arg.kind {
                    let slot = self.local_slot(var)?;
                    self.push_op(Instruction::with_a(Opcode::PassByMove, slot));
                } else {
                    self.push_op(Instruction::plain(Opcode::PassByCow));
                }
            }
        }
        Ok(())
    }
}
