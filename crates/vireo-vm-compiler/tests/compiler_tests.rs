//! Integration tests: AST in, verified bytecode out

use proptest::prelude::*;
use rustc_hash::FxHashMap;

use vireo_vm_bytecode::{Interner, Opcode, SymbolId};
use vireo_vm_compiler::ast::{
    AstNode, AstProgram, BinaryOp, FunctionDecl, NodeKind, ParamDecl, SourceLoc, TypeHint,
};
use vireo_vm_compiler::{CompileError, CompileOptions, Compiler};

/// Tiny AST builder with a running node-id counter
struct Builder {
    next: u32,
}

impl Builder {
    fn new() -> Self {
        Self { next: 1 }
    }

    fn node(&mut self, kind: NodeKind) -> AstNode {
        let id = self.next;
        self.next += 1;
        AstNode::new(id, kind)
    }

    fn int(&mut self, n: i64) -> AstNode {
        self.node(NodeKind::Int(n))
    }

    fn var(&mut self, sym: SymbolId) -> AstNode {
        self.node(NodeKind::Var(sym))
    }

    fn assign(&mut self, sym: SymbolId, value: AstNode) -> AstNode {
        let inner = self.node(NodeKind::Assign {
            name: sym,
            value: Box::new(value),
        });
        self.node(NodeKind::ExprStmt(Box::new(inner)))
    }

    fn binary(&mut self, op: BinaryOp, lhs: AstNode, rhs: AstNode) -> AstNode {
        self.node(NodeKind::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        })
    }
}

fn decl(name: SymbolId, params: Vec<ParamDecl>, body: Vec<AstNode>) -> FunctionDecl {
    FunctionDecl {
        name,
        params,
        is_variadic: false,
        body,
        loc: SourceLoc::default(),
    }
}

fn compile_single(
    interner: &Interner,
    func: FunctionDecl,
) -> Result<vireo_vm_bytecode::Program, CompileError> {
    let entry = interner.resolve(func.name).unwrap().to_string();
    let compiler = Compiler::new(
        interner,
        CompileOptions {
            entry: Some(entry),
            ..CompileOptions::default()
        },
    );
    compiler.compile(&AstProgram {
        functions: vec![func],
    })
}

/// Sum loop: $sum = 0; $i = 1; while ($i <= 100) { $sum = $sum + $i; $i = $i + 1; } return $sum;
#[test]
fn test_sum_loop_compiles() {
    let interner = Interner::new();
    let main = interner.intern("main");
    let sum = interner.intern("sum");
    let i = interner.intern("i");

    let mut b = Builder::new();
    let body = vec![
        {
            let zero = b.int(0);
            b.assign(sum, zero)
        },
        {
            let one = b.int(1);
            b.assign(i, one)
        },
        {
            let cond = {
                let iv = b.var(i);
                let hundred = b.int(100);
                b.binary(BinaryOp::Le, iv, hundred)
            };
            let body = vec![
                {
                    let add = {
                        let s = b.var(sum);
                        let iv = b.var(i);
                        b.binary(BinaryOp::Add, s, iv)
                    };
                    b.assign(sum, add)
                },
                {
                    let inc = {
                        let iv = b.var(i);
                        let one = b.int(1);
                        b.binary(BinaryOp::Add, iv, one)
                    };
                    b.assign(i, inc)
                },
            ];
            b.node(NodeKind::While {
                cond: Box::new(cond),
                body,
            })
        },
        {
            let s = b.var(sum);
            b.node(NodeKind::Return(Some(Box::new(s))))
        },
    ];

    let program = compile_single(&interner, decl(main, Vec::new(), body)).unwrap();
    let func = program.entry_function().unwrap();

    // Generic arithmetic sites each carry a Nop patch slot before them.
    let add_sites = func
        .code
        .iter()
        .filter(|ins| ins.op == Opcode::AddAny)
        .count();
    assert_eq!(add_sites, 2);
    for (pc, ins) in func.code.iter().enumerate() {
        if ins.op == Opcode::AddAny {
            assert_eq!(func.code[pc - 1].op, Opcode::Nop);
        }
    }

    // The loop back-edge carries a safepoint.
    assert!(func.code.iter().any(|ins| ins.op == Opcode::CheckGc));
    // Feedback sites: one comparison + two additions.
    assert_eq!(func.feedback_count, 3);
    assert_eq!(func.local_count, 2);
}

/// Local pair read through fields only: no allocation opcode survives.
#[test]
fn test_scalar_replacement_removes_allocation() {
    let interner = Interner::new();
    let main = interner.intern("f");
    let p = interner.intern("p");
    let fa = interner.intern("a");
    let fb = interner.intern("b");

    let mut b = Builder::new();
    let body = vec![
        {
            let one = b.int(1);
            let two = b.int(2);
            let lit = b.node(NodeKind::StructLit {
                fields: vec![(fa, one), (fb, two)],
            });
            b.assign(p, lit)
        },
        {
            let left = {
                let pv = b.var(p);
                b.node(NodeKind::PropGet {
                    object: Box::new(pv),
                    name: fa,
                })
            };
            let right = {
                let pv = b.var(p);
                b.node(NodeKind::PropGet {
                    object: Box::new(pv),
                    name: fb,
                })
            };
            let add = b.binary(BinaryOp::Add, left, right);
            b.node(NodeKind::Return(Some(Box::new(add))))
        },
    ];

    let program = compile_single(&interner, decl(main, Vec::new(), body)).unwrap();
    let func = program.entry_function().unwrap();

    // The allocation dissolved into locals.
    assert!(
        !func
            .code
            .iter()
            .any(|ins| matches!(ins.op, Opcode::NewStruct | Opcode::NewObj))
    );
    // Two scalar field slots.
    assert_eq!(func.local_count, 2);
    assert!(
        !func
            .code
            .iter()
            .any(|ins| matches!(ins.op, Opcode::GetPropIc | Opcode::GetProp))
    );
}

/// A record that escapes through the return keeps its allocation.
#[test]
fn test_escaping_struct_keeps_allocation() {
    let interner = Interner::new();
    let main = interner.intern("g");
    let fa = interner.intern("a");

    let mut b = Builder::new();
    let body = vec![{
        let one = b.int(1);
        let lit = b.node(NodeKind::StructLit {
            fields: vec![(fa, one)],
        });
        b.node(NodeKind::Return(Some(Box::new(lit))))
    }];

    let program = compile_single(&interner, decl(main, Vec::new(), body)).unwrap();
    let func = program.entry_function().unwrap();
    assert!(func.code.iter().any(|ins| ins.op == Opcode::NewStruct));
}

/// COW parameters get PASS opcodes at the call site; the lexically last use
/// of a variable upgrades to a move.
#[test]
fn test_pass_conventions_at_call_site() {
    let interner = Interner::new();
    let main = interner.intern("main");
    let callee = interner.intern("consume");
    let s = interner.intern("s");
    let text = interner.intern("text");

    let mut b = Builder::new();

    // function consume($text /* string, mutated */) { $text = "x"; }
    let consume_body = vec![{
        let lit = b.node(NodeKind::Str(interner.intern("x")));
        b.assign(text, lit)
    }];
    let consume = decl(
        callee,
        vec![ParamDecl {
            name: text,
            default: None,
            by_ref: false,
            hint: TypeHint::Str,
        }],
        consume_body,
    );

    // function main() { $s = "hello"; consume($s); consume($s); }
    let main_body = vec![
        {
            let lit = b.node(NodeKind::Str(interner.intern("hello")));
            b.assign(s, lit)
        },
        {
            let arg = b.var(s);
            let call = b.node(NodeKind::Call {
                callee,
                args: vec![arg],
            });
            b.node(NodeKind::ExprStmt(Box::new(call)))
        },
        {
            let arg = b.var(s);
            let call = b.node(NodeKind::Call {
                callee,
                args: vec![arg],
            });
            b.node(NodeKind::ExprStmt(Box::new(call)))
        },
    ];
    let main_fn = decl(main, Vec::new(), main_body);

    let compiler = Compiler::new(
        &interner,
        CompileOptions {
            entry: Some("main".into()),
            ..CompileOptions::default()
        },
    );
    let program = compiler
        .compile(&AstProgram {
            functions: vec![main_fn, consume],
        })
        .unwrap();
    let func = program.entry_function().unwrap();

    // First call shares by COW, the second (last use) moves.
    let passes: Vec<Opcode> = func
        .code
        .iter()
        .filter(|ins| matches!(ins.op, Opcode::PassByCow | Opcode::PassByMove))
        .map(|ins| ins.op)
        .collect();
    assert_eq!(passes, vec![Opcode::PassByCow, Opcode::PassByMove]);
}

#[test]
fn test_by_ref_requires_variable() {
    let interner = Interner::new();
    let main = interner.intern("main");
    let callee = interner.intern("bump");
    let n = interner.intern("n");

    let mut b = Builder::new();
    let bump = decl(
        callee,
        vec![ParamDecl {
            name: n,
            default: None,
            by_ref: true,
            hint: TypeHint::Int,
        }],
        Vec::new(),
    );
    let main_body = vec![{
        let arg = b.int(3);
        let call = b.node(NodeKind::Call {
            callee,
            args: vec![arg],
        });
        b.node(NodeKind::ExprStmt(Box::new(call)))
    }];
    let main_fn = decl(main, Vec::new(), main_body);

    let compiler = Compiler::new(
        &interner,
        CompileOptions {
            entry: Some("main".into()),
            ..CompileOptions::default()
        },
    );
    let result = compiler.compile(&AstProgram {
        functions: vec![main_fn, bump],
    });
    assert!(matches!(
        result,
        Err(CompileError::ByRefNeedsVariable { index: 0, .. })
    ));
}

#[test]
fn test_try_catch_exception_table() {
    let interner = Interner::new();
    let main = interner.intern("main");
    let e = interner.intern("e");

    let mut b = Builder::new();
    let body = vec![{
        let thrown = b.node(NodeKind::Str(interner.intern("boom")));
        let throw = b.node(NodeKind::Throw(Box::new(thrown)));
        let handler_ret = {
            let ev = b.var(e);
            b.node(NodeKind::Return(Some(Box::new(ev))))
        };
        b.node(NodeKind::TryCatch {
            body: vec![throw],
            catch_var: e,
            catch_class: None,
            handler: vec![handler_ret],
        })
    }];

    let program = compile_single(&interner, decl(main, Vec::new(), body)).unwrap();
    let func = program.entry_function().unwrap();

    assert_eq!(func.exception_table.len(), 1);
    let entry = &func.exception_table[0];
    assert!(entry.start < entry.end);
    assert!(entry.handler >= entry.end);
    // Handler binds the caught value first.
    assert_eq!(func.code[entry.handler as usize].op, Opcode::StoreLocal);
}

#[test]
fn test_unknown_function_rejected() {
    let interner = Interner::new();
    let main = interner.intern("main");
    let ghost = interner.intern("ghost");

    let mut b = Builder::new();
    let body = vec![{
        let call = b.node(NodeKind::Call {
            callee: ghost,
            args: Vec::new(),
        });
        b.node(NodeKind::ExprStmt(Box::new(call)))
    }];

    let result = compile_single(&interner, decl(main, Vec::new(), body));
    assert!(matches!(result, Err(CompileError::UnknownFunction(_))));
}

#[test]
fn test_builtin_call() {
    let interner = Interner::new();
    let main = interner.intern("main");
    let print = interner.intern("print");

    let mut builtins = FxHashMap::default();
    builtins.insert(print, 7u16);

    let mut b = Builder::new();
    let body = vec![{
        let arg = b.node(NodeKind::Str(interner.intern("hi")));
        let call = b.node(NodeKind::Call {
            callee: print,
            args: vec![arg],
        });
        b.node(NodeKind::ExprStmt(Box::new(call)))
    }];

    let compiler = Compiler::new(
        &interner,
        CompileOptions {
            entry: Some("main".into()),
            builtins,
            ..CompileOptions::default()
        },
    );
    let program = compiler
        .compile(&AstProgram {
            functions: vec![decl(main, Vec::new(), body)],
        })
        .unwrap();
    let func = program.entry_function().unwrap();
    assert!(
        func.code
            .iter()
            .any(|ins| ins.op == Opcode::CallBuiltin && ins.a == 7)
    );
}

proptest! {
    /// Any integer literal return compiles to verified bytecode.
    #[test]
    fn prop_return_int_compiles(n in any::<i64>()) {
        let interner = Interner::new();
        let main = interner.intern("main");
        let mut b = Builder::new();
        let body = vec![{
            let lit = b.int(n);
            b.node(NodeKind::Return(Some(Box::new(lit))))
        }];
        let program = compile_single(&interner, decl(main, Vec::new(), body)).unwrap();
        let func = program.entry_function().unwrap();
        prop_assert!(func.max_stack >= 1);
        prop_assert!(func.code.len() >= 2);
    }
}
