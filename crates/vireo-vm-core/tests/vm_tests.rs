//! End-to-end scenarios: compiled programs through the full runtime

use std::sync::Arc;

use vireo_vm_bytecode::{Interner, Opcode, SymbolId};
use vireo_vm_compiler::ast::{
    AstNode, AstProgram, BinaryOp, FunctionDecl, NodeKind, ParamDecl, SourceLoc, TypeHint,
};
use vireo_vm_compiler::{CompileOptions, Compiler};
use vireo_vm_core::{
    Classification, DiagnosticKind, HeapData, Value, ValueTag, Vm, VmConfig, VmError,
};

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

    fn ret(&mut self, value: AstNode) -> AstNode {
        self.node(NodeKind::Return(Some(Box::new(value))))
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

fn param(name: SymbolId, hint: TypeHint, by_ref: bool) -> ParamDecl {
    ParamDecl {
        name,
        default: None,
        by_ref,
        hint,
    }
}

/// Compile and load a program into a fresh VM sharing the interner.
fn vm_with(interner: Arc<Interner>, functions: Vec<FunctionDecl>, entry: &str) -> Vm {
    let mut vm = Vm::with_interner(Arc::clone(&interner), VmConfig::default());
    let compiler = Compiler::new(
        &interner,
        CompileOptions {
            entry: Some(entry.to_string()),
            builtins: vm.builtin_table(),
            classes: vm.class_table(),
        },
    );
    let program = compiler.compile(&AstProgram { functions }).unwrap();
    vm.load(Arc::new(program)).unwrap();
    vm
}

/// The sum loop reaches 5050, the addition site goes
/// monomorphic-int, and the specializer installs a GUARD_INT in front of
/// the typed op once observations reach the threshold.
#[test]
fn test_sum_loop_specializes() {
    let interner = Arc::new(Interner::new());
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
            let loop_body = vec![
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
                body: loop_body,
            })
        },
        {
            let s = b.var(sum);
            b.ret(s)
        },
    ];

    let mut vm = vm_with(Arc::clone(&interner), vec![decl(main, Vec::new(), body)], "main");
    let result = vm.run(&[]).unwrap();
    assert_eq!(result, Value::Int(5050));

    // Site 0 is the comparison, 1 and 2 the additions; both addition sites
    // ran 100 times on ints and are monomorphic.
    assert_eq!(
        vm.site_classification(0, 1),
        Some(Classification::Monomorphic(ValueTag::Int))
    );
    let mut guards = 0;
    let mut typed_adds = 0;
    for pc in 0..200 {
        match vm.code_at(0, pc) {
            Some(Opcode::GuardInt) => guards += 1,
            Some(Opcode::AddInt) => typed_adds += 1,
            Some(_) => {}
            None => break,
        }
    }
    assert_eq!(guards, 2, "both addition sites should be specialized");
    assert_eq!(typed_adds, 2);
}

/// A specialized site fed a float deoptimizes exactly
/// once, reverts to the generic opcode, clears feedback, and produces the
/// result the generic path would have produced all along.
#[test]
fn test_deoptimization_reverts_site() {
    let interner = Arc::new(Interner::new());
    let addf = interner.intern("addf");
    let a = interner.intern("a");
    let bsym = interner.intern("b");

    let mut b = Builder::new();
    let body = vec![{
        let lhs = b.var(a);
        let rhs = b.var(bsym);
        let sum = b.binary(BinaryOp::Add, lhs, rhs);
        b.ret(sum)
    }];
    let func = decl(
        addf,
        vec![
            param(a, TypeHint::Mixed, false),
            param(bsym, TypeHint::Mixed, false),
        ],
        body,
    );

    let mut vm = vm_with(Arc::clone(&interner), vec![func], "addf");

    // Warm up to the specialization threshold with ints.
    for n in 0..100 {
        let r = vm.run_function(0, &[Value::Int(n), Value::Int(1)]).unwrap();
        assert_eq!(r, Value::Int(n + 1));
    }
    let guard_pc = (0..100).find(|&pc| vm.code_at(0, pc) == Some(Opcode::GuardInt));
    assert!(guard_pc.is_some(), "site should be specialized after warmup");

    // A float operand fails the guard: the site deoptimizes and the result
    // matches the generic path.
    let r = vm
        .run_function(0, &[Value::Float(1.5), Value::Float(2.0)])
        .unwrap();
    assert_eq!(r, Value::Float(3.5));

    let pc = guard_pc.unwrap();
    assert_eq!(vm.code_at(0, pc), Some(Opcode::Nop));
    assert_eq!(vm.code_at(0, pc + 1), Some(Opcode::AddAny));
    // Feedback was cleared; only the post-deopt float pair is recorded.
    assert_eq!(
        vm.site_classification(0, 0),
        Some(Classification::Monomorphic(ValueTag::Float))
    );

    // Subsequent executions use the generic path correctly.
    let r = vm.run_function(0, &[Value::Int(2), Value::Int(3)]).unwrap();
    assert_eq!(r, Value::Int(5));
}

/// The local pair is scalar-replaced; execution yields 3
/// with no allocation opcode in the compiled body.
#[test]
fn test_scalar_replaced_pair_runs() {
    let interner = Arc::new(Interner::new());
    let main = interner.intern("main");
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
            let sum = b.binary(BinaryOp::Add, left, right);
            b.ret(sum)
        },
    ];

    let mut vm = vm_with(Arc::clone(&interner), vec![decl(main, Vec::new(), body)], "main");
    let program_has_alloc = (0..200).any(|pc| {
        matches!(
            vm.code_at(0, pc),
            Some(Opcode::NewStruct) | Some(Opcode::NewObj)
        )
    });
    assert!(!program_has_alloc);

    let result = vm.run(&[]).unwrap();
    assert_eq!(result, Value::Int(3));
}

/// `$t = $s` shares the string; writing one byte of `$t` copies,
/// leaving `$s` untouched.
#[test]
fn test_cow_string_share_and_mutate() {
    let interner = Arc::new(Interner::new());
    let main = interner.intern("main");
    let s = interner.intern("s");
    let t = interner.intern("t");
    let long = "a".repeat(100);
    let long_sym = interner.intern(&long);
    let x_sym = interner.intern("x");
    let sep = interner.intern("|");

    let mut b = Builder::new();
    let body = vec![
        // $s = "aaa..." . "" (concat forces a heap string)
        {
            let lit = b.node(NodeKind::Str(long_sym));
            let empty = b.node(NodeKind::Str(interner.intern("")));
            let concat = b.binary(BinaryOp::Concat, lit, empty);
            b.assign(s, concat)
        },
        // $t = $s
        {
            let sv = b.var(s);
            b.assign(t, sv)
        },
        // $t[0] = "x"
        {
            let tv = b.var(t);
            let zero = b.int(0);
            let x = b.node(NodeKind::Str(x_sym));
            let set = b.node(NodeKind::IndexSet {
                array: Box::new(tv),
                index: Box::new(zero),
                value: Box::new(x),
            });
            b.node(NodeKind::ExprStmt(Box::new(set)))
        },
        // return $s . "|" . $t
        {
            let sv = b.var(s);
            let sep_lit = b.node(NodeKind::Str(sep));
            let left = b.binary(BinaryOp::Concat, sv, sep_lit);
            let tv = b.var(t);
            let both = b.binary(BinaryOp::Concat, left, tv);
            b.ret(both)
        },
    ];

    let mut vm = vm_with(Arc::clone(&interner), vec![decl(main, Vec::new(), body)], "main");
    let result = vm.run(&[]).unwrap();

    let Value::Str(h) = result else {
        panic!("expected string result");
    };
    let text = match vm.memory.heap().get(h) {
        Some(HeapData::Str(sv)) => sv.to_display(),
        _ => panic!("missing payload"),
    };
    let mut expected = "a".repeat(100);
    expected.push('|');
    expected.push('x');
    expected.push_str(&"a".repeat(99));
    assert_eq!(text, expected);
}

/// Division by zero yields the IEEE sentinel and a recoverable warning,
/// never a fatal error.
#[test]
fn test_division_by_zero_sentinel() {
    let interner = Arc::new(Interner::new());
    let main = interner.intern("main");

    let mut b = Builder::new();
    let body = vec![{
        let one = b.int(1);
        let zero = b.int(0);
        let div = b.binary(BinaryOp::Div, one, zero);
        b.ret(div)
    }];

    let mut vm = vm_with(Arc::clone(&interner), vec![decl(main, Vec::new(), body)], "main");
    let result = vm.run(&[]).unwrap();
    assert_eq!(result, Value::Float(f64::INFINITY));
    assert!(
        vm.diagnostics
            .entries()
            .iter()
            .any(|d| d.kind == DiagnosticKind::DivisionByZero)
    );
}

/// Integer addition wraps modulo 2^64 at the boundaries.
#[test]
fn test_int_add_wraps() {
    let interner = Arc::new(Interner::new());
    let main = interner.intern("main");
    let x = interner.intern("x");

    let mut b = Builder::new();
    let body = vec![
        {
            let max = b.int(i64::MAX);
            b.assign(x, max)
        },
        {
            let xv = b.var(x);
            let one = b.int(1);
            let sum = b.binary(BinaryOp::Add, xv, one);
            b.ret(sum)
        },
    ];

    let mut vm = vm_with(Arc::clone(&interner), vec![decl(main, Vec::new(), body)], "main");
    let result = vm.run(&[]).unwrap();
    assert_eq!(result, Value::Int(i64::MIN));
}

/// Throw/catch through the exception table; the handler binds the value.
#[test]
fn test_throw_and_catch() {
    let interner = Arc::new(Interner::new());
    let main = interner.intern("main");
    let e = interner.intern("e");
    let boom = interner.intern("boom");

    let mut b = Builder::new();
    let body = vec![{
        let thrown = b.node(NodeKind::Str(boom));
        let throw = b.node(NodeKind::Throw(Box::new(thrown)));
        let handler = {
            let ev = b.var(e);
            b.ret(ev)
        };
        b.node(NodeKind::TryCatch {
            body: vec![throw],
            catch_var: e,
            catch_class: None,
            handler: vec![handler],
        })
    }];

    let mut vm = vm_with(Arc::clone(&interner), vec![decl(main, Vec::new(), body)], "main");
    let result = vm.run(&[]).unwrap();
    assert_eq!(result, Value::InternedStr(boom));
}

/// An uncaught throw surfaces as a Throw error with message and trace.
#[test]
fn test_uncaught_throw_surfaces() {
    let interner = Arc::new(Interner::new());
    let main = interner.intern("main");
    let boom = interner.intern("kaboom");

    let mut b = Builder::new();
    let body = vec![{
        let thrown = b.node(NodeKind::Str(boom));
        b.node(NodeKind::Throw(Box::new(thrown)))
    }];

    let mut vm = vm_with(Arc::clone(&interner), vec![decl(main, Vec::new(), body)], "main");
    match vm.run(&[]) {
        Err(VmError::Throw(thrown)) => {
            assert_eq!(thrown.message, "kaboom");
        }
        other => panic!("expected uncaught throw, got {other:?}"),
    }
}

/// By-reference parameters copy out into the caller's variable.
#[test]
fn test_by_ref_parameter_writes_back() {
    let interner = Arc::new(Interner::new());
    let main = interner.intern("main");
    let bump = interner.intern("bump");
    let n = interner.intern("n");
    let x = interner.intern("x");

    let mut b = Builder::new();
    let bump_fn = decl(
        bump,
        vec![param(n, TypeHint::Int, true)],
        vec![{
            let nv = b.var(n);
            let one = b.int(1);
            let sum = b.binary(BinaryOp::Add, nv, one);
            b.assign(n, sum)
        }],
    );

    let main_fn = decl(
        main,
        Vec::new(),
        vec![
            {
                let one = b.int(41);
                b.assign(x, one)
            },
            {
                let arg = b.var(x);
                let call = b.node(NodeKind::Call {
                    callee: bump,
                    args: vec![arg],
                });
                b.node(NodeKind::ExprStmt(Box::new(call)))
            },
            {
                let xv = b.var(x);
                b.ret(xv)
            },
        ],
    );

    let mut vm = vm_with(Arc::clone(&interner), vec![main_fn, bump_fn], "main");
    let result = vm.run(&[]).unwrap();
    assert_eq!(result, Value::Int(42));
}

/// A COW array parameter mutated in the callee leaves the caller's array
/// unchanged.
#[test]
fn test_cow_array_parameter_isolated() {
    let interner = Arc::new(Interner::new());
    let main = interner.intern("main");
    let poke = interner.intern("poke");
    let arr = interner.intern("arr");
    let a = interner.intern("a");

    let mut b = Builder::new();
    let poke_fn = decl(
        poke,
        vec![param(a, TypeHint::Array, false)],
        vec![{
            let av = b.var(a);
            let zero = b.int(0);
            let ninety_nine = b.int(99);
            let set = b.node(NodeKind::IndexSet {
                array: Box::new(av),
                index: Box::new(zero),
                value: Box::new(ninety_nine),
            });
            b.node(NodeKind::ExprStmt(Box::new(set)))
        }],
    );

    let main_fn = decl(
        main,
        Vec::new(),
        vec![
            {
                let one = b.int(1);
                let two = b.int(2);
                let lit = b.node(NodeKind::ArrayLit {
                    elements: vec![one, two],
                });
                b.assign(arr, lit)
            },
            {
                let av = b.var(arr);
                let call = b.node(NodeKind::Call {
                    callee: poke,
                    args: vec![av],
                });
                b.node(NodeKind::ExprStmt(Box::new(call)))
            },
            {
                let av = b.var(arr);
                let zero = b.int(0);
                let get = b.node(NodeKind::IndexGet {
                    array: Box::new(av),
                    index: Box::new(zero),
                });
                b.ret(get)
            },
        ],
    );

    let mut vm = vm_with(Arc::clone(&interner), vec![main_fn, poke_fn], "main");
    let result = vm.run(&[]).unwrap();
    assert_eq!(result, Value::Int(1));
}

/// Array element insertion past the end grows the array, null-filling the
/// gap.
#[test]
fn test_array_growth_null_fills() {
    let interner = Arc::new(Interner::new());
    let main = interner.intern("main");
    let arr = interner.intern("arr");

    let mut b = Builder::new();
    let body = vec![
        {
            let one = b.int(1);
            let lit = b.node(NodeKind::ArrayLit {
                elements: vec![one],
            });
            b.assign(arr, lit)
        },
        {
            let av = b.var(arr);
            let five = b.int(5);
            let seven = b.int(7);
            let set = b.node(NodeKind::IndexSet {
                array: Box::new(av),
                index: Box::new(five),
                value: Box::new(seven),
            });
            b.node(NodeKind::ExprStmt(Box::new(set)))
        },
        {
            let av = b.var(arr);
            let three = b.int(3);
            let get = b.node(NodeKind::IndexGet {
                array: Box::new(av),
                index: Box::new(three),
            });
            b.ret(get)
        },
    ];

    let mut vm = vm_with(Arc::clone(&interner), vec![decl(main, Vec::new(), body)], "main");
    let result = vm.run(&[]).unwrap();
    assert_eq!(result, Value::Null);
}

/// Registered builtins are callable from compiled code.
#[test]
fn test_builtin_roundtrip() {
    let interner = Arc::new(Interner::new());
    let main = interner.intern("main");
    let strlen = interner.intern("strlen");
    let hello = interner.intern("hello");

    let mut vm = Vm::with_interner(Arc::clone(&interner), VmConfig::default());
    vm.register_builtin(
        "strlen",
        1,
        1,
        Arc::new(|ctx, args| {
            let len = match args[0] {
                Value::InternedStr(sym) => ctx
                    .memory
                    .interner()
                    .resolve(sym)
                    .map(|s| s.len())
                    .unwrap_or(0),
                Value::Str(h) => match ctx.memory.heap().get(h) {
                    Some(HeapData::Str(s)) => s.len(),
                    _ => 0,
                },
                _ => 0,
            };
            Ok(Value::Int(len as i64))
        }),
    );

    let mut b = Builder::new();
    let body = vec![{
        let arg = b.node(NodeKind::Str(hello));
        let call = b.node(NodeKind::Call {
            callee: strlen,
            args: vec![arg],
        });
        b.ret(call)
    }];

    let compiler = Compiler::new(
        &interner,
        CompileOptions {
            entry: Some("main".to_string()),
            builtins: vm.builtin_table(),
            classes: vm.class_table(),
        },
    );
    let program = compiler
        .compile(&AstProgram {
            functions: vec![decl(main, Vec::new(), body)],
        })
        .unwrap();
    vm.load(Arc::new(program)).unwrap();

    let result = vm.run(&[]).unwrap();
    assert_eq!(result, Value::Int(5));
}

/// Cancellation is observed at the first safepoint.
#[test]
fn test_cancellation() {
    let interner = Arc::new(Interner::new());
    let main = interner.intern("main");

    let mut b = Builder::new();
    let body = vec![{
        let one = b.int(1);
        b.ret(one)
    }];

    let mut vm = vm_with(Arc::clone(&interner), vec![decl(main, Vec::new(), body)], "main");
    vm.cancel_signal().store(true, std::sync::atomic::Ordering::Relaxed);
    match vm.run(&[]) {
        Err(VmError::Cancelled) => {}
        other => panic!("expected cancellation, got {other:?}"),
    }
}

/// Closures capture locals by value and run through CallValue.
#[test]
fn test_closure_capture_and_call() {
    let interner = Arc::new(Interner::new());
    let main = interner.intern("main");
    let adder = interner.intern("adder");
    let n = interner.intern("n");
    let base = interner.intern("base");
    let f = interner.intern("f");

    let mut b = Builder::new();
    // function adder($n, $base) { return $n + $base; }  ($base is the capture)
    let adder_fn = decl(
        adder,
        vec![
            param(n, TypeHint::Int, false),
            param(base, TypeHint::Int, false),
        ],
        vec![{
            let nv = b.var(n);
            let bv = b.var(base);
            let sum = b.binary(BinaryOp::Add, nv, bv);
            b.ret(sum)
        }],
    );

    let main_fn = decl(
        main,
        Vec::new(),
        vec![
            {
                let ten = b.int(10);
                b.assign(base, ten)
            },
            {
                let closure = b.node(NodeKind::Closure {
                    function: adder,
                    captures: vec![base],
                });
                b.assign(f, closure)
            },
            {
                let fv = b.var(f);
                let five = b.int(5);
                let call = b.node(NodeKind::CallValue {
                    target: Box::new(fv),
                    args: vec![five],
                });
                b.ret(call)
            },
        ],
    );

    let mut vm = vm_with(Arc::clone(&interner), vec![main_fn, adder_fn], "main");
    let result = vm.run(&[]).unwrap();
    assert_eq!(result, Value::Int(15));
}

/// Nursery promotion through the VM's memory manager: survivors age and
/// reach the old generation after two minor collections; everything else is
/// reclaimed and the nursery is empty afterwards.
#[test]
fn test_nursery_promotion_lifecycle() {
    let mut vm = Vm::new(VmConfig::default());

    let mut kept = Vec::new();
    for i in 0..9_000 {
        let value = vm
            .memory
            .alloc_string(&format!("object {i}"), &[])
            .unwrap();
        if i % 3 == 0 {
            vm.memory.add_root(value).unwrap();
            kept.push(value);
        } else {
            vm.memory.release_value(value);
        }
    }

    vm.memory.heap_mut().collect_minor(&[]);
    vm.memory.heap_mut().collect_minor(&[]);

    for value in &kept {
        let h = value.handle().unwrap();
        let header = vm.memory.heap().header(h).unwrap();
        assert!(header.age >= 2 || header.is_mature());
        assert!(header.is_mature(), "survivors promote at age 2");
    }
    // Nursery free space equals its full size: the live set moved out.
    assert_eq!(vm.memory.heap().nursery_used(), 0);
}

/// Cross-generational store through the write barrier: the card is dirty
/// before the barrier returns and the young target survives the next minor
/// collection.
#[test]
fn test_cross_generational_store() {
    let mut vm = Vm::new(VmConfig::default());

    let old = {
        let data = HeapData::Array(vireo_vm_core::VmArray::new(vec![Value::Null]));
        let h = vm.memory.heap_mut().alloc_old(data, 64).unwrap();
        vm.memory.heap_mut().add_root(h);
        h
    };
    let young = vm.memory.alloc_string("young target", &[]).unwrap();
    let young_h = young.handle().unwrap();

    // Store the young reference into the old object; our count transfers
    // to the edge.
    if let Some(HeapData::Array(a)) = vm.memory.heap_mut().get_mut(old) {
        let (elements, _) = a.prepare_write();
        elements[0] = young;
    }
    vm.memory.write_barrier(old, young);

    let offset = vm.memory.heap().header(old).unwrap().offset;
    assert!(vm.memory.heap().card_is_dirty(offset));

    vm.memory.heap_mut().collect_minor(&[]);
    assert!(vm.memory.heap().is_live(young_h));
}

/// Request bracket: begin/end with no allocation is a no-op modulo the id
/// counter; unescaped allocations die at end_request.
#[test]
fn test_request_bracket_invariants() {
    let mut vm = Vm::new(VmConfig::default());

    let id1 = vm.memory.begin_request();
    vm.memory.end_request();
    let id2 = vm.memory.begin_request();
    assert_eq!(id2, id1 + 1);

    let temp = vm.memory.alloc_string("per-request", &[]).unwrap();
    let kept = vm.memory.alloc_string("survivor", &[]).unwrap();
    vm.memory.mark_escape(kept);
    vm.memory.end_request();

    assert!(!vm.memory.heap().is_live(temp.handle().unwrap()));
    assert!(vm.memory.heap().is_live(kept.handle().unwrap()));
}
