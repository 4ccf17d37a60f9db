//! Escape analysis
//!
//! Builds a data-flow view of a function body: which allocation sites can
//! flow into which locals, which sites are stored into containers, captured,
//! thrown, returned, or passed out through calls. Escape states form the
//! lattice
//!
//! ```text
//! NoEscape  ⊑  ArgEscape  ⊑  GlobalEscape
//! ```
//!
//! with `Unknown` as bottom; merging takes the supremum. Allocations start
//! at `NoEscape`; anything reachable from a return value, a global store, a
//! closure capture, an unknown call, a thrown value, or a by-reference
//! argument is `GlobalEscape`; arguments to known calls are at least
//! `ArgEscape`.
//!
//! Two decisions fall out per fixed-shape record allocation:
//!
//! - **Stack allocation**: `NoEscape`, estimated size <= 256 bytes, and the
//!   frame's 4096-byte stack-allocation budget not exhausted
//! - **Scalar replacement**: additionally, the record is bound to exactly one
//!   local and every access is a statically resolvable field read or write;
//!   the allocation disappears and each field becomes a fresh local slot

use rustc_hash::{FxHashMap, FxHashSet};
use vireo_vm_bytecode::SymbolId;

use crate::ast::{AstNode, FunctionDecl, NodeId, NodeKind};

/// Maximum estimated object size eligible for stack allocation
pub const STACK_ALLOC_MAX_BYTES: usize = 256;

/// Per-frame budget for stack-allocated records
pub const FRAME_STACK_BUDGET: usize = 4096;

/// Escape lattice state
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EscapeState {
    /// Bottom: not yet observed
    Unknown,
    /// Lifetime bounded by the creating frame
    NoEscape,
    /// May outlive the frame through a callee
    ArgEscape,
    /// Reachable from globals, returns, captures, or unknown code
    GlobalEscape,
}

impl EscapeState {
    /// Lattice join (supremum)
    pub fn join(self, other: Self) -> Self {
        self.max(other)
    }
}

/// Storage decision for an allocation site
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocDecision {
    /// Ordinary heap allocation
    Heap,
    /// Frame-lifetime record (NewStruct)
    Stack,
    /// Allocation eliminated; fields demoted to locals
    ScalarReplace,
}

/// Analysis results for one function
#[derive(Debug, Default)]
pub struct EscapeAnalysis {
    /// Escape state per allocation site
    pub states: FxHashMap<NodeId, EscapeState>,
    /// Storage decision per allocation site
    pub decisions: FxHashMap<NodeId, AllocDecision>,
    /// Field layout of each record allocation site
    pub struct_fields: FxHashMap<NodeId, Vec<SymbolId>>,
    /// Sole local binding of a record site, when one exists
    pub bindings: FxHashMap<NodeId, SymbolId>,
    /// Bytes of frame stack-allocation budget consumed
    pub frame_stack_bytes: usize,
}

impl EscapeAnalysis {
    /// Decision for a site, defaulting to heap
    pub fn decision(&self, id: NodeId) -> AllocDecision {
        self.decisions.get(&id).copied().unwrap_or(AllocDecision::Heap)
    }
}

/// Callee information the analysis needs: by-ref flags per declared function
pub type CalleeInfo = FxHashMap<SymbolId, Vec<bool>>;

struct Analyzer<'a> {
    callees: &'a CalleeInfo,
    states: FxHashMap<NodeId, EscapeState>,
    var_flows: FxHashMap<SymbolId, FxHashSet<NodeId>>,
    edges: Vec<(NodeId, NodeId)>,
    scalar_blocked: FxHashSet<NodeId>,
    bindings: FxHashMap<NodeId, Option<SymbolId>>,
    struct_fields: FxHashMap<NodeId, Vec<SymbolId>>,
    field_uses: FxHashMap<NodeId, FxHashSet<SymbolId>>,
    changed: bool,
}

type Flows = FxHashSet<NodeId>;

/// Analyze one function
pub fn analyze(func: &FunctionDecl, callees: &CalleeInfo) -> EscapeAnalysis {
    let mut a = Analyzer {
        callees,
        states: FxHashMap::default(),
        var_flows: FxHashMap::default(),
        edges: Vec::new(),
        scalar_blocked: FxHashSet::default(),
        bindings: FxHashMap::default(),
        struct_fields: FxHashMap::default(),
        field_uses: FxHashMap::default(),
        changed: true,
    };

    // Worklist fixed point: loop bodies can flow allocations backwards, so
    // re-walk until the var-flow and state maps stabilize.
    let mut rounds = 0;
    while a.changed && rounds < 8 {
        a.changed = false;
        a.edges.clear();
        for stmt in &func.body {
            a.stmt(stmt);
        }
        rounds += 1;
    }

    // Propagate states along container edges: a value stored in a container
    // escapes at least as far as the container.
    let mut moved = true;
    while moved {
        moved = false;
        for &(container, child) in &a.edges {
            let cs = a.state(container);
            let old = a.state(child);
            let joined = old.join(cs);
            if joined != old {
                a.states.insert(child, joined);
                moved = true;
            }
        }
    }

    // Decide storage per record site under the frame budget.
    let mut result = EscapeAnalysis {
        states: a.states.clone(),
        ..EscapeAnalysis::default()
    };
    let mut budget = 0usize;

    let mut sites: Vec<NodeId> = a.struct_fields.keys().copied().collect();
    sites.sort_by_key(|id| id.0);
    for site in sites {
        let fields = a.struct_fields[&site].clone();
        let state = a.state(site);
        let est_size = 16 + 16 * fields.len();

        let bound_var = a.bindings.get(&site).copied().flatten();
        let fields_resolved = a
            .field_uses
            .get(&site)
            .map(|used| used.iter().all(|f| fields.contains(f)))
            .unwrap_or(true);
        let scalar_ok = state <= EscapeState::NoEscape
            && !a.scalar_blocked.contains(&site)
            && bound_var.is_some()
            && fields_resolved;

        let decision = if scalar_ok {
            AllocDecision::ScalarReplace
        } else if state <= EscapeState::NoEscape
            && est_size <= STACK_ALLOC_MAX_BYTES
            && budget + est_size <= FRAME_STACK_BUDGET
        {
            budget += est_size;
            AllocDecision::Stack
        } else {
            AllocDecision::Heap
        };

        result.decisions.insert(site, decision);
        result.struct_fields.insert(site, fields);
        if let Some(var) = bound_var {
            result.bindings.insert(site, var);
        }
    }
    result.frame_stack_bytes = budget;
    result
}

impl Analyzer<'_> {
    fn state(&self, id: NodeId) -> EscapeState {
        self.states.get(&id).copied().unwrap_or(EscapeState::NoEscape)
    }

    fn escalate(&mut self, flows: &Flows, to: EscapeState) {
        for &id in flows {
            let old = self.state(id);
            let joined = old.join(to);
            if joined != old {
                self.states.insert(id, joined);
                self.changed = true;
            }
        }
    }

    fn block_scalar(&mut self, flows: &Flows) {
        for &id in flows {
            if self.scalar_blocked.insert(id) {
                self.changed = true;
            }
        }
    }

    fn flow_into_var(&mut self, name: SymbolId, flows: &Flows) {
        let set = self.var_flows.entry(name).or_default();
        for &id in flows {
            if set.insert(id) {
                self.changed = true;
            }
        }
    }

    fn stmt(&mut self, node: &AstNode) {
        match &node.kind {
            NodeKind::ExprStmt(e) => {
                self.expr(e, false);
            }
            NodeKind::Block(stmts) => {
                for s in stmts {
                    self.stmt(s);
                }
            }
            NodeKind::If { cond, then, els } => {
                let f = self.expr(cond, false);
                self.block_scalar(&f);
                for s in then {
                    self.stmt(s);
                }
                for s in els {
                    self.stmt(s);
                }
            }
            NodeKind::While { cond, body } => {
                let f = self.expr(cond, false);
                self.block_scalar(&f);
                for s in body {
                    self.stmt(s);
                }
            }
            NodeKind::Return(value) => {
                if let Some(v) = value {
                    let f = self.expr(v, false);
                    self.escalate(&f, EscapeState::GlobalEscape);
                }
            }
            NodeKind::Throw(value) => {
                let f = self.expr(value, false);
                self.escalate(&f, EscapeState::GlobalEscape);
            }
            NodeKind::TryCatch { body, handler, .. } => {
                for s in body {
                    self.stmt(s);
                }
                for s in handler {
                    self.stmt(s);
                }
            }
            // Expressions in statement position
            _ => {
                self.expr(node, false);
            }
        }
    }

    fn expr(&mut self, node: &AstNode, as_field_base: bool) -> Flows {
        match &node.kind {
            NodeKind::Null
            | NodeKind::Bool(_)
            | NodeKind::Int(_)
            | NodeKind::Float(_)
            | NodeKind::Str(_)
            | NodeKind::GlobalGet(_) => Flows::default(),

            NodeKind::Var(name) => {
                let flows: Flows = self.var_flows.get(name).cloned().unwrap_or_default();
                if !as_field_base {
                    // The record leaks out of plain field accesses: indexing,
                    // arithmetic, argument positions all disqualify scalars.
                    self.block_scalar(&flows);
                }
                flows
            }

            NodeKind::Assign { name, value } => {
                let flows = self.expr(value, false);
                // Direct binding of a fresh allocation to a local; flowing
                // through a second variable aliases it instead.
                if value.is_allocation() {
                    let entry = self.bindings.entry(value.id).or_insert(Some(*name));
                    if *entry != Some(*name) {
                        *entry = None;
                    }
                } else {
                    self.block_scalar(&flows);
                }
                self.flow_into_var(*name, &flows);
                flows
            }

            NodeKind::GlobalSet { value, .. } => {
                let f = self.expr(value, false);
                self.escalate(&f, EscapeState::GlobalEscape);
                f
            }

            NodeKind::Binary { lhs, rhs, .. } => {
                let l = self.expr(lhs, false);
                let r = self.expr(rhs, false);
                self.block_scalar(&l);
                self.block_scalar(&r);
                Flows::default()
            }
            NodeKind::Unary { operand, .. } => {
                let f = self.expr(operand, false);
                self.block_scalar(&f);
                Flows::default()
            }

            NodeKind::Call { callee, args } => {
                let by_ref = self.callees.get(callee).cloned();
                for (i, arg) in args.iter().enumerate() {
                    let f = self.expr(arg, false);
                    let state = match &by_ref {
                        // By-reference argument or unknown callee: global
                        Some(flags) if flags.get(i).copied().unwrap_or(false) => {
                            EscapeState::GlobalEscape
                        }
                        Some(_) => EscapeState::ArgEscape,
                        None => EscapeState::GlobalEscape,
                    };
                    self.escalate(&f, state);
                }
                Flows::default()
            }
            NodeKind::CallValue { target, args } => {
                let t = self.expr(target, false);
                self.escalate(&t, EscapeState::GlobalEscape);
                for arg in args {
                    let f = self.expr(arg, false);
                    self.escalate(&f, EscapeState::GlobalEscape);
                }
                Flows::default()
            }
            NodeKind::MethodCall { receiver, args, .. } => {
                let r = self.expr(receiver, false);
                self.escalate(&r, EscapeState::GlobalEscape);
                for arg in args {
                    let f = self.expr(arg, false);
                    self.escalate(&f, EscapeState::GlobalEscape);
                }
                Flows::default()
            }

            NodeKind::New { .. } => {
                self.states.entry(node.id).or_insert(EscapeState::NoEscape);
                Flows::from_iter([node.id])
            }
            NodeKind::StructLit { fields } => {
                self.states.entry(node.id).or_insert(EscapeState::NoEscape);
                let names: Vec<SymbolId> = fields.iter().map(|(n, _)| *n).collect();
                self.struct_fields.insert(node.id, names);
                for (_, init) in fields {
                    let f = self.expr(init, false);
                    self.block_scalar(&f);
                    for &child in &f {
                        self.edges.push((node.id, child));
                    }
                }
                Flows::from_iter([node.id])
            }
            NodeKind::ArrayLit { elements } => {
                self.states.entry(node.id).or_insert(EscapeState::NoEscape);
                for element in elements {
                    let f = self.expr(element, false);
                    self.block_scalar(&f);
                    for &child in &f {
                        self.edges.push((node.id, child));
                    }
                }
                Flows::from_iter([node.id])
            }
            NodeKind::Closure { captures, .. } => {
                self.states.entry(node.id).or_insert(EscapeState::NoEscape);
                for capture in captures {
                    let flows: Flows =
                        self.var_flows.get(capture).cloned().unwrap_or_default();
                    self.escalate(&flows, EscapeState::GlobalEscape);
                    self.block_scalar(&flows);
                }
                Flows::from_iter([node.id])
            }

            NodeKind::PropGet { object, name } => {
                let base = self.expr(object, true);
                for &id in &base {
                    self.field_uses.entry(id).or_default().insert(*name);
                }
                Flows::default()
            }
            NodeKind::PropSet {
                object,
                name,
                value,
            } => {
                let base = self.expr(object, true);
                for &id in &base {
                    self.field_uses.entry(id).or_default().insert(*name);
                }
                let f = self.expr(value, false);
                self.block_scalar(&f);
                for &container in &base {
                    for &child in &f {
                        self.edges.push((container, child));
                    }
                }
                f
            }
            NodeKind::IndexGet { array, index } => {
                let a = self.expr(array, false);
                self.block_scalar(&a);
                self.expr(index, false);
                Flows::default()
            }
            NodeKind::IndexSet {
                array,
                index,
                value,
            } => {
                let a = self.expr(array, false);
                self.expr(index, false);
                let f = self.expr(value, false);
                self.block_scalar(&f);
                for &container in &a {
                    for &child in &f {
                        self.edges.push((container, child));
                    }
                }
                f
            }
            NodeKind::ArrayAppend { array, value } => {
                let a = self.expr(array, false);
                let f = self.expr(value, false);
                self.block_scalar(&f);
                for &container in &a {
                    for &child in &f {
                        self.edges.push((container, child));
                    }
                }
                f
            }
            NodeKind::InstanceOf { object, .. } => {
                self.expr(object, false);
                Flows::default()
            }
            NodeKind::Clone { operand } => {
                self.expr(operand, false);
                Flows::default()
            }

            // Statement kinds reached through expression positions
            _ => {
                self.stmt(node);
                Flows::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{AstNode, FunctionDecl, NodeKind, SourceLoc};

    fn sym(n: u32) -> SymbolId {
        SymbolId(n)
    }

    fn func(body: Vec<AstNode>) -> FunctionDecl {
        FunctionDecl {
            name: sym(0),
            params: Vec::new(),
            is_variadic: false,
            body,
            loc: SourceLoc::default(),
        }
    }

    /// $p = {a: 1, b: 2}; return $p->a + $p->b;  -> scalar-replaced
    #[test]
    fn test_local_pair_scalar_replaced() {
        let pair = AstNode::new(
            1,
            NodeKind::StructLit {
                fields: vec![
                    (sym(10), AstNode::new(2, NodeKind::Int(1))),
                    (sym(11), AstNode::new(3, NodeKind::Int(2))),
                ],
            },
        );
        let body = vec![
            AstNode::new(
                4,
                NodeKind::ExprStmt(Box::new(AstNode::new(
                    5,
                    NodeKind::Assign {
                        name: sym(20),
                        value: Box::new(pair),
                    },
                ))),
            ),
            AstNode::new(
                6,
                NodeKind::Return(Some(Box::new(AstNode::new(
                    7,
                    NodeKind::Binary {
                        op: crate::ast::BinaryOp::Add,
                        lhs: Box::new(AstNode::new(
                            8,
                            NodeKind::PropGet {
                                object: Box::new(AstNode::new(9, NodeKind::Var(sym(20)))),
                                name: sym(10),
                            },
                        )),
                        rhs: Box::new(AstNode::new(
                            10,
                            NodeKind::PropGet {
                                object: Box::new(AstNode::new(11, NodeKind::Var(sym(20)))),
                                name: sym(11),
                            },
                        )),
                    },
                )))),
            ),
        ];

        let analysis = analyze(&func(body), &CalleeInfo::default());
        assert_eq!(analysis.decision(NodeId(1)), AllocDecision::ScalarReplace);
        assert_eq!(
            analysis.states.get(&NodeId(1)),
            Some(&EscapeState::NoEscape)
        );
    }

    /// return {a: 1};  -> the record escapes through the return value
    #[test]
    fn test_returned_struct_escapes() {
        let lit = AstNode::new(
            1,
            NodeKind::StructLit {
                fields: vec![(sym(10), AstNode::new(2, NodeKind::Int(1)))],
            },
        );
        let body = vec![AstNode::new(3, NodeKind::Return(Some(Box::new(lit))))];

        let analysis = analyze(&func(body), &CalleeInfo::default());
        assert_eq!(
            analysis.states.get(&NodeId(1)),
            Some(&EscapeState::GlobalEscape)
        );
        assert_eq!(analysis.decision(NodeId(1)), AllocDecision::Heap);
    }

    /// $p = {...}; f($p);  -> known callee: ArgEscape (still heap-allocated)
    #[test]
    fn test_arg_to_known_callee() {
        let mut callees = CalleeInfo::default();
        callees.insert(sym(50), vec![false]);

        let body = vec![
            AstNode::new(
                1,
                NodeKind::ExprStmt(Box::new(AstNode::new(
                    2,
                    NodeKind::Assign {
                        name: sym(20),
                        value: Box::new(AstNode::new(
                            3,
                            NodeKind::StructLit {
                                fields: vec![(sym(10), AstNode::new(4, NodeKind::Int(1)))],
                            },
                        )),
                    },
                ))),
            ),
            AstNode::new(
                5,
                NodeKind::ExprStmt(Box::new(AstNode::new(
                    6,
                    NodeKind::Call {
                        callee: sym(50),
                        args: vec![AstNode::new(7, NodeKind::Var(sym(20)))],
                    },
                ))),
            ),
        ];

        let analysis = analyze(&func(body.clone()), &CalleeInfo::default());
        // Unknown callee (not in the map we passed): global escape
        assert_eq!(
            analysis.states.get(&NodeId(3)),
            Some(&EscapeState::GlobalEscape)
        );

        let analysis = analyze(&func(body), &callees);
        assert_eq!(
            analysis.states.get(&NodeId(3)),
            Some(&EscapeState::ArgEscape)
        );
        assert_eq!(analysis.decision(NodeId(3)), AllocDecision::Heap);
    }

    /// Capturing a record in a closure escapes it
    #[test]
    fn test_closure_capture_escapes() {
        let body = vec![
            AstNode::new(
                1,
                NodeKind::ExprStmt(Box::new(AstNode::new(
                    2,
                    NodeKind::Assign {
                        name: sym(20),
                        value: Box::new(AstNode::new(
                            3,
                            NodeKind::StructLit {
                                fields: vec![(sym(10), AstNode::new(4, NodeKind::Int(1)))],
                            },
                        )),
                    },
                ))),
            ),
            AstNode::new(
                5,
                NodeKind::ExprStmt(Box::new(AstNode::new(
                    6,
                    NodeKind::Closure {
                        function: sym(60),
                        captures: vec![sym(20)],
                    },
                ))),
            ),
        ];

        let analysis = analyze(&func(body), &CalleeInfo::default());
        assert_eq!(
            analysis.states.get(&NodeId(3)),
            Some(&EscapeState::GlobalEscape)
        );
    }

    #[test]
    fn test_lattice_join() {
        assert_eq!(
            EscapeState::NoEscape.join(EscapeState::ArgEscape),
            EscapeState::ArgEscape
        );
        assert_eq!(
            EscapeState::GlobalEscape.join(EscapeState::Unknown),
            EscapeState::GlobalEscape
        );
    }
}
