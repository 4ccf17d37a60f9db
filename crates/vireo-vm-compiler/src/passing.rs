//! Parameter-passing conventions
//!
//! Conventions are fixed at compile time from a parameter's size category
//! and mutability:
//!
//! | Size | Mutability | Convention |
//! |---|---|---|
//! | <= 8 bytes primitive | any | by-value |
//! | aggregate | read-only | by-const-ref |
//! | string / array | read-write | by-COW |
//! | declared `&$param` | read-write | by-mut-ref |
//! | dynamic size | write | by-move if last use, else by-COW |
//!
//! Statically unknown sizes get a runtime `CowCheck` at the call site
//! instead of a fixed PASS opcode.

use vireo_vm_bytecode::{PassingConvention, SymbolId};

use crate::ast::{AstNode, NodeKind, ParamDecl, TypeHint};

/// Decide the passing convention for a declared parameter.
///
/// `mutated` reports whether the function body writes through the parameter
/// (reassignment, property/element stores).
pub fn convention(param: &ParamDecl, mutated: bool) -> PassingConvention {
    if param.by_ref {
        return PassingConvention::ByMutRef;
    }
    match param.hint {
        // Primitive payloads fit in the value itself
        TypeHint::Int | TypeHint::Float | TypeHint::Bool => PassingConvention::ByValue,
        // Objects share their handle; identity semantics
        TypeHint::Object => PassingConvention::ByValue,
        TypeHint::Str | TypeHint::Array => {
            if mutated {
                PassingConvention::ByCow
            } else {
                PassingConvention::ByConstRef
            }
        }
        // Unknown size: the call site dispatches at runtime
        TypeHint::Mixed => PassingConvention::ByCow,
    }
}

/// Does this parameter need a runtime size dispatch (CowCheck) instead of a
/// statically chosen PASS opcode?
pub fn needs_runtime_check(param: &ParamDecl) -> bool {
    !param.by_ref && param.hint == TypeHint::Mixed
}

/// Scan a function body for writes through a parameter.
pub fn is_mutated(body: &[AstNode], param: SymbolId) -> bool {
    body.iter().any(|node| node_mutates(node, param))
}

fn node_mutates(node: &AstNode, param: SymbolId) -> bool {
    let is_param_var = |n: &AstNode| matches!(n.kind, NodeKind::Var(v) if v == param);

    let direct = match &node.kind {
        NodeKind::Assign { name, .. } => *name == param,
        NodeKind::PropSet { object, .. } => is_param_var(object),
        NodeKind::IndexSet { array, .. } => is_param_var(array),
        NodeKind::ArrayAppend { array, .. } => is_param_var(array),
        _ => false,
    };
    if direct {
        return true;
    }

    let mut found = false;
    for_each_child(node, &mut |child| {
        if !found && node_mutates(child, param) {
            found = true;
        }
    });
    found
}

/// Visit the direct children of a node
pub(crate) fn for_each_child<'a>(node: &'a AstNode, f: &mut dyn FnMut(&'a AstNode)) {
    match &node.kind {
        NodeKind::Null
        | NodeKind::Bool(_)
        | NodeKind::Int(_)
        | NodeKind::Float(_)
        | NodeKind::Str(_)
        | NodeKind::Var(_)
        | NodeKind::GlobalGet(_)
        | NodeKind::New { .. }
        | NodeKind::Closure { .. } => {}

        NodeKind::Assign { value, .. } | NodeKind::GlobalSet { value, .. } => f(value),
        NodeKind::Binary { lhs, rhs, .. } => {
            f(lhs);
            f(rhs);
        }
        NodeKind::Unary { operand, .. } => f(operand),
        NodeKind::Call { args, .. } => args.iter().for_each(f),
        NodeKind::CallValue { target, args } => {
            f(target);
            args.iter().for_each(f);
        }
        NodeKind::MethodCall { receiver, args, .. } => {
            f(receiver);
            args.iter().for_each(f);
        }
        NodeKind::StructLit { fields } => fields.iter().for_each(|(_, init)| f(init)),
        NodeKind::ArrayLit { elements } => elements.iter().for_each(f),
        NodeKind::PropGet { object, .. } => f(object),
        NodeKind::PropSet { object, value, .. } => {
            f(object);
            f(value);
        }
        NodeKind::IndexGet { array, index } => {
            f(array);
            f(index);
        }
        NodeKind::IndexSet {
            array,
            index,
            value,
        } => {
            f(array);
            f(index);
            f(value);
        }
        NodeKind::ArrayAppend { array, value } => {
            f(array);
            f(value);
        }
        NodeKind::InstanceOf { object, .. } => f(object),
        NodeKind::Clone { operand } => f(operand),
        NodeKind::ExprStmt(e) => f(e),
        NodeKind::Block(stmts) => stmts.iter().for_each(f),
        NodeKind::If { cond, then, els } => {
            f(cond);
            then.iter().for_each(&mut *f);
            els.iter().for_each(f);
        }
        NodeKind::While { cond, body } => {
            f(cond);
            body.iter().for_each(f);
        }
        NodeKind::Return(value) => {
            if let Some(v) = value {
                f(v);
            }
        }
        NodeKind::Throw(value) => f(value),
        NodeKind::TryCatch { body, handler, .. } => {
            body.iter().for_each(&mut *f);
            handler.iter().for_each(f);
        }
    }
}

/// Does the variable appear anywhere in the given nodes?
pub(crate) fn uses_var(nodes: &[AstNode], var: SymbolId) -> bool {
    nodes.iter().any(|n| node_uses_var(n, var))
}

fn node_uses_var(node: &AstNode, var: SymbolId) -> bool {
    if matches!(node.kind, NodeKind::Var(v) if v == var) {
        return true;
    }
    if matches!(&node.kind, NodeKind::Closure { captures, .. } if captures.contains(&var)) {
        return true;
    }
    let mut found = false;
    for_each_child(node, &mut |child| {
        if !found && node_uses_var(child, var) {
            found = true;
        }
    });
    found
}
