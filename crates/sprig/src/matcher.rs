//! Pattern-match destructuring.
//!
//! Given a pattern, a value, and a target frame, either bind every
//! identifier in the pattern and report success, or report failure with no
//! binding taking effect. Bindings are collected first and committed only
//! after the whole pattern matched.
//!
//! Function-argument evaluation folds into matching: with
//! [`MatchFlags::EVAL_NODES`] each matched node is evaluated in the
//! caller's environment before the pattern element sees it.

use bitflags::bitflags;

use crate::{
    env::{SymbolRecord, define_symbol},
    errors::EvalResult,
    eval::eval,
    heap::{Cons, HeapData, HeapId},
    intern::{StaticSyms, SymId},
    value::{ListIter, Value, deep_eq},
    vm::Vm,
};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MatchFlags: u8 {
        /// Bound identifiers become read-only symbols.
        const READ_ONLY = 1 << 0;
        /// Evaluate each matched node in the current environment before
        /// binding; this is how closure calls evaluate their arguments.
        const EVAL_NODES = 1 << 1;
    }
}

/// Matches `pattern` against `value`, binding into `target`.
///
/// Returns `Ok(false)` on a plain mismatch; errors from node evaluation
/// and double definitions propagate. On mismatch nothing is defined.
pub(crate) fn match_bind(
    vm: &mut Vm,
    pattern: Value,
    value: Value,
    target: HeapId,
    flags: MatchFlags,
) -> EvalResult<bool> {
    let mark = vm.heap.root_mark();
    let mut binds: Vec<(SymId, Value)> = Vec::new();
    let matched = match_top(vm, pattern, value, flags, &mut binds);
    let out = match matched {
        Ok(true) => {
            let read_only = flags.contains(MatchFlags::READ_ONLY);
            let mut committed = Ok(true);
            for (sym, bound) in binds {
                if let Err(err) = define_symbol(vm, target, sym, SymbolRecord::plain(bound, read_only)) {
                    committed = Err(err);
                    break;
                }
            }
            committed
        }
        other => other,
    };
    vm.heap.root_truncate(mark);
    out
}

fn match_top(
    vm: &mut Vm,
    pattern: Value,
    value: Value,
    flags: MatchFlags,
    binds: &mut Vec<(SymId, Value)>,
) -> EvalResult<bool> {
    if flags.contains(MatchFlags::EVAL_NODES) {
        // The whole match value is a node list: a bare identifier pattern
        // takes the evaluated elements as a list, and list patterns match
        // node by node.
        match pattern {
            Value::Sym(sym) if sym != SymId::from(StaticSyms::Underscore) => {
                let evaluated = eval_elements(vm, value)?;
                binds.push((sym, evaluated));
                Ok(true)
            }
            Value::Sym(_) => Ok(true),
            _ => match_list(vm, pattern, value, flags, binds),
        }
    } else {
        match_value(vm, pattern, value, binds)
    }
}

/// One pattern element against one node. Under EVAL_NODES the node is
/// evaluated first and the element matches the result structurally.
fn match_node(
    vm: &mut Vm,
    pattern: Value,
    node: Value,
    flags: MatchFlags,
    binds: &mut Vec<(SymId, Value)>,
) -> EvalResult<bool> {
    let value = if flags.contains(MatchFlags::EVAL_NODES) {
        let evaluated = eval(vm, node)?;
        vm.heap.root(evaluated);
        evaluated
    } else {
        node
    };
    match_value(vm, pattern, value, binds)
}

/// Structural match, no evaluation.
fn match_value(
    vm: &mut Vm,
    pattern: Value,
    value: Value,
    binds: &mut Vec<(SymId, Value)>,
) -> EvalResult<bool> {
    match pattern {
        Value::Sym(sym) if sym == SymId::from(StaticSyms::Underscore) => Ok(true),
        Value::Sym(sym) => {
            binds.push((sym, value));
            Ok(true)
        }
        Value::Nil => Ok(value.is_nil()),
        Value::Int(_) | Value::Double(_) | Value::Bool(_) => Ok(pattern.equiv(value)),
        Value::Ref(id) => match vm.heap.get(id) {
            HeapData::Cons(_) => match_list(vm, pattern, value, MatchFlags::empty(), binds),
            _ => Ok(deep_eq(&vm.heap, pattern, value)),
        },
        _ => Ok(deep_eq(&vm.heap, pattern, value)),
    }
}

/// List pattern: `:`-headed patterns match improperly (the last element
/// takes the remaining tail); otherwise element-wise with equal length.
fn match_list(
    vm: &mut Vm,
    pattern: Value,
    value: Value,
    flags: MatchFlags,
    binds: &mut Vec<(SymId, Value)>,
) -> EvalResult<bool> {
    let mut pats: Vec<Value> = ListIter::new(&vm.heap, pattern).collect();
    let improper = matches!(
        pats.first(),
        Some(Value::Sym(sym)) if *sym == SymId::from(StaticSyms::Colon)
    );
    if improper {
        pats.remove(0);
        if pats.is_empty() {
            return Ok(false);
        }
    }

    let mut rest = value;
    let fixed = if improper { pats.len() - 1 } else { pats.len() };
    for &pat in &pats[..fixed] {
        let Value::Ref(id) = rest else { return Ok(false) };
        let HeapData::Cons(Cons { car, cdr, .. }) = vm.heap.get(id) else {
            return Ok(false);
        };
        let (car, cdr) = (*car, *cdr);
        if !match_node(vm, pat, car, flags, binds)? {
            return Ok(false);
        }
        rest = cdr;
    }

    if improper {
        let tail_pat = pats[fixed];
        let tail = if flags.contains(MatchFlags::EVAL_NODES) {
            let evaluated = eval_elements(vm, rest)?;
            vm.heap.root(evaluated);
            evaluated
        } else {
            rest
        };
        match_value(vm, tail_pat, tail, binds)
    } else {
        Ok(rest.is_nil())
    }
}

/// Evaluates every element of a node list, building a fresh list of the
/// results. Used for identifier patterns that take a whole argument list.
fn eval_elements(vm: &mut Vm, list: Value) -> EvalResult<Value> {
    let nodes: Vec<Value> = ListIter::new(&vm.heap, list).collect();
    let mut values: Vec<Value> = Vec::with_capacity(nodes.len());
    for node in nodes {
        let value = eval(vm, node)?;
        vm.heap.root(value);
        values.push(value);
    }
    let mut out = Value::Nil;
    for value in values.into_iter().rev() {
        let id = vm.alloc(HeapData::Cons(Cons {
            car: value,
            cdr: out,
            debug: None,
        }))?;
        out = Value::Ref(id);
        vm.heap.root(out);
    }
    Ok(out)
}
