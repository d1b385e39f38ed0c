//! Macroexpansion and the preprocessing pass.
//!
//! Preprocessing walks a freshly read form top-down. At every list it runs
//! macroexpansion to a fixed point (recording the pre-expansion form for
//! backtraces), then either hands the list to the special operation named
//! by its head — whose preprocessor callback validates the syntactic
//! shape — or treats it as a function call and recurses. Lists that come
//! through successfully are stamped with the preprocessed bit and never
//! re-walked.
//!
//! Special-form shapes are described by a compact opcode stream
//! interpreted by [`run_pattern`], with a parallel message table indexed
//! by `Err` opcodes for ESTATIC reports.

use std::rc::Rc;

use crate::{
    errors::{BuiltinCode, EvalResult, throw},
    eval::apply,
    heap::{Cons, DebugInfo, HeapData, PreprocFn, ValueFlags},
    value::{ListIter, Value},
    vm::Vm,
};

/// One opcode of the special-form shape grammar.
///
/// Opcodes consume arguments left to right. `Err(i)` selects the message
/// reported for violations found by the opcodes after it.
#[derive(Debug, Clone, Copy)]
pub enum PatOp {
    /// One argument, taken as-is (not preprocessed).
    Node,
    /// One argument, preprocessed as an expression.
    Expr,
    /// One literal argument (int, double, bool, or string).
    Lit,
    /// End of argument list required here.
    Nil,
    /// Zero or more remaining arguments, each preprocessed.
    SeqExpr,
    /// Zero or more remaining arguments, taken as-is.
    SeqNode,
    /// One optional argument, preprocessed when present.
    MaybeExpr,
    /// One optional argument, taken as-is.
    MaybeNode,
    /// Select message `i` from the message table for what follows.
    Err(u8),
}

/// A shape spec: the opcode stream plus its message table.
#[derive(Debug, Clone, Copy)]
pub struct PatSpec {
    pub ops: &'static [PatOp],
    pub msgs: &'static [&'static str],
}

/// Builds a preprocessor callback that validates a form against `spec`.
/// Hosts installing special operations through `defsyntax` use this to
/// declare their syntactic contract.
pub fn pattern_preproc(spec: PatSpec) -> Rc<PreprocFn> {
    Rc::new(move |vm, form| run_pattern(vm, form, spec))
}

fn run_pattern(vm: &mut Vm, form: Value, spec: PatSpec) -> EvalResult<Value> {
    let Value::Ref(form_id) = form else {
        return Err(throw(BuiltinCode::Eapi, "preprocessor applied to a non-list"));
    };
    let HeapData::Cons(head_cons) = vm.heap.get(form_id) else {
        return Err(throw(BuiltinCode::Eapi, "preprocessor applied to a non-list"));
    };
    let head = head_cons.car;
    let args_list = head_cons.cdr;
    let args: Vec<Value> = ListIter::new(&vm.heap, args_list).collect();

    let mark = vm.heap.root_mark();
    let result = (|| {
        let mut out: Vec<Value> = Vec::with_capacity(args.len());
        let mut index = 0usize;
        let mut msg = 0usize;
        let fail = |msg: usize| throw(BuiltinCode::Estatic, spec.msgs.get(msg).copied().unwrap_or("malformed special form"));

        for op in spec.ops {
            match op {
                PatOp::Err(i) => msg = *i as usize,
                PatOp::Node => {
                    let arg = *args.get(index).ok_or_else(|| fail(msg))?;
                    index += 1;
                    out.push(arg);
                }
                PatOp::Expr => {
                    let arg = *args.get(index).ok_or_else(|| fail(msg))?;
                    index += 1;
                    let expanded = preproc_expr(vm, arg)?;
                    vm.heap.root(expanded);
                    out.push(expanded);
                }
                PatOp::Lit => {
                    let arg = *args.get(index).ok_or_else(|| fail(msg))?;
                    index += 1;
                    let is_lit = match arg {
                        Value::Int(_) | Value::Double(_) | Value::Bool(_) => true,
                        Value::Ref(id) => matches!(vm.heap.get(id), HeapData::Str(_)),
                        _ => false,
                    };
                    if !is_lit {
                        return Err(fail(msg));
                    }
                    out.push(arg);
                }
                PatOp::Nil => {
                    if index != args.len() {
                        return Err(fail(msg));
                    }
                }
                PatOp::SeqExpr => {
                    while index < args.len() {
                        let expanded = preproc_expr(vm, args[index])?;
                        vm.heap.root(expanded);
                        out.push(expanded);
                        index += 1;
                    }
                }
                PatOp::SeqNode => {
                    out.extend_from_slice(&args[index..]);
                    index = args.len();
                }
                PatOp::MaybeExpr => {
                    if index < args.len() {
                        let expanded = preproc_expr(vm, args[index])?;
                        vm.heap.root(expanded);
                        out.push(expanded);
                        index += 1;
                    }
                }
                PatOp::MaybeNode => {
                    if index < args.len() {
                        out.push(args[index]);
                        index += 1;
                    }
                }
            }
        }
        if index != args.len() {
            return Err(fail(msg));
        }
        rebuild_form(vm, form, head, &out)
    })();
    vm.heap.root_truncate(mark);
    result
}

/// Rebuilds `(head out...)`, copying source locations from the original
/// spine and stamping the head cons as preprocessed.
pub(crate) fn rebuild_form(vm: &mut Vm, original: Value, head: Value, args: &[Value]) -> EvalResult<Value> {
    // Locations of the original conses, element-aligned: index 0 is the
    // head cons.
    let mut locs: Vec<Option<DebugInfo>> = Vec::with_capacity(args.len() + 1);
    {
        let mut cur = original;
        while let Value::Ref(id) = cur {
            let HeapData::Cons(cons) = vm.heap.get(id) else { break };
            locs.push(cons.debug);
            cur = cons.cdr;
        }
    }

    let mark = vm.heap.root_mark();
    let mut list = Value::Nil;
    for (offset, &arg) in args.iter().enumerate().rev() {
        let debug = locs.get(offset + 1).copied().flatten();
        list = alloc_cons(vm, arg, list, debug)?;
        vm.heap.root(list);
    }
    let form = alloc_cons(vm, head, list, locs.first().copied().flatten())?;
    if let Value::Ref(id) = form {
        vm.heap.set_flag(id, ValueFlags::PREPROCESSED, true);
    }
    vm.heap.root_truncate(mark);
    Ok(form)
}

fn alloc_cons(vm: &mut Vm, car: Value, cdr: Value, debug: Option<DebugInfo>) -> EvalResult<Value> {
    let id = vm.alloc(HeapData::Cons(Cons { car, cdr, debug }))?;
    match debug {
        Some(DebugInfo::Loc(_)) => vm.heap.set_flag(id, ValueFlags::DEBUG_LOC, true),
        Some(DebugInfo::Orig(_)) => vm.heap.set_flag(id, ValueFlags::DEBUG_ORIG, true),
        None => {}
    }
    Ok(Value::Ref(id))
}

/// Applies one macroexpansion step: a non-empty list whose head names a
/// macro is rewritten by applying the macro to the unevaluated tail.
/// Returns `None` when the form is not a macro call.
pub(crate) fn macroexpand_once(vm: &mut Vm, form: Value) -> EvalResult<Option<Value>> {
    let Value::Ref(id) = form else { return Ok(None) };
    let HeapData::Cons(cons) = vm.heap.get(id) else {
        return Ok(None);
    };
    let Value::Sym(sym) = cons.car else { return Ok(None) };
    let args = cons.cdr;
    let Some(mac) = vm.macro_lookup(sym) else {
        return Ok(None);
    };
    apply(vm, mac, args).map(Some)
}

/// Runs [`macroexpand_once`] to a fixed point.
pub(crate) fn macroexpand(vm: &mut Vm, form: Value) -> EvalResult<Value> {
    let mark = vm.heap.root_mark();
    let mut cur = form;
    vm.heap.root(cur);
    let result = loop {
        match macroexpand_once(vm, cur) {
            Ok(Some(next)) => {
                vm.heap.set_root(mark, next);
                cur = next;
            }
            Ok(None) => break Ok(cur),
            Err(err) => break Err(err),
        }
    };
    vm.heap.root_truncate(mark);
    result
}

/// The full preprocessing pass over one top-level form.
pub(crate) fn preproc(vm: &mut Vm, form: Value) -> EvalResult<Value> {
    preproc_expr(vm, form)
}

pub(crate) fn preproc_expr(vm: &mut Vm, form: Value) -> EvalResult<Value> {
    let Value::Ref(id) = form else { return Ok(form) };
    match vm.heap.get(id) {
        HeapData::Cons(_) => {
            if vm.heap.flags(id).contains(ValueFlags::PREPROCESSED) {
                return Ok(form);
            }
            preproc_list(vm, form)
        }
        HeapData::Backquote(inner) => {
            let inner = *inner;
            let mark = vm.heap.root_mark();
            let walked = preproc_bq(vm, inner, 0);
            let result = walked.and_then(|walked| {
                vm.heap.root(walked);
                let id = vm.alloc(HeapData::Backquote(walked))?;
                Ok(Value::Ref(id))
            });
            vm.heap.root_truncate(mark);
            result
        }
        _ => Ok(form),
    }
}

fn preproc_list(vm: &mut Vm, form: Value) -> EvalResult<Value> {
    let mark = vm.heap.root_mark();
    let result = preproc_list_inner(vm, form);
    vm.heap.root_truncate(mark);
    result
}

fn preproc_list_inner(vm: &mut Vm, form: Value) -> EvalResult<Value> {
    // Macroexpansion to a fixed point; remember the original for
    // backtraces when it rewrote anything.
    let expanded = macroexpand(vm, form)?;
    vm.heap.root(expanded);
    if !expanded.equiv(form)
        && let Value::Ref(id) = expanded
        && let HeapData::Cons(cons) = vm.heap.get_mut(id)
    {
        cons.debug = Some(DebugInfo::Orig(form));
        vm.heap.set_flag(id, ValueFlags::DEBUG_ORIG, true);
        vm.heap.set_flag(id, ValueFlags::DEBUG_LOC, false);
    }
    let form = expanded;

    // Expansion can produce a non-list (or an already preprocessed list).
    let Value::Ref(id) = form else {
        return preproc_expr(vm, form);
    };
    let HeapData::Cons(cons) = vm.heap.get(id) else {
        return preproc_expr(vm, form);
    };
    if vm.heap.flags(id).contains(ValueFlags::PREPROCESSED) {
        return Ok(form);
    }
    let head = cons.car;
    let args_list = cons.cdr;

    // Special operation: its preprocessor callback owns the shape.
    if let Value::Sym(sym) = head
        && let Some(op) = vm.special_lookup(sym)
    {
        let preproc_cb = {
            let HeapData::SpecialOp(op_data) = vm.heap.get(op) else {
                unreachable!("special namespace holds special operations only")
            };
            op_data.preproc.clone()
        };
        let validated = match preproc_cb {
            Some(cb) => cb(vm, form)?,
            None => form,
        };
        if let Value::Ref(vid) = validated {
            vm.heap.set_flag(vid, ValueFlags::PREPROCESSED, true);
        }
        return Ok(validated);
    }

    // Ordinary call: head as an expression, each argument recursively.
    let new_head = preproc_expr(vm, head)?;
    vm.heap.root(new_head);
    let args: Vec<Value> = ListIter::new(&vm.heap, args_list).collect();
    let mut new_args: Vec<Value> = Vec::with_capacity(args.len());
    for arg in args {
        let processed = preproc_expr(vm, arg)?;
        vm.heap.root(processed);
        new_args.push(processed);
    }
    rebuild_form(vm, form, new_head, &new_args)
}

/// Walks a backquote template, preprocessing comma and splice sections
/// that will evaluate at this template's level. Plain quote contents are
/// walked too, since the quasiquote engine descends into them.
fn preproc_bq(vm: &mut Vm, tree: Value, nest: u32) -> EvalResult<Value> {
    let Value::Ref(id) = tree else { return Ok(tree) };
    match vm.heap.get(id) {
        HeapData::Cons(_) => {
            let mark = vm.heap.root_mark();
            let elements: Vec<Value> = ListIter::new(&vm.heap, tree).collect();
            let mut walked: Vec<Value> = Vec::with_capacity(elements.len());
            let mut result = Ok(());
            for element in elements {
                match preproc_bq(vm, element, nest) {
                    Ok(w) => {
                        vm.heap.root(w);
                        walked.push(w);
                    }
                    Err(err) => {
                        result = Err(err);
                        break;
                    }
                }
            }
            let out = match result {
                Ok(()) => rebuild_list(vm, tree, &walked),
                Err(err) => Err(err),
            };
            vm.heap.root_truncate(mark);
            out
        }
        HeapData::Quote(inner) => {
            let inner = *inner;
            let walked = preproc_bq(vm, inner, nest)?;
            rewrap(vm, walked, HeapData::Quote)
        }
        HeapData::Backquote(inner) => {
            let inner = *inner;
            let walked = preproc_bq(vm, inner, nest + 1)?;
            rewrap(vm, walked, HeapData::Backquote)
        }
        HeapData::Comma(inner) => {
            let inner = *inner;
            let walked = if nest == 0 {
                preproc_expr(vm, inner)?
            } else {
                preproc_bq(vm, inner, nest - 1)?
            };
            rewrap(vm, walked, HeapData::Comma)
        }
        HeapData::Splice(inner) => {
            let inner = *inner;
            let walked = if nest == 0 {
                preproc_expr(vm, inner)?
            } else {
                preproc_bq(vm, inner, nest - 1)?
            };
            rewrap(vm, walked, HeapData::Splice)
        }
        _ => Ok(tree),
    }
}

pub(crate) fn rebuild_list(vm: &mut Vm, original: Value, elements: &[Value]) -> EvalResult<Value> {
    // A template list is rebuilt whole; unlike a call form it has no
    // special head, so no preprocessed stamp either.
    let mut locs: Vec<Option<DebugInfo>> = Vec::with_capacity(elements.len());
    {
        let mut cur = original;
        while let Value::Ref(id) = cur {
            let HeapData::Cons(cons) = vm.heap.get(id) else { break };
            locs.push(cons.debug);
            cur = cons.cdr;
        }
    }
    let mark = vm.heap.root_mark();
    let mut list = Value::Nil;
    let mut result = Ok(());
    for (offset, &element) in elements.iter().enumerate().rev() {
        let debug = locs.get(offset).copied().flatten();
        match alloc_cons(vm, element, list, debug) {
            Ok(cons) => {
                list = cons;
                vm.heap.root(list);
            }
            Err(err) => {
                result = Err(err);
                break;
            }
        }
    }
    vm.heap.root_truncate(mark);
    result.map(|()| list)
}

fn rewrap(vm: &mut Vm, inner: Value, make: fn(Value) -> HeapData) -> EvalResult<Value> {
    vm.heap.root(inner);
    let id = vm.alloc(make(inner))?;
    Ok(Value::Ref(id))
}
