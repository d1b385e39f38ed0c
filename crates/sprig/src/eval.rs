//! The tree-walking evaluator.
//!
//! [`eval`] drives an outer loop over [`Step`] records: a step either
//! produces a value or a tail record naming the next expression and the
//! frame it evaluates under. Closure calls in tail position unwind the
//! outgoing call's frames before pushing their own, so self-recursive
//! tail calls run in constant host stack and constant environment depth.
//!
//! Scoping is lexical: a callee frame chains only to the closure's
//! captured environment. The caller is remembered on the VM's separate
//! environment stack purely for unwinding, never for lookup.
//!
//! Rooting discipline: any value held across an allocation or a nested
//! evaluation is pushed on the heap's shadow stack; every frame of the
//! evaluator truncates back to its entry mark on all exits, success and
//! error alike.

use smallvec::SmallVec;

use crate::{
    env,
    errors::{BuiltinCode, EvalResult, Thrown, throw},
    heap::{Heap, HeapData, HeapId, ValueFlags},
    matcher::{MatchFlags, match_bind},
    quasiquote::{self, QqOut},
    types,
    value::{ListIter, Value},
    vm::Vm,
};

/// What one evaluation step produced.
pub enum Step {
    /// A finished value.
    Done(Value),
    /// Keep going: evaluate `expr` with `pop_stop` as the current frame.
    /// Frames pushed above `pop_stop` since the step began are popped
    /// before the loop continues.
    Tail { expr: Value, pop_stop: HeapId },
}

/// Evaluates one expression in the VM's current environment.
pub(crate) fn eval(vm: &mut Vm, expr: Value) -> EvalResult<Value> {
    vm.depth += 1;
    if vm.config.stack_limit != 0 && vm.depth > vm.config.stack_limit {
        vm.depth -= 1;
        return Err(throw(BuiltinCode::Estack, "stack depth limit reached"));
    }

    let base_env = vm.env;
    let mark = vm.heap.root_mark();
    vm.heap.root(expr);
    let tails_before = vm.tail_calls;

    let mut expr = expr;
    let result = loop {
        match eval_step(vm, expr, base_env) {
            Ok(Step::Done(value)) => break Ok(value),
            Ok(Step::Tail { expr: next, pop_stop }) => {
                if vm.config.tail_call_elimination {
                    pop_to(vm, pop_stop);
                    vm.heap.set_root(mark, next);
                    expr = next;
                    if vm.heap.wants_gc() {
                        vm.collect_garbage();
                    }
                } else {
                    // Elimination disabled: evaluate the tail by ordinary
                    // recursion.
                    break eval(vm, next);
                }
            }
            Err(err) => break Err(err),
        }
    };

    let result = match result {
        Ok(value) => {
            vm.heap.set_root(mark, value);
            pop_to(vm, base_env);
            if vm.heap.wants_gc() {
                vm.collect_garbage();
            }
            Ok(value)
        }
        Err(mut err) => {
            let elided = vm.tail_calls - tails_before;
            if elided > 0 {
                vm.push_tail_placeholder(&mut err, elided);
            }
            pop_to(vm, base_env);
            Err(err)
        }
    };
    vm.tail_calls = tails_before;
    vm.heap.root_truncate(mark);
    vm.depth -= 1;
    result
}

/// Pops environment frames until `target` is current again.
///
/// Unwinding walks the VM's environment stack, never the lexical chain:
/// a callee's chain runs through its captured environment, which has no
/// relation to the frames the evaluator needs to discard.
pub(crate) fn pop_to(vm: &mut Vm, target: HeapId) {
    while vm.env != target {
        let Some(prev) = vm.env_stack.pop() else {
            debug_assert!(false, "pop target is not on the environment stack");
            break;
        };
        let popped = vm.env;
        vm.env = prev;
        free_if_unescaped(&mut vm.heap, popped);
    }
}

/// Frees a popped frame whose no-escape bit survived; captured frames are
/// left for the collector.
pub(crate) fn free_if_unescaped(heap: &mut Heap, frame: HeapId) {
    if heap.flags(frame).contains(ValueFlags::NO_ESCAPE) {
        heap.free_frame(frame);
    }
}

/// One evaluation step, dispatched on the expression's tag.
fn eval_step(vm: &mut Vm, expr: Value, base_env: HeapId) -> EvalResult<Step> {
    match expr {
        Value::Sym(sym) => {
            let env = vm.env;
            env::get_symbol(vm, env, sym).map(Step::Done)
        }
        Value::Ref(id) => match vm.heap.get(id) {
            HeapData::Cons(_) => eval_call(vm, expr, base_env),
            HeapData::Quote(inner) => Ok(Step::Done(*inner)),
            HeapData::Backquote(inner) => {
                let inner = *inner;
                match quasiquote::expand(vm, inner, 0)? {
                    QqOut::Value(value) => Ok(Step::Done(value)),
                    QqOut::Spliced(_) => Err(throw(BuiltinCode::Eeval, "`,@` outside list context")),
                }
            }
            HeapData::Comma(_) => Err(throw(BuiltinCode::Eeval, "`,` outside backquote")),
            HeapData::Splice(_) => Err(throw(BuiltinCode::Eeval, "`,@` outside backquote")),
            _ => Ok(Step::Done(expr)),
        },
        _ => Ok(Step::Done(expr)),
    }
}

/// Inline capacity of the argument spine; calls with more arguments spill
/// to the heap.
const ARG_SPINE: usize = 8;

/// A function-call form. The head decides the calling convention.
fn eval_call(vm: &mut Vm, form: Value, base_env: HeapId) -> EvalResult<Step> {
    let Value::Ref(form_id) = form else { unreachable!("eval_call takes a cons") };
    let HeapData::Cons(cons) = vm.heap.get(form_id) else {
        unreachable!("eval_call takes a cons")
    };
    let head = cons.car;
    let args_list = cons.cdr;

    // Special operations see their argument list unevaluated and may
    // answer with a tail record.
    if let Value::Sym(sym) = head
        && let Some(op_id) = vm.special_lookup(sym)
    {
        let call = {
            let HeapData::SpecialOp(op) = vm.heap.get(op_id) else {
                unreachable!("special namespace holds special operations only")
            };
            std::rc::Rc::clone(&op.call)
        };
        let env = vm.env;
        return call(vm, args_list, env).map_err(|e| vm.capture_bt(e, form));
    }

    let mark = vm.heap.root_mark();
    let result = eval_call_inner(vm, head, args_list, base_env);
    vm.heap.root_truncate(mark);
    result.map_err(|e| vm.capture_bt(e, form))
}

fn eval_call_inner(vm: &mut Vm, head: Value, args_list: Value, base_env: HeapId) -> EvalResult<Step> {
    let head_value = eval(vm, head)?;
    vm.heap.root(head_value);

    match head_value {
        Value::Ref(id) => match vm.heap.get(id) {
            HeapData::ExtFunc(ext) => {
                let call = std::rc::Rc::clone(&ext.call);
                let argv = eval_args(vm, args_list)?;
                call(vm, &argv).map(Step::Done)
            }
            HeapData::Func(func) => {
                let func = *func;
                // Fresh binding frame below the captured environment; the
                // callee's lexical chain is frame -> captured -> global and
                // never includes the caller. Argument nodes still evaluate
                // in the caller's environment as part of the match.
                let frame = vm.alloc(HeapData::Env(env::EnvFrame::normal(Some(func.env))))?;
                vm.heap.root(Value::Ref(frame));
                if !match_bind(vm, func.params, args_list, frame, MatchFlags::EVAL_NODES)? {
                    return Err(throw(
                        BuiltinCode::Ematch,
                        "arguments do not match the parameter pattern",
                    ));
                }
                // The outgoing call's frames are done with: unwind before
                // entering the callee so tail chains stay flat.
                pop_to(vm, base_env);
                vm.push_frame(frame);

                let body: SmallVec<[Value; 4]> = ListIter::new(&vm.heap, func.body).collect();
                let Some((&last, init)) = body.split_last() else {
                    return Ok(Step::Done(Value::Nil));
                };
                for &stmt in init {
                    eval(vm, stmt)?;
                }
                if vm.config.tail_call_elimination {
                    vm.tail_calls += 1;
                }
                Ok(Step::Tail { expr: last, pop_stop: frame })
            }
            HeapData::Macro(_) => Err(throw(
                BuiltinCode::Emacro,
                "macro applied outside the expander",
            )),
            HeapData::Env(_) => {
                // Evaluate each argument as a body form inside the given
                // environment; the result is the last one.
                let body: Vec<Value> = ListIter::new(&vm.heap, args_list).collect();
                let saved = vm.env;
                vm.env = id;
                let mut last = Value::Nil;
                let mut failed = None;
                for stmt in body {
                    match eval(vm, stmt) {
                        Ok(value) => last = value,
                        Err(err) => {
                            failed = Some(err);
                            break;
                        }
                    }
                }
                vm.env = saved;
                match failed {
                    None => Ok(Step::Done(last)),
                    Some(err) => Err(err),
                }
            }
            _ => Err(not_callable(vm, head_value)),
        },
        Value::TypeCode(code) => {
            let argv = eval_args(vm, args_list)?;
            let [arg] = argv.as_slice() else {
                return Err(throw(BuiltinCode::Evalue, "a type cast takes exactly one argument"));
            };
            types_cast(vm, code, *arg).map(Step::Done)
        }
        _ => Err(not_callable(vm, head_value)),
    }
}

fn not_callable(vm: &Vm, value: Value) -> Box<Thrown> {
    throw(
        BuiltinCode::Etype,
        format!(
            "value of type {name} is not callable",
            name = vm.types.name(types::type_of(&vm.heap, value))
        ),
    )
}

/// Evaluates an argument list into the spine, rooting each result.
fn eval_args(vm: &mut Vm, args_list: Value) -> EvalResult<SmallVec<[Value; ARG_SPINE]>> {
    let forms: SmallVec<[Value; ARG_SPINE]> = ListIter::new(&vm.heap, args_list).collect();
    let mut argv: SmallVec<[Value; ARG_SPINE]> = SmallVec::with_capacity(forms.len());
    for form in forms {
        let value = eval(vm, form)?;
        vm.heap.root(value);
        argv.push(value);
    }
    Ok(argv)
}

/// Casts `value` to `code`: both sides must resolve to the same basic
/// type. Casting to a basic code unwraps; casting to a user code wraps.
fn types_cast(vm: &mut Vm, code: crate::types::TypeCode, value: Value) -> EvalResult<Value> {
    let target_base = vm.types.resolve(code);
    let value_base = vm.types.resolve(types::type_of(&vm.heap, value));
    if target_base != value_base {
        return Err(throw(
            BuiltinCode::Etype,
            format!(
                "cannot cast {from} to {to}",
                from = vm.types.name(value_base),
                to = vm.types.name(code)
            ),
        ));
    }
    // Unwrap any existing user-type wrapper down to the payload.
    let mut payload = value;
    while let Value::Ref(id) = payload
        && let HeapData::Typed(typed) = vm.heap.get(id)
    {
        payload = typed.inner;
    }
    if code.is_user() {
        vm.heap.root(payload);
        let id = vm.alloc(HeapData::Typed(crate::heap::Typed { code, inner: payload }))?;
        Ok(Value::Ref(id))
    } else {
        Ok(payload)
    }
}

/// Calls `func` on an already-evaluated argument list, without
/// re-evaluating the arguments. Shares the closure path with the normal
/// evaluator; macros are applied this way by the expander.
pub(crate) fn apply(vm: &mut Vm, func: Value, args_list: Value) -> EvalResult<Value> {
    let mark = vm.heap.root_mark();
    vm.heap.root(func);
    vm.heap.root(args_list);
    let result = apply_inner(vm, func, args_list);
    vm.heap.root_truncate(mark);
    result
}

fn apply_inner(vm: &mut Vm, func: Value, args_list: Value) -> EvalResult<Value> {
    let Value::Ref(id) = func else {
        return Err(not_callable(vm, func));
    };
    match vm.heap.get(id) {
        HeapData::ExtFunc(ext) => {
            let call = std::rc::Rc::clone(&ext.call);
            let argv: SmallVec<[Value; ARG_SPINE]> = ListIter::new(&vm.heap, args_list).collect();
            for &arg in &argv {
                vm.heap.root(arg);
            }
            call(vm, &argv)
        }
        HeapData::Func(func_data) | HeapData::Macro(func_data) => {
            let func_data = *func_data;
            // Same lexical discipline as a normal call: the binding frame
            // chains to the captured environment, not to whatever is
            // current when the host (or the expander) applies.
            let frame = vm.alloc(HeapData::Env(env::EnvFrame::normal(Some(func_data.env))))?;
            vm.heap.root(Value::Ref(frame));
            if !match_bind(vm, func_data.params, args_list, frame, MatchFlags::empty())? {
                return Err(throw(
                    BuiltinCode::Ematch,
                    "arguments do not match the parameter pattern",
                ));
            }
            let saved = vm.env;
            vm.push_frame(frame);
            let body: Vec<Value> = ListIter::new(&vm.heap, func_data.body).collect();
            let mut result = Ok(Value::Nil);
            for stmt in body {
                result = eval(vm, stmt);
                if result.is_err() {
                    break;
                }
            }
            pop_to(vm, saved);
            result
        }
        _ => Err(not_callable(vm, func)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{env::EnvFrame, vm::Vm};

    #[test]
    fn uncaptured_frames_free_immediately_on_pop() {
        let mut vm = Vm::new();
        let before = vm.heap.stats();
        let frame = vm
            .alloc(HeapData::Env(EnvFrame::normal(Some(vm.global))))
            .expect("frame allocation");
        vm.push_frame(frame);
        let global = vm.global;
        pop_to(&mut vm, global);
        let after = vm.heap.stats();
        assert_eq!(
            after.live_objects, before.live_objects,
            "a popped frame with no captures is freed without a collection"
        );
        assert_eq!(after.free_slots, before.free_slots + 1);
    }

    #[test]
    fn captured_frames_are_left_for_the_collector() {
        let mut vm = Vm::new();
        let before = vm.heap.stats();
        let frame = vm
            .alloc(HeapData::Env(EnvFrame::normal(Some(vm.global))))
            .expect("frame allocation");
        vm.push_frame(frame);
        env::mark_escaping(&mut vm.heap, frame);
        let global = vm.global;
        pop_to(&mut vm, global);
        let after = vm.heap.stats();
        assert_eq!(
            after.live_objects,
            before.live_objects + 1,
            "an escaping frame survives the pop"
        );
    }
}
