//! The core special operations: definition, closures, control flow, and
//! exception handling. Each is installed with a preprocessor — a shape
//! spec for the simple ones, a bespoke walk where clause structure needs
//! it — and a tail-capable callback.

use std::rc::Rc;

use crate::{
    env::{self, EnvFrame},
    errors::{BuiltinCode, EvalResult, throw},
    eval::{Step, eval},
    heap::{Func, HeapData, HeapId},
    intern::{StaticSyms, SymId},
    matcher::{MatchFlags, match_bind},
    prepare::{PatOp, PatSpec, pattern_preproc, preproc_expr, rebuild_form, rebuild_list},
    value::{ListIter, Value},
    vm::Vm,
};

pub(crate) fn install(vm: &mut Vm) {
    let installed: Result<(), crate::errors::Error> = (|| {
        vm.defsyntax(
            "def",
            |vm, args, env| sp_def(vm, args, env, false),
            Some(pattern_preproc(DEF_SPEC)),
            None,
        )?;
        vm.defsyntax(
            "defconst",
            |vm, args, env| sp_def(vm, args, env, true),
            Some(pattern_preproc(DEF_SPEC)),
            None,
        )?;
        vm.defsyntax("set", sp_set, Some(pattern_preproc(SET_SPEC)), None)?;
        vm.defsyntax("fn", sp_fn, Some(pattern_preproc(FN_SPEC)), None)?;
        vm.defsyntax("macro", sp_macro, Some(pattern_preproc(MACRO_SPEC)), None)?;
        vm.defsyntax("if", sp_if, Some(pattern_preproc(IF_SPEC)), None)?;
        vm.defsyntax("do", sp_do, Some(pattern_preproc(SEQ_SPEC)), None)?;
        vm.defsyntax("and", sp_and, Some(pattern_preproc(SEQ_SPEC)), None)?;
        vm.defsyntax("or", sp_or, Some(pattern_preproc(SEQ_SPEC)), None)?;
        vm.defsyntax("let", sp_let, Some(Rc::new(pp_let)), None)?;
        vm.defsyntax("case", sp_case, Some(Rc::new(pp_case)), None)?;
        vm.defsyntax("try", sp_try, Some(Rc::new(pp_try)), None)?;
        Ok(())
    })();
    installed.expect("installing core special operations cannot fail");
}

const DEF_SPEC: PatSpec = PatSpec {
    ops: &[PatOp::Err(0), PatOp::Node, PatOp::MaybeExpr, PatOp::Nil],
    msgs: &["expected a pattern and an optional initializer"],
};
const SET_SPEC: PatSpec = PatSpec {
    ops: &[PatOp::Err(0), PatOp::Node, PatOp::Expr, PatOp::Nil],
    msgs: &["set takes a symbol and a value"],
};
const FN_SPEC: PatSpec = PatSpec {
    ops: &[PatOp::Err(0), PatOp::Node, PatOp::SeqExpr],
    msgs: &["fn takes a parameter pattern and a body"],
};
const MACRO_SPEC: PatSpec = PatSpec {
    ops: &[PatOp::Err(0), PatOp::Node, PatOp::Err(1), PatOp::Node, PatOp::SeqExpr],
    msgs: &[
        "macro takes a name, a parameter pattern, and a body",
        "macro takes a parameter pattern after the name",
    ],
};
const IF_SPEC: PatSpec = PatSpec {
    ops: &[PatOp::Err(0), PatOp::Expr, PatOp::Expr, PatOp::MaybeExpr, PatOp::Nil],
    msgs: &["if takes a condition, a consequent, and an optional alternative"],
};
const SEQ_SPEC: PatSpec = PatSpec {
    ops: &[PatOp::SeqExpr],
    msgs: &[],
};

fn args_vec(vm: &Vm, args: Value) -> Vec<Value> {
    ListIter::new(&vm.heap, args).collect()
}

// --- definition ----------------------------------------------------------

fn sp_def(vm: &mut Vm, args: Value, env: HeapId, read_only: bool) -> EvalResult<Step> {
    let argv = args_vec(vm, args);
    let (pattern, init) = match argv.as_slice() {
        [pattern] => (*pattern, None),
        [pattern, init] => (*pattern, Some(*init)),
        _ => return Err(throw(BuiltinCode::Estatic, "expected a pattern and an optional initializer")),
    };
    let value = match init {
        Some(init) => eval(vm, init)?,
        None => Value::Nil,
    };
    let mark = vm.heap.root_mark();
    vm.heap.root(value);
    let flags = if read_only { MatchFlags::READ_ONLY } else { MatchFlags::empty() };
    let matched = match_bind(vm, pattern, value, env, flags);
    vm.heap.root_truncate(mark);
    if !matched? {
        return Err(throw(BuiltinCode::Ematch, "definition pattern does not match the value"));
    }
    Ok(Step::Done(value))
}

fn sp_set(vm: &mut Vm, args: Value, env: HeapId) -> EvalResult<Step> {
    let argv = args_vec(vm, args);
    let [target, expr] = argv.as_slice() else {
        return Err(throw(BuiltinCode::Estatic, "set takes a symbol and a value"));
    };
    let Value::Sym(sym) = *target else {
        return Err(throw(BuiltinCode::Etype, "set target must be an identifier"));
    };
    let value = eval(vm, *expr)?;
    let mark = vm.heap.root_mark();
    vm.heap.root(value);
    let result = env::set_symbol(vm, env, sym, value);
    vm.heap.root_truncate(mark);
    result?;
    Ok(Step::Done(value))
}

// --- closures and macros -------------------------------------------------

fn sp_fn(vm: &mut Vm, args: Value, env: HeapId) -> EvalResult<Step> {
    let Value::Ref(args_id) = args else {
        return Err(throw(BuiltinCode::Estatic, "fn takes a parameter pattern and a body"));
    };
    let HeapData::Cons(cons) = vm.heap.get(args_id) else {
        return Err(throw(BuiltinCode::Estatic, "fn takes a parameter pattern and a body"));
    };
    let params = cons.car;
    let body = cons.cdr;
    // The closure can outlive the frame that created it.
    env::mark_escaping(&mut vm.heap, env);
    let id = vm.alloc(HeapData::Func(Func { params, body, env }))?;
    Ok(Step::Done(Value::Ref(id)))
}

fn sp_macro(vm: &mut Vm, args: Value, env: HeapId) -> EvalResult<Step> {
    let argv = args_vec(vm, args);
    if argv.len() < 2 {
        return Err(throw(BuiltinCode::Estatic, "macro takes a name, a parameter pattern, and a body"));
    }
    let Value::Sym(name) = argv[0] else {
        return Err(throw(BuiltinCode::Etype, "macro name must be an identifier"));
    };
    let params = argv[1];
    // Body is the tail after name and params.
    let body = {
        let mut cur = args;
        for _ in 0..2 {
            let Value::Ref(id) = cur else { unreachable!("checked above") };
            let HeapData::Cons(cons) = vm.heap.get(id) else {
                unreachable!("checked above")
            };
            cur = cons.cdr;
        }
        cur
    };
    env::mark_escaping(&mut vm.heap, env);
    let id = vm.alloc(HeapData::Macro(Func { params, body, env }))?;
    vm.define_macro(name, Value::Ref(id))?;
    Ok(Step::Done(Value::Nil))
}

// --- control flow --------------------------------------------------------

fn sp_if(vm: &mut Vm, args: Value, env: HeapId) -> EvalResult<Step> {
    let argv = args_vec(vm, args);
    let (cond, then, alt) = match argv.as_slice() {
        [cond, then] => (*cond, *then, None),
        [cond, then, alt] => (*cond, *then, Some(*alt)),
        _ => {
            return Err(throw(
                BuiltinCode::Estatic,
                "if takes a condition, a consequent, and an optional alternative",
            ));
        }
    };
    let test = eval(vm, cond)?;
    if test.is_truthy() {
        Ok(Step::Tail { expr: then, pop_stop: env })
    } else {
        match alt {
            Some(alt) => Ok(Step::Tail { expr: alt, pop_stop: env }),
            None => Ok(Step::Done(Value::Nil)),
        }
    }
}

fn sp_do(vm: &mut Vm, args: Value, env: HeapId) -> EvalResult<Step> {
    let argv = args_vec(vm, args);
    let Some((&last, init)) = argv.split_last() else {
        return Ok(Step::Done(Value::Nil));
    };
    for &stmt in init {
        eval(vm, stmt)?;
    }
    Ok(Step::Tail { expr: last, pop_stop: env })
}

fn sp_and(vm: &mut Vm, args: Value, env: HeapId) -> EvalResult<Step> {
    let argv = args_vec(vm, args);
    let Some((&last, init)) = argv.split_last() else {
        return Ok(Step::Done(Value::Bool(true)));
    };
    for &stmt in init {
        let value = eval(vm, stmt)?;
        if !value.is_truthy() {
            return Ok(Step::Done(value));
        }
    }
    Ok(Step::Tail { expr: last, pop_stop: env })
}

fn sp_or(vm: &mut Vm, args: Value, env: HeapId) -> EvalResult<Step> {
    let argv = args_vec(vm, args);
    let Some((&last, init)) = argv.split_last() else {
        return Ok(Step::Done(Value::Bool(false)));
    };
    for &stmt in init {
        let value = eval(vm, stmt)?;
        if value.is_truthy() {
            return Ok(Step::Done(value));
        }
    }
    Ok(Step::Tail { expr: last, pop_stop: env })
}

// --- let ------------------------------------------------------------------

fn pp_let(vm: &mut Vm, form: Value) -> EvalResult<Value> {
    let (head, args) = split_form(vm, form)?;
    let Some((&bindings, body)) = args.split_first() else {
        return Err(throw(BuiltinCode::Estatic, "let takes a binding list and a body"));
    };
    let mark = vm.heap.root_mark();
    let result = (|| {
        let pairs = args_vec(vm, bindings);
        let mut new_pairs: Vec<Value> = Vec::with_capacity(pairs.len());
        for pair in pairs {
            let elems = args_vec(vm, pair);
            let [pattern, init] = elems.as_slice() else {
                return Err(throw(BuiltinCode::Estatic, "let bindings are (pattern value) pairs"));
            };
            let init = preproc_expr(vm, *init)?;
            vm.heap.root(init);
            let rebuilt = rebuild_list(vm, pair, &[*pattern, init])?;
            vm.heap.root(rebuilt);
            new_pairs.push(rebuilt);
        }
        let new_bindings = rebuild_list(vm, bindings, &new_pairs)?;
        vm.heap.root(new_bindings);
        let mut out: Vec<Value> = Vec::with_capacity(1 + body.len());
        out.push(new_bindings);
        for &stmt in body {
            let stmt = preproc_expr(vm, stmt)?;
            vm.heap.root(stmt);
            out.push(stmt);
        }
        rebuild_form(vm, form, head, &out)
    })();
    vm.heap.root_truncate(mark);
    result
}

fn sp_let(vm: &mut Vm, args: Value, env: HeapId) -> EvalResult<Step> {
    let argv = args_vec(vm, args);
    let Some((&bindings, body)) = argv.split_first() else {
        return Err(throw(BuiltinCode::Estatic, "let takes a binding list and a body"));
    };
    let mark = vm.heap.root_mark();
    let result = (|| {
        // Classic let: all initializers evaluate in the enclosing
        // environment before anything is bound.
        let pairs = args_vec(vm, bindings);
        let mut bound: Vec<(Value, Value)> = Vec::with_capacity(pairs.len());
        for pair in pairs {
            let elems = args_vec(vm, pair);
            let [pattern, init] = elems.as_slice() else {
                return Err(throw(BuiltinCode::Estatic, "let bindings are (pattern value) pairs"));
            };
            let value = eval(vm, *init)?;
            vm.heap.root(value);
            bound.push((*pattern, value));
        }
        let frame = vm.alloc(HeapData::Env(EnvFrame::normal(Some(env))))?;
        vm.heap.root(Value::Ref(frame));
        for (pattern, value) in bound {
            if !match_bind(vm, pattern, value, frame, MatchFlags::empty())? {
                return Err(throw(BuiltinCode::Ematch, "let pattern does not match its value"));
            }
        }
        let Some((&last, init_stmts)) = body.split_last() else {
            return Ok(Step::Done(Value::Nil));
        };
        vm.push_frame(frame);
        for &stmt in init_stmts {
            eval(vm, stmt)?;
        }
        Ok(Step::Tail { expr: last, pop_stop: frame })
    })();
    vm.heap.root_truncate(mark);
    result
}

// --- case -----------------------------------------------------------------

fn pp_case(vm: &mut Vm, form: Value) -> EvalResult<Value> {
    let (head, args) = split_form(vm, form)?;
    let Some((&key, clauses)) = args.split_first() else {
        return Err(throw(BuiltinCode::Estatic, "case takes a value and clauses"));
    };
    let mark = vm.heap.root_mark();
    let result = (|| {
        let key = preproc_expr(vm, key)?;
        vm.heap.root(key);
        let mut out: Vec<Value> = Vec::with_capacity(1 + clauses.len());
        out.push(key);
        for &clause in clauses {
            let elems = args_vec(vm, clause);
            let Some((&pattern, body)) = elems.split_first() else {
                return Err(throw(BuiltinCode::Estatic, "case clauses are (pattern body...) lists"));
            };
            let mut new_clause: Vec<Value> = Vec::with_capacity(elems.len());
            new_clause.push(pattern);
            for &stmt in body {
                let stmt = preproc_expr(vm, stmt)?;
                vm.heap.root(stmt);
                new_clause.push(stmt);
            }
            let rebuilt = rebuild_list(vm, clause, &new_clause)?;
            vm.heap.root(rebuilt);
            out.push(rebuilt);
        }
        rebuild_form(vm, form, head, &out)
    })();
    vm.heap.root_truncate(mark);
    result
}

fn sp_case(vm: &mut Vm, args: Value, env: HeapId) -> EvalResult<Step> {
    let argv = args_vec(vm, args);
    let Some((&key_expr, clauses)) = argv.split_first() else {
        return Err(throw(BuiltinCode::Estatic, "case takes a value and clauses"));
    };
    let key = eval(vm, key_expr)?;
    let mark = vm.heap.root_mark();
    vm.heap.root(key);
    let result = (|| {
        for &clause in clauses {
            let elems = args_vec(vm, clause);
            let Some((&pattern, body)) = elems.split_first() else {
                return Err(throw(BuiltinCode::Estatic, "case clauses are (pattern body...) lists"));
            };
            let frame = vm.alloc(HeapData::Env(EnvFrame::normal(Some(env))))?;
            vm.heap.root(Value::Ref(frame));
            if !match_bind(vm, pattern, key, frame, MatchFlags::empty())? {
                continue;
            }
            let Some((&last, init_stmts)) = body.split_last() else {
                return Ok(Step::Done(Value::Nil));
            };
            vm.push_frame(frame);
            for &stmt in init_stmts {
                eval(vm, stmt)?;
            }
            return Ok(Step::Tail { expr: last, pop_stop: frame });
        }
        Err(throw(BuiltinCode::Ematch, "no case pattern matched"))
    })();
    vm.heap.root_truncate(mark);
    result
}

// --- try / catch / finally -----------------------------------------------

fn pp_try(vm: &mut Vm, form: Value) -> EvalResult<Value> {
    let (head, args) = split_form(vm, form)?;
    let Some((&body, clauses)) = args.split_first() else {
        return Err(throw(BuiltinCode::Estatic, "try takes a body and handler clauses"));
    };
    let catch_sym = SymId::from(StaticSyms::Catch);
    let finally_sym = SymId::from(StaticSyms::Finally);

    let mark = vm.heap.root_mark();
    let result = (|| {
        let body = preproc_expr(vm, body)?;
        vm.heap.root(body);
        let mut out: Vec<Value> = Vec::with_capacity(1 + clauses.len());
        out.push(body);
        for (index, &clause) in clauses.iter().enumerate() {
            let elems = args_vec(vm, clause);
            let rebuilt = match elems.split_first() {
                Some((&Value::Sym(sym), rest)) if sym == catch_sym => {
                    let Some((&codes, handler)) = rest.split_first() else {
                        return Err(throw(BuiltinCode::Estatic, "catch takes an error code and a body"));
                    };
                    let codes = preproc_expr(vm, codes)?;
                    vm.heap.root(codes);
                    let mut new_clause = vec![Value::Sym(catch_sym), codes];
                    for &stmt in handler {
                        let stmt = preproc_expr(vm, stmt)?;
                        vm.heap.root(stmt);
                        new_clause.push(stmt);
                    }
                    rebuild_list(vm, clause, &new_clause)?
                }
                Some((&Value::Sym(sym), rest)) if sym == finally_sym => {
                    if index != clauses.len() - 1 {
                        return Err(throw(BuiltinCode::Estatic, "finally must be the last clause"));
                    }
                    let mut new_clause = vec![Value::Sym(finally_sym)];
                    for &stmt in rest {
                        let stmt = preproc_expr(vm, stmt)?;
                        vm.heap.root(stmt);
                        new_clause.push(stmt);
                    }
                    rebuild_list(vm, clause, &new_clause)?
                }
                _ => {
                    return Err(throw(
                        BuiltinCode::Estatic,
                        "try clauses must be (catch ...) or (finally ...)",
                    ));
                }
            };
            vm.heap.root(rebuilt);
            out.push(rebuilt);
        }
        rebuild_form(vm, form, head, &out)
    })();
    vm.heap.root_truncate(mark);
    result
}

fn sp_try(vm: &mut Vm, args: Value, _env: HeapId) -> EvalResult<Step> {
    let argv = args_vec(vm, args);
    let Some((&body, clauses)) = argv.split_first() else {
        return Err(throw(BuiltinCode::Estatic, "try takes a body and handler clauses"));
    };
    let catch_sym = SymId::from(StaticSyms::Catch);
    let finally_sym = SymId::from(StaticSyms::Finally);

    let mark = vm.heap.root_mark();
    vm.heap.root(Value::Nil);
    let mut result = eval(vm, body);
    if let Ok(value) = &result {
        vm.heap.set_root(mark, *value);
    }

    if let Err(thrown) = result {
        // Expose the thrown state to handlers through errno/errmsg. A copy
        // stays on hand: handler code can run nested try forms that clear
        // the shared error state.
        let original = thrown.clone();
        vm.last_error = Some(thrown);
        let code = original.code();
        result = (|| {
            for &clause in clauses {
                let elems = args_vec(vm, clause);
                let Some((&Value::Sym(sym), rest)) = elems.split_first() else {
                    continue;
                };
                if sym != catch_sym {
                    continue;
                }
                let Some((&codes_expr, handler)) = rest.split_first() else {
                    continue;
                };
                let codes = eval(vm, codes_expr)?;
                if !code_set_matches(vm, codes, code)? {
                    continue;
                }
                // First matching handler wins.
                let mut value = Value::Nil;
                for &stmt in handler {
                    value = eval(vm, stmt)?;
                    vm.heap.set_root(mark, value);
                }
                vm.clear_errno();
                return Ok(value);
            }
            // Nothing matched: keep unwinding with the original error.
            Err(original)
        })();
        if result.is_err() {
            vm.last_error = None;
        }
    }

    // finally runs on every path; its own error replaces the result.
    for &clause in &argv[1..] {
        let elems = args_vec(vm, clause);
        if let Some((&Value::Sym(sym), stmts)) = elems.split_first()
            && sym == finally_sym
        {
            for &stmt in stmts {
                if let Err(thrown) = eval(vm, stmt) {
                    vm.heap.root_truncate(mark);
                    return Err(thrown);
                }
            }
        }
    }

    vm.heap.root_truncate(mark);
    result.map(Step::Done)
}

/// True when `codes` (a single error code or a list of them) contains
/// `code`.
fn code_set_matches(vm: &Vm, codes: Value, code: crate::errors::ErrCode) -> EvalResult<bool> {
    match codes {
        Value::ErrorCode(c) => Ok(c == code),
        Value::Ref(_) => {
            let mut iter = ListIter::new(&vm.heap, codes);
            let mut any = false;
            for item in iter.by_ref() {
                match item {
                    Value::ErrorCode(c) => {
                        if c == code {
                            any = true;
                        }
                    }
                    _ => return Err(throw(BuiltinCode::Etype, "catch expects error codes")),
                }
            }
            if !iter.rest().is_nil() {
                return Err(throw(BuiltinCode::Etype, "catch expects error codes"));
            }
            Ok(any)
        }
        _ => Err(throw(BuiltinCode::Etype, "catch expects error codes")),
    }
}

/// Splits a form into its head and argument vector.
fn split_form(vm: &Vm, form: Value) -> EvalResult<(Value, Vec<Value>)> {
    let Value::Ref(id) = form else {
        return Err(throw(BuiltinCode::Eapi, "preprocessor applied to a non-list"));
    };
    let HeapData::Cons(cons) = vm.heap.get(id) else {
        return Err(throw(BuiltinCode::Eapi, "preprocessor applied to a non-list"));
    };
    Ok((cons.car, args_vec(vm, cons.cdr)))
}
