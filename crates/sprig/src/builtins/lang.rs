//! Reflective builtins: evaluation, application, macroexpansion, errors,
//! the GC trigger, and type inspection.

use crate::{
    env,
    errors::{BuiltinCode, EvalResult, Thrown, throw},
    eval::{apply, eval},
    heap::HeapData,
    parse::Reader,
    prepare,
    value::Value,
    vm::Vm,
};

pub(crate) fn install(vm: &mut Vm) {
    let installed: Result<(), crate::errors::Error> = (|| {
        vm.defun("eval", bi_eval, None)?;
        vm.defun("apply", bi_apply, None)?;
        vm.defun("macroexpand", bi_macroexpand, None)?;
        vm.defun("macroexpand-once", bi_macroexpand_once, None)?;
        vm.defun("throw", bi_throw, None)?;
        vm.defun("new-error-code", bi_new_error_code, None)?;
        vm.defun("gc", bi_gc, None)?;
        vm.defun("env", bi_env, None)?;
        vm.defun("type-of", bi_type_of, None)?;
        vm.defun("read-string", bi_read_string, None)?;
        Ok(())
    })();
    installed.expect("installing language builtins cannot fail");
}

/// `(eval form)` or `(eval form env)`: preprocess and evaluate, optionally
/// inside an explicit environment value.
fn bi_eval(vm: &mut Vm, args: &[Value]) -> EvalResult<Value> {
    let (form, env_value) = match args {
        [form] => (*form, None),
        [form, env_value] => (*form, Some(*env_value)),
        _ => return Err(throw(BuiltinCode::Evalue, "eval takes a form and an optional environment")),
    };
    let saved = vm.env;
    if let Some(env_value) = env_value {
        let Value::Ref(id) = env_value else {
            return Err(throw(BuiltinCode::Etype, "eval environment must be an environment value"));
        };
        if !matches!(vm.heap.get(id), HeapData::Env(_)) {
            return Err(throw(BuiltinCode::Etype, "eval environment must be an environment value"));
        }
        vm.env = id;
    }
    let mark = vm.heap.root_mark();
    vm.heap.root(form);
    let result = prepare::preproc(vm, form).and_then(|prepared| {
        vm.heap.set_root(mark, prepared);
        eval(vm, prepared)
    });
    vm.heap.root_truncate(mark);
    vm.env = saved;
    result
}

/// `(apply f args)`: call without re-evaluating the argument list.
fn bi_apply(vm: &mut Vm, args: &[Value]) -> EvalResult<Value> {
    let [func, arg_list] = args else {
        return Err(throw(BuiltinCode::Evalue, "apply takes a function and an argument list"));
    };
    apply(vm, *func, *arg_list)
}

fn bi_macroexpand(vm: &mut Vm, args: &[Value]) -> EvalResult<Value> {
    let [form] = args else {
        return Err(throw(BuiltinCode::Evalue, "macroexpand takes one form"));
    };
    prepare::macroexpand(vm, *form)
}

fn bi_macroexpand_once(vm: &mut Vm, args: &[Value]) -> EvalResult<Value> {
    let [form] = args else {
        return Err(throw(BuiltinCode::Evalue, "macroexpand-once takes one form"));
    };
    prepare::macroexpand_once(vm, *form).map(|out| out.unwrap_or(*form))
}

/// `(throw CODE msg?)`: raise an error with an optional message string.
fn bi_throw(vm: &mut Vm, args: &[Value]) -> EvalResult<Value> {
    let (code, msg) = match args {
        [Value::ErrorCode(code)] => (*code, None),
        [Value::ErrorCode(code), msg] => {
            let Some(bytes) = vm.string_bytes(*msg) else {
                return Err(throw(BuiltinCode::Etype, "throw message must be a string"));
            };
            (*code, Some(String::from_utf8_lossy(bytes).into_owned()))
        }
        _ => return Err(throw(BuiltinCode::Etype, "throw takes an error code and an optional message")),
    };
    Err(Thrown::new(code, msg))
}

/// `(new-error-code "ENAME")`: register a user error code and bind its
/// name globally. Registering an existing name yields the existing code.
fn bi_new_error_code(vm: &mut Vm, args: &[Value]) -> EvalResult<Value> {
    let [name] = args else {
        return Err(throw(BuiltinCode::Evalue, "new-error-code takes one name string"));
    };
    let Some(bytes) = vm.string_bytes(*name) else {
        return Err(throw(BuiltinCode::Etype, "new-error-code takes a string"));
    };
    let name = String::from_utf8_lossy(bytes).into_owned();
    let existing = vm.errors.find(&name);
    let code = vm.errors.register(&name);
    if existing.is_none() {
        let sym = vm.interner.intern(&name);
        let global = vm.global;
        env::define_symbol(
            vm,
            global,
            sym,
            crate::env::SymbolRecord::plain(Value::ErrorCode(code), true),
        )?;
    }
    Ok(Value::ErrorCode(code))
}

/// `(gc)`: force a collection; the result is the number of objects freed.
fn bi_gc(vm: &mut Vm, args: &[Value]) -> EvalResult<Value> {
    if !args.is_empty() {
        return Err(throw(BuiltinCode::Evalue, "gc takes no arguments"));
    }
    let freed = vm.collect_garbage();
    Ok(Value::Int(freed as i64))
}

/// `(env)`: the current environment as a first-class value.
fn bi_env(vm: &mut Vm, args: &[Value]) -> EvalResult<Value> {
    if !args.is_empty() {
        return Err(throw(BuiltinCode::Evalue, "env takes no arguments"));
    }
    // The environment escapes into a value; its frames may no longer be
    // freed eagerly on pop.
    env::mark_escaping(&mut vm.heap, vm.env);
    Ok(Value::Ref(vm.env))
}

fn bi_type_of(vm: &mut Vm, args: &[Value]) -> EvalResult<Value> {
    let [value] = args else {
        return Err(throw(BuiltinCode::Evalue, "type-of takes one argument"));
    };
    Ok(Value::TypeCode(vm.type_of(*value)))
}

/// `(read-string "src")`: read one form from a string.
fn bi_read_string(vm: &mut Vm, args: &[Value]) -> EvalResult<Value> {
    let [source] = args else {
        return Err(throw(BuiltinCode::Evalue, "read-string takes one string"));
    };
    let Some(bytes) = vm.string_bytes(*source) else {
        return Err(throw(BuiltinCode::Etype, "read-string takes a string"));
    };
    let bytes = bytes.to_vec();
    let mut reader = Reader::new(vm, bytes, "<read-string>");
    match reader.read_one(vm)? {
        Some(value) => Ok(value),
        None => Err(crate::errors::throw_bare(BuiltinCode::Eeof)),
    }
}
