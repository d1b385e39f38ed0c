//! List builtins: the cons constructor and basic accessors.

use crate::{
    errors::{BuiltinCode, EvalResult, throw},
    heap::{Cons, HeapData},
    value::{ListIter, Value},
    vm::Vm,
};

pub(crate) fn install(vm: &mut Vm) {
    let installed: Result<(), crate::errors::Error> = (|| {
        vm.defun(":", bi_cons, None)?;
        vm.defun("head", bi_head, None)?;
        vm.defun("tail", bi_tail, None)?;
        vm.defun("list?", bi_is_list, None)?;
        vm.defun("length", bi_length, None)?;
        Ok(())
    })();
    installed.expect("installing list builtins cannot fail");
}

/// `(: a b tail)` folds right into `(a b . tail)`; the last argument
/// seeds the tail, so `(: 3 4 nil)` is the list `(3 4)`.
fn bi_cons(vm: &mut Vm, args: &[Value]) -> EvalResult<Value> {
    let [init @ .., last] = args else {
        return Err(throw(BuiltinCode::Evalue, ": takes at least one argument"));
    };
    let mark = vm.heap.root_mark();
    let mut out = *last;
    let mut result = Ok(());
    for &car in init.iter().rev() {
        match vm.alloc(HeapData::Cons(Cons { car, cdr: out, debug: None })) {
            Ok(id) => {
                out = Value::Ref(id);
                vm.heap.root(out);
            }
            Err(err) => {
                result = Err(err);
                break;
            }
        }
    }
    vm.heap.root_truncate(mark);
    result.map(|()| out)
}

fn expect_cons(vm: &Vm, value: Value, what: &str) -> EvalResult<Cons> {
    match value {
        Value::Ref(id) => match vm.heap.get(id) {
            HeapData::Cons(cons) => Ok(*cons),
            _ => Err(throw(BuiltinCode::Etype, format!("{what} takes a list"))),
        },
        Value::Nil => Err(throw(BuiltinCode::Evalue, format!("{what} of an empty list"))),
        _ => Err(throw(BuiltinCode::Etype, format!("{what} takes a list"))),
    }
}

fn bi_head(vm: &mut Vm, args: &[Value]) -> EvalResult<Value> {
    let [list] = args else {
        return Err(throw(BuiltinCode::Evalue, "head takes one argument"));
    };
    expect_cons(vm, *list, "head").map(|cons| cons.car)
}

fn bi_tail(vm: &mut Vm, args: &[Value]) -> EvalResult<Value> {
    let [list] = args else {
        return Err(throw(BuiltinCode::Evalue, "tail takes one argument"));
    };
    expect_cons(vm, *list, "tail").map(|cons| cons.cdr)
}

fn bi_is_list(vm: &mut Vm, args: &[Value]) -> EvalResult<Value> {
    let [value] = args else {
        return Err(throw(BuiltinCode::Evalue, "list? takes one argument"));
    };
    let mut iter = ListIter::new(&vm.heap, *value);
    for _ in iter.by_ref() {}
    Ok(Value::Bool(iter.rest().is_nil()))
}

fn bi_length(vm: &mut Vm, args: &[Value]) -> EvalResult<Value> {
    let [value] = args else {
        return Err(throw(BuiltinCode::Evalue, "length takes one argument"));
    };
    match crate::value::list_len(&vm.heap, *value) {
        Some(len) => Ok(Value::Int(len as i64)),
        None => Err(throw(BuiltinCode::Etype, "length takes a proper list")),
    }
}
