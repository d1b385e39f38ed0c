//! The quasiquotation engine.
//!
//! Walks a backquoted tree with a nesting level (0 at the outermost
//! backquote). Commas at level 0 evaluate; splices at level 0 evaluate and
//! contribute their whole list in place, which is only legal inside a
//! list. Deeper commas and splices unwrap one level and are re-wrapped,
//! and nested backquotes push the level up.

use crate::{
    errors::{BuiltinCode, EvalResult, throw},
    eval::eval,
    heap::{Cons, HeapData},
    value::{ListIter, Value},
    vm::Vm,
};

/// Outcome of expanding one element.
pub(crate) enum QqOut {
    /// A single value, contributed as one cons.
    Value(Value),
    /// A whole list to splice into the surrounding list.
    Spliced(Value),
}

impl QqOut {
    /// Unwraps a value in a position where splicing is not legal.
    fn single(self, context: &str) -> EvalResult<Value> {
        match self {
            Self::Value(value) => Ok(value),
            Self::Spliced(_) => Err(throw(
                BuiltinCode::Eeval,
                format!("`,@` {context}"),
            )),
        }
    }
}

/// Expands one backquoted tree at the given nesting level.
pub(crate) fn expand(vm: &mut Vm, tree: Value, nest: u32) -> EvalResult<QqOut> {
    let Value::Ref(id) = tree else {
        return Ok(QqOut::Value(tree));
    };
    match vm.heap.get(id) {
        HeapData::Cons(_) => expand_list(vm, tree, nest).map(QqOut::Value),
        HeapData::Quote(inner) => {
            let inner = *inner;
            let expanded = expand(vm, inner, nest)?.single("inside quote")?;
            rewrap(vm, expanded, HeapData::Quote)
        }
        HeapData::Backquote(inner) => {
            let inner = *inner;
            let expanded = expand(vm, inner, nest + 1)?.single("inside backquote")?;
            rewrap(vm, expanded, HeapData::Backquote)
        }
        HeapData::Comma(inner) => {
            let inner = *inner;
            if nest == 0 {
                eval(vm, inner).map(QqOut::Value)
            } else {
                let expanded = expand(vm, inner, nest - 1)?.single("inside unquote")?;
                rewrap(vm, expanded, HeapData::Comma)
            }
        }
        HeapData::Splice(inner) => {
            let inner = *inner;
            if nest == 0 {
                let value = eval(vm, inner)?;
                if !is_proper_list(vm, value) {
                    return Err(throw(BuiltinCode::Etype, "`,@` expression must produce a list"));
                }
                Ok(QqOut::Spliced(value))
            } else {
                let expanded = expand(vm, inner, nest - 1)?.single("inside splice")?;
                rewrap(vm, expanded, HeapData::Splice)
            }
        }
        _ => Ok(QqOut::Value(tree)),
    }
}

fn rewrap(vm: &mut Vm, inner: Value, make: fn(Value) -> HeapData) -> EvalResult<QqOut> {
    vm.heap.root(inner);
    let id = vm.alloc(make(inner))?;
    Ok(QqOut::Value(Value::Ref(id)))
}

fn is_proper_list(vm: &Vm, value: Value) -> bool {
    let mut iter = ListIter::new(&vm.heap, value);
    for _ in iter.by_ref() {}
    iter.rest().is_nil()
}

/// Expands a list template: value contributions become single conses,
/// splice contributions are appended element by element.
fn expand_list(vm: &mut Vm, list: Value, nest: u32) -> EvalResult<Value> {
    let mark = vm.heap.root_mark();
    let elements: Vec<Value> = ListIter::new(&vm.heap, list).collect();
    let mut out: Vec<Value> = Vec::with_capacity(elements.len());
    for element in elements {
        match expand(vm, element, nest)? {
            QqOut::Value(value) => {
                vm.heap.root(value);
                out.push(value);
            }
            QqOut::Spliced(spliced) => {
                vm.heap.root(spliced);
                for value in ListIter::new(&vm.heap, spliced).collect::<Vec<_>>() {
                    out.push(value);
                }
            }
        }
    }
    let mut built = Value::Nil;
    for value in out.into_iter().rev() {
        let id = vm.alloc(HeapData::Cons(Cons {
            car: value,
            cdr: built,
            debug: None,
        }))?;
        built = Value::Ref(id);
        vm.heap.root(built);
    }
    vm.heap.root_truncate(mark);
    Ok(built)
}
