//! String builtins. Strings are immutable byte sequences; `substr` shares
//! the original backing storage instead of copying.

use std::fmt::Write as _;

use crate::{
    errors::{BuiltinCode, EvalResult, throw},
    heap::{Cons, HeapData, HeapId, Str},
    value::Value,
    vm::Vm,
};

pub(crate) fn install(vm: &mut Vm) {
    let installed: Result<(), crate::errors::Error> = (|| {
        vm.defun("string-length", bi_string_length, None)?;
        vm.defun("string-bytes", bi_string_bytes, None)?;
        vm.defun("substr", bi_substr, None)?;
        vm.defun("strcat", bi_strcat, None)?;
        vm.defun("format", bi_format, None)?;
        Ok(())
    })();
    installed.expect("installing string builtins cannot fail");
}

fn expect_str(vm: &Vm, value: Value, what: &str) -> EvalResult<HeapId> {
    if let Value::Ref(id) = value
        && matches!(vm.heap.get(id), HeapData::Str(_))
    {
        return Ok(id);
    }
    Err(throw(BuiltinCode::Etype, format!("{what} takes a string")))
}

fn bi_string_length(vm: &mut Vm, args: &[Value]) -> EvalResult<Value> {
    let [value] = args else {
        return Err(throw(BuiltinCode::Evalue, "string-length takes one argument"));
    };
    let id = expect_str(vm, *value, "string-length")?;
    Ok(Value::Int(vm.heap.str_bytes(id).len() as i64))
}

fn bi_string_bytes(vm: &mut Vm, args: &[Value]) -> EvalResult<Value> {
    let [value] = args else {
        return Err(throw(BuiltinCode::Evalue, "string-bytes takes one argument"));
    };
    let id = expect_str(vm, *value, "string-bytes")?;
    let bytes: Vec<u8> = vm.heap.str_bytes(id).to_vec();
    let mark = vm.heap.root_mark();
    let mut out = Value::Nil;
    let mut result = Ok(());
    for &byte in bytes.iter().rev() {
        match vm.alloc(HeapData::Cons(Cons {
            car: Value::Int(i64::from(byte)),
            cdr: out,
            debug: None,
        })) {
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

/// `(substr s start len?)`: a slice sharing the source's backing storage.
/// Slices of slices re-point at the original owner, so chains stay one
/// level deep.
fn bi_substr(vm: &mut Vm, args: &[Value]) -> EvalResult<Value> {
    let (value, start, len) = match args {
        [value, Value::Int(start)] => (*value, *start, None),
        [value, Value::Int(start), Value::Int(len)] => (*value, *start, Some(*len)),
        _ => return Err(throw(BuiltinCode::Etype, "substr takes a string, a start, and an optional length")),
    };
    let id = expect_str(vm, value, "substr")?;
    let total = vm.heap.str_bytes(id).len();
    let start = usize::try_from(start).map_err(|_| throw(BuiltinCode::Eindex, "substr start out of range"))?;
    if start > total {
        return Err(throw(BuiltinCode::Eindex, "substr start out of range"));
    }
    let len = match len {
        Some(len) => {
            let len = usize::try_from(len).map_err(|_| throw(BuiltinCode::Eindex, "substr length out of range"))?;
            if start + len > total {
                return Err(throw(BuiltinCode::Eindex, "substr length out of range"));
            }
            len
        }
        None => total - start,
    };
    let (origin, base) = match vm.heap.get(id) {
        HeapData::Str(Str::Owned(_)) => (id, 0),
        HeapData::Str(Str::Slice { origin, start: base, .. }) => (*origin, *base),
        _ => unreachable!("expect_str checked the tag"),
    };
    let slice = vm.alloc(HeapData::Str(Str::Slice {
        origin,
        start: base + start,
        len,
    }))?;
    Ok(Value::Ref(slice))
}

fn bi_strcat(vm: &mut Vm, args: &[Value]) -> EvalResult<Value> {
    let mut bytes: Vec<u8> = Vec::new();
    for &arg in args {
        let id = expect_str(vm, arg, "strcat")?;
        bytes.extend_from_slice(vm.heap.str_bytes(id));
    }
    vm.alloc_string(&bytes)
}

/// `(format fmt args...)`: `{}` takes the next argument in display form,
/// `{!r}` in repr form; `{{` and `}}` are literal braces.
fn bi_format(vm: &mut Vm, args: &[Value]) -> EvalResult<Value> {
    let [fmt, rest @ ..] = args else {
        return Err(throw(BuiltinCode::Evalue, "format takes a format string"));
    };
    let id = expect_str(vm, *fmt, "format")?;
    let spec = String::from_utf8_lossy(vm.heap.str_bytes(id)).into_owned();

    let mut out = String::new();
    let mut next = 0usize;
    let mut chars = spec.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                out.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                out.push('}');
            }
            '{' => {
                let mut directive = String::new();
                loop {
                    match chars.next() {
                        Some('}') => break,
                        Some(c) => directive.push(c),
                        None => return Err(throw(BuiltinCode::Evalue, "unterminated format directive")),
                    }
                }
                let arg = *rest
                    .get(next)
                    .ok_or_else(|| throw(BuiltinCode::Eindex, "not enough arguments for format string"))?;
                next += 1;
                match directive.as_str() {
                    "" => {
                        let _ = write!(out, "{}", vm.display(arg));
                    }
                    "!r" => {
                        let _ = write!(out, "{}", vm.repr(arg));
                    }
                    other => {
                        return Err(throw(
                            BuiltinCode::Evalue,
                            format!("unknown format directive `{{{other}}}`"),
                        ));
                    }
                }
            }
            '}' => return Err(throw(BuiltinCode::Evalue, "unmatched `}` in format string")),
            other => out.push(other),
        }
    }
    vm.alloc_string(out.as_bytes())
}
