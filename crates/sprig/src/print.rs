//! The printer: values back to text.
//!
//! Two modes: *display* writes strings as raw bytes, *repr* quotes and
//! escapes them so the output reads back as the same value. Everything
//! else prints identically in both modes. Doubles go through ryu and are
//! normalized so they re-read as doubles.

use std::fmt::Write as _;

use crate::{heap::HeapData, value::Value, vm::Vm};

/// Writes `value` into `out`.
pub(crate) fn write_value(out: &mut String, vm: &Vm, value: Value, repr: bool) {
    match value {
        Value::Nil => out.push_str("()"),
        Value::Int(i) => {
            let _ = write!(out, "{i}");
        }
        Value::Double(d) => write_double(out, d),
        Value::Bool(b) => out.push_str(if b { "true" } else { "false" }),
        Value::Sym(sym) => out.push_str(vm.interner.name(sym)),
        Value::TypeCode(code) => out.push_str(vm.types.name(code)),
        Value::ErrorCode(code) => out.push_str(vm.errors.name(code)),
        Value::UserPtr(ptr) => {
            let _ = write!(out, "#<user-ptr 0x{:x}>", ptr.0);
        }
        Value::Ref(id) => match vm.heap.get(id) {
            HeapData::Cons(_) => write_list(out, vm, value, repr),
            HeapData::Str(_) => write_str(out, vm.heap.str_bytes(id), repr),
            HeapData::Func(_) => out.push_str("#<fn>"),
            HeapData::Macro(_) => out.push_str("#<macro>"),
            HeapData::ExtFunc(ext) => {
                let _ = write!(out, "#<ext-fn {}>", vm.interner.name(ext.name));
            }
            HeapData::SpecialOp(op) => {
                let _ = write!(out, "#<special-op {}>", vm.interner.name(op.name));
            }
            HeapData::Quote(inner) => {
                out.push('\'');
                write_value(out, vm, *inner, repr);
            }
            HeapData::Backquote(inner) => {
                out.push('`');
                write_value(out, vm, *inner, repr);
            }
            HeapData::Comma(inner) => {
                out.push(',');
                write_value(out, vm, *inner, repr);
            }
            HeapData::Splice(inner) => {
                out.push_str(",@");
                write_value(out, vm, *inner, repr);
            }
            HeapData::Env(_) => out.push_str("#<env>"),
            HeapData::Typed(typed) => {
                let _ = write!(out, "#<{} ", vm.types.name(typed.code));
                write_value(out, vm, typed.inner, repr);
                out.push('>');
            }
        },
    }
}

fn write_list(out: &mut String, vm: &Vm, list: Value, repr: bool) {
    out.push('(');
    let mut cur = list;
    let mut first = true;
    loop {
        match cur {
            Value::Nil => break,
            Value::Ref(id) => {
                if let HeapData::Cons(cons) = vm.heap.get(id) {
                    if !first {
                        out.push(' ');
                    }
                    first = false;
                    write_value(out, vm, cons.car, repr);
                    cur = cons.cdr;
                    continue;
                }
                // Improper tail.
                out.push_str(" . ");
                write_value(out, vm, cur, repr);
                break;
            }
            other => {
                out.push_str(" . ");
                write_value(out, vm, other, repr);
                break;
            }
        }
    }
    out.push(')');
}

/// Doubles print via ryu; a plain integral result gains `.0` implicitly
/// from ryu (`1.0`), so every double re-reads as a double.
fn write_double(out: &mut String, d: f64) {
    if d.is_nan() {
        out.push_str("nan");
    } else if d.is_infinite() {
        out.push_str(if d < 0.0 { "-inf" } else { "inf" });
    } else {
        let mut buffer = ryu::Buffer::new();
        out.push_str(buffer.format(d));
    }
}

fn write_str(out: &mut String, bytes: &[u8], repr: bool) {
    if !repr {
        out.push_str(&String::from_utf8_lossy(bytes));
        return;
    }
    out.push('"');
    for &byte in bytes {
        match byte {
            b'"' => out.push_str("\\\""),
            b'\\' => out.push_str("\\\\"),
            b'\n' => out.push_str("\\n"),
            b'\r' => out.push_str("\\r"),
            b'\t' => out.push_str("\\t"),
            0 => out.push_str("\\0"),
            0x20..=0x7e => out.push(byte as char),
            // Non-graphic and non-ASCII bytes escape as \xHH; multibyte
            // UTF-8 stays round-trippable byte for byte.
            _ => {
                let _ = write!(out, "\\x{byte:02x}");
            }
        }
    }
    out.push('"');
}

/// Repr of a form, capped for backtrace entries.
pub(crate) fn short_repr(vm: &Vm, value: Value, max: usize) -> String {
    let mut out = String::new();
    write_value(&mut out, vm, value, true);
    if out.len() > max {
        let mut end = max;
        while !out.is_char_boundary(end) {
            end -= 1;
        }
        out.truncate(end);
        out.push_str("...");
    }
    out
}
