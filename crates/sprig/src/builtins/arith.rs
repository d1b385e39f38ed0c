//! Arithmetic, bitwise, and comparison builtins.
//!
//! Integer arithmetic is checked: wraparound is EOVERFLOW, division by
//! zero EDIVZERO. A double anywhere in an operand list makes the whole
//! operation a double operation.

use crate::{
    errors::{BuiltinCode, EvalResult, Thrown, throw},
    value::Value,
    vm::Vm,
};

pub(crate) fn install(vm: &mut Vm) {
    let installed: Result<(), crate::errors::Error> = (|| {
        vm.defun("+", |vm, args| fold(vm, args, 0, i64::checked_add, |a, b| a + b), None)?;
        vm.defun("*", |vm, args| fold(vm, args, 1, i64::checked_mul, |a, b| a * b), None)?;
        vm.defun("-", bi_sub, None)?;
        vm.defun("/", bi_div, None)?;
        vm.defun("%", bi_mod, None)?;
        vm.defun("bit-and", |vm, args| fold_bits(vm, args, -1, |a, b| a & b), None)?;
        vm.defun("bit-or", |vm, args| fold_bits(vm, args, 0, |a, b| a | b), None)?;
        vm.defun("bit-xor", |vm, args| fold_bits(vm, args, 0, |a, b| a ^ b), None)?;
        vm.defun("bit-not", bi_bit_not, None)?;
        vm.defun("bit-shl", |vm, args| shift(vm, args, i64::checked_shl), None)?;
        vm.defun("bit-shr", |vm, args| shift(vm, args, i64::checked_shr), None)?;
        vm.defun("=", bi_eq, None)?;
        vm.defun("!=", bi_ne, None)?;
        vm.defun("<", |vm, args| compare(vm, args, |o| o == std::cmp::Ordering::Less), None)?;
        vm.defun("<=", |vm, args| compare(vm, args, |o| o != std::cmp::Ordering::Greater), None)?;
        vm.defun(">", |vm, args| compare(vm, args, |o| o == std::cmp::Ordering::Greater), None)?;
        vm.defun(">=", |vm, args| compare(vm, args, |o| o != std::cmp::Ordering::Less), None)?;
        vm.defun("not", bi_not, None)?;
        Ok(())
    })();
    installed.expect("installing arithmetic builtins cannot fail");
}

/// Either width of the numeric pair.
#[derive(Debug, Clone, Copy)]
enum Num {
    Int(i64),
    Dbl(f64),
}

fn as_num(value: Value) -> EvalResult<Num> {
    match value {
        Value::Int(i) => Ok(Num::Int(i)),
        Value::Double(d) => Ok(Num::Dbl(d)),
        _ => Err(throw(BuiltinCode::Etype, "expected a number")),
    }
}

fn overflow() -> Box<Thrown> {
    throw(BuiltinCode::Eoverflow, "integer overflow")
}

fn num_value(num: Num) -> Value {
    match num {
        Num::Int(i) => Value::Int(i),
        Num::Dbl(d) => Value::Double(d),
    }
}

/// Variadic fold with double contagion.
fn fold(
    _vm: &mut Vm,
    args: &[Value],
    unit: i64,
    int_op: fn(i64, i64) -> Option<i64>,
    dbl_op: fn(f64, f64) -> f64,
) -> EvalResult<Value> {
    let mut acc = Num::Int(unit);
    for &arg in args {
        acc = apply_num(acc, as_num(arg)?, int_op, dbl_op)?;
    }
    Ok(num_value(acc))
}

fn apply_num(
    left: Num,
    right: Num,
    int_op: fn(i64, i64) -> Option<i64>,
    dbl_op: fn(f64, f64) -> f64,
) -> EvalResult<Num> {
    Ok(match (left, right) {
        (Num::Int(a), Num::Int(b)) => Num::Int(int_op(a, b).ok_or_else(overflow)?),
        (Num::Int(a), Num::Dbl(b)) => Num::Dbl(dbl_op(a as f64, b)),
        (Num::Dbl(a), Num::Int(b)) => Num::Dbl(dbl_op(a, b as f64)),
        (Num::Dbl(a), Num::Dbl(b)) => Num::Dbl(dbl_op(a, b)),
    })
}

fn bi_sub(_vm: &mut Vm, args: &[Value]) -> EvalResult<Value> {
    match args {
        [] => Err(throw(BuiltinCode::Evalue, "- takes at least one argument")),
        [only] => match as_num(*only)? {
            Num::Int(i) => Ok(Value::Int(i.checked_neg().ok_or_else(overflow)?)),
            Num::Dbl(d) => Ok(Value::Double(-d)),
        },
        [first, rest @ ..] => {
            let mut acc = as_num(*first)?;
            for &arg in rest {
                acc = apply_num(acc, as_num(arg)?, i64::checked_sub, |a, b| a - b)?;
            }
            Ok(num_value(acc))
        }
    }
}

fn bi_div(_vm: &mut Vm, args: &[Value]) -> EvalResult<Value> {
    let [first, rest @ ..] = args else {
        return Err(throw(BuiltinCode::Evalue, "/ takes at least two arguments"));
    };
    if rest.is_empty() {
        return Err(throw(BuiltinCode::Evalue, "/ takes at least two arguments"));
    }
    let mut acc = as_num(*first)?;
    for &arg in rest {
        let rhs = as_num(arg)?;
        if let (Num::Int(_), Num::Int(0)) = (acc, rhs) {
            return Err(throw(BuiltinCode::Edivzero, "division by zero"));
        }
        acc = apply_num(acc, rhs, i64::checked_div, |a, b| a / b)?;
    }
    Ok(num_value(acc))
}

fn bi_mod(_vm: &mut Vm, args: &[Value]) -> EvalResult<Value> {
    let [Value::Int(a), Value::Int(b)] = args else {
        return Err(throw(BuiltinCode::Etype, "% takes two integers"));
    };
    if *b == 0 {
        return Err(throw(BuiltinCode::Edivzero, "division by zero"));
    }
    a.checked_rem(*b).map(Value::Int).ok_or_else(overflow)
}

fn fold_bits(_vm: &mut Vm, args: &[Value], unit: i64, op: fn(i64, i64) -> i64) -> EvalResult<Value> {
    let mut acc = unit;
    for &arg in args {
        let Value::Int(i) = arg else {
            return Err(throw(BuiltinCode::Etype, "bitwise operations take integers"));
        };
        acc = op(acc, i);
    }
    Ok(Value::Int(acc))
}

fn bi_bit_not(_vm: &mut Vm, args: &[Value]) -> EvalResult<Value> {
    let [Value::Int(i)] = args else {
        return Err(throw(BuiltinCode::Etype, "bit-not takes one integer"));
    };
    Ok(Value::Int(!i))
}

fn shift(_vm: &mut Vm, args: &[Value], op: fn(i64, u32) -> Option<i64>) -> EvalResult<Value> {
    let [Value::Int(value), Value::Int(by)] = args else {
        return Err(throw(BuiltinCode::Etype, "shifts take two integers"));
    };
    let by = u32::try_from(*by)
        .ok()
        .filter(|&b| b < 64)
        .ok_or_else(|| throw(BuiltinCode::Evalue, "shift amount out of range"))?;
    op(*value, by).map(Value::Int).ok_or_else(overflow)
}

fn bi_eq(vm: &mut Vm, args: &[Value]) -> EvalResult<Value> {
    let [first, rest @ ..] = args else {
        return Err(throw(BuiltinCode::Evalue, "= takes at least two arguments"));
    };
    if rest.is_empty() {
        return Err(throw(BuiltinCode::Evalue, "= takes at least two arguments"));
    }
    Ok(Value::Bool(rest.iter().all(|&arg| vm.eq(*first, arg))))
}

fn bi_ne(vm: &mut Vm, args: &[Value]) -> EvalResult<Value> {
    match bi_eq(vm, args)? {
        Value::Bool(b) => Ok(Value::Bool(!b)),
        _ => unreachable!("= produces a bool"),
    }
}

/// Chained numeric comparison: `(< 1 2 3)` holds when every adjacent pair
/// does.
fn compare(_vm: &mut Vm, args: &[Value], accept: fn(std::cmp::Ordering) -> bool) -> EvalResult<Value> {
    if args.len() < 2 {
        return Err(throw(BuiltinCode::Evalue, "comparisons take at least two arguments"));
    }
    for pair in args.windows(2) {
        let ordering = match (as_num(pair[0])?, as_num(pair[1])?) {
            (Num::Int(a), Num::Int(b)) => a.cmp(&b),
            (left, right) => {
                let a = match left {
                    Num::Int(i) => i as f64,
                    Num::Dbl(d) => d,
                };
                let b = match right {
                    Num::Int(i) => i as f64,
                    Num::Dbl(d) => d,
                };
                a.partial_cmp(&b)
                    .ok_or_else(|| throw(BuiltinCode::Evalue, "comparison with nan"))?
            }
        };
        if !accept(ordering) {
            return Ok(Value::Bool(false));
        }
    }
    Ok(Value::Bool(true))
}

fn bi_not(_vm: &mut Vm, args: &[Value]) -> EvalResult<Value> {
    let [value] = args else {
        return Err(throw(BuiltinCode::Evalue, "not takes one argument"));
    };
    Ok(Value::Bool(!value.is_truthy()))
}
