//! Pattern matcher tests: the host match API and the `case` form.

use sprig::{BuiltinCode, ErrCode, MatchFlags, Vm};

fn eval_repr(source: &str) -> String {
    let mut vm = Vm::new();
    let value = vm.eval_string(source, "<test>").expect("evaluation should succeed");
    vm.repr(value)
}

fn eval_err(source: &str) -> ErrCode {
    let mut vm = Vm::new();
    vm.eval_string(source, "<test>")
        .expect_err("evaluation should fail")
        .code
}

// =============================================================================
// 1. Host match API
// =============================================================================

#[test]
fn identifier_patterns_bind() {
    let mut vm = Vm::new();
    let pattern = vm.readstr("(a b)").unwrap();
    let value = vm.readstr("(1 2)").unwrap();
    assert!(vm.match_in(pattern, value, MatchFlags::empty()).unwrap());
    let a = vm.get("a").unwrap();
    let b = vm.get("b").unwrap();
    assert_eq!(vm.repr(a), "1");
    assert_eq!(vm.repr(b), "2");
}

#[test]
fn wildcard_matches_without_binding() {
    let mut vm = Vm::new();
    let pattern = vm.readstr("(_ x)").unwrap();
    let value = vm.readstr("(1 2)").unwrap();
    assert!(vm.match_in(pattern, value, MatchFlags::empty()).unwrap());
    assert!(vm.try_get("_").unwrap().is_none(), "`_` must not be bound");
    let x = vm.get("x").unwrap();
    assert_eq!(vm.repr(x), "2");
}

#[test]
fn length_mismatch_fails_without_binding() {
    let mut vm = Vm::new();
    let pattern = vm.readstr("(a b c)").unwrap();
    let value = vm.readstr("(1 2)").unwrap();
    assert!(!vm.match_in(pattern, value, MatchFlags::empty()).unwrap());
    assert!(vm.try_get("a").unwrap().is_none(), "a failed match must bind nothing");
}

#[test]
fn improper_pattern_takes_the_tail() {
    let mut vm = Vm::new();
    let pattern = vm.readstr("(: first rest)").unwrap();
    let value = vm.readstr("(1 2 3)").unwrap();
    assert!(vm.match_in(pattern, value, MatchFlags::empty()).unwrap());
    let first = vm.get("first").unwrap();
    let rest = vm.get("rest").unwrap();
    assert_eq!(vm.repr(first), "1");
    assert_eq!(vm.repr(rest), "(2 3)");
}

#[test]
fn literal_patterns_compare_by_equality() {
    let mut vm = Vm::new();
    let pattern = vm.readstr("(1 \"s\" x)").unwrap();
    let hit = vm.readstr("(1 \"s\" 3)").unwrap();
    assert!(vm.match_in(pattern, hit, MatchFlags::empty()).unwrap());
    let miss = vm.readstr("(2 \"s\" 3)").unwrap();
    assert!(!vm.match_in(pattern, miss, MatchFlags::empty()).unwrap());
}

#[test]
fn read_only_flag_makes_bindings_const() {
    let mut vm = Vm::new();
    let pattern = vm.readstr("k").unwrap();
    let value = vm.readstr("7").unwrap();
    assert!(vm.match_in(pattern, value, MatchFlags::READ_ONLY).unwrap());
    let err = vm.set("k", sprig::Value::Int(8)).expect_err("read-only binding");
    assert_eq!(err.code, ErrCode::from(BuiltinCode::Ereadonly));
}

// =============================================================================
// 2. case
// =============================================================================

#[test]
fn case_selects_the_matching_clause() {
    assert_eq!(eval_repr(r#"(case 2 (1 "a") (2 "b") (_ "c"))"#), "\"b\"");
    assert_eq!(eval_repr(r#"(case 9 (1 "a") (2 "b") (_ "c"))"#), "\"c\"");
}

#[test]
fn case_destructures_and_binds() {
    assert_eq!(
        eval_repr("(case '(1 2 3) ((a) 'one) ((a b) 'two) ((: a rest) rest))"),
        "(2 3)"
    );
}

#[test]
fn case_without_a_match_is_ematch() {
    assert_eq!(eval_err("(case 5 (1 'one) (2 'two))"), ErrCode::from(BuiltinCode::Ematch));
}

#[test]
fn case_bodies_run_in_the_clause_scope() {
    assert_eq!(eval_repr("(def x 'outer) (case 5 (x x))"), "5");
}
