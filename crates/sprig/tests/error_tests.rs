//! Error handling: throw, try/catch/finally, errno/errmsg, arithmetic
//! error codes, user codes, and backtrace rendering.

use std::{cell::Cell, rc::Rc};

use sprig::{BuiltinCode, CollectStringPrint, ErrCode, Vm};

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
// 1. Throwing and catching
// =============================================================================

#[test]
fn caught_error_binds_errmsg() {
    assert_eq!(eval_repr(r#"(try (throw EVALUE "oops") (catch EVALUE errmsg))"#), "\"oops\"");
}

#[test]
fn uncaught_codes_keep_unwinding() {
    assert_eq!(eval_err(r#"(try (throw EIO "io") (catch EVALUE 1))"#), ErrCode::from(BuiltinCode::Eio));
}

#[test]
fn catch_matches_a_code_list() {
    assert_eq!(
        eval_repr(r#"(try (throw EIO) (catch (: EVALUE EIO nil) 'got-it))"#),
        "got-it"
    );
}

#[test]
fn first_matching_catch_wins() {
    // The first catch whose code set contains the thrown code runs,
    // and no later one.
    assert_eq!(
        eval_repr(
            r#"(try (throw EVALUE)
                 (catch EIO 'io)
                 (catch EVALUE 'first)
                 (catch EVALUE 'second))"#
        ),
        "first"
    );
}

#[test]
fn errno_reports_the_code_inside_the_handler() {
    assert_eq!(eval_repr(r#"(try (throw EVALUE "x") (catch EVALUE errno))"#), "EVALUE");
}

#[test]
fn try_without_error_skips_handlers() {
    assert_eq!(eval_repr("(try 42 (catch EVALUE 'nope))"), "42");
}

#[test]
fn rethrow_from_handler_propagates() {
    assert_eq!(
        eval_err(r#"(try (throw EVALUE) (catch EVALUE (throw EIO "worse")))"#),
        ErrCode::from(BuiltinCode::Eio)
    );
}

// =============================================================================
// 2. finally
// =============================================================================

#[test]
fn finally_runs_exactly_once_on_success_and_failure() {
    let probe = Rc::new(Cell::new(0i64));
    let mut vm = Vm::new();
    vm.sync_int("probe", Rc::clone(&probe), false).unwrap();

    vm.eval_string("(try 1 (finally (set probe (+ probe 1))))", "<test>").unwrap();
    assert_eq!(probe.get(), 1, "finally must run after a clean body");

    vm.eval_string(
        "(try (throw EVALUE) (catch EVALUE 2) (finally (set probe (+ probe 10))))",
        "<test>",
    )
    .unwrap();
    assert_eq!(probe.get(), 11, "finally must run after a handled error");

    let err = vm
        .eval_string("(try (throw EIO) (catch EVALUE 3) (finally (set probe (+ probe 100))))", "<test>")
        .expect_err("EIO has no handler here");
    assert_eq!(err.code, ErrCode::from(BuiltinCode::Eio));
    assert_eq!(probe.get(), 111, "finally must run even when the handler rethrows");
}

#[test]
fn finally_error_replaces_the_result() {
    assert_eq!(eval_err(r#"(try 1 (finally (throw EIO "cleanup")))"#), ErrCode::from(BuiltinCode::Eio));
}

// =============================================================================
// 3. Arithmetic error codes
// =============================================================================

#[test]
fn division_by_zero_and_overflow_are_recoverable() {
    let mut vm = Vm::new();
    let err = vm.eval_string("(/ 1 0)", "<test>").expect_err("EDIVZERO");
    assert_eq!(err.code, ErrCode::from(BuiltinCode::Edivzero));
    vm.clear_errno();

    let err = vm
        .eval_string("(+ 9223372036854775807 1)", "<test>")
        .expect_err("EOVERFLOW");
    assert_eq!(err.code, ErrCode::from(BuiltinCode::Eoverflow));
    vm.clear_errno();

    let value = vm.eval_string("(+ 1 2)", "<test>").expect("arithmetic still works");
    assert_eq!(vm.repr(value), "3");
}

#[test]
fn modulo_by_zero() {
    assert_eq!(eval_err("(% 5 0)"), ErrCode::from(BuiltinCode::Edivzero));
}

#[test]
fn divzero_is_catchable_in_language() {
    assert_eq!(eval_repr("(try (/ 1 0) (catch EDIVZERO 'saved))"), "saved");
}

// =============================================================================
// 4. User error codes
// =============================================================================

#[test]
fn user_codes_throw_and_catch_like_builtins() {
    assert_eq!(
        eval_repr(
            r#"(new-error-code "EFROB")
               (try (throw EFROB "frobbed") (catch EFROB errmsg))"#
        ),
        "\"frobbed\""
    );
}

#[test]
fn user_codes_register_through_the_host_api() {
    let mut vm = Vm::new();
    let code = vm.new_error_code("EHOST").unwrap();
    assert!(code.is_user());
    assert_eq!(vm.find_error_code("EHOST"), Some(code));
    assert_eq!(vm.error_code_name(code), "EHOST");
    // The name is bound globally and usable from scripts.
    let value = vm.eval_string("EHOST", "<test>").unwrap();
    assert_eq!(vm.repr(value), "EHOST");
}

// =============================================================================
// 5. errno state on the handle
// =============================================================================

#[test]
fn public_errors_set_and_clear_errno() {
    let mut vm = Vm::new();
    assert_eq!(vm.errno(), None);
    let _ = vm.eval_string("(/ 1 0)", "<test>").expect_err("EDIVZERO");
    assert_eq!(vm.errno(), Some(ErrCode::from(BuiltinCode::Edivzero)));
    vm.clear_errno();
    assert_eq!(vm.errno(), None);
}

// =============================================================================
// 6. Backtraces
// =============================================================================

#[test]
fn perror_prints_the_failing_call_chain() {
    let collector = CollectStringPrint::default();
    let mut vm = Vm::new();
    vm.set_writer(Box::new(collector.clone()));
    let _ = vm
        .eval_string(
            "(def inner (fn () (/ 1 0)))\n(def outer (fn () (inner)))\n(outer)",
            "bt.lisp",
        )
        .expect_err("EDIVZERO");
    vm.perror("sprig");
    let report = collector.stderr();
    assert!(report.contains("Backtrace"), "missing backtrace header: {report}");
    assert!(report.contains("(/ 1 0)"), "missing innermost call site: {report}");
    assert!(report.contains("bt.lisp"), "missing source file: {report}");
    assert!(report.contains("division by zero (EDIVZERO)"), "missing message line: {report}");
}

#[test]
fn backtrace_honors_the_configured_limit() {
    let collector = CollectStringPrint::default();
    let mut vm = Vm::new();
    vm.set_writer(Box::new(collector.clone()));
    vm.set_config_int("bt-limit", 2).unwrap();
    vm.set_config_bool("tail-call-elimination", false).unwrap();
    let _ = vm
        .eval_string(
            "(def f (fn (n) (if (= n 0) (/ 1 0) (f (- n 1)))))\n(f 6)",
            "<test>",
        )
        .expect_err("EDIVZERO");
    vm.perror("sprig");
    let report = collector.stderr();
    assert!(
        report.contains("truncated to last 2 calls"),
        "missing truncation banner: {report}"
    );
}

#[test]
fn elided_tail_calls_leave_a_placeholder() {
    let collector = CollectStringPrint::default();
    let mut vm = Vm::new();
    vm.set_writer(Box::new(collector.clone()));
    let _ = vm
        .eval_string(
            "(def f (fn (n) (if (= n 0) (boom) (f (- n 1)))))\n(f 5)",
            "<test>",
        )
        .expect_err("ENOSYM from boom");
    vm.perror("sprig");
    let report = collector.stderr();
    assert!(
        report.contains("...tail calls ("),
        "missing tail placeholder: {report}"
    );
}
