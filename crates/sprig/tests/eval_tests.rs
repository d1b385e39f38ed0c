//! Evaluator tests: literals, calls, definitions, control flow, closures,
//! and tail-call elimination.

use sprig::{BuiltinCode, ErrCode, Value, Vm};

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
// 1. Self-evaluating values and lookup
// =============================================================================

#[test]
fn literals_evaluate_to_themselves() {
    assert_eq!(eval_repr("42"), "42");
    assert_eq!(eval_repr("-17"), "-17");
    assert_eq!(eval_repr("2.5"), "2.5");
    assert_eq!(eval_repr("true"), "true");
    assert_eq!(eval_repr("\"hi\""), "\"hi\"");
    assert_eq!(eval_repr("()"), "()");
}

#[test]
fn quote_returns_inner_value() {
    assert_eq!(eval_repr("'x"), "x");
    assert_eq!(eval_repr("'(1 2 3)"), "(1 2 3)");
}

#[test]
fn unknown_symbol_is_enosym() {
    assert_eq!(eval_err("no-such-thing"), ErrCode::from(BuiltinCode::Enosym));
}

#[test]
fn nil_symbol_is_bound_to_nil() {
    assert_eq!(eval_repr("nil"), "()");
}

// =============================================================================
// 2. Arithmetic and calls
// =============================================================================

#[test]
fn addition_folds_its_arguments() {
    assert_eq!(eval_repr("(+ 1 2 3)"), "6");
    assert_eq!(eval_repr("(+)"), "0");
}

#[test]
fn double_contagion() {
    assert_eq!(eval_repr("(+ 1 0.5)"), "1.5");
    assert_eq!(eval_repr("(* 2 2.0)"), "4.0");
}

#[test]
fn division_and_modulo() {
    assert_eq!(eval_repr("(/ 7 2)"), "3");
    assert_eq!(eval_repr("(/ 7.0 2)"), "3.5");
    assert_eq!(eval_repr("(% 7 2)"), "1");
}

#[test]
fn comparisons_chain() {
    assert_eq!(eval_repr("(< 1 2 3)"), "true");
    assert_eq!(eval_repr("(< 1 3 2)"), "false");
    assert_eq!(eval_repr("(= 2 2)"), "true");
    assert_eq!(eval_repr("(= 2 2.0)"), "false");
}

#[test]
fn calling_a_non_function_is_etype() {
    assert_eq!(eval_err("(1 2 3)"), ErrCode::from(BuiltinCode::Etype));
}

// =============================================================================
// 3. Definitions and assignment
// =============================================================================

#[test]
fn def_binds_and_returns_the_value() {
    assert_eq!(eval_repr("(def x 10) x"), "10");
    assert_eq!(eval_repr("(def x 10)"), "10");
}

#[test]
fn def_destructures_patterns() {
    assert_eq!(eval_repr("(def (a b) '(1 2)) (+ a b)"), "3");
    assert_eq!(eval_repr("(def (: h t) '(1 2 3)) t"), "(2 3)");
}

#[test]
fn set_mutates_and_defconst_refuses() {
    assert_eq!(eval_repr("(def x 1) (set x 5) x"), "5");
    assert_eq!(eval_err("(defconst k 1) (set k 2)"), ErrCode::from(BuiltinCode::Ereadonly));
}

#[test]
fn double_define_in_same_frame_is_eexist() {
    assert_eq!(eval_err("(def x 1) (def x 2)"), ErrCode::from(BuiltinCode::Eexist));
}

#[test]
fn allow_redef_permits_global_redefinition() {
    let mut vm = Vm::new();
    vm.set_config_bool("allow-redef", true).unwrap();
    let value = vm.eval_string("(def x 1) (def x 2) x", "<test>").unwrap();
    assert_eq!(vm.repr(value), "2");
}

#[test]
fn set_of_unknown_symbol_is_enosym() {
    assert_eq!(eval_err("(set nowhere 1)"), ErrCode::from(BuiltinCode::Enosym));
}

// =============================================================================
// 4. Control flow
// =============================================================================

#[test]
fn if_branches_on_truthiness() {
    assert_eq!(eval_repr("(if true 1 2)"), "1");
    assert_eq!(eval_repr("(if false 1 2)"), "2");
    assert_eq!(eval_repr("(if () 1 2)"), "2");
    assert_eq!(eval_repr("(if 0 1 2)"), "1");
    assert_eq!(eval_repr("(if false 1)"), "()");
}

#[test]
fn do_sequences_and_returns_last() {
    assert_eq!(eval_repr("(do 1 2 3)"), "3");
    assert_eq!(eval_repr("(do)"), "()");
}

#[test]
fn and_or_short_circuit() {
    assert_eq!(eval_repr("(and 1 2 3)"), "3");
    assert_eq!(eval_repr("(and 1 false 3)"), "false");
    assert_eq!(eval_repr("(or false () 7)"), "7");
    assert_eq!(eval_repr("(or)"), "false");
    assert_eq!(eval_repr("(and)"), "true");
    // The short-circuited side must not evaluate.
    assert_eq!(eval_repr("(or 1 (no-such-fn))"), "1");
}

#[test]
fn let_binds_locally() {
    assert_eq!(eval_repr("(let ((x 10) (y 32)) (+ x y))"), "42");
}

#[test]
fn let_initializers_see_the_outer_scope() {
    assert_eq!(eval_repr("(def x 1) (let ((x 2) (y x)) y)"), "1");
}

#[test]
fn let_bindings_do_not_leak() {
    assert_eq!(eval_err("(do (let ((x 1)) x) x)"), ErrCode::from(BuiltinCode::Enosym));
}

// =============================================================================
// 5. Closures
// =============================================================================

#[test]
fn closures_capture_their_environment() {
    assert_eq!(
        eval_repr("(def make (fn (n) (fn (m) (+ n m)))) ((make 40) 2)"),
        "42"
    );
}

#[test]
fn recursive_function_through_global() {
    assert_eq!(
        eval_repr("(def fact (fn (n) (if (= n 0) 1 (* n (fact (- n 1)))))) (fact 5)"),
        "120"
    );
}

#[test]
fn variadic_parameter_collects_evaluated_arguments() {
    assert_eq!(eval_repr("(def f (fn (: xs) xs)) (f 1 (+ 1 1) 3)"), "(1 2 3)");
}

#[test]
fn improper_parameter_pattern_splits_arguments() {
    assert_eq!(eval_repr("(def f (fn (: a rest) rest)) (f 1 2 3)"), "(2 3)");
}

#[test]
fn arity_mismatch_is_ematch() {
    assert_eq!(eval_err("(def f (fn (a b) a)) (f 1)"), ErrCode::from(BuiltinCode::Ematch));
}

#[test]
fn free_variables_resolve_lexically_not_dynamically() {
    // A callee never sees the caller's locals: `f` has no `y` in its
    // lexical chain even while its caller binds one, in non-tail and
    // tail position alike.
    assert_eq!(
        eval_err("(def f (fn () y)) (def g (fn (y) (+ (f) 0))) (g 7)"),
        ErrCode::from(BuiltinCode::Enosym)
    );
    assert_eq!(
        eval_err("(def f (fn () y)) (def g (fn (y) (f))) (g 7)"),
        ErrCode::from(BuiltinCode::Enosym)
    );
}

#[test]
fn callers_cannot_shadow_a_closures_globals() {
    assert_eq!(
        eval_repr("(def y 1) (def f (fn () y)) (def g (fn (y) (f))) (g 7)"),
        "1"
    );
}

// =============================================================================
// 6. Tail calls
// =============================================================================

#[test]
fn deep_tail_recursion_runs_in_constant_stack() {
    // A self tail call stays below the depth ceiling no matter how
    // many iterations it runs.
    assert_eq!(
        eval_repr("(def loop (fn (n) (if (= n 0) 'done (loop (- n 1))))) (loop 100000)"),
        "done"
    );
}

#[test]
fn disabling_elimination_restores_estack() {
    let mut vm = Vm::new();
    vm.set_config_bool("tail-call-elimination", false).unwrap();
    vm.set_config_int("stack-limit", 128).unwrap();
    let err = vm
        .eval_string(
            "(def loop (fn (n) (if (= n 0) 'done (loop (- n 1))))) (loop 10000)",
            "<test>",
        )
        .expect_err("recursion should exhaust the stack");
    assert_eq!(err.code, ErrCode::from(BuiltinCode::Estack));
}

#[test]
fn estack_is_recoverable() {
    let mut vm = Vm::new();
    vm.set_config_int("stack-limit", 64).unwrap();
    // Non-tail recursion exhausts the ceiling even with elimination on.
    let err = vm
        .eval_string("(def f (fn (n) (+ 1 (f n)))) (f 0)", "<test>")
        .expect_err("non-tail recursion should exhaust the stack");
    assert_eq!(err.code, ErrCode::from(BuiltinCode::Estack));
    // The VM keeps working afterwards.
    let value = vm.eval_string("(+ 20 22)", "<test>").unwrap();
    assert_eq!(vm.repr(value), "42");
}

// =============================================================================
// 7. Environments as values
// =============================================================================

#[test]
fn environment_values_evaluate_body_forms() {
    assert_eq!(
        eval_repr("(def e (let ((x 41)) (env))) (e (+ x 1))"),
        "42"
    );
}

#[test]
fn apply_does_not_reevaluate_arguments() {
    let mut vm = Vm::new();
    let value = vm
        .eval_string("(def f (fn (x) x)) (apply f '((+ 1 2)))", "<test>")
        .unwrap();
    assert_eq!(vm.repr(value), "(+ 1 2)");
}

#[test]
fn eval_builtin_with_environment_argument() {
    assert_eq!(
        eval_repr("(def e (let ((x 5)) (env))) (eval 'x e)"),
        "5"
    );
}

// =============================================================================
// 8. Host-visible equality
// =============================================================================

#[test]
fn eq_is_reflexive_and_symmetric() {
    let mut vm = Vm::new();
    let samples = [
        vm.readstr("42").unwrap(),
        vm.readstr("2.5").unwrap(),
        vm.readstr("true").unwrap(),
        vm.readstr("\"s\"").unwrap(),
        vm.readstr("sym").unwrap(),
        vm.readstr("(1 (2 3))").unwrap(),
        Value::Nil,
    ];
    for &v in &samples {
        assert!(vm.eq(v, v), "eq must be reflexive for {repr}", repr = vm.repr(v));
    }
    for &l in &samples {
        for &r in &samples {
            assert_eq!(vm.eq(l, r), vm.eq(r, l), "eq must be symmetric");
        }
    }
}

#[test]
fn structural_eq_versus_equiv() {
    let mut vm = Vm::new();
    let a = vm.readstr("(1 2)").unwrap();
    let b = vm.readstr("(1 2)").unwrap();
    assert!(vm.eq(a, b), "separate reads of the same list are eq");
    assert!(!vm.equiv(a, b), "but not equiv (different heap identity)");
    assert!(vm.equiv(a, a));
}
