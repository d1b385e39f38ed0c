//! Prelude tests: the derived macros built on the core special forms.

use sprig::Vm;

fn eval_repr(source: &str) -> String {
    let mut vm = Vm::new();
    vm.load_prelude().expect("the prelude should load");
    let value = vm.eval_string(source, "<test>").expect("evaluation should succeed");
    vm.repr(value)
}

#[test]
fn defn_defines_a_function() {
    assert_eq!(eval_repr("(defn square (x) (* x x)) (square 9)"), "81");
}

#[test]
fn defmacro_defines_a_macro() {
    assert_eq!(
        eval_repr("(defmacro first-arg (: args) (head args)) (first-arg 42 (boom))"),
        "42"
    );
}

#[test]
fn when_and_unless() {
    assert_eq!(eval_repr("(when true 1 2 3)"), "3");
    assert_eq!(eval_repr("(when false 1 2 3)"), "()");
    assert_eq!(eval_repr("(unless false 'ran)"), "ran");
    assert_eq!(eval_repr("(unless true 'ran)"), "()");
}

#[test]
fn cond_picks_the_first_true_clause() {
    assert_eq!(
        eval_repr("(def x 5) (cond ((< x 0) 'neg) ((= x 0) 'zero) (true 'pos))"),
        "pos"
    );
    assert_eq!(eval_repr("(cond (false 1))"), "()");
}

#[test]
fn while_loops_with_state() {
    assert_eq!(
        eval_repr("(def i 0) (def total 0) (while (< i 5) (set total (+ total i)) (set i (+ i 1))) total"),
        "10"
    );
}

#[test]
fn list_builds_from_evaluated_arguments() {
    assert_eq!(eval_repr("(list 1 (+ 1 1) 'three)"), "(1 2 three)");
    assert_eq!(eval_repr("(list)"), "()");
}

#[test]
fn second_and_third() {
    assert_eq!(eval_repr("(second '(a b c))"), "b");
    assert_eq!(eval_repr("(third '(a b c))"), "c");
}
