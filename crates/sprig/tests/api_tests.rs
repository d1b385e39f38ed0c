//! Host API surface: configuration, type codes, native functions, special
//! operations, printing, and string builtins.

use sprig::{
    BasicType, BuiltinCode, CollectStringPrint, ErrCode, PatOp, PatSpec, Step, Thrown, Value, Vm,
    pattern_preproc,
};

// =============================================================================
// 1. Configuration
// =============================================================================

#[test]
fn config_options_get_and_set_by_name() {
    let mut vm = Vm::new();
    assert!(vm.config_bool("tail-call-elimination").unwrap());
    vm.set_config_int("stack-limit", 512).unwrap();
    assert_eq!(vm.config_int("stack-limit").unwrap(), 512);
}

#[test]
fn config_access_is_type_checked() {
    let mut vm = Vm::new();
    let err = vm.set_config_int("hyper-gc", 1).expect_err("hyper-gc is a bool");
    assert_eq!(err.code, ErrCode::from(BuiltinCode::Etype));
    let err = vm.config_bool("mem-limit").expect_err("mem-limit is an int");
    assert_eq!(err.code, ErrCode::from(BuiltinCode::Etype));
    let err = vm.set_config_int("no-such", 1).expect_err("unknown option");
    assert_eq!(err.code, ErrCode::from(BuiltinCode::Eapi));
    let err = vm.set_config_int("bt-limit", 1000).expect_err("bt-limit caps at 256");
    assert_eq!(err.code, ErrCode::from(BuiltinCode::Evalue));
}

#[test]
fn hyper_gc_keeps_evaluation_correct() {
    let mut vm = Vm::new();
    vm.set_config_bool("hyper-gc", true).unwrap();
    let value = vm
        .eval_string("(def f (fn (n) (* n n))) (+ (f 3) (f 4) (f 5))", "<test>")
        .unwrap();
    assert_eq!(vm.repr(value), "50");
}

// =============================================================================
// 2. Type codes
// =============================================================================

#[test]
fn user_types_register_resolve_and_cast() {
    let mut vm = Vm::new();
    let celsius = vm.new_type("celsius", BasicType::Int.into()).unwrap();
    let delta = vm.new_type("temp-delta", celsius).unwrap();

    assert_eq!(vm.find_type("celsius"), Some(celsius));
    assert_eq!(vm.get_base_type(delta), celsius);
    assert_eq!(vm.resolve_type(delta), BasicType::Int.into());

    // The name is bound globally; calling it casts.
    let value = vm.eval_string("(celsius 20)", "<test>").unwrap();
    assert_eq!(vm.type_of(value), celsius);
    assert_eq!(vm.repr(value), "#<celsius 20>");

    // Multi-level aliases cast against each other through the basic base.
    let value = vm.eval_string("(temp-delta (celsius 5))", "<test>").unwrap();
    assert_eq!(vm.type_of(value), delta);
}

#[test]
fn cast_between_unrelated_bases_is_etype() {
    let mut vm = Vm::new();
    vm.new_type("tag", BasicType::String.into()).unwrap();
    let err = vm.eval_string("(tag 5)", "<test>").expect_err("int is not a string alias");
    assert_eq!(err.code, ErrCode::from(BuiltinCode::Etype));
}

#[test]
fn type_of_reports_basic_tags() {
    let mut vm = Vm::new();
    let value = vm.eval_string("(type-of 1)", "<test>").unwrap();
    assert_eq!(vm.repr(value), "int");
    let value = vm.eval_string("(type-of \"s\")", "<test>").unwrap();
    assert_eq!(vm.repr(value), "string");
    let value = vm.eval_string("(type-of '(1))", "<test>").unwrap();
    assert_eq!(vm.repr(value), "list");
}

#[test]
fn duplicate_type_names_are_eexist() {
    let mut vm = Vm::new();
    vm.new_type("thing", BasicType::Int.into()).unwrap();
    let err = vm.new_type("thing", BasicType::Int.into()).expect_err("duplicate");
    assert_eq!(err.code, ErrCode::from(BuiltinCode::Eexist));
}

// =============================================================================
// 3. Native functions and special operations
// =============================================================================

#[test]
fn defun_installs_a_callable() {
    let mut vm = Vm::new();
    vm.defun(
        "host-add",
        |_vm, args| match args {
            [Value::Int(a), Value::Int(b)] => Ok(Value::Int(a + b)),
            _ => Err(Thrown::new(BuiltinCode::Etype, Some("host-add takes two ints".to_owned()))),
        },
        None,
    )
    .unwrap();
    let value = vm.eval_string("(host-add 40 2)", "<test>").unwrap();
    assert_eq!(vm.repr(value), "42");
    let err = vm.eval_string("(host-add 1 \"x\")", "<test>").expect_err("type checked");
    assert_eq!(err.code, ErrCode::from(BuiltinCode::Etype));
}

#[test]
fn defsyntax_receives_unevaluated_arguments() {
    let mut vm = Vm::new();
    const QUOTE_ALL: PatSpec = PatSpec {
        ops: &[PatOp::SeqNode],
        msgs: &[],
    };
    vm.defsyntax(
        "verbatim",
        |vm, args, _env| {
            // Hand back the raw argument list without evaluating it.
            let _ = vm;
            Ok(Step::Done(args))
        },
        Some(pattern_preproc(QUOTE_ALL)),
        None,
    )
    .unwrap();
    let value = vm.eval_string("(verbatim (+ 1 2) x)", "<test>").unwrap();
    assert_eq!(vm.repr(value), "((+ 1 2) x)");
}

#[test]
fn defsyntax_shape_violations_are_estatic() {
    let mut vm = Vm::new();
    const ONE_EXPR: PatSpec = PatSpec {
        ops: &[PatOp::Err(0), PatOp::Expr, PatOp::Nil],
        msgs: &["exactly one expression expected"],
    };
    vm.defsyntax(
        "solo",
        |vm, args, _env| {
            let _ = (vm, args);
            Ok(Step::Done(Value::Nil))
        },
        Some(pattern_preproc(ONE_EXPR)),
        None,
    )
    .unwrap();
    let err = vm.eval_string("(solo 1 2)", "<test>").expect_err("two args for one slot");
    assert_eq!(err.code, ErrCode::from(BuiltinCode::Estatic));
    assert_eq!(err.message.as_deref(), Some("exactly one expression expected"));
}

#[test]
fn apply_keeps_the_closure_lexical_scope() {
    let mut vm = Vm::new();
    vm.eval_string("(def f (fn () y))", "<test>").unwrap();
    // A caller-scope `y` must stay invisible to the applied closure.
    vm.push_env().unwrap();
    vm.def("y", Value::Int(9), false).unwrap();
    let f = vm.get("f").unwrap();
    let err = vm.apply(f, Value::Nil).expect_err("f has no y in its lexical chain");
    assert_eq!(err.code, ErrCode::from(BuiltinCode::Enosym));
    vm.pop_env().unwrap();
}

#[test]
fn push_and_pop_env_scope_definitions() {
    let mut vm = Vm::new();
    vm.push_env().unwrap();
    vm.def("scratch", Value::Int(1), false).unwrap();
    assert!(vm.try_get("scratch").unwrap().is_some());
    vm.pop_env().unwrap();
    assert!(vm.try_get("scratch").unwrap().is_none(), "the popped frame's symbols are gone");
    let err = vm.pop_env().expect_err("the global frame cannot be popped");
    assert_eq!(err.code, ErrCode::from(BuiltinCode::Eapi));
}

#[test]
fn entered_environments_are_consulted_main_first() {
    let mut vm = Vm::new();
    let entered = vm
        .eval_string("(def x 10) (let ((x 1)) (env))", "<test>")
        .unwrap();
    vm.enter_env(entered).unwrap();
    let value = vm.eval_string("x", "<test>").unwrap();
    assert_eq!(vm.repr(value), "1", "the entered frame's binding shadows the global");
    vm.pop_env().unwrap();
    let value = vm.eval_string("x", "<test>").unwrap();
    assert_eq!(vm.repr(value), "10");
    let err = vm.enter_env(Value::Int(1)).expect_err("enter takes an environment value");
    assert_eq!(err.code, ErrCode::from(BuiltinCode::Eapi));
}

#[test]
fn def_and_get_round_trip_host_values() {
    let mut vm = Vm::new();
    let list = {
        let one = Value::Int(1);
        let two = Value::Int(2);
        vm.list(&[one, two]).unwrap()
    };
    vm.def("pair", list, false).unwrap();
    let back = vm.get("pair").unwrap();
    assert!(vm.eq(back, list));
    assert!(vm.try_get("missing").unwrap().is_none());
}

// =============================================================================
// 4. Printing
// =============================================================================

#[test]
fn print_and_put_route_through_the_writer() {
    let collector = CollectStringPrint::default();
    let mut vm = Vm::new();
    vm.set_writer(Box::new(collector.clone()));
    vm.eval_string(r#"(put "a") (put "b") (print '(1 2))"#, "<test>").unwrap();
    assert_eq!(collector.stdout(), "ab(1 2)\n");
}

#[test]
fn display_and_repr_differ_on_strings() {
    let mut vm = Vm::new();
    let value = vm.readstr(r#""tab\there""#).unwrap();
    assert_eq!(vm.display(value), "tab\there");
    assert_eq!(vm.repr(value), r#""tab\there""#);
}

// =============================================================================
// 5. String builtins
// =============================================================================

#[test]
fn substr_shares_backing_storage() {
    let mut vm = Vm::new();
    let value = vm
        .eval_string(r#"(def s "hello world") (substr s 6 5)"#, "<test>")
        .unwrap();
    assert_eq!(vm.repr(value), "\"world\"");
    // A slice of a slice still reads correctly.
    let value = vm
        .eval_string("(substr (substr s 6) 1 3)", "<test>")
        .unwrap();
    assert_eq!(vm.repr(value), "\"orl\"");
}

#[test]
fn substr_range_errors_are_eindex() {
    let mut vm = Vm::new();
    let err = vm
        .eval_string(r#"(substr "abc" 5)"#, "<test>")
        .expect_err("start beyond the end");
    assert_eq!(err.code, ErrCode::from(BuiltinCode::Eindex));
    let err = vm
        .eval_string(r#"(substr "abc" 1 9)"#, "<test>")
        .expect_err("length beyond the end");
    assert_eq!(err.code, ErrCode::from(BuiltinCode::Eindex));
}

#[test]
fn strcat_and_lengths() {
    let mut vm = Vm::new();
    let value = vm
        .eval_string(r#"(strcat "foo" "" "bar")"#, "<test>")
        .unwrap();
    assert_eq!(vm.repr(value), "\"foobar\"");
    let value = vm.eval_string(r#"(string-length "héllo")"#, "<test>").unwrap();
    assert_eq!(vm.repr(value), "6", "string-length counts bytes");
}

#[test]
fn string_bytes_lists_the_bytes() {
    let mut vm = Vm::new();
    let value = vm.eval_string(r#"(string-bytes "AB")"#, "<test>").unwrap();
    assert_eq!(vm.repr(value), "(65 66)");
}

#[test]
fn format_directives() {
    let mut vm = Vm::new();
    let value = vm
        .eval_string(r#"(format "{} and {!r} and {{literal}}" "x" "y")"#, "<test>")
        .unwrap();
    assert_eq!(vm.repr(value), r#""x and \"y\" and {literal}""#);
    let err = vm
        .eval_string(r#"(format "{} {}" 1)"#, "<test>")
        .expect_err("missing argument");
    assert_eq!(err.code, ErrCode::from(BuiltinCode::Eindex));
}

// =============================================================================
// 6. Macroexpansion API
// =============================================================================

#[test]
fn macroexpand_reaches_a_fixed_point() {
    let mut vm = Vm::new();
    vm.eval_string(
        "(macro twice (: args) `(do ,@args ,@args))",
        "<test>",
    )
    .unwrap();
    let form = vm.readstr("(twice (put \"x\"))").unwrap();
    let expanded = vm.macroexpand(form).unwrap();
    assert_eq!(vm.repr(expanded), "(do (put \"x\") (put \"x\"))");
    // A non-macro form comes back unchanged.
    let form = vm.readstr("(+ 1 2)").unwrap();
    let expanded = vm.macroexpand_once(form).unwrap();
    assert!(vm.equiv(form, expanded));
}

#[test]
fn preproc_marks_and_rewrites() {
    let mut vm = Vm::new();
    vm.eval_string("(macro inc (: args) `(+ 1 ,(head args)))", "<test>").unwrap();
    let form = vm.readstr("(inc 41)").unwrap();
    let prepared = vm.preproc(form).unwrap();
    assert_eq!(vm.repr(prepared), "(+ 1 41)");
    let value = vm.eval(prepared).unwrap();
    assert_eq!(vm.repr(value), "42");
}
