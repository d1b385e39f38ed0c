//! Garbage collector tests: pinning, cycle collection, finalizers, the
//! memory ceiling, and heap statistics.

use std::{cell::Cell, rc::Rc};

use sprig::{BuiltinCode, ErrCode, Value, Vm};

// =============================================================================
// 1. Pins
// =============================================================================

#[test]
fn pinned_values_survive_collection() {
    let mut vm = Vm::new();
    let value = vm.readstr("(1 2 3)").unwrap();
    let token = vm.ref_value(value);
    vm.force_gc();
    assert_eq!(vm.repr(value), "(1 2 3)", "a pinned value must stay accessible");
    vm.unref(token);
}

#[test]
fn pins_nest() {
    let mut vm = Vm::new();
    let value = vm.readstr("\"keep\"").unwrap();
    let outer = vm.ref_value(value);
    let inner = vm.ref_value(value);
    vm.unref(inner);
    vm.force_gc();
    assert_eq!(vm.repr(value), "\"keep\"", "one remaining pin must still protect the value");
    vm.unref(outer);
}

#[test]
fn unpinned_garbage_is_reclaimed() {
    let mut vm = Vm::new();
    let before = vm.heap_stats().live_objects;
    let value = vm.readstr("(1 2 3 4 5 6 7 8)").unwrap();
    let token = vm.ref_value(value);
    vm.force_gc();
    let pinned = vm.heap_stats().live_objects;
    assert!(pinned > before, "the pinned list must be live");
    vm.unref(token);
    vm.force_gc();
    assert_eq!(
        vm.heap_stats().live_objects,
        before,
        "after unref the list is unreachable and must be swept"
    );
}

#[test]
fn with_pinned_scopes_the_pin() {
    let mut vm = Vm::new();
    let value = vm.readstr("(a b)").unwrap();
    let repr = vm.with_pinned(value, |vm| {
        vm.force_gc();
        vm.repr(value)
    });
    assert_eq!(repr, "(a b)");
}

// =============================================================================
// 2. Reachability through the environment
// =============================================================================

#[test]
fn globals_are_roots() {
    let mut vm = Vm::new();
    vm.eval_string("(def keep '(1 2 3))", "<test>").unwrap();
    vm.force_gc();
    let value = vm.eval_string("keep", "<test>").unwrap();
    assert_eq!(vm.repr(value), "(1 2 3)");
}

#[test]
fn closure_environment_cycles_are_collected() {
    // A closure stored in its own defining frame forms a cycle; with no
    // outside reference the whole clump must go.
    let mut vm = Vm::new();
    vm.eval_string("(do (let ((g nil)) (set g (fn () g)) nil) nil)", "<test>")
        .unwrap();
    let before = vm.heap_stats().live_objects;
    let freed = vm.force_gc();
    assert!(freed > 0, "the cycle must be reclaimed");
    assert!(vm.heap_stats().live_objects < before);
    // The heap is still healthy.
    let value = vm.eval_string("(+ 1 1)", "<test>").unwrap();
    assert_eq!(vm.repr(value), "2");
}

#[test]
fn captured_frames_survive_while_the_closure_lives() {
    let mut vm = Vm::new();
    vm.eval_string("(def counter (let ((n 0)) (fn () (set n (+ n 1)))))", "<test>")
        .unwrap();
    vm.force_gc();
    vm.eval_string("(counter)", "<test>").unwrap();
    vm.eval_string("(counter)", "<test>").unwrap();
    let value = vm.eval_string("(counter)", "<test>").unwrap();
    assert_eq!(vm.repr(value), "3", "the captured frame must persist across collections");
}

// =============================================================================
// 3. Finalizers
// =============================================================================

#[test]
fn finalizers_run_once_at_reclaim() {
    let ran = Rc::new(Cell::new(0u32));
    let mut vm = Vm::new();
    let value = vm.readstr("\"doomed\"").unwrap();
    let witness = Rc::clone(&ran);
    vm.set_finalizer(value, Box::new(move |_heap, _value| witness.set(witness.get() + 1)))
        .unwrap();
    let token = vm.ref_value(value);
    vm.force_gc();
    assert_eq!(ran.get(), 0, "a pinned value must not be finalized");
    vm.unref(token);
    vm.force_gc();
    assert_eq!(ran.get(), 1, "the finalizer runs when the value is swept");
    vm.force_gc();
    assert_eq!(ran.get(), 1, "and never again");
}

#[test]
fn finalizers_on_immediates_are_eapi() {
    let mut vm = Vm::new();
    let err = vm
        .set_finalizer(Value::Int(1), Box::new(|_heap, _value| {}))
        .expect_err("immediates have no heap slot");
    assert_eq!(err.code, ErrCode::from(BuiltinCode::Eapi));
}

// =============================================================================
// 4. Memory ceiling
// =============================================================================

#[test]
fn exceeding_the_ceiling_is_enomem() {
    let mut vm = Vm::new();
    let baseline = vm.heap_stats().bytes_in_flight;
    vm.set_config_int("mem-limit", (baseline + 2048) as i64).unwrap();
    let oversized = "x".repeat(8192);
    let failure = vm
        .string(&oversized)
        .expect_err("an oversized string must trip the ceiling");
    assert_eq!(failure.code, ErrCode::from(BuiltinCode::Enomem));
    assert_eq!(vm.errno(), Some(ErrCode::from(BuiltinCode::Enomem)));
    // Lifting the ceiling restores service.
    vm.clear_errno();
    vm.set_config_int("mem-limit", 0).unwrap();
    let value = vm.eval_string("(+ 1 2)", "<test>").unwrap();
    assert_eq!(vm.repr(value), "3");
}

#[test]
fn gc_builtin_reports_reclaimed_objects() {
    let mut vm = Vm::new();
    let value = vm
        .eval_string("(do '(a b c d e f) nil) (gc)", "<test>")
        .unwrap();
    let Value::Int(freed) = value else {
        panic!("gc should return an int, got {repr}", repr = vm.repr(value));
    };
    assert!(freed > 0, "the discarded quoted list should be reclaimed");
}

// =============================================================================
// 5. Heap statistics
// =============================================================================

#[test]
fn stats_track_live_and_free_slots() {
    let mut vm = Vm::new();
    let start = vm.heap_stats();
    assert!(start.live_objects > 0, "builtins occupy the heap");
    assert_eq!(start.live_objects + start.free_slots, start.total_slots);

    let value = vm.readstr("(1 2 3)").unwrap();
    let token = vm.ref_value(value);
    let grown = vm.heap_stats();
    assert!(grown.live_objects >= start.live_objects + 3);
    vm.unref(token);
    vm.force_gc();
    let swept = vm.heap_stats();
    assert_eq!(swept.live_objects, start.live_objects);
    assert!(swept.free_slots >= 3, "swept slots return to the free list");
}
