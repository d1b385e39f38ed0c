//! Host-synchronized variables: each cell kind, type checks, range
//! checks, and the read-only flag.

use std::{cell::Cell, cell::RefCell, rc::Rc};

use sprig::{BuiltinCode, ErrCode, Vm};

#[test]
fn synced_int_reads_and_writes_the_host_cell() {
    let cell = Rc::new(Cell::new(7i64));
    let mut vm = Vm::new();
    vm.sync_int("knob", Rc::clone(&cell), false).unwrap();

    let value = vm.eval_string("knob", "<test>").unwrap();
    assert_eq!(vm.repr(value), "7");

    vm.eval_string("(set knob 42)", "<test>").unwrap();
    assert_eq!(cell.get(), 42, "the host cell must see interpreter writes");

    cell.set(-3);
    let value = vm.eval_string("knob", "<test>").unwrap();
    assert_eq!(vm.repr(value), "-3", "the interpreter must see host writes");
}

#[test]
fn synced_bool_round_trips() {
    let cell = Rc::new(Cell::new(false));
    let mut vm = Vm::new();
    vm.sync_bool("flag", Rc::clone(&cell), false).unwrap();
    vm.eval_string("(set flag true)", "<test>").unwrap();
    assert!(cell.get());
}

#[test]
fn synced_double_and_float_round_trip() {
    let double = Rc::new(Cell::new(0.0f64));
    let float = Rc::new(Cell::new(0.0f32));
    let mut vm = Vm::new();
    vm.sync_double("d", Rc::clone(&double), false).unwrap();
    vm.sync_float("f", Rc::clone(&float), false).unwrap();

    vm.eval_string("(set d 2.5) (set f 0.5)", "<test>").unwrap();
    assert_eq!(double.get(), 2.5);
    assert_eq!(float.get(), 0.5);

    let value = vm.eval_string("f", "<test>").unwrap();
    assert_eq!(vm.repr(value), "0.5", "float cells surface as doubles");
}

#[test]
fn synced_float_rejects_overflow() {
    let cell = Rc::new(Cell::new(0.0f32));
    let mut vm = Vm::new();
    vm.sync_float("f", Rc::clone(&cell), false).unwrap();
    let err = vm.eval_string("(set f 1e300)", "<test>").expect_err("1e300 does not fit an f32");
    assert_eq!(err.code, ErrCode::from(BuiltinCode::Evalue));
}

#[test]
fn synced_cells_type_check_writes() {
    let cell = Rc::new(Cell::new(0i64));
    let mut vm = Vm::new();
    vm.sync_int("knob", Rc::clone(&cell), false).unwrap();
    let err = vm.eval_string("(set knob \"nope\")", "<test>").expect_err("string into int cell");
    assert_eq!(err.code, ErrCode::from(BuiltinCode::Etype));
    let err = vm.eval_string("(set knob 1.5)", "<test>").expect_err("double into int cell");
    assert_eq!(err.code, ErrCode::from(BuiltinCode::Etype));
}

#[test]
fn read_only_synced_symbols_reject_set() {
    let cell = Rc::new(Cell::new(1i64));
    let mut vm = Vm::new();
    vm.sync_int("ro", Rc::clone(&cell), true).unwrap();
    let err = vm.eval_string("(set ro 2)", "<test>").expect_err("read-only cell");
    assert_eq!(err.code, ErrCode::from(BuiltinCode::Ereadonly));
    assert_eq!(cell.get(), 1);
}

#[test]
fn synced_nstring_enforces_its_capacity() {
    let buf = Rc::new(RefCell::new(b"boot".to_vec()));
    let mut vm = Vm::new();
    vm.sync_nstring("name", Rc::clone(&buf), 8, false).unwrap();

    let value = vm.eval_string("name", "<test>").unwrap();
    assert_eq!(vm.repr(value), "\"boot\"");

    vm.eval_string("(set name \"updated\")", "<test>").unwrap();
    assert_eq!(&*buf.borrow(), b"updated");

    let err = vm
        .eval_string("(set name \"far too long for the buffer\")", "<test>")
        .expect_err("write beyond the capacity");
    assert_eq!(err.code, ErrCode::from(BuiltinCode::Evalue));
    assert_eq!(&*buf.borrow(), b"updated", "a rejected write must not change the buffer");
}

#[test]
fn computed_symbols_use_host_getters_and_setters() {
    let cell = Rc::new(Cell::new(10i64));
    let reader = Rc::clone(&cell);
    let writer = Rc::clone(&cell);
    let mut vm = Vm::new();
    vm.defsym(
        "doubled",
        Some(Rc::new(move |_vm, _sym| Ok(sprig::Value::Int(reader.get() * 2)))),
        Some(Rc::new(move |_vm, _sym, value| match value {
            sprig::Value::Int(i) => {
                writer.set(i);
                Ok(())
            }
            _ => Err(sprig::Thrown::new(BuiltinCode::Etype, Some("doubled takes an int".to_owned()))),
        })),
        None,
        None,
        sprig::Value::Nil,
    )
    .unwrap();

    let value = vm.eval_string("doubled", "<test>").unwrap();
    assert_eq!(vm.repr(value), "20");
    vm.eval_string("(set doubled 21)", "<test>").unwrap();
    let value = vm.eval_string("doubled", "<test>").unwrap();
    assert_eq!(vm.repr(value), "42");
}

#[test]
fn getterless_symbols_are_write_only() {
    let cell = Rc::new(Cell::new(0i64));
    let sink = Rc::clone(&cell);
    let mut vm = Vm::new();
    vm.defsym(
        "sink",
        None,
        Some(Rc::new(move |_vm, _sym, value| {
            if let sprig::Value::Int(i) = value {
                sink.set(i);
            }
            Ok(())
        })),
        None,
        None,
        sprig::Value::Nil,
    )
    .unwrap();
    vm.eval_string("(set sink 9)", "<test>").unwrap();
    assert_eq!(cell.get(), 9);
    let err = vm.eval_string("sink", "<test>").expect_err("write-only symbol");
    assert_eq!(err.code, ErrCode::from(BuiltinCode::Ewriteonly));
}
