#![doc = include_str!("../../../README.md")]
#![expect(clippy::cast_possible_truncation, reason = "numeric narrowing is checked or intentional")]
#![expect(clippy::cast_possible_wrap, reason = "length-to-int conversions stay in range")]
#![expect(clippy::cast_sign_loss, reason = "sign-changing casts are intentional")]

mod builtins;
mod config;
mod env;
mod errors;
mod eval;
mod heap;
mod intern;
mod io;
mod matcher;
mod parse;
mod prepare;
mod print;
mod quasiquote;
mod types;
mod value;
mod vm;

pub use crate::{
    config::{Config, OPTIONS, OptKind},
    env::{GetterFn, SetterFn, SymFinalizer, SyncCell},
    errors::{BuiltinCode, CodeLoc, ErrCode, Error, EvalResult, Thrown},
    eval::Step,
    heap::{Finalizer, Heap, HeapId, HeapStats, NativeFn, PinToken, PreprocFn, TailFn},
    intern::SymId,
    io::{CollectStringPrint, NoPrint, PrintWriter, StdPrint},
    matcher::MatchFlags,
    parse::Reader,
    prepare::{PatOp, PatSpec, pattern_preproc},
    types::{BasicType, TypeCode},
    value::{UserPtr, Value},
    vm::Vm,
};
