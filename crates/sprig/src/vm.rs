//! The VM handle: lifecycle and the host-facing API surface.
//!
//! All interpreter state hangs off a [`Vm`]: the heap, the interner, the
//! three global namespaces (symbols, special operations, macros), the
//! current environment, configuration, and the last error. There are no
//! process globals; hosts may hold one handle per thread.

use std::{
    cell::{Cell, RefCell},
    fmt::Write as _,
    rc::Rc,
};

use crate::{
    builtins,
    config::Config,
    env::{
        self, Binding, EnvFrame, GetterFn, SetterFn, SymFinalizer, SymbolRecord, SyncCell,
    },
    errors::{BtEntry, BuiltinCode, ErrCode, ErrorRegistry, Error, EvalResult, Thrown},
    eval,
    heap::{
        Cons, DebugInfo, ExtFunc, Finalizer, Heap, HeapData, HeapId, HeapStats, PinToken,
        PreprocFn, SpecialOp, Str, ValueFlags,
    },
    intern::{Interner, StaticSyms, SymId},
    io::{PrintWriter, StdPrint},
    matcher::{MatchFlags, match_bind},
    parse::Reader,
    prepare, print,
    types::{TypeCode, TypeRegistry, type_of},
    value::{ListIter, UserPtr, Value, deep_eq},
};

/// Width cap for form reprs inside backtrace entries.
const BT_REPR_MAX: usize = 64;

/// An embeddable interpreter instance.
pub struct Vm {
    pub(crate) heap: Heap,
    pub(crate) interner: Interner,
    pub(crate) types: TypeRegistry,
    pub(crate) errors: ErrorRegistry,
    pub(crate) config: Config,
    /// Current environment: the head of the lexical lookup chain.
    pub(crate) env: HeapId,
    /// The environment stack: for every frame installed on top of the
    /// chain, the frame that was current before it. Unwinding pops here;
    /// lookups never consult it, so a callee only ever sees its own
    /// lexical chain and not the caller's scope.
    pub(crate) env_stack: Vec<HeapId>,
    /// The global frame terminating every chain.
    pub(crate) global: HeapId,
    /// Macro namespace: a single frame holding macro values.
    pub(crate) macros: HeapId,
    /// Special-operation namespace.
    pub(crate) specials: HeapId,
    /// Logical call depth, for the ESTACK ceiling.
    pub(crate) depth: u32,
    /// Tail transitions driven since the innermost `eval` entered, for
    /// backtrace placeholders.
    pub(crate) tail_calls: u32,
    pub(crate) last_error: Option<Box<Thrown>>,
    pub(crate) writer: Box<dyn PrintWriter>,
}

impl std::fmt::Debug for Vm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vm")
            .field("heap", &self.heap)
            .field("symbols", &self.interner.len())
            .finish_non_exhaustive()
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

impl Vm {
    /// Creates a VM with the built-in operations installed. The prelude is
    /// not loaded; call [`Vm::load_prelude`] for the derived macros.
    #[must_use]
    pub fn new() -> Self {
        let mut heap = Heap::new();
        let global = heap
            .allocate(HeapData::Env(EnvFrame::normal(None)))
            .expect("fresh heap allocation cannot fail");
        let macros = heap
            .allocate(HeapData::Env(EnvFrame::normal(None)))
            .expect("fresh heap allocation cannot fail");
        let specials = heap
            .allocate(HeapData::Env(EnvFrame::normal(None)))
            .expect("fresh heap allocation cannot fail");
        for id in [global, macros, specials] {
            heap.set_flag(id, ValueFlags::NO_ESCAPE, false);
        }

        let mut vm = Self {
            heap,
            interner: Interner::new(),
            types: TypeRegistry::new(),
            errors: ErrorRegistry::new(),
            config: Config::default(),
            env: global,
            env_stack: Vec::new(),
            global,
            macros,
            specials,
            depth: 0,
            tail_calls: 0,
            last_error: None,
            writer: Box::new(StdPrint),
        };
        vm.install_base_symbols();
        builtins::install(&mut vm);
        vm
    }

    /// `nil`, the error-code constants, and the `errno`/`errmsg` computed
    /// symbols.
    fn install_base_symbols(&mut self) {
        let nil_sym = SymId::from(StaticSyms::Nil);
        self.define_record(nil_sym, SymbolRecord::plain(Value::Nil, true))
            .expect("fresh global frame accepts definitions");

        let codes: Vec<(ErrCode, String)> = self
            .errors
            .builtin_codes()
            .map(|(code, name)| (code, name.to_owned()))
            .collect();
        for (code, name) in codes {
            let sym = self.interner.intern(&name);
            self.define_record(sym, SymbolRecord::plain(Value::ErrorCode(code), true))
                .expect("fresh global frame accepts definitions");
        }

        let errno_get: Rc<GetterFn> = Rc::new(|vm, _sym| {
            Ok(vm
                .last_error
                .as_ref()
                .map_or(Value::Nil, |err| Value::ErrorCode(err.code())))
        });
        let errmsg_get: Rc<GetterFn> = Rc::new(|vm, _sym| {
            let msg = vm
                .last_error
                .as_ref()
                .and_then(|err| err.msg().map(str::to_owned));
            match msg {
                // Built with the ceiling suspended: reporting an error must
                // not itself run out of memory.
                Some(text) => vm.alloc_error_string(text.as_bytes()),
                None => Ok(Value::Nil),
            }
        });
        for (name, getter) in [(StaticSyms::Errno, errno_get), (StaticSyms::Errmsg, errmsg_get)] {
            self.define_record(
                SymId::from(name),
                SymbolRecord {
                    binding: Binding::Computed {
                        get: Some(getter),
                        set: None,
                        protect: Value::Nil,
                    },
                    finalizer: None,
                    info: None,
                },
            )
            .expect("fresh global frame accepts definitions");
        }
    }

    // --- allocation and collection --------------------------------------

    /// Allocates through the heap, forcing a collection first when the
    /// request would overrun the memory ceiling.
    pub(crate) fn alloc(&mut self, data: HeapData) -> EvalResult<HeapId> {
        if self.heap.would_exceed(&data) {
            self.collect_garbage();
        }
        self.heap.allocate(data)
    }

    pub(crate) fn alloc_string(&mut self, bytes: &[u8]) -> EvalResult<Value> {
        let id = self.alloc(HeapData::Str(Str::Owned(bytes.into())))?;
        Ok(Value::Ref(id))
    }

    /// Builds a string for an error object with the ceiling suspended, so
    /// running out of memory cannot prevent reporting it.
    pub(crate) fn alloc_error_string(&mut self, bytes: &[u8]) -> EvalResult<Value> {
        let data = HeapData::Str(Str::Owned(bytes.into()));
        self.heap
            .with_ceiling_disabled(|heap| heap.allocate(data))
            .map(Value::Ref)
    }

    /// Mark-and-sweep now, rooted at the environment stack, the three
    /// namespaces, pins, and the shadow stack. Returns objects reclaimed.
    pub(crate) fn collect_garbage(&mut self) -> usize {
        let mut roots = Vec::with_capacity(4 + self.env_stack.len());
        roots.extend([self.env, self.global, self.macros, self.specials]);
        roots.extend(self.env_stack.iter().copied());
        self.heap.collect(&roots)
    }

    /// Installs `frame` as the current environment, recording the one it
    /// replaces so `pop_to` can unwind.
    pub(crate) fn push_frame(&mut self, frame: HeapId) {
        self.env_stack.push(self.env);
        self.env = frame;
    }

    // --- namespace access -------------------------------------------------

    fn ns_lookup(&self, frame: HeapId, sym: SymId) -> Option<Value> {
        let HeapData::Env(EnvFrame::Normal { map, .. }) = self.heap.get(frame) else {
            unreachable!("namespace frames are normal frames")
        };
        match map.get(&sym) {
            Some(SymbolRecord {
                binding: Binding::Value { value, .. },
                ..
            }) => Some(*value),
            _ => None,
        }
    }

    /// The special operation bound to `sym`, if any.
    pub(crate) fn special_lookup(&self, sym: SymId) -> Option<HeapId> {
        self.ns_lookup(self.specials, sym).and_then(Value::ref_id)
    }

    /// The macro bound to `sym`, if any.
    pub(crate) fn macro_lookup(&self, sym: SymId) -> Option<Value> {
        self.ns_lookup(self.macros, sym)
    }

    pub(crate) fn define_record(&mut self, sym: SymId, record: SymbolRecord) -> EvalResult<()> {
        let global = self.global;
        env::define_symbol(self, global, sym, record)
    }

    // --- backtrace capture ----------------------------------------------

    /// Captures the call site `form` onto an unwinding error.
    pub(crate) fn capture_bt(&mut self, mut err: Box<Thrown>, form: Value) -> Box<Thrown> {
        let limit = self.config.bt_limit as usize;
        if limit == 0 {
            return err;
        }
        let debug = form
            .ref_id()
            .and_then(|id| match self.heap.get(id) {
                HeapData::Cons(cons) => cons.debug,
                _ => None,
            });
        let entry = match debug {
            Some(DebugInfo::Loc(loc)) => BtEntry {
                loc: Some(loc),
                form: print::short_repr(self, form, BT_REPR_MAX),
                expanded: None,
                elided_tails: 0,
            },
            Some(DebugInfo::Orig(orig)) => {
                let loc = orig.ref_id().and_then(|id| match self.heap.get(id) {
                    HeapData::Cons(Cons {
                        debug: Some(DebugInfo::Loc(loc)),
                        ..
                    }) => Some(*loc),
                    _ => None,
                });
                BtEntry {
                    loc,
                    form: print::short_repr(self, orig, BT_REPR_MAX),
                    expanded: Some(print::short_repr(self, form, BT_REPR_MAX)),
                    elided_tails: 0,
                }
            }
            None => BtEntry {
                loc: None,
                form: print::short_repr(self, form, BT_REPR_MAX),
                expanded: None,
                elided_tails: 0,
            },
        };
        err.push_bt(entry, limit);
        err
    }

    /// Records elided tail-call frames between two real entries.
    pub(crate) fn push_tail_placeholder(&mut self, err: &mut Thrown, elided: u32) {
        let limit = self.config.bt_limit as usize;
        if limit == 0 {
            return;
        }
        err.push_bt(
            BtEntry {
                loc: None,
                form: String::new(),
                expanded: None,
                elided_tails: elided,
            },
            limit,
        );
    }

    // --- public error conversion ----------------------------------------

    fn public<T>(&mut self, result: EvalResult<T>) -> Result<T, Error> {
        result.map_err(|thrown| {
            let error = Error {
                code: thrown.code(),
                code_name: self.errors.name(thrown.code()).to_owned(),
                message: thrown.msg().map(str::to_owned),
            };
            self.last_error = Some(thrown);
            error
        })
    }

    // --- configuration ---------------------------------------------------

    /// Reads an int option by name.
    pub fn config_int(&mut self, name: &str) -> Result<i64, Error> {
        let result = self.config.get_int(name);
        self.public(result)
    }

    /// Reads a bool option by name.
    pub fn config_bool(&mut self, name: &str) -> Result<bool, Error> {
        let result = self.config.get_bool(name);
        self.public(result)
    }

    /// Sets an int option by name, type- and range-checked.
    pub fn set_config_int(&mut self, name: &str, value: i64) -> Result<(), Error> {
        let result = self.config.set_int(name, value);
        let out = self.public(result);
        if out.is_ok() && name == "mem-limit" {
            self.heap.set_mem_limit(self.config.mem_limit);
        }
        out
    }

    /// Sets a bool option by name.
    pub fn set_config_bool(&mut self, name: &str, value: bool) -> Result<(), Error> {
        let result = self.config.set_bool(name, value);
        self.public(result)
    }

    // --- type system ------------------------------------------------------

    /// Registers a user type aliasing `base` and binds its name in the
    /// global namespace as a type-code value.
    pub fn new_type(&mut self, name: &str, base: TypeCode) -> Result<TypeCode, Error> {
        let result = (|| {
            let code = self.types.register(name, base)?;
            let sym = self.interner.intern(name);
            self.define_record(sym, SymbolRecord::plain(Value::TypeCode(code), true))?;
            Ok(code)
        })();
        self.public(result)
    }

    /// Finds a type code by name, basic names included.
    #[must_use]
    pub fn find_type(&self, name: &str) -> Option<TypeCode> {
        self.types.find(name)
    }

    /// Resolves an alias chain fully to a basic code.
    #[must_use]
    pub fn resolve_type(&self, code: TypeCode) -> TypeCode {
        self.types.resolve(code)
    }

    /// The directly declared base of a code.
    #[must_use]
    pub fn get_base_type(&self, code: TypeCode) -> TypeCode {
        self.types.base_of(code)
    }

    /// The type code of a value.
    #[must_use]
    pub fn type_of(&self, value: Value) -> TypeCode {
        type_of(&self.heap, value)
    }

    // --- value construction ----------------------------------------------

    /// Interns `name` and returns it as an identifier value.
    pub fn sym(&mut self, name: &str) -> Value {
        Value::Sym(self.interner.intern(name))
    }

    /// The name of an identifier value.
    #[must_use]
    pub fn sym_name(&self, sym: SymId) -> &str {
        self.interner.name(sym)
    }

    /// Allocates a string value.
    pub fn string(&mut self, text: &str) -> Result<Value, Error> {
        let result = self.alloc_string(text.as_bytes());
        self.public(result)
    }

    /// Allocates one cons cell.
    pub fn cons(&mut self, car: Value, cdr: Value) -> Result<Value, Error> {
        let result = self
            .alloc(HeapData::Cons(Cons { car, cdr, debug: None }))
            .map(Value::Ref);
        self.public(result)
    }

    /// Builds a proper list from a slice.
    pub fn list(&mut self, items: &[Value]) -> Result<Value, Error> {
        let result = (|| {
            let mark = self.heap.root_mark();
            let mut out = Value::Nil;
            for &item in items.iter().rev() {
                let id = self.alloc(HeapData::Cons(Cons {
                    car: item,
                    cdr: out,
                    debug: None,
                }))?;
                out = Value::Ref(id);
                self.heap.root(out);
            }
            self.heap.root_truncate(mark);
            Ok(out)
        })();
        self.public(result)
    }

    /// The byte contents of a string value, if it is one.
    #[must_use]
    pub fn string_bytes(&self, value: Value) -> Option<&[u8]> {
        let id = value.ref_id()?;
        matches!(self.heap.get(id), HeapData::Str(_)).then(|| self.heap.str_bytes(id))
    }

    /// The elements of a proper list, if `value` is one (nil included).
    #[must_use]
    pub fn list_to_vec(&self, value: Value) -> Option<Vec<Value>> {
        let mut iter = ListIter::new(&self.heap, value);
        let items: Vec<Value> = iter.by_ref().collect();
        iter.rest().is_nil().then_some(items)
    }

    // --- symbol definition ------------------------------------------------

    /// Defines `name` in the current environment.
    pub fn def(&mut self, name: &str, value: Value, read_only: bool) -> Result<(), Error> {
        let sym = self.interner.intern(name);
        let env = self.env;
        let result = env::define_symbol(self, env, sym, SymbolRecord::plain(value, read_only));
        self.public(result)
    }

    /// Mutates an existing reachable symbol.
    pub fn set(&mut self, name: &str, value: Value) -> Result<(), Error> {
        let sym = self.interner.intern(name);
        let env = self.env;
        let result = env::set_symbol(self, env, sym, value);
        self.public(result)
    }

    /// Reads a symbol; a miss is ENOSYM.
    pub fn get(&mut self, name: &str) -> Result<Value, Error> {
        let sym = self.interner.intern(name);
        let env = self.env;
        let result = env::get_symbol(self, env, sym);
        self.public(result)
    }

    /// Reads a symbol; a miss is `None`. Getter errors still surface.
    pub fn try_get(&mut self, name: &str) -> Result<Option<Value>, Error> {
        let sym = self.interner.intern(name);
        let env = self.env;
        let result = env::try_get_symbol(self, env, sym);
        self.public(result)
    }

    /// Defines a computed symbol with host getter/setter, an optional
    /// finalizer, opaque info, and a protect slot the collector keeps
    /// reachable on the symbol's behalf.
    pub fn defsym(
        &mut self,
        name: &str,
        get: Option<Rc<GetterFn>>,
        set: Option<Rc<SetterFn>>,
        finalizer: Option<SymFinalizer>,
        info: Option<UserPtr>,
        protect: Value,
    ) -> Result<(), Error> {
        let sym = self.interner.intern(name);
        let record = SymbolRecord {
            binding: Binding::Computed { get, set, protect },
            finalizer,
            info,
        };
        let env = self.env;
        let result = env::define_symbol(self, env, sym, record);
        self.public(result)
    }

    /// Defines a native function in the global namespace.
    pub fn defun(
        &mut self,
        name: &str,
        call: impl Fn(&mut Vm, &[Value]) -> EvalResult<Value> + 'static,
        info: Option<UserPtr>,
    ) -> Result<Value, Error> {
        let sym = self.interner.intern(name);
        let result = (|| {
            let id = self.alloc(HeapData::ExtFunc(ExtFunc {
                name: sym,
                call: Rc::new(call),
                info,
            }))?;
            self.define_record(sym, SymbolRecord::plain(Value::Ref(id), false))?;
            Ok(Value::Ref(id))
        })();
        self.public(result)
    }

    /// Installs a special operation: a tail-capable callback plus an
    /// optional preprocessor, bound in the special-operation namespace.
    pub fn defsyntax(
        &mut self,
        name: &str,
        call: impl Fn(&mut Vm, Value, HeapId) -> EvalResult<crate::eval::Step> + 'static,
        preproc: Option<Rc<PreprocFn>>,
        info: Option<UserPtr>,
    ) -> Result<(), Error> {
        let sym = self.interner.intern(name);
        let result = (|| {
            let id = self.alloc(HeapData::SpecialOp(SpecialOp {
                name: sym,
                call: Rc::new(call),
                preproc,
                info,
            }))?;
            let specials = self.specials;
            env::define_symbol(self, specials, sym, SymbolRecord::plain(Value::Ref(id), true))
        })();
        self.public(result)
    }

    /// Defines a macro value (a closure or external function) in the macro
    /// namespace.
    pub(crate) fn define_macro(&mut self, sym: SymId, value: Value) -> EvalResult<()> {
        let macros = self.macros;
        env::define_symbol(self, macros, sym, SymbolRecord::plain(value, true))
    }

    // --- environment stack ------------------------------------------------

    /// Pushes a fresh empty frame linked below the current environment.
    pub fn push_env(&mut self) -> Result<(), Error> {
        let result = (|| {
            let env = self.env;
            let frame = self.alloc(HeapData::Env(EnvFrame::normal(Some(env))))?;
            self.push_frame(frame);
            Ok(())
        })();
        self.public(result)
    }

    /// Pushes a bifurcated frame whose main child is a user-supplied
    /// environment value; its lookups take precedence over the current
    /// chain.
    pub fn enter_env(&mut self, main: Value) -> Result<(), Error> {
        let result = (|| {
            let id = main.ref_id().filter(|&id| matches!(self.heap.get(id), HeapData::Env(_)));
            let Some(main_id) = id else {
                return Err(crate::errors::throw(
                    BuiltinCode::Eapi,
                    "enter takes an environment value",
                ));
            };
            // The supplied frame outlives this entry.
            env::mark_escaping(&mut self.heap, main_id);
            let env = self.env;
            let bif = self.alloc(HeapData::Env(EnvFrame::Bif {
                main: main_id,
                fallback: env,
            }))?;
            self.push_frame(bif);
            Ok(())
        })();
        self.public(result)
    }

    /// Pops the most recently pushed frame. An un-captured frame is freed
    /// on the spot; popping past the global frame is EAPI.
    pub fn pop_env(&mut self) -> Result<(), Error> {
        let result = (|| {
            let Some(prev) = self.env_stack.pop() else {
                return Err(crate::errors::throw(
                    BuiltinCode::Eapi,
                    "no environment frame to pop",
                ));
            };
            let popped = self.env;
            self.env = prev;
            eval::free_if_unescaped(&mut self.heap, popped);
            Ok(())
        })();
        self.public(result)
    }

    // --- synced variables -------------------------------------------------

    fn sync(&mut self, name: &str, cell: SyncCell, read_only: bool) -> Result<(), Error> {
        let sym = self.interner.intern(name);
        let record = SymbolRecord {
            binding: Binding::Synced { cell, read_only },
            finalizer: None,
            info: None,
        };
        let env = self.env;
        let result = env::define_symbol(self, env, sym, record);
        self.public(result)
    }

    /// Synchronizes `name` with a host-owned int cell.
    pub fn sync_int(&mut self, name: &str, cell: Rc<Cell<i64>>, read_only: bool) -> Result<(), Error> {
        self.sync(name, SyncCell::Int(cell), read_only)
    }

    /// Synchronizes `name` with a host-owned bool cell.
    pub fn sync_bool(&mut self, name: &str, cell: Rc<Cell<bool>>, read_only: bool) -> Result<(), Error> {
        self.sync(name, SyncCell::Bool(cell), read_only)
    }

    /// Synchronizes `name` with a host-owned single-precision cell.
    pub fn sync_float(&mut self, name: &str, cell: Rc<Cell<f32>>, read_only: bool) -> Result<(), Error> {
        self.sync(name, SyncCell::Float(cell), read_only)
    }

    /// Synchronizes `name` with a host-owned double cell.
    pub fn sync_double(&mut self, name: &str, cell: Rc<Cell<f64>>, read_only: bool) -> Result<(), Error> {
        self.sync(name, SyncCell::Double(cell), read_only)
    }

    /// Synchronizes `name` with a fixed-capacity host byte buffer.
    pub fn sync_nstring(
        &mut self,
        name: &str,
        buf: Rc<RefCell<Vec<u8>>>,
        cap: usize,
        read_only: bool,
    ) -> Result<(), Error> {
        self.sync(name, SyncCell::NString { buf, cap }, read_only)
    }

    // --- reading ----------------------------------------------------------

    /// Reads a single form from a string. An empty source is EEOF.
    pub fn readstr(&mut self, source: &str) -> Result<Value, Error> {
        let result = (|| {
            let mut reader = Reader::new(self, source.as_bytes().to_vec(), "<string>");
            match reader.read_one(self)? {
                Some(value) => Ok(value),
                None => Err(crate::errors::throw_bare(BuiltinCode::Eeof)),
            }
        })();
        self.public(result)
    }

    // --- evaluation ---------------------------------------------------------

    /// Preprocesses and evaluates one form in the current environment.
    pub fn eval(&mut self, form: Value) -> Result<Value, Error> {
        let result = (|| {
            let mark = self.heap.root_mark();
            self.heap.root(form);
            let out = prepare::preproc(self, form).and_then(|prepared| {
                self.heap.set_root(mark, prepared);
                eval::eval(self, prepared)
            });
            if let Ok(value) = &out {
                self.heap.set_root(mark, *value);
            }
            if self.config.hyper_gc || self.heap.wants_gc() {
                self.collect_garbage();
            }
            self.heap.root_truncate(mark);
            out
        })();
        self.public(result)
    }

    /// Reads, preprocesses, and evaluates every form in `source`,
    /// returning the last result.
    pub fn eval_string(&mut self, source: &str, path: &str) -> Result<Value, Error> {
        let mut reader = Reader::new(self, source.as_bytes().to_vec(), path);
        let mut last = Value::Nil;
        loop {
            let form = {
                let result = reader.read_one(self);
                self.public(result)?
            };
            let Some(form) = form else { break };
            last = self.eval(form)?;
        }
        Ok(last)
    }

    /// Runs the preprocessing pass over a form without evaluating it.
    pub fn preproc(&mut self, form: Value) -> Result<Value, Error> {
        let result = (|| {
            let mark = self.heap.root_mark();
            self.heap.root(form);
            let out = prepare::preproc(self, form);
            self.heap.root_truncate(mark);
            out
        })();
        self.public(result)
    }

    /// Applies one macroexpansion step; the form comes back unchanged when
    /// its head is not a macro.
    pub fn macroexpand_once(&mut self, form: Value) -> Result<Value, Error> {
        let result = prepare::macroexpand_once(self, form).map(|out| out.unwrap_or(form));
        self.public(result)
    }

    /// Macroexpands to a fixed point.
    pub fn macroexpand(&mut self, form: Value) -> Result<Value, Error> {
        let result = prepare::macroexpand(self, form);
        self.public(result)
    }

    /// Calls a function or external function on an already-evaluated
    /// argument list.
    pub fn apply(&mut self, func: Value, args: Value) -> Result<Value, Error> {
        let result = eval::apply(self, func, args);
        self.public(result)
    }

    /// Matches `pattern` against `value`, binding into the current
    /// environment on success.
    pub fn match_in(&mut self, pattern: Value, value: Value, flags: MatchFlags) -> Result<bool, Error> {
        let env = self.env;
        let result = match_bind(self, pattern, value, env, flags);
        self.public(result)
    }

    /// Deep structural equality.
    #[must_use]
    pub fn eq(&self, left: Value, right: Value) -> bool {
        deep_eq(&self.heap, left, right)
    }

    /// Tag-plus-identity equivalence.
    #[must_use]
    pub fn equiv(&self, left: Value, right: Value) -> bool {
        left.equiv(right)
    }

    /// Renders a value in repr form (strings quoted and escaped).
    #[must_use]
    pub fn repr(&self, value: Value) -> String {
        let mut out = String::new();
        print::write_value(&mut out, self, value, true);
        out
    }

    /// Renders a value in display form (strings raw).
    #[must_use]
    pub fn display(&self, value: Value) -> String {
        let mut out = String::new();
        print::write_value(&mut out, self, value, false);
        out
    }

    // --- errors -------------------------------------------------------------

    /// The code of the last error observed through the public API, until
    /// cleared.
    #[must_use]
    pub fn errno(&self) -> Option<ErrCode> {
        self.last_error.as_ref().map(|err| err.code())
    }

    /// Clears the error state.
    pub fn clear_errno(&mut self) {
        self.last_error = None;
    }

    /// Sets the error state and returns the thrown payload, for native
    /// callbacks that want to raise.
    pub fn throw(&mut self, code: ErrCode, msg: Option<&str>) -> Box<Thrown> {
        let thrown = Thrown::new(code, msg.map(str::to_owned));
        self.last_error = Some(thrown.clone());
        thrown
    }

    /// Registers a user error code and binds its name in the global
    /// namespace. Registering an existing name returns its code.
    pub fn new_error_code(&mut self, name: &str) -> Result<ErrCode, Error> {
        let existing = self.errors.find(name);
        let code = self.errors.register(name);
        if existing.is_none() {
            let sym = self.interner.intern(name);
            let result = self.define_record(sym, SymbolRecord::plain(Value::ErrorCode(code), true));
            self.public(result)?;
        }
        Ok(code)
    }

    /// Finds an error code by name.
    #[must_use]
    pub fn find_error_code(&self, name: &str) -> Option<ErrCode> {
        self.errors.find(name)
    }

    /// The symbolic name of an error code.
    #[must_use]
    pub fn error_code_name(&self, code: ErrCode) -> &str {
        self.errors.name(code)
    }

    /// Appends a call-site entry for `form` to the last error.
    pub fn add_bt(&mut self, form: Value) {
        if let Some(err) = self.last_error.take() {
            let err = self.capture_bt(err, form);
            self.last_error = Some(err);
        }
    }

    /// Prints the backtrace and message of the last error through the
    /// writer's stderr channel.
    pub fn perror(&mut self, prefix: &str) {
        let Some(err) = self.last_error.take() else { return };
        let rendered = self.render_error(prefix, &err);
        let _ = self.writer.stderr_write(&rendered);
        self.last_error = Some(err);
    }

    /// Renders backtrace plus `prefix: message (CODE)`.
    pub(crate) fn render_error(&self, prefix: &str, err: &Thrown) -> String {
        let mut out = String::new();
        if !err.bt.is_empty() {
            out.push_str("Backtrace (most recent call first):\n");
            for entry in &err.bt {
                if entry.elided_tails > 0 {
                    let _ = writeln!(out, "  ...tail calls ({n})...", n = entry.elided_tails);
                    continue;
                }
                match entry.loc {
                    Some(loc) => {
                        let _ = writeln!(
                            out,
                            "  at {form} ({file}:{line}:{pos})",
                            form = entry.form,
                            file = self.interner.name(loc.file),
                            line = loc.line,
                            pos = loc.pos
                        );
                    }
                    None => {
                        let _ = writeln!(out, "  at {form}", form = entry.form);
                    }
                }
                if let Some(expanded) = &entry.expanded {
                    let _ = writeln!(out, "    expands to {expanded}");
                }
            }
            if err.bt_truncated {
                let _ = writeln!(
                    out,
                    "  (truncated to last {limit} calls)",
                    limit = self.config.bt_limit
                );
            }
        }
        let code_name = self.errors.name(err.code());
        match err.msg() {
            Some(msg) => {
                let _ = writeln!(out, "{prefix}: {msg} ({code_name})");
            }
            None => {
                let _ = writeln!(out, "{prefix}: ({code_name})");
            }
        }
        out
    }

    // --- GC ------------------------------------------------------------------

    /// Pins a value against collection; the token releases it.
    pub fn ref_value(&mut self, value: Value) -> PinToken {
        self.heap.pin(value)
    }

    /// Releases a pin taken with [`Vm::ref_value`].
    pub fn unref(&mut self, token: PinToken) {
        self.heap.unpin(token);
    }

    /// Runs `f` with `value` pinned, releasing the pin on the way out.
    pub fn with_pinned<T>(&mut self, value: Value, f: impl FnOnce(&mut Self) -> T) -> T {
        let token = self.heap.pin(value);
        let out = f(self);
        self.heap.unpin(token);
        out
    }

    /// Forces a full collection. Returns the number of objects reclaimed.
    pub fn force_gc(&mut self) -> usize {
        self.collect_garbage()
    }

    /// Attaches a finalizer to a heap value.
    pub fn set_finalizer(&mut self, value: Value, finalizer: Finalizer) -> Result<(), Error> {
        let result = match value.ref_id() {
            Some(id) => {
                self.heap.set_finalizer(id, finalizer);
                Ok(())
            }
            None => Err(crate::errors::throw(
                BuiltinCode::Eapi,
                "finalizers attach to heap values only",
            )),
        };
        self.public(result)
    }

    /// Heap statistics snapshot.
    #[must_use]
    pub fn heap_stats(&self) -> HeapStats {
        self.heap.stats()
    }

    // --- output --------------------------------------------------------------

    /// Replaces the output writer (default: process stdout/stderr).
    pub fn set_writer(&mut self, writer: Box<dyn PrintWriter>) {
        self.writer = writer;
    }

    // --- prelude --------------------------------------------------------------

    /// Loads the in-language prelude (derived macros: defmacro, defn,
    /// when, unless, cond, while, list helpers).
    pub fn load_prelude(&mut self) -> Result<(), Error> {
        self.eval_string(include_str!("prelude.lisp"), "<prelude>")
            .map(|_| ())
    }
}

impl Drop for Vm {
    fn drop(&mut self) {
        let leaked = self.heap.teardown();
        if leaked > 0 {
            eprintln!("sprig: {leaked} heap objects leaked at VM teardown");
        }
    }
}
