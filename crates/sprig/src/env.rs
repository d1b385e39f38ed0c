//! Environment frames and the symbol protocol.
//!
//! A frame is either *normal* (an ordered map of symbol records plus a
//! `below` link to the enclosing frame) or *bifurcated* (two child frames,
//! consulted main-first). Frames are heap values, so closures capture them
//! and the collector traces them like anything else. The global frame
//! terminates every chain.
//!
//! A symbol record is a plain value slot, a computed slot (host getter and
//! setter), or a slot synced to a host-owned cell. Whatever a record
//! semantically owns is reachable through its value or protect slot, which
//! the collector traces.

use std::{
    cell::{Cell, RefCell},
    fmt,
    rc::Rc,
};

use indexmap::IndexMap;

use crate::{
    errors::{BuiltinCode, EvalResult, throw},
    heap::{Heap, HeapData, HeapId, Str, ValueFlags},
    intern::SymId,
    value::{UserPtr, Value},
    vm::Vm,
};

/// Host getter for a computed symbol.
pub type GetterFn = dyn Fn(&mut Vm, SymId) -> EvalResult<Value>;
/// Host setter for a computed symbol.
pub type SetterFn = dyn Fn(&mut Vm, SymId, Value) -> EvalResult<()>;
/// Finalizer attached to a symbol record; runs when the frame holding the
/// record is reclaimed.
pub type SymFinalizer = Rc<dyn Fn(&mut Heap, SymId)>;

/// A host-owned cell a symbol can be synchronized with.
#[derive(Clone)]
pub enum SyncCell {
    Int(Rc<Cell<i64>>),
    Bool(Rc<Cell<bool>>),
    Float(Rc<Cell<f32>>),
    Double(Rc<Cell<f64>>),
    /// Fixed-capacity byte string; writes beyond `cap` are rejected.
    NString { buf: Rc<RefCell<Vec<u8>>>, cap: usize },
}

impl fmt::Debug for SyncCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(_) => f.write_str("SyncCell::Int"),
            Self::Bool(_) => f.write_str("SyncCell::Bool"),
            Self::Float(_) => f.write_str("SyncCell::Float"),
            Self::Double(_) => f.write_str("SyncCell::Double"),
            Self::NString { cap, .. } => write!(f, "SyncCell::NString(cap={cap})"),
        }
    }
}

/// How a symbol stores its value.
pub(crate) enum Binding {
    /// An ordinary variable.
    Value { value: Value, read_only: bool },
    /// Host-computed: reads go through `get`, writes through `set`.
    /// `protect` keeps whatever the symbol semantically owns reachable.
    Computed {
        get: Option<Rc<GetterFn>>,
        set: Option<Rc<SetterFn>>,
        protect: Value,
    },
    /// Synchronized with a host cell.
    Synced { cell: SyncCell, read_only: bool },
}

pub(crate) struct SymbolRecord {
    pub binding: Binding,
    pub finalizer: Option<SymFinalizer>,
    pub info: Option<UserPtr>,
}

impl fmt::Debug for SymbolRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &self.binding {
            Binding::Value { value, read_only } => {
                return f
                    .debug_struct("SymbolRecord")
                    .field("value", value)
                    .field("read_only", read_only)
                    .finish_non_exhaustive();
            }
            Binding::Computed { .. } => "computed",
            Binding::Synced { .. } => "synced",
        };
        f.debug_struct("SymbolRecord").field("kind", &kind).finish_non_exhaustive()
    }
}

impl SymbolRecord {
    pub fn plain(value: Value, read_only: bool) -> Self {
        Self {
            binding: Binding::Value { value, read_only },
            finalizer: None,
            info: None,
        }
    }
}

/// One environment frame.
pub(crate) enum EnvFrame {
    Normal {
        map: IndexMap<SymId, SymbolRecord>,
        below: Option<HeapId>,
    },
    /// Two child frames: lookups try `main` first, then `fallback`.
    Bif { main: HeapId, fallback: HeapId },
}

impl fmt::Debug for EnvFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Normal { map, below } => f
                .debug_struct("EnvFrame::Normal")
                .field("symbols", &map.len())
                .field("below", below)
                .finish(),
            Self::Bif { main, fallback } => f
                .debug_struct("EnvFrame::Bif")
                .field("main", main)
                .field("fallback", fallback)
                .finish(),
        }
    }
}

impl EnvFrame {
    pub fn normal(below: Option<HeapId>) -> Self {
        Self::Normal {
            map: IndexMap::new(),
            below,
        }
    }

    /// Pushes every value this frame keeps reachable: stored values,
    /// protect slots, and the frames it links to.
    pub fn trace(&self, push: &mut dyn FnMut(Value)) {
        match self {
            Self::Normal { map, below } => {
                for record in map.values() {
                    match &record.binding {
                        Binding::Value { value, .. } => push(*value),
                        Binding::Computed { protect, .. } => push(*protect),
                        Binding::Synced { .. } => {}
                    }
                }
                if let Some(below) = below {
                    push(Value::Ref(*below));
                }
            }
            Self::Bif { main, fallback } => {
                push(Value::Ref(*main));
                push(Value::Ref(*fallback));
            }
        }
    }

    /// Rough byte estimate for heap accounting.
    pub fn estimate_size(&self) -> usize {
        match self {
            Self::Normal { map, .. } => {
                map.capacity() * (std::mem::size_of::<SymId>() + std::mem::size_of::<SymbolRecord>())
            }
            Self::Bif { .. } => 0,
        }
    }

    /// Drains the symbol finalizers out of the frame, for the sweep that
    /// reclaims it.
    pub fn take_finalizers(&mut self) -> Vec<(SymId, SymFinalizer)> {
        match self {
            Self::Normal { map, .. } => map
                .iter_mut()
                .filter_map(|(sym, record)| record.finalizer.take().map(|f| (*sym, f)))
                .collect(),
            Self::Bif { .. } => Vec::new(),
        }
    }
}

fn expect_frame<'h>(heap: &'h Heap, id: HeapId) -> &'h EnvFrame {
    match heap.get(id) {
        HeapData::Env(frame) => frame,
        _ => panic!("environment id does not name a frame"),
    }
}

fn expect_frame_mut<'h>(heap: &'h mut Heap, id: HeapId) -> &'h mut EnvFrame {
    match heap.get_mut(id) {
        HeapData::Env(frame) => frame,
        _ => panic!("environment id does not name a frame"),
    }
}

/// What a lookup found, extracted so the heap borrow can end before any
/// host callback runs.
enum Resolved {
    Value(Value),
    Getter(Rc<GetterFn>),
    WriteOnly,
    Synced(SyncCell),
}

/// Walks the chain for `sym`: bifurcated frames main-first then fallback,
/// normal frames local map then `below`.
fn find(heap: &Heap, env: HeapId, sym: SymId) -> Option<(HeapId, Resolved)> {
    let mut stack: Vec<HeapId> = vec![env];
    while let Some(id) = stack.pop() {
        match expect_frame(heap, id) {
            EnvFrame::Normal { map, below } => {
                if let Some(record) = map.get(&sym) {
                    let resolved = match &record.binding {
                        Binding::Value { value, .. } => Resolved::Value(*value),
                        Binding::Computed { get: Some(get), .. } => Resolved::Getter(Rc::clone(get)),
                        Binding::Computed { get: None, .. } => Resolved::WriteOnly,
                        Binding::Synced { cell, .. } => Resolved::Synced(cell.clone()),
                    };
                    return Some((id, resolved));
                }
                if let Some(below) = below {
                    stack.push(*below);
                }
            }
            EnvFrame::Bif { main, fallback } => {
                // main-first: push fallback below main on the stack.
                stack.push(*fallback);
                stack.push(*main);
            }
        }
    }
    None
}

/// Reads a symbol, walking the chain from `env`. ENOSYM on a miss,
/// EWRITEONLY when the record has no getter.
pub(crate) fn get_symbol(vm: &mut Vm, env: HeapId, sym: SymId) -> EvalResult<Value> {
    let resolved = match find(&vm.heap, env, sym) {
        Some((_, resolved)) => resolved,
        None => {
            let name = vm.interner.name(sym).to_owned();
            return Err(throw(BuiltinCode::Enosym, format!("no symbol `{name}`")));
        }
    };
    match resolved {
        Resolved::Value(value) => Ok(value),
        Resolved::Getter(get) => get(vm, sym),
        Resolved::WriteOnly => {
            let name = vm.interner.name(sym).to_owned();
            Err(throw(BuiltinCode::Ewriteonly, format!("symbol `{name}` is write-only")))
        }
        Resolved::Synced(cell) => read_cell(vm, &cell),
    }
}

/// Like [`get_symbol`] but a miss is `None` instead of ENOSYM. Computed
/// getter errors still propagate.
pub(crate) fn try_get_symbol(vm: &mut Vm, env: HeapId, sym: SymId) -> EvalResult<Option<Value>> {
    if find(&vm.heap, env, sym).is_none() {
        return Ok(None);
    }
    get_symbol(vm, env, sym).map(Some)
}

fn read_cell(vm: &mut Vm, cell: &SyncCell) -> EvalResult<Value> {
    Ok(match cell {
        SyncCell::Int(c) => Value::Int(c.get()),
        SyncCell::Bool(c) => Value::Bool(c.get()),
        SyncCell::Float(c) => Value::Double(f64::from(c.get())),
        SyncCell::Double(c) => Value::Double(c.get()),
        SyncCell::NString { buf, .. } => {
            let bytes = buf.borrow().clone();
            let id = vm.alloc(HeapData::Str(Str::Owned(bytes.into_boxed_slice())))?;
            Value::Ref(id)
        }
    })
}

/// Mutates an existing reachable symbol. ENOSYM on a miss; EREADONLY when
/// the record rejects writes; synced cells type- and range-check.
pub(crate) fn set_symbol(vm: &mut Vm, env: HeapId, sym: SymId, value: Value) -> EvalResult<()> {
    enum Writable {
        Slot(HeapId),
        Setter(Rc<SetterFn>),
        Synced(SyncCell, bool),
        ReadOnly,
    }

    let writable = {
        let Some((frame_id, _)) = find(&vm.heap, env, sym) else {
            let name = vm.interner.name(sym).to_owned();
            return Err(throw(BuiltinCode::Enosym, format!("no symbol `{name}`")));
        };
        let EnvFrame::Normal { map, .. } = expect_frame(&vm.heap, frame_id) else {
            unreachable!("find returns normal frames only")
        };
        let record = &map[&sym];
        match &record.binding {
            Binding::Value { read_only: true, .. } => Writable::ReadOnly,
            Binding::Value { .. } => Writable::Slot(frame_id),
            Binding::Computed { set: Some(set), .. } => Writable::Setter(Rc::clone(set)),
            Binding::Computed { set: None, .. } => Writable::ReadOnly,
            Binding::Synced { cell, read_only } => Writable::Synced(cell.clone(), *read_only),
        }
    };

    match writable {
        Writable::ReadOnly => {
            let name = vm.interner.name(sym).to_owned();
            Err(throw(BuiltinCode::Ereadonly, format!("symbol `{name}` is read-only")))
        }
        Writable::Slot(frame_id) => {
            let EnvFrame::Normal { map, .. } = expect_frame_mut(&mut vm.heap, frame_id) else {
                unreachable!()
            };
            if let Some(SymbolRecord {
                binding: Binding::Value { value: slot, .. },
                ..
            }) = map.get_mut(&sym)
            {
                *slot = value;
            }
            Ok(())
        }
        Writable::Setter(set) => set(vm, sym, value),
        Writable::Synced(_, true) => {
            let name = vm.interner.name(sym).to_owned();
            Err(throw(BuiltinCode::Ereadonly, format!("symbol `{name}` is read-only")))
        }
        Writable::Synced(cell, false) => write_cell(vm, &cell, value),
    }
}

fn write_cell(vm: &Vm, cell: &SyncCell, value: Value) -> EvalResult<()> {
    match (cell, value) {
        (SyncCell::Int(c), Value::Int(i)) => c.set(i),
        (SyncCell::Bool(c), Value::Bool(b)) => c.set(b),
        (SyncCell::Double(c), Value::Double(d)) => c.set(d),
        (SyncCell::Float(c), Value::Double(d)) => {
            let narrowed = d as f32;
            if d.is_finite() && !narrowed.is_finite() {
                return Err(throw(BuiltinCode::Evalue, "value does not fit a float cell"));
            }
            c.set(narrowed);
        }
        (SyncCell::NString { buf, cap }, Value::Ref(id)) => {
            let HeapData::Str(_) = vm.heap.get(id) else {
                return Err(throw(BuiltinCode::Etype, "synced string expects a string value"));
            };
            let bytes = vm.heap.str_bytes(id);
            if bytes.len() > *cap {
                return Err(throw(
                    BuiltinCode::Evalue,
                    format!("string of {got} bytes exceeds buffer of {cap}", got = bytes.len()),
                ));
            }
            let copied = bytes.to_vec();
            *buf.borrow_mut() = copied;
        }
        (SyncCell::Int(_), _) => return Err(throw(BuiltinCode::Etype, "synced int expects an int value")),
        (SyncCell::Bool(_), _) => return Err(throw(BuiltinCode::Etype, "synced bool expects a bool value")),
        (SyncCell::Float(_) | SyncCell::Double(_), _) => {
            return Err(throw(BuiltinCode::Etype, "synced double expects a double value"));
        }
        (SyncCell::NString { .. }, _) => {
            return Err(throw(BuiltinCode::Etype, "synced string expects a string value"));
        }
    }
    Ok(())
}

/// Creates a symbol in the nearest normal frame at or below `env`
/// (bifurcated frames delegate to their main child).
///
/// A second define of the same name in the same frame is EEXIST, except in
/// the global frame when `allow-redef` is on.
pub(crate) fn define_symbol(
    vm: &mut Vm,
    env: HeapId,
    sym: SymId,
    record: SymbolRecord,
) -> EvalResult<()> {
    let mut id = env;
    let target = loop {
        match expect_frame(&vm.heap, id) {
            EnvFrame::Normal { .. } => break id,
            EnvFrame::Bif { main, .. } => id = *main,
        }
    };
    let redef_ok = target == vm.global && vm.config.allow_redef;
    let EnvFrame::Normal { map, .. } = expect_frame_mut(&mut vm.heap, target) else {
        unreachable!()
    };
    if map.contains_key(&sym) && !redef_ok {
        let name = vm.interner.name(sym).to_owned();
        return Err(throw(BuiltinCode::Eexist, format!("symbol `{name}` already defined")));
    }
    map.insert(sym, record);
    Ok(())
}

/// Clears the no-escape bit down the chain starting at `env`.
///
/// Called the moment anything that can outlive a frame captures it
/// (closure creation, an explicit environment value). Clearing stops at
/// the first already-escaping frame: the bit only ever clears downward, so
/// everything below it is clear already.
pub(crate) fn mark_escaping(heap: &mut Heap, env: HeapId) {
    let mut stack = vec![env];
    while let Some(id) = stack.pop() {
        if !heap.flags(id).contains(ValueFlags::NO_ESCAPE) {
            continue;
        }
        heap.set_flag(id, ValueFlags::NO_ESCAPE, false);
        match expect_frame(heap, id) {
            EnvFrame::Normal { below: Some(below), .. } => stack.push(*below),
            EnvFrame::Normal { below: None, .. } => {}
            EnvFrame::Bif { main, fallback } => {
                stack.push(*main);
                stack.push(*fallback);
            }
        }
    }
}

