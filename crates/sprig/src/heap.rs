//! The arena heap and its tracing mark-and-sweep collector.
//!
//! Every heap value lives in a slot of the arena (`Vec<Option<HeapEntry>>`
//! plus a free list) and is addressed by [`HeapId`]. There is no reference
//! counting anywhere: closures and environments form cycles freely, and
//! liveness is decided solely by reachability from the roots at collection
//! time.
//!
//! Roots are: pinned objects, the shadow stack of evaluator temporaries,
//! and the environment ids the VM passes in (current chain, global frame,
//! macro and special-operation namespaces). Symbol protect slots and every
//! other internal reference are reached transitively from those.

use std::{fmt, rc::Rc};

use bitflags::bitflags;

use crate::{
    env::EnvFrame,
    errors::{BuiltinCode, CodeLoc, EvalResult, Thrown, throw},
    eval::Step,
    intern::SymId,
    types::TypeCode,
    value::{Value, UserPtr},
    vm::Vm,
};

/// Index of a heap slot. Stable for the lifetime of the value; slots are
/// recycled only after the value they held has been swept or freed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HeapId(u32);

impl HeapId {
    #[inline]
    fn index(self) -> usize {
        self.0 as usize
    }
}

bitflags! {
    /// Per-object flags word. Only this module writes these bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct ValueFlags: u8 {
        /// Set on every arena-born object.
        const GC_ALLOCATED = 1 << 0;
        /// Transient reachability bit, valid only during a collection.
        const MARK = 1 << 1;
        /// At least one pin is outstanding; the collector must keep this.
        const PIN = 1 << 2;
        /// A finalizer is attached and has not run yet.
        const FINALIZER = 1 << 3;
        /// Environment frame that nothing has captured yet; freed eagerly
        /// on pop instead of waiting for a collection.
        const NO_ESCAPE = 1 << 4;
        /// List validated (and possibly rewritten) by the preprocessor.
        const PREPROCESSED = 1 << 5;
        /// Debug slot holds a source location.
        const DEBUG_LOC = 1 << 6;
        /// Debug slot holds an original pre-macroexpansion form.
        const DEBUG_ORIG = 1 << 7;
    }
}

/// Debug payload attached to a list cons.
#[derive(Debug, Clone, Copy)]
pub(crate) enum DebugInfo {
    /// Where the reader saw this cons.
    Loc(CodeLoc),
    /// The pre-macroexpansion form this cons replaced.
    Orig(Value),
}

/// A list cell.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Cons {
    pub car: Value,
    pub cdr: Value,
    pub debug: Option<DebugInfo>,
}

/// Immutable byte string. Substrings share their origin's backing storage;
/// the collector traces the origin so a slice keeps its backing alive.
#[derive(Debug)]
pub(crate) enum Str {
    Owned(Box<[u8]>),
    Slice { origin: HeapId, start: usize, len: usize },
}

/// A closure: parameter pattern, body form list, captured environment.
/// The same payload backs macros, which differ only in how the expander
/// applies them.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Func {
    pub params: Value,
    pub body: Value,
    pub env: HeapId,
}

/// Native callback for an external function. Receives the evaluated
/// arguments.
pub type NativeFn = dyn Fn(&mut Vm, &[Value]) -> EvalResult<Value>;

/// Tail-capable native callback for a special operation. Receives the
/// unevaluated argument list and the environment of the call.
pub type TailFn = dyn Fn(&mut Vm, Value, HeapId) -> EvalResult<Step>;

/// Preprocessor callback for a special operation. Receives the whole form
/// and returns the validated (possibly rewritten) form.
pub type PreprocFn = dyn Fn(&mut Vm, Value) -> EvalResult<Value>;

/// Finalizer attached to a heap object; runs exactly once during the sweep
/// that reclaims the object.
pub type Finalizer = Box<dyn FnMut(&mut Heap, Value)>;

/// A host-injected function whose arguments are evaluated normally.
pub(crate) struct ExtFunc {
    pub name: SymId,
    pub call: Rc<NativeFn>,
    /// Opaque host data, compared along with the callback for equality.
    pub info: Option<UserPtr>,
}

impl fmt::Debug for ExtFunc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtFunc")
            .field("name", &self.name)
            .field("info", &self.info)
            .finish_non_exhaustive()
    }
}

/// A built-in form that receives its arguments unevaluated and may return
/// a tail record. Lives only in the special-operation namespace.
pub(crate) struct SpecialOp {
    pub name: SymId,
    pub call: Rc<TailFn>,
    pub preproc: Option<Rc<PreprocFn>>,
    pub info: Option<UserPtr>,
}

impl fmt::Debug for SpecialOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpecialOp")
            .field("name", &self.name)
            .field("info", &self.info)
            .finish_non_exhaustive()
    }
}

/// A value cast to a user type: the code plus the wrapped payload.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Typed {
    pub code: TypeCode,
    pub inner: Value,
}

/// Payload of a heap slot.
#[derive(Debug)]
pub(crate) enum HeapData {
    Cons(Cons),
    Str(Str),
    Func(Func),
    Macro(Func),
    ExtFunc(ExtFunc),
    SpecialOp(SpecialOp),
    Quote(Value),
    Backquote(Value),
    Comma(Value),
    Splice(Value),
    Env(EnvFrame),
    Typed(Typed),
}

/// One live arena slot: payload, flags, pin nesting, retrieval size.
struct HeapEntry {
    data: HeapData,
    flags: ValueFlags,
    /// Pin nesting depth. The public contract is the boolean PIN flag;
    /// the counter just makes pins nest.
    pin_count: u32,
    /// Byte estimate recorded at allocation, subtracted on free.
    size: usize,
    finalizer: Option<Finalizer>,
}

impl fmt::Debug for HeapEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeapEntry")
            .field("data", &self.data)
            .field("flags", &self.flags)
            .field("pin_count", &self.pin_count)
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

/// Token returned by `ref`; passing it back to `unref` releases the pin.
///
/// Dropping the token without unref leaves the value pinned for the life
/// of the VM — safe, but a leak — hence `#[must_use]`.
#[derive(Debug)]
#[must_use = "a pin token must be passed back to Vm::unref to release the pin"]
pub struct PinToken {
    pub(crate) id: Option<HeapId>,
}

/// Snapshot of heap state, used by hosts and tests to observe collection
/// behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapStats {
    /// Number of live objects on the heap.
    pub live_objects: usize,
    /// Recycled slots available for reuse.
    pub free_slots: usize,
    /// Total arena capacity (live + free).
    pub total_slots: usize,
    /// Estimated bytes held by live objects.
    pub bytes_in_flight: usize,
}

/// Bytes allocated since the last collection before one is requested.
const GC_RUN_THRESHOLD: usize = 256 * 1024;

/// Fraction of the memory ceiling at which a collection is requested
/// ahead of hitting it.
const CEILING_HEADROOM_NUM: usize = 3;
const CEILING_HEADROOM_DEN: usize = 4;

pub struct Heap {
    entries: Vec<Option<HeapEntry>>,
    /// Freed slots available for reuse. Populated by sweep and eager frame
    /// frees, consumed by `allocate`.
    free_list: Vec<HeapId>,
    /// Evaluator temporaries: values alive across allocation points that
    /// are not yet reachable from an environment. Treated as roots.
    shadow: Vec<Value>,
    /// Estimated live bytes.
    bytes_in_flight: usize,
    /// Bytes allocated since the last collection.
    bytes_since_gc: usize,
    /// Heap byte ceiling mirrored from the VM configuration. Zero means
    /// unlimited.
    mem_limit: usize,
    /// Ceiling suspended while an error object is being built.
    ceiling_disabled: bool,
    /// Set when the trigger policy wants a collection; consumed by the
    /// evaluator at its next safe point.
    gc_requested: bool,
    /// Set during sweep so finalizers that allocate do not recursively
    /// collect.
    locked: bool,
}

impl fmt::Debug for Heap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stats = self.stats();
        f.debug_struct("Heap")
            .field("live_objects", &stats.live_objects)
            .field("bytes_in_flight", &stats.bytes_in_flight)
            .finish_non_exhaustive()
    }
}

impl Heap {
    pub(crate) fn new() -> Self {
        Self {
            entries: Vec::new(),
            free_list: Vec::new(),
            shadow: Vec::new(),
            bytes_in_flight: 0,
            bytes_since_gc: 0,
            mem_limit: 0,
            ceiling_disabled: false,
            gc_requested: false,
            locked: false,
        }
    }

    pub(crate) fn set_mem_limit(&mut self, limit: usize) {
        self.mem_limit = limit;
    }

    /// Estimated payload size for accounting. The entry header is counted
    /// for every object; variants add what they own outside the arena.
    fn estimate_size(data: &HeapData) -> usize {
        let extra = match data {
            HeapData::Str(Str::Owned(bytes)) => bytes.len(),
            HeapData::Env(frame) => frame.estimate_size(),
            _ => 0,
        };
        std::mem::size_of::<HeapEntry>() + extra
    }

    /// True when allocating `data` would overrun the memory ceiling; the
    /// caller can collect and retry before committing to the allocation.
    pub(crate) fn would_exceed(&self, data: &HeapData) -> bool {
        !self.ceiling_disabled
            && self.mem_limit != 0
            && self
                .bytes_in_flight
                .saturating_add(Self::estimate_size(data))
                > self.mem_limit
    }

    /// Allocates a heap object, enforcing the memory ceiling.
    ///
    /// Never collects on its own: when the trigger policy fires this only
    /// requests a collection, which the evaluator performs at its next
    /// function-call return. Ceiling overruns are ENOMEM (the caller may
    /// force a collection and retry; `Vm::alloc` does).
    pub(crate) fn allocate(&mut self, data: HeapData) -> EvalResult<HeapId> {
        let size = Self::estimate_size(&data);
        if !self.ceiling_disabled
            && self.mem_limit != 0
            && self.bytes_in_flight.saturating_add(size) > self.mem_limit
        {
            return Err(self.enomem());
        }

        self.bytes_in_flight += size;
        self.bytes_since_gc += size;
        if !self.locked
            && (self.bytes_since_gc > GC_RUN_THRESHOLD
                || (self.mem_limit != 0
                    && self.bytes_in_flight
                        > self.mem_limit / CEILING_HEADROOM_DEN * CEILING_HEADROOM_NUM))
        {
            self.gc_requested = true;
        }

        let mut flags = ValueFlags::GC_ALLOCATED;
        if matches!(data, HeapData::Env(_)) {
            flags |= ValueFlags::NO_ESCAPE;
        }
        let entry = HeapEntry {
            data,
            flags,
            pin_count: 0,
            size,
            finalizer: None,
        };
        if let Some(id) = self.free_list.pop() {
            debug_assert!(self.entries[id.index()].is_none(), "free list slot still occupied");
            self.entries[id.index()] = Some(entry);
            Ok(id)
        } else {
            let id = HeapId(
                u32::try_from(self.entries.len()).map_err(|_| self.enomem())?,
            );
            self.entries.push(Some(entry));
            Ok(id)
        }
    }

    fn enomem(&self) -> Box<Thrown> {
        throw(
            BuiltinCode::Enomem,
            format!("memory ceiling of {limit} bytes reached", limit = self.mem_limit),
        )
    }

    /// Runs `f` with the memory ceiling suspended, so the error object
    /// under construction can always be built.
    pub(crate) fn with_ceiling_disabled<T>(&mut self, f: impl FnOnce(&mut Self) -> T) -> T {
        let prev = self.ceiling_disabled;
        self.ceiling_disabled = true;
        let out = f(self);
        self.ceiling_disabled = prev;
        out
    }

    /// Borrows a slot's payload.
    ///
    /// # Panics
    /// Panics if the id refers to a freed slot, which can only happen via
    /// a stale id held across a collection without a pin or root.
    pub(crate) fn get(&self, id: HeapId) -> &HeapData {
        &self
            .entries[id.index()]
            .as_ref()
            .expect("heap id used after free")
            .data
    }

    pub(crate) fn get_mut(&mut self, id: HeapId) -> &mut HeapData {
        &mut self
            .entries[id.index()]
            .as_mut()
            .expect("heap id used after free")
            .data
    }

    /// The resolved byte contents of a string value.
    pub(crate) fn str_bytes(&self, id: HeapId) -> &[u8] {
        match self.get(id) {
            HeapData::Str(Str::Owned(bytes)) => bytes,
            HeapData::Str(Str::Slice { origin, start, len }) => match self.get(*origin) {
                HeapData::Str(Str::Owned(bytes)) => &bytes[*start..*start + *len],
                _ => unreachable!("string slice origin must be an owned string"),
            },
            _ => panic!("str_bytes on a non-string heap value"),
        }
    }

    // --- flags -----------------------------------------------------------

    pub(crate) fn flags(&self, id: HeapId) -> ValueFlags {
        self.entries[id.index()]
            .as_ref()
            .expect("heap id used after free")
            .flags
    }

    pub(crate) fn set_flag(&mut self, id: HeapId, flag: ValueFlags, on: bool) {
        let entry = self.entries[id.index()]
            .as_mut()
            .expect("heap id used after free");
        entry.flags.set(flag, on);
    }

    /// Attaches a finalizer, to run once when the object is reclaimed.
    pub(crate) fn set_finalizer(&mut self, id: HeapId, finalizer: Finalizer) {
        let entry = self.entries[id.index()]
            .as_mut()
            .expect("heap id used after free");
        entry.finalizer = Some(finalizer);
        entry.flags |= ValueFlags::FINALIZER;
    }

    // --- pins ------------------------------------------------------------

    /// Pins a value against collection. Pins nest; immediates produce an
    /// empty token.
    pub(crate) fn pin(&mut self, value: Value) -> PinToken {
        let Some(id) = value.ref_id() else {
            return PinToken { id: None };
        };
        let entry = self.entries[id.index()]
            .as_mut()
            .expect("pin of a freed heap value");
        entry.pin_count += 1;
        entry.flags |= ValueFlags::PIN;
        PinToken { id: Some(id) }
    }

    /// Releases one pin. The PIN flag clears on the last release.
    pub(crate) fn unpin(&mut self, token: PinToken) {
        let Some(id) = token.id else { return };
        let entry = self.entries[id.index()]
            .as_mut()
            .expect("unpin of a freed heap value");
        debug_assert!(entry.pin_count > 0, "unbalanced unref");
        entry.pin_count = entry.pin_count.saturating_sub(1);
        if entry.pin_count == 0 {
            entry.flags -= ValueFlags::PIN;
        }
    }

    // --- shadow stack ----------------------------------------------------

    /// Current shadow stack depth; pass back to `root_truncate`.
    pub(crate) fn root_mark(&self) -> usize {
        self.shadow.len()
    }

    /// Roots a temporary for the duration of the current evaluation step.
    pub(crate) fn root(&mut self, value: Value) {
        self.shadow.push(value);
    }

    /// Replaces the rooted temporary at `slot` (used by the tail loop to
    /// re-point its single expression root).
    pub(crate) fn set_root(&mut self, slot: usize, value: Value) {
        self.shadow[slot] = value;
    }

    pub(crate) fn root_truncate(&mut self, mark: usize) {
        self.shadow.truncate(mark);
    }

    // --- collection ------------------------------------------------------

    /// True when the trigger policy has requested a collection.
    pub(crate) fn wants_gc(&self) -> bool {
        self.gc_requested && !self.locked
    }

    /// Mark-and-sweep from the given extra roots (the VM's environment
    /// chain and namespaces) plus pins and the shadow stack.
    ///
    /// Returns the number of objects reclaimed.
    pub(crate) fn collect(&mut self, extra_roots: &[HeapId]) -> usize {
        if self.locked {
            return 0;
        }
        self.gc_requested = false;
        self.bytes_since_gc = 0;

        // Mark.
        let mut worklist: Vec<HeapId> = Vec::new();
        for &id in extra_roots {
            worklist.push(id);
        }
        for i in 0..self.shadow.len() {
            if let Some(id) = self.shadow[i].ref_id() {
                worklist.push(id);
            }
        }
        for (index, slot) in self.entries.iter().enumerate() {
            if let Some(entry) = slot
                && entry.flags.contains(ValueFlags::PIN)
            {
                worklist.push(HeapId(index as u32));
            }
        }
        while let Some(id) = worklist.pop() {
            let entry = match self.entries[id.index()].as_mut() {
                Some(entry) => entry,
                // A root can name an eagerly freed frame between pop and
                // the next collection; nothing to mark there.
                None => continue,
            };
            if entry.flags.contains(ValueFlags::MARK) {
                continue;
            }
            entry.flags |= ValueFlags::MARK;
            trace_data(&entry.data, &mut |v| {
                if let Some(child) = v.ref_id() {
                    worklist.push(child);
                }
            });
        }

        // Sweep: gather the doomed, run finalizers with the heap locked,
        // then free.
        let mut doomed: Vec<HeapId> = Vec::new();
        for (index, slot) in self.entries.iter_mut().enumerate() {
            if let Some(entry) = slot {
                if entry.flags.contains(ValueFlags::MARK) {
                    entry.flags -= ValueFlags::MARK;
                } else {
                    doomed.push(HeapId(index as u32));
                }
            }
        }
        self.locked = true;
        for &id in &doomed {
            self.run_finalizers_for(id);
        }
        self.locked = false;
        for &id in &doomed {
            self.release_slot(id);
        }
        doomed.len()
    }

    /// Runs the object's own finalizer and, for environment frames, the
    /// finalizers of the symbols it holds.
    fn run_finalizers_for(&mut self, id: HeapId) {
        let (finalizer, sym_finalizers) = {
            let entry = self.entries[id.index()]
                .as_mut()
                .expect("finalizing a freed slot");
            entry.flags -= ValueFlags::FINALIZER;
            let own = entry.finalizer.take();
            let syms = match &mut entry.data {
                HeapData::Env(frame) => frame.take_finalizers(),
                _ => Vec::new(),
            };
            (own, syms)
        };
        if let Some(mut finalizer) = finalizer {
            finalizer(self, Value::Ref(id));
        }
        for (sym, finalizer) in sym_finalizers {
            finalizer(self, sym);
        }
    }

    fn release_slot(&mut self, id: HeapId) {
        if let Some(entry) = self.entries[id.index()].take() {
            self.bytes_in_flight = self.bytes_in_flight.saturating_sub(entry.size);
            self.free_list.push(id);
        }
    }

    /// Frees one environment frame immediately (the no-escape pop path).
    /// Finalizers of symbols in the frame run as they would during sweep.
    pub(crate) fn free_frame(&mut self, id: HeapId) {
        debug_assert!(
            matches!(self.get(id), HeapData::Env(_)),
            "eager free is only for environment frames"
        );
        debug_assert!(
            self.flags(id).contains(ValueFlags::NO_ESCAPE),
            "eager free of an escaping frame"
        );
        let was_locked = self.locked;
        self.locked = true;
        self.run_finalizers_for(id);
        self.locked = was_locked;
        self.release_slot(id);
    }

    /// Teardown collection: sweeps everything regardless of roots, up to
    /// three passes so finalizers that resurrect peers still settle.
    /// Returns the number of objects that survived all passes.
    pub(crate) fn teardown(&mut self) -> usize {
        for _ in 0..3 {
            let doomed: Vec<HeapId> = self
                .entries
                .iter()
                .enumerate()
                .filter_map(|(index, slot)| slot.as_ref().map(|_| HeapId(index as u32)))
                .collect();
            if doomed.is_empty() {
                return 0;
            }
            self.locked = true;
            for &id in &doomed {
                self.run_finalizers_for(id);
            }
            self.locked = false;
            for &id in &doomed {
                self.release_slot(id);
            }
        }
        self.entries.iter().filter(|slot| slot.is_some()).count()
    }

    /// Snapshot of live/free slot counts and byte estimate.
    #[must_use]
    pub(crate) fn stats(&self) -> HeapStats {
        let live_objects = self.entries.iter().filter(|slot| slot.is_some()).count();
        HeapStats {
            live_objects,
            free_slots: self.free_list.len(),
            total_slots: self.entries.len(),
            bytes_in_flight: self.bytes_in_flight,
        }
    }
}

/// Pushes every value directly referenced by a payload.
fn trace_data(data: &HeapData, push: &mut dyn FnMut(Value)) {
    match data {
        HeapData::Cons(cons) => {
            push(cons.car);
            push(cons.cdr);
            if let Some(DebugInfo::Orig(orig)) = cons.debug {
                push(orig);
            }
        }
        HeapData::Str(Str::Owned(_)) => {}
        HeapData::Str(Str::Slice { origin, .. }) => push(Value::Ref(*origin)),
        HeapData::Func(func) | HeapData::Macro(func) => {
            push(func.params);
            push(func.body);
            push(Value::Ref(func.env));
        }
        HeapData::ExtFunc(_) | HeapData::SpecialOp(_) => {}
        HeapData::Quote(inner)
        | HeapData::Backquote(inner)
        | HeapData::Comma(inner)
        | HeapData::Splice(inner) => push(*inner),
        HeapData::Env(frame) => frame.trace(push),
        HeapData::Typed(typed) => push(typed.inner),
    }
}
