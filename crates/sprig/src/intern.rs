//! Identifier interning.
//!
//! Every identifier read from source or minted by the host is interned once
//! and referred to by a [`SymId`] afterwards. Identifier equality is id
//! equality, and the interner outlives every garbage collection cycle, so
//! identifiers behave as by-value data everywhere else in the interpreter.
//!
//! SymIds are laid out as follows:
//! * 0 to count(StaticSyms) - names known at compile time, interned in
//!   discriminant order when the table is created
//! * everything above - names interned at runtime

use ahash::AHashMap;
use strum::{EnumString, FromRepr, IntoStaticStr};

/// Index into the interner's name storage.
///
/// Uses `u32` to save space; the id is stable for the lifetime of the VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SymId(u32);

impl SymId {
    /// Returns the raw index value.
    #[inline]
    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl From<StaticSyms> for SymId {
    fn from(s: StaticSyms) -> Self {
        Self(s as u32)
    }
}

/// Names the interpreter itself consults, interned ahead of any user code.
///
/// The discriminant of each variant is its `SymId`, so comparisons against
/// these names never touch the string table.
#[repr(u32)]
#[derive(Debug, Clone, Copy, FromRepr, EnumString, IntoStaticStr, PartialEq, Eq, Hash)]
#[strum(serialize_all = "lowercase")]
pub(crate) enum StaticSyms {
    /// The wildcard pattern: matches anything, binds nothing.
    #[strum(serialize = "_")]
    Underscore,
    /// Cons constructor and improper-pattern marker.
    #[strum(serialize = ":")]
    Colon,
    /// Global symbol bound to the nil value.
    Nil,

    // Special-operation names.
    Def,
    Defconst,
    Set,
    Fn,
    Macro,
    If,
    Let,
    Do,
    And,
    Or,
    Case,
    Try,
    /// Clause head inside `try`.
    Catch,
    /// Clause head inside `try`.
    Finally,

    // Computed globals backed by the error state.
    Errno,
    Errmsg,
}

pub(crate) const STATIC_SYM_COUNT: u32 = StaticSyms::Errmsg as u32 + 1;

/// The VM-wide identifier table.
///
/// Names are stored once; lookups go through an `AHashMap` keyed by the
/// name bytes. The table only ever grows.
#[derive(Debug)]
pub(crate) struct Interner {
    by_name: AHashMap<Box<str>, SymId>,
    names: Vec<Box<str>>,
}

impl Interner {
    /// Creates the table with every [`StaticSyms`] entry pre-interned in
    /// discriminant order, so `SymId::from(s)` is valid immediately.
    pub fn new() -> Self {
        let mut interner = Self {
            by_name: AHashMap::new(),
            names: Vec::with_capacity(STATIC_SYM_COUNT as usize + 64),
        };
        for raw in 0..STATIC_SYM_COUNT {
            let s = StaticSyms::from_repr(raw).expect("static symbol table is contiguous");
            let name: &'static str = s.into();
            let id = interner.intern(name);
            debug_assert_eq!(id, SymId(raw), "static symbol {name:?} interned out of order");
        }
        interner
    }

    /// Interns `name`, returning the existing id if it was seen before.
    pub fn intern(&mut self, name: &str) -> SymId {
        if let Some(&id) = self.by_name.get(name) {
            return id;
        }
        let id = SymId(u32::try_from(self.names.len()).expect("interner overflow"));
        let boxed: Box<str> = name.into();
        self.by_name.insert(boxed.clone(), id);
        self.names.push(boxed);
        id
    }

    /// Returns the id for `name` without interning it.
    pub fn lookup(&self, name: &str) -> Option<SymId> {
        self.by_name.get(name).copied()
    }

    /// Returns the name for an id.
    ///
    /// # Panics
    /// Panics if the id did not come from this interner.
    pub fn name(&self, id: SymId) -> &str {
        &self.names[id.index()]
    }

    /// Number of interned names, static entries included.
    pub fn len(&self) -> usize {
        self.names.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_syms_come_pre_interned() {
        let interner = Interner::new();
        assert_eq!(interner.lookup("_"), Some(SymId::from(StaticSyms::Underscore)));
        assert_eq!(interner.lookup(":"), Some(SymId::from(StaticSyms::Colon)));
        assert_eq!(interner.lookup("catch"), Some(SymId::from(StaticSyms::Catch)));
        assert_eq!(interner.name(SymId::from(StaticSyms::Fn)), "fn");
    }

    #[test]
    fn interning_is_idempotent() {
        let mut interner = Interner::new();
        let a = interner.intern("alpha");
        let b = interner.intern("alpha");
        assert_eq!(a, b);
        assert_eq!(interner.name(a), "alpha");
        assert_ne!(interner.intern("beta"), a);
    }
}
