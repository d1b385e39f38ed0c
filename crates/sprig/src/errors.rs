//! Error codes, thrown state, and backtrace collection.
//!
//! Every failing operation in the interpreter produces a [`Thrown`] carried
//! in the `Err` variant of [`EvalResult`]. The thrown state travels outward
//! through the evaluator, picking up backtrace entries at each call site,
//! until a `try` handler catches it or the host observes it through the
//! public API.

use std::fmt;

use ahash::AHashMap;
use strum::{Display, EnumString, FromRepr, IntoStaticStr};

use crate::intern::SymId;

/// Result type alias for operations that can throw.
pub type EvalResult<T> = Result<T, Box<Thrown>>;

/// Error codes built into the interpreter.
///
/// Uses strum derives for automatic `Display`, `FromStr`, and
/// `Into<&'static str>`; the string form is the symbolic name scripts see
/// (e.g. `EVALUE`). User codes registered at runtime live above these in the
/// same [`ErrCode`] space.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, FromRepr, IntoStaticStr)]
#[strum(serialize_all = "UPPERCASE")]
pub enum BuiltinCode {
    // --- Reader ---
    /// Lexical or syntactic problem in source text.
    Eread,
    /// End of input in the middle of a form.
    Eeof,

    // --- Preprocessing / evaluation ---
    Eeval,
    /// Identifier not bound in any reachable frame.
    Enosym,
    /// Logical call depth exceeded the configured ceiling.
    Estack,
    Etype,
    /// Pattern match failure.
    Ematch,
    /// Macro applied outside the expander, or expansion failure.
    Emacro,
    /// Special-form shape violation found by the preprocessor.
    Estatic,

    // --- Arithmetic / range ---
    Edivzero,
    Eoverflow,
    Evalue,
    Eindex,

    // --- Symbol access protocol ---
    Ereadonly,
    Ewriteonly,
    Eexist,

    // --- Host I/O ---
    Eio,
    /// Host embedder misuse. Never raised by interpreter code.
    Eapi,

    // --- Memory ---
    Enomem,
}

const BUILTIN_CODE_COUNT: u16 = BuiltinCode::Enomem as u16 + 1;

/// An error code value: one of the built-in codes or a user-registered one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ErrCode(pub(crate) u16);

impl ErrCode {
    /// Returns the built-in code this value corresponds to, if any.
    #[must_use]
    pub fn builtin(self) -> Option<BuiltinCode> {
        BuiltinCode::from_repr(self.0)
    }

    /// True for codes registered through `new_error_code`.
    #[must_use]
    pub fn is_user(self) -> bool {
        self.0 >= BUILTIN_CODE_COUNT
    }
}

impl From<BuiltinCode> for ErrCode {
    fn from(code: BuiltinCode) -> Self {
        Self(code as u16)
    }
}

impl PartialEq<BuiltinCode> for ErrCode {
    fn eq(&self, other: &BuiltinCode) -> bool {
        self.0 == *other as u16
    }
}

/// Registry mapping error codes to their symbolic names.
///
/// Seeded with every [`BuiltinCode`]; `new_error_code` appends user codes.
/// Names are unique: re-registering an existing name returns its code.
#[derive(Debug)]
pub(crate) struct ErrorRegistry {
    names: Vec<Box<str>>,
    by_name: AHashMap<Box<str>, ErrCode>,
}

impl ErrorRegistry {
    pub fn new() -> Self {
        let mut registry = Self {
            names: Vec::with_capacity(BUILTIN_CODE_COUNT as usize),
            by_name: AHashMap::new(),
        };
        for raw in 0..BUILTIN_CODE_COUNT {
            let code = BuiltinCode::from_repr(raw).expect("builtin code table is contiguous");
            let name: &'static str = code.into();
            registry.names.push(name.into());
            registry.by_name.insert(name.into(), ErrCode(raw));
        }
        registry
    }

    /// Registers a user error code, or returns the existing code for `name`.
    pub fn register(&mut self, name: &str) -> ErrCode {
        if let Some(&code) = self.by_name.get(name) {
            return code;
        }
        let code = ErrCode(u16::try_from(self.names.len()).expect("error code space exhausted"));
        let boxed: Box<str> = name.into();
        self.names.push(boxed.clone());
        self.by_name.insert(boxed, code);
        code
    }

    pub fn find(&self, name: &str) -> Option<ErrCode> {
        self.by_name.get(name).copied()
    }

    pub fn name(&self, code: ErrCode) -> &str {
        self.names.get(code.0 as usize).map_or("E?", |n| n)
    }

    /// Iterates the built-in codes for global symbol installation.
    pub fn builtin_codes(&self) -> impl Iterator<Item = (ErrCode, &str)> {
        self.names
            .iter()
            .take(BUILTIN_CODE_COUNT as usize)
            .enumerate()
            .map(|(i, n)| (ErrCode(i as u16), &**n))
    }
}

/// A source location attached to a list cons by the reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodeLoc {
    /// Interned source path (or pseudo-path such as `<string>`).
    pub file: SymId,
    /// 1-based line.
    pub line: u32,
    /// 0-based byte offset within the source.
    pub pos: u32,
}

/// One captured call site in a backtrace.
#[derive(Debug, Clone)]
pub(crate) struct BtEntry {
    pub loc: Option<CodeLoc>,
    /// Short repr of the offending list (pre-expansion form when macros
    /// rewrote it).
    pub form: String,
    /// Repr of the expanded form, when macroexpansion transformed the call.
    pub expanded: Option<String>,
    /// Number of tail-call frames elided before this entry; zero for a
    /// normal call site.
    pub elided_tails: u32,
}

/// The thrown error state: code, optional message, and the backtrace
/// accumulated while unwinding.
#[derive(Debug, Clone)]
pub struct Thrown {
    pub(crate) code: ErrCode,
    pub(crate) msg: Option<String>,
    pub(crate) bt: Vec<BtEntry>,
    /// Set once the backtrace hit the configured limit and entries were
    /// dropped.
    pub(crate) bt_truncated: bool,
}

impl Thrown {
    /// Creates a fresh thrown state; native callbacks return these to
    /// raise. The backtrace starts empty; call sites are captured as the
    /// error propagates.
    pub fn new(code: impl Into<ErrCode>, msg: Option<String>) -> Box<Self> {
        Box::new(Self {
            code: code.into(),
            msg,
            bt: Vec::new(),
            bt_truncated: false,
        })
    }

    /// The error code.
    #[must_use]
    pub fn code(&self) -> ErrCode {
        self.code
    }

    /// The message, if one was supplied at throw time.
    #[must_use]
    pub fn msg(&self) -> Option<&str> {
        self.msg.as_deref()
    }

    /// Appends a call-site entry, honoring the configured limit.
    ///
    /// The innermost `limit` call sites are kept; later (outer) entries are
    /// dropped and the truncation banner is shown instead.
    pub(crate) fn push_bt(&mut self, entry: BtEntry, limit: usize) {
        if self.bt.len() >= limit {
            self.bt_truncated = true;
            return;
        }
        self.bt.push(entry);
    }
}

/// Shorthand constructors for the common throw sites.
pub(crate) fn throw(code: impl Into<ErrCode>, msg: impl Into<String>) -> Box<Thrown> {
    Thrown::new(code, Some(msg.into()))
}

pub(crate) fn throw_bare(code: impl Into<ErrCode>) -> Box<Thrown> {
    Thrown::new(code, None)
}

/// Public error type returned by the host-facing API.
///
/// Carries the resolved symbolic code name so it stays meaningful after the
/// VM that produced it is gone.
#[derive(Debug, Clone)]
pub struct Error {
    /// The raw code.
    pub code: ErrCode,
    /// The symbolic name, e.g. `"EVALUE"`.
    pub code_name: String,
    /// The message supplied at throw time, if any.
    pub message: Option<String>,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.message {
            Some(msg) => write!(f, "{msg} ({name})", name = self.code_name),
            None => write!(f, "({name})", name = self.code_name),
        }
    }
}

impl std::error::Error for Error {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_names_round_trip() {
        let registry = ErrorRegistry::new();
        let code = registry.find("EVALUE").expect("EVALUE is built in");
        assert_eq!(code, ErrCode::from(BuiltinCode::Evalue));
        assert_eq!(registry.name(code), "EVALUE");
        assert!(!code.is_user());
    }

    #[test]
    fn user_codes_register_once() {
        let mut registry = ErrorRegistry::new();
        let a = registry.register("EFROB");
        let b = registry.register("EFROB");
        assert_eq!(a, b);
        assert!(a.is_user());
        assert_eq!(registry.name(a), "EFROB");
    }

    #[test]
    fn backtrace_keeps_innermost_entries() {
        let mut thrown = Thrown::new(BuiltinCode::Evalue, None);
        for i in 0..5 {
            thrown.push_bt(
                BtEntry {
                    loc: None,
                    form: format!("(call {i})"),
                    expanded: None,
                    elided_tails: 0,
                },
                3,
            );
        }
        assert_eq!(thrown.bt.len(), 3);
        assert!(thrown.bt_truncated);
        assert_eq!(thrown.bt[0].form, "(call 0)");
    }
}
