//! Type codes: one basic code per value tag, plus user-registered codes
//! that alias a base type.
//!
//! User types are thin wrappers: casting a value to a user type wraps it in
//! a typed cell carrying the code; casting back to the base unwraps it.
//! Alias chains resolve fully to the final basic type before any cast
//! check, so multi-level aliases cast freely against each other.

use ahash::AHashMap;
use strum::{Display, EnumString, FromRepr, IntoStaticStr};

use crate::{
    errors::{BuiltinCode, EvalResult, throw},
    heap::{Heap, HeapData},
    value::Value,
};

/// The basic types, one per value tag.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, FromRepr, IntoStaticStr)]
#[strum(serialize_all = "kebab-case")]
pub enum BasicType {
    Nil,
    Int,
    Double,
    Bool,
    Id,
    List,
    String,
    Func,
    Macro,
    ExtFunc,
    SpecialOp,
    Quote,
    Backquote,
    Comma,
    Splice,
    Env,
    UserPtr,
    TypeCode,
    ErrorCode,
}

const BASIC_TYPE_COUNT: i32 = BasicType::ErrorCode as i32 + 1;

/// A type code value: a basic code, or a user code registered at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TypeCode(pub(crate) i32);

impl TypeCode {
    /// The basic type this code names directly, if it is a basic code.
    #[must_use]
    pub fn basic(self) -> Option<BasicType> {
        BasicType::from_repr(self.0)
    }

    /// True for codes registered through `new_type`.
    #[must_use]
    pub fn is_user(self) -> bool {
        self.0 >= BASIC_TYPE_COUNT
    }
}

impl From<BasicType> for TypeCode {
    fn from(basic: BasicType) -> Self {
        Self(basic as i32)
    }
}

#[derive(Debug)]
struct UserType {
    name: Box<str>,
    base: TypeCode,
}

/// Registry of user type codes.
#[derive(Debug)]
pub(crate) struct TypeRegistry {
    entries: Vec<UserType>,
    by_name: AHashMap<Box<str>, TypeCode>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            by_name: AHashMap::new(),
        }
    }

    /// Registers a new user type aliasing `base`. Registering an existing
    /// name is EEXIST.
    pub fn register(&mut self, name: &str, base: TypeCode) -> EvalResult<TypeCode> {
        if self.by_name.contains_key(name) || BasicType::try_from(name).is_ok() {
            return Err(throw(BuiltinCode::Eexist, format!("type `{name}` already exists")));
        }
        let code = TypeCode(BASIC_TYPE_COUNT + i32::try_from(self.entries.len())
            .map_err(|_| throw(BuiltinCode::Enomem, "type code space exhausted"))?);
        let boxed: Box<str> = name.into();
        self.entries.push(UserType {
            name: boxed.clone(),
            base,
        });
        self.by_name.insert(boxed, code);
        Ok(code)
    }

    /// Finds a type code by name, basic names included.
    pub fn find(&self, name: &str) -> Option<TypeCode> {
        if let Ok(basic) = BasicType::try_from(name) {
            return Some(basic.into());
        }
        self.by_name.get(name).copied()
    }

    /// The display name of a code.
    pub fn name(&self, code: TypeCode) -> &str {
        if let Some(basic) = code.basic() {
            return basic.into();
        }
        self.user_entry(code).map_or("?type", |entry| &entry.name)
    }

    /// The directly declared base of a user code, or the code itself for
    /// basic codes.
    pub fn base_of(&self, code: TypeCode) -> TypeCode {
        self.user_entry(code).map_or(code, |entry| entry.base)
    }

    /// Resolves an alias chain all the way down to a basic code.
    ///
    /// A registry can only alias codes that already exist, so chains cannot
    /// cycle; the walk terminates at the first basic code.
    pub fn resolve(&self, code: TypeCode) -> TypeCode {
        let mut cur = code;
        while let Some(entry) = self.user_entry(cur) {
            cur = entry.base;
        }
        cur
    }

    fn user_entry(&self, code: TypeCode) -> Option<&UserType> {
        if code.is_user() {
            self.entries.get((code.0 - BASIC_TYPE_COUNT) as usize)
        } else {
            None
        }
    }
}

/// The type code of a value. Typed wrappers report their user code;
/// everything else maps tag to basic code.
pub(crate) fn type_of(heap: &Heap, value: Value) -> TypeCode {
    let basic = match value {
        Value::Nil => BasicType::Nil,
        Value::Int(_) => BasicType::Int,
        Value::Double(_) => BasicType::Double,
        Value::Bool(_) => BasicType::Bool,
        Value::Sym(_) => BasicType::Id,
        Value::TypeCode(_) => BasicType::TypeCode,
        Value::ErrorCode(_) => BasicType::ErrorCode,
        Value::UserPtr(_) => BasicType::UserPtr,
        Value::Ref(id) => match heap.get(id) {
            HeapData::Cons(_) => BasicType::List,
            HeapData::Str(_) => BasicType::String,
            HeapData::Func(_) => BasicType::Func,
            HeapData::Macro(_) => BasicType::Macro,
            HeapData::ExtFunc(_) => BasicType::ExtFunc,
            HeapData::SpecialOp(_) => BasicType::SpecialOp,
            HeapData::Quote(_) => BasicType::Quote,
            HeapData::Backquote(_) => BasicType::Backquote,
            HeapData::Comma(_) => BasicType::Comma,
            HeapData::Splice(_) => BasicType::Splice,
            HeapData::Env(_) => BasicType::Env,
            HeapData::Typed(typed) => return typed.code,
        },
    };
    basic.into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alias_chains_resolve_to_basic() {
        let mut registry = TypeRegistry::new();
        let a = registry.register("celsius", BasicType::Int.into()).unwrap();
        let b = registry.register("temp-delta", a).unwrap();
        assert_eq!(registry.resolve(b), TypeCode::from(BasicType::Int));
        assert_eq!(registry.base_of(b), a);
        assert_eq!(registry.name(b), "temp-delta");
        assert!(registry.register("celsius", BasicType::Int.into()).is_err());
        assert!(registry.register("int", BasicType::Int.into()).is_err());
    }
}
