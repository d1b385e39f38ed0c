//! VM configuration options.
//!
//! Options are plain fields on [`Config`] for interpreter-internal access,
//! plus a typed by-name registry so hosts and the CLI can get and set them
//! without knowing the field layout. Sets are type- and range-checked.

use crate::errors::{BuiltinCode, EvalResult, throw};

/// Default logical call depth ceiling.
pub const DEFAULT_STACK_LIMIT: u32 = 4096;
/// Default backtrace entry limit.
pub const DEFAULT_BT_LIMIT: u32 = 32;
/// Hard upper bound on the backtrace limit.
pub const MAX_BT_LIMIT: u32 = 256;

/// All configuration state carried by a VM handle.
#[derive(Debug, Clone)]
pub struct Config {
    /// Heap byte ceiling. Zero means unlimited.
    pub mem_limit: usize,
    /// Logical call depth ceiling. Zero means unlimited.
    pub stack_limit: u32,
    /// Backtrace entry limit, 0..=256.
    pub bt_limit: u32,
    /// Permit redefinition of existing symbols in the global frame.
    pub allow_redef: bool,
    /// Attach source locations to list conses while reading.
    pub gen_debug_info: bool,
    /// Drive tail records in the outer evaluator loop instead of recursing.
    pub tail_call_elimination: bool,
    /// Collect after every top-level evaluation step.
    pub hyper_gc: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mem_limit: 0,
            stack_limit: DEFAULT_STACK_LIMIT,
            bt_limit: DEFAULT_BT_LIMIT,
            allow_redef: false,
            gen_debug_info: true,
            tail_call_elimination: true,
            hyper_gc: false,
        }
    }
}

/// Kind of a named option, for `--help` rendering and type checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptKind {
    Int,
    Bool,
}

/// The option registry: name, kind, and a one-line description per option.
pub const OPTIONS: &[(&str, OptKind, &str)] = &[
    ("mem-limit", OptKind::Int, "heap byte ceiling (0 = unlimited)"),
    ("stack-limit", OptKind::Int, "call depth ceiling (0 = unlimited)"),
    ("bt-limit", OptKind::Int, "backtrace entry limit (0..=256)"),
    ("allow-redef", OptKind::Bool, "allow redefining global symbols"),
    ("gen-debug-info", OptKind::Bool, "record source locations while reading"),
    ("tail-call-elimination", OptKind::Bool, "eliminate tail calls"),
    ("hyper-gc", OptKind::Bool, "collect after every top-level step"),
];

impl Config {
    /// Looks up an option's kind by name.
    #[must_use]
    pub fn kind_of(name: &str) -> Option<OptKind> {
        OPTIONS.iter().find(|(n, _, _)| *n == name).map(|(_, k, _)| *k)
    }

    /// Reads an int option by name.
    pub fn get_int(&self, name: &str) -> EvalResult<i64> {
        match name {
            "mem-limit" => Ok(self.mem_limit as i64),
            "stack-limit" => Ok(i64::from(self.stack_limit)),
            "bt-limit" => Ok(i64::from(self.bt_limit)),
            _ if Self::kind_of(name).is_some() => {
                Err(throw(BuiltinCode::Etype, format!("option `{name}` is not of integer type")))
            }
            _ => Err(throw(BuiltinCode::Eapi, format!("unknown option `{name}`"))),
        }
    }

    /// Reads a bool option by name.
    pub fn get_bool(&self, name: &str) -> EvalResult<bool> {
        match name {
            "allow-redef" => Ok(self.allow_redef),
            "gen-debug-info" => Ok(self.gen_debug_info),
            "tail-call-elimination" => Ok(self.tail_call_elimination),
            "hyper-gc" => Ok(self.hyper_gc),
            _ if Self::kind_of(name).is_some() => {
                Err(throw(BuiltinCode::Etype, format!("option `{name}` is not of boolean type")))
            }
            _ => Err(throw(BuiltinCode::Eapi, format!("unknown option `{name}`"))),
        }
    }

    /// Sets an int option by name, range-checked.
    pub fn set_int(&mut self, name: &str, value: i64) -> EvalResult<()> {
        if value < 0 {
            return Err(throw(BuiltinCode::Evalue, format!("option `{name}` cannot be negative")));
        }
        match name {
            "mem-limit" => {
                self.mem_limit = usize::try_from(value)
                    .map_err(|_| throw(BuiltinCode::Evalue, "mem-limit out of range"))?;
            }
            "stack-limit" => {
                self.stack_limit = u32::try_from(value)
                    .map_err(|_| throw(BuiltinCode::Evalue, "stack-limit out of range"))?;
            }
            "bt-limit" => {
                let limit = u32::try_from(value)
                    .map_err(|_| throw(BuiltinCode::Evalue, "bt-limit out of range"))?;
                if limit > MAX_BT_LIMIT {
                    return Err(throw(
                        BuiltinCode::Evalue,
                        format!("bt-limit must be at most {MAX_BT_LIMIT}"),
                    ));
                }
                self.bt_limit = limit;
            }
            _ if Self::kind_of(name).is_some() => {
                return Err(throw(BuiltinCode::Etype, format!("option `{name}` is not of integer type")));
            }
            _ => return Err(throw(BuiltinCode::Eapi, format!("unknown option `{name}`"))),
        }
        Ok(())
    }

    /// Sets a bool option by name.
    pub fn set_bool(&mut self, name: &str, value: bool) -> EvalResult<()> {
        match name {
            "allow-redef" => self.allow_redef = value,
            "gen-debug-info" => self.gen_debug_info = value,
            "tail-call-elimination" => self.tail_call_elimination = value,
            "hyper-gc" => self.hyper_gc = value,
            _ if Self::kind_of(name).is_some() => {
                return Err(throw(BuiltinCode::Etype, format!("option `{name}` is not of boolean type")));
            }
            _ => return Err(throw(BuiltinCode::Eapi, format!("unknown option `{name}`"))),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_access_is_checked() {
        let mut config = Config::default();
        config.set_int("stack-limit", 128).unwrap();
        assert_eq!(config.get_int("stack-limit").unwrap(), 128);
        assert!(config.set_int("hyper-gc", 1).is_err());
        assert!(config.set_bool("stack-limit", true).is_err());
        assert!(config.get_int("no-such-option").is_err());
    }

    #[test]
    fn bt_limit_is_range_checked() {
        let mut config = Config::default();
        assert!(config.set_int("bt-limit", 300).is_err());
        assert!(config.set_int("bt-limit", -1).is_err());
        config.set_int("bt-limit", 0).unwrap();
        assert_eq!(config.bt_limit, 0);
    }
}
