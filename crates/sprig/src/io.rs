//! Output routing for the interpreter.
//!
//! All user-visible output (the print builtins and `perror` backtraces)
//! goes through a [`PrintWriter`], so hosts can capture or silence it.

use std::{
    cell::RefCell,
    io::{self, Write as _},
    rc::Rc,
};

use crate::errors::{BuiltinCode, EvalResult, throw};

/// Trait for handling output produced by interpreted code.
///
/// Implement this to capture or redirect output from embedded scripts. The
/// default implementation [`StdPrint`] writes to the process stdout/stderr.
pub trait PrintWriter {
    /// Writes a chunk of standard output. No separators or newlines are
    /// added by the caller beyond what the chunk contains.
    fn stdout_write(&mut self, output: &str) -> EvalResult<()>;

    /// Writes a chunk of diagnostic output (backtraces, error reports).
    fn stderr_write(&mut self, output: &str) -> EvalResult<()>;
}

/// Default writer: process stdout and stderr.
#[derive(Debug, Default)]
pub struct StdPrint;

fn io_err(err: &io::Error) -> Box<crate::errors::Thrown> {
    throw(BuiltinCode::Eio, format!("write failed: {err}"))
}

impl PrintWriter for StdPrint {
    fn stdout_write(&mut self, output: &str) -> EvalResult<()> {
        io::stdout().write_all(output.as_bytes()).map_err(|e| io_err(&e))
    }

    fn stderr_write(&mut self, output: &str) -> EvalResult<()> {
        io::stderr().write_all(output.as_bytes()).map_err(|e| io_err(&e))
    }
}

/// Writer that collects everything into shared buffers.
///
/// Clones share the same buffers, so a host can hand one clone to the VM
/// and keep another to inspect what was written.
#[derive(Debug, Default, Clone)]
pub struct CollectStringPrint {
    stdout: Rc<RefCell<String>>,
    stderr: Rc<RefCell<String>>,
}

impl CollectStringPrint {
    /// Everything written to stdout so far.
    #[must_use]
    pub fn stdout(&self) -> String {
        self.stdout.borrow().clone()
    }

    /// Everything written to stderr so far.
    #[must_use]
    pub fn stderr(&self) -> String {
        self.stderr.borrow().clone()
    }
}

impl PrintWriter for CollectStringPrint {
    fn stdout_write(&mut self, output: &str) -> EvalResult<()> {
        self.stdout.borrow_mut().push_str(output);
        Ok(())
    }

    fn stderr_write(&mut self, output: &str) -> EvalResult<()> {
        self.stderr.borrow_mut().push_str(output);
        Ok(())
    }
}

/// Writer that discards all output.
#[derive(Debug, Default)]
pub struct NoPrint;

impl PrintWriter for NoPrint {
    fn stdout_write(&mut self, _output: &str) -> EvalResult<()> {
        Ok(())
    }

    fn stderr_write(&mut self, _output: &str) -> EvalResult<()> {
        Ok(())
    }
}
