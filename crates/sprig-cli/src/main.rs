//! The `sprig` command-line driver.
//!
//! `sprig [OPTIONS] [FILE]...` reads and evaluates each input in order;
//! `-c CMD` evaluates a single expression, `-E` preprocesses instead of
//! evaluating, `-` reads stdin, and every VM configuration option is
//! exposed as `--<name>[=VALUE]`. Exit code is 0 on success and 1 on any
//! uncaught interpreter error.

use std::{env, fs, io::Read as _, process::ExitCode};

use sprig::{OPTIONS, OptKind, Reader, Vm};

#[derive(Debug)]
enum Input {
    File(String),
    Stdin,
    Expr(String),
}

#[derive(Debug)]
enum ConfigSet {
    Int(String, i64),
    Bool(String, bool),
}

fn main() -> ExitCode {
    let args: Vec<String> = env::args().skip(1).collect();

    let mut inputs: Vec<Input> = Vec::new();
    let mut config_sets: Vec<ConfigSet> = Vec::new();
    let mut preproc_only = false;
    let mut no_prelude = false;

    let mut iter = args.into_iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--help" => {
                print_usage();
                return ExitCode::SUCCESS;
            }
            "--version" => {
                println!("sprig {}", env!("CARGO_PKG_VERSION"));
                return ExitCode::SUCCESS;
            }
            "-c" => {
                let Some(expr) = iter.next() else {
                    eprintln!("sprig: -c needs an expression");
                    return ExitCode::FAILURE;
                };
                inputs.push(Input::Expr(expr));
            }
            "-E" => preproc_only = true,
            "-p" => no_prelude = true,
            "-" => inputs.push(Input::Stdin),
            _ if arg.starts_with("--") => match parse_config_flag(&arg) {
                Ok(set) => config_sets.push(set),
                Err(message) => {
                    eprintln!("sprig: {message}");
                    return ExitCode::FAILURE;
                }
            },
            _ if arg.starts_with('-') => {
                eprintln!("sprig: unknown flag `{arg}` (see --help)");
                return ExitCode::FAILURE;
            }
            _ => inputs.push(Input::File(arg)),
        }
    }

    if inputs.is_empty() {
        eprintln!("sprig: no input (see --help)");
        return ExitCode::FAILURE;
    }

    let mut vm = Vm::new();
    for set in config_sets {
        let result = match set {
            ConfigSet::Int(name, value) => vm.set_config_int(&name, value),
            ConfigSet::Bool(name, value) => vm.set_config_bool(&name, value),
        };
        if let Err(err) = result {
            eprintln!("sprig: {err}");
            return ExitCode::FAILURE;
        }
    }
    if !no_prelude
        && let Err(err) = vm.load_prelude()
    {
        eprintln!("sprig: prelude failed to load: {err}");
        return ExitCode::FAILURE;
    }

    for input in inputs {
        let (source, path) = match read_input(&input) {
            Ok(pair) => pair,
            Err(message) => {
                eprintln!("sprig: {message}");
                return ExitCode::FAILURE;
            }
        };
        if !run_source(&mut vm, source, &path, preproc_only) {
            return ExitCode::FAILURE;
        }
    }
    ExitCode::SUCCESS
}

fn read_input(input: &Input) -> Result<(Vec<u8>, String), String> {
    match input {
        Input::File(path) => fs::read(path)
            .map(|bytes| (bytes, path.clone()))
            .map_err(|err| format!("cannot read {path}: {err}")),
        Input::Stdin => {
            let mut bytes = Vec::new();
            std::io::stdin()
                .read_to_end(&mut bytes)
                .map_err(|err| format!("cannot read stdin: {err}"))?;
            Ok((bytes, "<stdin>".to_owned()))
        }
        Input::Expr(expr) => Ok((expr.clone().into_bytes(), "<command-line>".to_owned())),
    }
}

/// Reads and runs every form in one source. Returns false on the first
/// uncaught error, after reporting it.
fn run_source(vm: &mut Vm, source: Vec<u8>, path: &str, preproc_only: bool) -> bool {
    let mut reader = Reader::new(vm, source, path);
    loop {
        let form = match reader.read_one(vm) {
            Ok(Some(form)) => form,
            Ok(None) => return true,
            Err(err) => {
                let code = vm.error_code_name(err.code()).to_owned();
                match err.msg() {
                    Some(msg) => eprintln!("sprig: {msg} ({code})"),
                    None => eprintln!("sprig: read error ({code})"),
                }
                return false;
            }
        };
        if preproc_only {
            match vm.preproc(form) {
                Ok(prepared) => println!("{}", vm.repr(prepared)),
                Err(_) => {
                    vm.perror("sprig");
                    return false;
                }
            }
        } else if vm.eval(form).is_err() {
            vm.perror("sprig");
            return false;
        }
    }
}

fn parse_config_flag(arg: &str) -> Result<ConfigSet, String> {
    let body = &arg[2..];
    let (name, value) = match body.split_once('=') {
        Some((name, value)) => (name, Some(value)),
        None => (body, None),
    };
    let Some((_, kind, _)) = OPTIONS.iter().find(|(n, _, _)| *n == name) else {
        return Err(format!("unknown option `--{name}` (see --help)"));
    };
    match kind {
        OptKind::Bool => {
            let value = match value {
                None | Some("true") => true,
                Some("false") => false,
                Some(other) => return Err(format!("--{name} takes true or false, not `{other}`")),
            };
            Ok(ConfigSet::Bool(name.to_owned(), value))
        }
        OptKind::Int => {
            let Some(value) = value else {
                return Err(format!("--{name} needs a value"));
            };
            let value: i64 = value
                .parse()
                .map_err(|_| format!("--{name} takes an integer, not `{value}`"))?;
            Ok(ConfigSet::Int(name.to_owned(), value))
        }
    }
}

fn print_usage() {
    println!("usage: sprig [OPTIONS] [FILE]...");
    println!();
    println!("  -c CMD     evaluate a single expression");
    println!("  -E         preprocess only; write the result to stdout");
    println!("  -p         do not load the prelude");
    println!("  -          read from stdin");
    println!("  --help     print this message");
    println!("  --version  print the version");
    println!();
    println!("configuration options (--<name>[=VALUE]):");
    for (name, kind, help) in OPTIONS {
        let kind = match kind {
            OptKind::Int => "int",
            OptKind::Bool => "bool",
        };
        println!("  --{name:<24} {kind:<5} {help}");
    }
}
