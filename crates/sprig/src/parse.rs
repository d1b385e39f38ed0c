//! The reader: source text to value trees.
//!
//! A [`Reader`] wraps a source buffer plus path/line/pos state and yields
//! one value per call. Lexical errors are EREAD; running out of input in
//! the middle of a form is EEOF. When `gen-debug-info` is on, every list
//! cons is stamped with the source location of the element it holds.

use crate::{
    errors::{BuiltinCode, CodeLoc, EvalResult, throw},
    heap::{Cons, DebugInfo, HeapData, Str, ValueFlags},
    intern::SymId,
    value::Value,
    vm::Vm,
};

/// Characters that terminate an identifier or number token.
fn is_reserved(byte: u8) -> bool {
    matches!(byte, b'(' | b')' | b'\'' | b'`' | b',' | b'"' | b';')
}

fn is_token_byte(byte: u8) -> bool {
    byte.is_ascii_graphic() && !is_reserved(byte) || byte >= 0x80
}

/// Incremental reader over one source buffer.
#[derive(Debug)]
pub struct Reader {
    src: Vec<u8>,
    pos: usize,
    /// Offset of this buffer within the logical stream, for hosts that
    /// feed a stream in pieces through `new_at`.
    base_pos: u32,
    line: u32,
    path: SymId,
    /// Nesting depth of enclosing backquotes; commas are only legal when
    /// this is positive.
    bq_depth: u32,
}

impl Reader {
    /// Creates a reader over `source`, interning `path` for locations.
    ///
    /// An initial `#!` line is skipped. Sources shorter than two bytes (or
    /// not starting with `#!`) are read from the beginning.
    pub fn new(vm: &mut Vm, source: impl Into<Vec<u8>>, path: &str) -> Self {
        let src = source.into();
        let mut reader = Self {
            src,
            pos: 0,
            base_pos: 0,
            line: 1,
            path: vm.interner.intern(path),
            bq_depth: 0,
        };
        if reader.src.len() >= 2 && &reader.src[..2] == b"#!" {
            while let Some(byte) = reader.peek() {
                reader.bump();
                if byte == b'\n' {
                    break;
                }
            }
        }
        reader
    }

    /// Creates a reader continuing at an explicit line/pos, for streams
    /// the host has already partially consumed.
    pub fn new_at(vm: &mut Vm, source: impl Into<Vec<u8>>, path: &str, line: u32, pos: u32) -> Self {
        let mut reader = Self::new(vm, source, path);
        reader.line = line;
        reader.base_pos = pos;
        reader
    }

    /// Current 1-based line.
    #[must_use]
    pub fn line(&self) -> u32 {
        self.line
    }

    /// Current byte offset within the logical stream.
    #[must_use]
    pub fn pos(&self) -> u32 {
        self.base_pos + self.pos as u32
    }

    fn peek(&self) -> Option<u8> {
        self.src.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let byte = self.peek()?;
        self.pos += 1;
        if byte == b'\n' {
            self.line += 1;
        }
        Some(byte)
    }

    fn loc(&self) -> CodeLoc {
        CodeLoc {
            file: self.path,
            line: self.line,
            pos: self.pos(),
        }
    }

    fn skip_blank(&mut self) {
        while let Some(byte) = self.peek() {
            if byte.is_ascii_whitespace() {
                self.bump();
            } else if byte == b';' {
                while let Some(byte) = self.bump() {
                    if byte == b'\n' {
                        break;
                    }
                }
            } else {
                break;
            }
        }
    }

    /// Reads the next form, or `None` at a clean end of input.
    ///
    /// Freshly read values are rooted while the form is under construction
    /// and unrooted before returning; the caller is responsible for keeping
    /// the result alive past its next allocation.
    pub fn read_one(&mut self, vm: &mut Vm) -> EvalResult<Option<Value>> {
        self.skip_blank();
        if self.peek().is_none() {
            return Ok(None);
        }
        let mark = vm.heap.root_mark();
        let result = self.read_value(vm, false);
        vm.heap.root_truncate(mark);
        result.map(Some)
    }

    fn eof(&self) -> Box<crate::errors::Thrown> {
        throw(BuiltinCode::Eeof, format!("unexpected end of input at line {}", self.line))
    }

    fn read_value(&mut self, vm: &mut Vm, splice_ok: bool) -> EvalResult<Value> {
        self.skip_blank();
        let Some(byte) = self.peek() else {
            return Err(self.eof());
        };
        match byte {
            b'(' => {
                self.bump();
                self.read_list(vm)
            }
            b')' => Err(throw(
                BuiltinCode::Eread,
                format!("unmatched `)` at line {}", self.line),
            )),
            b'\'' => {
                self.bump();
                let inner = self.read_value(vm, false)?;
                self.wrap(vm, inner, |v| HeapData::Quote(v))
            }
            b'`' => {
                self.bump();
                self.bq_depth += 1;
                let inner = self.read_value(vm, false);
                self.bq_depth -= 1;
                self.wrap(vm, inner?, |v| HeapData::Backquote(v))
            }
            b',' => {
                self.bump();
                if self.bq_depth == 0 {
                    return Err(throw(
                        BuiltinCode::Eread,
                        format!("`,` outside backquote at line {}", self.line),
                    ));
                }
                let splice = self.peek() == Some(b'@');
                if splice {
                    self.bump();
                    if !splice_ok {
                        return Err(throw(
                            BuiltinCode::Eread,
                            format!("`,@` outside list context at line {}", self.line),
                        ));
                    }
                }
                self.bq_depth -= 1;
                let inner = self.read_value(vm, false);
                self.bq_depth += 1;
                let inner = inner?;
                if splice {
                    self.wrap(vm, inner, |v| HeapData::Splice(v))
                } else {
                    self.wrap(vm, inner, |v| HeapData::Comma(v))
                }
            }
            b'"' => {
                self.bump();
                self.read_string(vm)
            }
            _ if is_token_byte(byte) => self.read_atom(vm),
            _ => Err(throw(
                BuiltinCode::Eread,
                format!("stray byte 0x{byte:02x} at line {}", self.line),
            )),
        }
    }

    fn wrap(
        &self,
        vm: &mut Vm,
        inner: Value,
        make: impl FnOnce(Value) -> HeapData,
    ) -> EvalResult<Value> {
        vm.heap.root(inner);
        let id = vm.alloc(make(inner))?;
        let value = Value::Ref(id);
        vm.heap.root(value);
        Ok(value)
    }

    fn read_list(&mut self, vm: &mut Vm) -> EvalResult<Value> {
        let mut items: Vec<(Value, CodeLoc)> = Vec::new();
        loop {
            self.skip_blank();
            match self.peek() {
                None => return Err(self.eof()),
                Some(b')') => {
                    self.bump();
                    break;
                }
                Some(_) => {
                    let loc = self.loc();
                    let value = self.read_value(vm, true)?;
                    items.push((value, loc));
                }
            }
        }
        // Build the spine back to front, stamping each cons with the
        // location of its element.
        let debug = vm.config.gen_debug_info;
        let mut list = Value::Nil;
        for (value, loc) in items.into_iter().rev() {
            let cons = Cons {
                car: value,
                cdr: list,
                debug: debug.then_some(DebugInfo::Loc(loc)),
            };
            let id = vm.alloc(HeapData::Cons(cons))?;
            if debug {
                vm.heap.set_flag(id, ValueFlags::DEBUG_LOC, true);
            }
            list = Value::Ref(id);
            vm.heap.root(list);
        }
        Ok(list)
    }

    fn read_string(&mut self, vm: &mut Vm) -> EvalResult<Value> {
        let mut bytes: Vec<u8> = Vec::new();
        loop {
            let Some(byte) = self.bump() else {
                return Err(self.eof());
            };
            match byte {
                b'"' => break,
                b'\\' => {
                    let Some(escape) = self.bump() else {
                        return Err(self.eof());
                    };
                    match escape {
                        b'n' => bytes.push(b'\n'),
                        b'r' => bytes.push(b'\r'),
                        b't' => bytes.push(b'\t'),
                        b'0' => bytes.push(0),
                        b'\\' => bytes.push(b'\\'),
                        b'\'' => bytes.push(b'\''),
                        b'"' => bytes.push(b'"'),
                        b'x' => bytes.push(self.hex_escape(2)? as u8),
                        b'u' => self.push_code_point(&mut bytes, 4)?,
                        b'U' => self.push_code_point(&mut bytes, 8)?,
                        other => {
                            return Err(throw(
                                BuiltinCode::Eread,
                                format!("unknown escape `\\{}` at line {}", other as char, self.line),
                            ));
                        }
                    }
                }
                other => bytes.push(other),
            }
        }
        let id = vm.alloc(HeapData::Str(Str::Owned(bytes.into_boxed_slice())))?;
        let value = Value::Ref(id);
        vm.heap.root(value);
        Ok(value)
    }

    fn hex_escape(&mut self, digits: usize) -> EvalResult<u32> {
        let mut out: u32 = 0;
        for _ in 0..digits {
            let Some(byte) = self.bump() else {
                return Err(self.eof());
            };
            let digit = (byte as char)
                .to_digit(16)
                .ok_or_else(|| {
                    throw(
                        BuiltinCode::Eread,
                        format!("invalid hex digit in escape at line {}", self.line),
                    )
                })?;
            out = out << 4 | digit;
        }
        Ok(out)
    }

    fn push_code_point(&mut self, bytes: &mut Vec<u8>, digits: usize) -> EvalResult<()> {
        let code = self.hex_escape(digits)?;
        let ch = char::from_u32(code).ok_or_else(|| {
            throw(
                BuiltinCode::Eread,
                format!("invalid code point U+{code:04X} at line {}", self.line),
            )
        })?;
        let mut buf = [0u8; 4];
        bytes.extend_from_slice(ch.encode_utf8(&mut buf).as_bytes());
        Ok(())
    }

    fn read_atom(&mut self, vm: &mut Vm) -> EvalResult<Value> {
        let start = self.pos;
        // Leading sign is part of a number token; a bare sign is an
        // identifier.
        if matches!(self.peek(), Some(b'+' | b'-')) {
            self.bump();
        }
        while let Some(byte) = self.peek() {
            if is_token_byte(byte) {
                self.bump();
            } else {
                break;
            }
        }
        let token = std::str::from_utf8(&self.src[start..self.pos])
            .map_err(|_| throw(BuiltinCode::Eread, format!("invalid UTF-8 at line {}", self.line)))?;
        debug_assert!(!token.is_empty(), "atom dispatch guarantees one token byte");
        match token {
            "true" => return Ok(Value::Bool(true)),
            "false" => return Ok(Value::Bool(false)),
            _ => {}
        }
        if looks_numeric(token) {
            parse_number(token, self.line)
        } else {
            Ok(Value::Sym(vm.interner.intern(token)))
        }
    }
}

/// A token is numeric when its first significant character is a digit, or
/// a `.` followed by a digit.
fn looks_numeric(token: &str) -> bool {
    let rest = token.strip_prefix(['+', '-']).unwrap_or(token);
    let mut chars = rest.chars();
    match chars.next() {
        Some(c) if c.is_ascii_digit() => true,
        Some('.') => chars.next().is_some_and(|c| c.is_ascii_digit()),
        _ => false,
    }
}

fn parse_number(token: &str, line: u32) -> EvalResult<Value> {
    let (negative, body) = match token.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, token.strip_prefix('+').unwrap_or(token)),
    };

    // Hex, binary, and hex-float forms.
    if let Some(hex) = body.strip_prefix("0x").or_else(|| body.strip_prefix("0X")) {
        if hex.contains(['.', 'p', 'P']) {
            return parse_hex_float(hex, negative, line);
        }
        return finish_int(u64::from_str_radix(hex, 16), negative, line);
    }
    if let Some(bin) = body.strip_prefix("0b").or_else(|| body.strip_prefix("0B")) {
        return finish_int(u64::from_str_radix(bin, 2), negative, line);
    }

    // Doubles need a point or an exponent.
    if body.contains(['.', 'e', 'E']) {
        return body
            .parse::<f64>()
            .map(|d| Value::Double(if negative { -d } else { d }))
            .map_err(|_| throw(BuiltinCode::Eread, format!("malformed number `{token}` at line {line}")));
    }

    // Octal for a leading zero, decimal otherwise.
    let parsed = if body.len() > 1 && body.starts_with('0') {
        u64::from_str_radix(&body[1..], 8)
    } else {
        body.parse::<u64>()
    };
    finish_int(parsed, negative, line)
}

fn finish_int(
    parsed: Result<u64, std::num::ParseIntError>,
    negative: bool,
    line: u32,
) -> EvalResult<Value> {
    let magnitude = parsed
        .map_err(|_| throw(BuiltinCode::Eread, format!("malformed or overflowing integer at line {line}")))?;
    let value = if negative {
        if magnitude > i64::MAX as u64 + 1 {
            return Err(throw(BuiltinCode::Eread, format!("integer overflow at line {line}")));
        }
        (magnitude as i128).wrapping_neg() as i64
    } else {
        i64::try_from(magnitude)
            .map_err(|_| throw(BuiltinCode::Eread, format!("integer overflow at line {line}")))?
    };
    Ok(Value::Int(value))
}

/// Hex float of the shape `<hexdigits>[.<hexdigits>]p<decimal exponent>`,
/// mantissa already stripped of its `0x` prefix.
fn parse_hex_float(body: &str, negative: bool, line: u32) -> EvalResult<Value> {
    let malformed = || throw(BuiltinCode::Eread, format!("malformed hex float at line {line}"));
    let (mantissa_str, exp_str) = body
        .split_once(['p', 'P'])
        .ok_or_else(malformed)?;
    let (int_str, frac_str) = match mantissa_str.split_once('.') {
        Some((i, f)) => (i, f),
        None => (mantissa_str, ""),
    };
    if int_str.is_empty() && frac_str.is_empty() {
        return Err(malformed());
    }
    let mut mantissa: f64 = 0.0;
    for c in int_str.chars() {
        let digit = c.to_digit(16).ok_or_else(malformed)?;
        mantissa = mantissa * 16.0 + f64::from(digit);
    }
    let mut scale = 1.0 / 16.0;
    for c in frac_str.chars() {
        let digit = c.to_digit(16).ok_or_else(malformed)?;
        mantissa += f64::from(digit) * scale;
        scale /= 16.0;
    }
    let exponent: i32 = exp_str.parse().map_err(|_| malformed())?;
    let mut value = mantissa * 2f64.powi(exponent);
    if negative {
        value = -value;
    }
    Ok(Value::Double(value))
}
