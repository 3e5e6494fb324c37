//! Lua String Library Implementation
//!
//! The library table doubles as the `__index` of the metatable shared by
//! all strings, so `s:upper()` works. Pattern matching is not provided.

use super::{new_lib, LibFn};
use crate::error::{LuaError, Result};
use crate::number;
use crate::table::Table;
use crate::value::{LuaString, Value};
use crate::vm::{ExecutionContext, LuaVM};

/// Initialize the string library and the string metatable
pub fn init_string_lib(vm: &mut LuaVM) -> Result<()> {
    let funcs: &[(&str, LibFn)] = &[
        ("len", string_len),
        ("sub", string_sub),
        ("upper", string_upper),
        ("lower", string_lower),
        ("rep", string_rep),
        ("reverse", string_reverse),
        ("byte", string_byte),
        ("char", string_char),
        ("format", string_format),
    ];
    let lib = new_lib(vm, "string", funcs)?;

    let meta = vm.heap.alloc_table(Table::new());
    vm.heap
        .table_set(meta, Value::from("__index"), Value::Table(lib))?;
    vm.string_meta = Some(meta);
    Ok(())
}

/// Translate a relative string position: negative counts from the end
fn posrelat(pos: i64, len: usize) -> i64 {
    if pos < 0 {
        len as i64 + pos + 1
    } else {
        pos
    }
}

fn new_string(ctx: &mut ExecutionContext, bytes: Vec<u8>) -> Value {
    ctx.vm.heap.charge(bytes.len());
    Value::String(LuaString::from(bytes))
}

/// String.len function - returns the length in bytes
/// Signature: string.len(s)
pub fn string_len(ctx: &mut ExecutionContext) -> Result<Vec<Value>> {
    let s = ctx.check_string(1)?;
    Ok(vec![Value::from(s.len() as i64)])
}

/// String.sub function - returns the substring from i to j
/// Signature: string.sub(s [, i [, j]])
pub fn string_sub(ctx: &mut ExecutionContext) -> Result<Vec<Value>> {
    let s = ctx.check_string(1)?;
    let len = s.len();
    let start = posrelat(ctx.opt_integer(2, 1)?, len).max(1);
    let end = posrelat(ctx.opt_integer(3, -1)?, len).min(len as i64);

    if start > end {
        return Ok(vec![Value::from("")]);
    }
    let bytes = s.as_bytes()[start as usize - 1..end as usize].to_vec();
    Ok(vec![new_string(ctx, bytes)])
}

/// String.upper function - converts ASCII letters to upper case
/// Signature: string.upper(s)
pub fn string_upper(ctx: &mut ExecutionContext) -> Result<Vec<Value>> {
    let s = ctx.check_string(1)?;
    let bytes = s.as_bytes().to_ascii_uppercase();
    Ok(vec![new_string(ctx, bytes)])
}

/// String.lower function - converts ASCII letters to lower case
/// Signature: string.lower(s)
pub fn string_lower(ctx: &mut ExecutionContext) -> Result<Vec<Value>> {
    let s = ctx.check_string(1)?;
    let bytes = s.as_bytes().to_ascii_lowercase();
    Ok(vec![new_string(ctx, bytes)])
}

/// String.rep function - repeats a string n times
/// Signature: string.rep(s, n)
pub fn string_rep(ctx: &mut ExecutionContext) -> Result<Vec<Value>> {
    let s = ctx.check_string(1)?;
    let n = ctx.check_integer(2)?;
    if n <= 0 || s.is_empty() {
        return Ok(vec![Value::from("")]);
    }

    let total = (s.len() as u128) * (n as u128);
    let limit = ctx.vm.config().limits.memory_limit;
    if limit > 0 && total > limit as u128 {
        return Err(LuaError::MemoryLimit);
    }
    Ok(vec![new_string(ctx, s.as_bytes().repeat(n as usize))])
}

/// String.reverse function - reverses the bytes of a string
/// Signature: string.reverse(s)
pub fn string_reverse(ctx: &mut ExecutionContext) -> Result<Vec<Value>> {
    let s = ctx.check_string(1)?;
    let mut bytes = s.as_bytes().to_vec();
    bytes.reverse();
    Ok(vec![new_string(ctx, bytes)])
}

/// String.byte function - returns the internal numeric codes of characters
/// Signature: string.byte(s [, i [, j]])
pub fn string_byte(ctx: &mut ExecutionContext) -> Result<Vec<Value>> {
    let s = ctx.check_string(1)?;
    let len = s.len();
    let i = ctx.opt_integer(2, 1)?;
    let start = posrelat(i, len).max(1);
    let end = posrelat(ctx.opt_integer(3, i)?, len).min(len as i64);

    if start > end {
        return Ok(vec![]);
    }
    Ok(s.as_bytes()[start as usize - 1..end as usize]
        .iter()
        .map(|b| Value::from(*b as i64))
        .collect())
}

/// String.char function - returns a string built from character codes
/// Signature: string.char(...)
pub fn string_char(ctx: &mut ExecutionContext) -> Result<Vec<Value>> {
    let mut bytes = Vec::with_capacity(ctx.arg_count());
    for n in 1..=ctx.arg_count() {
        let code = ctx.check_integer(n)?;
        if !(0..=255).contains(&code) {
            return Err(ctx.arg_error(n, "invalid value"));
        }
        bytes.push(code as u8);
    }
    Ok(vec![new_string(ctx, bytes)])
}

/// Parsed `%` directive
#[derive(Debug, Default)]
struct FormatSpec {
    left: bool,
    plus: bool,
    space: bool,
    alternate: bool,
    zero: bool,
    width: usize,
    precision: Option<usize>,
}

impl FormatSpec {
    /// Parse flags, width and precision; returns the spec and the bytes consumed
    fn parse(bytes: &[u8]) -> Result<(FormatSpec, usize)> {
        let mut spec = FormatSpec::default();
        let mut i = 0;
        while let Some(&c) = bytes.get(i) {
            match c {
                b'-' => spec.left = true,
                b'+' => spec.plus = true,
                b' ' => spec.space = true,
                b'#' => spec.alternate = true,
                b'0' => spec.zero = true,
                _ => break,
            }
            i += 1;
        }
        if i > 5 {
            return Err(LuaError::host_fault("invalid format (repeated flags)"));
        }

        let width_start = i;
        while bytes.get(i).map_or(false, u8::is_ascii_digit) {
            spec.width = spec.width * 10 + (bytes[i] - b'0') as usize;
            i += 1;
        }
        if i - width_start > 2 {
            return Err(LuaError::host_fault("invalid format (width or precision too long)"));
        }

        if bytes.get(i) == Some(&b'.') {
            i += 1;
            let precision_start = i;
            let mut precision = 0;
            while bytes.get(i).map_or(false, u8::is_ascii_digit) {
                precision = precision * 10 + (bytes[i] - b'0') as usize;
                i += 1;
            }
            if i - precision_start > 2 {
                return Err(LuaError::host_fault(
                    "invalid format (width or precision too long)",
                ));
            }
            spec.precision = Some(precision);
        }
        Ok((spec, i))
    }

    /// Sign prefix for a non-negative number
    fn positive_sign(&self) -> &'static str {
        if self.plus {
            "+"
        } else if self.space {
            " "
        } else {
            ""
        }
    }

    /// Pad `body` to the field width; `prefix` (sign, `0x`) stays in front of
    /// zero padding
    fn pad(&self, prefix: &str, body: &str, zero_allowed: bool) -> String {
        let len = prefix.len() + body.len();
        if len >= self.width {
            return format!("{}{}", prefix, body);
        }
        let fill = self.width - len;
        if self.left {
            format!("{}{}{}", prefix, body, " ".repeat(fill))
        } else if self.zero && zero_allowed {
            format!("{}{}{}", prefix, "0".repeat(fill), body)
        } else {
            format!("{}{}{}", " ".repeat(fill), prefix, body)
        }
    }

    fn integer(&self, n: i64) -> String {
        let sign = if n < 0 { "-" } else { self.positive_sign() };
        let digits = self.min_digits(n.unsigned_abs().to_string());
        self.pad(sign, &digits, self.precision.is_none())
    }

    fn unsigned(&self, n: u64, radix: char) -> String {
        let digits = match radix {
            'x' => format!("{:x}", n),
            'X' => format!("{:X}", n),
            'o' => format!("{:o}", n),
            _ => n.to_string(),
        };
        let digits = self.min_digits(digits);
        let prefix = match radix {
            'x' if self.alternate && n != 0 => "0x",
            'X' if self.alternate && n != 0 => "0X",
            'o' if self.alternate && !digits.starts_with('0') => "0",
            _ => "",
        };
        self.pad(prefix, &digits, self.precision.is_none())
    }

    fn min_digits(&self, digits: String) -> String {
        match self.precision {
            Some(p) if digits.len() < p => format!("{}{}", "0".repeat(p - digits.len()), digits),
            _ => digits,
        }
    }

    fn float(&self, n: f64, conversion: u8) -> String {
        let precision = self.precision.unwrap_or(6);
        let upper = conversion.is_ascii_uppercase();
        let text = match conversion {
            b'e' | b'E' => number::format_exponent(n.abs(), precision, upper),
            b'f' => number::format_fixed(n.abs(), precision, upper),
            _ => number::format_general(n.abs(), precision, upper, self.alternate),
        };
        let negative = n.is_sign_negative() && !n.is_nan();
        let sign = if negative { "-" } else { self.positive_sign() };
        self.pad(sign, &text, n.is_finite())
    }
}

/// Append `bytes` space-padded to the field width
fn pad_bytes(out: &mut Vec<u8>, spec: &FormatSpec, bytes: &[u8]) {
    let fill = spec.width.saturating_sub(bytes.len());
    if !spec.left {
        out.resize(out.len() + fill, b' ');
    }
    out.extend_from_slice(bytes);
    if spec.left {
        out.resize(out.len() + fill, b' ');
    }
}

/// Body of `%q`: a double-quoted string readable back by Lua
fn quote(out: &mut Vec<u8>, s: &[u8]) {
    out.push(b'"');
    for &b in s {
        match b {
            b'"' | b'\\' | b'\n' => {
                out.push(b'\\');
                out.push(b);
            }
            b'\r' => out.extend_from_slice(b"\\r"),
            0 => out.extend_from_slice(b"\\000"),
            _ => out.push(b),
        }
    }
    out.push(b'"');
}

/// String.format function - printf-style formatting
/// Signature: string.format(fmt, ...)
pub fn string_format(ctx: &mut ExecutionContext) -> Result<Vec<Value>> {
    let fmt = ctx.check_string(1)?;
    let fmt = fmt.as_bytes();
    let mut out = Vec::with_capacity(fmt.len());
    let mut arg = 1;
    let mut i = 0;

    while i < fmt.len() {
        if fmt[i] != b'%' {
            out.push(fmt[i]);
            i += 1;
            continue;
        }
        i += 1;
        if fmt.get(i) == Some(&b'%') {
            out.push(b'%');
            i += 1;
            continue;
        }

        let (spec, used) = FormatSpec::parse(&fmt[i..])?;
        i += used;
        let conversion = *fmt.get(i).ok_or_else(|| {
            LuaError::host_fault("invalid option '%' to 'format'")
        })?;
        i += 1;
        arg += 1;

        match conversion {
            b'd' | b'i' => {
                let n = ctx.check_number(arg)?;
                out.extend_from_slice(spec.integer(n as i64).as_bytes());
            }
            b'u' => {
                let n = ctx.check_number(arg)?;
                out.extend_from_slice(spec.unsigned(n as i64 as u64, 'u').as_bytes());
            }
            b'x' | b'X' | b'o' => {
                let n = ctx.check_number(arg)?;
                let text = spec.unsigned(n as i64 as u64, conversion as char);
                out.extend_from_slice(text.as_bytes());
            }
            b'c' => {
                let byte = ctx.check_number(arg)? as i64 as u8;
                pad_bytes(&mut out, &spec, &[byte]);
            }
            b'e' | b'E' | b'f' | b'g' | b'G' => {
                let n = ctx.check_number(arg)?;
                out.extend_from_slice(spec.float(n, conversion).as_bytes());
            }
            b'q' => {
                let s = ctx.check_string(arg)?;
                quote(&mut out, s.as_bytes());
            }
            b's' => {
                let s = ctx.check_string(arg)?;
                let bytes = match spec.precision {
                    Some(p) if p < s.len() => &s.as_bytes()[..p],
                    _ => s.as_bytes(),
                };
                pad_bytes(&mut out, &spec, bytes);
            }
            other => {
                return Err(LuaError::host_fault(format!(
                    "invalid option '%{}' to 'format'",
                    other as char
                )))
            }
        }
    }

    Ok(vec![new_string(ctx, out)])
}
