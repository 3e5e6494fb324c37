//! Reader for binary Lua 5.1 chunks as written by `luac`
//!
//! Only little-endian chunks with 4-byte ints and instructions and 8-byte
//! doubles are accepted; `size_t` may be 4 or 8 bytes.

use crate::bytecode::opcode::Instruction;
use crate::error::{LuaError, Result};
use crate::function::FunctionProto;
use crate::value::{LuaString, Value};
use nom::bytes::complete::{tag, take};
use nom::number::complete::{le_f64, le_i32, le_u32, le_u64, le_u8};
use nom::IResult;
use std::rc::Rc;

/// Signature at the start of every binary chunk
pub const SIGNATURE: &[u8] = b"\x1bLua";

const VERSION: u8 = 0x51;

const TNIL: u8 = 0;
const TBOOLEAN: u8 = 1;
const TNUMBER: u8 = 3;
const TSTRING: u8 = 4;

/// Header fields that vary between platforms
#[derive(Debug, Clone, Copy)]
struct Header {
    size_t: u8,
}

/// Whether `bytes` start with the binary chunk signature
pub fn is_binary_chunk(bytes: &[u8]) -> bool {
    bytes.starts_with(SIGNATURE)
}

/// Decode a binary chunk into its main prototype
pub fn undump(bytes: &[u8]) -> Result<FunctionProto> {
    let (input, header) = parse_header(bytes).map_err(|e| malformed(e.to_string()))?;

    if header.size_t != 4 && header.size_t != 8 {
        return Err(malformed(format!("unsupported size_t of {} bytes", header.size_t)));
    }

    let (rest, proto) = parse_function(input, header, "=?").map_err(|e| malformed(e.to_string()))?;
    if !rest.is_empty() {
        return Err(malformed(format!("{} trailing bytes", rest.len())));
    }
    Ok(proto)
}

fn malformed(message: impl std::fmt::Display) -> LuaError {
    LuaError::reference_error(format!("malformed binary chunk: {}", message))
}

fn header_byte(input: &[u8], expected: u8) -> IResult<&[u8], u8> {
    nom::combinator::verify(le_u8, |b: &u8| *b == expected)(input)
}

fn parse_header(input: &[u8]) -> IResult<&[u8], Header> {
    let (input, _) = tag(SIGNATURE)(input)?;
    let (input, _) = header_byte(input, VERSION)?;
    let (input, _format) = header_byte(input, 0)?;
    let (input, _little_endian) = header_byte(input, 1)?;
    let (input, _int_size) = header_byte(input, 4)?;
    let (input, size_t) = le_u8(input)?;
    let (input, _instruction_size) = header_byte(input, 4)?;
    let (input, _number_size) = header_byte(input, 8)?;
    let (input, _integral) = header_byte(input, 0)?;
    Ok((input, Header { size_t }))
}

fn parse_size(input: &[u8], header: Header) -> IResult<&[u8], usize> {
    if header.size_t == 8 {
        let (input, n) = le_u64(input)?;
        Ok((input, n as usize))
    } else {
        let (input, n) = le_u32(input)?;
        Ok((input, n as usize))
    }
}

fn parse_count(input: &[u8]) -> IResult<&[u8], usize> {
    let (input, n) = nom::combinator::verify(le_i32, |n: &i32| *n >= 0)(input)?;
    Ok((input, n as usize))
}

/// Length-prefixed string including its trailing NUL; `None` when empty
fn parse_string(input: &[u8], header: Header) -> IResult<&[u8], Option<Vec<u8>>> {
    let (input, len) = parse_size(input, header)?;
    if len == 0 {
        return Ok((input, None));
    }
    let (input, bytes) = take(len)(input)?;
    Ok((input, Some(bytes[..len - 1].to_vec())))
}

fn parse_list<'a, T>(
    input: &'a [u8],
    mut parser: impl FnMut(&'a [u8]) -> IResult<&'a [u8], T>,
) -> IResult<&'a [u8], Vec<T>> {
    let (mut input, count) = parse_count(input)?;
    let mut items = Vec::with_capacity(count.min(1 << 16));
    for _ in 0..count {
        let (rest, item) = parser(input)?;
        items.push(item);
        input = rest;
    }
    Ok((input, items))
}

fn parse_constant(input: &[u8], header: Header) -> IResult<&[u8], Value> {
    let (input, tag) = le_u8(input)?;
    match tag {
        TNIL => Ok((input, Value::Nil)),
        TBOOLEAN => {
            let (input, b) = le_u8(input)?;
            Ok((input, Value::Boolean(b != 0)))
        }
        TNUMBER => {
            let (input, n) = le_f64(input)?;
            Ok((input, Value::Number(n)))
        }
        TSTRING => {
            let (input, s) = parse_string(input, header)?;
            Ok((input, Value::String(LuaString::from(s.unwrap_or_default()))))
        }
        _ => Err(nom::Err::Failure(nom::error::Error::new(
            input,
            nom::error::ErrorKind::Tag,
        ))),
    }
}

fn parse_function<'a>(
    input: &'a [u8],
    header: Header,
    parent_source: &str,
) -> IResult<&'a [u8], FunctionProto> {
    let (input, source) = parse_string(input, header)?;
    let source = match source {
        Some(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        None => parent_source.to_string(),
    };
    let (input, line_defined) = le_u32(input)?;
    let (input, last_line_defined) = le_u32(input)?;
    let (input, upvalue_count) = le_u8(input)?;
    let (input, param_count) = le_u8(input)?;
    let (input, is_vararg) = le_u8(input)?;
    let (input, max_stack_size) = le_u8(input)?;

    let (input, code) = parse_list(input, |i| {
        let (i, word) = le_u32(i)?;
        Ok((i, Instruction::new(word)))
    })?;
    let (input, constants) = parse_list(input, |i| parse_constant(i, header))?;
    let (input, protos) = parse_list(input, |i| {
        let (i, proto) = parse_function(i, header, &source)?;
        Ok((i, Rc::new(proto)))
    })?;

    // debug information
    let (input, line_info) = parse_list(input, le_u32)?;
    let (input, _locals) = parse_list(input, |i| {
        let (i, _name) = parse_string(i, header)?;
        let (i, _start_pc) = le_u32(i)?;
        let (i, _end_pc) = le_u32(i)?;
        Ok((i, ()))
    })?;
    let (input, upvalue_names) = parse_list(input, |i| {
        let (i, name) = parse_string(i, header)?;
        Ok((i, String::from_utf8_lossy(&name.unwrap_or_default()).into_owned()))
    })?;

    Ok((
        input,
        FunctionProto {
            source,
            line_defined,
            last_line_defined,
            code,
            constants,
            protos,
            param_count,
            is_vararg: is_vararg != 0,
            max_stack_size,
            upvalue_count,
            line_info,
            upvalue_names,
        },
    ))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::bytecode::opcode::OpCode;

    /// Minimal luac image: `return 7` from `@seven.lua`
    pub(crate) fn seven_chunk() -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(SIGNATURE);
        out.extend_from_slice(&[0x51, 0, 1, 4, 8, 4, 8, 0]);

        let source = b"@seven.lua\0";
        out.extend_from_slice(&(source.len() as u64).to_le_bytes());
        out.extend_from_slice(source);
        out.extend_from_slice(&0u32.to_le_bytes()); // linedefined
        out.extend_from_slice(&0u32.to_le_bytes()); // lastlinedefined
        out.extend_from_slice(&[0, 0, 2, 2]); // nups, params, vararg, stack

        let code = [
            Instruction::abx(OpCode::LoadK, 0, 0),
            Instruction::abc(OpCode::Return, 0, 2, 0),
            Instruction::abc(OpCode::Return, 0, 1, 0),
        ];
        out.extend_from_slice(&(code.len() as i32).to_le_bytes());
        for i in &code {
            out.extend_from_slice(&i.raw().to_le_bytes());
        }

        out.extend_from_slice(&1i32.to_le_bytes());
        out.push(TNUMBER);
        out.extend_from_slice(&7.0f64.to_le_bytes());

        out.extend_from_slice(&0i32.to_le_bytes()); // protos
        out.extend_from_slice(&3i32.to_le_bytes()); // lineinfo
        for line in [1u32, 1, 1] {
            out.extend_from_slice(&line.to_le_bytes());
        }
        out.extend_from_slice(&0i32.to_le_bytes()); // locals
        out.extend_from_slice(&0i32.to_le_bytes()); // upvalues
        out
    }

    #[test]
    fn test_undump() {
        let bytes = seven_chunk();
        assert!(is_binary_chunk(&bytes));
        let proto = undump(&bytes).unwrap();
        assert_eq!(proto.source, "@seven.lua");
        assert_eq!(proto.code.len(), 3);
        assert_eq!(proto.constants, vec![Value::Number(7.0)]);
        assert_eq!(proto.line_info, vec![1, 1, 1]);
        assert_eq!(proto.max_stack_size, 2);
    }

    #[test]
    fn test_rejects_foreign_header() {
        let mut bytes = seven_chunk();
        bytes[4] = 0x52;
        let err = undump(&bytes).unwrap_err();
        assert!(matches!(err, LuaError::ReferenceError { .. }));

        let bytes = seven_chunk();
        assert!(undump(&bytes[..bytes.len() - 3]).is_err());
    }
}
