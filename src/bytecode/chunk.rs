//! Loaded, validated chunks

use crate::bytecode::opcode::{constant_index, is_constant, Instruction, OpCode, OpMode};
use crate::bytecode::{tree, undump};
use crate::error::{LuaError, Result};
use crate::function::FunctionProto;
use sha1::{Digest, Sha1};
use std::collections::BTreeMap;
use std::path::Path;
use std::rc::Rc;
use tracing::debug;

/// A validated program ready to be instantiated
#[derive(Debug, Clone)]
pub struct Chunk {
    /// Main function
    pub main: Rc<FunctionProto>,

    /// Other package files, by `require` name
    pub modules: BTreeMap<String, Rc<FunctionProto>>,

    /// SHA1 of the bytes the chunk was loaded from
    pub sha1: String,
}

impl Chunk {
    /// Load a chunk from JSON text
    pub fn from_json(text: &str) -> Result<Chunk> {
        Self::from_bytes(text.as_bytes())
    }

    /// Load a chunk from JSON or binary `luac` bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Chunk> {
        let sha1 = digest(bytes);

        let (main, modules) = if undump::is_binary_chunk(bytes) {
            (undump::undump(bytes)?, BTreeMap::new())
        } else {
            let text = std::str::from_utf8(bytes)
                .map_err(|_| LuaError::reference_error("malformed chunk: input is not UTF-8"))?;
            let loaded = tree::parse_json(text)?;
            (loaded.main, loaded.modules)
        };

        validate(&main)?;
        for proto in modules.values() {
            validate(proto)?;
        }

        debug!(
            sha1 = %sha1,
            source = %main.source,
            modules = modules.len(),
            "chunk loaded"
        );

        Ok(Chunk {
            main: Rc::new(main),
            modules: modules.into_iter().map(|(k, v)| (k, Rc::new(v))).collect(),
            sha1,
        })
    }

    /// Load a chunk from a file
    pub fn from_path(path: impl AsRef<Path>) -> Result<Chunk> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|e| {
            LuaError::reference_error(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_bytes(&bytes)
    }
}

/// Hex SHA1 of a byte string
pub fn digest(bytes: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

fn invalid(proto: &FunctionProto, pc: usize, message: impl std::fmt::Display) -> LuaError {
    LuaError::reference_error(format!(
        "malformed chunk: {} at instruction {} of {}",
        message,
        pc,
        proto.chunk_name()
    ))
}

/// Check operand references of a prototype and its children
pub fn validate(proto: &FunctionProto) -> Result<()> {
    if proto.code.is_empty() {
        return Err(LuaError::reference_error(format!(
            "malformed chunk: function at line {} of {} has no instructions",
            proto.line_defined,
            proto.chunk_name()
        )));
    }

    let code_len = proto.code.len();
    let check_constant = |pc: usize, index: usize| -> Result<()> {
        if index >= proto.constants.len() {
            return Err(invalid(proto, pc, format!("constant index {} out of range", index)));
        }
        Ok(())
    };
    let check_rk = |pc: usize, operand: u32| -> Result<()> {
        if is_constant(operand) {
            check_constant(pc, constant_index(operand))?;
        }
        Ok(())
    };
    let check_jump = |pc: usize, offset: i32| -> Result<()> {
        let target = pc as i64 + 1 + offset as i64;
        if target < 0 || target >= code_len as i64 {
            return Err(invalid(proto, pc, "jump out of range"));
        }
        Ok(())
    };

    let mut pc = 0;
    while pc < code_len {
        let instr = proto.code[pc];
        let op = instr
            .opcode()
            .ok_or_else(|| invalid(proto, pc, format!("bad opcode {}", instr.opcode_number())))?;

        match op {
            OpCode::LoadK | OpCode::GetGlobal | OpCode::SetGlobal => {
                check_constant(pc, instr.bx() as usize)?;
            }
            OpCode::GetUpval | OpCode::SetUpval => {
                if instr.b() >= proto.upvalue_count as u32 {
                    return Err(invalid(proto, pc, format!("upvalue index {} out of range", instr.b())));
                }
            }
            OpCode::GetTable | OpCode::Self_ => check_rk(pc, instr.c())?,
            OpCode::SetTable
            | OpCode::Add
            | OpCode::Sub
            | OpCode::Mul
            | OpCode::Div
            | OpCode::Mod
            | OpCode::Pow
            | OpCode::Eq
            | OpCode::Lt
            | OpCode::Le => {
                check_rk(pc, instr.b())?;
                check_rk(pc, instr.c())?;
            }
            OpCode::Jmp | OpCode::ForLoop | OpCode::ForPrep => check_jump(pc, instr.sbx())?,
            OpCode::SetList if instr.c() == 0 => {
                // the next word is the block number
                if pc + 1 >= code_len {
                    return Err(invalid(proto, pc, "missing SETLIST block number"));
                }
                pc += 1;
            }
            OpCode::Closure => {
                let index = instr.bx() as usize;
                let child = proto
                    .protos
                    .get(index)
                    .ok_or_else(|| invalid(proto, pc, format!("prototype index {} out of range", index)))?;
                let captures = child.upvalue_count as usize;
                if pc + captures >= code_len {
                    return Err(invalid(proto, pc, "missing upvalue capture instructions"));
                }
                for capture in &proto.code[pc + 1..=pc + captures] {
                    check_capture(proto, pc, *capture)?;
                }
                pc += captures;
            }
            _ => {}
        }

        let skips = match op {
            OpCode::LoadBool => instr.c() != 0,
            OpCode::Eq
            | OpCode::Lt
            | OpCode::Le
            | OpCode::Test
            | OpCode::TestSet
            | OpCode::TForLoop => true,
            _ => false,
        };
        if skips && pc + 2 > code_len - 1 {
            return Err(invalid(proto, pc, "jump out of range"));
        }
        pc += 1;
    }

    for child in &proto.protos {
        validate(child)?;
    }
    Ok(())
}

fn check_capture(proto: &FunctionProto, pc: usize, capture: Instruction) -> Result<()> {
    match capture.opcode() {
        Some(OpCode::Move) => Ok(()),
        Some(OpCode::GetUpval) if capture.b() < proto.upvalue_count as u32 => Ok(()),
        Some(OpCode::GetUpval) => Err(invalid(proto, pc, "captured upvalue index out of range")),
        _ => Err(invalid(proto, pc, "bad upvalue capture instruction")),
    }
}

/// Mode-aware rendering of a prototype's code, for debug listings
pub fn disassemble(proto: &FunctionProto) -> Vec<String> {
    proto
        .code
        .iter()
        .enumerate()
        .map(|(pc, instr)| {
            let line = proto
                .line_at(pc)
                .map(|l| l.to_string())
                .unwrap_or_else(|| "-".to_string());
            let text = match instr.opcode() {
                Some(op) if op.mode() == OpMode::AsBx => {
                    format!("{:?}\t; to {}", instr, pc as i64 + 2 + instr.sbx() as i64)
                }
                _ => format!("{:?}", instr),
            };
            format!("{}\t[{}]\t{}", pc + 1, line, text)
        })
        .collect()
}
