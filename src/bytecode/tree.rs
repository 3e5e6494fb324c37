//! JSON representation of compiled chunks
//!
//! A chunk is either a single function tree or a package of named trees:
//!
//! ```json
//! { "format": "lunar.package", "files": { "main.lua": { ... } }, "main": "main.lua" }
//! ```
//!
//! Instructions are packed 32-bit words or `[op, A, B, C]` arrays, where `op`
//! is an opcode number or mnemonic. For ABx opcodes `B` carries Bx and for
//! AsBx opcodes `B` carries the signed offset.

use crate::bytecode::opcode::{Instruction, OpCode, OpMode, MAXARG_A, MAXARG_BC, MAXARG_BX, MAXARG_SBX};
use crate::error::{LuaError, Result};
use crate::function::FunctionProto;
use crate::value::Value;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::rc::Rc;

/// Package format tag
pub const PACKAGE_FORMAT: &str = "lunar.package";

/// One function in tree form
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkTree {
    #[serde(default)]
    pub source_name: Option<String>,

    #[serde(default)]
    pub line_defined: u32,

    #[serde(default)]
    pub last_line_defined: u32,

    #[serde(default)]
    pub upvalue_count: u8,

    #[serde(default)]
    pub param_count: u8,

    #[serde(default)]
    pub is_vararg: VarargFlag,

    #[serde(default)]
    pub max_stack_size: Option<u8>,

    pub instructions: Vec<InstructionTree>,

    #[serde(default)]
    pub constants: Vec<Option<ConstantTree>>,

    #[serde(default)]
    pub functions: Vec<ChunkTree>,

    #[serde(default)]
    pub line_positions: Vec<u32>,

    #[serde(default)]
    pub upvalues: Vec<String>,
}

/// `isVararg` accepts the luac flag byte or a boolean
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(untagged)]
pub enum VarargFlag {
    Bool(bool),
    Flag(u8),
}

impl Default for VarargFlag {
    fn default() -> Self {
        VarargFlag::Bool(false)
    }
}

impl VarargFlag {
    fn is_set(self) -> bool {
        match self {
            VarargFlag::Bool(b) => b,
            VarargFlag::Flag(f) => f != 0,
        }
    }
}

/// Constant table entry; `null` is nil
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ConstantTree {
    Bool(bool),
    Number(f64),
    String(String),
}

/// Instruction in packed or field form
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum InstructionTree {
    Packed(u32),
    Fields(Vec<serde_json::Value>),
}

/// A package of named chunk trees
#[derive(Debug, Clone, Deserialize)]
pub struct PackageTree {
    pub format: String,

    pub files: BTreeMap<String, ChunkTree>,

    #[serde(default)]
    pub main: Option<String>,
}

/// Parsed input: the main function plus `require`-able modules
#[derive(Debug)]
pub struct LoadedTree {
    pub main: FunctionProto,
    pub modules: BTreeMap<String, FunctionProto>,
}

fn malformed(message: impl std::fmt::Display) -> LuaError {
    LuaError::reference_error(format!("malformed chunk: {}", message))
}

/// Parse JSON text into prototypes
pub fn parse_json(text: &str) -> Result<LoadedTree> {
    let document: serde_json::Value = serde_json::from_str(text).map_err(malformed)?;

    match document.get("format") {
        Some(_) => {
            let package: PackageTree = serde_json::from_value(document).map_err(malformed)?;
            load_package(package)
        }
        None => {
            let tree: ChunkTree = serde_json::from_value(document).map_err(malformed)?;
            Ok(LoadedTree {
                main: build_proto(&tree, "=?")?,
                modules: BTreeMap::new(),
            })
        }
    }
}

fn load_package(package: PackageTree) -> Result<LoadedTree> {
    if package.format != PACKAGE_FORMAT {
        return Err(malformed(format!("unknown package format '{}'", package.format)));
    }
    let main_name = package
        .main
        .ok_or_else(|| malformed("package has no 'main' entry"))?;
    if !package.files.contains_key(&main_name) {
        return Err(malformed(format!("main file '{}' not found in package", main_name)));
    }

    let mut main = None;
    let mut modules = BTreeMap::new();
    for (name, tree) in &package.files {
        let proto = build_proto(tree, &format!("@{}", name))?;
        if *name == main_name {
            main = Some(proto);
        } else {
            modules.insert(module_name(name), proto);
        }
    }

    let main = main.ok_or_else(|| malformed("package has no main chunk"))?;
    Ok(LoadedTree { main, modules })
}

/// `require` name for a package file: `lib/util.lua` -> `lib.util`
pub fn module_name(file: &str) -> String {
    let stem = file.strip_suffix(".lua").unwrap_or(file);
    stem.replace('/', ".")
}

/// Convert a tree into a prototype, inheriting `parent_source` when the tree
/// names no source
pub fn build_proto(tree: &ChunkTree, parent_source: &str) -> Result<FunctionProto> {
    let source = tree
        .source_name
        .clone()
        .unwrap_or_else(|| parent_source.to_string());

    let code = tree
        .instructions
        .iter()
        .enumerate()
        .map(|(pc, instr)| encode_instruction(instr, pc))
        .collect::<Result<Vec<_>>>()?;

    let constants = tree
        .constants
        .iter()
        .map(|k| match k {
            None => Value::Nil,
            Some(ConstantTree::Bool(b)) => Value::Boolean(*b),
            Some(ConstantTree::Number(n)) => Value::Number(*n),
            Some(ConstantTree::String(s)) => Value::from(s.as_str()),
        })
        .collect();

    let protos = tree
        .functions
        .iter()
        .map(|child| build_proto(child, &source).map(Rc::new))
        .collect::<Result<Vec<_>>>()?;

    let max_stack_size = tree
        .max_stack_size
        .unwrap_or_else(|| infer_stack_size(&code, tree.param_count));

    Ok(FunctionProto {
        source,
        line_defined: tree.line_defined,
        last_line_defined: tree.last_line_defined,
        code,
        constants,
        protos,
        param_count: tree.param_count,
        is_vararg: tree.is_vararg.is_set(),
        max_stack_size,
        upvalue_count: tree.upvalue_count,
        line_info: tree.line_positions.clone(),
        upvalue_names: tree.upvalues.clone(),
    })
}

fn infer_stack_size(code: &[Instruction], params: u8) -> u8 {
    let highest = code.iter().map(|i| i.a()).max().unwrap_or(0);
    (highest + 3).max(params as u32).clamp(2, MAXARG_A) as u8
}

fn encode_instruction(instr: &InstructionTree, pc: usize) -> Result<Instruction> {
    let fields = match instr {
        InstructionTree::Packed(word) => return Ok(Instruction::new(*word)),
        InstructionTree::Fields(fields) => fields,
    };
    if fields.is_empty() || fields.len() > 4 {
        return Err(malformed(format!("instruction {} must have 1 to 4 fields", pc)));
    }

    let op = match &fields[0] {
        serde_json::Value::String(name) => OpCode::from_name(name),
        serde_json::Value::Number(n) => n
            .as_u64()
            .and_then(|n| u8::try_from(n).ok())
            .and_then(OpCode::from_u8),
        _ => None,
    }
    .ok_or_else(|| malformed(format!("bad opcode {} at instruction {}", fields[0], pc)))?;

    let operand = |i: usize| -> Result<i64> {
        match fields.get(i) {
            None => Ok(0),
            Some(v) => v
                .as_i64()
                .ok_or_else(|| malformed(format!("bad operand {} at instruction {}", v, pc))),
        }
    };
    let (a, b, c) = (operand(1)?, operand(2)?, operand(3)?);

    let in_range = |value: i64, max: u32| value >= 0 && value <= max as i64;
    if !in_range(a, MAXARG_A) {
        return Err(malformed(format!("operand A out of range at instruction {}", pc)));
    }

    match op.mode() {
        OpMode::ABC => {
            if !in_range(b, MAXARG_BC) || !in_range(c, MAXARG_BC) {
                return Err(malformed(format!("operand out of range at instruction {}", pc)));
            }
            Ok(Instruction::abc(op, a as u32, b as u32, c as u32))
        }
        OpMode::ABx => {
            if !in_range(b, MAXARG_BX) {
                return Err(malformed(format!("operand Bx out of range at instruction {}", pc)));
            }
            Ok(Instruction::abx(op, a as u32, b as u32))
        }
        OpMode::AsBx => {
            if b < -(MAXARG_SBX as i64) || b > MAXARG_SBX as i64 + 1 {
                return Err(malformed(format!("operand sBx out of range at instruction {}", pc)));
            }
            Ok(Instruction::asbx(op, a as u32, b as i32))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_form() {
        let text = r#"{
            "sourceName": "@t.lua",
            "maxStackSize": 2,
            "instructions": [["LOADK", 0, 0], [30, 0, 2, 0]],
            "constants": [42, null, true, "s"],
            "linePositions": [1, 1]
        }"#;
        let loaded = parse_json(text).unwrap();
        let proto = loaded.main;
        assert_eq!(proto.code[0].opcode(), Some(OpCode::LoadK));
        assert_eq!(proto.code[1].opcode(), Some(OpCode::Return));
        assert_eq!(proto.code[1].b(), 2);
        assert_eq!(proto.constants.len(), 4);
        assert_eq!(proto.constants[1], Value::Nil);
        assert_eq!(proto.chunk_name(), "t.lua");
    }

    #[test]
    fn test_jump_offsets() {
        let text = r#"{ "instructions": [["JMP", 0, -1], ["RETURN", 0, 1, 0]] }"#;
        let proto = parse_json(text).unwrap().main;
        assert_eq!(proto.code[0].sbx(), -1);
        assert_eq!(proto.source, "=?");
    }

    #[test]
    fn test_bad_opcode() {
        let err = parse_json(r#"{ "instructions": [["FROB", 0, 0, 0]] }"#).unwrap_err();
        assert!(err.to_string().contains("bad opcode"));
        assert!(matches!(err, LuaError::ReferenceError { .. }));

        let err = parse_json(r#"{ "instructions": [[40, 0, 0, 0]] }"#).unwrap_err();
        assert!(err.to_string().contains("bad opcode"));
    }

    #[test]
    fn test_package_validation() {
        let err = parse_json(r#"{ "format": "other", "files": {}, "main": "x" }"#).unwrap_err();
        assert!(err.to_string().contains("unknown package format"));

        let err = parse_json(r#"{ "format": "lunar.package", "files": {} }"#).unwrap_err();
        assert!(err.to_string().contains("no 'main'"));

        let err =
            parse_json(r#"{ "format": "lunar.package", "files": {}, "main": "a.lua" }"#).unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn test_package_modules() {
        let text = r#"{
            "format": "lunar.package",
            "main": "main.lua",
            "files": {
                "main.lua": { "instructions": [["RETURN", 0, 1, 0]] },
                "lib/util.lua": { "instructions": [["RETURN", 0, 1, 0]] }
            }
        }"#;
        let loaded = parse_json(text).unwrap();
        assert_eq!(loaded.main.source, "@main.lua");
        assert!(loaded.modules.contains_key("lib.util"));
    }

    #[test]
    fn test_syntax_error_is_reference_error() {
        let err = parse_json("{ not json").unwrap_err();
        assert!(matches!(err, LuaError::ReferenceError { .. }));
    }
}
