//! Lua 5.1 opcodes and the packed instruction word
//!
//! Layout of a 32-bit instruction (least significant bit first):
//! `op:6 | A:8 | C:9 | B:9`, with `Bx` occupying the upper 18 bits and `sBx`
//! stored excess-131071.

use lazy_static::lazy_static;
use std::collections::HashMap;
use std::fmt;

/// Largest value of the A operand
pub const MAXARG_A: u32 = 0xFF;

/// Largest value of the B and C operands
pub const MAXARG_BC: u32 = 0x1FF;

/// Largest value of the Bx operand
pub const MAXARG_BX: u32 = 0x3FFFF;

/// Bias of the signed sBx operand
pub const MAXARG_SBX: i32 = (MAXARG_BX >> 1) as i32;

/// RK operands at or above this value address the constant table
pub const BITRK: u32 = 1 << 8;

/// Number of list items flushed per SETLIST
pub const LFIELDS_PER_FLUSH: usize = 50;

/// Whether an RK operand refers to a constant
pub fn is_constant(rk: u32) -> bool {
    rk & BITRK != 0
}

/// Constant index encoded in an RK operand
pub fn constant_index(rk: u32) -> usize {
    (rk & !BITRK) as usize
}

/// Operand layout of an opcode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpMode {
    ABC,
    ABx,
    AsBx,
}

/// Lua 5.1 opcodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpCode {
    Move = 0,
    LoadK = 1,
    LoadBool = 2,
    LoadNil = 3,
    GetUpval = 4,
    GetGlobal = 5,
    GetTable = 6,
    SetGlobal = 7,
    SetUpval = 8,
    SetTable = 9,
    NewTable = 10,
    Self_ = 11,
    Add = 12,
    Sub = 13,
    Mul = 14,
    Div = 15,
    Mod = 16,
    Pow = 17,
    Unm = 18,
    Not = 19,
    Len = 20,
    Concat = 21,
    Jmp = 22,
    Eq = 23,
    Lt = 24,
    Le = 25,
    Test = 26,
    TestSet = 27,
    Call = 28,
    TailCall = 29,
    Return = 30,
    ForLoop = 31,
    ForPrep = 32,
    TForLoop = 33,
    SetList = 34,
    Close = 35,
    Closure = 36,
    Vararg = 37,
}

/// Every opcode in numeric order
pub const ALL_OPCODES: [OpCode; 38] = [
    OpCode::Move,
    OpCode::LoadK,
    OpCode::LoadBool,
    OpCode::LoadNil,
    OpCode::GetUpval,
    OpCode::GetGlobal,
    OpCode::GetTable,
    OpCode::SetGlobal,
    OpCode::SetUpval,
    OpCode::SetTable,
    OpCode::NewTable,
    OpCode::Self_,
    OpCode::Add,
    OpCode::Sub,
    OpCode::Mul,
    OpCode::Div,
    OpCode::Mod,
    OpCode::Pow,
    OpCode::Unm,
    OpCode::Not,
    OpCode::Len,
    OpCode::Concat,
    OpCode::Jmp,
    OpCode::Eq,
    OpCode::Lt,
    OpCode::Le,
    OpCode::Test,
    OpCode::TestSet,
    OpCode::Call,
    OpCode::TailCall,
    OpCode::Return,
    OpCode::ForLoop,
    OpCode::ForPrep,
    OpCode::TForLoop,
    OpCode::SetList,
    OpCode::Close,
    OpCode::Closure,
    OpCode::Vararg,
];

lazy_static! {
    static ref OPCODES_BY_NAME: HashMap<&'static str, OpCode> =
        ALL_OPCODES.iter().map(|op| (op.name(), *op)).collect();
}

impl OpCode {
    /// Decode an opcode number
    pub fn from_u8(value: u8) -> Option<OpCode> {
        ALL_OPCODES.get(value as usize).copied()
    }

    /// Look up an opcode by its mnemonic (case-insensitive)
    pub fn from_name(name: &str) -> Option<OpCode> {
        OPCODES_BY_NAME.get(name.to_ascii_uppercase().as_str()).copied()
    }

    /// Canonical mnemonic
    pub fn name(self) -> &'static str {
        match self {
            OpCode::Move => "MOVE",
            OpCode::LoadK => "LOADK",
            OpCode::LoadBool => "LOADBOOL",
            OpCode::LoadNil => "LOADNIL",
            OpCode::GetUpval => "GETUPVAL",
            OpCode::GetGlobal => "GETGLOBAL",
            OpCode::GetTable => "GETTABLE",
            OpCode::SetGlobal => "SETGLOBAL",
            OpCode::SetUpval => "SETUPVAL",
            OpCode::SetTable => "SETTABLE",
            OpCode::NewTable => "NEWTABLE",
            OpCode::Self_ => "SELF",
            OpCode::Add => "ADD",
            OpCode::Sub => "SUB",
            OpCode::Mul => "MUL",
            OpCode::Div => "DIV",
            OpCode::Mod => "MOD",
            OpCode::Pow => "POW",
            OpCode::Unm => "UNM",
            OpCode::Not => "NOT",
            OpCode::Len => "LEN",
            OpCode::Concat => "CONCAT",
            OpCode::Jmp => "JMP",
            OpCode::Eq => "EQ",
            OpCode::Lt => "LT",
            OpCode::Le => "LE",
            OpCode::Test => "TEST",
            OpCode::TestSet => "TESTSET",
            OpCode::Call => "CALL",
            OpCode::TailCall => "TAILCALL",
            OpCode::Return => "RETURN",
            OpCode::ForLoop => "FORLOOP",
            OpCode::ForPrep => "FORPREP",
            OpCode::TForLoop => "TFORLOOP",
            OpCode::SetList => "SETLIST",
            OpCode::Close => "CLOSE",
            OpCode::Closure => "CLOSURE",
            OpCode::Vararg => "VARARG",
        }
    }

    /// Operand layout
    pub fn mode(self) -> OpMode {
        match self {
            OpCode::LoadK | OpCode::GetGlobal | OpCode::SetGlobal | OpCode::Closure => OpMode::ABx,
            OpCode::Jmp | OpCode::ForLoop | OpCode::ForPrep => OpMode::AsBx,
            _ => OpMode::ABC,
        }
    }
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A packed Lua 5.1 instruction
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Instruction(pub u32);

impl Instruction {
    /// Create a new instruction from its raw word
    pub fn new(value: u32) -> Self {
        Instruction(value)
    }

    /// Encode an ABC instruction
    pub fn abc(op: OpCode, a: u32, b: u32, c: u32) -> Self {
        Instruction(
            (op as u32) | (a & MAXARG_A) << 6 | (c & MAXARG_BC) << 14 | (b & MAXARG_BC) << 23,
        )
    }

    /// Encode an ABx instruction
    pub fn abx(op: OpCode, a: u32, bx: u32) -> Self {
        Instruction((op as u32) | (a & MAXARG_A) << 6 | (bx & MAXARG_BX) << 14)
    }

    /// Encode an AsBx instruction
    pub fn asbx(op: OpCode, a: u32, sbx: i32) -> Self {
        Self::abx(op, a, (sbx + MAXARG_SBX) as u32)
    }

    /// Get the raw value
    pub fn raw(&self) -> u32 {
        self.0
    }

    /// Opcode number (6 bits)
    pub fn opcode_number(&self) -> u8 {
        (self.0 & 0x3F) as u8
    }

    /// Decoded opcode
    pub fn opcode(&self) -> Option<OpCode> {
        OpCode::from_u8(self.opcode_number())
    }

    /// A field (8 bits)
    pub fn a(&self) -> u32 {
        (self.0 >> 6) & MAXARG_A
    }

    /// B field (9 bits)
    pub fn b(&self) -> u32 {
        (self.0 >> 23) & MAXARG_BC
    }

    /// C field (9 bits)
    pub fn c(&self) -> u32 {
        (self.0 >> 14) & MAXARG_BC
    }

    /// Bx field (18 bits unsigned)
    pub fn bx(&self) -> u32 {
        (self.0 >> 14) & MAXARG_BX
    }

    /// sBx field (18 bits signed)
    pub fn sbx(&self) -> i32 {
        self.bx() as i32 - MAXARG_SBX
    }
}

impl fmt::Debug for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.opcode() {
            Some(op) => match op.mode() {
                OpMode::ABC => write!(f, "{} {} {} {}", op, self.a(), self.b(), self.c()),
                OpMode::ABx => write!(f, "{} {} {}", op, self.a(), self.bx()),
                OpMode::AsBx => write!(f, "{} {} {}", op, self.a(), self.sbx()),
            },
            None => write!(f, "DATA {:#010x}", self.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_layout() {
        // ADD 1 2 259 => R1 := R2 + K3
        let i = Instruction::abc(OpCode::Add, 1, 2, 259);
        assert_eq!(i.opcode(), Some(OpCode::Add));
        assert_eq!(i.a(), 1);
        assert_eq!(i.b(), 2);
        assert_eq!(i.c(), 259);
        assert!(is_constant(i.c()));
        assert_eq!(constant_index(i.c()), 3);
        assert_eq!(i.raw() & 0x3F, 12);
        assert_eq!((i.raw() >> 14) & 0x1FF, 259);
    }

    #[test]
    fn test_signed_jump() {
        let i = Instruction::asbx(OpCode::Jmp, 0, -5);
        assert_eq!(i.sbx(), -5);
        let i = Instruction::asbx(OpCode::ForPrep, 3, 7);
        assert_eq!(i.a(), 3);
        assert_eq!(i.sbx(), 7);
    }

    #[test]
    fn test_mnemonics() {
        assert_eq!(OpCode::from_name("loadk"), Some(OpCode::LoadK));
        assert_eq!(OpCode::from_name("SELF"), Some(OpCode::Self_));
        assert_eq!(OpCode::from_name("NOPE"), None);
        assert_eq!(OpCode::from_u8(37), Some(OpCode::Vararg));
        assert_eq!(OpCode::from_u8(38), None);
        for (n, op) in ALL_OPCODES.iter().enumerate() {
            assert_eq!(*op as usize, n);
        }
    }
}
