//! Bytecode formats: instruction words, JSON trees and binary chunks

pub mod chunk;
pub mod opcode;
pub mod tree;
pub mod undump;

pub use chunk::{digest, disassemble, Chunk};
pub use opcode::{Instruction, OpCode, OpMode, BITRK, LFIELDS_PER_FLUSH};
