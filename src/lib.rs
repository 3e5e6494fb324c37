//! Lunar library
//!
//! A Lua 5.1 bytecode virtual machine. Chunks arrive as JSON function trees
//! or binary `luac` output and run on a register machine with a generational
//! arena heap, protected calls and cooperative, sliced execution.

pub mod arena;
pub mod bytecode;
pub mod cache;
pub mod config;
pub mod error;
pub mod function;
pub mod heap;
pub mod metamethod;
pub mod number;
pub mod scheduler;
pub mod stdlib;
pub mod table;
pub mod value;
pub mod vm;

// Re-export commonly used types
pub use bytecode::Chunk;
pub use cache::ChunkCache;
pub use config::VMConfig;
pub use error::{ErrorKind, LuaError, Result};
pub use heap::MemoryStats;
pub use scheduler::Scheduler;
pub use value::{LuaString, TableHandle, Value};
pub use vm::{ExecutionContext, LuaVM, Slice};
