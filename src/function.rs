//! Function prototypes, closures, upvalue cells and native functions

use crate::bytecode::Instruction;
use crate::error::Result;
use crate::value::{UpvalueHandle, Value};
use crate::vm::ExecutionContext;
use std::fmt;
use std::rc::Rc;
use uuid::Uuid;

/// Maximum length of a chunk name in messages
const CHUNK_ID_SIZE: usize = 60;

/// Immutable compiled function, shared by every closure created from it
#[derive(Debug, Clone, Default)]
pub struct FunctionProto {
    /// Raw chunk name (`@file`, `=name` or source text)
    pub source: String,

    /// Line where the function was defined
    pub line_defined: u32,

    /// Line where the function definition ends
    pub last_line_defined: u32,

    /// Bytecode
    pub code: Vec<Instruction>,

    /// Constant table (nil, boolean, number or string only)
    pub constants: Vec<Value>,

    /// Nested prototypes referenced by CLOSURE
    pub protos: Vec<Rc<FunctionProto>>,

    /// Number of fixed parameters
    pub param_count: u8,

    /// Whether the function accepts `...`
    pub is_vararg: bool,

    /// Registers needed by the function
    pub max_stack_size: u8,

    /// Number of upvalues captured by closures of this prototype
    pub upvalue_count: u8,

    /// Source line for each instruction
    pub line_info: Vec<u32>,

    /// Upvalue names, for diagnostics
    pub upvalue_names: Vec<String>,
}

impl FunctionProto {
    /// Chunk name as shown in error positions
    pub fn chunk_name(&self) -> String {
        chunk_id(&self.source)
    }

    /// Source line of the instruction at `pc`
    pub fn line_at(&self, pc: usize) -> Option<u32> {
        self.line_info.get(pc).copied()
    }

    /// `chunk:line:` prefix for a fault raised at `pc`
    pub fn location(&self, pc: usize) -> String {
        match self.line_at(pc) {
            Some(line) => format!("{}:{}:", self.chunk_name(), line),
            None => format!("{}:?:", self.chunk_name()),
        }
    }

    /// Approximate memory footprint in bytes, nested prototypes excluded
    pub fn estimated_size(&self) -> usize {
        let strings: usize = self
            .constants
            .iter()
            .filter_map(|k| k.as_lua_string().map(|s| s.len()))
            .sum();
        128 + self.code.len() * 4 + self.constants.len() * 16 + strings + self.line_info.len() * 4
    }
}

/// Render a raw chunk name the way Lua 5.1 does in messages
pub fn chunk_id(source: &str) -> String {
    if let Some(name) = source.strip_prefix('=') {
        return name.chars().take(CHUNK_ID_SIZE - 1).collect();
    }
    if let Some(path) = source.strip_prefix('@') {
        let limit = CHUNK_ID_SIZE - 4;
        let count = path.chars().count();
        if count <= limit {
            return path.to_string();
        }
        let tail: String = path.chars().skip(count - limit).collect();
        return format!("...{}", tail);
    }

    let limit = CHUNK_ID_SIZE - " [string \"...\"] ".len() - 1;
    let first_line = source.split('\n').next().unwrap_or("");
    let shown: String = first_line.chars().take(limit).collect();
    if shown.len() < source.len() {
        format!("[string \"{}...\"]", shown)
    } else {
        format!("[string \"{}\"]", shown)
    }
}

/// Upvalue cell shared by every closure capturing the same local
#[derive(Debug, Clone)]
pub enum UpvalueCell {
    /// Local still live on the stack of `thread`
    Open { thread: Uuid, index: usize },

    /// Local went out of scope; the cell owns its value
    Closed(Value),
}

/// A bytecode closure
#[derive(Debug, Clone)]
pub struct Closure {
    /// Shared prototype
    pub proto: Rc<FunctionProto>,

    /// Captured upvalue cells in prototype order
    pub upvalues: Vec<UpvalueHandle>,
}

/// Signature of host functions callable from Lua
pub type NativeFn = Rc<dyn Fn(&mut ExecutionContext<'_>) -> Result<Vec<Value>>>;

/// What a native function does when called
#[derive(Clone)]
pub enum NativeKind {
    /// Ordinary host callable
    Host(NativeFn),

    /// Protected call entry point
    Pcall,

    /// Protected call with a message handler
    Xpcall,
}

/// A native function object
#[derive(Clone)]
pub struct NativeFunction {
    /// Name used in argument errors
    pub name: Rc<str>,

    /// Behaviour
    pub kind: NativeKind,
}

impl NativeFunction {
    /// Wrap a host callable
    pub fn host(
        name: impl Into<Rc<str>>,
        f: impl Fn(&mut ExecutionContext<'_>) -> Result<Vec<Value>> + 'static,
    ) -> Self {
        NativeFunction {
            name: name.into(),
            kind: NativeKind::Host(Rc::new(f)),
        }
    }
}

impl fmt::Debug for NativeFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            NativeKind::Host(_) => "host",
            NativeKind::Pcall => "pcall",
            NativeKind::Xpcall => "xpcall",
        };
        write!(f, "NativeFunction({}, {})", self.name, kind)
    }
}

/// Function object stored in the heap
#[derive(Debug, Clone)]
pub enum FunctionObject {
    /// Bytecode closure
    Lua(Closure),

    /// Native function
    Native(NativeFunction),
}

impl FunctionObject {
    /// Approximate memory footprint in bytes
    pub fn estimated_size(&self) -> usize {
        match self {
            FunctionObject::Lua(closure) => 48 + closure.upvalues.len() * 8,
            FunctionObject::Native(native) => 48 + native.name.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_id() {
        assert_eq!(chunk_id("@main.lua"), "main.lua");
        assert_eq!(chunk_id("=stdin"), "stdin");
        assert_eq!(chunk_id("return 1"), "[string \"return 1\"]");
        assert_eq!(chunk_id("x = 1\ny = 2"), "[string \"x = 1...\"]");

        let long = format!("@{}", "d/".repeat(40));
        let id = chunk_id(&long);
        assert!(id.starts_with("..."));
        assert_eq!(id.chars().count(), 59);
    }

    #[test]
    fn test_location() {
        let proto = FunctionProto {
            source: "@main.lua".to_string(),
            line_info: vec![1, 1, 3],
            ..FunctionProto::default()
        };
        assert_eq!(proto.location(2), "main.lua:3:");
        assert_eq!(proto.location(9), "main.lua:?:");
    }
}
