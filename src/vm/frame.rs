//! Call frames and per-execution thread state

use crate::function::FunctionProto;
use crate::value::{FunctionHandle, UpvalueHandle, Value};
use std::collections::BTreeMap;
use std::rc::Rc;
use uuid::Uuid;

/// Where a returning frame delivers its results
#[derive(Debug, Clone)]
pub(crate) enum ReturnTarget {
    /// Into the calling frame's registers starting at `dest`; `wanted: None`
    /// keeps every result and moves the caller's top marker
    Caller { dest: usize, wanted: Option<usize> },

    /// Back to the host call that pushed the frame
    Host,

    /// Generic `for` iterator call: results land at `dest`, and the control
    /// variable at `control` is updated when the first result is not nil
    Iterator {
        dest: usize,
        wanted: usize,
        control: usize,
    },
}

/// Marker on a frame entered through `pcall` / `xpcall`
#[derive(Debug, Clone)]
pub(crate) struct ProtectedCall {
    /// Message handler given to `xpcall`
    pub handler: Option<Value>,
}

/// Activation record of a bytecode function
#[derive(Debug, Clone)]
pub(crate) struct CallFrame {
    /// Closure being executed
    pub closure: FunctionHandle,

    /// Its prototype
    pub proto: Rc<FunctionProto>,

    /// Next instruction
    pub pc: usize,

    /// Stack index of register 0; the function itself sits at `base - 1`
    pub base: usize,

    /// End of the values produced by the last multi-result call or VARARG
    pub top: usize,

    /// Arguments beyond the fixed parameters
    pub varargs: Vec<Value>,

    pub return_to: ReturnTarget,

    pub protected: Option<ProtectedCall>,
}

impl CallFrame {
    /// `chunk:line:` of the instruction being executed
    pub fn current_location(&self) -> String {
        self.proto.location(self.pc.saturating_sub(1))
    }

    /// Stack slots this frame needs
    pub fn frame_size(&self) -> usize {
        self.proto.max_stack_size.max(self.proto.param_count) as usize
    }
}

/// Value stack and frames of one execution
#[derive(Debug)]
pub(crate) struct ThreadState {
    /// Identity used by open upvalue cells
    pub id: Uuid,

    pub stack: Vec<Value>,

    pub frames: Vec<CallFrame>,

    /// Open upvalue cells by stack index
    pub open_upvalues: BTreeMap<usize, UpvalueHandle>,

    /// Instructions executed by the current invocation
    pub instructions: u64,
}

impl ThreadState {
    pub fn new() -> Self {
        ThreadState {
            id: Uuid::new_v4(),
            stack: Vec::new(),
            frames: Vec::new(),
            open_upvalues: BTreeMap::new(),
            instructions: 0,
        }
    }

    /// Read a stack slot; slots past the end read as nil
    pub fn get(&self, index: usize) -> Value {
        self.stack.get(index).cloned().unwrap_or(Value::Nil)
    }

    /// Write a stack slot, growing the stack when needed
    pub fn set(&mut self, index: usize, value: Value) {
        if index >= self.stack.len() {
            self.stack.resize(index + 1, Value::Nil);
        }
        self.stack[index] = value;
    }

    /// Make sure slots `..len` exist
    pub fn ensure(&mut self, len: usize) {
        if self.stack.len() < len {
            self.stack.resize(len, Value::Nil);
        }
    }

    /// Values in `start..end`, reading missing slots as nil
    pub fn slice(&self, start: usize, end: usize) -> Vec<Value> {
        (start..end).map(|i| self.get(i)).collect()
    }
}
