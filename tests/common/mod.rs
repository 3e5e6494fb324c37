//! Shared helpers for integration tests: a small assembler for JSON chunk
//! trees and VM setup.

#![allow(dead_code)]

use lunar::{Chunk, LuaVM, Result, VMConfig, Value};
use serde_json::{json, Value as Json};
use std::cell::RefCell;
use std::io::{self, Write};
use std::rc::Rc;

/// RK operand addressing constant `i`
pub const fn k(i: i64) -> i64 {
    256 + i
}

/// Builder for one function tree
#[derive(Debug, Clone)]
pub struct Proto {
    params: u8,
    vararg: bool,
    upvalues: u8,
    stack: u8,
    source: Option<String>,
    constants: Vec<Json>,
    code: Vec<Json>,
    children: Vec<Proto>,
}

impl Proto {
    pub fn new() -> Self {
        Proto {
            params: 0,
            vararg: false,
            upvalues: 0,
            stack: 16,
            source: None,
            constants: Vec::new(),
            code: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn params(mut self, n: u8) -> Self {
        self.params = n;
        self
    }

    pub fn vararg(mut self) -> Self {
        self.vararg = true;
        self
    }

    pub fn upvalues(mut self, n: u8) -> Self {
        self.upvalues = n;
        self
    }

    pub fn source(mut self, name: &str) -> Self {
        self.source = Some(name.to_string());
        self
    }

    /// Append constants; use `json!(null)` for nil
    pub fn constants(mut self, ks: &[Json]) -> Self {
        self.constants.extend_from_slice(ks);
        self
    }

    /// Append an instruction; B carries Bx or sBx for those modes
    pub fn op(mut self, name: &str, a: i64, b: i64, c: i64) -> Self {
        self.code.push(json!([name, a, b, c]));
        self
    }

    pub fn child(mut self, proto: Proto) -> Self {
        self.children.push(proto);
        self
    }

    /// Tree with one line per instruction: instruction `pc` is on line `pc + 1`
    pub fn to_json(&self) -> Json {
        let lines: Vec<u32> = (1..=self.code.len() as u32).collect();
        let mut tree = json!({
            "paramCount": self.params,
            "isVararg": self.vararg,
            "upvalueCount": self.upvalues,
            "maxStackSize": self.stack,
            "constants": self.constants,
            "instructions": self.code,
            "functions": self.children.iter().map(Proto::to_json).collect::<Vec<_>>(),
            "linePositions": lines,
        });
        if let Some(source) = &self.source {
            tree["sourceName"] = json!(source);
        }
        tree
    }

    /// Main chunk named `@test.lua` unless a source was given
    pub fn chunk(&self) -> Chunk {
        let mut tree = self.to_json();
        if self.source.is_none() {
            tree["sourceName"] = json!("@test.lua");
        }
        Chunk::from_json(&tree.to_string()).expect("test chunk should load")
    }
}

/// `print` destination readable after the run
#[derive(Clone, Default)]
pub struct Output(Rc<RefCell<Vec<u8>>>);

impl Output {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.0.borrow()).into_owned()
    }
}

impl Write for Output {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// VM with the standard library and captured output
pub fn vm_with(config: VMConfig) -> (LuaVM, Output) {
    let mut vm = LuaVM::new(config);
    vm.open_libs().expect("stdlib should load");
    let output = Output::default();
    vm.set_output(Box::new(output.clone()));
    (vm, output)
}

pub fn vm() -> (LuaVM, Output) {
    vm_with(VMConfig::default())
}

/// Instantiate and call a main function in `vm`
pub fn run_in(vm: &mut LuaVM, proto: &Proto) -> Result<Vec<Value>> {
    let f = vm.instantiate(&proto.chunk())?;
    vm.call(&f, Vec::new())
}

/// Run a main function on a fresh VM
pub fn run(proto: &Proto) -> Result<Vec<Value>> {
    let (mut vm, _) = vm();
    run_in(&mut vm, proto)
}

pub fn num(n: f64) -> Value {
    Value::Number(n)
}

pub fn s(text: &str) -> Value {
    Value::from(text)
}
