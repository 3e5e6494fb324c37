//! Lua virtual machine
//!
//! `LuaVM` owns the heap, the globals and registry tables, and the state of
//! every execution. The interpreter loop lives in `exec`, call and return
//! mechanics plus fault unwinding in `call`, operator semantics in `ops`.

mod call;
mod exec;
pub(crate) mod frame;
mod ops;

use crate::bytecode::Chunk;
use crate::config::VMConfig;
use crate::error::{LuaError, Result};
use crate::function::{Closure, FunctionObject, FunctionProto, NativeFunction, UpvalueCell};
use crate::heap::{LuaHeap, MemoryStats, Root};
use crate::table::Table;
use crate::value::{FunctionHandle, LuaString, TableHandle, UpvalueHandle, Value};
use frame::ThreadState;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::any::Any;
use std::collections::HashMap;
use std::io::Write;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Registry key of the table holding `require` results
pub const LOADED_KEY: &str = "_LOADED";

/// Outcome of resuming a sliced execution
#[derive(Debug, Clone, PartialEq)]
pub enum Slice {
    /// Budget exhausted; the execution stays parked
    Suspended,

    /// Main function returned these values
    Complete(Vec<Value>),
}

/// Context handed to native functions
pub struct ExecutionContext<'a> {
    /// The VM instance
    pub vm: &'a mut LuaVM,

    args: Vec<Value>,

    name: &'a str,

    /// Called by a CALL instruction rather than through a nested call
    from_bytecode: bool,
}

impl<'a> ExecutionContext<'a> {
    /// Name of the function being called
    pub fn name(&self) -> &str {
        self.name
    }

    /// `chunk:line: ` of the Lua function `level` levels up the call chain,
    /// counting this native function as level 0. Empty when that level is
    /// not a Lua function.
    pub fn where_(&self, level: usize) -> String {
        match (level, self.from_bytecode) {
            (0, _) => String::new(),
            (level, true) => self.vm.where_(level),
            (level, false) => self.vm.where_(level - 1),
        }
    }

    /// Number of arguments
    pub fn arg_count(&self) -> usize {
        self.args.len()
    }

    /// All arguments
    pub fn args(&self) -> &[Value] {
        &self.args
    }

    /// Argument `n` (1-based); missing arguments read as nil
    pub fn arg(&self, n: usize) -> Value {
        n.checked_sub(1)
            .and_then(|i| self.args.get(i))
            .cloned()
            .unwrap_or(Value::Nil)
    }

    /// Arguments from `n` (1-based) on
    pub fn rest(&self, n: usize) -> Vec<Value> {
        self.args.iter().skip(n.saturating_sub(1)).cloned().collect()
    }

    /// `bad argument #n to 'name' (message)`
    pub fn arg_error(&self, n: usize, message: impl std::fmt::Display) -> LuaError {
        LuaError::host_fault(format!("bad argument #{} to '{}' ({})", n, self.name, message))
    }

    fn type_error(&self, n: usize, expected: &str) -> LuaError {
        let got = if n > self.args.len() {
            "no value"
        } else {
            self.arg(n).type_name()
        };
        self.arg_error(n, format!("{} expected, got {}", expected, got))
    }

    /// Any value, including an explicit nil
    pub fn check_any(&self, n: usize) -> Result<Value> {
        if n > self.args.len() {
            return Err(self.arg_error(n, "value expected"));
        }
        Ok(self.arg(n))
    }

    /// A number or numeral string
    pub fn check_number(&self, n: usize) -> Result<f64> {
        self.arg(n).to_number().ok_or_else(|| self.type_error(n, "number"))
    }

    /// A number truncated toward zero
    pub fn check_integer(&self, n: usize) -> Result<i64> {
        Ok(self.check_number(n)? as i64)
    }

    /// A string or number, as bytes
    pub fn check_string(&self, n: usize) -> Result<LuaString> {
        self.arg(n).to_lua_string().ok_or_else(|| self.type_error(n, "string"))
    }

    /// A table
    pub fn check_table(&self, n: usize) -> Result<TableHandle> {
        self.arg(n).as_table().ok_or_else(|| self.type_error(n, "table"))
    }

    /// A number, or `default` when the argument is nil or absent
    pub fn opt_number(&self, n: usize, default: f64) -> Result<f64> {
        if self.arg(n).is_nil() {
            Ok(default)
        } else {
            self.check_number(n)
        }
    }

    /// An integer, or `default` when the argument is nil or absent
    pub fn opt_integer(&self, n: usize, default: i64) -> Result<i64> {
        if self.arg(n).is_nil() {
            Ok(default)
        } else {
            self.check_integer(n)
        }
    }

    /// A string, or `default` when the argument is nil or absent
    pub fn opt_string(&self, n: usize, default: &str) -> Result<LuaString> {
        if self.arg(n).is_nil() {
            Ok(LuaString::from(default))
        } else {
            self.check_string(n)
        }
    }

    /// Call a Lua value from native code
    pub fn call(&mut self, f: &Value, args: Vec<Value>) -> Result<Vec<Value>> {
        self.vm.call_value(f, args)
    }
}

/// The Lua virtual machine
pub struct LuaVM {
    /// Memory heap
    pub(crate) heap: LuaHeap,

    /// Global environment table
    pub(crate) globals: TableHandle,

    /// Registry table
    pub(crate) registry: TableHandle,

    /// Metatable shared by all strings
    pub(crate) string_meta: Option<TableHandle>,

    /// Execution currently running (or the host's own when idle)
    pub(crate) state: ThreadState,

    /// Executions waiting for their next slice
    pub(crate) parked: HashMap<Uuid, ThreadState>,

    /// Package files available to `require`
    pub(crate) modules: HashMap<String, Rc<FunctionProto>>,

    /// Configuration options
    pub(crate) config: VMConfig,

    /// Kill flag for script termination
    kill_flag: Arc<AtomicBool>,

    /// Active interpreter loops
    pub(crate) nesting: usize,

    /// Host-level re-entries (`call_value`) in progress
    pub(crate) call_depth: usize,

    /// Generator behind `math.random`
    pub(crate) rng: StdRng,

    /// Values kept alive for the host, with pin counts
    pinned: HashMap<Value, usize>,

    /// Destination of `print`
    pub(crate) output: Box<dyn Write>,
}

impl LuaVM {
    /// Create a new VM instance
    pub fn new(config: VMConfig) -> Self {
        let mut heap = LuaHeap::new(config.limits.gc_threshold);
        let globals = heap.alloc_table(Table::new());
        let registry = heap.alloc_table(Table::new());

        let rng = if config.deterministic {
            StdRng::seed_from_u64(0)
        } else {
            StdRng::from_entropy()
        };

        LuaVM {
            heap,
            globals,
            registry,
            string_meta: None,
            state: ThreadState::new(),
            parked: HashMap::new(),
            modules: HashMap::new(),
            config,
            kill_flag: Arc::new(AtomicBool::new(false)),
            nesting: 0,
            call_depth: 0,
            rng,
            pinned: HashMap::new(),
            output: Box::new(std::io::stdout()),
        }
    }

    /// Install the standard library into the globals
    pub fn open_libs(&mut self) -> Result<()> {
        crate::stdlib::open_libs(self)
    }

    /// Configuration in effect
    pub fn config(&self) -> &VMConfig {
        &self.config
    }

    /// Handle of the globals table
    pub fn globals(&self) -> TableHandle {
        self.globals
    }

    /// Shared kill flag; setting it aborts the running script, which clears
    /// the flag again so later calls run normally
    pub fn kill_flag(&self) -> Arc<AtomicBool> {
        self.kill_flag.clone()
    }

    /// Replace the kill flag
    pub fn set_kill_flag(&mut self, flag: Arc<AtomicBool>) {
        self.kill_flag = flag;
    }

    /// Redirect `print` output
    pub fn set_output(&mut self, output: Box<dyn Write>) {
        self.output = output;
    }

    /// Create a closure for a loaded chunk's main function.
    ///
    /// The closure is pinned so it survives collections until `unpin`.
    /// Package files of the chunk become available to `require`.
    pub fn instantiate(&mut self, chunk: &Chunk) -> Result<Value> {
        for (name, proto) in &chunk.modules {
            self.modules.insert(name.clone(), proto.clone());
        }
        let f = Value::Function(self.load_closure(chunk.main.clone()));
        self.pin(&f);
        debug!(
            sha1 = %chunk.sha1,
            source = %chunk.main.source,
            "chunk instantiated"
        );
        Ok(f)
    }

    /// Closure over a top-level prototype; its upvalues start closed and nil
    pub(crate) fn load_closure(&mut self, proto: Rc<FunctionProto>) -> FunctionHandle {
        let upvalues = (0..proto.upvalue_count)
            .map(|_| self.heap.alloc_upvalue(UpvalueCell::Closed(Value::Nil)))
            .collect();
        self.heap
            .alloc_function(FunctionObject::Lua(Closure { proto, upvalues }))
    }

    /// Call a function to completion
    pub fn call(&mut self, f: &Value, args: Vec<Value>) -> Result<Vec<Value>> {
        if self.nesting == 0 {
            self.state.instructions = 0;
        }
        self.call_value(f, args)
    }

    /// Call a function, catching faults the way `pcall` does.
    ///
    /// Limit faults are still returned as errors.
    pub fn pcall(&mut self, f: &Value, args: Vec<Value>) -> Result<(bool, Vec<Value>)> {
        match self.call(f, args) {
            Ok(results) => Ok((true, results)),
            Err(err) if err.is_catchable() => Ok((false, vec![err.into_value()])),
            Err(err) => Err(err),
        }
    }

    /// Read a global variable
    pub fn get_global(&self, name: &str) -> Result<Value> {
        Ok(self.heap.get_table(self.globals)?.get(&Value::from(name)))
    }

    /// Assign a global variable
    pub fn set_global(&mut self, name: &str, value: Value) -> Result<()> {
        self.heap.table_set(self.globals, Value::from(name), value)
    }

    /// Wrap a host callable as a function value
    pub fn create_function(
        &mut self,
        name: &str,
        f: impl Fn(&mut ExecutionContext<'_>) -> Result<Vec<Value>> + 'static,
    ) -> Value {
        let native = NativeFunction::host(name, f);
        Value::Function(self.heap.alloc_function(FunctionObject::Native(native)))
    }

    /// Expose a host callable as a global function
    pub fn register_function(
        &mut self,
        name: &str,
        f: impl Fn(&mut ExecutionContext<'_>) -> Result<Vec<Value>> + 'static,
    ) -> Result<()> {
        let value = self.create_function(name, f);
        self.set_global(name, value)
    }

    /// Create an empty table
    pub fn create_table(&mut self) -> Value {
        Value::Table(self.heap.alloc_table(Table::new()))
    }

    fn expect_table(value: &Value) -> Result<TableHandle> {
        value.as_table().ok_or_else(|| {
            LuaError::type_error(format!("attempt to index a {} value", value.type_name()))
        })
    }

    /// Raw read of `table[key]`
    pub fn table_get(&self, table: &Value, key: &Value) -> Result<Value> {
        let handle = Self::expect_table(table)?;
        Ok(self.heap.get_table(handle)?.get(key))
    }

    /// Raw write of `table[key] = value`
    pub fn table_set(&mut self, table: &Value, key: Value, value: Value) -> Result<()> {
        let handle = Self::expect_table(table)?;
        self.heap.table_set(handle, key, value)
    }

    /// Wrap a host value as userdata
    pub fn create_userdata<T: Any>(&mut self, data: T) -> Value {
        Value::UserData(self.heap.alloc_userdata(Box::new(data)))
    }

    /// Borrow the payload of a userdata value
    pub fn userdata_ref<T: Any>(&self, value: &Value) -> Option<&T> {
        match value {
            Value::UserData(h) => self.heap.get_userdata(*h).ok()?.data.downcast_ref::<T>(),
            _ => None,
        }
    }

    /// Set the metatable of a table or userdata
    pub fn set_metatable(&mut self, value: &Value, metatable: Option<TableHandle>) -> Result<()> {
        match value {
            Value::Table(h) => self.heap.get_table_mut(*h)?.metatable = metatable,
            Value::UserData(h) => self.heap.get_userdata_mut(*h)?.metatable = metatable,
            other => {
                return Err(LuaError::type_error(format!(
                    "cannot set the metatable of a {} value",
                    other.type_name()
                )))
            }
        }
        Ok(())
    }

    /// Keep a value alive across collections until a matching `unpin`
    pub fn pin(&mut self, value: &Value) {
        *self.pinned.entry(value.clone()).or_insert(0) += 1;
    }

    /// Release one pin of a value
    pub fn unpin(&mut self, value: &Value) {
        if let Some(count) = self.pinned.get_mut(value) {
            *count -= 1;
            if *count == 0 {
                self.pinned.remove(value);
            }
        }
    }

    /// Run a full collection now, returning the number of objects freed.
    ///
    /// Does nothing while native code holds values outside the stack.
    pub fn collect_garbage(&mut self) -> usize {
        if !self.can_collect() {
            return 0;
        }
        let roots = self.gc_roots();
        self.heap.collect(roots)
    }

    /// Heap statistics
    pub fn memory_stats(&self) -> MemoryStats {
        self.heap.stats()
    }

    /// Estimated bytes in use
    pub fn memory_usage(&self) -> usize {
        self.heap.allocated()
    }

    /// Collections are safe only when every live value is reachable from a root
    pub(crate) fn can_collect(&self) -> bool {
        self.nesting <= 1 && self.call_depth <= 1
    }

    /// Collect when the heap asks for it and enforce the memory limit
    pub(crate) fn check_memory(&mut self) -> Result<()> {
        let limit = self.config.limits.memory_limit;
        let over = limit > 0 && self.heap.allocated() > limit;
        if (over || self.heap.should_collect()) && self.can_collect() {
            self.collect_garbage();
        }
        if limit > 0 && self.heap.allocated() > limit {
            tracing::warn!(
                used = self.heap.allocated(),
                limit,
                "memory limit exceeded"
            );
            return Err(LuaError::MemoryLimit);
        }
        Ok(())
    }

    pub(crate) fn check_kill_flag(&self) -> Result<()> {
        if self.kill_flag.swap(false, Ordering::Relaxed) {
            tracing::warn!("script killed");
            return Err(LuaError::Killed);
        }
        Ok(())
    }

    fn gc_roots(&self) -> Vec<Root> {
        let mut roots = vec![
            Root::Value(Value::Table(self.globals)),
            Root::Value(Value::Table(self.registry)),
        ];
        if let Some(meta) = self.string_meta {
            roots.push(Root::Value(Value::Table(meta)));
        }

        for state in std::iter::once(&self.state).chain(self.parked.values()) {
            roots.extend(state.stack.iter().cloned().map(Root::Value));
            for frame in &state.frames {
                roots.push(Root::Value(Value::Function(frame.closure)));
                roots.extend(frame.varargs.iter().cloned().map(Root::Value));
                if let Some(handler) = frame.protected.as_ref().and_then(|p| p.handler.clone()) {
                    roots.push(Root::Value(handler));
                }
            }
            roots.extend(state.open_upvalues.values().copied().map(Root::Upvalue));
        }

        roots.extend(self.pinned.keys().cloned().map(Root::Value));
        roots
    }

    /// `chunk:line: ` of the Lua frame `level` levels up, or empty
    pub(crate) fn where_(&self, level: usize) -> String {
        if level == 0 {
            return String::new();
        }
        let frames = &self.state.frames;
        frames
            .len()
            .checked_sub(level)
            .and_then(|i| frames.get(i))
            .map(|frame| format!("{} ", frame.current_location()))
            .unwrap_or_default()
    }

    /// Read through an upvalue cell
    pub(crate) fn upvalue_get(&self, handle: UpvalueHandle) -> Result<Value> {
        match self.heap.get_upvalue(handle)? {
            UpvalueCell::Closed(value) => Ok(value.clone()),
            UpvalueCell::Open { thread, index } => {
                if *thread == self.state.id {
                    Ok(self.state.get(*index))
                } else {
                    Ok(self
                        .parked
                        .get(thread)
                        .map(|t| t.get(*index))
                        .unwrap_or(Value::Nil))
                }
            }
        }
    }

    /// Write through an upvalue cell
    pub(crate) fn upvalue_set(&mut self, handle: UpvalueHandle, value: Value) -> Result<()> {
        match self.heap.get_upvalue_mut(handle)? {
            UpvalueCell::Closed(slot) => *slot = value,
            UpvalueCell::Open { thread, index } => {
                let (thread, index) = (*thread, *index);
                if thread == self.state.id {
                    self.state.set(index, value);
                } else if let Some(t) = self.parked.get_mut(&thread) {
                    t.set(index, value);
                }
            }
        }
        Ok(())
    }

    /// Open cell for stack slot `index`, shared with earlier captures
    pub(crate) fn find_upvalue(&mut self, index: usize) -> UpvalueHandle {
        if let Some(handle) = self.state.open_upvalues.get(&index) {
            return *handle;
        }
        let handle = self.heap.alloc_upvalue(UpvalueCell::Open {
            thread: self.state.id,
            index,
        });
        self.state.open_upvalues.insert(index, handle);
        handle
    }

    /// Close every open cell at or above stack slot `level`
    pub(crate) fn close_upvalues(&mut self, level: usize) -> Result<()> {
        let closing = self.state.open_upvalues.split_off(&level);
        for (index, handle) in closing {
            let value = self.state.get(index);
            *self.heap.get_upvalue_mut(handle)? = UpvalueCell::Closed(value);
        }
        Ok(())
    }

    /// Park a new execution of `f(args...)`; it starts on the first `resume`
    pub fn spawn(&mut self, f: &Value, args: Vec<Value>) -> Result<Uuid> {
        let mut thread = ThreadState::new();
        thread.stack.push(f.clone());
        thread.stack.extend(args);
        let id = thread.id;
        self.parked.insert(id, thread);
        debug!(execution = %id, "execution spawned");
        Ok(id)
    }

    /// Whether `id` is a parked execution
    pub fn is_parked(&self, id: Uuid) -> bool {
        self.parked.contains_key(&id)
    }

    /// Run a parked execution for at most `budget` instructions
    pub fn resume(&mut self, id: Uuid, budget: u64) -> Result<Slice> {
        if self.nesting != 0 {
            return Err(LuaError::host_fault(
                "cannot resume an execution from inside a running call",
            ));
        }
        let thread = self
            .parked
            .remove(&id)
            .ok_or_else(|| LuaError::host_fault(format!("unknown execution {}", id)))?;

        let host = std::mem::replace(&mut self.state, thread);
        let host_id = host.id;
        self.parked.insert(host_id, host);

        let outcome = self.run_slice(budget.max(1));
        if !matches!(outcome, Ok(Slice::Suspended)) {
            self.state.frames.clear();
            self.close_upvalues(0)?;
        }

        let host = self.parked.remove(&host_id).unwrap_or_else(ThreadState::new);
        let thread = std::mem::replace(&mut self.state, host);
        match &outcome {
            Ok(Slice::Suspended) => {
                self.parked.insert(id, thread);
            }
            Ok(Slice::Complete(_)) => debug!(execution = %id, "execution complete"),
            Err(err) => debug!(execution = %id, error = %err, "execution failed"),
        }
        outcome
    }

    /// Drop a parked execution, closing its upvalues
    pub fn cancel(&mut self, id: Uuid) -> bool {
        let Some(thread) = self.parked.remove(&id) else {
            return false;
        };
        for (index, handle) in &thread.open_upvalues {
            if let Ok(cell) = self.heap.get_upvalue_mut(*handle) {
                *cell = UpvalueCell::Closed(thread.get(*index));
            }
        }
        debug!(execution = %id, "execution cancelled");
        true
    }
}

impl Drop for LuaVM {
    fn drop(&mut self) {
        let _ = self.output.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vm() -> LuaVM {
        let mut vm = LuaVM::new(VMConfig::default());
        vm.open_libs().unwrap();
        vm
    }

    #[test]
    fn test_globals_round_trip() {
        let mut vm = vm();
        vm.set_global("answer", Value::Number(42.0)).unwrap();
        assert_eq!(vm.get_global("answer").unwrap(), Value::Number(42.0));
        assert_eq!(vm.get_global("missing").unwrap(), Value::Nil);
    }

    #[test]
    fn test_native_call_and_argument_errors() {
        let mut vm = vm();
        vm.register_function("double", |ctx| {
            let n = ctx.check_number(1)?;
            Ok(vec![Value::Number(n * 2.0)])
        })
        .unwrap();

        let f = vm.get_global("double").unwrap();
        assert_eq!(vm.call(&f, vec![Value::from("21")]).unwrap(), vec![Value::Number(42.0)]);

        let err = vm.call(&f, vec![]).unwrap_err();
        assert_eq!(
            err.to_string(),
            "bad argument #1 to 'double' (number expected, got no value)"
        );

        let (ok, results) = vm.pcall(&f, vec![Value::Boolean(true)]).unwrap();
        assert!(!ok);
        assert_eq!(
            results,
            vec![Value::from("bad argument #1 to 'double' (number expected, got boolean)")]
        );
    }

    #[test]
    fn test_pinned_values_survive_collection() {
        let mut vm = vm();
        let kept = vm.create_table();
        let dropped = vm.create_table();
        vm.pin(&kept);
        vm.collect_garbage();
        assert!(vm.table_get(&kept, &Value::from("x")).is_ok());
        assert!(vm.table_get(&dropped, &Value::from("x")).is_err());

        vm.unpin(&kept);
        vm.collect_garbage();
        assert!(vm.table_get(&kept, &Value::from("x")).is_err());
    }

    #[test]
    fn test_userdata_payload() {
        let mut vm = vm();
        let ud = vm.create_userdata(17u32);
        assert_eq!(vm.userdata_ref::<u32>(&ud), Some(&17));
        assert_eq!(vm.userdata_ref::<String>(&ud), None);
        assert_eq!(ud.type_name(), "userdata");
    }

    #[test]
    fn test_resume_unknown_execution() {
        let mut vm = vm();
        assert!(vm.resume(Uuid::new_v4(), 10).is_err());
        assert!(!vm.cancel(Uuid::new_v4()));
    }
}
