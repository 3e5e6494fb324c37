//! Call and return mechanics, protected calls and fault unwinding

use super::exec::LoopExit;
use super::frame::{CallFrame, ProtectedCall, ReturnTarget};
use super::{ExecutionContext, LuaVM, Slice};
use crate::error::{LuaError, Result};
use crate::function::{FunctionObject, FunctionProto, NativeFn, NativeFunction, NativeKind};
use crate::metamethod::{MetaMethod, MAX_TAG_LOOP};
use crate::value::{FunctionHandle, Value};
use std::rc::Rc;
use tracing::{debug, warn};

/// What a function value resolves to when called
pub(crate) enum Callee {
    Lua(FunctionHandle, Rc<FunctionProto>),
    Native(NativeFunction),
}

fn no_frame() -> LuaError {
    LuaError::reference_error("no active call frame")
}

impl LuaVM {
    pub(crate) fn callee_of(&self, handle: FunctionHandle) -> Result<Callee> {
        match self.heap.get_function(handle)? {
            FunctionObject::Lua(closure) => Ok(Callee::Lua(handle, closure.proto.clone())),
            FunctionObject::Native(native) => Ok(Callee::Native(native.clone())),
        }
    }

    /// Push an activation record for `proto` whose function sits at `func`
    /// and whose `nargs` arguments follow it
    pub(crate) fn push_lua_frame(
        &mut self,
        closure: FunctionHandle,
        proto: Rc<FunctionProto>,
        func: usize,
        nargs: usize,
        return_to: ReturnTarget,
        protected: Option<ProtectedCall>,
    ) -> Result<()> {
        if self.state.frames.len() >= self.config.limits.call_stack_limit {
            return Err(LuaError::stack_overflow("stack overflow"));
        }

        let base = func + 1;
        let params = proto.param_count as usize;
        let varargs = if proto.is_vararg && nargs > params {
            self.state.slice(base + params, base + nargs)
        } else {
            Vec::new()
        };

        let size = proto.max_stack_size.max(proto.param_count) as usize;
        self.state.ensure(base + size.max(nargs));
        for slot in &mut self.state.stack[base + nargs.min(params)..base + size.max(nargs)] {
            *slot = Value::Nil;
        }
        self.state.stack.truncate(base + size);

        self.state.frames.push(CallFrame {
            closure,
            proto,
            pc: 0,
            base,
            top: base,
            varargs,
            return_to,
            protected,
        });
        Ok(())
    }

    /// Replace a non-function at `func` by its `__call` handler, shifting
    /// the arguments up; returns the new argument count
    fn resolve_call_metamethod(&mut self, func: usize, mut nargs: usize) -> Result<usize> {
        for _ in 0..MAX_TAG_LOOP {
            let f = self.state.get(func);
            if f.is_function() {
                return Ok(nargs);
            }
            let handler = self.metamethod(&f, MetaMethod::Call);
            if handler.is_nil() {
                return Err(LuaError::type_error(format!(
                    "attempt to call a {} value",
                    f.type_name()
                )));
            }
            self.state.ensure(func + nargs + 2);
            for i in (func..=func + nargs).rev() {
                self.state.stack[i + 1] = self.state.stack[i].clone();
            }
            self.state.stack[func] = handler;
            nargs += 1;
        }
        Err(LuaError::type_error("'__call' chain too long"))
    }

    fn function_at(&self, func: usize) -> Result<FunctionHandle> {
        match self.state.get(func) {
            Value::Function(h) => Ok(h),
            other => Err(LuaError::type_error(format!(
                "attempt to call a {} value",
                other.type_name()
            ))),
        }
    }

    /// CALL / TFORLOOP: call the value at `func` with `nargs` arguments.
    ///
    /// Lua callees get a frame and run on the same loop; natives run now and
    /// their results are delivered immediately.
    pub(crate) fn call_at(
        &mut self,
        func: usize,
        nargs: usize,
        target: ReturnTarget,
    ) -> Result<Option<Vec<Value>>> {
        let nargs = self.resolve_call_metamethod(func, nargs)?;
        match self.callee_of(self.function_at(func)?)? {
            Callee::Lua(handle, proto) => {
                self.push_lua_frame(handle, proto, func, nargs, target, None)?;
                Ok(None)
            }
            Callee::Native(native) => match &native.kind {
                NativeKind::Host(f) => {
                    let args = self.state.slice(func + 1, func + 1 + nargs);
                    let results = self.call_native(&native.name, f, args, true)?;
                    Ok(self.deliver(results, target))
                }
                NativeKind::Pcall => self.call_protected(func, nargs, target, false),
                NativeKind::Xpcall => self.call_protected(func, nargs, target, true),
            },
        }
    }

    fn call_native(
        &mut self,
        name: &str,
        f: &NativeFn,
        args: Vec<Value>,
        from_bytecode: bool,
    ) -> Result<Vec<Value>> {
        let mut ctx = ExecutionContext {
            vm: self,
            args,
            name,
            from_bytecode,
        };
        f(&mut ctx)
    }

    /// `pcall(f, ...)` / `xpcall(f, handler)` issued from bytecode.
    ///
    /// A Lua callee runs on the current loop under a protected frame; other
    /// callees run through a nested call.
    fn call_protected(
        &mut self,
        func: usize,
        nargs: usize,
        target: ReturnTarget,
        with_handler: bool,
    ) -> Result<Option<Vec<Value>>> {
        let name = if with_handler { "xpcall" } else { "pcall" };
        if nargs == 0 {
            return Err(LuaError::host_fault(format!(
                "bad argument #1 to '{}' (value expected)",
                name
            )));
        }
        let (handler, call_nargs) = if with_handler {
            if nargs < 2 {
                return Err(LuaError::host_fault(
                    "bad argument #2 to 'xpcall' (value expected)",
                ));
            }
            (Some(self.state.get(func + 2)), 0)
        } else {
            (None, nargs - 1)
        };

        // slide the callee and its arguments over the pcall slot
        for i in 0..=call_nargs {
            let v = self.state.get(func + 1 + i);
            self.state.set(func + i, v);
        }
        let callee = self.state.get(func);

        if let Value::Function(h) = &callee {
            if let Callee::Lua(handle, proto) = self.callee_of(*h)? {
                let marker = ProtectedCall {
                    handler: handler.clone(),
                };
                return match self.push_lua_frame(
                    handle,
                    proto,
                    func,
                    call_nargs,
                    target.clone(),
                    Some(marker),
                ) {
                    Ok(()) => Ok(None),
                    Err(err) => {
                        let results = self.protected_failure(err, handler)?;
                        Ok(self.deliver(results, target))
                    }
                };
            }
        }

        let args = self.state.slice(func + 1, func + 1 + call_nargs);
        let outcome = self.call_value(&callee, args);
        let results = self.protected_outcome(outcome, handler)?;
        Ok(self.deliver(results, target))
    }

    fn protected_outcome(
        &mut self,
        outcome: Result<Vec<Value>>,
        handler: Option<Value>,
    ) -> Result<Vec<Value>> {
        match outcome {
            Ok(mut results) => {
                results.insert(0, Value::Boolean(true));
                Ok(results)
            }
            Err(err) => self.protected_failure(err, handler),
        }
    }

    fn protected_failure(&mut self, err: LuaError, handler: Option<Value>) -> Result<Vec<Value>> {
        if !err.is_catchable() {
            return Err(err);
        }
        let value = self.apply_handler(err.into_value(), handler)?;
        Ok(vec![Value::Boolean(false), value])
    }

    /// Run the `xpcall` message handler over an error object
    fn apply_handler(&mut self, value: Value, handler: Option<Value>) -> Result<Value> {
        let Some(handler) = handler else {
            return Ok(value);
        };
        match self.call_value(&handler, vec![value]) {
            Ok(results) => Ok(results.into_iter().next().unwrap_or(Value::Nil)),
            Err(err) if err.is_catchable() => Ok(Value::from("error in error handling")),
            Err(err) => Err(err),
        }
    }

    /// TAILCALL: the callee takes over the current frame's slot and return target
    pub(crate) fn tail_call(&mut self, func: usize, nargs: usize) -> Result<Option<Vec<Value>>> {
        let nargs = self.resolve_call_metamethod(func, nargs)?;
        match self.callee_of(self.function_at(func)?)? {
            Callee::Lua(handle, proto) => {
                let frame = self.state.frames.pop().ok_or_else(no_frame)?;
                self.close_upvalues(frame.base)?;
                let dest = frame.base - 1;
                for i in 0..=nargs {
                    let v = self.state.get(func + i);
                    self.state.set(dest + i, v);
                }
                self.state.stack.truncate(dest + nargs + 1);
                self.push_lua_frame(
                    handle,
                    proto,
                    dest,
                    nargs,
                    frame.return_to,
                    frame.protected,
                )?;
                Ok(None)
            }
            Callee::Native(native) => {
                let args = self.state.slice(func + 1, func + 1 + nargs);
                let results = match &native.kind {
                    NativeKind::Host(f) => self.call_native(&native.name, f, args, true)?,
                    _ => {
                        let callee = self.state.get(func);
                        self.call_value(&callee, args)?
                    }
                };
                self.return_from_frame(results)
            }
        }
    }

    /// RETURN: pop the top frame and hand `results` to its return target
    pub(crate) fn return_from_frame(&mut self, mut results: Vec<Value>) -> Result<Option<Vec<Value>>> {
        let frame = self.state.frames.pop().ok_or_else(no_frame)?;
        self.close_upvalues(frame.base)?;
        self.state.stack.truncate(frame.base - 1);
        if frame.protected.is_some() {
            results.insert(0, Value::Boolean(true));
        }
        Ok(self.deliver(results, frame.return_to))
    }

    /// Place results per `target`; `Host` targets hand them back instead
    pub(crate) fn deliver(&mut self, results: Vec<Value>, target: ReturnTarget) -> Option<Vec<Value>> {
        match target {
            ReturnTarget::Host => Some(results),
            ReturnTarget::Caller { dest, wanted } => {
                self.place_results(dest, results, wanted);
                None
            }
            ReturnTarget::Iterator {
                dest,
                wanted,
                control,
            } => {
                let first = results.first().cloned().unwrap_or(Value::Nil);
                self.place_results(dest, results, Some(wanted));
                if first.is_nil() {
                    // leave the loop by skipping the back jump
                    if let Some(frame) = self.state.frames.last_mut() {
                        frame.pc += 1;
                    }
                } else {
                    self.state.set(control, first);
                }
                None
            }
        }
    }

    fn place_results(&mut self, dest: usize, mut results: Vec<Value>, wanted: Option<usize>) {
        let count = wanted.unwrap_or(results.len());
        results.resize(count, Value::Nil);
        self.state.ensure(dest + count);
        for (i, v) in results.into_iter().enumerate() {
            self.state.stack[dest + i] = v;
        }

        let needed = match self.state.frames.last_mut() {
            Some(frame) => {
                if wanted.is_none() {
                    frame.top = dest + count;
                }
                frame.base + frame.frame_size()
            }
            None => 0,
        };
        self.state.ensure(needed);
    }

    /// Call any value from Rust and run it to completion
    pub(crate) fn call_value(&mut self, f: &Value, args: Vec<Value>) -> Result<Vec<Value>> {
        if self.call_depth >= self.config.limits.native_call_limit {
            return Err(LuaError::stack_overflow("C stack overflow"));
        }
        self.call_depth += 1;
        let result = self.call_value_inner(f, args);
        self.call_depth -= 1;
        result
    }

    fn call_value_inner(&mut self, f: &Value, args: Vec<Value>) -> Result<Vec<Value>> {
        let handle = match f {
            Value::Function(h) => *h,
            other => {
                let handler = self.metamethod(other, MetaMethod::Call);
                if handler.is_nil() {
                    return Err(LuaError::type_error(format!(
                        "attempt to call a {} value",
                        other.type_name()
                    )));
                }
                let mut full = Vec::with_capacity(args.len() + 1);
                full.push(other.clone());
                full.extend(args);
                return self.call_value_inner(&handler, full);
            }
        };

        match self.callee_of(handle)? {
            Callee::Lua(handle, proto) => {
                let func = self.state.stack.len();
                let nargs = args.len();
                self.state.stack.push(f.clone());
                self.state.stack.extend(args);
                if let Err(err) =
                    self.push_lua_frame(handle, proto, func, nargs, ReturnTarget::Host, None)
                {
                    self.state.stack.truncate(func);
                    return Err(err);
                }
                let entry = self.state.frames.len() - 1;
                match self.run_loop(entry, None)? {
                    LoopExit::Returned(results) => Ok(results),
                    LoopExit::Suspended => Err(LuaError::reference_error(
                        "nested call suspended without a budget",
                    )),
                }
            }
            Callee::Native(native) => match &native.kind {
                NativeKind::Host(nf) => self.call_native(&native.name, nf, args, false),
                NativeKind::Pcall => {
                    let mut args = args.into_iter();
                    let callee = args.next().ok_or_else(|| {
                        LuaError::host_fault("bad argument #1 to 'pcall' (value expected)")
                    })?;
                    let outcome = self.call_value(&callee, args.collect());
                    self.protected_outcome(outcome, None)
                }
                NativeKind::Xpcall => {
                    if args.len() < 2 {
                        return Err(LuaError::host_fault(
                            "bad argument #2 to 'xpcall' (value expected)",
                        ));
                    }
                    let outcome = self.call_value(&args[0], Vec::new());
                    self.protected_outcome(outcome, Some(args[1].clone()))
                }
            },
        }
    }

    /// Route a located fault to the nearest protected frame at or above
    /// `entry_depth`; without one, discard the loop's frames and fail
    pub(crate) fn unwind(&mut self, err: LuaError, entry_depth: usize) -> Result<Option<Vec<Value>>> {
        if err.is_catchable() {
            let boundary = (entry_depth..self.state.frames.len())
                .rev()
                .find(|&i| self.state.frames[i].protected.is_some());

            if let Some(index) = boundary {
                let frame = &self.state.frames[index];
                let func = frame.base - 1;
                let target = frame.return_to.clone();
                let handler = frame.protected.as_ref().and_then(|p| p.handler.clone());
                debug!(depth = index, error = %err, "fault caught by protected call");

                self.close_upvalues(func)?;
                self.state.frames.truncate(index);
                self.state.stack.truncate(func);

                return match self.apply_handler(err.into_value(), handler) {
                    Ok(value) => Ok(self.deliver(vec![Value::Boolean(false), value], target)),
                    Err(err) => self.unwind(err, entry_depth),
                };
            }
        }

        if let Some(frame) = self.state.frames.get(entry_depth) {
            let func = frame.base - 1;
            self.close_upvalues(func)?;
            self.state.frames.truncate(entry_depth);
            self.state.stack.truncate(func);
        }
        if err.is_catchable() {
            debug!(error = %err, "uncaught fault");
        } else {
            warn!(error = %err, "execution aborted");
        }
        Err(err)
    }

    /// Start or continue the current execution with an instruction budget
    pub(crate) fn run_slice(&mut self, budget: u64) -> Result<Slice> {
        if self.state.frames.is_empty() {
            if self.state.stack.is_empty() {
                return Err(LuaError::host_fault("execution already finished"));
            }
            let f = self.state.get(0);
            let args = self.state.slice(1, self.state.stack.len());
            self.state.instructions = 0;

            let lua = match &f {
                Value::Function(h) => match self.callee_of(*h)? {
                    Callee::Lua(handle, proto) => Some((handle, proto)),
                    Callee::Native(_) => None,
                },
                _ => None,
            };
            match lua {
                Some((handle, proto)) => {
                    let nargs = args.len();
                    self.push_lua_frame(handle, proto, 0, nargs, ReturnTarget::Host, None)?;
                }
                None => {
                    let results = self.call_value(&f, args)?;
                    self.state.stack.clear();
                    return Ok(Slice::Complete(results));
                }
            }
        }

        match self.run_loop(0, Some(budget))? {
            LoopExit::Returned(results) => Ok(Slice::Complete(results)),
            LoopExit::Suspended => Ok(Slice::Suspended),
        }
    }
}
