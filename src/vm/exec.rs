//! The fetch-decode-execute loop

use super::frame::ReturnTarget;
use super::LuaVM;
use crate::bytecode::opcode::{constant_index, is_constant};
use crate::bytecode::{Instruction, OpCode, LFIELDS_PER_FLUSH};
use crate::error::{LuaError, Result};
use crate::function::{Closure, FunctionObject, FunctionProto};
use crate::metamethod::ArithOp;
use crate::table::Table;
use crate::value::{UpvalueHandle, Value};
use std::rc::Rc;
use tracing::{trace, warn};

/// How an interpreter loop ended
#[derive(Debug)]
pub(crate) enum LoopExit {
    /// The loop's entry frame returned
    Returned(Vec<Value>),

    /// The instruction budget ran out; frames are left in place
    Suspended,
}

/// Instructions between kill flag and memory checks
const CHECK_INTERVAL: u64 = 1024;

/// Decode the "floating point byte" table size hints of NEWTABLE
fn fb2int(x: u32) -> usize {
    let e = (x >> 3) & 31;
    if e == 0 {
        x as usize
    } else {
        (((x & 7) + 8) as usize) << (e - 1)
    }
}

fn for_number(value: Value, what: &str) -> Result<f64> {
    value
        .to_number()
        .ok_or_else(|| LuaError::type_error(format!("'for' {} must be a number", what)))
}

impl LuaVM {
    /// Run frames until the frame at `entry_depth` returns.
    ///
    /// With a budget the loop may stop early with `LoopExit::Suspended`.
    pub(crate) fn run_loop(&mut self, entry_depth: usize, budget: Option<u64>) -> Result<LoopExit> {
        self.nesting += 1;
        let result = self.run_frames(entry_depth, budget);
        self.nesting -= 1;
        result
    }

    fn run_frames(&mut self, entry_depth: usize, mut budget: Option<u64>) -> Result<LoopExit> {
        loop {
            if let Some(remaining) = budget.as_mut() {
                if *remaining == 0 {
                    return Ok(LoopExit::Suspended);
                }
                *remaining -= 1;
            }

            let outcome = match self.check_limits() {
                Ok(()) => self.step(),
                Err(err) => Err(err),
            };
            match outcome {
                Ok(None) => {}
                Ok(Some(results)) => return Ok(LoopExit::Returned(results)),
                Err(err) => {
                    let err = match self.state.frames.last() {
                        Some(frame) => err.located(|| frame.current_location()),
                        None => err,
                    };
                    if let Some(results) = self.unwind(err, entry_depth)? {
                        return Ok(LoopExit::Returned(results));
                    }
                }
            }
        }
    }

    fn check_limits(&mut self) -> Result<()> {
        self.state.instructions += 1;
        let count = self.state.instructions;

        let limit = self.config.limits.instruction_limit;
        if limit > 0 && count > limit {
            warn!(limit, "instruction limit exceeded");
            return Err(LuaError::InstructionLimit);
        }
        if count % CHECK_INTERVAL == 0 {
            self.check_kill_flag()?;
            self.check_memory()?;
        }
        Ok(())
    }

    fn register(&self, base: usize, index: u32) -> Value {
        self.state.get(base + index as usize)
    }

    fn set_register(&mut self, base: usize, index: u32, value: Value) {
        self.state.set(base + index as usize, value);
    }

    fn constant(proto: &FunctionProto, index: usize) -> Value {
        proto.constants.get(index).cloned().unwrap_or(Value::Nil)
    }

    fn rk(&self, proto: &FunctionProto, base: usize, operand: u32) -> Value {
        if is_constant(operand) {
            Self::constant(proto, constant_index(operand))
        } else {
            self.register(base, operand)
        }
    }

    fn jump(&mut self, offset: i32) {
        if let Some(frame) = self.state.frames.last_mut() {
            frame.pc = (frame.pc as i64 + offset as i64) as usize;
        }
    }

    fn skip(&mut self) {
        self.jump(1);
    }

    /// Upvalue `index` of the running closure
    fn closure_upvalue(&self, index: u32) -> Result<UpvalueHandle> {
        let frame = self
            .state
            .frames
            .last()
            .ok_or_else(|| LuaError::reference_error("no active call frame"))?;
        match self.heap.get_function(frame.closure)? {
            FunctionObject::Lua(closure) => closure
                .upvalues
                .get(index as usize)
                .copied()
                .ok_or_else(|| LuaError::reference_error("upvalue index out of range")),
            FunctionObject::Native(_) => {
                Err(LuaError::reference_error("native function has no upvalues"))
            }
        }
    }

    /// Execute one instruction of the top frame.
    ///
    /// Returns the results when a frame with a host return target finishes.
    fn step(&mut self) -> Result<Option<Vec<Value>>> {
        let (proto, base, pc, top) = {
            let frame = self
                .state
                .frames
                .last_mut()
                .ok_or_else(|| LuaError::reference_error("no active call frame"))?;
            let pc = frame.pc;
            frame.pc += 1;
            (frame.proto.clone(), frame.base, pc, frame.top)
        };

        let instr = *proto
            .code
            .get(pc)
            .ok_or_else(|| LuaError::reference_error("instruction pointer out of range"))?;
        let op = instr.opcode().ok_or_else(|| {
            LuaError::reference_error(format!("bad opcode {}", instr.opcode_number()))
        })?;
        if self.config.debug {
            trace!(pc, instruction = ?instr, "step");
        }

        let a = instr.a();
        match op {
            OpCode::Move => {
                let v = self.register(base, instr.b());
                self.set_register(base, a, v);
            }
            OpCode::LoadK => {
                let v = Self::constant(&proto, instr.bx() as usize);
                self.set_register(base, a, v);
            }
            OpCode::LoadBool => {
                self.set_register(base, a, Value::Boolean(instr.b() != 0));
                if instr.c() != 0 {
                    self.skip();
                }
            }
            OpCode::LoadNil => {
                for r in a..=instr.b() {
                    self.set_register(base, r, Value::Nil);
                }
            }
            OpCode::GetUpval => {
                let cell = self.closure_upvalue(instr.b())?;
                let v = self.upvalue_get(cell)?;
                self.set_register(base, a, v);
            }
            OpCode::GetGlobal => {
                let globals = Value::Table(self.globals);
                let key = Self::constant(&proto, instr.bx() as usize);
                let v = self.index_value(&globals, &key)?;
                self.set_register(base, a, v);
            }
            OpCode::GetTable => {
                let obj = self.register(base, instr.b());
                let key = self.rk(&proto, base, instr.c());
                let v = self.index_value(&obj, &key)?;
                self.set_register(base, a, v);
            }
            OpCode::SetGlobal => {
                let globals = Value::Table(self.globals);
                let key = Self::constant(&proto, instr.bx() as usize);
                let v = self.register(base, a);
                self.set_index(&globals, key, v)?;
            }
            OpCode::SetUpval => {
                let cell = self.closure_upvalue(instr.b())?;
                let v = self.register(base, a);
                self.upvalue_set(cell, v)?;
            }
            OpCode::SetTable => {
                let obj = self.register(base, a);
                let key = self.rk(&proto, base, instr.b());
                let v = self.rk(&proto, base, instr.c());
                self.set_index(&obj, key, v)?;
            }
            OpCode::NewTable => {
                let table = Table::with_capacity(fb2int(instr.b()), fb2int(instr.c()));
                let handle = self.heap.alloc_table(table);
                self.set_register(base, a, Value::Table(handle));
            }
            OpCode::Self_ => {
                let obj = self.register(base, instr.b());
                let key = self.rk(&proto, base, instr.c());
                self.set_register(base, a + 1, obj.clone());
                let method = self.index_value(&obj, &key)?;
                self.set_register(base, a, method);
            }
            OpCode::Add
            | OpCode::Sub
            | OpCode::Mul
            | OpCode::Div
            | OpCode::Mod
            | OpCode::Pow => {
                let arith = match op {
                    OpCode::Add => ArithOp::Add,
                    OpCode::Sub => ArithOp::Sub,
                    OpCode::Mul => ArithOp::Mul,
                    OpCode::Div => ArithOp::Div,
                    OpCode::Mod => ArithOp::Mod,
                    _ => ArithOp::Pow,
                };
                let lhs = self.rk(&proto, base, instr.b());
                let rhs = self.rk(&proto, base, instr.c());
                let v = match (&lhs, &rhs) {
                    (Value::Number(x), Value::Number(y)) => Value::Number(arith.apply(*x, *y)),
                    _ => self.arith(arith, &lhs, &rhs)?,
                };
                self.set_register(base, a, v);
            }
            OpCode::Unm => {
                let operand = self.register(base, instr.b());
                let v = self.arith(ArithOp::Unm, &operand, &operand)?;
                self.set_register(base, a, v);
            }
            OpCode::Not => {
                let v = self.register(base, instr.b());
                self.set_register(base, a, Value::Boolean(!v.is_truthy()));
            }
            OpCode::Len => {
                let operand = self.register(base, instr.b());
                let v = self.length(&operand)?;
                self.set_register(base, a, v);
            }
            OpCode::Concat => {
                let start = base + instr.b() as usize;
                let end = base + instr.c() as usize + 1;
                let values = self.state.slice(start, end);
                let v = self.concat(values)?;
                self.set_register(base, a, v);
            }
            OpCode::Jmp => self.jump(instr.sbx()),
            OpCode::Eq | OpCode::Lt | OpCode::Le => {
                let lhs = self.rk(&proto, base, instr.b());
                let rhs = self.rk(&proto, base, instr.c());
                let result = match op {
                    OpCode::Eq => self.equals(&lhs, &rhs)?,
                    OpCode::Lt => self.less_than(&lhs, &rhs)?,
                    _ => self.less_equal(&lhs, &rhs)?,
                };
                if result != (a != 0) {
                    self.skip();
                }
            }
            OpCode::Test => {
                if self.register(base, a).is_truthy() != (instr.c() != 0) {
                    self.skip();
                }
            }
            OpCode::TestSet => {
                let v = self.register(base, instr.b());
                if v.is_truthy() == (instr.c() != 0) {
                    self.set_register(base, a, v);
                } else {
                    self.skip();
                }
            }
            OpCode::Call => {
                let func = base + a as usize;
                let nargs = match instr.b() {
                    0 => top.saturating_sub(func + 1),
                    b => b as usize - 1,
                };
                let wanted = match instr.c() {
                    0 => None,
                    c => Some(c as usize - 1),
                };
                return self.call_at(func, nargs, ReturnTarget::Caller { dest: func, wanted });
            }
            OpCode::TailCall => {
                let func = base + a as usize;
                let nargs = match instr.b() {
                    0 => top.saturating_sub(func + 1),
                    b => b as usize - 1,
                };
                return self.tail_call(func, nargs);
            }
            OpCode::Return => {
                let start = base + a as usize;
                let end = match instr.b() {
                    0 => top.max(start),
                    b => start + b as usize - 1,
                };
                let results = self.state.slice(start, end);
                return self.return_from_frame(results);
            }
            OpCode::ForLoop => {
                let step = self.register(base, a + 2).to_number().unwrap_or(f64::NAN);
                let index = self.register(base, a).to_number().unwrap_or(f64::NAN) + step;
                let limit = self.register(base, a + 1).to_number().unwrap_or(f64::NAN);
                let continues = if step > 0.0 {
                    index <= limit
                } else {
                    limit <= index
                };
                if continues {
                    self.jump(instr.sbx());
                    self.set_register(base, a, Value::Number(index));
                    self.set_register(base, a + 3, Value::Number(index));
                }
            }
            OpCode::ForPrep => {
                let init = for_number(self.register(base, a), "initial value")?;
                let limit = for_number(self.register(base, a + 1), "limit")?;
                let step = for_number(self.register(base, a + 2), "step")?;
                self.set_register(base, a, Value::Number(init - step));
                self.set_register(base, a + 1, Value::Number(limit));
                self.set_register(base, a + 2, Value::Number(step));
                self.jump(instr.sbx());
            }
            OpCode::TForLoop => {
                let cb = base + a as usize + 3;
                for i in 0..3 {
                    let v = self.state.get(base + a as usize + i);
                    self.state.set(cb + i, v);
                }
                let target = ReturnTarget::Iterator {
                    dest: cb,
                    wanted: instr.c() as usize,
                    control: base + a as usize + 2,
                };
                return self.call_at(cb, 2, target);
            }
            OpCode::SetList => self.set_list(&proto, base, pc, top, instr)?,
            OpCode::Close => self.close_upvalues(base + a as usize)?,
            OpCode::Closure => {
                let child = proto
                    .protos
                    .get(instr.bx() as usize)
                    .cloned()
                    .ok_or_else(|| LuaError::reference_error("prototype index out of range"))?;
                let closure = self.make_closure(&proto, base, pc, child)?;
                self.set_register(base, a, closure);
            }
            OpCode::Vararg => {
                let varargs = self
                    .state
                    .frames
                    .last()
                    .map(|f| f.varargs.clone())
                    .unwrap_or_default();
                let dest = base + a as usize;
                match instr.b() {
                    0 => {
                        let count = varargs.len();
                        for (i, v) in varargs.into_iter().enumerate() {
                            self.state.set(dest + i, v);
                        }
                        if let Some(frame) = self.state.frames.last_mut() {
                            frame.top = dest + count;
                        }
                    }
                    b => {
                        for i in 0..b as usize - 1 {
                            let v = varargs.get(i).cloned().unwrap_or(Value::Nil);
                            self.state.set(dest + i, v);
                        }
                    }
                }
            }
        }
        Ok(None)
    }

    fn set_list(
        &mut self,
        proto: &FunctionProto,
        base: usize,
        pc: usize,
        top: usize,
        instr: Instruction,
    ) -> Result<()> {
        let a = base + instr.a() as usize;
        let count = match instr.b() {
            0 => top.saturating_sub(a + 1),
            b => b as usize,
        };
        let block = match instr.c() {
            0 => {
                // block number is carried by the next word
                self.skip();
                proto.code.get(pc + 1).map(|w| w.raw() as usize).unwrap_or(0)
            }
            c => c as usize,
        };

        let table = match self.state.get(a) {
            Value::Table(h) => h,
            other => {
                return Err(LuaError::type_error(format!(
                    "attempt to index a {} value",
                    other.type_name()
                )))
            }
        };
        let offset = block.saturating_sub(1) * LFIELDS_PER_FLUSH;
        for i in 1..=count {
            let v = self.state.get(a + i);
            self.heap
                .table_set(table, Value::Number((offset + i) as f64), v)?;
        }
        Ok(())
    }

    /// CLOSURE: build a closure, consuming the capture pseudo-instructions
    /// that follow
    fn make_closure(
        &mut self,
        proto: &FunctionProto,
        base: usize,
        pc: usize,
        child: Rc<FunctionProto>,
    ) -> Result<Value> {
        let captures = child.upvalue_count as usize;
        let mut upvalues = Vec::with_capacity(captures);
        for k in 0..captures {
            let word = proto
                .code
                .get(pc + 1 + k)
                .copied()
                .ok_or_else(|| LuaError::reference_error("missing upvalue capture instruction"))?;
            let cell = match word.opcode() {
                Some(OpCode::Move) => self.find_upvalue(base + word.b() as usize),
                Some(OpCode::GetUpval) => self.closure_upvalue(word.b())?,
                _ => return Err(LuaError::reference_error("bad upvalue capture instruction")),
            };
            upvalues.push(cell);
        }
        self.jump(captures as i32);

        let handle = self
            .heap
            .alloc_function(FunctionObject::Lua(Closure { proto: child, upvalues }));
        Ok(Value::Function(handle))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fb2int() {
        assert_eq!(fb2int(0), 0);
        assert_eq!(fb2int(7), 7);
        assert_eq!(fb2int(8), 8);
        // 0x11 = e:2 m:1 -> (1 + 8) << 1
        assert_eq!(fb2int(0x11), 18);
    }
}
