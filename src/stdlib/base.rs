//! Lua Base Library Implementation

use super::LibFn;
use crate::error::{LuaError, Result};
use crate::function::{FunctionObject, NativeFunction, NativeKind};
use crate::metamethod::MetaMethod;
use crate::number;
use crate::table::Table;
use crate::value::{LuaString, Value};
use crate::vm::{ExecutionContext, LuaVM, LOADED_KEY};
use std::io::Write;

/// Registry slot of the `next` function returned by `pairs`
const NEXT_KEY: &str = "next";

/// Registry slot of the iterator returned by `ipairs`
const IPAIRS_ITER_KEY: &str = "ipairs_iter";

/// Largest number of values `unpack` will return
const MAX_UNPACK: i64 = 1 << 20;

/// Initialize the base library
pub fn init_base_lib(vm: &mut LuaVM) -> Result<()> {
    let funcs: &[(&str, LibFn)] = &[
        ("print", lua_print),
        ("assert", lua_assert),
        ("error", lua_error),
        ("type", lua_type),
        ("tostring", lua_tostring),
        ("tonumber", lua_tonumber),
        ("rawget", lua_rawget),
        ("rawset", lua_rawset),
        ("rawequal", lua_rawequal),
        ("setmetatable", lua_setmetatable),
        ("getmetatable", lua_getmetatable),
        ("next", lua_next),
        ("pairs", lua_pairs),
        ("ipairs", lua_ipairs),
        ("select", lua_select),
        ("unpack", lua_unpack),
        ("collectgarbage", lua_collectgarbage),
        ("require", lua_require),
    ];
    for (name, f) in funcs {
        vm.register_function(name, *f)?;
    }

    for (name, kind) in [("pcall", NativeKind::Pcall), ("xpcall", NativeKind::Xpcall)] {
        let native = NativeFunction {
            name: name.into(),
            kind,
        };
        let handle = vm.heap.alloc_function(FunctionObject::Native(native));
        vm.set_global(name, Value::Function(handle))?;
    }

    let globals = vm.globals();
    vm.set_global("_G", Value::Table(globals))?;
    vm.set_global("_VERSION", Value::from("Lua 5.1"))?;

    let next = vm.get_global("next")?;
    let ipairs_iter = vm.create_function("ipairs", ipairs_aux);
    let loaded = vm.heap.alloc_table(Table::new());
    let registry = vm.registry;
    vm.heap.table_set(registry, Value::from(NEXT_KEY), next)?;
    vm.heap
        .table_set(registry, Value::from(IPAIRS_ITER_KEY), ipairs_iter)?;
    vm.heap
        .table_set(registry, Value::from(LOADED_KEY), Value::Table(loaded))?;
    Ok(())
}

fn registry_get(vm: &LuaVM, key: &str) -> Result<Value> {
    Ok(vm.heap.get_table(vm.registry)?.get(&Value::from(key)))
}

/// Print function - writes its arguments separated by tabs
/// Signature: print(...)
pub fn lua_print(ctx: &mut ExecutionContext) -> Result<Vec<Value>> {
    let args = ctx.args().to_vec();
    let mut line = Vec::new();
    for (i, arg) in args.iter().enumerate() {
        if i > 0 {
            line.push(b'\t');
        }
        let text = ctx.vm.tostring_value(arg)?;
        match text.to_lua_string() {
            Some(s) => line.extend_from_slice(s.as_bytes()),
            None => {
                return Err(LuaError::host_fault(
                    "'tostring' must return a string to 'print'",
                ))
            }
        }
    }
    line.push(b'\n');

    ctx.vm
        .output
        .write_all(&line)
        .map_err(|e| LuaError::host_fault(format!("print: {}", e)))?;
    Ok(vec![])
}

/// Assert function - raises an error if its first argument is false or nil
/// Signature: assert(v [, message])
pub fn lua_assert(ctx: &mut ExecutionContext) -> Result<Vec<Value>> {
    let v = ctx.check_any(1)?;
    if v.is_truthy() {
        return Ok(ctx.args().to_vec());
    }
    let message = ctx.opt_string(2, "assertion failed!")?;
    Err(LuaError::host_fault(message.to_str_lossy().into_owned()))
}

/// Error function - raises a value as an error
/// Signature: error(message [, level])
pub fn lua_error(ctx: &mut ExecutionContext) -> Result<Vec<Value>> {
    let value = ctx.arg(1);
    let level = ctx.opt_integer(2, 1)?;

    if level > 0 {
        if let Some(message) = value.to_lua_string() {
            let mut bytes = ctx.where_(level as usize).into_bytes();
            bytes.extend_from_slice(message.as_bytes());
            return Err(LuaError::Explicit(Value::String(LuaString::from(bytes))));
        }
    }
    Err(LuaError::Explicit(value))
}

/// Type function - returns the type name of a value
/// Signature: type(v)
pub fn lua_type(ctx: &mut ExecutionContext) -> Result<Vec<Value>> {
    let v = ctx.check_any(1)?;
    Ok(vec![Value::from(v.type_name())])
}

/// Tostring function - converts a value to a string, honouring `__tostring`
/// Signature: tostring(v)
pub fn lua_tostring(ctx: &mut ExecutionContext) -> Result<Vec<Value>> {
    let v = ctx.check_any(1)?;
    Ok(vec![ctx.vm.tostring_value(&v)?])
}

/// Tonumber function - converts a numeral to a number, or nil
/// Signature: tonumber(v [, base])
pub fn lua_tonumber(ctx: &mut ExecutionContext) -> Result<Vec<Value>> {
    let base = ctx.opt_integer(2, 10)?;
    if base == 10 {
        let v = ctx.check_any(1)?;
        return Ok(vec![v.to_number().map(Value::Number).unwrap_or(Value::Nil)]);
    }

    let s = ctx.check_string(1)?;
    if !(2..=36).contains(&base) {
        return Err(ctx.arg_error(2, "base out of range"));
    }
    let n = number::parse_integer_in_base(s.as_bytes(), base as u32);
    Ok(vec![n.map(Value::Number).unwrap_or(Value::Nil)])
}

/// Rawget function - reads a table without metamethods
/// Signature: rawget(t, k)
pub fn lua_rawget(ctx: &mut ExecutionContext) -> Result<Vec<Value>> {
    let t = ctx.check_table(1)?;
    let k = ctx.check_any(2)?;
    Ok(vec![ctx.vm.heap.get_table(t)?.get(&k)])
}

/// Rawset function - writes a table without metamethods
/// Signature: rawset(t, k, v)
pub fn lua_rawset(ctx: &mut ExecutionContext) -> Result<Vec<Value>> {
    let t = ctx.check_table(1)?;
    let k = ctx.check_any(2)?;
    let v = ctx.check_any(3)?;
    ctx.vm.heap.table_set(t, k, v)?;
    Ok(vec![Value::Table(t)])
}

/// Rawequal function - compares without metamethods
/// Signature: rawequal(a, b)
pub fn lua_rawequal(ctx: &mut ExecutionContext) -> Result<Vec<Value>> {
    let a = ctx.check_any(1)?;
    let b = ctx.check_any(2)?;
    Ok(vec![Value::Boolean(a == b)])
}

/// Setmetatable function - sets or clears the metatable of a table
/// Signature: setmetatable(t, mt)
pub fn lua_setmetatable(ctx: &mut ExecutionContext) -> Result<Vec<Value>> {
    let t = ctx.check_table(1)?;
    let mt = match ctx.arg(2) {
        Value::Nil => None,
        Value::Table(h) => Some(h),
        _ => return Err(ctx.arg_error(2, "nil or table expected")),
    };

    let current = Value::Table(t);
    if !ctx.vm.metamethod(&current, MetaMethod::Metatable).is_nil() {
        return Err(LuaError::host_fault("cannot change a protected metatable"));
    }
    ctx.vm.heap.get_table_mut(t)?.metatable = mt;
    Ok(vec![current])
}

/// Getmetatable function - returns the metatable or its `__metatable` field
/// Signature: getmetatable(v)
pub fn lua_getmetatable(ctx: &mut ExecutionContext) -> Result<Vec<Value>> {
    let v = ctx.check_any(1)?;
    let Some(mt) = ctx.vm.metatable_of(&v) else {
        return Ok(vec![Value::Nil]);
    };
    let protected = ctx.vm.metamethod(&v, MetaMethod::Metatable);
    if protected.is_nil() {
        Ok(vec![Value::Table(mt)])
    } else {
        Ok(vec![protected])
    }
}

/// Next function - traversal step over a table
/// Signature: next(t [, k])
pub fn lua_next(ctx: &mut ExecutionContext) -> Result<Vec<Value>> {
    let t = ctx.check_table(1)?;
    let k = ctx.arg(2);
    match ctx.vm.heap.get_table(t)?.next(&k)? {
        Some((key, value)) => Ok(vec![key, value]),
        None => Ok(vec![Value::Nil]),
    }
}

/// Pairs function - returns `next, t, nil`
/// Signature: pairs(t)
pub fn lua_pairs(ctx: &mut ExecutionContext) -> Result<Vec<Value>> {
    let t = ctx.check_table(1)?;
    let next = registry_get(ctx.vm, NEXT_KEY)?;
    Ok(vec![next, Value::Table(t), Value::Nil])
}

fn ipairs_aux(ctx: &mut ExecutionContext) -> Result<Vec<Value>> {
    let t = ctx.check_table(1)?;
    let i = ctx.check_integer(2)? + 1;
    let v = ctx.vm.heap.get_table(t)?.get_int(i);
    if v.is_nil() {
        Ok(vec![])
    } else {
        Ok(vec![Value::from(i), v])
    }
}

/// Ipairs function - returns an iterator over `t[1]`, `t[2]`, ... up to the first nil
/// Signature: ipairs(t)
pub fn lua_ipairs(ctx: &mut ExecutionContext) -> Result<Vec<Value>> {
    let t = ctx.check_table(1)?;
    let iter = registry_get(ctx.vm, IPAIRS_ITER_KEY)?;
    Ok(vec![iter, Value::Table(t), Value::Number(0.0)])
}

/// Select function - argument count or the arguments from an index on
/// Signature: select(n, ...)
pub fn lua_select(ctx: &mut ExecutionContext) -> Result<Vec<Value>> {
    let extra = ctx.rest(2);
    if let Value::String(s) = ctx.arg(1) {
        if s.as_bytes() == b"#" {
            return Ok(vec![Value::from(extra.len() as i64)]);
        }
    }

    let n = ctx.check_integer(1)?;
    let start = if n < 0 {
        extra.len() as i64 + n
    } else {
        n - 1
    };
    if start < 0 {
        return Err(ctx.arg_error(1, "index out of range"));
    }
    Ok(extra.into_iter().skip(start as usize).collect())
}

/// Unpack function - returns `t[i]` through `t[j]`
/// Signature: unpack(t [, i [, j]])
pub fn lua_unpack(ctx: &mut ExecutionContext) -> Result<Vec<Value>> {
    let t = ctx.check_table(1)?;
    let i = ctx.opt_integer(2, 1)?;
    let j = match ctx.arg(3) {
        Value::Nil => ctx.vm.heap.get_table(t)?.length() as i64,
        _ => ctx.check_integer(3)?,
    };
    if i > j {
        return Ok(vec![]);
    }
    match j.checked_sub(i) {
        Some(n) if n < MAX_UNPACK => {}
        _ => return Err(LuaError::host_fault("too many results to unpack")),
    }
    let table = ctx.vm.heap.get_table(t)?;
    Ok((i..=j).map(|k| table.get_int(k)).collect())
}

/// Collectgarbage function - controls the collector
/// Signature: collectgarbage([opt [, arg]])
pub fn lua_collectgarbage(ctx: &mut ExecutionContext) -> Result<Vec<Value>> {
    let opt = ctx.opt_string(1, "collect")?;
    match opt.as_bytes() {
        b"collect" => {
            ctx.vm.collect_garbage();
            Ok(vec![Value::Number(0.0)])
        }
        b"count" => Ok(vec![Value::Number(ctx.vm.memory_usage() as f64 / 1024.0)]),
        b"step" => {
            ctx.vm.collect_garbage();
            Ok(vec![Value::Boolean(true)])
        }
        b"stop" | b"restart" | b"setpause" | b"setstepmul" => Ok(vec![Value::Number(0.0)]),
        other => Err(ctx.arg_error(
            1,
            format!("invalid option '{}'", String::from_utf8_lossy(other)),
        )),
    }
}

/// Require function - runs a package file once and caches its result
/// Signature: require(name)
pub fn lua_require(ctx: &mut ExecutionContext) -> Result<Vec<Value>> {
    let name = ctx.check_string(1)?;
    let key = Value::String(name.clone());

    let loaded = match registry_get(ctx.vm, LOADED_KEY)? {
        Value::Table(h) => h,
        _ => return Err(LuaError::host_fault("'_LOADED' table is missing")),
    };
    let cached = ctx.vm.heap.get_table(loaded)?.get(&key);
    if !cached.is_nil() {
        return Ok(vec![cached]);
    }

    let module = name.to_str_lossy().into_owned();
    let proto = ctx
        .vm
        .modules
        .get(&module)
        .cloned()
        .ok_or_else(|| LuaError::host_fault(format!("module '{}' not found", module)))?;

    let f = Value::Function(ctx.vm.load_closure(proto));
    let results = ctx.call(&f, vec![key.clone()])?;
    let value = match results.into_iter().next() {
        Some(v) if !v.is_nil() => v,
        _ => Value::Boolean(true),
    };
    ctx.vm.heap.table_set(loaded, key, value.clone())?;
    Ok(vec![value])
}
