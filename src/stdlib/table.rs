//! Lua Table Library Implementation

use super::{new_lib, LibFn};
use crate::error::{LuaError, Result};
use crate::value::{LuaString, TableHandle, Value};
use crate::vm::{ExecutionContext, LuaVM};

/// Initialize the table library
pub fn init_table_lib(vm: &mut LuaVM) -> Result<()> {
    let funcs: &[(&str, LibFn)] = &[
        ("insert", table_insert),
        ("remove", table_remove),
        ("concat", table_concat),
        ("sort", table_sort),
        ("getn", table_getn),
        ("maxn", table_maxn),
    ];
    new_lib(vm, "table", funcs)?;
    Ok(())
}

fn length(ctx: &ExecutionContext, t: TableHandle) -> Result<i64> {
    Ok(ctx.vm.heap.get_table(t)?.length() as i64)
}

fn get(ctx: &ExecutionContext, t: TableHandle, i: i64) -> Result<Value> {
    Ok(ctx.vm.heap.get_table(t)?.get_int(i))
}

fn set(ctx: &mut ExecutionContext, t: TableHandle, i: i64, v: Value) -> Result<()> {
    ctx.vm.heap.table_set(t, Value::from(i), v)
}

/// Table.insert function - inserts an element, shifting later ones up
/// Signature: table.insert(t, [pos,] value)
pub fn table_insert(ctx: &mut ExecutionContext) -> Result<Vec<Value>> {
    let t = ctx.check_table(1)?;
    let n = length(ctx, t)?;
    match ctx.arg_count() {
        2 => {
            let v = ctx.arg(2);
            set(ctx, t, n + 1, v)?;
        }
        3 => {
            let pos = ctx.check_integer(2)?;
            let mut i = n + 1;
            while i > pos {
                let moved = get(ctx, t, i - 1)?;
                set(ctx, t, i, moved)?;
                i -= 1;
            }
            let v = ctx.arg(3);
            set(ctx, t, pos, v)?;
        }
        _ => return Err(LuaError::host_fault("wrong number of arguments to 'insert'")),
    }
    Ok(vec![])
}

/// Table.remove function - removes an element, shifting later ones down
/// Signature: table.remove(t [, pos])
pub fn table_remove(ctx: &mut ExecutionContext) -> Result<Vec<Value>> {
    let t = ctx.check_table(1)?;
    let n = length(ctx, t)?;
    let pos = ctx.opt_integer(2, n)?;
    if n == 0 {
        return Ok(vec![]);
    }

    let removed = get(ctx, t, pos)?;
    for i in pos..n {
        let moved = get(ctx, t, i + 1)?;
        set(ctx, t, i, moved)?;
    }
    set(ctx, t, n, Value::Nil)?;
    Ok(vec![removed])
}

/// Table.concat function - joins string and number elements
/// Signature: table.concat(t [, sep [, i [, j]]])
pub fn table_concat(ctx: &mut ExecutionContext) -> Result<Vec<Value>> {
    let t = ctx.check_table(1)?;
    let sep = ctx.opt_string(2, "")?;
    let i = ctx.opt_integer(3, 1)?;
    let j = match ctx.arg(4) {
        Value::Nil => length(ctx, t)?,
        _ => ctx.check_integer(4)?,
    };

    let mut out = Vec::new();
    let mut k = i;
    while k <= j {
        let item = get(ctx, t, k)?;
        let s = item.to_lua_string().ok_or_else(|| {
            LuaError::host_fault(format!(
                "invalid value (at index {}) in table for 'concat'",
                k
            ))
        })?;
        out.extend_from_slice(s.as_bytes());
        if k < j {
            out.extend_from_slice(sep.as_bytes());
        }
        k += 1;
    }

    ctx.vm.heap.charge(out.len());
    Ok(vec![Value::String(LuaString::from(out))])
}

/// `a < b` under the optional comparison function
fn sort_less(ctx: &mut ExecutionContext, comp: &Value, a: &Value, b: &Value) -> Result<bool> {
    if comp.is_nil() {
        ctx.vm.less_than(a, b)
    } else {
        let results = ctx.call(comp, vec![a.clone(), b.clone()])?;
        Ok(results.first().map_or(false, Value::is_truthy))
    }
}

/// Stable merge sort with a fallible comparison
fn merge_sort(ctx: &mut ExecutionContext, comp: &Value, items: Vec<Value>) -> Result<Vec<Value>> {
    if items.len() <= 1 {
        return Ok(items);
    }
    let mut left = items;
    let right = left.split_off(left.len() / 2);
    let left = merge_sort(ctx, comp, left)?;
    let right = merge_sort(ctx, comp, right)?;

    let mut merged = Vec::with_capacity(left.len() + right.len());
    let mut left = left.into_iter().peekable();
    let mut right = right.into_iter().peekable();
    while let (Some(l), Some(r)) = (left.peek(), right.peek()) {
        if sort_less(ctx, comp, r, l)? {
            merged.extend(right.next());
        } else {
            merged.extend(left.next());
        }
    }
    merged.extend(left);
    merged.extend(right);
    Ok(merged)
}

/// Table.sort function - sorts the sequence in place
/// Signature: table.sort(t [, comp])
pub fn table_sort(ctx: &mut ExecutionContext) -> Result<Vec<Value>> {
    let t = ctx.check_table(1)?;
    let comp = ctx.arg(2);
    if !comp.is_nil() && !comp.is_function() {
        return Err(ctx.arg_error(2, format!("function expected, got {}", comp.type_name())));
    }

    let n = length(ctx, t)?;
    let items = (1..=n).map(|i| get(ctx, t, i)).collect::<Result<Vec<_>>>()?;
    let sorted = merge_sort(ctx, &comp, items)?;
    for (i, v) in sorted.into_iter().enumerate() {
        set(ctx, t, i as i64 + 1, v)?;
    }
    Ok(vec![])
}

/// Table.getn function - returns the length of the sequence
/// Signature: table.getn(t)
pub fn table_getn(ctx: &mut ExecutionContext) -> Result<Vec<Value>> {
    let t = ctx.check_table(1)?;
    Ok(vec![Value::from(length(ctx, t)?)])
}

/// Table.maxn function - returns the largest positive numeric key
/// Signature: table.maxn(t)
pub fn table_maxn(ctx: &mut ExecutionContext) -> Result<Vec<Value>> {
    let t = ctx.check_table(1)?;
    let max = ctx
        .vm
        .heap
        .get_table(t)?
        .iter()
        .filter_map(|(k, _)| k.as_number())
        .fold(0.0f64, f64::max);
    Ok(vec![Value::Number(max)])
}
