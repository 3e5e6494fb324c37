//! Standard Library Module
//!
//! Base functions plus the `string`, `table` and `math` libraries.

pub mod base;
pub mod math;
pub mod string;
pub mod table;

use crate::error::Result;
use crate::table::Table;
use crate::value::{TableHandle, Value};
use crate::vm::{ExecutionContext, LuaVM};
use tracing::debug;

/// Signature shared by every library function
pub(crate) type LibFn = fn(&mut ExecutionContext<'_>) -> Result<Vec<Value>>;

/// Initialize all standard libraries
pub fn open_libs(vm: &mut LuaVM) -> Result<()> {
    base::init_base_lib(vm)?;
    string::init_string_lib(vm)?;
    table::init_table_lib(vm)?;
    math::init_math_lib(vm)?;

    debug!("standard libraries initialized");
    Ok(())
}

/// Build a library table from `funcs` and publish it as global `name`
pub(crate) fn new_lib(vm: &mut LuaVM, name: &str, funcs: &[(&str, LibFn)]) -> Result<TableHandle> {
    let table = vm.heap.alloc_table(Table::new());
    for (fname, f) in funcs {
        let value = vm.create_function(fname, *f);
        vm.heap.table_set(table, Value::from(*fname), value)?;
    }
    vm.set_global(name, Value::Table(table))?;
    Ok(table)
}
