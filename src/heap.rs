//! Lua heap management with generational arena architecture
//!
//! Tables, functions, upvalue cells and userdata live in separate arenas.
//! Reclamation is a stop-the-world mark and sweep driven by the VM, which
//! supplies the root set.

use crate::arena::{Arena, Handle};
use crate::error::{LuaError, Result};
use crate::function::{FunctionObject, UpvalueCell};
use crate::table::Table;
use crate::value::{FunctionHandle, TableHandle, UpvalueHandle, UserDataHandle, Value};
use std::any::Any;
use std::collections::HashSet;
use std::fmt;
use tracing::debug;

/// Userdata object: opaque host payload plus a metatable
pub struct UserData {
    /// Host payload
    pub data: Box<dyn Any>,

    /// Metatable (handle to another table)
    pub metatable: Option<TableHandle>,
}

impl fmt::Debug for UserData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserData")
            .field("metatable", &self.metatable)
            .finish_non_exhaustive()
    }
}

/// Memory usage statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStats {
    /// Live tables
    pub tables: usize,

    /// Live functions
    pub functions: usize,

    /// Live upvalue cells
    pub upvalues: usize,

    /// Live userdata
    pub userdata: usize,

    /// Estimated bytes in use
    pub bytes: usize,

    /// Completed collection cycles
    pub collections: u64,
}

/// Core heap implementation
#[derive(Debug)]
pub struct LuaHeap {
    tables: Arena<Table>,
    functions: Arena<FunctionObject>,
    upvalues: Arena<UpvalueCell>,
    userdata: Arena<UserData>,

    /// Estimated bytes allocated since the last recount
    allocated: usize,

    /// Allocation level that triggers the next collection
    threshold: usize,

    /// Lower bound for `threshold`
    min_threshold: usize,

    collections: u64,
}

/// Objects reached during the mark phase
#[derive(Default)]
struct Marks {
    tables: HashSet<Handle>,
    functions: HashSet<Handle>,
    upvalues: HashSet<Handle>,
    userdata: HashSet<Handle>,
}

impl LuaHeap {
    /// Create a new heap that collects once `gc_threshold` bytes are in use
    pub fn new(gc_threshold: usize) -> Self {
        LuaHeap {
            tables: Arena::new(),
            functions: Arena::new(),
            upvalues: Arena::new(),
            userdata: Arena::new(),
            allocated: 0,
            threshold: gc_threshold,
            min_threshold: gc_threshold,
            collections: 0,
        }
    }

    /// Allocate a table
    pub fn alloc_table(&mut self, table: Table) -> TableHandle {
        self.allocated += table.estimated_size();
        TableHandle(self.tables.insert(table))
    }

    /// Get a table
    pub fn get_table(&self, handle: TableHandle) -> Result<&Table> {
        self.tables
            .get(handle.0)
            .ok_or_else(|| LuaError::reference_error("invalid table handle"))
    }

    /// Get a mutable table
    pub fn get_table_mut(&mut self, handle: TableHandle) -> Result<&mut Table> {
        self.tables
            .get_mut(handle.0)
            .ok_or_else(|| LuaError::reference_error("invalid table handle"))
    }

    /// Raw set that keeps the allocation estimate current
    pub fn table_set(&mut self, handle: TableHandle, key: Value, value: Value) -> Result<()> {
        let table = self
            .tables
            .get_mut(handle.0)
            .ok_or_else(|| LuaError::reference_error("invalid table handle"))?;
        let before = table.estimated_size();
        table.set(key, value)?;
        let after = table.estimated_size();
        self.allocated = (self.allocated + after).saturating_sub(before);
        Ok(())
    }

    /// Allocate a function object
    pub fn alloc_function(&mut self, function: FunctionObject) -> FunctionHandle {
        self.allocated += function.estimated_size();
        FunctionHandle(self.functions.insert(function))
    }

    /// Get a function object
    pub fn get_function(&self, handle: FunctionHandle) -> Result<&FunctionObject> {
        self.functions
            .get(handle.0)
            .ok_or_else(|| LuaError::reference_error("invalid function handle"))
    }

    /// Allocate an upvalue cell
    pub fn alloc_upvalue(&mut self, cell: UpvalueCell) -> UpvalueHandle {
        self.allocated += 32;
        UpvalueHandle(self.upvalues.insert(cell))
    }

    /// Get an upvalue cell
    pub fn get_upvalue(&self, handle: UpvalueHandle) -> Result<&UpvalueCell> {
        self.upvalues
            .get(handle.0)
            .ok_or_else(|| LuaError::reference_error("invalid upvalue handle"))
    }

    /// Get a mutable upvalue cell
    pub fn get_upvalue_mut(&mut self, handle: UpvalueHandle) -> Result<&mut UpvalueCell> {
        self.upvalues
            .get_mut(handle.0)
            .ok_or_else(|| LuaError::reference_error("invalid upvalue handle"))
    }

    /// Allocate a userdata object
    pub fn alloc_userdata(&mut self, data: Box<dyn Any>) -> UserDataHandle {
        self.allocated += 48;
        UserDataHandle(self.userdata.insert(UserData {
            data,
            metatable: None,
        }))
    }

    /// Get a userdata object
    pub fn get_userdata(&self, handle: UserDataHandle) -> Result<&UserData> {
        self.userdata
            .get(handle.0)
            .ok_or_else(|| LuaError::reference_error("invalid userdata handle"))
    }

    /// Get a mutable userdata object
    pub fn get_userdata_mut(&mut self, handle: UserDataHandle) -> Result<&mut UserData> {
        self.userdata
            .get_mut(handle.0)
            .ok_or_else(|| LuaError::reference_error("invalid userdata handle"))
    }

    /// Account for memory not owned by an arena object (string buffers)
    pub fn charge(&mut self, bytes: usize) {
        self.allocated += bytes;
    }

    /// Estimated bytes in use
    pub fn allocated(&self) -> usize {
        self.allocated
    }

    /// Whether the allocation level has reached the collection threshold
    pub fn should_collect(&self) -> bool {
        self.allocated >= self.threshold
    }

    /// Current statistics
    pub fn stats(&self) -> MemoryStats {
        MemoryStats {
            tables: self.tables.len(),
            functions: self.functions.len(),
            upvalues: self.upvalues.len(),
            userdata: self.userdata.len(),
            bytes: self.allocated,
            collections: self.collections,
        }
    }

    /// Run a full collection from `roots`, returning the number of objects freed
    pub fn collect<I>(&mut self, roots: I) -> usize
    where
        I: IntoIterator<Item = Root>,
    {
        let mut marks = Marks::default();
        let mut gray: Vec<Value> = Vec::new();

        for root in roots {
            match root {
                Root::Value(v) => self.mark_value(&v, &mut marks, &mut gray),
                Root::Upvalue(h) => self.mark_upvalue(h, &mut marks, &mut gray),
            }
        }
        while let Some(value) = gray.pop() {
            self.scan(&value, &mut marks, &mut gray);
        }

        let freed = self.tables.retain(|h, _| marks.tables.contains(&h))
            + self.functions.retain(|h, _| marks.functions.contains(&h))
            + self.upvalues.retain(|h, _| marks.upvalues.contains(&h))
            + self.userdata.retain(|h, _| marks.userdata.contains(&h));

        self.allocated = self.recount();
        self.threshold = (self.allocated * 2).max(self.min_threshold);
        self.collections += 1;

        debug!(
            freed,
            bytes = self.allocated,
            threshold = self.threshold,
            "garbage collection finished"
        );
        freed
    }

    fn recount(&self) -> usize {
        self.tables.iter().map(|(_, t)| t.estimated_size()).sum::<usize>()
            + self.functions.iter().map(|(_, f)| f.estimated_size()).sum::<usize>()
            + self.upvalues.len() * 32
            + self.userdata.len() * 48
    }

    fn mark_value(&self, value: &Value, marks: &mut Marks, gray: &mut Vec<Value>) {
        let fresh = match value {
            Value::Table(h) => marks.tables.insert(h.0),
            Value::Function(h) => marks.functions.insert(h.0),
            Value::UserData(h) => marks.userdata.insert(h.0),
            _ => false,
        };
        if fresh {
            gray.push(value.clone());
        }
    }

    fn mark_upvalue(&self, handle: UpvalueHandle, marks: &mut Marks, gray: &mut Vec<Value>) {
        if !marks.upvalues.insert(handle.0) {
            return;
        }
        if let Some(UpvalueCell::Closed(value)) = self.upvalues.get(handle.0) {
            self.mark_value(value, marks, gray);
        }
    }

    fn scan(&self, value: &Value, marks: &mut Marks, gray: &mut Vec<Value>) {
        match value {
            Value::Table(h) => {
                if let Some(table) = self.tables.get(h.0) {
                    if let Some(mt) = table.metatable {
                        self.mark_value(&Value::Table(mt), marks, gray);
                    }
                    for (key, val) in table.iter() {
                        self.mark_value(&key, marks, gray);
                        self.mark_value(val, marks, gray);
                    }
                    for key in table.dead_keys() {
                        self.mark_value(key, marks, gray);
                    }
                }
            }
            Value::Function(h) => {
                if let Some(FunctionObject::Lua(closure)) = self.functions.get(h.0) {
                    for upvalue in &closure.upvalues {
                        self.mark_upvalue(*upvalue, marks, gray);
                    }
                }
            }
            Value::UserData(h) => {
                if let Some(ud) = self.userdata.get(h.0) {
                    if let Some(mt) = ud.metatable {
                        self.mark_value(&Value::Table(mt), marks, gray);
                    }
                }
            }
            _ => {}
        }
    }
}

/// Entry of the root set handed to `LuaHeap::collect`
#[derive(Debug, Clone)]
pub enum Root {
    /// A value reachable from the VM
    Value(Value),

    /// An open upvalue cell
    Upvalue(UpvalueHandle),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::function::Closure;
    use crate::function::FunctionProto;
    use std::rc::Rc;

    #[test]
    fn test_unreachable_tables_are_freed() {
        let mut heap = LuaHeap::new(1024);
        let kept = heap.alloc_table(Table::new());
        let child = heap.alloc_table(Table::new());
        let garbage = heap.alloc_table(Table::new());
        heap.table_set(kept, Value::from("child"), Value::Table(child)).unwrap();

        let freed = heap.collect(vec![Root::Value(Value::Table(kept))]);
        assert_eq!(freed, 1);
        assert!(heap.get_table(kept).is_ok());
        assert!(heap.get_table(child).is_ok());
        assert!(heap.get_table(garbage).is_err());
        assert_eq!(heap.stats().collections, 1);
    }

    #[test]
    fn test_cycles_are_collected() {
        let mut heap = LuaHeap::new(1024);
        let a = heap.alloc_table(Table::new());
        let b = heap.alloc_table(Table::new());
        heap.table_set(a, Value::from("peer"), Value::Table(b)).unwrap();
        heap.table_set(b, Value::from("peer"), Value::Table(a)).unwrap();
        heap.get_table_mut(a).unwrap().metatable = Some(b);

        let freed = heap.collect(Vec::new());
        assert_eq!(freed, 2);
        assert_eq!(heap.stats().tables, 0);
    }

    #[test]
    fn test_closed_upvalues_keep_values_alive() {
        let mut heap = LuaHeap::new(1024);
        let captured = heap.alloc_table(Table::new());
        let cell = heap.alloc_upvalue(UpvalueCell::Closed(Value::Table(captured)));
        let closure = heap.alloc_function(FunctionObject::Lua(Closure {
            proto: Rc::new(FunctionProto::default()),
            upvalues: vec![cell],
        }));

        heap.collect(vec![Root::Value(Value::Function(closure))]);
        assert!(heap.get_table(captured).is_ok());
        assert!(heap.get_upvalue(cell).is_ok());

        heap.collect(Vec::new());
        assert!(heap.get_table(captured).is_err());
        assert!(heap.get_upvalue(cell).is_err());
    }
}
