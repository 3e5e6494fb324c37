//! Operator semantics: indexing, arithmetic, concatenation, comparison and
//! length, with metatable dispatch

use super::LuaVM;
use crate::error::{LuaError, Result};
use crate::metamethod::{ArithOp, MetaMethod, MAX_TAG_LOOP};
use crate::value::{LuaString, TableHandle, Value};

/// First result of a call, or nil
pub(crate) fn first(results: Vec<Value>) -> Value {
    results.into_iter().next().unwrap_or(Value::Nil)
}

fn index_error(value: &Value) -> LuaError {
    match value {
        Value::Nil => LuaError::reference_error("attempt to index a nil value"),
        other => LuaError::type_error(format!("attempt to index a {} value", other.type_name())),
    }
}

fn order_error(a: &Value, b: &Value) -> LuaError {
    let (ta, tb) = (a.type_name(), b.type_name());
    if ta == tb {
        LuaError::type_error(format!("attempt to compare two {} values", ta))
    } else {
        LuaError::type_error(format!("attempt to compare {} with {}", ta, tb))
    }
}

impl LuaVM {
    /// Metatable of any value; strings share one
    pub(crate) fn metatable_of(&self, value: &Value) -> Option<TableHandle> {
        match value {
            Value::Table(h) => self.heap.get_table(*h).ok()?.metatable,
            Value::UserData(h) => self.heap.get_userdata(*h).ok()?.metatable,
            Value::String(_) => self.string_meta,
            _ => None,
        }
    }

    /// Handler for `event` in the metatable of `value`, or nil
    pub(crate) fn metamethod(&self, value: &Value, event: MetaMethod) -> Value {
        match self.metatable_of(value) {
            Some(mt) => self
                .heap
                .get_table(mt)
                .map(|t| t.get(&Value::from(event.name())))
                .unwrap_or(Value::Nil),
            None => Value::Nil,
        }
    }

    /// `obj[key]` following `__index`
    pub(crate) fn index_value(&mut self, obj: &Value, key: &Value) -> Result<Value> {
        let mut current = obj.clone();
        for _ in 0..MAX_TAG_LOOP {
            let handler = match &current {
                Value::Table(h) => {
                    let table = self.heap.get_table(*h)?;
                    let value = table.get(key);
                    if !value.is_nil() {
                        return Ok(value);
                    }
                    let handler = match table.metatable {
                        Some(mt) => self
                            .heap
                            .get_table(mt)?
                            .get(&Value::from(MetaMethod::Index.name())),
                        None => Value::Nil,
                    };
                    if handler.is_nil() {
                        return Ok(Value::Nil);
                    }
                    handler
                }
                other => {
                    let handler = self.metamethod(other, MetaMethod::Index);
                    if handler.is_nil() {
                        return Err(index_error(other));
                    }
                    handler
                }
            };

            if handler.is_function() {
                let results = self.call_value(&handler, vec![current, key.clone()])?;
                return Ok(first(results));
            }
            current = handler;
        }
        Err(LuaError::type_error("loop in gettable"))
    }

    /// `obj[key] = value` following `__newindex`
    pub(crate) fn set_index(&mut self, obj: &Value, key: Value, value: Value) -> Result<()> {
        let mut current = obj.clone();
        for _ in 0..MAX_TAG_LOOP {
            let handler = match &current {
                Value::Table(h) => {
                    let h = *h;
                    let table = self.heap.get_table(h)?;
                    let handler = match table.metatable {
                        Some(mt) if table.get(&key).is_nil() => self
                            .heap
                            .get_table(mt)?
                            .get(&Value::from(MetaMethod::NewIndex.name())),
                        _ => Value::Nil,
                    };
                    if handler.is_nil() {
                        return self.heap.table_set(h, key, value);
                    }
                    handler
                }
                other => {
                    let handler = self.metamethod(other, MetaMethod::NewIndex);
                    if handler.is_nil() {
                        return Err(index_error(other));
                    }
                    handler
                }
            };

            if handler.is_function() {
                self.call_value(&handler, vec![current, key, value])?;
                return Ok(());
            }
            current = handler;
        }
        Err(LuaError::type_error("loop in settable"))
    }

    /// Binary handler from either operand
    fn binary_metamethod(&self, a: &Value, b: &Value, event: MetaMethod) -> Value {
        let handler = self.metamethod(a, event);
        if handler.is_nil() {
            self.metamethod(b, event)
        } else {
            handler
        }
    }

    /// Arithmetic with string coercion and metamethod fallback
    pub(crate) fn arith(&mut self, op: ArithOp, a: &Value, b: &Value) -> Result<Value> {
        if let (Some(x), Some(y)) = (a.to_number(), b.to_number()) {
            return Ok(Value::Number(op.apply(x, y)));
        }

        let handler = self.binary_metamethod(a, b, op.event());
        if handler.is_nil() {
            let culprit = if a.to_number().is_none() { a } else { b };
            return Err(LuaError::type_error(format!(
                "attempt to perform arithmetic on a {} value",
                culprit.type_name()
            )));
        }
        let results = self.call_value(&handler, vec![a.clone(), b.clone()])?;
        Ok(first(results))
    }

    /// Concatenate `values` right to left
    pub(crate) fn concat(&mut self, mut values: Vec<Value>) -> Result<Value> {
        let mut acc = values.pop().unwrap_or(Value::Nil);
        while let Some(left) = values.pop() {
            acc = self.concat_pair(&left, &acc)?;
        }
        Ok(acc)
    }

    fn concat_pair(&mut self, a: &Value, b: &Value) -> Result<Value> {
        if let (Some(x), Some(y)) = (a.to_lua_string(), b.to_lua_string()) {
            let mut bytes = Vec::with_capacity(x.len() + y.len());
            bytes.extend_from_slice(x.as_bytes());
            bytes.extend_from_slice(y.as_bytes());
            self.heap.charge(bytes.len());
            return Ok(Value::String(LuaString::from(bytes)));
        }

        let handler = self.binary_metamethod(a, b, MetaMethod::Concat);
        if handler.is_nil() {
            let culprit = if a.to_lua_string().is_none() { a } else { b };
            return Err(LuaError::type_error(format!(
                "attempt to concatenate a {} value",
                culprit.type_name()
            )));
        }
        let results = self.call_value(&handler, vec![a.clone(), b.clone()])?;
        Ok(first(results))
    }

    /// `==` with `__eq` for pairs of tables or pairs of userdata
    pub(crate) fn equals(&mut self, a: &Value, b: &Value) -> Result<bool> {
        if a == b {
            return Ok(true);
        }
        match (a, b) {
            (Value::Table(_), Value::Table(_)) | (Value::UserData(_), Value::UserData(_)) => {}
            _ => return Ok(false),
        }

        let handler = self.metamethod(a, MetaMethod::Eq);
        if handler.is_nil() || handler != self.metamethod(b, MetaMethod::Eq) {
            return Ok(false);
        }
        let results = self.call_value(&handler, vec![a.clone(), b.clone()])?;
        Ok(first(results).is_truthy())
    }

    /// Same handler on both sides, called with `(a, b)`; `None` when absent
    fn order_metamethod(&mut self, a: &Value, b: &Value, event: MetaMethod) -> Result<Option<bool>> {
        let handler = self.metamethod(a, event);
        if handler.is_nil() || handler != self.metamethod(b, event) {
            return Ok(None);
        }
        let results = self.call_value(&handler, vec![a.clone(), b.clone()])?;
        Ok(Some(first(results).is_truthy()))
    }

    /// `a < b`
    pub(crate) fn less_than(&mut self, a: &Value, b: &Value) -> Result<bool> {
        match (a, b) {
            (Value::Number(x), Value::Number(y)) => Ok(x < y),
            (Value::String(x), Value::String(y)) => Ok(x.as_bytes() < y.as_bytes()),
            _ if a.type_name() != b.type_name() => Err(order_error(a, b)),
            _ => self
                .order_metamethod(a, b, MetaMethod::Lt)?
                .ok_or_else(|| order_error(a, b)),
        }
    }

    /// `a <= b`, falling back to `not (b < a)` through `__lt`
    pub(crate) fn less_equal(&mut self, a: &Value, b: &Value) -> Result<bool> {
        match (a, b) {
            (Value::Number(x), Value::Number(y)) => Ok(x <= y),
            (Value::String(x), Value::String(y)) => Ok(x.as_bytes() <= y.as_bytes()),
            _ if a.type_name() != b.type_name() => Err(order_error(a, b)),
            _ => {
                if let Some(result) = self.order_metamethod(a, b, MetaMethod::Le)? {
                    return Ok(result);
                }
                match self.order_metamethod(b, a, MetaMethod::Lt)? {
                    Some(result) => Ok(!result),
                    None => Err(order_error(a, b)),
                }
            }
        }
    }

    /// `#v`: strings and table borders; userdata through `__len`
    pub(crate) fn length(&mut self, value: &Value) -> Result<Value> {
        match value {
            Value::String(s) => Ok(Value::Number(s.len() as f64)),
            Value::Table(h) => Ok(Value::Number(self.heap.get_table(*h)?.length() as f64)),
            other => {
                let handler = self.metamethod(other, MetaMethod::Len);
                if handler.is_nil() {
                    return Err(LuaError::type_error(format!(
                        "attempt to get length of a {} value",
                        other.type_name()
                    )));
                }
                let results = self.call_value(&handler, vec![other.clone()])?;
                Ok(first(results))
            }
        }
    }

    /// `tostring(v)`, honouring `__tostring`
    pub(crate) fn tostring_value(&mut self, value: &Value) -> Result<Value> {
        let handler = self.metamethod(value, MetaMethod::ToString);
        if !handler.is_nil() {
            let results = self.call_value(&handler, vec![value.clone()])?;
            return Ok(first(results));
        }
        Ok(match value {
            Value::String(_) => value.clone(),
            other => Value::from(other.to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VMConfig;
    use crate::table::Table;

    fn vm() -> LuaVM {
        LuaVM::new(VMConfig::default())
    }

    #[test]
    fn test_arith_coercion() {
        let mut vm = vm();
        let sum = vm.arith(ArithOp::Add, &Value::from("10"), &Value::Number(5.0)).unwrap();
        assert_eq!(sum, Value::Number(15.0));

        let err = vm
            .arith(ArithOp::Mul, &Value::Number(2.0), &Value::from("abc"))
            .unwrap_err();
        assert_eq!(err.to_string(), "attempt to perform arithmetic on a string value");

        let t = vm.create_table();
        let err = vm.arith(ArithOp::Unm, &t, &t).unwrap_err();
        assert_eq!(err.to_string(), "attempt to perform arithmetic on a table value");
    }

    #[test]
    fn test_concat_coercion() {
        let mut vm = vm();
        let joined = vm
            .concat(vec![Value::from("a"), Value::Number(1.0), Value::Number(0.5)])
            .unwrap();
        assert_eq!(joined, Value::from("a10.5"));

        let err = vm.concat(vec![Value::from("a"), Value::Nil]).unwrap_err();
        assert_eq!(err.to_string(), "attempt to concatenate a nil value");

        let err = vm.concat(vec![Value::Boolean(true), Value::from("a")]).unwrap_err();
        assert_eq!(err.to_string(), "attempt to concatenate a boolean value");
    }

    #[test]
    fn test_comparison_errors() {
        let mut vm = vm();
        assert!(vm.less_than(&Value::from("a"), &Value::from("b")).unwrap());
        assert!(vm.less_equal(&Value::Number(2.0), &Value::Number(2.0)).unwrap());

        let err = vm.less_than(&Value::Number(1.0), &Value::Nil).unwrap_err();
        assert_eq!(err.to_string(), "attempt to compare number with nil");

        let (a, b) = (vm.create_table(), vm.create_table());
        let err = vm.less_than(&a, &b).unwrap_err();
        assert_eq!(err.to_string(), "attempt to compare two table values");
    }

    #[test]
    fn test_equality_is_raw_without_metamethods() {
        let mut vm = vm();
        assert!(!vm.equals(&Value::Number(10.0), &Value::from("10")).unwrap());
        assert!(!vm.equals(&Value::Number(f64::NAN), &Value::Number(f64::NAN)).unwrap());
        let t = vm.create_table();
        assert!(vm.equals(&t, &t.clone()).unwrap());
    }

    #[test]
    fn test_index_chain_through_tables() {
        let mut vm = vm();
        let base = vm.heap.alloc_table(Table::new());
        vm.heap
            .table_set(base, Value::from("greeting"), Value::from("hi"))
            .unwrap();
        let meta = vm.heap.alloc_table(Table::new());
        vm.heap
            .table_set(meta, Value::from("__index"), Value::Table(base))
            .unwrap();
        let obj = vm.create_table();
        vm.set_metatable(&obj, Some(meta)).unwrap();

        let v = vm.index_value(&obj, &Value::from("greeting")).unwrap();
        assert_eq!(v, Value::from("hi"));
        assert_eq!(vm.index_value(&obj, &Value::from("other")).unwrap(), Value::Nil);
    }

    #[test]
    fn test_index_errors() {
        let mut vm = vm();
        let err = vm.index_value(&Value::Nil, &Value::from("x")).unwrap_err();
        assert!(matches!(err, LuaError::ReferenceError { .. }));
        let err = vm.index_value(&Value::Number(1.0), &Value::from("x")).unwrap_err();
        assert_eq!(err.to_string(), "attempt to index a number value");
    }

    #[test]
    fn test_index_loop_is_detected() {
        let mut vm = vm();
        let t = vm.create_table();
        let handle = t.as_table().unwrap();
        let meta = vm.heap.alloc_table(Table::new());
        vm.heap.table_set(meta, Value::from("__index"), t.clone()).unwrap();
        vm.heap.get_table_mut(handle).unwrap().metatable = Some(meta);

        let err = vm.index_value(&t, &Value::from("x")).unwrap_err();
        assert_eq!(err.to_string(), "loop in gettable");
    }
}
