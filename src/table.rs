//! Lua table: array part plus an insertion-ordered hash part
//!
//! The array part holds keys `1..=n` and never ends in `nil`. The hash part
//! keeps entries in insertion order so traversal with `next` is deterministic.
//! Removing a hash key leaves a tombstone so a traversal that deletes the key
//! it is standing on can continue.

use crate::error::{LuaError, Result};
use crate::number;
use crate::value::{TableHandle, Value};
use std::collections::HashMap;

/// Table object stored in the heap
#[derive(Debug, Default)]
pub struct Table {
    array: Vec<Value>,

    /// Entries in insertion order; a `Nil` value marks a removed key
    entries: Vec<(Value, Value)>,

    index: HashMap<Value, usize>,

    tombstones: usize,

    /// Metatable (handle to another table)
    pub metatable: Option<TableHandle>,
}

/// Array position for a key, when the key is a positive integer
fn array_key(key: &Value) -> Option<usize> {
    match key {
        Value::Number(n) => match number::as_integer(*n) {
            Some(i) if i >= 1 => Some(i as usize),
            _ => None,
        },
        _ => None,
    }
}

fn normalize_key(key: Value) -> Value {
    match key {
        Value::Number(n) if n == 0.0 => Value::Number(0.0),
        other => other,
    }
}

impl Table {
    /// Create a new empty table
    pub fn new() -> Self {
        Table::default()
    }

    /// Create a table with preallocated space
    pub fn with_capacity(array: usize, hash: usize) -> Self {
        Table {
            array: Vec::with_capacity(array),
            entries: Vec::with_capacity(hash),
            index: HashMap::with_capacity(hash),
            ..Table::default()
        }
    }

    /// Raw get; absent keys (including `nil` and NaN) read as `nil`
    pub fn get(&self, key: &Value) -> Value {
        if let Some(i) = array_key(key) {
            if i <= self.array.len() {
                return self.array[i - 1].clone();
            }
        }
        if !key.is_valid_key() {
            return Value::Nil;
        }
        match self.index.get(key) {
            Some(&slot) => self.entries[slot].1.clone(),
            None => Value::Nil,
        }
    }

    /// Raw get by integer index
    pub fn get_int(&self, i: i64) -> Value {
        if i >= 1 && (i as usize) <= self.array.len() {
            return self.array[i as usize - 1].clone();
        }
        self.get(&Value::Number(i as f64))
    }

    /// Raw set; assigning `nil` removes the key
    pub fn set(&mut self, key: Value, value: Value) -> Result<()> {
        match &key {
            Value::Nil => return Err(LuaError::type_error("table index is nil")),
            Value::Number(n) if n.is_nan() => {
                return Err(LuaError::type_error("table index is NaN"))
            }
            _ => {}
        }

        if let Some(i) = array_key(&key) {
            let len = self.array.len();
            if i <= len {
                self.array[i - 1] = value;
                if i == len {
                    self.trim_array();
                }
                return Ok(());
            }
            if i == len + 1 && !value.is_nil() {
                self.remove_entry(&key);
                self.array.push(value);
                self.migrate_from_hash();
                return Ok(());
            }
        }

        let key = normalize_key(key);
        if value.is_nil() {
            self.remove_entry(&key);
            return Ok(());
        }

        match self.index.get(&key) {
            Some(&slot) => {
                if self.entries[slot].1.is_nil() {
                    self.tombstones -= 1;
                }
                self.entries[slot].1 = value;
            }
            None => {
                self.maybe_compact();
                self.index.insert(key.clone(), self.entries.len());
                self.entries.push((key, value));
            }
        }
        Ok(())
    }

    /// Raw set by integer index
    pub fn set_int(&mut self, i: i64, value: Value) -> Result<()> {
        self.set(Value::Number(i as f64), value)
    }

    fn trim_array(&mut self) {
        while matches!(self.array.last(), Some(Value::Nil)) {
            self.array.pop();
        }
    }

    /// Move `n+1, n+2, ...` from the hash part into the array part
    fn migrate_from_hash(&mut self) {
        loop {
            let next_key = Value::Number((self.array.len() + 1) as f64);
            let value = match self.index.get(&next_key) {
                Some(&slot) if !self.entries[slot].1.is_nil() => self.entries[slot].1.clone(),
                _ => break,
            };
            self.remove_entry(&next_key);
            self.array.push(value);
        }
    }

    fn remove_entry(&mut self, key: &Value) {
        if let Some(&slot) = self.index.get(key) {
            if !self.entries[slot].1.is_nil() {
                self.entries[slot].1 = Value::Nil;
                self.tombstones += 1;
            }
        }
    }

    fn maybe_compact(&mut self) {
        if self.tombstones < 8 || self.tombstones * 2 < self.entries.len() {
            return;
        }
        self.entries.retain(|(_, v)| !v.is_nil());
        self.index.clear();
        for (slot, (key, _)) in self.entries.iter().enumerate() {
            self.index.insert(key.clone(), slot);
        }
        self.tombstones = 0;
    }

    /// Length of the array part
    pub fn array_len(&self) -> usize {
        self.array.len()
    }

    /// Border for the `#` operator.
    ///
    /// Starts from the array part and probes the hash part with an unbounded
    /// doubling search followed by binary search.
    pub fn length(&self) -> usize {
        let j = self.array.len();
        if self.entries.len() == self.tombstones {
            return j;
        }
        self.unbound_search(j)
    }

    fn unbound_search(&self, j: usize) -> usize {
        let mut i = j;
        let mut j = j + 1;
        while !self.get_int(j as i64).is_nil() {
            i = j;
            if j > (i64::MAX as usize) / 2 {
                // pathological table: fall back to a linear scan
                let mut k = 1;
                while !self.get_int(k).is_nil() {
                    k += 1;
                }
                return (k - 1) as usize;
            }
            j *= 2;
        }
        while j - i > 1 {
            let m = (i + j) / 2;
            if self.get_int(m as i64).is_nil() {
                j = m;
            } else {
                i = m;
            }
        }
        i
    }

    /// Iteration step: the entry after `key`, or `None` at the end.
    ///
    /// Array entries come first in index order, then hash entries in
    /// insertion order.
    pub fn next(&self, key: &Value) -> Result<Option<(Value, Value)>> {
        let start = match key {
            Value::Nil => 0,
            _ => match array_key(key) {
                Some(i) if i <= self.array.len() => i,
                _ => match self.index.get(key) {
                    Some(&slot) => self.array.len() + slot + 1,
                    // an array slot emptied during traversal
                    None if array_key(key).is_some() => self.array.len(),
                    None => return Err(LuaError::host_fault("invalid key to 'next'")),
                },
            },
        };

        for i in start..self.array.len() {
            if !self.array[i].is_nil() {
                return Ok(Some((Value::Number((i + 1) as f64), self.array[i].clone())));
            }
        }

        let from = start.saturating_sub(self.array.len());
        Ok(self
            .entries
            .iter()
            .skip(from)
            .find(|(_, v)| !v.is_nil())
            .map(|(k, v)| (k.clone(), v.clone())))
    }

    /// Every live key and value, for the collector
    pub fn iter(&self) -> impl Iterator<Item = (Value, &Value)> + '_ {
        let array = self
            .array
            .iter()
            .enumerate()
            .filter(|(_, v)| !v.is_nil())
            .map(|(i, v)| (Value::Number((i + 1) as f64), v));
        let hash = self
            .entries
            .iter()
            .filter(|(_, v)| !v.is_nil())
            .map(|(k, v)| (k.clone(), v));
        array.chain(hash)
    }

    /// Keys kept only as traversal tombstones
    pub fn dead_keys(&self) -> impl Iterator<Item = &Value> {
        self.entries.iter().filter(|(_, v)| v.is_nil()).map(|(k, _)| k)
    }

    /// Approximate memory footprint in bytes
    pub fn estimated_size(&self) -> usize {
        64 + self.array.capacity() * 16 + self.entries.capacity() * 40
    }
}
