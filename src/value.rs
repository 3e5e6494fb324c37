//! Lua value representation
//!
//! Numbers and strings are carried by value; tables, functions and userdata
//! are handles into the heap arenas and compare by identity.

use crate::arena::Handle;
use crate::number;
use std::borrow::Cow;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::rc::Rc;

/// Type-safe handle for tables
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TableHandle(pub Handle);

/// Type-safe handle for functions (closures and natives)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FunctionHandle(pub Handle);

/// Type-safe handle for userdata
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UserDataHandle(pub Handle);

/// Type-safe handle for upvalue cells
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UpvalueHandle(pub Handle);

/// Immutable Lua string, compared by content
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LuaString(Rc<[u8]>);

impl LuaString {
    /// Create a string from raw bytes
    pub fn new(bytes: &[u8]) -> Self {
        LuaString(Rc::from(bytes))
    }

    /// Raw bytes of the string
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Length in bytes
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Check for the empty string
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// UTF-8 view, replacing invalid sequences
    pub fn to_str_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.0)
    }
}

impl fmt::Debug for LuaString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.to_str_lossy())
    }
}

impl fmt::Display for LuaString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_str_lossy())
    }
}

impl From<&str> for LuaString {
    fn from(s: &str) -> Self {
        LuaString::new(s.as_bytes())
    }
}

impl From<String> for LuaString {
    fn from(s: String) -> Self {
        LuaString(Rc::from(s.into_bytes()))
    }
}

impl From<&[u8]> for LuaString {
    fn from(bytes: &[u8]) -> Self {
        LuaString::new(bytes)
    }
}

impl From<Vec<u8>> for LuaString {
    fn from(bytes: Vec<u8>) -> Self {
        LuaString(Rc::from(bytes))
    }
}

/// Core Lua value type
#[derive(Debug, Clone)]
pub enum Value {
    /// Nil value
    Nil,

    /// Boolean value
    Boolean(bool),

    /// Number value (Lua 5.1 uses f64 for all numbers)
    Number(f64),

    /// String value
    String(LuaString),

    /// Table handle
    Table(TableHandle),

    /// Function handle (closure or native)
    Function(FunctionHandle),

    /// Userdata handle
    UserData(UserDataHandle),
}

impl Value {
    /// Get the type name of this value
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Boolean(_) => "boolean",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Table(_) => "table",
            Value::Function(_) => "function",
            Value::UserData(_) => "userdata",
        }
    }

    /// Lua truthiness: only `nil` and `false` are false
    pub fn is_truthy(&self) -> bool {
        !matches!(self, Value::Nil | Value::Boolean(false))
    }

    /// Check if nil
    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    /// Check if function
    pub fn is_function(&self) -> bool {
        matches!(self, Value::Function(_))
    }

    /// Number without coercion
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// String without coercion
    pub fn as_lua_string(&self) -> Option<&LuaString> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Table handle, if this is a table
    pub fn as_table(&self) -> Option<TableHandle> {
        match self {
            Value::Table(t) => Some(*t),
            _ => None,
        }
    }

    /// Arithmetic coercion: numbers, and strings holding a valid numeral
    pub fn to_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            Value::String(s) => number::parse_number(s.as_bytes()),
            _ => None,
        }
    }

    /// Concatenation coercion: strings, and numbers formatted with `%.14g`
    pub fn to_lua_string(&self) -> Option<LuaString> {
        match self {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(LuaString::from(number::format_number(*n))),
            _ => None,
        }
    }

    /// Whether this value may be used as a table key
    pub fn is_valid_key(&self) -> bool {
        match self {
            Value::Nil => false,
            Value::Number(n) => !n.is_nan(),
            _ => true,
        }
    }
}

/// Raw equality (no metamethods)
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) => true,
            (Value::Boolean(a), Value::Boolean(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Table(a), Value::Table(b)) => a == b,
            (Value::Function(a), Value::Function(b)) => a == b,
            (Value::UserData(a), Value::UserData(b)) => a == b,
            _ => false,
        }
    }
}

// NaN is never stored as a key, so Eq holds for every hashed value.
impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            Value::Nil => 0u8.hash(state),
            Value::Boolean(b) => {
                1u8.hash(state);
                b.hash(state);
            }
            Value::Number(n) => {
                2u8.hash(state);
                // -0.0 and 0.0 are the same key
                let n = if *n == 0.0 { 0.0f64 } else { *n };
                n.to_bits().hash(state);
            }
            Value::String(s) => {
                3u8.hash(state);
                s.hash(state);
            }
            Value::Table(t) => {
                4u8.hash(state);
                t.hash(state);
            }
            Value::Function(f) => {
                5u8.hash(state);
                f.hash(state);
            }
            Value::UserData(u) => {
                6u8.hash(state);
                u.hash(state);
            }
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "nil"),
            Value::Boolean(b) => write!(f, "{}", b),
            Value::Number(n) => f.write_str(&number::format_number(*n)),
            Value::String(s) => write!(f, "{}", s),
            Value::Table(t) => write!(f, "table: 0x{:08x}", address(t.0)),
            Value::Function(h) => write!(f, "function: 0x{:08x}", address(h.0)),
            Value::UserData(u) => write!(f, "userdata: 0x{:08x}", address(u.0)),
        }
    }
}

fn address(handle: Handle) -> u64 {
    ((handle.generation as u64) << 32 | handle.index as u64) * 0x20 + 0x1000
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Boolean(b)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n as f64)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(LuaString::from(s))
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(LuaString::from(s))
    }
}

impl From<LuaString> for Value {
    fn from(s: LuaString) -> Self {
        Value::String(s)
    }
}

impl From<TableHandle> for Value {
    fn from(t: TableHandle) -> Self {
        Value::Table(t)
    }
}

impl From<FunctionHandle> for Value {
    fn from(f: FunctionHandle) -> Self {
        Value::Function(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truthiness() {
        assert!(Value::Number(0.0).is_truthy());
        assert!(Value::from("").is_truthy());
        assert!(Value::Boolean(true).is_truthy());
        assert!(!Value::Nil.is_truthy());
        assert!(!Value::Boolean(false).is_truthy());
    }

    #[test]
    fn test_equality_never_coerces() {
        assert_ne!(Value::Number(10.0), Value::from("10"));
        assert_eq!(Value::from("abc"), Value::from(String::from("abc")));
        assert_ne!(Value::Number(f64::NAN), Value::Number(f64::NAN));
        assert_eq!(Value::Number(0.0), Value::Number(-0.0));
    }

    #[test]
    fn test_identity_for_references() {
        let a = Value::Table(TableHandle(Handle::new(1, 0)));
        let b = Value::Table(TableHandle(Handle::new(2, 0)));
        assert_eq!(a, a.clone());
        assert_ne!(a, b);
    }

    #[test]
    fn test_coercions() {
        assert_eq!(Value::from("44").to_number(), Some(44.0));
        assert_eq!(Value::from("4x").to_number(), None);
        assert_eq!(
            Value::Number(1.5).to_lua_string(),
            Some(LuaString::from("1.5"))
        );
        assert_eq!(Value::Boolean(true).to_number(), None);
    }
}
