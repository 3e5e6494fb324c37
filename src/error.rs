//! Error handling for the Lua virtual machine
//!
//! Every fault raised while executing bytecode is a `LuaError`. Faults travel
//! as ordinary `Result` values through the interpreter loop and are caught by
//! protected-call boundaries recorded on the call stack.

use crate::value::Value;
use thiserror::Error;

/// Result type for Lua operations
pub type Result<T> = std::result::Result<T, LuaError>;

/// Broad category of a fault
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Invalid operand kind for an operator or table operation
    Type,

    /// Malformed input tree or indexing a nil value
    Reference,

    /// Raised by `error()` with an arbitrary payload
    Explicit,

    /// Raised by a native function
    Host,

    /// Too many nested calls
    Overflow,

    /// A resource limit or host cancellation
    Limit,
}

/// Comprehensive error type for Lua operations
#[derive(Debug, Clone, Error)]
pub enum LuaError {
    /// Invalid operand kind
    #[error("{}{}", location_prefix(.location), .message)]
    TypeError {
        message: String,
        location: Option<String>,
    },

    /// Malformed bytecode or indexing nil
    #[error("{}{}", location_prefix(.location), .message)]
    ReferenceError {
        message: String,
        location: Option<String>,
    },

    /// Error object raised by `error(value)`
    #[error("{0}")]
    Explicit(Value),

    /// Fault originating in a native function
    #[error("{}{}", location_prefix(.location), .message)]
    HostFault {
        message: String,
        location: Option<String>,
    },

    /// Call stack or native re-entry depth exceeded
    #[error("{}{}", location_prefix(.location), .message)]
    StackOverflow {
        message: String,
        location: Option<String>,
    },

    /// Instruction limit exceeded
    #[error("instruction limit exceeded")]
    InstructionLimit,

    /// Memory limit exceeded
    #[error("memory limit exceeded")]
    MemoryLimit,

    /// Execution cancelled through the kill flag
    #[error("script killed")]
    Killed,

    /// Execution exceeded its scheduler deadline
    #[error("execution timed out")]
    Timeout,
}

fn location_prefix(location: &Option<String>) -> String {
    match location {
        Some(loc) => format!("{} ", loc),
        None => String::new(),
    }
}

impl LuaError {
    /// Create a type error
    pub fn type_error(message: impl Into<String>) -> Self {
        LuaError::TypeError {
            message: message.into(),
            location: None,
        }
    }

    /// Create a reference error
    pub fn reference_error(message: impl Into<String>) -> Self {
        LuaError::ReferenceError {
            message: message.into(),
            location: None,
        }
    }

    /// Create a fault raised by a native function
    pub fn host_fault(message: impl Into<String>) -> Self {
        LuaError::HostFault {
            message: message.into(),
            location: None,
        }
    }

    /// Create a stack overflow fault
    pub fn stack_overflow(message: impl Into<String>) -> Self {
        LuaError::StackOverflow {
            message: message.into(),
            location: None,
        }
    }

    /// Get the category of this fault
    pub fn kind(&self) -> ErrorKind {
        match self {
            LuaError::TypeError { .. } => ErrorKind::Type,
            LuaError::ReferenceError { .. } => ErrorKind::Reference,
            LuaError::Explicit(_) => ErrorKind::Explicit,
            LuaError::HostFault { .. } => ErrorKind::Host,
            LuaError::StackOverflow { .. } => ErrorKind::Overflow,
            LuaError::InstructionLimit
            | LuaError::MemoryLimit
            | LuaError::Killed
            | LuaError::Timeout => ErrorKind::Limit,
        }
    }

    /// Whether a protected call may catch this fault.
    ///
    /// Limit faults always terminate the whole invocation.
    pub fn is_catchable(&self) -> bool {
        self.kind() != ErrorKind::Limit
    }

    /// Attach a `chunk:line:` position unless one is already present
    pub fn located(self, position: impl FnOnce() -> String) -> Self {
        match self {
            LuaError::TypeError { message, location: None } => LuaError::TypeError {
                message,
                location: Some(position()),
            },
            LuaError::ReferenceError { message, location: None } => LuaError::ReferenceError {
                message,
                location: Some(position()),
            },
            LuaError::HostFault { message, location: None } => LuaError::HostFault {
                message,
                location: Some(position()),
            },
            LuaError::StackOverflow { message, location: None } => LuaError::StackOverflow {
                message,
                location: Some(position()),
            },
            other => other,
        }
    }

    /// Convert into the Lua error object seen by `pcall`
    pub fn into_value(self) -> Value {
        match self {
            LuaError::Explicit(value) => value,
            other => Value::from(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = LuaError::type_error("attempt to perform arithmetic on a table value");
        assert_eq!(err.to_string(), "attempt to perform arithmetic on a table value");

        let err = err.located(|| "main.lua:3:".to_string());
        assert_eq!(err.to_string(), "main.lua:3: attempt to perform arithmetic on a table value");
    }

    #[test]
    fn test_location_is_set_once() {
        let err = LuaError::host_fault("bad argument #1 to 'floor'")
            .located(|| "a:1:".to_string())
            .located(|| "b:2:".to_string());
        assert_eq!(err.to_string(), "a:1: bad argument #1 to 'floor'");
    }

    #[test]
    fn test_limit_faults_are_not_catchable() {
        assert!(!LuaError::InstructionLimit.is_catchable());
        assert!(!LuaError::Timeout.is_catchable());
        assert!(LuaError::stack_overflow("stack overflow").is_catchable());
        assert!(LuaError::Explicit(Value::Nil).is_catchable());
    }

    #[test]
    fn test_explicit_payload_round_trip() {
        let err = LuaError::Explicit(Value::Number(42.0));
        assert!(matches!(err.into_value(), Value::Number(n) if n == 42.0));
    }
}
