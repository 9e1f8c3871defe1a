use std::fmt;

use num_traits::ToPrimitive;
use thiserror::Error;

use crate::value::Value;

/// A raised source-level exception: an instance of a `BaseException`
/// subclass travelling up the host stack.
#[derive(Clone)]
pub struct PyErr {
    pub value: Value,
}

impl PyErr {
    pub fn class_name(&self) -> String {
        self.value.type_name()
    }

    /// The exception's message, as `str(exc)` would render simple arguments.
    pub fn message(&self) -> String {
        let Value::Instance(inst) = &self.value else {
            return String::new();
        };
        let args = inst.dict.borrow().get("args").cloned();
        match args {
            Some(Value::Tuple(items)) => match items.as_slice() {
                [] => String::new(),
                [only] => plain(only),
                many => format!("({})", many.iter().map(plain).collect::<Vec<_>>().join(", ")),
            },
            _ => String::new(),
        }
    }

    /// Exit status for a `SystemExit`, with the text to print when its
    /// argument is not an integer. `None` for other exceptions.
    pub fn exit_status(&self) -> Option<(i32, Option<String>)> {
        if self.class_name() != "SystemExit" {
            return None;
        }
        let Value::Instance(inst) = &self.value else {
            return Some((0, None));
        };
        let args = inst.dict.borrow().get("args").cloned();
        Some(match args {
            Some(Value::Tuple(items)) => match items.first() {
                None | Some(Value::None) => (0, None),
                Some(Value::Int(code)) => (code.to_i32().unwrap_or(1), None),
                Some(Value::Bool(b)) => (i32::from(*b), None),
                Some(other) => (1, Some(plain(other))),
            },
            _ => (0, None),
        })
    }
}

fn plain(v: &Value) -> String {
    match v {
        Value::Str(s) => s.to_string(),
        other => format!("{other:?}"),
    }
}

impl fmt::Display for PyErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = self.message();
        if msg.is_empty() {
            write!(f, "{}", self.class_name())
        } else {
            write!(f, "{}: {}", self.class_name(), msg)
        }
    }
}

impl fmt::Debug for PyErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PyErr({self})")
    }
}

#[derive(Debug, Error)]
pub enum VmError {
    /// An uncaught source-level exception. Only this variant is visible to
    /// exception handlers in compiled code.
    #[error("{0}")]
    Exception(PyErr),

    #[error("class not found: {0}")]
    ClassNotFound(String),

    #[error("no method {class}.{name}{descriptor}")]
    MethodNotFound {
        class: String,
        name: String,
        descriptor: String,
    },

    #[error("no runtime entry point {class}.{name}{descriptor}")]
    UnknownNative {
        class: String,
        name: String,
        descriptor: String,
    },

    #[error("unit already loaded: {0}")]
    DuplicateUnit(String),

    #[error("operand stack underflow in {0}")]
    StackUnderflow(String),

    #[error("type error: expected {expected}, got {got}")]
    OperandType {
        expected: &'static str,
        got: &'static str,
    },

    #[error("null reference passed to {0}")]
    NullReference(&'static str),

    #[error("array index out of bounds: {0}")]
    ArrayIndex(i64),

    #[error("invalid local index: {0}")]
    InvalidLocal(u16),

    #[error("invalid branch target {0}")]
    InvalidBranch(u32),

    #[error("invalid operator code: {0}")]
    InvalidOperator(i32),

    #[error("execution limit exceeded ({0} instructions)")]
    ExecutionLimitExceeded(u64),

    #[error("bytecode error: {0}")]
    Bytecode(#[from] pyjvm_bytecode::BytecodeError),
}

impl VmError {
    pub fn as_exception(&self) -> Option<&PyErr> {
        match self {
            VmError::Exception(e) => Some(e),
            _ => None,
        }
    }
}
