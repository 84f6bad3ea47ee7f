use std::fmt;
use std::sync::Arc;

use anyhow::{Result, anyhow, bail};

use crate::code::{CodeUnit, Const};
use crate::patch::Function;

use super::context::VmContext;

pub type NativeFn = fn(&mut VmContext, &[Value]) -> Result<Value>;

/// A host function exposed to executed code.
#[derive(Clone, Copy)]
pub struct Builtin {
    pub name: &'static str,
    pub func: NativeFn,
}

impl fmt::Debug for Builtin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<builtin {}>", self.name)
    }
}

/// Iteration state left on the stack by `GET_ITER`.
#[derive(Debug, Clone, PartialEq)]
pub enum SeqIter {
    Range { next: i64, stop: i64, step: i64 },
    Items { items: Arc<[Value]>, pos: usize },
}

impl SeqIter {
    pub fn advance(&mut self) -> Option<Value> {
        match self {
            SeqIter::Range { next, stop, step } => {
                let done = if *step > 0 { *next >= *stop } else { *next <= *stop };
                if done {
                    return None;
                }
                let value = *next;
                *next += *step;
                Some(Value::Int(value))
            }
            SeqIter::Items { items, pos } => {
                let value = items.get(*pos).cloned()?;
                *pos += 1;
                Some(value)
            }
        }
    }
}

/// Runtime value.
#[derive(Debug, Clone)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Arc<str>),
    Tuple(Arc<[Value]>),
    Range { start: i64, stop: i64, step: i64 },
    Iter(SeqIter),
    Code(Arc<CodeUnit>),
    Function(Arc<Function>),
    Builtin(Builtin),
}

impl Value {
    pub fn str(value: &str) -> Self {
        Value::Str(Arc::from(value))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::None => "NoneType",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::Tuple(_) => "tuple",
            Value::Range { .. } => "range",
            Value::Iter(_) => "iterator",
            Value::Code(_) => "code",
            Value::Function(_) => "function",
            Value::Builtin(_) => "builtin_function_or_method",
        }
    }

    pub fn is_truthy(&self) -> bool {
        match self {
            Value::None => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::Tuple(items) => !items.is_empty(),
            Value::Range { start, stop, step } => range_len(*start, *stop, *step) > 0,
            _ => true,
        }
    }

    /// Converts a value back to a constant, e.g. for function defaults.
    pub fn to_const(&self) -> Result<Const> {
        Ok(match self {
            Value::None => Const::None,
            Value::Bool(b) => Const::Bool(*b),
            Value::Int(i) => Const::Int(*i),
            Value::Float(f) => Const::Float(*f),
            Value::Str(s) => Const::Str(s.clone()),
            Value::Tuple(items) => Const::tuple(items.iter().map(Value::to_const).collect::<Result<Vec<_>>>()?),
            Value::Code(code) => Const::Code(code.clone()),
            other => bail!("{} value cannot be stored as a constant", other.type_name()),
        })
    }

    pub fn iter(&self) -> Result<SeqIter> {
        match self {
            Value::Range { start, stop, step } => Ok(SeqIter::Range {
                next: *start,
                stop: *stop,
                step: *step,
            }),
            Value::Tuple(items) => Ok(SeqIter::Items {
                items: items.clone(),
                pos: 0,
            }),
            Value::Str(s) => Ok(SeqIter::Items {
                items: s.chars().map(|c| Value::Str(Arc::from(c.to_string()))).collect(),
                pos: 0,
            }),
            Value::Iter(it) => Ok(it.clone()),
            other => Err(anyhow!("'{}' object is not iterable", other.type_name())),
        }
    }
}

pub(crate) fn range_len(start: i64, stop: i64, step: i64) -> i64 {
    if step > 0 && start < stop {
        (stop - start + step - 1) / step
    } else if step < 0 && start > stop {
        (start - stop - step - 1) / -step
    } else {
        0
    }
}

impl From<&Const> for Value {
    fn from(value: &Const) -> Self {
        match value {
            Const::None => Value::None,
            Const::Bool(b) => Value::Bool(*b),
            Const::Int(i) => Value::Int(*i),
            Const::Float(f) => Value::Float(*f),
            Const::Str(s) => Value::Str(s.clone()),
            Const::Tuple(items) => Value::Tuple(items.iter().map(Value::from).collect()),
            Const::Code(code) => Value::Code(code.clone()),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::None, Value::None) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Int(a), Value::Float(b)) | (Value::Float(b), Value::Int(a)) => (*a as f64) == *b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Tuple(a), Value::Tuple(b)) => a == b,
            (
                Value::Range { start, stop, step },
                Value::Range {
                    start: s2,
                    stop: e2,
                    step: st2,
                },
            ) => (start, stop, step) == (s2, e2, st2),
            (Value::Iter(a), Value::Iter(b)) => a == b,
            (Value::Code(a), Value::Code(b)) => Arc::ptr_eq(a, b),
            (Value::Function(a), Value::Function(b)) => Arc::ptr_eq(a, b),
            (Value::Builtin(a), Value::Builtin(b)) => a.name == b.name,
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::None => write!(f, "None"),
            Value::Bool(true) => write!(f, "True"),
            Value::Bool(false) => write!(f, "False"),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) if x.fract() == 0.0 && x.is_finite() => write!(f, "{:.1}", x),
            Value::Float(x) => write!(f, "{}", x),
            Value::Str(s) => write!(f, "{}", s),
            Value::Tuple(items) => {
                write!(f, "(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    match item {
                        Value::Str(s) => write!(f, "'{}'", s)?,
                        other => write!(f, "{}", other)?,
                    }
                }
                if items.len() == 1 {
                    write!(f, ",")?;
                }
                write!(f, ")")
            }
            Value::Range { start, stop, step } if *step == 1 => write!(f, "range({}, {})", start, stop),
            Value::Range { start, stop, step } => write!(f, "range({}, {}, {})", start, stop, step),
            Value::Iter(_) => write!(f, "<iterator>"),
            Value::Code(code) => write!(f, "<code object {}>", code.name),
            Value::Function(func) => write!(f, "<function {}>", func.name),
            Value::Builtin(b) => write!(f, "<built-in function {}>", b.name),
        }
    }
}
