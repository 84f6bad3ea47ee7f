use std::fmt;
use std::sync::Arc;

use super::unit::CodeUnit;

/// A constant-table entry.
///
/// Equality is strict per variant: `Int(1)` never equals `Float(1.0)` or
/// `Bool(true)`, and floats compare by bit pattern so that de-duplicating a
/// table is deterministic even for NaN.
#[derive(Debug, Clone)]
pub enum Const {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Arc<str>),
    Tuple(Arc<[Const]>),
    Code(Arc<CodeUnit>),
}

impl Const {
    pub fn str(value: &str) -> Self {
        Const::Str(Arc::from(value))
    }

    pub fn tuple(items: Vec<Const>) -> Self {
        Const::Tuple(items.into())
    }

    pub fn code(unit: CodeUnit) -> Self {
        Const::Code(Arc::new(unit))
    }

    #[inline]
    pub fn is_none(&self) -> bool {
        matches!(self, Const::None)
    }

    pub fn as_code(&self) -> Option<&Arc<CodeUnit>> {
        match self {
            Const::Code(unit) => Some(unit),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Const::None => "NoneType",
            Const::Bool(_) => "bool",
            Const::Int(_) => "int",
            Const::Float(_) => "float",
            Const::Str(_) => "str",
            Const::Tuple(_) => "tuple",
            Const::Code(_) => "code",
        }
    }
}

impl PartialEq for Const {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Const::None, Const::None) => true,
            (Const::Bool(a), Const::Bool(b)) => a == b,
            (Const::Int(a), Const::Int(b)) => a == b,
            (Const::Float(a), Const::Float(b)) => a.to_bits() == b.to_bits(),
            (Const::Str(a), Const::Str(b)) => a == b,
            (Const::Tuple(a), Const::Tuple(b)) => a == b,
            (Const::Code(a), Const::Code(b)) => Arc::ptr_eq(a, b) || a == b,
            _ => false,
        }
    }
}

impl fmt::Display for Const {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Const::None => write!(f, "None"),
            Const::Bool(true) => write!(f, "True"),
            Const::Bool(false) => write!(f, "False"),
            Const::Int(i) => write!(f, "{}", i),
            Const::Float(x) if x.fract() == 0.0 && x.is_finite() => write!(f, "{:.1}", x),
            Const::Float(x) => write!(f, "{}", x),
            Const::Str(s) => write!(f, "{:?}", s),
            Const::Tuple(items) => {
                write!(f, "(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                if items.len() == 1 {
                    write!(f, ",")?;
                }
                write!(f, ")")
            }
            Const::Code(unit) => write!(f, "<code {}>", unit.name),
        }
    }
}
