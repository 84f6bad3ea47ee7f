use std::fmt;
use std::sync::Arc;

use crate::code::{Const, SideTables};

use super::opcode::{OperandKind, Opcode};

/// Stable handle of an instruction inside a [`Sequence`](super::Sequence) arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstrId(u32);

impl InstrId {
    #[inline]
    pub(crate) fn new(index: usize) -> Self {
        Self(index as u32)
    }

    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Raw operand of an instruction or pattern template.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Operand {
    /// The encoded operand byte.
    Index(u8),
    /// Matches any operand and binds nothing.
    Any,
    /// Matches any operand and captures it under a symbol.
    Bind(Arc<str>),
}

impl Operand {
    pub fn bind(symbol: &str) -> Self {
        Operand::Bind(Arc::from(symbol))
    }

    #[inline]
    pub fn raw(&self) -> Option<u8> {
        match self {
            Operand::Index(v) => Some(*v),
            _ => None,
        }
    }

    #[inline]
    pub fn is_wildcard(&self) -> bool {
        !matches!(self, Operand::Index(_))
    }

    /// Pattern equality: a wildcard on either side matches, otherwise the raw
    /// operand bytes must be identical.
    pub fn matches(&self, other: &Operand) -> bool {
        match (self, other) {
            (Operand::Index(a), Operand::Index(b)) => a == b,
            _ => true,
        }
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Index(v) => write!(f, "{}", v),
            Operand::Any => write!(f, "_"),
            Operand::Bind(sym) => write!(f, "{}", sym),
        }
    }
}

/// The side-table value an operand index currently denotes.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolved {
    Const(Const),
    Name(Arc<str>),
    Local(Arc<str>),
}

impl Resolved {
    pub fn as_const(&self) -> Option<&Const> {
        match self {
            Resolved::Const(c) => Some(c),
            _ => None,
        }
    }

    /// Variable name for name and local-slot operands.
    pub fn as_var(&self) -> Option<&str> {
        match self {
            Resolved::Name(n) | Resolved::Local(n) => Some(n),
            Resolved::Const(_) => None,
        }
    }
}

impl fmt::Display for Resolved {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resolved::Const(c) => write!(f, "{}", c),
            Resolved::Name(n) | Resolved::Local(n) => write!(f, "{}", n),
        }
    }
}

/// One decoded instruction.
#[derive(Debug, Clone)]
pub struct Instr {
    pub op: Opcode,
    pub operand: Operand,
    pub resolved: Option<Resolved>,
    /// Instructions whose results this one consumes, in catalog pop order.
    pub producers: Vec<InstrId>,
    /// Resolved destination for jump kinds.
    pub target: Option<InstrId>,
    /// Byte offset; refreshed by every structural edit.
    pub pos: usize,
    pub(crate) dead: bool,
}

impl Instr {
    pub fn new(op: Opcode, operand: Operand) -> Self {
        Self {
            op,
            operand,
            resolved: None,
            producers: Vec::new(),
            target: None,
            pos: 0,
            dead: false,
        }
    }

    #[inline]
    pub fn raw(&self) -> Option<u8> {
        self.operand.raw()
    }

    #[inline]
    pub fn is_jump(&self) -> bool {
        self.op.is_jump()
    }

    #[inline]
    pub fn is_dead(&self) -> bool {
        self.dead
    }

    /// Pattern equality; positions and producer links are ignored.
    pub fn matches(&self, other: &Instr) -> bool {
        self.op == other.op && self.operand.matches(&other.operand)
    }

    /// Recomputes [`Instr::resolved`] from the operand index.
    pub fn resolve(&mut self, tables: &SideTables) {
        let Some(idx) = self.raw().map(usize::from) else {
            self.resolved = None;
            return;
        };
        self.resolved = match self.op.operand_kind() {
            OperandKind::Const => tables.consts.get(idx).cloned().map(Resolved::Const),
            OperandKind::Name => tables.names.get(idx).cloned().map(Resolved::Name),
            OperandKind::Local => tables.locals.get(idx).cloned().map(Resolved::Local),
            _ => None,
        };
    }

    /// Name of the variable a load/store touches.
    pub fn var_name(&self) -> Option<&str> {
        self.resolved.as_ref().and_then(Resolved::as_var)
    }
}

impl fmt::Display for Instr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}[{}]", self.pos, self.op, self.operand)?;
        match &self.resolved {
            Some(value) => write!(f, "({})", value),
            None => write!(f, "()"),
        }
    }
}
