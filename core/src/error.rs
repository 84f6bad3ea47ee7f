use std::fmt;

/// Which side-table an operand indexes into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TableKind {
    Consts,
    Names,
    Locals,
}

impl fmt::Display for TableKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TableKind::Consts => write!(f, "constants"),
            TableKind::Names => write!(f, "names"),
            TableKind::Locals => write!(f, "locals"),
        }
    }
}

/// Failure raised anywhere along the decode -> rewrite -> encode pipeline.
///
/// Every variant except [`PatchError::PatternNotFound`] means the input (or a
/// pattern) is malformed; callers are expected to abort the patch and keep the
/// currently installed body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatchError {
    /// A rewrite found zero occurrences of its before-pattern.
    PatternNotFound,
    /// The payload contains an opcode outside the instruction catalog.
    UnknownInstruction { opcode: u8, position: usize },
    /// A jump points outside the sequence or at a removed instruction.
    UnresolvedJumpTarget { position: usize, target: usize },
    /// Appending to a side-table would exceed the one-byte operand range.
    SideTableOverflow { table: TableKind, size: usize },
    /// Payload length is not a whole number of instructions.
    Truncated { len: usize },
    /// A jump displacement cannot be encoded in one operand byte.
    JumpOutOfRange { position: usize, offset: isize },
    /// A wildcard operand was not bound when it had to be materialized.
    UnboundWildcard { symbol: String },
    /// The replacement body does not match the function it is installed into.
    IncompatibleInstall { reason: String },
}

impl fmt::Display for PatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PatchError::PatternNotFound => write!(f, "pattern not found"),
            PatchError::UnknownInstruction { opcode, position } => {
                write!(f, "unknown opcode {} at byte {}", opcode, position)
            }
            PatchError::UnresolvedJumpTarget { position, target } => {
                write!(f, "jump at byte {} targets unresolvable offset {}", position, target)
            }
            PatchError::SideTableOverflow { table, size } => {
                write!(f, "{} table overflow: {} entries do not fit a one-byte operand", table, size)
            }
            PatchError::Truncated { len } => {
                write!(f, "payload of {} bytes is not a whole number of instructions", len)
            }
            PatchError::JumpOutOfRange { position, offset } => {
                write!(f, "jump at byte {} needs operand {} which is out of range", position, offset)
            }
            PatchError::UnboundWildcard { symbol } => write!(f, "wildcard `{}` has no binding", symbol),
            PatchError::IncompatibleInstall { reason } => write!(f, "cannot install patched body: {}", reason),
        }
    }
}

impl std::error::Error for PatchError {}

pub type PatchResult<T> = Result<T, PatchError>;
