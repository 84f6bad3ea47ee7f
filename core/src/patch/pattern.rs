use std::fmt;

use tracing::trace;

use crate::code::{CodeUnit, Const};
use crate::error::PatchResult;
use crate::ir::{Opcode, Operand, Resolved, Sequence, decode};

/// One instruction template of a [`Pattern`].
#[derive(Debug, Clone, PartialEq)]
pub struct PatternOp {
    pub op: Opcode,
    pub operand: Operand,
    /// For jumps whose destination lies inside the same pattern: the index of
    /// that destination within the pattern.
    pub target: Option<usize>,
}

impl PatternOp {
    pub fn new(op: Opcode, operand: Operand) -> Self {
        Self {
            op,
            operand,
            target: None,
        }
    }

    /// Template with a concrete operand byte.
    pub fn arg(op: Opcode, raw: u8) -> Self {
        Self::new(op, Operand::Index(raw))
    }

    /// Template for an instruction whose operand is unused.
    pub fn bare(op: Opcode) -> Self {
        Self::arg(op, 0)
    }

    pub fn any(op: Opcode) -> Self {
        Self::new(op, Operand::Any)
    }

    pub fn bind(op: Opcode, symbol: &str) -> Self {
        Self::new(op, Operand::bind(symbol))
    }

    /// A jump to the template at `index` of the same pattern.
    pub fn jump_to(op: Opcode, index: usize) -> Self {
        Self {
            op,
            operand: Operand::Any,
            target: Some(index),
        }
    }
}

impl fmt::Display for PatternOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.target {
            Some(idx) => write!(f, "{}[->{}]", self.op, idx),
            None => write!(f, "{}[{}]", self.op, self.operand),
        }
    }
}

/// An instruction template sequence, matched and instantiated against a
/// host [`Sequence`]. Operand bytes are in the host's index space.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Pattern {
    ops: Vec<PatternOp>,
}

impl Pattern {
    pub fn new(ops: Vec<PatternOp>) -> Self {
        Self { ops }
    }

    /// Lifts a sequence into a pattern. Jumps that land inside the sequence
    /// keep that destination structurally; their operand byte becomes a
    /// wildcard because it is only meaningful at the fragment's own offsets.
    pub fn from_sequence(seq: &Sequence) -> Self {
        let ops = seq
            .ids()
            .iter()
            .map(|&id| {
                let instr = seq.get(id);
                match seq.target_index(id) {
                    Some(target) => PatternOp::jump_to(instr.op, target),
                    None => PatternOp::new(instr.op, instr.operand.clone()),
                }
            })
            .collect();
        Self { ops }
    }

    #[inline]
    pub fn ops(&self) -> &[PatternOp] {
        &self.ops
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Does the pattern match `seq` starting at program index `start`?
    pub fn matches_at(&self, seq: &Sequence, start: usize) -> bool {
        if start + self.ops.len() > seq.len() {
            return false;
        }
        self.ops.iter().enumerate().all(|(k, pat)| {
            let id = seq.ids()[start + k];
            let instr = seq.get(id);
            instr.op == pat.op
                && pat.operand.matches(&instr.operand)
                && pat.target.is_none_or(|t| seq.target_index(id) == Some(start + t))
        })
    }
}

impl From<Vec<PatternOp>> for Pattern {
    fn from(ops: Vec<PatternOp>) -> Self {
        Self::new(ops)
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for op in &self.ops {
            if !first {
                write!(f, "; ")?;
            }
            first = false;
            write!(f, "{}", op)?;
        }
        Ok(())
    }
}

/// Decodes a module-level snippet for use as a pattern and strips the
/// epilogue every such snippet is compiled with: a trailing
/// `LOAD_CONST None; RETURN_VALUE`, then a trailing `POP_TOP` left by an
/// expression statement.
pub fn decode_fragment(unit: &CodeUnit) -> PatchResult<Sequence> {
    let mut seq = decode(unit)?;
    let n = seq.len();
    if n >= 2 && seq.at(n - 1).op == Opcode::ReturnValue && loads_none(&seq, n - 2) {
        seq.remove(n - 1)?;
        seq.remove(n - 2)?;
    }
    if let Some(last) = seq.len().checked_sub(1) {
        if seq.at(last).op == Opcode::PopTop {
            seq.remove(last)?;
        }
    }
    trace!(target: "bytepatch::rewrite", unit = %unit.name, instrs = seq.len(), "fragment decoded");
    Ok(seq)
}

fn loads_none(seq: &Sequence, idx: usize) -> bool {
    let instr = seq.at(idx);
    instr.op == Opcode::LoadConst && matches!(instr.resolved, Some(Resolved::Const(Const::None)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code::UnitBuilder;

    #[test]
    fn fragment_epilogue_is_trimmed() {
        let mut b = UnitBuilder::module("<fragment>");
        b.load_name("p")
            .load_const(Const::Int(3))
            .op(Opcode::BinarySubtract)
            .op(Opcode::PopTop)
            .load_const(Const::None)
            .op(Opcode::ReturnValue);
        let seq = decode_fragment(&b.build().expect("build")).expect("fragment");
        let ops: Vec<_> = seq.iter().map(|i| i.op).collect();
        assert_eq!(ops, vec![Opcode::LoadName, Opcode::LoadConst, Opcode::BinarySubtract]);
    }

    #[test]
    fn assignment_fragment_keeps_its_store() {
        let mut b = UnitBuilder::module("<fragment>");
        b.load_const(Const::Int(1))
            .store_name("p")
            .load_const(Const::None)
            .op(Opcode::ReturnValue);
        let seq = decode_fragment(&b.build().expect("build")).expect("fragment");
        assert_eq!(seq.len(), 2);
        assert_eq!(seq.at(1).op, Opcode::StoreName);
    }

    #[test]
    fn inner_jumps_become_structural() {
        let mut b = UnitBuilder::module("<fragment>");
        let skip = b.label();
        b.load_name("c").jump(Opcode::PopJumpIfFalse, skip).op(Opcode::Nop).bind(skip).op(Opcode::Nop);
        let seq = decode_fragment(&b.build().expect("build")).expect("fragment");
        let pattern = Pattern::from_sequence(&seq);
        assert_eq!(pattern.ops()[1], PatternOp::jump_to(Opcode::PopJumpIfFalse, 3));
        assert_eq!(pattern.to_string(), "LOAD_NAME[0]; POP_JUMP_IF_FALSE[->3]; NOP[0]; NOP[0]");
    }
}
