use crate::error::{PatchError, PatchResult};

use super::instr::Operand;
use super::opcode::INSTR_WIDTH;
use super::seq::{Sequence, jump_operand};

/// Serializes a sequence back to its byte payload.
///
/// Jump operands are recomputed from the live position of each target, so a
/// sequence edited through its own mutators always encodes consistently.
pub fn encode(seq: &Sequence) -> PatchResult<Vec<u8>> {
    let mut out = Vec::with_capacity(seq.len() * INSTR_WIDTH);
    for (idx, id) in seq.ids().iter().enumerate() {
        let instr = seq.get(*id);
        let position = idx * INSTR_WIDTH;
        let operand = match (instr.op.jump_mode(), instr.target) {
            (Some(mode), Some(target)) => {
                let target_idx = seq.index_of(target).ok_or(PatchError::UnresolvedJumpTarget {
                    position,
                    target: seq.get(target).pos,
                })?;
                let offset = jump_operand(mode, position, target_idx * INSTR_WIDTH);
                u8::try_from(offset).map_err(|_| PatchError::JumpOutOfRange { position, offset })?
            }
            _ => match &instr.operand {
                Operand::Index(raw) => *raw,
                Operand::Any => {
                    return Err(PatchError::UnboundWildcard { symbol: "_".to_string() });
                }
                Operand::Bind(symbol) => {
                    return Err(PatchError::UnboundWildcard { symbol: symbol.to_string() });
                }
            },
        };
        out.push(instr.op.byte());
        out.push(operand);
    }
    Ok(out)
}
