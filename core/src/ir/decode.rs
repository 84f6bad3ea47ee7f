use tracing::debug;

use crate::code::{CodeUnit, Const, SideTables};
use crate::error::{PatchError, PatchResult};

use super::instr::{Instr, InstrId, Operand};
use super::opcode::{INSTR_WIDTH, JumpMode, Opcode};
use super::seq::Sequence;

/// Decodes a unit's payload against its own side tables. Code-valued
/// constants are decoded recursively and kept as nested sequences.
pub fn decode(unit: &CodeUnit) -> PatchResult<Sequence> {
    unit.tables.check_bounds()?;
    let mut nested = Vec::new();
    for (idx, value) in unit.tables.consts.iter().enumerate() {
        if let Const::Code(inner) = value {
            // Tables are bounded to 256 entries, so the index fits.
            nested.push((idx as u8, decode(inner)?));
        }
    }
    let instrs = decode_instrs(&unit.code)?;
    debug!(
        target: "bytepatch::decode",
        unit = %unit.name,
        instrs = instrs.len(),
        nested = nested.len(),
        "decoded unit"
    );
    Ok(Sequence::from_parts(instrs, unit.tables.clone(), nested))
}

/// Decodes a bare payload. Operands resolve against `tables`; indices that
/// fall outside them are left unresolved.
pub fn decode_raw(code: &[u8], tables: SideTables) -> PatchResult<Sequence> {
    let instrs = decode_instrs(code)?;
    Ok(Sequence::from_parts(instrs, tables, Vec::new()))
}

fn decode_instrs(code: &[u8]) -> PatchResult<Vec<Instr>> {
    if code.len() % INSTR_WIDTH != 0 {
        return Err(PatchError::Truncated { len: code.len() });
    }
    let mut instrs = Vec::with_capacity(code.len() / INSTR_WIDTH);
    for (idx, pair) in code.chunks_exact(INSTR_WIDTH).enumerate() {
        let position = idx * INSTR_WIDTH;
        let (byte, arg) = (pair[0], pair[1]);
        let op = Opcode::from_byte(byte).ok_or(PatchError::UnknownInstruction { opcode: byte, position })?;
        let mut instr = Instr::new(op, Operand::Index(arg));
        instr.pos = position;
        if let Some(mode) = op.jump_mode() {
            let target = match mode {
                JumpMode::Relative => position + INSTR_WIDTH + arg as usize,
                JumpMode::Absolute => arg as usize,
            };
            if target >= code.len() || target % INSTR_WIDTH != 0 {
                return Err(PatchError::UnresolvedJumpTarget { position, target });
            }
            instr.target = Some(InstrId::new(target / INSTR_WIDTH));
        }
        instrs.push(instr);
    }
    Ok(instrs)
}
