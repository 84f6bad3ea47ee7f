use tracing::debug;

use crate::code::SideTables;
use crate::error::PatchResult;
use crate::ir::{Opcode, Operand, OperandKind, Sequence};

/// Re-expresses `fragment` against `host`.
///
/// Every constant and local slot of the fragment is looked up in the host
/// tables and appended when missing; names are folded the same way. With
/// `promote_names`, `LOAD_NAME`/`STORE_NAME` are turned into
/// `LOAD_FAST`/`STORE_FAST` and the names they touch land in the local-slot
/// table instead. Merging the same fragment again appends nothing.
///
/// The returned sequence carries a copy of the updated host tables.
pub fn merge_fragment(host: &mut SideTables, fragment: &Sequence, promote_names: bool) -> PatchResult<Sequence> {
    let foreign = &fragment.tables;
    let (before_consts, before_names, before_locals) = (host.consts.len(), host.names.len(), host.locals.len());

    let consts = foreign
        .consts
        .iter()
        .map(|value| host.intern_const(value))
        .collect::<PatchResult<Vec<_>>>()?;
    let locals = foreign
        .locals
        .iter()
        .map(|name| host.intern_local(name))
        .collect::<PatchResult<Vec<_>>>()?;

    // A name only moves to the local-slot table if some promoted access uses
    // it; global loads keep their name entry.
    let mut names = vec![None; foreign.names.len()];
    let mut promoted = vec![None; foreign.names.len()];
    for (idx, name) in foreign.names.iter().enumerate() {
        let (mut as_name, mut as_local) = (false, false);
        for instr in fragment.iter().filter(|i| i.raw() == Some(idx as u8)) {
            match instr.op.operand_kind() {
                OperandKind::Name if promote_names && promotable(instr.op).is_some() => as_local = true,
                OperandKind::Name => as_name = true,
                _ => {}
            }
        }
        if as_name || !promote_names {
            names[idx] = Some(host.intern_name(name)?);
        }
        if as_local {
            promoted[idx] = Some(host.intern_local(name)?);
        }
    }

    let mut merged = fragment.clone();
    for id in fragment.ids() {
        let instr = merged.get_mut(*id);
        let Some(raw) = instr.raw().map(usize::from) else {
            continue;
        };
        let remapped = match instr.op.operand_kind() {
            OperandKind::Const => consts.get(raw).copied(),
            OperandKind::Local => locals.get(raw).copied(),
            OperandKind::Name => match promotable(instr.op).filter(|_| promote_names) {
                Some(fast) => {
                    instr.op = fast;
                    promoted.get(raw).copied().flatten()
                }
                None => names.get(raw).copied().flatten(),
            },
            _ => None,
        };
        if let Some(index) = remapped {
            instr.operand = Operand::Index(index);
        }
    }
    for (key, _) in merged.nested_mut().iter_mut() {
        if let Some(&index) = consts.get(*key as usize) {
            *key = index;
        }
    }
    merged.tables = host.clone();
    merged.resync();

    debug!(
        target: "bytepatch::rewrite",
        consts_added = host.consts.len() - before_consts,
        names_added = host.names.len() - before_names,
        locals_added = host.locals.len() - before_locals,
        promote_names,
        "merged fragment tables"
    );
    Ok(merged)
}

fn promotable(op: Opcode) -> Option<Opcode> {
    match op {
        Opcode::LoadName => Some(Opcode::LoadFast),
        Opcode::StoreName => Some(Opcode::StoreFast),
        _ => None,
    }
}
