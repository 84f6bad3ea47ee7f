//! Local optimizer: redundant store/load elimination and table compaction.

use std::sync::Arc;

use rustc_hash::FxHashMap;
use tracing::{debug, trace};

use crate::code::SideTables;
use crate::error::PatchResult;
use crate::ir::{InstrId, Opcode, Operand, OperandKind, Sequence};

/// Leading table entries compaction must keep in place.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Pinned {
    /// Constant slots kept at the front (slot 0 holds the doc string).
    pub consts: usize,
    /// Local slots kept at the front (the parameters).
    pub locals: usize,
}

/// Removes `STORE x ... LOAD x` pairs whose load is the only read of `x`,
/// letting the stored value flow straight to the load's consumer. Runs to a
/// fixed point and returns the number of pairs removed.
pub fn eliminate_store_loads(seq: &mut Sequence) -> PatchResult<usize> {
    let mut removed = 0;
    while let Some((store, load)) = find_pair(seq) {
        let (Some(store_idx), Some(load_idx)) = (seq.index_of(store), seq.index_of(load)) else {
            break;
        };
        trace!(
            target: "bytepatch::optimize",
            store = %seq.get(store),
            load = %seq.get(load),
            "eliminating pair"
        );
        seq.kill_at(load_idx)?;
        seq.kill_at(store_idx)?;
        seq.purge();
        seq.resync();
        removed += 1;
    }
    Ok(removed)
}

/// One backward scan. Returns the first eliminable (store, load) pair.
fn find_pair(seq: &Sequence) -> Option<(InstrId, InstrId)> {
    let mut tracked: Option<InstrId> = None;
    for idx in (0..seq.len()).rev() {
        let id = seq.ids()[idx];
        let instr = seq.get(id);

        if instr.op == Opcode::PopBlock {
            tracked = None;
            continue;
        }

        if instr.op.is_store_var() {
            if let Some(load) = tracked {
                let load_instr = seq.get(load);
                if same_slot(instr.op, load_instr.op)
                    && instr.raw() == load_instr.raw()
                    && instr.pos < load_instr.pos
                    && is_sole_read(seq, load)
                    && passes_through(seq, idx, load)
                {
                    return Some((id, load));
                }
                // Any earlier store to this slot is overwritten before the load.
                if same_slot(instr.op, load_instr.op) && instr.raw() == load_instr.raw() {
                    tracked = None;
                }
            }
        }

        let consumed = instr
            .producers
            .iter()
            .copied()
            .find(|p| seq.get(*p).op.is_load_var());
        if consumed.is_some() {
            tracked = consumed;
        }
    }
    None
}

fn same_slot(store: Opcode, load: Opcode) -> bool {
    matches!(
        (store, load),
        (Opcode::StoreFast, Opcode::LoadFast) | (Opcode::StoreName, Opcode::LoadName)
    )
}

/// No other instruction anywhere reads the variable `load` reads.
fn is_sole_read(seq: &Sequence, load: InstrId) -> bool {
    let load_instr = seq.get(load);
    let Some(name) = load_instr.var_name() else {
        return false;
    };
    let reads = |s: &Sequence, kind: OperandKind| {
        s.iter()
            .filter(|i| i.op.operand_kind() == kind && !i.op.is_store_var() && i.var_name() == Some(name))
            .count()
    };
    let kind = load_instr.op.operand_kind();
    if reads(seq, kind) != 1 {
        return false;
    }
    // Nested bodies can observe module-level names.
    kind == OperandKind::Local || seq.nested().iter().all(|(_, inner)| reads_name(inner, name) == 0)
}

fn reads_name(seq: &Sequence, name: &str) -> usize {
    let own = seq
        .iter()
        .filter(|i| i.op.operand_kind() == OperandKind::Name && !i.op.is_store_var() && i.var_name() == Some(name))
        .count();
    own + seq.nested().iter().map(|(_, inner)| reads_name(inner, name)).sum::<usize>()
}

/// The stored value can stay on the stack until the load: everything in
/// between is straight-line code that never reaches below it.
fn passes_through(seq: &Sequence, store_idx: usize, load: InstrId) -> bool {
    let Some(load_idx) = seq.index_of(load) else {
        return false;
    };
    let span = &seq.ids()[store_idx + 1..=load_idx];
    let targeted = |id: &InstrId| seq.iter().any(|i| i.target == Some(*id));
    if span.iter().any(targeted) {
        return false;
    }
    let mut depth: isize = 0;
    for id in &span[..span.len() - 1] {
        let instr = seq.get(*id);
        if instr.is_jump() {
            return false;
        }
        depth -= instr.op.pops(instr.raw().unwrap_or(0)) as isize;
        if depth < 0 {
            return false;
        }
        depth += instr.op.pushes() as isize;
    }
    depth == 0
}

/// Rebuilds the side-tables so they hold only entries still referenced,
/// in first-use order after the pinned prefix, and rewrites every operand.
pub fn compact_tables(seq: &mut Sequence, pinned: Pinned) {
    let old = std::mem::take(&mut seq.tables);
    let mut tables = SideTables::new();
    let mut consts: FxHashMap<u8, u8> = FxHashMap::default();
    let mut names: FxHashMap<u8, u8> = FxHashMap::default();
    let mut locals: FxHashMap<u8, u8> = FxHashMap::default();

    for (idx, value) in old.consts.iter().take(pinned.consts).enumerate() {
        consts.insert(idx as u8, idx as u8);
        tables.consts.push(value.clone());
    }
    for (idx, name) in old.locals.iter().take(pinned.locals).enumerate() {
        locals.insert(idx as u8, idx as u8);
        tables.locals.push(name.clone());
    }

    for id in seq.ids().to_vec() {
        let instr = seq.get_mut(id);
        let Operand::Index(raw) = instr.operand else {
            continue;
        };
        let mapped = match instr.op.operand_kind() {
            OperandKind::Const => old
                .consts
                .get(raw as usize)
                .map(|value| remap(&mut consts, raw, &mut tables.consts, value.clone())),
            OperandKind::Name => old
                .names
                .get(raw as usize)
                .map(|name| remap(&mut names, raw, &mut tables.names, Arc::clone(name))),
            OperandKind::Local => old
                .locals
                .get(raw as usize)
                .map(|name| remap(&mut locals, raw, &mut tables.locals, Arc::clone(name))),
            _ => None,
        };
        if let Some(index) = mapped {
            instr.operand = Operand::Index(index);
        }
    }

    let nested = std::mem::take(seq.nested_mut());
    *seq.nested_mut() = nested
        .into_iter()
        .filter_map(|(key, inner)| consts.get(&key).map(|&k| (k, inner)))
        .collect();

    debug!(
        target: "bytepatch::optimize",
        consts_before = old.consts.len(),
        consts = tables.consts.len(),
        names_before = old.names.len(),
        names = tables.names.len(),
        locals_before = old.locals.len(),
        locals = tables.locals.len(),
        "compacted tables"
    );
    seq.tables = tables;
    seq.resync();
}

// Compacted tables never outgrow the originals, so the new index fits a byte.
fn remap<T>(map: &mut FxHashMap<u8, u8>, raw: u8, table: &mut Vec<T>, value: T) -> u8 {
    *map.entry(raw).or_insert_with(|| {
        table.push(value);
        (table.len() - 1) as u8
    })
}

/// Store/load elimination followed by table compaction.
pub fn optimize(seq: &mut Sequence, pinned: Pinned) -> PatchResult<usize> {
    let removed = eliminate_store_loads(seq)?;
    compact_tables(seq, pinned);
    debug!(target: "bytepatch::optimize", removed, len = seq.len(), "optimized sequence");
    Ok(removed)
}
