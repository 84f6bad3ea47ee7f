use std::collections::VecDeque;
use std::sync::Arc;

use rustc_hash::FxHashMap;
use tracing::{debug, trace};

use crate::error::{PatchError, PatchResult};
use crate::ir::{INSTR_WIDTH, Instr, InstrId, Operand, Sequence};

use super::pattern::Pattern;

/// Start indices of every non-overlapping occurrence of `pattern`, scanning
/// left to right.
pub fn find_matches(seq: &Sequence, pattern: &Pattern) -> Vec<usize> {
    let mut starts = Vec::new();
    if pattern.is_empty() {
        return starts;
    }
    let mut idx = 0;
    while idx + pattern.len() <= seq.len() {
        if pattern.matches_at(seq, idx) {
            starts.push(idx);
            idx += pattern.len();
        } else {
            idx += 1;
        }
    }
    starts
}

/// Replaces every occurrence of `before` in `seq` by an instance of `after`.
///
/// Returns the number of occurrences rewritten, or
/// [`PatchError::PatternNotFound`] when there were none. On any error `seq`
/// is left exactly as it was.
pub fn match_and_replace(seq: &mut Sequence, before: &Pattern, after: &Pattern) -> PatchResult<usize> {
    let starts = find_matches(seq, before);
    if starts.is_empty() {
        trace!(target: "bytepatch::rewrite", pattern = %before, "no occurrence");
        return Err(PatchError::PatternNotFound);
    }

    let mut work = seq.clone();
    // Back to front: slots spliced in for one occurrence never shift the
    // start index of an earlier one.
    for &start in starts.iter().rev() {
        rewrite_at(&mut work, start, before, after)?;
    }
    work.purge();
    work.resync();

    debug!(
        target: "bytepatch::rewrite",
        before = %before,
        after = %after,
        matches = starts.len(),
        len = work.len(),
        "rewrote sequence"
    );
    *seq = work;
    Ok(starts.len())
}

fn rewrite_at(seq: &mut Sequence, start: usize, before: &Pattern, after: &Pattern) -> PatchResult<()> {
    let mut captures: FxHashMap<Arc<str>, VecDeque<InstrId>> = FxHashMap::default();
    for (k, pat) in before.ops().iter().enumerate() {
        if let Operand::Bind(symbol) = &pat.operand {
            captures.entry(symbol.clone()).or_default().push_back(seq.ids()[start + k]);
        }
    }

    let fresh = instantiate(seq, after, &mut captures)?;

    let mut idx = start;
    for k in 0..before.len().max(after.len()) {
        match (k < before.len(), fresh.get(k)) {
            (true, Some(&new)) => seq.substitute_at(idx, new),
            (true, None) => seq.kill_at(idx)?,
            (false, Some(&new)) => seq.order_mut().insert(idx, new),
            (false, None) => break,
        }
        idx += 1;
    }
    trace!(target: "bytepatch::rewrite", start, "occurrence rewritten");
    Ok(())
}

/// Allocates the instructions of `after` in the arena, binding wildcards
/// from `captures` and linking jumps between templates.
fn instantiate(
    seq: &mut Sequence,
    after: &Pattern,
    captures: &mut FxHashMap<Arc<str>, VecDeque<InstrId>>,
) -> PatchResult<Vec<InstrId>> {
    let mut fresh = Vec::with_capacity(after.len());
    for pat in after.ops() {
        let mut instr = Instr::new(pat.op, pat.operand.clone());
        match &pat.operand {
            Operand::Index(_) => {}
            Operand::Any if pat.target.is_some() => instr.operand = Operand::Index(0),
            Operand::Any => return Err(PatchError::UnboundWildcard { symbol: "_".to_string() }),
            Operand::Bind(symbol) => {
                let source = captures
                    .get_mut(symbol)
                    .and_then(VecDeque::pop_front)
                    .ok_or_else(|| PatchError::UnboundWildcard { symbol: symbol.to_string() })?;
                let captured = seq.get(source);
                instr.operand = captured.operand.clone();
                instr.resolved = captured.resolved.clone();
                instr.target = captured.target;
            }
        }
        fresh.push(seq.alloc(instr));
    }

    for (k, pat) in after.ops().iter().enumerate() {
        if let Some(target) = pat.target {
            let dest = *fresh.get(target).ok_or(PatchError::UnresolvedJumpTarget {
                position: k * INSTR_WIDTH,
                target: target * INSTR_WIDTH,
            })?;
            seq.get_mut(fresh[k]).target = Some(dest);
        }
    }
    Ok(fresh)
}
