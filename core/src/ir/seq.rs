use std::fmt;

use tracing::{debug, trace};

use crate::code::{CodeUnit, SideTables};
use crate::error::{PatchError, PatchResult};

use super::encode::encode;
use super::instr::{Instr, InstrId, Operand};
use super::opcode::{INSTR_WIDTH, JumpMode, PopOrder};

/// An ordered instruction sequence backed by an arena.
///
/// Instructions are addressed by [`InstrId`]; jump targets and producer links
/// are ids, so relocating a jump is a single index update. `order` lists the
/// live program order. Every public mutator leaves positions, jump operands,
/// resolved operands and producer links in sync with `order`.
#[derive(Debug, Clone, Default)]
pub struct Sequence {
    instrs: Vec<Instr>,
    order: Vec<InstrId>,
    pub tables: SideTables,
    nested: Vec<(u8, Sequence)>,
}

impl Sequence {
    pub fn new(tables: SideTables) -> Self {
        Self {
            tables,
            ..Self::default()
        }
    }

    /// Builds a sequence from instructions in program order. Jump targets on
    /// the given instructions must already use ids equal to their index.
    pub(crate) fn from_parts(instrs: Vec<Instr>, tables: SideTables, nested: Vec<(u8, Sequence)>) -> Self {
        let order = (0..instrs.len()).map(InstrId::new).collect();
        let mut seq = Self {
            instrs,
            order,
            tables,
            nested,
        };
        seq.resync();
        seq
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.order.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Live instruction ids in program order.
    #[inline]
    pub fn ids(&self) -> &[InstrId] {
        &self.order
    }

    #[inline]
    pub fn get(&self, id: InstrId) -> &Instr {
        &self.instrs[id.index()]
    }

    #[inline]
    pub(crate) fn get_mut(&mut self, id: InstrId) -> &mut Instr {
        &mut self.instrs[id.index()]
    }

    /// Instruction at program index `idx`.
    #[inline]
    pub fn at(&self, idx: usize) -> &Instr {
        self.get(self.order[idx])
    }

    pub fn iter(&self) -> impl Iterator<Item = &Instr> + '_ {
        self.order.iter().map(move |id| self.get(*id))
    }

    pub fn index_of(&self, id: InstrId) -> Option<usize> {
        self.order.iter().position(|&o| o == id)
    }

    /// Program index of the instruction `id` jumps to.
    pub fn target_index(&self, id: InstrId) -> Option<usize> {
        self.get(id).target.and_then(|t| self.index_of(t))
    }

    /// Decoded bodies of code-valued constants, keyed by constant index.
    pub fn nested(&self) -> &[(u8, Sequence)] {
        &self.nested
    }

    pub fn nested_for(&self, const_idx: u8) -> Option<&Sequence> {
        self.nested.iter().find(|(k, _)| *k == const_idx).map(|(_, s)| s)
    }

    pub(crate) fn nested_mut(&mut self) -> &mut Vec<(u8, Sequence)> {
        &mut self.nested
    }

    /// Adds an instruction to the arena without placing it in program order.
    pub(crate) fn alloc(&mut self, mut instr: Instr) -> InstrId {
        instr.dead = false;
        self.instrs.push(instr);
        InstrId::new(self.instrs.len() - 1)
    }

    pub(crate) fn order_mut(&mut self) -> &mut Vec<InstrId> {
        &mut self.order
    }

    /// Points every live jump targeting `from` at `to`. Returns how many moved.
    pub(crate) fn redirect_jumps(&mut self, from: InstrId, to: InstrId) -> usize {
        let mut moved = 0;
        for instr in self.instrs.iter_mut().filter(|i| !i.dead) {
            if instr.target == Some(from) {
                instr.target = Some(to);
                moved += 1;
            }
        }
        if moved > 0 {
            trace!(target: "bytepatch::seq", from = from.index(), to = to.index(), moved, "redirected jumps");
        }
        moved
    }

    /// First live instruction after program index `idx`, else the first live
    /// one before it.
    pub(crate) fn nearest_live(&self, idx: usize) -> Option<InstrId> {
        let forward = self.order[idx + 1..].iter().copied().find(|id| !self.get(*id).dead);
        forward.or_else(|| self.order[..idx].iter().rev().copied().find(|id| !self.get(*id).dead))
    }

    /// Marks the instruction at `idx` dead and moves jumps that targeted it to
    /// its nearest live neighbor. The slot stays in `order` until [`Self::purge`].
    pub(crate) fn kill_at(&mut self, idx: usize) -> PatchResult<()> {
        let id = self.order[idx];
        let jumper = self
            .instrs
            .iter()
            .enumerate()
            .find(|(k, i)| *k != id.index() && !i.dead && i.target == Some(id))
            .map(|(_, i)| i.pos);
        let neighbor = match jumper {
            Some(jump_pos) => Some(self.nearest_live(idx).ok_or(PatchError::UnresolvedJumpTarget {
                position: jump_pos,
                target: self.get(id).pos,
            })?),
            None => None,
        };
        self.get_mut(id).dead = true;
        if let Some(neighbor) = neighbor {
            self.redirect_jumps(id, neighbor);
        }
        Ok(())
    }

    /// Puts the arena instruction `new` in place of the one at `idx`,
    /// carrying over every jump that targeted the old instruction.
    pub(crate) fn substitute_at(&mut self, idx: usize, new: InstrId) {
        let old = self.order[idx];
        self.get_mut(old).dead = true;
        self.redirect_jumps(old, new);
        self.order[idx] = new;
    }

    /// Drops dead slots from program order.
    pub(crate) fn purge(&mut self) {
        let instrs = &self.instrs;
        self.order.retain(|id| !instrs[id.index()].dead);
    }

    /// Removes the instruction at `idx`, relocating jumps that targeted it.
    pub fn remove(&mut self, idx: usize) -> PatchResult<InstrId> {
        let id = self.order[idx];
        self.kill_at(idx)?;
        self.purge();
        self.resync();
        Ok(id)
    }

    /// Inserts `instr` before program index `idx` without touching any jump.
    pub fn insert(&mut self, idx: usize, instr: Instr) -> InstrId {
        let id = self.alloc(instr);
        self.order.insert(idx, id);
        self.resync();
        id
    }

    /// Replaces the instruction at `idx`; jumps to the old one follow.
    pub fn replace(&mut self, idx: usize, instr: Instr) -> InstrId {
        let id = self.alloc(instr);
        self.substitute_at(idx, id);
        self.resync();
        id
    }

    /// Re-derives every position-dependent fact from program order:
    /// byte positions, resolved operands, jump operand bytes and producer links.
    pub fn resync(&mut self) {
        for (idx, id) in self.order.iter().enumerate() {
            self.instrs[id.index()].pos = idx * INSTR_WIDTH;
        }
        let order = std::mem::take(&mut self.order);
        for id in &order {
            let pos = self.instrs[id.index()].pos;
            let target_pos = self.instrs[id.index()].target.map(|t| self.instrs[t.index()].pos);
            let instr = &mut self.instrs[id.index()];
            instr.resolve(&self.tables);
            if let (Some(mode), Some(target_pos), Operand::Index(_)) = (instr.op.jump_mode(), target_pos, &instr.operand) {
                if let Ok(raw) = u8::try_from(jump_operand(mode, pos, target_pos)) {
                    instr.operand = Operand::Index(raw);
                }
            }
        }
        self.order = order;
        self.link_producers();
    }

    /// Rebuilds producer links with a model stack of pending producers.
    fn link_producers(&mut self) {
        let mut pending: Vec<InstrId> = Vec::new();
        for idx in 0..self.order.len() {
            let id = self.order[idx];
            let instr = &self.instrs[id.index()];
            let want = instr.op.pops(instr.raw().unwrap_or(0));
            let take = want.min(pending.len());
            if take < want {
                debug!(
                    target: "bytepatch::seq",
                    op = %instr.op,
                    pos = instr.pos,
                    want,
                    have = pending.len(),
                    "model stack underflow"
                );
            }
            let mut producers = pending.split_off(pending.len() - take);
            if instr.op.info().pop_order == PopOrder::TopFirst {
                producers.reverse();
            }
            let pushes = instr.op.pushes();
            self.instrs[id.index()].producers = producers;
            pending.extend(std::iter::repeat_n(id, pushes));
        }
    }

    /// Encodes the sequence and wraps it in a unit that keeps `template`'s
    /// metadata.
    pub fn to_unit(&self, template: &CodeUnit) -> PatchResult<CodeUnit> {
        self.tables.check_bounds()?;
        let code = encode(self)?;
        Ok(template.with_body(code, self.tables.clone()))
    }
}

/// Operand value a jump at `pos` needs to reach `target`.
#[inline]
pub(crate) fn jump_operand(mode: JumpMode, pos: usize, target: usize) -> isize {
    match mode {
        JumpMode::Relative => target as isize - (pos + INSTR_WIDTH) as isize,
        JumpMode::Absolute => target as isize,
    }
}

impl fmt::Display for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for instr in self.iter() {
            writeln!(f, "{}", instr)?;
        }
        for (idx, nested) in &self.nested {
            writeln!(f, "-- const {} --", idx)?;
            for line in nested.to_string().lines() {
                writeln!(f, "    {}", line)?;
            }
        }
        Ok(())
    }
}
