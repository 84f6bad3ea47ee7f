use crate::error::{PatchError, PatchResult};
use crate::ir::{INSTR_WIDTH, JumpMode, Opcode};

use super::consts::Const;
use super::tables::SideTables;
use super::unit::{CO_NEWLOCALS, CO_NOFREE, CO_OPTIMIZED, CodeUnit};

/// Forward-referencable jump destination handed out by [`UnitBuilder::label`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label(usize);

#[derive(Debug, Clone, Copy)]
enum Arg {
    Raw(u8),
    Label(Label),
}

/// Assembles a [`CodeUnit`] instruction by instruction.
///
/// Operands given as values are interned into the unit's own tables, jumps
/// are given as labels and resolved when the unit is built. Errors are
/// deferred to [`UnitBuilder::build`] so emission can be chained.
pub struct UnitBuilder {
    name: String,
    argcount: u32,
    flags: u32,
    tables: SideTables,
    code: Vec<(Opcode, Arg)>,
    labels: Vec<Option<usize>>,
    error: Option<PatchError>,
}

impl UnitBuilder {
    /// A function body. Parameters occupy the first local slots and constant
    /// slot 0 is reserved for the documentation string (`None`).
    pub fn function(name: &str, params: &[&str]) -> Self {
        let mut builder = Self::empty(name);
        builder.argcount = params.len() as u32;
        builder.flags = CO_OPTIMIZED | CO_NEWLOCALS | CO_NOFREE;
        builder.tables.consts.push(Const::None);
        for param in params {
            builder.local(param);
        }
        builder
    }

    /// A module-level fragment: names instead of fast locals, no reserved slots.
    pub fn module(name: &str) -> Self {
        let mut builder = Self::empty(name);
        builder.flags = CO_NOFREE;
        builder
    }

    fn empty(name: &str) -> Self {
        Self {
            name: name.to_string(),
            argcount: 0,
            flags: 0,
            tables: SideTables::new(),
            code: Vec::new(),
            labels: Vec::new(),
            error: None,
        }
    }

    fn record<T>(&mut self, result: PatchResult<T>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(err) => {
                self.error.get_or_insert(err);
                None
            }
        }
    }

    fn push(&mut self, op: Opcode, arg: Arg) -> &mut Self {
        self.code.push((op, arg));
        self
    }

    /// Declares a local slot without emitting code.
    pub fn local(&mut self, name: &str) -> &mut Self {
        let res = self.tables.intern_local(name);
        self.record(res);
        self
    }

    /// Emits an instruction whose operand is unused.
    pub fn op(&mut self, op: Opcode) -> &mut Self {
        self.push(op, Arg::Raw(0))
    }

    /// Emits an instruction with a literal operand byte.
    pub fn op_arg(&mut self, op: Opcode, arg: u8) -> &mut Self {
        self.push(op, Arg::Raw(arg))
    }

    pub fn load_const(&mut self, value: Const) -> &mut Self {
        let res = self.tables.intern_const(&value);
        let idx = self.record(res).unwrap_or(0);
        self.push(Opcode::LoadConst, Arg::Raw(idx))
    }

    pub fn load_fast(&mut self, name: &str) -> &mut Self {
        self.local_op(Opcode::LoadFast, name)
    }

    pub fn store_fast(&mut self, name: &str) -> &mut Self {
        self.local_op(Opcode::StoreFast, name)
    }

    pub fn load_name(&mut self, name: &str) -> &mut Self {
        self.name_op(Opcode::LoadName, name)
    }

    pub fn store_name(&mut self, name: &str) -> &mut Self {
        self.name_op(Opcode::StoreName, name)
    }

    pub fn load_global(&mut self, name: &str) -> &mut Self {
        self.name_op(Opcode::LoadGlobal, name)
    }

    fn local_op(&mut self, op: Opcode, name: &str) -> &mut Self {
        let res = self.tables.intern_local(name);
        let idx = self.record(res).unwrap_or(0);
        self.push(op, Arg::Raw(idx))
    }

    fn name_op(&mut self, op: Opcode, name: &str) -> &mut Self {
        let res = self.tables.intern_name(name);
        let idx = self.record(res).unwrap_or(0);
        self.push(op, Arg::Raw(idx))
    }

    pub fn label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    /// Binds `label` to the next emitted instruction.
    pub fn bind(&mut self, label: Label) -> &mut Self {
        self.labels[label.0] = Some(self.code.len());
        self
    }

    pub fn jump(&mut self, op: Opcode, label: Label) -> &mut Self {
        debug_assert!(op.is_jump(), "{} is not a jump", op);
        self.push(op, Arg::Label(label))
    }

    pub fn build(&mut self) -> PatchResult<CodeUnit> {
        if let Some(err) = self.error.take() {
            return Err(err);
        }
        let mut bytes = Vec::with_capacity(self.code.len() * INSTR_WIDTH);
        for (idx, (op, arg)) in self.code.iter().enumerate() {
            let pos = idx * INSTR_WIDTH;
            let operand = match *arg {
                Arg::Raw(value) => value,
                Arg::Label(label) => {
                    let target = self.labels[label.0]
                        .filter(|&t| t < self.code.len())
                        .ok_or(PatchError::UnresolvedJumpTarget { position: pos, target: usize::MAX })?
                        * INSTR_WIDTH;
                    let offset = match op.jump_mode() {
                        Some(JumpMode::Relative) => target as isize - (pos + INSTR_WIDTH) as isize,
                        _ => target as isize,
                    };
                    u8::try_from(offset).map_err(|_| PatchError::JumpOutOfRange { position: pos, offset })?
                }
            };
            bytes.push(op.byte());
            bytes.push(operand);
        }

        let mut unit = CodeUnit::new(&self.name, bytes, self.tables.clone());
        unit.argcount = self.argcount;
        unit.flags = self.flags;
        unit.stacksize = self.max_depth() as u32;
        Ok(unit)
    }

    fn max_depth(&self) -> usize {
        let mut depth = 0usize;
        let mut max = 0usize;
        for (op, arg) in &self.code {
            let raw = match arg {
                Arg::Raw(v) => *v,
                Arg::Label(_) => 0,
            };
            depth = depth.saturating_sub(op.pops(raw)) + op.pushes();
            max = max.max(depth);
        }
        max
    }
}
