//! Installing patched bodies into functions.
//!
//! Every transform decodes the installed body, runs its pipeline on a private
//! copy and installs the result only when the whole pipeline succeeded.

use std::sync::Arc;

use tracing::{debug, info};

use crate::code::{CodeUnit, Const};
use crate::error::{PatchError, PatchResult};
use crate::ir::{Opcode, decode};

use super::merge::merge_fragment;
use super::optimize::{self as opt, Pinned};
use super::pattern::{Pattern, PatternOp, decode_fragment};
use super::rewrite::match_and_replace;

/// A callable whose body can be swapped.
#[derive(Debug, Clone, PartialEq)]
pub struct Function {
    pub name: Arc<str>,
    code: Arc<CodeUnit>,
    /// Values for the trailing positional parameters.
    pub defaults: Vec<Const>,
}

impl Function {
    pub fn new(code: CodeUnit) -> Self {
        Self {
            name: code.name.clone(),
            code: Arc::new(code),
            defaults: Vec::new(),
        }
    }

    pub fn from_arc(code: Arc<CodeUnit>, defaults: Vec<Const>) -> Self {
        Self {
            name: code.name.clone(),
            code,
            defaults,
        }
    }

    pub fn with_defaults(mut self, defaults: Vec<Const>) -> Self {
        self.defaults = defaults;
        self
    }

    #[inline]
    pub fn code(&self) -> &Arc<CodeUnit> {
        &self.code
    }

    /// Swaps in a new body. The body must keep the calling convention of the
    /// one it replaces.
    pub fn install(&mut self, unit: CodeUnit) -> PatchResult<()> {
        let current = &self.code;
        let mismatch = |what: &str, old: u32, new: u32| PatchError::IncompatibleInstall {
            reason: format!("{} changed from {} to {}", what, old, new),
        };
        if unit.argcount != current.argcount {
            return Err(mismatch("argcount", current.argcount, unit.argcount));
        }
        if unit.kwonlyargcount != current.kwonlyargcount {
            return Err(mismatch("kwonlyargcount", current.kwonlyargcount, unit.kwonlyargcount));
        }
        if unit.flags != current.flags {
            return Err(mismatch("flags", current.flags, unit.flags));
        }
        debug!(
            target: "bytepatch::rewrite",
            function = %self.name,
            old_len = current.code.len(),
            new_len = unit.code.len(),
            "installing body"
        );
        self.code = Arc::new(unit);
        Ok(())
    }
}

/// Replaces every occurrence of the snippet `before` in the function body with
/// the snippet `after`. Both snippets are module-level units; their tables are
/// merged into the function's, optionally turning name accesses into local-slot
/// accesses so they address the function's own variables.
pub fn replace(func: &mut Function, before: &CodeUnit, after: &CodeUnit, promote_names: bool) -> PatchResult<usize> {
    let mut seq = decode(func.code())?;
    let mut tables = seq.tables.clone();
    let before = merge_fragment(&mut tables, &decode_fragment(before)?, promote_names)?;
    let after = merge_fragment(&mut tables, &decode_fragment(after)?, promote_names)?;
    seq.tables = tables;
    seq.resync();

    let count = match_and_replace(&mut seq, &Pattern::from_sequence(&before), &Pattern::from_sequence(&after))?;
    let unit = seq.to_unit(func.code())?;
    func.install(unit)?;
    info!(target: "bytepatch::rewrite", function = %func.name, count, "replace applied");
    Ok(count)
}

/// Lets a body that ends in a discarded expression return that expression
/// instead of the implicit `None`.
pub fn omit_return(func: &mut Function) -> PatchResult<usize> {
    let mut seq = decode(func.code())?;
    let mut count = 0;

    if let Some(none) = seq.tables.const_index(&Const::None) {
        let before = Pattern::new(vec![
            PatternOp::bare(Opcode::PopTop),
            PatternOp::arg(Opcode::LoadConst, none),
            PatternOp::bare(Opcode::ReturnValue),
        ]);
        let after = Pattern::new(vec![PatternOp::bare(Opcode::ReturnValue)]);
        count += best_effort(match_and_replace(&mut seq, &before, &after))?;
    }

    let before = Pattern::new(vec![
        PatternOp::bare(Opcode::PopTop),
        PatternOp::bind(Opcode::JumpForward, "$1"),
    ]);
    let after = Pattern::new(vec![PatternOp::bind(Opcode::JumpForward, "$1")]);
    count += best_effort(match_and_replace(&mut seq, &before, &after))?;

    if count > 0 {
        let unit = seq.to_unit(func.code())?;
        func.install(unit)?;
    }
    info!(target: "bytepatch::rewrite", function = %func.name, count, "omit_return applied");
    Ok(count)
}

fn best_effort(result: PatchResult<usize>) -> PatchResult<usize> {
    match result {
        Err(PatchError::PatternNotFound) => Ok(0),
        other => other,
    }
}

/// Runs the local optimizer over the body. Constant slot 0 and the parameter
/// slots stay where they are.
pub fn optimize(func: &mut Function) -> PatchResult<usize> {
    let mut seq = decode(func.code())?;
    let pinned = Pinned {
        consts: 1,
        locals: (func.code.argcount + func.code.kwonlyargcount) as usize,
    };
    let removed = opt::optimize(&mut seq, pinned)?;
    let unit = seq.to_unit(func.code())?;
    func.install(unit)?;
    info!(target: "bytepatch::optimize", function = %func.name, removed, "optimize applied");
    Ok(removed)
}
