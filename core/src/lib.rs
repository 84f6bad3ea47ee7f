//! Instruction-stream patching.
//!
//! Compiled units are decoded into an editable instruction sequence
//! ([`ir::Sequence`]), rewritten with before/after patterns or optimized
//! ([`patch`]), then re-encoded and installed back into a
//! [`patch::Function`]. [`runtime`] executes units so the effect of a patch
//! can be observed.

pub mod code;
pub mod error;
pub mod ir;
pub mod patch;
pub mod runtime;

pub use error::{PatchError, PatchResult, TableKind};
