//! Reference host runtime.
//!
//! A small stack interpreter that executes [`CodeUnit`](crate::code::CodeUnit)
//! payloads so patched functions can be called and observed.

mod context;
mod value;
mod vm;

pub use context::VmContext;
pub use value::{Builtin, NativeFn, SeqIter, Value};
pub use vm::Vm;
