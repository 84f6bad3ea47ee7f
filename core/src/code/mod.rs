//! Compiled units and the side-tables their operands index into.

mod builder;
mod consts;
mod tables;
mod unit;
pub mod unitfile;

pub use builder::{Label, UnitBuilder};
pub use consts::Const;
pub use tables::{MAX_TABLE_LEN, SideTables};
pub use unit::*;
