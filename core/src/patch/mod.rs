pub mod apply;
mod merge;
mod optimize;
mod pattern;
mod rewrite;

#[cfg(test)]
mod rewrite_test;

pub use apply::Function;
pub use merge::merge_fragment;
pub use optimize::{Pinned, compact_tables, eliminate_store_loads, optimize};
pub use pattern::{Pattern, PatternOp, decode_fragment};
pub use rewrite::{find_matches, match_and_replace};
