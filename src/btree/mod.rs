//! The B-tree engine: page format, cursors, compressed twins, statistics,
//! and the structural-maintenance core.

pub mod cursor;
pub mod page;
pub mod stats;
pub mod tree;
pub mod zip;

#[cfg(test)]
mod tests;

pub use tree::{BTreeIndex, BTreeOptions, Finding, MergeOutcome, Severity, ValidateReport};
