//! Cedar: the structural-maintenance engine of a disk-resident B-tree index
//! layer.
//!
//! The crate owns the algorithms that create a tree, split a full page, merge
//! or lift underfull pages, reorganize a page in place, and keep parent
//! node-pointer records consistent as the tree's shape changes. Page frames,
//! redo logging, and lock-table/hash-index notifications are reached through
//! traits so the engine can be embedded under a real buffer pool or driven by
//! the in-memory test implementations shipped here.

pub mod alloc;
pub mod btree;
pub mod callbacks;
pub mod mtr;
pub mod pool;
pub mod types;

pub use types::{Error, Result};
