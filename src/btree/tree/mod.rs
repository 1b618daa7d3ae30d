//! The structural-maintenance core: tree creation, descent, optimistic and
//! pessimistic record changes, page splits with root raises, merges with
//! lifts and discards, and the full-tree consistency walk.
//!
//! The implementation is composed from focused source files sharing this
//! module's namespace: `types.rs` (configuration and the index struct),
//! `api.rs` (public operations and descent), `node_ptr.rs` (the parent
//! locator and separator maintenance), `split.rs`, `merge.rs`, and
//! `validate.rs`.
//!
//! Latching protocol: point operations take the tree intent latch in S and
//! latch pages hand over hand, holding at most two adjacent levels and
//! releasing ancestors as the descent advances. Structure-modifying
//! operations take the tree latch in SX (serializing writers while admitting
//! readers) and keep the whole root-to-target path X-latched in their
//! mini-transaction, so upward latching of parents and sideways latching of
//! siblings never forms a cycle with a descending reader.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;

use crate::alloc::{AllocDirection, SegClass, SegmentAllocator};
use crate::btree::cursor::{self, Cursor};
use crate::btree::page::{self, Header, RecEntry, SlotExtents};
use crate::btree::stats::BTreeStats;
use crate::btree::zip;
use crate::callbacks::PageObserver;
use crate::mtr::{LatchMode, Mtr, PageHandle, RedoLog, RedoOp, TreeLatch, TreeLatchMode};
use crate::pool::PageCache;
use crate::types::{page as outer, Error, IndexId, PageId, Result};

include!("types.rs");
include!("api.rs");
include!("node_ptr.rs");
include!("split.rs");
include!("merge.rs");
include!("validate.rs");
