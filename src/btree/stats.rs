//! Structural-maintenance counters.
//!
//! Cheap relaxed atomics bumped on the hot paths; snapshots are taken for
//! admin surfaces and periodic tracing.

use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters for one tree.
#[derive(Default)]
pub struct BTreeStats {
    searches: AtomicU64,
    fast_path_inserts: AtomicU64,
    leaf_splits: AtomicU64,
    nonleaf_splits: AtomicU64,
    root_raises: AtomicU64,
    lifts: AtomicU64,
    merges_left: AtomicU64,
    merges_right: AtomicU64,
    merge_declines: AtomicU64,
    discards: AtomicU64,
    reorganizes: AtomicU64,
    zip_fallbacks: AtomicU64,
}

macro_rules! bump {
    ($($name:ident => $field:ident),+ $(,)?) => {
        $(
            pub(crate) fn $name(&self) {
                self.$field.fetch_add(1, Ordering::Relaxed);
            }
        )+
    };
}

impl BTreeStats {
    bump! {
        record_search => searches,
        record_fast_path_insert => fast_path_inserts,
        record_leaf_split => leaf_splits,
        record_nonleaf_split => nonleaf_splits,
        record_root_raise => root_raises,
        record_lift => lifts,
        record_merge_left => merges_left,
        record_merge_right => merges_right,
        record_merge_decline => merge_declines,
        record_discard => discards,
        record_reorganize => reorganizes,
        record_zip_fallback => zip_fallbacks,
    }

    /// Point-in-time copy of all counters.
    pub fn snapshot(&self) -> BTreeStatsSnapshot {
        BTreeStatsSnapshot {
            searches: self.searches.load(Ordering::Relaxed),
            fast_path_inserts: self.fast_path_inserts.load(Ordering::Relaxed),
            leaf_splits: self.leaf_splits.load(Ordering::Relaxed),
            nonleaf_splits: self.nonleaf_splits.load(Ordering::Relaxed),
            root_raises: self.root_raises.load(Ordering::Relaxed),
            lifts: self.lifts.load(Ordering::Relaxed),
            merges_left: self.merges_left.load(Ordering::Relaxed),
            merges_right: self.merges_right.load(Ordering::Relaxed),
            merge_declines: self.merge_declines.load(Ordering::Relaxed),
            discards: self.discards.load(Ordering::Relaxed),
            reorganizes: self.reorganizes.load(Ordering::Relaxed),
            zip_fallbacks: self.zip_fallbacks.load(Ordering::Relaxed),
        }
    }

    /// Emit the current counters as one structured event.
    pub fn emit_tracing(&self) {
        let snap = self.snapshot();
        tracing::info!(
            target: "cedar::btree::stats",
            searches = snap.searches,
            fast_path_inserts = snap.fast_path_inserts,
            leaf_splits = snap.leaf_splits,
            nonleaf_splits = snap.nonleaf_splits,
            root_raises = snap.root_raises,
            lifts = snap.lifts,
            merges_left = snap.merges_left,
            merges_right = snap.merges_right,
            merge_declines = snap.merge_declines,
            discards = snap.discards,
            reorganizes = snap.reorganizes,
            zip_fallbacks = snap.zip_fallbacks,
            "btree stats"
        );
    }
}

/// Serializable copy of [`BTreeStats`].
#[derive(Clone, Debug, Default, Eq, PartialEq, serde::Serialize)]
pub struct BTreeStatsSnapshot {
    /// Descents performed.
    pub searches: u64,
    /// Inserts satisfied by the right-sibling fast path.
    pub fast_path_inserts: u64,
    /// Splits of leaf pages.
    pub leaf_splits: u64,
    /// Splits of non-leaf pages.
    pub nonleaf_splits: u64,
    /// Times the root grew a level.
    pub root_raises: u64,
    /// Sole children lifted into their parents.
    pub lifts: u64,
    /// Merges into the left sibling.
    pub merges_left: u64,
    /// Merges absorbing the right sibling.
    pub merges_right: u64,
    /// Merge attempts declined for lack of room.
    pub merge_declines: u64,
    /// Empty pages discarded.
    pub discards: u64,
    /// In-place page rebuilds.
    pub reorganizes: u64,
    /// Compressed twins dropped after a failed refresh.
    pub zip_fallbacks: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_independently() {
        let stats = BTreeStats::default();
        stats.record_search();
        stats.record_search();
        stats.record_leaf_split();
        let snap = stats.snapshot();
        assert_eq!(snap.searches, 2);
        assert_eq!(snap.leaf_splits, 1);
        assert_eq!(snap.merges_left, 0);
    }
}
