// Configuration and the index struct. Included by mod.rs.

/// Tuning knobs for structural maintenance.
#[derive(Clone, Debug)]
pub struct BTreeOptions {
    /// Fill percentage under which a delete tries to merge the page.
    pub merge_threshold: u8,
    /// Split at the insertion point instead of the middle when inserts look
    /// sequential, so ascending loads fill pages densely.
    pub seq_split_heuristic: bool,
    /// Keep a compressed twin of every page within this byte budget. `None`
    /// disables twins entirely.
    pub zip_budget: Option<usize>,
    /// Attempts to rebalance a split boundary before giving up.
    pub max_split_retries: usize,
}

impl Default for BTreeOptions {
    fn default() -> Self {
        Self {
            merge_threshold: 50,
            seq_split_heuristic: true,
            zip_budget: None,
            max_split_retries: 3,
        }
    }
}

/// What a merge attempt did.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MergeOutcome {
    /// The sole-child chain above the page collapsed into the root.
    Lifted,
    /// The page was absorbed by its left sibling.
    MergedLeft,
    /// The page's records moved into its right sibling.
    MergedRight,
    /// Neither sibling had room; nothing changed.
    Declined,
}

/// One B-tree index: the root page plus everything needed to maintain the
/// tree's shape. Record contents are opaque byte strings ordered
/// lexicographically.
pub struct BTreeIndex {
    cache: Arc<dyn PageCache>,
    alloc: Arc<SegmentAllocator>,
    observer: Arc<dyn PageObserver>,
    redo: Arc<dyn RedoLog>,
    latch: Arc<TreeLatch>,
    index_id: IndexId,
    /// Root page id, 0 before creation and after [`BTreeIndex::free_tree`].
    /// The id never changes while the tree lives; raises move records out
    /// instead of moving the root.
    root: AtomicU64,
    page_size: usize,
    options: BTreeOptions,
    stats: BTreeStats,
}
