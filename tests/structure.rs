//! End-to-end lifecycle tests over the public API.

use std::sync::Arc;

use cedar::alloc::SegmentAllocator;
use cedar::btree::{BTreeIndex, BTreeOptions};
use cedar::callbacks::NoopObserver;
use cedar::mtr::{MemRedo, RedoLog};
use cedar::pool::{MemCache, PageCache};
use cedar::types::{IndexId, SpaceId};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

struct Harness {
    alloc: Arc<SegmentAllocator>,
    redo: Arc<MemRedo>,
    tree: BTreeIndex,
}

fn harness(page_size: usize, options: BTreeOptions) -> Harness {
    init_tracing();
    let cache = MemCache::new(page_size);
    let alloc = Arc::new(SegmentAllocator::new(SpaceId(3), None));
    let redo = MemRedo::new();
    let tree = BTreeIndex::create(
        cache as Arc<dyn PageCache>,
        Arc::clone(&alloc),
        Arc::new(NoopObserver),
        Arc::clone(&redo) as Arc<dyn RedoLog>,
        IndexId(11),
        options,
    )
    .expect("create tree");
    Harness { alloc, redo, tree }
}

fn key(i: u32) -> Vec<u8> {
    format!("user:{i:08}").into_bytes()
}

fn value(i: u32) -> Vec<u8> {
    format!("record payload number {i}").into_bytes()
}

#[test]
fn lifecycle_grow_shrink_free() {
    let h = harness(1024, BTreeOptions::default());

    // Mixed load: ascending runs interleaved with scattered keys.
    for i in 0..1500u32 {
        let k = if i % 3 == 0 { i * 7 % 2000 } else { i };
        h.tree.insert(&key(k), &value(k)).expect("insert");
    }
    assert!(h.tree.height().expect("height") >= 2);
    let report = h.tree.validate().expect("validate");
    assert!(report.success, "findings: {:?}", report.findings);
    assert!(report.pages_checked > 1);

    for i in (0..1500u32).step_by(7) {
        let k = if i % 3 == 0 { i * 7 % 2000 } else { i };
        assert_eq!(h.tree.get(&key(k)).expect("get"), Some(value(k)));
    }

    // Shrink: delete the bulk and let merges and lifts do their work.
    for i in 0..1500u32 {
        let k = if i % 3 == 0 { i * 7 % 2000 } else { i };
        h.tree.delete(&key(k)).expect("delete");
    }
    let report = h.tree.validate().expect("validate after shrink");
    assert!(report.success, "findings: {:?}", report.findings);
    assert_eq!(h.tree.height().expect("height"), 1);
    assert_eq!(h.alloc.pages_in_use(), 1);

    let stats = h.tree.stats().snapshot();
    assert!(stats.leaf_splits > 0);
    assert!(stats.root_raises > 0);
    assert!(stats.lifts > 0);
    assert!(h.redo.committed() > 0);

    h.tree.free_tree().expect("free");
    assert_eq!(h.alloc.pages_in_use(), 0);
}

#[test]
fn compressed_tree_stays_consistent_under_churn() {
    let options = BTreeOptions {
        zip_budget: Some(1024),
        ..BTreeOptions::default()
    };
    let h = harness(1024, options);
    for round in 0..3u32 {
        for i in 0..400u32 {
            h.tree
                .insert(&key(i), &value(i + round * 1000))
                .expect("insert");
        }
        for i in (0..400u32).step_by(2) {
            h.tree.delete(&key(i)).expect("delete");
        }
        let report = h.tree.validate().expect("validate");
        assert!(report.success, "round {round}: {:?}", report.findings);
    }
    for i in (1..400u32).step_by(2) {
        assert_eq!(h.tree.get(&key(i)).expect("get"), Some(value(i + 2000)));
    }
}

#[test]
fn two_segment_placement_separates_levels() {
    let h = harness(512, BTreeOptions::default());
    for i in 0..800u32 {
        h.tree.insert(&key(i), b"v").expect("insert");
    }
    assert!(h.tree.height().expect("height") >= 3);
    let report = h.tree.validate().expect("validate");
    assert!(report.success, "findings: {:?}", report.findings);
    // Freeing the tree drains both segments completely.
    h.tree.free_tree().expect("free");
    assert_eq!(h.alloc.pages_in_use(), 0);
}
