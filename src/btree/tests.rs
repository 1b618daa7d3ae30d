//! Structural tests driving the engine through its public surface, checked
//! against a reference map and the consistency validator.

use std::collections::BTreeMap;
use std::sync::Arc;

use proptest::prelude::*;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::alloc::SegmentAllocator;
use crate::btree::page;
use crate::btree::{BTreeIndex, BTreeOptions, MergeOutcome};
use crate::callbacks::{NoopObserver, PageObserver};
use crate::mtr::{LatchMode, MemRedo, NoopRedo};
use crate::pool::{MemCache, PageCache};
use crate::types::{Error, IndexId, PageId, SpaceId};

struct Fixture {
    cache: Arc<MemCache>,
    alloc: Arc<SegmentAllocator>,
    redo: Arc<MemRedo>,
    tree: BTreeIndex,
}

fn fixture_with(page_size: usize, options: BTreeOptions) -> Fixture {
    fixture_observed(page_size, options, Arc::new(NoopObserver))
}

fn fixture_observed(
    page_size: usize,
    options: BTreeOptions,
    observer: Arc<dyn PageObserver>,
) -> Fixture {
    let cache = MemCache::new(page_size);
    let alloc = Arc::new(SegmentAllocator::new(SpaceId(1), None));
    let redo = MemRedo::new();
    let tree = BTreeIndex::create(
        Arc::clone(&cache) as Arc<dyn crate::pool::PageCache>,
        Arc::clone(&alloc),
        observer,
        Arc::clone(&redo) as Arc<dyn crate::mtr::RedoLog>,
        IndexId(7),
        options,
    )
    .unwrap();
    Fixture {
        cache,
        alloc,
        redo,
        tree,
    }
}

fn fixture(page_size: usize) -> Fixture {
    fixture_with(page_size, BTreeOptions::default())
}

fn key(i: u32) -> Vec<u8> {
    format!("{i:06}").into_bytes()
}

fn assert_valid(tree: &BTreeIndex) {
    let report = tree.validate().unwrap();
    assert!(
        report.success,
        "validation failed: {:?}",
        report.findings
    );
}

#[test]
fn fresh_tree_is_a_single_empty_leaf() {
    let f = fixture(512);
    assert_ne!(f.tree.root_page(), PageId(0));
    assert_eq!(f.tree.height().unwrap(), 1);
    assert_eq!(f.tree.get(b"anything").unwrap(), None);
    let report = f.tree.validate().unwrap();
    assert!(report.success);
    assert_eq!(report.pages_checked, 1);
}

#[test]
fn insert_get_and_overwrite() {
    let f = fixture(512);
    f.tree.insert(b"alpha", b"one").unwrap();
    f.tree.insert(b"beta", b"two").unwrap();
    assert_eq!(f.tree.get(b"alpha").unwrap(), Some(b"one".to_vec()));
    f.tree.insert(b"alpha", b"rewritten").unwrap();
    assert_eq!(f.tree.get(b"alpha").unwrap(), Some(b"rewritten".to_vec()));
    assert_eq!(f.tree.get(b"gamma").unwrap(), None);
    assert_valid(&f.tree);
}

#[test]
fn empty_key_is_rejected() {
    let f = fixture(512);
    assert!(matches!(f.tree.insert(b"", b"v"), Err(Error::Invalid(_))));
}

#[test]
fn oversized_record_is_rejected_up_front() {
    let f = fixture(512);
    let huge = vec![0u8; 4096];
    assert!(matches!(
        f.tree.insert(b"k", &huge),
        Err(Error::Invalid(_))
    ));
}

#[test]
fn ascending_load_raises_root_in_place() {
    let f = fixture(512);
    let root_before = f.tree.root_page();
    for i in 0..400u32 {
        f.tree.insert(&key(i), b"payload").unwrap();
    }
    assert_eq!(f.tree.root_page(), root_before);
    assert!(f.tree.height().unwrap() >= 2);
    for i in 0..400u32 {
        assert_eq!(f.tree.get(&key(i)).unwrap(), Some(b"payload".to_vec()));
    }
    let stats = f.tree.stats().snapshot();
    assert!(stats.root_raises >= 1);
    assert!(stats.leaf_splits >= 1);
    assert_valid(&f.tree);
}

#[test]
fn sequential_heuristic_packs_pages_denser() {
    let load = |seq: bool| {
        let options = BTreeOptions {
            seq_split_heuristic: seq,
            ..BTreeOptions::default()
        };
        let f = fixture_with(512, options);
        for i in 0..600u32 {
            f.tree.insert(&key(i), b"0123456789").unwrap();
        }
        assert_valid(&f.tree);
        f.alloc.pages_in_use()
    };
    assert!(load(true) <= load(false));
}

#[test]
fn inserting_below_the_smallest_key_stays_valid() {
    let f = fixture(512);
    for i in 100..400u32 {
        f.tree.insert(&key(i), b"value").unwrap();
    }
    assert!(f.tree.height().unwrap() >= 2);
    f.tree.insert(&key(5), b"value").unwrap();
    assert_eq!(f.tree.get(&key(5)).unwrap(), Some(b"value".to_vec()));
    assert_valid(&f.tree);
}

#[test]
fn descending_load_splits_cleanly() {
    let f = fixture(512);
    for i in (0..400u32).rev() {
        f.tree.insert(&key(i), b"0123456789").unwrap();
    }
    for i in 0..400u32 {
        assert_eq!(f.tree.get(&key(i)).unwrap(), Some(b"0123456789".to_vec()));
    }
    assert!(f.tree.stats().snapshot().leaf_splits >= 1);
    assert_valid(&f.tree);
}

#[test]
fn height_changes_one_level_at_a_time() {
    let f = fixture(512);
    let mut last = f.tree.height().unwrap();
    for i in 0..300u32 {
        f.tree.insert(&key(i), b"some value here").unwrap();
        let now = f.tree.height().unwrap();
        assert!(now >= last && now - last <= 1, "height jumped {last} -> {now}");
        last = now;
    }
    for i in 0..300u32 {
        f.tree.delete(&key(i)).unwrap();
        let now = f.tree.height().unwrap();
        assert!(now <= last && last - now <= 1, "height jumped {last} -> {now}");
        last = now;
    }
}

#[test]
fn deleting_everything_collapses_to_a_single_leaf() {
    let f = fixture(512);
    for i in 0..300u32 {
        f.tree.insert(&key(i), b"some value here").unwrap();
    }
    assert!(f.tree.height().unwrap() >= 2);
    for i in 0..300u32 {
        assert!(f.tree.delete(&key(i)).unwrap());
    }
    assert_eq!(f.tree.height().unwrap(), 1);
    assert_eq!(f.alloc.pages_in_use(), 1);
    for i in 0..300u32 {
        assert_eq!(f.tree.get(&key(i)).unwrap(), None);
    }
    let stats = f.tree.stats().snapshot();
    assert!(stats.lifts >= 1);
    assert!(stats.merges_left + stats.merges_right + stats.discards >= 1);
    assert_valid(&f.tree);
}

#[test]
fn delete_of_missing_key_reports_absence() {
    let f = fixture(512);
    f.tree.insert(b"present", b"v").unwrap();
    assert!(!f.tree.delete(b"absent").unwrap());
    assert!(f.tree.delete(b"present").unwrap());
    assert!(!f.tree.delete(b"present").unwrap());
}

#[test]
fn compress_declines_when_no_sibling_has_room() {
    let f = fixture(512);
    for i in 0..200u32 {
        f.tree.insert(&key(i), b"a fairly chunky value").unwrap();
    }
    assert!(f.tree.height().unwrap() >= 2);
    // A declined merge is a no-op: the leaf's occupancy and free room must
    // come out of it untouched.
    let measure = |k: &[u8]| {
        let mut mtr = f.tree.begin();
        let (cursor, _) = f.tree.search(&mut mtr, k, LatchMode::S).unwrap();
        let payload = page::payload(mtr.page_bytes(cursor.page).unwrap());
        let header = page::Header::parse(payload).unwrap();
        let extents = page::SlotExtents::parse(payload, &header).unwrap();
        let out = (extents.data_size(), page::max_insert_size(&header));
        mtr.commit().unwrap();
        out
    };
    let before = measure(&key(100));
    let outcome = f.tree.compress(&key(100)).unwrap();
    assert_eq!(outcome, MergeOutcome::Declined);
    assert_eq!(measure(&key(100)), before);
    assert!(f.tree.stats().snapshot().merge_declines >= 1);
    assert_valid(&f.tree);
}

#[test]
fn reorganize_preserves_records() {
    let f = fixture(512);
    for i in 0..20u32 {
        f.tree.insert(&key(i), b"value").unwrap();
    }
    let mut mtr = f.tree.begin();
    let (cursor, exact) = f.tree.search(&mut mtr, &key(5), LatchMode::X).unwrap();
    assert!(exact);
    f.tree.reorganize(&mut mtr, cursor.page).unwrap();
    mtr.commit().unwrap();
    assert!(f.tree.stats().snapshot().reorganizes >= 1);
    for i in 0..20u32 {
        assert_eq!(f.tree.get(&key(i)).unwrap(), Some(b"value".to_vec()));
    }
    assert_valid(&f.tree);
}

#[test]
fn reorganize_refuses_a_shared_latch() {
    let f = fixture(512);
    f.tree.insert(b"k", b"v").unwrap();
    let mut mtr = f.tree.begin();
    let (cursor, _) = f.tree.search(&mut mtr, b"k", LatchMode::S).unwrap();
    assert!(matches!(
        f.tree.reorganize(&mut mtr, cursor.page),
        Err(Error::Invalid(_))
    ));
    mtr.commit().unwrap();
}

#[test]
fn corrupted_root_header_is_detected_not_followed() {
    let f = fixture(512);
    f.tree.insert(b"k", b"v").unwrap();
    {
        let frame = f.cache.frame(f.tree.root_page()).unwrap();
        frame.write().buf[0] = b'X';
    }
    assert!(matches!(
        f.tree.get(b"k"),
        Err(Error::CorruptPage { .. })
    ));
}

#[test]
fn validator_reports_damage_without_stopping() {
    let f = fixture(512);
    for i in 0..40u32 {
        f.tree.insert(&key(i), b"value").unwrap();
    }
    {
        // Clobber the record area of the root so at least one record or
        // pointer no longer decodes.
        let frame = f.cache.frame(f.tree.root_page()).unwrap();
        let mut guard = frame.write();
        let len = guard.buf.len();
        guard.buf[len - 8..].fill(0xFF);
    }
    let report = f.tree.validate().unwrap();
    assert!(!report.success);
    assert!(!report.findings.is_empty());
}

#[test]
fn rewired_node_pointer_is_reported_by_the_validator() {
    let f = fixture(512);
    for i in 0..200u32 {
        f.tree.insert(&key(i), b"some value here").unwrap();
    }
    assert!(f.tree.height().unwrap() >= 2);
    {
        // Point the root's second pointer at the first pointer's child, so
        // the parent search for the orphaned page lands on a stranger.
        let frame = f.cache.frame(f.tree.root_page()).unwrap();
        let mut guard = frame.write();
        let payload = page::payload_mut(&mut guard.buf);
        let header = page::Header::parse(payload).unwrap();
        let extents = page::SlotExtents::parse(payload, &header).unwrap();
        assert!(extents.len() >= 2);
        let first_child = page::decode_node_ptr(page::record(payload, &extents.get(0).unwrap()))
            .unwrap()
            .child;
        let ext = extents.get(1).unwrap();
        page::rewrite_node_ptr_child(payload, &ext, first_child).unwrap();
    }
    let report = f.tree.validate().unwrap();
    assert!(!report.success);
    assert!(report
        .findings
        .iter()
        .any(|fnd| fnd.message.contains("parent pointer not found")));
}

#[test]
fn compressed_twins_follow_every_rewrite() {
    let options = BTreeOptions {
        zip_budget: Some(512),
        ..BTreeOptions::default()
    };
    let f = fixture_with(512, options);
    for i in 0..150u32 {
        f.tree.insert(&key(i), b"v").unwrap();
    }
    assert_valid(&f.tree);
    // Mutating the uncompressed image behind the engine's back makes the
    // twin stale, which the validator must flag.
    {
        let frame = f.cache.frame(f.tree.root_page()).unwrap();
        let mut guard = frame.write();
        let len = guard.buf.len();
        guard.buf[len - 1] ^= 0xFF;
    }
    let report = f.tree.validate().unwrap();
    assert!(!report.success);
}

#[test]
fn redo_records_are_committed_per_mtr() {
    let f = fixture(512);
    let before = f.redo.committed();
    f.tree.insert(b"k", b"v").unwrap();
    assert!(f.redo.committed() > before);
}

#[derive(Default)]
struct RecordingObserver {
    moved: parking_lot::Mutex<Vec<(u64, u64)>>,
    dropped: parking_lot::Mutex<Vec<u64>>,
}

impl PageObserver for RecordingObserver {
    fn move_locks(&self, from: PageId, to: PageId) {
        self.moved.lock().push((from.0, to.0));
    }

    fn drop_hash_index(&self, page: PageId) {
        self.dropped.lock().push(page.0);
    }
}

#[test]
fn observer_follows_record_moves() {
    let observer = Arc::new(RecordingObserver::default());
    let f = fixture_observed(
        512,
        BTreeOptions::default(),
        Arc::clone(&observer) as Arc<dyn PageObserver>,
    );
    let root = f.tree.root_page();
    for i in 0..300u32 {
        f.tree.insert(&key(i), b"value").unwrap();
    }
    assert!(observer
        .moved
        .lock()
        .iter()
        .any(|&(from, _)| from == root.0));
    // Every split and every root raise relocates records and must announce
    // the move while the page latches are held.
    let stats = f.tree.stats().snapshot();
    let moves = observer.moved.lock().len() as u64;
    assert!(
        moves >= stats.leaf_splits + stats.nonleaf_splits + stats.root_raises,
        "{moves} moves for {} splits and {} raises",
        stats.leaf_splits + stats.nonleaf_splits,
        stats.root_raises
    );
    for i in 0..300u32 {
        f.tree.delete(&key(i)).unwrap();
    }
    assert!(!observer.dropped.lock().is_empty());
    assert_valid(&f.tree);
}

#[test]
fn free_tree_returns_every_page() {
    let f = fixture(512);
    for i in 0..300u32 {
        f.tree.insert(&key(i), b"value").unwrap();
    }
    assert!(f.alloc.pages_in_use() > 1);
    f.tree.free_tree().unwrap();
    assert_eq!(f.tree.root_page(), PageId(0));
    assert_eq!(f.alloc.pages_in_use(), 0);
    assert!(matches!(
        f.tree.insert(b"k", b"v"),
        Err(Error::Invalid(_))
    ));
}

#[test]
fn space_cap_fails_the_insert_not_the_tree() {
    let cache = MemCache::new(512);
    let alloc = Arc::new(SegmentAllocator::new(SpaceId(1), Some(3)));
    let tree = BTreeIndex::create(
        Arc::clone(&cache) as Arc<dyn crate::pool::PageCache>,
        Arc::clone(&alloc),
        Arc::new(NoopObserver),
        Arc::new(NoopRedo),
        IndexId(1),
        BTreeOptions::default(),
    )
    .unwrap();
    let mut full = false;
    for i in 0..600u32 {
        match tree.insert(&key(i), b"a value of some size") {
            Ok(()) => {}
            Err(Error::NoSpace(_)) => {
                full = true;
                break;
            }
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert!(full);
    assert_valid(&tree);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn random_ops_match_reference(seed in any::<u64>()) {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let f = fixture(512);
        let mut reference: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();
        for step in 0..300usize {
            let k = key(rng.gen_range(0..120u32));
            if rng.gen_bool(0.65) {
                let len = rng.gen_range(1..24usize);
                let value: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
                f.tree.insert(&k, &value).unwrap();
                reference.insert(k, value);
            } else {
                let was_there = f.tree.delete(&k).unwrap();
                prop_assert_eq!(was_there, reference.remove(&k).is_some());
            }
            if step % 75 == 74 {
                let report = f.tree.validate().unwrap();
                prop_assert!(report.success, "findings: {:?}", report.findings);
            }
        }
        for i in 0..120u32 {
            let k = key(i);
            prop_assert_eq!(f.tree.get(&k).unwrap(), reference.get(&k).cloned());
        }
        let report = f.tree.validate().unwrap();
        prop_assert!(report.success, "findings: {:?}", report.findings);
    }

    #[test]
    fn random_ops_with_twins_keep_them_fresh(seed in any::<u64>()) {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let options = BTreeOptions { zip_budget: Some(512), ..BTreeOptions::default() };
        let f = fixture_with(512, options);
        for _ in 0..200usize {
            let k = key(rng.gen_range(0..80u32));
            if rng.gen_bool(0.7) {
                f.tree.insert(&k, b"twinned value").unwrap();
            } else {
                f.tree.delete(&k).unwrap();
            }
        }
        let report = f.tree.validate().unwrap();
        prop_assert!(report.success, "findings: {:?}", report.findings);
    }
}
