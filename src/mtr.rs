//! Mini-transactions: the unit of atomicity, redo logging, and latch
//! ownership for one structural operation.
//!
//! Every latch taken during an operation is registered in the mtr's memo and
//! released in reverse acquisition order at commit, so the "top-down acquire,
//! bottom-up release" protocol is enforced by one component instead of every
//! call site. Page mutations are buffered as redo entries and appended to the
//! [`RedoLog`] as a single contiguous record when the mtr commits.

use std::sync::Arc;

use parking_lot::{
    ArcMutexGuard, ArcRwLockReadGuard, ArcRwLockWriteGuard, Mutex, RawMutex, RawRwLock, RwLock,
};

use crate::pool::{Frame, FrameRef};
use crate::types::{page, Error, PageId, Result};

/// Latch mode for an individual page.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LatchMode {
    /// Shared: the holder reads the page.
    S,
    /// Exclusive: the holder mutates the page.
    X,
}

/// Intent latch mode for a whole tree.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum TreeLatchMode {
    /// Shared: a point operation that will not restructure.
    S,
    /// Intent-exclusive: blocks other structural writers, admits readers.
    Sx,
    /// Exclusive: blocks everything.
    X,
}

/// The tree-level intent latch. SX is a mutex held by at most one structural
/// writer; X additionally closes the reader gate.
pub struct TreeLatch {
    sx: Arc<Mutex<()>>,
    gate: Arc<RwLock<()>>,
}

impl TreeLatch {
    /// A fresh, unheld latch.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            sx: Arc::new(Mutex::new(())),
            gate: Arc::new(RwLock::new(())),
        })
    }
}

type TreeShared = ArcRwLockReadGuard<RawRwLock, ()>;
type TreeBlocked = ArcRwLockWriteGuard<RawRwLock, ()>;
type SxGuard = ArcMutexGuard<RawMutex, ()>;
type PageShared = ArcRwLockReadGuard<RawRwLock, Frame>;
type PageExcl = ArcRwLockWriteGuard<RawRwLock, Frame>;

enum MemoSlot {
    TreeS(#[allow(dead_code)] TreeShared),
    TreeSx(#[allow(dead_code)] SxGuard),
    TreeX(#[allow(dead_code)] SxGuard, #[allow(dead_code)] TreeBlocked),
    PageS(PageId, PageShared),
    PageX(PageId, PageExcl),
    Released,
}

/// Opcode identifying a redo entry. The engine only chooses the opcode; the
/// log does not interpret the bytes.
#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RedoOp {
    /// A page was initialized at a level.
    PageInit = 1,
    /// A page's record area was rebuilt.
    PageRewrite = 2,
    /// A sibling link changed.
    PageLink = 3,
    /// A node pointer's child-id field was rewritten in place.
    NodePtrChild = 4,
    /// A record was inserted.
    RecordInsert = 5,
    /// A record was deleted.
    RecordDelete = 6,
    /// A page was returned to its segment.
    PageFree = 7,
    /// The root grew one level.
    RootRaise = 8,
    /// A sole page was lifted into its parent.
    PageLift = 9,
}

/// One buffered page mutation.
pub struct RedoEntry {
    /// What happened.
    pub op: RedoOp,
    /// The page it happened to.
    pub page: PageId,
    /// Opcode-specific bytes.
    pub bytes: Vec<u8>,
}

/// Sink for committed redo records. One mtr produces one contiguous record.
pub trait RedoLog: Send + Sync + 'static {
    /// Append a committed record.
    fn append(&self, record: &[u8]);
}

/// Redo sink that discards everything.
pub struct NoopRedo;

impl RedoLog for NoopRedo {
    fn append(&self, _record: &[u8]) {}
}

/// Redo sink that retains committed records for inspection.
#[derive(Default)]
pub struct MemRedo {
    records: Mutex<Vec<Vec<u8>>>,
}

impl MemRedo {
    /// A fresh, empty sink.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Number of committed records so far.
    pub fn committed(&self) -> usize {
        self.records.lock().len()
    }

    /// Clone of all committed records.
    pub fn records(&self) -> Vec<Vec<u8>> {
        self.records.lock().clone()
    }
}

impl RedoLog for MemRedo {
    fn append(&self, record: &[u8]) {
        self.records.lock().push(record.to_vec());
    }
}

/// Handle to a page latch registered in an mtr memo.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PageHandle(usize);

/// A mini-transaction.
pub struct Mtr {
    memo: Vec<MemoSlot>,
    log: Vec<RedoEntry>,
    redo: Arc<dyn RedoLog>,
}

impl Mtr {
    /// Start an mtr writing its commit record to `redo`.
    pub fn new(redo: Arc<dyn RedoLog>) -> Self {
        Self {
            memo: Vec::new(),
            log: Vec::new(),
            redo,
        }
    }

    /// Acquire the tree intent latch. Must precede any page latch of that
    /// tree; the memo enforces release order, the caller enforces acquisition
    /// order.
    pub fn latch_tree(&mut self, latch: &TreeLatch, mode: TreeLatchMode) {
        debug_assert!(
            self.memo
                .iter()
                .all(|slot| !matches!(slot, MemoSlot::PageS(..) | MemoSlot::PageX(..))),
            "tree latch must be taken before page latches"
        );
        let slot = match mode {
            TreeLatchMode::S => MemoSlot::TreeS(latch.gate.read_arc()),
            TreeLatchMode::Sx => MemoSlot::TreeSx(latch.sx.lock_arc()),
            TreeLatchMode::X => {
                let sx = latch.sx.lock_arc();
                let gate = latch.gate.write_arc();
                MemoSlot::TreeX(sx, gate)
            }
        };
        self.memo.push(slot);
    }

    /// The strongest tree latch mode currently registered, if any.
    pub fn tree_latch_mode(&self) -> Option<TreeLatchMode> {
        let mut strongest = None;
        for slot in &self.memo {
            let mode = match slot {
                MemoSlot::TreeS(_) => TreeLatchMode::S,
                MemoSlot::TreeSx(_) => TreeLatchMode::Sx,
                MemoSlot::TreeX(..) => TreeLatchMode::X,
                _ => continue,
            };
            strongest = Some(strongest.map_or(mode, |prev: TreeLatchMode| prev.max(mode)));
        }
        strongest
    }

    /// Latch `frame` and register the guard. If the page is already latched
    /// by this mtr the existing handle is reused; requesting X on a page only
    /// S-latched here is a protocol error (upgrades are not supported).
    pub fn latch_page(
        &mut self,
        page: PageId,
        frame: FrameRef,
        mode: LatchMode,
    ) -> Result<PageHandle> {
        for (idx, slot) in self.memo.iter().enumerate() {
            match slot {
                MemoSlot::PageX(id, _) if *id == page => return Ok(PageHandle(idx)),
                MemoSlot::PageS(id, _) if *id == page => {
                    if mode == LatchMode::X {
                        return Err(Error::Invalid("page latch upgrade not supported"));
                    }
                    return Ok(PageHandle(idx));
                }
                _ => {}
            }
        }
        let slot = match mode {
            LatchMode::S => MemoSlot::PageS(page, frame.read_arc()),
            LatchMode::X => MemoSlot::PageX(page, frame.write_arc()),
        };
        self.memo.push(slot);
        Ok(PageHandle(self.memo.len() - 1))
    }

    /// The page id behind `handle`.
    pub fn page_id(&self, handle: PageHandle) -> Result<PageId> {
        match self.memo.get(handle.0) {
            Some(MemoSlot::PageS(id, _)) | Some(MemoSlot::PageX(id, _)) => Ok(*id),
            _ => Err(Error::Invalid("handle does not reference a latched page")),
        }
    }

    /// Shared view of a latched frame.
    pub fn frame(&self, handle: PageHandle) -> Result<&Frame> {
        match self.memo.get(handle.0) {
            Some(MemoSlot::PageS(_, guard)) => Ok(guard),
            Some(MemoSlot::PageX(_, guard)) => Ok(guard),
            _ => Err(Error::Invalid("handle does not reference a latched page")),
        }
    }

    /// Mutable view of an X-latched frame.
    pub fn frame_mut(&mut self, handle: PageHandle) -> Result<&mut Frame> {
        match self.memo.get_mut(handle.0) {
            Some(MemoSlot::PageX(_, guard)) => Ok(guard),
            Some(MemoSlot::PageS(..)) => Err(Error::Invalid("page not latched exclusively")),
            _ => Err(Error::Invalid("handle does not reference a latched page")),
        }
    }

    /// The page bytes behind `handle`.
    pub fn page_bytes(&self, handle: PageHandle) -> Result<&[u8]> {
        Ok(&self.frame(handle)?.buf)
    }

    /// Whether `handle` is X-latched.
    pub fn is_x_latched(&self, handle: PageHandle) -> bool {
        matches!(self.memo.get(handle.0), Some(MemoSlot::PageX(..)))
    }

    /// Mark of the current memo top, for [`Mtr::release_to`].
    pub fn savepoint(&self) -> usize {
        self.memo.len()
    }

    /// Drop every latch acquired after `savepoint`, newest first. Buffered
    /// redo entries are kept; only latches are released.
    pub fn release_to(&mut self, savepoint: usize) {
        while self.memo.len() > savepoint {
            self.memo.pop();
        }
    }

    /// Release one page latch early. Used during descent so no more than two
    /// adjacent levels stay latched.
    pub fn release(&mut self, handle: PageHandle) {
        if let Some(slot) = self.memo.get_mut(handle.0) {
            if matches!(slot, MemoSlot::PageS(..) | MemoSlot::PageX(..)) {
                *slot = MemoSlot::Released;
            }
        }
    }

    /// Buffer a redo entry for commit.
    pub fn log(&mut self, op: RedoOp, page: PageId, bytes: &[u8]) {
        self.log.push(RedoEntry {
            op,
            page,
            bytes: bytes.to_vec(),
        });
    }

    /// Number of redo entries buffered so far.
    pub fn log_len(&self) -> usize {
        self.log.len()
    }

    /// Commit: refresh checksums on every X-latched page, append one
    /// contiguous redo record, then release all latches in reverse
    /// acquisition order.
    pub fn commit(mut self) -> Result<()> {
        for slot in self.memo.iter_mut() {
            if let MemoSlot::PageX(_, guard) = slot {
                page::refresh_crc32(&mut guard.buf)?;
            }
        }
        if !self.log.is_empty() {
            let mut record = Vec::new();
            for entry in &self.log {
                record.push(entry.op as u8);
                record.extend_from_slice(&entry.page.0.to_be_bytes());
                let len = u32::try_from(entry.bytes.len())
                    .map_err(|_| Error::Invalid("redo entry too large"))?;
                record.extend_from_slice(&len.to_be_bytes());
                record.extend_from_slice(&entry.bytes);
            }
            self.redo.append(&record);
            tracing::trace!(
                target: "cedar::mtr",
                entries = self.log.len(),
                bytes = record.len(),
                "mtr committed"
            );
            self.log.clear();
        }
        while self.memo.pop().is_some() {}
        Ok(())
    }
}

impl Drop for Mtr {
    fn drop(&mut self) {
        // Abandoned mtr: release latches without logging. A half-built
        // structural change must not outlive its operation.
        while self.memo.pop().is_some() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{MemCache, PageCache};

    fn cache_with_page(page: PageId) -> (Arc<MemCache>, FrameRef) {
        let cache = MemCache::new(256);
        let frame = cache.install(page).unwrap();
        (cache, frame)
    }

    #[test]
    fn page_latch_reuse_and_upgrade_rejection() {
        let (_cache, frame) = cache_with_page(PageId(1));
        let mut mtr = Mtr::new(Arc::new(NoopRedo));
        let a = mtr.latch_page(PageId(1), Arc::clone(&frame), LatchMode::S).unwrap();
        let b = mtr.latch_page(PageId(1), Arc::clone(&frame), LatchMode::S).unwrap();
        assert_eq!(a, b);
        assert!(mtr.latch_page(PageId(1), frame, LatchMode::X).is_err());
    }

    #[test]
    fn x_latch_blocks_until_commit() {
        let (_cache, frame) = cache_with_page(PageId(2));
        let mut mtr = Mtr::new(Arc::new(NoopRedo));
        mtr.latch_page(PageId(2), Arc::clone(&frame), LatchMode::X)
            .unwrap();
        assert!(frame.try_read().is_none());
        mtr.commit().unwrap();
        assert!(frame.try_read().is_some());
    }

    #[test]
    fn release_to_savepoint_drops_newest_first() {
        let cache = MemCache::new(256);
        let f1 = cache.install(PageId(1)).unwrap();
        let f2 = cache.install(PageId(2)).unwrap();
        let mut mtr = Mtr::new(Arc::new(NoopRedo));
        mtr.latch_page(PageId(1), Arc::clone(&f1), LatchMode::X).unwrap();
        let sp = mtr.savepoint();
        mtr.latch_page(PageId(2), Arc::clone(&f2), LatchMode::X).unwrap();
        mtr.release_to(sp);
        assert!(f2.try_write().is_some());
        assert!(f1.try_write().is_none());
    }

    #[test]
    fn tree_latch_sx_admits_readers() {
        let latch = TreeLatch::new();
        let mut writer = Mtr::new(Arc::new(NoopRedo));
        writer.latch_tree(&latch, TreeLatchMode::Sx);
        let mut reader = Mtr::new(Arc::new(NoopRedo));
        reader.latch_tree(&latch, TreeLatchMode::S);
        assert_eq!(reader.tree_latch_mode(), Some(TreeLatchMode::S));
        assert_eq!(writer.tree_latch_mode(), Some(TreeLatchMode::Sx));
    }

    #[test]
    fn commit_writes_one_contiguous_record() {
        let redo = MemRedo::new();
        let mut mtr = Mtr::new(redo.clone() as Arc<dyn RedoLog>);
        mtr.log(RedoOp::RecordInsert, PageId(5), b"abc");
        mtr.log(RedoOp::PageLink, PageId(6), &[]);
        mtr.commit().unwrap();
        assert_eq!(redo.committed(), 1);
        let record = &redo.records()[0];
        assert_eq!(record[0], RedoOp::RecordInsert as u8);
    }
}
