//! Page frames and the cache seam.
//!
//! The engine never owns page contents; it borrows latched frames from a
//! [`PageCache`]. Production embedders put a real buffer pool behind the
//! trait; [`MemCache`] keeps every frame resident and is what the tests use.

use std::io;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;

use crate::types::{PageId, Result};

/// In-memory image of one page: the primary byte buffer plus the optional
/// compressed twin that must stay byte-consistent with it.
pub struct Frame {
    /// The uncompressed page image.
    pub buf: Vec<u8>,
    /// Compressed image of `buf`, when the tree keeps one.
    pub zip: Option<Vec<u8>>,
}

impl Frame {
    fn zeroed(page_size: usize) -> Self {
        Self {
            buf: vec![0u8; page_size],
            zip: None,
        }
    }
}

/// A shared, latchable frame. The latch guards land in an mtr memo.
pub type FrameRef = Arc<RwLock<Frame>>;

/// The buffer-cache seam the engine fetches pinned frames through.
pub trait PageCache: Send + Sync + 'static {
    /// Size of every page supplied by this cache.
    fn page_size(&self) -> usize;

    /// Fetch the frame for a page the caller believes exists. A cache that
    /// cannot honor the read propagates the I/O error; it never hands back
    /// stale bytes.
    fn frame(&self, page: PageId) -> Result<FrameRef>;

    /// Install a zeroed frame for a page the allocator just handed out.
    fn install(&self, page: PageId) -> Result<FrameRef>;

    /// Drop the frame of a freed page.
    fn evict(&self, page: PageId);
}

/// Cache that keeps every frame resident in a hash map. No eviction.
pub struct MemCache {
    page_size: usize,
    frames: Mutex<FxHashMap<u64, FrameRef>>,
}

impl MemCache {
    /// Create a cache serving pages of `page_size` bytes.
    pub fn new(page_size: usize) -> Arc<Self> {
        Arc::new(Self {
            page_size,
            frames: Mutex::new(FxHashMap::default()),
        })
    }

    /// Number of resident frames.
    pub fn resident(&self) -> usize {
        self.frames.lock().len()
    }
}

impl PageCache for MemCache {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn frame(&self, page: PageId) -> Result<FrameRef> {
        let frames = self.frames.lock();
        match frames.get(&page.0) {
            Some(frame) => Ok(Arc::clone(frame)),
            None => Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("page {} not resident", page.0),
            )
            .into()),
        }
    }

    fn install(&self, page: PageId) -> Result<FrameRef> {
        let mut frames = self.frames.lock();
        let frame = Arc::new(RwLock::new(Frame::zeroed(self.page_size)));
        frames.insert(page.0, Arc::clone(&frame));
        Ok(frame)
    }

    fn evict(&self, page: PageId) {
        self.frames.lock().remove(&page.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Error;

    #[test]
    fn missing_frame_is_io_error() {
        let cache = MemCache::new(512);
        assert!(matches!(cache.frame(PageId(9)), Err(Error::Io(_))));
    }

    #[test]
    fn install_then_fetch() {
        let cache = MemCache::new(512);
        cache.install(PageId(4)).unwrap();
        let frame = cache.frame(PageId(4)).unwrap();
        assert_eq!(frame.read().buf.len(), 512);
        assert!(frame.read().zip.is_none());
        cache.evict(PageId(4));
        assert!(cache.frame(PageId(4)).is_err());
    }
}
