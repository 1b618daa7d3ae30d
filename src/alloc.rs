//! Two-segment page allocator.
//!
//! Each tree draws leaf pages and non-leaf pages from separate segments so
//! that a level's pages cluster on disk. The allocator tracks free lists per
//! segment, honors directional hints from the split engine, and supports an
//! advisory reservation check so structural operations fail up front instead
//! of midway.

use std::collections::BTreeSet;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::types::{Error, PageId, Result, SpaceId};

/// Which segment a page belongs to.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SegClass {
    /// Level-0 pages.
    Leaf,
    /// Pages at level 1 and above.
    NonLeaf,
}

/// Placement preference for a fresh page relative to a hint page.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum AllocDirection {
    /// Prefer a page numbered above the hint. Splits fed by ascending
    /// inserts ask for this.
    Up,
    /// Prefer a page numbered below the hint. Splits fed by descending
    /// inserts ask for this.
    Down,
    /// No preference.
    Any,
}

struct SegState {
    free: BTreeSet<u64>,
}

impl SegState {
    fn new() -> Self {
        Self {
            free: BTreeSet::new(),
        }
    }

    fn take_near(&mut self, hint: Option<PageId>, dir: AllocDirection) -> Option<u64> {
        let picked = match (hint, dir) {
            (Some(h), AllocDirection::Up) => self
                .free
                .range(h.0 + 1..)
                .next()
                .copied()
                .or_else(|| self.free.iter().next().copied()),
            (Some(h), AllocDirection::Down) => self
                .free
                .range(..h.0)
                .next_back()
                .copied()
                .or_else(|| self.free.iter().next().copied()),
            _ => self.free.iter().next().copied(),
        };
        if let Some(page) = picked {
            self.free.remove(&page);
        }
        picked
    }
}

struct AllocState {
    next_page: u64,
    leaf: SegState,
    nonleaf: SegState,
    fill_hints: FxHashMap<u64, u8>,
}

/// Allocator for one space. Thread-safe; callers still hold the tree latch
/// that orders structural changes, the internal mutex only protects the maps.
pub struct SegmentAllocator {
    space: SpaceId,
    max_pages: Option<u64>,
    state: Mutex<AllocState>,
}

impl SegmentAllocator {
    /// Allocator for `space`, optionally capped at `max_pages` total pages.
    pub fn new(space: SpaceId, max_pages: Option<u64>) -> Self {
        Self {
            space,
            max_pages,
            state: Mutex::new(AllocState {
                // Page 0 is the absent-page sentinel and is never handed out.
                next_page: 1,
                leaf: SegState::new(),
                nonleaf: SegState::new(),
                fill_hints: FxHashMap::default(),
            }),
        }
    }

    /// The space this allocator serves.
    pub fn space(&self) -> SpaceId {
        self.space
    }

    fn seg<'a>(state: &'a mut AllocState, class: SegClass) -> &'a mut SegState {
        match class {
            SegClass::Leaf => &mut state.leaf,
            SegClass::NonLeaf => &mut state.nonleaf,
        }
    }

    /// Hand out one page from `class`, preferring placement near `hint` in
    /// direction `dir`. Falls back to extending the space when the segment
    /// free list is empty.
    pub fn alloc(
        &self,
        class: SegClass,
        hint: Option<PageId>,
        dir: AllocDirection,
    ) -> Result<PageId> {
        let mut state = self.state.lock();
        if let Some(page) = Self::seg(&mut state, class).take_near(hint, dir) {
            state.fill_hints.remove(&page);
            tracing::trace!(target: "cedar::alloc", page, ?class, "reused free page");
            return Ok(PageId(page));
        }
        if let Some(cap) = self.max_pages {
            if state.next_page > cap {
                return Err(Error::NoSpace("space page cap reached"));
            }
        }
        let page = state.next_page;
        state.next_page += 1;
        tracing::trace!(target: "cedar::alloc", page, ?class, "extended space");
        Ok(PageId(page))
    }

    /// Return `page` to its segment's free list.
    pub fn free(&self, class: SegClass, page: PageId) {
        let mut state = self.state.lock();
        state.fill_hints.remove(&page.0);
        Self::seg(&mut state, class).free.insert(page.0);
        tracing::trace!(target: "cedar::alloc", page = page.0, ?class, "freed page");
    }

    /// Whether `page` sits on either free list or was never allocated.
    pub fn is_free(&self, page: PageId) -> bool {
        let state = self.state.lock();
        page.0 == 0
            || page.0 >= state.next_page
            || state.leaf.free.contains(&page.0)
            || state.nonleaf.free.contains(&page.0)
    }

    /// Advisory check that `n` more pages can be supplied. Callers reserve
    /// before starting a multi-page structural change so the operation does
    /// not run out of space halfway.
    pub fn reserve(&self, n: u64) -> Result<()> {
        let state = self.state.lock();
        let free = (state.leaf.free.len() + state.nonleaf.free.len()) as u64;
        if let Some(cap) = self.max_pages {
            let headroom = cap.saturating_sub(state.next_page.saturating_sub(1));
            if free + headroom < n {
                return Err(Error::NoSpace("reservation exceeds space headroom"));
            }
        }
        Ok(())
    }

    /// Record the fill percentage of `page` for placement decisions.
    pub fn set_free_space_hint(&self, page: PageId, fill_pct: u8) {
        self.state.lock().fill_hints.insert(page.0, fill_pct);
    }

    /// Last recorded fill percentage of `page`, if any.
    pub fn free_space_hint(&self, page: PageId) -> Option<u8> {
        self.state.lock().fill_hints.get(&page.0).copied()
    }

    /// Pages currently allocated and not on a free list.
    pub fn pages_in_use(&self) -> u64 {
        let state = self.state.lock();
        let issued = state.next_page - 1;
        issued - (state.leaf.free.len() + state.nonleaf.free.len()) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn never_hands_out_page_zero() {
        let alloc = SegmentAllocator::new(SpaceId(1), None);
        let first = alloc.alloc(SegClass::Leaf, None, AllocDirection::Any).unwrap();
        assert_eq!(first, PageId(1));
    }

    #[test]
    fn directional_reuse_prefers_the_requested_side() {
        let alloc = SegmentAllocator::new(SpaceId(1), None);
        for _ in 0..6 {
            alloc.alloc(SegClass::Leaf, None, AllocDirection::Any).unwrap();
        }
        alloc.free(SegClass::Leaf, PageId(2));
        alloc.free(SegClass::Leaf, PageId(5));
        let up = alloc
            .alloc(SegClass::Leaf, Some(PageId(3)), AllocDirection::Up)
            .unwrap();
        assert_eq!(up, PageId(5));
        let down = alloc
            .alloc(SegClass::Leaf, Some(PageId(3)), AllocDirection::Down)
            .unwrap();
        assert_eq!(down, PageId(2));
    }

    #[test]
    fn segments_do_not_share_free_lists() {
        let alloc = SegmentAllocator::new(SpaceId(1), None);
        let leaf = alloc.alloc(SegClass::Leaf, None, AllocDirection::Any).unwrap();
        alloc.free(SegClass::Leaf, leaf);
        let nonleaf = alloc
            .alloc(SegClass::NonLeaf, None, AllocDirection::Any)
            .unwrap();
        assert_ne!(nonleaf, leaf);
        assert!(alloc.is_free(leaf));
    }

    #[test]
    fn cap_is_enforced_through_reserve_and_alloc() {
        let alloc = SegmentAllocator::new(SpaceId(1), Some(2));
        alloc.reserve(2).unwrap();
        alloc.alloc(SegClass::Leaf, None, AllocDirection::Any).unwrap();
        alloc.alloc(SegClass::Leaf, None, AllocDirection::Any).unwrap();
        assert!(alloc.reserve(1).is_err());
        assert!(alloc.alloc(SegClass::Leaf, None, AllocDirection::Any).is_err());
    }

    #[test]
    fn fill_hints_follow_page_lifetime() {
        let alloc = SegmentAllocator::new(SpaceId(1), None);
        let page = alloc.alloc(SegClass::Leaf, None, AllocDirection::Any).unwrap();
        alloc.set_free_space_hint(page, 73);
        assert_eq!(alloc.free_space_hint(page), Some(73));
        alloc.free(SegClass::Leaf, page);
        assert_eq!(alloc.free_space_hint(page), None);
    }
}
