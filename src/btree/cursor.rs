//! Cursor positions and in-page binary search.
//!
//! Slot order is key order, so both leaf positioning and the non-leaf descend
//! rule reduce to binary searches over the slot directory.

use crate::btree::page::{self, Header, SlotExtents};
use crate::mtr::PageHandle;
use crate::types::Result;

/// A position on a latched page: the page's memo handle and a slot index.
/// For a miss the slot is the insertion point and may equal the slot count.
#[derive(Copy, Clone, Debug)]
pub struct Cursor {
    /// Memo handle of the latched page.
    pub page: PageHandle,
    /// Slot index on that page.
    pub slot: usize,
}

/// Binary search a leaf for `key`. `Ok(Ok(slot))` on an exact match,
/// `Ok(Err(slot))` with the insertion point on a miss.
pub fn leaf_lower_bound(
    payload: &[u8],
    header: &Header,
    extents: &SlotExtents,
    key: &[u8],
) -> Result<std::result::Result<usize, usize>> {
    let mut lo = 0usize;
    let mut hi = extents.len();
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        let probe = page::key_at(payload, header, extents, mid)?;
        match probe.cmp(key) {
            std::cmp::Ordering::Less => lo = mid + 1,
            std::cmp::Ordering::Equal => return Ok(Ok(mid)),
            std::cmp::Ordering::Greater => hi = mid,
        }
    }
    Ok(Err(lo))
}

/// The node-pointer slot to follow for `key`: the last separator not greater
/// than `key`, clamped to the first slot so keys below every separator still
/// descend through the leftmost pointer.
pub fn descend_slot(
    payload: &[u8],
    header: &Header,
    extents: &SlotExtents,
    key: &[u8],
) -> Result<usize> {
    let mut lo = 0usize;
    let mut hi = extents.len();
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        let probe = page::key_at(payload, header, extents, mid)?;
        if probe <= key {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }
    Ok(lo.saturating_sub(1))
}
