//! Notification seam for subsystems that key state by page identity.
//!
//! Lock tables and adaptive hash indexes attach predicate state to page ids.
//! When the engine moves records between pages or retires a page, those
//! subsystems must follow; the engine tells them through this trait and never
//! learns what they do with it.

use crate::types::PageId;

/// Observer of page-identity changes driven by structural maintenance.
///
/// Calls arrive while the affected pages are still X-latched by the invoking
/// mini-transaction, so observers see a consistent tree. Implementations must
/// not re-enter the engine.
pub trait PageObserver: Send + Sync + 'static {
    /// Records moved from `from` to `to`; predicate locks should follow.
    fn move_locks(&self, _from: PageId, _to: PageId) {}

    /// `page` was emptied or retired; cached hash entries for it are stale.
    fn drop_hash_index(&self, _page: PageId) {}
}

/// Observer for embedders with no lock table or hash index.
pub struct NoopObserver;

impl PageObserver for NoopObserver {}
