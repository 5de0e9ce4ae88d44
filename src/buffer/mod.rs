//! # Buffer Manager
//!
//! Frame cache between the disk manager and everything above it. Pages are
//! shared through pin counts: `new_page` and `fetch_page` hand back a pinned
//! page, and every successful call must be matched by exactly one
//! `unpin_page`. Unpinned frames enter the LRU replacer and may be evicted,
//! with dirty bytes written back first.
//!
//! Two implementations of the [`BufferPool`] trait are provided:
//!
//! - [`BufferPoolInstance`]: a single pool behind one coarse mutex
//! - [`ParallelBufferPool`]: N instances sharded by `page_id % N`

pub mod instance;
pub mod parallel;
pub mod replacer;

pub use instance::{BufferPoolInstance, BufferPoolStats};
pub use parallel::ParallelBufferPool;
pub use replacer::LruReplacer;

use std::sync::Arc;

use crate::common::PageId;
use crate::error::Result;
use crate::storage::Page;

/// Common interface of the single-instance and parallel buffer pools.
///
/// Consumers such as the extendible hash index hold an `Arc<dyn BufferPool>`
/// and work against either implementation.
pub trait BufferPool: Send + Sync {
    /// Allocate a fresh zeroed page, returned pinned with pin count 1.
    fn new_page(&self) -> Result<Arc<Page>>;

    /// Pin an existing page, reading it from disk if not resident.
    fn fetch_page(&self, page_id: PageId) -> Result<Arc<Page>>;

    /// Release one pin, ORing `is_dirty` into the page's dirty flag.
    ///
    /// Returns false when the page is not resident or already unpinned.
    fn unpin_page(&self, page_id: PageId, is_dirty: bool) -> bool;

    /// Write a resident page to disk and clear its dirty flag.
    fn flush_page(&self, page_id: PageId) -> bool;

    /// Flush every resident page.
    fn flush_all(&self);

    /// Deallocate a page; false when the page is pinned.
    fn delete_page(&self, page_id: PageId) -> bool;

    /// Number of frames managed by the pool.
    fn pool_size(&self) -> usize;
}
