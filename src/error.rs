//! Crate-wide error types.
//!
//! Buffer-pool and index failures surface as `DbError` values; boolean
//! contracts (`unpin_page`, `flush_page`, `delete_page`, the lock manager
//! API) report their outcome directly and never unwind across component
//! boundaries.

use thiserror::Error;

use crate::common::PageId;

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, DbError>;

/// Error type for storage, buffer, and index operations.
#[derive(Debug, Error)]
pub enum DbError {
    /// Underlying file I/O failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The buffer pool could not grant a frame: the free list is empty and
    /// every resident page is pinned.
    #[error("no evictable frame: all {pool_size} frames are pinned")]
    NoEvictableFrame { pool_size: usize },

    /// Every instance of a parallel buffer pool refused to allocate.
    #[error("buffer pool exhausted: all {instances} instances are full")]
    PoolExhausted { instances: usize },

    /// An operation referenced a page that is not in the pool.
    #[error("page {0} is not resident in the buffer pool")]
    PageNotResident(PageId),

    /// The hash directory is at its maximum depth and cannot grow.
    #[error("hash directory cannot grow past depth {0}")]
    DirectoryFull(u32),
}

impl DbError {
    /// Returns true when the failure is a capacity condition that may clear
    /// once other callers unpin pages.
    pub fn is_capacity(&self) -> bool {
        matches!(
            self,
            DbError::NoEvictableFrame { .. } | DbError::PoolExhausted { .. }
        )
    }
}
