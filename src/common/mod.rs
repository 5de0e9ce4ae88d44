// # Common Types
//
// Shared identifiers, sentinels, and size constants used across the storage,
// buffer, index, and transaction modules.

use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// Type Aliases - Shared Identifiers
// ============================================================================

/// Unique identifier for pages in storage
pub type PageId = u64;

/// Index of a frame within a buffer pool instance
pub type FrameId = usize;

/// Unique identifier for transactions; smaller ids are older
pub type TransactionId = u64;

/// Log Sequence Number reserved for the (absent) write-ahead log
pub type LogSequenceNumber = u64;

// ============================================================================
// Constants
// ============================================================================

/// Standard page size in bytes
pub const PAGE_SIZE: usize = 4096;

/// Sentinel meaning "no page"
pub const INVALID_PAGE_ID: PageId = u64::MAX;

/// Sentinel meaning "no transaction"
pub const INVALID_TXN_ID: TransactionId = u64::MAX;

// ============================================================================
// Record Identifier
// ============================================================================

/// Physical location of a record: page plus slot within the page.
///
/// Used as the locking granule by the lock manager and as the value type of
/// secondary indexes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Rid {
    /// Page holding the record.
    pub page_id: PageId,
    /// Slot number within the page.
    pub slot: u32,
}

impl Rid {
    /// Creates a record identifier.
    #[inline]
    pub fn new(page_id: PageId, slot: u32) -> Self {
        Self { page_id, slot }
    }
}

impl fmt::Display for Rid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.page_id, self.slot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rid_ordering_and_display() {
        let a = Rid::new(1, 0);
        let b = Rid::new(1, 3);
        let c = Rid::new(2, 0);
        assert!(a < b);
        assert!(b < c);
        assert_eq!(a.to_string(), "(1, 0)");
    }
}
