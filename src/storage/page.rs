// # Page - Buffer Frame Unit
//
// A `Page` is the in-memory state of one buffer frame: the page identity,
// pin count, dirty flag, and the page bytes behind a read/write latch.
// Metadata lives in atomics so status reads never touch the latch; the
// owning buffer pool is the only writer of the metadata.

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use crate::common::{FrameId, PageId, INVALID_PAGE_ID, PAGE_SIZE};

// ============================================================================
// Page Buffer - Aligned Page Bytes
// ============================================================================

/// Page-aligned buffer holding one page's bytes.
///
/// `#[repr(C, align(4096))]` keeps the buffer compatible with direct I/O and
/// gives a predictable layout for on-page structures.
#[repr(C, align(4096))]
#[derive(Clone)]
pub struct PageBuffer {
    data: [u8; PAGE_SIZE],
}

impl PageBuffer {
    /// Create a new zeroed page buffer
    #[inline]
    pub fn new() -> Self {
        Self {
            data: [0u8; PAGE_SIZE],
        }
    }

    /// Get immutable reference to page data
    #[inline(always)]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Get mutable reference to page data
    #[inline(always)]
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Zero out the entire page
    #[inline]
    pub fn zero(&mut self) {
        self.data.fill(0);
    }

    /// Copy data from a byte slice; the slice must be at most `PAGE_SIZE`
    #[inline]
    pub fn copy_from_slice(&mut self, src: &[u8]) {
        self.data[..src.len()].copy_from_slice(src);
    }

    /// Calculate checksum of page data (CRC32)
    #[inline]
    pub fn checksum(&self) -> u32 {
        crc32fast::hash(&self.data)
    }

    /// Verify page checksum
    #[inline]
    pub fn verify_checksum(&self, expected: u32) -> bool {
        self.checksum() == expected
    }
}

impl Default for PageBuffer {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Page - Frame State
// ============================================================================

/// One buffer frame's state.
///
/// The buffer pool owns the frame array and is the sole mutator of the
/// metadata fields; callers interact with the bytes through [`Page::read`]
/// and [`Page::write`], which double as the per-page latch. The latch is
/// orthogonal to every other lock in the system.
pub struct Page {
    /// Index of this frame in the pool's frame array.
    frame_id: FrameId,

    /// Page currently stored in this frame (`INVALID_PAGE_ID` if empty).
    page_id: AtomicU64,

    /// Number of concurrent users; a pinned frame cannot be evicted.
    pin_count: AtomicU32,

    /// Whether the bytes diverge from the on-disk image.
    dirty: AtomicBool,

    /// Page bytes behind the per-page read/write latch.
    data: RwLock<PageBuffer>,
}

impl Page {
    pub(crate) fn new(frame_id: FrameId) -> Self {
        Self {
            frame_id,
            page_id: AtomicU64::new(INVALID_PAGE_ID),
            pin_count: AtomicU32::new(0),
            dirty: AtomicBool::new(false),
            data: RwLock::new(PageBuffer::new()),
        }
    }

    /// Get frame ID
    #[inline(always)]
    pub fn frame_id(&self) -> FrameId {
        self.frame_id
    }

    /// Get page ID (latch-free)
    #[inline(always)]
    pub fn page_id(&self) -> PageId {
        self.page_id.load(Ordering::Acquire)
    }

    /// Get pin count (latch-free)
    #[inline(always)]
    pub fn pin_count(&self) -> u32 {
        self.pin_count.load(Ordering::Acquire)
    }

    /// Check whether the page has unwritten modifications (latch-free)
    #[inline(always)]
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Acquire the page latch in shared mode and read the bytes.
    #[inline]
    pub fn read(&self) -> RwLockReadGuard<'_, PageBuffer> {
        self.data.read()
    }

    /// Acquire the page latch in exclusive mode and access the bytes.
    #[inline]
    pub fn write(&self) -> RwLockWriteGuard<'_, PageBuffer> {
        self.data.write()
    }

    #[inline]
    pub(crate) fn set_page_id(&self, page_id: PageId) {
        self.page_id.store(page_id, Ordering::Release);
    }

    #[inline]
    pub(crate) fn set_dirty(&self, dirty: bool) {
        self.dirty.store(dirty, Ordering::Release);
    }

    /// Increment the pin count; returns the previous count.
    #[inline]
    pub(crate) fn pin(&self) -> u32 {
        self.pin_count.fetch_add(1, Ordering::AcqRel)
    }

    /// Decrement the pin count; returns the new count.
    ///
    /// The pool checks for zero before calling, so underflow indicates a
    /// bookkeeping bug and panics.
    #[inline]
    pub(crate) fn unpin(&self) -> u32 {
        let old = self.pin_count.fetch_sub(1, Ordering::AcqRel);
        assert!(old > 0, "unpin on frame {} with pin count 0", self.frame_id);
        old - 1
    }

    #[inline]
    pub(crate) fn set_pin_count(&self, count: u32) {
        self.pin_count.store(count, Ordering::Release);
    }

    /// Reset the frame to the empty state, zeroing the bytes.
    pub(crate) fn reset(&self) {
        self.set_page_id(INVALID_PAGE_ID);
        self.set_dirty(false);
        self.set_pin_count(0);
        self.data.write().zero();
    }
}
