// # Hash Table Directory Page
//
// On-page layout of the extendible hash directory, accessed through typed
// views over a page buffer borrowed from the buffer pool. The buffer pool
// owns the bytes; views borrow them for the pinned interval.
//
// Layout (little endian):
//
// ```text
// offset  0: page_id        u64
// offset  8: lsn            u64   (reserved for the log manager)
// offset 16: global_depth   u32
// offset 20: local_depths   [u8; DIRECTORY_ARRAY_SIZE]
// offset 276: bucket_page_ids [u64; DIRECTORY_ARRAY_SIZE]
// ```
//
// Only the first `2^global_depth` entries of the parallel arrays are live.

use std::collections::HashMap;

use tracing::warn;

use crate::common::{PageId, PAGE_SIZE};

/// Maximum directory depth; the directory arrays hold `2^MAX_DEPTH` slots.
pub const MAX_DEPTH: u32 = 8;

/// Number of slots in the on-page parallel arrays.
pub const DIRECTORY_ARRAY_SIZE: usize = 1 << MAX_DEPTH;

const PAGE_ID_OFFSET: usize = 0;
const LSN_OFFSET: usize = 8;
const GLOBAL_DEPTH_OFFSET: usize = 16;
const LOCAL_DEPTHS_OFFSET: usize = 20;
const BUCKET_PAGE_IDS_OFFSET: usize = LOCAL_DEPTHS_OFFSET + DIRECTORY_ARRAY_SIZE;
const DIRECTORY_PAGE_BYTES: usize = BUCKET_PAGE_IDS_OFFSET + DIRECTORY_ARRAY_SIZE * 8;

// Shared read accessors over raw directory bytes; both views delegate here.

#[inline]
fn read_u64(data: &[u8], offset: usize) -> u64 {
    u64::from_le_bytes(data[offset..offset + 8].try_into().expect("offset in page"))
}

#[inline]
fn read_global_depth(data: &[u8]) -> u32 {
    u32::from_le_bytes(
        data[GLOBAL_DEPTH_OFFSET..GLOBAL_DEPTH_OFFSET + 4]
            .try_into()
            .expect("offset in page"),
    )
}

#[inline]
fn read_local_depth(data: &[u8], slot: usize) -> u8 {
    data[LOCAL_DEPTHS_OFFSET + slot]
}

#[inline]
fn read_bucket_page_id(data: &[u8], slot: usize) -> PageId {
    read_u64(data, BUCKET_PAGE_IDS_OFFSET + slot * 8)
}

/// Read-only view over a directory page.
pub struct DirectoryView<'a> {
    data: &'a [u8],
}

impl<'a> DirectoryView<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        debug_assert!(data.len() >= DIRECTORY_PAGE_BYTES);
        debug_assert!(DIRECTORY_PAGE_BYTES <= PAGE_SIZE);
        Self { data }
    }

    #[inline]
    pub fn page_id(&self) -> PageId {
        read_u64(self.data, PAGE_ID_OFFSET)
    }

    #[inline]
    pub fn global_depth(&self) -> u32 {
        read_global_depth(self.data)
    }

    /// Mask selecting the low `global_depth` bits of a hash.
    #[inline]
    pub fn global_depth_mask(&self) -> u32 {
        (1u32 << self.global_depth()) - 1
    }

    /// Number of live directory slots.
    #[inline]
    pub fn size(&self) -> usize {
        1usize << self.global_depth()
    }

    #[inline]
    pub fn local_depth(&self, slot: usize) -> u32 {
        read_local_depth(self.data, slot) as u32
    }

    #[inline]
    pub fn bucket_page_id(&self, slot: usize) -> PageId {
        read_bucket_page_id(self.data, slot)
    }

    /// True when every live slot's local depth is strictly below the global
    /// depth, i.e. the directory can halve.
    pub fn can_shrink(&self) -> bool {
        let global_depth = self.global_depth();
        if global_depth == 0 {
            return false;
        }
        (0..self.size()).all(|slot| self.local_depth(slot) < global_depth)
    }

    /// Check the directory invariants, panicking on violation:
    ///
    /// 1. every live slot's local depth is at most the global depth
    /// 2. each distinct bucket page has exactly `2^(GD - LD)` slots
    /// 3. slots sharing a bucket page share a local depth
    pub fn verify_integrity(&self) {
        let global_depth = self.global_depth();
        let mut slot_count: HashMap<PageId, usize> = HashMap::new();
        let mut depth_of: HashMap<PageId, u32> = HashMap::new();

        for slot in 0..self.size() {
            let page_id = self.bucket_page_id(slot);
            let local_depth = self.local_depth(slot);
            assert!(
                local_depth <= global_depth,
                "slot {} has local depth {} above global depth {}",
                slot,
                local_depth,
                global_depth
            );

            *slot_count.entry(page_id).or_default() += 1;
            match depth_of.get(&page_id) {
                Some(&seen) if seen != local_depth => {
                    warn!(page_id, seen, local_depth, "local depth mismatch");
                    panic!("slots of bucket page {} disagree on local depth", page_id);
                }
                Some(_) => {}
                None => {
                    depth_of.insert(page_id, local_depth);
                }
            }
        }

        for (page_id, count) in &slot_count {
            let required = 1usize << (global_depth - depth_of[page_id]);
            if *count != required {
                warn!(page_id, count, required, "slot count mismatch");
                panic!(
                    "bucket page {} has {} slots, expected {}",
                    page_id, count, required
                );
            }
        }
    }
}

/// Mutable view over a directory page.
pub struct DirectoryViewMut<'a> {
    data: &'a mut [u8],
}

impl<'a> DirectoryViewMut<'a> {
    pub fn new(data: &'a mut [u8]) -> Self {
        debug_assert!(data.len() >= DIRECTORY_PAGE_BYTES);
        Self { data }
    }

    /// Reborrow as a read-only view.
    #[inline]
    pub fn as_view(&self) -> DirectoryView<'_> {
        DirectoryView::new(self.data)
    }

    #[inline]
    pub fn global_depth(&self) -> u32 {
        read_global_depth(self.data)
    }

    #[inline]
    pub fn global_depth_mask(&self) -> u32 {
        (1u32 << self.global_depth()) - 1
    }

    #[inline]
    pub fn size(&self) -> usize {
        1usize << self.global_depth()
    }

    #[inline]
    pub fn local_depth(&self, slot: usize) -> u32 {
        read_local_depth(self.data, slot) as u32
    }

    #[inline]
    pub fn bucket_page_id(&self, slot: usize) -> PageId {
        read_bucket_page_id(self.data, slot)
    }

    #[inline]
    pub fn set_page_id(&mut self, page_id: PageId) {
        self.data[PAGE_ID_OFFSET..PAGE_ID_OFFSET + 8].copy_from_slice(&page_id.to_le_bytes());
    }

    #[inline]
    pub fn set_lsn(&mut self, lsn: u64) {
        self.data[LSN_OFFSET..LSN_OFFSET + 8].copy_from_slice(&lsn.to_le_bytes());
    }

    #[inline]
    fn set_global_depth(&mut self, depth: u32) {
        self.data[GLOBAL_DEPTH_OFFSET..GLOBAL_DEPTH_OFFSET + 4]
            .copy_from_slice(&depth.to_le_bytes());
    }

    #[inline]
    pub fn set_local_depth(&mut self, slot: usize, depth: u32) {
        debug_assert!(depth <= MAX_DEPTH);
        self.data[LOCAL_DEPTHS_OFFSET + slot] = depth as u8;
    }

    #[inline]
    pub fn decr_local_depth(&mut self, slot: usize) {
        let depth = self.local_depth(slot);
        debug_assert!(depth > 0);
        self.set_local_depth(slot, depth - 1);
    }

    #[inline]
    pub fn set_bucket_page_id(&mut self, slot: usize, page_id: PageId) {
        let offset = BUCKET_PAGE_IDS_OFFSET + slot * 8;
        self.data[offset..offset + 8].copy_from_slice(&page_id.to_le_bytes());
    }

    /// Double the live directory by mirroring the lower half into the upper
    /// half, then bump the global depth.
    pub fn incr_global_depth(&mut self) {
        let old_depth = self.global_depth();
        assert!(old_depth < MAX_DEPTH, "directory is already at max depth");

        let old_size = 1usize << old_depth;
        for slot in 0..old_size {
            let page_id = self.bucket_page_id(slot);
            let depth = self.local_depth(slot);
            self.set_bucket_page_id(slot + old_size, page_id);
            self.set_local_depth(slot + old_size, depth);
        }
        self.set_global_depth(old_depth + 1);
    }

    /// Halve the live directory. Callers check `can_shrink` first.
    pub fn decr_global_depth(&mut self) {
        let depth = self.global_depth();
        debug_assert!(depth > 0);
        self.set_global_depth(depth - 1);
    }

    pub fn can_shrink(&self) -> bool {
        self.as_view().can_shrink()
    }
}
