// # Buffer Pool Instance
//
// A fixed-capacity frame cache mediating all access to on-disk pages.
// One coarse mutex serializes every state transition: the page table, the
// free list, and replacer membership always agree, and a dirty frame is
// written back before its bytes are reused.
//
// Frame lifecycle invariants:
// - each resident page id maps to exactly one frame
// - a frame is on the free list iff it holds no page
// - a frame is in the replacer iff it holds a page with pin count zero
// - free list, replacer, and pinned frames partition `[0, pool_size)`

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::buffer::replacer::LruReplacer;
use crate::buffer::BufferPool;
use crate::common::{FrameId, PageId, INVALID_PAGE_ID};
use crate::error::{DbError, Result};
use crate::storage::{DiskManager, Page};

/// Point-in-time copy of the pool counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct BufferPoolStats {
    /// Fetches satisfied from a resident frame.
    pub hits: u64,
    /// Fetches that went to disk.
    pub misses: u64,
    /// Frames reclaimed through the replacer.
    pub evictions: u64,
    /// Dirty pages written back before eviction or delete.
    pub write_backs: u64,
}

/// Mutable pool state guarded by the coarse mutex.
struct PoolState {
    page_table: HashMap<PageId, FrameId>,
    free_list: VecDeque<FrameId>,
    next_page_id: PageId,
}

/// A single buffer pool instance.
///
/// In a parallel pool of `N` instances, instance `k` allocates page ids from
/// the progression `k, k + N, k + 2N, ...` so that `page_id % N` always
/// routes back to the owning instance.
pub struct BufferPoolInstance {
    pool_size: usize,
    num_instances: u64,
    instance_index: u64,
    frames: Vec<Arc<Page>>,
    replacer: LruReplacer,
    disk: Arc<DiskManager>,
    state: Mutex<PoolState>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    write_backs: AtomicU64,
}

impl BufferPoolInstance {
    /// Create a standalone instance (not part of a parallel pool).
    pub fn new(pool_size: usize, disk: Arc<DiskManager>) -> Self {
        Self::with_sharding(pool_size, 1, 0, disk)
    }

    /// Create an instance that is shard `instance_index` of `num_instances`.
    pub fn with_sharding(
        pool_size: usize,
        num_instances: u64,
        instance_index: u64,
        disk: Arc<DiskManager>,
    ) -> Self {
        assert!(pool_size > 0, "pool size must be positive");
        assert!(num_instances > 0, "a pool needs at least one instance");
        assert!(
            instance_index < num_instances,
            "instance index {} out of range for {} instances",
            instance_index,
            num_instances
        );

        let frames = (0..pool_size).map(|i| Arc::new(Page::new(i))).collect();

        Self {
            pool_size,
            num_instances,
            instance_index,
            frames,
            replacer: LruReplacer::new(pool_size),
            disk,
            state: Mutex::new(PoolState {
                page_table: HashMap::with_capacity(pool_size),
                free_list: (0..pool_size).collect(),
                next_page_id: instance_index,
            }),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            write_backs: AtomicU64::new(0),
        }
    }

    /// Grab a usable frame: the free list first, otherwise evict a victim.
    ///
    /// On eviction the old page is written back if dirty and its page-table
    /// entry is removed. Called with the state mutex held.
    fn acquire_frame(&self, state: &mut PoolState) -> Result<FrameId> {
        if let Some(frame_id) = state.free_list.pop_front() {
            return Ok(frame_id);
        }

        let frame_id = self.replacer.victim().ok_or(DbError::NoEvictableFrame {
            pool_size: self.pool_size,
        })?;
        self.evictions.fetch_add(1, Ordering::Relaxed);

        let page = &self.frames[frame_id];
        let old_page_id = page.page_id();
        if page.is_dirty() {
            let data = page.read();
            if let Err(err) = self.disk.write_page(old_page_id, data.data()) {
                // the victim stays resident and evictable
                drop(data);
                self.replacer.unpin(frame_id);
                return Err(err);
            }
            drop(data);
            page.set_dirty(false);
            self.write_backs.fetch_add(1, Ordering::Relaxed);
            debug!(page_id = old_page_id, frame_id, "wrote back dirty page on eviction");
        }
        state.page_table.remove(&old_page_id);
        Ok(frame_id)
    }

    /// Instance-local pin count for a resident page, if any.
    pub fn pin_count_of(&self, page_id: PageId) -> Option<u32> {
        let state = self.state.lock();
        let frame_id = *state.page_table.get(&page_id)?;
        Some(self.frames[frame_id].pin_count())
    }

    /// Dirty flag of a resident page, if any.
    pub fn is_dirty(&self, page_id: PageId) -> Option<bool> {
        let state = self.state.lock();
        let frame_id = *state.page_table.get(&page_id)?;
        Some(self.frames[frame_id].is_dirty())
    }

    /// Number of frames on the free list.
    pub fn free_frames(&self) -> usize {
        self.state.lock().free_list.len()
    }

    /// Number of frames currently evictable.
    pub fn evictable_frames(&self) -> usize {
        self.replacer.size()
    }

    /// Number of resident pages.
    pub fn resident_pages(&self) -> usize {
        self.state.lock().page_table.len()
    }

    /// Pool counters since construction.
    pub fn stats(&self) -> BufferPoolStats {
        BufferPoolStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            write_backs: self.write_backs.load(Ordering::Relaxed),
        }
    }
}

impl BufferPool for BufferPoolInstance {
    /// Allocate a fresh zeroed page, pinned with pin count 1.
    fn new_page(&self) -> Result<Arc<Page>> {
        let mut state = self.state.lock();
        let frame_id = self.acquire_frame(&mut state)?;

        let page_id = state.next_page_id;
        state.next_page_id += self.num_instances;
        debug_assert_eq!(page_id % self.num_instances, self.instance_index);

        let page = &self.frames[frame_id];
        page.write().zero();
        page.set_page_id(page_id);
        page.set_dirty(false);
        page.set_pin_count(1);
        self.replacer.pin(frame_id);

        state.page_table.insert(page_id, frame_id);
        Ok(Arc::clone(page))
    }

    /// Fetch a page, reading from disk on a miss. The page comes back pinned.
    fn fetch_page(&self, page_id: PageId) -> Result<Arc<Page>> {
        if page_id == INVALID_PAGE_ID {
            return Err(DbError::PageNotResident(page_id));
        }

        let mut state = self.state.lock();

        if let Some(&frame_id) = state.page_table.get(&page_id) {
            let page = &self.frames[frame_id];
            page.pin();
            self.replacer.pin(frame_id);
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(Arc::clone(page));
        }

        let frame_id = self.acquire_frame(&mut state)?;
        let page = &self.frames[frame_id];
        {
            let mut data = page.write();
            if let Err(err) = self.disk.read_page(page_id, data.data_mut()) {
                // hand the frame back rather than stranding it
                drop(data);
                state.free_list.push_front(frame_id);
                return Err(err);
            }
        }
        page.set_page_id(page_id);
        page.set_dirty(false);
        page.set_pin_count(1);
        self.replacer.pin(frame_id);

        state.page_table.insert(page_id, frame_id);
        self.misses.fetch_add(1, Ordering::Relaxed);
        Ok(Arc::clone(page))
    }

    /// Drop one pin. When the count reaches zero the frame becomes evictable.
    fn unpin_page(&self, page_id: PageId, is_dirty: bool) -> bool {
        let state = self.state.lock();
        let Some(&frame_id) = state.page_table.get(&page_id) else {
            return false;
        };

        let page = &self.frames[frame_id];
        if page.pin_count() == 0 {
            return false;
        }

        if is_dirty {
            page.set_dirty(true);
        }
        if page.unpin() == 0 {
            self.replacer.unpin(frame_id);
        }
        true
    }

    /// Write a resident page to disk and clear its dirty flag.
    ///
    /// Residency and pin state are unchanged. Returns false quietly for
    /// `INVALID_PAGE_ID` and pages that are not resident.
    fn flush_page(&self, page_id: PageId) -> bool {
        if page_id == INVALID_PAGE_ID {
            return false;
        }

        let state = self.state.lock();
        let Some(&frame_id) = state.page_table.get(&page_id) else {
            return false;
        };

        let page = &self.frames[frame_id];
        let data = page.read();
        if let Err(err) = self.disk.write_page(page_id, data.data()) {
            warn!(page_id, %err, "flush failed");
            return false;
        }
        drop(data);
        page.set_dirty(false);
        true
    }

    /// Flush every resident page.
    fn flush_all(&self) {
        let page_ids: Vec<PageId> = {
            let state = self.state.lock();
            state.page_table.keys().copied().collect()
        };
        for page_id in page_ids {
            self.flush_page(page_id);
        }
    }

    /// Deallocate a page.
    ///
    /// Returns true when the page is not resident. A pinned page cannot be
    /// deleted and yields false. Otherwise the frame is reset and returned
    /// to the free list, with a write-back first if the page was dirty.
    fn delete_page(&self, page_id: PageId) -> bool {
        let mut state = self.state.lock();
        let Some(&frame_id) = state.page_table.get(&page_id) else {
            return true;
        };

        let page = &self.frames[frame_id];
        if page.pin_count() > 0 {
            return false;
        }

        if page.is_dirty() {
            let data = page.read();
            if let Err(err) = self.disk.write_page(page_id, data.data()) {
                warn!(page_id, %err, "write back on delete failed");
            } else {
                self.write_backs.fetch_add(1, Ordering::Relaxed);
            }
        }

        state.page_table.remove(&page_id);
        self.replacer.pin(frame_id);
        page.reset();
        state.free_list.push_back(frame_id);
        true
    }

    fn pool_size(&self) -> usize {
        self.pool_size
    }
}

impl Drop for BufferPoolInstance {
    fn drop(&mut self) {
        self.flush_all();
        if let Err(err) = self.disk.sync() {
            warn!(%err, "sync on buffer pool teardown failed");
        }
    }
}
