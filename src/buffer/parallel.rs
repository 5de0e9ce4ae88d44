// # Parallel Buffer Pool
//
// Shards buffer pool requests across N independent instances keyed by
// `page_id % N`. Each instance keeps its own mutex, page table, and
// replacer, so operations on pages owned by different shards never contend.

use parking_lot::Mutex;
use std::sync::Arc;

use crate::buffer::{BufferPool, BufferPoolInstance};
use crate::common::PageId;
use crate::error::{DbError, Result};
use crate::storage::{DiskManager, Page};

/// A collection of buffer pool instances fronted by a single [`BufferPool`]
/// implementation.
///
/// `fetch`, `unpin`, `flush`, and `delete` route by page id. `new_page`
/// round-robins a starting instance across calls so allocation load spreads
/// evenly; the cursor advances on every call whether or not the allocation
/// succeeds.
pub struct ParallelBufferPool {
    instances: Vec<Arc<BufferPoolInstance>>,
    start: Mutex<usize>,
}

impl ParallelBufferPool {
    /// Create a pool of `num_instances` shards with `pool_size` frames each.
    pub fn new(num_instances: usize, pool_size: usize, disk: Arc<DiskManager>) -> Self {
        assert!(num_instances > 0, "a parallel pool needs at least one instance");

        let instances = (0..num_instances)
            .map(|i| {
                Arc::new(BufferPoolInstance::with_sharding(
                    pool_size,
                    num_instances as u64,
                    i as u64,
                    Arc::clone(&disk),
                ))
            })
            .collect();

        Self {
            instances,
            start: Mutex::new(0),
        }
    }

    /// Create a pool with one shard per available CPU.
    pub fn with_default_instances(pool_size: usize, disk: Arc<DiskManager>) -> Self {
        Self::new(num_cpus::get().max(1), pool_size, disk)
    }

    /// Number of shards.
    pub fn num_instances(&self) -> usize {
        self.instances.len()
    }

    /// The instance responsible for `page_id`.
    #[inline]
    pub fn instance_for(&self, page_id: PageId) -> &Arc<BufferPoolInstance> {
        &self.instances[(page_id % self.instances.len() as u64) as usize]
    }
}

impl BufferPool for ParallelBufferPool {
    /// Try each instance starting from the round-robin cursor; the first
    /// success wins. Fails with `PoolExhausted` when every instance refuses.
    fn new_page(&self) -> Result<Arc<Page>> {
        let n = self.instances.len();
        let start = {
            let mut cursor = self.start.lock();
            let start = *cursor;
            *cursor = (start + 1) % n;
            start
        };

        for offset in 0..n {
            match self.instances[(start + offset) % n].new_page() {
                Ok(page) => return Ok(page),
                Err(DbError::NoEvictableFrame { .. }) => continue,
                Err(err) => return Err(err),
            }
        }
        Err(DbError::PoolExhausted { instances: n })
    }

    fn fetch_page(&self, page_id: PageId) -> Result<Arc<Page>> {
        self.instance_for(page_id).fetch_page(page_id)
    }

    fn unpin_page(&self, page_id: PageId, is_dirty: bool) -> bool {
        self.instance_for(page_id).unpin_page(page_id, is_dirty)
    }

    fn flush_page(&self, page_id: PageId) -> bool {
        self.instance_for(page_id).flush_page(page_id)
    }

    fn flush_all(&self) {
        for instance in &self.instances {
            instance.flush_all();
        }
    }

    fn delete_page(&self, page_id: PageId) -> bool {
        self.instance_for(page_id).delete_page(page_id)
    }

    /// Total frames across all instances.
    fn pool_size(&self) -> usize {
        self.instances.iter().map(|i| i.pool_size()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn setup(num_instances: usize, pool_size: usize) -> (tempfile::TempDir, ParallelBufferPool) {
        let dir = tempdir().unwrap();
        let disk = Arc::new(DiskManager::new(dir.path().join("data.db")).unwrap());
        (dir, ParallelBufferPool::new(num_instances, pool_size, disk))
    }

    #[test]
    fn test_allocation_residue_matches_owner() {
        let (_dir, pool) = setup(3, 2);
        for _ in 0..6 {
            let page = pool.new_page().unwrap();
            let id = page.page_id();
            // the owning instance must be the one that allocated it
            assert_eq!(pool.instance_for(id).pin_count_of(id), Some(1));
            pool.unpin_page(id, false);
        }
    }

    #[test]
    fn test_pool_size_sums_instances() {
        let (_dir, pool) = setup(4, 3);
        assert_eq!(pool.pool_size(), 12);
    }

    #[test]
    fn test_new_page_falls_over_to_next_instance() {
        let (_dir, pool) = setup(2, 1);
        // pin both shards' only frames
        let a = pool.new_page().unwrap();
        let b = pool.new_page().unwrap();
        assert!(matches!(
            pool.new_page(),
            Err(DbError::PoolExhausted { instances: 2 })
        ));

        pool.unpin_page(a.page_id(), false);
        // one shard has room again; round robin must still find it
        assert!(pool.new_page().is_ok());
        pool.unpin_page(b.page_id(), false);
    }

    #[test]
    fn test_routing_round_trip() {
        let (_dir, pool) = setup(3, 2);
        let page = pool.new_page().unwrap();
        let id = page.page_id();
        page.write().data_mut()[0] = 9;
        pool.unpin_page(id, true);

        let again = pool.fetch_page(id).unwrap();
        assert_eq!(again.read().data()[0], 9);
        pool.unpin_page(id, false);
        assert!(pool.flush_page(id));
        assert!(pool.delete_page(id));
    }
}
