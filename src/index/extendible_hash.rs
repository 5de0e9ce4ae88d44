// # Extendible Hash Table
//
// A disk-resident hash index over the buffer pool. A directory page maps
// the low `global_depth` bits of a key's hash to bucket pages; buckets
// split (expanding the directory when needed) as they fill and merge with
// their split image when they empty.
//
// Concurrency: one table-level readers/writer latch serializes directory
// restructuring; each bucket page is additionally protected by its own page
// latch. Lookups and non-restructuring mutations run under the shared table
// latch; splits, merges, and directory resizing take the exclusive latch.
// Upgrading from shared to exclusive opens a window in which another writer
// may have restructured the directory, so every upgrade re-verifies the
// bucket routing before acting.
//
// Pages are pinned for the duration of use and unpinned on every exit path;
// mutated pages are unpinned dirty.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::buffer::BufferPool;
use crate::common::{PageId, INVALID_PAGE_ID};
use crate::error::{DbError, Result};
use crate::index::bucket_page::{BucketView, BucketViewMut};
use crate::index::directory_page::{DirectoryView, DirectoryViewMut, MAX_DEPTH};
use crate::index::{KeyCodec, KeyComparator, KeyHasher};
use crate::storage::Page;
use crate::transaction::Transaction;

/// Disk-backed extendible hash index.
///
/// Generic over the key and value codecs, the key comparator, and the hash
/// function. All state other than `directory_page_id` lives in pages owned
/// by the buffer pool.
pub struct ExtendibleHashTable<K, V, C, H> {
    buffer_pool: Arc<dyn BufferPool>,
    comparator: C,
    hasher: H,
    /// Page id of the directory; `INVALID_PAGE_ID` until first mutation.
    directory_page_id: AtomicU64,
    table_latch: RwLock<()>,
    _marker: PhantomData<(K, V)>,
}

impl<K, V, C, H> ExtendibleHashTable<K, V, C, H>
where
    K: KeyCodec,
    V: KeyCodec + PartialEq,
    C: KeyComparator<K>,
    H: KeyHasher<K>,
{
    pub fn new(buffer_pool: Arc<dyn BufferPool>, comparator: C, hasher: H) -> Self {
        Self {
            buffer_pool,
            comparator,
            hasher,
            directory_page_id: AtomicU64::new(INVALID_PAGE_ID),
            table_latch: RwLock::new(()),
            _marker: PhantomData,
        }
    }

    #[inline]
    fn hash(&self, key: &K) -> u32 {
        self.hasher.hash_key(key)
    }

    /// Page id of the directory, or `INVALID_PAGE_ID` before first use.
    #[inline]
    pub fn directory_page_id(&self) -> PageId {
        self.directory_page_id.load(Ordering::Acquire)
    }

    /// Allocate the directory page and the initial bucket at slot 0.
    ///
    /// Called with the exclusive table latch held. Idempotent.
    fn ensure_directory(&self) -> Result<PageId> {
        let existing = self.directory_page_id();
        if existing != INVALID_PAGE_ID {
            return Ok(existing);
        }

        let dir_page = self.buffer_pool.new_page()?;
        let dir_id = dir_page.page_id();
        let bucket_page = match self.buffer_pool.new_page() {
            Ok(page) => page,
            Err(err) => {
                self.buffer_pool.unpin_page(dir_id, false);
                return Err(err);
            }
        };
        let bucket_id = bucket_page.page_id();

        {
            let mut data = dir_page.write();
            let mut dir = DirectoryViewMut::new(data.data_mut());
            dir.set_page_id(dir_id);
            dir.set_bucket_page_id(0, bucket_id);
        }

        self.buffer_pool.unpin_page(bucket_id, false);
        self.buffer_pool.unpin_page(dir_id, true);
        self.directory_page_id.store(dir_id, Ordering::Release);
        debug!(directory = dir_id, bucket = bucket_id, "initialized hash directory");
        Ok(dir_id)
    }

    /// Look up every value stored under `key`.
    pub fn get_value(&self, _transaction: Option<&Transaction>, key: &K) -> Result<Vec<V>> {
        let _table = self.table_latch.read();

        let dir_id = self.directory_page_id();
        if dir_id == INVALID_PAGE_ID {
            return Ok(Vec::new());
        }

        let dir_page = self.buffer_pool.fetch_page(dir_id)?;
        let bucket_page_id = {
            let data = dir_page.read();
            let dir = DirectoryView::new(data.data());
            let slot = (self.hash(key) & dir.global_depth_mask()) as usize;
            dir.bucket_page_id(slot)
        };

        let bucket_page = match self.buffer_pool.fetch_page(bucket_page_id) {
            Ok(page) => page,
            Err(err) => {
                self.buffer_pool.unpin_page(dir_id, false);
                return Err(err);
            }
        };
        let result = {
            let data = bucket_page.read();
            BucketView::<K, V>::new(data.data()).get_value(key, &self.comparator)
        };

        self.buffer_pool.unpin_page(bucket_page_id, false);
        self.buffer_pool.unpin_page(dir_id, false);
        Ok(result)
    }

    /// Insert `(key, value)` with set semantics.
    ///
    /// `Ok(false)` means the identical pair is already present. Errors are
    /// capacity conditions (pool or directory exhausted) or I/O.
    pub fn insert(&self, _transaction: Option<&Transaction>, key: &K, value: &V) -> Result<bool> {
        loop {
            let mut full_bucket = INVALID_PAGE_ID;

            // Fast path: shared latch, bucket has room.
            {
                let _table = self.table_latch.read();
                let dir_id = self.directory_page_id();
                if dir_id != INVALID_PAGE_ID {
                    let dir_page = self.buffer_pool.fetch_page(dir_id)?;
                    let bucket_page_id = {
                        let data = dir_page.read();
                        let dir = DirectoryView::new(data.data());
                        let slot = (self.hash(key) & dir.global_depth_mask()) as usize;
                        dir.bucket_page_id(slot)
                    };

                    let bucket_page = match self.buffer_pool.fetch_page(bucket_page_id) {
                        Ok(page) => page,
                        Err(err) => {
                            self.buffer_pool.unpin_page(dir_id, false);
                            return Err(err);
                        }
                    };

                    let mut data = bucket_page.write();
                    let mut bucket = BucketViewMut::<K, V>::new(data.data_mut());
                    if !bucket.as_view().is_full() {
                        let inserted = bucket.insert(key, value, &self.comparator);
                        drop(data);
                        self.buffer_pool.unpin_page(bucket_page_id, inserted);
                        self.buffer_pool.unpin_page(dir_id, false);
                        return Ok(inserted);
                    }
                    drop(data);
                    self.buffer_pool.unpin_page(bucket_page_id, false);
                    self.buffer_pool.unpin_page(dir_id, false);
                    full_bucket = bucket_page_id;
                }
            }

            // Slow path: exclusive latch. The directory may have changed
            // between the latches, so the routing is computed afresh.
            let table = self.table_latch.write();
            let dir_id = self.ensure_directory()?;
            let dir_page = self.buffer_pool.fetch_page(dir_id)?;

            let bucket_page_id = {
                let data = dir_page.read();
                let dir = DirectoryView::new(data.data());
                let slot = (self.hash(key) & dir.global_depth_mask()) as usize;
                dir.bucket_page_id(slot)
            };

            if full_bucket != INVALID_PAGE_ID && bucket_page_id != full_bucket {
                // The key routes to a different bucket now; start over.
                self.buffer_pool.unpin_page(dir_id, false);
                drop(table);
                continue;
            }

            let bucket_page = match self.buffer_pool.fetch_page(bucket_page_id) {
                Ok(page) => page,
                Err(err) => {
                    self.buffer_pool.unpin_page(dir_id, false);
                    return Err(err);
                }
            };

            {
                let mut data = bucket_page.write();
                let mut bucket = BucketViewMut::<K, V>::new(data.data_mut());
                if !bucket.as_view().is_full() {
                    // Someone removed entries while we upgraded.
                    let inserted = bucket.insert(key, value, &self.comparator);
                    drop(data);
                    self.buffer_pool.unpin_page(bucket_page_id, inserted);
                    self.buffer_pool.unpin_page(dir_id, false);
                    return Ok(inserted);
                }
            }
            self.buffer_pool.unpin_page(bucket_page_id, false);

            let result = self.split_insert(&dir_page, key, value);
            self.buffer_pool.unpin_page(dir_id, true);
            return result;
        }
    }

    /// Split the key's target bucket until the key fits, then insert.
    ///
    /// Called with the exclusive table latch held and `dir_page` pinned by
    /// the caller, who unpins it dirty afterwards.
    fn split_insert(&self, dir_page: &Arc<Page>, key: &K, value: &V) -> Result<bool> {
        loop {
            let (slot, bucket_page_id) = {
                let data = dir_page.read();
                let dir = DirectoryView::new(data.data());
                let slot = (self.hash(key) & dir.global_depth_mask()) as usize;
                (slot, dir.bucket_page_id(slot))
            };

            let bucket_page = self.buffer_pool.fetch_page(bucket_page_id)?;

            {
                let mut data = bucket_page.write();
                let mut bucket = BucketViewMut::<K, V>::new(data.data_mut());
                if !bucket.as_view().is_full() {
                    let inserted = bucket.insert(key, value, &self.comparator);
                    drop(data);
                    self.buffer_pool.unpin_page(bucket_page_id, inserted);
                    return Ok(inserted);
                }
            }

            let mut dir_data = dir_page.write();
            let mut dir = DirectoryViewMut::new(dir_data.data_mut());

            if dir.local_depth(slot) == dir.global_depth() {
                if dir.global_depth() >= MAX_DEPTH {
                    drop(dir_data);
                    self.buffer_pool.unpin_page(bucket_page_id, false);
                    return Err(DbError::DirectoryFull(MAX_DEPTH));
                }
                dir.incr_global_depth();
                debug!(global_depth = dir.global_depth(), "expanded hash directory");
            }

            let new_local = dir.local_depth(slot) + 1;
            let image_page = match self.buffer_pool.new_page() {
                Ok(page) => page,
                Err(err) => {
                    drop(dir_data);
                    self.buffer_pool.unpin_page(bucket_page_id, false);
                    return Err(err);
                }
            };
            let image_page_id = image_page.page_id();

            {
                let mut split_data = bucket_page.write();
                let mut image_data = image_page.write();
                let mut split = BucketViewMut::<K, V>::new(split_data.data_mut());
                let mut image = BucketViewMut::<K, V>::new(image_data.data_mut());

                // Entries whose low `new_local` hash bits match the image
                // pattern migrate; the rest stay in the split bucket.
                let local_mask = (1u32 << new_local) - 1;
                let split_pattern = slot as u32 & local_mask;
                for i in 0..split.as_view().capacity() {
                    if !split.as_view().is_readable(i) {
                        continue;
                    }
                    let k = split.as_view().key_at(i);
                    if self.hash(&k) & local_mask != split_pattern {
                        let v = split.as_view().value_at(i);
                        image.insert(&k, &v, &self.comparator);
                        split.remove_at(i);
                    }
                }

                // Walk the directory by stride 2^new_local from each
                // pattern's canonical index: split slots keep the page and
                // take the new depth, image slots adopt the image page.
                let size = dir.size();
                let step = 1usize << new_local;
                let split_start = split_pattern as usize;
                let image_start = split_start ^ (1usize << (new_local - 1));

                let mut i = split_start;
                while i < size {
                    dir.set_local_depth(i, new_local);
                    i += step;
                }
                let mut i = image_start;
                while i < size {
                    dir.set_local_depth(i, new_local);
                    dir.set_bucket_page_id(i, image_page_id);
                    i += step;
                }
            }

            debug!(
                split = bucket_page_id,
                image = image_page_id,
                local_depth = new_local,
                "split bucket"
            );
            self.buffer_pool.unpin_page(image_page_id, true);
            self.buffer_pool.unpin_page(bucket_page_id, true);
        }
    }

    /// Remove `(key, value)`.
    ///
    /// An emptied bucket merges with its split image, and the directory
    /// shrinks while every local depth sits below the global depth.
    pub fn remove(&self, _transaction: Option<&Transaction>, key: &K, value: &V) -> Result<bool> {
        if self.directory_page_id() == INVALID_PAGE_ID {
            let _table = self.table_latch.write();
            self.ensure_directory()?;
        }

        let removed;
        {
            let _table = self.table_latch.read();
            let dir_id = self.directory_page_id();
            let dir_page = self.buffer_pool.fetch_page(dir_id)?;

            let (bucket_page_id, local_depth) = {
                let data = dir_page.read();
                let dir = DirectoryView::new(data.data());
                let slot = (self.hash(key) & dir.global_depth_mask()) as usize;
                (dir.bucket_page_id(slot), dir.local_depth(slot))
            };

            let bucket_page = match self.buffer_pool.fetch_page(bucket_page_id) {
                Ok(page) => page,
                Err(err) => {
                    self.buffer_pool.unpin_page(dir_id, false);
                    return Err(err);
                }
            };

            let (did_remove, now_empty) = {
                let mut data = bucket_page.write();
                let mut bucket = BucketViewMut::<K, V>::new(data.data_mut());
                let did_remove = bucket.remove(key, value, &self.comparator);
                (did_remove, bucket.as_view().is_empty())
            };

            self.buffer_pool.unpin_page(bucket_page_id, did_remove);
            self.buffer_pool.unpin_page(dir_id, false);

            if !(now_empty && local_depth > 0) {
                return Ok(did_remove);
            }
            removed = did_remove;
        }

        // The bucket emptied: upgrade to the exclusive latch and merge. The
        // routing is re-verified because the directory may have changed
        // while no latch was held.
        let _table = self.table_latch.write();
        let dir_id = self.directory_page_id();
        let dir_page = self.buffer_pool.fetch_page(dir_id)?;

        let (slot, bucket_page_id) = {
            let data = dir_page.read();
            let dir = DirectoryView::new(data.data());
            let slot = (self.hash(key) & dir.global_depth_mask()) as usize;
            (slot, dir.bucket_page_id(slot))
        };

        let bucket_page = match self.buffer_pool.fetch_page(bucket_page_id) {
            Ok(page) => page,
            Err(err) => {
                self.buffer_pool.unpin_page(dir_id, false);
                return Err(err);
            }
        };
        let still_empty = {
            let data = bucket_page.read();
            BucketView::<K, V>::new(data.data()).is_empty()
        };
        self.buffer_pool.unpin_page(bucket_page_id, false);

        let mut dir_dirty = false;
        {
            let mut dir_data = dir_page.write();
            let mut dir = DirectoryViewMut::new(dir_data.data_mut());

            if still_empty && dir.local_depth(slot) > 0 {
                self.merge(&mut dir, slot);
                dir_dirty = true;
            }
            while dir.can_shrink() {
                dir.decr_global_depth();
                dir_dirty = true;
                debug!(global_depth = dir.global_depth(), "shrunk hash directory");
            }
        }
        self.buffer_pool.unpin_page(dir_id, dir_dirty);
        Ok(removed)
    }

    /// Fold the empty bucket at `merge_slot` into its split image.
    ///
    /// No-op unless both slots are live, share a local depth, and point to
    /// distinct pages. One remove empties at most one bucket, so a single
    /// merge suffices; no recursion.
    fn merge(&self, dir: &mut DirectoryViewMut<'_>, merge_slot: usize) {
        let local_depth = dir.local_depth(merge_slot);
        if local_depth == 0 {
            return;
        }

        let image_slot = merge_slot ^ (1usize << (local_depth - 1));
        if image_slot >= dir.size() || dir.local_depth(image_slot) != local_depth {
            return;
        }

        let merge_page_id = dir.bucket_page_id(merge_slot);
        let image_page_id = dir.bucket_page_id(image_slot);
        if merge_page_id == image_page_id {
            return;
        }

        let size = dir.size();
        let step = 1usize << local_depth;
        let merge_start = merge_slot & (step - 1);
        let image_start = image_slot & (step - 1);

        let mut i = merge_start;
        while i < size {
            dir.set_bucket_page_id(i, image_page_id);
            dir.decr_local_depth(i);
            i += step;
        }
        let mut i = image_start;
        while i < size {
            dir.decr_local_depth(i);
            i += step;
        }

        debug!(merged = merge_page_id, into = image_page_id, "merged empty bucket");
        if !self.buffer_pool.delete_page(merge_page_id) {
            warn!(page_id = merge_page_id, "orphaned bucket page still pinned");
        }
    }

    /// Current global depth; 0 for a table that has never been written.
    pub fn global_depth(&self) -> u32 {
        let _table = self.table_latch.read();
        let dir_id = self.directory_page_id();
        if dir_id == INVALID_PAGE_ID {
            return 0;
        }
        let Ok(dir_page) = self.buffer_pool.fetch_page(dir_id) else {
            return 0;
        };
        let depth = {
            let data = dir_page.read();
            DirectoryView::new(data.data()).global_depth()
        };
        self.buffer_pool.unpin_page(dir_id, false);
        depth
    }

    /// Check the directory invariants, panicking on violation. Debug aid.
    pub fn verify_integrity(&self) {
        let _table = self.table_latch.read();
        let dir_id = self.directory_page_id();
        if dir_id == INVALID_PAGE_ID {
            return;
        }
        let dir_page = match self.buffer_pool.fetch_page(dir_id) {
            Ok(page) => page,
            Err(_) => return,
        };
        {
            let data = dir_page.read();
            DirectoryView::new(data.data()).verify_integrity();
        }
        self.buffer_pool.unpin_page(dir_id, false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferPoolInstance;
    use crate::index::{IdentityHasher, OrdComparator};
    use crate::storage::DiskManager;
    use tempfile::tempdir;

    type TestTable = ExtendibleHashTable<u32, u32, OrdComparator, IdentityHasher>;

    fn setup(pool_size: usize) -> (tempfile::TempDir, TestTable) {
        let dir = tempdir().unwrap();
        let disk = Arc::new(DiskManager::new(dir.path().join("index.db")).unwrap());
        let pool = Arc::new(BufferPoolInstance::new(pool_size, disk));
        (dir, ExtendibleHashTable::new(pool, OrdComparator, IdentityHasher))
    }

    #[test]
    fn test_lazy_directory_allocation() {
        let (_dir, table) = setup(16);
        assert_eq!(table.directory_page_id(), INVALID_PAGE_ID);
        assert_eq!(table.get_value(None, &1).unwrap(), vec![]);
        assert_eq!(table.directory_page_id(), INVALID_PAGE_ID);

        table.insert(None, &1, &1).unwrap();
        assert_ne!(table.directory_page_id(), INVALID_PAGE_ID);
        assert_eq!(table.global_depth(), 0);
    }

    #[test]
    fn test_duplicate_pair_rejected() {
        let (_dir, table) = setup(16);
        assert!(table.insert(None, &1, &1).unwrap());
        assert!(!table.insert(None, &1, &1).unwrap());
        assert!(table.insert(None, &1, &2).unwrap());
        assert_eq!(table.get_value(None, &1).unwrap().len(), 2);
    }

    #[test]
    fn test_pins_are_balanced() {
        let (_dir, table) = setup(8);
        for i in 0..200u32 {
            table.insert(None, &i, &i).unwrap();
        }
        for i in 0..200u32 {
            assert_eq!(table.get_value(None, &i).unwrap(), vec![i]);
        }
        table.verify_integrity();

        // every fetch was matched by an unpin: with no outstanding handles
        // the pool must be able to recycle all of its frames
        let (_dir2, table2) = setup(8);
        for i in 0..200u32 {
            table2.insert(None, &i, &i).unwrap();
        }
    }
}
