use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::sync::Arc;

use log::debug;
use parking_lot::RwLock;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::common::types::{PageId, PagePtr, Rid};
use crate::index::hash::bucket::HashTableBucket;
use crate::index::hash::directory::{HashTableDirectory, MAX_GLOBAL_DEPTH};
use crate::index::hash::error::HashIndexError;
use crate::storage::buffer::BufferPoolManager;

/// Disk-resident extendible hash index. The directory and every bucket live
/// in buffer pool pages; this type only holds the directory's page id.
///
/// Latching: the table-wide RwLock guards directory structure (depths and
/// page-id assignments), each page's own RwLock guards its contents, and
/// the table latch is always taken before any page latch. Read paths hold
/// the table latch shared; split and merge re-acquire it exclusively after
/// dropping every page latch.
pub struct ExtendibleHashTable<K> {
    buffer_pool: Arc<BufferPoolManager>,
    directory_page_id: PageId,
    table_latch: RwLock<()>,
    _phantom: PhantomData<K>,
}

impl<K> ExtendibleHashTable<K>
where
    K: Serialize + DeserializeOwned + Hash + Eq + Clone,
{
    /// Create an empty table: a directory whose single slot points at one
    /// empty bucket.
    pub fn new(buffer_pool: Arc<BufferPoolManager>) -> Result<Self, HashIndexError> {
        let (directory_page, directory_page_id) = buffer_pool.new_page()?;
        let (bucket_page, bucket_page_id) = buffer_pool.new_page()?;

        let mut directory = HashTableDirectory::new(directory_page_id);
        directory.set_bucket_page_id(0, bucket_page_id);
        directory.to_page(&mut directory_page.write());

        HashTableBucket::<K>::new().to_page(&mut bucket_page.write())?;

        buffer_pool.unpin_page(directory_page_id, true)?;
        buffer_pool.unpin_page(bucket_page_id, true)?;

        Ok(Self {
            buffer_pool,
            directory_page_id,
            table_latch: RwLock::new(()),
            _phantom: PhantomData,
        })
    }

    /// Open a table whose directory page already exists.
    pub fn open(buffer_pool: Arc<BufferPoolManager>, directory_page_id: PageId) -> Self {
        Self {
            buffer_pool,
            directory_page_id,
            table_latch: RwLock::new(()),
            _phantom: PhantomData,
        }
    }

    pub fn directory_page_id(&self) -> PageId {
        self.directory_page_id
    }

    /// 64-bit hash downcast to the 32 bits the directory indexes with.
    fn hash_of(key: &K) -> u32 {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        hasher.finish() as u32
    }

    fn key_to_directory_index(key: &K, directory: &HashTableDirectory) -> usize {
        (Self::hash_of(key) & directory.global_depth_mask()) as usize
    }

    fn key_to_page_id(key: &K, directory: &HashTableDirectory) -> PageId {
        directory.bucket_page_id(Self::key_to_directory_index(key, directory))
    }

    /// Pin the directory page and materialize it. The page stays pinned;
    /// the caller unpins once done (dirty if it wrote the directory back).
    fn fetch_directory(&self) -> Result<(PagePtr, HashTableDirectory), HashIndexError> {
        let page = self.buffer_pool.fetch_page(self.directory_page_id)?;
        let directory = HashTableDirectory::from_page(&page.read());
        Ok((page, directory))
    }

    /// Pin a bucket page. Materialization happens under the caller's page
    /// latch.
    fn fetch_bucket_page(&self, bucket_page_id: PageId) -> Result<PagePtr, HashIndexError> {
        Ok(self.buffer_pool.fetch_page(bucket_page_id)?)
    }

    /// Collect every rid stored under `key`.
    pub fn get(&self, key: &K) -> Result<Vec<Rid>, HashIndexError> {
        let table = self.table_latch.read();
        let (_directory_page, directory) = self.fetch_directory()?;

        let bucket_page_id = Self::key_to_page_id(key, &directory);
        let bucket_page = self.fetch_bucket_page(bucket_page_id)?;

        let result = {
            let guard = bucket_page.read();
            let bucket = HashTableBucket::<K>::from_page(&guard)?;
            bucket.get_value(key)
        };

        drop(table);
        self.buffer_pool.unpin_page(self.directory_page_id, false)?;
        self.buffer_pool.unpin_page(bucket_page_id, false)?;

        Ok(result)
    }

    /// Insert `(key, rid)`. Returns false when the exact pair is already
    /// present, or when the bucket is full and the directory cannot grow
    /// any further.
    pub fn insert(&self, key: &K, rid: Rid) -> Result<bool, HashIndexError> {
        let table = self.table_latch.read();
        let (_directory_page, directory) = self.fetch_directory()?;

        let bucket_page_id = Self::key_to_page_id(key, &directory);
        let bucket_page = self.fetch_bucket_page(bucket_page_id)?;

        {
            let mut guard = bucket_page.write();
            let mut bucket = HashTableBucket::<K>::from_page(&guard)?;
            if !bucket.is_full() {
                let inserted = bucket.insert(key.clone(), rid);
                if inserted {
                    bucket.to_page(&mut guard)?;
                }
                drop(guard);
                drop(table);
                self.buffer_pool.unpin_page(self.directory_page_id, false)?;
                self.buffer_pool.unpin_page(bucket_page_id, inserted)?;
                return Ok(inserted);
            }
        }

        drop(table);
        self.buffer_pool.unpin_page(self.directory_page_id, false)?;
        self.buffer_pool.unpin_page(bucket_page_id, false)?;

        self.split_insert(key, rid)
    }

    /// Slow insert path: split the overflowing bucket (doubling the
    /// directory when the bucket already uses every global bit), then retry
    /// the insert from the top.
    fn split_insert(&self, key: &K, rid: Rid) -> Result<bool, HashIndexError> {
        {
            let _table = self.table_latch.write();
            let (directory_page, mut directory) = self.fetch_directory()?;

            let split_index = Self::key_to_directory_index(key, &directory);
            let split_depth = directory.local_depth(split_index);

            if split_depth == directory.global_depth() {
                if directory.global_depth() == MAX_GLOBAL_DEPTH {
                    // Directory at capacity: refuse rather than overflow
                    // the fixed arrays.
                    self.buffer_pool.unpin_page(self.directory_page_id, false)?;
                    return Ok(false);
                }
                directory.incr_global_depth();
            }

            let split_index = Self::key_to_directory_index(key, &directory);
            directory.incr_local_depth(split_index);
            let new_depth = directory.local_depth(split_index);

            let split_page_id = Self::key_to_page_id(key, &directory);
            let split_page = self.fetch_bucket_page(split_page_id)?;
            let mut split_guard = split_page.write();
            let mut split_bucket = HashTableBucket::<K>::from_page(&split_guard)?;

            let entries = split_bucket.array_copy();
            split_bucket.clear();

            let (image_page, image_page_id) = self.buffer_pool.new_page()?;
            let mut image_guard = image_page.write();
            let mut image_bucket = HashTableBucket::<K>::new();

            let image_index = directory.split_image_index(split_index);
            directory.set_local_depth(image_index, new_depth);
            directory.set_bucket_page_id(image_index, image_page_id);

            debug!(
                "splitting bucket page {} into page {} at local depth {}",
                split_page_id, image_page_id, new_depth
            );

            // Every slot of the old group maps to one side or the other by
            // stride; sweep down and then up from both representatives so
            // the whole group is re-pointed.
            let stride = 1usize << new_depth;
            let mut i = split_index;
            loop {
                directory.set_local_depth(i, new_depth);
                directory.set_bucket_page_id(i, split_page_id);
                if i < stride {
                    break;
                }
                i -= stride;
            }
            let mut i = split_index + stride;
            while i < directory.size() {
                directory.set_local_depth(i, new_depth);
                directory.set_bucket_page_id(i, split_page_id);
                i += stride;
            }
            let mut i = image_index;
            loop {
                directory.set_local_depth(i, new_depth);
                directory.set_bucket_page_id(i, image_page_id);
                if i < stride {
                    break;
                }
                i -= stride;
            }
            let mut i = image_index + stride;
            while i < directory.size() {
                directory.set_local_depth(i, new_depth);
                directory.set_bucket_page_id(i, image_page_id);
                i += stride;
            }

            // Rehash the snapshot into whichever side now owns each key.
            for (entry_key, entry_rid) in entries {
                let target_page_id = Self::key_to_page_id(&entry_key, &directory);
                debug_assert!(
                    target_page_id == split_page_id || target_page_id == image_page_id
                );
                if target_page_id == split_page_id {
                    split_bucket.insert(entry_key, entry_rid);
                } else {
                    image_bucket.insert(entry_key, entry_rid);
                }
            }

            split_bucket.to_page(&mut split_guard)?;
            image_bucket.to_page(&mut image_guard)?;
            directory.to_page(&mut directory_page.write());

            drop(split_guard);
            drop(image_guard);

            self.buffer_pool.unpin_page(split_page_id, true)?;
            self.buffer_pool.unpin_page(image_page_id, true)?;
            self.buffer_pool.unpin_page(self.directory_page_id, true)?;
        }

        self.insert(key, rid)
    }

    /// Remove `(key, rid)`, tombstoning its slot. A bucket left empty is
    /// handed to `merge` for possible coalescing with its split image.
    pub fn remove(&self, key: &K, rid: Rid) -> Result<bool, HashIndexError> {
        let table = self.table_latch.read();
        let (_directory_page, directory) = self.fetch_directory()?;

        let bucket_page_id = Self::key_to_page_id(key, &directory);
        let bucket_page = self.fetch_bucket_page(bucket_page_id)?;

        let (removed, became_empty) = {
            let mut guard = bucket_page.write();
            let mut bucket = HashTableBucket::<K>::from_page(&guard)?;
            let removed = bucket.remove(key, rid);
            if removed {
                bucket.to_page(&mut guard)?;
            }
            (removed, bucket.is_empty())
        };

        drop(table);

        if became_empty {
            self.buffer_pool.unpin_page(self.directory_page_id, true)?;
            self.buffer_pool.unpin_page(bucket_page_id, false)?;
            self.merge(key)?;
            return Ok(removed);
        }

        self.buffer_pool.unpin_page(self.directory_page_id, false)?;
        self.buffer_pool.unpin_page(bucket_page_id, true)?;
        Ok(removed)
    }

    /// Coalesce an empty bucket with its split image and shrink the
    /// directory while no bucket uses every global bit.
    fn merge(&self, key: &K) -> Result<(), HashIndexError> {
        let _table = self.table_latch.write();
        let (directory_page, mut directory) = self.fetch_directory()?;

        let target_index = Self::key_to_directory_index(key, &directory);
        let image_index = directory.split_image_index_checked(target_index);
        let target_page_id = directory.bucket_page_id(target_index);

        let local_depth = directory.local_depth(target_index);

        // Depth zero cannot merge; siblings must be co-split to merge.
        let mergeable = match image_index {
            Some(image_index) => local_depth == directory.local_depth(image_index),
            None => false,
        };
        if !mergeable {
            self.buffer_pool.unpin_page(self.directory_page_id, false)?;
            return Ok(());
        }
        let image_index = image_index.expect("mergeable implies a split image");

        // The bucket may have been refilled between the remove and here.
        let target_page = self.fetch_bucket_page(target_page_id)?;
        let still_empty = {
            let guard = target_page.read();
            HashTableBucket::<K>::from_page(&guard)?.is_empty()
        };
        if !still_empty {
            self.buffer_pool.unpin_page(self.directory_page_id, false)?;
            self.buffer_pool.unpin_page(target_page_id, false)?;
            return Ok(());
        }

        self.buffer_pool.unpin_page(target_page_id, false)?;
        self.buffer_pool.delete_page(target_page_id)?;

        let image_page_id = directory.bucket_page_id(image_index);
        debug!(
            "merging empty bucket page {} into page {}",
            target_page_id, image_page_id
        );

        directory.set_bucket_page_id(target_index, image_page_id);
        directory.decr_local_depth(target_index);
        directory.decr_local_depth(image_index);
        debug_assert_eq!(
            directory.local_depth(target_index),
            directory.local_depth(image_index)
        );

        for i in 0..directory.size() {
            let page_id = directory.bucket_page_id(i);
            if page_id == target_page_id || page_id == image_page_id {
                directory.set_bucket_page_id(i, image_page_id);
                directory.set_local_depth(i, directory.local_depth(image_index));
            }
        }

        while directory.can_shrink() {
            directory.decr_global_depth();
        }

        directory.to_page(&mut directory_page.write());
        self.buffer_pool.unpin_page(self.directory_page_id, true)?;

        Ok(())
    }

    /// Current global depth of the directory.
    pub fn global_depth(&self) -> Result<u32, HashIndexError> {
        let _table = self.table_latch.read();
        let (_directory_page, directory) = self.fetch_directory()?;
        let depth = directory.global_depth();
        self.buffer_pool.unpin_page(self.directory_page_id, false)?;
        Ok(depth)
    }

    /// Panic if the directory invariants do not hold.
    pub fn verify_integrity(&self) -> Result<(), HashIndexError> {
        let _table = self.table_latch.read();
        let (_directory_page, directory) = self.fetch_directory()?;
        directory.verify_integrity();
        self.buffer_pool.unpin_page(self.directory_page_id, false)?;
        Ok(())
    }
}
