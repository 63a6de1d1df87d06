use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Arc;
use log::debug;
use parking_lot::{Mutex, RwLock};

use crate::common::types::{Frame, FrameId, Page, PageId, PagePtr, INVALID_PAGE_ID};
use crate::storage::buffer::error::BufferPoolError;
use crate::storage::buffer::replacer::LruReplacer;
use crate::storage::disk::DiskManager;

/// One instance of a shardable buffer pool: a bounded, frame-indexed cache
/// of disk pages with pin counting and LRU eviction.
///
/// Page ids allocated by an instance are congruent to `instance_index`
/// modulo `num_instances`, so a routing layer can map any page id back to
/// its owning instance without coordination.
///
/// A single mutex over the pool core serializes every public operation for
/// its whole duration, disk I/O included. Operations on one instance are
/// therefore linearizable; throughput comes from sharding, not from
/// fine-grained locking inside an instance.
pub struct BufferPoolManager {
    pool_size: usize,
    num_instances: u32,
    instance_index: u32,
    disk_manager: Arc<DiskManager>,
    core: Mutex<PoolCore>,
}

struct PoolCore {
    frames: Vec<Frame>,
    page_table: HashMap<PageId, FrameId>,
    free_list: VecDeque<FrameId>,
    replacer: LruReplacer,
    next_page_id: PageId,
}

impl BufferPoolManager {
    /// Stand-alone pool over its own disk manager (`num_instances = 1`).
    pub fn new(pool_size: usize, db_path: impl AsRef<Path>) -> Result<Self, BufferPoolError> {
        let disk_manager = Arc::new(DiskManager::new(db_path)?);
        Ok(Self::new_sharded(pool_size, 1, 0, disk_manager))
    }

    /// One shard of a pool of `num_instances` instances over a shared disk
    /// manager.
    pub fn new_sharded(
        pool_size: usize,
        num_instances: u32,
        instance_index: u32,
        disk_manager: Arc<DiskManager>,
    ) -> Self {
        assert!(num_instances > 0, "pool must have at least one instance");
        assert!(
            instance_index < num_instances,
            "instance index {} out of range for {} instances",
            instance_index,
            num_instances
        );

        let mut frames = Vec::with_capacity(pool_size);
        let mut free_list = VecDeque::with_capacity(pool_size);
        for i in 0..pool_size {
            let frame_id = i as FrameId;
            frames.push(Frame::new(
                frame_id,
                Arc::new(RwLock::new(Page::new(INVALID_PAGE_ID))),
            ));
            free_list.push_back(frame_id);
        }

        Self {
            pool_size,
            num_instances,
            instance_index,
            disk_manager,
            core: Mutex::new(PoolCore {
                frames,
                page_table: HashMap::new(),
                free_list,
                replacer: LruReplacer::new(pool_size),
                next_page_id: instance_index,
            }),
        }
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// Allocate a fresh page id and pin a zeroed page for it.
    pub fn new_page(&self) -> Result<(PagePtr, PageId), BufferPoolError> {
        let mut core = self.core.lock();

        let frame_id = self.acquire_frame(&mut core)?;
        let page_id = Self::allocate_page_id(&mut core, self.num_instances, self.instance_index);

        {
            let frame = &mut core.frames[frame_id as usize];
            {
                let mut page = frame.page.write();
                page.reset();
                page.page_id = page_id;
            }
            frame.pin_count = 1;
            frame.is_dirty = false;
        }

        core.page_table.insert(page_id, frame_id);
        core.replacer.pin(frame_id);

        Ok((core.frames[frame_id as usize].page.clone(), page_id))
    }

    /// Pin the page, reading it from disk if it is not resident.
    pub fn fetch_page(&self, page_id: PageId) -> Result<PagePtr, BufferPoolError> {
        if page_id == INVALID_PAGE_ID {
            return Err(BufferPoolError::InvalidPageId(page_id));
        }

        let mut core = self.core.lock();

        if let Some(&frame_id) = core.page_table.get(&page_id) {
            let page = {
                let frame = &mut core.frames[frame_id as usize];
                frame.pin_count += 1;
                frame.page.clone()
            };
            core.replacer.pin(frame_id);
            return Ok(page);
        }

        let frame_id = self.acquire_frame(&mut core)?;

        {
            let frame = &mut core.frames[frame_id as usize];
            {
                let mut page = frame.page.write();
                self.disk_manager.read_page(page_id, &mut page)?;
            }
            frame.pin_count = 1;
            frame.is_dirty = false;
        }

        core.page_table.insert(page_id, frame_id);
        core.replacer.pin(frame_id);

        Ok(core.frames[frame_id as usize].page.clone())
    }

    /// Drop one pin. The dirty hint ORs into the frame's dirty bit; it can
    /// never clear a previously-set bit.
    pub fn unpin_page(&self, page_id: PageId, is_dirty: bool) -> Result<(), BufferPoolError> {
        let mut core = self.core.lock();

        let frame_id = match core.page_table.get(&page_id) {
            Some(&id) => id,
            None => return Err(BufferPoolError::PageNotFound(page_id)),
        };

        let now_unpinned = {
            let frame = &mut core.frames[frame_id as usize];
            if frame.pin_count == 0 {
                return Err(BufferPoolError::PageNotPinned(page_id));
            }
            frame.pin_count -= 1;
            if is_dirty {
                frame.is_dirty = true;
            }
            frame.pin_count == 0
        };

        if now_unpinned {
            core.replacer.unpin(frame_id);
        }

        Ok(())
    }

    /// Write the page's current bytes through to disk, dirty or not, and
    /// clear the dirty bit.
    pub fn flush_page(&self, page_id: PageId) -> Result<(), BufferPoolError> {
        let mut core = self.core.lock();

        let frame_id = match core.page_table.get(&page_id) {
            Some(&id) => id,
            None => return Err(BufferPoolError::PageNotFound(page_id)),
        };

        let frame = &mut core.frames[frame_id as usize];
        self.disk_manager.write_page(&frame.page.read())?;
        frame.is_dirty = false;

        Ok(())
    }

    /// Flush every resident page.
    pub fn flush_all_pages(&self) -> Result<(), BufferPoolError> {
        let mut core = self.core.lock();

        let frame_ids: Vec<FrameId> = core.page_table.values().copied().collect();
        for frame_id in frame_ids {
            let frame = &mut core.frames[frame_id as usize];
            self.disk_manager.write_page(&frame.page.read())?;
            frame.is_dirty = false;
        }

        Ok(())
    }

    /// Drop the page from the pool and hand the id back to the disk
    /// manager. Trivially succeeds if the page is not resident; fails if it
    /// is still pinned.
    pub fn delete_page(&self, page_id: PageId) -> Result<(), BufferPoolError> {
        self.disk_manager.deallocate_page(page_id);

        let mut core = self.core.lock();

        let frame_id = match core.page_table.get(&page_id) {
            Some(&id) => id,
            None => return Ok(()),
        };

        {
            let frame = &mut core.frames[frame_id as usize];
            if frame.pin_count > 0 {
                return Err(BufferPoolError::PagePinned(page_id));
            }
            if frame.is_dirty {
                self.disk_manager.write_page(&frame.page.read())?;
            }
            frame.page.write().reset();
            frame.is_dirty = false;
        }

        core.page_table.remove(&page_id);
        core.replacer.pin(frame_id);
        core.free_list.push_back(frame_id);

        Ok(())
    }

    /// Pick a frame for a new resident page: free list first, then the
    /// replacer. A victim with dirty contents is written back before the
    /// frame is recycled.
    fn acquire_frame(&self, core: &mut PoolCore) -> Result<FrameId, BufferPoolError> {
        if let Some(frame_id) = core.free_list.pop_front() {
            return Ok(frame_id);
        }

        let frame_id = match core.replacer.victim() {
            Some(id) => id,
            None => return Err(BufferPoolError::BufferPoolFull),
        };

        let (is_dirty, page) = {
            let frame = &core.frames[frame_id as usize];
            (frame.is_dirty, frame.page.clone())
        };

        let old_page_id = page.read().page_id;
        if is_dirty {
            debug!("evicting dirty page {}, writing back", old_page_id);
            self.disk_manager.write_page(&page.read())?;
        }

        core.frames[frame_id as usize].is_dirty = false;
        if old_page_id != INVALID_PAGE_ID {
            core.page_table.remove(&old_page_id);
        }

        Ok(frame_id)
    }

    fn allocate_page_id(core: &mut PoolCore, num_instances: u32, instance_index: u32) -> PageId {
        let page_id = core.next_page_id;
        core.next_page_id += num_instances;
        debug_assert_eq!(page_id % num_instances, instance_index);
        page_id
    }
}
