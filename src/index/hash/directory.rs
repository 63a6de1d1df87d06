use byteorder::{ByteOrder, LittleEndian};

use crate::common::types::{Lsn, Page, PageId, INVALID_PAGE_ID};

/// Upper bound on the directory's global depth.
pub const MAX_GLOBAL_DEPTH: u32 = 9;

/// Number of directory slots; only the first `1 << global_depth` are live.
pub const DIRECTORY_ARRAY_SIZE: usize = 1 << MAX_GLOBAL_DEPTH;

// Byte layout, little-endian, in field order:
//   page_id: u32, lsn: u64, global_depth: u32,
//   bucket_page_ids: [u32; 512], local_depths: [u8; 512]
const PAGE_ID_OFFSET: usize = 0;
const LSN_OFFSET: usize = 4;
const GLOBAL_DEPTH_OFFSET: usize = 12;
const BUCKET_PAGE_IDS_OFFSET: usize = 16;
const LOCAL_DEPTHS_OFFSET: usize = BUCKET_PAGE_IDS_OFFSET + 4 * DIRECTORY_ARRAY_SIZE;

/// Directory of an extendible hash table, materialized from its page.
///
/// Slot `i` points at the bucket page holding every key whose low
/// `global_depth` hash bits equal `i`; `local_depths[i]` records how many of
/// those bits the bucket actually discriminates on.
pub struct HashTableDirectory {
    page_id: PageId,
    lsn: Lsn,
    global_depth: u32,
    bucket_page_ids: [PageId; DIRECTORY_ARRAY_SIZE],
    local_depths: [u8; DIRECTORY_ARRAY_SIZE],
}

impl HashTableDirectory {
    pub fn new(page_id: PageId) -> Self {
        Self {
            page_id,
            lsn: 0,
            global_depth: 0,
            bucket_page_ids: [INVALID_PAGE_ID; DIRECTORY_ARRAY_SIZE],
            local_depths: [0; DIRECTORY_ARRAY_SIZE],
        }
    }

    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    pub fn global_depth(&self) -> u32 {
        self.global_depth
    }

    /// Low-bit mask selecting a live directory slot for a hash value.
    pub fn global_depth_mask(&self) -> u32 {
        (1 << self.global_depth) - 1
    }

    /// Number of live directory slots.
    pub fn size(&self) -> usize {
        1 << self.global_depth
    }

    /// Double the directory: the second half becomes a copy of the first,
    /// so every existing bucket is reachable through both of its new slots.
    pub fn incr_global_depth(&mut self) {
        assert!(
            self.global_depth < MAX_GLOBAL_DEPTH,
            "directory is already at maximum depth {}",
            MAX_GLOBAL_DEPTH
        );
        let size = self.size();
        for i in 0..size {
            self.bucket_page_ids[size + i] = self.bucket_page_ids[i];
            self.local_depths[size + i] = self.local_depths[i];
        }
        self.global_depth += 1;
    }

    pub fn decr_global_depth(&mut self) {
        assert!(self.global_depth > 0);
        self.global_depth -= 1;
    }

    /// The directory can halve when no live bucket uses all global bits.
    pub fn can_shrink(&self) -> bool {
        (0..self.size()).all(|i| u32::from(self.local_depths[i]) < self.global_depth)
    }

    pub fn bucket_page_id(&self, bucket_idx: usize) -> PageId {
        self.bucket_page_ids[bucket_idx]
    }

    pub fn set_bucket_page_id(&mut self, bucket_idx: usize, bucket_page_id: PageId) {
        self.bucket_page_ids[bucket_idx] = bucket_page_id;
    }

    pub fn local_depth(&self, bucket_idx: usize) -> u32 {
        u32::from(self.local_depths[bucket_idx])
    }

    pub fn set_local_depth(&mut self, bucket_idx: usize, local_depth: u32) {
        assert!(local_depth <= self.global_depth);
        self.local_depths[bucket_idx] = local_depth as u8;
    }

    pub fn incr_local_depth(&mut self, bucket_idx: usize) {
        assert!(u32::from(self.local_depths[bucket_idx]) < self.global_depth);
        self.local_depths[bucket_idx] += 1;
    }

    pub fn decr_local_depth(&mut self, bucket_idx: usize) {
        assert!(self.local_depths[bucket_idx] > 0);
        self.local_depths[bucket_idx] -= 1;
    }

    /// Sibling slot of `bucket_idx`: flip the bucket's highest
    /// discriminating bit.
    pub fn split_image_index(&self, bucket_idx: usize) -> usize {
        bucket_idx ^ (1 << (self.local_depth(bucket_idx) - 1))
    }

    /// `split_image_index` for callers that may hold a depth-zero bucket,
    /// which has no sibling.
    pub fn split_image_index_checked(&self, bucket_idx: usize) -> Option<usize> {
        if self.local_depths[bucket_idx] == 0 {
            return None;
        }
        Some(self.split_image_index(bucket_idx))
    }

    /// Panics unless the directory invariants hold:
    /// every local depth is at most the global depth, every bucket page is
    /// referenced by exactly `2^(global_depth - local_depth)` slots, and all
    /// slots sharing a bucket page share its local depth.
    pub fn verify_integrity(&self) {
        use std::collections::HashMap;

        let mut page_id_to_count: HashMap<PageId, u32> = HashMap::new();
        let mut page_id_to_ld: HashMap<PageId, u32> = HashMap::new();

        for idx in 0..self.size() {
            let page_id = self.bucket_page_ids[idx];
            let ld = self.local_depth(idx);
            assert!(
                ld <= self.global_depth,
                "local depth {} exceeds global depth {} at slot {}",
                ld,
                self.global_depth,
                idx
            );

            *page_id_to_count.entry(page_id).or_insert(0) += 1;

            match page_id_to_ld.get(&page_id) {
                Some(&seen) => assert!(
                    seen == ld,
                    "bucket page {} has local depths {} and {}",
                    page_id,
                    seen,
                    ld
                ),
                None => {
                    page_id_to_ld.insert(page_id, ld);
                }
            }
        }

        for (page_id, count) in page_id_to_count {
            let ld = page_id_to_ld[&page_id];
            let required = 1u32 << (self.global_depth - ld);
            assert!(
                count == required,
                "bucket page {} has {} slots, expected {}",
                page_id,
                count,
                required
            );
        }
    }

    /// Serialize into a page, field by field.
    pub fn to_page(&self, page: &mut Page) {
        page.data.fill(0);
        LittleEndian::write_u32(&mut page.data[PAGE_ID_OFFSET..LSN_OFFSET], self.page_id);
        LittleEndian::write_u64(&mut page.data[LSN_OFFSET..GLOBAL_DEPTH_OFFSET], self.lsn);
        LittleEndian::write_u32(
            &mut page.data[GLOBAL_DEPTH_OFFSET..BUCKET_PAGE_IDS_OFFSET],
            self.global_depth,
        );
        for (i, &bucket_page_id) in self.bucket_page_ids.iter().enumerate() {
            let at = BUCKET_PAGE_IDS_OFFSET + 4 * i;
            LittleEndian::write_u32(&mut page.data[at..at + 4], bucket_page_id);
        }
        page.data[LOCAL_DEPTHS_OFFSET..LOCAL_DEPTHS_OFFSET + DIRECTORY_ARRAY_SIZE]
            .copy_from_slice(&self.local_depths);
    }

    /// Deserialize from a page, the inverse of `to_page`.
    pub fn from_page(page: &Page) -> Self {
        let page_id = LittleEndian::read_u32(&page.data[PAGE_ID_OFFSET..LSN_OFFSET]);
        let lsn = LittleEndian::read_u64(&page.data[LSN_OFFSET..GLOBAL_DEPTH_OFFSET]);
        let global_depth =
            LittleEndian::read_u32(&page.data[GLOBAL_DEPTH_OFFSET..BUCKET_PAGE_IDS_OFFSET]);

        let mut bucket_page_ids = [INVALID_PAGE_ID; DIRECTORY_ARRAY_SIZE];
        for (i, bucket_page_id) in bucket_page_ids.iter_mut().enumerate() {
            let at = BUCKET_PAGE_IDS_OFFSET + 4 * i;
            *bucket_page_id = LittleEndian::read_u32(&page.data[at..at + 4]);
        }

        let mut local_depths = [0u8; DIRECTORY_ARRAY_SIZE];
        local_depths.copy_from_slice(
            &page.data[LOCAL_DEPTHS_OFFSET..LOCAL_DEPTHS_OFFSET + DIRECTORY_ARRAY_SIZE],
        );

        Self {
            page_id,
            lsn,
            global_depth,
            bucket_page_ids,
            local_depths,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_directory() {
        let dir = HashTableDirectory::new(7);
        assert_eq!(dir.page_id(), 7);
        assert_eq!(dir.global_depth(), 0);
        assert_eq!(dir.size(), 1);
        assert_eq!(dir.global_depth_mask(), 0);
    }

    #[test]
    fn test_grow_copies_first_half() {
        let mut dir = HashTableDirectory::new(0);
        dir.set_bucket_page_id(0, 42);

        dir.incr_global_depth();
        assert_eq!(dir.global_depth(), 1);
        assert_eq!(dir.size(), 2);
        assert_eq!(dir.bucket_page_id(0), 42);
        assert_eq!(dir.bucket_page_id(1), 42);
        assert_eq!(dir.global_depth_mask(), 0b1);

        dir.incr_global_depth();
        assert_eq!(dir.size(), 4);
        assert_eq!(dir.bucket_page_id(3), 42);
    }

    #[test]
    fn test_split_image_index() {
        let mut dir = HashTableDirectory::new(0);
        dir.incr_global_depth();
        dir.incr_global_depth();
        dir.incr_global_depth();

        // With local depth 3, the sibling flips bit 2.
        dir.set_local_depth(0b101, 3);
        assert_eq!(dir.split_image_index(0b101), 0b001);
        dir.set_local_depth(0b001, 3);
        assert_eq!(dir.split_image_index(0b001), 0b101);
    }

    #[test]
    fn test_can_shrink() {
        let mut dir = HashTableDirectory::new(0);
        dir.set_bucket_page_id(0, 1);
        dir.incr_global_depth();
        dir.set_local_depth(0, 1);
        dir.set_local_depth(1, 1);
        dir.set_bucket_page_id(1, 2);
        assert!(!dir.can_shrink());

        dir.set_local_depth(0, 0);
        dir.set_local_depth(1, 0);
        dir.set_bucket_page_id(1, 1);
        assert!(dir.can_shrink());
        dir.decr_global_depth();
        assert_eq!(dir.global_depth(), 0);
        dir.verify_integrity();
    }

    #[test]
    fn test_page_round_trip() {
        let mut dir = HashTableDirectory::new(3);
        dir.set_bucket_page_id(0, 10);
        dir.incr_global_depth();
        dir.set_local_depth(0, 1);
        dir.set_local_depth(1, 1);
        dir.set_bucket_page_id(1, 11);

        let mut page = Page::new(3);
        dir.to_page(&mut page);
        let restored = HashTableDirectory::from_page(&page);

        assert_eq!(restored.page_id(), 3);
        assert_eq!(restored.global_depth(), 1);
        assert_eq!(restored.bucket_page_id(0), 10);
        assert_eq!(restored.bucket_page_id(1), 11);
        assert_eq!(restored.local_depth(0), 1);
        restored.verify_integrity();

        // Serializing the restored copy reproduces the page bytes.
        let mut page2 = Page::new(3);
        restored.to_page(&mut page2);
        assert_eq!(page.data[..], page2.data[..]);
    }

    #[test]
    #[should_panic]
    fn test_grow_past_max_depth_panics() {
        let mut dir = HashTableDirectory::new(0);
        for _ in 0..=MAX_GLOBAL_DEPTH {
            dir.incr_global_depth();
        }
    }

    #[test]
    #[should_panic]
    fn test_verify_integrity_catches_dangling_slot() {
        let mut dir = HashTableDirectory::new(0);
        dir.set_bucket_page_id(0, 1);
        dir.incr_global_depth();
        // Slot 1 still points at page 1 but claims a deeper split.
        dir.set_local_depth(1, 1);
        dir.verify_integrity();
    }
}
