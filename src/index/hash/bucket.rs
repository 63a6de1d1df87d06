use std::mem;

use byteorder::{ByteOrder, LittleEndian};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::common::types::{Page, Rid, PAGE_SIZE};
use crate::index::hash::error::HashIndexError;

/// Bytes a serialized Rid occupies in a slot (two u32s).
const RID_SIZE: usize = 8;

/// Number of key/rid pairs a bucket page can hold. Each slot costs its key
/// bytes plus a rid plus one occupied bit and one readable bit.
pub fn bucket_array_size<K>() -> usize {
    let slot = mem::size_of::<K>() + RID_SIZE;
    (4 * PAGE_SIZE) / (4 * slot + 1)
}

/// One bucket of the extendible hash table, materialized from its page.
///
/// Two bitmaps track slot state: `occupied[i]` is set once slot `i` has
/// ever held an entry and is cleared only by `clear`; `readable[i]` is set
/// while slot `i` holds a live entry. A slot with `occupied` set and
/// `readable` clear is a tombstone. Scans stop at the first slot that has
/// never been occupied.
pub struct HashTableBucket<K> {
    capacity: usize,
    key_slot: usize,
    occupied: Vec<u8>,
    readable: Vec<u8>,
    slots: Vec<Option<(K, Rid)>>,
}

impl<K> HashTableBucket<K>
where
    K: Serialize + DeserializeOwned + Clone + Eq,
{
    pub fn new() -> Self {
        let capacity = bucket_array_size::<K>();
        let key_slot = mem::size_of::<K>();
        let bitmap_bytes = (capacity + 7) / 8;
        debug_assert!(2 * bitmap_bytes + capacity * (key_slot + RID_SIZE) <= PAGE_SIZE);

        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);

        Self {
            capacity,
            key_slot,
            occupied: vec![0; bitmap_bytes],
            readable: vec![0; bitmap_bytes],
            slots,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_occupied(&self, idx: usize) -> bool {
        self.occupied[idx / 8] & (1 << (idx % 8)) != 0
    }

    pub fn is_readable(&self, idx: usize) -> bool {
        self.readable[idx / 8] & (1 << (idx % 8)) != 0
    }

    fn set_occupied(&mut self, idx: usize) {
        self.occupied[idx / 8] |= 1 << (idx % 8);
    }

    fn set_readable(&mut self, idx: usize) {
        self.readable[idx / 8] |= 1 << (idx % 8);
    }

    /// Collect the rids of every live entry matching `key`.
    pub fn get_value(&self, key: &K) -> Vec<Rid> {
        let mut result = Vec::new();
        for idx in 0..self.capacity {
            if !self.is_occupied(idx) {
                break;
            }
            if !self.is_readable(idx) {
                continue;
            }
            if let Some((stored, rid)) = &self.slots[idx] {
                if stored == key {
                    result.push(*rid);
                }
            }
        }
        result
    }

    /// Insert into the first reusable slot. Returns false if the exact
    /// `(key, rid)` pair already exists or no slot is free.
    pub fn insert(&mut self, key: K, rid: Rid) -> bool {
        let mut free_idx = None;
        for idx in 0..self.capacity {
            // Reuse a tombstone or stop at the end of the occupied prefix,
            // whichever comes first.
            if free_idx.is_none() && (!self.is_readable(idx) || !self.is_occupied(idx)) {
                free_idx = Some(idx);
            }
            if !self.is_occupied(idx) {
                break;
            }
            if self.is_readable(idx) {
                if let Some((stored, stored_rid)) = &self.slots[idx] {
                    if *stored == key && *stored_rid == rid {
                        return false;
                    }
                }
            }
        }

        match free_idx {
            Some(idx) => {
                self.slots[idx] = Some((key, rid));
                self.set_occupied(idx);
                self.set_readable(idx);
                true
            }
            None => false,
        }
    }

    /// Remove the first live entry matching `(key, rid)`, leaving a
    /// tombstone. Returns false if no such entry exists.
    pub fn remove(&mut self, key: &K, rid: Rid) -> bool {
        for idx in 0..self.capacity {
            if !self.is_occupied(idx) {
                break;
            }
            if !self.is_readable(idx) {
                continue;
            }
            if let Some((stored, stored_rid)) = &self.slots[idx] {
                if stored == key && *stored_rid == rid {
                    self.remove_at(idx);
                    return true;
                }
            }
        }
        false
    }

    /// Tombstone the slot: the readable bit clears, the occupied bit stays.
    pub fn remove_at(&mut self, idx: usize) {
        self.readable[idx / 8] &= !(1 << (idx % 8));
        self.slots[idx] = None;
    }

    pub fn num_readable(&self) -> usize {
        let mut count = 0;
        for idx in 0..self.capacity {
            if !self.is_occupied(idx) {
                break;
            }
            if self.is_readable(idx) {
                count += 1;
            }
        }
        count
    }

    pub fn is_full(&self) -> bool {
        self.num_readable() == self.capacity
    }

    pub fn is_empty(&self) -> bool {
        self.num_readable() == 0
    }

    /// Snapshot the live entries, in slot order. Used when splitting.
    pub fn array_copy(&self) -> Vec<(K, Rid)> {
        let mut copy = Vec::with_capacity(self.num_readable());
        for idx in 0..self.capacity {
            if !self.is_occupied(idx) {
                break;
            }
            if self.is_readable(idx) {
                if let Some(entry) = &self.slots[idx] {
                    copy.push(entry.clone());
                }
            }
        }
        copy
    }

    /// Drop every entry and every tombstone.
    pub fn clear(&mut self) {
        self.occupied.fill(0);
        self.readable.fill(0);
        for slot in &mut self.slots {
            *slot = None;
        }
    }

    /// Serialize into a page: occupied bitmap, readable bitmap, then the
    /// flat slot array (key bytes then rid per slot). Tombstoned slot bytes
    /// are zeroed; only the bitmaps carry their state.
    pub fn to_page(&self, page: &mut Page) -> Result<(), HashIndexError> {
        page.data.fill(0);
        let bitmap_bytes = self.occupied.len();

        page.data[..bitmap_bytes].copy_from_slice(&self.occupied);
        page.data[bitmap_bytes..2 * bitmap_bytes].copy_from_slice(&self.readable);

        let slot_size = self.key_slot + RID_SIZE;
        let base = 2 * bitmap_bytes;
        for idx in 0..self.capacity {
            if !self.is_readable(idx) {
                continue;
            }
            let (key, rid) = self.slots[idx]
                .as_ref()
                .expect("readable slot holds an entry");

            let encoded = bincode::serialize(key)
                .map_err(|e| HashIndexError::SerializationError(e.to_string()))?;
            if encoded.len() > self.key_slot {
                return Err(HashIndexError::KeyTooLarge);
            }

            let at = base + idx * slot_size;
            page.data[at..at + encoded.len()].copy_from_slice(&encoded);
            LittleEndian::write_u32(
                &mut page.data[at + self.key_slot..at + self.key_slot + 4],
                rid.page_id,
            );
            LittleEndian::write_u32(
                &mut page.data[at + self.key_slot + 4..at + slot_size],
                rid.slot_num,
            );
        }

        Ok(())
    }

    /// Deserialize from a page, the inverse of `to_page`.
    pub fn from_page(page: &Page) -> Result<Self, HashIndexError> {
        let mut bucket = Self::new();
        let bitmap_bytes = bucket.occupied.len();

        bucket
            .occupied
            .copy_from_slice(&page.data[..bitmap_bytes]);
        bucket
            .readable
            .copy_from_slice(&page.data[bitmap_bytes..2 * bitmap_bytes]);

        let slot_size = bucket.key_slot + RID_SIZE;
        let base = 2 * bitmap_bytes;
        for idx in 0..bucket.capacity {
            if !bucket.is_readable(idx) {
                continue;
            }
            let at = base + idx * slot_size;
            let key: K = bincode::deserialize(&page.data[at..at + bucket.key_slot])
                .map_err(|e| HashIndexError::DeserializationError(e.to_string()))?;
            let page_id =
                LittleEndian::read_u32(&page.data[at + bucket.key_slot..at + bucket.key_slot + 4]);
            let slot_num =
                LittleEndian::read_u32(&page.data[at + bucket.key_slot + 4..at + slot_size]);
            bucket.slots[idx] = Some((key, Rid::new(page_id, slot_num)));
        }

        Ok(bucket)
    }
}

impl<K> Default for HashTableBucket<K>
where
    K: Serialize + DeserializeOwned + Clone + Eq,
{
    fn default() -> Self {
        Self::new()
    }
}
