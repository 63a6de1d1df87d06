use linked_hash_map::LinkedHashMap;
use parking_lot::Mutex;

use crate::common::types::FrameId;

/// LRU replacement policy over the set of unpinned frames.
///
/// The insertion-ordered map gives the recency list and O(1) membership in
/// one structure: the front entry is the least-recently-unpinned frame and
/// new entries go to the back.
pub struct LruReplacer {
    capacity: usize,
    lru: Mutex<LinkedHashMap<FrameId, ()>>,
}

impl LruReplacer {
    pub fn new(pool_size: usize) -> Self {
        Self {
            capacity: pool_size,
            lru: Mutex::new(LinkedHashMap::with_capacity(pool_size)),
        }
    }

    /// Remove and return the least-recently-unpinned frame, if any.
    pub fn victim(&self) -> Option<FrameId> {
        let mut lru = self.lru.lock();
        lru.pop_front().map(|(frame_id, ())| frame_id)
    }

    /// The frame was pinned and is no longer eligible for eviction.
    /// No-op if the frame is not tracked.
    pub fn pin(&self, frame_id: FrameId) {
        let mut lru = self.lru.lock();
        lru.remove(&frame_id);
    }

    /// The frame's pin count reached zero; it becomes the most-recently-used
    /// eviction candidate. No-op if already tracked. The replacer bounds
    /// itself at pool capacity, dropping its oldest entry if needed.
    pub fn unpin(&self, frame_id: FrameId) {
        let mut lru = self.lru.lock();
        if lru.contains_key(&frame_id) {
            return;
        }
        if lru.len() == self.capacity {
            lru.pop_front();
        }
        lru.insert(frame_id, ());
    }

    /// Number of frames currently eligible for eviction.
    pub fn size(&self) -> usize {
        self.lru.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_victim_order_is_lru() {
        let replacer = LruReplacer::new(7);
        replacer.unpin(1);
        replacer.unpin(2);
        replacer.unpin(3);
        assert_eq!(replacer.size(), 3);

        assert_eq!(replacer.victim(), Some(1));
        assert_eq!(replacer.victim(), Some(2));
        assert_eq!(replacer.victim(), Some(3));
        assert_eq!(replacer.victim(), None);
    }

    #[test]
    fn test_pin_removes_candidate() {
        let replacer = LruReplacer::new(7);
        replacer.unpin(1);
        replacer.unpin(2);
        replacer.pin(1);
        // Pinning an untracked frame is a no-op.
        replacer.pin(9);

        assert_eq!(replacer.size(), 1);
        assert_eq!(replacer.victim(), Some(2));
        assert_eq!(replacer.victim(), None);
    }

    #[test]
    fn test_unpin_twice_keeps_position() {
        let replacer = LruReplacer::new(7);
        replacer.unpin(1);
        replacer.unpin(2);
        replacer.unpin(1);

        // Frame 1 is still the oldest candidate.
        assert_eq!(replacer.victim(), Some(1));
        assert_eq!(replacer.victim(), Some(2));
    }

    #[test]
    fn test_capacity_bound() {
        let replacer = LruReplacer::new(2);
        replacer.unpin(1);
        replacer.unpin(2);
        replacer.unpin(3);

        assert_eq!(replacer.size(), 2);
        assert_eq!(replacer.victim(), Some(2));
        assert_eq!(replacer.victim(), Some(3));
    }
}
