//! Novelty tracking: decides whether a frame contains something not seen recently.
//!
//! `TrackMemory` is a FIFO-bounded set of track ids. Re-seeing an id does not
//! refresh its position, so an id that was evicted and comes back is new again.
//! Memory stays at `capacity` entries no matter how many identities pass by.

use std::collections::VecDeque;

use crate::detect::Detection;

/// Default number of track ids remembered.
pub const DEFAULT_TRACK_MEMORY: usize = 10;

/// Insertion-ordered set of recently seen track ids.
#[derive(Clone, Debug)]
pub struct TrackMemory {
    ids: VecDeque<i64>,
    capacity: usize,
}

impl TrackMemory {
    pub fn new(capacity: usize) -> Self {
        Self {
            ids: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn contains(&self, id: i64) -> bool {
        self.ids.contains(&id)
    }

    /// Record `id`, evicting the oldest entry when full. Returns the evicted id.
    ///
    /// Callers check `contains` first; inserting a present id is not deduplicated.
    pub fn insert(&mut self, id: i64) -> Option<i64> {
        self.ids.push_back(id);
        if self.ids.len() > self.capacity {
            self.ids.pop_front()
        } else {
            None
        }
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Ids from oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = i64> + '_ {
        self.ids.iter().copied()
    }
}

/// Per-pipeline novelty state.
#[derive(Clone, Debug)]
pub struct NoveltyTracker {
    memory: TrackMemory,
    novel_total: u64,
}

impl NoveltyTracker {
    pub fn new(capacity: usize) -> Self {
        Self {
            memory: TrackMemory::new(capacity),
            novel_total: 0,
        }
    }

    /// Returns true when the frame holds at least one new identity.
    ///
    /// If no detection carries a track id the frame is judged on presence
    /// alone: any detection at all is novel. Otherwise only tracked detections
    /// count, and each id missing from memory is recorded and bumps the total.
    pub fn update(&mut self, detections: &[Detection]) -> bool {
        if detections.iter().all(|d| d.track_id.is_none()) {
            return !detections.is_empty();
        }

        let mut novel = false;
        for id in detections.iter().filter_map(|d| d.track_id) {
            if self.memory.contains(id) {
                continue;
            }
            novel = true;
            self.novel_total += 1;
            log::info!("novelty: new track id {}", id);
            if let Some(evicted) = self.memory.insert(id) {
                log::debug!("novelty: evicted track id {}", evicted);
            }
        }
        novel
    }

    /// Count of distinct new ids seen since start, including re-seen evictions.
    pub fn novel_total(&self) -> u64 {
        self.novel_total
    }

    pub fn memory(&self) -> &TrackMemory {
        &self.memory
    }
}
