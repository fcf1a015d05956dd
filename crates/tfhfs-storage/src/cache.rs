//! Resident-block cache.
//!
//! Sized in bytes, not entry count: an entry costs `id.len() +
//! data.len() + ENTRY_OVERHEAD`. Eviction runs until resident size is
//! at or below 3/4 of the configured ceiling, skipping dirty entries
//! and entries a storage reference still holds live.

use std::num::NonZeroUsize;

use lru::LruCache;
use tfhfs_block::{BlockId, BlockStatus};

/// Accounting overhead per cache entry beyond the raw id/data bytes,
/// covering the entry's status tag and bookkeeping.
const ENTRY_OVERHEAD: usize = 48;

pub struct CacheEntry {
    pub data: Vec<u8>,
    pub status: BlockStatus,
    pub dirty: bool,
}

fn entry_cost(id: &[u8], data: &[u8]) -> usize {
    id.len() + data.len() + ENTRY_OVERHEAD
}

pub struct Cache {
    entries: LruCache<BlockId, CacheEntry>,
    resident_size: usize,
    ceiling: usize,
}

impl Cache {
    pub fn new(ceiling: usize) -> Self {
        Self {
            entries: LruCache::new(NonZeroUsize::new(usize::MAX).unwrap()),
            resident_size: 0,
            ceiling,
        }
    }

    pub fn get(&mut self, id: &[u8]) -> Option<&CacheEntry> {
        self.entries.get(id)
    }

    pub fn contains(&mut self, id: &[u8]) -> bool {
        self.entries.contains(id)
    }

    pub fn put(&mut self, id: BlockId, data: Vec<u8>, status: BlockStatus, dirty: bool) {
        let new_cost = entry_cost(&id, &data);
        let old_cost = self
            .entries
            .peek(&id)
            .map(|old| entry_cost(&id, &old.data));
        if let Some(old_cost) = old_cost {
            self.resident_size -= old_cost;
        }
        self.entries.put(id, CacheEntry { data, status, dirty });
        self.resident_size += new_cost;
    }

    pub fn mark_dirty(&mut self, id: &[u8], dirty: bool) {
        if let Some(entry) = self.entries.get_mut(id) {
            entry.dirty = dirty;
        }
    }

    pub fn remove(&mut self, id: &[u8]) {
        if let Some(entry) = self.entries.pop(id) {
            self.resident_size -= entry_cost(id, &entry.data);
        }
    }

    /// Evict least-recently-used entries until resident size is at or
    /// below 3/4 of the ceiling. `is_pinned` reports whether a block is
    /// still storage-referenced and must not be evicted even though it
    /// is idle in the LRU order.
    pub fn shrink(&mut self, is_pinned: impl Fn(&[u8]) -> bool) {
        let target = (self.ceiling * 3) / 4;
        if self.resident_size <= target {
            return;
        }

        let mut skipped = Vec::new();
        let mut rounds = self.entries.len();

        while self.resident_size > target && rounds > 0 {
            rounds -= 1;
            let Some((id, entry)) = self.entries.pop_lru() else {
                break;
            };
            if entry.dirty || is_pinned(&id) {
                skipped.push((id, entry));
                continue;
            }
            self.resident_size -= entry_cost(&id, &entry.data);
        }

        // Entries we skipped go back in, oldest-first, so a later
        // shrink pass still sees them as the least-recently-used.
        for (id, entry) in skipped.into_iter().rev() {
            self.entries.put(id, entry);
        }
    }

    pub fn resident_size(&self) -> usize {
        self.resident_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shrink_respects_ceiling() {
        let mut cache = Cache::new(200);
        for i in 0..10u8 {
            cache.put(vec![i], vec![0u8; 10], BlockStatus::Normal, false);
        }
        cache.shrink(|_| false);
        assert!(cache.resident_size() <= 150);
    }

    #[test]
    fn shrink_never_evicts_dirty_or_pinned() {
        let mut cache = Cache::new(10);
        cache.put(vec![1], vec![0u8; 4], BlockStatus::Normal, true);
        cache.put(vec![2], vec![0u8; 4], BlockStatus::Normal, false);
        cache.shrink(|id| id == [2]);
        assert!(cache.contains(&[1]));
        assert!(cache.contains(&[2]));
    }
}
