//! Block cache: a bounded cache with heatmap-based admission.
//!
//! Two independent mappings are kept: the cache itself (block index ->
//! owned copy + use counter) and a heatmap (block index -> hit counter)
//! that decides whether a block is worth caching at all. Sequential
//! full-image extraction touches each block exactly once; caching on the
//! first touch would bloat memory for no benefit, so a block is only
//! admitted once it has been asked for twice.

use crate::error::{Error, Result};
use std::collections::HashMap;

struct CacheEntry {
    data: Vec<u8>,
    uses: u32,
}

/// Default capacity used by the top-level descriptor/data streams.
pub const DEFAULT_CAPACITY: usize = 32;

/// A minimum hit count below which `set` silently declines to admit a
/// block.
const ADMISSION_THRESHOLD: u32 = 2;

pub struct BlockCache {
    capacity: usize,
    entries: HashMap<u32, CacheEntry>,
    heatmap: HashMap<u32, u32>,
}

impl BlockCache {
    pub fn new(capacity: usize) -> Self {
        Self { capacity, entries: HashMap::new(), heatmap: HashMap::new() }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, index: u32) -> bool {
        self.entries.contains_key(&index)
    }

    /// Records a hit in the heatmap unconditionally, then returns a copy
    /// of the cached bytes on a cache hit, bumping that entry's `uses`.
    pub fn get(&mut self, index: u32) -> Option<Vec<u8>> {
        *self.heatmap.entry(index).or_insert(0) += 1;
        let entry = self.entries.get_mut(&index)?;
        entry.uses += 1;
        Some(entry.data.clone())
    }

    /// Offers a freshly loaded block to the cache. Refuses (as an error)
    /// if the index is already present; the caller must evict first.
    /// Silently declines to admit (not an error) if the block hasn't
    /// been requested at least twice yet.
    pub fn set(&mut self, index: u32, data: Vec<u8>) -> Result<()> {
        if self.entries.contains_key(&index) {
            return Err(Error::AlreadyExists);
        }
        let hits = self.heatmap.get(&index).copied().unwrap_or(0);
        if hits < ADMISSION_THRESHOLD {
            return Ok(());
        }
        if self.entries.len() >= self.capacity {
            self.evict_least_used();
        }
        self.entries.insert(index, CacheEntry { data, uses: 0 });
        Ok(())
    }

    /// Evicts the entry with the strictly smallest `uses` counter via a
    /// single linear scan; ties keep whichever entry the scan reaches
    /// first (the hashmap's iteration order, which is arbitrary).
    fn evict_least_used(&mut self) {
        let victim = self
            .entries
            .iter()
            .min_by_key(|(_, entry)| entry.uses)
            .map(|(&index, _)| index);
        if let Some(index) = victim {
            self.entries.remove(&index);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_seen_once_is_never_cached() {
        let mut cache = BlockCache::new(4);
        assert!(cache.get(0).is_none());
        cache.set(0, vec![1, 2, 3]).unwrap();
        assert!(!cache.contains(0));
    }

    #[test]
    fn block_seen_twice_is_admitted() {
        let mut cache = BlockCache::new(4);
        assert!(cache.get(0).is_none()); // heatmap -> 1, miss
        assert!(cache.get(0).is_none()); // heatmap -> 2, still a miss (not yet loaded)
        cache.set(0, vec![1, 2, 3]).unwrap();
        assert!(cache.contains(0));
    }

    #[test]
    fn repeated_hits_advance_uses_without_growing_cache() {
        let mut cache = BlockCache::new(4);
        cache.get(2);
        cache.get(2);
        cache.set(2, vec![9]).unwrap();
        assert_eq!(cache.len(), 1);
        cache.get(2);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn set_refuses_duplicate_index() {
        let mut cache = BlockCache::new(4);
        cache.get(0);
        cache.get(0);
        cache.set(0, vec![1]).unwrap();
        assert!(matches!(cache.set(0, vec![2]), Err(Error::AlreadyExists)));
    }

    #[test]
    fn eviction_removes_strictly_smallest_uses_entry() {
        let mut cache = BlockCache::new(2);
        for idx in [0u32, 1] {
            cache.get(idx);
            cache.get(idx);
            cache.set(idx, vec![idx as u8]).unwrap();
        }
        // Bump block 1's uses so it's no longer the minimum.
        cache.get(1);

        cache.get(2);
        cache.get(2);
        cache.set(2, vec![2]).unwrap();

        assert_eq!(cache.len(), 2);
        assert!(!cache.contains(0));
        assert!(cache.contains(1));
        assert!(cache.contains(2));
    }
}
