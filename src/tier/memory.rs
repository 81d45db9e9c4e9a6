//! In-process memory tier (L1).
//!
//! A bounded map of cache entries under a byte budget. One coarse mutex
//! guards the entry map together with the running byte counter, since
//! eviction decisions depend on an accurate aggregate. The lock is only
//! ever held for in-memory mutation; callers must not perform I/O while
//! it is held (the tier API makes that impossible by never returning a
//! guard).
//!
//! Eviction is LRU: when an insert would exceed the budget, entries are
//! removed in strictly ascending `last_accessed` order until the new
//! entry fits. An entry larger than the whole budget is rejected with
//! [`TierError::EntryTooLarge`] so the coordinator can skip L1 and still
//! write the lower tiers.

use crate::config::MemoryTierConfig;
use crate::entry::CacheEntry;
use crate::error::TierError;
use crate::key::CacheKey;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Running counters for the memory tier.
#[derive(Debug, Clone, Copy, Default)]
pub struct MemoryTierCounters {
    pub hits: u64,
    pub misses: u64,
    pub insertions: u64,
    pub evictions: u64,
}

struct MemoryTierState {
    entries: HashMap<CacheKey, CacheEntry>,
    used_bytes: usize,
    counters: MemoryTierCounters,
}

/// The L1 cache tier.
pub struct MemoryTier {
    state: Mutex<MemoryTierState>,
    max_size_bytes: usize,
}

impl MemoryTier {
    pub fn new(config: MemoryTierConfig) -> Self {
        Self {
            state: Mutex::new(MemoryTierState {
                entries: HashMap::new(),
                used_bytes: 0,
                counters: MemoryTierCounters::default(),
            }),
            max_size_bytes: config.max_size_bytes,
        }
    }

    /// Looks up an entry, refreshing its recency and access count.
    ///
    /// A poisoned lock is logged and treated as a miss; the cascade
    /// continues on the lower tiers.
    pub fn get(&self, key: &CacheKey) -> Option<Bytes> {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(_) => {
                warn!(tier = "memory", "Lock poisoned, treating lookup as a miss");
                return None;
            }
        };
        match state.entries.get_mut(key) {
            Some(entry) => {
                entry.touch();
                let content = entry.content.clone();
                state.counters.hits += 1;
                Some(content)
            }
            None => {
                state.counters.misses += 1;
                None
            }
        }
    }

    /// Presence probe that does not touch recency or counters.
    pub fn peek(&self, key: &CacheKey) -> bool {
        match self.state.lock() {
            Ok(state) => state.entries.contains_key(key),
            Err(_) => false,
        }
    }

    /// Inserts an entry, evicting in ascending `last_accessed` order
    /// until it fits under the byte budget.
    ///
    /// Replacing an existing key first releases the old entry's bytes.
    pub fn put(&self, key: CacheKey, entry: CacheEntry) -> Result<(), TierError> {
        let size = entry.size_bytes;
        if size > self.max_size_bytes {
            return Err(TierError::EntryTooLarge {
                size,
                budget: self.max_size_bytes,
            });
        }

        let mut state = self.state.lock().map_err(|_| TierError::Lock)?;
        if let Some(old) = state.entries.remove(&key) {
            state.used_bytes -= old.size_bytes;
        }
        if state.used_bytes + size > self.max_size_bytes {
            let target = self.max_size_bytes - size;
            let evicted = Self::evict_lru(&mut state, target);
            debug!(
                tier = "memory",
                evicted = evicted,
                used_bytes = state.used_bytes,
                "Evicted entries to fit new insert"
            );
        }
        state.entries.insert(key, entry);
        state.used_bytes += size;
        state.counters.insertions += 1;
        Ok(())
    }

    /// Removes a single entry. Returns whether it was present.
    pub fn remove(&self, key: &CacheKey) -> bool {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(_) => return false,
        };
        match state.entries.remove(key) {
            Some(entry) => {
                state.used_bytes -= entry.size_bytes;
                true
            }
            None => false,
        }
    }

    /// Removes every entry whose `last_accessed` predates `max_age`.
    /// Returns the number of entries purged.
    pub fn purge_older_than(&self, max_age: Duration) -> usize {
        let Some(cutoff) = Instant::now().checked_sub(max_age) else {
            return 0;
        };
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(_) => {
                warn!(tier = "memory", "Lock poisoned, skipping purge");
                return 0;
            }
        };
        let stale: Vec<CacheKey> = state
            .entries
            .iter()
            .filter(|(_, entry)| entry.last_accessed < cutoff)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &stale {
            if let Some(entry) = state.entries.remove(key) {
                state.used_bytes -= entry.size_bytes;
                state.counters.evictions += 1;
            }
        }
        stale.len()
    }

    /// Drops every entry.
    pub fn clear(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.entries.clear();
            state.used_bytes = 0;
        }
    }

    pub fn used_bytes(&self) -> usize {
        self.state.lock().map(|s| s.used_bytes).unwrap_or(0)
    }

    pub fn entry_count(&self) -> usize {
        self.state.lock().map(|s| s.entries.len()).unwrap_or(0)
    }

    pub fn counters(&self) -> MemoryTierCounters {
        self.state
            .lock()
            .map(|s| s.counters)
            .unwrap_or_default()
    }

    fn evict_lru(state: &mut MemoryTierState, target_bytes: usize) -> usize {
        let mut by_age: Vec<(CacheKey, Instant)> = state
            .entries
            .iter()
            .map(|(key, entry)| (key.clone(), entry.last_accessed))
            .collect();
        by_age.sort_by_key(|(_, accessed)| *accessed);

        let mut evicted = 0;
        for (key, _) in by_age {
            if state.used_bytes <= target_bytes {
                break;
            }
            if let Some(entry) = state.entries.remove(&key) {
                state.used_bytes -= entry.size_bytes;
                state.counters.evictions += 1;
                evicted += 1;
                trace!(tier = "memory", key = %key, size = entry.size_bytes, "Evicted LRU entry");
            }
        }
        evicted
    }
}
