//! Cache statistics.

use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time statistics about query cache usage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Ready entries served without computing.
    pub hits: u64,
    /// Lookups that started a new computation.
    pub misses: u64,
    /// Lookups that attached to an in-flight computation.
    pub coalesced: u64,
    /// Ready entries served after refresh key evaluation failed.
    pub stale_served: u64,
    /// Computations run with the cache bypassed.
    pub bypassed: u64,
    /// Entries removed to stay within capacity.
    pub evictions: u64,
    /// Entries currently held (ready and pending).
    pub entry_count: u64,
}

impl CacheStats {
    /// Calculate the hit rate (0.0 to 1.0). Coalesced attaches count as hits.
    pub fn hit_rate(&self) -> f64 {
        let served = self.hits + self.coalesced;
        let total = served + self.misses;
        if total == 0 {
            0.0
        } else {
            served as f64 / total as f64
        }
    }
}

/// Lock-free counters behind [`CacheStats`].
#[derive(Debug, Default)]
pub(crate) struct CacheCounters {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub coalesced: AtomicU64,
    pub stale_served: AtomicU64,
    pub bypassed: AtomicU64,
    pub evictions: AtomicU64,
}

impl CacheCounters {
    pub fn snapshot(&self, entry_count: u64) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
            stale_served: self.stale_served.load(Ordering::Relaxed),
            bypassed: self.bypassed.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            entry_count,
        }
    }

    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}
