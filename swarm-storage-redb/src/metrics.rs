//! Explicit per-tier cache counters.
//!
//! Every hit, miss, eviction, and insertion is counted at the tier it
//! happened in. The source system probed a private map field to infer
//! statistics; these counters are the authoritative replacement.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for one tier
#[derive(Debug, Default)]
pub struct TierMetrics {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    insertions: AtomicU64,
}

impl TierMetrics {
    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_insertion(&self) {
        self.insertions.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time snapshot
    #[must_use]
    pub fn snapshot(&self, len: usize) -> TierSnapshot {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        TierSnapshot {
            hits,
            misses,
            evictions: self.evictions.load(Ordering::Relaxed),
            insertions: self.insertions.load(Ordering::Relaxed),
            len,
            hit_rate: if hits + misses > 0 {
                hits as f64 / (hits + misses) as f64
            } else {
                0.0
            },
        }
    }
}

/// Counter values for one tier at snapshot time
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TierSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub insertions: u64,
    pub len: usize,
    pub hit_rate: f64,
}

/// Snapshot across all tiers plus the store fallthrough count
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CacheStats {
    pub l1: TierSnapshot,
    pub l2: TierSnapshot,
    pub l3: TierSnapshot,
    /// Reads that fell through every tier to the store
    pub store_fetches: u64,
}
