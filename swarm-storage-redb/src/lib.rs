//! # Swarm Storage - redb
//!
//! Write-through tiered cache for decoded patterns:
//!
//! - **L1** (<= 500): decoded, hot. Entry by store fetch or by promotion
//!   after two recorded accesses.
//! - **L2** (<= 5 000): decoded, warm. Receives L1 evictions.
//! - **L3** (<= 50 000): zlib-compressed postcard blobs in a redb table.
//!   Receives L2 evictions; survives restarts.
//!
//! Reads check L1 to L2 to L3 to store; a hit below L1 promotes one tier
//! up (L1 entry gated on the access count, taken with a try-lock; a
//! missed promotion is fine). Writes go through the store first, then
//! refresh L1 and drop every stale copy in the same logical step, so
//! the tiers never disagree about a key.
//!
//! Latency targets: L1 under 1 ms, L2 under 5 ms, L3 decompress under
//! 20 ms, store miss under 50 ms p95.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::{debug, instrument};

use swarm_core::error::Result;
use swarm_core::pattern::Pattern;
use swarm_core::storage::{PatternCacheSink, SubstrateStore};
use swarm_core::types::PatternId;

mod compressed;
mod metrics;
mod tier;

pub use metrics::{CacheStats, TierSnapshot};

use compressed::CompressedTier;
use tier::DecodedTier;

/// Tier sizing and promotion policy
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// L1 capacity (decoded, hot)
    pub l1_max: usize,
    /// L2 capacity (decoded, warm)
    pub l2_max: usize,
    /// L3 capacity (compressed, persisted)
    pub l3_max: usize,
    /// Accesses required before a key may enter L1 by promotion
    pub promote_threshold: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            l1_max: 500,
            l2_max: 5_000,
            l3_max: 50_000,
            promote_threshold: 2,
        }
    }
}

/// Write-through three-tier pattern cache over a substrate store
pub struct TieredPatternCache {
    config: CacheConfig,
    l1: DecodedTier,
    l2: DecodedTier,
    l3: CompressedTier,
    store: Arc<dyn SubstrateStore>,
    /// Access counts gating promotion into L1; bounded by periodic trim
    access_counts: Mutex<HashMap<PatternId, u32>>,
    store_fetches: AtomicU64,
}

impl TieredPatternCache {
    /// Open the cache with its L3 tier at `l3_path`.
    ///
    /// # Errors
    ///
    /// Returns storage errors from opening the L3 database.
    pub fn open(
        config: CacheConfig,
        l3_path: &Path,
        store: Arc<dyn SubstrateStore>,
    ) -> Result<Self> {
        let l3 = CompressedTier::open(l3_path, config.l3_max)?;
        Ok(Self {
            l1: DecodedTier::new(config.l1_max),
            l2: DecodedTier::new(config.l2_max),
            l3,
            config,
            store,
            access_counts: Mutex::new(HashMap::new()),
            store_fetches: AtomicU64::new(0),
        })
    }

    /// Read a pattern through the tier chain.
    ///
    /// The in-memory tiers never suspend; only an L3 miss reaches the
    /// store.
    ///
    /// # Errors
    ///
    /// Returns storage errors from the L3 tier or the store.
    #[instrument(skip(self), fields(pattern_id = %id))]
    pub async fn get(&self, id: PatternId) -> Result<Option<Pattern>> {
        let accesses = self.bump_access(id);

        if let Some(pattern) = self.l1.get(id) {
            return Ok(Some(pattern));
        }

        if let Some(pattern) = self.l2.get(id) {
            if accesses >= self.config.promote_threshold {
                self.promote_to_l1(pattern.clone());
            }
            return Ok(Some(pattern));
        }

        if let Some(pattern) = self.l3.get(id)? {
            // Decompressed entries warm the decoded tier
            if accesses >= self.config.promote_threshold {
                self.promote_to_l1(pattern.clone());
            } else if let Some(displaced) = self.l2.insert(pattern.clone()) {
                self.l3.insert(&displaced)?;
            }
            return Ok(Some(pattern));
        }

        // Full fallthrough: authoritative read
        self.store_fetches.fetch_add(1, Ordering::Relaxed);
        let Some(pattern) = self.store.get_pattern(id).await? else {
            return Ok(None);
        };
        debug!(pattern_id = %id, "store fetch, entering L1");
        self.cascade_into_l1(pattern.clone())?;
        Ok(Some(pattern))
    }

    /// Write a pattern through to the store, then refresh the tiers.
    ///
    /// Stale copies in L2/L3 are dropped and L1 takes the fresh row in
    /// the same logical step.
    ///
    /// # Errors
    ///
    /// Returns validation and storage errors from the store write; the
    /// cache is untouched when the store rejects the write.
    pub async fn put(&self, pattern: &Pattern) -> Result<()> {
        self.store.store_pattern(pattern).await?;
        self.refresh_tiers(pattern)?;
        Ok(())
    }

    /// Drop a key from every tier. Called before a mutation returns so
    /// readers never see a stale decoded copy.
    pub fn invalidate_all_tiers(&self, id: PatternId) {
        self.l1.remove(id);
        self.l2.remove(id);
        if let Err(err) = self.l3.remove(id) {
            debug!(pattern_id = %id, "l3 invalidation failed: {err}");
        }
        self.access_counts.lock().remove(&id);
    }

    /// Counter snapshot across tiers
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            l1: self.l1.metrics.snapshot(self.l1.len()),
            l2: self.l2.metrics.snapshot(self.l2.len()),
            l3: self.l3.metrics.snapshot(self.l3.len()),
            store_fetches: self.store_fetches.load(Ordering::Relaxed),
        }
    }

    /// Fraction of the L3 budget in use (memory-pressure signal)
    #[must_use]
    pub fn l3_fill_fraction(&self) -> f64 {
        self.l3.fill_fraction()
    }

    /// Drop every cached entry (tests, operator reset)
    pub fn clear(&self) {
        self.l1.clear();
        self.l2.clear();
        self.access_counts.lock().clear();
    }

    fn bump_access(&self, id: PatternId) -> u32 {
        let mut counts = self.access_counts.lock();
        // Bound the gate map: it only needs recent keys
        if counts.len() > self.config.l3_max {
            counts.clear();
        }
        let count = counts.entry(id).or_insert(0);
        *count = count.saturating_add(1);
        *count
    }

    /// Promotion path: try-lock into L1, cascading displacements down.
    /// A busy L1 lock skips the promotion entirely.
    fn promote_to_l1(&self, pattern: Pattern) {
        let id = pattern.id;
        let Some(displaced) = self.l1.try_insert(pattern) else {
            debug!(pattern_id = %id, "L1 busy, promotion skipped");
            return;
        };
        if let Some(displaced) = displaced {
            if let Some(warm_displaced) = self.l2.insert(displaced) {
                if let Err(err) = self.l3.insert(&warm_displaced) {
                    debug!("l3 demotion failed: {err}");
                }
            }
        }
        self.l2.remove(id);
        debug!(pattern_id = %id, "promoted to L1");
    }

    /// Blocking insert into L1 with full demotion cascade
    fn cascade_into_l1(&self, pattern: Pattern) -> Result<()> {
        if let Some(displaced) = self.l1.insert(pattern) {
            if let Some(warm_displaced) = self.l2.insert(displaced) {
                self.l3.insert(&warm_displaced)?;
            }
        }
        Ok(())
    }

    fn refresh_tiers(&self, pattern: &Pattern) -> Result<()> {
        self.l2.remove(pattern.id);
        if let Err(err) = self.l3.remove(pattern.id) {
            debug!(pattern_id = %pattern.id, "l3 refresh removal failed: {err}");
        }
        self.cascade_into_l1(pattern.clone())
    }
}

impl PatternCacheSink for TieredPatternCache {
    fn insert_hot(&self, pattern: &Pattern) {
        if let Err(err) = self.refresh_tiers(pattern) {
            debug!(pattern_id = %pattern.id, "hot insert degraded: {err}");
        }
    }

    fn invalidate(&self, id: PatternId) {
        self.invalidate_all_tiers(id);
    }

    fn memory_fill_fraction(&self) -> Option<f64> {
        Some(self.l3_fill_fraction())
    }
}
