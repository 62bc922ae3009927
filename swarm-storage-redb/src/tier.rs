//! Decoded in-memory tiers (L1 hot, L2 warm).
//!
//! Each tier is an LRU map under a parking_lot mutex: reads and writes
//! are non-suspending and never held across an await. Evictions hand
//! the displaced pattern back to the caller so it can cascade into the
//! next tier down.

use std::num::NonZeroUsize;

use lru::LruCache;
use parking_lot::Mutex;

use swarm_core::pattern::Pattern;
use swarm_core::types::PatternId;

use crate::metrics::TierMetrics;

/// One decoded LRU tier
pub(crate) struct DecodedTier {
    entries: Mutex<LruCache<PatternId, Pattern>>,
    pub(crate) metrics: TierMetrics,
}

impl DecodedTier {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            metrics: TierMetrics::default(),
        }
    }

    /// Look up and touch an entry, counting hit or miss
    pub fn get(&self, id: PatternId) -> Option<Pattern> {
        let found = self.entries.lock().get(&id).cloned();
        if found.is_some() {
            self.metrics.record_hit();
        } else {
            self.metrics.record_miss();
        }
        found
    }

    /// Insert, returning the entry evicted to make room (if any)
    pub fn insert(&self, pattern: Pattern) -> Option<Pattern> {
        let mut entries = self.entries.lock();
        let evicted = if entries.len() == usize::from(entries.cap())
            && !entries.contains(&pattern.id)
        {
            entries.pop_lru().map(|(_, evicted)| evicted)
        } else {
            None
        };
        entries.put(pattern.id, pattern);
        drop(entries);

        self.metrics.record_insertion();
        if evicted.is_some() {
            self.metrics.record_eviction();
        }
        evicted
    }

    /// Insert only when the tier lock is immediately available.
    ///
    /// Promotions use this path: a missed promotion just means the next
    /// read is a tier slower. Returns `None` when the lock was busy,
    /// `Some(evicted)` when the insert happened.
    pub fn try_insert(&self, pattern: Pattern) -> Option<Option<Pattern>> {
        let mut entries = self.entries.try_lock()?;
        let evicted = if entries.len() == usize::from(entries.cap())
            && !entries.contains(&pattern.id)
        {
            entries.pop_lru().map(|(_, evicted)| evicted)
        } else {
            None
        };
        entries.put(pattern.id, pattern);
        drop(entries);

        self.metrics.record_insertion();
        if evicted.is_some() {
            self.metrics.record_eviction();
        }
        Some(evicted)
    }

    /// Remove an entry without counting a miss
    pub fn remove(&self, id: PatternId) {
        self.entries.lock().pop(&id);
    }

    /// Presence check without touching LRU order
    pub fn contains(&self, id: PatternId) -> bool {
        self.entries.lock().contains(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Drop every entry
    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use swarm_core::pattern::PatternKind;

    fn pattern(name: &str) -> Pattern {
        Pattern::new(
            PatternKind::Coordination,
            name,
            BTreeMap::new(),
            vec![name.to_string()],
        )
    }

    #[test]
    fn test_lru_eviction_returns_displaced_entry() {
        let tier = DecodedTier::new(2);
        let a = pattern("a");
        let b = pattern("b");
        let c = pattern("c");

        assert!(tier.insert(a.clone()).is_none());
        assert!(tier.insert(b.clone()).is_none());

        // Touch `a` so `b` is the LRU victim
        assert!(tier.get(a.id).is_some());
        let evicted = tier.insert(c.clone()).unwrap();
        assert_eq!(evicted.id, b.id);

        assert!(tier.contains(a.id));
        assert!(tier.contains(c.id));
        assert!(!tier.contains(b.id));
    }

    #[test]
    fn test_reinsert_does_not_evict() {
        let tier = DecodedTier::new(2);
        let a = pattern("a");
        let b = pattern("b");

        tier.insert(a.clone());
        tier.insert(b.clone());
        // Same key again: replacement, not eviction
        assert!(tier.insert(a.clone()).is_none());
        assert_eq!(tier.len(), 2);
    }

    #[test]
    fn test_metrics_count_hits_and_misses() {
        let tier = DecodedTier::new(4);
        let a = pattern("a");
        tier.insert(a.clone());

        tier.get(a.id);
        tier.get(pattern("missing").id);

        let snapshot = tier.metrics.snapshot(tier.len());
        assert_eq!(snapshot.hits, 1);
        assert_eq!(snapshot.misses, 1);
    }
}
