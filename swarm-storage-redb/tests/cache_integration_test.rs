//! Tier-chain behavior against an in-memory store.

use std::sync::Arc;

use tempfile::TempDir;

use swarm_core::storage::{PatternCacheSink, SubstrateStore};
use swarm_storage_redb::{CacheConfig, TieredPatternCache};
use test_utils::{InMemoryStore, pattern_with_confidence};

fn cache_with_store(config: CacheConfig) -> (TieredPatternCache, Arc<InMemoryStore>, TempDir) {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(InMemoryStore::new());
    let cache = TieredPatternCache::open(
        config,
        &dir.path().join("l3.redb"),
        Arc::clone(&store) as Arc<dyn SubstrateStore>,
    )
    .unwrap();
    (cache, store, dir)
}

#[tokio::test]
async fn test_store_miss_enters_l1() {
    let (cache, store, _dir) = cache_with_store(CacheConfig::default());
    let pattern = pattern_with_confidence("build test deploy", 0.9, 3, 0);
    store.store_pattern(&pattern).await.unwrap();

    // First read falls through to the store
    let loaded = cache.get(pattern.id).await.unwrap().unwrap();
    assert_eq!(loaded.id, pattern.id);
    let stats = cache.stats();
    assert_eq!(stats.store_fetches, 1);
    assert_eq!(stats.l1.misses, 1);

    // Second read hits L1 without another store fetch
    cache.get(pattern.id).await.unwrap().unwrap();
    let stats = cache.stats();
    assert_eq!(stats.store_fetches, 1);
    assert_eq!(stats.l1.hits, 1);
}

#[tokio::test]
async fn test_eviction_demotes_and_promotion_returns() {
    // Tiny tiers force the demotion chain quickly
    let (cache, store, _dir) = cache_with_store(CacheConfig {
        l1_max: 2,
        l2_max: 2,
        l3_max: 100,
        promote_threshold: 2,
    });

    let target = pattern_with_confidence("keep me around", 0.9, 3, 0);
    store.store_pattern(&target).await.unwrap();
    cache.get(target.id).await.unwrap().unwrap();

    // Unique reads push the target out of L1 into L2
    for i in 0..4 {
        let filler = pattern_with_confidence(&format!("filler number {i}"), 0.8, 2, 0);
        store.store_pattern(&filler).await.unwrap();
        cache.get(filler.id).await.unwrap().unwrap();
    }
    assert!(cache.stats().l1.evictions >= 1);

    // The next read finds it below L1 and, with two accesses recorded,
    // promotes it back up
    let loaded = cache.get(target.id).await.unwrap().unwrap();
    assert_eq!(loaded.id, target.id);

    // No extra store fetch was needed beyond the five initial loads
    assert_eq!(cache.stats().store_fetches, 5);
}

#[tokio::test]
async fn test_put_writes_through_to_store() {
    let (cache, store, _dir) = cache_with_store(CacheConfig::default());
    let pattern = pattern_with_confidence("write through", 0.85, 4, 1);

    cache.put(&pattern).await.unwrap();

    // Authoritative copy landed in the store
    let stored = store.get_pattern(pattern.id).await.unwrap().unwrap();
    assert_eq!(stored.id, pattern.id);

    // And the hot tier serves it without a store fetch
    cache.get(pattern.id).await.unwrap().unwrap();
    assert_eq!(cache.stats().store_fetches, 0);
}

#[tokio::test]
async fn test_invalidation_clears_every_tier() {
    let (cache, store, _dir) = cache_with_store(CacheConfig::default());
    let mut pattern = pattern_with_confidence("mutate me", 0.6, 2, 1);
    cache.put(&pattern).await.unwrap();
    cache.get(pattern.id).await.unwrap().unwrap();

    // Simulate a mutation: store updated, tiers invalidated
    pattern.confidence = 0.95;
    pattern.version += 1;
    store.store_pattern(&pattern).await.unwrap();
    cache.invalidate(pattern.id);

    // Next read must come from the store and see the new confidence
    let loaded = cache.get(pattern.id).await.unwrap().unwrap();
    assert!((loaded.confidence - 0.95).abs() < 1e-9);
    assert_eq!(cache.stats().store_fetches, 1);
}

#[tokio::test]
async fn test_missing_key_reads_none_everywhere() {
    let (cache, _store, _dir) = cache_with_store(CacheConfig::default());
    let ghost = pattern_with_confidence("never stored", 0.5, 1, 0);

    assert!(cache.get(ghost.id).await.unwrap().is_none());
    let stats = cache.stats();
    assert_eq!(stats.l1.misses, 1);
    assert_eq!(stats.l2.misses, 1);
    assert_eq!(stats.l3.misses, 1);
    assert_eq!(stats.store_fetches, 1);
}

#[tokio::test]
async fn test_insert_hot_places_approved_pattern() {
    let (cache, store, _dir) = cache_with_store(CacheConfig::default());
    let pattern = pattern_with_confidence("approved by consensus", 0.9, 5, 0);

    // The aggregator persists first, then notifies the sink
    store.store_pattern(&pattern).await.unwrap();
    cache.insert_hot(&pattern);

    cache.get(pattern.id).await.unwrap().unwrap();
    assert_eq!(cache.stats().store_fetches, 0);
    assert_eq!(cache.stats().l1.hits, 1);
}
