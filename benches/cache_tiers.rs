//! Tier read latency: hot L1 hits versus compressed L3 hits.

use std::sync::Arc;

use criterion::{Criterion, criterion_group, criterion_main};
use tempfile::TempDir;
use tokio::runtime::Runtime;

use swarm_core::storage::SubstrateStore;
use swarm_storage_redb::{CacheConfig, TieredPatternCache};
use test_utils::{InMemoryStore, pattern_with_confidence};

fn bench_l1_hit(c: &mut Criterion) {
    let rt = Runtime::new().expect("runtime");
    let dir = TempDir::new().expect("tempdir");
    let store = Arc::new(InMemoryStore::new());
    let cache = TieredPatternCache::open(
        CacheConfig::default(),
        &dir.path().join("l3.redb"),
        Arc::clone(&store) as Arc<dyn SubstrateStore>,
    )
    .expect("cache");

    let pattern = pattern_with_confidence("hot path pattern", 0.9, 5, 0);
    rt.block_on(async {
        cache.put(&pattern).await.expect("put");
        cache.get(pattern.id).await.expect("warm");
    });

    c.bench_function("cache_l1_hit", |b| {
        b.iter(|| rt.block_on(async { cache.get(pattern.id).await.expect("get") }));
    });
}

fn bench_l3_decompress(c: &mut Criterion) {
    let rt = Runtime::new().expect("runtime");
    let dir = TempDir::new().expect("tempdir");
    let store = Arc::new(InMemoryStore::new());
    // One-slot decoded tiers force every read down to L3
    let cache = TieredPatternCache::open(
        CacheConfig {
            l1_max: 1,
            l2_max: 1,
            l3_max: 10_000,
            // Unreachable gate keeps the entries from being promoted
            promote_threshold: u32::MAX,
        },
        &dir.path().join("l3.redb"),
        Arc::clone(&store) as Arc<dyn SubstrateStore>,
    )
    .expect("cache");

    let patterns: Vec<_> = (0..64)
        .map(|i| pattern_with_confidence(&format!("compressed pattern {i}"), 0.8, 3, 1))
        .collect();
    rt.block_on(async {
        for pattern in &patterns {
            cache.put(pattern).await.expect("put");
        }
    });

    c.bench_function("cache_l3_decompress", |b| {
        let mut i = 0;
        b.iter(|| {
            // Cycle the keys so the one-slot decoded tiers keep missing
            let pattern = &patterns[i % patterns.len()];
            i += 1;
            rt.block_on(async { cache.get(pattern.id).await.expect("get") })
        });
    });
}

fn bench_write_through(c: &mut Criterion) {
    let rt = Runtime::new().expect("runtime");
    let dir = TempDir::new().expect("tempdir");
    let store = Arc::new(InMemoryStore::new());
    let cache = TieredPatternCache::open(
        CacheConfig::default(),
        &dir.path().join("l3.redb"),
        Arc::clone(&store) as Arc<dyn SubstrateStore>,
    )
    .expect("cache");

    c.bench_function("cache_write_through", |b| {
        let mut i = 0_u64;
        b.iter(|| {
            i += 1;
            let pattern = pattern_with_confidence(&format!("written pattern {i}"), 0.7, 2, 1);
            rt.block_on(async { cache.put(&pattern).await.expect("put") })
        });
    });
}

criterion_group!(benches, bench_l1_hit, bench_l3_decompress, bench_write_through);
criterion_main!(benches);
