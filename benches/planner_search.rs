//! A* search throughput: cold searches versus pattern-warmed searches.

use std::collections::BTreeMap;
use std::sync::Arc;

use criterion::{Criterion, criterion_group, criterion_main};
use tokio::runtime::Runtime;

use swarm_core::config::{IndexConfig, PlannerConfig};
use swarm_core::index::{HashEmbedder, VectorIndex};
use swarm_core::pattern::{Pattern, PatternKind};
use swarm_core::planner::GoapPlanner;
use swarm_core::planner::action::Action;
use swarm_core::planner::plan::PlanConstraints;
use swarm_core::storage::SubstrateStore;
use swarm_core::types::{Scalar, WorldState};
use test_utils::InMemoryStore;

/// A staged build world: `depth` phases, each with a productive action
/// and a decoy, so the frontier has real branching to chew on.
fn staged_world(depth: usize) -> (WorldState, WorldState, Vec<Action>) {
    let current = WorldState::from_vars([("phase_0".to_string(), Scalar::Bool(true))]);
    let goal = WorldState::from_vars([(format!("phase_{depth}"), Scalar::Bool(true))]);

    let mut actions = Vec::with_capacity(depth * 2);
    for i in 0..depth {
        actions.push(
            Action::new(format!("advance_{i}"), 10.0)
                .requires(format!("phase_{i}"), Scalar::Bool(true))
                .sets(format!("phase_{}", i + 1), Scalar::Bool(true)),
        );
        actions.push(
            Action::new(format!("detour_{i}"), 2.0)
                .requires(format!("phase_{i}"), Scalar::Bool(true))
                .sets(format!("scratch_{i}"), Scalar::Bool(true)),
        );
    }
    (current, goal, actions)
}

fn planner_for(store: Arc<InMemoryStore>) -> GoapPlanner {
    let index = Arc::new(VectorIndex::new(
        IndexConfig::default(),
        Arc::new(HashEmbedder::default()),
    ));
    GoapPlanner::new(
        PlannerConfig::default(),
        store as Arc<dyn SubstrateStore>,
        index,
    )
}

fn bench_cold_search(c: &mut Criterion) {
    let rt = Runtime::new().expect("runtime");
    let mut group = c.benchmark_group("planner_cold");

    for depth in [4_usize, 8, 12] {
        group.bench_function(format!("depth_{depth}"), |b| {
            b.iter(|| {
                rt.block_on(async {
                    let store = Arc::new(InMemoryStore::new());
                    let planner = planner_for(store);
                    let (current, goal, actions) = staged_world(depth);
                    planner
                        .plan(
                            "bench".to_string(),
                            &current,
                            &goal,
                            &actions,
                            PlanConstraints::default(),
                        )
                        .await
                        .expect("plan")
                })
            });
        });
    }
    group.finish();
}

fn bench_warmed_search(c: &mut Criterion) {
    let rt = Runtime::new().expect("runtime");
    let depth = 8;

    c.bench_function("planner_pattern_warmed_depth_8", |b| {
        b.iter(|| {
            rt.block_on(async {
                let store = Arc::new(InMemoryStore::new());
                let (current, goal, actions) = staged_world(depth);

                // Seed the exact winning sequence as a strong pattern
                let sequence: Vec<String> = (0..depth).map(|i| format!("advance_{i}")).collect();
                let mut pattern = Pattern::new(
                    PatternKind::Goap,
                    sequence.join(" "),
                    BTreeMap::from([("phase_0".to_string(), Scalar::Bool(true))]),
                    sequence,
                );
                pattern.confidence = 0.9;
                pattern.metrics.success = 9;
                pattern.usage_count = 9;
                store.store_pattern(&pattern).await.expect("seed");

                let planner = planner_for(store);
                planner
                    .plan(
                        "bench".to_string(),
                        &current,
                        &goal,
                        &actions,
                        PlanConstraints::default(),
                    )
                    .await
                    .expect("plan")
            })
        });
    });
}

criterion_group!(benches, bench_cold_search, bench_warmed_search);
criterion_main!(benches);
