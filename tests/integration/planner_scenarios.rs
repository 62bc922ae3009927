//! Planner end-to-end: plain A*, pattern-warmed search, failure modes.

use std::collections::BTreeMap;
use std::sync::Arc;

use swarm_core::config::{IndexConfig, PlannerConfig};
use swarm_core::error::{Error, NoPlanReason};
use swarm_core::index::{HashEmbedder, VectorIndex};
use swarm_core::pattern::{Pattern, PatternKind};
use swarm_core::planner::GoapPlanner;
use swarm_core::planner::action::Action;
use swarm_core::planner::plan::{PlanConstraints, PlanMethod};
use swarm_core::storage::SubstrateStore;
use swarm_core::types::{Scalar, WorldState};
use test_utils::InMemoryStore;

fn planner_over(store: Arc<InMemoryStore>, config: PlannerConfig) -> GoapPlanner {
    let index = Arc::new(VectorIndex::new(
        IndexConfig::default(),
        Arc::new(HashEmbedder::default()),
    ));
    GoapPlanner::new(config, store as Arc<dyn SubstrateStore>, index)
}

/// The worked two-action scenario: enable the neural layer, then turn
/// on verification learning.
fn neural_world() -> (WorldState, WorldState, Vec<Action>) {
    let current = WorldState::from_vars([
        ("neural".to_string(), Scalar::from("not_implemented")),
        ("verify".to_string(), Scalar::from("active")),
    ]);
    let goal = WorldState::from_vars([
        ("neural".to_string(), Scalar::from("active")),
        ("verify_learn".to_string(), Scalar::Bool(true)),
    ]);
    let actions = vec![
        Action::new("enable_neural", 40.0).sets("neural", Scalar::from("active")),
        Action::new("enable_verify_learn", 16.0)
            .requires("neural", Scalar::from("active"))
            .requires("verify", Scalar::from("active"))
            .sets("verify_learn", Scalar::Bool(true)),
    ];
    (current, goal, actions)
}

#[tokio::test]
async fn test_plain_astar_finds_cheapest_sequence() {
    let store = Arc::new(InMemoryStore::new());
    let planner = planner_over(Arc::clone(&store), PlannerConfig::default());
    let (current, goal, actions) = neural_world();

    let (plan, stats) = planner
        .plan_with_stats(
            "task-astar".to_string(),
            &current,
            &goal,
            &actions,
            PlanConstraints::default(),
        )
        .await
        .unwrap();

    assert_eq!(plan.actions, vec!["enable_neural", "enable_verify_learn"]);
    assert!((plan.total_cost - 56.0).abs() < 1e-9);
    assert_eq!(plan.method, PlanMethod::AStar);
    assert!(stats.expanded > 0);

    // The plan and a heuristic entry were persisted
    assert!(store.get_plan(plan.id).await.unwrap().is_some());
    let entry = store
        .get_heuristic(&current.state_hash(), &goal.state_hash())
        .await
        .unwrap();
    assert!(entry.is_some());
}

#[tokio::test]
async fn test_stored_pattern_short_circuits_search() {
    let store = Arc::new(InMemoryStore::new());
    let (current, goal, actions) = neural_world();

    // Baseline expansion count without any pattern
    let planner = planner_over(Arc::clone(&store), PlannerConfig::default());
    let (_, baseline) = planner
        .plan_with_stats(
            "task-baseline".to_string(),
            &current,
            &goal,
            &actions,
            PlanConstraints::default(),
        )
        .await
        .unwrap();

    // Store the two-step sequence as a high-confidence pattern
    let mut pattern = Pattern::new(
        PatternKind::Goap,
        "enable_neural enable_verify_learn",
        BTreeMap::from([("verify".to_string(), Scalar::from("active"))]),
        vec!["enable_neural".to_string(), "enable_verify_learn".to_string()],
    );
    pattern.confidence = 0.9;
    pattern.metrics.success = 9;
    pattern.metrics.partial = 1;
    pattern.usage_count = 10;
    store.store_pattern(&pattern).await.unwrap();

    let warmed = planner_over(Arc::clone(&store), PlannerConfig::default());
    let (plan, stats) = warmed
        .plan_with_stats(
            "task-warmed".to_string(),
            &current,
            &goal,
            &actions,
            PlanConstraints::default(),
        )
        .await
        .unwrap();

    // Same sequence and cost, produced by replaying the pattern
    assert_eq!(plan.actions, vec!["enable_neural", "enable_verify_learn"]);
    assert!((plan.total_cost - 56.0).abs() < 1e-9);
    assert_eq!(plan.method, PlanMethod::PatternReuse);
    assert_eq!(plan.pattern_id, Some(pattern.id));
    assert!(
        stats.expanded <= baseline.expanded / 2,
        "warmed search expanded {} vs baseline {}",
        stats.expanded,
        baseline.expanded
    );
}

#[tokio::test]
async fn test_unreachable_goal_returns_no_path() {
    let store = Arc::new(InMemoryStore::new());
    let planner = planner_over(store, PlannerConfig::default());

    let current = WorldState::from_vars([("x".to_string(), Scalar::Int(0))]);
    let goal = WorldState::from_vars([("impossible".to_string(), Scalar::Bool(true))]);
    let actions = vec![Action::new("noop_shuffle", 1.0).sets("x", Scalar::Int(1))];

    let result = planner
        .plan("task-nopath".to_string(), &current, &goal, &actions, PlanConstraints::default())
        .await;
    assert!(matches!(result, Err(Error::NoPlan(NoPlanReason::NoPath))));
}

#[tokio::test]
async fn test_depth_limit_returns_depth_reason() {
    let store = Arc::new(InMemoryStore::new());
    let planner = planner_over(
        store,
        PlannerConfig {
            max_depth: 3,
            ..PlannerConfig::default()
        },
    );

    // Reaching the goal needs five increments; the ceiling is three
    let current = WorldState::from_vars([("count".to_string(), Scalar::Float(0.0))]);
    let goal = WorldState::from_vars([("count".to_string(), Scalar::Float(5.0))]);
    let actions = vec![Action {
        id: "increment".to_string(),
        preconditions: WorldState::new(),
        effects: vec![swarm_core::planner::action::Effect::Add {
            var: "count".to_string(),
            delta: 1.0,
        }],
        cost: 1.0,
        risk: swarm_core::planner::action::RiskLevel::Low,
    }];

    let result = planner
        .plan("task-depth".to_string(), &current, &goal, &actions, PlanConstraints::default())
        .await;
    assert!(matches!(result, Err(Error::NoPlan(NoPlanReason::DepthExceeded))));
}

#[tokio::test]
async fn test_max_cost_constraint_rejects_expensive_plan() {
    let store = Arc::new(InMemoryStore::new());
    let planner = planner_over(store, PlannerConfig::default());
    let (current, goal, actions) = neural_world();

    let result = planner
        .plan(
            "task-budget".to_string(),
            &current,
            &goal,
            &actions,
            PlanConstraints {
                max_cost: Some(50.0),
                deadline_ms: None,
            },
        )
        .await;
    assert!(matches!(result, Err(Error::NoPlan(NoPlanReason::NoPath))));
}

#[tokio::test]
async fn test_heuristic_entry_accumulates_encounters() {
    let store = Arc::new(InMemoryStore::new());
    let planner = planner_over(Arc::clone(&store), PlannerConfig::default());
    let (current, goal, actions) = neural_world();

    for i in 0..3 {
        planner
            .plan(
                format!("task-repeat-{i}"),
                &current,
                &goal,
                &actions,
                PlanConstraints::default(),
            )
            .await
            .unwrap();
    }

    let entry = store
        .get_heuristic(&current.state_hash(), &goal.state_hash())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entry.encounters, 3);
}
