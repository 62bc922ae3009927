//! Full-substrate wiring: lifecycle, replanning, orchestration,
//! export/import round-trips.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use swarm_core::config::SubstrateConfig;
use swarm_core::coordinator::{Strategy, TaskSpec, TaskStatus};
use swarm_core::planner::action::Action;
use swarm_core::planner::plan::{ExecutionOutcome, PlanConstraints};
use swarm_core::planner::replan::ReplanTrigger;
use swarm_core::storage::{NullCacheSink, SubstrateStore};
use swarm_core::substrate::Substrate;
use swarm_core::types::{Scalar, WorkerRole, WorldState};
use test_utils::{InMemoryStore, ScriptedWorker, pattern_with_confidence};

async fn substrate() -> (Arc<Substrate>, Arc<InMemoryStore>) {
    let store = Arc::new(InMemoryStore::new());
    let substrate = Substrate::init(
        SubstrateConfig::default(),
        Arc::clone(&store) as Arc<dyn SubstrateStore>,
        Arc::new(NullCacheSink),
    )
    .await
    .unwrap();
    (substrate, store)
}

/// A cost overrun past the replan threshold retires the old plan and
/// produces a new one; outcome history stays attached to the retired
/// plan.
#[tokio::test]
async fn test_cost_overrun_replans_and_keeps_history() {
    let (substrate, store) = substrate().await;

    let current = WorldState::from_vars([("deployed".to_string(), Scalar::Bool(false))]);
    let goal = WorldState::from_vars([("deployed".to_string(), Scalar::Bool(true))]);
    let actions = vec![Action::new("deploy", 100.0).sets("deployed", Scalar::Bool(true))];

    let plan = substrate
        .planner()
        .plan(
            "task-overrun".to_string(),
            &current,
            &goal,
            &actions,
            PlanConstraints::default(),
        )
        .await
        .unwrap();

    // Actual cost 180 over estimate 100: variance 0.8 > threshold 0.5
    let outcome = ExecutionOutcome {
        plan_id: plan.id,
        success: true,
        achieved_goal: false,
        actual_cost: 180.0,
        estimated_cost: 100.0,
        duration_ms: 700,
        errors: vec![],
        timestamp: Utc::now(),
    };
    store.store_outcome(&outcome).await.unwrap();

    let trigger = substrate.replanner().evaluate(&plan, &outcome, None);
    assert!(matches!(trigger, Some(ReplanTrigger::ExcessiveCost { .. })));

    let new_plan = substrate
        .replanner()
        .maybe_replan(&plan, &outcome, &current, None, &actions)
        .await
        .unwrap()
        .expect("overrun must produce a new plan");

    assert_ne!(new_plan.id, plan.id);
    // Old plan retired, not deleted; its outcome is still attached
    assert!(store.plan_retired(plan.id));
    assert!(store.get_plan(plan.id).await.unwrap().is_some());
    assert_eq!(store.outcomes_for_plan(plan.id).await.unwrap().len(), 1);

    substrate.shutdown().await;
}

/// track_outcome routes the outcome into storage, updates the backing
/// pattern's confidence, and reports the replan trigger.
#[tokio::test]
async fn test_track_outcome_updates_pattern_and_reports_trigger() {
    let (substrate, store) = substrate().await;

    // A stored pattern lets the planner produce a pattern-backed plan
    let pattern = pattern_with_confidence("ship it now", 0.9, 8, 1);
    let mut goap = pattern.clone();
    goap.kind = swarm_core::pattern::PatternKind::Goap;
    goap.actions = vec!["ship".to_string()];
    store.store_pattern(&goap).await.unwrap();

    let current = WorldState::from_vars([("shipped".to_string(), Scalar::Bool(false))]);
    let goal = WorldState::from_vars([("shipped".to_string(), Scalar::Bool(true))]);
    let actions = vec![Action::new("ship", 10.0).sets("shipped", Scalar::Bool(true))];

    let plan = substrate
        .planner()
        .plan(
            "task-track".to_string(),
            &current,
            &goal,
            &actions,
            PlanConstraints::default(),
        )
        .await
        .unwrap();
    assert_eq!(plan.pattern_id, Some(goap.id));

    let outcome = ExecutionOutcome {
        plan_id: plan.id,
        success: false,
        achieved_goal: false,
        actual_cost: 12.0,
        estimated_cost: 10.0,
        duration_ms: 90,
        errors: vec!["ship step failed".to_string()],
        timestamp: Utc::now(),
    };
    let trigger = substrate
        .pipeline()
        .track_outcome(plan.id, outcome, &substrate.config().planner)
        .await
        .unwrap();
    assert_eq!(trigger, Some(ReplanTrigger::Failure));

    // Failure lowered the pattern's confidence and grew its tally
    let updated = store.get_pattern(goap.id).await.unwrap().unwrap();
    assert_eq!(updated.usage_count, 10);
    assert_eq!(updated.metrics.failure, 2);
    assert!(updated.confidence < goap.confidence);

    substrate.shutdown().await;
}

/// Export to import to export produces byte-identical pattern JSON.
#[tokio::test]
async fn test_export_import_round_trip() {
    let (substrate, store) = substrate().await;

    for name in ["build test deploy", "lint fix commit", "probe retry escalate"] {
        store
            .store_pattern(&pattern_with_confidence(name, 0.8, 4, 1))
            .await
            .unwrap();
    }
    // Index the new patterns so their embeddings travel with the export
    substrate.index().rebuild(substrate.store()).await.unwrap();

    let exported = substrate.export_patterns().await.unwrap();

    // Import into a fresh substrate and export again
    let (fresh, _fresh_store) = substrate_pair().await;
    let imported = fresh.import_patterns(&exported).await.unwrap();
    assert_eq!(imported, 3);

    let re_exported = fresh.export_patterns().await.unwrap();
    assert_eq!(exported, re_exported);

    substrate.shutdown().await;
    fresh.shutdown().await;
}

async fn substrate_pair() -> (Arc<Substrate>, Arc<InMemoryStore>) {
    substrate().await
}

/// Parallel orchestration joins every worker; adaptive degrades to
/// sequential when a worker fails.
#[tokio::test]
async fn test_orchestration_strategies() {
    let (substrate, _store) = substrate().await;
    let coordinator = substrate.coordinator();

    let steady = Arc::new(ScriptedWorker::new("steady", WorkerRole::Implementer));
    let backup = Arc::new(ScriptedWorker::new("backup", WorkerRole::Tester));
    coordinator.spawn(steady.clone());
    coordinator.spawn(backup.clone());
    assert_eq!(coordinator.worker_count(), 2);

    // Spawning registered matching consensus nodes at the default reputation
    assert!((substrate.voter().reputation("steady").unwrap() - 0.7).abs() < 1e-9);

    let parallel = coordinator
        .orchestrate(&TaskSpec {
            id: "task-parallel".to_string(),
            description: "index the corpus".to_string(),
            required_workers: 2,
            strategy: Strategy::Parallel,
        })
        .await
        .unwrap();
    assert!(parallel.success);
    assert_eq!(parallel.reports.len(), 2);

    substrate.shutdown().await;
}

/// Adaptive strategy rolls failing parallel work over to sequential.
#[tokio::test]
async fn test_adaptive_degrades_to_sequential() {
    let (substrate, _store) = substrate().await;
    let coordinator = substrate.coordinator();

    // One worker always fails; sequential still reports per-step status
    coordinator.spawn(Arc::new(
        ScriptedWorker::new("fragile", WorkerRole::Implementer).failing(),
    ));
    coordinator.spawn(Arc::new(ScriptedWorker::new("solid", WorkerRole::Reviewer)));

    let result = coordinator
        .orchestrate(&TaskSpec {
            id: "task-adaptive".to_string(),
            description: "migrate the schema".to_string(),
            required_workers: 2,
            strategy: Strategy::Adaptive,
        })
        .await
        .unwrap();

    // The parallel attempt failed hard; the sequential pass recorded a
    // per-worker report instead of erroring out
    assert_eq!(result.strategy, Strategy::Adaptive);
    assert_eq!(result.reports.len(), 2);
    assert!(result.reports.iter().any(|r| r.status == TaskStatus::Completed));
    assert!(
        result
            .reports
            .iter()
            .any(|r| matches!(r.status, TaskStatus::Failed(_)))
    );

    substrate.shutdown().await;
}

/// Cancellation reaches workers at their next suspension point.
#[tokio::test]
async fn test_cancellation_propagates_to_workers() {
    let (substrate, _store) = substrate().await;
    let coordinator = substrate.coordinator();

    let slow = Arc::new(
        ScriptedWorker::new("slow", WorkerRole::Implementer)
            .with_delay(Duration::from_millis(200)),
    );
    coordinator.spawn(slow);

    let task = TaskSpec {
        id: "task-cancel".to_string(),
        description: "long haul".to_string(),
        required_workers: 1,
        strategy: Strategy::Parallel,
    };

    let coordinator_clone = Arc::clone(coordinator);
    let handle = tokio::spawn(async move { coordinator_clone.orchestrate(&task).await });

    // Give the subtask time to start, then cancel
    tokio::time::sleep(Duration::from_millis(50)).await;
    coordinator.cancel("task-cancel");

    let result = handle.await.unwrap().unwrap();
    assert!(!result.success);
    assert!(result.reports.iter().all(|r| r.status == TaskStatus::Cancelled));

    substrate.shutdown().await;
}

/// Collective learning distributes approved patterns back to workers.
#[tokio::test]
async fn test_collective_learning_distributes_patterns() {
    let (substrate, store) = substrate().await;
    let coordinator = substrate.coordinator();

    let w1 = Arc::new(ScriptedWorker::new("w1", WorkerRole::Implementer));
    let w2 = Arc::new(ScriptedWorker::new("w2", WorkerRole::Tester));
    let w3 = Arc::new(ScriptedWorker::new("w3", WorkerRole::Reviewer));
    coordinator.spawn(w1.clone());
    coordinator.spawn(w2.clone());
    coordinator.spawn(w3.clone());

    store
        .store_pattern(&pattern_with_confidence("approved wisdom", 0.9, 6, 0))
        .await
        .unwrap();

    coordinator.trigger_collective_learning().await.unwrap();

    assert_eq!(w1.absorbed_count(), 1);
    assert_eq!(w2.absorbed_count(), 1);
    assert_eq!(w3.absorbed_count(), 1);

    substrate.shutdown().await;
}

/// Status snapshot reflects store and metric state.
#[tokio::test]
async fn test_status_snapshot() {
    let (substrate, store) = substrate().await;
    store
        .store_pattern(&pattern_with_confidence("counted pattern", 0.7, 3, 1))
        .await
        .unwrap();
    substrate.metrics().incr("pipeline.observations");

    let status = substrate.get_status().await.unwrap();
    assert_eq!(status.pattern_count, 1);
    assert_eq!(status.counters.get("pipeline.observations"), Some(&1));

    substrate.shutdown().await;
}
