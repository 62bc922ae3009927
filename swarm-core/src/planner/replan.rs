//! Adaptive replanning on execution outcomes.
//!
//! The replanner watches terminal outcomes and produces a fresh plan
//! from the current state when execution failed, overran its cost
//! estimate, the goal drifted, or a stronger pattern surfaced. The old
//! plan is retired, never deleted, so its outcome history stays
//! attached. A per-task gate keeps at most one replan in flight.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::config::PlannerConfig;
use crate::error::Result;
use crate::pattern::Pattern;
use crate::types::{PatternId, TaskId, WorldState};

use super::GoapPlanner;
use super::action::Action;
use super::plan::{ExecutionOutcome, Plan, PlanConstraints};

/// Confidence a new pattern needs to opportunistically trigger a replan
const BETTER_PATH_CONFIDENCE: f64 = 0.85;

/// Why a replan was requested
#[derive(Debug, Clone, PartialEq)]
pub enum ReplanTrigger {
    /// Execution reported failure
    Failure,
    /// |cost variance| exceeded the configured threshold
    ExcessiveCost { variance: f64 },
    /// The goal changed since the plan was created
    NewRequirements,
    /// A high-confidence pattern now matches the current context
    BetterPath { pattern_id: PatternId },
}

/// Decide whether `outcome` warrants a replan of `plan` under `config`.
///
/// `observed_goal` carries the goal currently demanded of the task,
/// which may have drifted since plan creation.
#[must_use]
pub fn evaluate_trigger(
    config: &PlannerConfig,
    plan: &Plan,
    outcome: &ExecutionOutcome,
    observed_goal: Option<&WorldState>,
) -> Option<ReplanTrigger> {
    if !config.enable_replanning {
        return None;
    }
    if !outcome.success {
        return Some(ReplanTrigger::Failure);
    }
    let variance = outcome.cost_variance();
    if variance.abs() > config.replan_threshold {
        return Some(ReplanTrigger::ExcessiveCost { variance });
    }
    if let Some(goal) = observed_goal {
        if *goal != plan.goal_state {
            return Some(ReplanTrigger::NewRequirements);
        }
    }
    None
}

/// Per-task mutual exclusion for in-flight replans
#[derive(Default)]
pub(crate) struct TaskGate {
    inner: Mutex<HashSet<TaskId>>,
}

impl TaskGate {
    /// Claim the gate for a task; false when already held
    pub fn acquire(&self, task_id: &TaskId) -> bool {
        self.inner.lock().insert(task_id.clone())
    }

    pub fn release(&self, task_id: &TaskId) {
        self.inner.lock().remove(task_id);
    }
}

/// Outcome-driven replanner with a per-task in-flight gate
pub struct Replanner {
    config: PlannerConfig,
    planner: Arc<GoapPlanner>,
    gate: TaskGate,
}

impl Replanner {
    #[must_use]
    pub fn new(config: PlannerConfig, planner: Arc<GoapPlanner>) -> Self {
        Self {
            config,
            planner,
            gate: TaskGate::default(),
        }
    }

    /// Trigger evaluation under this replanner's configuration
    #[must_use]
    pub fn evaluate(
        &self,
        plan: &Plan,
        outcome: &ExecutionOutcome,
        observed_goal: Option<&WorldState>,
    ) -> Option<ReplanTrigger> {
        evaluate_trigger(&self.config, plan, outcome, observed_goal)
    }

    /// Opportunistic trigger: a freshly approved pattern with high
    /// confidence that applies to the current context.
    #[must_use]
    pub fn better_path(&self, pattern: &Pattern, current: &WorldState) -> Option<ReplanTrigger> {
        if self.config.enable_replanning
            && pattern.confidence > BETTER_PATH_CONFIDENCE
            && pattern.applies_to(current)
        {
            Some(ReplanTrigger::BetterPath {
                pattern_id: pattern.id,
            })
        } else {
            None
        }
    }

    /// Handle a terminal outcome: retire the old plan and produce a new
    /// one from `current` when a trigger fires and no replan for the
    /// task is already in flight.
    ///
    /// # Errors
    ///
    /// Returns planner and storage errors; the in-flight gate is
    /// released on every path.
    pub async fn maybe_replan(
        &self,
        plan: &Plan,
        outcome: &ExecutionOutcome,
        current: &WorldState,
        observed_goal: Option<&WorldState>,
        actions: &[Action],
    ) -> Result<Option<Plan>> {
        let Some(trigger) = self.evaluate(plan, outcome, observed_goal) else {
            return Ok(None);
        };

        if !self.gate.acquire(&plan.task_id) {
            debug!(task_id = %plan.task_id, "replan already in flight, skipping");
            return Ok(None);
        }

        let result = self
            .replan_inner(plan, current, observed_goal, actions, &trigger)
            .await;
        self.gate.release(&plan.task_id);
        result
    }

    async fn replan_inner(
        &self,
        plan: &Plan,
        current: &WorldState,
        observed_goal: Option<&WorldState>,
        actions: &[Action],
        trigger: &ReplanTrigger,
    ) -> Result<Option<Plan>> {
        info!(task_id = %plan.task_id, ?trigger, "replanning");

        let goal = observed_goal.unwrap_or(&plan.goal_state);
        let new_plan = self
            .planner
            .plan(
                plan.task_id.clone(),
                current,
                goal,
                actions,
                PlanConstraints::default(),
            )
            .await?;

        // Old plan stays on record with its outcomes; only its active flag drops
        self.planner.store_handle().retire_plan(plan.id).await?;

        Ok(Some(new_plan))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::plan::PlanMethod;
    use crate::types::Scalar;
    use chrono::Utc;
    use uuid::Uuid;

    fn outcome(success: bool, actual: f64, estimated: f64) -> ExecutionOutcome {
        ExecutionOutcome {
            plan_id: Uuid::new_v4(),
            success,
            achieved_goal: success,
            actual_cost: actual,
            estimated_cost: estimated,
            duration_ms: 100,
            errors: vec![],
            timestamp: Utc::now(),
        }
    }

    fn plan() -> Plan {
        Plan::new(
            "task-1".to_string(),
            vec!["a".to_string()],
            100.0,
            WorldState::new(),
            WorldState::new(),
            PlanMethod::AStar,
        )
    }

    #[test]
    fn test_failure_triggers_replan() {
        let config = PlannerConfig::default();
        let trigger = evaluate_trigger(&config, &plan(), &outcome(false, 100.0, 100.0), None);
        assert_eq!(trigger, Some(ReplanTrigger::Failure));
    }

    #[test]
    fn test_cost_overrun_triggers_replan() {
        // Variance 0.8 exceeds the default threshold 0.5
        let config = PlannerConfig::default();
        let trigger = evaluate_trigger(&config, &plan(), &outcome(true, 180.0, 100.0), None);
        assert!(matches!(trigger, Some(ReplanTrigger::ExcessiveCost { .. })));
    }

    #[test]
    fn test_on_budget_success_does_not_trigger() {
        let config = PlannerConfig::default();
        let trigger = evaluate_trigger(&config, &plan(), &outcome(true, 110.0, 100.0), None);
        assert_eq!(trigger, None);
    }

    #[test]
    fn test_goal_drift_triggers_replan() {
        let config = PlannerConfig::default();
        let drifted = WorldState::from_vars([("extra".to_string(), Scalar::Bool(true))]);
        let trigger =
            evaluate_trigger(&config, &plan(), &outcome(true, 100.0, 100.0), Some(&drifted));
        assert_eq!(trigger, Some(ReplanTrigger::NewRequirements));
    }

    #[test]
    fn test_disabled_replanning_never_triggers() {
        let mut config = PlannerConfig::default();
        config.enable_replanning = false;
        let trigger = evaluate_trigger(&config, &plan(), &outcome(false, 500.0, 100.0), None);
        assert_eq!(trigger, None);
    }

    #[test]
    fn test_task_gate_is_exclusive_per_task() {
        let gate = TaskGate::default();
        assert!(gate.acquire(&"t1".to_string()));
        assert!(!gate.acquire(&"t1".to_string()));
        // Other tasks are unaffected
        assert!(gate.acquire(&"t2".to_string()));

        gate.release(&"t1".to_string());
        assert!(gate.acquire(&"t1".to_string()));
    }
}
