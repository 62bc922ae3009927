use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{ActionId, PatternId, PlanId, TaskId, WorldState};

/// Division-by-zero guard for cost-variance
const COST_EPSILON: f64 = 1e-6;

/// How a plan was produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PlanMethod {
    /// Plain A* search
    AStar,
    /// A pattern supplied the full action sequence
    PatternReuse,
    /// A* with pattern-boosted heuristic
    Hybrid,
}

impl std::fmt::Display for PlanMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlanMethod::AStar => write!(f, "a-star"),
            PlanMethod::PatternReuse => write!(f, "pattern-reuse"),
            PlanMethod::Hybrid => write!(f, "hybrid"),
        }
    }
}

/// Caller-imposed planning constraints
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanConstraints {
    /// Reject plans costing more than this
    pub max_cost: Option<f64>,
    /// Deadline hint forwarded to executors (milliseconds)
    pub deadline_ms: Option<u64>,
}

/// An ordered action sequence from a recorded initial state to a goal.
///
/// Immutable after creation; replanning produces a new plan and retires
/// the old one without deleting it, so outcome history stays attached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    /// Unique plan identifier
    pub id: PlanId,
    /// Task this plan serves
    pub task_id: TaskId,
    /// Ordered action identifiers
    pub actions: Vec<ActionId>,
    /// Summed weighted action cost
    pub total_cost: f64,
    /// Duration estimate from heuristic history (milliseconds)
    pub estimated_duration_ms: u64,
    /// Planner confidence in the sequence (0.0 to 1.0)
    pub confidence: f64,
    /// Initial state at plan time
    pub current_state: WorldState,
    /// Goal state
    pub goal_state: WorldState,
    /// Caller constraints
    pub constraints: PlanConstraints,
    /// Production method
    pub method: PlanMethod,
    /// Pattern that shaped the plan, if any
    pub pattern_id: Option<PatternId>,
    /// Creation instant
    pub created_at: DateTime<Utc>,
}

impl Plan {
    /// Create a plan with a fresh id
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        task_id: TaskId,
        actions: Vec<ActionId>,
        total_cost: f64,
        current_state: WorldState,
        goal_state: WorldState,
        method: PlanMethod,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_id,
            actions,
            total_cost,
            estimated_duration_ms: 0,
            confidence: 0.5,
            current_state,
            goal_state,
            constraints: PlanConstraints::default(),
            method,
            pattern_id: None,
            created_at: Utc::now(),
        }
    }
}

/// Terminal result of executing a plan.
///
/// At most one terminal outcome may exist per plan; the store rejects
/// duplicates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    /// Plan this outcome terminates
    pub plan_id: PlanId,
    /// Whether execution completed without failure
    pub success: bool,
    /// Whether the goal state was actually reached
    pub achieved_goal: bool,
    /// Realized cost
    pub actual_cost: f64,
    /// Cost estimated at plan time
    pub estimated_cost: f64,
    /// Wall-clock duration
    pub duration_ms: u64,
    /// Error summaries, when any step failed
    pub errors: Vec<String>,
    /// Completion instant
    pub timestamp: DateTime<Utc>,
}

impl ExecutionOutcome {
    /// Relative cost overrun: `(actual - estimated) / max(estimated, eps)`
    #[must_use]
    pub fn cost_variance(&self) -> f64 {
        (self.actual_cost - self.estimated_cost) / self.estimated_cost.max(COST_EPSILON)
    }
}
