//! Learned heuristic accuracy tracking.
//!
//! After every search the planner records how far its estimate was from
//! the realized cost for the (state, goal) pair it solved. The entry's
//! running error statistics tune the confidence attached to future
//! estimates for the same pair.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::PlannerConfig;
use crate::pattern::Pattern;
use crate::types::WorldState;

/// Accuracy record for one (state-hash, goal-hash) pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeuristicEntry {
    /// Hash of the start state
    pub state_hash: String,
    /// Hash of the goal state
    pub goal_hash: String,
    /// Estimate produced by the most recent search
    pub estimated: f64,
    /// Realized cost of the most recent search
    pub actual: f64,
    /// Most recent signed error (actual - estimated)
    pub error: f64,
    /// Number of searches recorded for this pair
    pub encounters: u64,
    /// Running mean absolute error
    pub avg_error: f64,
    /// Running variance of the absolute error
    pub variance: f64,
    /// Confidence in estimates for this pair (0.0 to 1.0)
    pub confidence: f64,
    /// First search instant
    pub first_seen: DateTime<Utc>,
    /// Most recent update instant
    pub last_updated: DateTime<Utc>,
}

impl HeuristicEntry {
    /// Create the first record for a pair
    #[must_use]
    pub fn first(state_hash: String, goal_hash: String, estimated: f64, actual: f64) -> Self {
        let now = Utc::now();
        let error = actual - estimated;
        Self {
            state_hash,
            goal_hash,
            estimated,
            actual,
            error,
            encounters: 1,
            avg_error: error.abs(),
            variance: 0.0,
            confidence: 0.5,
            first_seen: now,
            last_updated: now,
        }
    }

    /// Fold a new search result into the running statistics.
    ///
    /// Uses the same running mean/variance recurrence as pattern
    /// confidence: newer samples weigh 1/(n+1).
    pub fn record(&mut self, estimated: f64, actual: f64) {
        self.encounters += 1;
        let alpha = 1.0 / self.encounters as f64;
        let error = actual - estimated;

        self.estimated = estimated;
        self.actual = actual;
        self.error = error;
        self.avg_error = alpha * error.abs() + (1.0 - alpha) * self.avg_error;
        let deviation = error.abs() - self.avg_error;
        self.variance = alpha * deviation * deviation + (1.0 - alpha) * self.variance;

        // Confidence grows as average error shrinks relative to cost scale
        let scale = actual.abs().max(1.0);
        self.confidence = (1.0 - self.avg_error / scale).clamp(0.0, 1.0);
        self.last_updated = Utc::now();
    }
}

/// Base heuristic: weighted sum of per-variable gaps between state and
/// goal. Variables absent from the weight map weigh 1.0; a variable
/// missing from the state contributes a full gap.
#[must_use]
pub fn h_base(state: &WorldState, goal: &WorldState, config: &PlannerConfig) -> f64 {
    goal.iter()
        .map(|(var, want)| {
            let weight = config.heuristic_weights.get(var).copied().unwrap_or(1.0);
            let gap = state.get(var).map_or(1.0, |have| have.gap(want));
            weight * gap
        })
        .sum()
}

/// Pattern boost: confidence-and-similarity-weighted reduction applied
/// to the base heuristic. The boost is capped by the base estimate in
/// [`h_total`], which keeps the combined heuristic admissible.
#[must_use]
pub fn h_pattern(matches: &[(Pattern, f64)], config: &PlannerConfig) -> f64 {
    matches
        .iter()
        .map(|(pattern, similarity)| pattern.confidence * similarity * config.pattern_boost)
        .sum()
}

/// Combined heuristic: `max(0, h_base - h_pattern)`
#[must_use]
pub fn h_total(
    state: &WorldState,
    goal: &WorldState,
    matches: &[(Pattern, f64)],
    config: &PlannerConfig,
) -> f64 {
    (h_base(state, goal, config) - h_pattern(matches, config)).max(0.0)
}
