//! # Test Utilities
//!
//! Shared fixtures for the substrate workspace:
//! - [`InMemoryStore`]: a full `SubstrateStore` over plain maps,
//!   including the reliability-recompute trigger emulation
//! - Observation and pattern builders
//! - [`ScriptedWorker`]: a worker whose execution and votes are fixed
//!   up front, for coordinator and consensus tests

mod memory_store;
mod workers;

pub use memory_store::InMemoryStore;
pub use workers::{ScriptedWorker, approve_vote, reject_vote};

use chrono::Utc;
use std::collections::BTreeMap;

use swarm_core::pattern::{Pattern, PatternKind};
use swarm_core::types::{Observation, OutcomeKind, Scalar, WorldState, context_hash};

/// Build an observation for one step of a task
#[must_use]
pub fn observation(
    task_id: &str,
    op: &str,
    duration_ms: u64,
    outcome: OutcomeKind,
) -> Observation {
    Observation {
        task_id: task_id.to_string(),
        agent_id: "test-agent".to_string(),
        op: op.to_string(),
        context_hash: context_hash(task_id),
        pre_state: WorldState::from_vars([("env".to_string(), Scalar::from("test"))]),
        post_state: WorldState::from_vars([
            ("env".to_string(), Scalar::from("test")),
            (format!("{op}_done"), Scalar::Bool(true)),
        ]),
        duration_ms,
        outcome,
        timestamp: Utc::now(),
    }
}

/// Observations for a whole task running `ops` in order, sharing one
/// terminal outcome and an even duration split.
#[must_use]
pub fn task_observations(
    task_id: &str,
    ops: &[&str],
    total_duration_ms: u64,
    outcome: OutcomeKind,
) -> Vec<Observation> {
    let step = total_duration_ms / ops.len().max(1) as u64;
    ops.iter()
        .enumerate()
        .map(|(i, op)| {
            let mut obs = observation(task_id, op, step, outcome);
            obs.timestamp = Utc::now() + chrono::Duration::milliseconds(i as i64);
            obs
        })
        .collect()
}

/// A coordination pattern with the given confidence and outcome tallies
#[must_use]
pub fn pattern_with_confidence(name: &str, confidence: f64, success: u64, failure: u64) -> Pattern {
    let actions: Vec<String> = name.split_whitespace().map(str::to_string).collect();
    let mut pattern = Pattern::new(
        PatternKind::Coordination,
        name,
        BTreeMap::new(),
        if actions.is_empty() {
            vec!["noop".to_string()]
        } else {
            actions
        },
    );
    pattern.confidence = confidence;
    pattern.metrics.success = success;
    pattern.metrics.failure = failure;
    pattern.metrics.avg_duration_ms = 100.0;
    pattern.usage_count = pattern.metrics.usage();
    pattern
}
