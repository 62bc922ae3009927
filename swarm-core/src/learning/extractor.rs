//! # Pattern Extractor
//!
//! Mines frequent action-sequence prefixes from an observation window:
//!
//! 1. Observations are grouped per task and ordered into an op sequence.
//! 2. Every prefix up to the configured length is counted across tasks.
//! 3. Prefixes clearing minimum support are scored:
//!    `quality = 0.5*success_rate + 0.3*improvement + 0.2*consistency`.
//! 4. Candidates at or above the quality gate become patterns.
//!
//! Extraction is deterministic: an unchanged window reproduces the same
//! pattern ids and confidences. Trivial candidates (no state change)
//! and tasks without a terminal outcome are discarded.

use std::collections::{BTreeMap, HashMap};

use tracing::{debug, instrument};

use crate::config::ExtractorConfig;
use crate::pattern::{Pattern, PatternKind};
use crate::types::{Observation, OutcomeKind, Scalar, TaskId};

/// Minimum prefix length worth extracting; single ops carry no
/// sequencing signal
const MIN_PREFIX_LEN: usize = 2;

/// Division guard for cost reliability
const COST_EPSILON: f64 = 1e-6;

/// One task's ordered observations
struct TaskTrace<'a> {
    ops: Vec<&'a str>,
    observations: Vec<&'a Observation>,
    terminal: OutcomeKind,
    total_duration_ms: f64,
}

/// Frequent-sequence pattern miner
#[derive(Debug, Clone)]
pub struct PatternExtractor {
    config: ExtractorConfig,
}

impl Default for PatternExtractor {
    fn default() -> Self {
        Self::new(ExtractorConfig::default())
    }
}

impl PatternExtractor {
    #[must_use]
    pub fn new(config: ExtractorConfig) -> Self {
        Self { config }
    }

    /// Extract candidate patterns from an observation window.
    ///
    /// `batch_limit` caps the number of emitted candidates after
    /// tie-breaking (longer > shorter, higher usage > lower, newer >
    /// older).
    #[instrument(skip_all, fields(window = window.len()))]
    pub fn extract(&self, window: &[Observation], batch_limit: usize) -> Vec<Pattern> {
        let traces = group_tasks(window);
        if traces.is_empty() {
            return Vec::new();
        }

        let window_avg_duration = traces
            .iter()
            .map(|t| t.total_duration_ms)
            .sum::<f64>()
            / traces.len() as f64;

        // Count prefix support across tasks
        let mut support: HashMap<Vec<&str>, Vec<&TaskTrace<'_>>> = HashMap::new();
        for trace in &traces {
            let max_len = trace.ops.len().min(self.config.max_prefix_len);
            for len in MIN_PREFIX_LEN..=max_len {
                support.entry(trace.ops[..len].to_vec()).or_default().push(trace);
            }
        }

        let min_count = (self.config.min_support * traces.len() as f64).ceil().max(1.0) as usize;
        let mut candidates = Vec::new();

        for (prefix, supporters) in support {
            if supporters.len() < min_count {
                continue;
            }
            if let Some(candidate) = self.score_candidate(&prefix, &supporters, window_avg_duration)
            {
                candidates.push(candidate);
            }
        }

        // Tie-breaks: longer sequence, then usage, then recency
        candidates.sort_by(|a: &Pattern, b: &Pattern| {
            b.actions
                .len()
                .cmp(&a.actions.len())
                .then_with(|| b.usage_count.cmp(&a.usage_count))
                .then_with(|| b.last_used.cmp(&a.last_used))
        });
        candidates.truncate(batch_limit.max(1));

        debug!(candidates = candidates.len(), "extraction complete");
        candidates
    }

    fn score_candidate(
        &self,
        prefix: &[&str],
        supporters: &[&TaskTrace<'_>],
        window_avg_duration: f64,
    ) -> Option<Pattern> {
        // Trivial candidates: every supporting observation left the
        // world unchanged
        let prefix_observations: Vec<&Observation> = supporters
            .iter()
            .flat_map(|t| t.observations.iter().take(prefix.len()).copied())
            .collect();
        if prefix_observations.iter().all(|o| o.is_trivial()) {
            return None;
        }

        let success = supporters
            .iter()
            .filter(|t| t.terminal == OutcomeKind::Success)
            .count() as u64;
        let partial = supporters
            .iter()
            .filter(|t| t.terminal == OutcomeKind::Partial)
            .count() as u64;
        let failure = supporters.len() as u64 - success - partial;
        let success_rate = success as f64 / supporters.len() as f64;

        let durations: Vec<f64> = supporters.iter().map(|t| t.total_duration_ms).collect();
        let avg_duration = durations.iter().sum::<f64>() / durations.len() as f64;
        let duration_variance = durations
            .iter()
            .map(|d| (d - avg_duration) * (d - avg_duration))
            .sum::<f64>()
            / durations.len() as f64;

        let improvement = if window_avg_duration > 0.0 {
            ((window_avg_duration - avg_duration) / window_avg_duration).clamp(0.0, 1.0)
        } else {
            0.0
        };
        let consistency = if avg_duration > 0.0 {
            (1.0 - duration_variance.sqrt() / avg_duration).clamp(0.0, 1.0)
        } else {
            1.0
        };

        let quality = 0.5 * success_rate + 0.3 * improvement + 0.2 * consistency;
        if quality < self.config.min_quality {
            return None;
        }

        // Conditions: pre-state assignments shared by every supporting task
        let conditions = common_pre_state(supporters);

        let actions: Vec<String> = prefix.iter().map(|op| (*op).to_string()).collect();
        let name = actions.join(" ");
        let mut pattern = Pattern::new(PatternKind::Coordination, name, conditions, actions);

        pattern.metrics.success = success;
        pattern.metrics.failure = failure;
        pattern.metrics.partial = partial;
        pattern.metrics.avg_duration_ms = avg_duration;
        pattern.metrics.duration_variance = duration_variance;
        pattern.metrics.avg_improvement = improvement;
        pattern.metrics.quality_mean = supporters
            .iter()
            .map(|t| t.terminal.quality())
            .sum::<f64>()
            / supporters.len() as f64;
        pattern.usage_count = pattern.metrics.usage();

        let cost_reliability =
            (1.0 - duration_variance.sqrt() / avg_duration.max(COST_EPSILON)).max(0.0);
        pattern.confidence = (0.7 * success_rate + 0.3 * cost_reliability).clamp(0.0, 1.0);

        Some(pattern)
    }
}

/// Group a window into per-task ordered traces, dropping tasks without
/// a terminal outcome signal.
fn group_tasks(window: &[Observation]) -> Vec<TaskTrace<'_>> {
    let mut by_task: BTreeMap<&TaskId, Vec<&Observation>> = BTreeMap::new();
    for observation in window {
        by_task.entry(&observation.task_id).or_default().push(observation);
    }

    by_task
        .into_values()
        .filter_map(|mut observations| {
            observations.sort_by_key(|o| o.timestamp);
            let terminal = observations.last().map(|o| o.outcome)?;
            Some(TaskTrace {
                ops: observations.iter().map(|o| o.op.as_str()).collect(),
                total_duration_ms: observations.iter().map(|o| o.duration_ms as f64).sum(),
                observations,
                terminal,
            })
        })
        .collect()
}

/// Pre-state assignments common to the first observation of every
/// supporting task.
fn common_pre_state(supporters: &[&TaskTrace<'_>]) -> BTreeMap<String, Scalar> {
    let mut iter = supporters.iter().filter_map(|t| t.observations.first());
    let Some(first) = iter.next() else {
        return BTreeMap::new();
    };

    let mut common: BTreeMap<String, Scalar> = first
        .pre_state
        .iter()
        .map(|(var, value)| (var.clone(), value.clone()))
        .collect();

    for observation in iter {
        common.retain(|var, value| observation.pre_state.get(var) == Some(value));
    }
    common
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::WorldState;
    use chrono::{Duration, Utc};

    fn observation(task: &str, op: &str, seq: i64, duration: u64, outcome: OutcomeKind) -> Observation {
        Observation {
            task_id: task.to_string(),
            agent_id: "agent".to_string(),
            op: op.to_string(),
            context_hash: "ctx".to_string(),
            pre_state: WorldState::from_vars([("env".to_string(), Scalar::from("ci"))]),
            post_state: WorldState::from_vars([
                ("env".to_string(), Scalar::from("ci")),
                (format!("{op}_done"), Scalar::Bool(true)),
            ]),
            duration_ms: duration,
            outcome,
            timestamp: Utc::now() + Duration::milliseconds(seq),
        }
    }

    /// Three tasks running the same successful sequence
    fn successful_window() -> Vec<Observation> {
        let mut window = Vec::new();
        for (task, duration) in [("t1", 100_u64), ("t2", 110), ("t3", 90)] {
            for (i, op) in ["build", "test", "deploy"].iter().enumerate() {
                window.push(observation(
                    task,
                    op,
                    i as i64,
                    duration / 3,
                    OutcomeKind::Success,
                ));
            }
        }
        window
    }

    #[test]
    fn test_extracts_frequent_successful_sequence() {
        let extractor = PatternExtractor::default();
        let patterns = extractor.extract(&successful_window(), 10);

        assert!(!patterns.is_empty());
        let best = &patterns[0];
        assert_eq!(best.kind, PatternKind::Coordination);
        assert_eq!(
            best.actions,
            vec!["build".to_string(), "test".to_string(), "deploy".to_string()]
        );
        assert_eq!(best.usage_count, 3);
        assert_eq!(best.metrics.success, 3);
        // All-success, low duration spread: confidence close to 1
        assert!(best.confidence > 0.9);
        // Shared pre-state survives as the condition set
        assert_eq!(best.conditions.get("env"), Some(&Scalar::from("ci")));
    }

    #[test]
    fn test_extraction_is_deterministic() {
        let extractor = PatternExtractor::default();
        let window = successful_window();

        let first = extractor.extract(&window, 10);
        let second = extractor.extract(&window, 10);

        assert_eq!(first.len(), second.len());
        for (a, b) in first.iter().zip(second.iter()) {
            assert_eq!(a.id, b.id);
            assert!((a.confidence - b.confidence).abs() < 1e-9);
        }
    }

    #[test]
    fn test_longer_sequences_win_ties() {
        let extractor = PatternExtractor::default();
        let patterns = extractor.extract(&successful_window(), 10);

        // The full three-op prefix sorts ahead of its two-op prefix
        assert_eq!(patterns[0].actions.len(), 3);
    }

    #[test]
    fn test_failed_tasks_lower_quality_below_gate() {
        let extractor = PatternExtractor::default();
        let mut window = Vec::new();
        for task in ["t1", "t2", "t3"] {
            for (i, op) in ["probe", "retry"].iter().enumerate() {
                window.push(observation(task, op, i as i64, 50, OutcomeKind::Failure));
            }
        }

        // success_rate 0 puts quality at 0.5 or below, under the gate
        assert!(extractor.extract(&window, 10).is_empty());
    }

    #[test]
    fn test_trivial_candidates_discarded() {
        let extractor = PatternExtractor::default();
        let mut window = Vec::new();
        for task in ["t1", "t2"] {
            for (i, op) in ["noop_a", "noop_b"].iter().enumerate() {
                let mut obs = observation(task, op, i as i64, 30, OutcomeKind::Success);
                obs.post_state = obs.pre_state.clone();
                window.push(obs);
            }
        }

        assert!(extractor.extract(&window, 10).is_empty());
    }

    #[test]
    fn test_empty_window_yields_nothing() {
        let extractor = PatternExtractor::default();
        assert!(extractor.extract(&[], 10).is_empty());
    }

    #[test]
    fn test_batch_limit_caps_candidates() {
        let extractor = PatternExtractor::default();
        let patterns = extractor.extract(&successful_window(), 1);
        assert_eq!(patterns.len(), 1);
    }
}
