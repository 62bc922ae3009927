//! Federated pattern aggregation.
//!
//! Worker contributions are grouped by signature (kind, normalized
//! name). Once a group has enough contributors, or the periodic timer
//! fires, the group is merged, conflicts are resolved, and the merged
//! candidate goes to the voter. Approved patterns are persisted to the
//! store and placed in the cache's hot tier; rejected ones are counted
//! and dropped.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::config::AggregatorConfig;
use crate::error::Result;
use crate::hooks::{Alert, AlertBus};
use crate::pattern::{Pattern, PatternKind};
use crate::storage::{PatternCacheSink, SubstrateStore};
use crate::types::NodeId;

use super::types::{ConsensusOutcome, Proposal};
use super::voter::{ByzantineVoter, VoteSource};

/// Cap on the collective-confidence bonus from contributor count
const CONTRIBUTOR_BONUS_CAP: f64 = 0.2;

/// Success-rate variance above which the vote strategy resolves a group
const SUCCESS_RATE_CONFLICT: f64 = 0.1;

/// One worker's submission of a pattern
#[derive(Debug, Clone)]
pub struct Contribution {
    pub pattern: Pattern,
    pub contributor: NodeId,
    /// Contributor weight used by the weighted-merge strategy
    pub contributor_score: f64,
    pub submitted_at: DateTime<Utc>,
}

impl Contribution {
    #[must_use]
    pub fn new(pattern: Pattern, contributor: impl Into<NodeId>, score: f64) -> Self {
        Self {
            pattern,
            contributor: contributor.into(),
            contributor_score: score.clamp(0.0, 1.0),
            submitted_at: Utc::now(),
        }
    }
}

/// How a conflicted group was resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Resolution {
    /// Confidence disagreement to contributor-score-weighted merge
    WeightedMerge,
    /// Success-rate disagreement to highest success count wins
    Vote,
    /// No conflict to plain merge
    Merge,
}

struct PendingGroup {
    contributions: Vec<Contribution>,
    opened_at: DateTime<Utc>,
}

/// Aggregation counters for status reporting
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AggregatorStats {
    pub approved: u64,
    pub rejected: u64,
    pub timed_out: u64,
}

/// Groups contributions, resolves conflicts, and submits merged
/// candidates to the Byzantine voter.
pub struct PatternAggregator {
    config: AggregatorConfig,
    store: Arc<dyn SubstrateStore>,
    cache: Arc<dyn PatternCacheSink>,
    voter: Arc<ByzantineVoter>,
    sources: Mutex<Vec<Arc<dyn VoteSource>>>,
    pending: Mutex<HashMap<(PatternKind, String), PendingGroup>>,
    approved: AtomicU64,
    rejected: AtomicU64,
    timed_out: AtomicU64,
    alerts: AlertBus,
}

impl PatternAggregator {
    #[must_use]
    pub fn new(
        config: AggregatorConfig,
        store: Arc<dyn SubstrateStore>,
        cache: Arc<dyn PatternCacheSink>,
        voter: Arc<ByzantineVoter>,
        alerts: AlertBus,
    ) -> Self {
        Self {
            config,
            store,
            cache,
            voter,
            sources: Mutex::new(Vec::new()),
            pending: Mutex::new(HashMap::new()),
            approved: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            timed_out: AtomicU64::new(0),
            alerts,
        }
    }

    /// Register a vote source consulted when groups go to consensus
    pub fn register_source(&self, source: Arc<dyn VoteSource>) {
        self.sources.lock().push(source);
    }

    /// Counters snapshot
    #[must_use]
    pub fn stats(&self) -> AggregatorStats {
        AggregatorStats {
            approved: self.approved.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
        }
    }

    /// Accept a contribution. When its group reaches the contributor
    /// minimum the group aggregates immediately; otherwise it waits for
    /// more members or the periodic timer.
    ///
    /// # Errors
    ///
    /// Returns validation errors for malformed patterns and storage or
    /// consensus errors from an immediate aggregation.
    pub async fn submit(&self, contribution: Contribution) -> Result<Option<ConsensusOutcome>> {
        contribution.pattern.validate()?;
        let signature = contribution.pattern.signature();

        let ready = {
            let mut pending = self.pending.lock();
            let group = pending.entry(signature.clone()).or_insert_with(|| PendingGroup {
                contributions: Vec::new(),
                opened_at: Utc::now(),
            });
            group.contributions.push(contribution);
            if group.contributions.len() >= self.config.min_contributors {
                pending.remove(&signature).map(|g| g.contributions)
            } else {
                None
            }
        };

        match ready {
            Some(contributions) => self.aggregate(contributions).await.map(Some),
            None => Ok(None),
        }
    }

    /// Aggregate every group older than the configured interval.
    /// Driven by the pipeline's periodic timer and by collective
    /// learning passes.
    ///
    /// # Errors
    ///
    /// Returns the first storage or consensus error encountered.
    pub async fn tick(&self) -> Result<usize> {
        let cutoff = Utc::now()
            - chrono::Duration::milliseconds(self.config.aggregation_interval_ms as i64);
        let due: Vec<Vec<Contribution>> = {
            let mut pending = self.pending.lock();
            let keys: Vec<_> = pending
                .iter()
                .filter(|(_, group)| group.opened_at <= cutoff)
                .map(|(key, _)| key.clone())
                .collect();
            keys.into_iter()
                .filter_map(|key| pending.remove(&key).map(|g| g.contributions))
                .collect()
        };

        let mut aggregated = 0;
        for contributions in due {
            self.aggregate(contributions).await?;
            aggregated += 1;
        }
        Ok(aggregated)
    }

    /// Merge a group, run consensus, and persist on approval.
    #[instrument(skip_all, fields(contributors = contributions.len()))]
    async fn aggregate(&self, contributions: Vec<Contribution>) -> Result<ConsensusOutcome> {
        let resolution = self.detect_conflict(&contributions);
        let mut merged = self.resolve(&contributions, resolution);
        merged.confidence = collective_confidence(&contributions);
        merged.validate()?;

        debug!(
            pattern = %merged.name,
            ?resolution,
            confidence = merged.confidence,
            "group merged, submitting to voter"
        );

        let proposal = Proposal::pattern_validation(
            merged.clone(),
            self.config.min_quorum,
            self.config.min_consensus,
        );
        let sources = self.sources.lock().clone();
        let outcome = self.voter.submit(&proposal, &sources, None).await?;

        match &outcome {
            ConsensusOutcome::Approved { score, .. } => {
                info!(pattern = %merged.name, score, "pattern approved by consensus");
                self.store.store_pattern(&merged).await?;
                self.cache.insert_hot(&merged);
                self.approved.fetch_add(1, Ordering::Relaxed);
            }
            ConsensusOutcome::Rejected { score, .. } => {
                warn!(pattern = %merged.name, score, "pattern rejected by consensus");
                self.rejected.fetch_add(1, Ordering::Relaxed);
                self.alerts.raise(Alert::PatternRejected {
                    pattern_id: merged.id,
                });
            }
            ConsensusOutcome::Timeout { rounds } => {
                warn!(pattern = %merged.name, rounds, "consensus timed out, nothing stored");
                self.timed_out.fetch_add(1, Ordering::Relaxed);
            }
        }

        Ok(outcome)
    }

    fn detect_conflict(&self, contributions: &[Contribution]) -> Resolution {
        let confidences: Vec<f64> = contributions.iter().map(|c| c.pattern.confidence).collect();
        if variance(&confidences) > self.config.conflict_threshold {
            return Resolution::WeightedMerge;
        }

        let success_rates: Vec<f64> = contributions
            .iter()
            .map(|c| c.pattern.metrics.success_rate())
            .collect();
        if variance(&success_rates) > SUCCESS_RATE_CONFLICT {
            return Resolution::Vote;
        }

        Resolution::Merge
    }

    fn resolve(&self, contributions: &[Contribution], resolution: Resolution) -> Pattern {
        match resolution {
            Resolution::Vote => {
                // Highest success count wins outright
                let winner = contributions
                    .iter()
                    .max_by_key(|c| c.pattern.metrics.success)
                    .unwrap_or(&contributions[0]);
                winner.pattern.clone()
            }
            Resolution::WeightedMerge => merge_group(contributions, true),
            Resolution::Merge => merge_group(contributions, false),
        }
    }
}

/// Collective confidence: mean plus a capped contributor bonus
fn collective_confidence(contributions: &[Contribution]) -> f64 {
    let mean = contributions
        .iter()
        .map(|c| c.pattern.confidence)
        .sum::<f64>()
        / contributions.len().max(1) as f64;
    let bonus = (0.05 * contributions.len() as f64).min(CONTRIBUTOR_BONUS_CAP);
    (mean + bonus).min(1.0)
}

/// Merge a group into one pattern. The highest-scoring contributor
/// provides the identity (actions, conditions); metrics are summed,
/// durations averaged, weighted by contributor score when `weighted`.
fn merge_group(contributions: &[Contribution], weighted: bool) -> Pattern {
    let base = contributions
        .iter()
        .max_by(|a, b| {
            a.contributor_score
                .partial_cmp(&b.contributor_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .unwrap_or(&contributions[0]);

    let mut merged = base.pattern.clone();
    merged.metrics.success = contributions.iter().map(|c| c.pattern.metrics.success).sum();
    merged.metrics.failure = contributions.iter().map(|c| c.pattern.metrics.failure).sum();
    merged.metrics.partial = contributions.iter().map(|c| c.pattern.metrics.partial).sum();
    merged.usage_count = merged.metrics.usage();

    let weight_of = |c: &Contribution| if weighted { c.contributor_score.max(0.01) } else { 1.0 };
    let total_weight: f64 = contributions.iter().map(weight_of).sum();
    merged.metrics.avg_duration_ms = contributions
        .iter()
        .map(|c| weight_of(c) * c.pattern.metrics.avg_duration_ms)
        .sum::<f64>()
        / total_weight;
    merged.metrics.avg_improvement = contributions
        .iter()
        .map(|c| weight_of(c) * c.pattern.metrics.avg_improvement)
        .sum::<f64>()
        / total_weight;
    merged.metrics.quality_mean = contributions
        .iter()
        .map(|c| weight_of(c) * c.pattern.metrics.quality_mean)
        .sum::<f64>()
        / total_weight;

    merged.version = base.pattern.version + 1;
    merged
}

fn variance(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / values.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pattern::PatternKind;
    use std::collections::BTreeMap;

    fn pattern(confidence: f64, success: u64, failure: u64) -> Pattern {
        let mut p = Pattern::new(
            PatternKind::Coordination,
            "build test deploy",
            BTreeMap::new(),
            vec!["build".to_string(), "test".to_string(), "deploy".to_string()],
        );
        p.confidence = confidence;
        p.metrics.success = success;
        p.metrics.failure = failure;
        p.usage_count = p.metrics.usage();
        p
    }

    #[test]
    fn test_collective_confidence_caps_bonus() {
        let contributions: Vec<Contribution> = (0..10)
            .map(|i| Contribution::new(pattern(0.6, 1, 0), format!("w{i}"), 0.5))
            .collect();

        // mean 0.6 + min(0.5, cap 0.2) = 0.8
        let confidence = collective_confidence(&contributions);
        assert!((confidence - 0.8).abs() < 1e-9);
    }

    #[test]
    fn test_collective_confidence_never_exceeds_one() {
        let contributions = vec![
            Contribution::new(pattern(0.95, 5, 0), "a", 0.9),
            Contribution::new(pattern(0.98, 5, 0), "b", 0.9),
        ];
        assert!(collective_confidence(&contributions) <= 1.0);
    }

    #[test]
    fn test_merge_sums_outcome_tallies() {
        let contributions = vec![
            Contribution::new(pattern(0.8, 4, 1), "a", 0.9),
            Contribution::new(pattern(0.8, 2, 1), "b", 0.3),
        ];
        let merged = merge_group(&contributions, false);

        assert_eq!(merged.metrics.success, 6);
        assert_eq!(merged.metrics.failure, 2);
        assert_eq!(merged.usage_count, 8);
        // Identity comes from the highest-scoring contributor
        assert_eq!(merged.actions.len(), 3);
    }

    #[test]
    fn test_variance_flags_conflicts() {
        assert!(variance(&[0.2, 0.9]) > 0.1);
        assert!(variance(&[0.7, 0.72, 0.71]) < 0.01);
        assert_eq!(variance(&[0.5]), 0.0);
    }
}
