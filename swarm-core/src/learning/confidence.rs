//! # Confidence Updater
//!
//! Bayesian-style running update of pattern confidence from outcomes.
//! For a pattern with sample count `n`, a new outcome of quality `q`
//! updates the running mean and variance with weight `a = 1/(n+1)`:
//!
//! ```text
//! mean' = a*q + (1-a)*mean
//! var'  = a*(q-mean')^2 + (1-a)*var
//! confidence' = 0.7*success_rate + 0.3*cost_reliability
//! ```
//!
//! Updates for one pattern id are serialized in arrival order under a
//! per-pattern async lock; the mutated row invalidates the cache before
//! the update returns.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tracing::{debug, instrument};

use crate::error::{Error, Result};
use crate::pattern::Pattern;
use crate::storage::{PatternCacheSink, SubstrateStore};
use crate::types::{OutcomeKind, PatternId};

/// Division guard for cost reliability
const COST_EPSILON: f64 = 1e-6;

/// Sample counts at which generalization may upgrade
const GENERALIZATION_THRESHOLDS: [u64; 2] = [10, 50];

/// Success rate required for a generalization upgrade
const GENERALIZATION_SUCCESS_RATE: f64 = 0.8;

/// One pattern application's outcome
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OutcomeSample {
    /// Terminal classification
    pub outcome: OutcomeKind,
    /// Application duration
    pub duration_ms: f64,
    /// Improvement over baseline, when measured (0.0 to 1.0)
    pub improvement: Option<f64>,
}

/// Serialized per-pattern confidence updates
pub struct ConfidenceUpdater {
    store: Arc<dyn SubstrateStore>,
    cache: Arc<dyn PatternCacheSink>,
    /// Per-pattern write locks; arrival order is preserved by tokio's
    /// FIFO mutex fairness
    locks: Mutex<HashMap<PatternId, Arc<tokio::sync::Mutex<()>>>>,
}

impl ConfidenceUpdater {
    #[must_use]
    pub fn new(store: Arc<dyn SubstrateStore>, cache: Arc<dyn PatternCacheSink>) -> Self {
        Self {
            store,
            cache,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Apply one outcome to a pattern, returning the updated row.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for unknown patterns and storage
    /// errors from the write-back.
    #[instrument(skip(self), fields(pattern_id = %pattern_id))]
    pub async fn apply(&self, pattern_id: PatternId, sample: OutcomeSample) -> Result<Pattern> {
        let lock = self.lock_for(pattern_id);
        let _guard = lock.lock().await;

        let mut pattern = self
            .store
            .get_pattern(pattern_id)
            .await?
            .ok_or(Error::NotFound(pattern_id))?;

        update_pattern(&mut pattern, sample);
        pattern.validate()?;
        self.store.store_pattern(&pattern).await?;

        // Mutation invalidates every cache tier before the update returns
        self.cache.invalidate(pattern_id);

        debug!(
            confidence = pattern.confidence,
            usage = pattern.usage_count,
            generalization = ?pattern.generalization,
            "confidence updated"
        );
        Ok(pattern)
    }

    fn lock_for(&self, pattern_id: PatternId) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock();
        Arc::clone(locks.entry(pattern_id).or_default())
    }
}

/// Pure update of a pattern's metrics and confidence from one sample.
///
/// Exposed for the aggregator's merge path and for property tests.
pub fn update_pattern(pattern: &mut Pattern, sample: OutcomeSample) {
    let quality = sample.outcome.quality();
    let n = pattern.usage_count;
    let alpha = 1.0 / (n as f64 + 1.0);

    // Running quality mean/variance
    let mean = alpha * quality + (1.0 - alpha) * pattern.metrics.quality_mean;
    let deviation = quality - mean;
    pattern.metrics.quality_variance =
        alpha * deviation * deviation + (1.0 - alpha) * pattern.metrics.quality_variance;
    pattern.metrics.quality_mean = mean;

    // Running duration mean/variance (cost reliability input)
    let duration_mean =
        alpha * sample.duration_ms + (1.0 - alpha) * pattern.metrics.avg_duration_ms;
    let duration_dev = sample.duration_ms - duration_mean;
    pattern.metrics.duration_variance = alpha * duration_dev * duration_dev
        + (1.0 - alpha) * pattern.metrics.duration_variance;
    pattern.metrics.avg_duration_ms = duration_mean;

    if let Some(improvement) = sample.improvement {
        pattern.metrics.avg_improvement =
            alpha * improvement + (1.0 - alpha) * pattern.metrics.avg_improvement;
    }

    match sample.outcome {
        OutcomeKind::Success => pattern.metrics.success += 1,
        OutcomeKind::Partial => pattern.metrics.partial += 1,
        OutcomeKind::Failure => pattern.metrics.failure += 1,
    }
    pattern.usage_count = pattern.metrics.usage();

    let success_rate = pattern.metrics.success_rate();
    let cost_reliability = (1.0
        - pattern.metrics.duration_variance.sqrt()
            / pattern.metrics.avg_duration_ms.max(COST_EPSILON))
    .max(0.0);
    pattern.confidence = (0.7 * success_rate + 0.3 * cost_reliability).clamp(0.0, 1.0);

    // Generalization climbs one level when the sample count crosses a
    // threshold with a strong success rate
    if GENERALIZATION_THRESHOLDS.contains(&pattern.usage_count)
        && success_rate > GENERALIZATION_SUCCESS_RATE
    {
        pattern.generalization = pattern.generalization.upgraded();
    }

    pattern.touch(Utc::now());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pattern::{Generalization, PatternKind};
    use std::collections::BTreeMap;

    fn sample(outcome: OutcomeKind, duration_ms: f64) -> OutcomeSample {
        OutcomeSample {
            outcome,
            duration_ms,
            improvement: None,
        }
    }

    fn fresh_pattern() -> Pattern {
        Pattern::new(
            PatternKind::Coordination,
            "build test",
            BTreeMap::new(),
            vec!["build".to_string(), "test".to_string()],
        )
    }

    #[test]
    fn test_confidence_stays_in_unit_interval() {
        let mut pattern = fresh_pattern();
        for i in 0..200 {
            let outcome = match i % 3 {
                0 => OutcomeKind::Success,
                1 => OutcomeKind::Partial,
                _ => OutcomeKind::Failure,
            };
            update_pattern(&mut pattern, sample(outcome, 100.0 + (i % 7) as f64));
            assert!((0.0..=1.0).contains(&pattern.confidence));
            assert_eq!(
                pattern.usage_count,
                pattern.metrics.success + pattern.metrics.failure + pattern.metrics.partial
            );
        }
    }

    #[test]
    fn test_consistent_successes_drive_confidence_high() {
        let mut pattern = fresh_pattern();
        for _ in 0..10 {
            update_pattern(&mut pattern, sample(OutcomeKind::Success, 100.0));
        }
        // Perfect success rate, near-zero duration variance
        assert!(pattern.confidence > 0.95);
        assert_eq!(pattern.metrics.success, 10);
    }

    #[test]
    fn test_erratic_durations_reduce_cost_reliability() {
        let mut steady = fresh_pattern();
        let mut erratic = fresh_pattern();
        let durations = [100.0, 100.0, 100.0, 100.0, 100.0, 100.0];
        let wild = [10.0, 500.0, 30.0, 800.0, 50.0, 400.0];

        for (&a, &b) in durations.iter().zip(wild.iter()) {
            update_pattern(&mut steady, sample(OutcomeKind::Success, a));
            update_pattern(&mut erratic, sample(OutcomeKind::Success, b));
        }

        assert!(steady.confidence > erratic.confidence);
    }

    #[test]
    fn test_generalization_upgrades_at_thresholds() {
        let mut pattern = fresh_pattern();
        assert_eq!(pattern.generalization, Generalization::Specific);

        for _ in 0..10 {
            update_pattern(&mut pattern, sample(OutcomeKind::Success, 100.0));
        }
        assert_eq!(pattern.generalization, Generalization::Moderate);

        for _ in 0..40 {
            update_pattern(&mut pattern, sample(OutcomeKind::Success, 100.0));
        }
        assert_eq!(pattern.generalization, Generalization::General);
    }

    #[test]
    fn test_generalization_blocked_by_weak_success_rate() {
        let mut pattern = fresh_pattern();
        for i in 0..10 {
            let outcome = if i % 2 == 0 {
                OutcomeKind::Success
            } else {
                OutcomeKind::Failure
            };
            update_pattern(&mut pattern, sample(outcome, 100.0));
        }
        assert_eq!(pattern.generalization, Generalization::Specific);
    }

    #[test]
    fn test_running_mean_converges_to_quality() {
        let mut pattern = fresh_pattern();
        for _ in 0..50 {
            update_pattern(&mut pattern, sample(OutcomeKind::Partial, 100.0));
        }
        assert!((pattern.metrics.quality_mean - 0.5).abs() < 0.05);
    }
}
