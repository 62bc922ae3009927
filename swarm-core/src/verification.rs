//! Truth-score prediction and adaptive verification thresholds.
//!
//! Before a change propagates, the predictor estimates its truth score
//! from the submitting agent's track record and the change shape. A
//! prediction below the adaptive threshold for that (agent-type,
//! file-type) pair recommends rollback ahead of verification; the
//! realized score then tunes the threshold's adjustment factor by EMA.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::VerifierConfig;
use crate::error::Result;
use crate::hooks::{Alert, AlertBus};
use crate::storage::SubstrateStore;
use crate::types::{AgentId, TaskId};

/// Direction an agent's reliability is moving
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReliabilityTrend {
    Improving,
    Stable,
    Declining,
}

impl std::fmt::Display for ReliabilityTrend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReliabilityTrend::Improving => write!(f, "improving"),
            ReliabilityTrend::Stable => write!(f, "stable"),
            ReliabilityTrend::Declining => write!(f, "declining"),
        }
    }
}

/// Aggregated verification track record for one agent.
///
/// Recomputed by a store trigger on every verification-outcome insert;
/// the core only ever reads these rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentReliability {
    pub agent_id: AgentId,
    /// Total verifications recorded
    pub total: u64,
    /// Passed verifications
    pub success: u64,
    /// Failed verifications
    pub fail: u64,
    /// Mean truth score across all verifications
    pub avg_truth_score: f64,
    /// Combined reliability score (0.0 to 1.0)
    pub reliability: f64,
    /// Recent direction
    pub trend: ReliabilityTrend,
    /// Whether the agent is excluded from delegation
    pub quarantined: bool,
}

/// Recorded result of verifying one change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationOutcome {
    pub id: Uuid,
    pub task_id: TaskId,
    pub agent_id: AgentId,
    pub timestamp: DateTime<Utc>,
    /// Whether the change cleared its threshold
    pub passed: bool,
    /// Weighted component score (0.0 to 1.0)
    pub truth_score: f64,
    /// Threshold in force at verification time
    pub threshold: f64,
    /// Raw component scores (compile, test, lint, ...)
    pub component_scores: BTreeMap<String, f64>,
    /// File type of the change
    pub file_type: String,
    /// Change complexity estimate (0.0 to 1.0)
    pub complexity: f64,
    /// Lines touched by the change
    pub lines_changed: u32,
    /// Verification duration
    pub duration_ms: u64,
    /// Whether the substrate recommended rollback
    pub rollback_triggered: bool,
}

/// Self-tuning acceptance bar for one (agent-type, file-type) pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdaptiveThreshold {
    pub agent_type: String,
    pub file_type: String,
    /// Configured base threshold
    pub base_threshold: f64,
    /// Signed EMA of prediction errors, added to the base
    pub adjustment_factor: f64,
    /// Samples folded into the adjustment
    pub samples: u64,
    pub last_updated: DateTime<Utc>,
}

impl AdaptiveThreshold {
    /// Fresh row at the configured base
    #[must_use]
    pub fn new(agent_type: impl Into<String>, file_type: impl Into<String>, base: f64) -> Self {
        Self {
            agent_type: agent_type.into(),
            file_type: file_type.into(),
            base_threshold: base,
            adjustment_factor: 0.0,
            samples: 0,
            last_updated: Utc::now(),
        }
    }

    /// Threshold currently recommended for this pair
    #[must_use]
    pub fn recommended(&self) -> f64 {
        (self.base_threshold + self.adjustment_factor).clamp(0.5, 0.99)
    }

    /// Fold a signed prediction error into the adjustment factor
    pub fn absorb_error(&mut self, error: f64, alpha: f64) {
        self.adjustment_factor = (1.0 - alpha) * self.adjustment_factor + alpha * error;
        self.samples += 1;
        self.last_updated = Utc::now();
    }
}

/// Shape of a proposed change, used as prediction input
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeContext {
    pub task_id: TaskId,
    pub agent_id: AgentId,
    pub agent_type: String,
    pub file_type: String,
    /// Complexity estimate (0.0 to 1.0)
    pub complexity: f64,
    pub lines_changed: u32,
}

/// A stored truth-score prediction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TruthPrediction {
    pub id: Uuid,
    pub task_id: TaskId,
    pub agent_type: String,
    pub file_type: String,
    /// Predicted truth score
    pub predicted: f64,
    /// Confidence in the prediction (grows with sample count)
    pub confidence: f64,
    /// Threshold the prediction was compared against
    pub threshold: f64,
    /// Whether the prediction recommends rollback
    pub rollback_recommended: bool,
    pub created_at: DateTime<Utc>,
}

/// Truth-score predictor over the store's reliability and threshold rows
pub struct VerificationPredictor {
    config: VerifierConfig,
    store: Arc<dyn SubstrateStore>,
    alerts: AlertBus,
}

impl VerificationPredictor {
    #[must_use]
    pub fn new(config: VerifierConfig, store: Arc<dyn SubstrateStore>, alerts: AlertBus) -> Self {
        Self {
            config,
            store,
            alerts,
        }
    }

    /// Predict the truth score of a proposed change and persist the
    /// prediction.
    ///
    /// # Errors
    ///
    /// Returns storage errors from threshold or reliability reads.
    pub async fn predict(&self, ctx: &ChangeContext) -> Result<TruthPrediction> {
        let threshold = self
            .store
            .get_adaptive_threshold(&ctx.agent_type, &ctx.file_type)
            .await?
            .unwrap_or_else(|| {
                AdaptiveThreshold::new(
                    ctx.agent_type.clone(),
                    ctx.file_type.clone(),
                    self.config.default_threshold,
                )
            });

        let reliability = self.store.get_agent_reliability(&ctx.agent_id).await?;
        let (history_score, samples) = reliability
            .as_ref()
            .map_or((0.9, 0), |r| (r.avg_truth_score, r.total));

        // Shape penalties: complex or sprawling changes score lower
        let complexity_penalty = 0.05 * ctx.complexity.clamp(0.0, 1.0);
        let size_penalty = (f64::from(ctx.lines_changed) / 10_000.0).min(0.05);
        let predicted = (history_score - complexity_penalty - size_penalty).clamp(0.0, 1.0);

        let recommended = threshold.recommended();
        let prediction = TruthPrediction {
            id: Uuid::new_v4(),
            task_id: ctx.task_id.clone(),
            agent_type: ctx.agent_type.clone(),
            file_type: ctx.file_type.clone(),
            predicted,
            confidence: samples as f64 / (samples as f64 + 10.0),
            threshold: recommended,
            rollback_recommended: predicted < recommended,
            created_at: Utc::now(),
        };

        debug!(
            agent_type = %ctx.agent_type,
            file_type = %ctx.file_type,
            predicted,
            threshold = recommended,
            rollback = prediction.rollback_recommended,
            "truth score predicted"
        );

        self.store.store_truth_prediction(&prediction).await?;
        Ok(prediction)
    }

    /// Record the realized verification outcome, tune the adaptive
    /// threshold, and raise alerts for threshold misses and rollbacks.
    ///
    /// # Errors
    ///
    /// Returns storage errors; the reliability recompute itself runs as
    /// a store trigger.
    pub async fn record_outcome(
        &self,
        prediction: &TruthPrediction,
        mut outcome: VerificationOutcome,
    ) -> Result<VerificationOutcome> {
        // Rollback fires when either side of the bar is missed
        outcome.rollback_triggered =
            prediction.rollback_recommended || outcome.truth_score < outcome.threshold;
        outcome.passed = outcome.truth_score >= outcome.threshold;

        let mut threshold = self
            .store
            .get_adaptive_threshold(&prediction.agent_type, &prediction.file_type)
            .await?
            .unwrap_or_else(|| {
                AdaptiveThreshold::new(
                    prediction.agent_type.clone(),
                    prediction.file_type.clone(),
                    self.config.default_threshold,
                )
            });

        // Signed prediction error (actual - predicted): an
        // over-confident predictor produces negative errors and the
        // EMA lowers the recommended bar accordingly
        let error = outcome.truth_score - prediction.predicted;
        threshold.absorb_error(error, self.config.ema_alpha);
        self.store.upsert_adaptive_threshold(&threshold).await?;
        self.store.store_verification_outcome(&outcome).await?;

        if outcome.truth_score < outcome.threshold {
            self.alerts.raise(Alert::TruthScoreBelowThreshold {
                agent_id: outcome.agent_id.clone(),
                truth_score: outcome.truth_score,
                threshold: outcome.threshold,
            });
        }
        if outcome.rollback_triggered {
            info!(task_id = %outcome.task_id, agent_id = %outcome.agent_id, "rollback triggered");
            self.alerts.raise(Alert::RollbackTriggered {
                task_id: outcome.task_id.clone(),
                agent_id: outcome.agent_id.clone(),
            });
        }

        Ok(outcome)
    }

    /// Weighted truth score from raw component scores, using the
    /// configured (normalized) component weights.
    #[must_use]
    pub fn truth_score(&self, components: &BTreeMap<String, f64>) -> f64 {
        let mut weighted = 0.0;
        let mut weight_sum = 0.0;
        for (component, weight) in &self.config.component_weights {
            if let Some(score) = components.get(component) {
                weighted += weight * score;
                weight_sum += weight;
            }
        }
        if weight_sum == 0.0 {
            0.0
        } else {
            (weighted / weight_sum).clamp(0.0, 1.0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recommended_threshold_clamps() {
        let mut threshold = AdaptiveThreshold::new("coder", "ts", 0.95);
        assert!((threshold.recommended() - 0.95).abs() < 1e-9);

        threshold.adjustment_factor = 0.2;
        assert!((threshold.recommended() - 0.99).abs() < 1e-9);

        threshold.adjustment_factor = -0.6;
        assert!((threshold.recommended() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_absorb_error_is_ema() {
        // actual 0.86 against predicted 0.88: signed error -0.02
        let mut threshold = AdaptiveThreshold::new("coder", "ts", 0.95);
        threshold.absorb_error(-0.02, 0.1);
        assert!((threshold.adjustment_factor + 0.002).abs() < 1e-9);
        assert_eq!(threshold.samples, 1);

        // Threshold stays approximately at base after a small error
        assert!((threshold.recommended() - 0.948).abs() < 1e-9);
    }
}
