//! Component configuration.
//!
//! Every component owns a config struct whose `Default` carries the
//! documented defaults. `SubstrateConfig` aggregates them, loads
//! overrides from TOML or `SWARM_*` environment variables, and
//! validates ranges fail-fast before any component starts.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Learning pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Ring buffer capacity for observations
    pub observation_buffer: usize,
    /// Interval between forced extraction flushes (milliseconds)
    pub flush_interval_ms: u64,
    /// Maximum candidates emitted per extraction run
    pub extraction_batch: usize,
    /// Quality gate for extracted candidates
    pub min_quality: f64,
    /// Confidence gate for pattern application
    pub min_confidence: f64,
    /// Whether extraction runs automatically on buffer pressure
    pub auto_learning: bool,
    /// Cap on live patterns per kind; excess lowest-confidence patterns
    /// are retired on consolidation
    pub max_patterns_per_kind: usize,
    /// Similarity threshold for `apply` matching
    pub match_threshold: f64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            observation_buffer: 50,
            flush_interval_ms: 30_000,
            extraction_batch: 10,
            min_quality: 0.6,
            min_confidence: 0.5,
            auto_learning: true,
            max_patterns_per_kind: 100,
            match_threshold: 0.7,
        }
    }
}

/// Extractor thresholds (nested under the pipeline)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractorConfig {
    /// Maximum action-sequence prefix length mined per task
    pub max_prefix_len: usize,
    /// Minimum support as a fraction of the observation window
    pub min_support: f64,
    /// Quality gate for emitted candidates
    pub min_quality: f64,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            max_prefix_len: 5,
            min_support: 0.05,
            min_quality: 0.6,
        }
    }
}

/// Risk multipliers applied to action costs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskFactors {
    pub low: f64,
    pub med: f64,
    pub high: f64,
    pub critical: f64,
}

impl Default for RiskFactors {
    fn default() -> Self {
        Self {
            low: 1.0,
            med: 1.5,
            high: 2.0,
            critical: 3.0,
        }
    }
}

/// GOAP planner configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlannerConfig {
    /// Maximum search depth before returning `NoPlan`
    pub max_depth: usize,
    /// Wall-clock budget for one search (milliseconds)
    pub timeout_ms: u64,
    /// Cost multipliers by action risk level
    pub risk_factors: RiskFactors,
    /// Per-variable weights for the base heuristic; variables absent
    /// from the map weigh 1.0
    pub heuristic_weights: BTreeMap<String, f64>,
    /// Pattern-boost multiplier applied per matching pattern
    pub pattern_boost: f64,
    /// Whether execution outcomes may trigger replanning
    pub enable_replanning: bool,
    /// Cost-variance threshold that triggers a replan
    pub replan_threshold: f64,
    /// Searches faster than this (milliseconds) record their action
    /// prefix as a candidate pattern
    pub fast_plan_ms: u64,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            max_depth: 100,
            timeout_ms: 5_000,
            risk_factors: RiskFactors::default(),
            heuristic_weights: BTreeMap::new(),
            pattern_boost: 2.0,
            enable_replanning: true,
            replan_threshold: 0.5,
            fast_plan_ms: 1_000,
        }
    }
}

/// Byzantine voter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VoterConfig {
    /// Minimum registered nodes before a round may open
    pub min_nodes: usize,
    /// Default participation quorum (fraction of roster)
    pub default_quorum: f64,
    /// Default weighted-approval threshold
    pub default_consensus: f64,
    /// Per-round vote collection window (milliseconds)
    pub round_timeout_ms: u64,
    /// Retries when quorum is unmet
    pub max_rounds: u32,
    /// Reputation removed from a suspicious node per round
    pub reputation_decay: f64,
    /// Reputation floor below which a node is quarantined
    pub quarantine_threshold: f64,
}

impl Default for VoterConfig {
    fn default() -> Self {
        Self {
            min_nodes: 3,
            default_quorum: 0.6,
            default_consensus: 0.67,
            round_timeout_ms: 30_000,
            max_rounds: 3,
            reputation_decay: 0.1,
            quarantine_threshold: 0.2,
        }
    }
}

/// Pattern aggregator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregatorConfig {
    /// Periodic aggregation interval (milliseconds)
    pub aggregation_interval_ms: u64,
    /// Contributions required before a group aggregates early
    pub min_contributors: usize,
    /// Consensus threshold forwarded to the voter
    pub min_consensus: f64,
    /// Quorum forwarded to the voter
    pub min_quorum: f64,
    /// Confidence-variance threshold that flags a conflict
    pub conflict_threshold: f64,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            aggregation_interval_ms: 300_000,
            min_contributors: 2,
            min_consensus: 0.67,
            min_quorum: 0.6,
            conflict_threshold: 0.15,
        }
    }
}

/// Verification predictor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VerifierConfig {
    /// Weights of the truth-score components; normalized at load
    pub component_weights: BTreeMap<String, f64>,
    /// EMA smoothing factor for threshold adjustment
    pub ema_alpha: f64,
    /// Threshold used before any (agent-type, file-type) row exists
    pub default_threshold: f64,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            component_weights: BTreeMap::from([
                ("compile".to_string(), 0.4),
                ("test".to_string(), 0.4),
                ("lint".to_string(), 0.2),
            ]),
            ema_alpha: 0.1,
            default_threshold: 0.95,
        }
    }
}

/// Vector index configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    /// Embedding dimensionality
    pub dims: usize,
    /// Background consistency recheck interval (milliseconds)
    pub reindex_interval_ms: u64,
    /// Default result count for top-k queries
    pub top_k: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            dims: 384,
            reindex_interval_ms: 3_600_000,
            top_k: 10,
        }
    }
}

/// Coordinator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Reputation assigned to a freshly registered consensus node
    pub initial_reputation: f64,
    /// Per-subtask execution timeout (milliseconds)
    pub task_timeout_ms: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            initial_reputation: 0.7,
            task_timeout_ms: 60_000,
        }
    }
}

/// Aggregate configuration for the whole substrate
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SubstrateConfig {
    pub pipeline: PipelineConfig,
    pub extractor: ExtractorConfig,
    pub planner: PlannerConfig,
    pub voter: VoterConfig,
    pub aggregator: AggregatorConfig,
    pub verifier: VerifierConfig,
    pub index: IndexConfig,
    pub coordinator: CoordinatorConfig,
}

impl SubstrateConfig {
    /// Parse a TOML document, falling back to defaults for absent keys.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] on parse failure or out-of-range values.
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(text).map_err(|e| Error::Validation(format!("config parse: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `SWARM_*` environment overrides on top of defaults.
    ///
    /// Unparseable values are ignored with a warning, matching the
    /// permissive loading of the rest of the ecosystem.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(value) = std::env::var("SWARM_OBSERVATION_BUFFER") {
            if let Ok(parsed) = value.parse() {
                config.pipeline.observation_buffer = parsed;
            } else {
                tracing::warn!("Invalid SWARM_OBSERVATION_BUFFER '{value}', using default");
            }
        }
        if let Ok(value) = std::env::var("SWARM_FLUSH_INTERVAL_MS") {
            if let Ok(parsed) = value.parse() {
                config.pipeline.flush_interval_ms = parsed;
            }
        }
        if let Ok(value) = std::env::var("SWARM_PLANNER_MAX_DEPTH") {
            if let Ok(parsed) = value.parse() {
                config.planner.max_depth = parsed;
            }
        }
        if let Ok(value) = std::env::var("SWARM_PLANNER_TIMEOUT_MS") {
            if let Ok(parsed) = value.parse() {
                config.planner.timeout_ms = parsed;
            }
        }
        if let Ok(value) = std::env::var("SWARM_AUTO_LEARNING") {
            config.pipeline.auto_learning =
                matches!(value.to_lowercase().as_str(), "true" | "1" | "yes" | "on");
        }

        config
    }

    /// Fail-fast range validation.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        fn fraction(name: &str, value: f64) -> Result<()> {
            if (0.0..=1.0).contains(&value) {
                Ok(())
            } else {
                Err(Error::Validation(format!("{name} must be in [0,1], got {value}")))
            }
        }

        fraction("pipeline.min_quality", self.pipeline.min_quality)?;
        fraction("pipeline.min_confidence", self.pipeline.min_confidence)?;
        fraction("pipeline.match_threshold", self.pipeline.match_threshold)?;
        fraction("extractor.min_support", self.extractor.min_support)?;
        fraction("extractor.min_quality", self.extractor.min_quality)?;
        fraction("voter.default_quorum", self.voter.default_quorum)?;
        fraction("voter.default_consensus", self.voter.default_consensus)?;
        fraction("voter.reputation_decay", self.voter.reputation_decay)?;
        fraction("voter.quarantine_threshold", self.voter.quarantine_threshold)?;
        fraction("aggregator.min_consensus", self.aggregator.min_consensus)?;
        fraction("aggregator.min_quorum", self.aggregator.min_quorum)?;
        fraction("verifier.ema_alpha", self.verifier.ema_alpha)?;
        fraction("verifier.default_threshold", self.verifier.default_threshold)?;

        if self.pipeline.observation_buffer == 0 {
            return Err(Error::Validation(
                "pipeline.observation_buffer must be positive".to_string(),
            ));
        }
        if self.planner.max_depth == 0 {
            return Err(Error::Validation("planner.max_depth must be positive".to_string()));
        }
        if self.voter.min_nodes == 0 {
            return Err(Error::Validation("voter.min_nodes must be positive".to_string()));
        }
        if self.index.dims == 0 {
            return Err(Error::Validation("index.dims must be positive".to_string()));
        }
        if self.verifier.component_weights.is_empty() {
            return Err(Error::Validation(
                "verifier.component_weights must not be empty".to_string(),
            ));
        }

        Ok(())
    }
}
