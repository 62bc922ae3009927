use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::types::{ActionId, PatternId, Scalar, hex_prefix};

/// Confidence floor below which an unused, aged pattern is retired
const RETIRE_CONFIDENCE: f64 = 0.3;

/// Usage ceiling for retirement eligibility
const RETIRE_MAX_USAGE: u64 = 5;

/// Age threshold for retirement eligibility
const RETIRE_AGE_DAYS: i64 = 30;

/// Pattern categories extracted and validated by the substrate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PatternKind {
    /// Multi-agent coordination sequences mined from observations
    Coordination,
    /// Action prefixes recorded by the planner after fast successful searches
    Goap,
    /// Verification-outcome regularities
    Verification,
    /// Phase-scoped workflow templates contributed by collaborators
    SparcPhase,
}

impl std::fmt::Display for PatternKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PatternKind::Coordination => write!(f, "coordination"),
            PatternKind::Goap => write!(f, "goap"),
            PatternKind::Verification => write!(f, "verification"),
            PatternKind::SparcPhase => write!(f, "sparc-phase"),
        }
    }
}

/// How broadly a pattern is expected to transfer across contexts.
///
/// Upgraded one level at a time by the confidence updater when the
/// sample count crosses 10 and 50 with a success rate above 0.8.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Generalization {
    Specific,
    Moderate,
    General,
}

impl Generalization {
    /// The next level up, saturating at `General`
    #[must_use]
    pub fn upgraded(self) -> Self {
        match self {
            Generalization::Specific => Generalization::Moderate,
            Generalization::Moderate | Generalization::General => Generalization::General,
        }
    }
}

/// Acceptance bar a pattern application must clear to count as a success
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuccessCriteria {
    /// Minimum completion fraction (0.0 to 1.0)
    pub min_completion: f64,
    /// Maximum tolerated error fraction (0.0 to 1.0)
    pub max_error: f64,
}

impl Default for SuccessCriteria {
    fn default() -> Self {
        Self {
            min_completion: 0.8,
            max_error: 0.2,
        }
    }
}

/// Outcome accounting for a pattern.
///
/// `success + failure + partial` is the pattern's usage count; the
/// running quality mean/variance feed the Bayesian confidence update
/// and the duration statistics feed cost reliability.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PatternMetrics {
    /// Successful applications
    pub success: u64,
    /// Failed applications
    pub failure: u64,
    /// Partially successful applications
    pub partial: u64,
    /// Mean application duration in milliseconds
    pub avg_duration_ms: f64,
    /// Running variance of application duration
    pub duration_variance: f64,
    /// Mean improvement over baseline (0.0 to 1.0)
    pub avg_improvement: f64,
    /// Running mean of observed outcome quality
    pub quality_mean: f64,
    /// Running variance of observed outcome quality
    pub quality_variance: f64,
}

impl PatternMetrics {
    /// Total recorded applications
    #[must_use]
    pub fn usage(&self) -> u64 {
        self.success + self.failure + self.partial
    }

    /// Fraction of applications that fully succeeded
    #[must_use]
    pub fn success_rate(&self) -> f64 {
        let total = self.usage();
        if total == 0 {
            0.0
        } else {
            self.success as f64 / total as f64
        }
    }
}

/// A reusable, scored template extracted from observations and
/// validated by consensus.
///
/// Lifecycle: created by the extractor or aggregator, mutated only by
/// the confidence updater and aggregator under a per-pattern write
/// lock, retired when confidence, usage, and age all fall below the
/// retirement thresholds. A superseded pattern is never returned as a
/// match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pattern {
    /// Unique pattern identifier
    pub id: PatternId,
    /// Category
    pub kind: PatternKind,
    /// Human-readable name derived from the action sequence
    pub name: String,
    /// Pre-state subset that must hold for the pattern to apply
    pub conditions: BTreeMap<String, Scalar>,
    /// Ordered action identifiers
    pub actions: Vec<ActionId>,
    /// Acceptance bar for counting an application as success
    pub success_criteria: SuccessCriteria,
    /// Outcome accounting
    pub metrics: PatternMetrics,
    /// Combined success-rate / cost-reliability score in [0, 1]
    pub confidence: f64,
    /// Total applications (kept equal to `metrics.usage()`)
    pub usage_count: u64,
    /// Transfer breadth
    pub generalization: Generalization,
    /// Creation instant
    pub created: DateTime<Utc>,
    /// Most recent application instant
    pub last_used: DateTime<Utc>,
    /// Monotonic content version, bumped on every mutation
    pub version: u32,
    /// Pattern that replaced this one, if any
    pub superseded_by: Option<PatternId>,
}

impl Pattern {
    /// Create a fresh pattern with a deterministic id.
    ///
    /// The id is derived from the signature and action list, so
    /// re-extracting an unchanged observation window reproduces the
    /// same pattern id.
    #[must_use]
    pub fn new(
        kind: PatternKind,
        name: impl Into<String>,
        conditions: BTreeMap<String, Scalar>,
        actions: Vec<ActionId>,
    ) -> Self {
        let name = name.into();
        let id = deterministic_id(kind, &name, &actions);
        let now = Utc::now();
        Self {
            id,
            kind,
            name,
            conditions,
            actions,
            success_criteria: SuccessCriteria::default(),
            metrics: PatternMetrics::default(),
            confidence: 0.5,
            usage_count: 0,
            generalization: Generalization::Specific,
            created: now,
            last_used: now,
            version: 1,
            superseded_by: None,
        }
    }

    /// Grouping signature used by the aggregator: kind plus normalized name
    #[must_use]
    pub fn signature(&self) -> (PatternKind, String) {
        (self.kind, normalize_name(&self.name))
    }

    /// Check structural invariants before a write.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] when confidence leaves [0, 1],
    /// the usage count disagrees with the outcome tally, the action
    /// list is empty or oversized, or the pattern supersedes itself.
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.confidence) {
            return Err(Error::Validation(format!(
                "pattern {} confidence {} outside [0,1]",
                self.id, self.confidence
            )));
        }
        if self.usage_count != self.metrics.usage() {
            return Err(Error::Validation(format!(
                "pattern {} usage_count {} != outcome tally {}",
                self.id,
                self.usage_count,
                self.metrics.usage()
            )));
        }
        if self.actions.is_empty() {
            return Err(Error::Validation(format!("pattern {} has no actions", self.id)));
        }
        if self.actions.len() > crate::types::MAX_ACTION_COUNT {
            return Err(Error::Validation(format!(
                "pattern {} action count {} exceeds cap",
                self.id,
                self.actions.len()
            )));
        }
        if self.superseded_by == Some(self.id) {
            return Err(Error::Validation(format!("pattern {} supersedes itself", self.id)));
        }
        Ok(())
    }

    /// True when the pattern qualifies for retirement: low confidence,
    /// little usage, and past the age threshold.
    #[must_use]
    pub fn is_retirable(&self, now: DateTime<Utc>) -> bool {
        self.confidence < RETIRE_CONFIDENCE
            && self.usage_count < RETIRE_MAX_USAGE
            && now - self.created > Duration::days(RETIRE_AGE_DAYS)
    }

    /// True when this pattern should be excluded from match results
    #[must_use]
    pub fn is_superseded(&self) -> bool {
        self.superseded_by.is_some()
    }

    /// Check whether the pattern's conditions hold in `state`
    #[must_use]
    pub fn applies_to(&self, state: &crate::types::WorldState) -> bool {
        self.conditions
            .iter()
            .all(|(var, want)| state.get(var) == Some(want))
    }

    /// Text rendered into the pattern's embedding: name, kind tag,
    /// condition variables, and action ids.
    #[must_use]
    pub fn embedding_text(&self) -> String {
        let conditions: Vec<String> = self
            .conditions
            .iter()
            .map(|(var, value)| format!("{var}={}", value.render()))
            .collect();
        format!(
            "{} kind:{} conditions:{} actions:{}",
            self.name,
            self.kind,
            conditions.join(","),
            self.actions.join(">")
        )
    }

    /// Content hash guarding embedding regeneration: embeddings are
    /// rebuilt only when this fingerprint changes.
    #[must_use]
    pub fn content_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.embedding_text().as_bytes());
        hex_prefix(&hasher.finalize(), 16)
    }

    /// Record an application instant and bump the version
    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.last_used = now;
        self.version += 1;
    }
}

/// Normalize a pattern name for signature grouping: lowercase,
/// whitespace collapsed to single underscores.
#[must_use]
pub fn normalize_name(name: &str) -> String {
    name.split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join("_")
}

/// Derive a stable pattern id from its signature and action list
#[must_use]
pub fn deterministic_id(kind: PatternKind, name: &str, actions: &[ActionId]) -> PatternId {
    let mut hasher = Sha256::new();
    hasher.update(kind.to_string().as_bytes());
    hasher.update([0u8]);
    hasher.update(normalize_name(name).as_bytes());
    for action in actions {
        hasher.update([0u8]);
        hasher.update(action.as_bytes());
    }
    let digest = hasher.finalize();
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest[..16]);
    Uuid::from_bytes(bytes)
}
