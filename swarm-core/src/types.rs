use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

// ============================================================================
// Validation Constants
// ============================================================================

/// Maximum length for task descriptions (10KB).
///
/// Prevents unbounded input strings from exhausting memory during
/// serialization or storage operations.
pub const MAX_DESCRIPTION_LEN: usize = 10_000;

/// Maximum number of actions carried by a single pattern or plan (1000).
pub const MAX_ACTION_COUNT: usize = 1_000;

/// Maximum number of variables in a world state (256).
///
/// World-state variables are declared in planner configuration; this cap
/// bounds hashing and diffing cost on the planner hot path.
pub const MAX_STATE_VARS: usize = 256;

/// Maximum size for serialized pattern data (1MB).
pub const MAX_PATTERN_SIZE: usize = 1_000_000;

// ============================================================================
// Identifiers
// ============================================================================

/// Unique pattern identifier
pub type PatternId = Uuid;

/// Unique plan identifier
pub type PlanId = Uuid;

/// Opaque task identifier assigned by the caller
pub type TaskId = String;

/// Opaque agent identifier assigned by the caller
pub type AgentId = String;

/// Opaque consensus-node identifier
pub type NodeId = String;

/// Identifier of an action in the planner's action set
pub type ActionId = String;

// ============================================================================
// Scalars and world states
// ============================================================================

/// Scalar value carried by pattern conditions and world-state variables.
///
/// The source system used untyped JSON payloads here; the substrate pins
/// them down as a tagged union so planner and matcher code can reason
/// about gaps and equality without runtime type sniffing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Scalar {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl Scalar {
    /// Normalized distance between two scalars in [0, 1].
    ///
    /// Equal values have gap 0; mismatched variants or unequal
    /// non-numeric values have gap 1. Numeric values use a relative
    /// difference so the planner heuristic stays scale-free.
    #[must_use]
    pub fn gap(&self, other: &Scalar) -> f64 {
        match (self, other) {
            (Scalar::Bool(a), Scalar::Bool(b)) => {
                if a == b {
                    0.0
                } else {
                    1.0
                }
            }
            (Scalar::Text(a), Scalar::Text(b)) => {
                if a == b {
                    0.0
                } else {
                    1.0
                }
            }
            (Scalar::Int(a), Scalar::Int(b)) => relative_gap(*a as f64, *b as f64),
            (Scalar::Float(a), Scalar::Float(b)) => relative_gap(*a, *b),
            (Scalar::Int(a), Scalar::Float(b)) | (Scalar::Float(b), Scalar::Int(a)) => {
                relative_gap(*a as f64, *b)
            }
            _ => 1.0,
        }
    }

    /// Human-readable rendering used in pattern names and log lines
    #[must_use]
    pub fn render(&self) -> String {
        match self {
            Scalar::Bool(v) => v.to_string(),
            Scalar::Int(v) => v.to_string(),
            Scalar::Float(v) => format!("{v:.4}"),
            Scalar::Text(v) => v.clone(),
        }
    }
}

fn relative_gap(a: f64, b: f64) -> f64 {
    if a == b {
        return 0.0;
    }
    let scale = a.abs().max(b.abs()).max(1.0);
    ((a - b).abs() / scale).min(1.0)
}

impl From<bool> for Scalar {
    fn from(v: bool) -> Self {
        Scalar::Bool(v)
    }
}

impl From<i64> for Scalar {
    fn from(v: i64) -> Self {
        Scalar::Int(v)
    }
}

impl From<f64> for Scalar {
    fn from(v: f64) -> Self {
        Scalar::Float(v)
    }
}

impl From<&str> for Scalar {
    fn from(v: &str) -> Self {
        Scalar::Text(v.to_string())
    }
}

/// A set of named variables describing the world at a point in time.
///
/// States are ordered maps so hashing is canonical: two states with the
/// same variable assignments always produce the same `state_hash`,
/// regardless of insertion order.
///
/// # Examples
///
/// ```
/// use swarm_core::types::{Scalar, WorldState};
///
/// let mut state = WorldState::new();
/// state.set("neural", Scalar::Text("not_implemented".to_string()));
/// state.set("verify", Scalar::Text("active".to_string()));
///
/// let mut goal = WorldState::new();
/// goal.set("verify", Scalar::Text("active".to_string()));
///
/// assert!(state.satisfies(&goal));
/// ```
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct WorldState {
    vars: BTreeMap<String, Scalar>,
}

impl WorldState {
    /// Create an empty world state
    #[must_use]
    pub fn new() -> Self {
        Self { vars: BTreeMap::new() }
    }

    /// Build a state from an iterator of variable assignments
    pub fn from_vars<I, K>(vars: I) -> Self
    where
        I: IntoIterator<Item = (K, Scalar)>,
        K: Into<String>,
    {
        Self {
            vars: vars.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }

    /// Set a variable, replacing any previous value
    pub fn set(&mut self, var: impl Into<String>, value: Scalar) {
        self.vars.insert(var.into(), value);
    }

    /// Read a variable
    #[must_use]
    pub fn get(&self, var: &str) -> Option<&Scalar> {
        self.vars.get(var)
    }

    /// Number of assigned variables
    #[must_use]
    pub fn len(&self) -> usize {
        self.vars.len()
    }

    /// True when no variables are assigned
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    /// Iterate variables in canonical (sorted) order
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Scalar)> {
        self.vars.iter()
    }

    /// Check that every variable of `goal` is present here with an equal value
    #[must_use]
    pub fn satisfies(&self, goal: &WorldState) -> bool {
        goal.vars
            .iter()
            .all(|(var, want)| self.vars.get(var) == Some(want))
    }

    /// Variables of `other` that differ from (or are missing in) this state
    #[must_use]
    pub fn diff(&self, other: &WorldState) -> Vec<String> {
        other
            .vars
            .iter()
            .filter(|(var, value)| self.vars.get(*var) != Some(value))
            .map(|(var, _)| var.clone())
            .collect()
    }

    /// Stable content hash over the canonically ordered assignments.
    ///
    /// Used as the A* node key and as the key half of heuristic entries.
    #[must_use]
    pub fn state_hash(&self) -> String {
        let mut hasher = Sha256::new();
        for (var, value) in &self.vars {
            hasher.update(var.as_bytes());
            hasher.update([0u8]);
            hasher.update(value.render().as_bytes());
            hasher.update([0xff]);
        }
        hex_prefix(&hasher.finalize(), 16)
    }
}

/// Render the first `n` bytes of a digest as lowercase hex
pub(crate) fn hex_prefix(digest: &[u8], n: usize) -> String {
    digest.iter().take(n).map(|b| format!("{b:02x}")).collect()
}

/// Stable fingerprint of arbitrary context text (task descriptions,
/// change summaries) used to key observations and action performance.
#[must_use]
pub fn context_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hex_prefix(&hasher.finalize(), 16)
}

// ============================================================================
// Observations
// ============================================================================

/// Terminal classification of an observed operation or task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    Success,
    Partial,
    Failure,
}

impl OutcomeKind {
    /// Scalar quality used by confidence updates: success 1.0,
    /// partial 0.5, failure 0.0.
    #[must_use]
    pub fn quality(self) -> f64 {
        match self {
            OutcomeKind::Success => 1.0,
            OutcomeKind::Partial => 0.5,
            OutcomeKind::Failure => 0.0,
        }
    }
}

impl std::fmt::Display for OutcomeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutcomeKind::Success => write!(f, "success"),
            OutcomeKind::Partial => write!(f, "partial"),
            OutcomeKind::Failure => write!(f, "failure"),
        }
    }
}

/// A single captured execution step.
///
/// Appended by the learning pipeline's `observe` and consumed by the
/// pattern extractor. Observations for one task form a happens-before
/// chain; ordering across tasks is not guaranteed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    /// Task this step belongs to
    pub task_id: TaskId,
    /// Agent that executed the step
    pub agent_id: AgentId,
    /// Operation name (becomes an action id in extracted patterns)
    pub op: String,
    /// Fingerprint of the task context
    pub context_hash: String,
    /// State before execution
    pub pre_state: WorldState,
    /// State after execution
    pub post_state: WorldState,
    /// Wall-clock duration
    pub duration_ms: u64,
    /// Step classification
    pub outcome: OutcomeKind,
    /// Capture instant
    pub timestamp: DateTime<Utc>,
}

impl Observation {
    /// A step that left the world unchanged carries no signal for
    /// extraction and is discarded by the extractor.
    #[must_use]
    pub fn is_trivial(&self) -> bool {
        self.pre_state == self.post_state
    }
}

// ============================================================================
// Worker roles
// ============================================================================

/// Role tag for coordinator workers.
///
/// Tags are informational: dispatch is by the capability set
/// (execute / vote / contribute / cancel), never by downcasting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerRole {
    Architect,
    Researcher,
    Implementer,
    Tester,
    Reviewer,
}

impl std::fmt::Display for WorkerRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerRole::Architect => write!(f, "architect"),
            WorkerRole::Researcher => write!(f, "researcher"),
            WorkerRole::Implementer => write!(f, "implementer"),
            WorkerRole::Tester => write!(f, "tester"),
            WorkerRole::Reviewer => write!(f, "reviewer"),
        }
    }
}
