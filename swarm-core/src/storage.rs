//! # Storage Abstraction
//!
//! The store is the single source of truth: every mutation flows
//! through a [`SubstrateStore`] implementation. Backends are async so
//! both networked (libsql) and embedded (in-memory test double)
//! implementations fit behind the same trait.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::pattern::{Pattern, PatternKind};
use crate::planner::heuristic::HeuristicEntry;
use crate::planner::plan::{ExecutionOutcome, Plan};
use crate::types::{AgentId, PatternId, PlanId};
use crate::verification::{
    AdaptiveThreshold, AgentReliability, TruthPrediction, VerificationOutcome,
};

/// Relationship between two patterns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkRelation {
    Follows,
    Requires,
    Conflicts,
    Similar,
}

impl std::fmt::Display for LinkRelation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkRelation::Follows => write!(f, "follows"),
            LinkRelation::Requires => write!(f, "requires"),
            LinkRelation::Conflicts => write!(f, "conflicts"),
            LinkRelation::Similar => write!(f, "similar"),
        }
    }
}

/// A directed, weighted edge between two patterns.
///
/// Stored as explicit tuples rather than embedded references; the
/// write path rejects edges that would close a cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternLink {
    pub src: PatternId,
    pub dst: PatternId,
    pub relation: LinkRelation,
    pub weight: f64,
    pub created_at: DateTime<Utc>,
}

/// Filter for pattern queries
#[derive(Debug, Clone, Default)]
pub struct PatternQuery {
    /// Restrict to one kind
    pub kind: Option<PatternKind>,
    /// Minimum confidence
    pub min_confidence: Option<f64>,
    /// Result cap
    pub limit: Option<usize>,
    /// Include superseded patterns (default: excluded)
    pub include_superseded: bool,
}

/// A stored task trajectory (opaque to the core; consumed by analytics)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskTrajectory {
    pub task_id: String,
    pub agent_id: AgentId,
    pub query: String,
    pub trajectory_json: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub judge_label: Option<String>,
    pub judge_conf: Option<f64>,
    pub matts_run_id: Option<String>,
}

/// Unified storage backend trait.
///
/// All mutations go through the store; caches layer on top and must
/// never diverge from it. Implementations retry transient failures
/// internally and surface [`crate::Error::StoreCorrupt`] once the
/// integrity latch trips.
#[async_trait]
pub trait SubstrateStore: Send + Sync {
    // ========== Patterns ==========

    /// Insert or replace a pattern row.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Validation`] when the pattern fails its
    /// structural invariants, storage errors otherwise.
    async fn store_pattern(&self, pattern: &Pattern) -> Result<()>;

    /// Fetch a pattern by id
    async fn get_pattern(&self, id: PatternId) -> Result<Option<Pattern>>;

    /// Query patterns with filters; superseded patterns are excluded
    /// unless the query opts in
    async fn query_patterns(&self, query: &PatternQuery) -> Result<Vec<Pattern>>;

    /// All patterns, superseded included (export, index rebuild)
    async fn all_patterns(&self) -> Result<Vec<Pattern>>;

    /// Count live (non-superseded) patterns
    async fn count_patterns(&self) -> Result<u64>;

    /// Mark `old` as superseded by `new`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Validation`] when the edge would close a
    /// cycle in the supersedes graph.
    async fn supersede_pattern(&self, old: PatternId, new: PatternId) -> Result<()>;

    /// Insert a pattern link.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Validation`] when the edge would close a
    /// cycle among `follows`/`requires` links.
    async fn link_patterns(&self, link: &PatternLink) -> Result<()>;

    /// Outgoing links of a pattern
    async fn pattern_links(&self, src: PatternId) -> Result<Vec<PatternLink>>;

    /// Delete patterns matching the retirement rule; returns how many
    /// were removed
    async fn retire_patterns(&self, now: DateTime<Utc>) -> Result<u64>;

    // ========== Embeddings ==========

    /// Store an embedding for a pattern (one-to-one, replaced on write)
    async fn store_embedding(&self, id: PatternId, model: &str, vector: &[f32]) -> Result<()>;

    /// Fetch a pattern's embedding as (model, vector)
    async fn get_embedding(&self, id: PatternId) -> Result<Option<(String, Vec<f32>)>>;

    // ========== Plans & outcomes ==========

    /// Persist a plan (immutable after creation)
    async fn store_plan(&self, plan: &Plan) -> Result<()>;

    /// Fetch a plan by id
    async fn get_plan(&self, id: PlanId) -> Result<Option<Plan>>;

    /// Mark a plan retired (kept for outcome history)
    async fn retire_plan(&self, id: PlanId) -> Result<()>;

    /// Record a terminal outcome.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Validation`] when the plan already has a
    /// terminal outcome.
    async fn store_outcome(&self, outcome: &ExecutionOutcome) -> Result<()>;

    /// Outcomes recorded for a plan
    async fn outcomes_for_plan(&self, plan_id: PlanId) -> Result<Vec<ExecutionOutcome>>;

    // ========== Heuristic learning ==========

    /// Insert or update the heuristic entry for its (state, goal) pair
    async fn upsert_heuristic(&self, entry: &HeuristicEntry) -> Result<()>;

    /// Fetch the heuristic entry for a (state, goal) pair
    async fn get_heuristic(
        &self,
        state_hash: &str,
        goal_hash: &str,
    ) -> Result<Option<HeuristicEntry>>;

    /// Fold one action execution into its (action, context) performance row
    async fn record_action_performance(
        &self,
        action_id: &str,
        context_hash: &str,
        success: bool,
        cost: f64,
    ) -> Result<()>;

    // ========== Verification ==========

    /// Persist a verification outcome; implementations recompute the
    /// agent's reliability row in the same transaction (trigger)
    async fn store_verification_outcome(&self, outcome: &VerificationOutcome) -> Result<()>;

    /// Read an agent's reliability row
    async fn get_agent_reliability(&self, agent_id: &str) -> Result<Option<AgentReliability>>;

    /// Read the adaptive threshold for an (agent-type, file-type) pair
    async fn get_adaptive_threshold(
        &self,
        agent_type: &str,
        file_type: &str,
    ) -> Result<Option<AdaptiveThreshold>>;

    /// Insert or update an adaptive threshold row
    async fn upsert_adaptive_threshold(&self, threshold: &AdaptiveThreshold) -> Result<()>;

    /// Persist a truth-score prediction
    async fn store_truth_prediction(&self, prediction: &TruthPrediction) -> Result<()>;

    // ========== Trajectories, KV, metrics ==========

    /// Persist a task trajectory
    async fn store_trajectory(&self, trajectory: &TaskTrajectory) -> Result<()>;

    /// Put a namespaced KV entry with optional TTL (seconds)
    async fn memory_put(
        &self,
        namespace: &str,
        key: &str,
        value: &str,
        ttl_secs: Option<u64>,
    ) -> Result<()>;

    /// Get a namespaced KV entry; expired entries read as absent
    async fn memory_get(&self, namespace: &str, key: &str) -> Result<Option<String>>;

    /// Append a metric sample to the metrics log
    async fn log_metric(&self, name: &str, value: f64, component: &str, tags: &str) -> Result<()>;

    // ========== Health ==========

    /// Verify backend connectivity
    async fn health_check(&self) -> Result<bool>;
}

/// Hot-pattern sink implemented by the tiered cache.
///
/// The aggregator and pipeline write through the store first, then
/// notify the cache; cache absence (tests, cold start) is represented
/// by a no-op implementation.
pub trait PatternCacheSink: Send + Sync {
    /// Place a freshly approved pattern in the hot tier
    fn insert_hot(&self, pattern: &Pattern);

    /// Drop a key from every tier (called before a mutation returns)
    fn invalidate(&self, id: PatternId);

    /// Fraction of the cache's memory budget in use, when the sink
    /// tracks one. Drives the memory-pressure alert above 90%.
    fn memory_fill_fraction(&self) -> Option<f64> {
        None
    }
}

/// No-op sink for cache-less deployments
#[derive(Debug, Clone, Copy, Default)]
pub struct NullCacheSink;

impl PatternCacheSink for NullCacheSink {
    fn insert_hot(&self, _pattern: &Pattern) {}
    fn invalidate(&self, _id: PatternId) {}
}
