//! # Swarm Storage - Turso
//!
//! Turso/libSQL backend for the substrate store. The single source of
//! truth for patterns, plans, outcomes, heuristic learning, and
//! verification history.
//!
//! This crate provides:
//! - Connection management for local and remote libSQL databases
//! - An ordered, idempotent schema migration runner
//! - Typed CRUD for every substrate table
//! - The agent-reliability recompute trigger
//! - Integrity checking with a read-only corruption latch
//!
//! ## Example
//!
//! ```no_run
//! use swarm_storage_turso::TursoStore;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let store = TursoStore::open("file:substrate.db", "").await?;
//! store.initialize().await?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Builder, Connection, Database};
use tracing::{debug, error, info, warn};

use swarm_core::error::{Error, Result};
use swarm_core::pattern::Pattern;
use swarm_core::planner::heuristic::HeuristicEntry;
use swarm_core::planner::plan::{ExecutionOutcome, Plan};
use swarm_core::storage::{PatternLink, PatternQuery, SubstrateStore, TaskTrajectory};
use swarm_core::types::{PatternId, PlanId};
use swarm_core::verification::{
    AdaptiveThreshold, AgentReliability, TruthPrediction, VerificationOutcome,
};

mod memory_kv;
mod migrations;
mod patterns;
mod plans;
mod schema;
mod verification;

pub use migrations::{Migration, all_migrations, run_migrations};

/// Configuration for the Turso store
#[derive(Debug, Clone)]
pub struct TursoConfig {
    /// Maximum retry attempts for failed statements
    pub max_retries: u32,
    /// Base delay for exponential backoff (milliseconds)
    pub retry_base_delay_ms: u64,
    /// Maximum delay for exponential backoff (milliseconds)
    pub retry_max_delay_ms: u64,
}

impl Default for TursoConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_base_delay_ms: 50,
            retry_max_delay_ms: 5000,
        }
    }
}

/// Turso/libSQL substrate store
pub struct TursoStore {
    db: Arc<Database>,
    config: TursoConfig,
    /// Latched by a failed integrity check; writes refuse until restore
    read_only: AtomicBool,
}

impl TursoStore {
    /// Open a store at the given URL.
    ///
    /// Only `libsql://` (remote, token required), `file:`, and
    /// `:memory:` URLs are accepted; anything else is rejected before a
    /// connection is attempted.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] for insecure URLs and
    /// [`Error::Storage`] on connection failure.
    pub async fn open(url: &str, token: &str) -> Result<Self> {
        Self::open_with_config(url, token, TursoConfig::default()).await
    }

    /// [`Self::open`] with explicit configuration
    pub async fn open_with_config(url: &str, token: &str, config: TursoConfig) -> Result<Self> {
        info!("connecting to substrate store at {url}");

        if !url.starts_with("libsql://") && !url.starts_with("file:") && !url.starts_with(":memory:")
        {
            return Err(Error::Validation(format!(
                "insecure database URL: {url}; only libsql://, file:, or :memory: are allowed"
            )));
        }
        if url.starts_with("libsql://") && token.trim().is_empty() {
            return Err(Error::Validation(
                "authentication token required for remote connections".to_string(),
            ));
        }

        let db = if url.starts_with("libsql://") {
            Builder::new_remote(url.to_string(), token.to_string())
                .build()
                .await
                .map_err(|e| Error::Storage(format!("failed to connect: {e}")))?
        } else {
            let path = url.strip_prefix("file:").unwrap_or(url);
            Builder::new_local(path)
                .build()
                .await
                .map_err(|e| Error::Storage(format!("failed to connect: {e}")))?
        };

        Ok(Self {
            db: Arc::new(db),
            config,
            read_only: AtomicBool::new(false),
        })
    }

    /// Wrap an already-built database (tests, embedded deployments)
    ///
    /// # Errors
    ///
    /// Infallible today; kept fallible for parity with `open`.
    pub fn from_database(db: Database) -> Result<Self> {
        Ok(Self {
            db: Arc::new(db),
            config: TursoConfig::default(),
            read_only: AtomicBool::new(false),
        })
    }

    /// Run migrations, set pragmas, and verify integrity.
    ///
    /// Safe to call multiple times; already-applied migrations are
    /// skipped.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StoreCorrupt`] when the post-migration
    /// integrity check fails (the store latches read-only).
    pub async fn initialize(&self) -> Result<()> {
        let conn = self.connect().await?;

        // Durability pragmas: WAL journaling with NORMAL sync
        for pragma in [
            "PRAGMA journal_mode = WAL",
            "PRAGMA synchronous = NORMAL",
        ] {
            if let Err(e) = conn.query(pragma, ()).await {
                // Remote/embedded replicas may not expose every pragma
                debug!("pragma ignored: {e}");
            }
        }

        let applied = run_migrations(&conn).await?;
        if applied > 0 {
            info!(applied, "schema migrations applied");
        }

        self.integrity_check().await?;
        info!("substrate store initialized");
        Ok(())
    }

    /// Run the integrity check; a failure latches the store read-only.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StoreCorrupt`] on failure; callers must not
    /// attempt writes until an operator-initiated restore.
    pub async fn integrity_check(&self) -> Result<()> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query("PRAGMA integrity_check", ())
            .await
            .map_err(|e| Error::Storage(format!("integrity check query failed: {e}")))?;

        let verdict = match rows
            .next()
            .await
            .map_err(|e| Error::Storage(format!("integrity check fetch failed: {e}")))?
        {
            Some(row) => row
                .get::<String>(0)
                .map_err(|e| Error::Storage(format!("integrity check row: {e}")))?,
            None => "no result".to_string(),
        };

        if verdict.eq_ignore_ascii_case("ok") {
            Ok(())
        } else {
            self.read_only.store(true, Ordering::SeqCst);
            error!("integrity check failed: {verdict}; store is now read-only");
            Err(Error::StoreCorrupt(verdict))
        }
    }

    /// Whether the corruption latch has tripped
    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::SeqCst)
    }

    /// Open a connection with per-connection pragmas applied
    pub(crate) async fn connect(&self) -> Result<Connection> {
        let conn = self
            .db
            .connect()
            .map_err(|e| Error::Storage(format!("failed to open connection: {e}")))?;

        // Foreign keys are per-connection in SQLite lineage
        if let Err(e) = conn.execute("PRAGMA foreign_keys = ON", ()).await {
            debug!("foreign_keys pragma ignored: {e}");
        }
        Ok(conn)
    }

    /// Refuse writes while the corruption latch is set
    pub(crate) fn guard_write(&self) -> Result<()> {
        if self.is_read_only() {
            Err(Error::StoreCorrupt(
                "store is read-only after integrity failure".to_string(),
            ))
        } else {
            Ok(())
        }
    }

    /// Execute a parameterless statement with exponential backoff
    pub(crate) async fn execute_with_retry(&self, conn: &Connection, sql: &str) -> Result<()> {
        let mut attempts = 0;
        let mut delay = Duration::from_millis(self.config.retry_base_delay_ms);

        loop {
            match conn.execute(sql, ()).await {
                Ok(_) => {
                    if attempts > 0 {
                        debug!("SQL succeeded after {attempts} retries");
                    }
                    return Ok(());
                }
                Err(e) => {
                    attempts += 1;
                    if attempts >= self.config.max_retries {
                        error!("SQL failed after {attempts} attempts: {e}");
                        return Err(Error::Storage(format!(
                            "SQL execution failed after {attempts} retries: {e}"
                        )));
                    }
                    warn!("SQL attempt {attempts} failed: {e}, retrying...");
                    tokio::time::sleep(delay).await;
                    delay = std::cmp::min(
                        delay * 2,
                        Duration::from_millis(self.config.retry_max_delay_ms),
                    );
                }
            }
        }
    }

    /// Health check: verify database connectivity
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] when the probe query cannot run.
    pub async fn health_probe(&self) -> Result<bool> {
        let conn = self.connect().await?;
        match conn.query("SELECT 1", ()).await {
            Ok(_) => Ok(true),
            Err(e) => {
                warn!("health check failed: {e}");
                Ok(false)
            }
        }
    }
}

/// Timestamp encoding shared by every table: unix milliseconds
pub(crate) fn ts_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

/// Decode a unix-millisecond column back to an instant
pub(crate) fn millis_ts(millis: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(millis).unwrap_or_else(Utc::now)
}

/// Encode an embedding vector as little-endian f32 bytes
pub(crate) fn vector_to_blob(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|v| v.to_le_bytes()).collect()
}

/// Decode an embedding blob
pub(crate) fn blob_to_vector(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

#[async_trait]
impl SubstrateStore for TursoStore {
    async fn store_pattern(&self, pattern: &Pattern) -> Result<()> {
        self.put_pattern(pattern).await
    }

    async fn get_pattern(&self, id: PatternId) -> Result<Option<Pattern>> {
        self.fetch_pattern(id).await
    }

    async fn query_patterns(&self, query: &PatternQuery) -> Result<Vec<Pattern>> {
        self.filter_patterns(query).await
    }

    async fn all_patterns(&self) -> Result<Vec<Pattern>> {
        self.filter_patterns(&PatternQuery {
            include_superseded: true,
            ..PatternQuery::default()
        })
        .await
    }

    async fn count_patterns(&self) -> Result<u64> {
        self.live_pattern_count().await
    }

    async fn supersede_pattern(&self, old: PatternId, new: PatternId) -> Result<()> {
        self.mark_superseded(old, new).await
    }

    async fn link_patterns(&self, link: &PatternLink) -> Result<()> {
        self.insert_link(link).await
    }

    async fn pattern_links(&self, src: PatternId) -> Result<Vec<PatternLink>> {
        self.links_from(src).await
    }

    async fn retire_patterns(&self, now: DateTime<Utc>) -> Result<u64> {
        self.sweep_retirable(now).await
    }

    async fn store_embedding(&self, id: PatternId, model: &str, vector: &[f32]) -> Result<()> {
        self.put_embedding(id, model, vector).await
    }

    async fn get_embedding(&self, id: PatternId) -> Result<Option<(String, Vec<f32>)>> {
        self.fetch_embedding(id).await
    }

    async fn store_plan(&self, plan: &Plan) -> Result<()> {
        self.put_plan(plan).await
    }

    async fn get_plan(&self, id: PlanId) -> Result<Option<Plan>> {
        self.fetch_plan(id).await
    }

    async fn retire_plan(&self, id: PlanId) -> Result<()> {
        self.mark_plan_retired(id).await
    }

    async fn store_outcome(&self, outcome: &ExecutionOutcome) -> Result<()> {
        self.put_outcome(outcome).await
    }

    async fn outcomes_for_plan(&self, plan_id: PlanId) -> Result<Vec<ExecutionOutcome>> {
        self.fetch_outcomes(plan_id).await
    }

    async fn upsert_heuristic(&self, entry: &HeuristicEntry) -> Result<()> {
        self.put_heuristic(entry).await
    }

    async fn get_heuristic(
        &self,
        state_hash: &str,
        goal_hash: &str,
    ) -> Result<Option<HeuristicEntry>> {
        self.fetch_heuristic(state_hash, goal_hash).await
    }

    async fn record_action_performance(
        &self,
        action_id: &str,
        context_hash: &str,
        success: bool,
        cost: f64,
    ) -> Result<()> {
        self.fold_action_performance(action_id, context_hash, success, cost)
            .await
    }

    async fn store_verification_outcome(&self, outcome: &VerificationOutcome) -> Result<()> {
        self.put_verification_outcome(outcome).await
    }

    async fn get_agent_reliability(&self, agent_id: &str) -> Result<Option<AgentReliability>> {
        self.fetch_agent_reliability(agent_id).await
    }

    async fn get_adaptive_threshold(
        &self,
        agent_type: &str,
        file_type: &str,
    ) -> Result<Option<AdaptiveThreshold>> {
        self.fetch_adaptive_threshold(agent_type, file_type).await
    }

    async fn upsert_adaptive_threshold(&self, threshold: &AdaptiveThreshold) -> Result<()> {
        self.put_adaptive_threshold(threshold).await
    }

    async fn store_truth_prediction(&self, prediction: &TruthPrediction) -> Result<()> {
        self.put_truth_prediction(prediction).await
    }

    async fn store_trajectory(&self, trajectory: &TaskTrajectory) -> Result<()> {
        self.put_trajectory(trajectory).await
    }

    async fn memory_put(
        &self,
        namespace: &str,
        key: &str,
        value: &str,
        ttl_secs: Option<u64>,
    ) -> Result<()> {
        self.kv_put(namespace, key, value, ttl_secs).await
    }

    async fn memory_get(&self, namespace: &str, key: &str) -> Result<Option<String>> {
        self.kv_get(namespace, key).await
    }

    async fn log_metric(&self, name: &str, value: f64, component: &str, tags: &str) -> Result<()> {
        self.append_metric(name, value, component, tags).await
    }

    async fn health_check(&self) -> Result<bool> {
        self.health_probe().await
    }
}
