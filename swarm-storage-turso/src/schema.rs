//! Database schema definitions for the substrate store.
//!
//! Timestamps are unix milliseconds. The `data` column on `patterns`
//! carries the full serialized pattern; the discrete columns exist for
//! query paths and analytics views and are written in the same
//! statement.

/// SQL to create the unified patterns table.
///
/// The source system carried a second `goap_patterns` table; planner
/// patterns live here too, parameterized by `kind`. Retiring a
/// supersessor releases its predecessors: the `superseded_by` edge is
/// nulled rather than blocking the delete.
pub const CREATE_PATTERNS_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS patterns (
    id TEXT PRIMARY KEY NOT NULL,
    kind TEXT NOT NULL,
    name TEXT NOT NULL,
    data TEXT NOT NULL,
    confidence REAL NOT NULL,
    usage_count INTEGER NOT NULL DEFAULT 0,
    success_count INTEGER NOT NULL DEFAULT 0,
    failure_count INTEGER NOT NULL DEFAULT 0,
    avg_duration REAL NOT NULL DEFAULT 0,
    version INTEGER NOT NULL DEFAULT 1,
    superseded_by TEXT REFERENCES patterns(id) ON DELETE SET NULL,
    created_at INTEGER NOT NULL,
    last_used INTEGER NOT NULL,
    category TEXT NOT NULL
)
";

/// SQL to create the pattern embeddings table (one-to-one with patterns)
pub const CREATE_PATTERN_EMBEDDINGS_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS pattern_embeddings (
    pattern_id TEXT PRIMARY KEY NOT NULL REFERENCES patterns(id) ON DELETE CASCADE,
    model TEXT NOT NULL,
    dims INTEGER NOT NULL,
    vector BLOB NOT NULL,
    created_at INTEGER NOT NULL
)
";

/// SQL to create the pattern links table (explicit edge tuples)
pub const CREATE_PATTERN_LINKS_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS pattern_links (
    src TEXT NOT NULL REFERENCES patterns(id) ON DELETE CASCADE,
    dst TEXT NOT NULL REFERENCES patterns(id) ON DELETE CASCADE,
    relation TEXT NOT NULL CHECK (relation IN ('follows', 'requires', 'conflicts', 'similar')),
    weight REAL NOT NULL DEFAULT 1.0,
    created_at INTEGER NOT NULL,
    PRIMARY KEY (src, dst, relation)
)
";

/// SQL to create the task trajectories table
pub const CREATE_TASK_TRAJECTORIES_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS task_trajectories (
    task_id TEXT PRIMARY KEY NOT NULL,
    agent_id TEXT NOT NULL,
    query TEXT NOT NULL,
    trajectory_json TEXT NOT NULL,
    started_at INTEGER NOT NULL,
    ended_at INTEGER,
    judge_label TEXT,
    judge_conf REAL,
    matts_run_id TEXT
)
";

/// SQL to create the namespaced memory entries table
pub const CREATE_MEMORY_ENTRIES_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS memory_entries (
    namespace TEXT NOT NULL,
    key TEXT NOT NULL,
    value TEXT NOT NULL,
    ttl INTEGER,
    expires_at INTEGER,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    accessed_at INTEGER NOT NULL,
    access_count INTEGER NOT NULL DEFAULT 0,
    UNIQUE (namespace, key)
)
";

/// SQL to create the metrics log table
pub const CREATE_METRICS_LOG_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS metrics_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    metric_name TEXT NOT NULL,
    value REAL NOT NULL,
    timestamp INTEGER NOT NULL,
    component TEXT NOT NULL,
    tags TEXT NOT NULL DEFAULT ''
)
";

/// SQL to create the plans table
pub const CREATE_GOAP_PLANS_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS goap_plans (
    id TEXT PRIMARY KEY NOT NULL,
    task_id TEXT NOT NULL,
    actions TEXT NOT NULL,
    total_cost REAL NOT NULL,
    estimated_duration_ms INTEGER NOT NULL DEFAULT 0,
    confidence REAL NOT NULL DEFAULT 0.5,
    current_state TEXT NOT NULL,
    goal_state TEXT NOT NULL,
    constraints TEXT NOT NULL,
    method TEXT NOT NULL,
    pattern_id TEXT,
    created_at INTEGER NOT NULL,
    retired_at INTEGER
)
";

/// SQL to create the execution outcomes table.
///
/// `plan_id` is the primary key: a plan gets at most one terminal
/// outcome, enforced by the schema itself.
pub const CREATE_GOAP_EXECUTION_OUTCOMES_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS goap_execution_outcomes (
    plan_id TEXT PRIMARY KEY NOT NULL REFERENCES goap_plans(id),
    success INTEGER NOT NULL,
    achieved_goal INTEGER NOT NULL,
    actual_cost REAL NOT NULL,
    estimated_cost REAL NOT NULL,
    cost_variance REAL NOT NULL,
    duration_ms INTEGER NOT NULL,
    errors TEXT NOT NULL DEFAULT '[]',
    timestamp INTEGER NOT NULL
)
";

/// SQL to create the heuristic learning table
pub const CREATE_GOAP_HEURISTIC_LEARNING_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS goap_heuristic_learning (
    state_hash TEXT NOT NULL,
    goal_hash TEXT NOT NULL,
    estimated REAL NOT NULL,
    actual REAL NOT NULL,
    error REAL NOT NULL,
    encounters INTEGER NOT NULL DEFAULT 1,
    avg_error REAL NOT NULL,
    variance REAL NOT NULL DEFAULT 0,
    confidence REAL NOT NULL DEFAULT 0.5,
    first_seen INTEGER NOT NULL,
    last_updated INTEGER NOT NULL,
    PRIMARY KEY (state_hash, goal_hash)
)
";

/// SQL to create the per-action performance table
pub const CREATE_GOAP_ACTION_PERFORMANCE_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS goap_action_performance (
    action_id TEXT NOT NULL,
    context_hash TEXT NOT NULL,
    executions INTEGER NOT NULL DEFAULT 0,
    successes INTEGER NOT NULL DEFAULT 0,
    avg_cost REAL NOT NULL DEFAULT 0,
    updated_at INTEGER NOT NULL,
    PRIMARY KEY (action_id, context_hash)
)
";

/// SQL to create the verification outcomes table
pub const CREATE_VERIFICATION_OUTCOMES_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS verification_outcomes (
    id TEXT PRIMARY KEY NOT NULL,
    task_id TEXT NOT NULL,
    agent_id TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    passed INTEGER NOT NULL,
    truth_score REAL NOT NULL,
    threshold REAL NOT NULL,
    component_scores TEXT NOT NULL DEFAULT '{}',
    file_type TEXT NOT NULL,
    complexity REAL NOT NULL DEFAULT 0,
    lines_changed INTEGER NOT NULL DEFAULT 0,
    duration_ms INTEGER NOT NULL DEFAULT 0,
    rollback_triggered INTEGER NOT NULL DEFAULT 0
)
";

/// SQL to create the agent reliability table (maintained by trigger)
pub const CREATE_AGENT_RELIABILITY_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS agent_reliability (
    agent_id TEXT PRIMARY KEY NOT NULL,
    total INTEGER NOT NULL DEFAULT 0,
    success INTEGER NOT NULL DEFAULT 0,
    fail INTEGER NOT NULL DEFAULT 0,
    avg_truth_score REAL NOT NULL DEFAULT 0,
    reliability REAL NOT NULL DEFAULT 0,
    trend TEXT NOT NULL DEFAULT 'stable',
    quarantined INTEGER NOT NULL DEFAULT 0
)
";

/// SQL to create the truth score predictions table
pub const CREATE_TRUTH_SCORE_PREDICTIONS_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS truth_score_predictions (
    id TEXT PRIMARY KEY NOT NULL,
    task_id TEXT NOT NULL,
    agent_type TEXT NOT NULL,
    file_type TEXT NOT NULL,
    predicted REAL NOT NULL,
    confidence REAL NOT NULL,
    threshold REAL NOT NULL,
    rollback_recommended INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL
)
";

/// SQL to create the adaptive thresholds table
pub const CREATE_ADAPTIVE_THRESHOLDS_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS adaptive_thresholds (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    agent_type TEXT NOT NULL,
    file_type TEXT NOT NULL,
    base_threshold REAL NOT NULL,
    adjustment_factor REAL NOT NULL DEFAULT 0,
    samples INTEGER NOT NULL DEFAULT 0,
    last_updated INTEGER NOT NULL,
    UNIQUE (agent_type, file_type)
)
";

/// SQL to create the schema version bookkeeping table
pub const CREATE_SCHEMA_VERSION_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY NOT NULL,
    description TEXT NOT NULL,
    applied_at INTEGER NOT NULL
)
";

/// Recompute an agent's reliability row on every verification insert.
///
/// Trend compares the new score against the running average with a
/// small dead band.
pub const CREATE_AGENT_RELIABILITY_TRIGGER: &str = r"
CREATE TRIGGER IF NOT EXISTS trg_agent_reliability_recompute
AFTER INSERT ON verification_outcomes
BEGIN
    INSERT INTO agent_reliability (agent_id, total, success, fail, avg_truth_score, reliability, trend, quarantined)
    SELECT
        NEW.agent_id,
        COUNT(*),
        COALESCE(SUM(passed), 0),
        COUNT(*) - COALESCE(SUM(passed), 0),
        AVG(truth_score),
        0.7 * (CAST(COALESCE(SUM(passed), 0) AS REAL) / COUNT(*)) + 0.3 * AVG(truth_score),
        CASE
            WHEN NEW.truth_score > AVG(truth_score) + 0.02 THEN 'improving'
            WHEN NEW.truth_score < AVG(truth_score) - 0.02 THEN 'declining'
            ELSE 'stable'
        END,
        CASE
            WHEN 0.7 * (CAST(COALESCE(SUM(passed), 0) AS REAL) / COUNT(*)) + 0.3 * AVG(truth_score) < 0.3 THEN 1
            ELSE 0
        END
    FROM verification_outcomes
    WHERE agent_id = NEW.agent_id
    ON CONFLICT(agent_id) DO UPDATE SET
        total = excluded.total,
        success = excluded.success,
        fail = excluded.fail,
        avg_truth_score = excluded.avg_truth_score,
        reliability = excluded.reliability,
        trend = excluded.trend,
        quarantined = excluded.quarantined;
END
";

/// Index on patterns by kind for candidate-set reduction
pub const CREATE_PATTERNS_KIND_INDEX: &str = r"
CREATE INDEX IF NOT EXISTS idx_patterns_kind
ON patterns(kind, confidence DESC)
";

/// Index on live patterns for retrieval ranking
pub const CREATE_PATTERNS_CONFIDENCE_INDEX: &str = r"
CREATE INDEX IF NOT EXISTS idx_patterns_confidence
ON patterns(confidence DESC)
";

/// Index on plans by task for replanning lookups
pub const CREATE_GOAP_PLANS_TASK_INDEX: &str = r"
CREATE INDEX IF NOT EXISTS idx_goap_plans_task
ON goap_plans(task_id, created_at DESC)
";

/// Index on verification outcomes by agent for reliability queries
pub const CREATE_VERIFICATION_AGENT_INDEX: &str = r"
CREATE INDEX IF NOT EXISTS idx_verification_outcomes_agent
ON verification_outcomes(agent_id, timestamp DESC)
";

/// Index on the metrics log for time-ranged scrapes
pub const CREATE_METRICS_LOG_TIME_INDEX: &str = r"
CREATE INDEX IF NOT EXISTS idx_metrics_log_time
ON metrics_log(timestamp DESC)
";

/// Index on memory entries expiry for cleanup sweeps
pub const CREATE_MEMORY_ENTRIES_EXPIRY_INDEX: &str = r"
CREATE INDEX IF NOT EXISTS idx_memory_entries_expiry
ON memory_entries(expires_at)
";

/// Non-authoritative analytics view over pattern effectiveness
pub const CREATE_PATTERN_EFFECTIVENESS_VIEW: &str = r"
CREATE VIEW IF NOT EXISTS v_pattern_effectiveness AS
SELECT
    kind,
    COUNT(*) AS pattern_count,
    AVG(confidence) AS avg_confidence,
    SUM(usage_count) AS total_usage,
    AVG(CASE WHEN usage_count > 0 THEN CAST(success_count AS REAL) / usage_count ELSE 0 END) AS avg_success_rate
FROM patterns
WHERE superseded_by IS NULL
GROUP BY kind
";

/// Non-authoritative analytics view over agent reliability
pub const CREATE_AGENT_RELIABILITY_VIEW: &str = r"
CREATE VIEW IF NOT EXISTS v_agent_reliability_trend AS
SELECT
    agent_id,
    reliability,
    trend,
    total,
    CAST(success AS REAL) / MAX(total, 1) AS pass_rate
FROM agent_reliability
ORDER BY reliability DESC
";
