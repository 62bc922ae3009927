//! Ordered schema migration runner.
//!
//! Migrations are numbered batches applied in ascending order. Each
//! applied version is recorded in `schema_version`; re-running the set
//! is idempotent. A statement failing with an "already exists"
//! divergence is tolerated (the objects use `IF NOT EXISTS` anyway);
//! any other failure aborts the run.

use libsql::Connection;
use tracing::{debug, info};

use swarm_core::error::{Error, Result};

use crate::schema;

/// One numbered migration batch
pub struct Migration {
    pub version: i64,
    pub description: &'static str,
    pub statements: &'static [&'static str],
}

/// The full ordered migration set
#[must_use]
pub fn all_migrations() -> Vec<Migration> {
    vec![
        Migration {
            version: 1,
            description: "pattern store: patterns, embeddings, links",
            statements: &[
                schema::CREATE_PATTERNS_TABLE,
                schema::CREATE_PATTERN_EMBEDDINGS_TABLE,
                schema::CREATE_PATTERN_LINKS_TABLE,
                schema::CREATE_PATTERNS_KIND_INDEX,
                schema::CREATE_PATTERNS_CONFIDENCE_INDEX,
            ],
        },
        Migration {
            version: 2,
            description: "planner: plans, outcomes, heuristic learning, action performance",
            statements: &[
                schema::CREATE_GOAP_PLANS_TABLE,
                schema::CREATE_GOAP_EXECUTION_OUTCOMES_TABLE,
                schema::CREATE_GOAP_HEURISTIC_LEARNING_TABLE,
                schema::CREATE_GOAP_ACTION_PERFORMANCE_TABLE,
                schema::CREATE_GOAP_PLANS_TASK_INDEX,
            ],
        },
        Migration {
            version: 3,
            description: "verification: outcomes, reliability, predictions, thresholds",
            statements: &[
                schema::CREATE_VERIFICATION_OUTCOMES_TABLE,
                schema::CREATE_AGENT_RELIABILITY_TABLE,
                schema::CREATE_TRUTH_SCORE_PREDICTIONS_TABLE,
                schema::CREATE_ADAPTIVE_THRESHOLDS_TABLE,
                schema::CREATE_VERIFICATION_AGENT_INDEX,
                schema::CREATE_AGENT_RELIABILITY_TRIGGER,
            ],
        },
        Migration {
            version: 4,
            description: "collaborator surface: trajectories, memory entries, metrics log",
            statements: &[
                schema::CREATE_TASK_TRAJECTORIES_TABLE,
                schema::CREATE_MEMORY_ENTRIES_TABLE,
                schema::CREATE_METRICS_LOG_TABLE,
                schema::CREATE_METRICS_LOG_TIME_INDEX,
                schema::CREATE_MEMORY_ENTRIES_EXPIRY_INDEX,
            ],
        },
        Migration {
            version: 5,
            description: "analytics views",
            statements: &[
                schema::CREATE_PATTERN_EFFECTIVENESS_VIEW,
                schema::CREATE_AGENT_RELIABILITY_VIEW,
            ],
        },
    ]
}

/// Run all unapplied migrations in ascending version order.
///
/// Returns the number of batches applied this run.
///
/// # Errors
///
/// Returns [`Error::Storage`] on any non-"already exists" divergence.
pub async fn run_migrations(conn: &Connection) -> Result<u64> {
    conn.execute(schema::CREATE_SCHEMA_VERSION_TABLE, ())
        .await
        .map_err(|e| Error::Storage(format!("failed to create schema_version: {e}")))?;

    let applied = applied_versions(conn).await?;
    let mut ran = 0;

    for migration in all_migrations() {
        if applied.contains(&migration.version) {
            debug!(version = migration.version, "migration already applied, skipping");
            continue;
        }

        info!(
            version = migration.version,
            description = migration.description,
            "applying migration"
        );
        for statement in migration.statements {
            if let Err(e) = conn.execute(statement, ()).await {
                let message = e.to_string();
                if message.contains("already exists") {
                    debug!("tolerating pre-existing object: {message}");
                    continue;
                }
                return Err(Error::Storage(format!(
                    "migration {} failed: {message}",
                    migration.version
                )));
            }
        }

        conn.execute(
            "INSERT INTO schema_version (version, description, applied_at) VALUES (?1, ?2, ?3)",
            libsql::params![
                migration.version,
                migration.description,
                chrono::Utc::now().timestamp_millis()
            ],
        )
        .await
        .map_err(|e| Error::Storage(format!("failed to record migration: {e}")))?;
        ran += 1;
    }

    Ok(ran)
}

async fn applied_versions(conn: &Connection) -> Result<Vec<i64>> {
    let mut rows = conn
        .query("SELECT version FROM schema_version ORDER BY version", ())
        .await
        .map_err(|e| Error::Storage(format!("failed to read schema_version: {e}")))?;

    let mut versions = Vec::new();
    while let Some(row) = rows
        .next()
        .await
        .map_err(|e| Error::Storage(format!("failed to fetch version row: {e}")))?
    {
        versions.push(
            row.get::<i64>(0)
                .map_err(|e| Error::Storage(format!("bad version row: {e}")))?,
        );
    }
    Ok(versions)
}
