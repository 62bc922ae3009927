//! Namespaced KV entries with TTL, trajectories, and the metrics log.

use chrono::Utc;

use swarm_core::error::{Error, Result};
use swarm_core::storage::TaskTrajectory;

use crate::{TursoStore, ts_millis};

impl TursoStore {
    /// Put a namespaced KV entry; TTL of `None` never expires
    pub(crate) async fn kv_put(
        &self,
        namespace: &str,
        key: &str,
        value: &str,
        ttl_secs: Option<u64>,
    ) -> Result<()> {
        self.guard_write()?;
        let now = ts_millis(Utc::now());
        let expires_at = ttl_secs.map(|ttl| now + (ttl as i64) * 1000);

        let conn = self.connect().await?;
        conn.execute(
            r"
            INSERT INTO memory_entries
                (namespace, key, value, ttl, expires_at, created_at, updated_at,
                 accessed_at, access_count)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6, ?6, 0)
            ON CONFLICT(namespace, key) DO UPDATE SET
                value = excluded.value,
                ttl = excluded.ttl,
                expires_at = excluded.expires_at,
                updated_at = excluded.updated_at
            ",
            libsql::params![
                namespace,
                key,
                value,
                ttl_secs.map(|t| t as i64),
                expires_at,
                now,
            ],
        )
        .await
        .map_err(|e| Error::Storage(format!("failed to store memory entry: {e}")))?;
        Ok(())
    }

    /// Get a namespaced KV entry; expired rows read as absent and the
    /// access accounting is bumped on hits.
    pub(crate) async fn kv_get(&self, namespace: &str, key: &str) -> Result<Option<String>> {
        let now = ts_millis(Utc::now());
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                r"
                SELECT value FROM memory_entries
                WHERE namespace = ?1 AND key = ?2
                  AND (expires_at IS NULL OR expires_at > ?3)
                ",
                libsql::params![namespace, key, now],
            )
            .await
            .map_err(|e| Error::Storage(format!("failed to query memory entry: {e}")))?;

        let value = match rows
            .next()
            .await
            .map_err(|e| Error::Storage(format!("failed to fetch memory row: {e}")))?
        {
            Some(row) => Some(
                row.get::<String>(0)
                    .map_err(|e| Error::Storage(format!("bad memory row: {e}")))?,
            ),
            None => None,
        };

        if value.is_some() && !self.is_read_only() {
            conn.execute(
                r"
                UPDATE memory_entries
                SET accessed_at = ?1, access_count = access_count + 1
                WHERE namespace = ?2 AND key = ?3
                ",
                libsql::params![now, namespace, key],
            )
            .await
            .map_err(|e| Error::Storage(format!("failed to bump access count: {e}")))?;
        }

        Ok(value)
    }

    /// Persist a task trajectory (opaque to the substrate)
    pub(crate) async fn put_trajectory(&self, trajectory: &TaskTrajectory) -> Result<()> {
        self.guard_write()?;
        let conn = self.connect().await?;
        conn.execute(
            r"
            INSERT INTO task_trajectories
                (task_id, agent_id, query, trajectory_json, started_at, ended_at,
                 judge_label, judge_conf, matts_run_id)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ON CONFLICT(task_id) DO UPDATE SET
                trajectory_json = excluded.trajectory_json,
                ended_at = excluded.ended_at,
                judge_label = excluded.judge_label,
                judge_conf = excluded.judge_conf
            ",
            libsql::params![
                trajectory.task_id.clone(),
                trajectory.agent_id.clone(),
                trajectory.query.clone(),
                trajectory.trajectory_json.clone(),
                ts_millis(trajectory.started_at),
                trajectory.ended_at.map(ts_millis),
                trajectory.judge_label.clone(),
                trajectory.judge_conf,
                trajectory.matts_run_id.clone(),
            ],
        )
        .await
        .map_err(|e| Error::Storage(format!("failed to store trajectory: {e}")))?;
        Ok(())
    }

    /// Append one sample to the metrics log
    pub(crate) async fn append_metric(
        &self,
        name: &str,
        value: f64,
        component: &str,
        tags: &str,
    ) -> Result<()> {
        self.guard_write()?;
        let conn = self.connect().await?;
        conn.execute(
            r"
            INSERT INTO metrics_log (metric_name, value, timestamp, component, tags)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ",
            libsql::params![name, value, ts_millis(Utc::now()), component, tags],
        )
        .await
        .map_err(|e| Error::Storage(format!("failed to log metric: {e}")))?;
        Ok(())
    }
}
