//! Verification outcomes, adaptive thresholds, truth-score predictions,
//! and agent reliability reads.
//!
//! Reliability rows are written only by the recompute trigger on
//! `verification_outcomes`; this module reads them.

use libsql::Row;
use uuid::Uuid;

use swarm_core::error::{Error, Result};
use swarm_core::verification::{
    AdaptiveThreshold, AgentReliability, ReliabilityTrend, TruthPrediction, VerificationOutcome,
};

use crate::{TursoStore, millis_ts, ts_millis};

impl TursoStore {
    /// Persist a verification outcome; the reliability trigger fires in
    /// the same statement.
    pub(crate) async fn put_verification_outcome(
        &self,
        outcome: &VerificationOutcome,
    ) -> Result<()> {
        self.guard_write()?;
        let conn = self.connect().await?;
        conn.execute(
            r"
            INSERT INTO verification_outcomes
                (id, task_id, agent_id, timestamp, passed, truth_score, threshold,
                 component_scores, file_type, complexity, lines_changed, duration_ms,
                 rollback_triggered)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            ",
            libsql::params![
                outcome.id.to_string(),
                outcome.task_id.clone(),
                outcome.agent_id.clone(),
                ts_millis(outcome.timestamp),
                i64::from(outcome.passed),
                outcome.truth_score,
                outcome.threshold,
                serde_json::to_string(&outcome.component_scores)?,
                outcome.file_type.clone(),
                outcome.complexity,
                i64::from(outcome.lines_changed),
                outcome.duration_ms as i64,
                i64::from(outcome.rollback_triggered),
            ],
        )
        .await
        .map_err(|e| Error::Storage(format!("failed to store verification outcome: {e}")))?;
        Ok(())
    }

    /// Read an agent's reliability row
    pub(crate) async fn fetch_agent_reliability(
        &self,
        agent_id: &str,
    ) -> Result<Option<AgentReliability>> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                r"
                SELECT agent_id, total, success, fail, avg_truth_score, reliability,
                       trend, quarantined
                FROM agent_reliability WHERE agent_id = ?1
                ",
                libsql::params![agent_id],
            )
            .await
            .map_err(|e| Error::Storage(format!("failed to query reliability: {e}")))?;

        match rows
            .next()
            .await
            .map_err(|e| Error::Storage(format!("failed to fetch reliability row: {e}")))?
        {
            Some(row) => Ok(Some(row_to_reliability(&row)?)),
            None => Ok(None),
        }
    }

    /// Read the adaptive threshold for an (agent-type, file-type) pair
    pub(crate) async fn fetch_adaptive_threshold(
        &self,
        agent_type: &str,
        file_type: &str,
    ) -> Result<Option<AdaptiveThreshold>> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                r"
                SELECT agent_type, file_type, base_threshold, adjustment_factor,
                       samples, last_updated
                FROM adaptive_thresholds WHERE agent_type = ?1 AND file_type = ?2
                ",
                libsql::params![agent_type, file_type],
            )
            .await
            .map_err(|e| Error::Storage(format!("failed to query threshold: {e}")))?;

        match rows
            .next()
            .await
            .map_err(|e| Error::Storage(format!("failed to fetch threshold row: {e}")))?
        {
            Some(row) => Ok(Some(row_to_threshold(&row)?)),
            None => Ok(None),
        }
    }

    /// Insert or update an adaptive threshold row
    pub(crate) async fn put_adaptive_threshold(&self, threshold: &AdaptiveThreshold) -> Result<()> {
        self.guard_write()?;
        let conn = self.connect().await?;
        conn.execute(
            r"
            INSERT INTO adaptive_thresholds
                (agent_type, file_type, base_threshold, adjustment_factor, samples, last_updated)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(agent_type, file_type) DO UPDATE SET
                base_threshold = excluded.base_threshold,
                adjustment_factor = excluded.adjustment_factor,
                samples = excluded.samples,
                last_updated = excluded.last_updated
            ",
            libsql::params![
                threshold.agent_type.clone(),
                threshold.file_type.clone(),
                threshold.base_threshold,
                threshold.adjustment_factor,
                threshold.samples as i64,
                ts_millis(threshold.last_updated),
            ],
        )
        .await
        .map_err(|e| Error::Storage(format!("failed to store threshold: {e}")))?;
        Ok(())
    }

    /// Persist a truth-score prediction
    pub(crate) async fn put_truth_prediction(&self, prediction: &TruthPrediction) -> Result<()> {
        self.guard_write()?;
        let conn = self.connect().await?;
        conn.execute(
            r"
            INSERT INTO truth_score_predictions
                (id, task_id, agent_type, file_type, predicted, confidence, threshold,
                 rollback_recommended, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ",
            libsql::params![
                prediction.id.to_string(),
                prediction.task_id.clone(),
                prediction.agent_type.clone(),
                prediction.file_type.clone(),
                prediction.predicted,
                prediction.confidence,
                prediction.threshold,
                i64::from(prediction.rollback_recommended),
                ts_millis(prediction.created_at),
            ],
        )
        .await
        .map_err(|e| Error::Storage(format!("failed to store prediction: {e}")))?;
        Ok(())
    }

    /// Recent verification outcomes for an agent, newest first
    pub async fn recent_verification_outcomes(
        &self,
        agent_id: &str,
        limit: usize,
    ) -> Result<Vec<VerificationOutcome>> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                r"
                SELECT id, task_id, agent_id, timestamp, passed, truth_score, threshold,
                       component_scores, file_type, complexity, lines_changed, duration_ms,
                       rollback_triggered
                FROM verification_outcomes
                WHERE agent_id = ?1
                ORDER BY timestamp DESC
                LIMIT ?2
                ",
                libsql::params![agent_id, limit as i64],
            )
            .await
            .map_err(|e| Error::Storage(format!("failed to query outcomes: {e}")))?;

        let mut outcomes = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| Error::Storage(format!("failed to fetch outcome row: {e}")))?
        {
            outcomes.push(row_to_verification(&row)?);
        }
        Ok(outcomes)
    }
}

fn row_to_reliability(row: &Row) -> Result<AgentReliability> {
    let trend = match row.get::<String>(6).map_err(storage_err)?.as_str() {
        "improving" => ReliabilityTrend::Improving,
        "declining" => ReliabilityTrend::Declining,
        _ => ReliabilityTrend::Stable,
    };
    Ok(AgentReliability {
        agent_id: row.get::<String>(0).map_err(storage_err)?,
        total: row.get::<i64>(1).map_err(storage_err)? as u64,
        success: row.get::<i64>(2).map_err(storage_err)? as u64,
        fail: row.get::<i64>(3).map_err(storage_err)? as u64,
        avg_truth_score: row.get::<f64>(4).map_err(storage_err)?,
        reliability: row.get::<f64>(5).map_err(storage_err)?,
        trend,
        quarantined: row.get::<i64>(7).map_err(storage_err)? != 0,
    })
}

fn row_to_threshold(row: &Row) -> Result<AdaptiveThreshold> {
    Ok(AdaptiveThreshold {
        agent_type: row.get::<String>(0).map_err(storage_err)?,
        file_type: row.get::<String>(1).map_err(storage_err)?,
        base_threshold: row.get::<f64>(2).map_err(storage_err)?,
        adjustment_factor: row.get::<f64>(3).map_err(storage_err)?,
        samples: row.get::<i64>(4).map_err(storage_err)? as u64,
        last_updated: millis_ts(row.get::<i64>(5).map_err(storage_err)?),
    })
}

fn row_to_verification(row: &Row) -> Result<VerificationOutcome> {
    Ok(VerificationOutcome {
        id: Uuid::parse_str(&row.get::<String>(0).map_err(storage_err)?)
            .map_err(|e| Error::Storage(format!("bad uuid: {e}")))?,
        task_id: row.get::<String>(1).map_err(storage_err)?,
        agent_id: row.get::<String>(2).map_err(storage_err)?,
        timestamp: millis_ts(row.get::<i64>(3).map_err(storage_err)?),
        passed: row.get::<i64>(4).map_err(storage_err)? != 0,
        truth_score: row.get::<f64>(5).map_err(storage_err)?,
        threshold: row.get::<f64>(6).map_err(storage_err)?,
        component_scores: serde_json::from_str(&row.get::<String>(7).map_err(storage_err)?)?,
        file_type: row.get::<String>(8).map_err(storage_err)?,
        complexity: row.get::<f64>(9).map_err(storage_err)?,
        lines_changed: row.get::<i64>(10).map_err(storage_err)? as u32,
        duration_ms: row.get::<i64>(11).map_err(storage_err)? as u64,
        rollback_triggered: row.get::<i64>(12).map_err(storage_err)? != 0,
    })
}

fn storage_err(e: libsql::Error) -> Error {
    Error::Storage(e.to_string())
}
