//! Plans, execution outcomes, heuristic learning, and per-action
//! performance.
//!
//! `goap_execution_outcomes` keys on `plan_id`, so the single-terminal
//! invariant is enforced by the schema; the insert maps the conflict to
//! a validation error rather than silently rewriting history.

use chrono::Utc;
use libsql::Row;
use tracing::debug;
use uuid::Uuid;

use swarm_core::error::{Error, Result};
use swarm_core::planner::heuristic::HeuristicEntry;
use swarm_core::planner::plan::{ExecutionOutcome, Plan, PlanConstraints, PlanMethod};
use swarm_core::types::{PlanId, WorldState};

use crate::{TursoStore, millis_ts, ts_millis};

impl TursoStore {
    /// Persist a plan (immutable after creation)
    pub(crate) async fn put_plan(&self, plan: &Plan) -> Result<()> {
        self.guard_write()?;
        let conn = self.connect().await?;
        conn.execute(
            r"
            INSERT INTO goap_plans
                (id, task_id, actions, total_cost, estimated_duration_ms, confidence,
                 current_state, goal_state, constraints, method, pattern_id, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            ",
            libsql::params![
                plan.id.to_string(),
                plan.task_id.clone(),
                serde_json::to_string(&plan.actions)?,
                plan.total_cost,
                plan.estimated_duration_ms as i64,
                plan.confidence,
                serde_json::to_string(&plan.current_state)?,
                serde_json::to_string(&plan.goal_state)?,
                serde_json::to_string(&plan.constraints)?,
                plan.method.to_string(),
                plan.pattern_id.map(|id| id.to_string()),
                ts_millis(plan.created_at),
            ],
        )
        .await
        .map_err(|e| Error::Storage(format!("failed to store plan: {e}")))?;

        debug!(plan_id = %plan.id, "plan stored");
        Ok(())
    }

    /// Fetch a plan by id
    pub(crate) async fn fetch_plan(&self, id: PlanId) -> Result<Option<Plan>> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                r"
                SELECT id, task_id, actions, total_cost, estimated_duration_ms, confidence,
                       current_state, goal_state, constraints, method, pattern_id, created_at
                FROM goap_plans WHERE id = ?1
                ",
                libsql::params![id.to_string()],
            )
            .await
            .map_err(|e| Error::Storage(format!("failed to query plan: {e}")))?;

        match rows
            .next()
            .await
            .map_err(|e| Error::Storage(format!("failed to fetch plan row: {e}")))?
        {
            Some(row) => Ok(Some(row_to_plan(&row)?)),
            None => Ok(None),
        }
    }

    /// Mark a plan retired; the row and its outcomes stay on record
    pub(crate) async fn mark_plan_retired(&self, id: PlanId) -> Result<()> {
        self.guard_write()?;
        let conn = self.connect().await?;
        let changed = conn
            .execute(
                "UPDATE goap_plans SET retired_at = ?1 WHERE id = ?2 AND retired_at IS NULL",
                libsql::params![ts_millis(Utc::now()), id.to_string()],
            )
            .await
            .map_err(|e| Error::Storage(format!("failed to retire plan: {e}")))?;

        if changed == 0 {
            // Either unknown or already retired; only the former is an error
            if self.fetch_plan(id).await?.is_none() {
                return Err(Error::NotFound(id));
            }
        }
        Ok(())
    }

    /// Record a terminal outcome; a second terminal for the same plan
    /// is a validation error.
    pub(crate) async fn put_outcome(&self, outcome: &ExecutionOutcome) -> Result<()> {
        self.guard_write()?;
        let conn = self.connect().await?;
        let result = conn
            .execute(
                r"
                INSERT INTO goap_execution_outcomes
                    (plan_id, success, achieved_goal, actual_cost, estimated_cost,
                     cost_variance, duration_ms, errors, timestamp)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                ",
                libsql::params![
                    outcome.plan_id.to_string(),
                    i64::from(outcome.success),
                    i64::from(outcome.achieved_goal),
                    outcome.actual_cost,
                    outcome.estimated_cost,
                    outcome.cost_variance(),
                    outcome.duration_ms as i64,
                    serde_json::to_string(&outcome.errors)?,
                    ts_millis(outcome.timestamp),
                ],
            )
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if e.to_string().contains("UNIQUE") || e.to_string().contains("PRIMARY") => {
                Err(Error::Validation(format!(
                    "plan {} already has a terminal outcome",
                    outcome.plan_id
                )))
            }
            Err(e) => Err(Error::Storage(format!("failed to store outcome: {e}"))),
        }
    }

    /// Outcomes recorded for a plan (at most one today; vector-shaped
    /// for forward compatibility with partial outcome capture)
    pub(crate) async fn fetch_outcomes(&self, plan_id: PlanId) -> Result<Vec<ExecutionOutcome>> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                r"
                SELECT plan_id, success, achieved_goal, actual_cost, estimated_cost,
                       duration_ms, errors, timestamp
                FROM goap_execution_outcomes WHERE plan_id = ?1
                ",
                libsql::params![plan_id.to_string()],
            )
            .await
            .map_err(|e| Error::Storage(format!("failed to query outcomes: {e}")))?;

        let mut outcomes = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| Error::Storage(format!("failed to fetch outcome row: {e}")))?
        {
            outcomes.push(row_to_outcome(&row)?);
        }
        Ok(outcomes)
    }

    /// Insert or update a heuristic entry for its (state, goal) pair
    pub(crate) async fn put_heuristic(&self, entry: &HeuristicEntry) -> Result<()> {
        self.guard_write()?;
        let conn = self.connect().await?;
        conn.execute(
            r"
            INSERT INTO goap_heuristic_learning
                (state_hash, goal_hash, estimated, actual, error, encounters,
                 avg_error, variance, confidence, first_seen, last_updated)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            ON CONFLICT(state_hash, goal_hash) DO UPDATE SET
                estimated = excluded.estimated,
                actual = excluded.actual,
                error = excluded.error,
                encounters = excluded.encounters,
                avg_error = excluded.avg_error,
                variance = excluded.variance,
                confidence = excluded.confidence,
                last_updated = excluded.last_updated
            ",
            libsql::params![
                entry.state_hash.clone(),
                entry.goal_hash.clone(),
                entry.estimated,
                entry.actual,
                entry.error,
                entry.encounters as i64,
                entry.avg_error,
                entry.variance,
                entry.confidence,
                ts_millis(entry.first_seen),
                ts_millis(entry.last_updated),
            ],
        )
        .await
        .map_err(|e| Error::Storage(format!("failed to store heuristic: {e}")))?;
        Ok(())
    }

    /// Fetch the heuristic entry for a (state, goal) pair
    pub(crate) async fn fetch_heuristic(
        &self,
        state_hash: &str,
        goal_hash: &str,
    ) -> Result<Option<HeuristicEntry>> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                r"
                SELECT state_hash, goal_hash, estimated, actual, error, encounters,
                       avg_error, variance, confidence, first_seen, last_updated
                FROM goap_heuristic_learning WHERE state_hash = ?1 AND goal_hash = ?2
                ",
                libsql::params![state_hash, goal_hash],
            )
            .await
            .map_err(|e| Error::Storage(format!("failed to query heuristic: {e}")))?;

        match rows
            .next()
            .await
            .map_err(|e| Error::Storage(format!("failed to fetch heuristic row: {e}")))?
        {
            Some(row) => Ok(Some(row_to_heuristic(&row)?)),
            None => Ok(None),
        }
    }

    /// Fold one execution into its (action, context) performance row
    pub(crate) async fn fold_action_performance(
        &self,
        action_id: &str,
        context_hash: &str,
        success: bool,
        cost: f64,
    ) -> Result<()> {
        self.guard_write()?;
        let conn = self.connect().await?;
        conn.execute(
            r"
            INSERT INTO goap_action_performance
                (action_id, context_hash, executions, successes, avg_cost, updated_at)
            VALUES (?1, ?2, 1, ?3, ?4, ?5)
            ON CONFLICT(action_id, context_hash) DO UPDATE SET
                executions = executions + 1,
                successes = successes + ?3,
                avg_cost = (avg_cost * executions + ?4) / (executions + 1),
                updated_at = ?5
            ",
            libsql::params![
                action_id,
                context_hash,
                i64::from(success),
                cost,
                ts_millis(Utc::now()),
            ],
        )
        .await
        .map_err(|e| Error::Storage(format!("failed to record action performance: {e}")))?;
        Ok(())
    }
}

fn row_to_plan(row: &Row) -> Result<Plan> {
    let id = parse_uuid(&row.get::<String>(0).map_err(storage_err)?)?;
    let actions: Vec<String> =
        serde_json::from_str(&row.get::<String>(2).map_err(storage_err)?)?;
    let current_state: WorldState =
        serde_json::from_str(&row.get::<String>(6).map_err(storage_err)?)?;
    let goal_state: WorldState =
        serde_json::from_str(&row.get::<String>(7).map_err(storage_err)?)?;
    let constraints: PlanConstraints =
        serde_json::from_str(&row.get::<String>(8).map_err(storage_err)?)?;
    let method = match row.get::<String>(9).map_err(storage_err)?.as_str() {
        "a-star" => PlanMethod::AStar,
        "pattern-reuse" => PlanMethod::PatternReuse,
        "hybrid" => PlanMethod::Hybrid,
        other => return Err(Error::Storage(format!("unknown plan method '{other}'"))),
    };

    Ok(Plan {
        id,
        task_id: row.get::<String>(1).map_err(storage_err)?,
        actions,
        total_cost: row.get::<f64>(3).map_err(storage_err)?,
        estimated_duration_ms: row.get::<i64>(4).map_err(storage_err)? as u64,
        confidence: row.get::<f64>(5).map_err(storage_err)?,
        current_state,
        goal_state,
        constraints,
        method,
        pattern_id: {
            let raw: Option<String> = row.get(10).ok();
            raw.and_then(|s| Uuid::parse_str(&s).ok())
        },
        created_at: millis_ts(row.get::<i64>(11).map_err(storage_err)?),
    })
}

fn row_to_outcome(row: &Row) -> Result<ExecutionOutcome> {
    Ok(ExecutionOutcome {
        plan_id: parse_uuid(&row.get::<String>(0).map_err(storage_err)?)?,
        success: row.get::<i64>(1).map_err(storage_err)? != 0,
        achieved_goal: row.get::<i64>(2).map_err(storage_err)? != 0,
        actual_cost: row.get::<f64>(3).map_err(storage_err)?,
        estimated_cost: row.get::<f64>(4).map_err(storage_err)?,
        duration_ms: row.get::<i64>(5).map_err(storage_err)? as u64,
        errors: serde_json::from_str(&row.get::<String>(6).map_err(storage_err)?)?,
        timestamp: millis_ts(row.get::<i64>(7).map_err(storage_err)?),
    })
}

fn row_to_heuristic(row: &Row) -> Result<HeuristicEntry> {
    Ok(HeuristicEntry {
        state_hash: row.get::<String>(0).map_err(storage_err)?,
        goal_hash: row.get::<String>(1).map_err(storage_err)?,
        estimated: row.get::<f64>(2).map_err(storage_err)?,
        actual: row.get::<f64>(3).map_err(storage_err)?,
        error: row.get::<f64>(4).map_err(storage_err)?,
        encounters: row.get::<i64>(5).map_err(storage_err)? as u64,
        avg_error: row.get::<f64>(6).map_err(storage_err)?,
        variance: row.get::<f64>(7).map_err(storage_err)?,
        confidence: row.get::<f64>(8).map_err(storage_err)?,
        first_seen: millis_ts(row.get::<i64>(9).map_err(storage_err)?),
        last_updated: millis_ts(row.get::<i64>(10).map_err(storage_err)?),
    })
}

fn parse_uuid(text: &str) -> Result<Uuid> {
    Uuid::parse_str(text).map_err(|e| Error::Storage(format!("bad uuid '{text}': {e}")))
}

fn storage_err(e: libsql::Error) -> Error {
    Error::Storage(e.to_string())
}
