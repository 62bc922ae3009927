//! Pattern CRUD, supersede/link graph writes, and embedding storage.
//!
//! The `data` column carries the full serialized pattern; discrete
//! columns mirror the fields the query paths and analytics views need.
//! Graph writes (supersede, follows/requires links) run a reachability
//! check first and reject edges that would close a cycle.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Duration, Utc};
use libsql::Row;
use tracing::{debug, info};
use uuid::Uuid;

use swarm_core::error::{Error, Result};
use swarm_core::pattern::Pattern;
use swarm_core::storage::{LinkRelation, PatternLink, PatternQuery};
use swarm_core::types::PatternId;

use crate::{TursoStore, blob_to_vector, millis_ts, ts_millis, vector_to_blob};

/// Retirement rule bounds (mirrors `Pattern::is_retirable`)
const RETIRE_CONFIDENCE: f64 = 0.3;
const RETIRE_MAX_USAGE: i64 = 5;
const RETIRE_AGE_DAYS: i64 = 30;

impl TursoStore {
    /// Insert or replace a pattern row
    pub(crate) async fn put_pattern(&self, pattern: &Pattern) -> Result<()> {
        self.guard_write()?;
        pattern.validate()?;

        let data = serde_json::to_string(pattern)?;
        let conn = self.connect().await?;
        conn.execute(
            r"
            INSERT INTO patterns
                (id, kind, name, data, confidence, usage_count, success_count,
                 failure_count, avg_duration, version, superseded_by, created_at,
                 last_used, category)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
            ON CONFLICT(id) DO UPDATE SET
                kind = excluded.kind,
                name = excluded.name,
                data = excluded.data,
                confidence = excluded.confidence,
                usage_count = excluded.usage_count,
                success_count = excluded.success_count,
                failure_count = excluded.failure_count,
                avg_duration = excluded.avg_duration,
                version = excluded.version,
                superseded_by = excluded.superseded_by,
                last_used = excluded.last_used,
                category = excluded.category
            ",
            libsql::params![
                pattern.id.to_string(),
                pattern.kind.to_string(),
                pattern.name.clone(),
                data,
                pattern.confidence,
                pattern.usage_count as i64,
                pattern.metrics.success as i64,
                pattern.metrics.failure as i64,
                pattern.metrics.avg_duration_ms,
                i64::from(pattern.version),
                pattern.superseded_by.map(|id| id.to_string()),
                ts_millis(pattern.created),
                ts_millis(pattern.last_used),
                pattern.kind.to_string(),
            ],
        )
        .await
        .map_err(|e| Error::Storage(format!("failed to store pattern: {e}")))?;

        debug!(pattern_id = %pattern.id, "pattern stored");
        Ok(())
    }

    /// Fetch a pattern by id
    pub(crate) async fn fetch_pattern(&self, id: PatternId) -> Result<Option<Pattern>> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                "SELECT data, superseded_by FROM patterns WHERE id = ?1",
                libsql::params![id.to_string()],
            )
            .await
            .map_err(|e| Error::Storage(format!("failed to query pattern: {e}")))?;

        match rows
            .next()
            .await
            .map_err(|e| Error::Storage(format!("failed to fetch pattern row: {e}")))?
        {
            Some(row) => Ok(Some(row_to_pattern(&row)?)),
            None => Ok(None),
        }
    }

    /// Query patterns with filters, ranked by confidence
    pub(crate) async fn filter_patterns(&self, query: &PatternQuery) -> Result<Vec<Pattern>> {
        let mut sql = String::from("SELECT data, superseded_by FROM patterns WHERE 1=1");
        let mut params: Vec<libsql::Value> = Vec::new();

        if !query.include_superseded {
            sql.push_str(" AND superseded_by IS NULL");
        }
        if let Some(kind) = query.kind {
            params.push(libsql::Value::Text(kind.to_string()));
            sql.push_str(&format!(" AND kind = ?{}", params.len()));
        }
        if let Some(min) = query.min_confidence {
            params.push(libsql::Value::Real(min));
            sql.push_str(&format!(" AND confidence >= ?{}", params.len()));
        }
        sql.push_str(" ORDER BY confidence DESC");
        if let Some(limit) = query.limit {
            params.push(libsql::Value::Integer(limit as i64));
            sql.push_str(&format!(" LIMIT ?{}", params.len()));
        }

        let conn = self.connect().await?;
        let mut rows = conn
            .query(&sql, libsql::params_from_iter(params))
            .await
            .map_err(|e| Error::Storage(format!("failed to query patterns: {e}")))?;

        let mut patterns = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| Error::Storage(format!("failed to fetch pattern row: {e}")))?
        {
            patterns.push(row_to_pattern(&row)?);
        }
        Ok(patterns)
    }

    /// Count live (non-superseded) patterns
    pub(crate) async fn live_pattern_count(&self) -> Result<u64> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                "SELECT COUNT(*) FROM patterns WHERE superseded_by IS NULL",
                (),
            )
            .await
            .map_err(|e| Error::Storage(format!("failed to count patterns: {e}")))?;

        match rows
            .next()
            .await
            .map_err(|e| Error::Storage(format!("failed to fetch count: {e}")))?
        {
            Some(row) => Ok(row
                .get::<i64>(0)
                .map_err(|e| Error::Storage(format!("bad count row: {e}")))? as u64),
            None => Ok(0),
        }
    }

    /// Mark `old` superseded by `new`, rejecting cycles.
    ///
    /// The supersedes graph must stay a DAG; the check walks the
    /// existing chain from `new` before writing.
    pub(crate) async fn mark_superseded(&self, old: PatternId, new: PatternId) -> Result<()> {
        self.guard_write()?;
        if old == new {
            return Err(Error::Validation(format!("pattern {old} cannot supersede itself")));
        }

        // Walk superseded_by from `new`; reaching `old` closes a cycle
        let conn = self.connect().await?;
        let mut cursor = Some(new);
        let mut seen = HashSet::new();
        while let Some(id) = cursor {
            if id == old {
                return Err(Error::Validation(format!(
                    "supersede edge {old} -> {new} would close a cycle"
                )));
            }
            if !seen.insert(id) {
                break;
            }
            let mut rows = conn
                .query(
                    "SELECT superseded_by FROM patterns WHERE id = ?1",
                    libsql::params![id.to_string()],
                )
                .await
                .map_err(|e| Error::Storage(format!("failed to walk supersedes: {e}")))?;
            cursor = match rows
                .next()
                .await
                .map_err(|e| Error::Storage(format!("failed to fetch supersede row: {e}")))?
            {
                Some(row) => {
                    let next: Option<String> = row.get(0).ok();
                    next.and_then(|s| Uuid::parse_str(&s).ok())
                }
                None => None,
            };
        }

        // Rewrite the stored JSON alongside the column so reads stay consistent
        let Some(mut pattern) = self.fetch_pattern(old).await? else {
            return Err(Error::NotFound(old));
        };
        pattern.superseded_by = Some(new);
        pattern.version += 1;
        self.put_pattern(&pattern).await?;

        info!(old = %old, new = %new, "pattern superseded");
        Ok(())
    }

    /// Insert a link edge, rejecting follows/requires cycles
    pub(crate) async fn insert_link(&self, link: &PatternLink) -> Result<()> {
        self.guard_write()?;
        if link.src == link.dst {
            return Err(Error::Validation(format!(
                "pattern {} cannot link to itself",
                link.src
            )));
        }

        if matches!(link.relation, LinkRelation::Follows | LinkRelation::Requires) {
            let edges = self.ordered_link_edges().await?;
            if reaches(&edges, link.dst, link.src) {
                return Err(Error::Validation(format!(
                    "link {} -> {} ({}) would close a cycle",
                    link.src, link.dst, link.relation
                )));
            }
        }

        let conn = self.connect().await?;
        conn.execute(
            r"
            INSERT INTO pattern_links (src, dst, relation, weight, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(src, dst, relation) DO UPDATE SET weight = excluded.weight
            ",
            libsql::params![
                link.src.to_string(),
                link.dst.to_string(),
                link.relation.to_string(),
                link.weight,
                ts_millis(link.created_at),
            ],
        )
        .await
        .map_err(|e| Error::Storage(format!("failed to store link: {e}")))?;
        Ok(())
    }

    /// Outgoing links of a pattern
    pub(crate) async fn links_from(&self, src: PatternId) -> Result<Vec<PatternLink>> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                "SELECT src, dst, relation, weight, created_at FROM pattern_links WHERE src = ?1",
                libsql::params![src.to_string()],
            )
            .await
            .map_err(|e| Error::Storage(format!("failed to query links: {e}")))?;

        let mut links = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| Error::Storage(format!("failed to fetch link row: {e}")))?
        {
            links.push(row_to_link(&row)?);
        }
        Ok(links)
    }

    /// Delete patterns matching the retirement rule
    pub(crate) async fn sweep_retirable(&self, now: DateTime<Utc>) -> Result<u64> {
        self.guard_write()?;
        let age_cutoff = ts_millis(now - Duration::days(RETIRE_AGE_DAYS));

        let conn = self.connect().await?;
        let removed = conn
            .execute(
                r"
                DELETE FROM patterns
                WHERE confidence < ?1 AND usage_count < ?2 AND created_at < ?3
                ",
                libsql::params![RETIRE_CONFIDENCE, RETIRE_MAX_USAGE, age_cutoff],
            )
            .await
            .map_err(|e| Error::Storage(format!("retirement sweep failed: {e}")))?;

        if removed > 0 {
            info!(removed, "patterns retired");
        }
        Ok(removed)
    }

    /// Insert or replace a pattern's embedding
    pub(crate) async fn put_embedding(
        &self,
        id: PatternId,
        model: &str,
        vector: &[f32],
    ) -> Result<()> {
        self.guard_write()?;
        let conn = self.connect().await?;
        conn.execute(
            r"
            INSERT INTO pattern_embeddings (pattern_id, model, dims, vector, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(pattern_id) DO UPDATE SET
                model = excluded.model,
                dims = excluded.dims,
                vector = excluded.vector,
                created_at = excluded.created_at
            ",
            libsql::params![
                id.to_string(),
                model,
                vector.len() as i64,
                vector_to_blob(vector),
                ts_millis(Utc::now()),
            ],
        )
        .await
        .map_err(|e| Error::Storage(format!("failed to store embedding: {e}")))?;
        Ok(())
    }

    /// Fetch a pattern's embedding as (model, vector)
    pub(crate) async fn fetch_embedding(
        &self,
        id: PatternId,
    ) -> Result<Option<(String, Vec<f32>)>> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                "SELECT model, vector FROM pattern_embeddings WHERE pattern_id = ?1",
                libsql::params![id.to_string()],
            )
            .await
            .map_err(|e| Error::Storage(format!("failed to query embedding: {e}")))?;

        match rows
            .next()
            .await
            .map_err(|e| Error::Storage(format!("failed to fetch embedding row: {e}")))?
        {
            Some(row) => {
                let model = row
                    .get::<String>(0)
                    .map_err(|e| Error::Storage(format!("bad embedding row: {e}")))?;
                let blob = row
                    .get::<Vec<u8>>(1)
                    .map_err(|e| Error::Storage(format!("bad embedding blob: {e}")))?;
                Ok(Some((model, blob_to_vector(&blob))))
            }
            None => Ok(None),
        }
    }

    /// All follows/requires edges, for cycle detection
    async fn ordered_link_edges(&self) -> Result<HashMap<PatternId, Vec<PatternId>>> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                "SELECT src, dst FROM pattern_links WHERE relation IN ('follows', 'requires')",
                (),
            )
            .await
            .map_err(|e| Error::Storage(format!("failed to load link edges: {e}")))?;

        let mut edges: HashMap<PatternId, Vec<PatternId>> = HashMap::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| Error::Storage(format!("failed to fetch edge row: {e}")))?
        {
            let src = parse_uuid(&row.get::<String>(0).map_err(storage_err)?)?;
            let dst = parse_uuid(&row.get::<String>(1).map_err(storage_err)?)?;
            edges.entry(src).or_default().push(dst);
        }
        Ok(edges)
    }
}

/// DFS reachability over an adjacency map
fn reaches(edges: &HashMap<PatternId, Vec<PatternId>>, start: PatternId, target: PatternId) -> bool {
    let mut seen = HashSet::new();
    let mut stack = vec![start];
    while let Some(id) = stack.pop() {
        if id == target {
            return true;
        }
        if !seen.insert(id) {
            continue;
        }
        if let Some(next) = edges.get(&id) {
            stack.extend(next.iter().copied());
        }
    }
    false
}

fn row_to_pattern(row: &Row) -> Result<Pattern> {
    let data = row
        .get::<String>(0)
        .map_err(|e| Error::Storage(format!("bad pattern row: {e}")))?;
    let mut pattern: Pattern = serde_json::from_str(&data)?;

    // The column is authoritative for the supersedes edge: retiring a
    // supersessor nulls it without rewriting the serialized payload
    let column: Option<String> = row.get(1).ok();
    pattern.superseded_by = column.and_then(|s| Uuid::parse_str(&s).ok());
    Ok(pattern)
}

fn row_to_link(row: &Row) -> Result<PatternLink> {
    let relation = match row.get::<String>(2).map_err(storage_err)?.as_str() {
        "follows" => LinkRelation::Follows,
        "requires" => LinkRelation::Requires,
        "conflicts" => LinkRelation::Conflicts,
        "similar" => LinkRelation::Similar,
        other => {
            return Err(Error::Storage(format!("unknown link relation '{other}'")));
        }
    };
    Ok(PatternLink {
        src: parse_uuid(&row.get::<String>(0).map_err(storage_err)?)?,
        dst: parse_uuid(&row.get::<String>(1).map_err(storage_err)?)?,
        relation,
        weight: row.get::<f64>(3).map_err(storage_err)?,
        created_at: millis_ts(row.get::<i64>(4).map_err(storage_err)?),
    })
}

fn parse_uuid(text: &str) -> Result<PatternId> {
    Uuid::parse_str(text).map_err(|e| Error::Storage(format!("bad uuid '{text}': {e}")))
}

fn storage_err(e: libsql::Error) -> Error {
    Error::Storage(e.to_string())
}
