//! In-memory `SubstrateStore` used by unit and integration tests.
//!
//! Mirrors the durable backend's semantics closely enough for the
//! invariants to be testable: single terminal outcome per plan, cycle
//! rejection on supersede/link writes, TTL-aware KV reads, and the
//! reliability recompute that the SQL backend runs as a trigger.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use swarm_core::error::{Error, Result};
use swarm_core::pattern::Pattern;
use swarm_core::planner::heuristic::HeuristicEntry;
use swarm_core::planner::plan::{ExecutionOutcome, Plan};
use swarm_core::storage::{LinkRelation, PatternLink, PatternQuery, SubstrateStore, TaskTrajectory};
use swarm_core::types::{PatternId, PlanId};
use swarm_core::verification::{
    AdaptiveThreshold, AgentReliability, ReliabilityTrend, TruthPrediction, VerificationOutcome,
};

#[derive(Default)]
struct Inner {
    patterns: HashMap<PatternId, Pattern>,
    embeddings: HashMap<PatternId, (String, Vec<f32>)>,
    links: Vec<PatternLink>,
    plans: HashMap<PlanId, Plan>,
    retired_plans: HashSet<PlanId>,
    outcomes: HashMap<PlanId, Vec<ExecutionOutcome>>,
    heuristics: HashMap<(String, String), HeuristicEntry>,
    action_perf: HashMap<(String, String), (u64, u64, f64)>,
    verification_outcomes: Vec<VerificationOutcome>,
    reliability: HashMap<String, AgentReliability>,
    thresholds: HashMap<(String, String), AdaptiveThreshold>,
    predictions: Vec<TruthPrediction>,
    trajectories: Vec<TaskTrajectory>,
    memory: HashMap<(String, String), (String, Option<DateTime<Utc>>)>,
    metrics_log: Vec<(String, f64, String, String)>,
}

/// Map-backed store double
#[derive(Default)]
pub struct InMemoryStore {
    inner: Mutex<Inner>,
}

impl InMemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Recorded metric samples, for assertions
    #[must_use]
    pub fn metric_samples(&self) -> usize {
        self.inner.lock().metrics_log.len()
    }

    /// Whether a plan has been retired
    #[must_use]
    pub fn plan_retired(&self, id: PlanId) -> bool {
        self.inner.lock().retired_plans.contains(&id)
    }

    /// Walk supersede edges from `start`; true when `target` is reachable
    fn supersede_reaches(inner: &Inner, start: PatternId, target: PatternId) -> bool {
        let mut seen = HashSet::new();
        let mut cursor = Some(start);
        while let Some(id) = cursor {
            if id == target {
                return true;
            }
            if !seen.insert(id) {
                return false;
            }
            cursor = inner.patterns.get(&id).and_then(|p| p.superseded_by);
        }
        false
    }

    /// DFS over follows/requires links; true when `target` is reachable
    fn link_reaches(inner: &Inner, start: PatternId, target: PatternId) -> bool {
        let mut seen = HashSet::new();
        let mut stack = vec![start];
        while let Some(id) = stack.pop() {
            if id == target {
                return true;
            }
            if !seen.insert(id) {
                continue;
            }
            for link in &inner.links {
                if link.src == id
                    && matches!(link.relation, LinkRelation::Follows | LinkRelation::Requires)
                {
                    stack.push(link.dst);
                }
            }
        }
        false
    }

    /// The reliability recompute the SQL backend runs as a trigger
    fn recompute_reliability(inner: &mut Inner, agent_id: &str) {
        let rows: Vec<&VerificationOutcome> = inner
            .verification_outcomes
            .iter()
            .filter(|o| o.agent_id == agent_id)
            .collect();
        if rows.is_empty() {
            return;
        }

        let total = rows.len() as u64;
        let success = rows.iter().filter(|o| o.passed).count() as u64;
        let avg_truth = rows.iter().map(|o| o.truth_score).sum::<f64>() / total as f64;

        // Trend: recent half vs overall average
        let recent: Vec<&&VerificationOutcome> = rows.iter().skip(rows.len() / 2).collect();
        let recent_avg =
            recent.iter().map(|o| o.truth_score).sum::<f64>() / recent.len().max(1) as f64;
        let trend = if recent_avg > avg_truth + 0.02 {
            ReliabilityTrend::Improving
        } else if recent_avg < avg_truth - 0.02 {
            ReliabilityTrend::Declining
        } else {
            ReliabilityTrend::Stable
        };

        let reliability = 0.7 * (success as f64 / total as f64) + 0.3 * avg_truth;
        inner.reliability.insert(
            agent_id.to_string(),
            AgentReliability {
                agent_id: agent_id.to_string(),
                total,
                success,
                fail: total - success,
                avg_truth_score: avg_truth,
                reliability,
                trend,
                quarantined: reliability < 0.3,
            },
        );
    }
}

#[async_trait]
impl SubstrateStore for InMemoryStore {
    async fn store_pattern(&self, pattern: &Pattern) -> Result<()> {
        pattern.validate()?;
        self.inner.lock().patterns.insert(pattern.id, pattern.clone());
        Ok(())
    }

    async fn get_pattern(&self, id: PatternId) -> Result<Option<Pattern>> {
        Ok(self.inner.lock().patterns.get(&id).cloned())
    }

    async fn query_patterns(&self, query: &PatternQuery) -> Result<Vec<Pattern>> {
        let inner = self.inner.lock();
        let mut matches: Vec<Pattern> = inner
            .patterns
            .values()
            .filter(|p| query.include_superseded || !p.is_superseded())
            .filter(|p| query.kind.is_none_or(|kind| p.kind == kind))
            .filter(|p| query.min_confidence.is_none_or(|min| p.confidence >= min))
            .cloned()
            .collect();
        matches.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        if let Some(limit) = query.limit {
            matches.truncate(limit);
        }
        Ok(matches)
    }

    async fn all_patterns(&self) -> Result<Vec<Pattern>> {
        Ok(self.inner.lock().patterns.values().cloned().collect())
    }

    async fn count_patterns(&self) -> Result<u64> {
        Ok(self
            .inner
            .lock()
            .patterns
            .values()
            .filter(|p| !p.is_superseded())
            .count() as u64)
    }

    async fn supersede_pattern(&self, old: PatternId, new: PatternId) -> Result<()> {
        let mut inner = self.inner.lock();
        if old == new || Self::supersede_reaches(&inner, new, old) {
            return Err(Error::Validation(format!(
                "supersede edge {old} -> {new} would close a cycle"
            )));
        }
        let pattern = inner
            .patterns
            .get_mut(&old)
            .ok_or(Error::NotFound(old))?;
        pattern.superseded_by = Some(new);
        pattern.version += 1;
        Ok(())
    }

    async fn link_patterns(&self, link: &PatternLink) -> Result<()> {
        let mut inner = self.inner.lock();
        if matches!(link.relation, LinkRelation::Follows | LinkRelation::Requires)
            && (link.src == link.dst || Self::link_reaches(&inner, link.dst, link.src))
        {
            return Err(Error::Validation(format!(
                "link {} -> {} ({}) would close a cycle",
                link.src, link.dst, link.relation
            )));
        }
        inner.links.push(link.clone());
        Ok(())
    }

    async fn pattern_links(&self, src: PatternId) -> Result<Vec<PatternLink>> {
        Ok(self
            .inner
            .lock()
            .links
            .iter()
            .filter(|l| l.src == src)
            .cloned()
            .collect())
    }

    async fn retire_patterns(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut inner = self.inner.lock();
        let removed: HashSet<PatternId> = inner
            .patterns
            .values()
            .filter(|p| p.is_retirable(now))
            .map(|p| p.id)
            .collect();
        inner.patterns.retain(|id, _| !removed.contains(id));

        // Retiring a supersessor releases its predecessors, matching
        // the durable backend's ON DELETE SET NULL
        for pattern in inner.patterns.values_mut() {
            if pattern
                .superseded_by
                .is_some_and(|supersessor| removed.contains(&supersessor))
            {
                pattern.superseded_by = None;
            }
        }

        Ok(removed.len() as u64)
    }

    async fn store_embedding(&self, id: PatternId, model: &str, vector: &[f32]) -> Result<()> {
        self.inner
            .lock()
            .embeddings
            .insert(id, (model.to_string(), vector.to_vec()));
        Ok(())
    }

    async fn get_embedding(&self, id: PatternId) -> Result<Option<(String, Vec<f32>)>> {
        Ok(self.inner.lock().embeddings.get(&id).cloned())
    }

    async fn store_plan(&self, plan: &Plan) -> Result<()> {
        self.inner.lock().plans.insert(plan.id, plan.clone());
        Ok(())
    }

    async fn get_plan(&self, id: PlanId) -> Result<Option<Plan>> {
        Ok(self.inner.lock().plans.get(&id).cloned())
    }

    async fn retire_plan(&self, id: PlanId) -> Result<()> {
        let mut inner = self.inner.lock();
        if !inner.plans.contains_key(&id) {
            return Err(Error::NotFound(id));
        }
        inner.retired_plans.insert(id);
        Ok(())
    }

    async fn store_outcome(&self, outcome: &ExecutionOutcome) -> Result<()> {
        let mut inner = self.inner.lock();
        let existing = inner.outcomes.entry(outcome.plan_id).or_default();
        if !existing.is_empty() {
            return Err(Error::Validation(format!(
                "plan {} already has a terminal outcome",
                outcome.plan_id
            )));
        }
        existing.push(outcome.clone());
        Ok(())
    }

    async fn outcomes_for_plan(&self, plan_id: PlanId) -> Result<Vec<ExecutionOutcome>> {
        Ok(self
            .inner
            .lock()
            .outcomes
            .get(&plan_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn upsert_heuristic(&self, entry: &HeuristicEntry) -> Result<()> {
        self.inner.lock().heuristics.insert(
            (entry.state_hash.clone(), entry.goal_hash.clone()),
            entry.clone(),
        );
        Ok(())
    }

    async fn get_heuristic(
        &self,
        state_hash: &str,
        goal_hash: &str,
    ) -> Result<Option<HeuristicEntry>> {
        Ok(self
            .inner
            .lock()
            .heuristics
            .get(&(state_hash.to_string(), goal_hash.to_string()))
            .cloned())
    }

    async fn record_action_performance(
        &self,
        action_id: &str,
        context_hash: &str,
        success: bool,
        cost: f64,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        let entry = inner
            .action_perf
            .entry((action_id.to_string(), context_hash.to_string()))
            .or_insert((0, 0, 0.0));
        entry.1 += 1;
        if success {
            entry.0 += 1;
        }
        let n = entry.1 as f64;
        entry.2 = entry.2 * ((n - 1.0) / n) + cost / n;
        Ok(())
    }

    async fn store_verification_outcome(&self, outcome: &VerificationOutcome) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.verification_outcomes.push(outcome.clone());
        Self::recompute_reliability(&mut inner, &outcome.agent_id);
        Ok(())
    }

    async fn get_agent_reliability(&self, agent_id: &str) -> Result<Option<AgentReliability>> {
        Ok(self.inner.lock().reliability.get(agent_id).cloned())
    }

    async fn get_adaptive_threshold(
        &self,
        agent_type: &str,
        file_type: &str,
    ) -> Result<Option<AdaptiveThreshold>> {
        Ok(self
            .inner
            .lock()
            .thresholds
            .get(&(agent_type.to_string(), file_type.to_string()))
            .cloned())
    }

    async fn upsert_adaptive_threshold(&self, threshold: &AdaptiveThreshold) -> Result<()> {
        self.inner.lock().thresholds.insert(
            (threshold.agent_type.clone(), threshold.file_type.clone()),
            threshold.clone(),
        );
        Ok(())
    }

    async fn store_truth_prediction(&self, prediction: &TruthPrediction) -> Result<()> {
        self.inner.lock().predictions.push(prediction.clone());
        Ok(())
    }

    async fn store_trajectory(&self, trajectory: &TaskTrajectory) -> Result<()> {
        self.inner.lock().trajectories.push(trajectory.clone());
        Ok(())
    }

    async fn memory_put(
        &self,
        namespace: &str,
        key: &str,
        value: &str,
        ttl_secs: Option<u64>,
    ) -> Result<()> {
        let expires_at = ttl_secs.map(|ttl| Utc::now() + chrono::Duration::seconds(ttl as i64));
        self.inner.lock().memory.insert(
            (namespace.to_string(), key.to_string()),
            (value.to_string(), expires_at),
        );
        Ok(())
    }

    async fn memory_get(&self, namespace: &str, key: &str) -> Result<Option<String>> {
        let inner = self.inner.lock();
        Ok(inner
            .memory
            .get(&(namespace.to_string(), key.to_string()))
            .filter(|(_, expires)| expires.is_none_or(|at| at > Utc::now()))
            .map(|(value, _)| value.clone()))
    }

    async fn log_metric(&self, name: &str, value: f64, component: &str, tags: &str) -> Result<()> {
        self.inner.lock().metrics_log.push((
            name.to_string(),
            value,
            component.to_string(),
            tags.to_string(),
        ));
        Ok(())
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(true)
    }
}
