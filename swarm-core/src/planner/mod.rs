//! # GOAP Planner
//!
//! A* over world states. Nodes are hashed states, edges are actions
//! with precondition predicates and effect deltas, and the heuristic is
//! the pattern-boosted gap measure of [`heuristic`]. Matching patterns
//! are fetched once before the search opens; the expand loop itself is
//! pure in-memory and never suspends.

pub mod action;
pub mod heuristic;
pub mod plan;
pub mod replan;

use std::cmp::Ordering;
use std::collections::{BTreeMap, BinaryHeap, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::{debug, info, instrument};

use crate::config::PlannerConfig;
use crate::error::{Error, NoPlanReason, Result};
use crate::index::VectorIndex;
use crate::pattern::{Pattern, PatternKind};
use crate::storage::{PatternQuery, SubstrateStore};
use crate::types::{Scalar, TaskId, WorldState};

use action::Action;
use heuristic::{HeuristicEntry, h_base, h_pattern};
use plan::{Plan, PlanConstraints, PlanMethod};

/// Similarity above which a matching pattern's action sequence is
/// tried verbatim before opening a search
const REUSE_SIMILARITY: f32 = 0.95;

/// Instrumentation for one search
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SearchStats {
    /// Nodes popped from the frontier
    pub expanded: usize,
    /// Wall-clock duration of the search
    pub duration_ms: u64,
    /// Heuristic boost applied from matching patterns
    pub boost: f64,
}

struct FrontierNode {
    f: f64,
    g: f64,
    pattern_conf: f64,
    seq: u64,
    depth: usize,
    state: WorldState,
    path: Vec<usize>,
}

impl PartialEq for FrontierNode {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for FrontierNode {}

impl Ord for FrontierNode {
    // BinaryHeap is a max-heap; reverse so the best node surfaces first.
    // Ties break by lower cost, then higher cumulative pattern
    // confidence, then older insertion.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .f
            .partial_cmp(&self.f)
            .unwrap_or(Ordering::Equal)
            .then_with(|| other.g.partial_cmp(&self.g).unwrap_or(Ordering::Equal))
            .then_with(|| {
                self.pattern_conf
                    .partial_cmp(&other.pattern_conf)
                    .unwrap_or(Ordering::Equal)
            })
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for FrontierNode {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A*-over-world-state planner with pattern-boosted heuristics
pub struct GoapPlanner {
    config: PlannerConfig,
    store: Arc<dyn SubstrateStore>,
    index: Arc<VectorIndex>,
    /// Fast successful searches push their action prefix here as a
    /// candidate pattern; the learning pipeline drains it.
    candidate_tx: Option<mpsc::Sender<Pattern>>,
}

impl GoapPlanner {
    #[must_use]
    pub fn new(config: PlannerConfig, store: Arc<dyn SubstrateStore>, index: Arc<VectorIndex>) -> Self {
        Self {
            config,
            store,
            index,
            candidate_tx: None,
        }
    }

    /// Wire the channel that receives fast-plan pattern candidates
    #[must_use]
    pub fn with_candidate_channel(mut self, tx: mpsc::Sender<Pattern>) -> Self {
        self.candidate_tx = Some(tx);
        self
    }

    /// Planner configuration (read-only)
    #[must_use]
    pub fn config(&self) -> &PlannerConfig {
        &self.config
    }

    /// Store handle shared with the replanner for plan retirement
    pub(crate) fn store_handle(&self) -> &Arc<dyn SubstrateStore> {
        &self.store
    }

    /// Produce a plan from `current` to `goal` over `actions`.
    ///
    /// Persists the plan and a heuristic entry for the searched
    /// (state, goal) pair before returning.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoPlan`] on empty frontier, depth exhaustion,
    /// or wall-clock timeout, and storage errors from persistence.
    pub async fn plan(
        &self,
        task_id: TaskId,
        current: &WorldState,
        goal: &WorldState,
        actions: &[Action],
        constraints: PlanConstraints,
    ) -> Result<Plan> {
        self.plan_with_stats(task_id, current, goal, actions, constraints)
            .await
            .map(|(plan, _stats)| plan)
    }

    /// [`Self::plan`] with search instrumentation, used by adaptive
    /// callers and benchmarks.
    #[instrument(skip_all, fields(task_id = %task_id))]
    pub async fn plan_with_stats(
        &self,
        task_id: TaskId,
        current: &WorldState,
        goal: &WorldState,
        actions: &[Action],
        constraints: PlanConstraints,
    ) -> Result<(Plan, SearchStats)> {
        let started = Instant::now();
        let matches = self.matching_patterns(current, goal).await?;
        let boost = h_pattern(&matches, &self.config);

        // A pattern that replays verbatim to the goal short-circuits the search
        if let Some(plan) = self.try_pattern_reuse(&task_id, current, goal, actions, &matches, &constraints) {
            let stats = SearchStats {
                expanded: 0,
                duration_ms: started.elapsed().as_millis() as u64,
                boost,
            };
            self.store.store_plan(&plan).await?;
            self.record_heuristic(current, goal, 0.0, plan.total_cost).await?;
            info!(plan_id = %plan.id, cost = plan.total_cost, "plan produced by pattern reuse");
            return Ok((plan, stats));
        }

        let search = self.search(current, goal, actions, boost, &matches, started)?;
        let duration_ms = started.elapsed().as_millis() as u64;

        let method = if boost > 0.0 { PlanMethod::Hybrid } else { PlanMethod::AStar };
        let action_ids: Vec<String> = search.path.iter().map(|&i| actions[i].id.clone()).collect();
        let mut plan = Plan::new(
            task_id,
            action_ids,
            search.cost,
            current.clone(),
            goal.clone(),
            method,
        );
        plan.constraints = constraints;
        plan.confidence = self.plan_confidence(&matches, search.cost);
        plan.estimated_duration_ms = search.cost.max(0.0) as u64;
        plan.pattern_id = matches.first().map(|(pattern, _)| pattern.id);

        if let Some(max_cost) = plan.constraints.max_cost {
            if plan.total_cost > max_cost {
                return Err(Error::NoPlan(NoPlanReason::NoPath));
            }
        }

        self.store.store_plan(&plan).await?;
        self.record_heuristic(current, goal, search.initial_h, search.cost).await?;
        self.maybe_emit_candidate(&plan, duration_ms);

        info!(
            plan_id = %plan.id,
            cost = plan.total_cost,
            expanded = search.expanded,
            method = %plan.method,
            "plan produced"
        );

        Ok((
            plan,
            SearchStats {
                expanded: search.expanded,
                duration_ms,
                boost,
            },
        ))
    }

    /// Patterns applicable in `current`, ranked by index similarity to
    /// the (state, goal) pair. Runs before the search loop opens; the
    /// loop itself never touches the store.
    async fn matching_patterns(
        &self,
        current: &WorldState,
        goal: &WorldState,
    ) -> Result<Vec<(Pattern, f64)>> {
        let query_text = format!(
            "state:{} goal:{}",
            render_state(current),
            render_state(goal)
        );
        let hits = self.index.search(&query_text, Some(PatternKind::Goap), 8);

        let mut matches = Vec::new();
        for hit in hits {
            let Some(pattern) = self.store.get_pattern(hit.pattern_id).await? else {
                continue;
            };
            if pattern.is_superseded() || !pattern.applies_to(current) {
                continue;
            }
            matches.push((pattern, f64::from(hit.similarity)));
        }

        // Fall back to a direct store scan when the index is cold
        if matches.is_empty() {
            let query = PatternQuery {
                kind: Some(PatternKind::Goap),
                min_confidence: Some(0.5),
                limit: Some(8),
                include_superseded: false,
            };
            for pattern in self.store.query_patterns(&query).await? {
                if pattern.applies_to(current) {
                    matches.push((pattern, 1.0));
                }
            }
        }

        Ok(matches)
    }

    /// Replay a high-similarity pattern's action sequence; a replay
    /// that reaches the goal becomes the plan without any search.
    fn try_pattern_reuse(
        &self,
        task_id: &TaskId,
        current: &WorldState,
        goal: &WorldState,
        actions: &[Action],
        matches: &[(Pattern, f64)],
        constraints: &PlanConstraints,
    ) -> Option<Plan> {
        let by_id: HashMap<&str, &Action> =
            actions.iter().map(|a| (a.id.as_str(), a)).collect();

        for (pattern, similarity) in matches {
            if *similarity < f64::from(REUSE_SIMILARITY) {
                continue;
            }

            let mut state = current.clone();
            let mut cost = 0.0;
            let mut replayable = true;
            for action_id in &pattern.actions {
                match by_id.get(action_id.as_str()) {
                    Some(action) if action.applicable(&state) => {
                        cost += action.weighted_cost(&self.config.risk_factors);
                        state = action.apply(&state);
                    }
                    _ => {
                        replayable = false;
                        break;
                    }
                }
            }

            if replayable && state.satisfies(goal) {
                if let Some(max_cost) = constraints.max_cost {
                    if cost > max_cost {
                        continue;
                    }
                }
                let mut plan = Plan::new(
                    task_id.clone(),
                    pattern.actions.clone(),
                    cost,
                    current.clone(),
                    goal.clone(),
                    PlanMethod::PatternReuse,
                );
                plan.constraints = constraints.clone();
                plan.confidence = pattern.confidence;
                plan.estimated_duration_ms = pattern.metrics.avg_duration_ms.max(cost) as u64;
                plan.pattern_id = Some(pattern.id);
                return Some(plan);
            }
        }
        None
    }

    fn search(
        &self,
        current: &WorldState,
        goal: &WorldState,
        actions: &[Action],
        boost: f64,
        matches: &[(Pattern, f64)],
        started: Instant,
    ) -> Result<SearchOutcome> {
        let timeout = Duration::from_millis(self.config.timeout_ms);
        let h = |state: &WorldState| (h_base(state, goal, &self.config) - boost).max(0.0);

        // Per-action confidence from matching patterns feeds the tie-break
        let action_conf: HashMap<&str, f64> = {
            let mut map: HashMap<&str, f64> = HashMap::new();
            for (pattern, _) in matches {
                for action_id in &pattern.actions {
                    let entry = map.entry(action_id.as_str()).or_insert(0.0);
                    *entry = entry.max(pattern.confidence);
                }
            }
            map
        };

        let initial_h = h(current);
        let mut frontier = BinaryHeap::new();
        let mut closed: HashSet<String> = HashSet::new();
        let mut best_g: HashMap<String, f64> = HashMap::new();
        let mut seq = 0_u64;
        let mut expanded = 0_usize;
        let mut depth_limited = false;

        frontier.push(FrontierNode {
            f: initial_h,
            g: 0.0,
            pattern_conf: 0.0,
            seq,
            depth: 0,
            state: current.clone(),
            path: Vec::new(),
        });

        while let Some(node) = frontier.pop() {
            if started.elapsed() > timeout {
                return Err(Error::NoPlan(NoPlanReason::Timeout));
            }

            let state_hash = node.state.state_hash();
            if closed.contains(&state_hash) {
                continue;
            }
            closed.insert(state_hash);
            expanded += 1;

            if node.state.satisfies(goal) {
                return Ok(SearchOutcome {
                    path: node.path,
                    cost: node.g,
                    expanded,
                    initial_h,
                });
            }

            if node.depth >= self.config.max_depth {
                depth_limited = true;
                continue;
            }

            for (idx, candidate) in actions.iter().enumerate() {
                if !candidate.applicable(&node.state) {
                    continue;
                }
                let next_state = candidate.apply(&node.state);
                let next_hash = next_state.state_hash();
                let g = node.g + candidate.weighted_cost(&self.config.risk_factors);

                if best_g.get(&next_hash).is_some_and(|&known| known <= g) {
                    continue;
                }
                best_g.insert(next_hash, g);

                seq += 1;
                let mut path = node.path.clone();
                path.push(idx);
                frontier.push(FrontierNode {
                    f: g + h(&next_state),
                    g,
                    pattern_conf: node.pattern_conf
                        + action_conf.get(candidate.id.as_str()).copied().unwrap_or(0.0),
                    seq,
                    depth: node.depth + 1,
                    state: next_state,
                    path,
                });
            }
        }

        if depth_limited {
            Err(Error::NoPlan(NoPlanReason::DepthExceeded))
        } else {
            Err(Error::NoPlan(NoPlanReason::NoPath))
        }
    }

    /// Confidence in a produced plan: matching-pattern confidence
    /// tempered by plan length (longer plans compound more risk).
    fn plan_confidence(&self, matches: &[(Pattern, f64)], cost: f64) -> f64 {
        let pattern_part = matches
            .iter()
            .map(|(pattern, similarity)| pattern.confidence * similarity)
            .fold(0.0_f64, f64::max);
        let length_part = 1.0 / (1.0 + cost / 100.0);
        (0.5 * length_part + 0.5 * pattern_part).clamp(0.0, 1.0)
    }

    async fn record_heuristic(
        &self,
        current: &WorldState,
        goal: &WorldState,
        estimated: f64,
        actual: f64,
    ) -> Result<()> {
        let state_hash = current.state_hash();
        let goal_hash = goal.state_hash();
        let entry = match self.store.get_heuristic(&state_hash, &goal_hash).await? {
            Some(mut entry) => {
                entry.record(estimated, actual);
                entry
            }
            None => HeuristicEntry::first(state_hash, goal_hash, estimated, actual),
        };
        self.store.upsert_heuristic(&entry).await
    }

    /// A search that finished under the fast threshold is worth
    /// remembering: its prefix becomes a Goap pattern candidate.
    fn maybe_emit_candidate(&self, plan: &Plan, duration_ms: u64) {
        if duration_ms >= self.config.fast_plan_ms || plan.actions.is_empty() {
            return;
        }
        let Some(tx) = &self.candidate_tx else {
            return;
        };

        let conditions: BTreeMap<String, Scalar> = plan
            .current_state
            .iter()
            .map(|(var, value)| (var.clone(), value.clone()))
            .collect();
        let name = plan.actions.join(" ");
        let candidate = Pattern::new(PatternKind::Goap, name, conditions, plan.actions.clone());

        if tx.try_send(candidate).is_err() {
            debug!("candidate channel full, dropping fast-plan pattern");
        }
    }
}

struct SearchOutcome {
    path: Vec<usize>,
    cost: f64,
    expanded: usize,
    initial_h: f64,
}

fn render_state(state: &WorldState) -> String {
    state
        .iter()
        .map(|(var, value)| format!("{var}={}", value.render()))
        .collect::<Vec<_>>()
        .join(",")
}
