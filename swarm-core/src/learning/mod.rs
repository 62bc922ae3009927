//! # Learning Pipeline
//!
//! The pipeline is the front door of the learning engine. It offers
//! four operations:
//!
//! - [`LearningPipeline::observe`]: run an action, capture pre/post
//!   state and duration, append to the ring buffer
//! - [`LearningPipeline::apply`]: retrieve the best matching pattern
//!   for a new context
//! - [`LearningPipeline::train`]: submit a pattern candidate for
//!   federated aggregation and consensus
//! - [`LearningPipeline::track_outcome`]: route a plan's terminal
//!   outcome to the confidence updater and replan evaluation
//!
//! Extraction runs at most once at a time per pipeline; observations
//! arriving mid-extraction accumulate for the next window. A failed
//! extraction logs and discards its batch, the pipeline never dies on
//! a malformed observation.

pub mod buffer;
pub mod confidence;
pub mod extractor;

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use crate::config::{ExtractorConfig, PipelineConfig};
use crate::consensus::{Contribution, PatternAggregator};
use crate::error::Result;
use crate::hooks::MetricsRegistry;
use crate::index::VectorIndex;
use crate::pattern::Pattern;
use crate::planner::plan::ExecutionOutcome;
use crate::planner::replan::{ReplanTrigger, evaluate_trigger};
use crate::storage::SubstrateStore;
use crate::types::{AgentId, Observation, OutcomeKind, PlanId, TaskId, WorldState, context_hash};

use buffer::ObservationBuffer;
use confidence::{ConfidenceUpdater, OutcomeSample};
use extractor::PatternExtractor;

/// Pipeline lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Buffering,
    Extracting,
    Training,
}

/// Result of an action observed by the pipeline
#[derive(Debug, Clone, PartialEq)]
pub struct Observed<T> {
    /// World state after the action
    pub post_state: WorldState,
    /// Classification of the step
    pub outcome: OutcomeKind,
    /// The action's own output
    pub value: T,
}

/// A pattern retrieved for application to a new context
#[derive(Debug, Clone, PartialEq)]
pub struct PatternMatch {
    pub pattern: Pattern,
    /// `confidence * similarity`, the planner's boost input
    pub boost: f64,
}

/// The learning engine's orchestrator
pub struct LearningPipeline {
    config: PipelineConfig,
    extractor: PatternExtractor,
    updater: Arc<ConfidenceUpdater>,
    aggregator: Arc<PatternAggregator>,
    store: Arc<dyn SubstrateStore>,
    index: Arc<VectorIndex>,
    metrics: Arc<MetricsRegistry>,
    buffer: Mutex<ObservationBuffer>,
    state: Mutex<PipelineState>,
    extracting: AtomicBool,
    /// Contributor id attached to locally extracted patterns
    node_id: AgentId,
}

impl LearningPipeline {
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: PipelineConfig,
        extractor_config: ExtractorConfig,
        updater: Arc<ConfidenceUpdater>,
        aggregator: Arc<PatternAggregator>,
        store: Arc<dyn SubstrateStore>,
        index: Arc<VectorIndex>,
        metrics: Arc<MetricsRegistry>,
        node_id: impl Into<AgentId>,
    ) -> Self {
        let buffer = Mutex::new(ObservationBuffer::new(config.observation_buffer));
        Self {
            config,
            extractor: PatternExtractor::new(extractor_config),
            updater,
            aggregator,
            store,
            index,
            metrics,
            buffer,
            state: Mutex::new(PipelineState::Idle),
            extracting: AtomicBool::new(false),
            node_id: node_id.into(),
        }
    }

    /// Current lifecycle state
    #[must_use]
    pub fn state(&self) -> PipelineState {
        *self.state.lock()
    }

    /// Execute `action`, capture the observation, and append it to the
    /// ring buffer. A full buffer triggers extraction when auto
    /// learning is on.
    ///
    /// The action's error is recorded as a failure observation and then
    /// propagated unchanged.
    ///
    /// # Errors
    ///
    /// Returns the action's error; capture itself never fails the call.
    #[instrument(skip(self, pre_state, action), fields(task_id = %task_id, op = %op))]
    pub async fn observe<T, F, Fut>(
        &self,
        task_id: TaskId,
        agent_id: AgentId,
        op: &str,
        pre_state: WorldState,
        action: F,
    ) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Observed<T>>>,
    {
        *self.state.lock() = PipelineState::Buffering;
        let started = Instant::now();
        let result = action().await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let (post_state, outcome, value) = match result {
            Ok(observed) => (observed.post_state, observed.outcome, Ok(observed.value)),
            Err(err) => (pre_state.clone(), OutcomeKind::Failure, Err(err)),
        };

        let observation = Observation {
            context_hash: context_hash(&format!("{task_id}:{op}")),
            task_id,
            agent_id,
            op: op.to_string(),
            pre_state,
            post_state,
            duration_ms,
            outcome,
            timestamp: Utc::now(),
        };

        let full = self.buffer.lock().push(observation);
        self.metrics.incr("pipeline.observations");

        if full && self.config.auto_learning {
            self.run_extraction().await;
        }

        value
    }

    /// Retrieve the best pattern for a task context, or `None` when no
    /// candidate clears the match threshold.
    ///
    /// Matching combines vector similarity with a pre-state subset
    /// check and ranks by `confidence * similarity`.
    ///
    /// # Errors
    ///
    /// Returns storage errors from pattern fetches.
    pub async fn apply(&self, task_desc: &str, ctx: &WorldState) -> Result<Option<PatternMatch>> {
        let query = format!(
            "{task_desc} state:{}",
            ctx.iter()
                .map(|(var, value)| format!("{var}={}", value.render()))
                .collect::<Vec<_>>()
                .join(",")
        );
        let hits = self.index.search(&query, None, 16);

        let mut best: Option<PatternMatch> = None;
        for hit in hits {
            let Some(pattern) = self.store.get_pattern(hit.pattern_id).await? else {
                continue;
            };
            if pattern.is_superseded()
                || pattern.confidence < self.config.min_confidence
                || !pattern.applies_to(ctx)
            {
                continue;
            }
            let boost = pattern.confidence * f64::from(hit.similarity);
            if boost < self.config.match_threshold {
                continue;
            }
            if best.as_ref().is_none_or(|b| boost > b.boost) {
                best = Some(PatternMatch { pattern, boost });
            }
        }

        self.metrics.incr(if best.is_some() {
            "pipeline.apply_hit"
        } else {
            "pipeline.apply_miss"
        });
        Ok(best)
    }

    /// Submit a pattern candidate (local extraction or federation) for
    /// aggregation and consensus.
    ///
    /// # Errors
    ///
    /// Returns validation errors for malformed candidates and
    /// consensus/storage errors from an immediate aggregation.
    pub async fn train(&self, pattern: Pattern) -> Result<()> {
        *self.state.lock() = PipelineState::Training;
        let contribution = Contribution::new(pattern, self.node_id.clone(), 0.8);
        let result = self.aggregator.submit(contribution).await;
        *self.state.lock() = PipelineState::Idle;
        result.map(|_| ())
    }

    /// Record a plan's terminal outcome: persist it, feed the pattern
    /// confidence update, record per-action performance, and evaluate
    /// replan triggers against the plan.
    ///
    /// Returns the replan trigger, if any; the caller (coordinator)
    /// owns the actual replan.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::NotFound`] for unknown plans,
    /// [`crate::Error::Validation`] for duplicate terminal outcomes,
    /// and storage errors.
    pub async fn track_outcome(
        &self,
        plan_id: PlanId,
        outcome: ExecutionOutcome,
        planner_config: &crate::config::PlannerConfig,
    ) -> Result<Option<ReplanTrigger>> {
        let plan = self
            .store
            .get_plan(plan_id)
            .await?
            .ok_or(crate::error::Error::NotFound(plan_id))?;

        self.store.store_outcome(&outcome).await?;

        let per_action_cost = outcome.actual_cost / plan.actions.len().max(1) as f64;
        for action_id in &plan.actions {
            self.store
                .record_action_performance(
                    action_id,
                    &plan.current_state.state_hash(),
                    outcome.success,
                    per_action_cost,
                )
                .await?;
        }

        if let Some(pattern_id) = plan.pattern_id {
            let kind = if outcome.success && outcome.achieved_goal {
                OutcomeKind::Success
            } else if outcome.success {
                OutcomeKind::Partial
            } else {
                OutcomeKind::Failure
            };
            let sample = OutcomeSample {
                outcome: kind,
                duration_ms: outcome.duration_ms as f64,
                improvement: None,
            };
            if let Err(err) = self.updater.apply(pattern_id, sample).await {
                // A retired pattern is not an outcome-tracking failure
                warn!(pattern_id = %pattern_id, "confidence update skipped: {err}");
            }
        }

        self.metrics.incr("pipeline.outcomes_tracked");
        Ok(evaluate_trigger(planner_config, &plan, &outcome, None))
    }

    /// Force an extraction of the current window regardless of buffer
    /// pressure. Used by the flush timer and by shutdown.
    pub async fn flush(&self) {
        self.run_extraction().await;
    }

    /// Run retirement over the store: patterns below the confidence,
    /// usage, and age floors are removed, and over-populated kinds are
    /// reported so operators see the pressure before matching degrades.
    ///
    /// # Errors
    ///
    /// Returns storage errors.
    pub async fn consolidate(&self) -> Result<u64> {
        let retired = self.store.retire_patterns(Utc::now()).await?;
        if retired > 0 {
            info!(retired, "patterns retired during consolidation");
        }

        for kind in [
            crate::pattern::PatternKind::Coordination,
            crate::pattern::PatternKind::Goap,
            crate::pattern::PatternKind::Verification,
            crate::pattern::PatternKind::SparcPhase,
        ] {
            let live = self
                .store
                .query_patterns(&crate::storage::PatternQuery {
                    kind: Some(kind),
                    ..crate::storage::PatternQuery::default()
                })
                .await?;
            if live.len() > self.config.max_patterns_per_kind {
                warn!(
                    %kind,
                    count = live.len(),
                    cap = self.config.max_patterns_per_kind,
                    "pattern population over cap; retirement will thin low performers"
                );
                self.metrics.incr("pipeline.kind_over_cap");
            }
        }

        Ok(retired)
    }

    /// Drain the buffer and run one extraction pass. A pass already in
    /// flight makes this a no-op; the window keeps accumulating.
    async fn run_extraction(&self) {
        if self
            .extracting
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("extraction already in flight, observations keep buffering");
            return;
        }
        *self.state.lock() = PipelineState::Extracting;

        let window = self.buffer.lock().drain();
        if !window.is_empty() {
            let candidates = self
                .extractor
                .extract(&window, self.config.extraction_batch);
            self.metrics.incr("pipeline.extractions");

            for candidate in candidates {
                if candidate.confidence < self.config.min_quality {
                    continue;
                }
                let contribution =
                    Contribution::new(candidate, self.node_id.clone(), 0.8);
                if let Err(err) = self.aggregator.submit(contribution).await {
                    // A bad batch is logged and dropped; the pipeline lives on
                    warn!("extraction batch discarded: {err}");
                    self.metrics.incr("pipeline.extraction_failures");
                    break;
                }
            }
        }

        self.extracting.store(false, Ordering::Release);
        *self.state.lock() = PipelineState::Idle;
    }

    /// Spawn the periodic flush/aggregation driver. The task flushes
    /// the observation window, ticks the aggregator, and consolidates
    /// retired patterns until `shutdown` flips.
    pub fn spawn_flush_task(
        self: &Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let pipeline = Arc::clone(self);
        let interval = std::time::Duration::from_millis(pipeline.config.flush_interval_ms);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        pipeline.flush().await;
                        if let Err(err) = pipeline.aggregator.tick().await {
                            warn!("aggregation tick failed: {err}");
                        }
                        if let Err(err) = pipeline.consolidate().await {
                            warn!("consolidation failed: {err}");
                        }
                    }
                    _ = shutdown.changed() => {
                        // Final flush so buffered observations are not lost
                        pipeline.flush().await;
                        break;
                    }
                }
            }
        })
    }
}
