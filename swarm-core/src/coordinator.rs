//! # Coordinator
//!
//! Owns the worker roster and the queen-side task delegation. Workers
//! are polymorphic over the capability set (execute / vote /
//! contribute / absorb / cancel-awareness); roles are tag-level only.
//! Spawning a worker registers a paired consensus node, so the hive's
//! voting roster always mirrors the execution roster.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

use crate::config::CoordinatorConfig;
use crate::consensus::voter::VoteSource;
use crate::consensus::{ByzantineVoter, Contribution, PatternAggregator, Proposal, Vote};
use crate::error::{Error, Result};
use crate::pattern::Pattern;
use crate::storage::{PatternQuery, SubstrateStore};
use crate::types::{AgentId, NodeId, TaskId, WorkerRole};

/// Cooperative cancellation handle passed to workers.
///
/// Workers must check it at suspension points and report `Cancelled`
/// instead of continuing.
#[derive(Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    /// A token that can never fire, for standalone execution
    #[must_use]
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        // Sender drops immediately; the flag stays false forever
        Self { rx }
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Suspend until cancellation fires
    pub async fn cancelled(&mut self) {
        while !*self.rx.borrow() {
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Delegation strategy for a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Split into subtasks executed concurrently; result joins all
    Parallel,
    /// Dispatch to ranked workers in order, carrying a prior-steps counter
    Sequential,
    /// Try parallel; fall back to sequential on failure
    Adaptive,
}

/// A task handed to the coordinator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub id: TaskId,
    pub description: String,
    /// Subtask fan-out for parallel execution
    pub required_workers: usize,
    pub strategy: Strategy,
}

/// One worker's slice of a task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubTask {
    pub task_id: TaskId,
    /// Position within the fan-out
    pub index: usize,
    pub description: String,
    /// Steps completed by earlier workers (sequential strategy)
    pub prior_steps: usize,
}

/// Terminal status of a subtask
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Completed,
    Cancelled,
    Failed(String),
}

/// A worker's report for one subtask
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskReport {
    pub agent_id: AgentId,
    pub status: TaskStatus,
    pub output: String,
    pub duration_ms: u64,
}

/// Joined result of an orchestration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestrationResult {
    pub task_id: TaskId,
    pub strategy: Strategy,
    pub reports: Vec<TaskReport>,
    /// True when every subtask completed
    pub success: bool,
}

/// The worker capability set.
///
/// Role variants are tags; dispatch goes through this trait, never
/// through downcasting.
#[async_trait]
pub trait Worker: Send + Sync {
    /// Stable worker id (doubles as its consensus-node id)
    fn id(&self) -> AgentId;

    /// Role tag
    fn role(&self) -> WorkerRole;

    /// Execute a subtask, honoring the cancel token at suspension points
    async fn execute(&self, subtask: &SubTask, cancel: CancelToken) -> Result<TaskReport>;

    /// Cast a vote on a proposal
    async fn vote(&self, proposal: &Proposal) -> Result<Vote>;

    /// Contribute locally learned patterns for aggregation
    async fn contribute(&self) -> Result<Vec<Pattern>>;

    /// Absorb approved patterns distributed by collective learning
    async fn absorb(&self, patterns: &[Pattern]) -> Result<()>;
}

/// Adapter exposing a worker as a consensus vote source
struct WorkerVoteSource {
    worker: Arc<dyn Worker>,
}

#[async_trait]
impl VoteSource for WorkerVoteSource {
    fn node_id(&self) -> NodeId {
        self.worker.id()
    }

    async fn cast_vote(&self, proposal: &Proposal) -> Result<Vote> {
        self.worker.vote(proposal).await
    }
}

/// Worker lifecycle and task delegation
pub struct Coordinator {
    config: CoordinatorConfig,
    workers: RwLock<HashMap<AgentId, Arc<dyn Worker>>>,
    voter: Arc<ByzantineVoter>,
    aggregator: Arc<PatternAggregator>,
    store: Arc<dyn SubstrateStore>,
    /// Cancel channels for in-flight orchestrations
    active: Mutex<HashMap<TaskId, watch::Sender<bool>>>,
}

impl Coordinator {
    #[must_use]
    pub fn new(
        config: CoordinatorConfig,
        voter: Arc<ByzantineVoter>,
        aggregator: Arc<PatternAggregator>,
        store: Arc<dyn SubstrateStore>,
    ) -> Self {
        Self {
            config,
            workers: RwLock::new(HashMap::new()),
            voter,
            aggregator,
            store,
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Register a worker and, in the same step, its consensus node
    /// with the configured initial reputation.
    pub fn spawn(&self, worker: Arc<dyn Worker>) {
        let id = worker.id();
        info!(worker_id = %id, role = %worker.role(), "worker spawned");

        self.voter.register_node(id.clone(), self.config.initial_reputation);
        self.aggregator.register_source(Arc::new(WorkerVoteSource {
            worker: Arc::clone(&worker),
        }));
        self.workers.write().insert(id, worker);
    }

    /// Remove a worker and its consensus node
    pub fn retire_worker(&self, id: &str) {
        self.workers.write().remove(id);
        self.voter.unregister_node(id);
    }

    /// Registered worker count
    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.workers.read().len()
    }

    /// Delegate a task per its strategy.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] when no workers are registered;
    /// execution failures are reported per-subtask in the result
    /// except for parallel-strategy hard errors, which surface.
    #[instrument(skip(self), fields(task_id = %task.id, strategy = ?task.strategy))]
    pub async fn orchestrate(&self, task: &TaskSpec) -> Result<OrchestrationResult> {
        let workers = self.ranked_workers().await;
        if workers.is_empty() {
            return Err(Error::Validation("no workers registered".to_string()));
        }

        let (cancel_tx, cancel_rx) = watch::channel(false);
        self.active.lock().insert(task.id.clone(), cancel_tx);
        let token = CancelToken { rx: cancel_rx };

        let result = match task.strategy {
            Strategy::Parallel => self.run_parallel(task, &workers, token).await,
            Strategy::Sequential => self.run_sequential(task, &workers, token).await,
            Strategy::Adaptive => {
                match self.run_parallel(task, &workers, token.clone()).await {
                    Ok(result) if result.success => Ok(result),
                    Ok(_) | Err(_) => {
                        debug!(task_id = %task.id, "parallel attempt degraded, rolling to sequential");
                        self.run_sequential(task, &workers, token).await
                    }
                }
            }
        };

        self.active.lock().remove(&task.id);
        result.map(|mut r| {
            r.strategy = task.strategy;
            r
        })
    }

    /// Signal cancellation to every subtask of an in-flight task
    pub fn cancel(&self, task_id: &str) {
        if let Some(tx) = self.active.lock().get(task_id) {
            info!(task_id, "cancelling task");
            let _ = tx.send(true);
        }
    }

    /// Collective learning pass: gather worker contributions, aggregate
    /// overdue groups, and distribute approved patterns back to every
    /// worker.
    ///
    /// # Errors
    ///
    /// Returns storage and consensus errors.
    pub async fn trigger_collective_learning(&self) -> Result<()> {
        let workers: Vec<Arc<dyn Worker>> = self.workers.read().values().cloned().collect();

        for worker in &workers {
            match worker.contribute().await {
                Ok(patterns) => {
                    for pattern in patterns {
                        let score = self.voter.reputation(&worker.id()).unwrap_or(0.5);
                        let contribution = Contribution::new(pattern, worker.id(), score);
                        if let Err(err) = self.aggregator.submit(contribution).await {
                            warn!(worker_id = %worker.id(), "contribution rejected: {err}");
                        }
                    }
                }
                Err(err) => warn!(worker_id = %worker.id(), "contribution failed: {err}"),
            }
        }

        self.aggregator.tick().await?;

        let approved = self
            .store
            .query_patterns(&PatternQuery {
                min_confidence: Some(0.5),
                ..PatternQuery::default()
            })
            .await?;
        for worker in &workers {
            if let Err(err) = worker.absorb(&approved).await {
                warn!(worker_id = %worker.id(), "absorb failed: {err}");
            }
        }

        info!(
            workers = workers.len(),
            approved = approved.len(),
            "collective learning pass complete"
        );
        Ok(())
    }

    /// Workers ranked best-first by consensus reputation, then recorded
    /// reliability.
    async fn ranked_workers(&self) -> Vec<Arc<dyn Worker>> {
        let workers: Vec<Arc<dyn Worker>> = self.workers.read().values().cloned().collect();
        let mut scored = Vec::with_capacity(workers.len());
        for worker in workers {
            let reputation = self.voter.reputation(&worker.id()).unwrap_or(0.0);
            let reliability = self
                .store
                .get_agent_reliability(&worker.id())
                .await
                .ok()
                .flatten()
                .map_or(0.5, |r| r.reliability);
            scored.push((reputation + reliability, worker));
        }
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        scored.into_iter().map(|(_, worker)| worker).collect()
    }

    async fn run_parallel(
        &self,
        task: &TaskSpec,
        workers: &[Arc<dyn Worker>],
        token: CancelToken,
    ) -> Result<OrchestrationResult> {
        let fan_out = task.required_workers.clamp(1, workers.len());
        let timeout = Duration::from_millis(self.config.task_timeout_ms);
        let mut set: JoinSet<Result<TaskReport>> = JoinSet::new();

        for index in 0..fan_out {
            let worker = Arc::clone(&workers[index % workers.len()]);
            let subtask = SubTask {
                task_id: task.id.clone(),
                index,
                description: format!("{} [{}/{}]", task.description, index + 1, fan_out),
                prior_steps: 0,
            };
            let token = token.clone();
            set.spawn(async move {
                match tokio::time::timeout(timeout, worker.execute(&subtask, token)).await {
                    Ok(report) => report,
                    Err(_) => Err(Error::Timeout),
                }
            });
        }

        let mut reports = Vec::with_capacity(fan_out);
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(Ok(report)) => reports.push(report),
                Ok(Err(err)) => return Err(err),
                Err(join_err) => return Err(Error::Learning(format!("worker panicked: {join_err}"))),
            }
        }

        reports.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        let success = reports.iter().all(|r| r.status == TaskStatus::Completed);
        Ok(OrchestrationResult {
            task_id: task.id.clone(),
            strategy: Strategy::Parallel,
            reports,
            success,
        })
    }

    async fn run_sequential(
        &self,
        task: &TaskSpec,
        workers: &[Arc<dyn Worker>],
        token: CancelToken,
    ) -> Result<OrchestrationResult> {
        let steps = task.required_workers.clamp(1, workers.len());
        let timeout = Duration::from_millis(self.config.task_timeout_ms);
        let mut reports = Vec::with_capacity(steps);
        let mut prior_steps = 0;

        for (index, worker) in workers.iter().take(steps).enumerate() {
            if token.is_cancelled() {
                reports.push(TaskReport {
                    agent_id: worker.id(),
                    status: TaskStatus::Cancelled,
                    output: String::new(),
                    duration_ms: 0,
                });
                break;
            }

            let subtask = SubTask {
                task_id: task.id.clone(),
                index,
                description: task.description.clone(),
                prior_steps,
            };
            let report = match tokio::time::timeout(timeout, worker.execute(&subtask, token.clone()))
                .await
            {
                Ok(Ok(report)) => report,
                Ok(Err(err)) => TaskReport {
                    agent_id: worker.id(),
                    status: TaskStatus::Failed(err.to_string()),
                    output: String::new(),
                    duration_ms: 0,
                },
                Err(_) => TaskReport {
                    agent_id: worker.id(),
                    status: TaskStatus::Failed("timeout".to_string()),
                    output: String::new(),
                    duration_ms: timeout.as_millis() as u64,
                },
            };

            let completed = report.status == TaskStatus::Completed;
            reports.push(report);
            if completed {
                prior_steps += 1;
            }
        }

        let success = reports.iter().all(|r| r.status == TaskStatus::Completed);
        Ok(OrchestrationResult {
            task_id: task.id.clone(),
            strategy: Strategy::Sequential,
            reports,
            success,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_token_never_fires() {
        let token = CancelToken::never();
        assert!(!token.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancel_token_observes_signal() {
        let (tx, rx) = watch::channel(false);
        let token = CancelToken { rx };
        assert!(!token.is_cancelled());

        tx.send(true).unwrap();
        assert!(token.is_cancelled());
    }
}
