//! Scripted workers for coordinator and consensus tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use swarm_core::consensus::{Proposal, Vote, VoteChoice};
use swarm_core::coordinator::{CancelToken, SubTask, TaskReport, TaskStatus, Worker};
use swarm_core::error::{Error, Result};
use swarm_core::pattern::Pattern;
use swarm_core::types::{AgentId, WorkerRole};

/// An approve vote at the given confidence
#[must_use]
pub fn approve_vote(node_id: &str, confidence: f64) -> Vote {
    Vote::new(node_id, VoteChoice::Approve, confidence)
}

/// A reject vote at the given confidence
#[must_use]
pub fn reject_vote(node_id: &str, confidence: f64) -> Vote {
    Vote::new(node_id, VoteChoice::Reject, confidence)
}

/// Worker with pre-scripted behavior: fixed vote, optional failure,
/// optional execution delay, and a record of executed subtasks.
pub struct ScriptedWorker {
    id: AgentId,
    role: WorkerRole,
    vote: Vote,
    fail_execution: bool,
    delay: Duration,
    contributions: Mutex<Vec<Pattern>>,
    executed: AtomicUsize,
    absorbed: AtomicUsize,
}

impl ScriptedWorker {
    #[must_use]
    pub fn new(id: &str, role: WorkerRole) -> Self {
        Self {
            id: id.to_string(),
            role,
            vote: approve_vote(id, 0.9),
            fail_execution: false,
            delay: Duration::ZERO,
            contributions: Mutex::new(Vec::new()),
            executed: AtomicUsize::new(0),
            absorbed: AtomicUsize::new(0),
        }
    }

    /// Script the vote this worker casts on every proposal
    #[must_use]
    pub fn with_vote(mut self, choice: VoteChoice, confidence: f64) -> Self {
        self.vote = Vote::new(self.id.clone(), choice, confidence);
        self
    }

    /// Make every execution fail
    #[must_use]
    pub fn failing(mut self) -> Self {
        self.fail_execution = true;
        self
    }

    /// Delay each execution (for timeout and cancellation tests)
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Queue patterns returned by the next `contribute` call
    pub fn add_contribution(&self, pattern: Pattern) {
        self.contributions.lock().push(pattern);
    }

    /// Subtasks executed so far
    #[must_use]
    pub fn executed_count(&self) -> usize {
        self.executed.load(Ordering::SeqCst)
    }

    /// Patterns absorbed via collective learning so far
    #[must_use]
    pub fn absorbed_count(&self) -> usize {
        self.absorbed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Worker for ScriptedWorker {
    fn id(&self) -> AgentId {
        self.id.clone()
    }

    fn role(&self) -> WorkerRole {
        self.role
    }

    async fn execute(&self, subtask: &SubTask, cancel: CancelToken) -> Result<TaskReport> {
        let started = std::time::Instant::now();
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        if cancel.is_cancelled() {
            return Ok(TaskReport {
                agent_id: self.id.clone(),
                status: TaskStatus::Cancelled,
                output: String::new(),
                duration_ms: started.elapsed().as_millis() as u64,
            });
        }

        self.executed.fetch_add(1, Ordering::SeqCst);
        if self.fail_execution {
            return Err(Error::Learning(format!(
                "scripted failure on subtask {}",
                subtask.index
            )));
        }

        Ok(TaskReport {
            agent_id: self.id.clone(),
            status: TaskStatus::Completed,
            output: format!("done: {}", subtask.description),
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }

    async fn vote(&self, _proposal: &Proposal) -> Result<Vote> {
        Ok(self.vote.clone())
    }

    async fn contribute(&self) -> Result<Vec<Pattern>> {
        Ok(self.contributions.lock().drain(..).collect())
    }

    async fn absorb(&self, patterns: &[Pattern]) -> Result<()> {
        self.absorbed.fetch_add(patterns.len(), Ordering::SeqCst);
        Ok(())
    }
}
