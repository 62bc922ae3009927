//! Byzantine-tolerant weighted voting.
//!
//! Votes are weighted by `reputation * confidence`. Per-vote Byzantine
//! detection flags low-confidence definitive votes, outliers against a
//! strong majority, repeat offenders, and high-reputation nodes casting
//! uncertain votes. Flagged nodes lose reputation and are quarantined
//! once they fall to the floor. A round is only ever scored once its
//! vote set is final, so the decision is a pure function of that set.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use tracing::{debug, info, instrument, warn};

use crate::config::VoterConfig;
use crate::error::{Error, Result};
use crate::hooks::{Alert, AlertBus};
use crate::types::NodeId;

use super::types::{ConsensusNode, ConsensusOutcome, Proposal, RoundDecision, Vote, VoteChoice};

/// Rounds of suspicion history kept per node
const SUSPICION_WINDOW: usize = 5;

/// Suspicious marks within the window that flag a repeat offender
const SUSPICION_LIMIT: usize = 3;

/// Dissent against a majority holding more than this share of
/// definitive votes is flagged as an outlier
const OUTLIER_DELTA: f64 = 0.2;

/// Something that can cast a vote on a proposal (worker nodes, remote
/// peers). Implementations should respond within the round timeout or
/// be excluded from the round.
#[async_trait]
pub trait VoteSource: Send + Sync {
    /// Roster id this source votes as
    fn node_id(&self) -> NodeId;

    /// Cast a vote on the proposal
    async fn cast_vote(&self, proposal: &Proposal) -> Result<Vote>;
}

/// Weighted-vote collector with Byzantine detection and reputation decay
pub struct ByzantineVoter {
    config: VoterConfig,
    nodes: RwLock<HashMap<NodeId, ConsensusNode>>,
    /// Per-node suspicion marks over the last [`SUSPICION_WINDOW`] rounds
    suspicion: RwLock<HashMap<NodeId, VecDeque<bool>>>,
    alerts: AlertBus,
}

impl ByzantineVoter {
    #[must_use]
    pub fn new(config: VoterConfig, alerts: AlertBus) -> Self {
        Self {
            config,
            nodes: RwLock::new(HashMap::new()),
            suspicion: RwLock::new(HashMap::new()),
            alerts,
        }
    }

    /// Register a node with the given starting reputation
    pub fn register_node(&self, id: impl Into<NodeId>, reputation: f64) {
        let node = ConsensusNode::new(id, reputation);
        debug!(node_id = %node.id, reputation, "consensus node registered");
        self.nodes.write().insert(node.id.clone(), node);
    }

    /// Remove a node from the roster
    pub fn unregister_node(&self, id: &str) {
        self.nodes.write().remove(id);
        self.suspicion.write().remove(id);
    }

    /// Active (non-quarantined) roster size
    #[must_use]
    pub fn active_nodes(&self) -> usize {
        self.nodes.read().values().filter(|n| !n.quarantined).count()
    }

    /// Roster snapshot for status reporting
    #[must_use]
    pub fn roster(&self) -> Vec<ConsensusNode> {
        self.nodes.read().values().cloned().collect()
    }

    /// Current reputation of a node, if registered
    #[must_use]
    pub fn reputation(&self, id: &str) -> Option<f64> {
        self.nodes.read().get(id).map(|n| n.reputation)
    }

    /// Run a proposal through up to `max_rounds` collection rounds.
    ///
    /// Nodes missing the per-round timeout are excluded from that
    /// round. A round below quorum retries; exhausting retries yields
    /// `ConsensusOutcome::Timeout` and nothing is persisted.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InsufficientNodes`] when the active roster is
    /// below the configured minimum, [`Error::Cancelled`] when shutdown
    /// interrupts collection (the partial round is discarded).
    #[instrument(skip_all, fields(proposal = %proposal.id, kind = ?proposal.kind))]
    pub async fn submit(
        &self,
        proposal: &Proposal,
        sources: &[Arc<dyn VoteSource>],
        mut shutdown: Option<tokio::sync::watch::Receiver<bool>>,
    ) -> Result<ConsensusOutcome> {
        let roster_size = self.active_nodes();
        if roster_size < self.config.min_nodes {
            return Err(Error::InsufficientNodes {
                have: roster_size,
                need: self.config.min_nodes,
            });
        }

        for round in 1..=self.config.max_rounds {
            let votes = self.collect_votes(proposal, sources, shutdown.as_mut()).await?;
            let participation = votes.len() as f64 / roster_size as f64;

            if participation < proposal.required_quorum {
                warn!(
                    round,
                    participation,
                    quorum = proposal.required_quorum,
                    "quorum not met, retrying"
                );
                continue;
            }

            let decision = self.score_round(proposal, &votes);
            self.apply_reputation_effects(&decision.suspicious);

            info!(
                round,
                score = decision.score,
                approved = decision.approved,
                suspicious = decision.suspicious.len(),
                "round scored"
            );

            return Ok(if decision.approved {
                ConsensusOutcome::Approved {
                    score: decision.score,
                    participation: decision.participation,
                }
            } else {
                ConsensusOutcome::Rejected {
                    score: decision.score,
                    participation: decision.participation,
                }
            });
        }

        Ok(ConsensusOutcome::Timeout {
            rounds: self.config.max_rounds,
        })
    }

    /// Collect one round of votes with a per-node timeout. Quarantined
    /// and unregistered sources are skipped; errors and timeouts
    /// exclude the node from the round.
    async fn collect_votes(
        &self,
        proposal: &Proposal,
        sources: &[Arc<dyn VoteSource>],
        shutdown: Option<&mut tokio::sync::watch::Receiver<bool>>,
    ) -> Result<Vec<Vote>> {
        let timeout = Duration::from_millis(self.config.round_timeout_ms);
        let eligible: Vec<&Arc<dyn VoteSource>> = {
            let nodes = self.nodes.read();
            sources
                .iter()
                .filter(|s| nodes.get(&s.node_id()).is_some_and(|n| !n.quarantined))
                .collect()
        };

        let collection = futures::future::join_all(eligible.iter().map(|source| async {
            let started = std::time::Instant::now();
            let result = tokio::time::timeout(timeout, source.cast_vote(proposal)).await;
            (source.node_id(), started.elapsed(), result)
        }));

        let results = if let Some(shutdown) = shutdown {
            tokio::select! {
                results = collection => results,
                _ = shutdown.changed() => {
                    // Partial rounds are discarded, never persisted
                    return Err(Error::Cancelled);
                }
            }
        } else {
            collection.await
        };

        let mut votes = Vec::new();
        for (node_id, elapsed, result) in results {
            match result {
                Ok(Ok(vote)) => {
                    self.note_response(&node_id, elapsed, true);
                    votes.push(vote);
                }
                Ok(Err(err)) => {
                    warn!(node_id = %node_id, "vote failed: {err}");
                    self.note_response(&node_id, elapsed, false);
                }
                Err(_) => {
                    debug!(node_id = %node_id, "vote timed out, excluded from round");
                    self.note_response(&node_id, elapsed, false);
                }
            }
        }

        // Last write wins per node: the decision depends only on the
        // final vote set, not arrival order
        let mut by_node: HashMap<NodeId, Vote> = HashMap::new();
        for vote in votes {
            by_node.insert(vote.node_id.clone(), vote);
        }
        Ok(by_node.into_values().collect())
    }

    /// Score a completed round. Pure in the (votes, reputations,
    /// thresholds) tuple; no roster mutation happens here.
    #[must_use]
    pub fn score_round(&self, proposal: &Proposal, votes: &[Vote]) -> RoundDecision {
        let nodes = self.nodes.read();
        let suspicion = self.suspicion.read();

        // Majority share among definitive votes, for outlier detection
        let definitive: Vec<&Vote> = votes
            .iter()
            .filter(|v| v.choice != VoteChoice::Abstain)
            .collect();
        let approve_share = if definitive.is_empty() {
            0.5
        } else {
            definitive
                .iter()
                .filter(|v| v.choice == VoteChoice::Approve)
                .count() as f64
                / definitive.len() as f64
        };

        let mut suspicious = Vec::new();
        let mut weight_total = 0.0;
        let mut weight_approve = 0.0;

        for vote in votes {
            let Some(node) = nodes.get(&vote.node_id) else {
                continue;
            };

            if self.is_suspicious(vote, node, approve_share, &suspicion) {
                suspicious.push(vote.node_id.clone());
            }

            if vote.choice == VoteChoice::Abstain {
                continue;
            }
            let weight = node.reputation * vote.confidence;
            weight_total += weight;
            if vote.choice == VoteChoice::Approve {
                weight_approve += weight;
            }
        }

        let score = if weight_total > 0.0 {
            weight_approve / weight_total
        } else {
            0.0
        };

        RoundDecision {
            score,
            participation: votes.len() as f64 / nodes.values().filter(|n| !n.quarantined).count().max(1) as f64,
            approved: score >= proposal.required_consensus,
            suspicious,
        }
    }

    fn is_suspicious(
        &self,
        vote: &Vote,
        node: &ConsensusNode,
        approve_share: f64,
        suspicion: &HashMap<NodeId, VecDeque<bool>>,
    ) -> bool {
        // Definitive vote with almost no confidence behind it
        if vote.choice != VoteChoice::Abstain && vote.confidence < 0.3 {
            return true;
        }

        // Outlier against a strong majority share
        let strong_majority = 1.0 - OUTLIER_DELTA;
        let (majority_choice, majority_share) = if approve_share >= 0.5 {
            (VoteChoice::Approve, approve_share)
        } else {
            (VoteChoice::Reject, 1.0 - approve_share)
        };
        if vote.choice != VoteChoice::Abstain
            && majority_share > strong_majority
            && vote.choice != majority_choice
        {
            return true;
        }

        // Repeat offender within the suspicion window
        if let Some(marks) = suspicion.get(&vote.node_id) {
            if marks.iter().filter(|&&m| m).count() >= SUSPICION_LIMIT {
                return true;
            }
        }

        // Trusted node casting an uncertain vote
        if node.reputation > 0.8 && vote.confidence < 0.5 {
            return true;
        }

        false
    }

    /// Decay and quarantine flagged nodes; append suspicion history for
    /// every roster node.
    fn apply_reputation_effects(&self, suspicious: &[NodeId]) {
        let mut nodes = self.nodes.write();
        let mut suspicion = self.suspicion.write();

        for (id, node) in nodes.iter_mut() {
            let flagged = suspicious.contains(id);
            let marks = suspicion.entry(id.clone()).or_default();
            if marks.len() >= SUSPICION_WINDOW {
                marks.pop_front();
            }
            marks.push_back(flagged);

            if flagged {
                node.reputation = (node.reputation - self.config.reputation_decay).max(0.0);
                node.last_seen = Utc::now();
                if node.reputation <= self.config.quarantine_threshold && !node.quarantined {
                    node.quarantined = true;
                    warn!(node_id = %id, reputation = node.reputation, "node quarantined");
                    self.alerts.raise(Alert::ByzantineFault {
                        node_id: id.clone(),
                        reputation: node.reputation,
                    });
                }
            }
        }
    }

    fn note_response(&self, node_id: &str, elapsed: Duration, responded: bool) {
        let mut nodes = self.nodes.write();
        if let Some(node) = nodes.get_mut(node_id) {
            let sample = elapsed.as_millis() as f64;
            node.response_time_ms = if node.response_time_ms == 0.0 {
                sample
            } else {
                0.8 * node.response_time_ms + 0.2 * sample
            };
            node.reliability = 0.9 * node.reliability + if responded { 0.1 } else { 0.0 };
            node.last_seen = Utc::now();
        }
    }
}
