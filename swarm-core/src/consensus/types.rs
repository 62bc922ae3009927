use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::pattern::Pattern;
use crate::types::NodeId;

/// What a proposal asks the hive to decide
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalKind {
    PatternValidation,
    ResourceAllocation,
    StrategyChange,
    EmergencyAction,
}

/// A decision put before the voter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Proposal {
    pub id: Uuid,
    pub kind: ProposalKind,
    /// Human-readable subject line
    pub subject: String,
    /// Pattern under validation, for `PatternValidation` proposals
    pub pattern: Option<Pattern>,
    /// Minimum participation fraction for a round to score
    pub required_quorum: f64,
    /// Minimum weighted-approve fraction for acceptance
    pub required_consensus: f64,
}

impl Proposal {
    /// Pattern-validation proposal at the given thresholds
    #[must_use]
    pub fn pattern_validation(pattern: Pattern, quorum: f64, consensus: f64) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind: ProposalKind::PatternValidation,
            subject: format!("validate pattern '{}'", pattern.name),
            pattern: Some(pattern),
            required_quorum: quorum,
            required_consensus: consensus,
        }
    }
}

/// A node's stance on a proposal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoteChoice {
    Approve,
    Reject,
    Abstain,
}

/// One vote in one round; ephemeral, never persisted standalone
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vote {
    pub node_id: NodeId,
    pub choice: VoteChoice,
    /// Voter's confidence in its own choice (0.0 to 1.0)
    pub confidence: f64,
    pub reasoning: String,
    pub timestamp: DateTime<Utc>,
}

impl Vote {
    #[must_use]
    pub fn new(node_id: impl Into<NodeId>, choice: VoteChoice, confidence: f64) -> Self {
        Self {
            node_id: node_id.into(),
            choice,
            confidence: confidence.clamp(0.0, 1.0),
            reasoning: String::new(),
            timestamp: Utc::now(),
        }
    }
}

/// Roster entry for a voting node.
///
/// Mutated only by the voter, after a round completes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusNode {
    pub id: NodeId,
    /// Vote weight factor (0.0 to 1.0), decayed on suspicious behavior
    pub reputation: f64,
    /// Rolling average vote latency
    pub response_time_ms: f64,
    /// Fraction of rounds the node responded in time
    pub reliability: f64,
    pub last_seen: DateTime<Utc>,
    pub quarantined: bool,
}

impl ConsensusNode {
    #[must_use]
    pub fn new(id: impl Into<NodeId>, reputation: f64) -> Self {
        Self {
            id: id.into(),
            reputation: reputation.clamp(0.0, 1.0),
            response_time_ms: 0.0,
            reliability: 1.0,
            last_seen: Utc::now(),
            quarantined: false,
        }
    }
}

/// Terminal result of a consensus attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ConsensusOutcome {
    /// Weighted approval cleared the consensus threshold
    Approved { score: f64, participation: f64 },
    /// The round completed but approval fell short
    Rejected { score: f64, participation: f64 },
    /// Quorum was never reached within `max_rounds`
    Timeout { rounds: u32 },
}

impl ConsensusOutcome {
    #[must_use]
    pub fn is_approved(&self) -> bool {
        matches!(self, ConsensusOutcome::Approved { .. })
    }
}

/// Scored result of one completed round, before reputation effects
#[derive(Debug, Clone, PartialEq)]
pub struct RoundDecision {
    /// Weighted approve fraction
    pub score: f64,
    /// Participation fraction
    pub participation: f64,
    /// Whether the score cleared the proposal's consensus threshold
    pub approved: bool,
    /// Nodes flagged as Byzantine this round
    pub suspicious: Vec<NodeId>,
}
