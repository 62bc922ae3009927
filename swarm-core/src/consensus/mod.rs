//! # Hive-Mind Consensus
//!
//! Byzantine-tolerant weighted voting over pattern contributions:
//! - [`voter`]: vote collection, Byzantine detection, reputation decay,
//!   quarantine
//! - [`aggregator`]: contribution grouping, conflict resolution, and
//!   submission of merged candidates to the voter
//! - [`types`]: proposals, votes, roster entries, round outcomes

pub mod aggregator;
pub mod types;
pub mod voter;

pub use aggregator::{AggregatorStats, Contribution, PatternAggregator};
pub use types::{
    ConsensusNode, ConsensusOutcome, Proposal, ProposalKind, RoundDecision, Vote, VoteChoice,
};
pub use voter::{ByzantineVoter, VoteSource};
