#![allow(clippy::cast_precision_loss)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_docs_in_private_items)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::float_cmp)]

//! # Swarm Core
//!
//! Self-learning coordination substrate for multi-agent task execution.
//! Agents execute tasks; the substrate observes executions, extracts
//! reusable patterns, scores their confidence against outcomes, and on
//! later tasks retrieves matching patterns to warm goal-oriented
//! planning and to predict verification outcomes before changes
//! propagate.
//!
//! ## Subsystems
//!
//! - [`learning`]: observation capture, frequent-sequence extraction,
//!   Bayesian confidence updates
//! - [`planner`]: A* over world states with pattern-boosted heuristics
//!   and adaptive replanning
//! - [`consensus`]: Byzantine-tolerant weighted voting and federated
//!   pattern aggregation
//! - [`coordinator`]: worker lifecycle and parallel / sequential /
//!   adaptive task delegation
//! - [`verification`]: truth-score prediction with adaptive thresholds
//!   and rollback triggers
//! - [`index`]: embedding generation and cosine retrieval
//! - [`storage`]: the store trait every mutation flows through
//! - [`hooks`]: status, metrics, alerts, and pattern export/import for
//!   external collaborators
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use swarm_core::config::SubstrateConfig;
//! use swarm_core::storage::NullCacheSink;
//! use swarm_core::substrate::Substrate;
//! use swarm_core::types::{Scalar, WorldState};
//! use swarm_core::planner::action::Action;
//! use swarm_core::planner::plan::PlanConstraints;
//!
//! # async fn example(store: Arc<dyn swarm_core::storage::SubstrateStore>) -> swarm_core::Result<()> {
//! let substrate = Substrate::init(
//!     SubstrateConfig::default(),
//!     store,
//!     Arc::new(NullCacheSink),
//! )
//! .await?;
//!
//! let current = WorldState::from_vars([("built".to_string(), Scalar::Bool(false))]);
//! let goal = WorldState::from_vars([("built".to_string(), Scalar::Bool(true))]);
//! let actions = vec![Action::new("build", 10.0).sets("built", Scalar::Bool(true))];
//!
//! let plan = substrate
//!     .planner()
//!     .plan("task-1".to_string(), &current, &goal, &actions, PlanConstraints::default())
//!     .await?;
//! println!("planned {} actions at cost {}", plan.actions.len(), plan.total_cost);
//!
//! substrate.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod consensus;
pub mod coordinator;
pub mod error;
pub mod hooks;
pub mod index;
pub mod learning;
pub mod pattern;
pub mod planner;
pub mod retry;
pub mod storage;
pub mod substrate;
pub mod types;
pub mod verification;

pub use config::SubstrateConfig;
pub use consensus::{
    ByzantineVoter, ConsensusNode, ConsensusOutcome, Contribution, PatternAggregator, Proposal,
    ProposalKind, Vote, VoteChoice, VoteSource,
};
pub use coordinator::{
    CancelToken, Coordinator, OrchestrationResult, Strategy, SubTask, TaskReport, TaskSpec,
    TaskStatus, Worker,
};
pub use error::{Error, NoPlanReason, Result};
pub use hooks::{Alert, AlertBus, MetricsRegistry, MetricsSnapshot, StatusSnapshot};
pub use index::{EmbeddingProvider, HashEmbedder, VectorIndex, cosine_similarity};
pub use learning::{LearningPipeline, Observed, PatternMatch, PipelineState};
pub use learning::confidence::{ConfidenceUpdater, OutcomeSample};
pub use learning::extractor::PatternExtractor;
pub use pattern::{Generalization, Pattern, PatternKind, PatternMetrics, SuccessCriteria};
pub use planner::GoapPlanner;
pub use planner::action::{Action, Effect, RiskLevel};
pub use planner::heuristic::HeuristicEntry;
pub use planner::plan::{ExecutionOutcome, Plan, PlanConstraints, PlanMethod};
pub use planner::replan::{Replanner, ReplanTrigger};
pub use storage::{
    LinkRelation, NullCacheSink, PatternCacheSink, PatternLink, PatternQuery, SubstrateStore,
    TaskTrajectory,
};
pub use substrate::Substrate;
pub use types::{
    AgentId, NodeId, Observation, OutcomeKind, PatternId, PlanId, Scalar, TaskId, WorkerRole,
    WorldState,
};
pub use verification::{
    AdaptiveThreshold, AgentReliability, ChangeContext, ReliabilityTrend, TruthPrediction,
    VerificationOutcome, VerificationPredictor,
};
