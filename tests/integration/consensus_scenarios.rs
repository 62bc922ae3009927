//! Hive-mind consensus end-to-end: contribution grouping, weighted
//! voting, Byzantine quarantine, rejection handling.

use std::sync::Arc;

use swarm_core::config::{AggregatorConfig, VoterConfig};
use swarm_core::consensus::{
    ByzantineVoter, ConsensusOutcome, Contribution, PatternAggregator, Proposal, Vote, VoteChoice,
    VoteSource,
};
use swarm_core::coordinator::Worker;
use swarm_core::error::Error;
use swarm_core::hooks::{Alert, AlertBus};
use swarm_core::storage::{NullCacheSink, SubstrateStore};
use swarm_core::types::WorkerRole;
use test_utils::{InMemoryStore, ScriptedWorker, pattern_with_confidence};

struct WorkerSource(Arc<ScriptedWorker>);

#[async_trait::async_trait]
impl VoteSource for WorkerSource {
    fn node_id(&self) -> String {
        self.0.as_ref().id()
    }

    async fn cast_vote(&self, proposal: &Proposal) -> swarm_core::Result<Vote> {
        self.0.as_ref().vote(proposal).await
    }
}

fn aggregator_with_workers(
    workers: &[(&str, f64, VoteChoice, f64)],
) -> (Arc<InMemoryStore>, Arc<ByzantineVoter>, PatternAggregator, AlertBus) {
    let store = Arc::new(InMemoryStore::new());
    let alerts = AlertBus::new();
    let voter = Arc::new(ByzantineVoter::new(VoterConfig::default(), alerts.clone()));

    let aggregator = PatternAggregator::new(
        AggregatorConfig {
            aggregation_interval_ms: 0,
            ..AggregatorConfig::default()
        },
        Arc::clone(&store) as Arc<dyn SubstrateStore>,
        Arc::new(NullCacheSink),
        Arc::clone(&voter),
        alerts.clone(),
    );

    for (id, reputation, choice, confidence) in workers {
        let worker = Arc::new(
            ScriptedWorker::new(id, WorkerRole::Reviewer).with_vote(*choice, *confidence),
        );
        voter.register_node(*id, *reputation);
        aggregator.register_source(Arc::new(WorkerSource(worker)));
    }

    (store, voter, aggregator, alerts)
}

/// The worked five-node scenario: three strong approvals beat two
/// rejections, and the low-confidence rejector is quarantined.
#[tokio::test]
async fn test_weighted_approval_with_byzantine_quarantine() {
    let (store, voter, aggregator, _alerts) = aggregator_with_workers(&[
        ("n1", 0.9, VoteChoice::Approve, 0.9),
        ("n2", 0.85, VoteChoice::Approve, 0.8),
        ("n3", 0.9, VoteChoice::Approve, 0.9),
        ("n4", 0.8, VoteChoice::Reject, 0.7),
        ("n5", 0.3, VoteChoice::Reject, 0.2),
    ]);

    // Two contributors reach min_contributors and aggregate immediately
    let outcome = aggregator
        .submit(Contribution::new(
            pattern_with_confidence("deploy canary rollout", 0.8, 6, 1),
            "contrib-a",
            0.9,
        ))
        .await
        .unwrap();
    assert!(outcome.is_none());

    let outcome = aggregator
        .submit(Contribution::new(
            pattern_with_confidence("deploy canary rollout", 0.82, 5, 1),
            "contrib-b",
            0.7,
        ))
        .await
        .unwrap()
        .expect("second contribution closes the group");

    match outcome {
        ConsensusOutcome::Approved { score, .. } => {
            // 2.27 approve weight over 2.89 total is roughly 0.785
            assert!((score - 0.785).abs() < 0.02, "score was {score}");
        }
        other => panic!("expected approval, got {other:?}"),
    }

    // Approved pattern was persisted
    assert_eq!(store.count_patterns().await.unwrap(), 1);
    assert_eq!(aggregator.stats().approved, 1);

    // n5 cast a definitive vote below the confidence floor: decayed
    // from 0.3 to the 0.2 floor and quarantined before the next round
    assert!((voter.reputation("n5").unwrap() - 0.2).abs() < 1e-9);
    let n5 = voter.roster().into_iter().find(|n| n.id == "n5").unwrap();
    assert!(n5.quarantined);
    assert_eq!(voter.active_nodes(), 4);
}

/// A rejected group stores nothing and raises the rejection alert.
#[tokio::test]
async fn test_rejection_stores_nothing_and_alerts() {
    let (store, _voter, aggregator, alerts) = aggregator_with_workers(&[
        ("n1", 0.9, VoteChoice::Reject, 0.9),
        ("n2", 0.9, VoteChoice::Reject, 0.9),
        ("n3", 0.9, VoteChoice::Approve, 0.6),
    ]);
    let mut alert_rx = alerts.subscribe();

    let outcome = aggregator
        .submit(Contribution::new(
            pattern_with_confidence("risky direct push", 0.6, 2, 3),
            "contrib-a",
            0.5,
        ))
        .await
        .unwrap();
    assert!(outcome.is_none());

    let outcome = aggregator
        .submit(Contribution::new(
            pattern_with_confidence("risky direct push", 0.58, 1, 3),
            "contrib-b",
            0.5,
        ))
        .await
        .unwrap()
        .expect("group closes at two contributors");

    assert!(matches!(outcome, ConsensusOutcome::Rejected { .. }));
    assert_eq!(store.count_patterns().await.unwrap(), 0);
    assert_eq!(aggregator.stats().rejected, 1);

    let alert = alert_rx.recv().await.unwrap();
    assert!(matches!(alert, Alert::PatternRejected { .. }));
}

/// Below the minimum roster, submission fails before any round opens.
#[tokio::test]
async fn test_insufficient_nodes_fails_fast() {
    let (_store, _voter, aggregator, _alerts) = aggregator_with_workers(&[
        ("n1", 0.9, VoteChoice::Approve, 0.9),
        ("n2", 0.9, VoteChoice::Approve, 0.9),
    ]);

    aggregator
        .submit(Contribution::new(
            pattern_with_confidence("lonely pattern", 0.7, 3, 0),
            "contrib-a",
            0.8,
        ))
        .await
        .unwrap();

    let err = aggregator
        .submit(Contribution::new(
            pattern_with_confidence("lonely pattern", 0.7, 3, 0),
            "contrib-b",
            0.8,
        ))
        .await;

    assert!(matches!(err, Err(Error::InsufficientNodes { have: 2, need: 3 })));
}

/// Success-rate disagreement resolves by vote: the contribution with
/// the most recorded successes wins outright.
#[tokio::test]
async fn test_success_rate_conflict_resolved_by_vote() {
    let (store, _voter, aggregator, _alerts) = aggregator_with_workers(&[
        ("n1", 0.9, VoteChoice::Approve, 0.9),
        ("n2", 0.9, VoteChoice::Approve, 0.9),
        ("n3", 0.9, VoteChoice::Approve, 0.9),
    ]);

    // Same confidence, wildly different success rates
    let strong = pattern_with_confidence("migrate with backups", 0.8, 9, 1);
    let weak = pattern_with_confidence("migrate with backups", 0.8, 1, 4);

    aggregator
        .submit(Contribution::new(weak, "pessimist", 0.9))
        .await
        .unwrap();
    let outcome = aggregator
        .submit(Contribution::new(strong.clone(), "optimist", 0.4))
        .await
        .unwrap()
        .expect("group closes");
    assert!(outcome.is_approved());

    let stored = store.get_pattern(strong.id).await.unwrap().unwrap();
    // The vote strategy picked the high-success contribution wholesale
    assert_eq!(stored.metrics.success, 9);
    assert_eq!(stored.metrics.failure, 1);
}
