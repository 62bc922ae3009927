//! Pattern learning end-to-end: observations to extraction to
//! aggregation to consensus to store.

use std::sync::Arc;

use swarm_core::config::{
    AggregatorConfig, ExtractorConfig, PipelineConfig, VoterConfig,
};
use swarm_core::consensus::{ByzantineVoter, PatternAggregator};
use swarm_core::hooks::{AlertBus, MetricsRegistry};
use swarm_core::index::{HashEmbedder, VectorIndex};
use swarm_core::learning::confidence::ConfidenceUpdater;
use swarm_core::learning::{LearningPipeline, Observed};
use swarm_core::pattern::PatternKind;
use swarm_core::storage::{NullCacheSink, PatternQuery, SubstrateStore};
use swarm_core::types::{OutcomeKind, Scalar, WorkerRole, WorldState};
use test_utils::{InMemoryStore, ScriptedWorker};

struct Stack {
    store: Arc<InMemoryStore>,
    aggregator: Arc<PatternAggregator>,
    pipeline: Arc<LearningPipeline>,
}

/// Full learning stack over an in-memory store, with three scripted
/// approvers and an aggregation interval of zero so `tick` flushes
/// pending groups immediately.
fn learning_stack(observation_buffer: usize) -> Stack {
    let store = Arc::new(InMemoryStore::new());
    let store_dyn: Arc<dyn SubstrateStore> = Arc::clone(&store) as Arc<dyn SubstrateStore>;
    let alerts = AlertBus::new();

    let voter = Arc::new(ByzantineVoter::new(VoterConfig::default(), alerts.clone()));
    let aggregator = Arc::new(PatternAggregator::new(
        AggregatorConfig {
            aggregation_interval_ms: 0,
            ..AggregatorConfig::default()
        },
        Arc::clone(&store_dyn),
        Arc::new(NullCacheSink),
        Arc::clone(&voter),
        alerts,
    ));

    for id in ["w1", "w2", "w3"] {
        let worker = Arc::new(ScriptedWorker::new(id, WorkerRole::Implementer));
        voter.register_node(id, 0.9);
        aggregator.register_source(Arc::new(WorkerSource(worker)));
    }

    let index = Arc::new(VectorIndex::new(
        swarm_core::config::IndexConfig::default(),
        Arc::new(HashEmbedder::default()),
    ));
    let updater = Arc::new(ConfidenceUpdater::new(
        Arc::clone(&store_dyn),
        Arc::new(NullCacheSink),
    ));
    let pipeline = Arc::new(LearningPipeline::new(
        PipelineConfig {
            observation_buffer,
            ..PipelineConfig::default()
        },
        ExtractorConfig::default(),
        updater,
        Arc::clone(&aggregator),
        store_dyn,
        index,
        Arc::new(MetricsRegistry::new()),
        "local",
    ));

    Stack {
        store,
        aggregator,
        pipeline,
    }
}

/// Vote-source adapter for scripted workers
struct WorkerSource(Arc<ScriptedWorker>);

#[async_trait::async_trait]
impl swarm_core::consensus::VoteSource for WorkerSource {
    fn node_id(&self) -> String {
        swarm_core::coordinator::Worker::id(self.0.as_ref())
    }

    async fn cast_vote(
        &self,
        proposal: &swarm_core::consensus::Proposal,
    ) -> swarm_core::Result<swarm_core::consensus::Vote> {
        swarm_core::coordinator::Worker::vote(self.0.as_ref(), proposal).await
    }
}

/// Three tasks run the same successful sequence; one pattern comes out
/// the other end with full success accounting.
#[tokio::test]
async fn test_pattern_learned_from_repeated_success() {
    let stack = learning_stack(9);
    let pre = WorldState::from_vars([("env".to_string(), Scalar::from("ci"))]);

    for task in ["t1", "t2", "t3"] {
        for op in ["build", "test", "deploy"] {
            let post = {
                let mut s = pre.clone();
                s.set(format!("{op}_done"), Scalar::Bool(true));
                s
            };
            stack
                .pipeline
                .observe(task.to_string(), "agent-1".to_string(), op, pre.clone(), || async move {
                    Ok(Observed {
                        post_state: post,
                        outcome: OutcomeKind::Success,
                        value: (),
                    })
                })
                .await
                .unwrap();
        }
    }

    // The ninth observation filled the buffer and triggered extraction;
    // groups below min_contributors wait for the timer
    stack.aggregator.tick().await.unwrap();

    let learned = stack
        .store
        .query_patterns(&PatternQuery {
            kind: Some(PatternKind::Coordination),
            ..PatternQuery::default()
        })
        .await
        .unwrap();

    assert!(!learned.is_empty(), "expected at least one learned pattern");
    let best = learned
        .iter()
        .find(|p| p.actions == vec!["build", "test", "deploy"])
        .expect("full sequence pattern should be learned");

    assert_eq!(best.usage_count, 3);
    assert_eq!(best.metrics.success, 3);
    assert_eq!(best.kind, PatternKind::Coordination);
    // All successes with steady durations: confidence approaches 1
    assert!(best.confidence > 0.85, "confidence was {}", best.confidence);
}

/// A learned pattern is retrievable through `apply` for a matching
/// context and invisible for a non-matching one.
#[tokio::test]
async fn test_apply_respects_conditions_and_threshold() {
    let stack = learning_stack(50);

    let pattern = test_utils::pattern_with_confidence("build test deploy", 0.95, 10, 0);
    let mut conditioned = pattern.clone();
    conditioned
        .conditions
        .insert("env".to_string(), Scalar::from("ci"));
    stack.store.store_pattern(&conditioned).await.unwrap();

    // Index must know the pattern for apply to find it
    let store_dyn: Arc<dyn SubstrateStore> =
        Arc::clone(&stack.store) as Arc<dyn SubstrateStore>;
    let index = Arc::new(VectorIndex::new(
        swarm_core::config::IndexConfig::default(),
        Arc::new(HashEmbedder::default()),
    ));
    index.rebuild(&store_dyn).await.unwrap();

    let updater = Arc::new(ConfidenceUpdater::new(
        Arc::clone(&store_dyn),
        Arc::new(NullCacheSink),
    ));
    let pipeline = LearningPipeline::new(
        PipelineConfig {
            // Hash embeddings give arbitrary similarity; rank on
            // confidence alone for this test
            match_threshold: 0.1,
            ..PipelineConfig::default()
        },
        ExtractorConfig::default(),
        updater,
        Arc::clone(&stack.aggregator),
        store_dyn,
        index,
        Arc::new(MetricsRegistry::new()),
        "local",
    );

    let matching_ctx = WorldState::from_vars([("env".to_string(), Scalar::from("ci"))]);
    let found = pipeline.apply("run the build", &matching_ctx).await.unwrap();
    assert!(found.is_some());
    assert_eq!(found.unwrap().pattern.id, conditioned.id);

    // Context violating the pattern's conditions never matches
    let wrong_ctx = WorldState::from_vars([("env".to_string(), Scalar::from("prod"))]);
    assert!(pipeline.apply("run the build", &wrong_ctx).await.unwrap().is_none());
}

/// Re-extracting an unchanged window reproduces the same pattern id
/// and confidence.
#[tokio::test]
async fn test_re_extraction_is_idempotent() {
    use swarm_core::learning::extractor::PatternExtractor;

    let mut window = Vec::new();
    for task in ["t1", "t2", "t3"] {
        window.extend(test_utils::task_observations(
            task,
            &["lint", "build", "ship"],
            120,
            OutcomeKind::Success,
        ));
    }

    let extractor = PatternExtractor::default();
    let first = extractor.extract(&window, 10);
    let second = extractor.extract(&window, 10);

    assert_eq!(first.len(), second.len());
    for (a, b) in first.iter().zip(second.iter()) {
        assert_eq!(a.id, b.id);
        assert!((a.confidence - b.confidence).abs() < 1e-9);
    }
}
