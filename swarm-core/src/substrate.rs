//! Top-level wiring of the substrate.
//!
//! The live pattern cache, the voter roster, and the worker set are
//! process-wide by convention but never module-level globals: this
//! container owns them and hands explicit handles to components.
//! Lifecycle: [`Substrate::init`] before the first `observe`;
//! [`Substrate::shutdown`] flushes pending extraction and aggregation,
//! cancels voter rounds, and stops background tasks.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::SubstrateConfig;
use crate::consensus::{ByzantineVoter, PatternAggregator};
use crate::coordinator::Coordinator;
use crate::error::Result;
use crate::hooks::{self, AlertBus, MetricsRegistry, StatusSnapshot};
use crate::index::{HashEmbedder, VectorIndex};
use crate::learning::LearningPipeline;
use crate::learning::confidence::ConfidenceUpdater;
use crate::planner::GoapPlanner;
use crate::planner::replan::Replanner;
use crate::storage::{PatternCacheSink, SubstrateStore};
use crate::verification::VerificationPredictor;

/// Capacity of the fast-plan candidate channel
const CANDIDATE_CHANNEL_CAPACITY: usize = 64;

/// Assembled substrate with owned background tasks
pub struct Substrate {
    config: SubstrateConfig,
    store: Arc<dyn SubstrateStore>,
    cache: Arc<dyn PatternCacheSink>,
    index: Arc<VectorIndex>,
    metrics: Arc<MetricsRegistry>,
    alerts: AlertBus,
    voter: Arc<ByzantineVoter>,
    aggregator: Arc<PatternAggregator>,
    pipeline: Arc<LearningPipeline>,
    planner: Arc<GoapPlanner>,
    replanner: Arc<Replanner>,
    coordinator: Arc<Coordinator>,
    predictor: Arc<VerificationPredictor>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Substrate {
    /// Assemble and start the substrate over a store and cache sink.
    ///
    /// Validates configuration fail-fast, rebuilds the vector index
    /// from the store, and spawns the flush/aggregation and reindex
    /// background tasks.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Validation`] for bad configuration and
    /// storage errors from the initial index rebuild.
    pub async fn init(
        config: SubstrateConfig,
        store: Arc<dyn SubstrateStore>,
        cache: Arc<dyn PatternCacheSink>,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        let metrics = Arc::new(MetricsRegistry::new());
        let alerts = AlertBus::new();
        let index = Arc::new(VectorIndex::new(
            config.index.clone(),
            Arc::new(HashEmbedder::new(config.index.dims)),
        ));
        index.rebuild(&store).await?;

        let voter = Arc::new(ByzantineVoter::new(config.voter.clone(), alerts.clone()));
        let aggregator = Arc::new(PatternAggregator::new(
            config.aggregator.clone(),
            Arc::clone(&store),
            Arc::clone(&cache),
            Arc::clone(&voter),
            alerts.clone(),
        ));
        let updater = Arc::new(ConfidenceUpdater::new(Arc::clone(&store), Arc::clone(&cache)));

        let (candidate_tx, candidate_rx) = mpsc::channel(CANDIDATE_CHANNEL_CAPACITY);
        let planner = Arc::new(
            GoapPlanner::new(config.planner.clone(), Arc::clone(&store), Arc::clone(&index))
                .with_candidate_channel(candidate_tx),
        );
        let replanner = Arc::new(Replanner::new(config.planner.clone(), Arc::clone(&planner)));

        let pipeline = Arc::new(LearningPipeline::new(
            config.pipeline.clone(),
            config.extractor.clone(),
            updater,
            Arc::clone(&aggregator),
            Arc::clone(&store),
            Arc::clone(&index),
            Arc::clone(&metrics),
            "local",
        ));

        let coordinator = Arc::new(Coordinator::new(
            config.coordinator.clone(),
            Arc::clone(&voter),
            Arc::clone(&aggregator),
            Arc::clone(&store),
        ));
        let predictor = Arc::new(VerificationPredictor::new(
            config.verifier.clone(),
            Arc::clone(&store),
            alerts.clone(),
        ));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let substrate = Arc::new(Self {
            config,
            store,
            cache,
            index,
            metrics,
            alerts,
            voter,
            aggregator,
            pipeline,
            planner,
            replanner,
            coordinator,
            predictor,
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        });

        substrate.spawn_background(shutdown_rx, candidate_rx);
        info!("substrate initialized");
        Ok(substrate)
    }

    fn spawn_background(
        self: &Arc<Self>,
        shutdown_rx: watch::Receiver<bool>,
        mut candidate_rx: mpsc::Receiver<crate::pattern::Pattern>,
    ) {
        let mut tasks = self.tasks.lock();

        tasks.push(self.pipeline.spawn_flush_task(shutdown_rx.clone()));

        // Drain fast-plan candidates into training
        let pipeline = Arc::clone(&self.pipeline);
        let mut candidate_shutdown = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    candidate = candidate_rx.recv() => {
                        let Some(candidate) = candidate else { break };
                        if let Err(err) = pipeline.train(candidate).await {
                            warn!("fast-plan candidate training failed: {err}");
                        }
                    }
                    _ = candidate_shutdown.changed() => break,
                }
            }
        }));

        // Health watch: cache memory budget and store liveness
        let cache = Arc::clone(&self.cache);
        let health_store = Arc::clone(&self.store);
        let alerts = self.alerts.clone();
        let mut health_shutdown = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(std::time::Duration::from_secs(30));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Some(used) = cache.memory_fill_fraction() {
                            if used > 0.9 {
                                alerts.raise(crate::hooks::Alert::MemoryPressure {
                                    used_fraction: used,
                                });
                            }
                        }
                        if let Err(err) = health_store.health_check().await {
                            if err.is_fatal() {
                                alerts.raise(crate::hooks::Alert::StoreCorrupt {
                                    detail: err.to_string(),
                                });
                            }
                        }
                    }
                    _ = health_shutdown.changed() => break,
                }
            }
        }));

        // Periodic index consistency recheck
        let index = Arc::clone(&self.index);
        let store = Arc::clone(&self.store);
        let mut reindex_shutdown = shutdown_rx;
        let interval = self.index.reindex_interval();
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The immediate first tick duplicates init's rebuild; skip it
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(err) = index.rebuild(&store).await {
                            warn!("index consistency recheck failed: {err}");
                        }
                    }
                    _ = reindex_shutdown.changed() => break,
                }
            }
        }));
    }

    /// Flush pending work, cancel voter rounds, stop background tasks.
    ///
    /// Idempotent; safe to call from multiple owners.
    pub async fn shutdown(&self) {
        info!("substrate shutting down");
        let _ = self.shutdown_tx.send(true);

        // Final flush and aggregation so buffered learning is not lost
        self.pipeline.flush().await;
        if let Err(err) = self.aggregator.tick().await {
            warn!("final aggregation tick failed: {err}");
        }

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(err) = task.await {
                if !err.is_cancelled() {
                    warn!("background task ended abnormally: {err}");
                }
            }
        }
    }

    /// Status snapshot for collaborators
    ///
    /// # Errors
    ///
    /// Returns storage errors from the snapshot queries.
    pub async fn get_status(&self) -> Result<StatusSnapshot> {
        hooks::get_status(&self.store, &self.metrics).await
    }

    /// Typed metrics snapshot for the metrics collaborator
    #[must_use]
    pub fn get_metrics(&self) -> crate::hooks::MetricsSnapshot {
        crate::hooks::MetricsSnapshot {
            counters: self.metrics.counters(),
            histograms: self.metrics.histograms(),
        }
    }

    /// Export live patterns and embeddings as JSON
    ///
    /// # Errors
    ///
    /// Returns storage or serialization errors.
    pub async fn export_patterns(&self) -> Result<String> {
        hooks::export_patterns(&self.store).await
    }

    /// Import a pattern bundle; returns how many patterns landed
    ///
    /// # Errors
    ///
    /// Returns parse and storage errors.
    pub async fn import_patterns(&self, json: &str) -> Result<usize> {
        let imported = hooks::import_patterns(&self.store, json).await?;
        self.index.rebuild(&self.store).await?;
        Ok(imported)
    }

    /// Subscribe to substrate alerts
    #[must_use]
    pub fn on_alert(&self) -> tokio::sync::broadcast::Receiver<crate::hooks::Alert> {
        self.alerts.subscribe()
    }

    // Component handles

    #[must_use]
    pub fn config(&self) -> &SubstrateConfig {
        &self.config
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn SubstrateStore> {
        &self.store
    }

    #[must_use]
    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    #[must_use]
    pub fn pipeline(&self) -> &Arc<LearningPipeline> {
        &self.pipeline
    }

    #[must_use]
    pub fn planner(&self) -> &Arc<GoapPlanner> {
        &self.planner
    }

    #[must_use]
    pub fn replanner(&self) -> &Arc<Replanner> {
        &self.replanner
    }

    #[must_use]
    pub fn voter(&self) -> &Arc<ByzantineVoter> {
        &self.voter
    }

    #[must_use]
    pub fn aggregator(&self) -> &Arc<PatternAggregator> {
        &self.aggregator
    }

    #[must_use]
    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    #[must_use]
    pub fn predictor(&self) -> &Arc<VerificationPredictor> {
        &self.predictor
    }

    #[must_use]
    pub fn index(&self) -> &Arc<VectorIndex> {
        &self.index
    }
}
