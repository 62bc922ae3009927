//! Hook surface for external collaborators.
//!
//! The substrate runs as a library; CLIs, dashboards, and metric
//! scrapers consume it through this module: status snapshots, a typed
//! metrics registry, an alert broadcast, and pattern export/import.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::warn;

use crate::error::Result;
use crate::pattern::Pattern;
use crate::storage::SubstrateStore;
use crate::types::{AgentId, NodeId, PatternId, TaskId};

/// Capacity of the alert broadcast ring; slow subscribers lose the
/// oldest alerts rather than blocking producers.
const ALERT_CHANNEL_CAPACITY: usize = 256;

/// Samples kept per histogram for percentile estimation
const HISTOGRAM_WINDOW: usize = 1024;

/// Alert classes surfaced to collaborators
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Alert {
    /// A verification truth score missed its threshold
    TruthScoreBelowThreshold {
        agent_id: AgentId,
        truth_score: f64,
        threshold: f64,
    },
    /// A change was rolled back before propagation
    RollbackTriggered { task_id: TaskId, agent_id: AgentId },
    /// A consensus node was flagged as Byzantine
    ByzantineFault { node_id: NodeId, reputation: f64 },
    /// An aggregated pattern failed consensus
    PatternRejected { pattern_id: PatternId },
    /// The store failed its integrity check and is read-only
    StoreCorrupt { detail: String },
    /// Cache memory budget is above 90%
    MemoryPressure { used_fraction: f64 },
}

/// Broadcast channel for alerts.
///
/// Cloning shares the underlying channel; every subscriber sees every
/// alert raised after it subscribed.
#[derive(Clone)]
pub struct AlertBus {
    tx: broadcast::Sender<Alert>,
}

impl Default for AlertBus {
    fn default() -> Self {
        Self::new()
    }
}

impl AlertBus {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(ALERT_CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Subscribe to alerts raised from now on
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Alert> {
        self.tx.subscribe()
    }

    /// Raise an alert; silently dropped when no subscriber is attached
    pub fn raise(&self, alert: Alert) {
        let _ = self.tx.send(alert);
    }
}

/// Summary of one histogram's recent window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistogramSummary {
    pub count: u64,
    pub p50: f64,
    pub p95: f64,
    pub max: f64,
}

/// Process-wide typed metrics: named counters plus windowed histograms.
///
/// Registered as an explicit dependency of components that record into
/// it; never a module-level global.
#[derive(Default)]
pub struct MetricsRegistry {
    counters: Mutex<BTreeMap<String, Arc<AtomicU64>>>,
    histograms: Mutex<BTreeMap<String, Vec<f64>>>,
    histogram_counts: Mutex<BTreeMap<String, u64>>,
}

impl MetricsRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment a named counter
    pub fn incr(&self, name: &str) {
        self.add(name, 1);
    }

    /// Add to a named counter
    pub fn add(&self, name: &str, delta: u64) {
        let counter = {
            let mut counters = self.counters.lock();
            Arc::clone(counters.entry(name.to_string()).or_default())
        };
        counter.fetch_add(delta, Ordering::Relaxed);
    }

    /// Record a histogram observation (duration, size, score)
    pub fn observe(&self, name: &str, value: f64) {
        {
            let mut counts = self.histogram_counts.lock();
            *counts.entry(name.to_string()).or_insert(0) += 1;
        }
        let mut histograms = self.histograms.lock();
        let window = histograms.entry(name.to_string()).or_default();
        if window.len() >= HISTOGRAM_WINDOW {
            window.remove(0);
        }
        window.push(value);
    }

    /// Snapshot all counters
    #[must_use]
    pub fn counters(&self) -> BTreeMap<String, u64> {
        self.counters
            .lock()
            .iter()
            .map(|(name, counter)| (name.clone(), counter.load(Ordering::Relaxed)))
            .collect()
    }

    /// Snapshot all histograms as percentile summaries
    #[must_use]
    pub fn histograms(&self) -> BTreeMap<String, HistogramSummary> {
        let counts = self.histogram_counts.lock().clone();
        self.histograms
            .lock()
            .iter()
            .map(|(name, window)| {
                let mut sorted = window.clone();
                sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
                let summary = HistogramSummary {
                    count: counts.get(name).copied().unwrap_or(0),
                    p50: percentile(&sorted, 0.50),
                    p95: percentile(&sorted, 0.95),
                    max: sorted.last().copied().unwrap_or(0.0),
                };
                (name.clone(), summary)
            })
            .collect()
    }
}

fn percentile(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = ((sorted.len() as f64 - 1.0) * q).round() as usize;
    sorted[rank.min(sorted.len() - 1)]
}

/// Typed metrics stream snapshot returned by `get_metrics`; the
/// Prometheus collaborator renders these as counters and histograms.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub counters: BTreeMap<String, u64>,
    pub histograms: BTreeMap<String, HistogramSummary>,
}

/// Point-in-time snapshot returned by `get_status`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusSnapshot {
    /// Live (non-superseded) patterns in the store
    pub pattern_count: u64,
    /// Counter values at snapshot time
    pub counters: BTreeMap<String, u64>,
    /// Histogram summaries at snapshot time
    pub histograms: BTreeMap<String, HistogramSummary>,
    /// Snapshot instant
    pub taken_at: chrono::DateTime<chrono::Utc>,
}

/// Build a status snapshot from the store and the metrics registry.
///
/// # Errors
///
/// Returns storage errors from the pattern count query.
pub async fn get_status(
    store: &Arc<dyn SubstrateStore>,
    metrics: &MetricsRegistry,
) -> Result<StatusSnapshot> {
    Ok(StatusSnapshot {
        pattern_count: store.count_patterns().await?,
        counters: metrics.counters(),
        histograms: metrics.histograms(),
        taken_at: chrono::Utc::now(),
    })
}

/// Serialized pattern bundle: patterns plus their embeddings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternExport {
    pub patterns: Vec<Pattern>,
    /// (pattern id, model name, vector) triples
    pub embeddings: Vec<(PatternId, String, Vec<f32>)>,
}

/// Export all live patterns (and their embeddings) as JSON.
///
/// Patterns are ordered by id so export to import to export is
/// byte-identical.
///
/// # Errors
///
/// Returns storage or serialization errors.
pub async fn export_patterns(store: &Arc<dyn SubstrateStore>) -> Result<String> {
    let mut patterns = store.all_patterns().await?;
    patterns.sort_by_key(|p| p.id);

    let mut embeddings = Vec::new();
    for pattern in &patterns {
        if let Some((model, vector)) = store.get_embedding(pattern.id).await? {
            embeddings.push((pattern.id, model, vector));
        }
    }

    Ok(serde_json::to_string_pretty(&PatternExport {
        patterns,
        embeddings,
    })?)
}

/// Import a pattern bundle produced by [`export_patterns`].
///
/// Invalid patterns are skipped with a warning; the count of imported
/// patterns is returned.
///
/// # Errors
///
/// Returns parse errors and storage errors.
pub async fn import_patterns(store: &Arc<dyn SubstrateStore>, json: &str) -> Result<usize> {
    let bundle: PatternExport = serde_json::from_str(json)?;
    let mut imported = 0;

    for pattern in &bundle.patterns {
        if let Err(err) = pattern.validate() {
            warn!(pattern_id = %pattern.id, "skipping invalid pattern on import: {err}");
            continue;
        }
        store.store_pattern(pattern).await?;
        imported += 1;
    }
    for (pattern_id, model, vector) in &bundle.embeddings {
        store.store_embedding(*pattern_id, model, vector).await?;
    }

    Ok(imported)
}
