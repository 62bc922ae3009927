//! Embedding generation and cosine-similarity retrieval over patterns.
//!
//! The index keeps decoded vectors in memory for non-suspending
//! hot-path searches and persists them through the store so a restart
//! can rebuild without regeneration. Vectors are regenerated only when
//! a pattern's content hash changes.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::config::IndexConfig;
use crate::error::Result;
use crate::pattern::{Pattern, PatternKind};
use crate::storage::SubstrateStore;
use crate::types::PatternId;

/// Embedding generator over pattern text.
///
/// The default implementation is the deterministic local embedder; a
/// model-backed provider can be slotted in without touching the index.
pub trait EmbeddingProvider: Send + Sync {
    /// Embed a text into a fixed-dimension vector (L2-normalized)
    fn embed(&self, text: &str) -> Vec<f32>;

    /// Model identifier recorded alongside stored vectors
    fn model(&self) -> &str;

    /// Vector dimensionality
    fn dims(&self) -> usize;
}

/// Deterministic hash-seeded embedder.
///
/// Not semantically meaningful, but stable: the same text always maps
/// to the same unit vector, which is what retrieval tests and
/// re-extraction idempotence need. Swap in a model-backed provider for
/// semantic quality.
pub struct HashEmbedder {
    dims: usize,
}

impl HashEmbedder {
    #[must_use]
    pub fn new(dims: usize) -> Self {
        Self { dims }
    }
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self::new(384)
    }
}

impl EmbeddingProvider for HashEmbedder {
    fn embed(&self, text: &str) -> Vec<f32> {
        let digest = Sha256::digest(text.as_bytes());
        let mut seed = u64::from_le_bytes(digest[..8].try_into().unwrap_or([0u8; 8]));

        let mut vector = Vec::with_capacity(self.dims);
        for _ in 0..self.dims {
            // xorshift64 keeps generation allocation-free and portable
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;
            let value = ((seed >> 40) as f32) / 8_388_608.0 - 1.0;
            vector.push(value);
        }

        let magnitude = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if magnitude > 0.0 {
            for x in &mut vector {
                *x /= magnitude;
            }
        }
        vector
    }

    fn model(&self) -> &str {
        "hash-v1"
    }

    fn dims(&self) -> usize {
        self.dims
    }
}

/// Cosine similarity normalized from [-1, 1] to [0, 1]
#[must_use]
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let mag_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let mag_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if mag_a == 0.0 || mag_b == 0.0 {
        return 0.0;
    }

    (dot / (mag_a * mag_b) + 1.0) / 2.0
}

struct IndexEntry {
    kind: PatternKind,
    content_hash: String,
    vector: Vec<f32>,
}

/// A similarity match returned by the index
#[derive(Debug, Clone, PartialEq)]
pub struct IndexMatch {
    pub pattern_id: PatternId,
    pub similarity: f32,
}

/// In-memory cosine index with store-backed persistence
pub struct VectorIndex {
    config: IndexConfig,
    provider: Arc<dyn EmbeddingProvider>,
    entries: RwLock<HashMap<PatternId, IndexEntry>>,
}

impl VectorIndex {
    #[must_use]
    pub fn new(config: IndexConfig, provider: Arc<dyn EmbeddingProvider>) -> Self {
        Self {
            config,
            provider,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Number of indexed patterns
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// True when nothing is indexed
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Index a pattern, regenerating its vector only on content change,
    /// and persist the vector through the store.
    ///
    /// Superseded patterns are dropped from the index instead.
    ///
    /// # Errors
    ///
    /// Returns storage errors from embedding persistence.
    pub async fn upsert(&self, store: &Arc<dyn SubstrateStore>, pattern: &Pattern) -> Result<()> {
        if pattern.is_superseded() {
            self.remove(pattern.id);
            return Ok(());
        }

        let content_hash = pattern.content_hash();
        let unchanged = self
            .entries
            .read()
            .get(&pattern.id)
            .is_some_and(|entry| entry.content_hash == content_hash);
        if unchanged {
            return Ok(());
        }

        let vector = self.provider.embed(&pattern.embedding_text());
        store
            .store_embedding(pattern.id, self.provider.model(), &vector)
            .await?;
        self.entries.write().insert(
            pattern.id,
            IndexEntry {
                kind: pattern.kind,
                content_hash,
                vector,
            },
        );
        debug!(pattern_id = %pattern.id, "embedding indexed");
        Ok(())
    }

    /// Drop a pattern from the in-memory index
    pub fn remove(&self, id: PatternId) {
        self.entries.write().remove(&id);
    }

    /// Top-k cosine search over indexed patterns, reduced to one kind
    /// when `kind` is given. Non-suspending.
    #[must_use]
    pub fn search(&self, query: &str, kind: Option<PatternKind>, k: usize) -> Vec<IndexMatch> {
        let query_vector = self.provider.embed(query);
        self.search_vector(&query_vector, kind, k)
    }

    /// Top-k search with a precomputed query vector
    #[must_use]
    pub fn search_vector(
        &self,
        query: &[f32],
        kind: Option<PatternKind>,
        k: usize,
    ) -> Vec<IndexMatch> {
        let entries = self.entries.read();
        let mut matches: Vec<IndexMatch> = entries
            .iter()
            .filter(|(_, entry)| kind.is_none_or(|want| entry.kind == want))
            .map(|(id, entry)| IndexMatch {
                pattern_id: *id,
                similarity: cosine_similarity(query, &entry.vector),
            })
            .collect();

        matches.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        matches.truncate(k.max(1).min(matches.len()));
        matches
    }

    /// Rebuild the in-memory index from the store.
    ///
    /// Patterns whose stored vector is missing or stale are re-embedded
    /// and written back; superseded patterns are skipped. Returns the
    /// number of vectors regenerated. Also run by the background
    /// consistency recheck.
    ///
    /// # Errors
    ///
    /// Returns storage errors.
    pub async fn rebuild(&self, store: &Arc<dyn SubstrateStore>) -> Result<usize> {
        let patterns = store.all_patterns().await?;
        let mut regenerated = 0;
        let mut fresh: HashMap<PatternId, IndexEntry> = HashMap::new();

        for pattern in &patterns {
            if pattern.is_superseded() {
                continue;
            }
            let content_hash = pattern.content_hash();
            let stored = store.get_embedding(pattern.id).await?;
            let vector = match stored {
                Some((model, vector))
                    if model == self.provider.model() && vector.len() == self.config.dims =>
                {
                    vector
                }
                _ => {
                    let vector = self.provider.embed(&pattern.embedding_text());
                    store
                        .store_embedding(pattern.id, self.provider.model(), &vector)
                        .await?;
                    regenerated += 1;
                    vector
                }
            };
            fresh.insert(
                pattern.id,
                IndexEntry {
                    kind: pattern.kind,
                    content_hash,
                    vector,
                },
            );
        }

        let count = fresh.len();
        *self.entries.write() = fresh;
        info!(indexed = count, regenerated, "vector index rebuilt");
        Ok(regenerated)
    }

    /// Interval for the background consistency recheck
    #[must_use]
    pub fn reindex_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.config.reindex_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn provider() -> Arc<dyn EmbeddingProvider> {
        Arc::new(HashEmbedder::default())
    }

    #[test]
    fn test_embeddings_are_deterministic_and_normalized() {
        let embedder = HashEmbedder::default();
        let a = embedder.embed("deploy service");
        let b = embedder.embed("deploy service");
        assert_eq!(a, b);
        assert_eq!(a.len(), 384);

        let magnitude: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((magnitude - 1.0).abs() < 1e-3);
    }

    #[test]
    fn test_cosine_similarity_bounds() {
        let embedder = HashEmbedder::default();
        let a = embedder.embed("alpha");
        let b = embedder.embed("beta");

        assert!((cosine_similarity(&a, &a) - 1.0).abs() < 1e-5);
        let cross = cosine_similarity(&a, &b);
        assert!((0.0..=1.0).contains(&cross));
    }

    #[test]
    fn test_cosine_similarity_mismatched_lengths() {
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[1.0]), 0.0);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
    }

    #[test]
    fn test_search_filters_by_kind() {
        let index = VectorIndex::new(IndexConfig::default(), provider());
        let goap = Pattern::new(PatternKind::Goap, "a", BTreeMap::new(), vec!["x".to_string()]);
        let coord = Pattern::new(
            PatternKind::Coordination,
            "b",
            BTreeMap::new(),
            vec!["y".to_string()],
        );

        // Insert directly to keep the test store-free
        index.entries.write().insert(
            goap.id,
            IndexEntry {
                kind: PatternKind::Goap,
                content_hash: goap.content_hash(),
                vector: index.provider.embed(&goap.embedding_text()),
            },
        );
        index.entries.write().insert(
            coord.id,
            IndexEntry {
                kind: PatternKind::Coordination,
                content_hash: coord.content_hash(),
                vector: index.provider.embed(&coord.embedding_text()),
            },
        );

        let matches = index.search("anything", Some(PatternKind::Goap), 10);
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].pattern_id, goap.id);
    }

    #[test]
    fn test_search_self_similarity_ranks_first() {
        let index = VectorIndex::new(IndexConfig::default(), provider());
        let patterns: Vec<Pattern> = (0..5)
            .map(|i| {
                Pattern::new(
                    PatternKind::Goap,
                    format!("pattern {i}"),
                    BTreeMap::new(),
                    vec![format!("a{i}")],
                )
            })
            .collect();

        for pattern in &patterns {
            index.entries.write().insert(
                pattern.id,
                IndexEntry {
                    kind: pattern.kind,
                    content_hash: pattern.content_hash(),
                    vector: index.provider.embed(&pattern.embedding_text()),
                },
            );
        }

        let target = &patterns[2];
        let matches = index.search(&target.embedding_text(), None, 3);
        assert_eq!(matches[0].pattern_id, target.id);
        assert!((matches[0].similarity - 1.0).abs() < 1e-5);
    }
}
