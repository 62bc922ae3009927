//! L3: zlib-compressed patterns persisted in a redb table.
//!
//! Entries are postcard-encoded then zlib-compressed; a leading tag
//! byte records whether compression succeeded. A compression failure
//! logs a warning and stores the raw encoding instead: degraded but never
//! lost. LRU ordering lives in memory and is rebuilt from the table on
//! open.

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::path::Path;

use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use parking_lot::Mutex;
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use tracing::{debug, warn};
use uuid::Uuid;

use swarm_core::error::{Error, Result};
use swarm_core::pattern::Pattern;
use swarm_core::types::PatternId;

use crate::metrics::TierMetrics;

const L3_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("l3_patterns");

/// Tag byte: payload is zlib-compressed postcard
const TAG_ZLIB: u8 = 1;
/// Tag byte: payload is raw postcard (compression fallback)
const TAG_RAW: u8 = 0;

/// Compressed persisted tier
pub(crate) struct CompressedTier {
    db: Database,
    /// LRU order, oldest at the front
    order: Mutex<VecDeque<PatternId>>,
    capacity: usize,
    pub(crate) metrics: TierMetrics,
}

impl CompressedTier {
    /// Open (or create) the tier database at `path`
    pub fn open(path: &Path, capacity: usize) -> Result<Self> {
        let db = Database::create(path)
            .map_err(|e| Error::Storage(format!("failed to open cache db: {e}")))?;

        // Make sure the table exists before the first read
        let write = db
            .begin_write()
            .map_err(|e| Error::Storage(format!("cache init txn: {e}")))?;
        write
            .open_table(L3_TABLE)
            .map_err(|e| Error::Storage(format!("cache init table: {e}")))?;
        write
            .commit()
            .map_err(|e| Error::Storage(format!("cache init commit: {e}")))?;

        let order = Self::load_order(&db)?;
        debug!(entries = order.len(), "compressed tier opened");

        Ok(Self {
            db,
            order: Mutex::new(order),
            capacity: capacity.max(1),
            metrics: TierMetrics::default(),
        })
    }

    fn load_order(db: &Database) -> Result<VecDeque<PatternId>> {
        let read = db
            .begin_read()
            .map_err(|e| Error::Storage(format!("cache read txn: {e}")))?;
        let table = read
            .open_table(L3_TABLE)
            .map_err(|e| Error::Storage(format!("cache table: {e}")))?;

        let mut order = VecDeque::new();
        for entry in table
            .iter()
            .map_err(|e| Error::Storage(format!("cache iter: {e}")))?
        {
            let (key, _) = entry.map_err(|e| Error::Storage(format!("cache entry: {e}")))?;
            if let Ok(id) = Uuid::parse_str(key.value()) {
                order.push_back(id);
            }
        }
        Ok(order)
    }

    /// Look up and decompress an entry
    pub fn get(&self, id: PatternId) -> Result<Option<Pattern>> {
        let read = self
            .db
            .begin_read()
            .map_err(|e| Error::Storage(format!("cache read txn: {e}")))?;
        let table = read
            .open_table(L3_TABLE)
            .map_err(|e| Error::Storage(format!("cache table: {e}")))?;

        let key = id.to_string();
        let Some(guard) = table
            .get(key.as_str())
            .map_err(|e| Error::Storage(format!("cache get: {e}")))?
        else {
            self.metrics.record_miss();
            return Ok(None);
        };

        let pattern = decode(guard.value())?;
        drop(guard);
        drop(table);
        drop(read);

        self.metrics.record_hit();
        let mut order = self.order.lock();
        order.retain(|&queued| queued != id);
        order.push_back(id);
        Ok(Some(pattern))
    }

    /// Insert an entry, evicting the oldest beyond capacity
    pub fn insert(&self, pattern: &Pattern) -> Result<()> {
        let payload = encode(pattern);
        let key = pattern.id.to_string();

        let write = self
            .db
            .begin_write()
            .map_err(|e| Error::Storage(format!("cache write txn: {e}")))?;
        {
            let mut table = write
                .open_table(L3_TABLE)
                .map_err(|e| Error::Storage(format!("cache table: {e}")))?;
            table
                .insert(key.as_str(), payload.as_slice())
                .map_err(|e| Error::Storage(format!("cache insert: {e}")))?;

            let mut order = self.order.lock();
            order.retain(|&queued| queued != pattern.id);
            order.push_back(pattern.id);

            while order.len() > self.capacity {
                if let Some(victim) = order.pop_front() {
                    let victim_key = victim.to_string();
                    table
                        .remove(victim_key.as_str())
                        .map_err(|e| Error::Storage(format!("cache evict: {e}")))?;
                    self.metrics.record_eviction();
                }
            }
        }
        write
            .commit()
            .map_err(|e| Error::Storage(format!("cache commit: {e}")))?;

        self.metrics.record_insertion();
        Ok(())
    }

    /// Remove an entry
    pub fn remove(&self, id: PatternId) -> Result<()> {
        let key = id.to_string();
        let write = self
            .db
            .begin_write()
            .map_err(|e| Error::Storage(format!("cache write txn: {e}")))?;
        {
            let mut table = write
                .open_table(L3_TABLE)
                .map_err(|e| Error::Storage(format!("cache table: {e}")))?;
            table
                .remove(key.as_str())
                .map_err(|e| Error::Storage(format!("cache remove: {e}")))?;
        }
        write
            .commit()
            .map_err(|e| Error::Storage(format!("cache commit: {e}")))?;

        self.order.lock().retain(|&queued| queued != id);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.order.lock().len()
    }

    /// Fraction of capacity in use
    pub fn fill_fraction(&self) -> f64 {
        self.len() as f64 / self.capacity as f64
    }
}

/// Encode a pattern: postcard, then zlib with a tag byte. Compression
/// failure degrades to the raw encoding rather than losing data.
fn encode(pattern: &Pattern) -> Vec<u8> {
    let raw = match postcard::to_allocvec(pattern) {
        Ok(bytes) => bytes,
        Err(e) => {
            // postcard over in-memory buffers should not fail; JSON is
            // the escape hatch that always round-trips
            warn!(pattern_id = %pattern.id, "postcard encode failed ({e}), using json");
            let json = serde_json::to_vec(pattern).unwrap_or_default();
            let mut out = vec![2u8];
            out.extend_from_slice(&json);
            return out;
        }
    };

    let mut encoder = ZlibEncoder::new(Vec::with_capacity(raw.len() / 2 + 1), Compression::fast());
    let compressed = encoder
        .write_all(&raw)
        .and_then(|()| encoder.finish());
    match compressed {
        Ok(bytes) => {
            let mut out = Vec::with_capacity(bytes.len() + 1);
            out.push(TAG_ZLIB);
            out.extend_from_slice(&bytes);
            out
        }
        Err(e) => {
            warn!(pattern_id = %pattern.id, "compression failed ({e}), storing uncompressed");
            let mut out = Vec::with_capacity(raw.len() + 1);
            out.push(TAG_RAW);
            out.extend_from_slice(&raw);
            out
        }
    }
}

/// Decode a tagged payload back to a pattern
fn decode(payload: &[u8]) -> Result<Pattern> {
    let Some((&tag, body)) = payload.split_first() else {
        return Err(Error::Storage("empty cache payload".to_string()));
    };

    match tag {
        TAG_ZLIB => {
            let mut decoder = ZlibDecoder::new(body);
            let mut raw = Vec::new();
            decoder
                .read_to_end(&mut raw)
                .map_err(|e| Error::Storage(format!("decompress failed: {e}")))?;
            postcard::from_bytes(&raw)
                .map_err(|e| Error::Storage(format!("cache decode failed: {e}")))
        }
        TAG_RAW => postcard::from_bytes(body)
            .map_err(|e| Error::Storage(format!("cache decode failed: {e}"))),
        2 => Ok(serde_json::from_slice(body)?),
        other => Err(Error::Storage(format!("unknown cache payload tag {other}"))),
    }
}
