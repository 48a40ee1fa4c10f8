//! Hot/cold read path.
//!
//! Answers read queries by merging the two tiers: buffered recent rows
//! fetched by predicate from the index store, and archived block ranges
//! fetched from container files by exact byte range. Container headers are
//! fetched once per file within a call; blocks are decoded via the log
//! reader; the combined result is sorted by timestamp and deduplicated by
//! content hash.
//!
//! Deduplication treats an exact JSON-equivalent payload at the same
//! timestamp as one record. This is a documented heuristic carried over
//! from the archival path, not a cryptographic identity guarantee.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::Instrument;

use tephra_core::{RetryPolicy, StorageBackend, with_backoff};

use crate::container::{self, ContainerHeader};
use crate::error::{Result, StoreError};
use crate::index::{BlockIndexEntry, IndexStore};

/// Bytes fetched from the head of a container file to parse its header.
const HEADER_PREFIX_BYTES: u64 = 64 * 1024;

/// A read query against one table of a dataset.
#[derive(Debug, Clone)]
pub struct ReadQuery {
    /// Dataset to read.
    pub dataset_id: String,
    /// Table within the dataset.
    pub table: String,
    /// Inclusive lower timestamp bound.
    pub from: Option<i64>,
    /// Inclusive upper timestamp bound.
    pub to: Option<i64>,
    /// When set, cold blocks from files with a different header schema
    /// version are discarded.
    pub schema_version: Option<u32>,
}

/// One record in a read result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventRecord {
    /// Event timestamp.
    pub timestamp: i64,
    /// Event payload.
    pub payload: Value,
}

/// Result of a hot/cold read.
#[derive(Debug, Clone)]
pub struct ReadResult {
    /// Records sorted by timestamp, deduplicated.
    pub records: Vec<EventRecord>,
    /// Hot-tier records fetched (before deduplication).
    pub hot_count: usize,
    /// Cold-tier records decoded (before deduplication).
    pub cold_count: usize,
}

/// Reader merging the hot and cold tiers.
pub struct HotColdReader<S, I>
where
    S: StorageBackend + ?Sized,
    I: IndexStore + ?Sized,
{
    storage: Arc<S>,
    index: Arc<I>,
    retry: RetryPolicy,
}

impl<S, I> HotColdReader<S, I>
where
    S: StorageBackend + ?Sized,
    I: IndexStore + ?Sized,
{
    /// Creates a new reader.
    #[must_use]
    pub fn new(storage: Arc<S>, index: Arc<I>) -> Self {
        Self {
            storage,
            index,
            retry: RetryPolicy::default(),
        }
    }

    /// Runs a read query.
    ///
    /// # Errors
    ///
    /// Returns index-store or storage errors from the fetches, or a
    /// malformed-container error when a block fails to decode.
    pub async fn read(&self, query: &ReadQuery) -> Result<ReadResult> {
        let span =
            tephra_core::observability::read_span("read", &query.dataset_id, &query.table);
        self.read_inner(query).instrument(span).await
    }

    async fn read_inner(&self, query: &ReadQuery) -> Result<ReadResult> {
        let hot = with_backoff(self.retry, "index.hot_records", || {
            self.index
                .hot_records(&query.dataset_id, &query.table, query.from, query.to)
        })
        .await
        .map_err(StoreError::from)?;

        let mut events: Vec<EventRecord> = hot
            .into_iter()
            .map(|r| EventRecord {
                timestamp: r.timestamp,
                payload: r.payload,
            })
            .collect();
        let hot_count = events.len();

        let cold = self.fetch_cold(query).await?;
        let cold_count = cold.len();
        events.extend(cold);

        // Stable sort keeps hot records ahead of byte-identical cold ones,
        // so deduplication prefers the hot copy.
        events.sort_by_key(|e| e.timestamp);

        let mut seen: HashSet<(i64, [u8; 32])> = HashSet::with_capacity(events.len());
        let mut records = Vec::with_capacity(events.len());
        for event in events {
            let mut canonical = Vec::new();
            canonical_bytes(&event.payload, &mut canonical)?;
            let digest: [u8; 32] = Sha256::digest(&canonical).into();
            if seen.insert((event.timestamp, digest)) {
                records.push(event);
            }
        }

        tracing::debug!(
            dataset = %query.dataset_id,
            table = %query.table,
            hot = hot_count,
            cold = cold_count,
            returned = records.len(),
            "read complete"
        );

        Ok(ReadResult {
            records,
            hot_count,
            cold_count,
        })
    }

    async fn fetch_cold(&self, query: &ReadQuery) -> Result<Vec<EventRecord>> {
        let entries = with_backoff(self.retry, "index.block_entries", || {
            self.index
                .block_entries(&query.dataset_id, &query.table, query.from, query.to)
        })
        .await
        .map_err(StoreError::from)?;

        // Group by owning file so each header is fetched once per call.
        let mut by_file: BTreeMap<String, Vec<BlockIndexEntry>> = BTreeMap::new();
        for entry in entries {
            if let Some(version) = query.schema_version {
                if entry.schema_version != version {
                    continue;
                }
            }
            by_file.entry(entry.file_path.clone()).or_default().push(entry);
        }

        let mut header_cache: HashMap<String, ContainerHeader> = HashMap::new();
        let mut out = Vec::new();

        for (file_path, mut file_entries) in by_file {
            let header = match header_cache.get(&file_path) {
                Some(header) => header.clone(),
                None => {
                    let prefix = self
                        .storage
                        .get_range(&file_path, 0..HEADER_PREFIX_BYTES)
                        .await
                        .map_err(StoreError::from)?;
                    let header = container::read_header(&prefix)?;
                    header_cache.insert(file_path.clone(), header.clone());
                    header
                }
            };

            if let Some(version) = query.schema_version {
                if header.schema_version() != Some(version) {
                    tracing::debug!(
                        file = %file_path,
                        want = version,
                        got = ?header.schema_version(),
                        "discarding cold blocks with mismatched header schema"
                    );
                    continue;
                }
            }

            file_entries.sort_by_key(|e| e.start_byte);
            for entry in file_entries {
                let end = entry.start_byte.checked_add(entry.length).ok_or_else(|| {
                    StoreError::overflow(format!(
                        "block range {} + {} exceeds u64 in {file_path}",
                        entry.start_byte, entry.length
                    ))
                })?;
                let bytes = self
                    .storage
                    .get_range(&file_path, entry.start_byte..end)
                    .await
                    .map_err(StoreError::from)?;

                for record in container::read_block(&header, &bytes)? {
                    let timestamp = record
                        .get("timestamp")
                        .and_then(Value::as_i64)
                        .unwrap_or(entry.start_ts);
                    if query.from.map_or(false, |f| timestamp < f)
                        || query.to.map_or(false, |t| timestamp > t)
                    {
                        continue;
                    }
                    out.push(EventRecord {
                        timestamp,
                        payload: record,
                    });
                }
            }
        }

        Ok(out)
    }
}

/// Writes `value` as canonical JSON: object keys sorted lexicographically,
/// no whitespace. Used only to derive the deduplication content hash.
fn canonical_bytes(value: &Value, out: &mut Vec<u8>) -> Result<()> {
    match value {
        Value::Array(items) => {
            out.push(b'[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                canonical_bytes(item, out)?;
            }
            out.push(b']');
        }
        Value::Object(map) => {
            out.push(b'{');
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                serde_json::to_writer(&mut *out, *key)?;
                out.push(b':');
                if let Some(inner) = map.get(*key) {
                    canonical_bytes(inner, out)?;
                }
            }
            out.push(b'}');
        }
        other => serde_json::to_writer(&mut *out, other)?,
    }
    Ok(())
}
