//! Index-store contract.
//!
//! The relational index store is an external collaborator; this module
//! defines the rows the engine reads and writes:
//!
//! - a fragment → row-group metadata cache (fast path that avoids
//!   re-parsing footers),
//! - compaction job status rows,
//! - block-index rows addressing the cold tier,
//! - hot-tier rows queried by predicate.
//!
//! Methods return `tephra_core::Result` so the retry helper can classify
//! rate-limit-class failures. `MemoryIndexStore` implements the contract
//! for tests and CLI runs, including rate-limit fault injection.

use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use tephra_core::{Error, JobId, Result};

use crate::footer::RowGroupMeta;

/// Compaction job lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Accepted, not yet running.
    Pending,
    /// Running; at most one per dataset.
    Processing,
    /// Finished successfully.
    Completed,
    /// Finished with a captured error.
    Failed,
}

impl JobStatus {
    /// Canonical lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

/// Persisted state of a compaction job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    /// Job identifier.
    pub job_id: JobId,
    /// Dataset the job compacts; also the mutual-exclusion key.
    pub dataset_id: String,
    /// Lifecycle state.
    pub status: JobStatus,
    /// Progress, 0–100.
    pub progress: u8,
    /// Captured failure message, for `Failed` jobs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// When the job was accepted.
    pub started_at: DateTime<Utc>,
    /// When the job reached a terminal state.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

/// A fragment awaiting compaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FragmentRef {
    /// Storage key of the fragment.
    pub key: String,
    /// Total size in bytes.
    pub size: u64,
}

/// Cached parse results for one fragment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedFragmentMeta {
    /// Storage key of the fragment.
    pub key: String,
    /// Total fragment size in bytes.
    pub file_size: u64,
    /// Byte offset where the footer begins.
    pub footer_start: u64,
    /// Schema fingerprint, when determinable.
    pub fingerprint: Option<String>,
    /// Row groups with zero-row groups already dropped.
    pub row_groups: Vec<RowGroupMeta>,
}

/// One archived block range in the cold tier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockIndexEntry {
    /// Dataset the block belongs to.
    pub dataset_id: String,
    /// Table within the dataset.
    pub table: String,
    /// Schema version the owning file was written with.
    pub schema_version: u32,
    /// Identifier of the owning container file.
    pub file_id: String,
    /// Storage key of the owning container file.
    pub file_path: String,
    /// Byte offset of the block within the file.
    pub start_byte: u64,
    /// Byte length of the block.
    pub length: u64,
    /// Number of records in the block.
    pub row_count: u64,
    /// Smallest record timestamp in the block.
    pub start_ts: i64,
    /// Largest record timestamp in the block.
    pub end_ts: i64,
    /// Codec name the block was written with.
    pub codec: String,
}

/// One buffered row in the hot tier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HotRecord {
    /// Monotonic row id.
    pub id: u64,
    /// Dataset the row belongs to.
    pub dataset_id: String,
    /// Table within the dataset.
    pub table: String,
    /// Event timestamp.
    pub timestamp: i64,
    /// Event payload.
    pub payload: Value,
}

/// Contract the engine needs from the relational index store.
#[async_trait]
pub trait IndexStore: Send + Sync + 'static {
    /// Looks up cached fragment metadata.
    async fn fragment_meta(&self, key: &str) -> Result<Option<CachedFragmentMeta>>;

    /// Writes back cached fragment metadata.
    async fn put_fragment_meta(&self, meta: CachedFragmentMeta) -> Result<()>;

    /// Lists fragments pending compaction for a dataset.
    async fn pending_fragments(&self, dataset_id: &str) -> Result<Vec<FragmentRef>>;

    /// Marks source fragments as superseded by a compaction output.
    ///
    /// Superseded fragments stop appearing in [`Self::pending_fragments`];
    /// deleting their bytes is the external garbage collector's job.
    async fn mark_superseded(
        &self,
        dataset_id: &str,
        sources: &[String],
        replacement: &str,
    ) -> Result<()>;

    /// Reads the job row for a dataset.
    async fn job(&self, dataset_id: &str) -> Result<Option<JobRecord>>;

    /// Writes a job row.
    async fn put_job(&self, record: &JobRecord) -> Result<()>;

    /// Lists block-index rows overlapping the given time range.
    async fn block_entries(
        &self,
        dataset_id: &str,
        table: &str,
        from: Option<i64>,
        to: Option<i64>,
    ) -> Result<Vec<BlockIndexEntry>>;

    /// Lists hot rows matching the given predicate.
    async fn hot_records(
        &self,
        dataset_id: &str,
        table: &str,
        from: Option<i64>,
        to: Option<i64>,
    ) -> Result<Vec<HotRecord>>;
}

#[derive(Debug, Default)]
struct MemoryIndexInner {
    fragment_meta: HashMap<String, CachedFragmentMeta>,
    pending: HashMap<String, Vec<FragmentRef>>,
    jobs: HashMap<String, JobRecord>,
    blocks: Vec<BlockIndexEntry>,
    hot: Vec<HotRecord>,
}

/// In-memory index store for tests and CLI runs.
///
/// Supports injecting a bounded burst of rate-limit failures to exercise
/// the retry path.
#[derive(Debug, Default)]
pub struct MemoryIndexStore {
    inner: RwLock<MemoryIndexInner>,
    rate_limit_budget: AtomicU32,
}

impl MemoryIndexStore {
    /// Creates a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `n` trait calls fail with a rate-limit error.
    pub fn inject_rate_limits(&self, n: u32) {
        self.rate_limit_budget.store(n, Ordering::SeqCst);
    }

    /// Registers a fragment as pending compaction.
    pub fn add_pending_fragment(&self, dataset_id: &str, fragment: FragmentRef) {
        let mut inner = self.inner.write().expect("lock poisoned");
        inner
            .pending
            .entry(dataset_id.to_string())
            .or_default()
            .push(fragment);
    }

    /// Registers a cold-tier block index row.
    pub fn add_block_entry(&self, entry: BlockIndexEntry) {
        self.inner.write().expect("lock poisoned").blocks.push(entry);
    }

    /// Registers a hot-tier row.
    pub fn add_hot_record(&self, record: HotRecord) {
        self.inner.write().expect("lock poisoned").hot.push(record);
    }

    fn maybe_rate_limit(&self) -> Result<()> {
        let current = self.rate_limit_budget.load(Ordering::SeqCst);
        if current > 0
            && self
                .rate_limit_budget
                .compare_exchange(current, current - 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            return Err(Error::RateLimited {
                message: "injected index-store rate limit".into(),
            });
        }
        Ok(())
    }
}

fn range_overlaps(start: i64, end: i64, from: Option<i64>, to: Option<i64>) -> bool {
    from.map_or(true, |f| end >= f) && to.map_or(true, |t| start <= t)
}

#[async_trait]
impl IndexStore for MemoryIndexStore {
    async fn fragment_meta(&self, key: &str) -> Result<Option<CachedFragmentMeta>> {
        self.maybe_rate_limit()?;
        let inner = self.inner.read().expect("lock poisoned");
        Ok(inner.fragment_meta.get(key).cloned())
    }

    async fn put_fragment_meta(&self, meta: CachedFragmentMeta) -> Result<()> {
        self.maybe_rate_limit()?;
        let mut inner = self.inner.write().expect("lock poisoned");
        inner.fragment_meta.insert(meta.key.clone(), meta);
        Ok(())
    }

    async fn pending_fragments(&self, dataset_id: &str) -> Result<Vec<FragmentRef>> {
        self.maybe_rate_limit()?;
        let inner = self.inner.read().expect("lock poisoned");
        Ok(inner.pending.get(dataset_id).cloned().unwrap_or_default())
    }

    async fn mark_superseded(
        &self,
        dataset_id: &str,
        sources: &[String],
        _replacement: &str,
    ) -> Result<()> {
        self.maybe_rate_limit()?;
        let mut inner = self.inner.write().expect("lock poisoned");
        if let Some(pending) = inner.pending.get_mut(dataset_id) {
            pending.retain(|f| !sources.contains(&f.key));
        }
        Ok(())
    }

    async fn job(&self, dataset_id: &str) -> Result<Option<JobRecord>> {
        self.maybe_rate_limit()?;
        let inner = self.inner.read().expect("lock poisoned");
        Ok(inner.jobs.get(dataset_id).cloned())
    }

    async fn put_job(&self, record: &JobRecord) -> Result<()> {
        self.maybe_rate_limit()?;
        let mut inner = self.inner.write().expect("lock poisoned");
        inner.jobs.insert(record.dataset_id.clone(), record.clone());
        Ok(())
    }

    async fn block_entries(
        &self,
        dataset_id: &str,
        table: &str,
        from: Option<i64>,
        to: Option<i64>,
    ) -> Result<Vec<BlockIndexEntry>> {
        self.maybe_rate_limit()?;
        let inner = self.inner.read().expect("lock poisoned");
        Ok(inner
            .blocks
            .iter()
            .filter(|b| {
                b.dataset_id == dataset_id
                    && b.table == table
                    && range_overlaps(b.start_ts, b.end_ts, from, to)
            })
            .cloned()
            .collect())
    }

    async fn hot_records(
        &self,
        dataset_id: &str,
        table: &str,
        from: Option<i64>,
        to: Option<i64>,
    ) -> Result<Vec<HotRecord>> {
        self.maybe_rate_limit()?;
        let inner = self.inner.read().expect("lock poisoned");
        Ok(inner
            .hot
            .iter()
            .filter(|r| {
                r.dataset_id == dataset_id
                    && r.table == table
                    && range_overlaps(r.timestamp, r.timestamp, from, to)
            })
            .cloned()
            .collect())
    }
}
