//! Single-flight compaction job coordination.
//!
//! The coordinator is the one stateful component: a logical actor per
//! dataset id that enforces at most one `processing` job per dataset,
//! persists every externally visible state change to the index store, and
//! runs the long compaction work after the triggering request has already
//! been acknowledged ("fire and forget with captured failure").
//!
//! The mutual-exclusion guarantee comes from the coordinator instance
//! itself, not a database lock: the in-memory job map is authoritative
//! while the instance lives, and the persisted row is the fallback answer
//! for status queries after a restart. A crash mid-job leaves a stale
//! `processing` row behind; the restarted instance accepts a re-trigger
//! for that dataset, which supersedes the stale row.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tracing::Instrument;

use tephra_core::{JobId, RetryPolicy, StorageBackend, with_backoff};

use crate::error::{Result, StoreError};
use crate::fingerprint::UNKNOWN_GROUP;
use crate::index::{CachedFragmentMeta, IndexStore, JobRecord, JobStatus};
use crate::merge::{CompactedFragment, FragmentSource, MergeEngine, MergeOptions};
use crate::validate::{ValidateMode, Validator};

/// A compaction trigger.
#[derive(Debug, Clone)]
pub struct TriggerRequest {
    /// Dataset to compact; the mutual-exclusion key.
    pub dataset_id: String,
    /// Optional table filter, recorded for the job log.
    pub table: Option<String>,
    /// Optional schema-version filter, recorded for the job log.
    pub schema_version: Option<u32>,
}

impl TriggerRequest {
    /// Creates a trigger for a dataset with no filters.
    #[must_use]
    pub fn new(dataset_id: impl Into<String>) -> Self {
        Self {
            dataset_id: dataset_id.into(),
            table: None,
            schema_version: None,
        }
    }
}

struct Inner<S, I>
where
    S: StorageBackend + ?Sized,
    I: IndexStore + ?Sized,
{
    index: Arc<I>,
    engine: MergeEngine<S, I>,
    validator: Validator<S>,
    retry: RetryPolicy,
    jobs: tokio::sync::Mutex<HashMap<String, JobRecord>>,
}

/// Per-dataset single-flight compaction coordinator.
pub struct JobCoordinator<S, I>
where
    S: StorageBackend + ?Sized,
    I: IndexStore + ?Sized,
{
    inner: Arc<Inner<S, I>>,
}

impl<S, I> Clone for JobCoordinator<S, I>
where
    S: StorageBackend + ?Sized,
    I: IndexStore + ?Sized,
{
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S, I> JobCoordinator<S, I>
where
    S: StorageBackend + ?Sized,
    I: IndexStore + ?Sized,
{
    /// Creates a coordinator over the given storage and index store.
    #[must_use]
    pub fn new(storage: Arc<S>, index: Arc<I>, options: MergeOptions) -> Self {
        let engine = MergeEngine::new(Arc::clone(&storage), Arc::clone(&index), options);
        let validator = Validator::new(storage);
        Self {
            inner: Arc::new(Inner {
                index,
                engine,
                validator,
                retry: RetryPolicy::default(),
                jobs: tokio::sync::Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Accepts a compaction job, or rejects it with a conflict.
    ///
    /// On acceptance the `pending` and `processing` states are persisted
    /// before this method returns; the long-running work then continues in
    /// the background, and its completion or failure is observed through
    /// [`Self::status`].
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::JobConflict`] while a job for the same dataset
    /// is processing, or persistence errors from the index store.
    pub async fn trigger(&self, request: TriggerRequest) -> Result<JobId> {
        let mut jobs = self.inner.jobs.lock().await;
        if let Some(existing) = jobs.get(&request.dataset_id) {
            if existing.status == JobStatus::Processing {
                tracing::info!(
                    dataset = %request.dataset_id,
                    job = %existing.job_id,
                    "rejecting conflicting trigger"
                );
                return Err(StoreError::JobConflict {
                    dataset_id: request.dataset_id,
                });
            }
        }

        let mut record = JobRecord {
            job_id: JobId::generate(),
            dataset_id: request.dataset_id.clone(),
            status: JobStatus::Pending,
            progress: 0,
            error: None,
            started_at: Utc::now(),
            completed_at: None,
        };

        // Persist before any long-running work begins, so a crash mid-job
        // is observable from the stored row.
        self.inner.persist_job(&record).await?;
        record.status = JobStatus::Processing;
        self.inner.persist_job(&record).await?;
        jobs.insert(request.dataset_id.clone(), record.clone());
        drop(jobs);

        tracing::info!(
            dataset = %request.dataset_id,
            job = %record.job_id,
            table = request.table.as_deref().unwrap_or(""),
            "accepted compaction job"
        );

        let inner = Arc::clone(&self.inner);
        let job_id = record.job_id;
        let span = tephra_core::observability::compaction_span("run", &request.dataset_id);
        tokio::spawn(
            async move {
                inner.run_job(record).await;
            }
            .instrument(span),
        );

        Ok(job_id)
    }

    /// Reports the current job state for a dataset.
    ///
    /// The in-memory record is authoritative while present; after a
    /// restart the persisted row answers instead.
    ///
    /// # Errors
    ///
    /// Returns index-store errors from the cold-start fallback read.
    pub async fn status(&self, dataset_id: &str) -> Result<Option<JobRecord>> {
        if let Some(record) = self.inner.jobs.lock().await.get(dataset_id) {
            return Ok(Some(record.clone()));
        }

        with_backoff(self.inner.retry, "index.job", || self.inner.index.job(dataset_id))
            .await
            .map_err(StoreError::from)
    }
}

impl<S, I> Inner<S, I>
where
    S: StorageBackend + ?Sized,
    I: IndexStore + ?Sized,
{
    async fn persist_job(&self, record: &JobRecord) -> Result<()> {
        with_backoff(self.retry, "index.put_job", || self.index.put_job(record))
            .await
            .map_err(StoreError::from)
    }

    /// Updates progress in memory and mirrors it to the index store.
    async fn set_progress(&self, dataset_id: &str, progress: u8) {
        let record = {
            let mut jobs = self.jobs.lock().await;
            let Some(record) = jobs.get_mut(dataset_id) else {
                return;
            };
            record.progress = progress.min(100);
            record.clone()
        };
        if let Err(err) = self.persist_job(&record).await {
            tracing::warn!(dataset = dataset_id, error = %err, "failed to persist progress");
        }
    }

    async fn run_job(&self, record: JobRecord) {
        let dataset_id = record.dataset_id.clone();
        let result = self.pipeline(&dataset_id).await;

        let finalized = {
            let mut jobs = self.jobs.lock().await;
            let entry = jobs.entry(dataset_id.clone()).or_insert(record);
            entry.completed_at = Some(Utc::now());
            match &result {
                Ok(outputs) => {
                    entry.status = JobStatus::Completed;
                    entry.progress = 100;
                    tracing::info!(
                        dataset = %dataset_id,
                        job = %entry.job_id,
                        outputs = outputs.len(),
                        "compaction completed"
                    );
                }
                Err(err) => {
                    entry.status = JobStatus::Failed;
                    entry.error = Some(err.to_string());
                    tracing::error!(
                        dataset = %dataset_id,
                        job = %entry.job_id,
                        error = %err,
                        "compaction failed"
                    );
                }
            }
            entry.clone()
        };

        // Failures are captured into persisted status, never propagated to
        // the long-gone trigger request.
        if let Err(err) = self.persist_job(&finalized).await {
            tracing::error!(
                dataset = %dataset_id,
                error = %err,
                "failed to persist terminal job state"
            );
        }
    }

    async fn pipeline(&self, dataset_id: &str) -> Result<Vec<CompactedFragment>> {
        self.set_progress(dataset_id, 5).await;

        let groups = self.engine.group_pending(dataset_id).await?;
        let mergeable: Vec<(String, Vec<FragmentSource>)> = groups
            .into_iter()
            .filter(|(fp, sources)| fp != UNKNOWN_GROUP && sources.len() >= 2)
            .collect();

        if mergeable.is_empty() {
            tracing::info!(dataset = dataset_id, "nothing to compact");
            return Ok(Vec::new());
        }

        self.set_progress(dataset_id, 10).await;

        let total = mergeable.len();
        let mut outputs = Vec::new();
        for (done, (fingerprint, sources)) in mergeable.into_iter().enumerate() {
            tracing::debug!(
                dataset = dataset_id,
                fingerprint = %fingerprint,
                fragments = sources.len(),
                "merging schema group"
            );

            if let Some(output) = self.engine.merge_group(dataset_id, &sources).await? {
                self.finish_output(dataset_id, &output).await?;
                outputs.push(output);
            }

            #[allow(clippy::cast_possible_truncation)]
            let progress = 10 + (85 * (done + 1) / total) as u8;
            self.set_progress(dataset_id, progress).await;
        }

        Ok(outputs)
    }

    /// Validates a just-written output and updates index bookkeeping.
    async fn finish_output(&self, dataset_id: &str, output: &CompactedFragment) -> Result<()> {
        let report = self
            .validator
            .validate_key(&output.key, ValidateMode::QuarantineOwnOutput)
            .await?;
        if !report.valid {
            return Err(StoreError::malformed_fragment(format!(
                "compaction output {} failed validation ({} errors, quarantined: {})",
                output.key,
                report.errors.len(),
                report.deleted
            )));
        }

        let cached = CachedFragmentMeta {
            key: output.key.clone(),
            file_size: output.size,
            footer_start: output
                .row_groups
                .last()
                .map_or(crate::fragment::MAGIC_LEN, |rg| {
                    rg.file_offset + rg.byte_size
                }),
            fingerprint: output.fingerprint.clone(),
            row_groups: output.row_groups.clone(),
        };
        with_backoff(self.retry, "index.put_fragment_meta", || {
            self.index.put_fragment_meta(cached.clone())
        })
        .await
        .map_err(StoreError::from)?;

        // Partially consumed sources stay pending; their cache entry now
        // holds only the remaining row groups for a later run.
        for remainder in &output.deferred {
            with_backoff(self.retry, "index.put_fragment_meta", || {
                self.index.put_fragment_meta(remainder.clone())
            })
            .await
            .map_err(StoreError::from)?;
        }

        if !output.superseded_keys.is_empty() {
            with_backoff(self.retry, "index.mark_superseded", || {
                self.index
                    .mark_superseded(dataset_id, &output.superseded_keys, &output.key)
            })
            .await
            .map_err(StoreError::from)?;
        }

        Ok(())
    }
}
