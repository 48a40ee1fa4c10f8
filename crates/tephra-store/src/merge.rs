//! Streaming merge engine.
//!
//! Consolidates the row groups of one schema-compatible fragment group into
//! a single larger fragment, fetching only the byte ranges that end up in
//! the output:
//!
//! 1. per source fragment, fetch the trailer and footer by range read;
//!    the whole object is read only when footer parsing fails, and then
//!    only through the chunked, allocation-guarded fallback;
//! 2. walk fragments in input order and row groups in index order,
//!    accumulating a bucket up to the byte threshold (the first row group
//!    is always accepted so a single oversized group still makes progress);
//! 3. fetch each accepted row group's exact `[offset, offset + length)`
//!    range once;
//! 4. rewrite row-group and column-chunk offsets to their new positions;
//! 5. assemble magic + payload + footer + trailer and write one new
//!    fragment.
//!
//! Row groups whose declared span exceeds their own source's footer start
//! are skipped with a warning (inconsistent side-channel metadata must not
//! poison the output); if that leaves nothing selectable while non-empty
//! row groups existed, the merge fails instead.

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use ulid::Ulid;

use tephra_core::{RetryPolicy, StorageBackend, with_backoff};

use crate::error::{Result, StoreError};
use crate::fingerprint::{fragment_fingerprint, group_by_fingerprint};
use crate::footer::{ColumnChunkMeta, RowGroupMeta};
use crate::fragment::{self, FragmentMeta, MAGIC_LEN, TRAILER_LEN, assemble_fragment};
use crate::index::{CachedFragmentMeta, FragmentRef, IndexStore};
use crate::keys;

/// Merge engine tuning knobs.
#[derive(Debug, Clone)]
pub struct MergeOptions {
    /// Bucket size threshold for one compaction output.
    pub threshold_bytes: u64,
    /// Maximum-allocation guard for the legacy whole-object fallback.
    pub max_full_read_bytes: u64,
    /// Window size for chunked whole-object reads.
    pub chunk_window_bytes: u64,
    /// Producer tag written into output footers.
    pub producer_tag: String,
}

impl Default for MergeOptions {
    fn default() -> Self {
        Self {
            threshold_bytes: 64 * 1024 * 1024,
            max_full_read_bytes: 256 * 1024 * 1024,
            chunk_window_bytes: 8 * 1024 * 1024,
            producer_tag: crate::footer::PRODUCER_TAG.to_string(),
        }
    }
}

/// A source fragment with resolved metadata, ready for planning.
#[derive(Debug, Clone)]
pub struct FragmentSource {
    /// The fragment reference as listed by the index store.
    pub fragment: FragmentRef,
    /// Total fragment size in bytes.
    pub file_size: u64,
    /// Byte offset where the source's footer begins.
    pub footer_start: u64,
    /// Schema fingerprint, `None` when undeterminable.
    pub fingerprint: Option<String>,
    /// Non-empty row groups in index order.
    pub row_groups: Vec<RowGroupMeta>,
}

impl FragmentSource {
    fn from_meta(fragment: FragmentRef, meta: FragmentMeta, fingerprint: Option<String>) -> Self {
        Self {
            fragment,
            file_size: meta.file_size,
            footer_start: meta.footer_start,
            fingerprint,
            row_groups: meta.row_groups,
        }
    }

    fn from_cache(fragment: FragmentRef, cached: CachedFragmentMeta) -> Self {
        Self {
            fragment,
            file_size: cached.file_size,
            footer_start: cached.footer_start,
            fingerprint: cached.fingerprint,
            row_groups: cached.row_groups,
        }
    }
}

/// One row group accepted into the merge bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectedRowGroup {
    /// Position of the source fragment in the planning input.
    pub source_index: usize,
    /// The row group as declared by its source.
    pub row_group: RowGroupMeta,
}

/// Result of bucket selection over one schema group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergePlan {
    /// Accepted row groups, in acceptance order.
    pub selected: Vec<SelectedRowGroup>,
    /// Total payload bytes the output will hold.
    pub total_bytes: u64,
    /// Row groups skipped for inconsistent geometry, as
    /// `(source index, row group index)`.
    pub skipped: Vec<(usize, u32)>,
}

/// Metadata of a written compaction output.
#[derive(Debug, Clone)]
pub struct CompactedFragment {
    /// Storage key of the new fragment.
    pub key: String,
    /// Total size of the new fragment in bytes.
    pub size: u64,
    /// Etag reported by storage.
    pub etag: String,
    /// Schema fingerprint of the output.
    pub fingerprint: Option<String>,
    /// Row groups as written, with remapped offsets.
    pub row_groups: Vec<RowGroupMeta>,
    /// Keys of the source fragments that contributed row groups.
    pub source_keys: Vec<String>,
    /// Sources whose every usable row group landed in the output; these
    /// are superseded by the new fragment.
    pub superseded_keys: Vec<String>,
    /// Cache entries for partially consumed sources, holding only their
    /// remaining row groups so a later run picks up the remainder without
    /// re-reading consumed bytes.
    pub deferred: Vec<CachedFragmentMeta>,
}

/// Selects row groups for one output fragment.
///
/// Pure over its inputs: the same sources and threshold always select the
/// same row groups in the same order.
///
/// Returns `Ok(None)` when the sources contribute no non-empty row groups
/// at all (a documented no-op, not an error).
///
/// # Errors
///
/// Returns [`StoreError::NothingSelectable`] when non-empty row groups
/// exist but every one was skipped for inconsistent geometry, or an
/// overflow error if the running total would exceed `u64`.
pub fn plan_merge(sources: &[FragmentSource], threshold_bytes: u64) -> Result<Option<MergePlan>> {
    let mut selected = Vec::new();
    let mut total: u64 = 0;
    let mut skipped = Vec::new();
    let mut saw_row_group = false;

    'sources: for (source_index, source) in sources.iter().enumerate() {
        for rg in &source.row_groups {
            saw_row_group = true;

            // Sanity check against the source's own footer position; bad
            // side-channel metadata is contained to the one row group.
            let end = rg.end_offset()?;
            if end > source.footer_start || rg.byte_size == 0 {
                tracing::warn!(
                    fragment = %source.fragment.key,
                    row_group = rg.index,
                    offset = rg.file_offset,
                    size = rg.byte_size,
                    footer_start = source.footer_start,
                    "skipping row group with inconsistent geometry"
                );
                skipped.push((source_index, rg.index));
                continue;
            }

            if selected.is_empty() {
                // The first row group is always accepted, even when it
                // alone exceeds the threshold, to guarantee progress.
                total = rg.byte_size;
            } else {
                let new_total = total.checked_add(rg.byte_size).ok_or_else(|| {
                    StoreError::overflow("merge bucket total exceeds u64".into())
                })?;
                if new_total > threshold_bytes {
                    break 'sources;
                }
                total = new_total;
            }

            selected.push(SelectedRowGroup {
                source_index,
                row_group: rg.clone(),
            });

            if total >= threshold_bytes {
                break 'sources;
            }
        }
    }

    if !saw_row_group {
        return Ok(None);
    }
    if selected.is_empty() {
        return Err(StoreError::NothingSelectable {
            fragments: sources.len(),
        });
    }

    Ok(Some(MergePlan {
        selected,
        total_bytes: total,
        skipped,
    }))
}

/// Reads an entire object in fixed-size windows.
///
/// Used only as the resilience fallback when range-based footer parsing
/// fails; bounded by the allocation guard so a pathological object aborts
/// instead of exhausting memory.
///
/// # Errors
///
/// Returns [`StoreError::AllocationGuard`] when the object exceeds
/// `max_bytes`, or a storage error from the underlying reads.
pub async fn read_object_chunked<S>(
    storage: &S,
    key: &str,
    size: u64,
    window_bytes: u64,
    max_bytes: u64,
) -> Result<Bytes>
where
    S: StorageBackend + ?Sized,
{
    if size > max_bytes {
        return Err(StoreError::AllocationGuard {
            key: key.to_string(),
            size,
            limit: max_bytes,
        });
    }

    let capacity = usize::try_from(size)
        .map_err(|_| StoreError::overflow(format!("object size {size} exceeds usize")))?;
    let window = window_bytes.max(1);

    let mut buf = Vec::with_capacity(capacity);
    let mut offset = 0u64;
    while offset < size {
        let end = offset.saturating_add(window).min(size);
        let chunk = storage.get_range(key, offset..end).await.map_err(StoreError::from)?;
        buf.extend_from_slice(&chunk);
        offset = end;
    }
    Ok(Bytes::from(buf))
}

/// The merge engine: resolves fragment metadata, groups by schema, and
/// produces compacted fragments.
pub struct MergeEngine<S, I>
where
    S: StorageBackend + ?Sized,
    I: IndexStore + ?Sized,
{
    storage: Arc<S>,
    index: Arc<I>,
    retry: RetryPolicy,
    options: MergeOptions,
}

impl<S, I> MergeEngine<S, I>
where
    S: StorageBackend + ?Sized,
    I: IndexStore + ?Sized,
{
    /// Creates a new merge engine.
    #[must_use]
    pub fn new(storage: Arc<S>, index: Arc<I>, options: MergeOptions) -> Self {
        Self {
            storage,
            index,
            retry: RetryPolicy::default(),
            options,
        }
    }

    /// Returns the engine's options.
    #[must_use]
    pub fn options(&self) -> &MergeOptions {
        &self.options
    }

    /// Resolves one fragment's metadata: index-store cache first, then a
    /// tail-only range parse, then the chunked whole-object fallback.
    ///
    /// # Errors
    ///
    /// Returns a malformed-fragment error when both the tail parse and the
    /// full-file fallback fail, or storage errors from the reads.
    pub async fn resolve_source(&self, fragment: FragmentRef) -> Result<FragmentSource> {
        let cached = with_backoff(self.retry, "index.fragment_meta", || {
            self.index.fragment_meta(&fragment.key)
        })
        .await
        .map_err(StoreError::from)?;

        if let Some(cached) = cached {
            return Ok(FragmentSource::from_cache(fragment, cached));
        }

        let size = match self
            .storage
            .head(&fragment.key)
            .await
            .map_err(StoreError::from)?
        {
            Some(meta) => meta.size,
            None => fragment.size,
        };

        let meta = match self.parse_tail(&fragment.key, size).await {
            Ok(meta) => meta,
            Err(err) => {
                tracing::warn!(
                    fragment = %fragment.key,
                    error = %err,
                    "footer range parse failed, falling back to full read"
                );
                let bytes = read_object_chunked(
                    self.storage.as_ref(),
                    &fragment.key,
                    size,
                    self.options.chunk_window_bytes,
                    self.options.max_full_read_bytes,
                )
                .await?;
                fragment::parse_fragment(&bytes)?
            }
        };

        let fingerprint = fragment_fingerprint(&meta);
        let source = FragmentSource::from_meta(fragment, meta, fingerprint);
        self.cache_source(&source).await;
        Ok(source)
    }

    /// Fetches the trailer and footer by range read and parses them.
    async fn parse_tail(&self, key: &str, size: u64) -> Result<FragmentMeta> {
        if size < fragment::MIN_FRAGMENT_LEN {
            return Err(StoreError::malformed_fragment(format!(
                "fragment too small: {size} bytes"
            )));
        }

        let trailer = self
            .storage
            .get_range(key, size - TRAILER_LEN..size)
            .await
            .map_err(StoreError::from)?;
        if trailer.len() as u64 != TRAILER_LEN {
            return Err(StoreError::malformed_fragment("short trailer read"));
        }
        if trailer[4..8] != fragment::FRAGMENT_MAGIC {
            return Err(StoreError::malformed_fragment("bad trailing magic"));
        }

        let footer_len =
            u64::from(u32::from_le_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]));
        if footer_len == 0 || footer_len > size - TRAILER_LEN {
            return Err(StoreError::malformed_fragment(format!(
                "footer length {footer_len} out of bounds for {size} byte fragment"
            )));
        }

        let tail_start = size - TRAILER_LEN - footer_len;
        let tail = self
            .storage
            .get_range(key, tail_start..size)
            .await
            .map_err(StoreError::from)?;
        fragment::parse_footer_region(size, &tail)
    }

    /// Best-effort write-back of resolved metadata to the cache.
    async fn cache_source(&self, source: &FragmentSource) {
        let cached = CachedFragmentMeta {
            key: source.fragment.key.clone(),
            file_size: source.file_size,
            footer_start: source.footer_start,
            fingerprint: source.fingerprint.clone(),
            row_groups: source.row_groups.clone(),
        };
        let result = with_backoff(self.retry, "index.put_fragment_meta", || {
            self.index.put_fragment_meta(cached.clone())
        })
        .await;
        if let Err(err) = result {
            tracing::warn!(
                fragment = %source.fragment.key,
                error = %err,
                "failed to cache fragment metadata"
            );
        }
    }

    /// Lists a dataset's pending fragments and partitions them into
    /// schema-compatible groups.
    ///
    /// Fragments whose metadata cannot be resolved are routed to the
    /// `"unknown"` group rather than failing the run; they are never
    /// merged.
    ///
    /// # Errors
    ///
    /// Returns an error when the pending listing itself fails.
    pub async fn group_pending(
        &self,
        dataset_id: &str,
    ) -> Result<BTreeMap<String, Vec<FragmentSource>>> {
        let pending = with_backoff(self.retry, "index.pending_fragments", || {
            self.index.pending_fragments(dataset_id)
        })
        .await
        .map_err(StoreError::from)?;

        let mut candidates = Vec::with_capacity(pending.len());
        for fragment in pending {
            match self.resolve_source(fragment.clone()).await {
                Ok(source) => {
                    let fp = source.fingerprint.clone();
                    candidates.push((source, fp));
                }
                Err(err) => {
                    tracing::warn!(
                        fragment = %fragment.key,
                        error = %err,
                        "could not resolve fragment metadata, routing to unknown group"
                    );
                    candidates.push((
                        FragmentSource {
                            fragment,
                            file_size: 0,
                            footer_start: 0,
                            fingerprint: None,
                            row_groups: Vec::new(),
                        },
                        None,
                    ));
                }
            }
        }

        Ok(group_by_fingerprint(candidates))
    }

    /// Merges one schema group into a single compacted fragment.
    ///
    /// Returns `Ok(None)` when the group contributes no non-empty row
    /// groups (documented no-op).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NothingSelectable`] when nothing survives the
    /// geometry sanity check, overflow errors from offset arithmetic, or
    /// storage errors from reads/writes.
    pub async fn merge_group(
        &self,
        dataset_id: &str,
        sources: &[FragmentSource],
    ) -> Result<Option<CompactedFragment>> {
        let Some(plan) = plan_merge(sources, self.options.threshold_bytes)? else {
            tracing::info!(dataset = dataset_id, "merge is a no-op: no non-empty row groups");
            return Ok(None);
        };

        tracing::info!(
            dataset = dataset_id,
            selected = plan.selected.len(),
            skipped = plan.skipped.len(),
            payload_bytes = plan.total_bytes,
            "merge plan ready"
        );

        let payload_capacity = usize::try_from(plan.total_bytes)
            .map_err(|_| StoreError::overflow("merge payload exceeds usize".into()))?;
        let mut payload = Vec::with_capacity(payload_capacity);
        let mut out_groups: Vec<RowGroupMeta> = Vec::with_capacity(plan.selected.len());
        let mut source_keys: Vec<String> = Vec::new();

        for (position, sel) in plan.selected.iter().enumerate() {
            let source = &sources[sel.source_index];
            let rg = &sel.row_group;
            let end = rg.end_offset()?;

            // Exactly [offset, offset + length): each accepted row group's
            // content is read once, nothing else is transferred.
            let bytes = self
                .storage
                .get_range(&source.fragment.key, rg.file_offset..end)
                .await
                .map_err(StoreError::from)?;
            if bytes.len() as u64 != rg.byte_size {
                return Err(StoreError::malformed_fragment(format!(
                    "range read for {} returned {} bytes, expected {}",
                    source.fragment.key,
                    bytes.len(),
                    rg.byte_size
                )));
            }

            let new_offset = MAGIC_LEN
                .checked_add(payload.len() as u64)
                .ok_or_else(|| StoreError::overflow("output offset exceeds u64".into()))?;

            let mut columns = Vec::with_capacity(rg.columns.len());
            for chunk in &rg.columns {
                let delta = chunk.file_offset.checked_sub(rg.file_offset).ok_or_else(|| {
                    StoreError::Geometry {
                        message: format!(
                            "column chunk at {} precedes its row group at {} in {}",
                            chunk.file_offset, rg.file_offset, source.fragment.key
                        ),
                    }
                })?;
                let chunk_offset = new_offset
                    .checked_add(delta)
                    .ok_or_else(|| StoreError::overflow("chunk offset exceeds u64".into()))?;
                columns.push(ColumnChunkMeta {
                    column_index: chunk.column_index,
                    file_offset: chunk_offset,
                    byte_size: chunk.byte_size,
                    physical_type: chunk.physical_type,
                });
            }

            let index = u32::try_from(position)
                .map_err(|_| StoreError::overflow("output row group index exceeds u32".into()))?;
            out_groups.push(RowGroupMeta {
                index,
                file_offset: new_offset,
                byte_size: rg.byte_size,
                row_count: rg.row_count,
                columns,
            });
            payload.extend_from_slice(&bytes);

            let key = &source.fragment.key;
            if !source_keys.contains(key) {
                source_keys.push(key.clone());
            }
        }

        // Consumption bookkeeping: a source whose every usable row group
        // landed in the output is superseded; one consumed partially keeps
        // its remainder discoverable through the metadata cache.
        let mut superseded_keys = Vec::new();
        let mut deferred = Vec::new();
        for (source_index, source) in sources.iter().enumerate() {
            let consumed: std::collections::HashSet<u32> = plan
                .selected
                .iter()
                .filter(|s| s.source_index == source_index)
                .map(|s| s.row_group.index)
                .chain(
                    plan.skipped
                        .iter()
                        .filter(|(si, _)| *si == source_index)
                        .map(|(_, rg_index)| *rg_index),
                )
                .collect();
            if consumed.is_empty() {
                continue;
            }

            let remaining: Vec<RowGroupMeta> = source
                .row_groups
                .iter()
                .filter(|rg| !consumed.contains(&rg.index))
                .cloned()
                .collect();
            if remaining.is_empty() {
                superseded_keys.push(source.fragment.key.clone());
            } else {
                deferred.push(CachedFragmentMeta {
                    key: source.fragment.key.clone(),
                    file_size: source.file_size,
                    footer_start: source.footer_start,
                    fingerprint: source.fingerprint.clone(),
                    row_groups: remaining,
                });
            }
        }

        let out_bytes = assemble_fragment(&payload, &out_groups, &self.options.producer_tag)?;
        let size = out_bytes.len() as u64;
        let fingerprint = out_groups.first().map(|rg| crate::fingerprint::fingerprint(&rg.columns));

        let key = keys::fragment_key(dataset_id, &Ulid::new().to_string());
        let mut metadata = std::collections::HashMap::new();
        metadata.insert("producer".to_string(), self.options.producer_tag.clone());
        metadata.insert("source-count".to_string(), source_keys.len().to_string());

        let put = self
            .storage
            .put(&key, Bytes::from(out_bytes), metadata)
            .await
            .map_err(StoreError::from)?;

        tracing::info!(
            dataset = dataset_id,
            key = %key,
            size,
            row_groups = out_groups.len(),
            sources = source_keys.len(),
            "wrote compacted fragment"
        );

        Ok(Some(CompactedFragment {
            key,
            size,
            etag: put.etag,
            fingerprint,
            row_groups: out_groups,
            source_keys,
            superseded_keys,
            deferred,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::footer::PhysicalType;

    fn rg(index: u32, offset: u64, size: u64, rows: i64) -> RowGroupMeta {
        RowGroupMeta {
            index,
            file_offset: offset,
            byte_size: size,
            row_count: rows,
            columns: vec![ColumnChunkMeta {
                column_index: 0,
                file_offset: offset,
                byte_size: size,
                physical_type: PhysicalType::Int64,
            }],
        }
    }

    fn source(key: &str, groups: Vec<RowGroupMeta>) -> FragmentSource {
        let footer_start = groups
            .iter()
            .map(|g| g.file_offset + g.byte_size)
            .max()
            .unwrap_or(MAGIC_LEN);
        FragmentSource {
            fragment: FragmentRef {
                key: key.to_string(),
                size: footer_start + 100,
            },
            file_size: footer_start + 100,
            footer_start,
            fingerprint: Some("fp".to_string()),
            row_groups: groups,
        }
    }

    const MB: u64 = 1024 * 1024;

    #[test]
    fn plan_respects_threshold_across_fragments() {
        // Three 10-group fragments of 1 MB groups, threshold 25 MB:
        // exactly 25 groups selected, remainder deferred.
        let sources: Vec<FragmentSource> = (0..3)
            .map(|f| {
                let groups = (0..10)
                    .map(|i| rg(i, MAGIC_LEN + u64::from(i) * MB, MB, 100))
                    .collect();
                source(&format!("frag-{f}"), groups)
            })
            .collect();

        let plan = plan_merge(&sources, 25 * MB)
            .expect("plan")
            .expect("non-empty plan");
        assert_eq!(plan.selected.len(), 25);
        assert_eq!(plan.total_bytes, 25 * MB);
        assert!(plan.skipped.is_empty());

        // Input order: all of fragment 0 and 1, then 5 groups of fragment 2.
        let from_last: usize = plan
            .selected
            .iter()
            .filter(|s| s.source_index == 2)
            .count();
        assert_eq!(from_last, 5);
    }

    #[test]
    fn plan_is_deterministic() {
        let sources: Vec<FragmentSource> = (0..3)
            .map(|f| {
                let groups = (0..4)
                    .map(|i| rg(i, MAGIC_LEN + u64::from(i) * MB, MB, 10))
                    .collect();
                source(&format!("frag-{f}"), groups)
            })
            .collect();

        let a = plan_merge(&sources, 3 * MB).expect("plan").expect("some");
        let b = plan_merge(&sources, 3 * MB).expect("plan").expect("some");
        assert_eq!(a, b);
    }

    #[test]
    fn first_row_group_accepted_even_when_oversized() {
        let sources = vec![source("big", vec![rg(0, MAGIC_LEN, 100 * MB, 1000)])];
        let plan = plan_merge(&sources, MB).expect("plan").expect("some");
        assert_eq!(plan.selected.len(), 1);
        assert_eq!(plan.total_bytes, 100 * MB);
    }

    #[test]
    fn selection_stops_at_first_overflow() {
        // 2 MB + 2 MB fits a 5 MB bucket; the next 2 MB group overflows and
        // stops accumulation even though later groups might fit.
        let groups = vec![
            rg(0, MAGIC_LEN, 2 * MB, 10),
            rg(1, MAGIC_LEN + 2 * MB, 2 * MB, 10),
            rg(2, MAGIC_LEN + 4 * MB, 2 * MB, 10),
            rg(3, MAGIC_LEN + 6 * MB, MB / 2, 10),
        ];
        let sources = vec![source("a", groups)];

        let plan = plan_merge(&sources, 5 * MB).expect("plan").expect("some");
        assert_eq!(plan.selected.len(), 2);
        assert_eq!(plan.total_bytes, 4 * MB);
    }

    #[test]
    fn all_empty_sources_are_a_no_op() {
        let sources = vec![source("a", vec![]), source("b", vec![])];
        assert!(plan_merge(&sources, MB).expect("plan").is_none());
    }

    #[test]
    fn geometry_inconsistent_groups_are_skipped() {
        let mut bad = rg(0, MAGIC_LEN, 10 * MB, 100);
        // Claim a span far past the source's footer start.
        bad.file_offset = 50 * MB;
        let good = rg(1, MAGIC_LEN, MB, 10);

        let mut src = source("a", vec![good.clone()]);
        src.row_groups = vec![bad, good];

        let plan = plan_merge(&[src], 25 * MB).expect("plan").expect("some");
        assert_eq!(plan.skipped, vec![(0, 0)]);
        assert_eq!(plan.selected.len(), 1);
        assert_eq!(plan.selected[0].row_group.index, 1);
    }

    #[test]
    fn all_groups_skipped_is_a_hard_failure() {
        let mut bad = rg(0, MAGIC_LEN, 10 * MB, 100);
        bad.file_offset = 50 * MB;
        let mut src = source("a", vec![rg(0, MAGIC_LEN, MB, 1)]);
        src.row_groups = vec![bad];

        match plan_merge(&[src], 25 * MB) {
            Err(StoreError::NothingSelectable { fragments }) => assert_eq!(fragments, 1),
            other => panic!("expected NothingSelectable, got {other:?}"),
        }
    }

    mod engine {
        use super::*;
        use crate::fragment::parse_fragment;
        use crate::index::MemoryIndexStore;
        use tephra_core::MemoryBackend;

        async fn put_fragment(
            storage: &MemoryBackend,
            index: &MemoryIndexStore,
            dataset: &str,
            name: &str,
            group_sizes: &[(u64, i64)],
        ) -> (String, Vec<u8>) {
            let mut groups = Vec::new();
            let mut payload = Vec::new();
            let mut offset = MAGIC_LEN;
            for (i, (size, rows)) in group_sizes.iter().enumerate() {
                groups.push(rg(u32::try_from(i).expect("index"), offset, *size, *rows));
                // Distinct fill per group so byte-exactness is observable.
                let fill = (i as u8).wrapping_add(b'A');
                payload.extend(std::iter::repeat(fill).take(*size as usize));
                offset += size;
            }
            let bytes = assemble_fragment(&payload, &groups, "test writer").expect("assemble");

            let key = keys::fragment_key(dataset, name);
            storage
                .put(&key, Bytes::from(bytes.clone()), std::collections::HashMap::new())
                .await
                .expect("put");
            index.add_pending_fragment(
                dataset,
                FragmentRef {
                    key: key.clone(),
                    size: bytes.len() as u64,
                },
            );
            (key, bytes)
        }

        #[tokio::test]
        async fn merge_preserves_bytes_and_remaps_offsets() {
            let storage = Arc::new(MemoryBackend::new());
            let index = Arc::new(MemoryIndexStore::new());
            let engine = MergeEngine::new(
                storage.clone(),
                index.clone(),
                MergeOptions {
                    threshold_bytes: 1024,
                    ..MergeOptions::default()
                },
            );

            let (key_a, bytes_a) =
                put_fragment(&storage, &index, "ds", "a", &[(100, 10), (100, 10)]).await;
            let (key_b, _) = put_fragment(&storage, &index, "ds", "b", &[(100, 10)]).await;

            let groups = engine.group_pending("ds").await.expect("group");
            assert_eq!(groups.len(), 1, "same schema lands in one group");
            let sources = groups.into_values().next().expect("group");

            let compacted = engine
                .merge_group("ds", &sources)
                .await
                .expect("merge")
                .expect("output");

            assert_eq!(compacted.row_groups.len(), 3);
            assert_eq!(compacted.source_keys, vec![key_a.clone(), key_b.clone()]);
            assert_eq!(compacted.superseded_keys, vec![key_a.clone(), key_b.clone()]);
            assert!(compacted.deferred.is_empty());

            // Validate the output parses and the payload bytes survived the
            // move exactly, at their remapped offsets.
            let out_bytes = storage.get(&compacted.key).await.expect("get output");
            let meta = parse_fragment(&out_bytes).expect("parse output");
            assert_eq!(meta.row_groups.len(), 3);
            assert_eq!(meta.total_rows, 30);

            let first_src = &parse_fragment(&bytes_a).expect("parse src").row_groups[0];
            let first_out = &meta.row_groups[0];
            let src_span = &bytes_a[first_src.file_offset as usize
                ..(first_src.file_offset + first_src.byte_size) as usize];
            let out_span = &out_bytes[first_out.file_offset as usize
                ..(first_out.file_offset + first_out.byte_size) as usize];
            assert_eq!(src_span, out_span);

            // Chunk offsets are remapped relative to their group start.
            for rg in &meta.row_groups {
                for chunk in &rg.columns {
                    assert!(chunk.file_offset >= rg.file_offset);
                    assert!(chunk.file_offset + chunk.byte_size <= rg.file_offset + rg.byte_size);
                }
            }
        }

        #[tokio::test]
        async fn metadata_cache_fast_path_is_used_after_first_resolve() {
            let storage = Arc::new(MemoryBackend::new());
            let index = Arc::new(MemoryIndexStore::new());
            let engine = MergeEngine::new(storage.clone(), index.clone(), MergeOptions::default());

            let (key, bytes) = put_fragment(&storage, &index, "ds", "a", &[(64, 5)]).await;
            let fragment = FragmentRef {
                key: key.clone(),
                size: bytes.len() as u64,
            };

            let first = engine.resolve_source(fragment.clone()).await.expect("resolve");
            assert!(first.fingerprint.is_some());

            // Second resolve hits the cache: delete the object to prove no
            // storage read happens.
            storage.delete(&key).await.expect("delete");
            let second = engine.resolve_source(fragment).await.expect("cached resolve");
            assert_eq!(second.footer_start, first.footer_start);
            assert_eq!(second.row_groups, first.row_groups);
        }

        #[tokio::test]
        async fn unparseable_fragment_routes_to_unknown_group() {
            let storage = Arc::new(MemoryBackend::new());
            let index = Arc::new(MemoryIndexStore::new());
            let engine = MergeEngine::new(storage.clone(), index.clone(), MergeOptions::default());

            let key = keys::fragment_key("ds", "junk");
            storage
                .put(
                    &key,
                    Bytes::from_static(b"definitely not a fragment"),
                    std::collections::HashMap::new(),
                )
                .await
                .expect("put");
            index.add_pending_fragment(
                "ds",
                FragmentRef {
                    key: key.clone(),
                    size: 25,
                },
            );
            put_fragment(&storage, &index, "ds", "good", &[(64, 5)]).await;

            let groups = engine.group_pending("ds").await.expect("group");
            assert_eq!(groups.len(), 2);
            let unknown = &groups[crate::fingerprint::UNKNOWN_GROUP];
            assert_eq!(unknown.len(), 1);
            assert_eq!(unknown[0].fragment.key, key);
        }

        #[tokio::test]
        async fn chunked_read_honors_allocation_guard() {
            let storage = MemoryBackend::new();
            storage
                .put(
                    "big.bin",
                    Bytes::from(vec![0u8; 1024]),
                    std::collections::HashMap::new(),
                )
                .await
                .expect("put");

            let ok = read_object_chunked(&storage, "big.bin", 1024, 100, 2048)
                .await
                .expect("within guard");
            assert_eq!(ok.len(), 1024);

            let too_big = read_object_chunked(&storage, "big.bin", 1024, 100, 512).await;
            assert!(matches!(
                too_big,
                Err(StoreError::AllocationGuard { size: 1024, limit: 512, .. })
            ));
        }
    }
}
