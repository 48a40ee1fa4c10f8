//! Post-merge structural validation.
//!
//! Re-derives everything the parser derives and additionally checks that
//! row groups do not overlap in byte space, declared counts and sizes are
//! positive, and column-chunk spans nest fully inside their owning row
//! group. The quarantine mode deletes invalid output from storage. It is
//! used only for fragments this engine just wrote, never for fragments
//! supplied by external producers.

use std::sync::Arc;

use tephra_core::StorageBackend;

use crate::error::{Result, StoreError};
use crate::fragment;

/// Outcome of validating one fragment.
#[derive(Debug, Clone, Default)]
pub struct ValidationReport {
    /// Whether the fragment passed every check.
    pub valid: bool,
    /// Violations that make the fragment unusable.
    pub errors: Vec<String>,
    /// Oddities that do not block use of the fragment.
    pub warnings: Vec<String>,
    /// Whether the fragment was deleted by quarantine mode.
    pub deleted: bool,
}

impl ValidationReport {
    fn error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
    }

    fn warning(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }
}

/// Validation mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidateMode {
    /// Report only.
    ReportOnly,
    /// Delete the fragment from storage when invalid.
    ///
    /// Only safe for output this engine just wrote: deleting an external
    /// producer's only copy of data is unacceptable.
    QuarantineOwnOutput,
}

/// Validates fragment bytes structurally.
#[must_use]
pub fn validate_fragment(bytes: &[u8]) -> ValidationReport {
    let mut report = ValidationReport::default();

    let (footer, footer_start) = match fragment::parse_fragment_unfiltered(bytes) {
        Ok(parsed) => parsed,
        Err(err) => {
            report.error(format!("unparseable fragment: {err}"));
            return report;
        }
    };

    if footer.row_groups.is_empty() {
        report.error("footer declares no row groups");
    }

    let mut declared_rows: i64 = 0;
    let mut spans: Vec<(u64, u64, u32)> = Vec::with_capacity(footer.row_groups.len());

    for rg in &footer.row_groups {
        if rg.row_count <= 0 {
            report.error(format!(
                "row group {} declares non-positive row count {}",
                rg.index, rg.row_count
            ));
        } else {
            declared_rows = declared_rows.saturating_add(rg.row_count);
        }
        if rg.byte_size == 0 {
            report.error(format!("row group {} declares zero byte size", rg.index));
            continue;
        }

        let Ok(end) = rg.end_offset() else {
            report.error(format!("row group {} span overflows u64", rg.index));
            continue;
        };
        if rg.file_offset < fragment::MAGIC_LEN {
            report.error(format!(
                "row group {} starts at {} inside the magic header",
                rg.index, rg.file_offset
            ));
        }
        if end > footer_start {
            report.error(format!(
                "row group {} span [{}, {end}) exceeds footer start {footer_start}",
                rg.index, rg.file_offset
            ));
        }
        spans.push((rg.file_offset, end, rg.index));

        for chunk in &rg.columns {
            if chunk.byte_size == 0 {
                report.error(format!(
                    "row group {} column {} declares zero byte size",
                    rg.index, chunk.column_index
                ));
                continue;
            }
            let Ok(chunk_end) = chunk.end_offset() else {
                report.error(format!(
                    "row group {} column {} span overflows u64",
                    rg.index, chunk.column_index
                ));
                continue;
            };
            if chunk.file_offset < rg.file_offset || chunk_end > end {
                report.error(format!(
                    "row group {} column {} span [{}, {chunk_end}) escapes its row group [{}, {end})",
                    rg.index, chunk.column_index, chunk.file_offset, rg.file_offset
                ));
            }
        }
    }

    // Overlap check over the declared spans, in offset order.
    spans.sort_unstable();
    for pair in spans.windows(2) {
        let (a_start, a_end, a_idx) = pair[0];
        let (b_start, _, b_idx) = pair[1];
        if b_start < a_end {
            report.error(format!(
                "row groups {a_idx} and {b_idx} overlap: [{a_start}, {a_end}) and [{b_start}, ..)"
            ));
        }
    }

    if footer.total_rows != declared_rows {
        report.warning(format!(
            "footer total row count {} differs from sum of row groups {declared_rows}",
            footer.total_rows
        ));
    }

    report.valid = report.errors.is_empty();
    report
}

/// Validator over a storage backend.
pub struct Validator<S>
where
    S: StorageBackend + ?Sized,
{
    storage: Arc<S>,
}

impl<S> Validator<S>
where
    S: StorageBackend + ?Sized,
{
    /// Creates a new validator.
    #[must_use]
    pub fn new(storage: Arc<S>) -> Self {
        Self { storage }
    }

    /// Fetches a fragment and validates it, optionally quarantining it.
    ///
    /// # Errors
    ///
    /// Returns storage errors from the fetch or the quarantine delete; a
    /// structurally invalid fragment is reported, not an error.
    pub async fn validate_key(&self, key: &str, mode: ValidateMode) -> Result<ValidationReport> {
        let bytes = self.storage.get(key).await.map_err(StoreError::from)?;
        let mut report = validate_fragment(&bytes);

        if !report.valid && mode == ValidateMode::QuarantineOwnOutput {
            tracing::warn!(
                key,
                errors = report.errors.len(),
                "quarantining invalid compaction output"
            );
            self.storage.delete(key).await.map_err(StoreError::from)?;
            report.deleted = true;
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::footer::{ColumnChunkMeta, PhysicalType, RowGroupMeta};
    use crate::fragment::{MAGIC_LEN, assemble_fragment};
    use bytes::Bytes;
    use tephra_core::MemoryBackend;

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

    fn build(groups: &[RowGroupMeta]) -> Vec<u8> {
        let payload_len: u64 = groups.iter().map(|g| g.byte_size).sum();
        assemble_fragment(&vec![0u8; payload_len as usize], groups, "v").expect("assemble")
    }

    #[test]
    fn well_formed_fragment_is_valid() {
        let groups = vec![rg(0, MAGIC_LEN, 100, 10), rg(1, MAGIC_LEN + 100, 50, 5)];
        let report = validate_fragment(&build(&groups));
        assert!(report.valid, "errors: {:?}", report.errors);
        assert!(report.errors.is_empty());
        assert!(!report.deleted);
    }

    #[test]
    fn overlapping_row_groups_are_invalid() {
        let groups = vec![rg(0, MAGIC_LEN, 100, 10), rg(1, MAGIC_LEN + 50, 100, 5)];
        // Payload only needs to cover the furthest end for assembly.
        let bytes = assemble_fragment(&vec![0u8; 150], &groups, "v").expect("assemble");
        let report = validate_fragment(&bytes);
        assert!(!report.valid);
        assert!(report.errors.iter().any(|e| e.contains("overlap")));
    }

    #[test]
    fn zero_row_count_is_invalid() {
        let groups = vec![rg(0, MAGIC_LEN, 100, 0)];
        let report = validate_fragment(&build(&groups));
        assert!(!report.valid);
        assert!(
            report
                .errors
                .iter()
                .any(|e| e.contains("non-positive row count"))
        );
    }

    #[test]
    fn chunk_escaping_its_row_group_is_invalid() {
        let mut group = rg(0, MAGIC_LEN, 100, 10);
        group.columns[0].byte_size = 200;
        let bytes = assemble_fragment(&vec![0u8; 100], std::slice::from_ref(&group), "v")
            .expect("assemble");
        let report = validate_fragment(&bytes);
        assert!(!report.valid);
        assert!(report.errors.iter().any(|e| e.contains("escapes")));
    }

    #[test]
    fn corrupted_magic_is_invalid() {
        let groups = vec![rg(0, MAGIC_LEN, 100, 10)];
        let mut bytes = build(&groups);
        let last = bytes.len() - 1;
        bytes[last] = b'X';
        let report = validate_fragment(&bytes);
        assert!(!report.valid);
        assert!(report.errors.iter().any(|e| e.contains("unparseable")));
    }

    #[tokio::test]
    async fn quarantine_deletes_only_invalid_output() {
        let storage = Arc::new(MemoryBackend::new());
        let validator = Validator::new(storage.clone());

        let good = build(&[rg(0, MAGIC_LEN, 100, 10)]);
        let mut bad = good.clone();
        let last = bad.len() - 1;
        bad[last] = b'X';

        storage
            .put("good.tph", Bytes::from(good), std::collections::HashMap::new())
            .await
            .expect("put");
        storage
            .put("bad.tph", Bytes::from(bad), std::collections::HashMap::new())
            .await
            .expect("put");

        let report = validator
            .validate_key("good.tph", ValidateMode::QuarantineOwnOutput)
            .await
            .expect("validate");
        assert!(report.valid);
        assert!(!report.deleted);
        assert!(storage.head("good.tph").await.expect("head").is_some());

        let report = validator
            .validate_key("bad.tph", ValidateMode::QuarantineOwnOutput)
            .await
            .expect("validate");
        assert!(!report.valid);
        assert!(report.deleted);
        assert!(storage.head("bad.tph").await.expect("head").is_none());

        // Report-only mode never deletes, even when invalid.
        storage
            .put(
                "external.tph",
                Bytes::from_static(b"not a fragment at all!!"),
                std::collections::HashMap::new(),
            )
            .await
            .expect("put");
        let report = validator
            .validate_key("external.tph", ValidateMode::ReportOnly)
            .await
            .expect("validate");
        assert!(!report.valid);
        assert!(!report.deleted);
        assert!(storage.head("external.tph").await.expect("head").is_some());
    }
}
