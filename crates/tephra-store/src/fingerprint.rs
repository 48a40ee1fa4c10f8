//! Schema fingerprints and schema-aware fragment grouping.
//!
//! Two fragments are merge-compatible iff they agree on column count and the
//! ordered list of physical types. That pair is canonicalized into a short
//! hash so grouping and caching work on a single comparable value.

use std::collections::BTreeMap;

use sha2::{Digest, Sha256};

use crate::footer::ColumnChunkMeta;
use crate::fragment::FragmentMeta;

/// Sentinel group for fragments whose fingerprint cannot be determined.
///
/// Members of this group are never merged with fingerprinted groups.
pub const UNKNOWN_GROUP: &str = "unknown";

/// Truncated hex length of a fingerprint (16 chars = 64 bits).
const FINGERPRINT_LEN: usize = 16;

/// Computes the schema fingerprint for an ordered column-chunk list.
///
/// The preimage is `"cols:<n>|types:<t0>,<t1>,...,<tN-1>"`, digested with
/// SHA-256 and truncated for compactness.
#[must_use]
pub fn fingerprint(columns: &[ColumnChunkMeta]) -> String {
    let types: Vec<&str> = columns.iter().map(|c| c.physical_type.name()).collect();
    let preimage = format!("cols:{}|types:{}", columns.len(), types.join(","));

    let digest = Sha256::digest(preimage.as_bytes());
    let mut hex = String::with_capacity(FINGERPRINT_LEN);
    for byte in digest.iter().take(FINGERPRINT_LEN / 2) {
        use std::fmt::Write as _;
        let _ = write!(hex, "{byte:02x}");
    }
    hex
}

/// Computes a fragment's fingerprint from its first row group.
///
/// Returns `None` when the fragment has no non-empty row groups (the
/// fragment then belongs to [`UNKNOWN_GROUP`]).
#[must_use]
pub fn fragment_fingerprint(meta: &FragmentMeta) -> Option<String> {
    meta.row_groups.first().map(|rg| fingerprint(&rg.columns))
}

/// Partitions candidates into schema-compatible groups.
///
/// Every input appears in exactly one output group; candidates without a
/// fingerprint land in [`UNKNOWN_GROUP`]. A `BTreeMap` keeps group order
/// deterministic across runs.
#[must_use]
pub fn group_by_fingerprint<T>(
    candidates: Vec<(T, Option<String>)>,
) -> BTreeMap<String, Vec<T>> {
    let mut groups: BTreeMap<String, Vec<T>> = BTreeMap::new();
    for (candidate, fp) in candidates {
        let key = fp.unwrap_or_else(|| UNKNOWN_GROUP.to_string());
        groups.entry(key).or_default().push(candidate);
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::footer::PhysicalType;

    fn chunk(idx: i32, ty: PhysicalType) -> ColumnChunkMeta {
        ColumnChunkMeta {
            column_index: idx,
            file_offset: 0,
            byte_size: 1,
            physical_type: ty,
        }
    }

    #[test]
    fn fingerprint_depends_on_types_and_count() {
        let a = fingerprint(&[chunk(0, PhysicalType::Int64), chunk(1, PhysicalType::Double)]);
        let b = fingerprint(&[chunk(0, PhysicalType::Int64), chunk(1, PhysicalType::Double)]);
        let c = fingerprint(&[chunk(0, PhysicalType::Double), chunk(1, PhysicalType::Int64)]);
        let d = fingerprint(&[chunk(0, PhysicalType::Int64)]);

        assert_eq!(a, b);
        assert_ne!(a, c, "type order must matter");
        assert_ne!(a, d, "column count must matter");
        assert_eq!(a.len(), FINGERPRINT_LEN);
    }

    #[test]
    fn fingerprint_ignores_offsets() {
        let a = fingerprint(&[chunk(0, PhysicalType::Int64)]);
        let mut moved = chunk(0, PhysicalType::Int64);
        moved.file_offset = 9999;
        moved.byte_size = 123;
        assert_eq!(a, fingerprint(&[moved]));
    }

    #[test]
    fn grouping_is_a_partition() {
        let candidates = vec![
            ("a", Some("fp1".to_string())),
            ("b", Some("fp2".to_string())),
            ("c", Some("fp1".to_string())),
            ("d", None),
        ];
        let groups = group_by_fingerprint(candidates);

        assert_eq!(groups.len(), 3);
        assert_eq!(groups["fp1"], vec!["a", "c"]);
        assert_eq!(groups["fp2"], vec!["b"]);
        assert_eq!(groups[UNKNOWN_GROUP], vec!["d"]);

        let total: usize = groups.values().map(Vec::len).sum();
        assert_eq!(total, 4);
    }
}
