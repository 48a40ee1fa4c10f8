//! Fragment layout and metadata parsing.
//!
//! A fragment is one self-contained columnar storage object:
//!
//! ```text
//! ┌──────────────┬─────────────────────┬────────┬───────────┬──────────────┐
//! │ magic (4)    │ row group bytes ... │ footer │ len (4LE) │ magic (4)    │
//! └──────────────┴─────────────────────┴────────┴───────────┴──────────────┘
//! ```
//!
//! Parsing accepts either the full fragment bytes or just the trailing
//! footer region (when the caller fetched only the tail by range read).
//! Validation is inline and fails closed: a fragment whose geometry cannot
//! be established exactly is rejected rather than approximated, since a
//! fabricated byte span would silently corrupt a later byte-range merge.

use crate::error::{Result, StoreError};
use crate::footer::{self, FooterData, RowGroupMeta};

/// Leading and trailing magic marker.
pub const FRAGMENT_MAGIC: [u8; 4] = *b"TPH1";

/// Length of the leading magic header.
pub const MAGIC_LEN: u64 = 4;

/// Length of the trailer: 4-byte little-endian footer length + magic.
pub const TRAILER_LEN: u64 = 8;

/// Smallest well-formed fragment: magic + empty footer is impossible, but
/// the framing alone needs this many bytes.
pub const MIN_FRAGMENT_LEN: u64 = MAGIC_LEN + TRAILER_LEN;

/// Parsed fragment metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FragmentMeta {
    /// Total fragment size in bytes.
    pub file_size: u64,
    /// Byte offset where the footer begins.
    pub footer_start: u64,
    /// Footer length in bytes.
    pub footer_len: u32,
    /// Footer format version.
    pub version: i32,
    /// Total row count as written in the footer.
    pub total_rows: i64,
    /// Producer tag from the footer.
    pub created_by: String,
    /// Row groups, in footer order, with zero-row groups dropped.
    pub row_groups: Vec<RowGroupMeta>,
}

/// Locates the footer region within a fragment of `file_size` bytes whose
/// trailing bytes are given in `tail`.
///
/// `tail` must end exactly at the fragment's last byte. Returns the byte
/// offset of the footer within `tail` together with the footer length.
fn locate_footer(file_size: u64, tail: &[u8]) -> Result<(usize, u32)> {
    if file_size < MIN_FRAGMENT_LEN {
        return Err(StoreError::malformed_fragment(format!(
            "fragment too small: {file_size} bytes"
        )));
    }
    let tail_len = tail.len() as u64;
    if tail_len < TRAILER_LEN {
        return Err(StoreError::malformed_fragment(format!(
            "footer region too small: {tail_len} bytes"
        )));
    }

    let trailer = &tail[tail.len() - 8..];
    if trailer[4..8] != FRAGMENT_MAGIC {
        return Err(StoreError::malformed_fragment("bad trailing magic"));
    }

    let footer_len = u32::from_le_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
    if footer_len == 0 {
        return Err(StoreError::malformed_fragment("footer length is zero"));
    }
    if u64::from(footer_len) > file_size - TRAILER_LEN {
        return Err(StoreError::malformed_fragment(format!(
            "footer length {footer_len} exceeds file size {file_size} - {TRAILER_LEN}"
        )));
    }

    let footer_plus_trailer = u64::from(footer_len) + TRAILER_LEN;
    if tail_len < footer_plus_trailer {
        return Err(StoreError::malformed_fragment(format!(
            "footer region holds {tail_len} bytes but footer needs {footer_plus_trailer}"
        )));
    }

    let footer_start_in_tail = tail.len() - 8 - footer_len as usize;
    Ok((footer_start_in_tail, footer_len))
}

/// Resolves a row group's byte span against the footer position.
///
/// The declared group-level geometry is used when it is present and
/// consistent; otherwise the span is re-derived as the union of the
/// group's column-chunk spans. When neither yields a span inside
/// `[0, footer_start)`, parsing fails closed: a synthesized placeholder
/// would silently corrupt any later byte-range merge.
fn resolve_geometry(rg: &mut RowGroupMeta, footer_start: u64) -> Result<()> {
    let declared_ok = rg.byte_size > 0
        && rg
            .end_offset()
            .map_or(false, |end| end <= footer_start);
    if declared_ok {
        return Ok(());
    }

    let mut lo: Option<u64> = None;
    let mut hi: Option<u64> = None;
    for chunk in &rg.columns {
        if chunk.byte_size == 0 {
            continue;
        }
        let end = chunk.end_offset()?;
        lo = Some(lo.map_or(chunk.file_offset, |v| v.min(chunk.file_offset)));
        hi = Some(hi.map_or(end, |v| v.max(end)));
    }

    match (lo, hi) {
        (Some(lo), Some(hi)) if hi > lo && hi <= footer_start => {
            rg.file_offset = lo;
            rg.byte_size = hi - lo;
            Ok(())
        }
        _ => Err(StoreError::malformed_fragment(format!(
            "row group {} has no usable geometry inside footer start {footer_start}",
            rg.index
        ))),
    }
}

fn build_meta(file_size: u64, footer_len: u32, footer: FooterData) -> Result<FragmentMeta> {
    let footer_start = file_size - TRAILER_LEN - u64::from(footer_len);
    if footer_start < MAGIC_LEN {
        return Err(StoreError::malformed_fragment(
            "footer overlaps leading magic",
        ));
    }

    let mut row_groups = Vec::with_capacity(footer.row_groups.len());
    for mut rg in footer.row_groups {
        // Zero-row groups carry no mergeable payload and would poison
        // size/offset math downstream; they are dropped here, never merged.
        if rg.row_count == 0 {
            continue;
        }
        if rg.row_count < 0 {
            return Err(StoreError::malformed_fragment(format!(
                "row group {} has negative row count {}",
                rg.index, rg.row_count
            )));
        }

        resolve_geometry(&mut rg, footer_start)?;
        row_groups.push(rg);
    }

    Ok(FragmentMeta {
        file_size,
        footer_start,
        footer_len,
        version: footer.version,
        total_rows: footer.total_rows,
        created_by: footer.created_by,
        row_groups,
    })
}

/// Parses metadata from full fragment bytes.
///
/// # Errors
///
/// Returns a malformed-fragment error on bad magic (leading or trailing),
/// out-of-bounds footer length, footer decode failure, or any row group
/// whose byte span cannot be established inside `[0, footer_start)`.
pub fn parse_fragment(bytes: &[u8]) -> Result<FragmentMeta> {
    let file_size = bytes.len() as u64;
    if file_size < MIN_FRAGMENT_LEN {
        return Err(StoreError::malformed_fragment(format!(
            "fragment too small: {file_size} bytes"
        )));
    }
    if bytes[..4] != FRAGMENT_MAGIC {
        return Err(StoreError::malformed_fragment("bad leading magic"));
    }

    let (footer_pos, footer_len) = locate_footer(file_size, bytes)?;
    let footer = footer::decode_footer(&bytes[footer_pos..footer_pos + footer_len as usize])?;
    build_meta(file_size, footer_len, footer)
}

/// Parses metadata from the trailing footer region of a fragment.
///
/// `tail` must end exactly at the fragment's last byte and contain at least
/// the footer plus the 8-byte trailer; `file_size` is the full fragment
/// size (from `head`). The leading magic cannot be checked on this path;
/// the validator re-checks it on full bytes.
///
/// # Errors
///
/// Same failure modes as [`parse_fragment`]; additionally fails when `tail`
/// is too short to contain the footer, in which case the caller is expected
/// to fall back to a full-file parse once before giving up.
pub fn parse_footer_region(file_size: u64, tail: &[u8]) -> Result<FragmentMeta> {
    let (footer_pos, footer_len) = locate_footer(file_size, tail)?;
    let footer = footer::decode_footer(&tail[footer_pos..footer_pos + footer_len as usize])?;
    build_meta(file_size, footer_len, footer)
}

/// Parses the footer without dropping zero-row groups or resolving
/// geometry. Used by the validator, which must see the footer as written.
pub(crate) fn parse_fragment_unfiltered(bytes: &[u8]) -> Result<(FooterData, u64)> {
    let file_size = bytes.len() as u64;
    if file_size < MIN_FRAGMENT_LEN {
        return Err(StoreError::malformed_fragment(format!(
            "fragment too small: {file_size} bytes"
        )));
    }
    if bytes[..4] != FRAGMENT_MAGIC {
        return Err(StoreError::malformed_fragment("bad leading magic"));
    }

    let (footer_pos, footer_len) = locate_footer(file_size, bytes)?;
    let footer = footer::decode_footer(&bytes[footer_pos..footer_pos + footer_len as usize])?;
    let footer_start = file_size - TRAILER_LEN - u64::from(footer_len);
    Ok((footer, footer_start))
}

/// Assembles full fragment bytes from payload sections and row groups.
///
/// The payload must already be laid out at the offsets the row groups
/// declare (starting at [`MAGIC_LEN`]). Used by the merge engine for its
/// output and by tests building source fragments.
///
/// # Errors
///
/// Returns an overflow error if the assembled size would not be addressable,
/// or a footer-encoding error from [`footer::encode_footer`].
pub fn assemble_fragment(payload: &[u8], row_groups: &[RowGroupMeta], created_by: &str) -> Result<Vec<u8>> {
    let footer_bytes = footer::encode_footer(row_groups, created_by)?;
    let footer_len = u32::try_from(footer_bytes.len())
        .map_err(|_| StoreError::overflow("footer exceeds u32 length".into()))?;

    let total = (MAGIC_LEN as usize)
        .checked_add(payload.len())
        .and_then(|v| v.checked_add(footer_bytes.len()))
        .and_then(|v| v.checked_add(TRAILER_LEN as usize))
        .ok_or_else(|| StoreError::overflow("fragment size exceeds usize".into()))?;

    let mut out = Vec::with_capacity(total);
    out.extend_from_slice(&FRAGMENT_MAGIC);
    out.extend_from_slice(payload);
    out.extend_from_slice(&footer_bytes);
    out.extend_from_slice(&footer_len.to_le_bytes());
    out.extend_from_slice(&FRAGMENT_MAGIC);
    Ok(out)
}
