//! Compact struct codec for fragment footers.
//!
//! The footer is a self-describing binary struct:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │ field header: 1 byte                                        │
//! │   high nibble = field-id delta (1..=15 from previous id)    │
//! │   low nibble  = type tag                                    │
//! │   delta 0     = long form: tag byte, then zig-zag abs. id   │
//! ├─────────────────────────────────────────────────────────────┤
//! │ i32/i64   zig-zag + base-128 varint                         │
//! │ binary    varint length + raw bytes                         │
//! │ list      1 byte (count << 4 | elem tag), count 15 = long   │
//! │           form with varint count following                  │
//! │ struct    nested fields, terminated by stop byte 0x00       │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! The footer struct carries, in order: format version (i32, field 1),
//! total row count (i64, field 2), the row-group list (field 3) and a
//! free-text producer tag (field 4).
//!
//! Every byte is written by this module directly; offsets computed by the
//! merge engine must match the wire exactly, so no serialization library
//! sits in between. Unknown field ids are skipped by type tag for the tags
//! this format emits; anything else fails closed.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{Result, StoreError};
use crate::varint;

/// Current footer format version.
pub const FORMAT_VERSION: i32 = 1;

/// Producer tag written into footers this engine creates.
pub const PRODUCER_TAG: &str = concat!("tephra ", env!("CARGO_PKG_VERSION"));

const TAG_STOP: u8 = 0x00;
const TAG_BOOL_TRUE: u8 = 0x01;
const TAG_BOOL_FALSE: u8 = 0x02;
const TAG_I32: u8 = 0x05;
const TAG_I64: u8 = 0x06;
const TAG_BINARY: u8 = 0x08;
const TAG_LIST: u8 = 0x09;
const TAG_STRUCT: u8 = 0x0c;

/// Nesting bound for skipping unknown struct/list fields.
const MAX_SKIP_DEPTH: u32 = 16;

/// Physical type of a column chunk's values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhysicalType {
    /// Single-bit truth values.
    Boolean,
    /// 32-bit signed integers.
    Int32,
    /// 64-bit signed integers.
    Int64,
    /// 32-bit IEEE floats.
    Float,
    /// 64-bit IEEE floats.
    Double,
    /// Variable-length byte strings.
    ByteArray,
}

impl PhysicalType {
    /// Wire code for this type.
    #[must_use]
    pub const fn code(self) -> i32 {
        match self {
            Self::Boolean => 0,
            Self::Int32 => 1,
            Self::Int64 => 2,
            Self::Float => 3,
            Self::Double => 4,
            Self::ByteArray => 5,
        }
    }

    /// Resolves a wire code back to a type, if known.
    #[must_use]
    pub const fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(Self::Boolean),
            1 => Some(Self::Int32),
            2 => Some(Self::Int64),
            3 => Some(Self::Float),
            4 => Some(Self::Double),
            5 => Some(Self::ByteArray),
            _ => None,
        }
    }

    /// Canonical lowercase name, used in schema fingerprints.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Boolean => "boolean",
            Self::Int32 => "int32",
            Self::Int64 => "int64",
            Self::Float => "float",
            Self::Double => "double",
            Self::ByteArray => "byte_array",
        }
    }
}

impl std::fmt::Display for PhysicalType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Metadata for one column chunk within a row group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnChunkMeta {
    /// 0-based column index.
    pub column_index: i32,
    /// Byte offset within the fragment.
    pub file_offset: u64,
    /// Byte size of the chunk.
    pub byte_size: u64,
    /// Declared physical type of the column's values.
    pub physical_type: PhysicalType,
}

impl ColumnChunkMeta {
    /// Exclusive end offset of this chunk's byte span.
    ///
    /// # Errors
    ///
    /// Returns an overflow error if `offset + size` exceeds `u64`.
    pub fn end_offset(&self) -> Result<u64> {
        self.file_offset.checked_add(self.byte_size).ok_or_else(|| {
            StoreError::overflow(format!(
                "column chunk span {} + {} exceeds u64",
                self.file_offset, self.byte_size
            ))
        })
    }
}

/// Metadata for one row group within a fragment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowGroupMeta {
    /// 0-based position in the footer's row-group list.
    ///
    /// Not encoded on the wire; derived from list order on decode.
    pub index: u32,
    /// Byte offset of the row group within the fragment.
    pub file_offset: u64,
    /// Total byte size of the row group.
    pub byte_size: u64,
    /// Number of rows in the group.
    pub row_count: i64,
    /// Ordered column chunks.
    pub columns: Vec<ColumnChunkMeta>,
}

impl RowGroupMeta {
    /// Exclusive end offset of this row group's byte span.
    ///
    /// # Errors
    ///
    /// Returns an overflow error if `offset + size` exceeds `u64`.
    pub fn end_offset(&self) -> Result<u64> {
        self.file_offset.checked_add(self.byte_size).ok_or_else(|| {
            StoreError::overflow(format!(
                "row group span {} + {} exceeds u64",
                self.file_offset, self.byte_size
            ))
        })
    }
}

/// Decoded footer contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FooterData {
    /// Format version the footer was written with.
    pub version: i32,
    /// Total row count across all row groups, as written.
    pub total_rows: i64,
    /// Ordered row groups.
    pub row_groups: Vec<RowGroupMeta>,
    /// Free-text producer tag.
    pub created_by: String,
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

struct FieldWriter<'a> {
    buf: &'a mut Vec<u8>,
    last_field_id: i16,
}

impl<'a> FieldWriter<'a> {
    fn new(buf: &'a mut Vec<u8>) -> Self {
        Self {
            buf,
            last_field_id: 0,
        }
    }

    fn field_header(&mut self, id: i16, tag: u8) {
        let delta = i32::from(id) - i32::from(self.last_field_id);
        if (1..=15).contains(&delta) {
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            self.buf.push(((delta as u8) << 4) | tag);
        } else {
            self.buf.push(tag);
            varint::encode_u64(self.buf, varint::zigzag_encode(i64::from(id)));
        }
        self.last_field_id = id;
    }

    fn i32_field(&mut self, id: i16, value: i32) {
        self.field_header(id, TAG_I32);
        varint::encode_u64(self.buf, varint::zigzag_encode(i64::from(value)));
    }

    fn i64_field(&mut self, id: i16, value: i64) {
        self.field_header(id, TAG_I64);
        varint::encode_u64(self.buf, varint::zigzag_encode(value));
    }

    fn binary_field(&mut self, id: i16, value: &[u8]) {
        self.field_header(id, TAG_BINARY);
        varint::encode_u64(self.buf, value.len() as u64);
        self.buf.extend_from_slice(value);
    }

    fn list_header(&mut self, id: i16, elem_tag: u8, count: usize) {
        self.field_header(id, TAG_LIST);
        if count < 15 {
            #[allow(clippy::cast_possible_truncation)]
            self.buf.push(((count as u8) << 4) | elem_tag);
        } else {
            self.buf.push(0xf0 | elem_tag);
            varint::encode_u64(self.buf, count as u64);
        }
    }

    fn stop(&mut self) {
        self.buf.push(TAG_STOP);
    }
}

fn to_wire_i64(value: u64, what: &str) -> Result<i64> {
    i64::try_from(value)
        .map_err(|_| StoreError::overflow(format!("{what} {value} exceeds i64 range")))
}

fn encode_column_chunk(buf: &mut Vec<u8>, chunk: &ColumnChunkMeta) -> Result<()> {
    let mut w = FieldWriter::new(buf);
    w.i32_field(1, chunk.column_index);
    w.i64_field(2, to_wire_i64(chunk.file_offset, "column chunk offset")?);
    w.i64_field(3, to_wire_i64(chunk.byte_size, "column chunk size")?);
    w.i32_field(4, chunk.physical_type.code());
    w.stop();
    Ok(())
}

fn encode_row_group(buf: &mut Vec<u8>, rg: &RowGroupMeta) -> Result<()> {
    let mut w = FieldWriter::new(buf);
    w.list_header(1, TAG_STRUCT, rg.columns.len());
    drop(w);
    for chunk in &rg.columns {
        encode_column_chunk(buf, chunk)?;
    }

    let mut w = FieldWriter::new(buf);
    w.last_field_id = 1;
    w.i64_field(2, to_wire_i64(rg.byte_size, "row group size")?);
    w.i64_field(3, rg.row_count);
    w.i64_field(4, to_wire_i64(rg.file_offset, "row group offset")?);
    w.stop();
    Ok(())
}

/// Encodes a footer struct for the given row groups.
///
/// The total row count is computed as the sum of the groups' row counts.
///
/// # Errors
///
/// Returns an overflow error if any offset, size or the row-count sum
/// exceeds the wire integer range.
pub fn encode_footer(row_groups: &[RowGroupMeta], created_by: &str) -> Result<Bytes> {
    let mut total_rows: i64 = 0;
    for rg in row_groups {
        total_rows = total_rows.checked_add(rg.row_count).ok_or_else(|| {
            StoreError::overflow("total row count exceeds i64 range".to_string())
        })?;
    }

    let mut buf = Vec::new();
    let mut w = FieldWriter::new(&mut buf);
    w.i32_field(1, FORMAT_VERSION);
    w.i64_field(2, total_rows);
    w.list_header(3, TAG_STRUCT, row_groups.len());
    drop(w);

    for rg in row_groups {
        encode_row_group(&mut buf, rg)?;
    }

    let mut w = FieldWriter::new(&mut buf);
    w.last_field_id = 3;
    w.binary_field(4, created_by.as_bytes());
    w.stop();

    Ok(Bytes::from(buf))
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

struct FieldReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> FieldReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn byte(&mut self) -> Result<u8> {
        let b = *self
            .buf
            .get(self.pos)
            .ok_or_else(|| StoreError::malformed_fragment("footer truncated"))?;
        self.pos += 1;
        Ok(b)
    }

    fn varint(&mut self) -> Result<u64> {
        varint::decode_u64(self.buf, &mut self.pos)
            .ok_or_else(|| StoreError::malformed_fragment("bad varint in footer"))
    }

    fn zigzag(&mut self) -> Result<i64> {
        Ok(varint::zigzag_decode(self.varint()?))
    }

    fn bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .ok_or_else(|| StoreError::overflow("footer byte length exceeds usize".into()))?;
        let slice = self
            .buf
            .get(self.pos..end)
            .ok_or_else(|| StoreError::malformed_fragment("footer truncated"))?;
        self.pos = end;
        Ok(slice)
    }

    /// Reads the next field header, or `None` at the stop byte.
    fn field_header(&mut self, last_field_id: &mut i16) -> Result<Option<(i16, u8)>> {
        let byte = self.byte()?;
        if byte == TAG_STOP {
            return Ok(None);
        }

        let tag = byte & 0x0f;
        let delta = byte >> 4;
        let id = if delta == 0 {
            i16::try_from(self.zigzag()?)
                .map_err(|_| StoreError::malformed_fragment("field id out of range"))?
        } else {
            last_field_id
                .checked_add(i16::from(delta))
                .ok_or_else(|| StoreError::malformed_fragment("field id overflow"))?
        };
        *last_field_id = id;
        Ok(Some((id, tag)))
    }

    fn list_header(&mut self) -> Result<(usize, u8)> {
        let byte = self.byte()?;
        let elem_tag = byte & 0x0f;
        let short_count = usize::from(byte >> 4);
        let count = if short_count == 15 {
            usize::try_from(self.varint()?)
                .map_err(|_| StoreError::overflow("list count exceeds usize".into()))?
        } else {
            short_count
        };
        Ok((count, elem_tag))
    }

    fn expect_tag(tag: u8, want: u8, what: &str) -> Result<()> {
        if tag == want {
            Ok(())
        } else {
            Err(StoreError::malformed_fragment(format!(
                "unexpected type tag {tag:#x} for {what}"
            )))
        }
    }

    /// Skips a value of the given type tag.
    ///
    /// Only the tags this format emits are skippable; anything else is
    /// treated as malformed input rather than guessed at.
    fn skip_value(&mut self, tag: u8, depth: u32) -> Result<()> {
        if depth > MAX_SKIP_DEPTH {
            return Err(StoreError::malformed_fragment(
                "footer nesting exceeds skip depth",
            ));
        }

        match tag {
            TAG_BOOL_TRUE | TAG_BOOL_FALSE => Ok(()),
            TAG_I32 | TAG_I64 => self.varint().map(|_| ()),
            TAG_BINARY => {
                let len = usize::try_from(self.varint()?)
                    .map_err(|_| StoreError::overflow("binary length exceeds usize".into()))?;
                self.bytes(len).map(|_| ())
            }
            TAG_LIST => {
                let (count, elem_tag) = self.list_header()?;
                for _ in 0..count {
                    self.skip_value(elem_tag, depth + 1)?;
                }
                Ok(())
            }
            TAG_STRUCT => {
                let mut last_field_id = 0i16;
                while let Some((_, field_tag)) = self.field_header(&mut last_field_id)? {
                    self.skip_value(field_tag, depth + 1)?;
                }
                Ok(())
            }
            other => Err(StoreError::malformed_fragment(format!(
                "unskippable type tag {other:#x}"
            ))),
        }
    }
}

fn from_wire_u64(value: i64, what: &str) -> Result<u64> {
    u64::try_from(value)
        .map_err(|_| StoreError::malformed_fragment(format!("negative {what}: {value}")))
}

fn decode_column_chunk(r: &mut FieldReader<'_>) -> Result<ColumnChunkMeta> {
    let mut column_index = None;
    let mut file_offset = None;
    let mut byte_size = None;
    let mut physical_type = None;

    let mut last_field_id = 0i16;
    while let Some((id, tag)) = r.field_header(&mut last_field_id)? {
        match id {
            1 => {
                FieldReader::expect_tag(tag, TAG_I32, "column index")?;
                column_index = Some(
                    i32::try_from(r.zigzag()?)
                        .map_err(|_| StoreError::malformed_fragment("column index overflow"))?,
                );
            }
            2 => {
                FieldReader::expect_tag(tag, TAG_I64, "column chunk offset")?;
                file_offset = Some(from_wire_u64(r.zigzag()?, "column chunk offset")?);
            }
            3 => {
                FieldReader::expect_tag(tag, TAG_I64, "column chunk size")?;
                byte_size = Some(from_wire_u64(r.zigzag()?, "column chunk size")?);
            }
            4 => {
                FieldReader::expect_tag(tag, TAG_I32, "physical type")?;
                let code = i32::try_from(r.zigzag()?)
                    .map_err(|_| StoreError::malformed_fragment("physical type overflow"))?;
                physical_type = Some(PhysicalType::from_code(code).ok_or_else(|| {
                    StoreError::malformed_fragment(format!("unknown physical type code {code}"))
                })?);
            }
            _ => r.skip_value(tag, 0)?,
        }
    }

    Ok(ColumnChunkMeta {
        column_index: column_index
            .ok_or_else(|| StoreError::malformed_fragment("column chunk missing index"))?,
        file_offset: file_offset
            .ok_or_else(|| StoreError::malformed_fragment("column chunk missing offset"))?,
        byte_size: byte_size
            .ok_or_else(|| StoreError::malformed_fragment("column chunk missing size"))?,
        physical_type: physical_type
            .ok_or_else(|| StoreError::malformed_fragment("column chunk missing type"))?,
    })
}

fn decode_row_group(r: &mut FieldReader<'_>, index: u32) -> Result<RowGroupMeta> {
    let mut columns = Vec::new();
    let mut byte_size = None;
    let mut row_count = None;
    let mut file_offset = None;

    let mut last_field_id = 0i16;
    while let Some((id, tag)) = r.field_header(&mut last_field_id)? {
        match id {
            1 => {
                FieldReader::expect_tag(tag, TAG_LIST, "column list")?;
                let (count, elem_tag) = r.list_header()?;
                FieldReader::expect_tag(elem_tag, TAG_STRUCT, "column list element")?;
                columns.reserve(count.min(1024));
                for _ in 0..count {
                    columns.push(decode_column_chunk(r)?);
                }
            }
            2 => {
                FieldReader::expect_tag(tag, TAG_I64, "row group size")?;
                byte_size = Some(from_wire_u64(r.zigzag()?, "row group size")?);
            }
            3 => {
                FieldReader::expect_tag(tag, TAG_I64, "row count")?;
                row_count = Some(r.zigzag()?);
            }
            4 => {
                FieldReader::expect_tag(tag, TAG_I64, "row group offset")?;
                file_offset = Some(from_wire_u64(r.zigzag()?, "row group offset")?);
            }
            _ => r.skip_value(tag, 0)?,
        }
    }

    Ok(RowGroupMeta {
        index,
        file_offset: file_offset.unwrap_or(0),
        byte_size: byte_size.unwrap_or(0),
        row_count: row_count
            .ok_or_else(|| StoreError::malformed_fragment("row group missing row count"))?,
        columns,
    })
}

/// Decodes a footer struct from raw bytes.
///
/// Trailing bytes past the stop byte are an error: the caller hands this
/// function the exact footer region.
///
/// # Errors
///
/// Returns a malformed-fragment error on truncation, unexpected type tags,
/// negative offsets/sizes or a missing required field. Never returns
/// partially fabricated data.
pub fn decode_footer(bytes: &[u8]) -> Result<FooterData> {
    let mut r = FieldReader::new(bytes);

    let mut version = None;
    let mut total_rows = None;
    let mut row_groups = None;
    let mut created_by = String::new();

    let mut last_field_id = 0i16;
    while let Some((id, tag)) = r.field_header(&mut last_field_id)? {
        match id {
            1 => {
                FieldReader::expect_tag(tag, TAG_I32, "format version")?;
                version = Some(
                    i32::try_from(r.zigzag()?)
                        .map_err(|_| StoreError::malformed_fragment("version overflow"))?,
                );
            }
            2 => {
                FieldReader::expect_tag(tag, TAG_I64, "total row count")?;
                total_rows = Some(r.zigzag()?);
            }
            3 => {
                FieldReader::expect_tag(tag, TAG_LIST, "row group list")?;
                let (count, elem_tag) = r.list_header()?;
                FieldReader::expect_tag(elem_tag, TAG_STRUCT, "row group list element")?;
                let mut groups = Vec::with_capacity(count.min(4096));
                for i in 0..count {
                    let index = u32::try_from(i)
                        .map_err(|_| StoreError::overflow("row group index exceeds u32".into()))?;
                    groups.push(decode_row_group(&mut r, index)?);
                }
                row_groups = Some(groups);
            }
            4 => {
                FieldReader::expect_tag(tag, TAG_BINARY, "producer tag")?;
                let len = usize::try_from(r.varint()?)
                    .map_err(|_| StoreError::overflow("producer tag length".into()))?;
                created_by = String::from_utf8(r.bytes(len)?.to_vec())
                    .map_err(|_| StoreError::malformed_fragment("producer tag not UTF-8"))?;
            }
            _ => r.skip_value(tag, 0)?,
        }
    }

    if r.pos != bytes.len() {
        return Err(StoreError::malformed_fragment(format!(
            "{} trailing bytes after footer stop",
            bytes.len() - r.pos
        )));
    }

    Ok(FooterData {
        version: version
            .ok_or_else(|| StoreError::malformed_fragment("footer missing format version"))?,
        total_rows: total_rows
            .ok_or_else(|| StoreError::malformed_fragment("footer missing total row count"))?,
        row_groups: row_groups
            .ok_or_else(|| StoreError::malformed_fragment("footer missing row group list"))?,
        created_by,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn chunk(idx: i32, offset: u64, size: u64, ty: PhysicalType) -> ColumnChunkMeta {
        ColumnChunkMeta {
            column_index: idx,
            file_offset: offset,
            byte_size: size,
            physical_type: ty,
        }
    }

    fn row_group(index: u32, offset: u64, size: u64, rows: i64) -> RowGroupMeta {
        RowGroupMeta {
            index,
            file_offset: offset,
            byte_size: size,
            row_count: rows,
            columns: vec![
                chunk(0, offset, size / 2, PhysicalType::Int64),
                chunk(1, offset + size / 2, size - size / 2, PhysicalType::ByteArray),
            ],
        }
    }

    #[test]
    fn footer_roundtrips() {
        let groups = vec![row_group(0, 4, 1024, 100), row_group(1, 1028, 2048, 250)];
        let bytes = encode_footer(&groups, "tephra test").expect("encode");
        let decoded = decode_footer(&bytes).expect("decode");

        assert_eq!(decoded.version, FORMAT_VERSION);
        assert_eq!(decoded.total_rows, 350);
        assert_eq!(decoded.created_by, "tephra test");
        assert_eq!(decoded.row_groups, groups);
    }

    #[test]
    fn long_list_form_roundtrips() {
        // 20 elements forces the long list header (count >= 15).
        let groups: Vec<RowGroupMeta> = (0..20)
            .map(|i| row_group(i, 4 + u64::from(i) * 100, 100, 10))
            .collect();
        let bytes = encode_footer(&groups, "").expect("encode");
        let decoded = decode_footer(&bytes).expect("decode");
        assert_eq!(decoded.row_groups.len(), 20);
        assert_eq!(decoded.row_groups, groups);
    }

    #[test]
    fn long_form_field_header_roundtrips() {
        // A jump of more than 15 ids forces the explicit-id form.
        let mut buf = Vec::new();
        let mut w = FieldWriter::new(&mut buf);
        w.i32_field(1, 7);
        w.i64_field(40, 99);
        w.stop();

        let mut r = FieldReader::new(&buf);
        let mut last = 0i16;
        let (id, tag) = r.field_header(&mut last).expect("header").expect("field");
        assert_eq!((id, tag), (1, TAG_I32));
        assert_eq!(r.zigzag().expect("value"), 7);

        let (id, tag) = r.field_header(&mut last).expect("header").expect("field");
        assert_eq!((id, tag), (40, TAG_I64));
        assert_eq!(r.zigzag().expect("value"), 99);

        assert!(r.field_header(&mut last).expect("stop").is_none());
    }

    #[test]
    fn unknown_field_is_skipped() {
        // Footer with an extra binary field id 9 injected before the stop.
        let groups = vec![row_group(0, 4, 64, 5)];
        let encoded = encode_footer(&groups, "x").expect("encode");
        let mut bytes = encoded[..encoded.len() - 1].to_vec();

        let mut w = FieldWriter::new(&mut bytes);
        w.last_field_id = 4;
        w.binary_field(9, b"future");
        w.stop();

        let decoded = decode_footer(&bytes).expect("decode");
        assert_eq!(decoded.row_groups, groups);
    }

    #[test]
    fn truncated_footer_fails_closed() {
        let groups = vec![row_group(0, 4, 64, 5)];
        let bytes = encode_footer(&groups, "x").expect("encode");
        for cut in [1, bytes.len() / 2, bytes.len() - 1] {
            assert!(decode_footer(&bytes[..cut]).is_err(), "cut at {cut}");
        }
    }

    #[test]
    fn trailing_garbage_is_rejected() {
        let groups = vec![row_group(0, 4, 64, 5)];
        let mut bytes = encode_footer(&groups, "x").expect("encode").to_vec();
        bytes.push(0xab);
        assert!(decode_footer(&bytes).is_err());
    }

    #[test]
    fn negative_offset_is_rejected() {
        // Hand-build a row group with a negative offset on the wire.
        let mut buf = Vec::new();
        let mut w = FieldWriter::new(&mut buf);
        w.i32_field(1, FORMAT_VERSION);
        w.i64_field(2, 1);
        w.list_header(3, TAG_STRUCT, 1);
        drop(w);

        let mut w = FieldWriter::new(&mut buf);
        w.list_header(1, TAG_STRUCT, 0);
        w.i64_field(2, 10);
        w.i64_field(3, 1);
        w.i64_field(4, -4); // negative row group offset
        w.stop();

        let mut w = FieldWriter::new(&mut buf);
        w.last_field_id = 3;
        w.binary_field(4, b"");
        w.stop();

        assert!(decode_footer(&buf).is_err());
    }

    #[test]
    fn physical_type_codes_roundtrip() {
        for ty in [
            PhysicalType::Boolean,
            PhysicalType::Int32,
            PhysicalType::Int64,
            PhysicalType::Float,
            PhysicalType::Double,
            PhysicalType::ByteArray,
        ] {
            assert_eq!(PhysicalType::from_code(ty.code()), Some(ty));
        }
        assert_eq!(PhysicalType::from_code(42), None);
    }

    fn arb_physical_type() -> impl Strategy<Value = PhysicalType> {
        prop_oneof![
            Just(PhysicalType::Boolean),
            Just(PhysicalType::Int32),
            Just(PhysicalType::Int64),
            Just(PhysicalType::Float),
            Just(PhysicalType::Double),
            Just(PhysicalType::ByteArray),
        ]
    }

    fn arb_chunk() -> impl Strategy<Value = (u64, u64, PhysicalType)> {
        (0u64..1 << 40, 1u64..1 << 30, arb_physical_type())
    }

    proptest! {
        #[test]
        fn footer_roundtrip_property(
            specs in prop::collection::vec(
                (0u64..1 << 40, 1u64..1 << 30, 1i64..1 << 32,
                 prop::collection::vec(arb_chunk(), 1..6)),
                1..20,
            ),
            created_by in "[ -~]{0,32}",
        ) {
            let groups: Vec<RowGroupMeta> = specs
                .into_iter()
                .enumerate()
                .map(|(i, (offset, size, rows, chunks))| RowGroupMeta {
                    index: u32::try_from(i).expect("index"),
                    file_offset: offset,
                    byte_size: size,
                    row_count: rows,
                    columns: chunks
                        .into_iter()
                        .enumerate()
                        .map(|(ci, (co, cs, ty))| ColumnChunkMeta {
                            column_index: i32::try_from(ci).expect("column index"),
                            file_offset: co,
                            byte_size: cs,
                            physical_type: ty,
                        })
                        .collect(),
                })
                .collect();

            let bytes = encode_footer(&groups, &created_by).expect("encode");
            let decoded = decode_footer(&bytes).expect("decode");
            prop_assert_eq!(decoded.row_groups, groups);
            prop_assert_eq!(decoded.created_by, created_by);
        }
    }
}
