//! Append-only event-log container reader.
//!
//! The cold tier archives events into an OCF-style container: one shared
//! header (schema + codec + sync marker) followed by many independently
//! decodable blocks.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │ magic (4)                                                │
//! │ metadata map: zig-zag varint pair count, repeated        │
//! │   (varint-length key, varint-length value), 0 terminator │
//! │ sync marker (16)                                         │
//! ├──────────────────────────────────────────────────────────┤
//! │ block: record count (varint), payload size (varint),     │
//! │        payload, sync marker (16)                         │
//! ├──────────────────────────────────────────────────────────┤
//! │ ...                                                      │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! Blocks under the `"null"` codec hold records directly; `"deflate"`
//! blocks raw-inflate first, then decode identically. Record decoding
//! dispatches on the schema's declared field types. Decoded byte values
//! are represented as lowercase hex strings in the returned JSON.

use std::collections::BTreeMap;
use std::io::Read;

use serde_json::Value;

use crate::error::{Result, StoreError};
use crate::varint;

/// Container magic marker.
pub const CONTAINER_MAGIC: [u8; 4] = *b"TEV1";

/// Length of the synchronization marker separating blocks.
pub const SYNC_MARKER_LEN: usize = 16;

/// Metadata key carrying the schema JSON.
pub const META_SCHEMA: &str = "schema";

/// Metadata key carrying the codec name.
pub const META_CODEC: &str = "codec";

/// Metadata key carrying the producer's schema version.
pub const META_SCHEMA_VERSION: &str = "schemaVersion";

/// Upper bound on a single inflated block, guarding the decompressor
/// against malformed or hostile payloads.
const MAX_INFLATED_BLOCK_BYTES: u64 = 256 * 1024 * 1024;

/// Block compression codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    /// Records stored uncompressed.
    Null,
    /// Records stored raw-deflate compressed.
    Deflate,
}

impl Codec {
    /// Canonical codec name as stored in the header metadata.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Deflate => "deflate",
        }
    }

    fn from_name(name: &str) -> Result<Self> {
        match name {
            "null" => Ok(Self::Null),
            "deflate" => Ok(Self::Deflate),
            other => Err(StoreError::malformed_container(format!(
                "unsupported codec: {other}"
            ))),
        }
    }
}

/// Declared type of a schema field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldType {
    /// Always-null marker type (meaningful inside unions).
    Null,
    /// Single-byte booleans.
    Boolean,
    /// Zig-zag varint, 32-bit range.
    Int,
    /// Zig-zag varint, 64-bit range.
    Long,
    /// 4-byte little-endian IEEE float.
    Float,
    /// 8-byte little-endian IEEE double.
    Double,
    /// Varint length + UTF-8 bytes.
    String,
    /// Varint length + raw bytes.
    Bytes,
    /// Counted item blocks of the element type, 0-terminated.
    Array(Box<FieldType>),
    /// Branch-index varint, then the branch value.
    Union(Vec<FieldType>),
}

impl FieldType {
    fn from_json(value: &Value) -> Result<Self> {
        match value {
            Value::String(name) => match name.as_str() {
                "null" => Ok(Self::Null),
                "boolean" => Ok(Self::Boolean),
                "int" => Ok(Self::Int),
                "long" => Ok(Self::Long),
                "float" => Ok(Self::Float),
                "double" => Ok(Self::Double),
                "string" => Ok(Self::String),
                "bytes" => Ok(Self::Bytes),
                other => Err(StoreError::malformed_container(format!(
                    "unsupported schema type: {other}"
                ))),
            },
            Value::Array(branches) => {
                if branches.is_empty() {
                    return Err(StoreError::malformed_container("empty union in schema"));
                }
                branches
                    .iter()
                    .map(Self::from_json)
                    .collect::<Result<Vec<_>>>()
                    .map(Self::Union)
            }
            Value::Object(obj) => match obj.get("type").and_then(Value::as_str) {
                Some("array") => {
                    let items = obj.get("items").ok_or_else(|| {
                        StoreError::malformed_container("array schema missing items")
                    })?;
                    Ok(Self::Array(Box::new(Self::from_json(items)?)))
                }
                Some(other) => Err(StoreError::malformed_container(format!(
                    "unsupported complex schema type: {other}"
                ))),
                None => Err(StoreError::malformed_container(
                    "schema object missing type",
                )),
            },
            _ => Err(StoreError::malformed_container("unrecognized schema node")),
        }
    }
}

/// One named field of the record schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSchema {
    /// Field name, used as the JSON object key.
    pub name: String,
    /// Declared field type.
    pub ty: FieldType,
}

/// The container's record schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordSchema {
    /// Record name.
    pub name: String,
    /// Ordered fields; records are decoded strictly in this order.
    pub fields: Vec<FieldSchema>,
}

impl RecordSchema {
    /// Parses the schema from its JSON document.
    ///
    /// # Errors
    ///
    /// Returns a malformed-container error when the document is not a
    /// record schema with a field list of supported types.
    pub fn from_json(value: &Value) -> Result<Self> {
        let obj = value
            .as_object()
            .ok_or_else(|| StoreError::malformed_container("schema is not an object"))?;
        if obj.get("type").and_then(Value::as_str) != Some("record") {
            return Err(StoreError::malformed_container("schema is not a record"));
        }

        let name = obj
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or("record")
            .to_string();

        let fields = obj
            .get("fields")
            .and_then(Value::as_array)
            .ok_or_else(|| StoreError::malformed_container("schema missing fields"))?
            .iter()
            .map(|f| {
                let fobj = f
                    .as_object()
                    .ok_or_else(|| StoreError::malformed_container("field is not an object"))?;
                let fname = fobj
                    .get("name")
                    .and_then(Value::as_str)
                    .ok_or_else(|| StoreError::malformed_container("field missing name"))?;
                let ftype = fobj
                    .get("type")
                    .ok_or_else(|| StoreError::malformed_container("field missing type"))?;
                Ok(FieldSchema {
                    name: fname.to_string(),
                    ty: FieldType::from_json(ftype)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { name, fields })
    }
}

/// Parsed container header.
#[derive(Debug, Clone)]
pub struct ContainerHeader {
    /// Record schema all blocks decode against.
    pub schema: RecordSchema,
    /// Block compression codec.
    pub codec: Codec,
    /// Sync marker separating blocks.
    pub sync_marker: [u8; SYNC_MARKER_LEN],
    /// Byte length of the header (first block starts here).
    pub header_len: usize,
    /// Raw metadata map.
    pub metadata: BTreeMap<String, Vec<u8>>,
}

impl ContainerHeader {
    /// The producer's schema version, when present in the metadata.
    #[must_use]
    pub fn schema_version(&self) -> Option<u32> {
        self.metadata
            .get(META_SCHEMA_VERSION)
            .and_then(|raw| std::str::from_utf8(raw).ok())
            .and_then(|s| s.parse().ok())
    }
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .ok_or_else(|| StoreError::overflow("container length exceeds usize".into()))?;
        let slice = self
            .buf
            .get(self.pos..end)
            .ok_or_else(|| StoreError::malformed_container("container truncated"))?;
        self.pos = end;
        Ok(slice)
    }

    fn long(&mut self) -> Result<i64> {
        varint::decode_u64(self.buf, &mut self.pos)
            .map(varint::zigzag_decode)
            .ok_or_else(|| StoreError::malformed_container("bad varint"))
    }

    fn len_prefix(&mut self, what: &str) -> Result<usize> {
        let n = self.long()?;
        usize::try_from(n).map_err(|_| {
            StoreError::malformed_container(format!("negative {what} length: {n}"))
        })
    }
}

/// Parses the container header from the file's leading bytes.
///
/// `bytes` need not be the whole file; any prefix long enough to cover the
/// header works (the hot/cold reader fetches a bounded prefix).
///
/// # Errors
///
/// Returns a malformed-container error on bad magic, a truncated or
/// malformed metadata map, a missing/unparseable schema, or an unsupported
/// codec.
pub fn read_header(bytes: &[u8]) -> Result<ContainerHeader> {
    let mut c = Cursor::new(bytes);

    if c.bytes(4)? != CONTAINER_MAGIC {
        return Err(StoreError::malformed_container("bad container magic"));
    }

    let mut metadata = BTreeMap::new();
    loop {
        let n = c.long()?;
        if n == 0 {
            break;
        }
        // A negative pair count is followed by the raw byte size of the
        // metadata block; the count is its magnitude.
        let count = if n < 0 {
            let _block_bytes = c.long()?;
            n.checked_neg()
                .ok_or_else(|| StoreError::malformed_container("metadata count overflow"))?
        } else {
            n
        };

        for _ in 0..count {
            let key_len = c.len_prefix("metadata key")?;
            let key = std::str::from_utf8(c.bytes(key_len)?)
                .map_err(|_| StoreError::malformed_container("metadata key not UTF-8"))?
                .to_string();
            let value_len = c.len_prefix("metadata value")?;
            let value = c.bytes(value_len)?.to_vec();
            metadata.insert(key, value);
        }
    }

    let mut sync_marker = [0u8; SYNC_MARKER_LEN];
    sync_marker.copy_from_slice(c.bytes(SYNC_MARKER_LEN)?);
    let header_len = c.pos;

    let schema_raw = metadata
        .get(META_SCHEMA)
        .ok_or_else(|| StoreError::malformed_container("header missing schema"))?;
    let schema_json: Value = serde_json::from_slice(schema_raw)?;
    let schema = RecordSchema::from_json(&schema_json)?;

    let codec = match metadata.get(META_CODEC) {
        Some(raw) => {
            let name = std::str::from_utf8(raw)
                .map_err(|_| StoreError::malformed_container("codec name not UTF-8"))?;
            Codec::from_name(name)?
        }
        None => Codec::Null,
    };

    Ok(ContainerHeader {
        schema,
        codec,
        sync_marker,
        header_len,
        metadata,
    })
}

fn decode_value(c: &mut Cursor<'_>, ty: &FieldType) -> Result<Value> {
    match ty {
        FieldType::Null => Ok(Value::Null),
        FieldType::Boolean => match c.bytes(1)?[0] {
            0 => Ok(Value::Bool(false)),
            1 => Ok(Value::Bool(true)),
            other => Err(StoreError::malformed_container(format!(
                "bad boolean byte {other:#x}"
            ))),
        },
        FieldType::Int => {
            let v = c.long()?;
            i32::try_from(v)
                .map_err(|_| StoreError::malformed_container(format!("int out of range: {v}")))?;
            Ok(Value::from(v))
        }
        FieldType::Long => Ok(Value::from(c.long()?)),
        FieldType::Float => {
            let raw = c.bytes(4)?;
            let v = f32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
            serde_json::Number::from_f64(f64::from(v))
                .map(Value::Number)
                .ok_or_else(|| StoreError::malformed_container("non-finite float"))
        }
        FieldType::Double => {
            let raw = c.bytes(8)?;
            let v = f64::from_le_bytes([
                raw[0], raw[1], raw[2], raw[3], raw[4], raw[5], raw[6], raw[7],
            ]);
            serde_json::Number::from_f64(v)
                .map(Value::Number)
                .ok_or_else(|| StoreError::malformed_container("non-finite double"))
        }
        FieldType::String => {
            let len = c.len_prefix("string")?;
            let s = std::str::from_utf8(c.bytes(len)?)
                .map_err(|_| StoreError::malformed_container("string not UTF-8"))?;
            Ok(Value::String(s.to_string()))
        }
        FieldType::Bytes => {
            let len = c.len_prefix("bytes")?;
            let raw = c.bytes(len)?;
            let mut hex = String::with_capacity(len * 2);
            for byte in raw {
                use std::fmt::Write as _;
                let _ = write!(hex, "{byte:02x}");
            }
            Ok(Value::String(hex))
        }
        FieldType::Array(items) => {
            let mut out = Vec::new();
            loop {
                let n = c.long()?;
                if n == 0 {
                    break;
                }
                let count = if n < 0 {
                    let _block_bytes = c.long()?;
                    n.checked_neg().ok_or_else(|| {
                        StoreError::malformed_container("array count overflow")
                    })?
                } else {
                    n
                };
                for _ in 0..count {
                    out.push(decode_value(c, items)?);
                }
            }
            Ok(Value::Array(out))
        }
        FieldType::Union(branches) => {
            let idx = c.len_prefix("union branch")?;
            let branch = branches.get(idx).ok_or_else(|| {
                StoreError::malformed_container(format!(
                    "union branch {idx} out of range ({} branches)",
                    branches.len()
                ))
            })?;
            decode_value(c, branch)
        }
    }
}

fn decode_records(schema: &RecordSchema, payload: &[u8], record_count: usize) -> Result<Vec<Value>> {
    let mut c = Cursor::new(payload);
    let mut records = Vec::with_capacity(record_count.min(65_536));

    for _ in 0..record_count {
        let mut obj = serde_json::Map::with_capacity(schema.fields.len());
        for field in &schema.fields {
            obj.insert(field.name.clone(), decode_value(&mut c, &field.ty)?);
        }
        records.push(Value::Object(obj));
    }

    if c.remaining() != 0 {
        return Err(StoreError::malformed_container(format!(
            "{} bytes left over after {record_count} records",
            c.remaining()
        )));
    }
    Ok(records)
}

fn inflate(payload: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let decoder = flate2::read::DeflateDecoder::new(payload);
    decoder
        .take(MAX_INFLATED_BLOCK_BYTES + 1)
        .read_to_end(&mut out)
        .map_err(|e| StoreError::malformed_container(format!("deflate error: {e}")))?;
    if out.len() as u64 > MAX_INFLATED_BLOCK_BYTES {
        return Err(StoreError::malformed_container(format!(
            "inflated block exceeds {MAX_INFLATED_BLOCK_BYTES} byte limit"
        )));
    }
    Ok(out)
}

/// Decodes a single block fetched by its exact byte range.
///
/// The slice must start at the block's leading varints and end either at
/// the payload end or just past the trailing sync marker (which is then
/// verified against the header).
///
/// # Errors
///
/// Returns a malformed-container error on truncation, codec failure, a
/// sync-marker mismatch, or record bytes inconsistent with the schema.
pub fn read_block(header: &ContainerHeader, bytes: &[u8]) -> Result<Vec<Value>> {
    let (records, consumed) = read_block_at(header, bytes)?;
    if consumed != bytes.len() {
        return Err(StoreError::malformed_container(format!(
            "{} trailing bytes after block",
            bytes.len() - consumed
        )));
    }
    Ok(records)
}

/// Decodes one block starting at `bytes[0]`, returning the records and the
/// number of bytes consumed (including the trailing sync marker when
/// present).
fn read_block_at(header: &ContainerHeader, bytes: &[u8]) -> Result<(Vec<Value>, usize)> {
    let mut c = Cursor::new(bytes);

    let record_count = c.len_prefix("record count")?;
    let payload_size = c.len_prefix("payload size")?;
    let payload = c.bytes(payload_size)?;

    let records = match header.codec {
        Codec::Null => decode_records(&header.schema, payload, record_count)?,
        Codec::Deflate => {
            let inflated = inflate(payload)?;
            decode_records(&header.schema, &inflated, record_count)?
        }
    };

    // The writer terminates every block with the sync marker; accept a
    // range that stopped at the payload for callers indexing payload-only.
    if c.remaining() >= SYNC_MARKER_LEN {
        let marker = c.bytes(SYNC_MARKER_LEN)?;
        if marker != header.sync_marker {
            return Err(StoreError::malformed_container("sync marker mismatch"));
        }
    }

    Ok((records, c.pos))
}

/// Parses an entire container: header, then consecutive blocks until the
/// cursor reaches the end of the body.
///
/// # Errors
///
/// Returns a malformed-container error if the header or any block fails to
/// parse; a trailing partial block is an error, not silently dropped.
pub fn read_file(bytes: &[u8]) -> Result<(ContainerHeader, Vec<Value>)> {
    let header = read_header(bytes)?;
    let mut records = Vec::new();

    let mut pos = header.header_len;
    while pos < bytes.len() {
        let (mut block_records, consumed) = read_block_at(&header, &bytes[pos..])?;
        records.append(&mut block_records);
        pos += consumed;
    }
    Ok((header, records))
}


#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event_schema() -> Value {
        json!({
            "type": "record",
            "name": "event",
            "fields": [
                {"name": "timestamp", "type": "long"},
                {"name": "level", "type": "string"},
                {"name": "count", "type": "int"},
                {"name": "ratio", "type": "double"},
                {"name": "ok", "type": "boolean"},
                {"name": "tags", "type": {"type": "array", "items": "string"}},
                {"name": "note", "type": ["null", "string"]},
                {"name": "payload", "type": "bytes"}
            ]
        })
    }

    fn sample_record(ts: i64) -> Value {
        json!({
            "timestamp": ts,
            "level": "info",
            "count": 3,
            "ratio": 0.5,
            "ok": true,
            "tags": ["a", "b"],
            "note": null,
            "payload": "deadbeef"
        })
    }

    #[test]
    fn header_roundtrips_schema_and_codec() {
        let bytes = testutil::write_container(&event_schema(), Codec::Null, Some(2), &[]);
        let header = read_header(&bytes).expect("header");

        assert_eq!(header.codec, Codec::Null);
        assert_eq!(header.schema.fields.len(), 8);
        assert_eq!(header.schema_version(), Some(2));
        assert_eq!(header.header_len, bytes.len());
    }

    #[test]
    fn rejects_bad_magic() {
        let mut bytes = testutil::write_container(&event_schema(), Codec::Null, None, &[]);
        bytes[0] = b'X';
        assert!(read_header(&bytes).is_err());
    }

    #[test]
    fn null_codec_block_roundtrips() {
        let records = vec![sample_record(100), sample_record(200)];
        let bytes =
            testutil::write_container(&event_schema(), Codec::Null, None, &[records.clone()]);
        let header = read_header(&bytes).expect("header");

        let decoded = read_block(&header, &bytes[header.header_len..]).expect("block");
        assert_eq!(decoded, records);
    }

    #[test]
    fn deflate_codec_block_roundtrips() {
        let records = vec![sample_record(100), sample_record(200), sample_record(300)];
        let bytes =
            testutil::write_container(&event_schema(), Codec::Deflate, None, &[records.clone()]);
        let header = read_header(&bytes).expect("header");
        assert_eq!(header.codec, Codec::Deflate);

        let decoded = read_block(&header, &bytes[header.header_len..]).expect("block");
        assert_eq!(decoded, records);
    }

    #[test]
    fn whole_file_walks_consecutive_blocks() {
        let blocks = vec![
            vec![sample_record(1), sample_record(2)],
            vec![sample_record(3)],
            vec![sample_record(4), sample_record(5)],
        ];
        let bytes = testutil::write_container(&event_schema(), Codec::Null, None, &blocks);

        let (_, records) = read_file(&bytes).expect("file");
        let timestamps: Vec<i64> = records
            .iter()
            .map(|r| r["timestamp"].as_i64().expect("ts"))
            .collect();
        assert_eq!(timestamps, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn sync_marker_mismatch_is_rejected() {
        let records = vec![sample_record(1)];
        let mut bytes = testutil::write_container(&event_schema(), Codec::Null, None, &[records]);
        let header = read_header(&bytes).expect("header");

        // Corrupt the block's trailing sync marker.
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        assert!(read_block(&header, &bytes[header.header_len..]).is_err());
    }

    #[test]
    fn truncated_block_fails_closed() {
        let records = vec![sample_record(1)];
        let bytes = testutil::write_container(&event_schema(), Codec::Null, None, &[records]);
        let header = read_header(&bytes).expect("header");

        let body = &bytes[header.header_len..];
        assert!(read_block(&header, &body[..body.len() / 2]).is_err());
    }

    #[test]
    fn union_null_branch_decodes_to_null() {
        let records = vec![json!({
            "timestamp": 9,
            "level": "warn",
            "count": 0,
            "ratio": 1.5,
            "ok": false,
            "tags": [],
            "note": "present",
            "payload": ""
        })];
        let bytes =
            testutil::write_container(&event_schema(), Codec::Null, None, &[records.clone()]);
        let (_, decoded) = read_file(&bytes).expect("file");
        assert_eq!(decoded[0]["note"], json!("present"));
        assert_eq!(decoded[0]["tags"], json!([]));

        let records = vec![sample_record(10)];
        let bytes = testutil::write_container(&event_schema(), Codec::Null, None, &[records]);
        let (_, decoded) = read_file(&bytes).expect("file");
        assert!(decoded[0]["note"].is_null());
    }

    #[test]
    fn block_without_sync_suffix_is_accepted() {
        let records = vec![sample_record(7)];
        let bytes =
            testutil::write_container(&event_schema(), Codec::Null, None, &[records.clone()]);
        let header = read_header(&bytes).expect("header");

        // Stop the range at the payload end, excluding the sync marker.
        let body = &bytes[header.header_len..bytes.len() - SYNC_MARKER_LEN];
        let decoded = read_block(&header, body).expect("block");
        assert_eq!(decoded, records);
    }

    #[test]
    fn unsupported_codec_is_rejected() {
        let mut bytes = testutil::write_container(&event_schema(), Codec::Null, None, &[]);
        // Replace the codec metadata value "null" with "zstd" in place. The
        // schema JSON also contains "null", so search after the codec key.
        let key_pos = bytes
            .windows(5)
            .position(|w| w == b"codec")
            .expect("codec key present");
        let rel = bytes[key_pos..]
            .windows(4)
            .position(|w| w == b"null")
            .expect("codec value present");
        let pos = key_pos + rel;
        bytes[pos..pos + 4].copy_from_slice(b"zstd");
        assert!(read_header(&bytes).is_err());
    }
}
