//! Storage backend abstraction for the object-storage bucket.
//!
//! The bucket holding fragment and container bytes is an external
//! collaborator; this module defines the contract the engine needs from it:
//!
//! - Whole-object and byte-range reads. Range reads are a first-class
//!   requirement, not an optimization: the merge engine and the hot/cold
//!   reader never fetch whole objects on their primary paths.
//! - `put` returning size and etag, `head` returning size, idempotent
//!   `delete`, and prefix listing.
//!
//! Two implementations ship with the engine: an in-memory backend for tests
//! and a local-filesystem backend for the CLI. Production object stores live
//! behind the same trait.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use crate::error::{Error, Result};

/// Result of a successful write.
#[derive(Debug, Clone)]
pub struct PutResult {
    /// Number of bytes written.
    pub size: u64,
    /// Entity tag of the stored object.
    pub etag: String,
}

/// Metadata about a stored object.
#[derive(Debug, Clone)]
pub struct ObjectMeta {
    /// Object key.
    pub key: String,
    /// Object size in bytes.
    pub size: u64,
    /// Last modification timestamp.
    pub last_modified: Option<DateTime<Utc>>,
    /// Entity tag for cache validation.
    pub etag: Option<String>,
}

/// Storage backend trait for object storage.
#[async_trait]
pub trait StorageBackend: Send + Sync + 'static {
    /// Reads an entire object.
    ///
    /// Returns `Error::NotFound` if the object doesn't exist.
    async fn get(&self, key: &str) -> Result<Bytes>;

    /// Reads a byte range from an object.
    ///
    /// Returns `Error::InvalidInput` if start > object length or end < start.
    /// Clamps end to the object length if end > length.
    async fn get_range(&self, key: &str, range: Range<u64>) -> Result<Bytes>;

    /// Writes an object with the given user metadata.
    async fn put(
        &self,
        key: &str,
        data: Bytes,
        metadata: HashMap<String, String>,
    ) -> Result<PutResult>;

    /// Gets object metadata without reading content.
    ///
    /// Returns `None` if the object doesn't exist.
    async fn head(&self, key: &str) -> Result<Option<ObjectMeta>>;

    /// Deletes an object.
    ///
    /// Succeeds even if the object doesn't exist (idempotent).
    async fn delete(&self, key: &str) -> Result<()>;

    /// Lists objects with the given key prefix.
    ///
    /// Returns an empty vec if no objects match. Ordering is unspecified;
    /// callers requiring deterministic order should sort the results.
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>>;
}

fn slice_range(data: &Bytes, range: Range<u64>) -> Result<Bytes> {
    let len = data.len();

    let start = usize::try_from(range.start).unwrap_or(usize::MAX);
    if start > len {
        return Err(Error::InvalidInput(format!(
            "range start {start} exceeds object length {len}"
        )));
    }

    let end = usize::try_from(range.end).unwrap_or(usize::MAX).min(len);
    if end < start {
        return Err(Error::InvalidInput(format!(
            "range end {end} is before start {start}"
        )));
    }
    Ok(data.slice(start..end))
}

/// In-memory storage backend for testing.
///
/// Thread-safe via `RwLock`. Not suitable for production.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    objects: Arc<RwLock<HashMap<String, StoredObject>>>,
}

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    version: u64,
    last_modified: DateTime<Utc>,
    #[allow(dead_code)]
    metadata: HashMap<String, String>,
}

impl MemoryBackend {
    /// Creates a new empty memory backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Bytes> {
        let objects = self.objects.read().map_err(|_| Error::Internal {
            message: "lock poisoned".into(),
        })?;

        objects
            .get(key)
            .map(|o| o.data.clone())
            .ok_or_else(|| Error::NotFound(format!("object not found: {key}")))
    }

    async fn get_range(&self, key: &str, range: Range<u64>) -> Result<Bytes> {
        let data = self.get(key).await?;
        slice_range(&data, range)
    }

    async fn put(
        &self,
        key: &str,
        data: Bytes,
        metadata: HashMap<String, String>,
    ) -> Result<PutResult> {
        let mut objects = self.objects.write().map_err(|_| Error::Internal {
            message: "lock poisoned".into(),
        })?;

        let version = objects.get(key).map_or(1, |o| o.version + 1);
        let size = data.len() as u64;
        objects.insert(
            key.to_string(),
            StoredObject {
                data,
                version,
                last_modified: Utc::now(),
                metadata,
            },
        );
        drop(objects);

        Ok(PutResult {
            size,
            etag: format!("\"{version}\""),
        })
    }

    async fn head(&self, key: &str) -> Result<Option<ObjectMeta>> {
        let objects = self.objects.read().map_err(|_| Error::Internal {
            message: "lock poisoned".into(),
        })?;

        Ok(objects.get(key).map(|obj| ObjectMeta {
            key: key.to_string(),
            size: obj.data.len() as u64,
            last_modified: Some(obj.last_modified),
            etag: Some(format!("\"{}\"", obj.version)),
        }))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.objects
            .write()
            .map_err(|_| Error::Internal {
                message: "lock poisoned".into(),
            })?
            .remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        let objects = self.objects.read().map_err(|_| Error::Internal {
            message: "lock poisoned".into(),
        })?;

        Ok(objects
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(key, obj)| ObjectMeta {
                key: key.clone(),
                size: obj.data.len() as u64,
                last_modified: Some(obj.last_modified),
                etag: Some(format!("\"{}\"", obj.version)),
            })
            .collect())
    }
}

/// Local-filesystem storage backend.
///
/// Maps object keys onto paths below a root directory. Used by the CLI for
/// manual compaction runs against a local bucket mirror; range reads seek
/// rather than reading whole files.
#[derive(Debug, Clone)]
pub struct FsBackend {
    root: PathBuf,
}

impl FsBackend {
    /// Creates a backend rooted at the given directory.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, key: &str) -> Result<PathBuf> {
        // Keys are bucket-relative; reject traversal outside the root.
        if key.is_empty() || key.starts_with('/') || key.split('/').any(|seg| seg == "..") {
            return Err(Error::InvalidInput(format!("invalid object key: {key}")));
        }
        Ok(self.root.join(key))
    }

    fn meta_for(&self, key: &str, path: &Path) -> Result<Option<ObjectMeta>> {
        match std::fs::metadata(path) {
            Ok(md) if md.is_file() => {
                let last_modified = md
                    .modified()
                    .ok()
                    .map(DateTime::<Utc>::from);
                let etag = last_modified
                    .map(|ts| format!("\"{}-{}\"", md.len(), ts.timestamp_millis()));
                Ok(Some(ObjectMeta {
                    key: key.to_string(),
                    size: md.len(),
                    last_modified,
                    etag,
                }))
            }
            Ok(_) => Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::storage_with_source(
                format!("stat failed for {key}"),
                e,
            )),
        }
    }
}

#[async_trait]
impl StorageBackend for FsBackend {
    async fn get(&self, key: &str) -> Result<Bytes> {
        let path = self.resolve(key)?;
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::NotFound(format!("object not found: {key}")))
            }
            Err(e) => Err(Error::storage_with_source(format!("read failed for {key}"), e)),
        }
    }

    async fn get_range(&self, key: &str, range: Range<u64>) -> Result<Bytes> {
        use tokio::io::{AsyncReadExt, AsyncSeekExt};

        let path = self.resolve(key)?;
        let mut file = match tokio::fs::File::open(&path).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::NotFound(format!("object not found: {key}")));
            }
            Err(e) => {
                return Err(Error::storage_with_source(
                    format!("open failed for {key}"),
                    e,
                ));
            }
        };

        let len = file
            .metadata()
            .await
            .map_err(|e| Error::storage_with_source(format!("stat failed for {key}"), e))?
            .len();

        if range.start > len {
            return Err(Error::InvalidInput(format!(
                "range start {} exceeds object length {len}",
                range.start
            )));
        }
        let end = range.end.min(len);
        if end < range.start {
            return Err(Error::InvalidInput(format!(
                "range end {end} is before start {}",
                range.start
            )));
        }

        file.seek(std::io::SeekFrom::Start(range.start))
            .await
            .map_err(|e| Error::storage_with_source(format!("seek failed for {key}"), e))?;

        let span = usize::try_from(end - range.start)
            .map_err(|_| Error::overflow(format!("range too large for {key}")))?;
        let mut buf = vec![0u8; span];
        file.read_exact(&mut buf)
            .await
            .map_err(|e| Error::storage_with_source(format!("range read failed for {key}"), e))?;
        Ok(Bytes::from(buf))
    }

    async fn put(
        &self,
        key: &str,
        data: Bytes,
        _metadata: HashMap<String, String>,
    ) -> Result<PutResult> {
        let path = self.resolve(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::storage_with_source(format!("mkdir failed for {key}"), e))?;
        }

        let size = data.len() as u64;
        tokio::fs::write(&path, &data)
            .await
            .map_err(|e| Error::storage_with_source(format!("write failed for {key}"), e))?;

        let etag = self
            .meta_for(key, &path)?
            .and_then(|m| m.etag)
            .unwrap_or_else(|| format!("\"{size}\""));
        Ok(PutResult { size, etag })
    }

    async fn head(&self, key: &str) -> Result<Option<ObjectMeta>> {
        let path = self.resolve(key)?;
        self.meta_for(key, &path)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.resolve(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::storage_with_source(
                format!("delete failed for {key}"),
                e,
            )),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        let mut out = Vec::new();
        let mut stack = vec![self.root.clone()];

        while let Some(dir) = stack.pop() {
            let entries = match std::fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => {
                    return Err(Error::storage_with_source(
                        format!("list failed under {}", dir.display()),
                        e,
                    ));
                }
            };

            for entry in entries {
                let entry = entry.map_err(|e| {
                    Error::storage_with_source(format!("list failed under {}", dir.display()), e)
                })?;
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                    continue;
                }

                let Ok(rel) = path.strip_prefix(&self.root) else {
                    continue;
                };
                let key = rel
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                if !key.starts_with(prefix) {
                    continue;
                }
                if let Some(meta) = self.meta_for(&key, &path)? {
                    out.push(meta);
                }
            }
        }

        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_backend_roundtrip() {
        let backend = MemoryBackend::new();
        let data = Bytes::from("hello world");

        let result = backend
            .put("test/file.bin", data.clone(), HashMap::new())
            .await
            .expect("put should succeed");
        assert_eq!(result.size, 11);
        assert!(!result.etag.is_empty());

        let retrieved = backend
            .get("test/file.bin")
            .await
            .expect("get should succeed");
        assert_eq!(retrieved, data);
    }

    #[tokio::test]
    async fn memory_get_range_clamps_end() {
        let backend = MemoryBackend::new();
        backend
            .put("t.bin", Bytes::from("hello"), HashMap::new())
            .await
            .expect("put should succeed");

        // End beyond length should clamp, not panic.
        let result = backend
            .get_range("t.bin", 0..100)
            .await
            .expect("should succeed");
        assert_eq!(result, Bytes::from("hello"));
    }

    #[tokio::test]
    async fn memory_get_range_invalid_start() {
        let backend = MemoryBackend::new();
        backend
            .put("t.bin", Bytes::from("hello"), HashMap::new())
            .await
            .expect("put should succeed");

        assert!(backend.get_range("t.bin", 100..200).await.is_err());
        assert!(backend.get_range("t.bin", 4..2).await.is_err());
    }

    #[tokio::test]
    async fn memory_delete_is_idempotent() {
        let backend = MemoryBackend::new();
        backend
            .put("d.bin", Bytes::from("x"), HashMap::new())
            .await
            .expect("put should succeed");

        backend.delete("d.bin").await.expect("first delete");
        backend.delete("d.bin").await.expect("second delete");
        assert!(backend.head("d.bin").await.expect("head").is_none());
    }

    #[tokio::test]
    async fn memory_list_with_prefix() {
        let backend = MemoryBackend::new();
        for key in ["a/1.bin", "a/2.bin", "b/1.bin"] {
            backend
                .put(key, Bytes::from("x"), HashMap::new())
                .await
                .expect("put should succeed");
        }

        let list_a = backend.list("a/").await.expect("list");
        assert_eq!(list_a.len(), 2);
        let list_b = backend.list("b/").await.expect("list");
        assert_eq!(list_b.len(), 1);
    }

    #[tokio::test]
    async fn fs_backend_range_read_seeks() {
        let dir = tempfile::tempdir().expect("tempdir");
        let backend = FsBackend::new(dir.path());

        backend
            .put(
                "frag/one.bin",
                Bytes::from_static(b"0123456789"),
                HashMap::new(),
            )
            .await
            .expect("put should succeed");

        let mid = backend
            .get_range("frag/one.bin", 3..7)
            .await
            .expect("range read");
        assert_eq!(mid, Bytes::from_static(b"3456"));

        // End clamps to file size.
        let tail = backend
            .get_range("frag/one.bin", 8..100)
            .await
            .expect("clamped range read");
        assert_eq!(tail, Bytes::from_static(b"89"));
    }

    #[tokio::test]
    async fn fs_backend_rejects_traversal() {
        let dir = tempfile::tempdir().expect("tempdir");
        let backend = FsBackend::new(dir.path());
        assert!(backend.get("../escape.bin").await.is_err());
        assert!(backend.get("/absolute.bin").await.is_err());
    }

    #[tokio::test]
    async fn fs_backend_list_walks_subdirectories() {
        let dir = tempfile::tempdir().expect("tempdir");
        let backend = FsBackend::new(dir.path());

        for key in ["ds/fragments/a.bin", "ds/fragments/b.bin", "ds/log/c.bin"] {
            backend
                .put(key, Bytes::from("x"), HashMap::new())
                .await
                .expect("put should succeed");
        }

        let mut keys: Vec<String> = backend
            .list("ds/fragments/")
            .await
            .expect("list")
            .into_iter()
            .map(|m| m.key)
            .collect();
        keys.sort();
        assert_eq!(keys, vec!["ds/fragments/a.bin", "ds/fragments/b.bin"]);
    }
}
