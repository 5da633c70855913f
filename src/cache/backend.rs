//! Storage backends for named response buckets.
//!
//! Defines the [`CacheBackend`] trait and two implementations:
//! [`MemoryBackend`] for tests and ephemeral hosts, [`DiskBackend`] for hosts
//! that want the offline cache to survive a restart.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;

use crate::cache::http::{RequestKey, Response};
use crate::error::{Result, WorkerError};

/// Async bucket storage.
///
/// A single `put` and a single `delete_bucket` must each be all-or-nothing:
/// readers see the old value or the new one, never a torn entry or a
/// half-deleted bucket.
#[async_trait]
pub trait CacheBackend: Send + Sync + 'static {
    /// Store (overwrite) one entry, creating the bucket if needed.
    async fn put(&self, bucket: &str, key: &RequestKey, response: &Response) -> Result<()>;

    /// Look up one entry. A missing bucket is a miss, not an error.
    async fn get(&self, bucket: &str, key: &RequestKey) -> Result<Option<Response>>;

    /// Delete one entry. Returns `false` if it did not exist.
    async fn delete(&self, bucket: &str, key: &RequestKey) -> Result<bool>;

    /// Delete a whole bucket. Returns `false` if it did not exist.
    async fn delete_bucket(&self, bucket: &str) -> Result<bool>;

    /// Names of every stored bucket.
    async fn bucket_names(&self) -> Result<Vec<String>>;

    /// Keys stored in one bucket.
    async fn keys(&self, bucket: &str) -> Result<Vec<RequestKey>>;
}

type Buckets = HashMap<String, HashMap<RequestKey, Response>>;

/// In-memory backend. Cheaply cloneable; clones share storage.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    buckets: Arc<RwLock<Buckets>>,
}

impl MemoryBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheBackend for MemoryBackend {
    async fn put(&self, bucket: &str, key: &RequestKey, response: &Response) -> Result<()> {
        self.buckets
            .write()
            .await
            .entry(bucket.to_owned())
            .or_default()
            .insert(key.clone(), response.clone());
        Ok(())
    }

    async fn get(&self, bucket: &str, key: &RequestKey) -> Result<Option<Response>> {
        Ok(self
            .buckets
            .read()
            .await
            .get(bucket)
            .and_then(|entries| entries.get(key))
            .cloned())
    }

    async fn delete(&self, bucket: &str, key: &RequestKey) -> Result<bool> {
        Ok(self
            .buckets
            .write()
            .await
            .get_mut(bucket)
            .is_some_and(|entries| entries.remove(key).is_some()))
    }

    async fn delete_bucket(&self, bucket: &str) -> Result<bool> {
        Ok(self.buckets.write().await.remove(bucket).is_some())
    }

    async fn bucket_names(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self.buckets.read().await.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn keys(&self, bucket: &str) -> Result<Vec<RequestKey>> {
        let mut keys: Vec<RequestKey> = self
            .buckets
            .read()
            .await
            .get(bucket)
            .map(|entries| entries.keys().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        Ok(keys)
    }
}

/// One cached entry on disk.
#[derive(Debug, Serialize, Deserialize)]
struct StoredEntry {
    key: RequestKey,
    response: Response,
}

/// Filesystem backend.
///
/// Layout: `{root}/{bucket}/{sha256(key)}.json`. Entry writes go through a
/// temp file and rename; bucket deletes rename the directory aside before
/// removing it, so a bucket is either fully visible or gone.
#[derive(Debug, Clone)]
pub struct DiskBackend {
    root: PathBuf,
}

impl DiskBackend {
    /// Open (creating if needed) a disk backend rooted at `root`.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::Storage`] if the directory cannot be created.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|e| {
            WorkerError::Storage(format!(
                "failed to create cache directory {}: {e}",
                root.display()
            ))
        })?;
        Ok(Self { root })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn bucket_dir(&self, bucket: &str) -> Result<PathBuf> {
        let valid = !bucket.is_empty()
            && !bucket.starts_with('.')
            && bucket
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if !valid {
            return Err(WorkerError::Storage(format!("invalid bucket name: {bucket:?}")));
        }
        Ok(self.root.join(bucket))
    }

    fn entry_file(key: &RequestKey) -> String {
        format!("{}.json", hex_digest(key.as_str()))
    }

    /// Read errors surface as [`WorkerError::Io`] so callers can tell a
    /// missing entry apart; parse errors are [`WorkerError::Storage`].
    async fn read_entry(path: &Path) -> Result<StoredEntry> {
        let raw = tokio::fs::read(path).await?;
        serde_json::from_slice(&raw).map_err(|e| {
            WorkerError::Storage(format!("failed to parse cache entry {}: {e}", path.display()))
        })
    }
}

fn hex_digest(input: &str) -> String {
    Sha256::digest(input.as_bytes())
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

#[async_trait]
impl CacheBackend for DiskBackend {
    async fn put(&self, bucket: &str, key: &RequestKey, response: &Response) -> Result<()> {
        let dir = self.bucket_dir(bucket)?;
        tokio::fs::create_dir_all(&dir).await.map_err(|e| {
            WorkerError::Storage(format!("failed to create bucket {}: {e}", dir.display()))
        })?;

        let entry = StoredEntry {
            key: key.clone(),
            response: response.clone(),
        };
        let json = serde_json::to_vec(&entry)
            .map_err(|e| WorkerError::Storage(format!("failed to serialize entry {key}: {e}")))?;

        let file = Self::entry_file(key);
        let tmp_path = dir.join(format!(".{file}.tmp"));
        let path = dir.join(&file);
        tokio::fs::write(&tmp_path, &json).await.map_err(|e| {
            WorkerError::Storage(format!("failed to write temp file {}: {e}", tmp_path.display()))
        })?;
        tokio::fs::rename(&tmp_path, &path).await.map_err(|e| {
            WorkerError::Storage(format!("failed to rename temp file to {}: {e}", path.display()))
        })?;
        Ok(())
    }

    async fn get(&self, bucket: &str, key: &RequestKey) -> Result<Option<Response>> {
        let path = self.bucket_dir(bucket)?.join(Self::entry_file(key));
        let entry = match Self::read_entry(&path).await {
            Ok(entry) => entry,
            Err(WorkerError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(None);
            }
            Err(WorkerError::Io(e)) => {
                return Err(WorkerError::Storage(format!(
                    "failed to read cache entry {}: {e}",
                    path.display()
                )));
            }
            Err(e) => return Err(e),
        };
        if &entry.key != key {
            return Ok(None);
        }
        Ok(Some(entry.response))
    }

    async fn delete(&self, bucket: &str, key: &RequestKey) -> Result<bool> {
        let path = self.bucket_dir(bucket)?.join(Self::entry_file(key));
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(WorkerError::Storage(format!(
                "failed to delete cache entry {}: {e}",
                path.display()
            ))),
        }
    }

    async fn delete_bucket(&self, bucket: &str) -> Result<bool> {
        let dir = self.bucket_dir(bucket)?;
        match tokio::fs::metadata(&dir).await {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => {
                return Err(WorkerError::Storage(format!(
                    "{} is not a bucket directory",
                    dir.display()
                )));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => {
                return Err(WorkerError::Storage(format!(
                    "failed to inspect bucket {}: {e}",
                    dir.display()
                )));
            }
        }

        let trash = self.root.join(format!(".trash-{bucket}"));
        match tokio::fs::remove_dir_all(&trash).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(WorkerError::Storage(format!(
                    "failed to clear stale trash {}: {e}",
                    trash.display()
                )));
            }
        }
        tokio::fs::rename(&dir, &trash).await.map_err(|e| {
            WorkerError::Storage(format!("failed to retire bucket {}: {e}", dir.display()))
        })?;
        if let Err(e) = tokio::fs::remove_dir_all(&trash).await {
            tracing::warn!(error = %e, bucket, "failed to remove retired bucket directory");
        }
        Ok(true)
    }

    async fn bucket_names(&self) -> Result<Vec<String>> {
        let mut entries = tokio::fs::read_dir(&self.root).await.map_err(|e| {
            WorkerError::Storage(format!(
                "failed to read cache directory {}: {e}",
                self.root.display()
            ))
        })?;

        let mut names = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| WorkerError::Storage(format!("failed to list buckets: {e}")))?
        {
            let is_dir = entry
                .file_type()
                .await
                .map_err(|e| WorkerError::Storage(format!("failed to stat bucket entry: {e}")))?
                .is_dir();
            let name = entry.file_name().to_string_lossy().into_owned();
            if is_dir && !name.starts_with('.') {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    async fn keys(&self, bucket: &str) -> Result<Vec<RequestKey>> {
        let dir = self.bucket_dir(bucket)?;
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(WorkerError::Storage(format!(
                    "failed to read bucket {}: {e}",
                    dir.display()
                )));
            }
        };

        let mut keys = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| WorkerError::Storage(format!("failed to list bucket {bucket}: {e}")))?
        {
            let path = entry.path();
            let is_entry = path.extension().and_then(|e| e.to_str()) == Some("json")
                && !entry.file_name().to_string_lossy().starts_with('.');
            if !is_entry {
                continue;
            }
            match Self::read_entry(&path).await {
                Ok(stored) => keys.push(stored.key),
                Err(e) => tracing::debug!(error = %e, "skipping unreadable cache entry"),
            }
        }
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use url::Url;

    fn key(path: &str) -> RequestKey {
        RequestKey::new("GET", &Url::parse("http://x.test").unwrap().join(path).unwrap())
    }

    async fn exercise(backend: &dyn CacheBackend) {
        let resp = Response::ok("text/plain", "hello");
        backend.put("app-static-v1", &key("/a"), &resp).await.unwrap();
        backend
            .put("app-static-v1", &key("/a"), &Response::ok("text/plain", "again"))
            .await
            .unwrap();
        backend.put("app-dynamic-v1", &key("/b"), &resp).await.unwrap();

        let got = backend.get("app-static-v1", &key("/a")).await.unwrap().unwrap();
        assert_eq!(got.body, bytes::Bytes::from_static(b"again"));
        assert!(backend.get("app-static-v1", &key("/b")).await.unwrap().is_none());
        assert!(backend.get("missing", &key("/a")).await.unwrap().is_none());

        assert_eq!(
            backend.bucket_names().await.unwrap(),
            vec!["app-dynamic-v1".to_owned(), "app-static-v1".to_owned()]
        );
        assert_eq!(backend.keys("app-static-v1").await.unwrap(), vec![key("/a")]);

        assert!(backend.delete_bucket("app-static-v1").await.unwrap());
        assert!(!backend.delete_bucket("app-static-v1").await.unwrap());
        assert!(backend.get("app-static-v1", &key("/a")).await.unwrap().is_none());
        assert_eq!(backend.bucket_names().await.unwrap(), vec!["app-dynamic-v1".to_owned()]);
    }

    #[tokio::test]
    async fn memory_backend_behaviour() {
        exercise(&MemoryBackend::new()).await;
    }

    #[tokio::test]
    async fn disk_backend_behaviour() {
        let dir = tempfile::tempdir().unwrap();
        exercise(&DiskBackend::new(dir.path()).unwrap()).await;
    }

    #[tokio::test]
    async fn disk_backend_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let first = DiskBackend::new(dir.path()).unwrap();
        first
            .put("app-static-v1", &key("/index.html"), &Response::ok("text/html", "<h1>"))
            .await
            .unwrap();

        let second = DiskBackend::new(dir.path()).unwrap();
        let got = second.get("app-static-v1", &key("/index.html")).await.unwrap();
        assert_eq!(got.unwrap().header("content-type"), Some("text/html"));
    }

    #[tokio::test]
    async fn disk_backend_reports_io_failures() {
        let dir = tempfile::tempdir().unwrap();
        let backend = DiskBackend::new(dir.path()).unwrap();
        std::fs::write(dir.path().join("app-static-v1"), b"not a directory").unwrap();

        let read = backend.get("app-static-v1", &key("/a")).await;
        assert!(matches!(read, Err(WorkerError::Storage(_))));
        let removed = backend.delete_bucket("app-static-v1").await;
        assert!(matches!(removed, Err(WorkerError::Storage(_))));
        assert!(dir.path().join("app-static-v1").is_file());
    }

    #[tokio::test]
    async fn disk_backend_rejects_path_like_bucket_names() {
        let dir = tempfile::tempdir().unwrap();
        let backend = DiskBackend::new(dir.path()).unwrap();
        let err = backend
            .put("../escape", &key("/a"), &Response::ok("text/plain", "x"))
            .await;
        assert!(matches!(err, Err(WorkerError::Storage(_))));
    }
}
