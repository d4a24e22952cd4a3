//! # TraceKit Store
//!
//! Named cache buckets for the TraceKit service worker.
//!
//! A bucket is a URL-addressed store of cached responses. The worker keeps
//! exactly one active bucket at a time and replaces its contents wholesale on
//! every install, so a bucket is only ever mutated by whole-operation steps:
//! delete, or bulk replace. Buckets can be snapshotted to disk so an offline
//! copy survives process restarts.

use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors that can occur in the bucket store.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Snapshot error: {0}")]
    Snapshot(#[from] serde_json::Error),
}

/// A cached request/response pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Request URL.
    pub url: String,

    /// Request method.
    pub method: String,

    /// Response status.
    pub status: u16,

    /// Response headers.
    pub headers: HashMap<String, String>,

    /// Response body.
    pub body: Vec<u8>,

    /// Cached at timestamp (ms since epoch).
    pub cached_at: u64,
}

impl CacheEntry {
    /// Create an entry for a GET response cached now.
    pub fn new(url: impl Into<String>, status: u16, body: Vec<u8>) -> Self {
        Self {
            url: url.into(),
            method: "GET".to_string(),
            status,
            headers: HashMap::new(),
            body,
            cached_at: now_millis(),
        }
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// A single named bucket.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct CacheBucket {
    /// Bucket name.
    pub name: String,

    /// Cached entries, keyed by URL.
    entries: HashMap<String, CacheEntry>,
}

impl CacheBucket {
    /// Create an empty bucket.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            entries: HashMap::new(),
        }
    }

    /// Match a request URL.
    pub fn match_url(&self, url: &str) -> Option<&CacheEntry> {
        self.entries.get(url)
    }

    /// Insert an entry.
    pub fn put(&mut self, entry: CacheEntry) {
        self.entries.insert(entry.url.clone(), entry);
    }

    /// All cached URLs.
    pub fn keys(&self) -> Vec<&str> {
        self.entries.keys().map(|s| s.as_str()).collect()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the bucket holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// The collection of named buckets, optionally backed by a snapshot
/// directory.
///
/// With a directory configured, every bucket lives in `{dir}/{name}.json`
/// and mutations rewrite that file. Without one, the store is purely
/// in-memory (tests construct isolated instances this way).
#[derive(Debug, Default)]
pub struct BucketStore {
    dir: Option<PathBuf>,
    buckets: HashMap<String, CacheBucket>,
}

impl BucketStore {
    /// Create an in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a store backed by a snapshot directory, loading any buckets
    /// persisted by a previous run.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;

        let mut buckets = HashMap::new();
        let mut read_dir = tokio::fs::read_dir(&dir).await?;
        while let Some(dirent) = read_dir.next_entry().await? {
            let path = dirent.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let raw = tokio::fs::read(&path).await?;
            match serde_json::from_slice::<CacheBucket>(&raw) {
                Ok(bucket) => {
                    debug!(bucket = %bucket.name, entries = bucket.len(), "loaded bucket snapshot");
                    buckets.insert(bucket.name.clone(), bucket);
                }
                Err(err) => {
                    // A corrupt snapshot is equivalent to a miss; the next
                    // install repopulates it.
                    warn!(path = %path.display(), %err, "discarding unreadable bucket snapshot");
                    tokio::fs::remove_file(&path).await?;
                }
            }
        }

        info!(dir = %dir.display(), buckets = buckets.len(), "bucket store opened");
        Ok(Self {
            dir: Some(dir),
            buckets,
        })
    }

    /// Check if a bucket exists.
    pub fn has(&self, name: &str) -> bool {
        self.buckets.contains_key(name)
    }

    /// All bucket names.
    pub fn names(&self) -> Vec<String> {
        self.buckets.keys().cloned().collect()
    }

    /// Get a bucket by name.
    pub fn get(&self, name: &str) -> Option<&CacheBucket> {
        self.buckets.get(name)
    }

    /// Match a URL inside a named bucket.
    pub fn match_in(&self, name: &str, url: &str) -> Option<&CacheEntry> {
        self.buckets.get(name).and_then(|b| b.match_url(url))
    }

    /// Delete a bucket. Idempotent: deleting an absent bucket is not an
    /// error.
    pub async fn delete(&mut self, name: &str) -> Result<bool, StoreError> {
        let existed = self.buckets.remove(name).is_some();
        if let Some(dir) = &self.dir {
            let path = snapshot_path(dir, name);
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }
        if existed {
            debug!(bucket = name, "bucket deleted");
        }
        Ok(existed)
    }

    /// Create a bucket with exactly the given entries, replacing any previous
    /// contents, as one bulk step.
    pub async fn replace_all(
        &mut self,
        name: &str,
        entries: Vec<CacheEntry>,
    ) -> Result<(), StoreError> {
        let mut bucket = CacheBucket::new(name);
        for entry in entries {
            bucket.put(entry);
        }
        self.flush(&bucket).await?;
        info!(bucket = name, entries = bucket.len(), "bucket replaced");
        self.buckets.insert(name.to_string(), bucket);
        Ok(())
    }

    /// Create an empty bucket if absent (used for sentinel bucket names that
    /// only matter by existing).
    pub async fn create(&mut self, name: &str) -> Result<(), StoreError> {
        if self.buckets.contains_key(name) {
            return Ok(());
        }
        let bucket = CacheBucket::new(name);
        self.flush(&bucket).await?;
        self.buckets.insert(name.to_string(), bucket);
        Ok(())
    }

    async fn flush(&self, bucket: &CacheBucket) -> Result<(), StoreError> {
        if let Some(dir) = &self.dir {
            let path = snapshot_path(dir, &bucket.name);
            let raw = serde_json::to_vec(bucket)?;
            tokio::fs::write(&path, raw).await?;
        }
        Ok(())
    }
}

fn snapshot_path(dir: &std::path::Path, name: &str) -> PathBuf {
    dir.join(format!("{name}.json"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_replace_and_match() {
        let mut store = BucketStore::new();
        store
            .replace_all(
                "ui",
                vec![CacheEntry::new("https://o/app.js", 200, b"js".to_vec())],
            )
            .await
            .unwrap();

        assert!(store.has("ui"));
        let entry = store.match_in("ui", "https://o/app.js").unwrap();
        assert_eq!(entry.body, b"js");
        assert!(store.match_in("ui", "https://o/other.js").is_none());
    }

    #[tokio::test]
    async fn test_replace_drops_previous_generation() {
        let mut store = BucketStore::new();
        store
            .replace_all(
                "ui",
                vec![CacheEntry::new("https://o/v1/a.js", 200, b"a".to_vec())],
            )
            .await
            .unwrap();
        store
            .replace_all(
                "ui",
                vec![CacheEntry::new("https://o/v2/b.js", 200, b"b".to_vec())],
            )
            .await
            .unwrap();

        assert!(store.match_in("ui", "https://o/v1/a.js").is_none());
        assert!(store.match_in("ui", "https://o/v2/b.js").is_some());
        assert_eq!(store.get("ui").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let mut store = BucketStore::new();
        store.create("ui").await.unwrap();

        assert!(store.delete("ui").await.unwrap());
        assert!(!store.delete("ui").await.unwrap());
        assert!(!store.has("ui"));
    }

    #[tokio::test]
    async fn test_snapshots_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();

        {
            let mut store = BucketStore::open(dir.path()).await.unwrap();
            store
                .replace_all(
                    "ui",
                    vec![CacheEntry::new("https://o/", 200, b"index".to_vec())],
                )
                .await
                .unwrap();
        }

        let store = BucketStore::open(dir.path()).await.unwrap();
        assert!(store.has("ui"));
        assert_eq!(store.match_in("ui", "https://o/").unwrap().body, b"index");
    }

    #[tokio::test]
    async fn test_delete_removes_snapshot() {
        let dir = tempfile::tempdir().unwrap();

        let mut store = BucketStore::open(dir.path()).await.unwrap();
        store.create("ui").await.unwrap();
        store.delete("ui").await.unwrap();

        let reopened = BucketStore::open(dir.path()).await.unwrap();
        assert!(!reopened.has("ui"));
    }

    #[tokio::test]
    async fn test_corrupt_snapshot_discarded() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("ui.json"), b"not json")
            .await
            .unwrap();

        let store = BucketStore::open(dir.path()).await.unwrap();
        assert!(!store.has("ui"));
    }
}
