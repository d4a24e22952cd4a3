//! File staging between an upload request and a later retrieval request.
//!
//! A POST to the file-open endpoint parks a user-supplied file here; the
//! application then follows the redirect and issues a GET that claims the
//! bytes exactly once. The map is scoped to the worker instance that owns it;
//! tests construct isolated instances.

use std::collections::VecDeque;

use bytes::Bytes;
use hashbrown::HashMap;
use tokio::sync::RwLock;
use tracing::{debug, warn};

#[derive(Debug, Default)]
struct Inner {
    files: HashMap<String, Bytes>,
    /// Insertion order, oldest first.
    order: VecDeque<String>,
}

/// Key-addressed holding area for staged file payloads.
///
/// Retention is bounded: once `capacity` unclaimed entries accumulate, the
/// oldest is evicted on the next `put`. The reference behavior retained
/// unclaimed entries forever; a bound keeps memory finite when the companion
/// page load never claims.
#[derive(Debug)]
pub struct StagingMap {
    capacity: usize,
    inner: RwLock<Inner>,
}

impl StagingMap {
    /// Create a staging map holding at most `capacity` unclaimed entries.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: RwLock::new(Inner::default()),
        }
    }

    /// Stage a payload under a key, replacing any previous payload for the
    /// same key.
    pub async fn put(&self, key: impl Into<String>, payload: Bytes) {
        let key = key.into();
        let mut inner = self.inner.write().await;

        if inner.files.insert(key.clone(), payload).is_some() {
            inner.order.retain(|k| k != &key);
        }
        inner.order.push_back(key.clone());

        while inner.files.len() > self.capacity {
            if let Some(evicted) = inner.order.pop_front() {
                inner.files.remove(&evicted);
                warn!(key = %evicted, "evicting oldest unclaimed staged file");
            }
        }

        debug!(key = %key, staged = inner.files.len(), "file staged");
    }

    /// Claim a staged payload, removing it.
    ///
    /// Remove-and-return is a single step under the write lock, so two
    /// concurrent claims for the same key can never both succeed.
    pub async fn take_once(&self, key: &str) -> Option<Bytes> {
        let mut inner = self.inner.write().await;
        let taken = inner.files.remove(key);
        if taken.is_some() {
            inner.order.retain(|k| k != key);
            debug!(key = %key, "staged file claimed");
        }
        taken
    }

    /// Number of unclaimed entries.
    pub async fn len(&self) -> usize {
        self.inner.read().await.files.len()
    }

    /// Whether no entries are staged.
    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.files.is_empty()
    }
}
