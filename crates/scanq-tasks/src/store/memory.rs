//! In-memory storage backend.
//!
//! [`InMemoryBackend`] is a thread-safe [`StorageBackend`] over
//! `DashMap<String, Entry>`. It is a dumb KV store: the only thing it knows
//! about a record is the expiry timestamp handed to it on write.
//!
//! [`InMemoryTaskStore`] is the ready-made
//! [`GenericTaskStore<InMemoryBackend>`](GenericTaskStore) used by tests and
//! single-process deployments.
//!
//! # Examples
//!
//! ```
//! use scanq_tasks::store::memory::InMemoryTaskStore;
//! use scanq_tasks::store::TaskStore;
//!
//! let store = InMemoryTaskStore::default();
//! assert!(store.config().retention.is_some());
//! ```

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;

use crate::store::backend::{StorageBackend, StorageError, VersionedRecord};
use crate::store::generic::GenericTaskStore;

#[derive(Debug, Clone)]
struct Entry {
    data: Vec<u8>,
    version: u64,
    expires_at: Option<i64>,
}

/// Thread-safe in-memory storage backend using [`DashMap`].
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    data: DashMap<String, Entry>,
}

impl InMemoryBackend {
    /// Creates an empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records, expired or not.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns `true` if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[async_trait]
impl StorageBackend for InMemoryBackend {
    async fn get(&self, key: &str) -> Result<VersionedRecord, StorageError> {
        let entry = self.data.get(key).ok_or_else(|| StorageError::NotFound {
            key: key.to_string(),
        })?;
        Ok(VersionedRecord {
            data: entry.data.clone(),
            version: entry.version,
        })
    }

    async fn put(
        &self,
        key: &str,
        data: &[u8],
        expires_at: Option<i64>,
    ) -> Result<u64, StorageError> {
        let mut entry = self.data.entry(key.to_string()).or_insert(Entry {
            data: Vec::new(),
            version: 0,
            expires_at: None,
        });
        entry.version += 1;
        entry.data = data.to_vec();
        entry.expires_at = expires_at;
        Ok(entry.version)
    }

    async fn put_if_version(
        &self,
        key: &str,
        data: &[u8],
        expected_version: u64,
        expires_at: Option<i64>,
    ) -> Result<u64, StorageError> {
        let mut entry = self
            .data
            .get_mut(key)
            .ok_or_else(|| StorageError::NotFound {
                key: key.to_string(),
            })?;
        if entry.version != expected_version {
            return Err(StorageError::VersionConflict {
                key: key.to_string(),
                expected: expected_version,
                actual: entry.version,
            });
        }
        entry.version += 1;
        entry.data = data.to_vec();
        entry.expires_at = expires_at;
        Ok(entry.version)
    }

    async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.data.remove(key).is_some())
    }

    async fn cleanup_expired(&self) -> Result<usize, StorageError> {
        let now = Utc::now().timestamp();
        let before = self.data.len();
        self.data
            .retain(|_, entry| entry.expires_at.is_none_or(|at| at > now));
        Ok(before.saturating_sub(self.data.len()))
    }
}

/// Task store over [`InMemoryBackend`].
pub type InMemoryTaskStore = GenericTaskStore<InMemoryBackend>;

impl Default for InMemoryTaskStore {
    fn default() -> Self {
        GenericTaskStore::new(InMemoryBackend::new())
    }
}
