//! Low-level key-value storage backend trait and supporting types.
//!
//! Backends are dumb versioned KV stores keyed by task id. State machine
//! rules, attempt fencing, progress monotonicity and serialization all live
//! in [`GenericTaskStore`](crate::store::generic::GenericTaskStore).
//!
//! # Versioning
//!
//! Each stored record carries a monotonic `u64` version starting at 1 and
//! incremented on every successful write.
//! [`put_if_version`](StorageBackend::put_if_version) provides
//! compare-and-swap semantics on top of it.

use std::fmt;

use async_trait::async_trait;

/// A stored record paired with its version.
#[derive(Debug, Clone)]
pub struct VersionedRecord {
    /// Serialized task record bytes (JSON).
    pub data: Vec<u8>,

    /// Monotonic version. Starts at 1.
    pub version: u64,
}

/// Errors from raw storage operations.
///
/// The generic store maps these to [`TaskError`](crate::error::TaskError)
/// before they reach callers.
///
/// # Examples
///
/// ```
/// use scanq_tasks::store::backend::StorageError;
///
/// let err = StorageError::VersionConflict {
///     key: "k".to_string(),
///     expected: 2,
///     actual: 3,
/// };
/// assert!(err.to_string().contains("expected 2"));
/// ```
#[derive(Debug)]
pub enum StorageError {
    /// No record under the key.
    NotFound {
        /// The missing key.
        key: String,
    },

    /// A conditional write saw a different version than expected.
    VersionConflict {
        /// The contended key.
        key: String,
        /// Version the caller expected.
        expected: u64,
        /// Version found in storage. `0` if the key vanished.
        actual: u64,
    },

    /// I/O or backend-specific failure (network, timeout, bad data).
    Backend {
        /// Human-readable description.
        message: String,
        /// Underlying error, if any.
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl StorageError {
    /// A backend error without an underlying source.
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
            source: None,
        }
    }
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound { key } => write!(f, "key not found: {key}"),
            Self::VersionConflict {
                key,
                expected,
                actual,
            } => write!(
                f,
                "version conflict on key {key}: expected {expected}, found {actual}"
            ),
            Self::Backend { message, .. } => write!(f, "backend error: {message}"),
        }
    }
}

impl std::error::Error for StorageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Backend {
                source: Some(src), ..
            } => Some(src.as_ref()),
            _ => None,
        }
    }
}

/// Versioned key-value storage for task records.
///
/// Implementations must be `Send + Sync`: the service, every worker and the
/// reaper share one backend.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Reads a record and its version.
    ///
    /// # Errors
    ///
    /// - [`StorageError::NotFound`] if the key does not exist (or has expired
    ///   in a backend with native expiry).
    /// - [`StorageError::Backend`] on I/O failures.
    async fn get(&self, key: &str) -> Result<VersionedRecord, StorageError>;

    /// Writes unconditionally and returns the new version.
    ///
    /// `expires_at` is a Unix timestamp in seconds after which the backend
    /// may drop the record.
    async fn put(
        &self,
        key: &str,
        data: &[u8],
        expires_at: Option<i64>,
    ) -> Result<u64, StorageError>;

    /// Writes only if the stored version equals `expected_version`.
    ///
    /// # Errors
    ///
    /// - [`StorageError::NotFound`] if the key does not exist.
    /// - [`StorageError::VersionConflict`] on version mismatch.
    /// - [`StorageError::Backend`] on I/O failures.
    async fn put_if_version(
        &self,
        key: &str,
        data: &[u8],
        expected_version: u64,
        expires_at: Option<i64>,
    ) -> Result<u64, StorageError>;

    /// Deletes a record. Returns `true` if it existed.
    async fn delete(&self, key: &str) -> Result<bool, StorageError>;

    /// Removes records whose expiry has passed and returns how many were
    /// removed. Backends with native expiry may return `0`.
    async fn cleanup_expired(&self) -> Result<usize, StorageError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn not_found_display_contains_key() {
        let err = StorageError::NotFound {
            key: "task-1".to_string(),
        };
        assert_eq!(err.to_string(), "key not found: task-1");
    }

    #[test]
    fn backend_error_exposes_source() {
        let io = std::io::Error::other("socket closed");
        let err = StorageError::Backend {
            message: "read failed".to_string(),
            source: Some(Box::new(io)),
        };
        assert_eq!(err.to_string(), "backend error: read failed");
        assert!(err.source().is_some());
        assert!(StorageError::backend("plain").source().is_none());
    }
}
