//! Redis storage backend for task records.
//!
//! [`RedisBackend`] stores each record as a hash under
//! `{prefix}:task:{task_id}` with the fields `version`, `data` and, for
//! terminal records, `expires_at`. Writes run as Lua scripts so the version
//! check, the write and the `EXPIREAT` happen atomically. Expiry is left to
//! Redis, so [`cleanup_expired`](StorageBackend::cleanup_expired) is a no-op.
//!
//! ```rust,no_run
//! use scanq_tasks::store::generic::GenericTaskStore;
//! use scanq_tasks::store::redis::RedisBackend;
//!
//! # async fn example() -> Result<(), scanq_tasks::store::backend::StorageError> {
//! let backend = RedisBackend::new("redis://127.0.0.1:6379").await?;
//! let store = GenericTaskStore::new(backend.with_prefix("scanq-dev"));
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;

use ::redis::aio::MultiplexedConnection;
use ::redis::{AsyncCommands, Script};
use async_trait::async_trait;

use crate::store::backend::{StorageBackend, StorageError, VersionedRecord};

/// Unconditional put.
///
/// KEYS[1] = record hash. ARGV[1] = data, ARGV[2] = expires_at epoch or "".
/// Returns the new version.
const LUA_PUT: &str = r#"
local current = redis.call('HGET', KEYS[1], 'version')
local new_version = 1
if current then
    new_version = tonumber(current) + 1
end

redis.call('HSET', KEYS[1], 'version', tostring(new_version), 'data', ARGV[1])

if ARGV[2] ~= '' then
    redis.call('HSET', KEYS[1], 'expires_at', ARGV[2])
    redis.call('EXPIREAT', KEYS[1], tonumber(ARGV[2]))
else
    redis.call('HDEL', KEYS[1], 'expires_at')
    redis.call('PERSIST', KEYS[1])
end

return new_version
"#;

/// Conditional put.
///
/// KEYS[1] = record hash. ARGV[1] = data, ARGV[2] = expected version,
/// ARGV[3] = expires_at epoch or "".
/// Returns {status, version}: 1 = written, 0 = mismatch, -1 = missing.
const LUA_PUT_IF_VERSION: &str = r#"
local current = redis.call('HGET', KEYS[1], 'version')
if not current then
    return {-1, 0}
end

local actual = tonumber(current)
if actual ~= tonumber(ARGV[2]) then
    return {0, actual}
end

local new_version = actual + 1
redis.call('HSET', KEYS[1], 'version', tostring(new_version), 'data', ARGV[1])

if ARGV[3] ~= '' then
    redis.call('HSET', KEYS[1], 'expires_at', ARGV[3])
    redis.call('EXPIREAT', KEYS[1], tonumber(ARGV[3]))
else
    redis.call('HDEL', KEYS[1], 'expires_at')
    redis.call('PERSIST', KEYS[1])
end

return {1, new_version}
"#;

/// Redis storage backend.
///
/// Holds a [`MultiplexedConnection`]; clones share one TCP connection.
#[derive(Clone)]
pub struct RedisBackend {
    conn: MultiplexedConnection,
    key_prefix: String,
}

impl std::fmt::Debug for RedisBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBackend")
            .field("key_prefix", &self.key_prefix)
            .finish_non_exhaustive()
    }
}

impl RedisBackend {
    /// Connects to Redis at `url` using the default prefix `"scanq"`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Backend`] if the client cannot be created or
    /// the connection cannot be established.
    pub async fn new(url: &str) -> Result<Self, StorageError> {
        let conn = connect(url).await?;
        Ok(Self::with_connection(conn))
    }

    /// Wraps an existing connection.
    pub fn with_connection(conn: MultiplexedConnection) -> Self {
        Self {
            conn,
            key_prefix: "scanq".to_string(),
        }
    }

    /// Sets a custom key prefix.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    fn record_key(&self, task_id: &str) -> String {
        format!("{}:task:{}", self.key_prefix, task_id)
    }
}

/// Opens a multiplexed connection, mapping failures to [`StorageError`].
pub(crate) async fn connect(url: &str) -> Result<MultiplexedConnection, StorageError> {
    let client = ::redis::Client::open(url).map_err(|e| StorageError::Backend {
        message: format!("failed to create Redis client: {e}"),
        source: Some(Box::new(e)),
    })?;
    client
        .get_multiplexed_async_connection()
        .await
        .map_err(|e| StorageError::Backend {
            message: format!("failed to connect to Redis: {e}"),
            source: Some(Box::new(e)),
        })
}

fn map_redis_error(err: ::redis::RedisError, key: &str) -> StorageError {
    StorageError::Backend {
        message: format!("Redis error for key {key}: {err}"),
        source: Some(Box::new(err)),
    }
}

fn as_utf8(data: &[u8]) -> Result<&str, StorageError> {
    std::str::from_utf8(data).map_err(|e| StorageError::Backend {
        message: format!("data is not valid UTF-8: {e}"),
        source: Some(Box::new(e)),
    })
}

fn expiry_arg(expires_at: Option<i64>) -> String {
    expires_at.map(|e| e.to_string()).unwrap_or_default()
}

#[async_trait]
impl StorageBackend for RedisBackend {
    async fn get(&self, key: &str) -> Result<VersionedRecord, StorageError> {
        let hash_key = self.record_key(key);
        let fields: HashMap<String, String> = self
            .conn
            .clone()
            .hgetall(&hash_key)
            .await
            .map_err(|e| map_redis_error(e, key))?;

        if fields.is_empty() {
            return Err(StorageError::NotFound {
                key: key.to_string(),
            });
        }

        let version = fields
            .get("version")
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| {
                StorageError::backend(format!("missing or invalid version field for key {key}"))
            })?;
        let data = fields
            .get("data")
            .ok_or_else(|| StorageError::backend(format!("missing data field for key {key}")))?;

        Ok(VersionedRecord {
            data: data.as_bytes().to_vec(),
            version,
        })
    }

    async fn put(
        &self,
        key: &str,
        data: &[u8],
        expires_at: Option<i64>,
    ) -> Result<u64, StorageError> {
        let version: u64 = Script::new(LUA_PUT)
            .key(self.record_key(key))
            .arg(as_utf8(data)?)
            .arg(expiry_arg(expires_at))
            .invoke_async(&mut self.conn.clone())
            .await
            .map_err(|e| map_redis_error(e, key))?;
        Ok(version)
    }

    async fn put_if_version(
        &self,
        key: &str,
        data: &[u8],
        expected_version: u64,
        expires_at: Option<i64>,
    ) -> Result<u64, StorageError> {
        let (status, version): (i64, u64) = Script::new(LUA_PUT_IF_VERSION)
            .key(self.record_key(key))
            .arg(as_utf8(data)?)
            .arg(expected_version)
            .arg(expiry_arg(expires_at))
            .invoke_async(&mut self.conn.clone())
            .await
            .map_err(|e| map_redis_error(e, key))?;

        match status {
            1 => Ok(version),
            0 => Err(StorageError::VersionConflict {
                key: key.to_string(),
                expected: expected_version,
                actual: version,
            }),
            _ => Err(StorageError::NotFound {
                key: key.to_string(),
            }),
        }
    }

    async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        let removed: i64 = self
            .conn
            .clone()
            .del(self.record_key(key))
            .await
            .map_err(|e| map_redis_error(e, key))?;
        Ok(removed > 0)
    }

    async fn cleanup_expired(&self) -> Result<usize, StorageError> {
        Ok(0)
    }
}
