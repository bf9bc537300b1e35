//! Redis-backed queue shared by any number of worker processes.
//!
//! # Key Schema
//!
//! | Key | Type | Purpose |
//! |-----|------|---------|
//! | `{prefix}:ready` | List | Task ids waiting for a worker |
//! | `{prefix}:inflight` | Sorted Set | Task id scored by lease deadline (ms) |
//! | `{prefix}:job:{task_id}` | Hash | `envelope`, `attempt`, `receipt` |
//!
//! Claim, ack, extend and reclaim are Lua scripts, so two workers can never
//! hold the same delivery and a late ack from a superseded attempt is
//! rejected by comparing receipts.

use std::time::Duration;

use ::redis::aio::MultiplexedConnection;
use ::redis::{AsyncCommands, Script};
use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;

use super::{
    Delivery, JobQueue, QueueConfig, QueueDepth, QueueError, Receipt, ReclaimOutcome,
};
use crate::types::module::TaskEnvelope;

/// Pops ready ids until one still has its job hash, and leases it. Ids
/// whose hash is gone are dropped and logged on the server.
///
/// KEYS[1] = ready, KEYS[2] = inflight. ARGV[1] = job key prefix,
/// ARGV[2] = lease deadline ms.
/// Returns {task_id, envelope, attempt, receipt} or nil once the list is empty.
const LUA_CLAIM: &str = r#"
while true do
    local id = redis.call('RPOP', KEYS[1])
    if not id then
        return nil
    end
    local job = ARGV[1] .. id
    local attempt = redis.call('HGET', job, 'attempt')
    local envelope = redis.call('HGET', job, 'envelope')
    if attempt and envelope then
        local receipt = id .. '#' .. attempt
        redis.call('HSET', job, 'receipt', receipt)
        redis.call('ZADD', KEYS[2], tonumber(ARGV[2]), id)
        return {id, envelope, attempt, receipt}
    end
    redis.log(redis.LOG_WARNING, 'scanq: dropping ready id without a job hash: ' .. id)
end
"#;

/// KEYS[1] = inflight, KEYS[2] = job hash. ARGV[1] = receipt, ARGV[2] = id.
const LUA_ACK: &str = r#"
if redis.call('HGET', KEYS[2], 'receipt') ~= ARGV[1] then
    return 0
end
if redis.call('ZREM', KEYS[1], ARGV[2]) == 0 then
    return 0
end
redis.call('DEL', KEYS[2])
return 1
"#;

/// KEYS[1] = inflight, KEYS[2] = job hash. ARGV[1] = receipt, ARGV[2] = id,
/// ARGV[3] = new deadline ms.
const LUA_EXTEND: &str = r#"
if redis.call('HGET', KEYS[2], 'receipt') ~= ARGV[1] then
    return 0
end
if not redis.call('ZSCORE', KEYS[1], ARGV[2]) then
    return 0
end
redis.call('ZADD', KEYS[1], 'XX', tonumber(ARGV[3]), ARGV[2])
return 1
"#;

/// KEYS[1] = ready, KEYS[2] = inflight. ARGV[1] = job key prefix,
/// ARGV[2] = now ms, ARGV[3] = max attempts.
/// Returns {requeued_count, {id, envelope, attempt, receipt, ...}}.
const LUA_RECLAIM: &str = r#"
local expired = redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', ARGV[2])
local requeued = 0
local exhausted = {}
for _, id in ipairs(expired) do
    redis.call('ZREM', KEYS[2], id)
    local job = ARGV[1] .. id
    local attempt = tonumber(redis.call('HGET', job, 'attempt') or '0')
    if attempt < tonumber(ARGV[3]) then
        redis.call('HSET', job, 'attempt', tostring(attempt + 1))
        redis.call('HDEL', job, 'receipt')
        redis.call('LPUSH', KEYS[1], id)
        requeued = requeued + 1
    else
        local envelope = redis.call('HGET', job, 'envelope')
        local receipt = redis.call('HGET', job, 'receipt') or ''
        if envelope then
            table.insert(exhausted, id)
            table.insert(exhausted, envelope)
            table.insert(exhausted, tostring(attempt))
            table.insert(exhausted, receipt)
        end
        redis.call('DEL', job)
    end
end
return {requeued, exhausted}
"#;

/// How often an idle worker polls the ready list.
const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Redis [`JobQueue`].
#[derive(Clone)]
pub struct RedisQueue {
    conn: MultiplexedConnection,
    key_prefix: String,
    config: QueueConfig,
}

impl std::fmt::Debug for RedisQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisQueue")
            .field("key_prefix", &self.key_prefix)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RedisQueue {
    /// Connects to Redis at `url` using the default prefix `"scanq:queue"`.
    pub async fn new(url: &str, config: QueueConfig) -> Result<Self, QueueError> {
        let conn = crate::store::redis::connect(url)
            .await
            .map_err(|e| QueueError::Backend(e.to_string()))?;
        Ok(Self {
            conn,
            key_prefix: "scanq:queue".to_string(),
            config,
        })
    }

    /// Sets a custom key prefix.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    fn ready_key(&self) -> String {
        format!("{}:ready", self.key_prefix)
    }

    fn inflight_key(&self) -> String {
        format!("{}:inflight", self.key_prefix)
    }

    fn job_prefix(&self) -> String {
        format!("{}:job:", self.key_prefix)
    }

    fn job_key(&self, task_id: &str) -> String {
        format!("{}{}", self.job_prefix(), task_id)
    }

    fn deadline_ms(&self) -> i64 {
        let lease = i64::try_from(self.config.visibility_timeout.as_millis()).unwrap_or(i64::MAX);
        Utc::now().timestamp_millis().saturating_add(lease)
    }

    async fn try_claim(&self) -> Result<Option<Delivery>, QueueError> {
        let claimed: Option<(String, String, u32, String)> = Script::new(LUA_CLAIM)
            .key(self.ready_key())
            .key(self.inflight_key())
            .arg(self.job_prefix())
            .arg(self.deadline_ms())
            .invoke_async(&mut self.conn.clone())
            .await
            .map_err(map_redis_error)?;

        claimed
            .map(|(_, envelope, attempt, receipt)| {
                Ok(Delivery {
                    envelope: serde_json::from_str(&envelope)?,
                    receipt: Receipt(receipt),
                    attempt,
                })
            })
            .transpose()
    }
}

fn map_redis_error(err: ::redis::RedisError) -> QueueError {
    QueueError::Backend(err.to_string())
}

/// Receipts are `{task_id}#{attempt}`.
fn task_id_of(receipt: &Receipt) -> Result<&str, QueueError> {
    receipt
        .0
        .rsplit_once('#')
        .map(|(id, _)| id)
        .ok_or_else(|| QueueError::Backend(format!("malformed receipt: {receipt}")))
}

#[async_trait]
impl JobQueue for RedisQueue {
    async fn enqueue(&self, envelope: &TaskEnvelope) -> Result<(), QueueError> {
        let body = serde_json::to_string(envelope)?;
        let id = envelope.task_id.as_str();
        let mut conn = self.conn.clone();
        ::redis::pipe()
            .atomic()
            .hset_multiple(self.job_key(id), &[("envelope", body.as_str()), ("attempt", "1")])
            .ignore()
            .lpush(self.ready_key(), id)
            .ignore()
            .query_async::<()>(&mut conn)
            .await
            .map_err(map_redis_error)
    }

    async fn dequeue(&self, shutdown: &CancellationToken) -> Result<Option<Delivery>, QueueError> {
        loop {
            if shutdown.is_cancelled() {
                return Ok(None);
            }
            if let Some(delivery) = self.try_claim().await? {
                return Ok(Some(delivery));
            }
            tokio::select! {
                () = shutdown.cancelled() => return Ok(None),
                () = tokio::time::sleep(POLL_INTERVAL) => {},
            }
        }
    }

    async fn ack(&self, receipt: &Receipt) -> Result<bool, QueueError> {
        let id = task_id_of(receipt)?;
        let acked: i64 = Script::new(LUA_ACK)
            .key(self.inflight_key())
            .key(self.job_key(id))
            .arg(&receipt.0)
            .arg(id)
            .invoke_async(&mut self.conn.clone())
            .await
            .map_err(map_redis_error)?;
        Ok(acked == 1)
    }

    async fn extend(&self, receipt: &Receipt) -> Result<bool, QueueError> {
        let id = task_id_of(receipt)?;
        let extended: i64 = Script::new(LUA_EXTEND)
            .key(self.inflight_key())
            .key(self.job_key(id))
            .arg(&receipt.0)
            .arg(id)
            .arg(self.deadline_ms())
            .invoke_async(&mut self.conn.clone())
            .await
            .map_err(map_redis_error)?;
        Ok(extended == 1)
    }

    async fn reclaim_expired(&self) -> Result<ReclaimOutcome, QueueError> {
        let (requeued, flat): (usize, Vec<String>) = Script::new(LUA_RECLAIM)
            .key(self.ready_key())
            .key(self.inflight_key())
            .arg(self.job_prefix())
            .arg(Utc::now().timestamp_millis())
            .arg(self.config.max_attempts)
            .invoke_async(&mut self.conn.clone())
            .await
            .map_err(map_redis_error)?;

        let mut exhausted = Vec::with_capacity(flat.len() / 4);
        for chunk in flat.chunks_exact(4) {
            exhausted.push(Delivery {
                envelope: serde_json::from_str(&chunk[1])?,
                receipt: Receipt(chunk[3].clone()),
                attempt: chunk[2].parse().unwrap_or(self.config.max_attempts),
            });
        }
        Ok(ReclaimOutcome {
            requeued,
            exhausted,
        })
    }

    async fn depth(&self) -> Result<QueueDepth, QueueError> {
        let mut conn = self.conn.clone();
        let ready: usize = conn.llen(self.ready_key()).await.map_err(map_redis_error)?;
        let in_flight: usize = conn
            .zcard(self.inflight_key())
            .await
            .map_err(map_redis_error)?;
        Ok(QueueDepth { ready, in_flight })
    }

    fn config(&self) -> &QueueConfig {
        &self.config
    }
}
