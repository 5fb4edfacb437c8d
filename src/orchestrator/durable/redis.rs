//! Redis-backed [`JobQueue`] and [`ResultStore`].
//!
//! # Key Schema
//!
//! | Key | Type | Purpose |
//! |-----|------|---------|
//! | `{ns}:queue:{queue}` | List | Job ids waiting, head = next |
//! | `{ns}:active:{queue}` | List | Job ids claimed by a worker |
//! | `{ns}:job:{job_id}` | Hash | `command`, `state`, `worker`, `result_key`, `error`, timestamps |
//! | `{ns}:workers:{queue}` | Sorted Set | Worker id scored by heartbeat expiry (epoch ms) |
//! | `{results_prefix}:{task_id}` | String | MessagePack result blob, `SET EX` |
//!
//! Claiming and orphan recovery run as Lua scripts so a job is never in both
//! lists or in neither. Jobs are delivered at least once: a worker that dies
//! mid-job loses its heartbeat and its jobs go back to the head of the queue.

use super::queue::{ClaimedJob, JobCommand, JobInfo, JobQueue, JobState, ResultStore};
use crate::error::{JobkitError, Result};
use ::redis::aio::MultiplexedConnection;
use ::redis::{AsyncCommands, Script};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::time::Duration;

/// Pop the head job into the active list and mark it started.
///
/// KEYS[1] = queue list, KEYS[2] = active list.
/// ARGV[1] = worker id, ARGV[2] = now (epoch ms), ARGV[3] = job key prefix.
/// Returns: {job_id, command} or nil.
const LUA_CLAIM: &str = r#"
while true do
    local id = redis.call('LMOVE', KEYS[1], KEYS[2], 'LEFT', 'RIGHT')
    if not id then
        return false
    end
    local job = ARGV[3] .. id
    local command = redis.call('HGET', job, 'command')
    if command then
        redis.call('HSET', job, 'state', 'started', 'worker', ARGV[1], 'started_at', ARGV[2])
        return {id, command}
    end
    redis.call('LREM', KEYS[2], 1, id)
end
"#;

/// Move jobs held by expired workers back to the head of the queue.
///
/// KEYS[1] = active list, KEYS[2] = workers sorted set, KEYS[3] = queue list.
/// ARGV[1] = now (epoch ms), ARGV[2] = job key prefix.
/// Returns: number of re-queued jobs.
const LUA_REQUEUE: &str = r#"
redis.call('ZREMRANGEBYSCORE', KEYS[2], '-inf', ARGV[1])
local active = redis.call('LRANGE', KEYS[1], 0, -1)
local moved = 0
for i = #active, 1, -1 do
    local id = active[i]
    local job = ARGV[2] .. id
    local worker = redis.call('HGET', job, 'worker')
    if (not worker) or (not redis.call('ZSCORE', KEYS[2], worker)) then
        redis.call('LREM', KEYS[1], 1, id)
        redis.call('LPUSH', KEYS[3], id)
        redis.call('HSET', job, 'state', 'queued')
        redis.call('HDEL', job, 'worker')
        moved = moved + 1
    end
end
return moved
"#;

/// Open a multiplexed connection. Clones share one TCP connection.
pub async fn connect(url: &str) -> Result<MultiplexedConnection> {
    let client = ::redis::Client::open(url)
        .map_err(|e| JobkitError::backend("redis", format!("invalid Redis URL: {e}")))?;
    client
        .get_multiplexed_async_connection()
        .await
        .map_err(|e| JobkitError::backend("redis", format!("failed to connect to Redis: {e}")))
}

fn map_redis_error(err: ::redis::RedisError, key: &str) -> JobkitError {
    JobkitError::backend("redis", format!("{key}: {err}"))
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

async fn ping(conn: &MultiplexedConnection) -> Result<()> {
    let _: String = ::redis::cmd("PING")
        .query_async(&mut conn.clone())
        .await
        .map_err(|e| map_redis_error(e, "PING"))?;
    Ok(())
}

// ── Job queue ────────────────────────────────────────────────────────────

/// Job queue stored in Redis lists and hashes.
#[derive(Clone)]
pub struct RedisJobQueue {
    conn: MultiplexedConnection,
    namespace: String,
    queue: String,
}

impl std::fmt::Debug for RedisJobQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisJobQueue")
            .field("namespace", &self.namespace)
            .field("queue", &self.queue)
            .finish()
    }
}

impl RedisJobQueue {
    pub fn new(conn: MultiplexedConnection, queue: impl Into<String>) -> Self {
        Self {
            conn,
            namespace: "jobkit".to_string(),
            queue: queue.into(),
        }
    }

    /// Sets the key namespace. Distinct namespaces never see each other's
    /// jobs.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    fn queue_key(&self) -> String {
        format!("{}:queue:{}", self.namespace, self.queue)
    }

    fn active_key(&self) -> String {
        format!("{}:active:{}", self.namespace, self.queue)
    }

    fn workers_key(&self) -> String {
        format!("{}:workers:{}", self.namespace, self.queue)
    }

    fn job_prefix(&self) -> String {
        format!("{}:job:", self.namespace)
    }

    fn job_key(&self, job_id: &str) -> String {
        format!("{}{}", self.job_prefix(), job_id)
    }

    async fn settle(&self, job_id: &str, fields: &[(&str, String)], keep: Duration) -> Result<()> {
        let job_key = self.job_key(job_id);
        let mut pipe = ::redis::pipe();
        pipe.atomic()
            .lrem(self.active_key(), 1, job_id)
            .ignore()
            .hset_multiple(&job_key, fields)
            .ignore()
            .expire(&job_key, keep.as_secs().max(1) as i64)
            .ignore();
        pipe.query_async::<()>(&mut self.conn.clone())
            .await
            .map_err(|e| map_redis_error(e, &job_key))
    }
}

#[async_trait]
impl JobQueue for RedisJobQueue {
    async fn ping(&self) -> Result<()> {
        ping(&self.conn).await
    }

    async fn push(&self, job_id: &str, command: &JobCommand) -> Result<()> {
        let job_key = self.job_key(job_id);
        let fields = [
            ("command", command.to_json()?),
            ("state", JobState::Queued.as_str().to_string()),
            ("enqueued_at", now_ms().to_string()),
        ];
        let mut pipe = ::redis::pipe();
        pipe.atomic()
            .hset_multiple(&job_key, &fields)
            .ignore()
            .rpush(self.queue_key(), job_id)
            .ignore();
        pipe.query_async::<()>(&mut self.conn.clone())
            .await
            .map_err(|e| map_redis_error(e, &job_key))
    }

    async fn queue_len(&self) -> Result<usize> {
        let key = self.queue_key();
        let mut conn = self.conn.clone();
        conn.llen(&key).await.map_err(|e| map_redis_error(e, &key))
    }

    async fn job_info(&self, job_id: &str) -> Result<Option<JobInfo>> {
        let job_key = self.job_key(job_id);
        let mut conn = self.conn.clone();
        let mut fields: HashMap<String, String> = conn
            .hgetall(&job_key)
            .await
            .map_err(|e| map_redis_error(e, &job_key))?;
        let Some(state) = fields.get("state") else {
            return Ok(None);
        };
        let state: JobState = state.parse()?;

        let position = if state == JobState::Queued {
            let queue_key = self.queue_key();
            let index: Option<usize> = ::redis::cmd("LPOS")
                .arg(&queue_key)
                .arg(job_id)
                .query_async(&mut conn)
                .await
                .map_err(|e| map_redis_error(e, &queue_key))?;
            index.map(|i| i + 1)
        } else {
            None
        };

        Ok(Some(JobInfo {
            job_id: job_id.to_string(),
            state,
            position,
            result_key: fields.remove("result_key"),
            error: fields.remove("error"),
            worker: fields.remove("worker"),
        }))
    }

    async fn claim(&self, worker_id: &str) -> Result<Option<ClaimedJob>> {
        let claimed: Option<(String, String)> = Script::new(LUA_CLAIM)
            .key(self.queue_key())
            .key(self.active_key())
            .arg(worker_id)
            .arg(now_ms())
            .arg(self.job_prefix())
            .invoke_async(&mut self.conn.clone())
            .await
            .map_err(|e| map_redis_error(e, &self.queue_key()))?;
        let Some((job_id, command)) = claimed else {
            return Ok(None);
        };
        let command = JobCommand::from_json(&command)?;
        Ok(Some(ClaimedJob { job_id, command }))
    }

    async fn complete(&self, job_id: &str, worker_id: &str, result_key: &str, keep: Duration) -> Result<()> {
        let fields = [
            ("state", JobState::Finished.as_str().to_string()),
            ("worker", worker_id.to_string()),
            ("result_key", result_key.to_string()),
            ("ended_at", now_ms().to_string()),
        ];
        self.settle(job_id, &fields, keep).await
    }

    async fn fail(
        &self,
        job_id: &str,
        worker_id: &str,
        state: JobState,
        error: &str,
        result_key: Option<&str>,
        keep: Duration,
    ) -> Result<()> {
        let mut fields = vec![
            ("state", state.as_str().to_string()),
            ("worker", worker_id.to_string()),
            ("error", error.to_string()),
            ("ended_at", now_ms().to_string()),
        ];
        if let Some(key) = result_key {
            fields.push(("result_key", key.to_string()));
        }
        self.settle(job_id, &fields, keep).await
    }

    async fn heartbeat(&self, worker_id: &str, ttl: Duration) -> Result<()> {
        let key = self.workers_key();
        let expires = now_ms() + ttl.as_millis() as i64;
        let mut conn = self.conn.clone();
        let _: () = conn
            .zadd(&key, worker_id, expires)
            .await
            .map_err(|e| map_redis_error(e, &key))?;
        Ok(())
    }

    async fn unregister(&self, worker_id: &str) -> Result<()> {
        let key = self.workers_key();
        let mut conn = self.conn.clone();
        let _: () = conn
            .zrem(&key, worker_id)
            .await
            .map_err(|e| map_redis_error(e, &key))?;
        Ok(())
    }

    async fn live_workers(&self) -> Result<usize> {
        let key = self.workers_key();
        let mut conn = self.conn.clone();
        conn.zcount(&key, now_ms(), "+inf")
            .await
            .map_err(|e| map_redis_error(e, &key))
    }

    async fn requeue_orphans(&self) -> Result<usize> {
        Script::new(LUA_REQUEUE)
            .key(self.active_key())
            .key(self.workers_key())
            .key(self.queue_key())
            .arg(now_ms())
            .arg(self.job_prefix())
            .invoke_async(&mut self.conn.clone())
            .await
            .map_err(|e| map_redis_error(e, &self.active_key()))
    }
}

// ── Result store ─────────────────────────────────────────────────────────

/// Result blobs as plain Redis strings with an expiry.
#[derive(Clone)]
pub struct RedisResultStore {
    conn: MultiplexedConnection,
}

impl std::fmt::Debug for RedisResultStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisResultStore").finish_non_exhaustive()
    }
}

impl RedisResultStore {
    pub fn new(conn: MultiplexedConnection) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl ResultStore for RedisResultStore {
    async fn ping(&self) -> Result<()> {
        ping(&self.conn).await
    }

    async fn put(&self, key: &str, blob: Vec<u8>, ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .set_ex(key, blob, ttl.as_secs().max(1))
            .await
            .map_err(|e| map_redis_error(e, key))?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.conn.clone();
        conn.get(key).await.map_err(|e| map_redis_error(e, key))
    }
}
