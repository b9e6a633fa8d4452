//! Redis-backed storage shared by every process pointing at the same server

use async_trait::async_trait;
use redis::aio::{Connection, MultiplexedConnection};
use redis::{Client, Script};
use std::fmt;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{Backend, BackendKind};
use crate::error::{TaskError, TaskResult};

/// Moves due IDs from the retry set to the tail of the work list in one
/// server-side step, so each ID is in exactly one of the two.
const PROMOTE_DUE_SCRIPT: &str = r"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, ARGV[2])
for _, task_id in ipairs(due) do
    redis.call('ZREM', KEYS[1], task_id)
    redis.call('RPUSH', KEYS[2], task_id)
end
return #due
";

const PROMOTE_BATCH: u64 = 500;

/// Redis backend.
///
/// Keys under `{prefix}`:
/// - `{prefix}:queue` list of pending task IDs (RPUSH / BLPOP)
/// - `{prefix}:retry` sorted set of task IDs waiting out a backoff, scored by ready time
/// - `{prefix}:processing` sorted set of claimed task IDs, scored by claim time
/// - anything else the queue stores through `get`/`set`
pub struct RedisBackend {
    client: Client,
    conn: MultiplexedConnection,
    /// Dedicated connections for BLPOP, which would stall the multiplexed one
    blocking: Mutex<Vec<Connection>>,
    url: String,
    queue_key: String,
    retry_key: String,
    processing_key: String,
    promote: Script,
}

impl fmt::Debug for RedisBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisBackend")
            .field("url", &self.url)
            .field("queue_key", &self.queue_key)
            .finish()
    }
}

impl RedisBackend {
    /// Connect and ping within `timeout`
    pub async fn connect(url: &str, key_prefix: &str, timeout: Duration) -> TaskResult<Self> {
        let client = Client::open(url)?;

        let mut conn = tokio::time::timeout(timeout, client.get_multiplexed_async_connection())
            .await
            .map_err(|_| TaskError::timeout("redis connect"))??;

        tokio::time::timeout(
            timeout,
            redis::cmd("PING").query_async::<_, String>(&mut conn),
        )
        .await
        .map_err(|_| TaskError::timeout("redis ping"))??;

        info!("Connected to Redis at {}", url);

        Ok(Self {
            client,
            conn,
            blocking: Mutex::new(Vec::new()),
            url: url.to_string(),
            queue_key: format!("{}:queue", key_prefix),
            retry_key: format!("{}:retry", key_prefix),
            processing_key: format!("{}:processing", key_prefix),
            promote: Script::new(PROMOTE_DUE_SCRIPT),
        })
    }

    fn connection(&self) -> MultiplexedConnection {
        self.conn.clone()
    }

    async fn blocking_connection(&self) -> TaskResult<Connection> {
        if let Some(conn) = self.blocking.lock().await.pop() {
            return Ok(conn);
        }
        debug!("Opening blocking Redis connection");
        Ok(self.client.get_async_connection().await?)
    }
}

#[async_trait]
impl Backend for RedisBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Redis
    }

    async fn ping(&self) -> TaskResult<()> {
        let mut conn = self.connection();
        redis::cmd("PING")
            .query_async::<_, String>(&mut conn)
            .await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> TaskResult<Option<String>> {
        let mut conn = self.connection();
        Ok(redis::cmd("GET").arg(key).query_async(&mut conn).await?)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> TaskResult<()> {
        let mut conn = self.connection();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg((ttl.as_millis() as u64).max(1));
        }
        cmd.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> TaskResult<bool> {
        let mut conn = self.connection();
        let removed: u64 = redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
        Ok(removed > 0)
    }

    async fn enqueue(&self, task_id: &str) -> TaskResult<()> {
        let mut conn = self.connection();
        redis::cmd("RPUSH")
            .arg(&self.queue_key)
            .arg(task_id)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn dequeue(&self, timeout: Duration) -> TaskResult<Option<String>> {
        let mut conn = self.blocking_connection().await?;
        // BLPOP takes whole seconds on older servers; zero would block forever
        let seconds = timeout.as_secs().max(1);
        let popped: Option<(String, String)> = redis::cmd("BLPOP")
            .arg(&self.queue_key)
            .arg(seconds)
            .query_async(&mut conn)
            .await?;
        self.blocking.lock().await.push(conn);
        Ok(popped.map(|(_, task_id)| task_id))
    }

    async fn peek_oldest(&self) -> TaskResult<Option<String>> {
        let mut conn = self.connection();
        Ok(redis::cmd("LINDEX")
            .arg(&self.queue_key)
            .arg(0)
            .query_async(&mut conn)
            .await?)
    }

    async fn queue_depth(&self) -> TaskResult<u64> {
        let mut conn = self.connection();
        Ok(redis::cmd("LLEN")
            .arg(&self.queue_key)
            .query_async(&mut conn)
            .await?)
    }

    async fn remove_queued(&self, task_id: &str) -> TaskResult<bool> {
        let mut conn = self.connection();
        let (from_queue, from_retry): (u64, u64) = redis::pipe()
            .atomic()
            .cmd("LREM")
            .arg(&self.queue_key)
            .arg(0)
            .arg(task_id)
            .cmd("ZREM")
            .arg(&self.retry_key)
            .arg(task_id)
            .query_async(&mut conn)
            .await?;
        Ok(from_queue + from_retry > 0)
    }

    async fn schedule(&self, task_id: &str, ready_at_ms: i64) -> TaskResult<()> {
        let mut conn = self.connection();
        redis::cmd("ZADD")
            .arg(&self.retry_key)
            .arg(ready_at_ms)
            .arg(task_id)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn promote_due(&self, now_ms: i64) -> TaskResult<u64> {
        let mut conn = self.connection();
        let promoted: u64 = self
            .promote
            .key(&self.retry_key)
            .key(&self.queue_key)
            .arg(now_ms)
            .arg(PROMOTE_BATCH)
            .invoke_async(&mut conn)
            .await?;

        if promoted > 0 {
            debug!("Promoted {} scheduled retries", promoted);
        }
        Ok(promoted)
    }

    async fn scheduled_count(&self) -> TaskResult<u64> {
        let mut conn = self.connection();
        Ok(redis::cmd("ZCARD")
            .arg(&self.retry_key)
            .query_async(&mut conn)
            .await?)
    }

    async fn claim(&self, task_id: &str, at_ms: i64) -> TaskResult<()> {
        let mut conn = self.connection();
        redis::cmd("ZADD")
            .arg(&self.processing_key)
            .arg(at_ms)
            .arg(task_id)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn release(&self, task_id: &str) -> TaskResult<()> {
        let mut conn = self.connection();
        redis::cmd("ZREM")
            .arg(&self.processing_key)
            .arg(task_id)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn stale_claims(&self, older_than_ms: i64) -> TaskResult<u64> {
        let mut conn = self.connection();
        Ok(redis::cmd("ZCOUNT")
            .arg(&self.processing_key)
            .arg("-inf")
            .arg(format!("({}", older_than_ms))
            .query_async(&mut conn)
            .await?)
    }

    async fn purge_expired(&self) -> TaskResult<u64> {
        // records expire natively via SET PX
        Ok(0)
    }
}
