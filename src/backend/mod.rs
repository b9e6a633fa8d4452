//! Storage and queueing backends.
//!
//! The queue talks to a single [`Backend`] handle. At startup
//! [`select_backend`] tries the configured Redis server and falls back to an
//! in-process backend when it is missing or unreachable. The returned
//! [`FailoverBackend`] also degrades to in-process storage if Redis drops out
//! mid-run. Fallback is sticky: a recovered Redis is not re-promoted.

mod distributed;
mod memory;

pub use distributed::RedisBackend;
pub use memory::InMemoryBackend;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt::{self, Debug};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tracing::{info, warn};

use crate::error::{TaskError, TaskResult};
use crate::queue::TaskQueueConfig;

/// Which execution substrate is active
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Redis,
    Memory,
}

impl BackendKind {
    pub fn name(&self) -> &'static str {
        match self {
            BackendKind::Redis => "redis",
            BackendKind::Memory => "memory",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Uniform key-value and FIFO operations shared by every backend.
///
/// Timestamps are Unix milliseconds.
#[async_trait]
pub trait Backend: Send + Sync + Debug {
    fn kind(&self) -> BackendKind;

    /// Liveness check
    async fn ping(&self) -> TaskResult<()>;

    async fn get(&self, key: &str) -> TaskResult<Option<String>>;

    /// Store a value, expiring it after `ttl` when given
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> TaskResult<()>;

    async fn delete(&self, key: &str) -> TaskResult<bool>;

    /// Append a task ID to the tail of the work list
    async fn enqueue(&self, task_id: &str) -> TaskResult<()>;

    /// Pop the head of the work list, waiting up to `timeout`.
    /// Each ID is handed to exactly one caller.
    async fn dequeue(&self, timeout: Duration) -> TaskResult<Option<String>>;

    /// Head of the work list without removing it
    async fn peek_oldest(&self) -> TaskResult<Option<String>>;

    async fn queue_depth(&self) -> TaskResult<u64>;

    /// Remove a task from the work list and the retry schedule.
    /// Returns false when a worker already took it.
    async fn remove_queued(&self, task_id: &str) -> TaskResult<bool>;

    /// Park a task until `ready_at_ms`
    async fn schedule(&self, task_id: &str, ready_at_ms: i64) -> TaskResult<()>;

    /// Move scheduled tasks that are due onto the work list
    async fn promote_due(&self, now_ms: i64) -> TaskResult<u64>;

    async fn scheduled_count(&self) -> TaskResult<u64>;

    /// Record that a worker started processing a task
    async fn claim(&self, task_id: &str, at_ms: i64) -> TaskResult<()>;

    async fn release(&self, task_id: &str) -> TaskResult<()>;

    /// Number of claims older than `older_than_ms`
    async fn stale_claims(&self, older_than_ms: i64) -> TaskResult<u64>;

    /// Drop expired entries. Backends with native expiry return 0.
    async fn purge_expired(&self) -> TaskResult<u64>;
}

/// Which backend was chosen and why
#[derive(Debug, Clone, Serialize)]
pub struct BackendSelection {
    pub kind: BackendKind,
    pub reason: String,
    pub selected_at: DateTime<Utc>,
    /// True once Redis failed mid-run and the in-process backend took over
    pub degraded: bool,
}

/// Pick the backend for this process.
///
/// Parse errors, refused connections, auth failures and timeouts are all
/// treated the same way: log a warning and use the in-process backend.
pub async fn select_backend(config: &TaskQueueConfig) -> FailoverBackend {
    let Some(url) = config.redis_url.as_deref() else {
        info!("No Redis URL configured, using in-memory task backend");
        return FailoverBackend::in_memory("no distributed backend configured");
    };

    match RedisBackend::connect(url, &config.key_prefix, config.connect_timeout).await {
        Ok(backend) => {
            info!("Using Redis task backend at {}", url);
            FailoverBackend::new(Arc::new(backend), format!("connected to {}", url))
        }
        Err(e) => {
            warn!(
                "Redis backend at {} unavailable ({}), falling back to in-memory task backend",
                url, e
            );
            FailoverBackend::in_memory(format!("redis unavailable: {}", e))
        }
    }
}

/// Backend handle that swaps in an in-process backend on connectivity failure.
pub struct FailoverBackend {
    active: RwLock<Arc<dyn Backend>>,
    selection: RwLock<BackendSelection>,
}

impl Debug for FailoverBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FailoverBackend")
            .field("selection", &self.selection())
            .finish()
    }
}

macro_rules! failover {
    ($self:ident, |$backend:ident| $call:expr) => {{
        let $backend = $self.current();
        match $call.await {
            Err(err) if err.is_backend_unavailable() && $self.degrade(&$backend, &err) => {
                let $backend = $self.current();
                $call.await
            }
            other => other,
        }
    }};
}

impl FailoverBackend {
    /// Wrap an already selected backend
    pub fn new(primary: Arc<dyn Backend>, reason: impl Into<String>) -> Self {
        let selection = BackendSelection {
            kind: primary.kind(),
            reason: reason.into(),
            selected_at: Utc::now(),
            degraded: false,
        };
        Self {
            active: RwLock::new(primary),
            selection: RwLock::new(selection),
        }
    }

    pub fn in_memory(reason: impl Into<String>) -> Self {
        Self::new(Arc::new(InMemoryBackend::new()), reason)
    }

    pub fn selection(&self) -> BackendSelection {
        self.selection
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn current(&self) -> Arc<dyn Backend> {
        self.active
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace `failed` with an in-process backend. Returns true when the
    /// operation should be retried on the new active backend.
    fn degrade(&self, failed: &Arc<dyn Backend>, err: &TaskError) -> bool {
        let mut active = self.active.write().unwrap_or_else(PoisonError::into_inner);
        if !Arc::ptr_eq(&*active, failed) {
            // another caller already swapped it
            return true;
        }
        if active.kind() == BackendKind::Memory {
            return false;
        }

        warn!(
            "{} backend failed mid-run ({}), degrading to in-memory task backend",
            active.kind(),
            err
        );
        *active = Arc::new(InMemoryBackend::new());

        let mut selection = self
            .selection
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        *selection = BackendSelection {
            kind: BackendKind::Memory,
            reason: format!("degraded after error: {}", err),
            selected_at: Utc::now(),
            degraded: true,
        };
        true
    }
}

#[async_trait]
impl Backend for FailoverBackend {
    fn kind(&self) -> BackendKind {
        self.current().kind()
    }

    async fn ping(&self) -> TaskResult<()> {
        failover!(self, |b| b.ping())
    }

    async fn get(&self, key: &str) -> TaskResult<Option<String>> {
        failover!(self, |b| b.get(key))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> TaskResult<()> {
        failover!(self, |b| b.set(key, value, ttl))
    }

    async fn delete(&self, key: &str) -> TaskResult<bool> {
        failover!(self, |b| b.delete(key))
    }

    async fn enqueue(&self, task_id: &str) -> TaskResult<()> {
        failover!(self, |b| b.enqueue(task_id))
    }

    async fn dequeue(&self, timeout: Duration) -> TaskResult<Option<String>> {
        failover!(self, |b| b.dequeue(timeout))
    }

    async fn peek_oldest(&self) -> TaskResult<Option<String>> {
        failover!(self, |b| b.peek_oldest())
    }

    async fn queue_depth(&self) -> TaskResult<u64> {
        failover!(self, |b| b.queue_depth())
    }

    async fn remove_queued(&self, task_id: &str) -> TaskResult<bool> {
        failover!(self, |b| b.remove_queued(task_id))
    }

    async fn schedule(&self, task_id: &str, ready_at_ms: i64) -> TaskResult<()> {
        failover!(self, |b| b.schedule(task_id, ready_at_ms))
    }

    async fn promote_due(&self, now_ms: i64) -> TaskResult<u64> {
        failover!(self, |b| b.promote_due(now_ms))
    }

    async fn scheduled_count(&self) -> TaskResult<u64> {
        failover!(self, |b| b.scheduled_count())
    }

    async fn claim(&self, task_id: &str, at_ms: i64) -> TaskResult<()> {
        failover!(self, |b| b.claim(task_id, at_ms))
    }

    async fn release(&self, task_id: &str) -> TaskResult<()> {
        failover!(self, |b| b.release(task_id))
    }

    async fn stale_claims(&self, older_than_ms: i64) -> TaskResult<u64> {
        failover!(self, |b| b.stale_claims(older_than_ms))
    }

    async fn purge_expired(&self) -> TaskResult<u64> {
        failover!(self, |b| b.purge_expired())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    /// Pretends to be Redis and refuses every call.
    #[derive(Debug)]
    struct UnreachableBackend;

    fn refused<T>() -> TaskResult<T> {
        Err(TaskError::backend_unavailable("connection refused"))
    }

    #[async_trait]
    impl Backend for UnreachableBackend {
        fn kind(&self) -> BackendKind {
            BackendKind::Redis
        }
        async fn ping(&self) -> TaskResult<()> {
            refused()
        }
        async fn get(&self, _key: &str) -> TaskResult<Option<String>> {
            refused()
        }
        async fn set(&self, _key: &str, _value: &str, _ttl: Option<Duration>) -> TaskResult<()> {
            refused()
        }
        async fn delete(&self, _key: &str) -> TaskResult<bool> {
            refused()
        }
        async fn enqueue(&self, _task_id: &str) -> TaskResult<()> {
            refused()
        }
        async fn dequeue(&self, _timeout: Duration) -> TaskResult<Option<String>> {
            refused()
        }
        async fn peek_oldest(&self) -> TaskResult<Option<String>> {
            refused()
        }
        async fn queue_depth(&self) -> TaskResult<u64> {
            refused()
        }
        async fn remove_queued(&self, _task_id: &str) -> TaskResult<bool> {
            refused()
        }
        async fn schedule(&self, _task_id: &str, _ready_at_ms: i64) -> TaskResult<()> {
            refused()
        }
        async fn promote_due(&self, _now_ms: i64) -> TaskResult<u64> {
            refused()
        }
        async fn scheduled_count(&self) -> TaskResult<u64> {
            refused()
        }
        async fn claim(&self, _task_id: &str, _at_ms: i64) -> TaskResult<()> {
            refused()
        }
        async fn release(&self, _task_id: &str) -> TaskResult<()> {
            refused()
        }
        async fn stale_claims(&self, _older_than_ms: i64) -> TaskResult<u64> {
            refused()
        }
        async fn purge_expired(&self) -> TaskResult<u64> {
            refused()
        }
    }

    /// Reachable Redis whose value at `poisoned` has the wrong type.
    #[derive(Debug)]
    struct WrongTypeBackend {
        inner: InMemoryBackend,
        poisoned: &'static str,
    }

    #[async_trait]
    impl Backend for WrongTypeBackend {
        fn kind(&self) -> BackendKind {
            BackendKind::Redis
        }
        async fn ping(&self) -> TaskResult<()> {
            self.inner.ping().await
        }
        async fn get(&self, key: &str) -> TaskResult<Option<String>> {
            if key == self.poisoned {
                let err = redis::RedisError::from((
                    redis::ErrorKind::TypeError,
                    "WRONGTYPE Operation against a key holding the wrong kind of value",
                ));
                return Err(err.into());
            }
            self.inner.get(key).await
        }
        async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> TaskResult<()> {
            self.inner.set(key, value, ttl).await
        }
        async fn delete(&self, key: &str) -> TaskResult<bool> {
            self.inner.delete(key).await
        }
        async fn enqueue(&self, task_id: &str) -> TaskResult<()> {
            self.inner.enqueue(task_id).await
        }
        async fn dequeue(&self, timeout: Duration) -> TaskResult<Option<String>> {
            self.inner.dequeue(timeout).await
        }
        async fn peek_oldest(&self) -> TaskResult<Option<String>> {
            self.inner.peek_oldest().await
        }
        async fn queue_depth(&self) -> TaskResult<u64> {
            self.inner.queue_depth().await
        }
        async fn remove_queued(&self, task_id: &str) -> TaskResult<bool> {
            self.inner.remove_queued(task_id).await
        }
        async fn schedule(&self, task_id: &str, ready_at_ms: i64) -> TaskResult<()> {
            self.inner.schedule(task_id, ready_at_ms).await
        }
        async fn promote_due(&self, now_ms: i64) -> TaskResult<u64> {
            self.inner.promote_due(now_ms).await
        }
        async fn scheduled_count(&self) -> TaskResult<u64> {
            self.inner.scheduled_count().await
        }
        async fn claim(&self, task_id: &str, at_ms: i64) -> TaskResult<()> {
            self.inner.claim(task_id, at_ms).await
        }
        async fn release(&self, task_id: &str) -> TaskResult<()> {
            self.inner.release(task_id).await
        }
        async fn stale_claims(&self, older_than_ms: i64) -> TaskResult<u64> {
            self.inner.stale_claims(older_than_ms).await
        }
        async fn purge_expired(&self) -> TaskResult<u64> {
            self.inner.purge_expired().await
        }
    }

    #[tokio::test]
    async fn reply_errors_do_not_degrade() {
        let backend = FailoverBackend::new(
            Arc::new(WrongTypeBackend {
                inner: InMemoryBackend::new(),
                poisoned: "bad",
            }),
            "test",
        );
        assert_ok!(backend.set("a", "1", None).await);
        assert_ok!(backend.set("b", "2", None).await);

        let err = assert_err!(backend.get("bad").await);
        assert!(matches!(err, TaskError::Redis(_)));

        assert_eq!(backend.kind(), BackendKind::Redis);
        assert!(!backend.selection().degraded);
        assert_eq!(assert_ok!(backend.get("a").await), Some("1".to_string()));
        assert_eq!(assert_ok!(backend.get("b").await), Some("2".to_string()));
    }

    #[tokio::test]
    async fn degrades_to_memory_on_first_connectivity_error() {
        let backend = FailoverBackend::new(Arc::new(UnreachableBackend), "test");
        assert_eq!(backend.kind(), BackendKind::Redis);

        assert_ok!(backend.set("k", "v", None).await);
        assert_eq!(backend.kind(), BackendKind::Memory);
        assert_eq!(assert_ok!(backend.get("k").await), Some("v".to_string()));

        let selection = backend.selection();
        assert!(selection.degraded);
        assert!(selection.reason.contains("connection refused"));
    }

    #[tokio::test]
    async fn memory_backend_errors_are_not_swallowed() {
        let backend = FailoverBackend::in_memory("test");
        let failed = backend.current();
        assert!(!backend.degrade(&failed, &TaskError::timeout("x")));
        assert!(!backend.selection().degraded);
    }

    #[tokio::test]
    async fn missing_url_selects_memory() {
        let config = TaskQueueConfig {
            redis_url: None,
            ..Default::default()
        };
        let backend = select_backend(&config).await;
        assert_eq!(backend.kind(), BackendKind::Memory);
        assert!(!backend.selection().degraded);
    }

    #[tokio::test]
    async fn unreachable_redis_selects_memory() {
        let config = TaskQueueConfig {
            redis_url: Some("redis://127.0.0.1:1/".to_string()),
            connect_timeout: Duration::from_millis(500),
            ..Default::default()
        };
        let backend = select_backend(&config).await;
        assert_eq!(backend.kind(), BackendKind::Memory);
        assert!(backend.selection().reason.starts_with("redis unavailable"));
        assert_ok!(backend.ping().await);
    }

    #[tokio::test]
    async fn malformed_url_selects_memory() {
        let config = TaskQueueConfig {
            redis_url: Some("not a url".to_string()),
            ..Default::default()
        };
        let backend = select_backend(&config).await;
        assert_eq!(backend.kind(), BackendKind::Memory);
        assert_err!(RedisBackend::connect("not a url", "atq", Duration::from_millis(100)).await);
    }
}
