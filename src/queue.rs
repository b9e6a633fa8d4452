//! Task queue: submission, status lookup and the worker-facing record accessors

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::backend::{select_backend, Backend, BackendSelection, FailoverBackend};
use crate::error::{TaskError, TaskResult};
use crate::stats::{QueueMetrics, QueueStats};
use crate::task::{RetryPolicy, Task, TaskContext, TaskId, TaskRecord, TaskStatus};

/// Configuration for the task queue
#[derive(Debug, Clone)]
pub struct TaskQueueConfig {
    /// Redis connection URL; `None` selects the in-memory backend
    pub redis_url: Option<String>,
    /// Prefix for every Redis key
    pub key_prefix: String,
    /// Bound on connecting to and pinging Redis at startup
    pub connect_timeout: Duration,
    /// How long terminal records stay readable
    pub result_ttl: Duration,
    /// Retry limit and backoff for failed handlers
    pub retry: RetryPolicy,
    /// Age after which a `processing` claim is reported as stale
    pub stale_after: Duration,
}

impl Default for TaskQueueConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            key_prefix: "atq".to_string(),
            connect_timeout: Duration::from_secs(2),
            result_ttl: Duration::from_secs(3600), // 1 hour
            retry: RetryPolicy::default(),
            stale_after: Duration::from_secs(3600),
        }
    }
}

/// Handler for one task type
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, ctx: TaskContext, payload: Value) -> anyhow::Result<Value>;
}

/// Adapts an async closure into a [`TaskHandler`]
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F, Fut> TaskHandler for FnHandler<F>
where
    F: Fn(TaskContext, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    async fn handle(&self, ctx: TaskContext, payload: Value) -> anyhow::Result<Value> {
        (self.0)(ctx, payload).await
    }
}

/// Decodes the payload into `T` and encodes its output
struct TypedHandler<T>(PhantomData<fn() -> T>);

#[async_trait]
impl<T: Task> TaskHandler for TypedHandler<T> {
    async fn handle(&self, ctx: TaskContext, payload: Value) -> anyhow::Result<Value> {
        let task: T = serde_json::from_value(payload)?;
        let output = task.execute(&ctx).await?;
        Ok(serde_json::to_value(output)?)
    }
}

/// Registry for task handlers
#[derive(Default)]
pub struct TaskHandlerRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn TaskHandler>>>,
}

impl TaskHandlerRegistry {
    /// Register a task handler for a specific task type
    pub async fn register<H>(&self, task_type: String, handler: H)
    where
        H: TaskHandler + 'static,
    {
        let mut handlers = self.handlers.write().await;
        if handlers.insert(task_type.clone(), Arc::new(handler)).is_some() {
            warn!("Replaced handler for task type {}", task_type);
        } else {
            info!("Registered handler for task type {}", task_type);
        }
    }

    pub async fn get(&self, task_type: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.read().await.get(task_type).cloned()
    }

    pub async fn contains(&self, task_type: &str) -> bool {
        self.handlers.read().await.contains_key(task_type)
    }
}

/// What happened to a task whose handler failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FailureDisposition {
    Retrying { delay: Duration },
    Failed,
}

/// Task queue owning its backend handle, handler registry and counters.
///
/// Construct one at startup and share it (`Arc<TaskQueue>`) with the web
/// layer and the [`WorkerPool`](crate::worker::WorkerPool).
pub struct TaskQueue {
    config: TaskQueueConfig,
    backend: FailoverBackend,
    handlers: TaskHandlerRegistry,
    metrics: QueueMetrics,
}

impl TaskQueue {
    /// Select a backend and build the queue. Redis being absent or
    /// unreachable is not an error.
    pub async fn new(config: TaskQueueConfig) -> Self {
        let backend = select_backend(&config).await;
        Self::with_backend(config, backend)
    }

    /// Build a queue on the in-memory backend regardless of `redis_url`
    pub fn in_memory(config: TaskQueueConfig) -> Self {
        Self::with_backend(config, FailoverBackend::in_memory("in-memory backend requested"))
    }

    pub fn with_backend(config: TaskQueueConfig, backend: FailoverBackend) -> Self {
        Self {
            config,
            backend,
            handlers: TaskHandlerRegistry::default(),
            metrics: QueueMetrics::default(),
        }
    }

    pub fn config(&self) -> &TaskQueueConfig {
        &self.config
    }

    /// Which backend is active and why
    pub fn backend_selection(&self) -> BackendSelection {
        self.backend.selection()
    }

    pub(crate) fn metrics(&self) -> &QueueMetrics {
        &self.metrics
    }

    /// Register a task handler
    pub async fn register_handler<H>(&self, task_type: impl Into<String>, handler: H)
    where
        H: TaskHandler + 'static,
    {
        self.handlers.register(task_type.into(), handler).await;
    }

    /// Register an async closure as a handler
    pub async fn register_fn<F, Fut>(&self, task_type: impl Into<String>, handler: F)
    where
        F: Fn(TaskContext, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.register_handler(task_type, FnHandler(handler)).await;
    }

    /// Register a typed [`Task`] whose payload is its serialized form
    pub async fn register_task<T: Task>(&self, task_type: impl Into<String>) {
        self.register_handler(task_type, TypedHandler::<T>(PhantomData))
            .await;
    }

    pub async fn has_handler(&self, task_type: &str) -> bool {
        self.handlers.contains(task_type).await
    }

    pub(crate) async fn handler_for(&self, task_type: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(task_type).await
    }

    /// Submit a task. Returns as soon as the record is stored and queued.
    pub async fn submit(&self, task_type: &str, payload: Value) -> TaskResult<TaskId> {
        if !self.has_handler(task_type).await {
            return Err(TaskError::UnknownTaskType {
                task_type: task_type.to_string(),
            });
        }

        let record = TaskRecord::new(task_type, payload, self.config.retry.max_retries);
        self.store(&record, None).await?;
        self.backend.enqueue(&record.id.to_string()).await?;
        self.metrics.record_submitted();

        debug!("Submitted task {} ({})", record.id, task_type);
        Ok(record.id)
    }

    /// Current record for a task
    pub async fn get_status(&self, task_id: TaskId) -> TaskResult<TaskRecord> {
        self.load(task_id)
            .await?
            .ok_or_else(|| TaskError::not_found(task_id))
    }

    /// Result of a completed task
    pub async fn get_result(&self, task_id: TaskId) -> TaskResult<Value> {
        let record = self.get_status(task_id).await?;
        match record.status {
            TaskStatus::Completed => Ok(record.result.unwrap_or(Value::Null)),
            TaskStatus::Failed => {
                let (message, attempts) = match record.error {
                    Some(failure) => (failure.message, failure.attempts),
                    None => ("unknown error".to_string(), record.attempts),
                };
                Err(TaskError::TaskFailed {
                    task_id: task_id.to_string(),
                    message,
                    attempts,
                })
            }
            TaskStatus::Cancelled => Err(TaskError::TaskCancelled {
                task_id: task_id.to_string(),
            }),
            TaskStatus::Pending | TaskStatus::Processing => Err(TaskError::TaskNotReady {
                task_id: task_id.to_string(),
                status: record.status.to_string(),
            }),
        }
    }

    /// Cancel a task that no worker has picked up yet.
    ///
    /// Returns `Ok(false)` if the task already left the queue; a task a
    /// worker holds is never interrupted.
    pub async fn cancel(&self, task_id: TaskId) -> TaskResult<bool> {
        let mut record = self.get_status(task_id).await?;
        if record.status != TaskStatus::Pending {
            return Ok(false);
        }
        if !self.backend.remove_queued(&task_id.to_string()).await? {
            debug!("Task {} already dequeued, cancel is a no-op", task_id);
            return Ok(false);
        }

        record.mark_cancelled();
        self.store(&record, Some(self.config.result_ttl)).await?;
        self.metrics.record_cancelled();

        info!("Cancelled task {}", task_id);
        Ok(true)
    }

    /// Point-in-time health and throughput snapshot
    pub async fn get_stats(&self) -> TaskResult<QueueStats> {
        let now_ms = Utc::now().timestamp_millis();

        let queue_depth = self.backend.queue_depth().await?;
        let scheduled_retries = self.backend.scheduled_count().await?;
        let stale_cutoff = now_ms - self.config.stale_after.as_millis() as i64;
        let stale_processing = self.backend.stale_claims(stale_cutoff).await?;

        let oldest_pending_age_ms = match self.backend.peek_oldest().await? {
            Some(raw_id) => match TaskId::parse_str(&raw_id) {
                Ok(task_id) => self
                    .load(task_id)
                    .await?
                    .map(|record| (now_ms - record.created_at.timestamp_millis()).max(0) as u64),
                Err(_) => None,
            },
            None => None,
        };

        if self.metrics.stale_claims_changed(stale_processing) && stale_processing > 0 {
            warn!(
                "{} task(s) have been processing longer than {:?}",
                stale_processing, self.config.stale_after
            );
        }

        Ok(self.metrics.snapshot(
            self.backend.selection(),
            queue_depth,
            scheduled_retries,
            oldest_pending_age_ms,
            stale_processing,
        ))
    }

    /// Evict expired records (in-memory backend; Redis expires keys itself)
    pub async fn purge_expired(&self) -> TaskResult<u64> {
        let purged = self.backend.purge_expired().await?;
        if purged > 0 {
            debug!("Purged {} expired task records", purged);
        }
        Ok(purged)
    }

    /// Move retries whose backoff elapsed back onto the work list
    pub(crate) async fn promote_due_retries(&self) -> TaskResult<u64> {
        self.backend
            .promote_due(Utc::now().timestamp_millis())
            .await
    }

    /// Take the next pending task and mark it `processing` for `worker_id`.
    pub(crate) async fn next_task(
        &self,
        worker_id: &str,
        timeout: Duration,
    ) -> TaskResult<Option<TaskRecord>> {
        let Some(raw_id) = self.backend.dequeue(timeout).await? else {
            return Ok(None);
        };

        let task_id = match TaskId::parse_str(&raw_id) {
            Ok(task_id) => task_id,
            Err(e) => {
                warn!("Discarding malformed task id {:?}: {}", raw_id, e);
                return Ok(None);
            }
        };

        let Some(mut record) = self.load(task_id).await? else {
            warn!("Task {} was dequeued but its record is gone", task_id);
            return Ok(None);
        };
        if record.status != TaskStatus::Pending {
            debug!("Skipping task {} in status {}", task_id, record.status);
            return Ok(None);
        }

        record.mark_processing(worker_id);
        self.store(&record, None).await?;
        self.backend
            .claim(&raw_id, Utc::now().timestamp_millis())
            .await?;

        debug!(
            "Worker {} took task {} (attempt {})",
            worker_id, task_id, record.attempts
        );
        Ok(Some(record))
    }

    pub(crate) async fn save_progress(&self, record: &TaskRecord) -> TaskResult<()> {
        self.store(record, None).await
    }

    pub(crate) async fn complete_task(
        &self,
        record: &mut TaskRecord,
        result: Value,
        elapsed: Duration,
    ) -> TaskResult<()> {
        record.mark_completed(result);
        self.store(record, Some(self.config.result_ttl)).await?;
        self.backend.release(&record.id.to_string()).await?;
        self.metrics.record_completed(elapsed);
        Ok(())
    }

    /// Route a handler failure to a delayed retry or the `failed` state.
    /// Non-retryable failures skip straight to `failed`.
    pub(crate) async fn fail_task(
        &self,
        record: &mut TaskRecord,
        message: &str,
        elapsed: Duration,
        retryable: bool,
    ) -> TaskResult<FailureDisposition> {
        let raw_id = record.id.to_string();

        if retryable && record.can_retry() {
            let delay = self.config.retry.delay_for(record.attempts);
            record.mark_retry();
            self.store(record, None).await?;
            self.backend.release(&raw_id).await?;
            let ready_at = Utc::now().timestamp_millis() + delay.as_millis() as i64;
            self.backend.schedule(&raw_id, ready_at).await?;
            self.metrics.record_retried(elapsed);
            return Ok(FailureDisposition::Retrying { delay });
        }

        record.mark_failed(message);
        self.store(record, Some(self.config.result_ttl)).await?;
        self.backend.release(&raw_id).await?;
        self.metrics.record_failed(elapsed);
        Ok(FailureDisposition::Failed)
    }

    fn record_key(&self, task_id: TaskId) -> String {
        format!("{}:task:{}", self.config.key_prefix, task_id)
    }

    async fn load(&self, task_id: TaskId) -> TaskResult<Option<TaskRecord>> {
        match self.backend.get(&self.record_key(task_id)).await? {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn store(&self, record: &TaskRecord, ttl: Option<Duration>) -> TaskResult<()> {
        let json = serde_json::to_string(record)?;
        self.backend
            .set(&self.record_key(record.id), &json, ttl)
            .await
    }
}
