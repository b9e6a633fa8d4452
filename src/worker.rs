//! Worker pool for processing queued tasks

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{TaskError, TaskResult};
use crate::queue::{FailureDisposition, TaskQueue};
use crate::stats::WorkerSlot;
use crate::task::{ProgressReporter, TaskContext, TaskRecord};

/// Worker pool configuration
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Identifies this pool's workers across processes sharing a backend
    pub pool_id: Uuid,
    /// Number of concurrent worker loops
    pub worker_count: usize,
    /// How long a worker waits for a task before re-checking for shutdown
    pub poll_timeout: Duration,
    /// How often due retries are moved back onto the work list
    pub retry_poll_interval: Duration,
    /// How often expired records are purged
    pub cleanup_interval: Duration,
    /// Delay before the first restart of a panicked loop, doubled per consecutive panic
    pub restart_backoff: Duration,
    /// Upper bound on the restart delay
    pub max_restart_backoff: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            pool_id: Uuid::new_v4(),
            worker_count: 4,
            poll_timeout: Duration::from_secs(1),
            retry_poll_interval: Duration::from_millis(250),
            cleanup_interval: Duration::from_secs(60),
            restart_backoff: Duration::from_millis(100),
            max_restart_backoff: Duration::from_secs(30),
        }
    }
}

impl WorkerConfig {
    /// An idle worker that has not polled within this window is unhealthy
    pub fn liveness_window(&self) -> Duration {
        self.poll_timeout * 3 + Duration::from_secs(1)
    }

    /// Delay before restarting a loop that panicked `restarts` times in a row
    pub fn restart_delay(&self, restarts: u32) -> Duration {
        let exponent = restarts.saturating_sub(1).min(16);
        self.restart_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.max_restart_backoff)
    }

    fn worker_id(&self, index: usize) -> String {
        let pool = self.pool_id.simple().to_string();
        format!("worker-{}-{}", &pool[..8], index)
    }
}

/// Fixed-size pool of supervised worker loops sharing one [`TaskQueue`]
pub struct WorkerPool {
    config: WorkerConfig,
    queue: Arc<TaskQueue>,
    shutdown_tx: watch::Sender<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(config: WorkerConfig, queue: Arc<TaskQueue>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            config,
            queue,
            shutdown_tx,
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Spawn the worker loops plus the retry promoter and cleanup tickers
    pub async fn start(&self) -> TaskResult<()> {
        if self.config.worker_count == 0 {
            return Err(TaskError::config("worker_count must be at least 1"));
        }
        if *self.shutdown_tx.borrow() {
            return Err(TaskError::worker("worker pool has been shut down"));
        }

        let mut handles = self.handles.lock().await;
        if !handles.is_empty() {
            return Err(TaskError::worker("worker pool already started"));
        }

        info!(
            "Starting {} workers on the {} backend",
            self.config.worker_count,
            self.queue.backend_selection().kind
        );

        let slots: Vec<Arc<WorkerSlot>> = (0..self.config.worker_count)
            .map(|index| Arc::new(WorkerSlot::new(self.config.worker_id(index))))
            .collect();
        self.queue
            .metrics()
            .register_workers(&slots, self.config.liveness_window());

        for slot in slots {
            // mark alive before spawning so a snapshot right after start() sees the slot
            slot.set_alive(true);
            handles.push(tokio::spawn(Self::supervise(
                slot,
                self.queue.clone(),
                self.config.clone(),
                self.shutdown_tx.subscribe(),
            )));
        }

        handles.push(tokio::spawn(Self::run_retry_promoter(
            self.queue.clone(),
            self.config.retry_poll_interval,
            self.shutdown_tx.subscribe(),
        )));
        handles.push(tokio::spawn(Self::run_cleanup(
            self.queue.clone(),
            self.config.cleanup_interval,
            self.shutdown_tx.subscribe(),
        )));

        Ok(())
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Stop all loops. Handlers already running finish first; tasks still
    /// queued stay queued.
    pub async fn shutdown(&self) -> TaskResult<()> {
        info!("Shutting down worker pool {}", self.config.pool_id);
        self.shutdown_tx.send_replace(true);

        let handles = std::mem::take(&mut *self.handles.lock().await);
        for handle in handles {
            if let Err(e) = handle.await {
                warn!("Worker pool task ended abnormally: {}", e);
            }
        }

        info!("Worker pool {} shut down complete", self.config.pool_id);
        Ok(())
    }

    /// Restart the loop with backoff if it panics; a clean return means shutdown.
    async fn supervise(
        slot: Arc<WorkerSlot>,
        queue: Arc<TaskQueue>,
        config: WorkerConfig,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            let run = tokio::spawn(Self::run_loop(
                slot.clone(),
                queue.clone(),
                config.clone(),
                shutdown.clone(),
            ));

            match run.await {
                Ok(()) => break,
                Err(e) if e.is_panic() => {
                    queue.metrics().record_worker_restart();
                    let restarts = slot.record_restart();
                    let delay = config.restart_delay(restarts);
                    error!(
                        "Worker {} loop panicked ({} in a row), restarting in {:?}: {}",
                        slot.id(),
                        restarts,
                        delay,
                        e
                    );
                    if *shutdown.borrow() {
                        break;
                    }
                    tokio::select! {
                        _ = sleep(delay) => {}
                        _ = shutdown.changed() => break,
                    }
                }
                Err(e) => {
                    warn!("Worker {} loop was cancelled: {}", slot.id(), e);
                    break;
                }
            }
        }
        slot.set_alive(false);
    }

    async fn run_loop(
        slot: Arc<WorkerSlot>,
        queue: Arc<TaskQueue>,
        config: WorkerConfig,
        mut shutdown: watch::Receiver<bool>,
    ) {
        debug!("Worker {} started", slot.id());

        loop {
            if *shutdown.borrow() {
                break;
            }

            match queue.next_task(slot.id(), config.poll_timeout).await {
                Ok(Some(record)) => {
                    slot.polled();
                    slot.set_busy(true);
                    Self::execute(&queue, record).await;
                    slot.set_busy(false);
                }
                Ok(None) => slot.polled(),
                Err(e) => {
                    error!("Worker {} failed to fetch a task: {}", slot.id(), e);
                    tokio::select! {
                        _ = sleep(config.poll_timeout) => {}
                        _ = shutdown.changed() => {}
                    }
                }
            }
        }

        debug!("Worker {} stopped", slot.id());
    }

    /// Run one task to a stored outcome. Handler errors and panics never
    /// escape; they go through the retry path.
    async fn execute(queue: &Arc<TaskQueue>, mut record: TaskRecord) {
        let task_id = record.id;

        let Some(handler) = queue.handler_for(&record.task_type).await else {
            let message = format!("no handler registered for task type {}", record.task_type);
            error!("Task {}: {}", task_id, message);
            if let Err(e) = queue
                .fail_task(&mut record, &message, Duration::ZERO, false)
                .await
            {
                error!("Failed to store outcome of task {}: {}", task_id, e);
            }
            return;
        };

        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();
        let ctx = TaskContext::new(&record, ProgressReporter::new(progress_tx));
        let payload = record.payload.clone();
        let started = Instant::now();

        let mut run = tokio::spawn(async move { handler.handle(ctx, payload).await });
        let joined = loop {
            tokio::select! {
                joined = &mut run => break joined,
                Some(progress) = progress_rx.recv() => {
                    record.set_progress(progress);
                    if let Err(e) = queue.save_progress(&record).await {
                        warn!("Failed to store progress for task {}: {}", task_id, e);
                    }
                }
            }
        };
        let elapsed = started.elapsed();

        let message = match joined {
            Ok(Ok(result)) => {
                match queue.complete_task(&mut record, result, elapsed).await {
                    Ok(()) => info!("Task {} completed in {:?}", task_id, elapsed),
                    Err(e) => error!("Failed to store result of task {}: {}", task_id, e),
                }
                return;
            }
            Ok(Err(e)) => format!("{:#}", e),
            Err(e) if e.is_panic() => "handler panicked".to_string(),
            Err(e) => format!("handler was cancelled: {}", e),
        };

        match queue.fail_task(&mut record, &message, elapsed, true).await {
            Ok(FailureDisposition::Retrying { delay }) => warn!(
                "Task {} attempt {} failed: {}; retrying in {:?}",
                task_id, record.attempts, message, delay
            ),
            Ok(FailureDisposition::Failed) => error!(
                "Task {} failed after {} attempt(s): {}",
                task_id, record.attempts, message
            ),
            Err(e) => error!("Failed to store outcome of task {}: {}", task_id, e),
        }
    }

    async fn run_retry_promoter(
        queue: Arc<TaskQueue>,
        period: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }
            if *shutdown.borrow() {
                break;
            }
            if let Err(e) = queue.promote_due_retries().await {
                error!("Failed to promote scheduled retries: {}", e);
            }
        }
    }

    async fn run_cleanup(
        queue: Arc<TaskQueue>,
        period: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }
            if *shutdown.borrow() {
                break;
            }
            if let Err(e) = queue.purge_expired().await {
                error!("Failed to purge expired tasks: {}", e);
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown_tx.send_replace(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Backend, BackendKind, FailoverBackend, InMemoryBackend};
    use crate::queue::TaskQueueConfig;
    use crate::task::{RetryPolicy, TaskStatus};
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use tokio::sync::Notify;

    /// In-memory backend whose dequeue panics, crashing any worker loop.
    #[derive(Debug, Default)]
    struct PanickingDequeue {
        inner: InMemoryBackend,
    }

    #[async_trait]
    impl Backend for PanickingDequeue {
        fn kind(&self) -> BackendKind {
            BackendKind::Memory
        }
        async fn ping(&self) -> TaskResult<()> {
            self.inner.ping().await
        }
        async fn get(&self, key: &str) -> TaskResult<Option<String>> {
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
        async fn dequeue(&self, _timeout: Duration) -> TaskResult<Option<String>> {
            panic!("dequeue exploded")
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

    fn fast_config(workers: usize) -> WorkerConfig {
        WorkerConfig {
            worker_count: workers,
            poll_timeout: Duration::from_millis(20),
            retry_poll_interval: Duration::from_millis(5),
            cleanup_interval: Duration::from_millis(50),
            ..Default::default()
        }
    }

    fn queue_config(max_retries: u32) -> TaskQueueConfig {
        TaskQueueConfig {
            retry: RetryPolicy {
                max_retries,
                base_delay: Duration::from_millis(5),
                max_delay: Duration::from_millis(20),
            },
            ..Default::default()
        }
    }

    async fn wait_for(
        queue: &TaskQueue,
        task_id: crate::TaskId,
        status: TaskStatus,
    ) -> TaskRecord {
        for _ in 0..500 {
            let record = queue.get_status(task_id).await.unwrap();
            if record.status == status {
                return record;
            }
            sleep(Duration::from_millis(10)).await;
        }
        panic!("task {} never reached {}", task_id, status);
    }

    #[tokio::test]
    async fn rejects_empty_pool_and_double_start() {
        let queue = Arc::new(TaskQueue::in_memory(TaskQueueConfig::default()));
        let empty = WorkerPool::new(fast_config(0), queue.clone());
        assert!(matches!(empty.start().await, Err(TaskError::Config { .. })));

        let pool = WorkerPool::new(fast_config(1), queue);
        pool.start().await.unwrap();
        assert!(matches!(pool.start().await, Err(TaskError::Worker { .. })));
        pool.shutdown().await.unwrap();
        assert!(pool.is_shutting_down());
    }

    #[tokio::test]
    async fn handler_panic_is_routed_through_failure_path() {
        let queue = Arc::new(TaskQueue::in_memory(queue_config(0)));
        queue
            .register_fn("explode", |_ctx, _payload| async move {
                if true {
                    panic!("kaboom");
                }
                Ok(Value::Null)
            })
            .await;
        queue
            .register_fn("double", |_ctx, payload: Value| async move {
                Ok(json!(payload.as_i64().unwrap_or_default() * 2))
            })
            .await;

        let pool = WorkerPool::new(fast_config(1), queue.clone());
        pool.start().await.unwrap();

        let exploded = queue.submit("explode", Value::Null).await.unwrap();
        let record = wait_for(&queue, exploded, TaskStatus::Failed).await;
        assert_eq!(record.error.unwrap().message, "handler panicked");

        // the same worker keeps serving
        let doubled = queue.submit("double", json!(5)).await.unwrap();
        let record = wait_for(&queue, doubled, TaskStatus::Completed).await;
        assert_eq!(record.result, Some(json!(10)));

        let stats = queue.get_stats().await.unwrap();
        assert_eq!(stats.worker_restarts, 0);
        assert_eq!(stats.healthy_workers, 1);
        pool.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn progress_updates_are_visible_while_running() {
        let queue = Arc::new(TaskQueue::in_memory(queue_config(0)));
        let release = Arc::new(Notify::new());
        let gate = release.clone();
        queue
            .register_fn("slow", move |ctx: TaskContext, _payload| {
                let gate = gate.clone();
                async move {
                    ctx.progress.report(50);
                    gate.notified().await;
                    Ok(json!("done"))
                }
            })
            .await;

        let pool = WorkerPool::new(fast_config(1), queue.clone());
        pool.start().await.unwrap();
        let task_id = queue.submit("slow", Value::Null).await.unwrap();

        let mut seen = None;
        for _ in 0..200 {
            let record = queue.get_status(task_id).await.unwrap();
            if record.progress == 50 {
                seen = Some(record);
                break;
            }
            sleep(Duration::from_millis(5)).await;
        }
        let record = seen.expect("progress never reported");
        assert_eq!(record.status, TaskStatus::Processing);
        assert_eq!(queue.get_stats().await.unwrap().active_workers, 1);

        release.notify_one();
        let record = wait_for(&queue, task_id, TaskStatus::Completed).await;
        assert_eq!(record.progress, 100);
        pool.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_lets_running_handler_finish() {
        let queue = Arc::new(TaskQueue::in_memory(queue_config(0)));
        queue
            .register_fn("sleepy", |_ctx, _payload| async move {
                sleep(Duration::from_millis(100)).await;
                Ok(json!("rested"))
            })
            .await;

        let pool = WorkerPool::new(fast_config(2), queue.clone());
        pool.start().await.unwrap();
        let task_id = queue.submit("sleepy", Value::Null).await.unwrap();
        wait_for(&queue, task_id, TaskStatus::Processing).await;

        pool.shutdown().await.unwrap();
        let record = queue.get_status(task_id).await.unwrap();
        assert_eq!(record.status, TaskStatus::Completed);
        assert_eq!(record.result, Some(json!("rested")));

        let stats = queue.get_stats().await.unwrap();
        assert_eq!(stats.total_workers, 2);
        assert_eq!(stats.healthy_workers, 0);
    }

    #[tokio::test]
    async fn queued_tasks_stay_pending_after_shutdown() {
        let queue = Arc::new(TaskQueue::in_memory(queue_config(0)));
        queue
            .register_fn("noop", |_ctx, _payload| async move { Ok(Value::Null) })
            .await;

        let pool = WorkerPool::new(fast_config(1), queue.clone());
        pool.start().await.unwrap();
        pool.shutdown().await.unwrap();

        let task_id = queue.submit("noop", Value::Null).await.unwrap();
        sleep(Duration::from_millis(50)).await;
        assert_eq!(
            queue.get_status(task_id).await.unwrap().status,
            TaskStatus::Pending
        );
        assert_eq!(queue.get_stats().await.unwrap().queue_depth, 1);
    }

    #[test]
    fn restart_delay_doubles_up_to_the_cap() {
        let config = WorkerConfig {
            restart_backoff: Duration::from_millis(100),
            max_restart_backoff: Duration::from_millis(350),
            ..Default::default()
        };
        assert_eq!(config.restart_delay(1), Duration::from_millis(100));
        assert_eq!(config.restart_delay(2), Duration::from_millis(200));
        assert_eq!(config.restart_delay(3), Duration::from_millis(350));
        assert_eq!(config.restart_delay(u32::MAX), Duration::from_millis(350));
    }

    #[tokio::test]
    async fn crash_looping_worker_backs_off_and_reports_unhealthy() {
        let backend = FailoverBackend::new(Arc::new(PanickingDequeue::default()), "test");
        let queue = Arc::new(TaskQueue::with_backend(queue_config(0), backend));
        let config = WorkerConfig {
            restart_backoff: Duration::from_millis(20),
            max_restart_backoff: Duration::from_millis(40),
            ..fast_config(1)
        };
        let pool = WorkerPool::new(config, queue.clone());
        pool.start().await.unwrap();

        sleep(Duration::from_millis(200)).await;
        let stats = queue.get_stats().await.unwrap();
        assert!(stats.worker_restarts >= 2, "restarts: {}", stats.worker_restarts);
        assert!(stats.worker_restarts <= 12, "restarts: {}", stats.worker_restarts);
        assert_eq!(stats.total_workers, 1);
        assert_eq!(stats.healthy_workers, 0);

        tokio::time::timeout(Duration::from_secs(2), pool.shutdown())
            .await
            .expect("shutdown hung on a crash-looping worker")
            .unwrap();
        assert!(pool.is_shutting_down());
    }
}
