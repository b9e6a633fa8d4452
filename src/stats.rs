//! Health and throughput counters

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use crate::backend::BackendSelection;

/// Liveness view of one worker loop, written only by that loop
#[derive(Debug)]
pub struct WorkerSlot {
    id: String,
    alive: AtomicBool,
    busy: AtomicBool,
    last_seen_ms: AtomicI64,
    /// Panics since the loop last completed a poll
    consecutive_restarts: AtomicU32,
}

impl WorkerSlot {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            alive: AtomicBool::new(false),
            busy: AtomicBool::new(false),
            last_seen_ms: AtomicI64::new(Utc::now().timestamp_millis()),
            consecutive_restarts: AtomicU32::new(0),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn heartbeat(&self) {
        self.last_seen_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn set_alive(&self, alive: bool) {
        self.alive.store(alive, Ordering::Release);
        self.heartbeat();
    }

    pub fn set_busy(&self, busy: bool) {
        self.busy.store(busy, Ordering::Release);
        self.heartbeat();
    }

    /// Loop completed a poll against the backend
    pub fn polled(&self) {
        self.consecutive_restarts.store(0, Ordering::Release);
        self.heartbeat();
    }

    /// Loop panicked. Does not heartbeat, so a crash loop ages out.
    /// Returns the number of restarts since the last successful poll.
    pub fn record_restart(&self) -> u32 {
        self.busy.store(false, Ordering::Release);
        self.consecutive_restarts.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn consecutive_restarts(&self) -> u32 {
        self.consecutive_restarts.load(Ordering::Acquire)
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Alive, not crash-looping, and either running a handler or polled recently
    pub fn is_healthy(&self, now_ms: i64, window: Duration) -> bool {
        if !self.is_alive() || self.consecutive_restarts() > 0 {
            return false;
        }
        let last_seen = self.last_seen_ms.load(Ordering::Relaxed);
        self.is_busy() || now_ms - last_seen <= window.as_millis() as i64
    }
}

/// Counters updated as tasks move through the queue
#[derive(Debug, Default)]
pub struct QueueMetrics {
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    cancelled: AtomicU64,
    executions: AtomicU64,
    processing_ms_total: AtomicU64,
    worker_restarts: AtomicU64,
    /// Stale claim count last logged by `get_stats`
    stale_reported: AtomicU64,
    liveness_window_ms: AtomicU64,
    workers: RwLock<Vec<Arc<WorkerSlot>>>,
}

impl QueueMetrics {
    pub fn record_submitted(&self) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_completed(&self, elapsed: Duration) {
        self.completed.fetch_add(1, Ordering::Relaxed);
        self.record_execution(elapsed);
    }

    pub fn record_failed(&self, elapsed: Duration) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        self.record_execution(elapsed);
    }

    pub fn record_retried(&self, elapsed: Duration) {
        self.retried.fetch_add(1, Ordering::Relaxed);
        self.record_execution(elapsed);
    }

    pub fn record_cancelled(&self) {
        self.cancelled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_worker_restart(&self) {
        self.worker_restarts.fetch_add(1, Ordering::Relaxed);
    }

    /// Remember the latest stale claim count; true when it differs from the last one seen
    pub fn stale_claims_changed(&self, count: u64) -> bool {
        self.stale_reported.swap(count, Ordering::Relaxed) != count
    }

    fn record_execution(&self, elapsed: Duration) {
        self.executions.fetch_add(1, Ordering::Relaxed);
        self.processing_ms_total
            .fetch_add(elapsed.as_millis() as u64, Ordering::Relaxed);
    }

    /// Attach the slots of a started pool
    pub fn register_workers(&self, slots: &[Arc<WorkerSlot>], liveness_window: Duration) {
        self.liveness_window_ms
            .store(liveness_window.as_millis() as u64, Ordering::Relaxed);
        self.workers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(slots.iter().cloned());
    }

    pub fn snapshot(
        &self,
        backend: BackendSelection,
        queue_depth: u64,
        scheduled_retries: u64,
        oldest_pending_age_ms: Option<u64>,
        stale_processing: u64,
    ) -> QueueStats {
        let now_ms = Utc::now().timestamp_millis();
        let window = Duration::from_millis(self.liveness_window_ms.load(Ordering::Relaxed));

        let workers = self.workers.read().unwrap_or_else(PoisonError::into_inner);
        let total_workers = workers.len();
        let active_workers = workers.iter().filter(|w| w.is_busy()).count();
        let healthy_workers = workers
            .iter()
            .filter(|w| w.is_healthy(now_ms, window))
            .count();
        drop(workers);

        let executions = self.executions.load(Ordering::Relaxed);
        let avg_processing_time_ms = if executions == 0 {
            0.0
        } else {
            self.processing_ms_total.load(Ordering::Relaxed) as f64 / executions as f64
        };

        QueueStats {
            backend_name: backend.kind.name().to_string(),
            degraded: backend.degraded,
            backend_reason: backend.reason,
            queue_depth,
            scheduled_retries,
            total_workers,
            active_workers,
            healthy_workers,
            worker_restarts: self.worker_restarts.load(Ordering::Relaxed),
            tasks_submitted_total: self.submitted.load(Ordering::Relaxed),
            tasks_completed_total: self.completed.load(Ordering::Relaxed),
            tasks_failed_total: self.failed.load(Ordering::Relaxed),
            tasks_retried_total: self.retried.load(Ordering::Relaxed),
            tasks_cancelled_total: self.cancelled.load(Ordering::Relaxed),
            avg_processing_time_ms,
            oldest_pending_age_ms,
            stale_processing,
        }
    }
}

/// Point-in-time queue health, safe to return verbatim as JSON
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueStats {
    pub backend_name: String,
    pub degraded: bool,
    pub backend_reason: String,
    pub queue_depth: u64,
    pub scheduled_retries: u64,
    pub total_workers: usize,
    pub active_workers: usize,
    pub healthy_workers: usize,
    pub worker_restarts: u64,
    pub tasks_submitted_total: u64,
    pub tasks_completed_total: u64,
    pub tasks_failed_total: u64,
    pub tasks_retried_total: u64,
    pub tasks_cancelled_total: u64,
    pub avg_processing_time_ms: f64,
    pub oldest_pending_age_ms: Option<u64>,
    /// Claims older than the staleness threshold, e.g. orphaned by a crashed process
    pub stale_processing: u64,
}
