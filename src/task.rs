//! Task records and lifecycle management

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt::{self, Debug};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use uuid::Uuid;

/// Unique identifier for tasks
pub type TaskId = Uuid;

/// Task execution status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Task is waiting in the queue (or waiting out a retry backoff)
    Pending,
    /// Task is held by exactly one worker
    Processing,
    /// Task completed successfully
    Completed,
    /// Task exhausted its retries
    Failed,
    /// Task was cancelled before a worker picked it up
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration for task retry behavior
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts after the first execution
    pub max_retries: u32,
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Upper bound for the backoff delay
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Backoff before re-running a task whose `attempt`-th execution failed.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Error stored on a record that did not complete
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskFailure {
    /// Human-readable message from the last handler failure
    pub message: String,
    /// Number of attempts made before giving up
    pub attempts: u32,
}

/// One unit of submitted work and its lifecycle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    /// Unique task identifier
    pub id: TaskId,
    /// Registered handler name
    pub task_type: String,
    /// Handler input
    pub payload: Value,
    /// Current task status
    pub status: TaskStatus,
    /// Advisory progress, 0 to 100
    pub progress: u8,
    /// Handler output (completed only)
    pub result: Option<Value>,
    /// Failure details (failed or cancelled only)
    pub error: Option<TaskFailure>,
    /// Execution attempts so far
    pub attempts: u32,
    /// Retry limit captured at submission
    pub max_retries: u32,
    /// Worker currently or last holding the task
    pub worker_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl TaskRecord {
    /// Create a pending record
    pub fn new(task_type: impl Into<String>, payload: Value, max_retries: u32) -> Self {
        let now = Utc::now();
        Self {
            id: TaskId::new_v4(),
            task_type: task_type.into(),
            payload,
            status: TaskStatus::Pending,
            progress: 0,
            result: None,
            error: None,
            attempts: 0,
            max_retries,
            worker_id: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    /// Hand the task to a worker and count the attempt
    pub fn mark_processing(&mut self, worker_id: &str) {
        let now = Utc::now();
        self.status = TaskStatus::Processing;
        self.attempts += 1;
        self.progress = 0;
        self.started_at = Some(now);
        self.updated_at = now;
        self.worker_id = Some(worker_id.to_string());
    }

    /// Store the handler output
    pub fn mark_completed(&mut self, result: Value) {
        let now = Utc::now();
        self.status = TaskStatus::Completed;
        self.progress = 100;
        self.result = Some(result);
        self.error = None;
        self.completed_at = Some(now);
        self.updated_at = now;
    }

    /// Send the task back to `pending` for another attempt
    pub fn mark_retry(&mut self) {
        self.status = TaskStatus::Pending;
        self.started_at = None;
        self.worker_id = None;
        self.updated_at = Utc::now();
    }

    /// Store the final failure
    pub fn mark_failed(&mut self, message: &str) {
        let now = Utc::now();
        self.status = TaskStatus::Failed;
        self.result = None;
        self.error = Some(TaskFailure {
            message: message.to_string(),
            attempts: self.attempts,
        });
        self.completed_at = Some(now);
        self.updated_at = now;
    }

    pub fn mark_cancelled(&mut self) {
        let now = Utc::now();
        self.status = TaskStatus::Cancelled;
        self.result = None;
        self.error = Some(TaskFailure {
            message: "cancelled before execution".to_string(),
            attempts: self.attempts,
        });
        self.completed_at = Some(now);
        self.updated_at = now;
    }

    pub fn set_progress(&mut self, progress: u8) {
        self.progress = progress.min(100);
        self.updated_at = Utc::now();
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Whether a failed attempt may be retried
    pub fn can_retry(&self) -> bool {
        self.attempts <= self.max_retries
    }

    /// Time spent in the last execution, if it finished
    pub fn processing_time(&self) -> Option<chrono::Duration> {
        match (self.started_at, self.completed_at) {
            (Some(started), Some(finished)) => Some(finished - started),
            _ => None,
        }
    }
}

/// Sends progress updates from a running handler to its worker.
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    tx: Option<UnboundedSender<u8>>,
}

impl ProgressReporter {
    pub(crate) fn new(tx: UnboundedSender<u8>) -> Self {
        Self { tx: Some(tx) }
    }

    /// A reporter that drops every update
    pub fn detached() -> Self {
        Self { tx: None }
    }

    /// Report progress (clamped to 100). Updates after the worker stopped listening are dropped.
    pub fn report(&self, progress: u8) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(progress.min(100));
        }
    }
}

/// Execution context handed to a handler
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub task_id: TaskId,
    pub task_type: String,
    /// 1-based attempt number
    pub attempt: u32,
    pub progress: ProgressReporter,
}

impl TaskContext {
    pub fn new(record: &TaskRecord, progress: ProgressReporter) -> Self {
        Self {
            task_id: record.id,
            task_type: record.task_type.clone(),
            attempt: record.attempts,
            progress,
        }
    }
}

/// Typed unit of work, decoded from the task payload.
#[async_trait]
pub trait Task: DeserializeOwned + Send + Sync + Debug + 'static {
    /// The output type of the task
    type Output: Serialize + Send;

    /// Execute the task and return the result
    async fn execute(&self, ctx: &TaskContext) -> anyhow::Result<Self::Output>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(350));
        assert_eq!(policy.delay_for(40), Duration::from_millis(350));
    }

    #[test]
    fn lifecycle_keeps_result_and_error_exclusive() {
        let mut record = TaskRecord::new("double", json!(21), 2);
        assert_eq!(record.status, TaskStatus::Pending);
        assert_eq!(record.attempts, 0);

        record.mark_processing("worker-0");
        assert_eq!(record.attempts, 1);
        assert!(record.started_at.is_some());

        record.mark_completed(json!(42));
        assert_eq!(record.status, TaskStatus::Completed);
        assert_eq!(record.result, Some(json!(42)));
        assert!(record.error.is_none());
        assert!(record.processing_time().is_some());
    }

    #[test]
    fn retry_bound_follows_attempts() {
        let mut record = TaskRecord::new("always_fails", Value::Null, 2);
        for _ in 0..2 {
            record.mark_processing("w");
            assert!(record.can_retry());
            record.mark_retry();
            assert_eq!(record.status, TaskStatus::Pending);
            assert!(record.worker_id.is_none());
        }
        record.mark_processing("w");
        assert!(!record.can_retry());
        record.mark_failed("boom");
        assert_eq!(record.attempts, 3);
        assert!(record.result.is_none());
        assert_eq!(
            record.error,
            Some(TaskFailure {
                message: "boom".to_string(),
                attempts: 3
            })
        );
    }

    #[test]
    fn status_serializes_lowercase() {
        let record = TaskRecord::new("double", json!(1), 0);
        let doc = serde_json::to_value(&record).unwrap();
        assert_eq!(doc["status"], "pending");
        assert_eq!(TaskStatus::Processing.to_string(), "processing");
    }

    #[test]
    fn progress_is_clamped() {
        let mut record = TaskRecord::new("double", json!(1), 0);
        record.set_progress(250);
        assert_eq!(record.progress, 100);

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        ProgressReporter::new(tx).report(180);
        assert_eq!(rx.try_recv().unwrap(), 100);
        ProgressReporter::detached().report(5);
    }
}
