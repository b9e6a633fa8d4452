//! Error types for the analysis task queue

use thiserror::Error;

/// Result type alias for task queue operations
pub type TaskResult<T> = Result<T, TaskError>;

/// Error taxonomy for the task queue.
///
/// Caller mistakes (`UnknownTaskType`, `TaskNotFound`) are raised synchronously.
/// Execution-time faults are absorbed by retries or backend fallback and only
/// surface later through the task record.
#[derive(Error, Debug)]
pub enum TaskError {
    /// No handler registered for the submitted task type
    #[error("Unknown task type: {task_type}")]
    UnknownTaskType { task_type: String },

    /// Task ID was never issued or its record has expired
    #[error("Task not found: {task_id}")]
    TaskNotFound { task_id: String },

    /// Result requested before the task reached `completed`
    #[error("Task {task_id} is not ready (status: {status})")]
    TaskNotReady { task_id: String, status: String },

    /// Task exhausted its retries
    #[error("Task {task_id} failed after {attempts} attempt(s): {message}")]
    TaskFailed {
        task_id: String,
        message: String,
        attempts: u32,
    },

    /// Task was cancelled before a worker picked it up
    #[error("Task {task_id} was cancelled")]
    TaskCancelled { task_id: String },

    /// Redis connection or operation errors
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Record serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Distributed backend could not be reached
    #[error("Backend unavailable: {reason}")]
    BackendUnavailable { reason: String },

    /// Worker errors
    #[error("Worker error: {message}")]
    Worker { message: String },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Timeout errors
    #[error("Operation timed out: {operation}")]
    Timeout { operation: String },

    /// Generic errors for wrapping other error types
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl TaskError {
    /// Create a task-not-found error
    pub fn not_found(task_id: impl ToString) -> Self {
        Self::TaskNotFound {
            task_id: task_id.to_string(),
        }
    }

    /// Create a backend-unavailable error
    pub fn backend_unavailable<S: Into<String>>(reason: S) -> Self {
        Self::BackendUnavailable {
            reason: reason.into(),
        }
    }

    /// Create a worker error
    pub fn worker<S: Into<String>>(message: S) -> Self {
        Self::Worker {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout<S: Into<String>>(operation: S) -> Self {
        Self::Timeout {
            operation: operation.into(),
        }
    }

    /// Check if the error is recoverable (polling or retrying may succeed)
    pub fn is_recoverable(&self) -> bool {
        match self {
            TaskError::TaskNotReady { .. } => true,
            TaskError::Redis(_) => true,
            TaskError::BackendUnavailable { .. } => true,
            TaskError::Timeout { .. } => true,
            TaskError::Worker { .. } => true,
            TaskError::UnknownTaskType { .. } => false,
            TaskError::TaskNotFound { .. } => false,
            TaskError::TaskFailed { .. } => false,
            TaskError::TaskCancelled { .. } => false,
            TaskError::Serialization(_) => false,
            TaskError::Config { .. } => false,
            TaskError::Internal(_) => false,
        }
    }

    /// Connectivity faults that trigger fallback to the in-process backend.
    /// Reply errors from a reachable Redis (WRONGTYPE, script errors, ...)
    /// are returned to the caller instead.
    pub fn is_backend_unavailable(&self) -> bool {
        match self {
            TaskError::Redis(e) => {
                e.is_io_error()
                    || e.is_connection_refusal()
                    || e.is_connection_dropped()
                    || e.is_timeout()
                    || e.kind() == redis::ErrorKind::AuthenticationFailed
            }
            TaskError::BackendUnavailable { .. } | TaskError::Timeout { .. } => true,
            _ => false,
        }
    }

    /// Errors caused by the caller's input (maps to a 4xx at the web layer)
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            TaskError::UnknownTaskType { .. } | TaskError::TaskNotFound { .. }
        )
    }
}
