//! # Analysis Task Queue
//!
//! Asynchronous task queue used to move slow stock-analysis work off the
//! request path.
//!
//! ## Features
//!
//! - Redis backend with automatic fallback to an in-process backend
//! - Fire-and-forget submission with status and result polling by task ID
//! - Fixed-size, supervised worker pool
//! - Retries with exponential backoff
//! - Time-limited result retention
//! - On-demand health and throughput stats
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use analysis_task_queue::{TaskQueue, TaskQueueConfig, WorkerConfig, WorkerPool};
//! use serde_json::{json, Value};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let queue = Arc::new(TaskQueue::new(TaskQueueConfig::default()).await);
//! queue
//!     .register_fn("double", |_ctx, payload: Value| async move {
//!         Ok(json!(payload.as_i64().unwrap_or_default() * 2))
//!     })
//!     .await;
//!
//! let pool = WorkerPool::new(WorkerConfig::default(), queue.clone());
//! pool.start().await?;
//!
//! let task_id = queue.submit("double", json!(21)).await?;
//! let record = queue.get_status(task_id).await?;
//! println!("{} is {}", task_id, record.status);
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod client;
pub mod config;
pub mod error;
pub mod queue;
pub mod stats;
pub mod task;
pub mod worker;

// Re-export commonly used types
pub use backend::{Backend, BackendKind, BackendSelection, FailoverBackend};
pub use client::TaskClient;
pub use config::Settings;
pub use error::{TaskError, TaskResult};
pub use queue::{FnHandler, TaskHandler, TaskQueue, TaskQueueConfig};
pub use stats::QueueStats;
pub use task::{
    ProgressReporter, RetryPolicy, Task, TaskContext, TaskFailure, TaskId, TaskRecord, TaskStatus,
};
pub use worker::{WorkerConfig, WorkerPool};

/// Version of the analysis task queue library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
