//! Client interface used by request handlers

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{TaskError, TaskResult};
use crate::queue::{TaskQueue, TaskQueueConfig};
use crate::stats::QueueStats;
use crate::task::{TaskId, TaskStatus};

/// Thin facade over a shared [`TaskQueue`] for the web layer
#[derive(Clone)]
pub struct TaskClient {
    queue: Arc<TaskQueue>,
    poll_interval: Duration,
}

impl TaskClient {
    /// Create a client with its own queue
    pub async fn new(config: TaskQueueConfig) -> Self {
        Self::from_queue(Arc::new(TaskQueue::new(config).await))
    }

    /// Create a task client from an existing queue
    pub fn from_queue(queue: Arc<TaskQueue>) -> Self {
        Self {
            queue,
            poll_interval: Duration::from_millis(100),
        }
    }

    /// Interval used by [`wait_for_result`](Self::wait_for_result)
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Submit any serializable payload
    pub async fn submit<P>(&self, task_type: &str, payload: &P) -> TaskResult<TaskId>
    where
        P: Serialize + ?Sized,
    {
        let payload = serde_json::to_value(payload)?;
        self.queue.submit(task_type, payload).await
    }

    /// Submit and build the acknowledgement returned to HTTP clients
    pub async fn submit_receipt<P>(&self, task_type: &str, payload: &P) -> TaskResult<Value>
    where
        P: Serialize + ?Sized,
    {
        let task_id = self.submit(task_type, payload).await?;
        Ok(json!({ "task_id": task_id, "status": TaskStatus::Processing }))
    }

    /// Submit multiple payloads of one task type
    pub async fn submit_batch<P>(&self, task_type: &str, payloads: &[P]) -> TaskResult<Vec<TaskId>>
    where
        P: Serialize,
    {
        let mut task_ids = Vec::with_capacity(payloads.len());
        for payload in payloads {
            task_ids.push(self.submit(task_type, payload).await?);
        }
        Ok(task_ids)
    }

    /// Task record as a JSON document for status polling
    pub async fn status_document(&self, task_id: TaskId) -> TaskResult<Value> {
        let record = self.queue.get_status(task_id).await?;
        Ok(serde_json::to_value(record)?)
    }

    /// Decode the result of a completed task
    pub async fn result<R>(&self, task_id: TaskId) -> TaskResult<R>
    where
        R: DeserializeOwned,
    {
        let value = self.queue.get_result(task_id).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Poll until the task reaches a terminal state
    pub async fn wait_for_result<R>(
        &self,
        task_id: TaskId,
        timeout: Option<Duration>,
    ) -> TaskResult<R>
    where
        R: DeserializeOwned,
    {
        let started = Instant::now();
        loop {
            match self.result(task_id).await {
                Err(TaskError::TaskNotReady { .. }) => {}
                other => return other,
            }
            if let Some(timeout) = timeout {
                if started.elapsed() > timeout {
                    return Err(TaskError::timeout(format!("wait_for_result({})", task_id)));
                }
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    pub async fn cancel(&self, task_id: TaskId) -> TaskResult<bool> {
        self.queue.cancel(task_id).await
    }

    pub async fn stats(&self) -> TaskResult<QueueStats> {
        self.queue.get_stats().await
    }

    /// Get access to the underlying queue
    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.queue
    }
}
