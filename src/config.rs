//! Environment-driven configuration

use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

use crate::error::{TaskError, TaskResult};
use crate::queue::TaskQueueConfig;
use crate::worker::WorkerConfig;

pub const ENV_REDIS_URL: &str = "TASK_QUEUE_REDIS_URL";
pub const ENV_REDIS_URL_FALLBACK: &str = "REDIS_URL";
pub const ENV_KEY_PREFIX: &str = "TASK_QUEUE_KEY_PREFIX";
pub const ENV_CONNECT_TIMEOUT_MS: &str = "TASK_QUEUE_CONNECT_TIMEOUT_MS";
pub const ENV_WORKERS: &str = "TASK_QUEUE_WORKERS";
pub const ENV_MAX_RETRIES: &str = "TASK_QUEUE_MAX_RETRIES";
pub const ENV_RETRY_BASE_MS: &str = "TASK_QUEUE_RETRY_BASE_MS";
pub const ENV_RETRY_MAX_MS: &str = "TASK_QUEUE_RETRY_MAX_MS";
pub const ENV_RESULT_TTL_SECS: &str = "TASK_QUEUE_RESULT_TTL_SECS";
pub const ENV_POLL_TIMEOUT_MS: &str = "TASK_QUEUE_POLL_TIMEOUT_MS";
pub const ENV_STALE_AFTER_SECS: &str = "TASK_QUEUE_STALE_AFTER_SECS";

/// Queue and worker settings loaded together
#[derive(Debug, Clone, Default)]
pub struct Settings {
    pub queue: TaskQueueConfig,
    pub worker: WorkerConfig,
}

impl Settings {
    /// Read settings from the process environment
    pub fn from_env() -> TaskResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read settings through `lookup`, falling back to defaults for unset keys.
    /// A missing Redis URL is not an error; it selects the in-memory backend.
    pub fn from_lookup<F>(lookup: F) -> TaskResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut settings = Settings::default();
        let queue = &mut settings.queue;
        let worker = &mut settings.worker;

        queue.redis_url = lookup(ENV_REDIS_URL)
            .or_else(|| lookup(ENV_REDIS_URL_FALLBACK))
            .map(|url| url.trim().to_string())
            .filter(|url| !url.is_empty());

        if let Some(prefix) = lookup(ENV_KEY_PREFIX).filter(|p| !p.trim().is_empty()) {
            queue.key_prefix = prefix.trim().to_string();
        }
        if let Some(ms) = parse::<u64, _>(&lookup, ENV_CONNECT_TIMEOUT_MS)? {
            queue.connect_timeout = Duration::from_millis(ms);
        }
        if let Some(count) = parse::<usize, _>(&lookup, ENV_WORKERS)? {
            worker.worker_count = count;
        }
        if let Some(retries) = parse::<u32, _>(&lookup, ENV_MAX_RETRIES)? {
            queue.retry.max_retries = retries;
        }
        if let Some(ms) = parse::<u64, _>(&lookup, ENV_RETRY_BASE_MS)? {
            queue.retry.base_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = parse::<u64, _>(&lookup, ENV_RETRY_MAX_MS)? {
            queue.retry.max_delay = Duration::from_millis(ms);
        }
        if let Some(secs) = parse::<u64, _>(&lookup, ENV_RESULT_TTL_SECS)? {
            queue.result_ttl = Duration::from_secs(secs);
        }
        if let Some(ms) = parse::<u64, _>(&lookup, ENV_POLL_TIMEOUT_MS)? {
            worker.poll_timeout = Duration::from_millis(ms);
        }
        if let Some(secs) = parse::<u64, _>(&lookup, ENV_STALE_AFTER_SECS)? {
            queue.stale_after = Duration::from_secs(secs);
        }

        settings.validate()?;
        debug!("Loaded task queue settings: {:?}", settings);
        Ok(settings)
    }

    pub fn validate(&self) -> TaskResult<()> {
        if self.worker.worker_count == 0 {
            return Err(TaskError::config(format!("{} must be at least 1", ENV_WORKERS)));
        }
        if self.worker.poll_timeout.is_zero() {
            return Err(TaskError::config(format!(
                "{} must be greater than 0",
                ENV_POLL_TIMEOUT_MS
            )));
        }
        if self.queue.result_ttl.is_zero() {
            return Err(TaskError::config(format!(
                "{} must be greater than 0",
                ENV_RESULT_TTL_SECS
            )));
        }
        if self.queue.retry.max_delay < self.queue.retry.base_delay {
            return Err(TaskError::config(format!(
                "{} must not be smaller than {}",
                ENV_RETRY_MAX_MS, ENV_RETRY_BASE_MS
            )));
        }
        Ok(())
    }
}

fn parse<T, F>(lookup: &F, key: &str) -> TaskResult<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| TaskError::config(format!("invalid {} {:?}: {}", key, raw, e))),
        None => Ok(None),
    }
}
