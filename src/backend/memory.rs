//! Process-local backend used when Redis is not available

use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use super::{Backend, BackendKind};
use crate::error::TaskResult;

#[derive(Debug)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    entries: HashMap<String, Entry>,
    queue: VecDeque<String>,
    /// (ready_at_ms, task_id)
    scheduled: BTreeSet<(i64, String)>,
    claims: HashMap<String, i64>,
}

/// In-process backend: a mutex-guarded map and FIFO plus a notifier for
/// blocked dequeuers.
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    state: Mutex<MemoryState>,
    available: Notify,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Backend for InMemoryBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Memory
    }

    async fn ping(&self) -> TaskResult<()> {
        Ok(())
    }

    async fn get(&self, key: &str) -> TaskResult<Option<String>> {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        match state.entries.get(key) {
            Some(entry) if !entry.is_expired(now) => return Ok(Some(entry.value.clone())),
            Some(_) => {}
            None => return Ok(None),
        }
        // expired: evict on read
        state.entries.remove(key);
        Ok(None)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> TaskResult<()> {
        let entry = Entry {
            value: value.to_string(),
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        };
        self.state.lock().await.entries.insert(key.to_string(), entry);
        Ok(())
    }

    async fn delete(&self, key: &str) -> TaskResult<bool> {
        Ok(self.state.lock().await.entries.remove(key).is_some())
    }

    async fn enqueue(&self, task_id: &str) -> TaskResult<()> {
        self.state.lock().await.queue.push_back(task_id.to_string());
        self.available.notify_one();
        Ok(())
    }

    async fn dequeue(&self, timeout: Duration) -> TaskResult<Option<String>> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.available.notified();
            {
                let mut state = self.state.lock().await;
                if let Some(task_id) = state.queue.pop_front() {
                    if !state.queue.is_empty() {
                        // pass the wakeup on so other idle workers drain the rest
                        self.available.notify_one();
                    }
                    return Ok(Some(task_id));
                }
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn peek_oldest(&self) -> TaskResult<Option<String>> {
        Ok(self.state.lock().await.queue.front().cloned())
    }

    async fn queue_depth(&self) -> TaskResult<u64> {
        Ok(self.state.lock().await.queue.len() as u64)
    }

    async fn remove_queued(&self, task_id: &str) -> TaskResult<bool> {
        let mut state = self.state.lock().await;
        let queued = state.queue.len();
        state.queue.retain(|id| id != task_id);
        let scheduled = state.scheduled.len();
        state.scheduled.retain(|(_, id)| id != task_id);
        Ok(state.queue.len() < queued || state.scheduled.len() < scheduled)
    }

    async fn schedule(&self, task_id: &str, ready_at_ms: i64) -> TaskResult<()> {
        self.state
            .lock()
            .await
            .scheduled
            .insert((ready_at_ms, task_id.to_string()));
        Ok(())
    }

    async fn promote_due(&self, now_ms: i64) -> TaskResult<u64> {
        let mut state = self.state.lock().await;
        let mut promoted = 0;
        while let Some((ready_at, _)) = state.scheduled.first() {
            if *ready_at > now_ms {
                break;
            }
            if let Some((_, task_id)) = state.scheduled.pop_first() {
                state.queue.push_back(task_id);
                promoted += 1;
            }
        }
        drop(state);

        for _ in 0..promoted {
            self.available.notify_one();
        }
        Ok(promoted)
    }

    async fn scheduled_count(&self) -> TaskResult<u64> {
        Ok(self.state.lock().await.scheduled.len() as u64)
    }

    async fn claim(&self, task_id: &str, at_ms: i64) -> TaskResult<()> {
        self.state
            .lock()
            .await
            .claims
            .insert(task_id.to_string(), at_ms);
        Ok(())
    }

    async fn release(&self, task_id: &str) -> TaskResult<()> {
        self.state.lock().await.claims.remove(task_id);
        Ok(())
    }

    async fn stale_claims(&self, older_than_ms: i64) -> TaskResult<u64> {
        let state = self.state.lock().await;
        Ok(state
            .claims
            .values()
            .filter(|at| **at < older_than_ms)
            .count() as u64)
    }

    async fn purge_expired(&self) -> TaskResult<u64> {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        let before = state.entries.len();
        state.entries.retain(|_, entry| !entry.is_expired(now));
        Ok((before - state.entries.len()) as u64)
    }
}
