//! Task queue abstraction and the in-memory test queue

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use super::SchedulerError;

/// A delayed HTTP POST handed to the queue service
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedTask {
    /// Target endpoint receiving the POST
    pub url: String,

    /// JSON request body (already signed)
    pub body: Vec<u8>,

    /// Earliest delivery time
    pub schedule_time: DateTime<Utc>,
}

impl QueuedTask {
    /// Decode the body as JSON
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }
}

/// External at-least-once task queue
///
/// Only append and delete are needed; the queue is never read back.
#[async_trait]
pub trait TaskQueue: Send + Sync + 'static {
    /// Enqueue a task, returning the queue-assigned task name
    async fn create_task(&self, task: QueuedTask) -> Result<String, SchedulerError>;

    /// Delete a task that has not fired yet
    async fn delete_task(&self, name: &str) -> Result<(), SchedulerError>;
}

/// In-memory task queue for tests
///
/// Records every created and deleted task. Nothing is ever delivered on its
/// own; tests pull due tasks with [`InMemoryTaskQueue::take_due`] and feed
/// them to the receiving handler themselves.
#[derive(Default)]
pub struct InMemoryTaskQueue {
    created: Mutex<Vec<(String, QueuedTask)>>,
    deleted: Mutex<Vec<String>>,
    next_id: AtomicU64,
    fail_creates: AtomicBool,
    fail_deletes: AtomicBool,
}

impl InMemoryTaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent `create_task` calls fail
    pub fn set_fail_creates(&self, fail: bool) {
        self.fail_creates.store(fail, Ordering::SeqCst);
    }

    /// Make subsequent `delete_task` calls fail
    pub fn set_fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::SeqCst);
    }

    /// Every task created so far, with its name, in creation order
    pub fn created(&self) -> Vec<(String, QueuedTask)> {
        self.created.lock().clone()
    }

    /// Names passed to `delete_task`, in call order
    pub fn deleted(&self) -> Vec<String> {
        self.deleted.lock().clone()
    }

    /// Created tasks that were neither deleted nor taken
    pub fn pending(&self) -> Vec<(String, QueuedTask)> {
        let deleted = self.deleted.lock();
        self.created
            .lock()
            .iter()
            .filter(|(name, _)| !deleted.contains(name))
            .cloned()
            .collect()
    }

    /// Remove and return pending tasks due at `now`, oldest first
    pub fn take_due(&self, now: DateTime<Utc>) -> Vec<QueuedTask> {
        let deleted = self.deleted.lock();
        let mut created = self.created.lock();

        let mut due = Vec::new();
        created.retain(|(name, task)| {
            if deleted.contains(name) {
                return true;
            }
            if task.schedule_time <= now {
                due.push(task.clone());
                false
            } else {
                true
            }
        });
        due
    }
}

#[async_trait]
impl TaskQueue for InMemoryTaskQueue {
    async fn create_task(&self, task: QueuedTask) -> Result<String, SchedulerError> {
        if self.fail_creates.load(Ordering::SeqCst) {
            return Err(SchedulerError::Queue("queue unavailable".to_string()));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let name = format!("memory-task-{}", id);
        self.created.lock().push((name.clone(), task));
        Ok(name)
    }

    async fn delete_task(&self, name: &str) -> Result<(), SchedulerError> {
        self.deleted.lock().push(name.to_string());
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(SchedulerError::Queue("queue unavailable".to_string()));
        }
        Ok(())
    }
}
