//! In-process task queue for development without a cloud queue

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use reqwest::Client;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{QueuedTask, SchedulerError, TaskQueue};

/// Task queue backed by tokio timers in the current process
///
/// Each task is a spawned timer that POSTs the body to its target URL once
/// due. Failed deliveries (transport errors or non-2xx responses) are
/// retried a bounded number of times, so the receiver sees the same
/// at-least-once flavour as with a real queue. Tasks do not survive a
/// restart.
pub struct LocalTaskQueue {
    client: Client,
    timers: Arc<Mutex<HashMap<String, JoinHandle<()>>>>,
    max_delivery_attempts: u32,
    retry_delay: Duration,
}

impl LocalTaskQueue {
    pub fn new() -> Self {
        Self::with_client(Client::new())
    }

    pub fn with_client(client: Client) -> Self {
        Self {
            client,
            timers: Arc::new(Mutex::new(HashMap::new())),
            max_delivery_attempts: 5,
            retry_delay: Duration::from_secs(1),
        }
    }

    pub fn with_max_delivery_attempts(mut self, attempts: u32) -> Self {
        self.max_delivery_attempts = attempts.max(1);
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Number of tasks that have not been delivered or deleted yet
    pub fn pending_count(&self) -> usize {
        self.timers.lock().len()
    }
}

impl Default for LocalTaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

async fn deliver(client: &Client, name: &str, task: &QueuedTask) -> Result<(), String> {
    let response = client
        .post(&task.url)
        .header("Content-Type", "application/json")
        .body(task.body.clone())
        .send()
        .await
        .map_err(|e| e.to_string())?;

    if !response.status().is_success() {
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        return Err(format!("status {}: {}", status, text));
    }

    debug!(task = %name, url = %task.url, "delivered task");
    Ok(())
}

#[async_trait]
impl TaskQueue for LocalTaskQueue {
    async fn create_task(&self, task: QueuedTask) -> Result<String, SchedulerError> {
        let name = format!("local-{}", Uuid::now_v7());
        let delay = (task.schedule_time - Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO);

        let client = self.client.clone();
        let timers = Arc::clone(&self.timers);
        let max_attempts = self.max_delivery_attempts;
        let retry_delay = self.retry_delay;
        let task_name = name.clone();

        // Hold the map lock across spawn so the timer cannot finish and
        // remove its entry before it is inserted
        let mut guard = self.timers.lock();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;

            for attempt in 1..=max_attempts {
                match deliver(&client, &task_name, &task).await {
                    Ok(()) => break,
                    Err(e) if attempt < max_attempts => {
                        warn!(task = %task_name, attempt, error = %e, "delivery failed, retrying");
                        tokio::time::sleep(retry_delay * attempt).await;
                    }
                    Err(e) => {
                        warn!(task = %task_name, attempt, error = %e, "delivery failed, dropping task");
                    }
                }
            }

            timers.lock().remove(&task_name);
        });
        guard.insert(name.clone(), handle);
        drop(guard);

        debug!(task = %name, delay_ms = delay.as_millis() as u64, "scheduled local task");
        Ok(name)
    }

    async fn delete_task(&self, name: &str) -> Result<(), SchedulerError> {
        match self.timers.lock().remove(name) {
            Some(handle) => {
                handle.abort();
                debug!(task = %name, "deleted local task");
            }
            None => debug!(task = %name, "local task already fired or unknown"),
        }
        Ok(())
    }
}

impl Drop for LocalTaskQueue {
    fn drop(&mut self) {
        for (_, handle) in self.timers.lock().drain() {
            handle.abort();
        }
    }
}
