//! Signed resume and timeout tasks

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use super::{QueuedTask, Signer, TaskQueue};
use crate::workflow::CallbackRequest;

/// Errors from the task scheduler and queue backends
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    /// Queue service rejected the request
    #[error("queue error: {0}")]
    Queue(String),

    /// Queue service could not be reached
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// `setup_data` is not a handle produced by `setup`
    #[error("invalid task handle: {0}")]
    InvalidHandle(String),

    /// Could not obtain credentials for the queue service
    #[error("queue authentication failed: {0}")]
    Auth(String),
}

/// Where queue deliveries are sent
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Public URL of the resume endpoint
    pub resume_url: String,

    /// Public URL of the timeout callback endpoint
    pub callback_url: String,
}

impl SchedulerConfig {
    /// Endpoints under a public base URL (`/resume`, `/callback/timeout`)
    pub fn from_base_url(base: &str) -> Self {
        let base = base.trim_end_matches('/');
        Self {
            resume_url: format!("{}/resume", base),
            callback_url: format!("{}/callback/timeout", base),
        }
    }
}

/// Body of a resume task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResumeRequest {
    pub id: String,
    pub signature: String,
}

/// Body of a timeout task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeoutRequest {
    pub req: CallbackRequest,
    pub signature: String,
}

/// Handle stored in `CallbackRequest::setup_data`
#[derive(Serialize, Deserialize)]
struct TaskHandle {
    id: String,
}

fn timeout_fields(req: &CallbackRequest) -> [String; 4] {
    [
        req.name.clone(),
        req.thread_id.clone(),
        req.workflow_id.clone(),
        req.pc.to_string(),
    ]
}

/// Issues delayed, signed callback tasks to a [`TaskQueue`]
#[derive(Clone)]
pub struct TaskScheduler {
    queue: Arc<dyn TaskQueue>,
    signer: Signer,
    config: SchedulerConfig,
}

impl TaskScheduler {
    pub fn new(queue: Arc<dyn TaskQueue>, signer: Signer, config: SchedulerConfig) -> Self {
        Self {
            queue,
            signer,
            config,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Signed resume request for instance `id`
    pub fn resume_request(&self, id: &str) -> ResumeRequest {
        ResumeRequest {
            id: id.to_string(),
            signature: self.signer.sign(&[id]),
        }
    }

    /// Signed timeout request for `req`
    pub fn timeout_request(&self, req: &CallbackRequest) -> TimeoutRequest {
        let fields = timeout_fields(req);
        let fields: Vec<&str> = fields.iter().map(String::as_str).collect();
        TimeoutRequest {
            req: req.clone(),
            signature: self.signer.sign(&fields),
        }
    }

    pub fn verify_resume(&self, request: &ResumeRequest) -> bool {
        self.signer.verify(&[&request.id], &request.signature)
    }

    pub fn verify_timeout(&self, request: &TimeoutRequest) -> bool {
        let fields = timeout_fields(&request.req);
        let fields: Vec<&str> = fields.iter().map(String::as_str).collect();
        self.signer.verify(&fields, &request.signature)
    }

    /// Enqueue a signed resume of instance `id` after `delay`
    #[instrument(skip(self), fields(delay_ms = delay.as_millis() as u64))]
    pub async fn schedule(&self, id: &str, delay: Duration) -> Result<(), SchedulerError> {
        let body = serde_json::to_vec(&self.resume_request(id))?;
        let name = self
            .queue
            .create_task(QueuedTask {
                url: self.config.resume_url.clone(),
                body,
                schedule_time: Utc::now() + to_chrono(delay),
            })
            .await?;
        debug!(task = %name, "scheduled resume");
        Ok(())
    }

    /// Enqueue a signed timeout for `req` after `delay`
    ///
    /// Returns the handle to pass back through `setup_data` on teardown.
    #[instrument(skip(self, req), fields(workflow_id = %req.workflow_id, callback = %req.name))]
    pub async fn setup(
        &self,
        req: &CallbackRequest,
        delay: Duration,
    ) -> Result<String, SchedulerError> {
        let body = serde_json::to_vec(&self.timeout_request(req))?;
        let name = self
            .queue
            .create_task(QueuedTask {
                url: self.config.callback_url.clone(),
                body,
                schedule_time: Utc::now() + to_chrono(delay),
            })
            .await?;
        debug!(task = %name, "set up timeout");
        Ok(serde_json::to_string(&TaskHandle { id: name })?)
    }

    /// Cancel the timeout created for `req`, unless it was already handled
    ///
    /// A failed deletion is only logged: a late timeout firing into a
    /// satisfied wait must be tolerated by the workflow anyway.
    #[instrument(skip(self, req), fields(workflow_id = %req.workflow_id, callback = %req.name))]
    pub async fn teardown(&self, req: &CallbackRequest, handled: bool) -> Result<(), SchedulerError> {
        if handled {
            debug!("timeout already handled, skipping teardown");
            return Ok(());
        }

        let handle: TaskHandle = serde_json::from_str(&req.setup_data)
            .map_err(|e| SchedulerError::InvalidHandle(e.to_string()))?;

        if let Err(e) = self.queue.delete_task(&handle.id).await {
            warn!(task = %handle.id, error = %e, "failed to delete timeout task");
        }
        Ok(())
    }
}

// Cloud Tasks refuses schedule times more than 30 days out
const MAX_DELAY_DAYS: i64 = 30;

fn to_chrono(delay: Duration) -> chrono::Duration {
    chrono::Duration::from_std(delay)
        .unwrap_or_else(|_| chrono::Duration::days(MAX_DELAY_DAYS))
        .min(chrono::Duration::days(MAX_DELAY_DAYS))
}
