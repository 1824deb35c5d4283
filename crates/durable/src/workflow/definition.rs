//! Workflow trait definition

use std::time::Duration;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

use super::{CallbackRequest, Meta};
use crate::scheduler::{SchedulerError, TaskScheduler};

/// Error raised by a workflow interpreter entry point
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InterpreterError {
    /// Caller supplied input the workflow rejects
    #[error("validation failed: {path} {message}")]
    Validation { path: String, message: String },

    /// Business logic failure
    #[error("{message}")]
    Failed { message: String, retryable: bool },
}

impl InterpreterError {
    /// Create a validation error for the given input path
    pub fn validation(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Create a non-retryable failure
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
            retryable: false,
        }
    }

    /// Create a retryable failure
    pub fn retryable(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
            retryable: true,
        }
    }

    /// Whether the caller may retry the same request
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Failed { retryable: true, .. })
    }
}

impl From<SchedulerError> for InterpreterError {
    fn from(err: SchedulerError) -> Self {
        Self::retryable(format!("scheduling failed: {}", err))
    }
}

/// Services available to a workflow while one of its entry points runs
///
/// Interpreters use it to arm and cancel deadlines. The handle returned
/// by [`WorkflowContext::setup_timeout`] must be stored in the workflow's own
/// state (usually in [`CallbackRequest::setup_data`]); the coordination layer
/// does not track it.
pub struct WorkflowContext<'a> {
    scheduler: &'a TaskScheduler,
}

impl<'a> WorkflowContext<'a> {
    pub fn new(scheduler: &'a TaskScheduler) -> Self {
        Self { scheduler }
    }

    /// Enqueue a signed timeout callback firing after `delay`
    pub async fn setup_timeout(
        &self,
        request: &CallbackRequest,
        delay: Duration,
    ) -> Result<String, SchedulerError> {
        self.scheduler.setup(request, delay).await
    }

    /// Cancel a timeout armed with [`WorkflowContext::setup_timeout`]
    ///
    /// `handled` must be true when the timeout already fired or the wait was
    /// satisfied by it, in which case nothing is deleted.
    pub async fn teardown_timeout(
        &self,
        request: &CallbackRequest,
        handled: bool,
    ) -> Result<(), SchedulerError> {
        self.scheduler.teardown(request, handled).await
    }

    pub fn scheduler(&self) -> &TaskScheduler {
        self.scheduler
    }
}

/// A workflow interpreter bound to its strongly typed state
///
/// The coordination layer creates a fresh value with [`Default`], decodes
/// the persisted JSON state into it, calls exactly one entry point under the
/// instance lease, and persists the re-encoded state together with `meta`.
///
/// Entry points may run more than once for the same logical trigger
/// (queue redelivery, redundant resume tasks, late timeouts), so they must
/// be idempotent with respect to the state they find.
///
/// # Example
///
/// ```ignore
/// #[derive(Default, Serialize, Deserialize)]
/// #[serde(default)]
/// struct Checkout {
///     paid: bool,
/// }
///
/// #[async_trait]
/// impl Workflow for Checkout {
///     const TYPE: &'static str = "checkout";
///
///     async fn resume(&mut self, _ctx: &WorkflowContext<'_>, meta: &mut Meta) -> Result<usize, InterpreterError> {
///         // ... advance as far as possible
///     }
///
///     // ... handle_event, handle_callback
/// }
/// ```
#[async_trait]
pub trait Workflow: Serialize + DeserializeOwned + Default + Send + Sync + 'static {
    /// Unique type identifier, used to look up the workflow in the registry
    const TYPE: &'static str;

    /// Run as many steps as possible without external input
    ///
    /// Returns the number of steps executed.
    async fn resume(
        &mut self,
        ctx: &WorkflowContext<'_>,
        meta: &mut Meta,
    ) -> Result<usize, InterpreterError>;

    /// Handle a named external event
    async fn handle_event(
        &mut self,
        ctx: &WorkflowContext<'_>,
        meta: &mut Meta,
        event: &str,
        input: Value,
    ) -> Result<Value, InterpreterError>;

    /// Handle a queue-delivered callback (e.g. a fired timeout)
    async fn handle_callback(
        &mut self,
        ctx: &WorkflowContext<'_>,
        meta: &mut Meta,
        request: &CallbackRequest,
        input: Value,
    ) -> Result<Value, InterpreterError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_display() {
        let error = InterpreterError::validation("amount", "must be positive");
        assert_eq!(error.to_string(), "validation failed: amount must be positive");
        assert!(!error.is_retryable());
    }

    #[test]
    fn test_failed_error_retryable() {
        assert!(InterpreterError::retryable("temporary").is_retryable());
        assert!(!InterpreterError::failed("permanent").is_retryable());
    }

    #[test]
    fn test_scheduler_error_is_retryable() {
        let error: InterpreterError = SchedulerError::Queue("unavailable".into()).into();
        assert!(error.is_retryable());
    }
}
