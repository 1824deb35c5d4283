//! Delayed, signed callback tasks
//!
//! This module provides:
//! - [`Signer`] computing HMAC tags over callback identifying fields
//! - [`TaskScheduler`] issuing resume and timeout tasks
//! - [`TaskQueue`] trait with Cloud Tasks, local and in-memory backends

mod cloud_tasks;
mod local;
mod queue;
mod signer;
mod task_scheduler;

pub use cloud_tasks::{CloudTasksConfig, CloudTasksQueue, TokenSource};
pub use local::LocalTaskQueue;
pub use queue::{InMemoryTaskQueue, QueuedTask, TaskQueue};
pub use signer::{Signer, SignerError};
pub use task_scheduler::{
    ResumeRequest, SchedulerConfig, SchedulerError, TaskScheduler, TimeoutRequest,
};
