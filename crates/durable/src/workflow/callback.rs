//! Callback requests delivered to waiting workflows

use serde::{Deserialize, Serialize};

/// Identifies a single callback a workflow is waiting on
///
/// Built by the interpreter when it starts waiting (for an event, a
/// timeout, ...). The same request travels through the task queue and comes
/// back on delivery, so its identifying fields are covered by the callback
/// signature.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallbackRequest {
    /// Instance the callback belongs to
    pub workflow_id: String,

    /// Program counter at which the wait was entered
    pub pc: u64,

    /// Callback name (e.g. the wait-with-deadline label)
    pub name: String,

    /// Interpreter thread waiting on the callback
    #[serde(default)]
    pub thread_id: String,

    /// Opaque handle returned by `setup`, handed back to `teardown`
    #[serde(default)]
    pub setup_data: String,
}

impl CallbackRequest {
    /// Create a request for the given wait
    pub fn new(
        workflow_id: impl Into<String>,
        pc: u64,
        name: impl Into<String>,
        thread_id: impl Into<String>,
    ) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            pc,
            name: name.into(),
            thread_id: thread_id.into(),
            setup_data: String::new(),
        }
    }

    /// Attach the handle returned by `setup`
    pub fn with_setup_data(mut self, setup_data: impl Into<String>) -> Self {
        self.setup_data = setup_data.into();
        self
    }
}
