//! Workflow instance metadata

use serde::{Deserialize, Serialize};

/// Lifecycle status of a workflow instance, as decided by the interpreter
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    /// Workflow is running (possibly suspended on a wait)
    #[default]
    Running,

    /// Workflow reached its end
    Finished,
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Finished => write!(f, "finished"),
        }
    }
}

/// Metadata record persisted next to the opaque workflow state
///
/// The interpreter owns every field. The coordination layer only reads
/// `id` and `workflow` (for routing and logging) and sets them once at
/// creation time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Meta {
    /// Unique, immutable instance id
    pub id: String,

    /// Registered workflow type name
    pub workflow: String,

    /// Program counter, advanced by the interpreter on every transition
    #[serde(default)]
    pub pc: u64,

    /// Interpreter-managed status
    #[serde(default)]
    pub status: WorkflowStatus,
}

impl Meta {
    /// Metadata of a pristine, never stepped instance
    pub fn new(id: impl Into<String>, workflow: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            workflow: workflow.into(),
            pc: 0,
            status: WorkflowStatus::Running,
        }
    }

    /// Whether the interpreter has marked the instance as finished
    pub fn is_finished(&self) -> bool {
        self.status == WorkflowStatus::Finished
    }
}
