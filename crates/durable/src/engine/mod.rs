//! Workflow coordination engine
//!
//! The engine module provides the `Coordinator`, which runs workflow entry
//! points under an instance lease and persists their results, and the
//! `WorkflowRegistry` it hydrates workflow state with.

mod coordinator;
mod registry;

pub use coordinator::{Coordinator, CoordinatorConfig, CoordinatorError};
pub use registry::{AnyWorkflow, RegistryError, WorkflowFactory, WorkflowRegistry};
