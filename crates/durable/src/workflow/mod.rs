//! Workflow abstractions and types
//!
//! This module contains the interpreter-facing primitives:
//! - [`Workflow`] trait implemented by every workflow state type
//! - [`Meta`] record persisted next to the opaque state
//! - [`CallbackRequest`] identifying a wait the workflow is suspended on

mod callback;
mod definition;
mod meta;

pub use callback::CallbackRequest;
pub use definition::{InterpreterError, Workflow, WorkflowContext};
pub use meta::{Meta, WorkflowStatus};
