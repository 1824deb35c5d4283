//! Workflow registry for type-erased workflow hydration
//!
//! The registry maps workflow type names to constructors that produce a
//! fresh, strongly typed state value and decode persisted JSON state into
//! it, so the coordinator never needs to know the concrete types.

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use serde_json::Value;

use crate::workflow::{CallbackRequest, InterpreterError, Meta, Workflow, WorkflowContext};

/// Type-erased workflow interface
///
/// This trait allows the coordinator to drive workflows without knowing
/// their concrete types. Inputs, outputs and state are JSON.
#[async_trait]
pub trait AnyWorkflow: Send + Sync {
    /// Get the workflow type identifier
    fn workflow_type(&self) -> &'static str;

    /// Encode the current state for persistence
    fn state_json(&self) -> Result<Value, serde_json::Error>;

    async fn resume(
        &mut self,
        ctx: &WorkflowContext<'_>,
        meta: &mut Meta,
    ) -> Result<usize, InterpreterError>;

    async fn handle_event(
        &mut self,
        ctx: &WorkflowContext<'_>,
        meta: &mut Meta,
        event: &str,
        input: Value,
    ) -> Result<Value, InterpreterError>;

    async fn handle_callback(
        &mut self,
        ctx: &WorkflowContext<'_>,
        meta: &mut Meta,
        request: &CallbackRequest,
        input: Value,
    ) -> Result<Value, InterpreterError>;
}

/// Wrapper to implement AnyWorkflow for any Workflow
struct WorkflowWrapper<W: Workflow> {
    inner: W,
}

#[async_trait]
impl<W: Workflow> AnyWorkflow for WorkflowWrapper<W> {
    fn workflow_type(&self) -> &'static str {
        W::TYPE
    }

    fn state_json(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(&self.inner)
    }

    async fn resume(
        &mut self,
        ctx: &WorkflowContext<'_>,
        meta: &mut Meta,
    ) -> Result<usize, InterpreterError> {
        self.inner.resume(ctx, meta).await
    }

    async fn handle_event(
        &mut self,
        ctx: &WorkflowContext<'_>,
        meta: &mut Meta,
        event: &str,
        input: Value,
    ) -> Result<Value, InterpreterError> {
        self.inner.handle_event(ctx, meta, event, input).await
    }

    async fn handle_callback(
        &mut self,
        ctx: &WorkflowContext<'_>,
        meta: &mut Meta,
        request: &CallbackRequest,
        input: Value,
    ) -> Result<Value, InterpreterError> {
        self.inner.handle_callback(ctx, meta, request, input).await
    }
}

/// Constructor decoding persisted state (`null` means a fresh value)
pub type WorkflowFactory =
    Box<dyn Fn(Value) -> Result<Box<dyn AnyWorkflow>, serde_json::Error> + Send + Sync>;

/// Registry of workflow constructors keyed by type name
pub struct WorkflowRegistry {
    factories: HashMap<String, WorkflowFactory>,
}

impl Default for WorkflowRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkflowRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register a workflow type
    ///
    /// Persisted state is decoded with serde, so fields missing from older
    /// documents keep their defaults when the type is `#[serde(default)]`.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let mut registry = WorkflowRegistry::new();
    /// registry.register::<Checkout>();
    /// ```
    pub fn register<W: Workflow>(&mut self) {
        let factory: WorkflowFactory = Box::new(|state: Value| {
            let workflow = if state.is_null() {
                W::default()
            } else {
                serde_json::from_value::<W>(state)?
            };
            Ok(Box::new(WorkflowWrapper { inner: workflow }) as Box<dyn AnyWorkflow>)
        });

        self.factories.insert(W::TYPE.to_string(), factory);
    }

    /// A fresh, never stepped workflow of the given type
    pub fn fresh(&self, workflow_type: &str) -> Result<Box<dyn AnyWorkflow>, RegistryError> {
        self.hydrate(workflow_type, Value::Null)
    }

    /// Decode persisted `state` into the workflow type registered under `workflow_type`
    pub fn hydrate(
        &self,
        workflow_type: &str,
        state: Value,
    ) -> Result<Box<dyn AnyWorkflow>, RegistryError> {
        let factory = self
            .factories
            .get(workflow_type)
            .ok_or_else(|| RegistryError::UnknownWorkflowType(workflow_type.to_string()))?;

        factory(state).map_err(RegistryError::InvalidState)
    }

    /// Get all registered workflow type names
    pub fn workflow_types(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(|s| s.as_str())
    }
}

impl fmt::Debug for WorkflowRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowRegistry")
            .field("workflow_types", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Errors from registry operations
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// Workflow type not registered
    #[error("unknown workflow type: {0}")]
    UnknownWorkflowType(String),

    /// Persisted state does not match the registered type
    #[error("failed to decode workflow state: {0}")]
    InvalidState(#[source] serde_json::Error),
}
