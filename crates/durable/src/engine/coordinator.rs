//! Coordination engine
//!
//! The `Coordinator` is the only component that mutates instance state.
//! Every mutating operation runs the same sequence:
//!
//! ```text
//!   Acquire ──► Hydrate ──► Invoke ──► Persist ∥ Reschedule ──► done
//!      │           │           │            │
//!      └───────────┴───────────┴────────────┴──► Release (every path)
//! ```
//!
//! A successful checkpoint releases the lease in the same write; every other
//! exit path releases it explicitly.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, info, instrument, warn, Span};

use crate::persistence::{
    CheckpointStore, InstanceStore, Lease, LeaseConfig, LeaseError, LeaseManager, StoreError,
    TransitionRecord, WorkflowInstance,
};
use crate::scheduler::{ResumeRequest, TaskScheduler, TimeoutRequest};
use crate::workflow::{CallbackRequest, InterpreterError, Meta, WorkflowContext};

use super::registry::{RegistryError, WorkflowRegistry};

/// Configuration for the coordinator
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Delay of the fallback resume task scheduled after events and callbacks
    pub resume_delay: Duration,

    /// Write a transition log record with every checkpoint
    pub record_transitions: bool,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            resume_delay: Duration::from_millis(100),
            record_transitions: false,
        }
    }
}

impl CoordinatorConfig {
    pub fn with_resume_delay(mut self, delay: Duration) -> Self {
        self.resume_delay = delay;
        self
    }

    pub fn with_record_transitions(mut self, record: bool) -> Self {
        self.record_transitions = record;
        self
    }
}

/// Errors from coordinator operations
#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    /// Lease stayed held for the whole retry budget
    #[error("workflow {id} is locked (gave up after {attempts} attempts)")]
    LockTimeout { id: String, attempts: u32 },

    /// No workflow registered under this type name
    #[error("unknown workflow type: {0}")]
    UnknownWorkflowType(String),

    /// Persisted state cannot be decoded into the registered type
    #[error("invalid state of workflow {id}: {message}")]
    InvalidState { id: String, message: String },

    /// Workflow entry point failed
    #[error("workflow {id}: {source}")]
    Interpreter {
        id: String,
        #[source]
        source: InterpreterError,
    },

    /// Store read or write failed
    #[error("persistence error: {0}")]
    Persistence(StoreError),

    /// Callback signature did not match
    #[error("signature invalid")]
    SignatureInvalid,

    #[error("workflow already exists: {0}")]
    AlreadyExists(String),

    #[error("workflow not found: {0}")]
    NotFound(String),
}

impl CoordinatorError {
    /// Whether the caller may retry the same request
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::LockTimeout { .. } | Self::Persistence(_) => true,
            Self::Interpreter { source, .. } => source.is_retryable(),
            _ => false,
        }
    }

    /// The interpreter's validation error, if this is caller error
    pub fn validation(&self) -> Option<(&str, &str)> {
        match self {
            Self::Interpreter {
                source: InterpreterError::Validation { path, message },
                ..
            } => Some((path, message)),
            _ => None,
        }
    }

    fn from_registry(id: &str, err: RegistryError) -> Self {
        match err {
            RegistryError::UnknownWorkflowType(name) => Self::UnknownWorkflowType(name),
            RegistryError::InvalidState(e) => Self::InvalidState {
                id: id.to_string(),
                message: e.to_string(),
            },
        }
    }
}

impl From<StoreError> for CoordinatorError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => Self::NotFound(id),
            StoreError::AlreadyExists(id) => Self::AlreadyExists(id),
            other => Self::Persistence(other),
        }
    }
}

impl From<LeaseError> for CoordinatorError {
    fn from(err: LeaseError) -> Self {
        match err {
            LeaseError::Timeout { id, attempts } => Self::LockTimeout { id, attempts },
            LeaseError::Store(e) => e.into(),
            other @ LeaseError::ExpiryOutOfRange { .. } => {
                Self::Persistence(StoreError::Database(other.to_string()))
            }
        }
    }
}

/// Which interpreter entry point a locked run invokes
enum Invocation<'a> {
    Resume,
    Event { name: &'a str, input: Value },
    Callback { request: &'a CallbackRequest, input: Value },
}

impl Invocation<'_> {
    /// Events and callbacks leave work behind; a resume only finishes it
    fn reschedules(&self) -> bool {
        !matches!(self, Self::Resume)
    }

    fn input(&self) -> Option<Value> {
        match self {
            Self::Resume => None,
            Self::Event { input, .. } | Self::Callback { input, .. } => Some(input.clone()),
        }
    }

    fn callback(&self) -> Option<CallbackRequest> {
        match self {
            Self::Callback { request, .. } => Some((*request).clone()),
            _ => None,
        }
    }
}

enum Outcome {
    Steps(usize),
    Output(Value),
}

impl Outcome {
    fn to_json(&self) -> Value {
        match self {
            Self::Steps(n) => Value::from(*n),
            Self::Output(v) => v.clone(),
        }
    }
}

/// Coordinates workflow instances over a shared store and task queue
///
/// # Example
///
/// ```ignore
/// use leaseflow_durable::prelude::*;
///
/// let mut registry = WorkflowRegistry::new();
/// registry.register::<Checkout>();
///
/// let coordinator = Coordinator::new(store, registry, scheduler);
/// coordinator.create("order-1", "checkout").await?;
/// coordinator.handle_event("order-1", "pay", json!({"amount": 10})).await?;
/// ```
pub struct Coordinator<S: InstanceStore + ?Sized> {
    leases: LeaseManager<S>,
    checkpoints: CheckpointStore<S>,
    scheduler: TaskScheduler,
    registry: Arc<WorkflowRegistry>,
    config: CoordinatorConfig,
}

impl<S: InstanceStore + ?Sized> Coordinator<S> {
    /// Create a coordinator with default lease and coordinator settings
    pub fn new(store: Arc<S>, registry: WorkflowRegistry, scheduler: TaskScheduler) -> Self {
        Self {
            leases: LeaseManager::new(Arc::clone(&store), LeaseConfig::default()),
            checkpoints: CheckpointStore::new(store),
            scheduler,
            registry: Arc::new(registry),
            config: CoordinatorConfig::default(),
        }
    }

    pub fn with_lease_config(mut self, config: LeaseConfig) -> Self {
        self.leases = LeaseManager::new(Arc::clone(self.checkpoints.inner()), config);
        self
    }

    pub fn with_config(mut self, config: CoordinatorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn registry(&self) -> &WorkflowRegistry {
        &self.registry
    }

    pub fn scheduler(&self) -> &TaskScheduler {
        &self.scheduler
    }

    pub fn checkpoints(&self) -> &CheckpointStore<S> {
        &self.checkpoints
    }

    /// Create instance `id` of `workflow_type`
    ///
    /// The initial resume runs before the document exists, so a created
    /// instance is never observed un-stepped.
    #[instrument(skip(self), fields(workflow_id = %id))]
    pub async fn create(
        &self,
        id: &str,
        workflow_type: &str,
    ) -> Result<WorkflowInstance, CoordinatorError> {
        let mut workflow = self
            .registry
            .fresh(workflow_type)
            .map_err(|e| CoordinatorError::from_registry(id, e))?;

        // Taken ids fail before the interpreter arms any timers
        match self.checkpoints.get(id).await {
            Ok(_) => return Err(CoordinatorError::AlreadyExists(id.to_string())),
            Err(StoreError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }

        let mut meta = Meta::new(id, workflow_type);
        let ctx = WorkflowContext::new(&self.scheduler);
        let steps = workflow
            .resume(&ctx, &mut meta)
            .await
            .map_err(|source| CoordinatorError::Interpreter {
                id: id.to_string(),
                source,
            })?;

        let state = workflow
            .state_json()
            .map_err(|e| CoordinatorError::InvalidState {
                id: id.to_string(),
                message: e.to_string(),
            })?;

        let instance = self.checkpoints.create(meta, state).await?;
        info!(workflow_type = %workflow_type, steps, pc = instance.meta.pc, "created workflow");
        Ok(instance)
    }

    /// Latest snapshot of instance `id`, without locking
    pub async fn get(&self, id: &str) -> Result<WorkflowInstance, CoordinatorError> {
        Ok(self.checkpoints.get(id).await?.instance)
    }

    /// Deliver external event `event` to instance `id`
    #[instrument(skip(self, input), fields(workflow_id = %id, workflow_type = tracing::field::Empty))]
    pub async fn handle_event(
        &self,
        id: &str,
        event: &str,
        input: Value,
    ) -> Result<Value, CoordinatorError> {
        match self
            .run(id, Invocation::Event { name: event, input })
            .await?
        {
            Outcome::Output(output) => Ok(output),
            Outcome::Steps(_) => Ok(Value::Null),
        }
    }

    /// Deliver callback `request` to instance `id`
    #[instrument(skip(self, request, input), fields(workflow_id = %id, callback = %request.name, workflow_type = tracing::field::Empty))]
    pub async fn handle_callback(
        &self,
        id: &str,
        request: &CallbackRequest,
        input: Value,
    ) -> Result<Value, CoordinatorError> {
        match self
            .run(id, Invocation::Callback { request, input })
            .await?
        {
            Outcome::Output(output) => Ok(output),
            Outcome::Steps(_) => Ok(Value::Null),
        }
    }

    /// Advance instance `id` as far as it goes without input
    ///
    /// Unlike events and callbacks this schedules no fallback resume, so
    /// redundant resume tasks die out instead of chaining.
    #[instrument(skip(self), fields(workflow_id = %id, workflow_type = tracing::field::Empty))]
    pub async fn resume(&self, id: &str) -> Result<usize, CoordinatorError> {
        match self.run(id, Invocation::Resume).await? {
            Outcome::Steps(steps) => Ok(steps),
            Outcome::Output(_) => Ok(0),
        }
    }

    /// Queue-delivered resume; the signature is checked before any store access
    pub async fn resume_callback(&self, request: &ResumeRequest) -> Result<usize, CoordinatorError> {
        if !self.scheduler.verify_resume(request) {
            warn!(workflow_id = %request.id, "rejected resume with invalid signature");
            return Err(CoordinatorError::SignatureInvalid);
        }
        self.resume(&request.id).await
    }

    /// Queue-delivered timeout; the signature is checked before any store access
    pub async fn timeout_callback(
        &self,
        request: &TimeoutRequest,
    ) -> Result<Value, CoordinatorError> {
        if !self.scheduler.verify_timeout(request) {
            warn!(
                workflow_id = %request.req.workflow_id,
                callback = %request.req.name,
                "rejected timeout with invalid signature"
            );
            return Err(CoordinatorError::SignatureInvalid);
        }
        self.handle_callback(&request.req.workflow_id, &request.req, Value::Null)
            .await
    }

    async fn run(
        &self,
        id: &str,
        invocation: Invocation<'_>,
    ) -> Result<Outcome, CoordinatorError> {
        let started = Instant::now();

        // Acquire
        let lease = self.leases.lock(id).await?;
        let locked_ms = started.elapsed().as_millis() as u64;
        let mut meta = lease.instance().meta.clone();
        Span::current().record("workflow_type", meta.workflow.as_str());

        // Hydrate
        let mut workflow = match self
            .registry
            .hydrate(&meta.workflow, lease.instance().state.clone())
        {
            Ok(workflow) => workflow,
            Err(e) => {
                self.release(lease).await;
                return Err(CoordinatorError::from_registry(id, e));
            }
        };

        // Invoke
        let ctx = WorkflowContext::new(&self.scheduler);
        let invoked = Instant::now();
        let result = match &invocation {
            Invocation::Resume => workflow.resume(&ctx, &mut meta).await.map(Outcome::Steps),
            Invocation::Event { name, input } => workflow
                .handle_event(&ctx, &mut meta, name, input.clone())
                .await
                .map(Outcome::Output),
            Invocation::Callback { request, input } => workflow
                .handle_callback(&ctx, &mut meta, request, input.clone())
                .await
                .map(Outcome::Output),
        };
        let exec_duration_ms = invoked.elapsed().as_millis() as u64;

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(source) => {
                debug!(error = %source, "workflow returned an error");
                self.release(lease).await;
                return Err(CoordinatorError::Interpreter {
                    id: id.to_string(),
                    source,
                });
            }
        };

        let state = match workflow.state_json() {
            Ok(state) => state,
            Err(e) => {
                self.release(lease).await;
                return Err(CoordinatorError::InvalidState {
                    id: id.to_string(),
                    message: e.to_string(),
                });
            }
        };

        // Persist and reschedule concurrently. The checkpoint clears the lock,
        // so the lease is given up as soon as it commits.
        let save = async {
            let saved = if self.config.record_transitions {
                let record = TransitionRecord {
                    workflow_id: id.to_string(),
                    pc: meta.pc,
                    meta: meta.clone(),
                    state: state.clone(),
                    recorded_at: Utc::now(),
                    exec_duration_ms,
                    input: invocation.input(),
                    output: Some(outcome.to_json()),
                    callback: invocation.callback(),
                };
                self.checkpoints
                    .save_with_transition(&meta, state, true, record)
                    .await
            } else {
                self.checkpoints.save(&meta, state, true).await
            };
            if saved.is_ok() {
                lease.mark_released();
            }
            saved
        };
        let schedule = async {
            if invocation.reschedules() {
                self.scheduler.schedule(id, self.config.resume_delay).await
            } else {
                Ok(())
            }
        };
        let (saved, scheduled) = tokio::join!(save, schedule);

        if let Err(e) = scheduled {
            warn!(error = %e, "failed to schedule fallback resume");
        }

        match saved {
            Ok(()) => {
                debug!(
                    pc = meta.pc,
                    status = %meta.status,
                    locked_ms,
                    exec_duration_ms,
                    total_ms = started.elapsed().as_millis() as u64,
                    "checkpoint saved, lease released"
                );
                Ok(outcome)
            }
            Err(e) => {
                warn!(error = %e, "failed to save checkpoint");
                self.release(lease).await;
                Err(e.into())
            }
        }
    }

    async fn release(&self, lease: Lease<S>) {
        let id = lease.id().to_string();
        if let Err(e) = lease.release().await {
            // The lease expires on its own
            warn!(workflow_id = %id, error = %e, "failed to release lease");
        }
    }
}
