//! # Durable Coordination Layer
//!
//! Runs suspendable workflow instances behind stateless, horizontally
//! replicated request handlers, on top of a document store without row
//! locks and an at-least-once task queue.
//!
//! ## Features
//!
//! - **Per-instance leases**: mutual exclusion across replicas through conditional updates on the instance document
//! - **Atomic checkpoints**: metadata and state are always written together, optionally releasing the lease in the same write
//! - **Signed callbacks**: resume and timeout tasks carry an HMAC tag verified before any state is touched
//! - **Redundant resume**: every event or callback schedules a fallback resume in case the inline one is lost
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Coordinator                           │
//! │  (lock → hydrate → invoke → save ∥ schedule → release)      │
//! └─────────────────────────────────────────────────────────────┘
//!            │                   │                    │
//!            ▼                   ▼                    ▼
//! ┌──────────────────┐ ┌──────────────────┐ ┌──────────────────┐
//! │   LeaseManager   │ │  CheckpointStore │ │  TaskScheduler   │
//! │ (lock_expiry CAS)│ │ (meta + state)   │ │ (Signer + queue) │
//! └──────────────────┘ └──────────────────┘ └──────────────────┘
//!            │                   │                    │
//!            ▼                   ▼                    ▼
//! ┌─────────────────────────────────────┐   ┌──────────────────┐
//! │            InstanceStore            │   │    TaskQueue     │
//! │    (PostgreSQL or in-memory)        │   │ (Cloud Tasks,    │
//! └─────────────────────────────────────┘   │  local, memory)  │
//!                                           └──────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use leaseflow_durable::prelude::*;
//!
//! #[derive(Default, Serialize, Deserialize)]
//! #[serde(default)]
//! struct Checkout {
//!     paid: bool,
//! }
//!
//! #[async_trait]
//! impl Workflow for Checkout {
//!     const TYPE: &'static str = "checkout";
//!
//!     async fn resume(&mut self, ctx: &WorkflowContext<'_>, meta: &mut Meta) -> Result<usize, InterpreterError> {
//!         // ... advance without input
//!     }
//!
//!     // ... handle_event, handle_callback
//! }
//!
//! let mut registry = WorkflowRegistry::new();
//! registry.register::<Checkout>();
//!
//! let scheduler = TaskScheduler::new(queue, Signer::new(secret)?, SchedulerConfig::from_base_url(url));
//! let coordinator = Coordinator::new(store, registry, scheduler);
//! coordinator.create("order-1", "checkout").await?;
//! ```

pub mod engine;
pub mod persistence;
pub mod scheduler;
pub mod workflow;

/// Prelude for common imports
pub mod prelude {
    pub use crate::engine::{Coordinator, CoordinatorConfig, CoordinatorError, WorkflowRegistry};
    pub use crate::persistence::{
        InMemoryInstanceStore, InstanceStore, LeaseConfig, PostgresInstanceStore, StoreError,
        WorkflowInstance,
    };
    pub use crate::scheduler::{
        InMemoryTaskQueue, ResumeRequest, SchedulerConfig, Signer, TaskQueue, TaskScheduler,
        TimeoutRequest,
    };
    pub use crate::workflow::{
        CallbackRequest, InterpreterError, Meta, Workflow, WorkflowContext, WorkflowStatus,
    };
}

// Re-export key types at crate root
pub use engine::{Coordinator, CoordinatorConfig, CoordinatorError, WorkflowRegistry};
pub use persistence::{
    CheckpointStore, InMemoryInstanceStore, InstanceStore, LeaseConfig, LeaseError, LeaseManager,
    PostgresInstanceStore, StoreError, WorkflowInstance, MAX_LEASE_DURATION,
};
pub use scheduler::{
    CloudTasksConfig, CloudTasksQueue, InMemoryTaskQueue, LocalTaskQueue, ResumeRequest,
    SchedulerConfig, SchedulerError, Signer, SignerError, TaskQueue, TaskScheduler,
    TimeoutRequest, TokenSource,
};
pub use workflow::{
    CallbackRequest, InterpreterError, Meta, Workflow, WorkflowContext, WorkflowStatus,
};
