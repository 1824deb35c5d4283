//! InstanceStore trait definition

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::workflow::{CallbackRequest, Meta};

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Instance document not found
    #[error("workflow not found: {0}")]
    NotFound(String),

    /// Instance document already exists
    #[error("workflow already exists: {0}")]
    AlreadyExists(String),

    /// Conditional update rejected, the document changed since it was read
    #[error("workflow {0} was modified concurrently")]
    PreconditionFailed(String),

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// One workflow instance document
///
/// `meta` and `state` are only ever written together. `lock_expiry` is the
/// lease: `None` means unlocked, and a lease in the past is abandoned and
/// free to take.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowInstance {
    pub meta: Meta,

    /// Opaque interpreter state
    pub state: Value,

    pub lock_expiry: Option<DateTime<Utc>>,
}

impl WorkflowInstance {
    /// An unlocked instance
    pub fn new(meta: Meta, state: Value) -> Self {
        Self {
            meta,
            state,
            lock_expiry: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.meta.id
    }

    /// Whether a live lease is held at `now`
    pub fn is_locked_at(&self, now: DateTime<Utc>) -> bool {
        self.lock_expiry.is_some_and(|expiry| expiry > now)
    }
}

/// A document together with the store version observed when reading it
///
/// The version plays the role of a last-update timestamp: every write bumps
/// it, and conditional updates are guarded by it.
#[derive(Debug, Clone)]
pub struct VersionedInstance {
    pub instance: WorkflowInstance,
    pub version: u64,
}

/// Diagnostic record of a single transition, keyed by `(workflow_id, pc)`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub workflow_id: String,
    pub pc: u64,
    pub meta: Meta,
    pub state: Value,
    pub recorded_at: DateTime<Utc>,
    pub exec_duration_ms: u64,
    pub input: Option<Value>,
    pub output: Option<Value>,
    pub callback: Option<CallbackRequest>,
}

/// A single atomic write of metadata and state
#[derive(Debug, Clone)]
pub struct Checkpoint {
    pub meta: Meta,
    pub state: Value,

    /// Clear the lease in the same write
    pub release_lock: bool,

    /// Optional transition log entry written in the same write
    pub transition: Option<TransitionRecord>,
}

/// Document store holding one record per workflow instance
///
/// Implementations must be safe to share between concurrent requests and
/// between replicas: `set_lock_if_unchanged` is the only synchronization
/// primitive the coordination layer relies on.
#[async_trait]
pub trait InstanceStore: Send + Sync + 'static {
    /// Create the instance document, failing with `AlreadyExists` if the id is taken
    async fn create(&self, instance: &WorkflowInstance) -> Result<(), StoreError>;

    /// Read the instance document and its current version
    async fn get(&self, id: &str) -> Result<VersionedInstance, StoreError>;

    /// Set the lease expiry only if the document is still at `expected_version`
    ///
    /// Returns the new version. Fails with `PreconditionFailed` when another
    /// writer got there first.
    async fn set_lock_if_unchanged(
        &self,
        id: &str,
        expected_version: u64,
        lock_expiry: DateTime<Utc>,
    ) -> Result<u64, StoreError>;

    /// Unconditionally clear the lease
    async fn clear_lock(&self, id: &str) -> Result<(), StoreError>;

    /// Clear the lease only while it still expires at `lock_expiry`
    ///
    /// Returns false, writing nothing, when the lease was released or taken
    /// over by another holder in the meantime.
    async fn clear_lock_if_held(
        &self,
        id: &str,
        lock_expiry: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Atomically write metadata and state (and optionally release the lease)
    async fn checkpoint(&self, id: &str, checkpoint: Checkpoint) -> Result<(), StoreError>;

    /// Load the transition log of an instance, ordered by program counter
    async fn transitions(&self, _id: &str) -> Result<Vec<TransitionRecord>, StoreError> {
        Ok(vec![])
    }
}
