//! Persistence layer for suspendable workflows
//!
//! This module provides:
//! - [`InstanceStore`] trait for instance documents with conditional updates
//! - [`InMemoryInstanceStore`] for testing
//! - [`PostgresInstanceStore`] for production
//! - [`LeaseManager`] for per-instance mutual exclusion across replicas
//! - [`CheckpointStore`] for atomic metadata and state writes

mod checkpoint;
mod lease;
mod memory;
mod postgres;
mod store;

pub use checkpoint::CheckpointStore;
pub use lease::{Lease, LeaseConfig, LeaseError, LeaseManager, MAX_LEASE_DURATION};
pub use memory::InMemoryInstanceStore;
pub use postgres::PostgresInstanceStore;
pub use store::{
    Checkpoint, InstanceStore, StoreError, TransitionRecord, VersionedInstance, WorkflowInstance,
};
