//! Checkpoint store: atomic metadata + state writes over an InstanceStore

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, instrument};

use super::store::{
    Checkpoint, InstanceStore, StoreError, TransitionRecord, VersionedInstance, WorkflowInstance,
};
use crate::workflow::Meta;

/// Durable storage of instance snapshots
///
/// Metadata and state are only ever written together. `save` may clear the
/// lease in the same write, which is how a request that finishes its work
/// hands the instance back without a second round-trip.
pub struct CheckpointStore<S: InstanceStore + ?Sized> {
    store: Arc<S>,
}

impl<S: InstanceStore + ?Sized> Clone for CheckpointStore<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

impl<S: InstanceStore + ?Sized> CheckpointStore<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub fn inner(&self) -> &Arc<S> {
        &self.store
    }

    /// Persist `meta` and `state` of an existing instance
    #[instrument(skip(self, meta, state), fields(workflow_id = %meta.id, pc = meta.pc))]
    pub async fn save(
        &self,
        meta: &Meta,
        state: Value,
        release_lock: bool,
    ) -> Result<(), StoreError> {
        self.write(meta, state, release_lock, None).await
    }

    /// Persist a snapshot together with its transition log entry
    pub async fn save_with_transition(
        &self,
        meta: &Meta,
        state: Value,
        release_lock: bool,
        transition: TransitionRecord,
    ) -> Result<(), StoreError> {
        self.write(meta, state, release_lock, Some(transition)).await
    }

    async fn write(
        &self,
        meta: &Meta,
        state: Value,
        release_lock: bool,
        transition: Option<TransitionRecord>,
    ) -> Result<(), StoreError> {
        self.store
            .checkpoint(
                &meta.id,
                Checkpoint {
                    meta: meta.clone(),
                    state,
                    release_lock,
                    transition,
                },
            )
            .await?;
        debug!(release_lock, "checkpoint written");
        Ok(())
    }

    /// Read the latest snapshot, lease included
    pub async fn get(&self, id: &str) -> Result<VersionedInstance, StoreError> {
        self.store.get(id).await
    }

    /// Create a new unlocked instance; fails with `AlreadyExists` on a taken id
    pub async fn create(&self, meta: Meta, state: Value) -> Result<WorkflowInstance, StoreError> {
        let instance = WorkflowInstance::new(meta, state);
        self.store.create(&instance).await?;
        debug!(workflow_id = %instance.id(), workflow_type = %instance.meta.workflow, "created instance");
        Ok(instance)
    }

    pub async fn transitions(&self, id: &str) -> Result<Vec<TransitionRecord>, StoreError> {
        self.store.transitions(id).await
    }
}
