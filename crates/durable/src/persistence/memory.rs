//! In-memory implementation of InstanceStore for testing

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use super::store::*;

/// Stored document plus its version counter
struct Document {
    instance: WorkflowInstance,
    version: u64,
}

/// In-memory implementation of InstanceStore
///
/// This is primarily for testing and single-replica development. It
/// provides the same conditional-update semantics as the PostgreSQL
/// implementation: every write bumps the document version.
///
/// # Example
///
/// ```
/// use leaseflow_durable::InMemoryInstanceStore;
///
/// let store = InMemoryInstanceStore::new();
/// assert_eq!(store.instance_count(), 0);
/// ```
pub struct InMemoryInstanceStore {
    documents: RwLock<HashMap<String, Document>>,
    transitions: RwLock<HashMap<String, BTreeMap<u64, TransitionRecord>>>,
}

impl InMemoryInstanceStore {
    /// Create a new in-memory store
    pub fn new() -> Self {
        Self {
            documents: RwLock::new(HashMap::new()),
            transitions: RwLock::new(HashMap::new()),
        }
    }

    /// Get the number of instances
    pub fn instance_count(&self) -> usize {
        self.documents.read().len()
    }

    /// Move a held lease `by` into the past, as if its holder had vanished
    /// and the lease duration had elapsed
    pub fn backdate_lock(&self, id: &str, by: Duration) {
        let mut documents = self.documents.write();
        if let Some(doc) = documents.get_mut(id) {
            if let Some(expiry) = doc.instance.lock_expiry {
                let by = chrono::Duration::from_std(by).unwrap_or_default();
                doc.instance.lock_expiry = Some(expiry - by);
                doc.version += 1;
            }
        }
    }

    /// Clear all data (for testing)
    pub fn clear(&self) {
        self.documents.write().clear();
        self.transitions.write().clear();
    }
}

impl Default for InMemoryInstanceStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl InstanceStore for InMemoryInstanceStore {
    async fn create(&self, instance: &WorkflowInstance) -> Result<(), StoreError> {
        let mut documents = self.documents.write();
        if documents.contains_key(instance.id()) {
            return Err(StoreError::AlreadyExists(instance.id().to_string()));
        }

        documents.insert(
            instance.id().to_string(),
            Document {
                instance: instance.clone(),
                version: 1,
            },
        );
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<VersionedInstance, StoreError> {
        let documents = self.documents.read();
        documents
            .get(id)
            .map(|doc| VersionedInstance {
                instance: doc.instance.clone(),
                version: doc.version,
            })
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn set_lock_if_unchanged(
        &self,
        id: &str,
        expected_version: u64,
        lock_expiry: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let mut documents = self.documents.write();
        let doc = documents
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

        if doc.version != expected_version {
            return Err(StoreError::PreconditionFailed(id.to_string()));
        }

        doc.instance.lock_expiry = Some(lock_expiry);
        doc.version += 1;
        Ok(doc.version)
    }

    async fn clear_lock(&self, id: &str) -> Result<(), StoreError> {
        let mut documents = self.documents.write();
        let doc = documents
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

        doc.instance.lock_expiry = None;
        doc.version += 1;
        Ok(())
    }

    async fn clear_lock_if_held(
        &self,
        id: &str,
        lock_expiry: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut documents = self.documents.write();
        let doc = documents
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

        if doc.instance.lock_expiry != Some(lock_expiry) {
            return Ok(false);
        }

        doc.instance.lock_expiry = None;
        doc.version += 1;
        Ok(true)
    }

    async fn checkpoint(&self, id: &str, checkpoint: Checkpoint) -> Result<(), StoreError> {
        // Hold both locks so the document and its log entry appear together
        let mut documents = self.documents.write();
        let mut transitions = self.transitions.write();

        let doc = documents
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

        doc.instance.meta = checkpoint.meta;
        doc.instance.state = checkpoint.state;
        if checkpoint.release_lock {
            doc.instance.lock_expiry = None;
        }
        doc.version += 1;

        if let Some(record) = checkpoint.transition {
            transitions
                .entry(id.to_string())
                .or_default()
                .insert(record.pc, record);
        }
        Ok(())
    }

    async fn transitions(&self, id: &str) -> Result<Vec<TransitionRecord>, StoreError> {
        let transitions = self.transitions.read();
        Ok(transitions
            .get(id)
            .map(|log| log.values().cloned().collect())
            .unwrap_or_default())
    }
}
