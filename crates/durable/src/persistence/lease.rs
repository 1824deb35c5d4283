//! Per-instance leases stored on the instance document
//!
//! Replicas share no memory, so mutual exclusion is built on the store's
//! conditional update: read the document, and if its lease is free, write a
//! new expiry guarded by the version observed at read time. Losing that race
//! is ordinary contention and restarts the read-check-write sequence.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, SubsecRound, Utc};
use rand::Rng;
use tracing::{debug, warn};

use super::store::{InstanceStore, StoreError, WorkflowInstance};

/// Longest lease a holder may take
pub const MAX_LEASE_DURATION: Duration = Duration::from_secs(24 * 60 * 60);

/// Lease acquisition settings
#[derive(Debug, Clone, PartialEq)]
pub struct LeaseConfig {
    /// How long an acquired lease stays valid without being released,
    /// capped at [`MAX_LEASE_DURATION`]
    pub lease_duration: Duration,

    /// Maximum read-check-write attempts before giving up
    pub max_attempts: u32,

    /// Backoff increment; the wait before attempt `n + 1` is `n * backoff_step`
    pub backoff_step: Duration,

    /// Jitter factor (0.0-1.0) applied to each backoff
    pub jitter: f64,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            lease_duration: Duration::from_secs(60),
            max_attempts: 50,
            backoff_step: Duration::from_millis(100),
            jitter: 0.1,
        }
    }
}

impl LeaseConfig {
    pub fn with_lease_duration(mut self, duration: Duration) -> Self {
        self.lease_duration = duration.min(MAX_LEASE_DURATION);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_backoff_step(mut self, step: Duration) -> Self {
        self.backoff_step = step;
        self
    }

    /// Set the jitter factor (0.0-1.0)
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Wait before the attempt following `attempt` (1-based), growing linearly
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.backoff_step.as_secs_f64() * attempt as f64;

        let jittered = if self.jitter > 0.0 && base > 0.0 {
            let range = base * self.jitter;
            let offset = rand::thread_rng().gen_range(-range..range);
            (base + offset).max(0.0)
        } else {
            base
        };

        Duration::from_secs_f64(jittered)
    }

    /// Expiry of a lease taken at `now`, truncated to the microsecond
    /// precision stores keep
    fn expiry_from(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let duration =
            chrono::Duration::from_std(self.lease_duration.min(MAX_LEASE_DURATION)).ok()?;
        now.checked_add_signed(duration)
            .map(|expiry| expiry.trunc_subsecs(6))
    }
}

/// Errors from lease acquisition
#[derive(Debug, thiserror::Error)]
pub enum LeaseError {
    /// Lease stayed held by someone else for the whole retry budget
    #[error("workflow {id} is locked, gave up after {attempts} attempts")]
    Timeout { id: String, attempts: u32 },

    /// Lease expiry not representable as a timestamp
    #[error("lease of workflow {id} cannot expire {duration:?} from now")]
    ExpiryOutOfRange { id: String, duration: Duration },

    /// Store error
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Acquires and releases instance leases
pub struct LeaseManager<S: InstanceStore + ?Sized> {
    store: Arc<S>,
    config: LeaseConfig,
}

impl<S: InstanceStore + ?Sized> LeaseManager<S> {
    pub fn new(store: Arc<S>, config: LeaseConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &LeaseConfig {
        &self.config
    }

    /// Acquire the lease of instance `id`
    ///
    /// Retries while the lease is held by someone else or the conditional
    /// update loses a race, up to `max_attempts`. On `Timeout` nothing has
    /// been written.
    pub async fn lock(&self, id: &str) -> Result<Lease<S>, LeaseError> {
        let started = Instant::now();
        let mut attempt = 0;

        loop {
            attempt += 1;

            let doc = self.store.get(id).await?;
            let now = Utc::now();

            if doc.instance.is_locked_at(now) {
                if attempt >= self.config.max_attempts {
                    warn!(workflow_id = %id, attempts = attempt, "workflow is locked, giving up");
                    return Err(LeaseError::Timeout {
                        id: id.to_string(),
                        attempts: attempt,
                    });
                }
                debug!(workflow_id = %id, attempt, "workflow is locked, waiting and trying again");
                tokio::time::sleep(self.config.delay_for_attempt(attempt)).await;
                continue;
            }

            let expires_at =
                self.config
                    .expiry_from(now)
                    .ok_or_else(|| LeaseError::ExpiryOutOfRange {
                        id: id.to_string(),
                        duration: self.config.lease_duration,
                    })?;

            match self
                .store
                .set_lock_if_unchanged(id, doc.version, expires_at)
                .await
            {
                Ok(_) => {
                    debug!(
                        workflow_id = %id,
                        attempt,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "acquired lease"
                    );
                    let mut instance = doc.instance;
                    instance.lock_expiry = Some(expires_at);
                    return Ok(Lease {
                        instance,
                        expires_at,
                        store: Arc::clone(&self.store),
                        released: AtomicBool::new(false),
                    });
                }
                Err(StoreError::PreconditionFailed(_)) => {
                    if attempt >= self.config.max_attempts {
                        return Err(LeaseError::Timeout {
                            id: id.to_string(),
                            attempts: attempt,
                        });
                    }
                    debug!(workflow_id = %id, attempt, "workflow was locked concurrently, trying again");
                    tokio::task::yield_now().await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Unconditionally clear the lease of instance `id`
    pub async fn unlock(&self, id: &str) -> Result<(), StoreError> {
        let started = Instant::now();
        self.store.clear_lock(id).await?;
        debug!(
            workflow_id = %id,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "released lease"
        );
        Ok(())
    }
}

/// A held lease together with the snapshot read while acquiring it
///
/// Call [`Lease::release`] on every path that does not release the lease
/// through a checkpoint. A lease dropped while still held (cancelled
/// request, panic) spawns a best-effort unlock on the current runtime; if
/// that fails too the lease simply expires.
///
/// Both unlock paths only clear the lease while it still carries this
/// holder's expiry, so a late release never frees a lease someone else
/// has taken since.
pub struct Lease<S: InstanceStore + ?Sized> {
    instance: WorkflowInstance,
    expires_at: DateTime<Utc>,
    store: Arc<S>,
    released: AtomicBool,
}

impl<S: InstanceStore + ?Sized> Lease<S> {
    pub fn id(&self) -> &str {
        self.instance.id()
    }

    /// Snapshot of the instance as read under the lease
    pub fn instance(&self) -> &WorkflowInstance {
        &self.instance
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    /// Record that the lease was cleared by a checkpoint write
    ///
    /// Takes `&self` so it can be called the moment the write commits,
    /// while other work still borrows the lease.
    pub fn mark_released(&self) {
        self.released.store(true, Ordering::SeqCst);
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    /// Clear the lease if this holder still owns it
    pub async fn release(self) -> Result<(), StoreError> {
        self.released.store(true, Ordering::SeqCst);
        let cleared = self
            .store
            .clear_lock_if_held(self.instance.id(), self.expires_at)
            .await?;
        if !cleared {
            debug!(workflow_id = %self.id(), "lease already released or taken over");
        }
        Ok(())
    }
}

impl<S: InstanceStore + ?Sized> Drop for Lease<S> {
    fn drop(&mut self) {
        if self.is_released() {
            return;
        }

        let id = self.instance.id().to_string();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!(workflow_id = %id, "lease dropped while held, releasing in background");
                let store = Arc::clone(&self.store);
                let expires_at = self.expires_at;
                handle.spawn(async move {
                    if let Err(e) = store.clear_lock_if_held(&id, expires_at).await {
                        warn!(workflow_id = %id, error = %e, "background lease release failed");
                    }
                });
            }
            Err(_) => {
                warn!(workflow_id = %id, "lease dropped outside a runtime, it will expire on its own");
            }
        }
    }
}
