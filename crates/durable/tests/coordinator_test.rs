//! End-to-end tests of the coordinator over the in-memory store and queue
//!
//! Run with: cargo test -p leaseflow-durable --test coordinator_test

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use leaseflow_durable::persistence::{Checkpoint, LeaseError, LeaseManager, VersionedInstance};
use leaseflow_durable::prelude::*;
use leaseflow_durable::scheduler::QueuedTask;
use leaseflow_durable::SchedulerError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum Stage {
    #[default]
    New,
    AwaitingPayment,
    Paid,
    Completed,
    Cancelled,
}

/// Order checkout: waits for a payment with a deadline
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct Checkout {
    stage: Stage,
    payments: u32,
    amount: i64,
    deadline: Option<CallbackRequest>,
}

#[async_trait]
impl Workflow for Checkout {
    const TYPE: &'static str = "checkout";

    async fn resume(
        &mut self,
        ctx: &WorkflowContext<'_>,
        meta: &mut Meta,
    ) -> Result<usize, InterpreterError> {
        match self.stage {
            Stage::New => {
                let request = CallbackRequest::new(&meta.id, meta.pc, "payment_deadline", "main");
                let handle = ctx
                    .setup_timeout(&request, Duration::from_secs(3600))
                    .await?;
                self.deadline = Some(request.with_setup_data(handle));
                self.stage = Stage::AwaitingPayment;
                meta.pc += 1;
                Ok(1)
            }
            Stage::Paid => {
                self.stage = Stage::Completed;
                meta.status = WorkflowStatus::Finished;
                meta.pc += 1;
                Ok(1)
            }
            _ => Ok(0),
        }
    }

    async fn handle_event(
        &mut self,
        ctx: &WorkflowContext<'_>,
        meta: &mut Meta,
        event: &str,
        input: Value,
    ) -> Result<Value, InterpreterError> {
        if event != "pay" {
            return Err(InterpreterError::validation("event", "unknown event"));
        }
        if self.stage != Stage::AwaitingPayment {
            return Ok(json!({ "status": "ignored", "stage": self.stage }));
        }

        let amount = input["amount"]
            .as_i64()
            .filter(|amount| *amount > 0)
            .ok_or_else(|| InterpreterError::validation("amount", "must be a positive integer"))?;

        if let Some(deadline) = &self.deadline {
            ctx.teardown_timeout(deadline, false).await?;
        }
        self.stage = Stage::Paid;
        self.amount = amount;
        self.payments += 1;
        meta.pc += 1;
        Ok(json!({ "status": "paid", "amount": amount }))
    }

    async fn handle_callback(
        &mut self,
        _ctx: &WorkflowContext<'_>,
        meta: &mut Meta,
        request: &CallbackRequest,
        _input: Value,
    ) -> Result<Value, InterpreterError> {
        let expected = self
            .deadline
            .as_ref()
            .is_some_and(|d| d.name == request.name && d.pc == request.pc);
        if !expected || self.stage != Stage::AwaitingPayment {
            return Ok(json!({ "status": "ignored" }));
        }

        self.stage = Stage::Cancelled;
        meta.status = WorkflowStatus::Finished;
        meta.pc += 1;
        Ok(json!({ "status": "cancelled" }))
    }
}

/// Store whose checkpoint writes can be made to fail
struct FlakyStore {
    inner: InMemoryInstanceStore,
    fail_checkpoints: AtomicBool,
}

#[async_trait]
impl InstanceStore for FlakyStore {
    async fn create(&self, instance: &WorkflowInstance) -> Result<(), StoreError> {
        self.inner.create(instance).await
    }

    async fn get(&self, id: &str) -> Result<VersionedInstance, StoreError> {
        self.inner.get(id).await
    }

    async fn set_lock_if_unchanged(
        &self,
        id: &str,
        expected_version: u64,
        lock_expiry: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        self.inner
            .set_lock_if_unchanged(id, expected_version, lock_expiry)
            .await
    }

    async fn clear_lock(&self, id: &str) -> Result<(), StoreError> {
        self.inner.clear_lock(id).await
    }

    async fn clear_lock_if_held(
        &self,
        id: &str,
        lock_expiry: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        self.inner.clear_lock_if_held(id, lock_expiry).await
    }

    async fn checkpoint(&self, id: &str, checkpoint: Checkpoint) -> Result<(), StoreError> {
        if self.fail_checkpoints.load(Ordering::SeqCst) {
            return Err(StoreError::Database("connection reset".to_string()));
        }
        self.inner.checkpoint(id, checkpoint).await
    }
}

/// Queue whose enqueue never completes
struct HangingQueue;

#[async_trait]
impl TaskQueue for HangingQueue {
    async fn create_task(&self, _task: QueuedTask) -> Result<String, SchedulerError> {
        std::future::pending().await
    }

    async fn delete_task(&self, _name: &str) -> Result<(), SchedulerError> {
        Ok(())
    }
}

fn scheduler(queue: Arc<InMemoryTaskQueue>) -> TaskScheduler {
    TaskScheduler::new(
        queue,
        Signer::new("integration-secret").unwrap(),
        SchedulerConfig::from_base_url("https://wf.example.com"),
    )
}

fn coordinator<S: InstanceStore + ?Sized>(
    store: Arc<S>,
    queue: Arc<InMemoryTaskQueue>,
) -> Coordinator<S> {
    let mut registry = WorkflowRegistry::new();
    registry.register::<Checkout>();

    Coordinator::new(store, registry, scheduler(queue)).with_lease_config(
        LeaseConfig::default()
            .with_backoff_step(Duration::from_millis(5))
            .with_max_attempts(200),
    )
}

fn stage_of(instance: &WorkflowInstance) -> Stage {
    serde_json::from_value(instance.state["stage"].clone()).unwrap()
}

fn later() -> DateTime<Utc> {
    Utc::now() + chrono::Duration::hours(2)
}

#[test_log::test(tokio::test)]
async fn test_checkout_create_pay_complete() {
    let store = Arc::new(InMemoryInstanceStore::new());
    let queue = Arc::new(InMemoryTaskQueue::new());
    let coordinator = coordinator(store.clone(), queue.clone());

    let created = coordinator.create("order-1", "checkout").await.unwrap();
    assert_eq!(created.meta.pc, 1);
    assert_eq!(stage_of(&created), Stage::AwaitingPayment);
    assert!(created.lock_expiry.is_none());

    // The deadline was armed during the initial resume
    let (deadline_task, _) = queue.created()[0].clone();

    let output = coordinator
        .handle_event("order-1", "pay", json!({"amount": 42}))
        .await
        .unwrap();
    assert_eq!(output, json!({"status": "paid", "amount": 42}));
    assert_eq!(queue.deleted(), vec![deadline_task]);

    // Deliver the fallback resume the way the queue would
    let due = queue.take_due(later());
    assert_eq!(due.len(), 1);
    let resume: ResumeRequest = due[0].json().unwrap();
    assert_eq!(coordinator.resume_callback(&resume).await.unwrap(), 1);

    let done = coordinator.get("order-1").await.unwrap();
    assert_eq!(stage_of(&done), Stage::Completed);
    assert!(done.meta.is_finished());
    assert_eq!(done.meta.pc, 3);
    assert!(done.lock_expiry.is_none());

    // Redelivery of the same resume task is harmless
    assert_eq!(coordinator.resume_callback(&resume).await.unwrap(), 0);
    assert_eq!(coordinator.get("order-1").await.unwrap().meta.pc, 3);
}

#[test_log::test(tokio::test)]
async fn test_concurrent_payments_apply_once() {
    let store = Arc::new(InMemoryInstanceStore::new());
    let queue = Arc::new(InMemoryTaskQueue::new());
    let coordinator = Arc::new(coordinator(store.clone(), queue.clone()));
    coordinator.create("order-1", "checkout").await.unwrap();

    let pay = |amount: i64| {
        let coordinator = Arc::clone(&coordinator);
        tokio::spawn(async move {
            coordinator
                .handle_event("order-1", "pay", json!({ "amount": amount }))
                .await
        })
    };
    let (first, second) = tokio::join!(pay(10), pay(20));
    let mut outputs = vec![first.unwrap().unwrap(), second.unwrap().unwrap()];
    outputs.sort_by_key(|o| o["status"].as_str().unwrap_or_default().to_string());

    assert_eq!(outputs[0]["status"], "ignored");
    assert_eq!(outputs[0]["stage"], "paid");
    assert_eq!(outputs[1]["status"], "paid");

    let instance = coordinator.get("order-1").await.unwrap();
    assert_eq!(instance.state["payments"], 1);
    assert_eq!(instance.meta.pc, 2);
    assert_eq!(instance.state["amount"], outputs[1]["amount"]);
    assert!(instance.lock_expiry.is_none());
}

#[tokio::test]
async fn test_many_concurrent_events_never_interleave() {
    let store = Arc::new(InMemoryInstanceStore::new());
    let queue = Arc::new(InMemoryTaskQueue::new());
    let coordinator = Arc::new(coordinator(store.clone(), queue.clone()));
    coordinator.create("order-1", "checkout").await.unwrap();

    let handles: Vec<_> = (1..=8)
        .map(|amount| {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move {
                coordinator
                    .handle_event("order-1", "pay", json!({ "amount": amount }))
                    .await
            })
        })
        .collect();

    let mut paid = 0;
    for handle in handles {
        let output = handle.await.unwrap().unwrap();
        if output["status"] == "paid" {
            paid += 1;
        }
    }

    assert_eq!(paid, 1);
    assert_eq!(coordinator.get("order-1").await.unwrap().state["payments"], 1);
}

#[tokio::test]
async fn test_timeout_cancels_unpaid_order() {
    let store = Arc::new(InMemoryInstanceStore::new());
    let queue = Arc::new(InMemoryTaskQueue::new());
    let coordinator = coordinator(store.clone(), queue.clone());
    coordinator.create("order-1", "checkout").await.unwrap();

    let due = queue.take_due(later());
    assert_eq!(due.len(), 1);
    assert_eq!(due[0].url, "https://wf.example.com/callback/timeout");
    let timeout: TimeoutRequest = due[0].json().unwrap();

    let output = coordinator.timeout_callback(&timeout).await.unwrap();
    assert_eq!(output, json!({"status": "cancelled"}));

    let instance = coordinator.get("order-1").await.unwrap();
    assert_eq!(stage_of(&instance), Stage::Cancelled);
    assert!(instance.meta.is_finished());

    // A late payment no longer changes anything
    let output = coordinator
        .handle_event("order-1", "pay", json!({"amount": 5}))
        .await
        .unwrap();
    assert_eq!(output["status"], "ignored");
}

#[tokio::test]
async fn test_late_timeout_after_payment_is_ignored() {
    let store = Arc::new(InMemoryInstanceStore::new());
    let queue = Arc::new(InMemoryTaskQueue::new());
    let coordinator = coordinator(store.clone(), queue.clone());
    coordinator.create("order-1", "checkout").await.unwrap();

    // Capture the timeout before teardown deletes it, as a racing delivery would
    let timeout: TimeoutRequest = queue.created()[0].1.json().unwrap();
    coordinator
        .handle_event("order-1", "pay", json!({"amount": 1}))
        .await
        .unwrap();

    let output = coordinator.timeout_callback(&timeout).await.unwrap();
    assert_eq!(output, json!({"status": "ignored"}));
    assert_eq!(
        stage_of(&coordinator.get("order-1").await.unwrap()),
        Stage::Paid
    );
}

#[tokio::test]
async fn test_tampered_timeout_leaves_instance_untouched() {
    let store = Arc::new(InMemoryInstanceStore::new());
    let queue = Arc::new(InMemoryTaskQueue::new());
    let coordinator = coordinator(store.clone(), queue.clone());
    coordinator.create("order-1", "checkout").await.unwrap();
    let before = store.get("order-1").await.unwrap();

    let mut timeout: TimeoutRequest = queue.created()[0].1.json().unwrap();
    timeout.req.thread_id = "forged".to_string();

    let err = coordinator.timeout_callback(&timeout).await.unwrap_err();
    assert!(matches!(err, CoordinatorError::SignatureInvalid));

    // Not even the lease was touched
    let after = store.get("order-1").await.unwrap();
    assert_eq!(after.version, before.version);
    assert_eq!(after.instance, before.instance);
}

#[tokio::test]
async fn test_validation_error_keeps_waiting() {
    let store = Arc::new(InMemoryInstanceStore::new());
    let queue = Arc::new(InMemoryTaskQueue::new());
    let coordinator = coordinator(store.clone(), queue.clone());
    coordinator.create("order-1", "checkout").await.unwrap();

    let err = coordinator
        .handle_event("order-1", "pay", json!({"amount": -3}))
        .await
        .unwrap_err();
    assert_eq!(err.validation(), Some(("amount", "must be a positive integer")));

    let instance = coordinator.get("order-1").await.unwrap();
    assert_eq!(stage_of(&instance), Stage::AwaitingPayment);
    assert!(instance.lock_expiry.is_none());
    assert!(queue.deleted().is_empty());
}

#[tokio::test]
async fn test_create_fails_when_deadline_cannot_be_armed() {
    let store = Arc::new(InMemoryInstanceStore::new());
    let queue = Arc::new(InMemoryTaskQueue::new());
    let coordinator = coordinator(store.clone(), queue.clone());
    queue.set_fail_creates(true);

    let err = coordinator.create("order-1", "checkout").await.unwrap_err();
    assert!(matches!(err, CoordinatorError::Interpreter { .. }));
    assert!(err.is_retryable());
    assert_eq!(store.instance_count(), 0);
}

#[tokio::test]
async fn test_failed_fallback_schedule_is_tolerated() {
    let store = Arc::new(InMemoryInstanceStore::new());
    let queue = Arc::new(InMemoryTaskQueue::new());
    let coordinator = coordinator(store.clone(), queue.clone());
    coordinator.create("order-1", "checkout").await.unwrap();
    queue.set_fail_creates(true);

    let output = coordinator
        .handle_event("order-1", "pay", json!({"amount": 9}))
        .await
        .unwrap();
    assert_eq!(output["status"], "paid");
    assert_eq!(
        stage_of(&coordinator.get("order-1").await.unwrap()),
        Stage::Paid
    );
}

#[tokio::test]
async fn test_failed_save_releases_lease() {
    let store = Arc::new(FlakyStore {
        inner: InMemoryInstanceStore::new(),
        fail_checkpoints: AtomicBool::new(false),
    });
    let queue = Arc::new(InMemoryTaskQueue::new());
    let coordinator = coordinator(store.clone(), queue.clone());
    coordinator.create("order-1", "checkout").await.unwrap();

    store.fail_checkpoints.store(true, Ordering::SeqCst);
    let err = coordinator
        .handle_event("order-1", "pay", json!({"amount": 9}))
        .await
        .unwrap_err();
    assert!(matches!(err, CoordinatorError::Persistence(_)));
    assert!(err.is_retryable());

    let instance = coordinator.get("order-1").await.unwrap();
    assert_eq!(stage_of(&instance), Stage::AwaitingPayment);
    assert!(instance.lock_expiry.is_none());

    // Retrying once the store recovers succeeds
    store.fail_checkpoints.store(false, Ordering::SeqCst);
    let output = coordinator
        .handle_event("order-1", "pay", json!({"amount": 9}))
        .await
        .unwrap();
    assert_eq!(output["status"], "paid");
}

#[tokio::test]
async fn test_dyn_store() {
    let store: Arc<dyn InstanceStore> = Arc::new(InMemoryInstanceStore::new());
    let queue = Arc::new(InMemoryTaskQueue::new());
    let coordinator = coordinator(store, queue);

    coordinator.create("order-1", "checkout").await.unwrap();
    assert_eq!(coordinator.resume("order-1").await.unwrap(), 0);
}

#[test_log::test(tokio::test)]
async fn test_cancelled_request_leaves_next_holder_alone() {
    let store = Arc::new(InMemoryInstanceStore::new());
    let mut registry = WorkflowRegistry::new();
    registry.register::<Checkout>();
    let scheduler = TaskScheduler::new(
        Arc::new(HangingQueue),
        Signer::new("integration-secret").unwrap(),
        SchedulerConfig::from_base_url("https://wf.example.com"),
    );
    let lease_config = LeaseConfig::default()
        .with_backoff_step(Duration::from_millis(5))
        .with_max_attempts(2);
    let coordinator = Arc::new(
        Coordinator::new(store.clone(), registry, scheduler).with_lease_config(lease_config.clone()),
    );

    // Created directly, arming the deadline would hang
    coordinator
        .checkpoints()
        .create(
            Meta::new("order-1", "checkout"),
            json!({"stage": "awaiting_payment"}),
        )
        .await
        .unwrap();

    let request = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move {
            coordinator
                .handle_event("order-1", "pay", json!({"amount": 5}))
                .await
        })
    };

    // The checkpoint lands, then the fallback resume enqueue hangs
    let mut paid = false;
    for _ in 0..200 {
        if stage_of(&store.get("order-1").await.unwrap().instance) == Stage::Paid {
            paid = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(paid, "checkpoint never landed");
    assert!(!request.is_finished());

    let other = LeaseManager::new(store.clone(), lease_config.clone());
    let held = other.lock("order-1").await.unwrap();

    request.abort();
    assert!(request.await.unwrap_err().is_cancelled());
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Cancelling the first request does not drop the second holder's lease
    let doc = store.get("order-1").await.unwrap();
    assert_eq!(doc.instance.lock_expiry, Some(held.expires_at()));

    let third = LeaseManager::new(store.clone(), lease_config);
    assert!(matches!(
        third.lock("order-1").await,
        Err(LeaseError::Timeout { .. })
    ));

    held.release().await.unwrap();
    assert!(third.lock("order-1").await.is_ok());
}
