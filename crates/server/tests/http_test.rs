//! HTTP tests of the server routes over in-memory backends
//!
//! Run with: cargo test -p leaseflow-server --test http_test

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use leaseflow_durable::{
    Coordinator, InMemoryInstanceStore, InMemoryTaskQueue, InstanceStore, LeaseConfig,
    SchedulerConfig, Signer, TaskScheduler, TimeoutRequest,
};
use leaseflow_server::{cors_layer, demo, router, AppState};

struct TestApp {
    app: Router,
    queue: Arc<InMemoryTaskQueue>,
}

fn test_app() -> TestApp {
    let store: Arc<dyn InstanceStore> = Arc::new(InMemoryInstanceStore::new());
    let queue = Arc::new(InMemoryTaskQueue::new());
    let scheduler = TaskScheduler::new(
        queue.clone(),
        Signer::new("test-secret").unwrap(),
        SchedulerConfig::from_base_url("http://leaseflow.test"),
    );
    let coordinator = Coordinator::new(store, demo::registry(), scheduler).with_lease_config(
        LeaseConfig::default()
            .with_max_attempts(5)
            .with_backoff_step(std::time::Duration::from_millis(5)),
    );

    TestApp {
        app: router(AppState::new(coordinator), None),
        queue,
    }
}

async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json");
    let request = match body {
        Some(body) => request.body(Body::from(body.to_string())).unwrap(),
        None => request.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, json)
}

fn pending_timeout(queue: &InMemoryTaskQueue) -> TimeoutRequest {
    queue
        .pending()
        .into_iter()
        .find(|(_, task)| task.url.ends_with("/callback/timeout"))
        .map(|(_, task)| task.json().unwrap())
        .expect("no pending timeout task")
}

#[tokio::test]
async fn test_health() {
    let TestApp { app, .. } = test_app();

    let (status, body) = send(&app, "GET", "/health", None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[test_log::test(tokio::test)]
async fn test_create_then_get() {
    let TestApp { app, queue } = test_app();

    let (status, created) = send(&app, "POST", "/wf/checkout/order-1", None).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["meta"]["id"], "order-1");
    assert_eq!(created["meta"]["workflow"], "checkout");
    assert_eq!(created["state"]["stage"], "awaiting_payment");
    assert!(created["lock_expiry"].is_null());

    let (status, fetched) = send(&app, "GET", "/wf/checkout/order-1", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetched, created);

    // Payment deadline armed
    assert_eq!(pending_timeout(&queue).req.name, "payment_deadline");
}

#[test_log::test(tokio::test)]
async fn test_pay_and_ship() {
    let TestApp { app, queue } = test_app();
    send(&app, "POST", "/wf/checkout/order-2", None).await;

    let (status, out) = send(
        &app,
        "POST",
        "/wf/checkout/order-2/pay",
        Some(json!({"amount": 1200})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(out, json!({"status": "paid", "amount": 1200}));
    assert_eq!(queue.deleted().len(), 1);

    let (status, out) = send(
        &app,
        "POST",
        "/wf/checkout/order-2/ship",
        Some(json!({"tracking": "1Z999"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(out["status"], "shipped");

    // Inline resume after the event finished the instance
    let (_, instance) = send(&app, "GET", "/wf/checkout/order-2", None).await;
    assert_eq!(instance["state"]["stage"], "shipped");
    assert_eq!(instance["meta"]["status"], "finished");
}

#[tokio::test]
async fn test_validation_error() {
    let TestApp { app, .. } = test_app();
    send(&app, "POST", "/wf/checkout/order-3", None).await;

    let (status, body) = send(
        &app,
        "POST",
        "/wf/checkout/order-3/pay",
        Some(json!({"amount": -5})),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["type"], "validate");
    assert_eq!(body["path"], "amount");

    let (_, instance) = send(&app, "GET", "/wf/checkout/order-3", None).await;
    assert_eq!(instance["state"]["stage"], "awaiting_payment");
}

#[tokio::test]
async fn test_malformed_event_body() {
    let TestApp { app, .. } = test_app();
    send(&app, "POST", "/wf/checkout/order-4", None).await;

    let request = Request::builder()
        .method("POST")
        .uri("/wf/checkout/order-4/pay")
        .body(Body::from("{amount"))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_duplicate_create_conflicts() {
    let TestApp { app, .. } = test_app();

    let (status, _) = send(&app, "POST", "/wf/checkout/order-5", None).await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, body) = send(&app, "POST", "/wf/checkout/order-5", None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["type"], "general");
}

#[tokio::test]
async fn test_unknown_workflow_and_instance() {
    let TestApp { app, .. } = test_app();

    let (status, _) = send(&app, "POST", "/wf/refund/order-6", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(&app, "GET", "/wf/checkout/missing", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(&app, "POST", "/wf/checkout/missing/pay", Some(json!({}))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[test_log::test(tokio::test)]
async fn test_timeout_callback_cancels_unpaid_order() {
    let TestApp { app, queue } = test_app();
    send(&app, "POST", "/wf/checkout/order-7", None).await;

    let timeout = pending_timeout(&queue);
    let (status, out) = send(
        &app,
        "POST",
        "/callback/timeout",
        Some(serde_json::to_value(&timeout).unwrap()),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(out["status"], "cancelled");

    // Redelivery is ignored
    let (status, out) = send(
        &app,
        "POST",
        "/callback/timeout",
        Some(serde_json::to_value(&timeout).unwrap()),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(out["status"], "ignored");
}

#[tokio::test]
async fn test_tampered_callbacks_forbidden() {
    let TestApp { app, queue } = test_app();
    send(&app, "POST", "/wf/checkout/order-8", None).await;

    let mut timeout = pending_timeout(&queue);
    timeout.req.pc += 1;
    let (status, body) = send(
        &app,
        "POST",
        "/callback/timeout",
        Some(serde_json::to_value(&timeout).unwrap()),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["msg"], "signature invalid");

    let (status, _) = send(
        &app,
        "POST",
        "/resume",
        Some(json!({"id": "order-8", "signature": "00"})),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (_, instance) = send(&app, "GET", "/wf/checkout/order-8", None).await;
    assert_eq!(instance["state"]["stage"], "awaiting_payment");
}

#[tokio::test]
async fn test_resume_task_delivery() {
    let TestApp { app, queue } = test_app();
    send(&app, "POST", "/wf/checkout/order-9", None).await;
    send(
        &app,
        "POST",
        "/wf/checkout/order-9/cancel",
        Some(json!({})),
    )
    .await;

    let resume = queue
        .pending()
        .into_iter()
        .find(|(_, task)| task.url.ends_with("/resume"))
        .map(|(_, task)| task.body)
        .expect("fallback resume task");
    let body: Value = serde_json::from_slice(&resume).unwrap();

    // Inline resume already finished the instance, the fallback is a no-op
    let (status, out) = send(&app, "POST", "/resume", Some(body)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(out["steps"], 0);

    let (status, _) = send(&app, "POST", "/resume", Some(json!({"id": 1}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_cors_layer_only_with_origins() {
    assert!(cors_layer(&[]).is_none());
    assert!(cors_layer(&["https://app.example".to_string()]).is_some());
}
