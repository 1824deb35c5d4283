// Leaseflow HTTP server
// Decision: One coordinator shared by all routes; the store is chosen at startup (Postgres or in-memory)
// Decision: CORS is opt-in through CORS_ALLOWED_ORIGINS

pub mod api;
pub mod config;
pub mod demo;
pub mod telemetry;

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::http::{header, HeaderValue, Method};
use axum::{routing::get, Json, Router};
use leaseflow_durable::{
    CloudTasksConfig, CloudTasksQueue, Coordinator, InMemoryInstanceStore, InstanceStore,
    LocalTaskQueue, PostgresInstanceStore, SchedulerConfig, Signer, TaskQueue, TaskScheduler,
    TokenSource, WorkflowRegistry,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::{ServerConfig, TaskQueueBackend};

/// App state shared across routes
#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<Coordinator<dyn InstanceStore>>,
}

impl AppState {
    pub fn new(coordinator: Coordinator<dyn InstanceStore>) -> Self {
        Self {
            coordinator: Arc::new(coordinator),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Build the application router
pub fn router(state: AppState, cors: Option<CorsLayer>) -> Router {
    let app = Router::new()
        .route("/health", get(health))
        .merge(api::workflows::routes(state.clone()))
        .merge(api::callbacks::routes(state))
        .layer(TraceLayer::new_for_http());

    match cors {
        Some(cors) => app.layer(cors),
        None => app,
    }
}

/// CORS layer for the given origins, `None` when the list is empty
pub fn cors_layer(origins: &[String]) -> Option<CorsLayer> {
    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| match o.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(origin = %o, "ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    if origins.is_empty() {
        return None;
    }

    Some(
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(origins))
            .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
            .allow_headers([header::CONTENT_TYPE, header::ACCEPT]),
    )
}

/// Instance store selected by `DATABASE_URL`
pub async fn build_store(config: &ServerConfig) -> Result<Arc<dyn InstanceStore>> {
    match &config.database_url {
        Some(url) => {
            let store = PostgresInstanceStore::connect(url)
                .await
                .context("Failed to connect to database")?;
            store.migrate().await.context("Failed to run migrations")?;
            tracing::info!("Using PostgreSQL instance store");
            Ok(Arc::new(store))
        }
        None => {
            tracing::warn!("DATABASE_URL not set, instances are kept in memory");
            Ok(Arc::new(InMemoryInstanceStore::new()))
        }
    }
}

/// Task queue selected by `TASK_QUEUE`
pub fn build_queue(config: &ServerConfig) -> Arc<dyn TaskQueue> {
    match &config.task_queue {
        TaskQueueBackend::Local => {
            tracing::info!("Using in-process task queue");
            Arc::new(LocalTaskQueue::new())
        }
        TaskQueueBackend::CloudTasks {
            project_id,
            location_id,
            queue,
            access_token,
        } => {
            let tokens = match access_token {
                Some(token) => TokenSource::Static(token.clone()),
                None => TokenSource::metadata(),
            };
            let cloud = CloudTasksConfig::new(project_id, location_id, queue);
            tracing::info!(queue = %cloud.queue_path(), "Using Cloud Tasks queue");
            Arc::new(CloudTasksQueue::new(cloud, tokens))
        }
    }
}

/// Coordinator wired from configuration
pub async fn build_coordinator(
    config: &ServerConfig,
    registry: WorkflowRegistry,
) -> Result<Coordinator<dyn InstanceStore>> {
    let store = build_store(config).await?;
    let signer = Signer::new(&config.sign_secret).context("Invalid SIGN_SECRET")?;
    let scheduler = TaskScheduler::new(
        build_queue(config),
        signer,
        SchedulerConfig::from_base_url(&config.base_public_url),
    );

    Ok(Coordinator::new(store, registry, scheduler)
        .with_lease_config(config.lease.clone())
        .with_config(config.coordinator.clone()))
}
