// Leaseflow server binary

use anyhow::{Context, Result};
use leaseflow_server::config::ServerConfig;
use leaseflow_server::telemetry::{init_telemetry, TelemetryConfig};
use leaseflow_server::{build_coordinator, cors_layer, demo, router, AppState};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // Configure via RUST_LOG or LOG_LEVEL
    // (default: "leaseflow_server=debug,leaseflow_durable=debug,tower_http=debug")
    init_telemetry(&TelemetryConfig::from_env());

    tracing::info!("leaseflow-server starting...");

    let config = ServerConfig::from_env().context("Failed to load configuration")?;

    let registry = demo::registry();
    tracing::info!(
        workflows = ?registry.workflow_types().collect::<Vec<_>>(),
        "Registered workflows"
    );

    let coordinator = build_coordinator(&config, registry).await?;
    tracing::info!(
        base_url = %config.base_public_url,
        lease_secs = config.lease.lease_duration.as_secs(),
        record_transitions = config.coordinator.record_transitions,
        "Coordinator ready"
    );

    let cors = cors_layer(&config.cors_allowed_origins);
    if cors.is_none() {
        tracing::info!("CORS not configured (same-origin requests only)");
    }

    let app = router(AppState::new(coordinator), cors);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", config.bind_addr))?;
    tracing::info!(address = %config.bind_addr, "Listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("Received shutdown signal");
        })
        .await
        .context("Server error")?;

    Ok(())
}
