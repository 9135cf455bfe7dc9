use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router,
};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use sentinel_common::ids::NodeId;
use sentinel_common::types::WorkerRegistration;

use sentinel_coord::config;
use sentinel_coord::memory::RedisBackend;
use sentinel_coord::shutdown;
use sentinel_coord::ticket::HttpTicketStore;
use sentinel_coord::Coordinator;

/// Shared application state accessible from axum handlers.
struct AppState {
    coordinator: Arc<Coordinator>,
    backend_probe: Arc<RedisBackend>,
    metrics_handle: PrometheusHandle,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    tracing::info!("Task-Sentinel coordinator starting");

    // Load configuration — fail loudly on misconfiguration.
    let config_dir = std::env::var("SENTINEL_CONFIG_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("config"));

    let coord_config = match config::load_config(&config_dir) {
        Ok(config) => {
            tracing::info!("Configuration loaded successfully");
            config
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to load configuration — refusing to start");
            std::process::exit(1);
        }
    };

    // Install Prometheus metrics recorder.
    let metrics_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");

    // Shared memory backend.
    let redis_url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".into());
    let backend = match RedisBackend::connect(&redis_url, &coord_config.system.memory.namespace)
        .await
    {
        Ok(backend) => Arc::new(backend),
        Err(e) => {
            tracing::error!(error = %e, "Failed to connect to Redis");
            std::process::exit(1);
        }
    };

    // Ticket store client.
    let ticket_url = std::env::var("TICKET_STORE_URL")
        .unwrap_or_else(|_| coord_config.system.ticket_store.location.clone());
    let ticket_token = std::env::var(&coord_config.system.ticket_store.token_env).ok();
    let tickets = Arc::new(HttpTicketStore::new(ticket_url, ticket_token));

    // This worker's registration.
    let node_id = NodeId::new(
        std::env::var("SENTINEL_NODE_ID")
            .ok()
            .or_else(|| std::env::var("HOSTNAME").ok())
            .unwrap_or_else(|| "unknown-node".to_string()),
    );
    let capabilities: BTreeSet<String> = std::env::var("SENTINEL_CAPABILITIES")
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();
    let max_concurrent_tasks = std::env::var("SENTINEL_MAX_TASKS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(4);

    let registration = WorkerRegistration {
        node_id,
        capabilities,
        max_concurrent_tasks,
    };

    let coordinator = match Coordinator::start(
        coord_config.system.clone(),
        Arc::clone(&backend) as _,
        tickets,
        registration,
    )
    .await
    {
        Ok(coordinator) => Arc::new(coordinator),
        Err(e) => {
            tracing::error!(error = %e, "Failed to start coordinator");
            std::process::exit(1);
        }
    };

    let state = Arc::new(AppState {
        coordinator: Arc::clone(&coordinator),
        backend_probe: backend,
        metrics_handle,
    });

    let app = Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/status", get(status_handler))
        .with_state(state);

    let port: u16 = std::env::var("COORD_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8085);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port))
        .await
        .expect("Failed to bind TCP listener");

    tracing::info!(port = port, "Task-Sentinel coordinator listening");

    let mut shutdown_rx = shutdown::shutdown_receiver();
    let server = axum::serve(listener, app).with_graceful_shutdown(async move {
        let _ = shutdown_rx.changed().await;
    });

    if let Err(e) = server.await {
        tracing::error!(error = %e, "HTTP server error");
    }

    coordinator.shutdown().await;
    tracing::info!("Task-Sentinel coordinator stopped");
}

/// Health check: one round-trip through the memory backend.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let redis_ok = state.backend_probe.health_check().await.is_ok();

    let status = if redis_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let body = serde_json::json!({
        "status": if redis_ok { "healthy" } else { "unhealthy" },
        "services": {
            "redis": if redis_ok { "healthy" } else { "unhealthy" },
        }
    });

    (status, Json(body))
}

/// Prometheus metrics endpoint.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> String {
    state.metrics_handle.render()
}

/// Coordination snapshot: this worker plus every subsystem's counters.
async fn status_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let coordinator = &state.coordinator;
    let body = serde_json::json!({
        "worker": coordinator.worker(),
        "metrics": coordinator.get_metrics(),
    });
    Json(body)
}
