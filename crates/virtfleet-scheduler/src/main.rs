//! virtfleet service
//!
//! Opens the store, reconciles tasks left over from a previous run, starts
//! the scheduler loops, and serves a small HTTP surface.
//!
//! # HTTP Endpoints
//!
//! - `GET /health` - Liveness
//! - `GET /ready` - Readiness (store reachable)
//! - `GET /v1/tasks/:task_id` - Task lookup

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use virtfleet_core::TaskId;
use virtfleet_engine::{EngineConfig, TaskEngine};
use virtfleet_portmap::{PortMapper, PortMappingRegistry};
use virtfleet_provider::{BackendOptions, CdnConfig, ProviderPool, ProviderRegistry};
use virtfleet_scheduler::{Scheduler, SchedulerConfig};
use virtfleet_store::{RocksStore, Store};

/// Application state shared across handlers.
#[derive(Clone)]
struct AppState {
    engine: Arc<TaskEngine<RocksStore>>,
}

// ============================================================================
// Health Endpoints
// ============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
}

async fn health_handler() -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy",
        service: "virtfleet",
    })
}

async fn ready_handler(State(state): State<AppState>) -> impl IntoResponse {
    match state.engine.store().list_providers() {
        Ok(_) => (StatusCode::OK, "ready").into_response(),
        Err(e) => {
            tracing::warn!(error = %e, "Store not ready");
            (StatusCode::SERVICE_UNAVAILABLE, "store unavailable").into_response()
        }
    }
}

// ============================================================================
// Task Endpoints
// ============================================================================

/// Error response format.
#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
    code: u16,
}

impl ErrorResponse {
    fn new(error: impl Into<String>, code: u16) -> Self {
        Self {
            error: error.into(),
            code,
        }
    }
}

/// Get a task.
///
/// GET /v1/tasks/:task_id
async fn task_handler(State(state): State<AppState>, Path(task_id): Path<String>) -> impl IntoResponse {
    let task_id: TaskId = match task_id.parse() {
        Ok(id) => id,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(ErrorResponse::new(format!("Invalid task ID: {e}"), 400)),
            )
                .into_response();
        }
    };

    match state.engine.get_task(&task_id) {
        Ok(task) => Json(task).into_response(),
        Err(e) => {
            let code = e.http_status_code();
            (
                StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
                Json(ErrorResponse::new(e.to_string(), code)),
            )
                .into_response()
        }
    }
}

// ============================================================================
// Router
// ============================================================================

fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/v1/tasks/:task_id", get(task_handler))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,virtfleet=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting virtfleet");

    let config = SchedulerConfig::from_env();
    let engine_config = EngineConfig::from_env();
    tracing::info!(
        data_dir = %config.data_dir.display(),
        listen_addr = %config.listen_addr,
        executor_id = %engine_config.executor_id,
        "Loaded configuration"
    );

    let store = Arc::new(RocksStore::open(&config.data_dir)?);
    let registry = ProviderRegistry::with_builtin(BackendOptions {
        retry_attempts: engine_config.retry_attempts,
        cdn: CdnConfig::from_env(),
    });
    let pool = Arc::new(ProviderPool::new(Arc::new(registry)));
    let ports = Arc::new(PortMapper::new(
        Arc::clone(&store),
        Arc::clone(&pool),
        Arc::new(PortMappingRegistry::with_builtin()),
    ));
    let engine = TaskEngine::new(store, pool, ports, engine_config);

    let cancelled = engine.reconcile_on_startup()?;
    tracing::info!(cancelled, "Startup reconciliation complete");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler = Arc::new(Scheduler::new(Arc::clone(&engine), config.clone()));
    let loops = scheduler.spawn(shutdown_rx);

    let app = create_router(AppState { engine });

    tracing::info!(listen_addr = %config.listen_addr, "Starting HTTP server");
    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
            tracing::info!("Shutdown requested");
        })
        .await?;

    let _ = shutdown_tx.send(true);
    for handle in loops {
        if let Err(e) = handle.await {
            tracing::warn!(error = %e, "Scheduler loop ended abnormally");
        }
    }
    tracing::info!("virtfleet stopped");
    Ok(())
}
