//! HTTP API for health checks, status, and order queries

use crate::chain::AdapterRegistry;
use crate::config::{ApiConfig, Settings};
use crate::coordinator::Coordinator;
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::order::OrderStore;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub coordinator: Arc<Coordinator>,
    pub orders: Arc<OrderStore>,
    pub adapters: Arc<AdapterRegistry>,
}

/// Run the HTTP API server; `ws_router` carries the broadcaster endpoint
pub async fn run_server(
    config: ApiConfig,
    state: AppState,
    ws_router: Router,
) -> OrchestratorResult<()> {
    let app = Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/status", get(get_status))
        .route("/orders/:hash", get(get_order))
        .route("/chains/:chain", get(get_chain))
        .with_state(state)
        .merge(ws_router)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr = format!("{}:{}", config.host, config.port);
    info!("Starting API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| OrchestratorError::Internal(e.to_string()))?;
    axum::serve(listener, app)
        .await
        .map_err(|e| OrchestratorError::Internal(e.to_string()))?;

    Ok(())
}

/// Health check endpoint - basic liveness
async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Readiness check - verify chain adapters respond
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let chain_health = state.adapters.health_check().await;
    let chains_ok = !chain_health.is_empty() && chain_health.iter().all(|(_, h)| *h);

    let response = ReadinessResponse {
        ready: chains_ok,
        details: chain_health
            .into_iter()
            .map(|(chain, healthy)| ChainHealth { chain, healthy })
            .collect(),
    };

    if response.ready {
        (StatusCode::OK, Json(response))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(response))
    }
}

/// Get orchestrator status
async fn get_status(State(state): State<AppState>) -> impl IntoResponse {
    let chain_health = state.adapters.health_check().await;

    Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        instance_id: state.settings.orchestrator.instance_id.clone(),
        live_orders: state.orders.len(),
        chain_status: chain_health
            .into_iter()
            .map(|(chain, healthy)| ChainHealth { chain, healthy })
            .collect(),
    })
}

/// Aggregated status for one order
async fn get_order(
    State(state): State<AppState>,
    Path(hash): Path<String>,
) -> impl IntoResponse {
    match state.coordinator.order_status(&hash).await {
        Ok(status) => (StatusCode::OK, Json(serde_json::json!(status))),
        Err(OrchestratorError::OrderNotFound { .. }) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": "order not found" })),
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": e.to_string() })),
        ),
    }
}

/// Chain parameters resolvers need to size their transactions
async fn get_chain(
    State(state): State<AppState>,
    Path(chain): Path<String>,
) -> impl IntoResponse {
    match state.settings.chain(&chain) {
        Ok(spec) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "chain": chain,
                "name": spec.name,
                "blockTimeSecs": spec.block_time_secs,
                "finalityBlocks": spec.finality_blocks,
                "gasLimits": {
                    "deployEscrow": spec.gas_limits.deploy_escrow,
                    "withdraw": spec.gas_limits.withdraw,
                    "cancel": spec.gas_limits.cancel,
                },
            })),
        ),
        Err(_) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": "unknown chain" })),
        ),
    }
}

// Response types

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

#[derive(Serialize)]
struct ReadinessResponse {
    ready: bool,
    details: Vec<ChainHealth>,
}

#[derive(Serialize)]
struct ChainHealth {
    chain: String,
    healthy: bool,
}

#[derive(Serialize)]
struct StatusResponse {
    version: String,
    instance_id: String,
    live_orders: usize,
    chain_status: Vec<ChainHealth>,
}
