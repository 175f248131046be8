//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Order lifecycle progress
//! - Secret disclosure and partial fills
//! - Escrow verification outcomes
//! - Chain adapter health and websocket fan-out

use crate::error::OrchestratorResult;

use axum::{routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge_vec, register_int_counter, register_int_gauge,
    CounterVec, Encoder, GaugeVec, IntCounter, IntGauge, TextEncoder,
};
use std::net::SocketAddr;
use tracing::info;

lazy_static! {
    // Order metrics
    pub static ref ORDERS_REGISTERED: IntCounter = register_int_counter!(
        "crosslock_orders_registered_total",
        "Total orders registered with the orchestrator"
    ).unwrap();

    pub static ref PHASE_TRANSITIONS: CounterVec = register_counter_vec!(
        "crosslock_phase_transitions_total",
        "Total phase transitions by target phase",
        &["phase"]
    ).unwrap();

    // Event metrics
    pub static ref EVENTS_PUBLISHED: CounterVec = register_counter_vec!(
        "crosslock_events_published_total",
        "Total lifecycle events published by type",
        &["event_type"]
    ).unwrap();

    pub static ref EVENTS_DELIVERED: IntCounter = register_int_counter!(
        "crosslock_events_delivered_total",
        "Total events delivered to websocket listeners"
    ).unwrap();

    // Secret metrics
    pub static ref SECRETS_REVEALED: IntCounter = register_int_counter!(
        "crosslock_secrets_revealed_total",
        "Total secret disclosures"
    ).unwrap();

    pub static ref PARTIAL_FILLS: IntCounter = register_int_counter!(
        "crosslock_partial_fills_total",
        "Total partial fills processed"
    ).unwrap();

    // Verification metrics
    pub static ref ESCROW_VERIFICATIONS: CounterVec = register_counter_vec!(
        "crosslock_escrow_verifications_total",
        "Escrow verification passes by outcome",
        &["outcome"]
    ).unwrap();

    // Chain metrics
    pub static ref CHAIN_CONNECTED: GaugeVec = register_gauge_vec!(
        "crosslock_chain_connected",
        "Chain adapter health (1=healthy, 0=unhealthy)",
        &["chain"]
    ).unwrap();

    // Connection metrics
    pub static ref WS_CONNECTIONS: IntGauge = register_int_gauge!(
        "crosslock_ws_connections",
        "Live websocket listener connections"
    ).unwrap();

    // Health metrics
    pub static ref HEALTH_CHECK_SUCCESS: IntCounter = register_int_counter!(
        "crosslock_health_check_success_total",
        "Total successful health checks"
    ).unwrap();
}

/// Prometheus metrics server
pub struct MetricsServer {
    port: u16,
}

impl MetricsServer {
    pub fn new(port: u16) -> Self {
        Self { port }
    }

    pub async fn run(&self) -> OrchestratorResult<()> {
        let app = Router::new().route("/metrics", get(metrics_handler));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| crate::error::OrchestratorError::Internal(e.to_string()))?;
        axum::serve(listener, app)
            .await
            .map_err(|e| crate::error::OrchestratorError::Internal(e.to_string()))?;

        Ok(())
    }
}

async fn metrics_handler() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

// Helper functions to record metrics

pub fn record_order_registered() {
    ORDERS_REGISTERED.inc();
}

pub fn record_phase_transition(phase: &str) {
    PHASE_TRANSITIONS.with_label_values(&[phase]).inc();
}

pub fn record_event(event_type: &str) {
    EVENTS_PUBLISHED.with_label_values(&[event_type]).inc();
}

pub fn record_events_delivered(count: usize) {
    EVENTS_DELIVERED.inc_by(count as u64);
}

pub fn record_secret_revealed() {
    SECRETS_REVEALED.inc();
}

pub fn record_partial_fill() {
    PARTIAL_FILLS.inc();
}

pub fn record_escrow_verification(outcome: &str) {
    ESCROW_VERIFICATIONS.with_label_values(&[outcome]).inc();
}

pub fn record_chain_health(chain: &str, healthy: bool) {
    CHAIN_CONNECTED
        .with_label_values(&[chain])
        .set(if healthy { 1.0 } else { 0.0 });
}

pub fn record_ws_connections(count: usize) {
    WS_CONNECTIONS.set(count as i64);
}

pub fn record_health_check() {
    HEALTH_CHECK_SUCCESS.inc();
}
