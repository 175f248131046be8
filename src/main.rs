//! Crosslock Orchestrator - cross-chain HTLC swap coordination
//!
//! Watches escrow deployment on both sides of a swap, drives the order
//! lifecycle state machine, and discloses unlocking secrets only once
//! on-chain conditions on both chains are independently confirmed safe.

use anyhow::Result;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

mod api;
mod broadcast;
mod chain;
mod clock;
mod config;
mod coordinator;
mod error;
mod events;
mod fills;
mod metrics;
mod order;
mod resolvers;
mod secrets;
mod timelock;
mod verifier;

use broadcast::EventBroadcaster;
use chain::AdapterRegistry;
use config::Settings;
use coordinator::Coordinator;
use events::EventBus;
use fills::PartialFillManager;
use metrics::MetricsServer;
use order::OrderStore;
use resolvers::ResolverRegistry;
use secrets::SecretManager;
use timelock::{Scheduler, TimelockManager};
use verifier::EscrowVerifier;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    init_logging();

    info!("Starting Crosslock Orchestrator v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let settings = Arc::new(Settings::load()?);
    info!(
        "Loaded configuration for {} chains",
        settings.enabled_chains().len()
    );

    // Shared infrastructure
    let bus = EventBus::new(10_000);
    let scheduler = Arc::new(Scheduler::new());
    let orders = Arc::new(OrderStore::new());
    let adapters = Arc::new(AdapterRegistry::new());
    let resolvers = Arc::new(ResolverRegistry::new());

    // Component managers
    let timelocks = Arc::new(TimelockManager::new(
        orders.clone(),
        scheduler.clone(),
        bus.clone(),
    ));
    let secrets = Arc::new(SecretManager::new(
        resolvers.clone(),
        scheduler.clone(),
        bus.clone(),
    ));
    let fills = Arc::new(PartialFillManager::new(bus.clone()));
    let verifier = Arc::new(EscrowVerifier::new(
        adapters.clone(),
        orders.clone(),
        settings.clone(),
        settings.orchestrator.clone(),
        bus.clone(),
    ));
    info!("Component managers initialized");

    // Metrics server
    let metrics_server = if settings.metrics.enabled {
        Some(MetricsServer::new(settings.metrics.port))
    } else {
        None
    };

    // Event broadcaster (websocket fan-out)
    let broadcaster = Arc::new(EventBroadcaster::new(scheduler.clone(), bus.clone()));
    broadcaster.start();

    // Timelock sweeps
    timelocks.start(&settings.orchestrator);

    // Coordinator
    let coordinator = Arc::new(Coordinator::new(
        settings.clone(),
        orders.clone(),
        adapters.clone(),
        resolvers.clone(),
        timelocks.clone(),
        secrets.clone(),
        fills.clone(),
        verifier.clone(),
        bus.clone(),
    ));
    info!("Coordinator initialized");

    // Start API server with the broadcaster's websocket endpoint merged in
    let api_handle = tokio::spawn({
        let api_config = settings.api.clone();
        let state = api::AppState {
            settings: settings.clone(),
            coordinator: coordinator.clone(),
            orders: orders.clone(),
            adapters: adapters.clone(),
        };
        let ws_router = broadcaster.router();
        async move {
            if let Err(e) = api::run_server(api_config, state, ws_router).await {
                error!("API server error: {}", e);
            }
        }
    });

    // Start metrics server
    let metrics_handle = metrics_server.map(|server| {
        tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("Metrics server error: {}", e);
            }
        })
    });

    // Start coordinator reaction loop
    let coordinator_handle = tokio::spawn({
        let coordinator = coordinator.clone();
        async move {
            if let Err(e) = coordinator.run().await {
                error!("Coordinator error: {}", e);
            }
        }
    });

    info!("Crosslock Orchestrator is running");
    info!("API server: http://{}:{}", settings.api.host, settings.api.port);
    if settings.metrics.enabled {
        info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
    }

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutdown signal received, stopping...");

    // Graceful shutdown: cancel all outstanding timers and monitors first
    coordinator.stop().await;
    broadcaster.stop();
    let leftover = scheduler.len();
    if leftover > 0 {
        warn!(leftover, "Cancelling leftover scheduled jobs");
        scheduler.cancel_all();
    }

    // Abort background tasks
    api_handle.abort();
    coordinator_handle.abort();
    if let Some(h) = metrics_handle {
        h.abort();
    }

    info!("Crosslock Orchestrator stopped");
    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("info,crosslock_orchestrator=debug,hyper=warn,tower_http=warn")
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
