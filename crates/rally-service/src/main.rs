//! Rally coordination service daemon.
//!
//! Runs the per-process side of fleet coordination:
//!
//! - Heartbeats this process's `ServerRecord` and sweeps for dead peers,
//!   running registered cleanup hooks with each dead batch
//! - Sweeps orphaned call signal mailboxes
//! - Serves health probes and Prometheus metrics over HTTP
//!
//! The distributed lock and call relay are library surface
//! ([`rally_service::lock`], [`rally_service::relay`]) consumed by the
//! embedding application; this binary keeps the shared state reconciled.
//!
//! # Startup Flow
//!
//! 1. Load configuration from environment
//! 2. Initialize the Prometheus metrics recorder
//! 3. Connect the MongoDB store (ensures indexes, spawns change-stream pumps)
//! 4. Build the liveness registry and wire the participant cleanup hook
//! 5. Spawn the liveness loop and signal sweep tasks
//! 6. Start the health/metrics HTTP server
//! 7. Wait for shutdown signal

#![warn(clippy::pedantic)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rally_service::config::Config;
use rally_service::liveness::LivenessRegistry;
use rally_service::observability::{health_router, metrics, HealthState};
use rally_service::relay::register_participant_cleanup;
use rally_service::store::{CoordStore, MongoCoordStore};
use rally_service::tasks::{
    start_liveness_loop, start_signal_sweep, LivenessLoopConfig, SignalSweepConfig,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rally_service=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Rally service");

    // Load configuration
    let config = Config::from_env().map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!(
        server_id = %config.server_id,
        database = %config.database,
        health_bind_address = %config.health_bind_address,
        heartbeat_interval_seconds = config.heartbeat_interval_seconds,
        server_ttl_seconds = config.server_ttl_seconds,
        lock_preempt_timeout_seconds = config.lock_preempt_timeout_seconds,
        signal_ttl_seconds = config.signal_ttl_seconds,
        "Configuration loaded successfully"
    );

    // Initialize Prometheus metrics recorder before any metrics are recorded
    let prometheus_handle = metrics::init_metrics_recorder().map_err(|e| {
        error!(error = %e, "Failed to install Prometheus metrics recorder");
        e
    })?;
    info!("Prometheus metrics recorder initialized");

    let health_state = Arc::new(HealthState::new());
    let shutdown_token = CancellationToken::new();

    // Connect the store; change-stream pumps are children of the shutdown token
    info!("Connecting to MongoDB...");
    let store: Arc<dyn CoordStore> = Arc::new(
        MongoCoordStore::connect(&config, shutdown_token.child_token())
            .await
            .map_err(|e| {
                error!(error = %e, "Failed to initialize MongoDB store");
                e
            })?,
    );
    info!("MongoDB store initialized");

    // Liveness registry with dead-server participant cleanup wired in
    let registry = Arc::new(LivenessRegistry::new(
        Arc::clone(&store),
        config.server_id.clone(),
        Duration::from_secs(config.server_ttl_seconds),
    ));
    register_participant_cleanup(&registry, Arc::clone(&store));

    // Spawn background loops
    let liveness_token = shutdown_token.child_token();
    let liveness_config = LivenessLoopConfig::from_config(&config);
    let liveness_registry = Arc::clone(&registry);
    tokio::spawn(async move {
        start_liveness_loop(liveness_registry, liveness_config, liveness_token).await;
    });

    let sweep_token = shutdown_token.child_token();
    let sweep_config = SignalSweepConfig::from_config(&config);
    let sweep_store = Arc::clone(&store);
    tokio::spawn(async move {
        start_signal_sweep(sweep_store, sweep_config, sweep_token).await;
    });

    // Health + metrics HTTP server
    let health_addr: SocketAddr = config.health_bind_address.parse().map_err(|e| {
        error!(error = %e, addr = %config.health_bind_address, "Invalid health bind address");
        format!("Invalid health bind address: {e}")
    })?;

    let metrics_router = Router::new().route(
        "/metrics",
        axum::routing::get(move || {
            let handle = prometheus_handle.clone();
            async move { handle.render() }
        }),
    );
    let app = health_router(Arc::clone(&health_state)).merge(metrics_router);

    // Bind before spawning to fail fast on bind errors
    let listener = tokio::net::TcpListener::bind(health_addr)
        .await
        .map_err(|e| {
            error!(error = %e, addr = %health_addr, "Failed to bind health server");
            format!("Failed to bind health server to {health_addr}: {e}")
        })?;

    let health_shutdown_token = shutdown_token.child_token();
    tokio::spawn(async move {
        info!(addr = %health_addr, "Health server starting");
        let server = axum::serve(listener, app).with_graceful_shutdown(async move {
            health_shutdown_token.cancelled().await;
            info!("Health server shutting down");
        });
        if let Err(e) = server.await {
            error!(error = %e, "Health server failed");
        }
    });

    health_state.set_ready();
    info!(server_id = %config.server_id, "Rally service running - press Ctrl+C to shutdown");

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutdown signal received, initiating graceful shutdown...");
    health_state.set_not_ready();
    shutdown_token.cancel();

    // Give tasks time to finish their current iteration
    tokio::time::sleep(Duration::from_secs(2)).await;

    info!("Rally service shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
///
/// # Panics
///
/// Panics if signal handlers cannot be installed. This is acceptable because
/// without signal handlers, we cannot gracefully shut down the service.
async fn shutdown_signal() {
    let ctrl_c = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
