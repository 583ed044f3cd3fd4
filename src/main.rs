//! Tactical Mesh peer node
//!
//! Runs one participant of a peer-to-peer session:
//! - the fixed-rate simulation tick (combat, movement, weapons, AI, projectiles)
//! - the reliable (TCP) and unreliable (UDP) peer channels
//! - a local status endpoint for operators

use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tactical_mesh::app::AppState;
use tactical_mesh::config::{Config, SessionRole};
use tactical_mesh::http::build_router;
use tactical_mesh::util::time::{init_node_time, tick_delta};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Load configuration
    let config = Config::from_env()?;

    // Initialize tracing
    init_tracing(&config.log_level);

    // Initialize node time tracking
    init_node_time();

    info!("Starting Tactical Mesh node");
    info!("Room: {} ({:?})", config.room_id, config.role);

    let (state, mut events) = AppState::new(config.clone()).await?;
    info!(
        "Peer channels on tcp://{} udp://{}",
        state.session.local_tcp_addr(),
        state.session.local_udp_addr()
    );

    match config.role {
        SessionRole::Host => state.session.start_advertising()?,
        SessionRole::Join => {
            // Matchmaking hands over the peer list; each entry is a "peer found" event
            let (found_tx, found_rx) = mpsc::channel(config.join_peers.len().max(1));
            for addr in &config.join_peers {
                found_tx.send(*addr).await?;
            }
            drop(found_tx);
            state.session.start_browsing(found_rx)?;
        }
    }

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        shutdown_tx.send_replace(true);
    });

    // Status endpoint
    let listener = TcpListener::bind(config.status_addr).await?;
    info!("Status endpoint: http://{}/health", config.status_addr);
    let router = build_router(state.clone());
    let mut status_shutdown = shutdown_rx.clone();
    let status = tokio::spawn(async move {
        let serve = axum::serve(listener, router).with_graceful_shutdown(async move {
            let _ = status_shutdown.wait_for(|stop| *stop).await;
        });
        if let Err(e) = serve.await {
            warn!(error = %e, "Status endpoint stopped");
        }
    });

    // Simulation loop
    let delta_time = tick_delta(config.tick_rate);
    let mut ticker = interval(Duration::from_secs_f32(delta_time));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let report = state.step(delta_time).await;
                if !report.failures.is_empty() {
                    warn!(tick = report.tick, failures = report.failures.len(), "Tick completed with failures");
                }
            }
            Some(event) = events.recv() => state.handle_session_event(event),
            _ = shutdown_rx.wait_for(|stop| *stop) => break,
        }
    }

    state.session.shutdown().await;
    let _ = status.await;

    info!("Node shutdown complete");
    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, starting graceful shutdown");
        }
        _ = terminate => {
            info!("Received terminate signal, starting graceful shutdown");
        }
    }
}
