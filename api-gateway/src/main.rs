// api-gateway/src/main.rs

//! API gateway binary.
//!
//! This binary exposes the ledger's HTTP API and wires up one node:
//!
//! - Postgres-backed chain store (C1)
//! - two-phase mining coordinator (C2)
//! - background verifier task (C3)
//! - peer gossip listener + dialers (C4)
//! - Prometheus metrics exporter on `/metrics`
//!
//! The store and the gossip instance are constructed before the HTTP
//! server starts and shut down on SIGINT/SIGTERM.

mod config;
mod error;
mod routes;
mod state;

use std::sync::Arc;

use tokio::signal;

use ledger::{
    LedgerStore, MetricsRegistry, NodeConfig, PgLedgerStore, Verifier, run_prometheus_http_server,
};
use ledger::gossip::PeerGossip;

use config::ApiConfig;
use state::AppState;

#[tokio::main]
async fn main() {
    // Basic tracing setup.
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "api_gateway=info,ledger=info".to_string()),
        )
        .init();

    if let Err(e) = run().await {
        eprintln!("fatal error: {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), String> {
    let node_cfg = NodeConfig::from_env().map_err(|e| format!("configuration error: {e}"))?;
    let api_cfg = ApiConfig::from_node(&node_cfg);

    // ---------------------------
    // Metrics
    // ---------------------------

    let metrics = Arc::new(
        MetricsRegistry::new().map_err(|e| format!("failed to initialise metrics registry: {e}"))?,
    );

    if node_cfg.metrics.enabled {
        let metrics_clone = metrics.clone();
        let addr = node_cfg.metrics.listen_addr;
        tokio::spawn(async move {
            if let Err(e) = run_prometheus_http_server(metrics_clone, addr).await {
                tracing::warn!("metrics HTTP server error: {e}");
            }
        });
        tracing::info!("metrics exporter listening on http://{}/metrics", addr);
    }

    // ---------------------------
    // Chain store (Postgres)
    // ---------------------------

    let store = Arc::new(
        PgLedgerStore::connect(&node_cfg.database_url)
            .await
            .map_err(|e| format!("failed to open chain store: {e}"))?,
    );
    if let Some(tip) = store.latest_block().await {
        metrics.ledger.chain_height.set(tip.block_number as i64);
        tracing::info!(height = tip.block_number, "chain loaded");
    } else {
        tracing::info!("chain is empty, awaiting genesis");
    }

    // ---------------------------
    // Peer gossip
    // ---------------------------

    let gossip = PeerGossip::new(store.clone());
    gossip
        .start(node_cfg.p2p_port, &node_cfg.peers)
        .await
        .map_err(|e| format!("failed to start gossip: {e}"))?;
    metrics.ledger.gossip_peers.set(gossip.peer_count() as i64);

    // ---------------------------
    // Verifier task
    // ---------------------------

    let verifier = Verifier::new(store.clone(), node_cfg.verifier.clone());
    let verifier_handle = tokio::spawn(verifier.run());

    // ---------------------------
    // HTTP router
    // ---------------------------

    let app_state = AppState::new(store, gossip.clone(), metrics, node_cfg);
    let app = routes::router(app_state);

    tracing::info!("API gateway listening on http://{}", api_cfg.listen_addr);

    let listener = tokio::net::TcpListener::bind(api_cfg.listen_addr)
        .await
        .map_err(|e| format!("failed to bind {}: {e}", api_cfg.listen_addr))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| format!("API server error: {e}"))?;

    // ---------------------------
    // Teardown
    // ---------------------------

    verifier_handle.abort();
    gossip.shutdown();
    tracing::info!("node stopped");

    Ok(())
}

/// Waits for SIGINT or SIGTERM, used for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => tracing::warn!("failed to install SIGTERM handler: {e}"),
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutdown signal received");
}
