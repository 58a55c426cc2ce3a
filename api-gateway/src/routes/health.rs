use axum::extract::State;
use axum::Json;
use serde::Serialize;

use ledger::store::LedgerStore;

use crate::state::SharedState;

/// Liveness response: process status plus the pieces operators page on.
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub database: &'static str,
    pub blocks: u64,
    pub p2p_peers: usize,
}

/// `GET /health`
pub async fn health<S: LedgerStore>(State(state): State<SharedState<S>>) -> Json<HealthResponse> {
    let database = if state.store.ping().await { "up" } else { "down" };
    let blocks = state.store.block_count().await.unwrap_or(0);

    Json(HealthResponse {
        status: "ok",
        database,
        blocks,
        p2p_peers: state.gossip.peer_count(),
    })
}
