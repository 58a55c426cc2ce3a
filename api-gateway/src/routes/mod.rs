//! HTTP route handlers and the router builder.

use axum::routing::{get, post};
use axum::Router;

use ledger::store::LedgerStore;

use crate::state::SharedState;

pub mod blocks;
pub mod creators;
pub mod decrypt;
pub mod health;

/// Builds the API router over any store backend.
///
/// Generic so the test suite can drive the full HTTP surface against the
/// in-memory store.
pub fn router<S: LedgerStore>(state: SharedState<S>) -> Router {
    Router::new()
        .route("/health", get(health::health::<S>))
        .route(
            "/creators",
            get(creators::list::<S>).post(creators::register::<S>),
        )
        .route("/creators/stats/summary", get(creators::stats::<S>))
        .route(
            "/creators/{display_name}/public-key",
            get(creators::public_key::<S>),
        )
        .route("/blocks", get(blocks::list::<S>))
        .route("/blocks/prepare-mining", post(blocks::prepare_mining::<S>))
        .route("/blocks/commit", post(blocks::commit::<S>))
        .route("/blocks/stats/summary", get(blocks::stats::<S>))
        .route(
            "/decrypt/blocks/{creator_id}",
            get(decrypt::blocks_for_creator::<S>),
        )
        .with_state(state)
}
