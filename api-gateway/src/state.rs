//! Shared application state.

use std::sync::Arc;

use ledger::gossip::PeerGossip;
use ledger::mining::MiningCoordinator;
use ledger::store::LedgerStore;
use ledger::{MetricsRegistry, NodeConfig};

/// Shared state held by the API and background tasks.
///
/// This is wrapped in an [`Arc`] and passed to request handlers via Axum's
/// `State` extractor. The store and the gossip instance are the two
/// process-wide singletons; both are injected here instead of living in
/// globals.
pub struct AppState<S> {
    /// Chain + creator store (C1).
    pub store: Arc<S>,
    /// Two-phase mining coordinator (C2).
    pub coordinator: MiningCoordinator<S>,
    /// Peer gossip instance (C4); notified after successful commits.
    pub gossip: Arc<PeerGossip<S>>,
    /// Metrics registry shared between the API and background tasks.
    pub metrics: Arc<MetricsRegistry>,
    /// Node configuration snapshot.
    pub config: NodeConfig,
}

/// Thread-safe alias for `AppState`.
pub type SharedState<S> = Arc<AppState<S>>;

impl<S> AppState<S>
where
    S: LedgerStore,
{
    pub fn new(
        store: Arc<S>,
        gossip: Arc<PeerGossip<S>>,
        metrics: Arc<MetricsRegistry>,
        config: NodeConfig,
    ) -> SharedState<S> {
        let coordinator =
            MiningCoordinator::new(store.clone(), config.difficulty, config.max_data_size);
        Arc::new(Self {
            store,
            coordinator,
            gossip,
            metrics,
            config,
        })
    }
}
