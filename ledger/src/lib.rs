//! Ledger library crate.
//!
//! This crate provides the core building blocks for the replicated
//! sealed-record ledger:
//!
//! - strongly-typed domain types (`types`),
//! - cryptographic helpers and the reference client (`crypto`),
//! - block and chain validity predicates (`validation`),
//! - the chain store with Postgres and in-memory backends (`store`),
//! - the two-phase mining coordinator (`mining`),
//! - the background verifier (`verifier`),
//! - peer-to-peer chain gossip (`gossip`),
//! - Prometheus-based metrics (`metrics`),
//! - and a top-level node configuration (`config`).
//!
//! Higher-level binaries compose these pieces to build API nodes and
//! experiment harnesses.

pub mod config;
pub mod crypto;
pub mod gossip;
pub mod metrics;
pub mod mining;
pub mod store;
pub mod types;
pub mod validation;
pub mod verifier;

// Re-export top-level configuration types.
pub use config::{ConfigError, MetricsConfig, NodeConfig, VerifierConfig};

// Re-export the store abstraction and its outcome types.
pub use store::{
    AppendOutcome, AuditEvent, AuditKind, BlockPage, BlockQuery, BlockSort, ChainStats,
    LedgerStore, MemLedgerStore, PgLedgerStore, ReplaceOutcome, StoreError, VerificationOutcome,
    VerifiedFilter,
};

// Re-export the mining coordinator surface.
pub use mining::{
    CommitError, CommitOutcome, CommitPayload, MiningCoordinator, MiningPreparation, PrepareError,
};

// Re-export the verifier and gossip components.
pub use gossip::{GossipError, PeerGossip, PeerMessage};
pub use verifier::{TickSummary, Verifier};

// Re-export metrics registry and exporter.
pub use metrics::{LedgerMetrics, MetricsRegistry, run_prometheus_http_server};

// Re-export domain types at the crate root for convenience.
pub use types::*;

/// Type alias for the store backend used by a "typical" node.
pub type DefaultLedgerStore = PgLedgerStore;

/// Type alias for the mining coordinator of a typical node.
pub type DefaultMiningCoordinator = MiningCoordinator<DefaultLedgerStore>;

/// Type alias for the gossip instance of a typical node.
pub type DefaultPeerGossip = PeerGossip<DefaultLedgerStore>;

/// Type alias for the verifier of a typical node.
pub type DefaultVerifier = Verifier<DefaultLedgerStore>;
