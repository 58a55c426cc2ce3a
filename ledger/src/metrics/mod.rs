//! Metrics and instrumentation for the ledger node.
//!
//! This module defines Prometheus-compatible metrics for the block
//! lifecycle and exposes a small HTTP exporter that serves `/metrics` in
//! Prometheus text format.
//!
//! Typical usage in a node:
//!
//! ```ignore
//! use std::net::SocketAddr;
//! use std::sync::Arc;
//! use ledger::metrics::{MetricsRegistry, run_prometheus_http_server};
//!
//! let registry = Arc::new(MetricsRegistry::new()?);
//! let addr: SocketAddr = "127.0.0.1:9898".parse()?;
//!
//! // Spawn the HTTP exporter in the background:
//! tokio::spawn(run_prometheus_http_server(registry.clone(), addr));
//!
//! // Elsewhere in the code:
//! registry.ledger.commit_validation_seconds.observe(duration_secs);
//! ```

pub mod prometheus;

pub use prometheus::{LedgerMetrics, MetricsRegistry, run_prometheus_http_server};
