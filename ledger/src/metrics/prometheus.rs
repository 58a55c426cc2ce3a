//! Prometheus-backed metrics and HTTP exporter.
//!
//! This module defines a [`MetricsRegistry`] that owns a Prometheus
//! registry and a set of strongly-typed block-lifecycle metrics, and an
//! async HTTP exporter that serves `/metrics` using `hyper`.

use std::{convert::Infallible, net::SocketAddr, sync::Arc};

use bytes::Bytes;
use http_body_util::Full;
use hyper::{
    Method, Request, Response, StatusCode, body::Incoming, header, server::conn::http1,
    service::service_fn,
};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;

use prometheus::{
    self, Encoder, Histogram, HistogramOpts, IntCounter, IntGauge, Opts, Registry, TextEncoder,
};

/// Block-lifecycle Prometheus metrics.
///
/// These are registered into a [`Registry`] and updated from the commit
/// path, the verifier, and the gossip layer.
#[derive(Clone)]
pub struct LedgerMetrics {
    /// Latency of the full commit validation pipeline, in seconds.
    pub commit_validation_seconds: Histogram,
    /// Number of blocks appended to the local chain.
    pub blocks_appended: IntCounter,
    /// Number of commits rejected by validation or store constraints.
    pub commits_rejected: IntCounter,
    /// Duration of one verifier tick, in seconds.
    pub verifier_tick_seconds: Histogram,
    /// `block_number` of the current tip (0 on an empty chain).
    pub chain_height: IntGauge,
    /// Number of currently connected gossip sockets.
    pub gossip_peers: IntGauge,
}

impl LedgerMetrics {
    /// Registers ledger metrics into the given `Registry`.
    pub fn register(registry: &Registry) -> Result<Self, prometheus::Error> {
        let commit_validation_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "ledger_commit_validation_seconds",
                "Time to validate and append one committed block in seconds",
            )
            .buckets(vec![
                0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0,
            ]),
        )?;
        registry.register(Box::new(commit_validation_seconds.clone()))?;

        let blocks_appended = IntCounter::with_opts(Opts::new(
            "ledger_blocks_appended_total",
            "Total number of blocks appended to the local chain",
        ))?;
        registry.register(Box::new(blocks_appended.clone()))?;

        let commits_rejected = IntCounter::with_opts(Opts::new(
            "ledger_commits_rejected_total",
            "Total number of commits rejected by validation or constraints",
        ))?;
        registry.register(Box::new(commits_rejected.clone()))?;

        let verifier_tick_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "ledger_verifier_tick_seconds",
                "Duration of one verifier tick in seconds",
            )
            .buckets(vec![
                0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
            ]),
        )?;
        registry.register(Box::new(verifier_tick_seconds.clone()))?;

        let chain_height = IntGauge::with_opts(Opts::new(
            "ledger_chain_height",
            "block_number of the current tip (0 on an empty chain)",
        ))?;
        registry.register(Box::new(chain_height.clone()))?;

        let gossip_peers = IntGauge::with_opts(Opts::new(
            "ledger_gossip_peers",
            "Number of currently connected gossip sockets",
        ))?;
        registry.register(Box::new(gossip_peers.clone()))?;

        Ok(Self {
            commit_validation_seconds,
            blocks_appended,
            commits_rejected,
            verifier_tick_seconds,
            chain_height,
            gossip_peers,
        })
    }
}

/// Wrapper around a Prometheus registry and the ledger metrics.
///
/// This is the main handle you pass around in the node. It can be wrapped
/// in an [`Arc`] and shared across threads/tasks.
#[derive(Clone)]
pub struct MetricsRegistry {
    registry: Registry,
    pub ledger: LedgerMetrics,
}

impl MetricsRegistry {
    /// Creates a new `MetricsRegistry` with a fresh underlying `Registry`
    /// and registers the ledger metrics.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new_custom(Some("ledger".to_string()), None)?;
        let ledger = LedgerMetrics::register(&registry)?;
        Ok(Self { registry, ledger })
    }

    /// Encodes all metrics in this registry into the Prometheus text format.
    pub fn gather_text(&self) -> String {
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            tracing::warn!("failed to encode Prometheus metrics: {e}");
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

/// Runs an HTTP server that exposes Prometheus metrics.
///
/// The server listens on `addr` and serves `GET /metrics` with the
/// Prometheus text exposition format. All other paths return 404.
pub async fn run_prometheus_http_server(
    metrics: Arc<MetricsRegistry>,
    addr: SocketAddr,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let listener = TcpListener::bind(addr).await?;

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);
        let metrics = metrics.clone();

        tokio::spawn(async move {
            let svc = service_fn(move |req| {
                let metrics = metrics.clone();
                handle_request(req, metrics)
            });

            if let Err(err) = http1::Builder::new().serve_connection(io, svc).await {
                tracing::warn!("prometheus HTTP server error: {err}");
            }
        });
    }
}

async fn handle_request(
    req: Request<Incoming>,
    metrics: Arc<MetricsRegistry>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    match (req.method(), req.uri().path()) {
        (&Method::GET, "/metrics") => {
            let body = metrics.gather_text();
            Ok(Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, "text/plain; version=0.0.4")
                .body(Full::new(Bytes::from(body)))
                .unwrap())
        }
        _ => Ok(Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Full::new(Bytes::from("not found")))
            .unwrap()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus::Registry;

    #[test]
    fn ledger_metrics_register_and_record() {
        let registry = Registry::new();
        let metrics = LedgerMetrics::register(&registry).expect("register metrics");

        metrics.commit_validation_seconds.observe(0.123);
        metrics.verifier_tick_seconds.observe(0.045);
        metrics.blocks_appended.inc();
        metrics.commits_rejected.inc();
        metrics.chain_height.set(7);
        metrics.gossip_peers.set(2);

        let metric_families = registry.gather();
        assert!(!metric_families.is_empty());
    }

    #[test]
    fn metrics_registry_gather_text_works() {
        let registry = MetricsRegistry::new().expect("create metrics registry");
        registry.ledger.commit_validation_seconds.observe(0.01);
        let text = registry.gather_text();
        assert!(text.contains("ledger_commit_validation_seconds"));
    }
}
