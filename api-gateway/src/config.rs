//! API gateway configuration.
//!
//! Only the HTTP listen address lives here; everything else comes from
//! `ledger::NodeConfig`, which reads the environment once at startup.

use std::net::SocketAddr;

use ledger::NodeConfig;

/// Configuration for the API gateway HTTP server.
#[derive(Clone, Debug)]
pub struct ApiConfig {
    /// Address to bind the HTTP server to.
    pub listen_addr: SocketAddr,
}

impl ApiConfig {
    /// Binds to all interfaces on the node's configured HTTP port, so the
    /// reverse proxy in front of the node can reach it from outside the
    /// container.
    pub fn from_node(cfg: &NodeConfig) -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], cfg.http_port)),
        }
    }
}
