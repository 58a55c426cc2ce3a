//! Top-level configuration for a ledger node.
//!
//! This module aggregates configuration for:
//!
//! - the HTTP and gossip listen ports and the static peer list,
//! - the database endpoint,
//! - mining parameters (difficulty, advisory timeout, plaintext bound),
//! - the background verifier (period, batch size, minimum age),
//! - the metrics exporter (enable flag + listen address).
//!
//! `NodeConfig::from_env` builds the whole thing from environment
//! variables with the documented defaults, so binaries construct one
//! config at startup and tear it down with the process.

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use crate::types::GENESIS_SENTINEL;

/// Difficulty values a node may be configured with. Blocks themselves
/// admit up to 10 leading zeros; the configurable range is narrower so a
/// misconfigured node cannot stall every client.
pub const DIFFICULTY_RANGE: std::ops::RangeInclusive<u32> = 1..=8;

/// Error raised for a missing or malformed environment variable.
#[derive(Debug)]
pub enum ConfigError {
    Missing(&'static str),
    Invalid { key: &'static str, reason: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Missing(key) => write!(f, "missing required environment variable {key}"),
            ConfigError::Invalid { key, reason } => write!(f, "invalid {key}: {reason}"),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Configuration for the background verifier task.
#[derive(Clone, Debug)]
pub struct VerifierConfig {
    /// Pause between verification ticks.
    pub period: Duration,
    /// Maximum number of pending blocks processed per tick.
    pub batch_size: usize,
    /// Only re-verify blocks older than this; zero disables the cutoff.
    pub min_age: Duration,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            period: Duration::from_secs(60),
            batch_size: 50,
            min_age: Duration::ZERO,
        }
    }
}

/// Configuration for the Prometheus metrics exporter.
#[derive(Clone, Debug)]
pub struct MetricsConfig {
    /// Whether to run a `/metrics` HTTP exporter.
    pub enabled: bool,
    /// Address to bind the metrics HTTP server to.
    pub listen_addr: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        // Safe to unwrap: this is a fixed, valid address literal.
        let addr: SocketAddr = "127.0.0.1:9898"
            .parse()
            .expect("hard-coded metrics listen address should parse");
        Self {
            enabled: true,
            listen_addr: addr,
        }
    }
}

/// Top-level configuration for a ledger node.
#[derive(Clone, Debug)]
pub struct NodeConfig {
    /// HTTP API port (`PORT`).
    pub http_port: u16,
    /// Gossip listen port (`P2P_PORT`).
    pub p2p_port: u16,
    /// Static peer endpoints (`PEERS`, comma-separated `ws://` URLs).
    pub peers: Vec<String>,
    /// Postgres endpoint (`DATABASE_URL`).
    pub database_url: String,
    /// Required leading zeros for new blocks (`DIFFICULTY`).
    pub difficulty: u32,
    /// Advisory ceiling handed to clients; the server itself never mines
    /// (`MINING_TIMEOUT_MS`).
    pub mining_timeout_ms: u64,
    /// Upper bound on plaintext submitted for sealing (`MAX_DATA_SIZE`).
    pub max_data_size: usize,
    /// The genesis sentinel (`GENESIS_HASH`); fixed to 64 `'0'` chars.
    pub genesis_hash: String,
    pub verifier: VerifierConfig,
    pub metrics: MetricsConfig,
}

impl NodeConfig {
    /// Reads the node configuration from the environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let http_port = parse_or("PORT", 4001u16)?;
        let p2p_port = parse_or("P2P_PORT", 6001u16)?;

        let peers = env_var("PEERS")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|p| !p.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let database_url = env_var("DATABASE_URL").ok_or(ConfigError::Missing("DATABASE_URL"))?;

        let difficulty = parse_or("DIFFICULTY", 4u32)?;
        if !DIFFICULTY_RANGE.contains(&difficulty) {
            return Err(ConfigError::Invalid {
                key: "DIFFICULTY",
                reason: format!(
                    "{difficulty} is outside {}..={}",
                    DIFFICULTY_RANGE.start(),
                    DIFFICULTY_RANGE.end()
                ),
            });
        }

        let mining_timeout_ms = parse_or("MINING_TIMEOUT_MS", 120_000u64)?;
        let max_data_size = parse_or("MAX_DATA_SIZE", 1024usize * 1024)?;

        let genesis_hash = env_var("GENESIS_HASH").unwrap_or_else(|| GENESIS_SENTINEL.to_string());
        if genesis_hash != GENESIS_SENTINEL {
            return Err(ConfigError::Invalid {
                key: "GENESIS_HASH",
                reason: "must be the 64-character string of '0'".to_string(),
            });
        }

        let verifier = VerifierConfig {
            period: Duration::from_secs(parse_or("VERIFIER_PERIOD_SECS", 60u64)?),
            batch_size: parse_or("VERIFIER_BATCH", 50usize)?,
            min_age: Duration::from_secs(parse_or("VERIFIER_MIN_AGE_SECS", 0u64)?),
        };

        let mut metrics = MetricsConfig::default();
        if let Some(port) = env_var("METRICS_PORT") {
            let port: u16 = port.parse().map_err(|e| ConfigError::Invalid {
                key: "METRICS_PORT",
                reason: format!("{e}"),
            })?;
            metrics.listen_addr.set_port(port);
        }

        Ok(Self {
            http_port,
            p2p_port,
            peers,
            database_url,
            difficulty,
            mining_timeout_ms,
            max_data_size,
            genesis_hash,
            verifier,
            metrics,
        })
    }
}

fn env_var(key: &str) -> Option<String> {
    match std::env::var(key) {
        Ok(v) if !v.trim().is_empty() => Some(v),
        _ => None,
    }
}

fn parse_or<T>(key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: fmt::Display,
{
    match env_var(key) {
        None => Ok(default),
        Some(raw) => raw.parse().map_err(|e| ConfigError::Invalid {
            key,
            reason: format!("{e}"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Environment-variable tests mutate process state, so everything runs
    // in one test to avoid interference between parallel tests.
    #[test]
    fn from_env_defaults_and_validation() {
        let clear = [
            "PORT",
            "P2P_PORT",
            "PEERS",
            "DIFFICULTY",
            "MINING_TIMEOUT_MS",
            "MAX_DATA_SIZE",
            "GENESIS_HASH",
            "VERIFIER_PERIOD_SECS",
            "VERIFIER_BATCH",
            "VERIFIER_MIN_AGE_SECS",
            "METRICS_PORT",
        ];
        for key in clear {
            unsafe { std::env::remove_var(key) };
        }

        unsafe { std::env::remove_var("DATABASE_URL") };
        assert!(matches!(
            NodeConfig::from_env(),
            Err(ConfigError::Missing("DATABASE_URL"))
        ));

        unsafe { std::env::set_var("DATABASE_URL", "postgres://ledger@localhost/ledger") };
        let cfg = NodeConfig::from_env().expect("defaults should parse");
        assert_eq!(cfg.http_port, 4001);
        assert_eq!(cfg.p2p_port, 6001);
        assert!(cfg.peers.is_empty());
        assert_eq!(cfg.difficulty, 4);
        assert_eq!(cfg.mining_timeout_ms, 120_000);
        assert_eq!(cfg.max_data_size, 1024 * 1024);
        assert_eq!(cfg.genesis_hash, GENESIS_SENTINEL);
        assert_eq!(cfg.verifier.period, Duration::from_secs(60));
        assert_eq!(cfg.verifier.batch_size, 50);

        unsafe { std::env::set_var("PEERS", "ws://node-b:6001, ws://node-c:6001 ,") };
        let cfg = NodeConfig::from_env().expect("peer list should parse");
        assert_eq!(cfg.peers, vec!["ws://node-b:6001", "ws://node-c:6001"]);

        unsafe { std::env::set_var("DIFFICULTY", "9") };
        assert!(matches!(
            NodeConfig::from_env(),
            Err(ConfigError::Invalid { key: "DIFFICULTY", .. })
        ));
        unsafe { std::env::set_var("DIFFICULTY", "1") };
        assert_eq!(NodeConfig::from_env().unwrap().difficulty, 1);
        unsafe { std::env::remove_var("DIFFICULTY") };

        unsafe { std::env::set_var("GENESIS_HASH", "1234") };
        assert!(NodeConfig::from_env().is_err());
        unsafe { std::env::remove_var("GENESIS_HASH") };

        unsafe { std::env::remove_var("DATABASE_URL") };
        unsafe { std::env::remove_var("PEERS") };
    }
}
