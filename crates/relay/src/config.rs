// Server configuration.
//
// Centralizes environment variable parsing with defaults for local
// development.

use std::net::SocketAddr;
use std::time::Duration;

/// Core server configuration.
///
/// Constructed via [`EngineConfig::from_env`] which reads environment
/// variables and falls back to sensible development defaults.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Listen address (host:port).
    pub listen_addr: SocketAddr,
    /// Log filter directive (e.g. `info`, `peerpad_relay=debug`).
    pub log_filter: String,
    /// Interval between liveness pings; a connection that misses one full
    /// interval is evicted.
    pub ping_interval: Duration,
    /// Quiet period before queued document updates are persisted.
    pub persist_debounce: Duration,
    /// Upper bound on how long a queued update may wait to be persisted.
    pub persist_max_wait: Duration,
    /// Capacity of each room's broadcast channel.
    pub broadcast_capacity: usize,
}

impl EngineConfig {
    /// Parse configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |---|---|
    /// | `PEERPAD_RELAY_HOST` | `0.0.0.0` |
    /// | `PEERPAD_RELAY_PORT` | `8004` |
    /// | `PEERPAD_RELAY_LOG_FILTER` | `info` |
    /// | `PEERPAD_RELAY_PING_INTERVAL_SECS` | `30` |
    /// | `PEERPAD_RELAY_PERSIST_DEBOUNCE_MS` | `2000` |
    /// | `PEERPAD_RELAY_PERSIST_MAX_WAIT_MS` | `10000` |
    /// | `PEERPAD_RELAY_BROADCAST_CAPACITY` | `256` |
    pub fn from_env() -> Self {
        Self::from_env_fn(|key| std::env::var(key))
    }

    /// Testable constructor that accepts an environment lookup function.
    fn from_env_fn<F>(env: F) -> Self
    where
        F: Fn(&str) -> Result<String, std::env::VarError>,
    {
        let host = env("PEERPAD_RELAY_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let port: u16 = env("PEERPAD_RELAY_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(8004);
        let listen_addr = format!("{host}:{port}")
            .parse()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], port)));

        let log_filter =
            env("PEERPAD_RELAY_LOG_FILTER").unwrap_or_else(|_| "info".into());

        let ping_interval_secs: u64 = env("PEERPAD_RELAY_PING_INTERVAL_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(30);

        let persist_debounce_ms: u64 = env("PEERPAD_RELAY_PERSIST_DEBOUNCE_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(2000);

        let persist_max_wait_ms: u64 = env("PEERPAD_RELAY_PERSIST_MAX_WAIT_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(10_000);

        let broadcast_capacity: usize = env("PEERPAD_RELAY_BROADCAST_CAPACITY")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(256);

        Self {
            listen_addr,
            log_filter,
            ping_interval: Duration::from_secs(ping_interval_secs),
            persist_debounce: Duration::from_millis(persist_debounce_ms),
            persist_max_wait: Duration::from_millis(persist_max_wait_ms),
            broadcast_capacity,
        }
    }
}
