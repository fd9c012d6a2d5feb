//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for connections
//! and servers. All types derive Serde traits for deserialization from
//! config files.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::protocol::Charset;

/// Root configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
#[serde(default)]
pub struct Settings {
    /// Framing and control tokens.
    pub codec: CodecConfig,

    /// Per-connection session behaviour.
    pub connection: ConnectionConfig,

    /// Accept loop and connection bookkeeping.
    pub server: ServerConfig,

    /// Logging and metrics.
    pub observability: ObservabilityConfig,
}

/// Message codec configuration.
///
/// The three control tokens must be mutually distinct and none of them may
/// carry the data tag at the tag offset.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct CodecConfig {
    /// Marker inserted into every application payload.
    pub data_tag: String,

    /// Character offset where the data tag is inserted.
    pub data_tag_offset: usize,

    /// Ping token.
    pub ping: String,

    /// Client greeting token.
    pub hello: String,

    /// Server answer to the greeting.
    pub server_ready: String,

    /// Text encoding used before armoring.
    pub charset: Charset,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            data_tag: "#DATA#".to_string(),
            data_tag_offset: 0,
            ping: String::new(),
            hello: "#HELLO#".to_string(),
            server_ready: "#SERVER_READY#".to_string(),
            charset: Charset::Utf8,
        }
    }
}

/// Connection session configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Seconds of peer silence before the watchdog shuts the connection down.
    pub ttl_secs: u64,

    /// Delay between session cycles (ping + drain) in milliseconds.
    pub cycle_delay_ms: u64,

    /// Maximum inbound frames processed per cycle; 0 drains everything available.
    pub max_reads_per_cycle: usize,

    /// Upper bound for a `ping()` probe in milliseconds.
    pub probe_timeout_ms: u64,

    /// Largest transport frame accepted from the peer.
    pub max_frame_bytes: usize,
}

impl ConnectionConfig {
    pub fn cycle_delay(&self) -> Duration {
        Duration::from_millis(self.cycle_delay_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 5,
            cycle_delay_ms: 200,
            max_reads_per_cycle: 0,
            probe_timeout_ms: 2000,
            max_frame_bytes: 8 * 1024 * 1024, // 8 MiB
        }
    }
}

/// Server configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    /// Host or address the listener binds to.
    pub bind_host: String,

    /// Listening port (0 picks an ephemeral port).
    pub port: u16,

    /// When true the accept loop waits for an explicit `Server::start`.
    pub manual_start: bool,

    /// Delay before each accept attempt in milliseconds.
    pub accept_delay_ms: u64,

    /// How long teardown waits for pending deregistrations, in milliseconds.
    pub drain_timeout_ms: u64,

    /// Concurrent deregistration jobs.
    pub worker_pool_size: usize,
}

impl ServerConfig {
    pub fn accept_delay(&self) -> Duration {
        Duration::from_millis(self.accept_delay_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_host: "0.0.0.0".to_string(),
            port: 11000,
            manual_start: false,
            accept_delay_ms: 20,
            drain_timeout_ms: 5000,
            worker_pool_size: 8,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable the Prometheus scrape endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9090".to_string(),
        }
    }
}
