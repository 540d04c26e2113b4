//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the server.
//! All types derive Serde traits for deserialization from config files.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::mux::matcher::GRPC_CONTENT_TYPES;
use crate::mux::{MuxSettings, Protocol, RuleSet};

/// Root configuration for the multiplexed server.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ServerConfig {
    /// Service identity reported by health checks and logs.
    pub service: ServiceConfig,

    /// Listener configuration (bind address, connection limit).
    pub listener: ListenerConfig,

    /// Which protocols to serve.
    pub protocol: ProtocolMode,

    /// Connection classification settings.
    pub mux: MuxConfig,

    /// HTTP/1 server settings.
    pub http: HttpConfig,

    /// Timeout configuration.
    pub timeouts: TimeoutConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Service identity.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub name: String,
    pub version: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:4000").
    pub bind_address: String,

    /// Maximum concurrent connections (backpressure).
    pub max_connections: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:4000".to_string(),
            max_connections: 10_000,
        }
    }
}

/// Protocols served from the shared listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolMode {
    #[default]
    Both,
    Http,
    #[serde(alias = "grpc")]
    Rpc,
}

impl ProtocolMode {
    pub fn protocols(&self) -> Vec<Protocol> {
        match self {
            ProtocolMode::Both => Protocol::ALL.to_vec(),
            ProtocolMode::Http => vec![Protocol::Http],
            ProtocolMode::Rpc => vec![Protocol::Rpc],
        }
    }
}

impl fmt::Display for ProtocolMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ProtocolMode::Both => "both",
            ProtocolMode::Http => "http",
            ProtocolMode::Rpc => "rpc",
        })
    }
}

impl FromStr for ProtocolMode {
    type Err = String;

    /// An empty string selects both protocols.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "both" => Ok(ProtocolMode::Both),
            "http" => Ok(ProtocolMode::Http),
            "rpc" | "grpc" => Ok(ProtocolMode::Rpc),
            other => Err(format!("unknown protocol mode {other:?} (expected http, grpc or both)")),
        }
    }
}

/// How gRPC connections are recognised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RpcMatch {
    /// Any HTTP/2 connection preface.
    #[default]
    Preface,
    /// HTTP/2 whose first request carries a gRPC content-type.
    ContentType,
}

/// Connection classification settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MuxConfig {
    /// Maximum bytes read to classify a connection.
    pub lookahead_bytes: usize,

    /// Time a client has to send enough bytes to be classified.
    pub match_timeout_ms: u64,

    /// Per-protocol hand-off queue capacity.
    pub queue_capacity: usize,

    /// Connections classified concurrently.
    pub max_pending: usize,

    pub rpc_match: RpcMatch,

    /// Accepted content-types when `rpc_match = "content_type"`.
    pub rpc_content_types: Vec<String>,
}

impl Default for MuxConfig {
    fn default() -> Self {
        let settings = MuxSettings::default();
        Self {
            lookahead_bytes: settings.lookahead,
            match_timeout_ms: settings.match_timeout.as_millis() as u64,
            queue_capacity: settings.queue_capacity,
            max_pending: settings.max_pending,
            rpc_match: RpcMatch::default(),
            rpc_content_types: GRPC_CONTENT_TYPES.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl MuxConfig {
    pub fn settings(&self) -> MuxSettings {
        MuxSettings {
            lookahead: self.lookahead_bytes,
            match_timeout: Duration::from_millis(self.match_timeout_ms),
            max_pending: self.max_pending,
            queue_capacity: self.queue_capacity,
        }
    }

    pub fn rule_set(&self) -> RuleSet {
        match self.rpc_match {
            RpcMatch::Preface => RuleSet::preface_default(),
            RpcMatch::ContentType => RuleSet::content_type_default(&self.rpc_content_types),
        }
    }
}

/// HTTP/1 server settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Application routes are mounted under `/api/{api_version}`.
    pub api_version: String,

    /// Request timeout in seconds.
    pub request_timeout_secs: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            api_version: "v1".to_string(),
            request_timeout_secs: 30,
        }
    }
}

/// Timeout configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// HTTP/1 request header read timeout in seconds.
    pub header_read_secs: u64,

    /// Time in-flight requests get to finish on shutdown.
    pub shutdown_grace_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            header_read_secs: 10,
            shutdown_grace_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human readable, for terminals.
    #[default]
    Pretty,
    /// One JSON object per line.
    Json,
}

/// Observability settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level filter, overridden by `RUST_LOG`.
    pub log_level: String,

    pub log_format: LogFormat,

    /// Enable the Prometheus scrape endpoint.
    pub metrics_enabled: bool,

    /// Address of the Prometheus scrape endpoint.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::default(),
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}
