//! Semantic validation of a parsed configuration.
//!
//! Serde handles syntax and types; this module checks values that parse but
//! cannot work. Every problem is reported, not just the first.

use std::net::SocketAddr;

use crate::config::schema::{RpcMatch, ServerConfig};
use crate::mux::matcher::HTTP2_PREFACE;

/// Upper bound for the classification lookahead.
const MAX_LOOKAHEAD: usize = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{field}: {message}")]
pub struct ValidationError {
    pub field: &'static str,
    pub message: String,
}

impl ValidationError {
    fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

pub fn validate_config(config: &ServerConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new(
            "listener.bind_address",
            format!("{:?} is not a socket address", config.listener.bind_address),
        ));
    }
    if config.listener.max_connections == 0 {
        errors.push(ValidationError::new("listener.max_connections", "must be at least 1"));
    }

    let mux = &config.mux;
    if mux.lookahead_bytes < HTTP2_PREFACE.len() || mux.lookahead_bytes > MAX_LOOKAHEAD {
        errors.push(ValidationError::new(
            "mux.lookahead_bytes",
            format!("must be between {} and {MAX_LOOKAHEAD}", HTTP2_PREFACE.len()),
        ));
    }
    if mux.match_timeout_ms == 0 {
        errors.push(ValidationError::new("mux.match_timeout_ms", "must be positive"));
    }
    if mux.queue_capacity == 0 {
        errors.push(ValidationError::new("mux.queue_capacity", "must be at least 1"));
    }
    if mux.max_pending == 0 {
        errors.push(ValidationError::new("mux.max_pending", "must be at least 1"));
    }
    if mux.rpc_match == RpcMatch::ContentType && mux.rpc_content_types.is_empty() {
        errors.push(ValidationError::new(
            "mux.rpc_content_types",
            "required when rpc_match = \"content_type\"",
        ));
    }

    let api_version = config.http.api_version.trim_matches('/');
    if api_version.is_empty()
        || api_version.contains('/')
        || api_version.contains(|c: char| c.is_whitespace() || c == '{' || c == '}' || c == '*')
    {
        errors.push(ValidationError::new(
            "http.api_version",
            format!("{:?} is not a single path segment", config.http.api_version),
        ));
    }
    if config.http.request_timeout_secs == 0 {
        errors.push(ValidationError::new("http.request_timeout_secs", "must be positive"));
    }
    if config.timeouts.header_read_secs == 0 {
        errors.push(ValidationError::new("timeouts.header_read_secs", "must be positive"));
    }

    if config.observability.metrics_enabled
        && config.observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::new(
            "observability.metrics_address",
            format!("{:?} is not a socket address", config.observability.metrics_address),
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
