//! Metrics collection and exposition.
//!
//! # Metrics
//! - `mux_connections_accepted_total` (counter): connections taken from the root listener
//! - `mux_connections_dispatched_total` (counter): handed to a server task, by protocol
//! - `mux_connections_unmatched_total` (counter): closed unserved, by reason
//! - `server_active_connections` (gauge): connections being served, by protocol
//!
//! # Design Decisions
//! - Recording is a no-op until a recorder is installed
//! - The Prometheus endpoint is optional

use std::net::SocketAddr;

use metrics::{counter, gauge};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

/// Install the Prometheus recorder and serve `/metrics` on `addr`.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!(address = %addr, "Metrics endpoint listening");
    Ok(())
}

pub fn record_connection_accepted() {
    counter!("mux_connections_accepted_total").increment(1);
}

pub fn record_connection_dispatched(protocol: &'static str) {
    counter!("mux_connections_dispatched_total", "protocol" => protocol).increment(1);
}

pub fn record_connection_unmatched(reason: &'static str) {
    counter!("mux_connections_unmatched_total", "reason" => reason).increment(1);
}

pub fn set_active_connections(protocol: &'static str, active: u64) {
    gauge!("server_active_connections", "protocol" => protocol).set(active as f64);
}
