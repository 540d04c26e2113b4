//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! Accept loop and server tasks emit:
//!     → logging.rs (tracing events, pretty or JSON lines on stdout)
//!     → metrics.rs (connection counters and per-protocol gauges)
//!
//! Consumers:
//!     → Log aggregation
//!     → Prometheus scrape endpoint, when enabled
//! ```
//!
//! # Design Decisions
//! - Every log line about a connection carries its `connection_id`
//! - Recording a metric without an installed exporter is a no-op

pub mod logging;
pub mod metrics;
