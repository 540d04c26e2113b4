//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → listener.rs (accept, connection limits, single close point)
//!     → mux (classification, hand-off to a protocol)
//!     → connection.rs (lifecycle tracking inside the server task)
//! ```
//!
//! # Design Decisions
//! - Bounded accept via semaphore prevents resource exhaustion
//! - Each served connection is tracked for graceful shutdown
//! - Closing the root listener is the authoritative shutdown trigger

pub mod connection;
pub mod listener;

pub use connection::{ConnectionGuard, ConnectionId, ConnectionTracker};
pub use listener::{ConnectionPermit, ListenerError, RootListener};
