//! Connection multiplexing subsystem.
//!
//! # Data Flow
//! ```text
//! RootListener::accept
//!     → accept.rs (accept loop, bounded concurrent classification)
//!     → replay.rs (sniff: read lookahead, keep every byte)
//!     → matcher.rs (ordered rules → protocol tag)
//!         → hpack.rs (HTTP/2 header block decoding for header-field rules)
//!     → virtual_listener.rs (per-protocol queue)
//!     → ServerTask::serve
//! ```
//!
//! # Design Decisions
//! - Rules are evaluated in declaration order; an undecided earlier rule
//!   blocks later ones, so overlapping rules always resolve to the first
//! - Classification never writes to the socket and never discards bytes
//! - Classification runs concurrently, delivery happens in accept order
//! - Unmatched connections are closed and counted, never fatal

pub mod accept;
pub mod hpack;
pub mod matcher;
pub mod replay;
pub mod virtual_listener;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub use accept::{AcceptLoop, MismatchReason, MuxError, MuxSettings, MuxStats, MuxStatsSnapshot};
pub use matcher::{
    AnyMatcher, Classification, Http1Matcher, Http2HeaderMatcher, MatchResult, MatchRule,
    Matcher, PrefixMatcher, RuleSet,
};
pub use replay::{sniff, ReplayStream};
pub use virtual_listener::{ConnectionSender, MuxedConnection, VirtualListener, VirtualListenerError};

/// Protocol tag identifying which server task owns a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// HTTP/1.x request/response traffic.
    Http,
    /// gRPC over HTTP/2.
    Rpc,
}

impl Protocol {
    /// All protocol tags, in a stable order.
    pub const ALL: [Protocol; 2] = [Protocol::Http, Protocol::Rpc];

    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Http => "http",
            Protocol::Rpc => "rpc",
        }
    }

    pub(crate) fn index(&self) -> usize {
        match self {
            Protocol::Http => 0,
            Protocol::Rpc => 1,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown protocol tag.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown protocol tag: {0:?}")]
pub struct UnknownProtocol(pub String);

impl FromStr for Protocol {
    type Err = UnknownProtocol;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "http" => Ok(Protocol::Http),
            "rpc" | "grpc" => Ok(Protocol::Rpc),
            other => Err(UnknownProtocol(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_parses_aliases() {
        assert_eq!("http".parse::<Protocol>().unwrap(), Protocol::Http);
        assert_eq!("GRPC".parse::<Protocol>().unwrap(), Protocol::Rpc);
        assert_eq!(" rpc ".parse::<Protocol>().unwrap(), Protocol::Rpc);
        assert!("smtp".parse::<Protocol>().is_err());
    }

    #[test]
    fn protocol_indices_are_distinct() {
        assert_ne!(Protocol::Http.index(), Protocol::Rpc.index());
        assert_eq!(Protocol::ALL.len(), 2);
    }
}
