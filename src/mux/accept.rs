//! Multiplexed accept loop.
//!
//! # Responsibilities
//! - Own the accept side of the root listener
//! - Classify each connection concurrently under a match timeout
//! - Deliver classified connections to per-protocol virtual listeners in accept order
//! - Close and count connections nobody can serve
//!
//! # Design Decisions
//! - Classifications run in an ordered queue: concurrent sniffing, ordered delivery
//! - Ordered delivery means a slow client delays the connections accepted after
//!   it, for at most `match_timeout`; no later connection is dropped for it
//! - A mismatch is never fatal; it only closes that one connection
//! - Listener closure is expected only after shutdown began

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{FuturesOrdered, StreamExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use crate::mux::matcher::{Classification, RuleSet};
use crate::mux::replay::{sniff, ReplayStream};
use crate::mux::virtual_listener::{ConnectionSender, MuxedConnection};
use crate::mux::Protocol;
use crate::net::{ConnectionId, ConnectionPermit, ListenerError, RootListener};
use crate::observability::metrics;

/// Delay before accepting again after the process ran out of descriptors.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

#[cfg(unix)]
const EMFILE: i32 = 24;
#[cfg(unix)]
const ENFILE: i32 = 23;

/// Fatal accept loop failures.
#[derive(Debug, thiserror::Error)]
pub enum MuxError {
    /// The root listener closed while no shutdown was in progress.
    #[error("root listener closed unexpectedly")]
    UnexpectedClosure,
    /// Accepting failed with a non-transient error.
    #[error("accept failed: {0}")]
    Accept(#[source] io::Error),
}

/// Why a connection was closed without being served.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MismatchReason {
    /// No rule matched within the lookahead budget.
    NoRule,
    /// The client did not send enough bytes within the match timeout.
    Timeout,
    /// Reading the lookahead failed.
    Io,
    /// The matched protocol has no server task, or its listener is closed.
    NoServer,
}

impl MismatchReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            MismatchReason::NoRule => "no_rule",
            MismatchReason::Timeout => "timeout",
            MismatchReason::Io => "io",
            MismatchReason::NoServer => "no_server",
        }
    }
}

/// Tunables for classification.
#[derive(Debug, Clone)]
pub struct MuxSettings {
    /// Maximum bytes read before giving up on classification.
    pub lookahead: usize,
    /// Time a client has to send enough bytes to be classified.
    pub match_timeout: Duration,
    /// Connections being classified at once.
    pub max_pending: usize,
    /// Capacity of each virtual listener queue.
    pub queue_capacity: usize,
}

impl Default for MuxSettings {
    fn default() -> Self {
        Self {
            lookahead: 8192,
            match_timeout: Duration::from_secs(5),
            max_pending: 1024,
            queue_capacity: 128,
        }
    }
}

/// Diagnostic counters for the accept loop.
#[derive(Debug, Default)]
pub struct MuxStats {
    accepted: AtomicU64,
    dispatched: [AtomicU64; 2],
    no_rule: AtomicU64,
    timeout: AtomicU64,
    io: AtomicU64,
    no_server: AtomicU64,
}

/// Point-in-time copy of [`MuxStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MuxStatsSnapshot {
    pub accepted: u64,
    pub dispatched_http: u64,
    pub dispatched_rpc: u64,
    pub no_rule: u64,
    pub timeout: u64,
    pub io: u64,
    pub no_server: u64,
}

impl MuxStatsSnapshot {
    pub fn unmatched(&self) -> u64 {
        self.no_rule + self.timeout + self.io + self.no_server
    }
}

impl MuxStats {
    pub fn new() -> Self {
        Self::default()
    }

    fn record_accepted(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
        metrics::record_connection_accepted();
    }

    fn record_dispatched(&self, protocol: Protocol) {
        self.dispatched[protocol.index()].fetch_add(1, Ordering::Relaxed);
        metrics::record_connection_dispatched(protocol.as_str());
    }

    fn record_unmatched(&self, reason: MismatchReason) {
        let counter = match reason {
            MismatchReason::NoRule => &self.no_rule,
            MismatchReason::Timeout => &self.timeout,
            MismatchReason::Io => &self.io,
            MismatchReason::NoServer => &self.no_server,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        metrics::record_connection_unmatched(reason.as_str());
    }

    pub fn snapshot(&self) -> MuxStatsSnapshot {
        MuxStatsSnapshot {
            accepted: self.accepted.load(Ordering::Relaxed),
            dispatched_http: self.dispatched[Protocol::Http.index()].load(Ordering::Relaxed),
            dispatched_rpc: self.dispatched[Protocol::Rpc.index()].load(Ordering::Relaxed),
            no_rule: self.no_rule.load(Ordering::Relaxed),
            timeout: self.timeout.load(Ordering::Relaxed),
            io: self.io.load(Ordering::Relaxed),
            no_server: self.no_server.load(Ordering::Relaxed),
        }
    }
}

/// Result of classifying one connection.
struct Classified {
    id: ConnectionId,
    peer_addr: SocketAddr,
    permit: ConnectionPermit,
    outcome: Result<(Protocol, ReplayStream<TcpStream>), MismatchReason>,
}

/// Accepts from the root listener and feeds the virtual listeners.
pub struct AcceptLoop {
    listener: Arc<RootListener>,
    rules: Arc<RuleSet>,
    routes: HashMap<Protocol, ConnectionSender>,
    settings: MuxSettings,
    shutdown: CancellationToken,
    stats: Arc<MuxStats>,
}

impl AcceptLoop {
    /// `shutdown` is cancelled by the owner before it closes the listener;
    /// a closure observed without it is reported as unexpected.
    pub fn new(
        listener: Arc<RootListener>,
        rules: Arc<RuleSet>,
        routes: impl IntoIterator<Item = ConnectionSender>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            listener,
            rules,
            routes: routes.into_iter().map(|s| (s.protocol(), s)).collect(),
            settings: MuxSettings::default(),
            shutdown,
            stats: Arc::new(MuxStats::new()),
        }
    }

    pub fn with_settings(mut self, settings: MuxSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_stats(mut self, stats: Arc<MuxStats>) -> Self {
        self.stats = stats;
        self
    }

    pub fn stats(&self) -> Arc<MuxStats> {
        Arc::clone(&self.stats)
    }

    /// Run until the root listener closes.
    ///
    /// Every virtual listener is closed on return, whatever the outcome.
    pub async fn run(self) -> Result<(), MuxError> {
        let max_pending = self.settings.max_pending.max(1);
        let mut pending = FuturesOrdered::new();

        let protocols: Vec<Protocol> = self.routes.keys().copied().collect();
        tracing::info!(
            address = %self.listener.local_addr(),
            rules = self.rules.rules().len(),
            protocols = ?protocols,
            "Accept loop started"
        );

        let result = loop {
            tokio::select! {
                accepted = self.listener.accept(), if pending.len() < max_pending => {
                    match accepted {
                        Ok((stream, peer_addr, permit)) => {
                            self.stats.record_accepted();
                            pending.push_back(classify(
                                stream,
                                peer_addr,
                                permit,
                                Arc::clone(&self.rules),
                                self.settings.lookahead,
                                self.settings.match_timeout,
                            ));
                        }
                        Err(ListenerError::Closed) => break self.on_closed(),
                        Err(ListenerError::Accept(err) | ListenerError::Bind(err)) => {
                            if is_transient(&err) {
                                tracing::debug!(error = %err, "Transient accept error");
                            } else if is_resource_exhaustion(&err) {
                                tracing::warn!(error = %err, "Out of file descriptors, backing off");
                                tokio::select! {
                                    _ = tokio::time::sleep(ACCEPT_BACKOFF) => {}
                                    _ = self.listener.closed() => {}
                                }
                            } else {
                                tracing::error!(error = %err, "Accept failed");
                                break Err(MuxError::Accept(err));
                            }
                        }
                    }
                }
                Some(classified) = pending.next(), if !pending.is_empty() => {
                    self.dispatch(classified).await;
                }
            }
        };

        for route in self.routes.values() {
            route.close();
        }
        if !pending.is_empty() {
            tracing::debug!(dropped = pending.len(), "Dropping connections still being classified");
        }
        tracing::info!(stats = ?self.stats.snapshot(), "Accept loop stopped");
        result
    }

    fn on_closed(&self) -> Result<(), MuxError> {
        if self.shutdown.is_cancelled() {
            Ok(())
        } else {
            tracing::error!("Root listener closed outside shutdown");
            Err(MuxError::UnexpectedClosure)
        }
    }

    async fn dispatch(&self, classified: Classified) {
        let Classified {
            id,
            peer_addr,
            permit,
            outcome,
        } = classified;

        let (protocol, stream) = match outcome {
            Ok(matched) => matched,
            Err(reason) => return self.reject(id, peer_addr, reason),
        };

        let Some(route) = self.routes.get(&protocol) else {
            return self.reject(id, peer_addr, MismatchReason::NoServer);
        };

        let conn = MuxedConnection {
            id,
            peer_addr,
            protocol,
            stream,
            permit,
        };

        tokio::select! {
            biased;
            _ = self.listener.closed() => {
                tracing::debug!(connection_id = %id, %protocol, "Listener closed before hand-off");
            }
            sent = route.send(conn) => match sent {
                Ok(()) => {
                    self.stats.record_dispatched(protocol);
                    tracing::debug!(connection_id = %id, peer_addr = %peer_addr, %protocol, "Connection dispatched");
                }
                Err(_conn) => self.reject(id, peer_addr, MismatchReason::NoServer),
            }
        }
    }

    fn reject(&self, id: ConnectionId, peer_addr: SocketAddr, reason: MismatchReason) {
        self.stats.record_unmatched(reason);
        tracing::debug!(
            connection_id = %id,
            peer_addr = %peer_addr,
            reason = reason.as_str(),
            "Closing unclassified connection"
        );
    }
}

async fn classify(
    stream: TcpStream,
    peer_addr: SocketAddr,
    permit: ConnectionPermit,
    rules: Arc<RuleSet>,
    lookahead: usize,
    match_timeout: Duration,
) -> Classified {
    let id = ConnectionId::new();
    let outcome = match tokio::time::timeout(match_timeout, sniff(stream, &rules, lookahead)).await {
        Err(_elapsed) => Err(MismatchReason::Timeout),
        Ok(Err(err)) => {
            tracing::trace!(connection_id = %id, error = %err, "Sniff read failed");
            Err(MismatchReason::Io)
        }
        Ok(Ok((Classification::Matched(protocol), stream))) => Ok((protocol, stream)),
        Ok(Ok((_, _stream))) => Err(MismatchReason::NoRule),
    };

    Classified {
        id,
        peer_addr,
        permit,
        outcome,
    }
}

fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
    )
}

#[cfg(unix)]
fn is_resource_exhaustion(err: &io::Error) -> bool {
    matches!(err.raw_os_error(), Some(EMFILE) | Some(ENFILE))
}

#[cfg(not(unix))]
fn is_resource_exhaustion(_err: &io::Error) -> bool {
    false
}
