//! Root TCP listener with backpressure and a single close point.
//!
//! # Responsibilities
//! - Bind to the configured address (listener acquisition)
//! - Accept incoming TCP connections
//! - Enforce max_connections limit via semaphore
//! - Close exactly once, waking every pending accept
//!
//! # Design Decisions
//! - `close_once` is a compare-and-swap; only the first caller closes
//! - Accept after close reports `Closed`, never an OS error
//! - The socket itself is released once the last in-flight accept returns

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::config::ListenerConfig;

/// Error type for listener operations.
#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    /// Failed to bind to address.
    #[error("failed to bind: {0}")]
    Bind(#[source] std::io::Error),
    /// Failed to accept connection.
    #[error("failed to accept: {0}")]
    Accept(#[source] std::io::Error),
    /// The listener was closed.
    #[error("listener closed")]
    Closed,
}

/// The single bound socket every protocol is served from.
///
/// Uses a semaphore to enforce `max_connections`. When the limit is reached,
/// accepting waits until a slot becomes available.
#[derive(Debug)]
pub struct RootListener {
    /// The underlying TCP listener, taken out on close.
    inner: Mutex<Option<Arc<TcpListener>>>,
    local_addr: SocketAddr,
    /// Semaphore to limit concurrent connections.
    connection_limit: Arc<Semaphore>,
    max_connections: usize,
    closed: AtomicBool,
    close_signal: CancellationToken,
}

impl RootListener {
    /// Bind to the configured address with connection limits.
    pub async fn bind(config: &ListenerConfig) -> Result<Self, ListenerError> {
        let addr: SocketAddr = config.bind_address.parse().map_err(|e| {
            ListenerError::Bind(std::io::Error::new(std::io::ErrorKind::InvalidInput, e))
        })?;

        let listener = TcpListener::bind(addr).await.map_err(ListenerError::Bind)?;
        Self::from_tcp(listener, config.max_connections)
    }

    /// Wrap an already bound listener.
    pub fn from_tcp(listener: TcpListener, max_connections: usize) -> Result<Self, ListenerError> {
        let local_addr = listener.local_addr().map_err(ListenerError::Bind)?;

        tracing::info!(
            address = %local_addr,
            max_connections,
            "Listener bound"
        );

        Ok(Self {
            inner: Mutex::new(Some(Arc::new(listener))),
            local_addr,
            connection_limit: Arc::new(Semaphore::new(max_connections)),
            max_connections,
            closed: AtomicBool::new(false),
            close_signal: CancellationToken::new(),
        })
    }

    /// Accept a new connection, respecting the connection limit.
    ///
    /// Returns the stream and a permit that must be held for the connection's
    /// lifetime. Returns [`ListenerError::Closed`] once [`close_once`] ran,
    /// including for calls already waiting.
    ///
    /// [`close_once`]: RootListener::close_once
    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr, ConnectionPermit), ListenerError> {
        let listener = self.current()?;

        // Acquire permit first (backpressure)
        let permit = tokio::select! {
            biased;
            _ = self.close_signal.cancelled() => return Err(ListenerError::Closed),
            permit = self.connection_limit.clone().acquire_owned() => {
                permit.map_err(|_| ListenerError::Closed)?
            }
        };

        // Then accept the connection
        let (stream, addr) = tokio::select! {
            biased;
            _ = self.close_signal.cancelled() => return Err(ListenerError::Closed),
            accepted = listener.accept() => accepted.map_err(ListenerError::Accept)?,
        };

        tracing::debug!(
            peer_addr = %addr,
            available_permits = self.connection_limit.available_permits(),
            "Connection accepted"
        );

        Ok((stream, addr, ConnectionPermit { _permit: permit }))
    }

    /// Close the listener. Returns `true` for the call that actually closed
    /// it and `false` for every later call.
    pub fn close_once(&self) -> bool {
        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        self.close_signal.cancel();
        let released = match self.inner.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        drop(released);

        tracing::info!(address = %self.local_addr, "Listener closed");
        true
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Resolves once the listener has been closed.
    pub async fn closed(&self) {
        self.close_signal.cancelled().await
    }

    /// Get the local address this listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Get current available connection slots.
    pub fn available_permits(&self) -> usize {
        self.connection_limit.available_permits()
    }

    /// Get configured maximum connections.
    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    fn current(&self) -> Result<Arc<TcpListener>, ListenerError> {
        let guard = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.clone().ok_or(ListenerError::Closed)
    }
}

/// A permit representing a connection slot.
///
/// When dropped, the connection slot is released back to the pool.
/// This ensures backpressure is maintained even if the connection handler panics.
#[derive(Debug)]
pub struct ConnectionPermit {
    _permit: tokio::sync::OwnedSemaphorePermit,
}
