//! Per-protocol in-process listener.
//!
//! # Responsibilities
//! - Queue classified connections for exactly one server task
//! - Expose an `accept` contract like a socket listener
//! - Unblock the consumer when closed, independent of the root listener
//!
//! # Design Decisions
//! - Bounded mpsc queue; the accept loop is the only producer
//! - Closing drops every queued connection (their sockets close with them)

use std::net::SocketAddr;

use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::mux::replay::ReplayStream;
use crate::mux::Protocol;
use crate::net::{ConnectionId, ConnectionPermit};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VirtualListenerError {
    #[error("virtual listener closed")]
    Closed,
}

/// A connection that has been classified and is ready to be served.
#[derive(Debug)]
pub struct MuxedConnection {
    pub id: ConnectionId,
    pub peer_addr: SocketAddr,
    pub protocol: Protocol,
    pub stream: ReplayStream<TcpStream>,
    /// Connection slot on the root listener, released when served or dropped.
    pub permit: ConnectionPermit,
}

/// Create a connected sender/listener pair for one protocol.
pub fn channel(
    protocol: Protocol,
    capacity: usize,
    local_addr: SocketAddr,
) -> (ConnectionSender, VirtualListener) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let close = CancellationToken::new();

    let sender = ConnectionSender {
        protocol,
        tx,
        close: close.clone(),
    };
    let listener = VirtualListener {
        protocol,
        local_addr,
        rx,
        close,
    };
    (sender, listener)
}

/// Producer side, held by the accept loop.
#[derive(Debug, Clone)]
pub struct ConnectionSender {
    protocol: Protocol,
    tx: mpsc::Sender<MuxedConnection>,
    close: CancellationToken,
}

impl ConnectionSender {
    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// Enqueue a connection, waiting for capacity.
    ///
    /// On failure the connection is handed back so the caller decides how to
    /// dispose of it.
    pub async fn send(&self, conn: MuxedConnection) -> Result<(), MuxedConnection> {
        if self.close.is_cancelled() {
            return Err(conn);
        }
        tokio::select! {
            biased;
            _ = self.close.cancelled() => Err(conn),
            slot = self.tx.reserve() => match slot {
                Ok(slot) => {
                    slot.send(conn);
                    Ok(())
                }
                Err(_) => Err(conn),
            },
        }
    }

    /// Close the paired listener.
    pub fn close(&self) {
        self.close.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.close.is_cancelled() || self.tx.is_closed()
    }
}

/// Consumer side, owned by one server task.
#[derive(Debug)]
pub struct VirtualListener {
    protocol: Protocol,
    local_addr: SocketAddr,
    rx: mpsc::Receiver<MuxedConnection>,
    close: CancellationToken,
}

impl VirtualListener {
    /// Wait for the next connection of this protocol.
    ///
    /// Returns [`VirtualListenerError::Closed`] once the listener is closed
    /// or the producer is gone. Connections still queued at close time are
    /// dropped rather than served.
    pub async fn accept(&mut self) -> Result<MuxedConnection, VirtualListenerError> {
        tokio::select! {
            biased;
            _ = self.close.cancelled() => {
                self.rx.close();
                Err(VirtualListenerError::Closed)
            }
            conn = self.rx.recv() => conn.ok_or(VirtualListenerError::Closed),
        }
    }

    /// Close from the consumer side.
    pub fn close(&self) {
        self.close.cancel();
    }

    /// A token that closes this listener when cancelled.
    pub fn close_handle(&self) -> CancellationToken {
        self.close.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.close.is_cancelled()
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// Address of the root listener this virtual listener is fed from.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}
