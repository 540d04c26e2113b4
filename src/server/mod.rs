//! Protocol server tasks.
//!
//! # Data Flow
//! ```text
//! VirtualListener::accept
//!     → ServerTask::serve (one task per protocol)
//!     → hyper connection per stream
//!         http → HTTP/1.1 → http.rs router (/healthz, /api/{version}/...)
//!         rpc  → HTTP/2  → tonic routes from rpc.rs (services, health)
//! ```
//!
//! # Design Decisions
//! - One `ServerTask` type; the application kind selects the hyper connection flavour
//! - Phases move `Idle → Serving → Draining → Stopped` and never back
//! - Graceful stop drains in-flight requests, forced stop drops connections

pub mod http;
pub mod rpc;

use std::sync::Mutex;
use std::time::Duration;

use axum::extract::connect_info::ConnectInfo;
use axum::Router;
use hyper::body::Incoming;
use hyper::server::conn::{http1, http2};
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::graceful::GracefulConnection;
use hyper_util::service::TowerToHyperService;
use tokio_util::sync::CancellationToken;
use tonic::service::Routes;
use tower::{Layer, ServiceExt};
use tower_http::trace::TraceLayer;

use crate::mux::{MuxedConnection, Protocol, VirtualListener};
use crate::net::ConnectionTracker;
use crate::observability::metrics;

/// Default limit for an HTTP/1 client to finish sending request headers.
const DEFAULT_HEADER_READ_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum ServeError {
    #[error("{0} server is already serving")]
    AlreadyServing(Protocol),
    #[error("{protocol} server did not drain in time ({in_flight} connections still open)")]
    ShutdownTimeout { protocol: Protocol, in_flight: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Serving,
    Draining,
    Stopped,
}

/// What a server task hands each connection to.
#[derive(Debug, Clone)]
pub enum App {
    /// HTTP/1.1 routes.
    Http(Router),
    /// gRPC services over HTTP/2.
    Rpc(Routes),
}

impl App {
    pub fn protocol(&self) -> Protocol {
        match self {
            App::Http(_) => Protocol::Http,
            App::Rpc(_) => Protocol::Rpc,
        }
    }
}

/// Serves one protocol from one virtual listener.
#[derive(Debug)]
pub struct ServerTask {
    protocol: Protocol,
    app: App,
    header_read_timeout: Duration,
    phase: Mutex<Phase>,
    /// Stop accepting and let connections finish.
    drain: CancellationToken,
    /// Drop every connection now.
    stop: CancellationToken,
    /// Close handle of the listener being served.
    listener_close: Mutex<Option<CancellationToken>>,
    tracker: ConnectionTracker,
}

impl ServerTask {
    pub fn new(app: App) -> Self {
        Self {
            protocol: app.protocol(),
            app,
            header_read_timeout: DEFAULT_HEADER_READ_TIMEOUT,
            phase: Mutex::new(Phase::Idle),
            drain: CancellationToken::new(),
            stop: CancellationToken::new(),
            listener_close: Mutex::new(None),
            tracker: ConnectionTracker::new(),
        }
    }

    /// HTTP/1.1 server for `app`.
    pub fn http(app: Router) -> Self {
        Self::new(App::Http(app))
    }

    /// HTTP/2 (gRPC) server for `routes`.
    pub fn rpc(routes: Routes) -> Self {
        Self::new(App::Rpc(routes))
    }

    pub fn with_header_read_timeout(mut self, timeout: Duration) -> Self {
        self.header_read_timeout = timeout;
        self
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn phase(&self) -> Phase {
        *lock(&self.phase)
    }

    /// Connections currently being served.
    pub fn in_flight(&self) -> u64 {
        self.tracker.active_count()
    }

    /// Serve connections from `listener` until it closes or the task is
    /// stopped, then wait for open connections to finish.
    ///
    /// A task stopped before `serve` returns `Ok(())` immediately.
    pub async fn serve(&self, mut listener: VirtualListener) -> Result<(), ServeError> {
        {
            let mut phase = lock(&self.phase);
            match *phase {
                Phase::Idle => *phase = Phase::Serving,
                Phase::Stopped => {
                    listener.close();
                    return Ok(());
                }
                Phase::Serving | Phase::Draining => {
                    return Err(ServeError::AlreadyServing(self.protocol));
                }
            }
            *lock(&self.listener_close) = Some(listener.close_handle());
        }

        tracing::info!(protocol = %self.protocol, "Server task serving");

        loop {
            tokio::select! {
                biased;
                _ = self.drain.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(conn) => self.spawn_connection(conn),
                    Err(_closed) => break,
                },
            }
        }
        listener.close();
        {
            let mut phase = lock(&self.phase);
            if *phase == Phase::Serving {
                *phase = Phase::Draining;
            }
        }
        // Idle keep-alive connections only close once told to drain.
        self.drain.cancel();

        tokio::select! {
            _ = self.tracker.wait_idle() => {}
            _ = self.stop.cancelled() => self.tracker.wait_idle().await,
        }

        *lock(&self.phase) = Phase::Stopped;
        tracing::info!(protocol = %self.protocol, "Server task stopped");
        Ok(())
    }

    /// Drop every connection and stop accepting. Idempotent.
    pub fn stop(&self) {
        {
            let mut phase = lock(&self.phase);
            if *phase == Phase::Idle {
                *phase = Phase::Stopped;
            }
        }
        self.close_listener();
        self.drain.cancel();
        self.stop.cancel();
    }

    /// Stop accepting, let in-flight requests finish, and force [`stop`]
    /// if they have not finished within `deadline`.
    ///
    /// Idempotent and safe to call concurrently.
    ///
    /// [`stop`]: ServerTask::stop
    pub async fn graceful_stop(&self, deadline: Duration) -> Result<(), ServeError> {
        {
            let mut phase = lock(&self.phase);
            match *phase {
                Phase::Idle => {
                    *phase = Phase::Stopped;
                    drop(phase);
                    self.stop();
                    return Ok(());
                }
                Phase::Serving => *phase = Phase::Draining,
                Phase::Draining | Phase::Stopped => {}
            }
        }

        self.close_listener();
        self.drain.cancel();

        match tokio::time::timeout(deadline, self.tracker.wait_idle()).await {
            Ok(()) => Ok(()),
            Err(_elapsed) => {
                let in_flight = self.tracker.active_count();
                tracing::warn!(
                    protocol = %self.protocol,
                    in_flight,
                    "Graceful stop timed out, forcing"
                );
                self.stop();
                Err(ServeError::ShutdownTimeout {
                    protocol: self.protocol,
                    in_flight,
                })
            }
        }
    }

    fn close_listener(&self) {
        if let Some(close) = lock(&self.listener_close).as_ref() {
            close.cancel();
        }
    }

    fn spawn_connection(&self, conn: MuxedConnection) {
        let MuxedConnection {
            id,
            peer_addr,
            protocol,
            stream,
            permit,
        } = conn;

        let guard = self.tracker.track(id);
        let tracker = self.tracker.clone();
        metrics::set_active_connections(protocol.as_str(), tracker.active_count());

        let app = self.app.clone();
        let io = TokioIo::new(stream);
        let drain = self.drain.clone();
        let stop = self.stop.clone();
        let header_read_timeout = self.header_read_timeout;

        tokio::spawn(async move {
            tracing::debug!(connection_id = %id, peer_addr = %peer_addr, %protocol, "Serving connection");

            let result = match app {
                App::Http(router) => {
                    let service = router.map_request(move |mut request: axum::http::Request<Incoming>| {
                        request.extensions_mut().insert(ConnectInfo(peer_addr));
                        request
                    });
                    let service = TowerToHyperService::new(service);
                    let mut builder = http1::Builder::new();
                    builder
                        .timer(TokioTimer::new())
                        .header_read_timeout(header_read_timeout)
                        .keep_alive(true);
                    drive(builder.serve_connection(io, service), &drain, &stop).await
                }
                App::Rpc(routes) => {
                    let routes = routes.map_request(|request: axum::http::Request<Incoming>| {
                        request.map(tonic::body::boxed)
                    });
                    let service = TowerToHyperService::new(TraceLayer::new_for_grpc().layer(routes));
                    let mut builder = http2::Builder::new(TokioExecutor::new());
                    builder.timer(TokioTimer::new());
                    drive(builder.serve_connection(io, service), &drain, &stop).await
                }
            };

            if let Err(err) = result {
                tracing::debug!(connection_id = %id, error = %err, "Connection error");
            }

            drop(permit);
            drop(guard);
            metrics::set_active_connections(protocol.as_str(), tracker.active_count());
        });
    }
}

/// Run `conn` to completion, shutting it down gracefully on `drain` and
/// dropping it on `stop`.
async fn drive<C>(
    conn: C,
    drain: &CancellationToken,
    stop: &CancellationToken,
) -> Result<(), C::Error>
where
    C: GracefulConnection,
{
    tokio::pin!(conn);

    tokio::select! {
        result = conn.as_mut() => return result,
        _ = stop.cancelled() => return Ok(()),
        _ = drain.cancelled() => {}
    }

    conn.as_mut().graceful_shutdown();

    tokio::select! {
        result = conn.as_mut() => result,
        _ = stop.cancelled() => Ok(()),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
