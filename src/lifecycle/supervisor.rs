//! Supervisor: one scope for the accept loop and every server task.
//!
//! # Responsibilities
//! - Start the accept loop and the server tasks together
//! - Keep the first fatal error, cancel everything else on it
//! - Close the root listener and the virtual listeners on shutdown
//! - Drive graceful or forced stop of the server tasks
//!
//! # Design Decisions
//! - A shutdown watcher is the only caller of `close_once` during `run`
//! - External cancellation is graceful and makes `run` return `Ok(())`
//! - A unit failure forces shutdown; later failures are only logged

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::join_all;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::lifecycle::state::{Lifecycle, LifecycleState, ShutdownMode};
use crate::mux::{
    virtual_listener, AcceptLoop, ConnectionSender, MuxError, MuxSettings, MuxStats, Protocol,
    RuleSet,
};
use crate::net::{ListenerError, RootListener};
use crate::server::{ServeError, ServerTask};

/// Default time server tasks get to drain on a graceful shutdown.
const DEFAULT_GRACE: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("root listener unavailable: {0}")]
    Bind(#[source] ListenerError),
    #[error("supervisor already started")]
    AlreadyStarted,
    #[error("no server tasks configured")]
    NoServers,
    #[error("more than one server task for protocol {0}")]
    DuplicateServer(Protocol),
    #[error(transparent)]
    Mux(#[from] MuxError),
    #[error(transparent)]
    Serve(#[from] ServeError),
    #[error("supervised task panicked: {0}")]
    UnitPanicked(String),
    #[error("shutdown did not finish within {0:?}")]
    ShutdownTimeout(Duration),
}

/// Coordinates startup, error propagation and shutdown.
pub struct Supervisor {
    listener: Arc<RootListener>,
    rules: Arc<RuleSet>,
    settings: MuxSettings,
    servers: Vec<Arc<ServerTask>>,
    grace: Duration,
    lifecycle: Lifecycle,
    internal: CancellationToken,
    started: AtomicBool,
    first_error: Mutex<Option<SupervisorError>>,
    stats: Arc<MuxStats>,
}

impl Supervisor {
    /// Rules naming a protocol without a server task are dropped.
    pub fn new(
        listener: Arc<RootListener>,
        mut rules: RuleSet,
        servers: Vec<ServerTask>,
    ) -> Result<Self, SupervisorError> {
        if servers.is_empty() {
            return Err(SupervisorError::NoServers);
        }
        let mut seen = HashSet::new();
        for server in &servers {
            if !seen.insert(server.protocol()) {
                return Err(SupervisorError::DuplicateServer(server.protocol()));
            }
        }

        let enabled: Vec<Protocol> = servers.iter().map(|s| s.protocol()).collect();
        rules.retain_protocols(&enabled);

        Ok(Self {
            listener,
            rules: Arc::new(rules),
            settings: MuxSettings::default(),
            servers: servers.into_iter().map(Arc::new).collect(),
            grace: DEFAULT_GRACE,
            lifecycle: Lifecycle::new(),
            internal: CancellationToken::new(),
            started: AtomicBool::new(false),
            first_error: Mutex::new(None),
            stats: Arc::new(MuxStats::new()),
        })
    }

    pub fn with_settings(mut self, settings: MuxSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Drain deadline used when `run` is cancelled from outside.
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn state(&self) -> LifecycleState {
        self.lifecycle.state()
    }

    pub fn listener(&self) -> &Arc<RootListener> {
        &self.listener
    }

    pub fn stats(&self) -> Arc<MuxStats> {
        Arc::clone(&self.stats)
    }

    pub fn server(&self, protocol: Protocol) -> Option<&Arc<ServerTask>> {
        self.servers.iter().find(|s| s.protocol() == protocol)
    }

    /// Serve until `ctx` is cancelled, [`shutdown`] is called, or a unit fails.
    ///
    /// Returns the first unit error, or `Ok(())` for a requested shutdown.
    ///
    /// [`shutdown`]: Supervisor::shutdown
    pub async fn run(&self, ctx: CancellationToken) -> Result<(), SupervisorError> {
        match self.lifecycle.start() {
            LifecycleState::Created => {}
            state if state.is_shutting_down() && !self.started.load(Ordering::Acquire) => {
                // Shut down before it ever ran.
                self.lifecycle.finish();
                return Ok(());
            }
            _ => return Err(SupervisorError::AlreadyStarted),
        }
        self.started.store(true, Ordering::Release);

        if let Some(outcome) = self.closed_listener_outcome() {
            return outcome;
        }

        let mut senders = Vec::with_capacity(self.servers.len());
        let mut units: JoinSet<(String, Result<(), SupervisorError>)> = JoinSet::new();

        for server in &self.servers {
            let (tx, rx) = virtual_listener::channel(
                server.protocol(),
                self.settings.queue_capacity,
                self.listener.local_addr(),
            );
            senders.push(tx);

            let server = Arc::clone(server);
            units.spawn(async move {
                let name = format!("{} server", server.protocol());
                (name, server.serve(rx).await.map_err(SupervisorError::from))
            });
        }

        let watcher = tokio::spawn(watch_shutdown(ShutdownWatch {
            ctx,
            internal: self.internal.clone(),
            lifecycle: self.lifecycle.clone(),
            listener: Arc::clone(&self.listener),
            senders: senders.clone(),
            servers: self.servers.clone(),
            grace: self.grace,
        }));

        let accept = AcceptLoop::new(
            Arc::clone(&self.listener),
            Arc::clone(&self.rules),
            senders,
            self.internal.clone(),
        )
        .with_settings(self.settings.clone())
        .with_stats(Arc::clone(&self.stats));
        units.spawn(async move {
            (
                "accept loop".to_string(),
                accept.run().await.map_err(SupervisorError::from),
            )
        });

        tracing::info!(
            address = %self.listener.local_addr(),
            servers = self.servers.len(),
            "Supervisor running"
        );

        while let Some(joined) = units.join_next().await {
            match joined {
                Ok((unit, Ok(()))) => tracing::debug!(unit = %unit, "Unit finished"),
                Ok((unit, Err(err))) => self.fail(&unit, err),
                Err(join_err) => {
                    self.fail("task", SupervisorError::UnitPanicked(join_err.to_string()));
                }
            }
        }

        // Release the watcher if nothing triggered it.
        self.internal.cancel();
        if let Err(err) = watcher.await {
            tracing::error!(error = %err, "Shutdown watcher panicked");
        }

        self.lifecycle.finish();
        let first = lock(&self.first_error).take();
        match first {
            Some(err) => {
                tracing::error!(error = %err, "Supervisor stopped with error");
                Err(err)
            }
            None => {
                tracing::info!("Supervisor stopped");
                Ok(())
            }
        }
    }

    /// Gracefully stop everything within `deadline`.
    ///
    /// Safe to call concurrently with [`run`] and more than once.
    ///
    /// [`run`]: Supervisor::run
    pub async fn shutdown(&self, deadline: Duration) -> Result<(), SupervisorError> {
        let work = async {
            self.lifecycle.begin_shutdown(ShutdownMode::Graceful);
            self.internal.cancel();

            let results = join_all(self.servers.iter().map(|s| s.graceful_stop(deadline))).await;
            self.listener.close_once();

            if self.started.load(Ordering::Acquire) {
                self.lifecycle.stopped().await;
            }

            match results.into_iter().find_map(Result::err) {
                Some(ServeError::ShutdownTimeout { .. }) => {
                    Err(SupervisorError::ShutdownTimeout(deadline))
                }
                Some(err) => Err(SupervisorError::Serve(err)),
                None => Ok(()),
            }
        };

        match tokio::time::timeout(deadline, work).await {
            Ok(result) => result,
            Err(_elapsed) => {
                tracing::warn!(?deadline, "Shutdown deadline exceeded, forcing stop");
                for server in &self.servers {
                    server.stop();
                }
                Err(SupervisorError::ShutdownTimeout(deadline))
            }
        }
    }

    /// A listener closed by a shutdown that raced `run` is a clean stop;
    /// closed for any other reason it is a bind failure.
    fn closed_listener_outcome(&self) -> Option<Result<(), SupervisorError>> {
        if !self.listener.is_closed() {
            return None;
        }
        let requested = self.lifecycle.is_shutting_down();
        self.lifecycle.finish();
        if requested {
            Some(Ok(()))
        } else {
            Some(Err(SupervisorError::Bind(ListenerError::Closed)))
        }
    }

    fn fail(&self, unit: &str, err: SupervisorError) {
        self.lifecycle.begin_shutdown(ShutdownMode::Forced);
        {
            let mut slot = lock(&self.first_error);
            if slot.is_none() {
                tracing::error!(unit, error = %err, "Unit failed, shutting down");
                *slot = Some(err);
            } else {
                tracing::debug!(unit, error = %err, "Discarding later unit error");
            }
        }
        self.internal.cancel();
    }
}

struct ShutdownWatch {
    ctx: CancellationToken,
    internal: CancellationToken,
    lifecycle: Lifecycle,
    listener: Arc<RootListener>,
    senders: Vec<ConnectionSender>,
    servers: Vec<Arc<ServerTask>>,
    grace: Duration,
}

async fn watch_shutdown(watch: ShutdownWatch) {
    tokio::select! {
        _ = watch.ctx.cancelled() => {
            tracing::info!("Shutdown requested");
        }
        _ = watch.internal.cancelled() => {}
    }

    watch.lifecycle.begin_shutdown(ShutdownMode::Graceful);
    // The accept loop reads this before it sees the listener close.
    watch.internal.cancel();

    if watch.listener.close_once() {
        tracing::debug!("Root listener closed by shutdown watcher");
    }
    for sender in &watch.senders {
        sender.close();
    }

    match watch.lifecycle.state() {
        LifecycleState::ShuttingDownForced => {
            for server in &watch.servers {
                server.stop();
            }
        }
        _ => {
            let stops = watch.servers.iter().map(|s| s.graceful_stop(watch.grace));
            for result in join_all(stops).await {
                if let Err(err) = result {
                    tracing::warn!(error = %err, "Graceful stop incomplete");
                }
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::rpc::RpcRouter;
    use axum::Router;

    async fn listener() -> Arc<RootListener> {
        let tcp = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        Arc::new(RootListener::from_tcp(tcp, 16).unwrap())
    }

    #[tokio::test]
    async fn rejects_empty_and_duplicate_servers() {
        let root = listener().await;
        assert!(matches!(
            Supervisor::new(root.clone(), RuleSet::preface_default(), vec![]),
            Err(SupervisorError::NoServers)
        ));
        assert!(matches!(
            Supervisor::new(
                root,
                RuleSet::preface_default(),
                vec![ServerTask::http(Router::new()), ServerTask::http(Router::new())]
            ),
            Err(SupervisorError::DuplicateServer(Protocol::Http))
        ));
    }

    #[tokio::test]
    async fn rules_are_restricted_to_enabled_protocols() {
        let supervisor = Supervisor::new(
            listener().await,
            RuleSet::preface_default(),
            vec![ServerTask::http(Router::new())],
        )
        .unwrap();
        assert!(supervisor
            .rules
            .rules()
            .iter()
            .all(|rule| rule.protocol() == Protocol::Http));
    }

    #[tokio::test]
    async fn closed_listener_fails_without_spawning() {
        let root = listener().await;
        root.close_once();
        let supervisor =
            Supervisor::new(root, RuleSet::preface_default(), vec![ServerTask::http(Router::new())])
                .unwrap();

        let result = supervisor.run(CancellationToken::new()).await;
        assert!(matches!(result, Err(SupervisorError::Bind(ListenerError::Closed))));
        assert_eq!(supervisor.state(), LifecycleState::Stopped);
        assert_eq!(
            supervisor.server(Protocol::Http).unwrap().phase(),
            crate::server::Phase::Idle
        );
    }

    #[tokio::test]
    async fn second_run_is_rejected() {
        let supervisor = Arc::new(
            Supervisor::new(
                listener().await,
                RuleSet::preface_default(),
                vec![ServerTask::http(Router::new())],
            )
            .unwrap(),
        );
        let ctx = CancellationToken::new();
        let running = {
            let supervisor = supervisor.clone();
            let ctx = ctx.clone();
            tokio::spawn(async move { supervisor.run(ctx).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(matches!(
            supervisor.run(CancellationToken::new()).await,
            Err(SupervisorError::AlreadyStarted)
        ));

        ctx.cancel();
        running.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn listener_closed_by_racing_shutdown_is_clean() {
        let supervisor = Supervisor::new(
            listener().await,
            RuleSet::preface_default(),
            vec![ServerTask::http(Router::new())],
        )
        .unwrap();

        // Shutdown lands after `start` but before the listener check.
        supervisor.lifecycle.start();
        supervisor.lifecycle.begin_shutdown(ShutdownMode::Graceful);
        supervisor.listener().close_once();

        assert!(matches!(supervisor.closed_listener_outcome(), Some(Ok(()))));
        assert_eq!(supervisor.state(), LifecycleState::Stopped);
    }

    #[tokio::test]
    async fn server_failure_stops_siblings_and_is_returned() {
        let (routes, _health) = RpcRouter::new().into_routes().await;
        let supervisor = Supervisor::new(
            listener().await,
            RuleSet::preface_default(),
            vec![ServerTask::http(Router::new()), ServerTask::rpc(routes)],
        )
        .unwrap();

        // Occupy the HTTP task so its unit fails with `AlreadyServing`.
        let http = Arc::clone(supervisor.server(Protocol::Http).unwrap());
        let (tx, rx) = virtual_listener::channel(Protocol::Http, 1, supervisor.listener().local_addr());
        let occupied = tokio::spawn(async move {
            let _tx = tx;
            http.serve(rx).await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let result = tokio::time::timeout(Duration::from_secs(2), supervisor.run(CancellationToken::new()))
            .await
            .expect("run did not return after a unit failure");
        assert!(matches!(
            result,
            Err(SupervisorError::Serve(ServeError::AlreadyServing(Protocol::Http)))
        ));
        assert_eq!(supervisor.state(), LifecycleState::Stopped);
        assert!(supervisor.listener().is_closed());
        assert_eq!(
            supervisor.server(Protocol::Rpc).unwrap().phase(),
            crate::server::Phase::Stopped
        );

        // The forced stop reached the occupied task as well.
        tokio::time::timeout(Duration::from_secs(2), occupied)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn first_failure_wins() {
        let supervisor = Supervisor::new(
            listener().await,
            RuleSet::preface_default(),
            vec![ServerTask::http(Router::new())],
        )
        .unwrap();

        supervisor.fail("accept loop", SupervisorError::Mux(MuxError::UnexpectedClosure));
        supervisor.fail("http server", SupervisorError::UnitPanicked("later".to_string()));

        assert_eq!(supervisor.state(), LifecycleState::ShuttingDownForced);
        assert!(supervisor.internal.is_cancelled());
        assert!(matches!(
            lock(&supervisor.first_error).take(),
            Some(SupervisorError::Mux(MuxError::UnexpectedClosure))
        ));
    }

    #[tokio::test]
    async fn shutdown_before_run_is_clean() {
        let supervisor = Supervisor::new(
            listener().await,
            RuleSet::preface_default(),
            vec![ServerTask::http(Router::new())],
        )
        .unwrap();

        supervisor.shutdown(Duration::from_secs(1)).await.unwrap();
        assert!(supervisor.listener().is_closed());
        supervisor.run(CancellationToken::new()).await.unwrap();
        assert_eq!(supervisor.state(), LifecycleState::Stopped);
    }
}
