//! Startup orchestration.
//!
//! # Responsibilities
//! - Validate configuration
//! - Bind the root listener
//! - Build one server task per enabled protocol
//! - Hand everything to a [`Supervisor`]
//!
//! # Design Decisions
//! - Fail fast: any startup error is fatal
//! - Nothing is spawned here; traffic starts with `Supervisor::run`

use std::sync::Arc;
use std::time::Duration;

use axum::Router;

use crate::config::{validate_config, ConfigError, ServerConfig};
use crate::lifecycle::supervisor::{Supervisor, SupervisorError};
use crate::mux::Protocol;
use crate::net::{ListenerError, RootListener};
use crate::server::http::build_router;
use crate::server::rpc::RpcRouter;
use crate::server::ServerTask;

#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Listener(#[from] ListenerError),
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
}

/// Handlers an application plugs into the server.
#[derive(Clone, Default)]
pub struct Application {
    /// Routes mounted under `/api/{api_version}`.
    pub http: Router,
    /// gRPC services.
    pub rpc: RpcRouter,
}

impl Application {
    pub fn new(http: Router, rpc: RpcRouter) -> Self {
        Self { http, rpc }
    }
}

/// Bind the configured address and build a supervisor for `app`.
pub async fn bootstrap(config: &ServerConfig, app: Application) -> Result<Supervisor, StartupError> {
    validate_config(config).map_err(ConfigError::Validation)?;

    let listener = Arc::new(RootListener::bind(&config.listener).await?);
    let Application { http, rpc } = app;

    let mut servers = Vec::new();
    for protocol in config.protocol.protocols() {
        let server = match protocol {
            Protocol::Http => ServerTask::http(build_router(&config.http, &config.service, http.clone()))
                .with_header_read_timeout(Duration::from_secs(config.timeouts.header_read_secs)),
            Protocol::Rpc => {
                let (routes, _health) = rpc.clone().into_routes().await;
                ServerTask::rpc(routes)
            }
        };
        servers.push(server);
    }

    let supervisor = Supervisor::new(listener, config.mux.rule_set(), servers)?
        .with_settings(config.mux.settings())
        .with_grace(Duration::from_secs(config.timeouts.shutdown_grace_secs));

    tracing::info!(
        service = %config.service.name,
        version = %config.service.version,
        protocol = %config.protocol,
        address = %supervisor.listener().local_addr(),
        rpc_match = ?config.mux.rpc_match,
        rpc_services = ?rpc.services(),
        "Server bootstrapped"
    );

    Ok(supervisor)
}
