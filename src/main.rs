//! svc-mux: HTTP/1 and gRPC on one port.
//!
//! # Architecture Overview
//!
//! ```text
//!                      ┌──────────────────────────────────────────────────────┐
//!                      │                       svc-mux                        │
//!                      │                                                      │
//!   Client ────────────┼─▶ RootListener ──▶ AcceptLoop ──▶ sniff + RuleSet     │
//!                      │                        │                             │
//!                      │            ┌───────────┴────────────┐                │
//!                      │            ▼                        ▼                │
//!                      │   VirtualListener(http)    VirtualListener(rpc)      │
//!                      │            │                        │                │
//!                      │            ▼                        ▼                │
//!                      │   ServerTask HTTP/1.1      ServerTask HTTP/2 (gRPC)  │
//!                      │   /healthz, /api/{v}/…     tonic services, health    │
//!                      │                                                      │
//!                      │   Supervisor: first error wins, graceful/forced stop │
//!                      └──────────────────────────────────────────────────────┘
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;

use svc_mux::config::{
    apply_process_env, load_config, validate_config, ConfigError, ProtocolMode, ServerConfig,
};
use svc_mux::lifecycle::signals::spawn_signal_handler;
use svc_mux::observability::{logging::init_logging, metrics::init_metrics};
use svc_mux::{bootstrap, Application, Shutdown};

#[derive(Debug, Parser)]
#[command(name = "svc-mux", version)]
#[command(about = "Serve HTTP and gRPC from a single port", long_about = None)]
struct Cli {
    /// TOML configuration file.
    #[arg(short, long, env = "SVC_MUX_CONFIG")]
    config: Option<PathBuf>,

    /// Override `listener.bind_address`.
    #[arg(long)]
    bind: Option<String>,

    /// Override the served protocols: http, grpc or both.
    #[arg(long)]
    protocol: Option<ProtocolMode>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => load_config(path)?,
        None => ServerConfig::default(),
    };
    apply_process_env(&mut config)?;
    if let Some(bind) = cli.bind {
        config.listener.bind_address = bind;
    }
    if let Some(protocol) = cli.protocol {
        config.protocol = protocol;
    }
    validate_config(&config).map_err(ConfigError::Validation)?;

    init_logging(&config.observability)?;

    tracing::info!(
        service = %config.service.name,
        version = %config.service.version,
        bind_address = %config.listener.bind_address,
        protocol = %config.protocol,
        max_connections = config.listener.max_connections,
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse::<SocketAddr>() {
            Ok(addr) => {
                if let Err(err) = init_metrics(addr) {
                    tracing::error!(error = %err, "Failed to start metrics endpoint");
                }
            }
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let supervisor = bootstrap(&config, Application::default()).await?;

    let shutdown = Shutdown::new();
    spawn_signal_handler(shutdown.clone());

    tokio::select! {
        result = supervisor.run(shutdown.token()) => result?,
        _ = shutdown.forced() => {
            tracing::warn!("Forced shutdown, dropping open connections");
            return Err("forced shutdown".into());
        }
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
