//! HTTP and gRPC from a single listening port.
//!
//! Every accepted connection is classified by its first bytes and handed to
//! the server task for its protocol. A supervisor owns the listener, the
//! accept loop and the server tasks, and coordinates graceful and forced
//! shutdown.

pub mod config;
pub mod lifecycle;
pub mod mux;
pub mod net;
pub mod observability;
pub mod server;

pub use config::schema::ServerConfig;
pub use lifecycle::{bootstrap, Application, Shutdown, Supervisor, SupervisorError};
pub use mux::{Protocol, RuleSet};
pub use server::rpc::RpcRouter;
pub use server::ServerTask;
