//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (startup.rs):
//!     Validate config → Bind root listener → Build server tasks → Supervisor
//!
//! Run (supervisor.rs):
//!     Spawn watcher + accept loop + server tasks → first error wins
//!
//! Shutdown (supervisor.rs, shutdown.rs):
//!     Cancel → close root listener once → close virtual listeners
//!         → graceful stop (deadline) or forced stop → Stopped
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → graceful shutdown, repeated → forced
//! ```
//!
//! # Design Decisions
//! - Ordered startup: config first, then listener, then tasks
//! - Ordered shutdown: stop accept, drain, close
//! - Shutdown has timeout: forced stop after deadline

pub mod shutdown;
pub mod signals;
pub mod startup;
pub mod state;
pub mod supervisor;

pub use shutdown::Shutdown;
pub use startup::{bootstrap, Application, StartupError};
pub use state::{Lifecycle, LifecycleState, ShutdownMode};
pub use supervisor::{Supervisor, SupervisorError};
