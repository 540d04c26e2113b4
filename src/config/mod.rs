//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → loader.rs (environment overrides: PORT, SERVICE_PROTOCOL, ...)
//!     → command line flags (main.rs)
//!     → validation.rs (semantic checks)
//!     → ServerConfig (validated, immutable)
//!     → lifecycle::startup::bootstrap
//! ```
//!
//! # Design Decisions
//! - Config is read once at startup; nothing re-reads the environment later
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{apply_env_overrides, apply_process_env, load_config, ConfigError};
pub use schema::{
    HttpConfig, ListenerConfig, LogFormat, MuxConfig, ObservabilityConfig, ProtocolMode,
    RpcMatch, ServerConfig, ServiceConfig, TimeoutConfig,
};
pub use validation::{validate_config, ValidationError};
