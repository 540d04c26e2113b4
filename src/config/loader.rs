//! Configuration loading from disk and the environment.

use std::fs;
use std::path::Path;

use crate::config::schema::{LogFormat, ServerConfig};
use crate::config::validation::{validate_config, ValidationError};

/// Error type for configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid {var}: {message}")]
    Env { var: &'static str, message: String },
    #[error("Validation failed: {}", join(.0))]
    Validation(Vec<ValidationError>),
}

fn join(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Load and validate configuration from a TOML file.
pub fn load_config(path: &Path) -> Result<ServerConfig, ConfigError> {
    let content = fs::read_to_string(path)?;
    let config: ServerConfig = toml::from_str(&content)?;

    validate_config(&config).map_err(ConfigError::Validation)?;

    Ok(config)
}

/// Apply the process environment on top of `config`.
pub fn apply_process_env(config: &mut ServerConfig) -> Result<(), ConfigError> {
    apply_env_overrides(config, |var| std::env::var(var).ok())
}

/// Apply environment overrides read through `lookup`.
///
/// - `PORT` replaces the port of `listener.bind_address`
/// - `SERVICE_PROTOCOL` selects `http`, `grpc`/`rpc`, or both when empty
/// - `SERVICE` and `VERSION` set the service identity
/// - `API_VERSION` sets the HTTP API mount
/// - `IS_TERMINAL=true` selects human readable logs, any other value JSON
pub fn apply_env_overrides<F>(config: &mut ServerConfig, lookup: F) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(port) = lookup("PORT").filter(|p| !p.trim().is_empty()) {
        let port: u16 = port.trim().parse().map_err(|_| ConfigError::Env {
            var: "PORT",
            message: format!("{port:?} is not a port number"),
        })?;
        config.listener.bind_address = with_port(&config.listener.bind_address, port);
    }

    if let Some(protocol) = lookup("SERVICE_PROTOCOL") {
        config.protocol = protocol.parse().map_err(|message| ConfigError::Env {
            var: "SERVICE_PROTOCOL",
            message,
        })?;
    }

    if let Some(name) = lookup("SERVICE").filter(|s| !s.is_empty()) {
        config.service.name = name;
    }
    if let Some(version) = lookup("VERSION").filter(|s| !s.is_empty()) {
        config.service.version = version;
    }
    if let Some(api_version) = lookup("API_VERSION").filter(|s| !s.is_empty()) {
        config.http.api_version = api_version;
    }
    if let Some(terminal) = lookup("IS_TERMINAL") {
        config.observability.log_format = if terminal.trim() == "true" {
            LogFormat::Pretty
        } else {
            LogFormat::Json
        };
    }

    Ok(())
}

fn with_port(bind_address: &str, port: u16) -> String {
    match bind_address.rsplit_once(':') {
        Some((host, _)) if !host.is_empty() => format!("{host}:{port}"),
        _ => format!("0.0.0.0:{port}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::ProtocolMode;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn env_overrides_apply() {
        let mut config = ServerConfig::default();
        apply_env_overrides(
            &mut config,
            env(&[
                ("PORT", "8081"),
                ("SERVICE_PROTOCOL", "grpc"),
                ("SERVICE", "orders"),
                ("VERSION", "2.0.0"),
                ("IS_TERMINAL", "false"),
            ]),
        )
        .unwrap();

        assert_eq!(config.listener.bind_address, "0.0.0.0:8081");
        assert_eq!(config.protocol, ProtocolMode::Rpc);
        assert_eq!(config.service.name, "orders");
        assert_eq!(config.service.version, "2.0.0");
        assert_eq!(config.observability.log_format, LogFormat::Json);
    }

    #[test]
    fn empty_protocol_means_both() {
        let mut config = ServerConfig {
            protocol: ProtocolMode::Http,
            ..ServerConfig::default()
        };
        apply_env_overrides(&mut config, env(&[("SERVICE_PROTOCOL", "")])).unwrap();
        assert_eq!(config.protocol, ProtocolMode::Both);
    }

    #[test]
    fn bad_port_is_rejected() {
        let mut config = ServerConfig::default();
        let err = apply_env_overrides(&mut config, env(&[("PORT", "http")])).unwrap_err();
        assert!(matches!(err, ConfigError::Env { var: "PORT", .. }));
    }

    #[test]
    fn port_replacement_keeps_host() {
        assert_eq!(with_port("127.0.0.1:4000", 9000), "127.0.0.1:9000");
        assert_eq!(with_port("[::1]:4000", 9000), "[::1]:9000");
        assert_eq!(with_port("", 9000), "0.0.0.0:9000");
    }

    #[test]
    fn load_reports_missing_file() {
        let err = load_config(Path::new("/nonexistent/svc-mux.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }

    #[test]
    fn load_validates() {
        let path = std::env::temp_dir().join(format!("svc-mux-{}.toml", std::process::id()));
        fs::write(&path, "[listener]\nbind_address = \"nowhere\"\n").unwrap();
        let err = load_config(&path).unwrap_err();
        fs::remove_file(&path).ok();
        assert!(matches!(err, ConfigError::Validation(ref errors) if errors.len() == 1));
    }
}
