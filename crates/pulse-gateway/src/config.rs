//! Gateway configuration.
//!
//! Layered like the node: built-in defaults, an optional YAML file, then
//! `PULSE_GATEWAY_`-prefixed environment variables with `__` between nested
//! keys (e.g. `PULSE_GATEWAY_UPSTREAM__URL=ws://hub:8080/ws`).

use pulse_auth::{StaticTokenAuthenticator, TokenConfig};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use validator::{Validate, ValidationError, ValidationErrors};

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "pulse-gateway.yaml";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "PULSE_GATEWAY";

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),
    #[error("invalid configuration: {0}")]
    Invalid(#[from] ValidationErrors),
    #[error("invalid token entry: {0}")]
    Token(#[from] pulse_auth::AuthError),
}

/// Top-level gateway configuration.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, Validate)]
#[serde(default)]
pub struct GatewayConfig {
    #[validate(nested)]
    pub server: ServerConfig,
    #[validate(nested)]
    pub upstream: UpstreamConfig,
    #[validate(nested)]
    pub auth: AuthSettings,
}

/// HTTP server settings.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, Validate)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    #[validate(custom(function = "validate_log_level"))]
    pub log_level: String,
    pub json_logs: bool,
    /// How long shutdown waits for relays to close.
    #[validate(range(min = 1))]
    pub shutdown_grace_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 8081)),
            log_level: "info".to_string(),
            json_logs: false,
            shutdown_grace_ms: 5_000,
        }
    }
}

/// The hub this gateway fronts.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, Validate)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Hub WebSocket endpoint.
    #[validate(custom(function = "validate_ws_url"))]
    pub url: String,
    /// Shared secret the hub expects in trusted-proxy mode.
    #[validate(length(min = 16))]
    pub proxy_secret: String,
    #[validate(range(min = 1))]
    pub connect_timeout_ms: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8080/ws".to_string(),
            proxy_secret: String::new(),
            connect_timeout_ms: 5_000,
        }
    }
}

impl UpstreamConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Client authentication settings.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, Validate)]
#[serde(default)]
pub struct AuthSettings {
    /// Accept `?access_token=` as a credential.
    pub allow_query_token: bool,
    #[validate(nested)]
    pub tokens: Vec<TokenConfig>,
}

impl AuthSettings {
    /// Build an authenticator from the configured static tokens.
    pub fn static_authenticator(&self) -> Result<StaticTokenAuthenticator, ConfigError> {
        Ok(StaticTokenAuthenticator::from_tokens(&self.tokens)?)
    }
}

impl GatewayConfig {
    /// Load configuration from an optional file and the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        Self::load_with_env(path, None)
    }

    /// Load configuration with an explicit environment map.
    pub fn load_with_env(
        path: Option<&Path>,
        env: Option<HashMap<String, String>>,
    ) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).format(FileFormat::Yaml).required(true));
        }

        let config: GatewayConfig = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true)
                    .source(env),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }
}

fn validate_log_level(level: &str) -> Result<(), ValidationError> {
    match level.to_lowercase().as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ValidationError::new("log_level")),
    }
}

fn validate_ws_url(url: &str) -> Result<(), ValidationError> {
    let rest = url
        .strip_prefix("ws://")
        .or_else(|| url.strip_prefix("wss://"))
        .ok_or_else(|| ValidationError::new("ws_scheme"))?;
    if rest.is_empty() || rest.starts_with('/') {
        return Err(ValidationError::new("ws_host"));
    }
    Ok(())
}
