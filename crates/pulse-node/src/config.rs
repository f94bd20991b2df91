//! Node configuration.
//!
//! Sources, later overriding earlier:
//! 1. Built-in defaults
//! 2. A YAML file (optional unless given explicitly)
//! 3. Environment variables prefixed with `PULSE_`, nested keys separated
//!    by `__` (e.g. `PULSE_HUB__BUFFER_CAPACITY=500`)

use pulse_auth::{AuthError, StaticTokenAuthenticator, TokenConfig};
use pulse_realtime::{BufferConfig, HeartbeatConfig, HubConfig};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use validator::{Validate, ValidationError, ValidationErrors};

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "pulse.yaml";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "PULSE";

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),
    #[error("invalid configuration: {0}")]
    Invalid(#[from] ValidationErrors),
    #[error("invalid token entry: {0}")]
    Token(#[from] AuthError),
}

/// Top-level node configuration.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, Validate)]
#[serde(default)]
pub struct NodeConfig {
    /// HTTP server settings.
    #[validate(nested)]
    pub server: ServerConfig,
    /// Hub tunables.
    #[validate(nested)]
    pub hub: HubSettings,
    /// Handshake authentication.
    #[validate(nested)]
    pub auth: AuthSettings,
}

/// HTTP server settings.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, Validate)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address.
    pub listen_addr: SocketAddr,
    /// Log level (trace, debug, info, warn, error).
    #[validate(custom(function = "validate_log_level"))]
    pub log_level: String,
    /// Emit JSON logs.
    pub json_logs: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

/// Hub tunables, mapped onto [`HubConfig`].
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, Validate)]
#[serde(default)]
#[validate(schema(function = "validate_watermarks"))]
pub struct HubSettings {
    #[validate(range(min = 1))]
    pub max_connections: usize,
    #[validate(range(min = 1))]
    pub max_subscriptions_per_connection: usize,
    #[validate(range(min = 1))]
    pub buffer_capacity: usize,
    #[validate(range(exclusive_min = 0.0, max = 1.0))]
    pub high_watermark: f64,
    #[validate(range(min = 0.0, exclusive_max = 1.0))]
    pub low_watermark: f64,
    #[validate(range(min = 1))]
    pub heartbeat_interval_secs: u64,
    #[validate(range(min = 1))]
    pub pong_timeout_secs: u64,
    #[validate(range(min = 1))]
    pub max_missed_pongs: u32,
    #[validate(range(min = 1))]
    pub idle_poll_interval_ms: u64,
    pub drain_timeout_ms: u64,
    pub teardown_grace_ms: u64,
    #[validate(range(min = 1))]
    pub control_queue_capacity: usize,
    #[validate(range(min = 1))]
    pub ingest_capacity: usize,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self::from(&HubConfig::default())
    }
}

impl From<&HubConfig> for HubSettings {
    fn from(config: &HubConfig) -> Self {
        Self {
            max_connections: config.max_connections,
            max_subscriptions_per_connection: config.max_subscriptions_per_connection,
            buffer_capacity: config.buffer.capacity,
            high_watermark: config.buffer.high_watermark,
            low_watermark: config.buffer.low_watermark,
            heartbeat_interval_secs: config.heartbeat.interval.as_secs(),
            pong_timeout_secs: config.heartbeat.pong_timeout.as_secs(),
            max_missed_pongs: config.heartbeat.max_missed_pongs,
            idle_poll_interval_ms: config.idle_poll_interval.as_millis() as u64,
            drain_timeout_ms: config.drain_timeout.as_millis() as u64,
            teardown_grace_ms: config.teardown_grace.as_millis() as u64,
            control_queue_capacity: config.control_queue_capacity,
            ingest_capacity: config.ingest_capacity,
        }
    }
}

impl HubSettings {
    /// Build the hub configuration.
    pub fn to_hub_config(&self) -> HubConfig {
        HubConfig {
            max_connections: self.max_connections,
            max_subscriptions_per_connection: self.max_subscriptions_per_connection,
            buffer: BufferConfig {
                capacity: self.buffer_capacity,
                high_watermark: self.high_watermark,
                low_watermark: self.low_watermark,
            },
            heartbeat: HeartbeatConfig {
                interval: Duration::from_secs(self.heartbeat_interval_secs),
                pong_timeout: Duration::from_secs(self.pong_timeout_secs),
                max_missed_pongs: self.max_missed_pongs,
            },
            idle_poll_interval: Duration::from_millis(self.idle_poll_interval_ms),
            drain_timeout: Duration::from_millis(self.drain_timeout_ms),
            teardown_grace: Duration::from_millis(self.teardown_grace_ms),
            control_queue_capacity: self.control_queue_capacity,
            ingest_capacity: self.ingest_capacity,
        }
    }
}

/// Handshake authentication settings.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, Validate)]
#[serde(default)]
pub struct AuthSettings {
    /// Shared secret the gateway presents in trusted-proxy mode. Disabled when unset.
    #[validate(length(min = 16))]
    pub trusted_proxy_secret: Option<String>,
    /// Accept `?access_token=` on the WebSocket endpoint.
    pub allow_query_token: bool,
    /// Static tokens for development deployments.
    #[validate(nested)]
    pub tokens: Vec<TokenConfig>,
}

impl AuthSettings {
    /// Build an authenticator from the configured static tokens.
    pub fn static_authenticator(&self) -> Result<StaticTokenAuthenticator, ConfigError> {
        Ok(StaticTokenAuthenticator::from_tokens(&self.tokens)?)
    }
}

impl NodeConfig {
    /// Load configuration from an optional file and the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        Self::load_with_env(path, None)
    }

    /// Load configuration with an explicit environment map instead of the
    /// process environment.
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

        let config: NodeConfig = builder
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

fn validate_watermarks(settings: &HubSettings) -> Result<(), ValidationError> {
    if settings.low_watermark >= settings.high_watermark {
        return Err(ValidationError::new("low_watermark_not_below_high"));
    }
    Ok(())
}
