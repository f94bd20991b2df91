//! Configuration file loading.

use pulse_auth::{Authenticator, Credential};
use pulse_node::config::{ConfigError, NodeConfig};
use std::collections::HashMap;
use std::io::Write;
use std::time::Duration;

fn write_config(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

#[tokio::test]
async fn test_load_yaml_file() {
    let file = write_config(
        r#"
server:
  listen_addr: "0.0.0.0:9100"
  log_level: debug
hub:
  max_connections: 50
  buffer_capacity: 200
  heartbeat_interval_secs: 5
auth:
  allow_query_token: true
  tokens:
    - token: "dashboard-token-1"
      subject: dashboard
      scopes: ["events:read"]
      clusters: ["prod-eu"]
"#,
    );

    let config = NodeConfig::load_with_env(Some(file.path()), Some(HashMap::new())).unwrap();
    assert_eq!(config.server.listen_addr.port(), 9100);
    assert_eq!(config.server.log_level, "debug");
    assert!(config.auth.allow_query_token);

    let hub = config.hub.to_hub_config();
    assert_eq!(hub.max_connections, 50);
    assert_eq!(hub.buffer.capacity, 200);
    assert_eq!(hub.heartbeat.interval, Duration::from_secs(5));
    // Unset keys keep their defaults
    assert_eq!(hub.max_subscriptions_per_connection, 100);

    let auth = config.auth.static_authenticator().unwrap();
    let identity = auth
        .validate(&Credential::new("dashboard-token-1"))
        .await
        .unwrap();
    assert_eq!(identity.subject, "dashboard");
    assert!(identity.clusters.allows("prod-eu"));
}

#[test]
fn test_env_overrides_file() {
    let file = write_config("hub:\n  buffer_capacity: 200\n");
    let env = HashMap::from([("PULSE_HUB__BUFFER_CAPACITY".to_string(), "300".to_string())]);
    let config = NodeConfig::load_with_env(Some(file.path()), Some(env)).unwrap();
    assert_eq!(config.hub.buffer_capacity, 300);
}

#[test]
fn test_missing_explicit_file_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("absent.yaml");
    assert!(matches!(
        NodeConfig::load_with_env(Some(&path), Some(HashMap::new())),
        Err(ConfigError::Load(_))
    ));
}

#[test]
fn test_invalid_file_values_rejected() {
    let file = write_config("hub:\n  high_watermark: 0.4\n  low_watermark: 0.6\n");
    assert!(matches!(
        NodeConfig::load_with_env(Some(file.path()), Some(HashMap::new())),
        Err(ConfigError::Invalid(_))
    ));

    let file = write_config("auth:\n  tokens:\n    - token: short\n      subject: x\n");
    assert!(matches!(
        NodeConfig::load_with_env(Some(file.path()), Some(HashMap::new())),
        Err(ConfigError::Invalid(_))
    ));
}
