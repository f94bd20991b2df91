//! Shared fixtures for the node integration tests.

#![allow(dead_code)]

use pulse_auth::{Identity, SharedAuthenticator, StaticTokenAuthenticator, ADMIN_SCOPE, EVENTS_READ_SCOPE};
use pulse_node::api::{create_router, AppState, HandshakePolicy};
use pulse_node::health::HealthState;
use pulse_node::observability::MetricsState;
use pulse_realtime::{Hub, HubConfig};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const ADMIN_TOKEN: &str = "admin-token-0001";
pub const READER_TOKEN: &str = "reader-token-0001";
pub const EU_TOKEN: &str = "eu-only-token-0001";
pub const PROXY_SECRET: &str = "proxy-secret-0123456789";

pub fn authenticator() -> SharedAuthenticator {
    let auth = StaticTokenAuthenticator::new();
    auth.insert(
        ADMIN_TOKEN,
        Identity::new("ops").with_scope(EVENTS_READ_SCOPE).with_scope(ADMIN_SCOPE),
    )
    .unwrap();
    auth.insert(READER_TOKEN, Identity::new("dashboard").with_scope(EVENTS_READ_SCOPE))
        .unwrap();
    auth.insert(
        EU_TOKEN,
        Identity::new("eu-dashboard")
            .with_scope(EVENTS_READ_SCOPE)
            .with_clusters(["prod-eu"]),
    )
    .unwrap();
    Arc::new(auth)
}

/// Hub tunables fast enough for tests.
pub fn test_hub_config() -> HubConfig {
    HubConfig {
        idle_poll_interval: Duration::from_millis(5),
        drain_timeout: Duration::from_millis(200),
        teardown_grace: Duration::from_millis(500),
        ..Default::default()
    }
}

pub struct TestNode {
    pub hub: Hub,
    pub state: AppState,
    pub health: HealthState,
}

impl TestNode {
    pub fn start(config: HubConfig, handshake: HandshakePolicy) -> Self {
        let metrics = MetricsState::new();
        let hub = Hub::start_with_metrics(config, Arc::new(metrics.clone()));
        let state = AppState {
            registry: hub.registry().clone(),
            ingest: hub.ingest().clone(),
            authenticator: authenticator(),
            handshake,
            metrics,
        };
        let health = HealthState::new(hub.registry().clone());
        Self { hub, state, health }
    }

    pub fn router(&self) -> axum::Router {
        create_router(self.state.clone(), self.health.clone())
    }

    /// Serve the node on an ephemeral port.
    pub async fn serve(&self) -> (SocketAddr, CancellationToken) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let app = self.router();
        let token = shutdown.clone();
        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(token.cancelled_owned())
                .await
                .unwrap();
        });
        (addr, shutdown)
    }
}

/// Poll `check` until it holds or a second passes.
pub async fn eventually<F: Fn() -> bool>(check: F) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
