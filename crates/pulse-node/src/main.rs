//! Pulse Node - real-time event hub server.

use anyhow::Context;
use clap::Parser;
use pulse_auth::SharedAuthenticator;
use pulse_node::api::{create_router, AppState, HandshakePolicy};
use pulse_node::config::NodeConfig;
use pulse_node::health::HealthState;
use pulse_node::observability::{init_logging, LogFormat, MetricsState};
use pulse_realtime::Hub;
use std::future::IntoFuture;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Pulse Node - real-time event distribution for dashboards and CLI clients
#[derive(Parser, Debug)]
#[command(name = "pulse-node")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen address (overrides configuration)
    #[arg(long)]
    listen_addr: Option<SocketAddr>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    /// Log format (pretty, json)
    #[arg(long)]
    log_format: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = NodeConfig::load(args.config.as_deref()).context("loading configuration")?;
    if let Some(addr) = args.listen_addr {
        config.server.listen_addr = addr;
    }
    if let Some(level) = args.log_level {
        config.server.log_level = level;
    }
    if let Some(format) = args.log_format.as_deref() {
        config.server.json_logs = LogFormat::parse(format) == LogFormat::Json;
    }

    init_logging(&config.server.log_level, config.server.json_logs);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting Pulse node");

    let metrics = MetricsState::new();
    let hub = Hub::start_with_metrics(config.hub.to_hub_config(), Arc::new(metrics.clone()));

    let authenticator: SharedAuthenticator = Arc::new(config.auth.static_authenticator()?);
    if config.auth.tokens.is_empty() && config.auth.trusted_proxy_secret.is_none() {
        tracing::warn!("No tokens or proxy secret configured; every handshake will be rejected");
    }

    let state = AppState {
        registry: hub.registry().clone(),
        ingest: hub.ingest().clone(),
        authenticator,
        handshake: HandshakePolicy {
            trusted_proxy_secret: config.auth.trusted_proxy_secret.clone(),
            allow_query_token: config.auth.allow_query_token,
        },
        metrics,
    };
    let health = HealthState::new(hub.registry().clone());
    let app = create_router(state, health.clone());

    let listener = tokio::net::TcpListener::bind(config.server.listen_addr)
        .await
        .with_context(|| format!("binding {}", config.server.listen_addr))?;
    tracing::info!(addr = %config.server.listen_addr, "Listening");
    health.set_ready(true);

    let shutdown = CancellationToken::new();
    tokio::spawn(watch_signals(shutdown.clone(), health));

    let server =
        axum::serve(listener, app).with_graceful_shutdown(shutdown.clone().cancelled_owned());
    let hub_shutdown = async move {
        shutdown.cancelled().await;
        let closed = hub.shutdown().await;
        tracing::info!(closed = closed, "Hub stopped");
    };

    let (served, ()) = tokio::join!(server.into_future(), hub_shutdown);
    served.context("serving HTTP")?;

    tracing::info!("Pulse node stopped");
    Ok(())
}

async fn watch_signals(shutdown: CancellationToken, health: HealthState) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
    health.set_ready(false);
    shutdown.cancel();
}
