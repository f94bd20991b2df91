//! Pulse Gateway - authenticating WebSocket proxy for the Pulse hub.

use anyhow::Context;
use clap::Parser;
use pulse_auth::SharedAuthenticator;
use pulse_gateway::{create_router, logging::init_logging, GatewayConfig, GatewayState, Upstream};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Pulse Gateway - authenticates clients and relays them to a Pulse hub
#[derive(Parser, Debug)]
#[command(name = "pulse-gateway")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen address (overrides configuration)
    #[arg(long)]
    listen_addr: Option<SocketAddr>,

    /// Hub WebSocket URL (overrides configuration)
    #[arg(long)]
    upstream_url: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    /// Emit JSON logs
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config =
        GatewayConfig::load(args.config.as_deref()).context("loading configuration")?;
    if let Some(addr) = args.listen_addr {
        config.server.listen_addr = addr;
    }
    if let Some(url) = args.upstream_url {
        config.upstream.url = url;
    }
    if let Some(level) = args.log_level {
        config.server.log_level = level;
    }
    config.server.json_logs |= args.json_logs;

    init_logging(&config.server.log_level, config.server.json_logs);
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        upstream = %config.upstream.url,
        "Starting Pulse gateway"
    );

    let authenticator: SharedAuthenticator = Arc::new(config.auth.static_authenticator()?);
    let state = GatewayState::new(
        authenticator,
        Upstream {
            url: config.upstream.url.clone(),
            proxy_secret: config.upstream.proxy_secret.clone(),
            connect_timeout: config.upstream.connect_timeout(),
        },
        config.auth.allow_query_token,
    );

    let listener = tokio::net::TcpListener::bind(config.server.listen_addr)
        .await
        .with_context(|| format!("binding {}", config.server.listen_addr))?;
    tracing::info!(addr = %config.server.listen_addr, "Listening");

    axum::serve(listener, create_router(state.clone()))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving HTTP")?;

    let grace = Duration::from_millis(config.server.shutdown_grace_ms);
    if !state.shutdown(grace).await {
        tracing::warn!(remaining = state.relays.len(), "Relays still open after grace period");
    }
    tracing::info!("Pulse gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
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
}
