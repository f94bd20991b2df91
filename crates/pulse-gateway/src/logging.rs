//! Structured logging initialization.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize the logging system. `RUST_LOG` overrides `level` when set.
pub fn init_logging(level: &str, json_format: bool) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!(
            "pulse_gateway={level},pulse_auth={level},tower_http=debug",
            level = level
        )
        .into()
    });

    let registry = tracing_subscriber::registry().with(env_filter);
    if json_format {
        registry
            .with(fmt::layer().json().with_current_span(true).with_target(true))
            .init();
    } else {
        registry.with(fmt::layer().pretty()).init();
    }
}
