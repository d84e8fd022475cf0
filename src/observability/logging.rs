//! Structured logging for the engine and its driver.
//!
//! Engine events are `tracing` events keyed by connection, request and
//! origin ids. `observability.json_logs` switches the output to one JSON
//! object per line; `RUST_LOG` overrides `observability.log_level`.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::schema::ObservabilityConfig;

/// Install the global subscriber. A second call is a no-op.
pub fn init_logging(config: &ObservabilityConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(&config.log_level)));

    let registry = tracing_subscriber::registry().with(filter);
    let result = if config.json_logs {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_target(true))
            .try_init()
    } else {
        registry.with(tracing_subscriber::fmt::layer()).try_init()
    };
    if result.is_err() {
        tracing::debug!("Logging already initialized");
    }
}

/// `level` for this crate, warnings for everything else.
fn default_directive(level: &str) -> String {
    format!("warn,proxy_upstream={}", level)
}
