//! Process-wide logging setup.
//!
//! Installs a `tracing` registry with an env filter, a human readable `fmt`
//! layer and the [`BusLogLayer`] so every record also reaches the event bus.
//! Records emitted through the `log` facade are bridged by the subscriber's
//! `tracing-log` integration.

use std::sync::Arc;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::error::ConfigError;
use crate::events::{BusLogLayer, EventBus};

/// Maps the `core.loglevel` option onto a tracing filter directive.
pub fn filter_directive(loglevel: &str) -> Result<&'static str, ConfigError> {
    match loglevel.to_ascii_lowercase().as_str() {
        "debug" => Ok("debug"),
        "info" => Ok("info"),
        "warning" | "warn" => Ok("warn"),
        "error" => Ok("error"),
        other => Err(ConfigError::InvalidValue {
            key: "core.loglevel".to_string(),
            reason: format!("unknown log level '{}'", other),
        }),
    }
}

/// Builds the filter: `RUST_LOG` wins, otherwise the configured level.
pub fn build_filter(loglevel: &str) -> Result<EnvFilter, ConfigError> {
    let directive = filter_directive(loglevel)?;
    Ok(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive)))
}

/// Installs the global subscriber and the `log` bridge. Fails if either is
/// already installed.
pub fn init(loglevel: &str, bus: Arc<EventBus>) -> Result<(), ConfigError> {
    let filter = build_filter(loglevel)?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .with(BusLogLayer::new(bus))
        .try_init()
        .map_err(|e| ConfigError::Logging(e.to_string()))?;

    tracing::debug!(level = loglevel, "Logging initialized");
    Ok(())
}
