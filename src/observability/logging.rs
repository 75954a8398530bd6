//! # Structured Logging
//!
//! Installs the global `tracing` subscriber: JSON lines for log shippers or human-readable
//! text for terminals. `RUST_LOG` takes precedence over the configured level.

use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

use crate::core::config::LogFormat;
use crate::core::error::{GatewayError, GatewayResult};

/// Filter from `RUST_LOG`, falling back to `level` for this crate and noisy dependencies
pub fn build_filter(level: &str) -> GatewayResult<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }

    let level = level.to_ascii_lowercase();
    EnvFilter::try_new(format!(
        "{level},discovery_gateway={level},tower_http={level},kube=warn,hyper=warn"
    ))
    .map_err(|e| GatewayError::config(format!("Invalid log level {}: {}", level, e)))
}

/// Install the global subscriber. A second call logs a warning and leaves the first in place.
pub fn init_logging(level: &str, format: LogFormat) -> GatewayResult<()> {
    let filter = build_filter(level)?;

    let result = match format {
        LogFormat::Json => Registry::default()
            .with(filter)
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_target(true)
                    .with_thread_ids(true),
            )
            .try_init(),
        LogFormat::Text => Registry::default()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .try_init(),
    };

    if result.is_err() {
        warn!("Tracing subscriber already initialized, skipping initialization");
        return Ok(());
    }

    info!(format = ?format, "Structured logging initialized");
    Ok(())
}
