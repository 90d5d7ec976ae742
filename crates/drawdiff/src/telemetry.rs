//! Logging setup.
//!
//! Library code emits `tracing` spans/events and, in the database layer,
//! `log` records. `init_logging` installs a subscriber for both.

use tracing_subscriber::{prelude::*, EnvFilter};

use crate::config::{LogFormat, LoggingConfig};
use crate::error::ConfigError;

/// Builds the filter, preferring `RUST_LOG` over the configured directive.
pub fn build_filter(config: &LoggingConfig) -> Result<EnvFilter, ConfigError> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    EnvFilter::try_new(&config.filter).map_err(|e| ConfigError::Validation {
        message: format!("Invalid logging.filter '{}': {}", config.filter, e),
    })
}

/// Installs the global subscriber. Calling it twice is a no-op.
pub fn init_logging(config: &LoggingConfig) -> Result<(), ConfigError> {
    let filter = build_filter(config)?;

    // Route `log` records into tracing; fails harmlessly when already set.
    let _ = tracing_log::LogTracer::init();

    let registry = tracing_subscriber::registry();
    let result = match config.format {
        LogFormat::Pretty => registry
            .with(tracing_subscriber::fmt::layer().with_filter(filter))
            .try_init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json().with_filter(filter))
            .try_init(),
    };

    if result.is_err() {
        tracing::debug!("Global subscriber already installed");
    }

    Ok(())
}
