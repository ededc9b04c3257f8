//! Subscriber construction
//!
//! ```text
//! Registry
//!   ├── EnvFilter (RUST_LOG, else logging.level)
//!   └── Fmt Layer (text or JSON, stderr)
//! ```

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::EnvFilter;

use super::TelemetryError;
use crate::config::LoggingConfig;

/// Filter from `RUST_LOG`, falling back to `level`
pub fn build_filter(level: &str) -> Result<EnvFilter, TelemetryError> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => {
            EnvFilter::try_new(level).map_err(|e| TelemetryError::InvalidFilter(e.to_string()))
        }
    }
}

/// Install the global subscriber described by `config`
pub fn init_subscriber(config: &LoggingConfig) -> Result<(), TelemetryError> {
    let env_filter = build_filter(&config.level)?;

    match config.format.as_str() {
        "json" => {
            let fmt_layer = tracing_subscriber::fmt::layer()
                .json()
                .with_target(true)
                .with_current_span(true)
                .with_writer(std::io::stderr);

            let subscriber = tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt_layer);

            tracing::subscriber::set_global_default(subscriber)
                .map_err(|e| TelemetryError::AlreadyInitialized(e.to_string()))
        }
        "text" => {
            let fmt_layer = tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_writer(std::io::stderr);

            let subscriber = tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt_layer);

            tracing::subscriber::set_global_default(subscriber)
                .map_err(|e| TelemetryError::AlreadyInitialized(e.to_string()))
        }
        other => Err(TelemetryError::UnknownFormat(other.to_string())),
    }
}
