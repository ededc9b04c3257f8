//! Logging setup
//!
//! Console logging through `tracing-subscriber`, in plain text or JSON.
//! `RUST_LOG` wins over the configured level when it is set.

use thiserror::Error;

pub mod subscriber;

pub use subscriber::{build_filter, init_subscriber};

/// Errors that can occur while installing the subscriber
#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("Invalid log filter: {0}")]
    InvalidFilter(String),

    #[error("Unknown log format: {0}")]
    UnknownFormat(String),

    #[error("Failed to set global subscriber (may already be initialized): {0}")]
    AlreadyInitialized(String),
}
