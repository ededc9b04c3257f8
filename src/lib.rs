//! LMS Client Library
//!
//! Client-side transfer and session plumbing for an online learning platform.
//!
//! # Features
//!
//! - **Chunked Uploads**: init, bounded-concurrency chunk transfer with
//!   exponential backoff, complete
//! - **Cancellation**: one token aborts every in-flight request of a client
//! - **Session Refresh**: concurrent 401/403 responses share a single token
//!   refresh and are replayed once
//! - **Forced Sign-Out**: after repeated refresh failure, exactly once
//! - **Pre-signed Uploads**: small objects in a single `PUT`
//!
//! # Example
//!
//! ```no_run
//! use lms_client::{config::Config, upload::{ChunkedTransferClient, UploadOptions}};
//! use std::path::Path;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.yaml")?;
//!     let client = ChunkedTransferClient::from_config(&config)?;
//!     let result = client
//!         .upload(
//!             Path::new("lecture.mp4"),
//!             "Lecture 1",
//!             None,
//!             UploadOptions::from_config(&config),
//!         )
//!         .await?;
//!     println!("{}", result.id);
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod config;
pub mod metrics;
pub mod retry;
pub mod singleflight;
pub mod telemetry;
pub mod upload;

// Re-export commonly used types
pub use auth::AuthGateway;
pub use config::Config;
pub use upload::ChunkedTransferClient;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
