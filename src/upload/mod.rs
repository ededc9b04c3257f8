//! Upload module
//!
//! Chunked large-file transfer (init, chunk, complete) and the pre-signed
//! small-object path.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::config::{Config, DispatchMode};
use crate::retry::RetryPolicy;

pub mod chunk;
pub mod client;
pub mod presigned;
pub mod session;

pub use chunk::{ChunkPlan, ChunkRange};
pub use client::ChunkedTransferClient;
pub use session::UploadSession;

/// Upload errors
#[derive(Error, Debug)]
pub enum UploadError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Upload initialization failed: {0}")]
    InitializationFailure(String),

    #[error("Chunk {chunk_index} failed after {attempts} attempts: {reason}")]
    ChunkUploadFailure {
        chunk_index: u64,
        attempts: u32,
        reason: String,
    },

    #[error("Upload completion failed: {0}")]
    CompletionFailure(String),

    #[error("Upload cancelled by user")]
    Cancelled,

    #[error("Invalid upload options: {0}")]
    InvalidOptions(String),

    #[error("Request error: {0}")]
    RequestError(String),
}

impl UploadError {
    /// True for user cancellation, which callers treat differently from failure
    pub fn is_cancelled(&self) -> bool {
        matches!(self, UploadError::Cancelled)
    }

    /// Index of the chunk that caused the failure, if any
    pub fn chunk_index(&self) -> Option<u64> {
        match self {
            UploadError::ChunkUploadFailure { chunk_index, .. } => Some(*chunk_index),
            _ => None,
        }
    }

    /// Short label used for metrics
    pub fn kind(&self) -> &'static str {
        match self {
            UploadError::IoError(_) => "io",
            UploadError::InitializationFailure(_) => "init",
            UploadError::ChunkUploadFailure { .. } => "chunk",
            UploadError::CompletionFailure(_) => "complete",
            UploadError::Cancelled => "cancelled",
            UploadError::InvalidOptions(_) => "options",
            UploadError::RequestError(_) => "request",
        }
    }
}

// ============================================================================
// Wire types
// ============================================================================

/// Body of `POST {baseUrl}/upload/init`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct InitRequest {
    pub filename: String,
    pub file_size: u64,
    pub total_chunks: u64,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Response of `POST {baseUrl}/upload/init`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct InitResponse {
    pub upload_id: String,
    #[serde(default)]
    pub chunk_size: Option<u64>,
}

/// Response of `POST {baseUrl}/upload/chunk/{uploadId}`
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChunkAck {
    #[serde(default)]
    pub upload_id: Option<String>,
    #[serde(default)]
    pub chunk_index: Option<u64>,
    #[serde(default)]
    pub uploaded: Option<u64>,
    #[serde(default)]
    pub total: Option<u64>,
    #[serde(default)]
    pub progress: Option<f64>,
}

/// Finalized resource returned by `POST {baseUrl}/upload/complete/{uploadId}`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CompleteResult {
    /// Resource identifier (numeric or string, depending on the backend)
    pub id: serde_json::Value,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub original_file: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    /// Any additional fields of the descriptor
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

// ============================================================================
// Progress and options
// ============================================================================

/// Snapshot of a transfer, recomputed on every chunk acknowledgment
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransferProgress {
    pub uploaded_chunks: u64,
    pub total_chunks: u64,
    /// `100 * uploaded_chunks / total_chunks`, in `[0, 100]`
    pub percentage: f64,
    /// Chunk whose acknowledgment produced this snapshot
    pub current_chunk: Option<u64>,
}

impl TransferProgress {
    /// Build a snapshot; an empty transfer counts as complete
    pub fn new(uploaded_chunks: u64, total_chunks: u64, current_chunk: Option<u64>) -> Self {
        let percentage = if total_chunks == 0 {
            100.0
        } else {
            (100.0 * uploaded_chunks.min(total_chunks) as f64) / total_chunks as f64
        };

        Self {
            uploaded_chunks,
            total_chunks,
            percentage,
            current_chunk,
        }
    }

    /// True once every chunk is acknowledged
    pub fn is_complete(&self) -> bool {
        self.uploaded_chunks >= self.total_chunks
    }
}

/// Callback invoked with transfer progress
pub type ProgressCallback = Arc<dyn Fn(TransferProgress) + Send + Sync>;

/// Callback invoked once with the error that ends an upload
pub type ErrorCallback = Arc<dyn Fn(&UploadError) + Send + Sync>;

/// Per-upload options
#[derive(Clone)]
pub struct UploadOptions {
    pub base_url: String,
    pub chunk_size: u64,
    /// Attempts per chunk, first try included
    pub max_retries: u32,
    pub concurrency: usize,
    /// Delay unit for the `2^attempt` backoff
    pub backoff_base: Duration,
    pub dispatch: DispatchMode,
    pub on_progress: Option<ProgressCallback>,
    pub on_error: Option<ErrorCallback>,
}

impl std::fmt::Debug for UploadOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadOptions")
            .field("base_url", &self.base_url)
            .field("chunk_size", &self.chunk_size)
            .field("max_retries", &self.max_retries)
            .field("concurrency", &self.concurrency)
            .field("backoff_base", &self.backoff_base)
            .field("dispatch", &self.dispatch)
            .field("on_progress", &self.on_progress.is_some())
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

impl UploadOptions {
    /// Options with the default chunk size, retries and concurrency
    pub fn new(base_url: impl Into<String>) -> Self {
        let defaults = crate::config::UploadConfig::default();
        Self {
            base_url: base_url.into(),
            chunk_size: defaults.chunk_size,
            max_retries: defaults.max_retries,
            concurrency: defaults.concurrency,
            backoff_base: Duration::from_millis(defaults.backoff_base_millis),
            dispatch: defaults.dispatch,
            on_progress: None,
            on_error: None,
        }
    }

    /// Options taken from the `upload` section of a configuration
    pub fn from_config(config: &Config) -> Self {
        Self {
            base_url: config.upload_base_url().to_string(),
            chunk_size: config.upload.chunk_size,
            max_retries: config.upload.max_retries,
            concurrency: config.upload.concurrency,
            backoff_base: Duration::from_millis(config.upload.backoff_base_millis),
            dispatch: config.upload.dispatch,
            on_progress: None,
            on_error: None,
        }
    }

    #[must_use]
    pub fn with_chunk_size(mut self, chunk_size: u64) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    #[must_use]
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    #[must_use]
    pub fn with_backoff_base(mut self, backoff_base: Duration) -> Self {
        self.backoff_base = backoff_base;
        self
    }

    #[must_use]
    pub fn with_dispatch(mut self, dispatch: DispatchMode) -> Self {
        self.dispatch = dispatch;
        self
    }

    /// Register the progress callback
    #[must_use]
    pub fn on_progress<F>(mut self, callback: F) -> Self
    where
        F: Fn(TransferProgress) + Send + Sync + 'static,
    {
        self.on_progress = Some(Arc::new(callback));
        self
    }

    /// Register the error callback
    #[must_use]
    pub fn on_error<F>(mut self, callback: F) -> Self
    where
        F: Fn(&UploadError) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(callback));
        self
    }

    /// Retry policy for a single chunk
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries, self.backoff_base)
    }

    /// Reject options that cannot drive a transfer
    pub fn validate(&self) -> Result<(), UploadError> {
        if self.chunk_size == 0 {
            return Err(UploadError::InvalidOptions(
                "chunk_size must be greater than zero".into(),
            ));
        }
        if self.concurrency == 0 {
            return Err(UploadError::InvalidOptions(
                "concurrency must be at least 1".into(),
            ));
        }
        if self.max_retries == 0 {
            return Err(UploadError::InvalidOptions(
                "max_retries must be at least 1".into(),
            ));
        }
        if self.base_url.is_empty() {
            return Err(UploadError::InvalidOptions("base_url is empty".into()));
        }
        Ok(())
    }
}
