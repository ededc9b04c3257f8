//! Chunked transfer client
//!
//! Moves one local file to the upload service in three strictly ordered
//! phases:
//!
//! 1. `POST {base}/upload/init` with the file metadata, returning an upload id
//! 2. `POST {base}/upload/chunk/{uploadId}` once per chunk (multipart
//!    `chunk` + `chunkIndex`), with bounded concurrency and per-chunk retry
//! 3. `POST {base}/upload/complete/{uploadId}` to finalize the resource
//!
//! Init and complete are never retried. Every request of a client shares one
//! [`CancellationToken`]; [`ChunkedTransferClient::cancel`] aborts whatever is
//! in flight and the upload resolves to [`UploadError::Cancelled`].
//!
//! # Example
//!
//! ```no_run
//! use lms_client::upload::{ChunkedTransferClient, UploadOptions};
//! use std::path::Path;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = ChunkedTransferClient::new()?;
//! let options = UploadOptions::new("https://lms.example.com/api")
//!     .on_progress(|p| println!("{:.0}%", p.percentage));
//!
//! let result = client
//!     .upload(Path::new("lecture.mp4"), "Lecture 1", None, options)
//!     .await?;
//! println!("Created resource {}", result.id);
//! # Ok(())
//! # }
//! ```

use futures::stream::{self, TryStreamExt};
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use reqwest::multipart::{Form, Part};
use std::future::Future;
use std::path::Path;
use tokio_util::sync::CancellationToken;

use super::chunk::{read_chunk, ChunkPlan, ChunkRange};
use super::session::UploadSession;
use super::{ChunkAck, CompleteResult, InitRequest, InitResponse, UploadError, UploadOptions};
use crate::config::{Config, DispatchMode};
use crate::metrics;
use crate::retry::{retry_with_backoff, RetryError};

/// Characters escaped when an upload id is placed into a path segment
const PATH_SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'/')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}');

/// Client for the chunked upload protocol
pub struct ChunkedTransferClient {
    http: reqwest::Client,
    cancel: CancellationToken,
}

impl ChunkedTransferClient {
    /// Create a client with a default HTTP client
    pub fn new() -> Result<Self, UploadError> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| UploadError::RequestError(e.to_string()))?;
        Ok(Self::with_http_client(http))
    }

    /// Create a client whose HTTP timeout comes from `config.api`
    pub fn from_config(config: &Config) -> Result<Self, UploadError> {
        let http = reqwest::Client::builder()
            .timeout(config.api.timeout())
            .build()
            .map_err(|e| UploadError::RequestError(e.to_string()))?;
        Ok(Self::with_http_client(http))
    }

    /// Create a client on top of an existing HTTP client
    pub fn with_http_client(http: reqwest::Client) -> Self {
        Self {
            http,
            cancel: CancellationToken::new(),
        }
    }

    /// Abort every in-flight request of this client.
    ///
    /// The client stays cancelled: later uploads fail with
    /// [`UploadError::Cancelled`] immediately.
    pub fn cancel(&self) {
        if !self.cancel.is_cancelled() {
            tracing::info!("Upload cancelled by user");
        }
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Token shared by every request of this client
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Upload `file` and return the finalized resource descriptor
    #[tracing::instrument(
        name = "upload",
        skip(self, file, title, description, options),
        fields(upload.file = %file.display(), upload.title = %title)
    )]
    pub async fn upload(
        &self,
        file: &Path,
        title: &str,
        description: Option<&str>,
        options: UploadOptions,
    ) -> Result<CompleteResult, UploadError> {
        let result = self.run_upload(file, title, description, &options).await;

        if let Err(ref e) = result {
            metrics::record_upload_failure(e.kind());
            if e.is_cancelled() {
                tracing::info!("Upload stopped after cancellation");
            } else {
                tracing::error!(error = %e, chunk_index = ?e.chunk_index(), "Upload failed");
                if let Some(ref on_error) = options.on_error {
                    on_error(e);
                }
            }
        }

        result
    }

    async fn run_upload(
        &self,
        file: &Path,
        title: &str,
        description: Option<&str>,
        options: &UploadOptions,
    ) -> Result<CompleteResult, UploadError> {
        options.validate()?;
        if self.cancel.is_cancelled() {
            return Err(UploadError::Cancelled);
        }

        let file_size = tokio::fs::metadata(file).await?.len();
        let filename = file
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .ok_or_else(|| {
                UploadError::InvalidOptions(format!("{} has no file name", file.display()))
            })?;

        let plan = ChunkPlan::new(file_size, options.chunk_size)?;
        let request = InitRequest {
            filename,
            file_size,
            total_chunks: plan.total_chunks(),
            title: title.to_string(),
            description: description.map(str::to_string),
        };

        let init = self.initialize(&options.base_url, &request).await?;

        let plan = match init.chunk_size {
            Some(server_size) if server_size > 0 && server_size != plan.chunk_size() => {
                tracing::warn!(
                    requested = plan.chunk_size(),
                    server = server_size,
                    "Server chose a different chunk size"
                );
                ChunkPlan::new(file_size, server_size)?
            }
            _ => plan,
        };

        let session = UploadSession::new(init.upload_id, plan);
        tracing::info!(
            upload_id = %session.upload_id(),
            total_chunks = session.total_chunks(),
            chunk_size = session.chunk_size(),
            "Upload session initialized"
        );

        self.transfer(file, &session, options).await?;

        let result = self.complete(&options.base_url, session.upload_id()).await?;
        metrics::record_upload_success(session.total_chunks());
        Ok(result)
    }

    /// Run `fut` unless the client is cancelled first
    async fn cancellable<T, F>(&self, fut: F) -> Result<T, UploadError>
    where
        F: Future<Output = Result<T, UploadError>>,
    {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(UploadError::Cancelled),
            result = fut => result,
        }
    }

    #[tracing::instrument(
        name = "upload.init",
        skip(self, base_url, request),
        fields(
            upload.filename = %request.filename,
            upload.bytes = request.file_size,
            upload.total_chunks = request.total_chunks,
            upload.id = tracing::field::Empty
        ),
        err
    )]
    async fn initialize(
        &self,
        base_url: &str,
        request: &InitRequest,
    ) -> Result<InitResponse, UploadError> {
        let url = endpoint(base_url, "upload/init", None);

        let init = self
            .cancellable(async {
                let response = self
                    .http
                    .post(&url)
                    .json(request)
                    .send()
                    .await
                    .map_err(|e| UploadError::InitializationFailure(e.to_string()))?;

                if !response.status().is_success() {
                    return Err(UploadError::InitializationFailure(
                        describe_failure(response).await,
                    ));
                }

                response.json::<InitResponse>().await.map_err(|e| {
                    UploadError::InitializationFailure(format!("invalid response: {}", e))
                })
            })
            .await?;

        tracing::Span::current().record("upload.id", init.upload_id.as_str());
        Ok(init)
    }

    async fn transfer(
        &self,
        file: &Path,
        session: &UploadSession,
        options: &UploadOptions,
    ) -> Result<(), UploadError> {
        if session.total_chunks() == 0 {
            if let Some(ref on_progress) = options.on_progress {
                on_progress(session.progress());
            }
            return Ok(());
        }

        let indices: Vec<u64> = (0..session.total_chunks()).collect();

        match options.dispatch {
            DispatchMode::Batched => {
                for batch in indices.chunks(options.concurrency) {
                    let results = futures::future::join_all(
                        batch
                            .iter()
                            .map(|&index| self.upload_chunk(file, session, index, options)),
                    )
                    .await;

                    if self.cancel.is_cancelled() {
                        return Err(UploadError::Cancelled);
                    }
                    if let Some(err) = results.into_iter().find_map(Result::err) {
                        return Err(err);
                    }
                }
            }
            DispatchMode::Pooled => {
                stream::iter(indices.into_iter().map(Ok::<u64, UploadError>))
                    .try_for_each_concurrent(options.concurrency, |index| {
                        self.upload_chunk(file, session, index, options)
                    })
                    .await?;
            }
        }

        Ok(())
    }

    #[tracing::instrument(
        name = "upload.chunk",
        skip(self, file, session, options),
        fields(upload.id = %session.upload_id(), chunk.index = chunk_index),
        err
    )]
    async fn upload_chunk(
        &self,
        file: &Path,
        session: &UploadSession,
        chunk_index: u64,
        options: &UploadOptions,
    ) -> Result<(), UploadError> {
        let range = session.plan().range(chunk_index).ok_or_else(|| {
            UploadError::InvalidOptions(format!("chunk {} is outside the plan", chunk_index))
        })?;
        let url = endpoint(
            &options.base_url,
            "upload/chunk",
            Some(session.upload_id()),
        );
        let policy = options.retry_policy();

        let outcome = retry_with_backoff(&policy, &self.cancel, |attempt| {
            let url = url.as_str();
            async move {
                let result = self.send_chunk(file, url, range).await;
                metrics::record_chunk_attempt(result.is_ok(), range.len());
                if let Err(ref e) = result {
                    tracing::debug!(attempt = attempt + 1, error = %e, "Chunk attempt failed");
                }
                result
            }
        })
        .await;

        match outcome {
            Ok(ack) => {
                let progress = session.mark_uploaded(chunk_index);
                tracing::debug!(
                    uploaded = progress.uploaded_chunks,
                    total = progress.total_chunks,
                    server_progress = ?ack.progress,
                    "Chunk acknowledged"
                );
                if let Some(ref on_progress) = options.on_progress {
                    on_progress(progress);
                }
                Ok(())
            }
            Err(RetryError::Cancelled) => Err(UploadError::Cancelled),
            Err(RetryError::Exhausted {
                attempts,
                last_error,
            }) => Err(UploadError::ChunkUploadFailure {
                chunk_index,
                attempts,
                reason: last_error,
            }),
        }
    }

    /// One attempt at sending a chunk
    async fn send_chunk(
        &self,
        file: &Path,
        url: &str,
        range: ChunkRange,
    ) -> Result<ChunkAck, String> {
        let request = async {
            let data = read_chunk(file, range).await.map_err(|e| e.to_string())?;
            let part = Part::stream_with_length(data, range.len())
                .file_name(format!("chunk-{}", range.index))
                .mime_str("application/octet-stream")
                .map_err(|e| e.to_string())?;
            let form = Form::new()
                .text("chunkIndex", range.index.to_string())
                .part("chunk", part);

            let response = self
                .http
                .post(url)
                .multipart(form)
                .send()
                .await
                .map_err(|e| e.to_string())?;

            if !response.status().is_success() {
                return Err(describe_failure(response).await);
            }

            // The acknowledgment body is informational; tolerate empty bodies
            let body = response.bytes().await.map_err(|e| e.to_string())?;
            Ok(serde_json::from_slice::<ChunkAck>(&body).unwrap_or_default())
        };

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err("request aborted".to_string()),
            result = request => result,
        }
    }

    #[tracing::instrument(
        name = "upload.complete",
        skip(self, base_url),
        fields(upload.id = %upload_id),
        err
    )]
    async fn complete(
        &self,
        base_url: &str,
        upload_id: &str,
    ) -> Result<CompleteResult, UploadError> {
        let url = endpoint(base_url, "upload/complete", Some(upload_id));

        let result = self
            .cancellable(async {
                let response = self
                    .http
                    .post(&url)
                    .send()
                    .await
                    .map_err(|e| UploadError::CompletionFailure(e.to_string()))?;

                if !response.status().is_success() {
                    return Err(UploadError::CompletionFailure(
                        describe_failure(response).await,
                    ));
                }

                response.json::<CompleteResult>().await.map_err(|e| {
                    UploadError::CompletionFailure(format!("invalid response: {}", e))
                })
            })
            .await?;

        tracing::info!(resource_id = %result.id, "Upload completed");
        Ok(result)
    }

    /// Fetch the server's view of an upload session
    #[tracing::instrument(name = "upload.status", skip(self, base_url), err)]
    pub async fn status(
        &self,
        base_url: &str,
        upload_id: &str,
    ) -> Result<serde_json::Value, UploadError> {
        let url = endpoint(base_url, "upload/status", Some(upload_id));
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| UploadError::RequestError(e.to_string()))?;

        if !response.status().is_success() {
            return Err(UploadError::RequestError(describe_failure(response).await));
        }

        response
            .json()
            .await
            .map_err(|e| UploadError::RequestError(format!("invalid response: {}", e)))
    }

    /// Ask the server to discard an upload session.
    ///
    /// Not tied to the cancellation token, so it can run after [`cancel`](Self::cancel).
    #[tracing::instrument(name = "upload.abort", skip(self, base_url), err)]
    pub async fn abort_remote(&self, base_url: &str, upload_id: &str) -> Result<(), UploadError> {
        let url = endpoint(base_url, "upload/cancel", Some(upload_id));
        let response = self
            .http
            .delete(&url)
            .send()
            .await
            .map_err(|e| UploadError::RequestError(e.to_string()))?;

        if !response.status().is_success() {
            return Err(UploadError::RequestError(describe_failure(response).await));
        }

        tracing::info!(upload_id = %upload_id, "Remote upload session discarded");
        Ok(())
    }
}

fn endpoint(base_url: &str, route: &str, upload_id: Option<&str>) -> String {
    let base = base_url.trim_end_matches('/');
    match upload_id {
        Some(id) => format!(
            "{}/{}/{}",
            base,
            route,
            utf8_percent_encode(id, PATH_SEGMENT)
        ),
        None => format!("{}/{}", base, route),
    }
}

async fn describe_failure(response: reqwest::Response) -> String {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    if body.is_empty() {
        format!("HTTP {}", status.as_u16())
    } else {
        format!("HTTP {}: {}", status.as_u16(), body)
    }
}
