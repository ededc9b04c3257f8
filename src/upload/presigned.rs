//! Pre-signed small-object upload
//!
//! Asks the backend (through the authenticated gateway) for a signed URL,
//! then `PUT`s the whole file to it in one request. No chunking and no
//! retry: small files are cheap to resend from the caller.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

use crate::auth::{AuthError, AuthGateway};

/// Pre-signed upload errors
#[derive(Error, Debug)]
pub enum PresignError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Authentication error: {0}")]
    Auth(#[from] AuthError),

    #[error("Signed URL request failed: HTTP {0}")]
    SignRejected(u16),

    #[error("Invalid signed URL response: {0}")]
    InvalidResponse(String),

    #[error("Upload to signed URL failed: {0}")]
    UploadFailed(String),
}

#[derive(Serialize)]
struct SignRequest<'a> {
    path: &'a str,
}

#[derive(Deserialize)]
struct SignResponse {
    #[serde(alias = "signedUrl")]
    url: String,
}

/// Uploader for the pre-signed path
pub struct PresignedUploader {
    gateway: Arc<AuthGateway>,
    presign_path: String,
}

impl PresignedUploader {
    /// Uses the gateway's configured `presign_path`
    pub fn new(gateway: Arc<AuthGateway>) -> Self {
        let presign_path = gateway.config().presign_path.clone();
        Self {
            gateway,
            presign_path,
        }
    }

    #[must_use]
    pub fn with_presign_path(mut self, presign_path: impl Into<String>) -> Self {
        self.presign_path = presign_path.into();
        self
    }

    /// Request a signed URL for the object at `object_path`
    #[tracing::instrument(name = "presign.request", skip(self), err)]
    pub async fn request_signed_url(&self, object_path: &str) -> Result<String, PresignError> {
        let response = self
            .gateway
            .post_json(&self.presign_path, &SignRequest { path: object_path })
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(PresignError::SignRejected(status.as_u16()));
        }

        let body: SignResponse = response
            .json()
            .await
            .map_err(|e| PresignError::InvalidResponse(e.to_string()))?;

        if body.url.is_empty() {
            return Err(PresignError::InvalidResponse("empty url".into()));
        }
        Ok(body.url)
    }

    /// Upload `file` to a freshly signed URL and return that URL.
    ///
    /// `content_type` defaults to a guess from the file extension.
    #[tracing::instrument(
        name = "presign.upload",
        skip(self, file, content_type),
        fields(upload.file = %file.display()),
        err
    )]
    pub async fn upload_file(
        &self,
        file: &Path,
        object_path: &str,
        content_type: Option<&str>,
    ) -> Result<String, PresignError> {
        let body = tokio::fs::read(file).await?;
        let content_type = content_type
            .map(str::to_string)
            .unwrap_or_else(|| {
                mime_guess::from_path(file)
                    .first_or_octet_stream()
                    .to_string()
            });

        let signed_url = self.request_signed_url(object_path).await?;
        let size = body.len();

        let response = self
            .gateway
            .http_client()
            .put(&signed_url)
            .header(reqwest::header::CONTENT_TYPE, content_type.as_str())
            .body(body)
            .send()
            .await
            .map_err(|e| PresignError::UploadFailed(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(PresignError::UploadFailed(format!(
                "HTTP {}",
                status.as_u16()
            )));
        }

        tracing::info!(bytes = size, content_type = %content_type, "Pre-signed upload finished");
        Ok(signed_url)
    }
}
