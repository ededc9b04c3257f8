//! Authentication module
//!
//! Bearer-token request gateway with coalesced token refresh and forced
//! sign-out after repeated refresh failure.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod gateway;
pub mod session;
pub mod store;

pub use gateway::AuthGateway;
pub use session::{AuthPhase, AuthSession, RefreshOutcome};
pub use store::{FileCredentialStore, MemoryCredentialStore};

/// Authentication errors
#[derive(Error, Debug)]
pub enum AuthError {
    #[error("Session expired, sign in again")]
    SessionExpired,

    #[error("Token refresh failed: {0}")]
    RefreshFailed(RefreshFailure),

    #[error("HTTP request failed: {0}")]
    RequestError(#[from] reqwest::Error),

    #[error("Invalid credentials: {0}")]
    InvalidCredentials(String),

    #[error("Credential store error: {0}")]
    StoreError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

impl From<RefreshFailure> for AuthError {
    fn from(failure: RefreshFailure) -> Self {
        match failure {
            RefreshFailure::SessionExpired => AuthError::SessionExpired,
            other => AuthError::RefreshFailed(other),
        }
    }
}

/// Why a refresh did not produce a new access token.
///
/// Shared verbatim with every caller that joined the refresh, hence `Clone`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RefreshFailure {
    #[error("network error: {0}")]
    Network(String),

    #[error("refresh rejected with HTTP {0}")]
    Rejected(u16),

    #[error("malformed refresh response: {0}")]
    Malformed(String),

    #[error("session expired")]
    SessionExpired,
}

/// Stored session credentials
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credentials {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// When these tokens were last written
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Credentials {
    pub fn new(access_token: impl Into<String>, refresh_token: Option<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token,
            updated_at: Some(Utc::now()),
        }
    }
}

/// Where access and refresh tokens live between requests
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Current credentials, `None` when signed out
    async fn load(&self) -> Result<Option<Credentials>, AuthError>;

    /// Replace the stored credentials
    async fn save(&self, credentials: &Credentials) -> Result<(), AuthError>;

    /// Forget every stored credential
    async fn clear(&self) -> Result<(), AuthError>;
}

/// Host integration points for the sign-out flow
#[cfg_attr(test, mockall::automock)]
pub trait SessionHooks: Send + Sync {
    /// Location the user is currently on, matched against public prefixes
    fn current_location(&self) -> String;

    /// Show a message to the user
    fn notify(&self, message: &str);

    /// Send the user to the sign-in page
    fn navigate_to_sign_in(&self, path: &str);
}

/// Hooks for headless use: fixed location, messages go to the log
#[derive(Debug, Clone)]
pub struct LogSessionHooks {
    location: String,
}

impl LogSessionHooks {
    pub fn new(location: impl Into<String>) -> Self {
        Self {
            location: location.into(),
        }
    }
}

impl Default for LogSessionHooks {
    fn default() -> Self {
        Self::new("/")
    }
}

impl SessionHooks for LogSessionHooks {
    fn current_location(&self) -> String {
        self.location.clone()
    }

    fn notify(&self, message: &str) {
        tracing::warn!(message = %message, "User notification");
    }

    fn navigate_to_sign_in(&self, path: &str) {
        tracing::info!(path = %path, "Sign in again to continue");
    }
}

/// True when `location` sits under one of the `public_paths` prefixes.
///
/// Prefixes match whole path segments: `/login` covers `/login` and
/// `/login/reset` but not `/loginhelp`.
pub fn is_public_route(location: &str, public_paths: &[String]) -> bool {
    public_paths.iter().any(|prefix| {
        let prefix = prefix.trim_end_matches('/');
        match location.strip_prefix(prefix) {
            Some(rest) => {
                rest.is_empty()
                    || rest.starts_with('/')
                    || rest.starts_with('?')
                    || rest.starts_with('#')
            }
            None => false,
        }
    })
}

/// True when a request path targets login, logout or refresh itself
pub fn is_bootstrap_path(path: &str, bootstrap_paths: &[String]) -> bool {
    let path = path.trim_end_matches('/');
    bootstrap_paths
        .iter()
        .any(|endpoint| path.ends_with(endpoint.trim_end_matches('/')))
}
