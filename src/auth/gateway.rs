//! Authenticated request gateway
//!
//! Wraps outgoing requests with the stored bearer token. A 401/403 on a
//! protected request triggers one shared token refresh; every request that
//! failed while the refresh was running waits for it and is then replayed
//! once with the new token. After `max_refresh_retries` consecutive refresh
//! failures the session is signed out: the user is notified, credentials are
//! cleared and, after `sign_out_delay_millis`, the host navigates to sign-in.
//!
//! # Example
//!
//! ```no_run
//! use lms_client::auth::{AuthGateway, LogSessionHooks, MemoryCredentialStore};
//! use lms_client::config::Config;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::with_base_url("https://lms.example.com/api");
//! let gateway = AuthGateway::from_config(
//!     &config,
//!     Arc::new(MemoryCredentialStore::new()),
//!     Arc::new(LogSessionHooks::default()),
//! )?;
//!
//! let response = gateway.get("/courses").await?;
//! println!("{}", response.status());
//! # Ok(())
//! # }
//! ```

use reqwest::header::{HeaderValue, AUTHORIZATION};
use reqwest::{Request, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use super::session::{AuthPhase, AuthSession, RefreshOutcome};
use super::{
    is_bootstrap_path, is_public_route, AuthError, CredentialStore, Credentials, RefreshFailure,
    SessionHooks,
};
use crate::config::{AuthConfig, Config};
use crate::metrics;
use crate::singleflight::SingleFlight;

const REFRESH_KEY: &str = "refresh";

const SESSION_EXPIRED_MESSAGE: &str = "Your session has expired. Please sign in again.";

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RefreshRequest<'a> {
    refresh_token: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RefreshResponse {
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    refresh_token: Option<String>,
}

struct GatewayInner {
    http: reqwest::Client,
    api_base: String,
    config: AuthConfig,
    session: AuthSession,
    store: Arc<dyn CredentialStore>,
    hooks: Arc<dyn SessionHooks>,
}

/// Request gateway with single-flight token refresh
pub struct AuthGateway {
    inner: Arc<GatewayInner>,
    refresh_flight: SingleFlight<&'static str, Result<String, RefreshFailure>>,
}

impl AuthGateway {
    /// Create a gateway for the API rooted at `api_base`
    pub fn new(
        http: reqwest::Client,
        api_base: impl Into<String>,
        config: AuthConfig,
        store: Arc<dyn CredentialStore>,
        hooks: Arc<dyn SessionHooks>,
    ) -> Self {
        let linger = Duration::from_millis(config.refresh_linger_millis);
        let session = AuthSession::new(config.max_refresh_retries);

        Self {
            inner: Arc::new(GatewayInner {
                http,
                api_base: api_base.into().trim_end_matches('/').to_string(),
                config,
                session,
                store,
                hooks,
            }),
            refresh_flight: SingleFlight::with_linger(linger),
        }
    }

    /// Create a gateway from the `api` and `auth` sections
    pub fn from_config(
        config: &Config,
        store: Arc<dyn CredentialStore>,
        hooks: Arc<dyn SessionHooks>,
    ) -> Result<Self, AuthError> {
        let http = reqwest::Client::builder()
            .timeout(config.api.timeout())
            .build()?;
        Ok(Self::new(
            http,
            config.api.base_url.clone(),
            config.auth.clone(),
            store,
            hooks,
        ))
    }

    pub fn session(&self) -> &AuthSession {
        &self.inner.session
    }

    pub fn phase(&self) -> AuthPhase {
        self.inner.session.phase()
    }

    pub fn config(&self) -> &AuthConfig {
        &self.inner.config
    }

    pub fn http_client(&self) -> &reqwest::Client {
        &self.inner.http
    }

    /// Absolute URL for `path`; absolute inputs are returned unchanged
    pub fn url(&self, path: &str) -> String {
        self.inner.url(path)
    }

    /// `GET {api_base}{path}` through the gateway
    pub async fn get(&self, path: &str) -> Result<Response, AuthError> {
        let request = self.inner.http.get(self.url(path)).build()?;
        self.fetch_authenticated(request).await
    }

    /// `POST {api_base}{path}` with a JSON body through the gateway
    pub async fn post_json<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<Response, AuthError> {
        let request = self.inner.http.post(self.url(path)).json(body).build()?;
        self.fetch_authenticated(request).await
    }

    /// Send `request` with the stored credentials, refreshing them once on
    /// an auth failure.
    ///
    /// Non-auth error statuses are returned as responses, not errors.
    #[tracing::instrument(
        name = "auth.fetch",
        skip(self, request),
        fields(
            http.method = %request.method(),
            http.url = %request.url(),
            http.status_code = tracing::field::Empty
        ),
        err
    )]
    pub async fn fetch_authenticated(&self, request: Request) -> Result<Response, AuthError> {
        let inner = &self.inner;

        let location = inner.hooks.current_location();
        if is_public_route(&location, &inner.config.public_paths) {
            tracing::debug!(location = %location, "Public route, sending without credentials");
            let response = inner.http.execute(request).await?;
            record_status(response.status());
            return Ok(response);
        }

        let bootstrap = is_bootstrap_path(request.url().path(), &inner.config.bootstrap_paths);
        let replay = request.try_clone();

        let sent_token = inner
            .store
            .load()
            .await?
            .map(|credentials| credentials.access_token);

        let mut request = request;
        if let Some(ref token) = sent_token {
            attach_bearer(&mut request, token)?;
        }

        let response = inner.http.execute(request).await?;
        record_status(response.status());

        if bootstrap || !is_auth_failure(response.status()) {
            return Ok(response);
        }

        let Some(mut replay) = replay else {
            tracing::warn!("Request body cannot be replayed, returning auth failure as is");
            return Ok(response);
        };

        // Another caller may already have refreshed since our token was read
        let stored_token = inner
            .store
            .load()
            .await?
            .map(|credentials| credentials.access_token);
        let token = match stored_token {
            Some(token) if Some(&token) != sent_token.as_ref() => token,
            _ => self.refresh().await?,
        };

        attach_bearer(&mut replay, &token)?;
        let response = inner.http.execute(replay).await?;
        record_status(response.status());
        Ok(response)
    }

    /// Refresh the access token, joining a refresh already in flight
    pub async fn refresh(&self) -> Result<String, AuthError> {
        let inner = Arc::clone(&self.inner);
        self.refresh_flight
            .run(REFRESH_KEY, move || inner.run_refresh())
            .await
            .map_err(AuthError::from)
    }

    /// True while a refresh is running or its result is still being reused
    pub fn is_refresh_in_flight(&self) -> bool {
        self.refresh_flight.is_in_flight(&REFRESH_KEY)
    }
}

impl GatewayInner {
    fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_string();
        }
        if path.starts_with('/') {
            format!("{}{}", self.api_base, path)
        } else {
            format!("{}/{}", self.api_base, path)
        }
    }

    #[tracing::instrument(name = "auth.refresh", skip(self), err)]
    async fn run_refresh(self: Arc<Self>) -> Result<String, RefreshFailure> {
        let refresh_token = match self.store.load().await {
            Ok(Some(Credentials {
                refresh_token: Some(token),
                ..
            })) => token,
            Ok(Some(_)) => {
                tracing::info!("No refresh token stored");
                self.sign_out().await;
                return Err(RefreshFailure::SessionExpired);
            }
            Ok(None) => {
                tracing::debug!("No credentials stored");
                return Err(RefreshFailure::SessionExpired);
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read credentials");
                return Err(RefreshFailure::SessionExpired);
            }
        };

        if !self.session.begin_refresh() {
            tracing::debug!("Sign-out in progress, refresh suppressed");
            return Err(RefreshFailure::SessionExpired);
        }

        let result = self.request_new_tokens(&refresh_token).await;
        metrics::record_refresh_attempt(result.is_ok());

        let failure = match result {
            Ok(credentials) => {
                if let Err(e) = self.store.save(&credentials).await {
                    tracing::warn!(error = %e, "Failed to persist refreshed credentials");
                }
                self.session.complete_refresh(true);
                tracing::info!("Session token refreshed");
                return Ok(credentials.access_token);
            }
            Err(failure) => failure,
        };

        match self.session.complete_refresh(false) {
            RefreshOutcome::LimitReached { failures } => {
                tracing::warn!(failures, error = %failure, "Refresh limit reached");
                self.sign_out().await;
                Err(RefreshFailure::SessionExpired)
            }
            RefreshOutcome::RetryAllowed { failures } => {
                tracing::warn!(
                    failures,
                    max = self.session.max_refresh_retries(),
                    error = %failure,
                    "Token refresh failed"
                );
                Err(failure)
            }
            RefreshOutcome::Succeeded => Err(failure),
        }
    }

    async fn request_new_tokens(&self, refresh_token: &str) -> Result<Credentials, RefreshFailure> {
        let response = self
            .http
            .post(self.url(&self.config.refresh_path))
            .json(&RefreshRequest { refresh_token })
            .send()
            .await
            .map_err(|e| RefreshFailure::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(RefreshFailure::Rejected(status.as_u16()));
        }

        let body: RefreshResponse = response
            .json()
            .await
            .map_err(|e| RefreshFailure::Malformed(e.to_string()))?;

        let access_token = body
            .access_token
            .filter(|token| !token.is_empty())
            .ok_or_else(|| RefreshFailure::Malformed("missing accessToken".into()))?;

        // A server that does not rotate refresh tokens omits the field
        let refresh_token = body
            .refresh_token
            .filter(|token| !token.is_empty())
            .unwrap_or_else(|| refresh_token.to_string());

        Ok(Credentials::new(access_token, Some(refresh_token)))
    }

    async fn sign_out(self: &Arc<Self>) {
        if !self.session.force_sign_out() {
            return;
        }

        metrics::record_sign_out();
        tracing::warn!("Session expired, signing out");
        self.hooks.notify(SESSION_EXPIRED_MESSAGE);

        if let Err(e) = self.store.clear().await {
            tracing::warn!(error = %e, "Failed to clear credentials");
        }

        let inner = Arc::clone(self);
        let delay = Duration::from_millis(self.config.sign_out_delay_millis);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            inner.hooks.navigate_to_sign_in(&inner.config.sign_in_path);
            inner.session.finish_sign_out();
            tracing::debug!("Sign-out finished");
        });
    }
}

fn is_auth_failure(status: StatusCode) -> bool {
    status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN
}

fn attach_bearer(request: &mut Request, token: &str) -> Result<(), AuthError> {
    let mut value = HeaderValue::from_str(&format!("Bearer {}", token)).map_err(|_| {
        AuthError::InvalidCredentials("access token is not a valid header value".into())
    })?;
    value.set_sensitive(true);
    request.headers_mut().insert(AUTHORIZATION, value);
    Ok(())
}

fn record_status(status: StatusCode) {
    tracing::Span::current().record("http.status_code", status.as_u16());
}
