//! Configuration module for the LMS client
//!
//! Handles loading and parsing of YAML configuration files with support for
//! environment variable expansion and validation.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

mod loader;

pub use loader::ConfigLoader;

// ============================================================================
// Environment Variable Expansion
// ============================================================================

/// Expand environment variables in a string.
///
/// Supports two syntaxes:
/// - `${VAR_NAME}` - Simple expansion, keeps placeholder if var not found
/// - `${VAR_NAME:-default}` - Expansion with default value
///
/// Variable names must start with a letter or underscore and contain only
/// uppercase letters, digits, and underscores.
///
/// # Examples
///
/// ```ignore
/// std::env::set_var("LMS_API", "https://lms.example.com");
/// let result = expand_env_vars("${LMS_API}/api");
/// assert_eq!(result, "https://lms.example.com/api");
///
/// let result = expand_env_vars("${MISSING:-default}");
/// assert_eq!(result, "default");
/// ```
pub(crate) fn expand_env_vars(s: &str) -> String {
    let re = match regex_lite::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}") {
        Ok(re) => re,
        Err(_) => return s.to_string(),
    };
    let mut last_match = 0;
    let mut result = String::with_capacity(s.len());

    for cap in re.captures_iter(s) {
        let (Some(full_match), Some(var_name)) = (cap.get(0), cap.get(1)) else {
            continue;
        };

        result.push_str(&s[last_match..full_match.start()]);

        let value = match std::env::var(var_name.as_str()) {
            Ok(val) => val,
            Err(_) => match cap.get(2) {
                Some(default) => default.as_str().to_string(),
                // No env var and no default: keep the placeholder
                None => full_match.as_str().to_string(),
            },
        };
        result.push_str(&value);

        last_match = full_match.end();
    }

    result.push_str(&s[last_match..]);
    result
}

// ============================================================================
// Validation Helpers
// ============================================================================

/// Validate that a URL starts with http:// or https://
fn is_valid_http_url(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub api: ApiConfig,
    #[serde(default)]
    pub upload: UploadConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Config {
    /// Load configuration from a file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        ConfigLoader::load(path)
    }

    /// Build a configuration pointing at `base_url` with every other value defaulted
    pub fn with_base_url(base_url: &str) -> Self {
        Self {
            api: ApiConfig {
                base_url: base_url.to_string(),
                timeout_seconds: default_timeout_seconds(),
            },
            upload: UploadConfig::default(),
            auth: AuthConfig::default(),
            logging: LoggingConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }

    /// Base URL for the upload protocol (falls back to the API base)
    pub fn upload_base_url(&self) -> &str {
        self.upload
            .base_url
            .as_deref()
            .unwrap_or(&self.api.base_url)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !is_valid_http_url(&self.api.base_url) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid api.base_url '{}': must start with http:// or https://",
                self.api.base_url
            )));
        }

        if let Some(ref base_url) = self.upload.base_url {
            if !is_valid_http_url(base_url) {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid upload.base_url '{}': must start with http:// or https://",
                    base_url
                )));
            }
        }

        if self.upload.chunk_size == 0 {
            return Err(ConfigError::ValidationError(
                "upload.chunk_size must be greater than zero".into(),
            ));
        }

        if self.upload.max_retries == 0 {
            return Err(ConfigError::ValidationError(
                "upload.max_retries must be at least 1".into(),
            ));
        }

        if self.upload.concurrency == 0 {
            return Err(ConfigError::ValidationError(
                "upload.concurrency must be at least 1".into(),
            ));
        }

        if self.auth.max_refresh_retries == 0 {
            return Err(ConfigError::ValidationError(
                "auth.max_refresh_retries must be at least 1".into(),
            ));
        }

        for prefix in &self.auth.public_paths {
            if !prefix.starts_with('/') {
                return Err(ConfigError::ValidationError(format!(
                    "Public path '{}' must start with '/'",
                    prefix
                )));
            }
        }

        if !self.auth.refresh_path.starts_with('/') {
            return Err(ConfigError::ValidationError(format!(
                "auth.refresh_path '{}' must start with '/'",
                self.auth.refresh_path
            )));
        }

        match self.logging.format.as_str() {
            "text" | "json" => {}
            other => {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid log format '{}': must be 'text' or 'json'",
                    other
                )))
            }
        }

        Ok(())
    }
}

/// Backend API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    pub base_url: String,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
}

impl ApiConfig {
    /// Request timeout as a `Duration`
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

fn default_timeout_seconds() -> u64 {
    30
}

/// How chunk requests are scheduled
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchMode {
    /// Fixed batches of `concurrency` chunks; a batch settles before the next starts
    #[default]
    Batched,
    /// Worker pool of `concurrency` slots; a free slot takes the next chunk
    Pooled,
}

/// Chunked upload configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    /// Upload host; defaults to `api.base_url`
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,
    /// Attempts per chunk, first try included
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_backoff_base_millis")]
    pub backoff_base_millis: u64,
    #[serde(default)]
    pub dispatch: DispatchMode,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            chunk_size: default_chunk_size(),
            max_retries: default_max_retries(),
            concurrency: default_concurrency(),
            backoff_base_millis: default_backoff_base_millis(),
            dispatch: DispatchMode::default(),
        }
    }
}

fn default_chunk_size() -> u64 {
    10 * 1024 * 1024 // 10MiB
}

fn default_max_retries() -> u32 {
    3
}

fn default_concurrency() -> usize {
    3
}

fn default_backoff_base_millis() -> u64 {
    1000
}

/// Authenticated request configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Location prefixes on which no credential is attached
    #[serde(default = "default_public_paths")]
    pub public_paths: Vec<String>,
    /// Request paths that never trigger a refresh (login, logout, refresh)
    #[serde(default = "default_bootstrap_paths")]
    pub bootstrap_paths: Vec<String>,
    #[serde(default = "default_refresh_path")]
    pub refresh_path: String,
    #[serde(default = "default_max_refresh_retries")]
    pub max_refresh_retries: u32,
    /// Pause between the expiry notice and the redirect to sign-in
    #[serde(default = "default_sign_out_delay_millis")]
    pub sign_out_delay_millis: u64,
    /// How long a settled refresh is reused by late callers
    #[serde(default = "default_refresh_linger_millis")]
    pub refresh_linger_millis: u64,
    #[serde(default = "default_sign_in_path")]
    pub sign_in_path: String,
    /// JSON file holding the access and refresh tokens
    #[serde(default)]
    pub credentials_file: Option<PathBuf>,
    /// Endpoint issuing pre-signed upload URLs
    #[serde(default = "default_presign_path")]
    pub presign_path: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            public_paths: default_public_paths(),
            bootstrap_paths: default_bootstrap_paths(),
            refresh_path: default_refresh_path(),
            max_refresh_retries: default_max_refresh_retries(),
            sign_out_delay_millis: default_sign_out_delay_millis(),
            refresh_linger_millis: default_refresh_linger_millis(),
            sign_in_path: default_sign_in_path(),
            credentials_file: None,
            presign_path: default_presign_path(),
        }
    }
}

fn default_public_paths() -> Vec<String> {
    vec!["/public".into(), "/login".into(), "/register".into()]
}

fn default_bootstrap_paths() -> Vec<String> {
    vec![
        "/auth/login".into(),
        "/auth/logout".into(),
        "/auth/refresh-token".into(),
    ]
}

fn default_refresh_path() -> String {
    "/auth/refresh-token".to_string()
}

fn default_max_refresh_retries() -> u32 {
    3
}

fn default_sign_out_delay_millis() -> u64 {
    1500
}

fn default_refresh_linger_millis() -> u64 {
    100
}

fn default_sign_in_path() -> String {
    "/login".to_string()
}

fn default_presign_path() -> String {
    "/storage/presigned-url".to_string()
}

/// Log output configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter when RUST_LOG is not set
    #[serde(default = "default_log_level")]
    pub level: String,
    /// "text" or "json"
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

/// Metrics configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Print the Prometheus text exposition when a command finishes
    #[serde(default)]
    pub enabled: bool,
}
