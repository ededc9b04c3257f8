//! Retry with exponential backoff
//!
//! Generic retry loop shared by the chunk transfer path. Delays double on
//! every attempt (`base * 2^attempt`), optionally capped, and every wait is
//! cancellable through a [`CancellationToken`].
//!
//! # Example
//!
//! ```no_run
//! use lms_client::retry::{retry_with_backoff, RetryPolicy};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() {
//! let policy = RetryPolicy::default();
//! let cancel = CancellationToken::new();
//!
//! let result = retry_with_backoff(&policy, &cancel, |attempt| async move {
//!     if attempt < 2 {
//!         Err(format!("attempt {} failed", attempt))
//!     } else {
//!         Ok(attempt)
//!     }
//! })
//! .await;
//! # let _ = result;
//! # }
//! ```

use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Default number of attempts (first try included)
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default base delay; the n-th retry waits `2^n` times this
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);

/// Outcome of a retry loop that did not produce a value
#[derive(Error, Debug)]
pub enum RetryError<E> {
    #[error("operation cancelled")]
    Cancelled,

    #[error("gave up after {attempts} attempts: {last_error}")]
    Exhausted { attempts: u32, last_error: E },
}

impl<E> RetryError<E> {
    /// True when the loop stopped because of cancellation
    pub fn is_cancelled(&self) -> bool {
        matches!(self, RetryError::Cancelled)
    }
}

/// Backoff policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one. Zero is treated as one.
    pub max_attempts: u32,
    /// Delay unit for the exponential schedule
    pub base_delay: Duration,
    /// Upper bound for a single wait
    pub max_delay: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: None,
        }
    }
}

impl RetryPolicy {
    /// Create a policy with the given attempt budget and base delay
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay: None,
        }
    }

    /// Cap every individual wait at `max_delay`
    #[must_use]
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = Some(max_delay);
        self
    }

    /// Wait before the retry that follows the 0-based `attempt`
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        match self.max_delay {
            Some(cap) => delay.min(cap),
            None => delay,
        }
    }

    fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

/// Run `operation` until it succeeds, the attempt budget runs out, or
/// `cancel` fires.
///
/// The closure receives the 0-based attempt number. Cancellation is checked
/// before each attempt, after each failure, and during every backoff wait,
/// so a cancelled loop always reports [`RetryError::Cancelled`] rather than
/// the transport error the cancellation caused.
pub async fn retry_with_backoff<T, E, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut operation: F,
) -> Result<T, RetryError<E>>
where
    E: std::fmt::Display,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let attempts = policy.attempts();

    for attempt in 0..attempts {
        if cancel.is_cancelled() {
            return Err(RetryError::Cancelled);
        }

        match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) => {
                if cancel.is_cancelled() {
                    return Err(RetryError::Cancelled);
                }

                if attempt + 1 >= attempts {
                    return Err(RetryError::Exhausted {
                        attempts,
                        last_error: e,
                    });
                }

                let delay = policy.delay_for_attempt(attempt);
                tracing::warn!(
                    attempt = attempt + 1,
                    max_attempts = attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Attempt failed, backing off"
                );

                tokio::select! {
                    _ = cancel.cancelled() => return Err(RetryError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }

    // attempts() is never zero, so the loop always returns
    Err(RetryError::Cancelled)
}
