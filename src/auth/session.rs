//! Refresh and sign-out state of one gateway
//!
//! Every transition happens under a single mutex so a check-then-set never
//! races on a multi-threaded runtime.

use parking_lot::Mutex;

/// Observable phase of the session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthPhase {
    Idle,
    Refreshing,
    LoggingOut,
}

/// Result of finishing a refresh attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    Succeeded,
    /// Failed, but below the limit; the next auth failure may refresh again
    RetryAllowed { failures: u32 },
    /// Failed for the last permitted time; the session must be signed out
    LimitReached { failures: u32 },
}

#[derive(Debug, Default)]
struct SessionState {
    is_refreshing: bool,
    is_logging_out: bool,
    refresh_retry_count: u32,
}

/// Refresh bookkeeping for one gateway
#[derive(Debug)]
pub struct AuthSession {
    state: Mutex<SessionState>,
    max_refresh_retries: u32,
}

impl AuthSession {
    pub fn new(max_refresh_retries: u32) -> Self {
        Self {
            state: Mutex::new(SessionState::default()),
            max_refresh_retries: max_refresh_retries.max(1),
        }
    }

    /// Enter `Refreshing`. Returns false while a sign-out is in progress.
    pub fn begin_refresh(&self) -> bool {
        let mut state = self.state.lock();
        if state.is_logging_out {
            return false;
        }
        state.is_refreshing = true;
        true
    }

    /// Leave `Refreshing` and account for the attempt
    pub fn complete_refresh(&self, success: bool) -> RefreshOutcome {
        let mut state = self.state.lock();
        state.is_refreshing = false;

        if success {
            state.refresh_retry_count = 0;
            return RefreshOutcome::Succeeded;
        }

        state.refresh_retry_count += 1;
        let failures = state.refresh_retry_count;
        if failures >= self.max_refresh_retries {
            RefreshOutcome::LimitReached { failures }
        } else {
            RefreshOutcome::RetryAllowed { failures }
        }
    }

    /// Enter `LoggingOut`. Only the first caller gets `true`.
    pub fn force_sign_out(&self) -> bool {
        let mut state = self.state.lock();
        if state.is_logging_out {
            return false;
        }
        state.is_logging_out = true;
        state.is_refreshing = false;
        true
    }

    /// Back to `Idle` with a clean counter
    pub fn finish_sign_out(&self) {
        let mut state = self.state.lock();
        state.is_logging_out = false;
        state.refresh_retry_count = 0;
    }

    pub fn phase(&self) -> AuthPhase {
        let state = self.state.lock();
        if state.is_logging_out {
            AuthPhase::LoggingOut
        } else if state.is_refreshing {
            AuthPhase::Refreshing
        } else {
            AuthPhase::Idle
        }
    }

    pub fn is_logging_out(&self) -> bool {
        self.state.lock().is_logging_out
    }

    /// Consecutive failed refreshes since the last success or sign-out
    pub fn refresh_retry_count(&self) -> u32 {
        self.state.lock().refresh_retry_count
    }

    pub fn max_refresh_retries(&self) -> u32 {
        self.max_refresh_retries
    }
}
