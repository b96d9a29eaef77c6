//! Transit error types

use std::fmt;

use thiserror::Error;

/// What the last failed attempt of a fetch looked like
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// 401/403 even after re-acquiring tokens
    Auth,
    /// 429 responses
    RateLimited,
    /// 5xx responses
    ServerError,
    /// Non-JSON or unparsable JSON body
    MalformedResponse,
    /// Connection error or timeout
    Network,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Auth => write!(f, "authentication failure"),
            Self::RateLimited => write!(f, "rate limited"),
            Self::ServerError => write!(f, "server error"),
            Self::MalformedResponse => write!(f, "malformed response"),
            Self::Network => write!(f, "network error"),
        }
    }
}

/// Errors that can occur while polling the transit backend
#[derive(Debug, Error)]
pub enum TransitError {
    /// Connection failure or timeout outside the retry loop (token handshake)
    #[error("Network error: {0}")]
    Network(String),

    /// Every attempt of one fetch failed
    #[error("Stop {stop_id}: giving up after {attempts} attempts ({last_failure})")]
    ExhaustedRetries {
        /// Stop whose fetch failed
        stop_id: String,
        /// Number of attempts made
        attempts: u32,
        /// Classification of the last attempt
        last_failure: FailureKind,
    },

    /// Invalid configuration input (stop ids)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Every configured stop failed and no stale data can be served
    #[error("No valid data received for any stop ({consecutive_failures} consecutive failures)")]
    NoDataAvailable {
        /// Consecutive failed cycles including this one
        consecutive_failures: u32,
    },

    /// Configuration or client setup error
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl TransitError {
    /// Returns true if a later attempt may succeed
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Network(_) | Self::ExhaustedRetries { .. } | Self::NoDataAvailable { .. }
        )
    }

    /// Map a reqwest error from the handshake path
    pub(crate) fn from_reqwest(err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Network(format!("request timed out: {err}"))
        } else {
            Self::Network(err.to_string())
        }
    }
}
