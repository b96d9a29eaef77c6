//! Delay policy for the fetch retry loop
//!
//! Between attempts the client waits `min(max_delay, initial_delay * 2^attempt)`
//! plus a linear term of `attempt * linear_jitter`. Rate limiting adds its own
//! waits on top: the `Retry-After` value (or a fixed fallback) for 429
//! responses, and a randomized pause when an HTML error page says
//! "Too Many Requests".

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Backoff configuration for the fetch client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// Delay after the first failed attempt in milliseconds (default: 500ms)
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,

    /// Upper bound of the exponential part in milliseconds (default: 8s)
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    /// Linear term added per attempt in milliseconds (default: 100ms)
    #[serde(default = "default_linear_jitter")]
    pub linear_jitter_ms: u64,

    /// Wait after a 429 without a usable `Retry-After` header (default: 5s)
    #[serde(default = "default_rate_limit_fallback")]
    pub rate_limit_fallback_secs: u64,

    /// Lower bound of the extra pause for HTML rate-limit pages (default: 5s)
    #[serde(default = "default_html_rate_limit_min")]
    pub html_rate_limit_min_ms: u64,

    /// Upper bound of the extra pause for HTML rate-limit pages (default: 10s)
    #[serde(default = "default_html_rate_limit_max")]
    pub html_rate_limit_max_ms: u64,
}

const fn default_initial_delay() -> u64 {
    500
}

const fn default_max_delay() -> u64 {
    8_000
}

const fn default_linear_jitter() -> u64 {
    100
}

const fn default_rate_limit_fallback() -> u64 {
    5
}

const fn default_html_rate_limit_min() -> u64 {
    5_000
}

const fn default_html_rate_limit_max() -> u64 {
    10_000
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay(),
            max_delay_ms: default_max_delay(),
            linear_jitter_ms: default_linear_jitter(),
            rate_limit_fallback_secs: default_rate_limit_fallback(),
            html_rate_limit_min_ms: default_html_rate_limit_min(),
            html_rate_limit_max_ms: default_html_rate_limit_max(),
        }
    }
}

impl BackoffConfig {
    /// All waits disabled
    #[must_use]
    pub const fn immediate() -> Self {
        Self {
            initial_delay_ms: 0,
            max_delay_ms: 0,
            linear_jitter_ms: 0,
            rate_limit_fallback_secs: 0,
            html_rate_limit_min_ms: 0,
            html_rate_limit_max_ms: 0,
        }
    }

    /// Delay after the given failed attempt (0-indexed)
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponential = self
            .initial_delay_ms
            .saturating_mul(2u64.saturating_pow(attempt))
            .min(self.max_delay_ms);
        let linear = self.linear_jitter_ms.saturating_mul(u64::from(attempt));
        Duration::from_millis(exponential.saturating_add(linear))
    }

    /// Wait for a 429 response
    #[must_use]
    pub fn rate_limit_delay(&self, retry_after_secs: Option<u64>) -> Duration {
        Duration::from_secs(retry_after_secs.unwrap_or(self.rate_limit_fallback_secs))
    }

    /// Randomized extra wait when an HTML page reports rate limiting
    #[must_use]
    pub fn html_rate_limit_delay(&self) -> Duration {
        if self.html_rate_limit_max_ms <= self.html_rate_limit_min_ms {
            return Duration::from_millis(self.html_rate_limit_min_ms);
        }
        let millis =
            rand::rng().random_range(self.html_rate_limit_min_ms..=self.html_rate_limit_max_ms);
        Duration::from_millis(millis)
    }
}

/// Sleep unless the duration is zero
pub(crate) async fn pause(duration: Duration) {
    if !duration.is_zero() {
        tokio::time::sleep(duration).await;
    }
}
