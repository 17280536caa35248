//! Retry policy for uploads.
//!
//! ```text
//! attempt 1: immediate
//! attempt 2: wait base
//! attempt 3: wait base * 2
//! attempt 4: wait base * 4   (capped at max_backoff)
//! ```

use std::time::Duration;

use crate::config::RetryConfig;

/// Bounded exponential backoff over a set of transient HTTP statuses.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    retry_statuses: Vec<u16>,
}

impl RetryPolicy {
    pub fn new(
        max_retries: u32,
        base_backoff: Duration,
        max_backoff: Duration,
        retry_statuses: Vec<u16>,
    ) -> Self {
        Self {
            max_retries,
            base_backoff,
            max_backoff,
            retry_statuses,
        }
    }

    /// Maximum number of requests per upload.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Delay before retry number `retry` (1-based).
    pub fn backoff(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(31);
        self.base_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff)
    }

    /// Whether a response status is transient.
    pub fn is_retryable_status(&self, status: u16) -> bool {
        self.retry_statuses.contains(&status)
    }

    /// Whether a transport error is transient.
    ///
    /// Connection failures and timeouts are; body or builder errors are not.
    pub fn is_retryable_error(&self, err: &reqwest::Error) -> bool {
        err.is_connect() || err.is_timeout() || err.is_request()
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self::new(
            config.max_retries,
            Duration::from_millis(config.backoff_base_ms),
            Duration::from_millis(config.max_backoff_ms),
            config.retry_statuses.clone(),
        )
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}
