//! Bounded exponential backoff for waiting on remote endpoints
//!
//! Used while waiting for a freshly booted node's sshd to start accepting
//! connections. The budget is explicit: once `max_retries` is spent the
//! caller gives up instead of polling forever.
//!
//! # Example
//!
//! ```
//! use provisioner::retry::{RetryConfig, RetryState};
//! use std::time::Duration;
//!
//! let config = RetryConfig::new(3, Duration::from_millis(500), Duration::from_secs(10));
//! let mut state = RetryState::new();
//!
//! while state.should_retry(&config) {
//!     let delay = state.calculate_delay(&config);
//!     // probe, sleep `delay`, ...
//!     state.record_retry();
//! }
//! assert_eq!(state.attempt, 4);
//! ```

use std::time::Duration;
use tracing::debug;

/// Retry configuration for endpoint probing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (not including initial attempt)
    pub max_retries: u32,
    /// Base delay for exponential backoff
    pub base_delay: Duration,
    /// Maximum delay cap to prevent excessive waiting
    pub max_delay: Duration,
}

impl RetryConfig {
    pub fn new(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
        }
    }

    /// Upper bound on total time spent sleeping between attempts
    pub fn total_budget(&self) -> Duration {
        let mut state = RetryState::new();
        let mut total = Duration::ZERO;
        while state.should_retry(self) {
            total = total.saturating_add(state.calculate_delay(self));
            state.retry_count += 1;
        }
        total
    }
}

impl Default for RetryConfig {
    /// 8 retries, 1s base, 30s cap
    fn default() -> Self {
        Self::new(8, Duration::from_secs(1), Duration::from_secs(30))
    }
}

/// Retry state for one wait loop
#[derive(Debug, Clone)]
pub struct RetryState {
    /// Current attempt number (starts at 1 for first attempt)
    pub attempt: u32,
    /// Number of retries performed (0 for first attempt)
    pub retry_count: u32,
}

impl RetryState {
    pub fn new() -> Self {
        Self {
            attempt: 1,
            retry_count: 0,
        }
    }

    pub fn should_retry(&self, config: &RetryConfig) -> bool {
        self.retry_count < config.max_retries
    }

    /// delay = base_delay * 2^retry_count, capped at max_delay
    pub fn calculate_delay(&self, config: &RetryConfig) -> Duration {
        let factor = 2u32.checked_pow(self.retry_count).unwrap_or(u32::MAX);
        let delay = config
            .base_delay
            .checked_mul(factor)
            .unwrap_or(config.max_delay)
            .min(config.max_delay);

        debug!(
            "Calculated backoff delay: {:?} (attempt {}, retry {})",
            delay, self.attempt, self.retry_count
        );

        delay
    }

    pub fn record_retry(&mut self) {
        self.retry_count += 1;
        self.attempt += 1;
    }
}

impl Default for RetryState {
    fn default() -> Self {
        Self::new()
    }
}
