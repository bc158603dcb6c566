//! Retry utilities: backoff construction and retryable error classification.
//!
//! Uses `backon` for exponential backoff with jitter. The queue-full sweep
//! draws its delays from here.

use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBuilder};

use crate::config::RetryConfig;
use crate::interfaces::FrontendError;

/// Endless delay sequence for queue-full redelivery.
///
/// Once the configured sequence is exhausted every further delay is the
/// configured maximum.
pub struct QueueFullBackoff {
    config: RetryConfig,
    delays: <ExponentialBuilder as BackoffBuilder>::Backoff,
}

impl QueueFullBackoff {
    pub fn new(config: RetryConfig) -> Self {
        let delays = config.backoff().build();
        Self { config, delays }
    }

    pub fn next_delay(&mut self) -> Duration {
        self.delays.next().unwrap_or_else(|| self.config.max_delay())
    }

    /// Start over from the minimum delay after a sweep that drained the list.
    pub fn reset(&mut self) {
        self.delays = self.config.backoff().build();
    }
}

/// Determines if a frontend error is worth redelivering.
///
/// Retryable:
/// - `QueueFull`: the transport is momentarily out of resources
///
/// Non-retryable:
/// - `Disconnected`: nobody is left to deliver to
pub fn is_retryable(error: &FrontendError) -> bool {
    matches!(error, FrontendError::QueueFull)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_retryable() {
        assert!(is_retryable(&FrontendError::QueueFull));
        assert!(!is_retryable(&FrontendError::Disconnected("gone".into())));
    }

    #[test]
    fn test_backoff_grows_and_resets() {
        let mut backoff = QueueFullBackoff::new(RetryConfig {
            min_delay_ms: 1,
            max_delay_ms: 4,
            jitter: false,
        });
        let first = backoff.next_delay();
        let second = backoff.next_delay();
        assert_eq!(first, Duration::from_millis(1));
        assert!(second >= first);
        for _ in 0..10 {
            assert!(backoff.next_delay() <= Duration::from_millis(4));
        }
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(1));
    }
}
