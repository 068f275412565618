//! Retry utilities for temperature sources with exponential backoff.
//!
//! Retries transient failures:
//! - Source unavailable
//! - Rate limiting
//!
//! Does NOT retry:
//! - Unknown locations
//! - Malformed responses

use std::future::Future;
use std::time::Duration;

use nimbus_core::RetrySettings;

use crate::types::SourceError;

/// Retry configuration
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts
    pub max_retries: u32,
    /// Initial delay between retries (doubles each attempt)
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::from(&RetrySettings::default())
    }
}

impl From<&RetrySettings> for RetryConfig {
    fn from(settings: &RetrySettings) -> Self {
        Self::new(
            settings.max_retries,
            settings.initial_delay_ms,
            settings.max_delay_ms,
        )
    }
}

impl RetryConfig {
    pub fn new(max_retries: u32, initial_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            max_retries,
            initial_delay: Duration::from_millis(initial_delay_ms),
            max_delay: Duration::from_millis(max_delay_ms),
        }
    }

    /// Never retry
    pub fn disabled() -> Self {
        Self::new(0, 0, 0)
    }

    /// Calculate the delay for a given attempt number
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        // Exponential backoff: initial_delay * 2^attempt
        let factor = 2u64.saturating_pow(attempt);
        let initial_ms = u64::try_from(self.initial_delay.as_millis()).unwrap_or(u64::MAX);
        let max_ms = u64::try_from(self.max_delay.as_millis()).unwrap_or(u64::MAX);
        Duration::from_millis(initial_ms.saturating_mul(factor).min(max_ms))
    }
}

/// Error classification for retry decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry,
    NoRetry,
}

pub fn classify(error: &SourceError) -> RetryDecision {
    match error {
        SourceError::Unavailable(_) | SourceError::RateLimited => RetryDecision::Retry,
        SourceError::LocationNotFound(_) | SourceError::InvalidResponse(_) => {
            RetryDecision::NoRetry
        }
    }
}

/// Run a source operation, retrying transient failures.
///
/// Returns the first success, the first non-retryable error, or the last
/// error once all retries are used up.
///
/// # Example
/// ```ignore
/// let temp = with_retry(&RetryConfig::default(), || source.current_temperature("Oslo")).await?;
/// ```
pub async fn with_retry<T, F, Fut>(config: &RetryConfig, operation: F) -> Result<T, SourceError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, SourceError>>,
{
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 0 {
                    tracing::info!("Source succeeded after {} retries", attempt);
                }
                return Ok(value);
            }
            Err(e) => {
                if classify(&e) == RetryDecision::NoRetry {
                    tracing::debug!("Non-retryable source error: {}", e);
                    return Err(e);
                }

                if attempt >= config.max_retries {
                    tracing::error!("All {} source attempts exhausted: {}", attempt + 1, e);
                    return Err(e);
                }

                let delay = config.delay_for_attempt(attempt);
                tracing::warn!(
                    "Retryable source error on attempt {} of {}, waiting {:?}: {}",
                    attempt + 1,
                    config.max_retries + 1,
                    delay,
                    e
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_retry_config_default() {
        let config = RetryConfig::default();
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.initial_delay, Duration::from_millis(100));
        assert_eq!(config.max_delay, Duration::from_millis(5000));
    }

    #[test]
    fn test_delay_calculation() {
        let config = RetryConfig::new(3, 100, 5000);
        assert_eq!(config.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(config.delay_for_attempt(2), Duration::from_millis(400));
        assert_eq!(config.delay_for_attempt(3), Duration::from_millis(800));
    }

    #[test]
    fn test_delay_capped_at_max() {
        let config = RetryConfig::new(10, 100, 1000);
        assert_eq!(config.delay_for_attempt(4), Duration::from_millis(1000));
        assert_eq!(config.delay_for_attempt(64), Duration::from_millis(1000));
    }

    #[test]
    fn test_classification() {
        assert_eq!(classify(&SourceError::Unavailable("503".into())), RetryDecision::Retry);
        assert_eq!(classify(&SourceError::RateLimited), RetryDecision::Retry);
        assert_eq!(
            classify(&SourceError::LocationNotFound("Atlantis".into())),
            RetryDecision::NoRetry
        );
        assert_eq!(
            classify(&SourceError::InvalidResponse("{}".into())),
            RetryDecision::NoRetry
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_from_transient_failures() {
        let attempts = AtomicU32::new(0);
        let start = tokio::time::Instant::now();

        let result = with_retry(&RetryConfig::new(3, 100, 5000), || async {
            if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(SourceError::Unavailable("busy".into()))
            } else {
                Ok(19.5)
            }
        })
        .await;

        assert_eq!(result, Ok(19.5));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        // 100ms + 200ms of backoff
        assert_eq!(start.elapsed(), Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_does_not_retry_unknown_location() {
        let attempts = AtomicU32::new(0);

        let result: Result<f64, _> = with_retry(&RetryConfig::default(), || async {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(SourceError::LocationNotFound("Atlantis".into()))
        })
        .await;

        assert_eq!(result, Err(SourceError::LocationNotFound("Atlantis".into())));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_retries() {
        let attempts = AtomicU32::new(0);

        let result: Result<f64, _> = with_retry(&RetryConfig::new(2, 10, 100), || async {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(SourceError::RateLimited)
        })
        .await;

        assert_eq!(result, Err(SourceError::RateLimited));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_makes_one_attempt() {
        let attempts = AtomicU32::new(0);

        let result: Result<f64, _> = with_retry(&RetryConfig::disabled(), || async {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(SourceError::Unavailable("down".into()))
        })
        .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
