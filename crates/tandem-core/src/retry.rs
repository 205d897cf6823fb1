//! Retry mechanisms for handling transient failures

use crate::{Error, Result};
use std::time::{Duration, Instant};

/// Retry configuration
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of attempts, the first one included
    pub max_attempts: u32,
    /// Initial delay between retries
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
    /// Jitter factor to randomize delays
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

/// What a retried operation took
#[derive(Debug, Clone, Default)]
pub struct RetryStats {
    /// Attempts made
    pub attempts: u32,
    /// Time from the first attempt to the outcome
    pub elapsed: Duration,
}

/// Run `operation` until it succeeds, fails for good or runs out of attempts
///
/// Only errors for which [`Error::is_retryable`] holds are retried. The
/// closure receives the attempt number, starting at 1.
pub fn retry<F, T>(config: &RetryConfig, what: &str, operation: F) -> Result<T>
where
    F: FnMut(u32) -> Result<T>,
{
    retry_with_stats(config, what, Error::is_retryable, operation).0
}

/// Like [`retry`], with the caller deciding which errors are worth another
/// attempt
///
/// The final error passes through [`exhausted`] when attempts ran out.
pub fn retry_with_stats<F, P, T>(
    config: &RetryConfig,
    what: &str,
    should_retry: P,
    mut operation: F,
) -> (Result<T>, RetryStats)
where
    F: FnMut(u32) -> Result<T>,
    P: Fn(&Error) -> bool,
{
    let start = Instant::now();
    let mut attempt = 0;
    loop {
        attempt += 1;
        let error = match operation(attempt) {
            Ok(value) => return (Ok(value), stats(attempt, start)),
            Err(error) => error,
        };
        if !should_retry(&error) {
            return (Err(error), stats(attempt, start));
        }
        if attempt >= config.max_attempts {
            return (Err(exhausted(what, attempt, error)), stats(attempt, start));
        }
        tracing::debug!("{} attempt {} failed, retrying: {}", what, attempt, error);
        std::thread::sleep(calculate_delay(config, attempt));
    }
}

fn stats(attempts: u32, start: Instant) -> RetryStats {
    RetryStats {
        attempts,
        elapsed: start.elapsed(),
    }
}

/// Delay before the attempt after `attempt`, with exponential backoff and jitter
pub fn calculate_delay(config: &RetryConfig, attempt: u32) -> Duration {
    let base_delay = config.initial_delay.as_nanos() as f64
        * config.backoff_multiplier.powi(attempt.max(1) as i32 - 1);
    let base_delay = base_delay.min(config.max_delay.as_nanos() as f64);

    // Jitter keeps slaves from re-resolving in lockstep.
    let jitter_range = base_delay * config.jitter_factor;
    let jitter = (rand::random::<f64>() - 0.5) * 2.0 * jitter_range;

    Duration::from_nanos((base_delay + jitter).max(0.0) as u64)
}

/// Error reported when every attempt failed
pub fn exhausted(what: &str, attempts: u32, last: Error) -> Error {
    match last {
        Error::MasterNotFound(msg) => {
            Error::MasterNotFound(format!("{} after {} attempts: {}", what, attempts, msg))
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    fn fast(attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts: attempts,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            backoff_multiplier: 2.0,
            jitter_factor: 0.0,
        }
    }

    #[test]
    fn test_delay_grows_and_is_capped() {
        let config = RetryConfig {
            jitter_factor: 0.0,
            ..RetryConfig::default()
        };
        assert_eq!(calculate_delay(&config, 1), Duration::from_millis(100));
        assert_eq!(calculate_delay(&config, 2), Duration::from_millis(200));
        assert_eq!(calculate_delay(&config, 3), Duration::from_millis(400));
        assert_eq!(calculate_delay(&config, 20), Duration::from_secs(5));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let config = RetryConfig::default();
        for _ in 0..100 {
            let delay = calculate_delay(&config, 1);
            assert!(delay >= Duration::from_millis(90) && delay <= Duration::from_millis(110));
        }
    }

    #[test]
    fn test_transient_errors_are_retried() {
        let (result, stats) = retry_with_stats(&fast(5), "pull", Error::is_retryable, |attempt| {
            if attempt < 3 {
                Err(Error::Io(io::Error::new(io::ErrorKind::ConnectionReset, "reset")))
            } else {
                Ok(attempt)
            }
        });
        assert_eq!(result.unwrap(), 3);
        assert_eq!(stats.attempts, 3);
    }

    #[test]
    fn test_branch_is_never_retried() {
        let (result, stats) = retry_with_stats(&fast(5), "pull", Error::is_retryable, |_| {
            Err::<(), _>(Error::branched("forked"))
        });
        assert!(matches!(result, Err(Error::BranchedData(_))));
        assert_eq!(stats.attempts, 1);
    }

    #[test]
    fn test_attempts_are_bounded() {
        let mut calls = 0;
        let result = retry(&fast(4), "master resolution", |_| -> Result<()> {
            calls += 1;
            Err(Error::MasterNotFound("none".into()))
        });
        let err = result.unwrap_err();
        assert!(err.to_string().contains("master resolution after 4 attempts"));
        assert_eq!(calls, 4);
    }

    #[test]
    fn test_caller_decides_what_is_retried() {
        let mut calls = 0;
        let (result, stats) = retry_with_stats(
            &fast(3),
            "commit",
            |e| matches!(e, Error::NotMaster(_)),
            |_| -> Result<()> {
                calls += 1;
                Err(Error::NotMaster("stepped down".into()))
            },
        );
        assert!(matches!(result, Err(Error::NotMaster(_))));
        assert_eq!((calls, stats.attempts), (3, 3));
    }
}
