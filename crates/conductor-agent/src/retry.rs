use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures::FutureExt;
use tracing::{debug, warn};

use conductor_core::config::{Backoff, RetryConfig};
use conductor_core::error::AgentError;

/// Delay to wait after failed attempt `attempt` (1-based) before the next one.
pub fn calculate_backoff(attempt: u32, config: &RetryConfig) -> Duration {
    let base = config.delay_ms;
    let ms = match config.backoff {
        Backoff::None => 0,
        Backoff::Linear => base,
        Backoff::Exponential => {
            base.saturating_mul(2u64.saturating_pow(attempt.saturating_sub(1)))
        }
    };
    let mut ms = cap(ms, config);

    if config.jitter && ms > 0 {
        // 0.8x to 1.2x
        let jitter = 0.8 + rand::random::<f64>() * 0.4;
        ms = cap((ms as f64 * jitter) as u64, config);
    }
    Duration::from_millis(ms)
}

fn cap(ms: u64, config: &RetryConfig) -> u64 {
    match config.max_delay_ms {
        Some(max) => ms.min(max),
        None => ms,
    }
}

/// Run `op` until it succeeds or `max_attempts` is reached.
///
/// `op` receives the 1-based attempt number. Errors are normalized into
/// [`AgentError`]; a panic inside an attempt counts as a failed attempt.
/// Returns the outcome together with the number of attempts made.
pub async fn run_with_retry<T, F, Fut>(
    label: &str,
    config: &RetryConfig,
    mut op: F,
) -> (Result<T, AgentError>, u32)
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let max_attempts = config.max_attempts.max(1);
    let mut last_err = None;

    for attempt in 1..=max_attempts {
        let outcome = AssertUnwindSafe(async { op(attempt).await })
            .catch_unwind()
            .await;

        let err = match outcome {
            Ok(Ok(value)) => {
                if attempt > 1 {
                    debug!(agent = %label, attempt, "Succeeded after retry");
                }
                return (Ok(value), attempt);
            }
            Ok(Err(e)) => AgentError::normalize(e),
            Err(panic) => AgentError::from_panic(panic),
        };

        if attempt < max_attempts {
            let backoff = calculate_backoff(attempt, config);
            warn!(
                agent = %label,
                attempt,
                max_attempts,
                backoff_ms = backoff.as_millis() as u64,
                error = %err,
                "Attempt failed, retrying"
            );
            tokio::time::sleep(backoff).await;
        } else {
            warn!(agent = %label, attempts = max_attempts, error = %err, "Retries exhausted");
        }
        last_err = Some(err);
    }

    (
        Err(last_err.unwrap_or_else(|| AgentError::execution_failed("All attempts failed"))),
        max_attempts,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use conductor_core::error::ErrorCode;

    fn config(backoff: Backoff, delay_ms: u64, max_delay_ms: Option<u64>) -> RetryConfig {
        RetryConfig {
            max_attempts: 5,
            delay_ms,
            backoff,
            max_delay_ms,
            jitter: false,
        }
    }

    #[test]
    fn exponential_doubles_per_attempt() {
        let cfg = config(Backoff::Exponential, 100, None);
        let delays: Vec<u64> = (1..=4)
            .map(|k| calculate_backoff(k, &cfg).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![100, 200, 400, 800]);
    }

    #[test]
    fn exponential_is_capped_by_max_delay() {
        let cfg = config(Backoff::Exponential, 100, Some(250));
        let delays: Vec<u64> = (1..=4)
            .map(|k| calculate_backoff(k, &cfg).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![100, 200, 250, 250]);
    }

    #[test]
    fn linear_is_constant() {
        let cfg = config(Backoff::Linear, 75, None);
        for k in 1..=6 {
            assert_eq!(calculate_backoff(k, &cfg), Duration::from_millis(75));
        }
    }

    #[test]
    fn none_retries_immediately() {
        let cfg = config(Backoff::None, 500, None);
        assert_eq!(calculate_backoff(3, &cfg), Duration::ZERO);
    }

    #[test]
    fn huge_attempt_numbers_saturate() {
        let cfg = config(Backoff::Exponential, 1000, Some(30_000));
        assert_eq!(calculate_backoff(200, &cfg), Duration::from_millis(30_000));
    }

    #[test]
    fn jitter_stays_in_band_and_under_cap() {
        let cfg = config(Backoff::Linear, 1000, Some(1100)).with_jitter(true);
        for _ in 0..50 {
            let ms = calculate_backoff(1, &cfg).as_millis() as u64;
            assert!((800..=1100).contains(&ms), "jittered delay {ms} out of range");
        }
    }

    #[tokio::test]
    async fn persistent_failure_uses_every_attempt() {
        let calls = AtomicU32::new(0);
        let cfg = RetryConfig::new(3, Duration::ZERO, Backoff::None);
        let (outcome, attempts) = run_with_retry("test", &cfg, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(anyhow::anyhow!("nope")) }
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(attempts, 3);
        let err = outcome.unwrap_err();
        assert_eq!(err.code, ErrorCode::UnknownError);
        assert_eq!(err.message, "nope");
    }

    #[tokio::test]
    async fn stops_at_first_success() {
        let calls = AtomicU32::new(0);
        let cfg = RetryConfig::new(5, Duration::ZERO, Backoff::None);
        let (outcome, attempts) = run_with_retry("test", &cfg, |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 2 {
                    Err(anyhow::anyhow!("flaky"))
                } else {
                    Ok(attempt * 10)
                }
            }
        })
        .await;

        assert_eq!(outcome.unwrap(), 20);
        assert_eq!(attempts, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn last_typed_error_is_returned() {
        let cfg = RetryConfig::new(2, Duration::ZERO, Backoff::None);
        let (outcome, _) = run_with_retry("test", &cfg, |attempt| async move {
            Err::<(), _>(anyhow::Error::new(AgentError::custom(
                "CRM_DOWN",
                format!("attempt {attempt}"),
            )))
        })
        .await;

        let err = outcome.unwrap_err();
        assert_eq!(err.code, ErrorCode::Custom("CRM_DOWN".into()));
        assert_eq!(err.message, "attempt 2");
    }

    #[tokio::test]
    async fn panics_count_as_failed_attempts() {
        let cfg = RetryConfig::new(2, Duration::ZERO, Backoff::None);
        let (outcome, attempts) = run_with_retry("test", &cfg, |attempt| async move {
            if attempt == 1 {
                panic!("first attempt blew up");
            }
            Ok("recovered")
        })
        .await;

        assert_eq!(outcome.unwrap(), "recovered");
        assert_eq!(attempts, 2);
    }

    #[tokio::test]
    async fn zero_attempts_still_runs_once() {
        let calls = AtomicU32::new(0);
        let cfg = RetryConfig {
            max_attempts: 0,
            ..RetryConfig::none()
        };
        let (outcome, attempts) = run_with_retry("test", &cfg, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok(()) }
        })
        .await;

        assert!(outcome.is_ok());
        assert_eq!(attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
