//! Timeout race between a unit of work and a timer.
//!
//! The work runs as its own tokio task. If the timer fires first the caller
//! gets a `TIMEOUT` error and the task is detached, not aborted: it keeps
//! running to completion in the background and its output is dropped. Any
//! side effects it performs after the timeout still happen, and the task
//! holds its resources until it finishes on its own.

use std::future::Future;
use std::time::Duration;

use conductor_core::error::AgentError;

/// Race `work` against `timeout`, returning whichever settles first.
///
/// A panic inside `work` is reported as `UNKNOWN_ERROR`.
pub async fn with_timeout<T, F>(timeout: Duration, work: F) -> Result<T, AgentError>
where
    F: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    let mut handle = tokio::spawn(work);

    tokio::select! {
        biased;
        joined = &mut handle => joined.map_err(|e| {
            if e.is_panic() {
                AgentError::from_panic(e.into_panic())
            } else {
                AgentError::execution_failed(format!("Task cancelled: {}", e))
            }
        }),
        _ = tokio::time::sleep(timeout) => {
            // Dropping a JoinHandle detaches the task.
            drop(handle);
            Err(AgentError::timeout(timeout.as_millis() as u64))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    use conductor_core::error::ErrorCode;

    #[tokio::test]
    async fn fast_work_wins_unmodified() {
        let out = with_timeout(Duration::from_secs(5), async { 42 }).await;
        assert_eq!(out.unwrap(), 42);
    }

    #[tokio::test]
    async fn slow_work_times_out() {
        let out = with_timeout(Duration::from_millis(20), async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            "late"
        })
        .await;
        let err = out.unwrap_err();
        assert_eq!(err.code, ErrorCode::Timeout);
        assert_eq!(err.details.unwrap()["timeout_ms"], 20);
    }

    #[tokio::test]
    async fn loser_keeps_running_after_timeout() {
        let finished = Arc::new(AtomicBool::new(false));
        let flag = finished.clone();

        let out = with_timeout(Duration::from_millis(20), async move {
            tokio::time::sleep(Duration::from_millis(80)).await;
            flag.store(true, Ordering::SeqCst);
        })
        .await;

        assert_eq!(out.unwrap_err().code, ErrorCode::Timeout);
        assert!(!finished.load(Ordering::SeqCst));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(finished.load(Ordering::SeqCst), "detached task should finish");
    }

    #[tokio::test]
    async fn panics_become_unknown_errors() {
        let out: Result<(), _> = with_timeout(Duration::from_secs(1), async {
            panic!("kaboom");
        })
        .await;
        let err = out.unwrap_err();
        assert_eq!(err.code, ErrorCode::UnknownError);
        assert!(err.message.contains("kaboom"));
    }
}
