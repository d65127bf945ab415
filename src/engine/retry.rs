//! The retry loop applied to every engine call.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tracing::warn;

use crate::metrics::BackendMetrics;

use super::{EngineError, Result};

/// Fixed pause between attempts.
pub(crate) const RETRY_INTERVAL: Duration = Duration::from_secs(10);

/// Invoke `thunk` until it succeeds, fails with a permanent error, or the
/// deadline fires.
///
/// The request counter is bumped before every attempt and the failure
/// counter on every transient failure. Between attempts the loop sleeps ten
/// seconds or until the deadline, whichever comes first. When the deadline
/// fires the last transient error is returned; if no attempt ever failed, a
/// synthesized [`EngineError::Timeout`] is returned instead. The caller is
/// responsible for logging the final error at an appropriate level.
pub(crate) async fn retry<T, F, Fut>(
    what: &str,
    deadline: Instant,
    metrics: &BackendMetrics,
    mut thunk: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut last_error: Option<EngineError> = None;
    loop {
        metrics.requests.increment();
        match tokio::time::timeout_at(deadline, thunk()).await {
            Err(_elapsed) => break,
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(err)) if err.is_permanent() => return Err(err),
            Ok(Err(err)) => {
                metrics.failures.increment();
                warn!("failed to {}, retrying in 10 seconds ({})", what, err);
                last_error = Some(err);
            }
        }
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        tokio::time::sleep_until(deadline.min(now + RETRY_INTERVAL)).await;
        if Instant::now() >= deadline {
            break;
        }
    }
    Err(last_error.unwrap_or(EngineError::Timeout))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use super::*;
    use crate::metrics::{AtomicCounter, BackendMetrics};

    fn server_error(status_code: u16) -> EngineError {
        EngineError::Api(bollard::errors::Error::DockerResponseServerError {
            status_code,
            message: "test".to_string(),
        })
    }

    fn counting_metrics() -> (BackendMetrics, Arc<AtomicCounter>, Arc<AtomicCounter>) {
        let requests = Arc::new(AtomicCounter::default());
        let failures = Arc::new(AtomicCounter::default());
        (
            BackendMetrics::new(requests.clone(), failures.clone()),
            requests,
            failures,
        )
    }

    #[tokio::test]
    async fn test_first_attempt_success() {
        let (metrics, requests, failures) = counting_metrics();
        let deadline = Instant::now() + Duration::from_secs(60);
        let result = retry("test", deadline, &metrics, || async { Ok(42) }).await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(requests.value(), 1);
        assert_eq!(failures.value(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_are_retried_until_success() {
        let (metrics, requests, failures) = counting_metrics();
        let deadline = Instant::now() + Duration::from_secs(120);
        let attempts = Arc::new(AtomicU32::new(0));
        let result = {
            let attempts = attempts.clone();
            retry("test", deadline, &metrics, move || {
                let attempts = attempts.clone();
                async move {
                    if attempts.fetch_add(1, Ordering::SeqCst) < 3 {
                        Err(server_error(500))
                    } else {
                        Ok("done")
                    }
                }
            })
            .await
        };
        assert_eq!(result.unwrap(), "done");
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
        assert_eq!(requests.value(), 4);
        assert_eq!(failures.value(), 3);
    }

    #[tokio::test]
    async fn test_permanent_error_short_circuits() {
        let (metrics, requests, failures) = counting_metrics();
        let deadline = Instant::now() + Duration::from_secs(600);
        let started = std::time::Instant::now();
        let result: Result<()> =
            retry("test", deadline, &metrics, || async { Err(server_error(404)) }).await;
        assert!(result.unwrap_err().is_not_found());
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(requests.value(), 1);
        assert_eq!(failures.value(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_returns_last_transient_error() {
        let (metrics, _, _) = counting_metrics();
        let deadline = Instant::now() + Duration::from_secs(25);
        let result: Result<()> =
            retry("test", deadline, &metrics, || async { Err(server_error(500)) }).await;
        match result.unwrap_err() {
            EngineError::Api(bollard::errors::Error::DockerResponseServerError {
                status_code,
                ..
            }) => assert_eq!(status_code, 500),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_with_hanging_call_synthesizes_timeout() {
        let (metrics, _, _) = counting_metrics();
        let deadline = Instant::now() + Duration::from_secs(5);
        let result: Result<()> = retry("test", deadline, &metrics, || async {
            std::future::pending::<()>().await;
            unreachable!()
        })
        .await;
        assert!(matches!(result.unwrap_err(), EngineError::Timeout));
    }
}
