use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::time::{Instant, sleep};

use crate::errors::MachineError;

/// Bounds used by the create-then-visible flow of every driver.
pub const INSTANCE_POLL_INTERVAL: Duration = Duration::from_secs(2);
pub const INSTANCE_POLL_TIMEOUT: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Error)]
pub enum PollError {
    #[error("condition not met after {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Failed(MachineError),
}

/// Calls `predicate` immediately, then every `interval`, until it returns
/// `Ok(true)`, raises a terminal error, or `timeout` elapses. Retryable errors
/// raised by the predicate keep the loop running until the deadline.
pub async fn poll_immediate<F, Fut>(interval: Duration, timeout: Duration, mut predicate: F) -> Result<(), PollError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool, MachineError>>,
{
    let deadline = Instant::now() + timeout;

    loop {
        match predicate().await {
            Ok(true) => return Ok(()),
            Ok(false) => {}
            Err(err) if err.is_terminal() => return Err(PollError::Failed(err)),
            Err(err) => debug!("retryable error while polling: {err}"),
        }

        if Instant::now() + interval > deadline {
            return Err(PollError::Timeout(timeout));
        }

        sleep(interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::MachineError;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_poll_immediate_succeeds_after_retries() {
        // setup:
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_in_predicate = attempts.clone();

        // execute:
        let result = poll_immediate(Duration::from_millis(5), Duration::from_secs(5), move || {
            let attempts = attempts_in_predicate.clone();
            async move { Ok(attempts.fetch_add(1, Ordering::SeqCst) >= 2) }
        })
        .await;

        // verify:
        assert!(result.is_ok());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_poll_immediate_times_out() {
        // execute:
        let result = poll_immediate(Duration::from_millis(5), Duration::from_millis(20), || async { Ok(false) }).await;

        // verify:
        assert!(matches!(result, Err(PollError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_poll_immediate_swallows_retryable_errors() {
        // setup:
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_in_predicate = attempts.clone();

        // execute:
        let result = poll_immediate(Duration::from_millis(5), Duration::from_secs(5), move || {
            let attempts = attempts_in_predicate.clone();
            async move {
                if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(MachineError::new_retryable("throttled".to_string(), None))
                } else {
                    Ok(true)
                }
            }
        })
        .await;

        // verify:
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_poll_immediate_propagates_terminal_errors() {
        // execute:
        let result = poll_immediate(Duration::from_millis(5), Duration::from_secs(5), || async {
            Err(MachineError::new_auth_failure("expired credentials".to_string()))
        })
        .await;

        // verify:
        match result {
            Err(PollError::Failed(err)) => assert!(err.is_terminal()),
            other => panic!("expected terminal failure, got {other:?}"),
        }
    }
}
