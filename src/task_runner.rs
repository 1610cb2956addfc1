/// Retry policy and cancellable waits for background loops
///
/// Every polling loop in the engine sleeps through these helpers so that a
/// cancelled task wakes immediately instead of finishing its interval.

use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Bounded burst of attempts with a fixed delay between them
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    /// Delay between consecutive attempts
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_secs(5),
        }
    }
}

/// Result of a burst that did not fail
#[derive(Debug, Clone, PartialEq)]
pub enum BurstOutcome<T> {
    Found { value: T, attempt: u32 },
    Exhausted,
    Cancelled,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
        }
    }

    /// Offset of each attempt from the start of the burst
    pub fn attempt_offsets(&self) -> Vec<Duration> {
        (0..self.max_attempts.max(1))
            .map(|attempt| self.delay * attempt)
            .collect()
    }

    /// Run `attempt` until it yields a value, attempts run out or `token` fires.
    ///
    /// A failed attempt counts as producing nothing and the burst goes on.
    /// Only when every attempt failed is the last error returned.
    pub async fn run_burst<T, E, F, Fut>(
        &self,
        token: &CancellationToken,
        mut attempt: F,
    ) -> Result<BurstOutcome<T>, E>
    where
        E: fmt::Display,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<Option<T>, E>>,
    {
        let attempts = self.max_attempts.max(1);
        let mut failures = 0;
        let mut last_error = None;
        for n in 1..=attempts {
            if token.is_cancelled() {
                return Ok(BurstOutcome::Cancelled);
            }
            match attempt(n).await {
                Ok(Some(value)) => return Ok(BurstOutcome::Found { value, attempt: n }),
                Ok(None) => debug!("Attempt {}/{} produced nothing", n, attempts),
                Err(e) => {
                    warn!("Attempt {}/{} failed: {}", n, attempts, e);
                    failures += 1;
                    last_error = Some(e);
                }
            }
            if n < attempts && !sleep_or_cancel(self.delay, token).await {
                return Ok(BurstOutcome::Cancelled);
            }
        }
        match last_error {
            Some(e) if failures == attempts => Err(e),
            _ => Ok(BurstOutcome::Exhausted),
        }
    }
}

/// Sleep for `duration`; false if `token` was cancelled first
pub async fn sleep_or_cancel(duration: Duration, token: &CancellationToken) -> bool {
    tokio::select! {
        _ = token.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_attempt_offsets() {
        let policy = RetryPolicy::new(3, Duration::from_secs(5));
        assert_eq!(
            policy.attempt_offsets(),
            vec![
                Duration::ZERO,
                Duration::from_secs(5),
                Duration::from_secs(10)
            ]
        );
        assert_eq!(RetryPolicy::new(0, Duration::from_secs(1)).max_attempts, 1);
    }

    #[tokio::test]
    async fn test_burst_stops_on_first_value() {
        let policy = RetryPolicy::new(5, Duration::from_millis(1));
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let outcome: Result<_, String> = policy
            .run_burst(&CancellationToken::new(), |n| {
                counter.fetch_add(1, Ordering::SeqCst);
                async move { Ok(if n == 2 { Some("signal") } else { None }) }
            })
            .await;

        assert_eq!(
            outcome.unwrap(),
            BurstOutcome::Found {
                value: "signal",
                attempt: 2
            }
        );
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_burst_exhausts_deterministically() {
        let policy = RetryPolicy::new(3, Duration::from_millis(1));
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let outcome: Result<BurstOutcome<()>, String> = policy
            .run_burst(&CancellationToken::new(), |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Ok(None) }
            })
            .await;

        assert_eq!(outcome.unwrap(), BurstOutcome::Exhausted);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_failed_attempt_does_not_end_burst() {
        let policy = RetryPolicy::new(3, Duration::from_millis(1));
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let outcome: Result<_, String> = policy
            .run_burst(&CancellationToken::new(), |n| {
                counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 1 {
                        Err("venue down".to_string())
                    } else {
                        Ok(Some(n))
                    }
                }
            })
            .await;

        assert_eq!(outcome.unwrap(), BurstOutcome::Found { value: 2, attempt: 2 });
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_burst_fails_only_when_every_attempt_fails() {
        let policy = RetryPolicy::new(3, Duration::from_millis(1));
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let outcome: Result<BurstOutcome<()>, String> = policy
            .run_burst(&CancellationToken::new(), |n| {
                counter.fetch_add(1, Ordering::SeqCst);
                async move { Err(format!("venue down {}", n)) }
            })
            .await;
        assert_eq!(outcome.unwrap_err(), "venue down 3");
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let mixed: Result<BurstOutcome<()>, String> = policy
            .run_burst(&CancellationToken::new(), |n| async move {
                if n == 2 {
                    Ok(None)
                } else {
                    Err("venue down".to_string())
                }
            })
            .await;
        assert_eq!(mixed.unwrap(), BurstOutcome::Exhausted);
    }

    #[tokio::test]
    async fn test_sleep_or_cancel_wakes_on_cancel() {
        let token = CancellationToken::new();
        let child = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            child.cancel();
        });

        let started = std::time::Instant::now();
        assert!(!sleep_or_cancel(Duration::from_secs(30), &token).await);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(sleep_or_cancel(Duration::from_millis(1), &CancellationToken::new()).await);
    }
}
