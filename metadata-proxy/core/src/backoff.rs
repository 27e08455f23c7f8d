//! Bounded exponential backoff with jitter.
//!
//! Operations are retried until they succeed, fail with a non-transient error,
//! or until the next delay would exceed the elapsed-time budget.

use rand::Rng;
use std::{fmt, future::Future, time::Duration};
use tokio::time;

/// Classifies errors that may succeed when retried.
pub trait Transient {
    fn is_transient(&self) -> bool;
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Backoff {
    pub initial_interval: Duration,
    pub max_interval: Duration,
    pub max_elapsed_time: Duration,
    pub multiplier: f64,
    pub randomization_factor: f64,
}

// === impl Backoff ===

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(500),
            max_interval: Duration::from_secs(1),
            max_elapsed_time: Duration::from_secs(1),
            multiplier: 1.5,
            randomization_factor: 0.5,
        }
    }
}

impl Backoff {
    pub fn new(initial_interval: Duration, max_interval: Duration, max_elapsed_time: Duration) -> Self {
        Self {
            initial_interval,
            max_interval,
            max_elapsed_time,
            ..Self::default()
        }
    }

    /// Runs `op` until it succeeds, fails permanently, or the elapsed-time
    /// budget is spent. The last error is returned on failure.
    pub async fn retry<F, Fut, T, E>(&self, operation: &str, mut op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Transient + fmt::Display,
    {
        let start = time::Instant::now();
        let mut interval = self.initial_interval;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let error = match op().await {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };

            if !error.is_transient() {
                tracing::debug!(%operation, attempt, %error, "Permanent failure");
                return Err(error);
            }

            let delay = self.jitter(interval);
            if start.elapsed() + delay > self.max_elapsed_time {
                tracing::warn!(%operation, attempt, %error, "Retry budget exhausted");
                return Err(error);
            }

            tracing::debug!(
                %operation,
                attempt,
                %error,
                delay_ms = delay.as_millis() as u64,
                "Retrying"
            );
            time::sleep(delay).await;

            interval = interval.mul_f64(self.multiplier).min(self.max_interval);
        }
    }

    fn jitter(&self, interval: Duration) -> Duration {
        if self.randomization_factor <= 0.0 {
            return interval;
        }
        let delta = interval.as_secs_f64() * self.randomization_factor;
        let secs = interval.as_secs_f64();
        let jittered = rand::thread_rng().gen_range((secs - delta).max(0.0)..=secs + delta);
        Duration::from_secs_f64(jittered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    };

    #[derive(Debug, PartialEq)]
    enum TestError {
        Flaky,
        Broken,
    }

    impl Transient for TestError {
        fn is_transient(&self) -> bool {
            matches!(self, Self::Flaky)
        }
    }

    impl fmt::Display for TestError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            fmt::Debug::fmt(self, f)
        }
    }

    fn counting() -> (Arc<AtomicU32>, Arc<AtomicU32>) {
        let calls = Arc::new(AtomicU32::new(0));
        (calls.clone(), calls)
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_errors_until_success() {
        let backoff = Backoff::new(
            Duration::from_millis(10),
            Duration::from_millis(50),
            Duration::from_secs(5),
        );
        let (calls, c) = counting();
        let res = backoff
            .retry("test", || {
                let n = c.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 3 {
                        Err(TestError::Flaky)
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;
        assert_eq!(res, Ok(3));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_errors_short_circuit() {
        let backoff = Backoff::default();
        let (calls, c) = counting();
        let res: Result<(), _> = backoff
            .retry("test", || {
                c.fetch_add(1, Ordering::SeqCst);
                async { Err(TestError::Broken) }
            })
            .await;
        assert_eq!(res, Err(TestError::Broken));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_when_budget_is_spent() {
        let backoff = Backoff {
            initial_interval: Duration::from_millis(100),
            max_interval: Duration::from_millis(100),
            max_elapsed_time: Duration::from_millis(350),
            multiplier: 1.0,
            randomization_factor: 0.0,
        };
        let (calls, c) = counting();
        let start = time::Instant::now();
        let res: Result<(), _> = backoff
            .retry("test", || {
                c.fetch_add(1, Ordering::SeqCst);
                async { Err(TestError::Flaky) }
            })
            .await;
        assert_eq!(res, Err(TestError::Flaky));
        // Attempts at 0, 100, 200 and 300ms; a fifth would land past the budget.
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert!(start.elapsed() <= Duration::from_millis(350));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let backoff = Backoff::default();
        for _ in 0..100 {
            let d = backoff.jitter(Duration::from_millis(500));
            assert!(d >= Duration::from_millis(250), "{d:?}");
            assert!(d <= Duration::from_millis(750), "{d:?}");
        }
    }
}
