use std::future::Future;
use std::time::Duration;

use rand::Rng;

use crate::error::Result;

/// Bounded exponential backoff shared by the request and read retry paths
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
    pub jitter: bool,
}

impl RetryPolicy {
    /// Policy for re-issuing the whole request on transient setup failures
    pub fn requests() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            multiplier: 2.0,
            jitter: true,
        }
    }

    /// Policy for retrying a single body read without re-issuing the request
    pub fn reads() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(250),
            multiplier: 2.0,
            jitter: true,
        }
    }

    /// Backoff delay before retry number `attempt` (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1) as i32;
        let base = self.base_delay.as_secs_f64() * self.multiplier.powi(exp);
        let delay = if self.jitter {
            base * (1.0 + rand::thread_rng().gen_range(0.0..0.2))
        } else {
            base
        };
        Duration::from_secs_f64(delay)
    }

    /// Run `op` until it succeeds, returns a non-retryable error, or the
    /// attempt budget is spent
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt < self.max_attempts => {
                    let delay = self.delay_for(attempt);
                    tracing::warn!(
                        "{} failed (attempt {}/{}): {} - retrying in {:?}",
                        what,
                        attempt,
                        self.max_attempts,
                        err,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            multiplier: 2.0,
            jitter: false,
        }
    }

    #[test]
    fn test_delay_grows_exponentially() {
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            multiplier: 2.0,
            jitter: false,
        };

        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for(3), Duration::from_secs(4));
    }

    #[test]
    fn test_jitter_stays_bounded() {
        let policy = RetryPolicy {
            jitter: true,
            ..fast_policy()
        };

        for attempt in 1..=3 {
            let base = Duration::from_millis(1 << (attempt - 1));
            let delay = policy.delay_for(attempt as u32);
            assert!(delay >= base);
            assert!(delay <= base.mul_f64(1.2));
        }
    }

    #[tokio::test]
    async fn test_retryable_error_is_reattempted() {
        let calls = AtomicU32::new(0);
        let result = fast_policy()
            .run("test op", || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(Error::Network("flaky".to_string()))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_error_stops_immediately() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = fast_policy()
            .run("test op", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(Error::Api {
                        status: 401,
                        message: "invalid key".to_string(),
                    })
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_budget_is_bounded() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = fast_policy()
            .run("test op", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(Error::Network("down".to_string())) }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
