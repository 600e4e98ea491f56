use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use log::warn;

/// Fixed-delay retry policy shared by every component that talks to an
/// external collaborator. One place to hold the attempt count and delay
/// instead of a wrapper closure per call site.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn new(attempts: u32, delay: Duration) -> Self {
        Self { attempts, delay }
    }

    /// Run `op` until it succeeds or `attempts` is exhausted. Every error
    /// is considered retryable.
    pub async fn run<T, E, F, Fut>(&self, label: &str, op: F) -> Result<T, E>
    where
        E: Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.run_if(label, |_| true, op).await
    }

    /// Run `op` until it succeeds, retrying only errors for which
    /// `retryable` returns true. The last error is returned as-is.
    pub async fn run_if<T, E, F, Fut, P>(
        &self,
        label: &str,
        retryable: P,
        mut op: F,
    ) -> Result<T, E>
    where
        E: Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    if attempt >= self.attempts || !retryable(&e) {
                        return Err(e);
                    }
                    warn!("{label} failed (attempt {attempt}/{}): {e}", self.attempts);
                    attempt += 1;
                    tokio::time::sleep(self.delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let policy = RetryPolicy::new(3, Duration::from_millis(0));
        let calls = AtomicU32::new(0);

        let result: Result<u32, String> = policy
            .run("test-op", || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err("boom".to_string())
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
    async fn gives_up_after_configured_attempts() {
        let policy = RetryPolicy::new(3, Duration::from_millis(0));
        let calls = AtomicU32::new(0);

        let result: Result<(), String> = policy
            .run("test-op", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("boom".to_string()) }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn does_not_retry_when_predicate_rejects() {
        let policy = RetryPolicy::new(3, Duration::from_millis(0));
        let calls = AtomicU32::new(0);

        let result: Result<(), String> = policy
            .run_if(
                "test-op",
                |e: &String| e.contains("transient"),
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err("permanent".to_string()) }
                },
            )
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
