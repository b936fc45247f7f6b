//! Fixed-delay, bounded-attempt retry for provider control-plane calls.
//!
//! Only wraps create/resume/hibernate/extend calls against a provider API.
//! Commands executed inside a sandbox are never retried here; they carry
//! their own timeout and exit-code semantics.

use std::future::Future;
use std::time::Duration;

use crate::config::RetryConfig;

/// How many times to try and how long to wait between attempts.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub label: String,
    pub max_attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn new(label: impl Into<String>, max_attempts: u32, delay: Duration) -> Self {
        Self {
            label: label.into(),
            max_attempts,
            delay,
        }
    }

    pub fn from_config(label: impl Into<String>, config: &RetryConfig) -> Self {
        Self::new(label, config.max_attempts, config.delay())
    }
}

/// Call `f` until it succeeds or `policy.max_attempts` attempts have been
/// made, sleeping `policy.delay` between attempts. Returns the last error.
///
/// `max_attempts` of zero is treated as one.
pub async fn retry_async<T, E, F, Fut>(policy: &RetryPolicy, f: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    retry_async_if(policy, f, |_| true).await
}

/// [`retry_async`], but an error for which `retryable` returns false is
/// returned at once without using up the remaining attempts.
pub async fn retry_async_if<T, E, F, Fut, P>(
    policy: &RetryPolicy,
    mut f: F,
    retryable: P,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(e) if !retryable(&e) => {
                tracing::error!(
                    label = %policy.label,
                    attempt,
                    error = %e,
                    "Attempt failed with a non-retryable error"
                );
                return Err(e);
            }
            Err(e) if attempt >= max_attempts => {
                tracing::error!(
                    label = %policy.label,
                    attempt,
                    max_attempts,
                    error = %e,
                    "Giving up after final attempt"
                );
                return Err(e);
            }
            Err(e) => {
                tracing::warn!(
                    label = %policy.label,
                    attempt,
                    max_attempts,
                    error = %e,
                    "Attempt failed, retrying in {}ms",
                    policy.delay.as_millis()
                );
                tokio::time::sleep(policy.delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new("test", max_attempts, Duration::from_millis(1))
    }

    #[tokio::test]
    async fn returns_first_success_without_retrying() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: Result<u32, String> = retry_async(&policy(3), move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(7)
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_until_success() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: Result<&str, String> = retry_async(&policy(3), move || async move {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            if n < 3 {
                Err(format!("flaky {n}"))
            } else {
                Ok("done")
            }
        })
        .await;
        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn rethrows_last_error_after_exhausting_attempts() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: Result<(), String> = retry_async(&policy(2), move || async move {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            Err(format!("failure {n}"))
        })
        .await;
        assert_eq!(result.unwrap_err(), "failure 2");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn non_retryable_error_stops_immediately() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: Result<(), String> = retry_async_if(
            &policy(5),
            move || async move {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                Err(if n == 1 { "transient".to_string() } else { "fatal".to_string() })
            },
            |e: &String| e != "fatal",
        )
        .await;
        assert_eq!(result.unwrap_err(), "fatal");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn zero_attempts_still_calls_once() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let _: Result<(), String> = retry_async(&policy(0), move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err("nope".to_string())
        })
        .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
