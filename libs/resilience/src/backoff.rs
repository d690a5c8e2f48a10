use std::future::Future;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::warn;

/// Backoff parameters. `max_attempts = 0` retries without bound.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_factor: f64,
    pub max_attempts: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
            max_attempts: 0,
        }
    }
}

impl BackoffConfig {
    /// Delay applied after the k-th failed attempt (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.backoff_factor.max(1.0);
        let scale = factor.powi(attempt.saturating_sub(1).min(i32::MAX as u32) as i32);
        let millis =
            (self.initial_delay.as_millis() as f64 * scale).min(self.max_delay.as_millis() as f64);
        Duration::from_millis(millis as u64)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
    /// Shutdown was signalled during a sleep or between attempts.
    #[error("operation cancelled")]
    Cancelled,

    /// The operation failed non-transiently, or the attempt cap was reached.
    /// Carries the last underlying error unmodified.
    #[error("{0}")]
    Operation(E),
}

/// Run `operation` until it succeeds, retrying transient failures with
/// exponential backoff.
///
/// Failures for which `is_transient` returns false surface immediately. When
/// `max_attempts` is non-zero and the k-th attempt fails with `k >=
/// max_attempts`, the underlying error surfaces. `on_retry` observes each
/// scheduled retry before the sleep. Cancellation is checked before every
/// attempt and during every sleep.
pub async fn retry_with_backoff<T, E, F, Fut, P, O>(
    config: &BackoffConfig,
    shutdown: &mut broadcast::Receiver<()>,
    is_transient: P,
    mut on_retry: O,
    mut operation: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    O: FnMut(u32, Duration, &E),
    E: std::fmt::Display,
{
    let mut attempt: u32 = 0;

    loop {
        if crate::shutdown_requested(shutdown) {
            return Err(RetryError::Cancelled);
        }

        attempt += 1;
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                if !is_transient(&e) {
                    return Err(RetryError::Operation(e));
                }
                if config.max_attempts > 0 && attempt >= config.max_attempts {
                    warn!(attempt, error = %e, "retry attempts exhausted");
                    return Err(RetryError::Operation(e));
                }

                let delay = config.delay_for(attempt);
                on_retry(attempt, delay, &e);

                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown.recv() => return Err(RetryError::Cancelled),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_config(max_attempts: u32) -> BackoffConfig {
        BackoffConfig {
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
            backoff_factor: 2.0,
            max_attempts,
        }
    }

    #[tokio::test]
    async fn succeeds_on_first_attempt() {
        let (_tx, mut rx) = broadcast::channel::<()>(1);
        let counter = Arc::new(AtomicU32::new(0));
        let c = counter.clone();

        let result = retry_with_backoff(
            &fast_config(0),
            &mut rx,
            |_: &String| true,
            |_, _, _| {},
            move || {
                c.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, String>(42) }
            },
        )
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_transient_failures_until_success() {
        let (_tx, mut rx) = broadcast::channel::<()>(1);
        let counter = Arc::new(AtomicU32::new(0));
        let c = counter.clone();

        let result = retry_with_backoff(
            &fast_config(0),
            &mut rx,
            |_: &String| true,
            |_, _, _| {},
            move || {
                let n = c.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err("connection refused".to_string())
                    } else {
                        Ok(7)
                    }
                }
            },
        )
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_transient_failures_fail_fast() {
        let (_tx, mut rx) = broadcast::channel::<()>(1);
        let counter = Arc::new(AtomicU32::new(0));
        let c = counter.clone();

        let result: Result<i32, _> = retry_with_backoff(
            &fast_config(0),
            &mut rx,
            |e: &String| e.contains("transient"),
            |_, _, _| {},
            move || {
                c.fetch_add(1, Ordering::SeqCst);
                async { Err("bad request".to_string()) }
            },
        )
        .await;

        assert!(matches!(result, Err(RetryError::Operation(e)) if e == "bad request"));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn attempt_cap_surfaces_last_error() {
        let (_tx, mut rx) = broadcast::channel::<()>(1);
        let counter = Arc::new(AtomicU32::new(0));
        let c = counter.clone();

        let result: Result<i32, _> = retry_with_backoff(
            &fast_config(3),
            &mut rx,
            |_: &String| true,
            |_, _, _| {},
            move || {
                c.fetch_add(1, Ordering::SeqCst);
                async { Err("still down".to_string()) }
            },
        )
        .await;

        assert!(matches!(result, Err(RetryError::Operation(e)) if e == "still down"));
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn observer_sees_capped_geometric_delays() {
        let (_tx, mut rx) = broadcast::channel::<()>(1);
        let mut delays: Vec<Duration> = Vec::new();
        let counter = Arc::new(AtomicU32::new(0));
        let c = counter.clone();

        let _: Result<i32, _> = retry_with_backoff(
            &fast_config(4),
            &mut rx,
            |_: &String| true,
            |_, delay, _| delays.push(delay),
            move || {
                c.fetch_add(1, Ordering::SeqCst);
                async { Err("down".to_string()) }
            },
        )
        .await;

        assert_eq!(
            delays,
            vec![
                Duration::from_millis(1),
                Duration::from_millis(2),
                Duration::from_millis(4),
            ]
        );
    }

    #[tokio::test]
    async fn cancellation_preempts_the_next_attempt() {
        let (tx, mut rx) = broadcast::channel::<()>(1);
        tx.send(()).unwrap();

        let counter = Arc::new(AtomicU32::new(0));
        let c = counter.clone();

        let result: Result<i32, RetryError<String>> = retry_with_backoff(
            &fast_config(0),
            &mut rx,
            |_| true,
            |_, _, _| {},
            move || {
                c.fetch_add(1, Ordering::SeqCst);
                async { Ok(1) }
            },
        )
        .await;

        assert!(matches!(result, Err(RetryError::Cancelled)));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn factor_below_one_is_clamped() {
        let config = BackoffConfig {
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_secs(1),
            backoff_factor: 0.5,
            max_attempts: 0,
        };
        assert_eq!(config.delay_for(1), Duration::from_millis(10));
        assert_eq!(config.delay_for(5), Duration::from_millis(10));
    }
}
