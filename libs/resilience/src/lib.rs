//! Retry with exponential backoff for transient infrastructure failures.
//!
//! Used by the worker's consumer-group bootstrap and available to any other
//! loop that talks to the broker or the database. Delays are deterministic:
//! `min(max_delay, initial_delay * backoff_factor^(k-1))` after the k-th
//! failed attempt.

mod backoff;

pub use backoff::{retry_with_backoff, BackoffConfig, RetryError};

use tokio::sync::broadcast;

/// Non-blocking check of the process-wide shutdown channel. A closed channel
/// counts as shutdown: the sender only drops when the host is tearing down.
pub fn shutdown_requested(rx: &mut broadcast::Receiver<()>) -> bool {
    use broadcast::error::TryRecvError;
    match rx.try_recv() {
        Ok(()) => true,
        Err(TryRecvError::Empty) => false,
        Err(TryRecvError::Closed) => true,
        Err(TryRecvError::Lagged(_)) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn shutdown_is_idle_until_signalled() {
        let (tx, mut rx) = broadcast::channel::<()>(1);
        assert!(!shutdown_requested(&mut rx));
        tx.send(()).unwrap();
        assert!(shutdown_requested(&mut rx));
    }

    #[tokio::test]
    async fn dropped_sender_counts_as_shutdown() {
        let (tx, mut rx) = broadcast::channel::<()>(1);
        drop(tx);
        assert!(shutdown_requested(&mut rx));
    }
}
