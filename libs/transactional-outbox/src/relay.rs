use crate::metrics::OutboxMetrics;
use crate::{OutboxPublisher, OutboxRepository, OutboxResult};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// Published rows are kept this long before the prune step deletes them.
const PRUNE_RETENTION_HOURS: i64 = 24;

/// Prune runs once every this many relay cycles.
const PRUNE_EVERY_CYCLES: u64 = 10;

#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Sleep between polling cycles.
    pub poll_interval: Duration,
    /// Rows loaded per cycle.
    pub max_batch: i64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(1000),
            max_batch: 100,
        }
    }
}

/// Background publisher loop.
///
/// Every cycle it loads unpublished rows oldest-first and attempts each one:
/// broker success marks the row published, broker failure records the attempt
/// and leaves the row eligible for the next cycle. The relay never gives up
/// on a row; sustained broker downtime simply accumulates backpressure in the
/// outbox table. A failed row does not block later rows.
pub struct OutboxRelay<R, P> {
    repository: Arc<R>,
    publisher: Arc<P>,
    config: RelayConfig,
    metrics: Option<OutboxMetrics>,
}

impl<R: OutboxRepository, P: OutboxPublisher> OutboxRelay<R, P> {
    pub fn new(repository: Arc<R>, publisher: Arc<P>, config: RelayConfig) -> Self {
        Self {
            repository,
            publisher,
            config,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: OutboxMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Run until shutdown is signalled. Spawn as a background task.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            max_batch = self.config.max_batch,
            "outbox relay starting"
        );

        let mut cycle: u64 = 0;
        loop {
            if resilience::shutdown_requested(&mut shutdown) {
                info!("outbox relay stopping");
                return;
            }

            match self.process_cycle().await {
                Ok(count) if count > 0 => {
                    info!(published_count = count, "published outbox entries")
                }
                Ok(_) => debug!("no outbox entries to publish"),
                Err(e) => error!(error = %e, "outbox relay cycle failed"),
            }

            cycle += 1;
            if cycle % PRUNE_EVERY_CYCLES == 0 {
                if let Err(e) = self.prune(Utc::now()).await {
                    warn!(error = %e, "outbox prune failed");
                }
            }

            if let Some(metrics) = &self.metrics {
                if let Ok((pending, age)) = self.repository.pending_stats().await {
                    metrics.backlog.set(pending);
                    metrics.oldest_age_seconds.set(age);
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval) => {}
                _ = shutdown.recv() => {
                    info!("outbox relay stopping");
                    return;
                }
            }
        }
    }

    /// One polling cycle. Returns the number of rows marked published.
    async fn process_cycle(&self) -> OutboxResult<u32> {
        let entries = self.repository.fetch_unpublished(self.config.max_batch).await?;
        let mut published: u32 = 0;

        for entry in entries {
            match self.publisher.publish(&entry).await {
                Ok(()) => match self.repository.mark_published(entry.id).await {
                    Ok(()) => {
                        published += 1;
                        if let Some(metrics) = &self.metrics {
                            metrics.published.inc();
                        }
                    }
                    Err(e) => {
                        // The broker already accepted the entry; the row will
                        // be re-published next cycle, producing a duplicate
                        // the worker absorbs.
                        error!(
                            entry_id = %entry.id,
                            event_id = %entry.event_id,
                            error = %e,
                            "failed to mark outbox entry published"
                        );
                    }
                },
                Err(e) => {
                    warn!(
                        entry_id = %entry.id,
                        event_id = %entry.event_id,
                        publish_attempts = entry.publish_attempts,
                        error = %e,
                        "publish attempt failed"
                    );
                    if let Some(metrics) = &self.metrics {
                        metrics.publish_failures.inc();
                    }
                    if let Err(mark_err) =
                        self.repository.record_failure(entry.id, &e.to_string()).await
                    {
                        error!(
                            entry_id = %entry.id,
                            error = %mark_err,
                            "failed to record publish failure"
                        );
                    }
                }
            }
        }

        Ok(published)
    }

    async fn prune(&self, now: DateTime<Utc>) -> OutboxResult<u64> {
        let cutoff = now - ChronoDuration::hours(PRUNE_RETENTION_HOURS);
        let removed = self.repository.prune_published_before(cutoff).await?;
        if removed > 0 {
            info!(removed, "pruned published outbox entries");
        }
        Ok(removed)
    }
}
