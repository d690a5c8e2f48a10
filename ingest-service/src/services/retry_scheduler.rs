//! Re-enqueue loop for retryable failures.
//!
//! Polls for FAILED_RETRYABLE events whose `next_attempt_at` has passed and
//! drives each back to QUEUED with a fresh outbox row, so the relay re-emits
//! it to the broker. Events past the attempt cap are driven to
//! FAILED_TERMINAL instead. Runs in the ingestion process because requeueing
//! is an outbox write.

use crate::config::SchedulerConfig;
use crate::services::outbox_to_store;
use chrono::{DateTime, Utc};
use event_domain::{attempts_exhausted, EventEnvelope};
use event_store::{EventStore, SqlxEventStore, StoreError};
use sqlx::PgPool;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use transactional_outbox::{OutboxEntry, SqlxOutboxRepository};

#[derive(Debug, PartialEq, Eq)]
enum RetryAction {
    Requeue,
    Terminal,
}

fn plan_retry(envelope: &EventEnvelope) -> RetryAction {
    if attempts_exhausted(envelope.attempts) {
        RetryAction::Terminal
    } else {
        RetryAction::Requeue
    }
}

pub struct RetryScheduler {
    pool: PgPool,
    events: Arc<SqlxEventStore>,
    outbox: Arc<SqlxOutboxRepository>,
    stream_name: String,
    config: SchedulerConfig,
}

impl RetryScheduler {
    pub fn new(pool: PgPool, stream_name: String, config: SchedulerConfig) -> Self {
        Self {
            events: Arc::new(SqlxEventStore::new(pool.clone())),
            outbox: Arc::new(SqlxOutboxRepository::new(pool.clone())),
            pool,
            stream_name,
            config,
        }
    }

    /// Run until shutdown is signalled. Spawn as a background task.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            batch_size = self.config.batch_size,
            "retry scheduler starting"
        );

        loop {
            if resilience::shutdown_requested(&mut shutdown) {
                info!("retry scheduler stopping");
                return;
            }

            match self.process_due(Utc::now()).await {
                Ok(moved) if moved > 0 => info!(moved, "retry scheduler cycle complete"),
                Ok(_) => debug!("no events due for retry"),
                Err(e) => error!(error = %e, "retry scheduler cycle failed"),
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval) => {}
                _ = shutdown.recv() => {
                    info!("retry scheduler stopping");
                    return;
                }
            }
        }
    }

    async fn process_due(&self, now: DateTime<Utc>) -> Result<u32, StoreError> {
        let due = self.events.due_for_retry(now, self.config.batch_size).await?;
        let mut moved: u32 = 0;

        for envelope in due {
            match plan_retry(&envelope) {
                RetryAction::Terminal => {
                    match self
                        .events
                        .mark_failed_terminal(envelope.id, "retry attempts exhausted")
                        .await
                    {
                        Ok(()) => {
                            warn!(
                                event_id = %envelope.id,
                                correlation_id = %envelope.correlation_id,
                                attempts = envelope.attempts,
                                "retry cap exceeded; event failed terminally"
                            );
                            moved += 1;
                        }
                        Err(e) => warn!(
                            event_id = %envelope.id,
                            error = %e,
                            "failed to terminalize event"
                        ),
                    }
                }
                RetryAction::Requeue => match self.requeue(&envelope).await {
                    Ok(()) => {
                        info!(
                            event_id = %envelope.id,
                            correlation_id = %envelope.correlation_id,
                            attempts = envelope.attempts,
                            "event re-enqueued for retry"
                        );
                        moved += 1;
                    }
                    Err(StoreError::TransitionRejected { .. }) => {
                        // Another scheduler instance got there first.
                        debug!(event_id = %envelope.id, "event no longer retryable; skipping");
                    }
                    Err(e) => warn!(
                        event_id = %envelope.id,
                        error = %e,
                        "failed to re-enqueue event"
                    ),
                },
            }
        }

        Ok(moved)
    }

    /// Status change and outbox row in one transaction, mirroring admission.
    async fn requeue(&self, envelope: &EventEnvelope) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        self.events.requeue_for_retry(&mut tx, envelope.id).await?;

        let mut snapshot = envelope.clone();
        snapshot
            .enqueue()
            .map_err(|e| StoreError::Other(e.to_string()))?;
        let entry = OutboxEntry::for_event(&snapshot, &self.stream_name, Utc::now());
        self.outbox
            .insert(&mut tx, &entry)
            .await
            .map_err(outbox_to_store)?;

        tx.commit().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use event_domain::{EventEnvelope, NewEvent, MAX_ATTEMPTS};
    use uuid::Uuid;

    fn retryable_event(attempts: i32) -> EventEnvelope {
        let mut envelope = EventEnvelope::admit(
            NewEvent {
                id: Uuid::new_v4(),
                tenant_id: "t1".into(),
                event_type: "user.created".into(),
                occurred_at: Utc::now(),
                source: "crm".into(),
                idempotency_key: None,
                correlation_id: Uuid::new_v4(),
                payload: serde_json::json!({}),
            },
            Utc::now(),
        )
        .unwrap();
        envelope.enqueue().unwrap();
        envelope.begin_processing().unwrap();
        envelope.attempts = attempts;
        envelope
            .fail_retryable("boom", Utc::now() + chrono::Duration::seconds(5), Utc::now())
            .unwrap();
        envelope
    }

    #[test]
    fn below_the_cap_events_are_requeued() {
        assert_eq!(
            plan_retry(&retryable_event(MAX_ATTEMPTS - 1)),
            RetryAction::Requeue
        );
        assert_eq!(plan_retry(&retryable_event(1)), RetryAction::Requeue);
    }

    #[test]
    fn at_or_past_the_cap_events_are_terminalized() {
        assert_eq!(
            plan_retry(&retryable_event(MAX_ATTEMPTS)),
            RetryAction::Terminal
        );
        assert_eq!(
            plan_retry(&retryable_event(MAX_ATTEMPTS + 3)),
            RetryAction::Terminal
        );
    }
}
