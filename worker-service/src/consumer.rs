//! Stream consumer driving the event lifecycle.
//!
//! `run` proceeds through phases: bootstrap (create the consumer group,
//! retried with backoff over transient broker errors), startup drain (process
//! entries a previous incarnation of this consumer left pending), startup
//! reclaim (sweep in entries orphaned by dead peers), then the steady loop
//! (periodic reclaim + new reads).
//!
//! The one invariant everything here serves: a broker entry is acknowledged
//! only after a durable status write reflecting the outcome has committed.
//! Any crash before that leaves the entry pending, where drain or reclaim
//! will find it again.

use crate::error::WorkerError;
use crate::handlers::HandlerRegistry;
use chrono::Utc;
use event_domain::{attempts_exhausted, backoff_delay, sanitize_error, EventEnvelope};
use event_store::{ClaimOutcome, EventStore, StoreError};
use resilience::{retry_with_backoff, shutdown_requested, BackoffConfig, RetryError};
use std::sync::Arc;
use std::time::{Duration, Instant};
use stream_broker::{BrokerError, StreamBroker, StreamEntry};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub stream_name: String,
    pub group_name: String,
    pub consumer_name: String,
    pub read_batch_size: usize,
    pub empty_read_delay: Duration,
    pub error_delay: Duration,
    pub claim_min_idle_ms: u64,
    pub claim_batch_size: usize,
    pub reclaim_interval: Duration,
    pub drain_max_batches: u32,
    pub drain_max_messages: u32,
    pub bootstrap: BackoffConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            stream_name: "events:stream".to_string(),
            group_name: "event-workers".to_string(),
            consumer_name: format!("worker-{}", Uuid::new_v4()),
            read_batch_size: 10,
            empty_read_delay: Duration::from_millis(250),
            error_delay: Duration::from_millis(1000),
            claim_min_idle_ms: 30_000,
            claim_batch_size: 10,
            reclaim_interval: Duration::from_millis(30_000),
            drain_max_batches: 10,
            drain_max_messages: 500,
            bootstrap: BackoffConfig::default(),
        }
    }
}

pub struct Worker<S, B> {
    store: Arc<S>,
    broker: Arc<B>,
    registry: Arc<HandlerRegistry>,
    config: WorkerConfig,
}

impl<S: EventStore, B: StreamBroker> Worker<S, B> {
    pub fn new(
        store: Arc<S>,
        broker: Arc<B>,
        registry: Arc<HandlerRegistry>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            store,
            broker,
            registry,
            config,
        }
    }

    /// Run until shutdown is signalled. Spawn as a background task.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        // The whole startup block retries until it completes once.
        loop {
            if shutdown_requested(&mut shutdown) {
                return;
            }
            match self.startup(&mut shutdown).await {
                Ok(()) => break,
                Err(WorkerError::Cancelled) => return,
                Err(e) => {
                    error!(error = %e, "worker startup failed; retrying");
                    if !self.sleep_cancellable(self.config.error_delay, &mut shutdown).await {
                        return;
                    }
                }
            }
        }

        info!(
            stream = %self.config.stream_name,
            group = %self.config.group_name,
            consumer = %self.config.consumer_name,
            "worker entering steady state"
        );

        let mut last_reclaim = Instant::now();
        loop {
            if shutdown_requested(&mut shutdown) {
                info!("worker stopping");
                return;
            }
            match self.steady_iteration(&mut last_reclaim, &mut shutdown).await {
                Ok(()) => {}
                Err(WorkerError::Cancelled) => return,
                Err(e) => {
                    error!(error = %e, "worker loop error");
                    if !self.sleep_cancellable(self.config.error_delay, &mut shutdown).await {
                        return;
                    }
                }
            }
        }
    }

    async fn startup(&self, shutdown: &mut broadcast::Receiver<()>) -> Result<(), WorkerError> {
        self.bootstrap(shutdown).await?;
        self.drain_own_pending(shutdown).await?;
        let reclaimed = self
            .reclaim_pass(self.config.drain_max_batches, "reclaim-startup", shutdown)
            .await?;
        if reclaimed > 0 {
            info!(reclaimed, "startup reclaim complete");
        }
        Ok(())
    }

    /// Create the consumer group at the stream tail. "Already exists" is
    /// success; transient connectivity errors are retried with backoff.
    async fn bootstrap(&self, shutdown: &mut broadcast::Receiver<()>) -> Result<(), WorkerError> {
        let result = retry_with_backoff(
            &self.config.bootstrap,
            shutdown,
            |e: &BrokerError| e.is_transient(),
            |attempt, delay, e| {
                warn!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "consumer group bootstrap retry"
                )
            },
            || {
                self.broker
                    .ensure_group(&self.config.stream_name, &self.config.group_name)
            },
        )
        .await;

        match result {
            Ok(()) => {
                info!(
                    stream = %self.config.stream_name,
                    group = %self.config.group_name,
                    "consumer group ready"
                );
                Ok(())
            }
            Err(RetryError::Cancelled) => Err(WorkerError::Cancelled),
            Err(RetryError::Operation(e)) => Err(e.into()),
        }
    }

    /// Process entries already pending for this consumer id (read id "0"),
    /// bounded by the startup drain caps. A previous incarnation of this
    /// consumer may have crashed holding them.
    async fn drain_own_pending(
        &self,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<(), WorkerError> {
        let mut batches: u32 = 0;
        let mut drained: u32 = 0;

        while batches < self.config.drain_max_batches && drained < self.config.drain_max_messages {
            if shutdown_requested(shutdown) {
                return Err(WorkerError::Cancelled);
            }

            let entries = self
                .broker
                .read_group(
                    &self.config.stream_name,
                    &self.config.group_name,
                    &self.config.consumer_name,
                    "0",
                    self.config.read_batch_size,
                )
                .await?;
            if entries.is_empty() {
                break;
            }

            batches += 1;
            for entry in &entries {
                if shutdown_requested(shutdown) {
                    return Err(WorkerError::Cancelled);
                }
                self.process_entry(entry, "startup-drain").await?;
                drained += 1;
                if drained >= self.config.drain_max_messages {
                    break;
                }
            }
        }

        if drained > 0 {
            info!(drained, "startup drain complete");
        }
        Ok(())
    }

    /// One reclaim sweep: walk the auto-claim cursor up to `max_batches`
    /// pages, falling back to an explicit pending-list scan + claim when the
    /// broker does not know auto-claim.
    async fn reclaim_pass(
        &self,
        max_batches: u32,
        phase: &str,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<u32, WorkerError> {
        let mut cursor = "0-0".to_string();
        let mut reclaimed: u32 = 0;

        for _ in 0..max_batches {
            if shutdown_requested(shutdown) {
                return Err(WorkerError::Cancelled);
            }

            let page = self
                .broker
                .auto_claim(
                    &self.config.stream_name,
                    &self.config.group_name,
                    &self.config.consumer_name,
                    self.config.claim_min_idle_ms,
                    &cursor,
                    self.config.claim_batch_size,
                )
                .await;

            match page {
                Ok(page) => {
                    for entry in &page.entries {
                        self.process_entry(entry, phase).await?;
                        reclaimed += 1;
                    }
                    // Stop when the cursor does not advance.
                    if page.entries.is_empty()
                        || page.next_cursor == cursor
                        || page.next_cursor == "0-0"
                        || page.next_cursor.is_empty()
                    {
                        break;
                    }
                    cursor = page.next_cursor;
                }
                Err(BrokerError::Unsupported(_)) => {
                    debug!("auto-claim unsupported; using pending-list fallback");
                    let ids = self
                        .broker
                        .pending_ids(
                            &self.config.stream_name,
                            &self.config.group_name,
                            self.config.claim_min_idle_ms,
                            self.config.claim_batch_size,
                        )
                        .await?;
                    if ids.is_empty() {
                        break;
                    }
                    let entries = self
                        .broker
                        .claim(
                            &self.config.stream_name,
                            &self.config.group_name,
                            &self.config.consumer_name,
                            self.config.claim_min_idle_ms,
                            &ids,
                        )
                        .await?;
                    for entry in &entries {
                        self.process_entry(entry, phase).await?;
                        reclaimed += 1;
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }

        Ok(reclaimed)
    }

    async fn steady_iteration(
        &self,
        last_reclaim: &mut Instant,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<(), WorkerError> {
        if last_reclaim.elapsed() >= self.config.reclaim_interval {
            *last_reclaim = Instant::now();
            let reclaimed = self.reclaim_pass(1, "reclaim-steady", shutdown).await?;
            if reclaimed > 0 {
                info!(reclaimed, "reclaimed orphaned entries");
            }
        }

        let entries = self
            .broker
            .read_group(
                &self.config.stream_name,
                &self.config.group_name,
                &self.config.consumer_name,
                ">",
                self.config.read_batch_size,
            )
            .await?;

        if entries.is_empty() {
            if !self.sleep_cancellable(self.config.empty_read_delay, shutdown).await {
                return Err(WorkerError::Cancelled);
            }
            return Ok(());
        }

        for entry in &entries {
            if shutdown_requested(shutdown) {
                return Err(WorkerError::Cancelled);
            }
            self.process_entry(entry, "steady").await?;
        }

        Ok(())
    }

    /// Drive one broker entry through the lifecycle.
    ///
    /// Storage problems are absorbed here (log, leave the entry pending for a
    /// later drain/reclaim); only ack-time broker failures propagate. The
    /// entry is acknowledged in exactly three cases, each after a committed
    /// status write: success, a recorded failure outcome, or a duplicate
    /// delivery for an already settled event.
    async fn process_entry(&self, entry: &StreamEntry, phase: &str) -> Result<(), WorkerError> {
        let Some(event_id) = resolve_event_id(entry) else {
            warn!(entry_id = %entry.id, phase, "entry has no resolvable event id; leaving pending");
            return Ok(());
        };

        let claim = match self.store.begin_processing(event_id).await {
            Ok(claim) => claim,
            Err(e) => {
                warn!(
                    entry_id = %entry.id,
                    event_id = %event_id,
                    error = %e,
                    "could not move event to PROCESSING; leaving pending"
                );
                return Ok(());
            }
        };

        let envelope = match claim {
            ClaimOutcome::Claimed(envelope) => envelope,
            ClaimOutcome::NotClaimable(status) if status.is_settled() => {
                debug!(
                    entry_id = %entry.id,
                    event_id = %event_id,
                    status = %status,
                    "duplicate delivery for settled event; acknowledging"
                );
                self.ack(entry).await?;
                return Ok(());
            }
            ClaimOutcome::NotClaimable(status) => {
                warn!(
                    entry_id = %entry.id,
                    event_id = %event_id,
                    status = %status,
                    "event not claimable; leaving pending"
                );
                return Ok(());
            }
            ClaimOutcome::NotFound => {
                warn!(
                    entry_id = %entry.id,
                    event_id = %event_id,
                    "no event row for broker entry; leaving pending"
                );
                return Ok(());
            }
        };

        let message = entry
            .fields
            .get("message")
            .cloned()
            .unwrap_or_else(|| envelope.snapshot().to_string());

        match self.dispatch(&envelope, &message, phase).await {
            Ok(()) => match self.store.mark_succeeded(envelope.id).await {
                Ok(()) => {
                    info!(
                        event_id = %envelope.id,
                        correlation_id = %envelope.correlation_id,
                        attempts = envelope.attempts,
                        phase,
                        "event succeeded"
                    );
                    self.ack(entry).await?;
                }
                Err(e) => self.log_outcome_write_failure(entry, &envelope, &e),
            },
            Err(handler_error) => {
                let diagnostic = sanitize_error(&format!("{handler_error:#}"));
                warn!(
                    event_id = %envelope.id,
                    correlation_id = %envelope.correlation_id,
                    attempts = envelope.attempts,
                    phase,
                    error = %diagnostic,
                    "handler failed"
                );

                if attempts_exhausted(envelope.attempts) {
                    match self.store.mark_failed_terminal(envelope.id, &diagnostic).await {
                        Ok(()) => {
                            warn!(
                                event_id = %envelope.id,
                                attempts = envelope.attempts,
                                "attempt cap reached; event failed terminally"
                            );
                            self.ack(entry).await?;
                        }
                        Err(e) => self.log_outcome_write_failure(entry, &envelope, &e),
                    }
                } else {
                    let next_attempt_at = Utc::now()
                        + chrono::Duration::from_std(backoff_delay(envelope.attempts))
                            .unwrap_or_else(|_| chrono::Duration::seconds(60));
                    match self
                        .store
                        .mark_failed_retryable(envelope.id, &diagnostic, next_attempt_at)
                        .await
                    {
                        // The retry scheduler owns the event from here; this
                        // worker is done with this broker entry.
                        Ok(()) => self.ack(entry).await?,
                        Err(e) => self.log_outcome_write_failure(entry, &envelope, &e),
                    }
                }
            }
        }

        Ok(())
    }

    fn log_outcome_write_failure(
        &self,
        entry: &StreamEntry,
        envelope: &EventEnvelope,
        error: &StoreError,
    ) {
        warn!(
            entry_id = %entry.id,
            event_id = %envelope.id,
            correlation_id = %envelope.correlation_id,
            error = %error,
            "failed to persist event outcome; leaving entry pending"
        );
    }

    async fn dispatch(
        &self,
        envelope: &EventEnvelope,
        message: &str,
        phase: &str,
    ) -> anyhow::Result<()> {
        let handler = self.registry.get(&envelope.event_type).ok_or_else(|| {
            anyhow::anyhow!("no handler registered for event type '{}'", envelope.event_type)
        })?;
        handler.handle(envelope.id, message, phase).await
    }

    async fn ack(&self, entry: &StreamEntry) -> Result<(), WorkerError> {
        self.broker
            .ack(&self.config.stream_name, &self.config.group_name, &entry.id)
            .await?;
        debug!(entry_id = %entry.id, "entry acknowledged");
        Ok(())
    }

    async fn sleep_cancellable(
        &self,
        duration: Duration,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => true,
            _ = shutdown.recv() => false,
        }
    }
}

/// `event_id` from the top-level field, else from the embedded `message`
/// snapshot.
fn resolve_event_id(entry: &StreamEntry) -> Option<Uuid> {
    if let Some(raw) = entry.fields.get("event_id") {
        if let Ok(id) = Uuid::parse_str(raw) {
            if !id.is_nil() {
                return Some(id);
            }
        }
    }

    let message = entry.fields.get("message")?;
    let value: serde_json::Value = serde_json::from_str(message).ok()?;
    let raw = value.get("event_id")?.as_str()?;
    Uuid::parse_str(raw).ok().filter(|id| !id.is_nil())
}
