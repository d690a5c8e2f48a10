//! Events-table access.
//!
//! The worker and the retry scheduler drive lifecycle transitions through the
//! [`EventStore`] trait; tests substitute an in-memory fake. The sqlx
//! implementation re-enforces the domain transition table with guarded
//! single-statement UPDATEs so a forbidden transition is never persisted,
//! whatever the caller believed the current status was.

mod error;
mod postgres;

pub use error::StoreError;
pub use postgres::SqlxEventStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use event_domain::{EventEnvelope, EventStatus};
use uuid::Uuid;

/// Result of a worker's attempt to take an event for processing.
#[derive(Debug)]
pub enum ClaimOutcome {
    /// The event moved to PROCESSING; `attempts` has been incremented.
    Claimed(EventEnvelope),
    /// The event exists but is not in a claimable state. Carries the status
    /// found so the caller can decide whether the delivery is a settled
    /// duplicate (ack) or a half-ingested row (leave pending).
    NotClaimable(EventStatus),
    /// No event row with this id exists.
    NotFound,
}

#[async_trait]
pub trait EventStore: Send + Sync {
    async fn find_by_id(&self, id: Uuid) -> Result<Option<EventEnvelope>, StoreError>;

    /// QUEUED -> PROCESSING, or PROCESSING re-entry for reclaimed work.
    async fn begin_processing(&self, id: Uuid) -> Result<ClaimOutcome, StoreError>;

    /// PROCESSING -> SUCCEEDED.
    async fn mark_succeeded(&self, id: Uuid) -> Result<(), StoreError>;

    /// PROCESSING -> FAILED_RETRYABLE with a sanitized diagnostic and the
    /// next attempt time.
    async fn mark_failed_retryable(
        &self,
        id: Uuid,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// PROCESSING or FAILED_RETRYABLE -> FAILED_TERMINAL.
    async fn mark_failed_terminal(&self, id: Uuid, error: &str) -> Result<(), StoreError>;

    /// FAILED_RETRYABLE events whose `next_attempt_at` has passed, ordered by
    /// schedule time.
    async fn due_for_retry(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<EventEnvelope>, StoreError>;
}
