use crate::{ClaimOutcome, EventStore, StoreError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use event_domain::{sanitize_error, EventEnvelope, EventStatus};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::debug;
use uuid::Uuid;

/// PostgreSQL implementation of the event store.
pub struct SqlxEventStore {
    pool: PgPool,
}

impl SqlxEventStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert a freshly admitted envelope. Must run inside the same
    /// transaction as the matching outbox row so commit and enqueue are one
    /// atomic step.
    pub async fn insert(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        event: &EventEnvelope,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO events (
                id,
                tenant_id,
                event_type,
                occurred_at,
                received_at,
                source,
                idempotency_key,
                correlation_id,
                payload,
                status,
                attempts,
                next_attempt_at,
                last_error
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(event.id)
        .bind(&event.tenant_id)
        .bind(&event.event_type)
        .bind(event.occurred_at)
        .bind(event.received_at)
        .bind(&event.source)
        .bind(&event.idempotency_key)
        .bind(event.correlation_id)
        .bind(&event.payload)
        .bind(event.status.as_str())
        .bind(event.attempts)
        .bind(event.next_attempt_at)
        .bind(&event.last_error)
        .execute(&mut **tx)
        .await?;

        debug!(
            event_id = %event.id,
            tenant_id = %event.tenant_id,
            event_type = %event.event_type,
            correlation_id = %event.correlation_id,
            "event inserted"
        );

        Ok(())
    }

    pub async fn find_by_idempotency_key(
        &self,
        tenant_id: &str,
        idempotency_key: &str,
    ) -> Result<Option<EventEnvelope>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, tenant_id, event_type, occurred_at, received_at, source,
                   idempotency_key, correlation_id, payload, status, attempts,
                   next_attempt_at, last_error
            FROM events
            WHERE tenant_id = $1 AND idempotency_key = $2
            "#,
        )
        .bind(tenant_id)
        .bind(idempotency_key)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(envelope_from_row).transpose()
    }

    /// Repair step for half-ingested rows: RECEIVED -> QUEUED inside the
    /// caller's transaction. Returns whether the row was still in RECEIVED.
    pub async fn mark_queued_from_received(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        id: Uuid,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE events
            SET status = 'QUEUED'
            WHERE id = $1 AND status = 'RECEIVED'
            "#,
        )
        .bind(id)
        .execute(&mut **tx)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Scheduler re-enqueue: FAILED_RETRYABLE -> QUEUED inside the caller's
    /// transaction, clearing the retry schedule.
    pub async fn requeue_for_retry(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        id: Uuid,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE events
            SET status = 'QUEUED', next_attempt_at = NULL
            WHERE id = $1 AND status = 'FAILED_RETRYABLE'
            "#,
        )
        .bind(id)
        .execute(&mut **tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::TransitionRejected {
                id,
                to: EventStatus::Queued,
            });
        }
        Ok(())
    }
}

fn envelope_from_row(row: &PgRow) -> Result<EventEnvelope, StoreError> {
    let status_text: String = row.try_get("status")?;
    let status = EventStatus::parse(&status_text)
        .ok_or_else(|| StoreError::Other(format!("unknown status value: {status_text}")))?;

    Ok(EventEnvelope {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        event_type: row.try_get("event_type")?,
        occurred_at: row.try_get("occurred_at")?,
        received_at: row.try_get("received_at")?,
        source: row.try_get("source")?,
        idempotency_key: row.try_get("idempotency_key")?,
        correlation_id: row.try_get("correlation_id")?,
        payload: row.try_get("payload")?,
        status,
        attempts: row.try_get("attempts")?,
        next_attempt_at: row.try_get("next_attempt_at")?,
        last_error: row.try_get("last_error")?,
    })
}

#[async_trait]
impl EventStore for SqlxEventStore {
    async fn find_by_id(&self, id: Uuid) -> Result<Option<EventEnvelope>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, tenant_id, event_type, occurred_at, received_at, source,
                   idempotency_key, correlation_id, payload, status, attempts,
                   next_attempt_at, last_error
            FROM events
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(envelope_from_row).transpose()
    }

    async fn begin_processing(&self, id: Uuid) -> Result<ClaimOutcome, StoreError> {
        let row = sqlx::query(
            r#"
            UPDATE events
            SET status = 'PROCESSING',
                attempts = attempts + 1,
                last_error = NULL,
                next_attempt_at = NULL
            WHERE id = $1 AND status IN ('QUEUED', 'PROCESSING')
            RETURNING id, tenant_id, event_type, occurred_at, received_at, source,
                      idempotency_key, correlation_id, payload, status, attempts,
                      next_attempt_at, last_error
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = row {
            return Ok(ClaimOutcome::Claimed(envelope_from_row(&row)?));
        }

        let status: Option<String> =
            sqlx::query_scalar("SELECT status FROM events WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;

        match status {
            Some(text) => {
                let status = EventStatus::parse(&text)
                    .ok_or_else(|| StoreError::Other(format!("unknown status value: {text}")))?;
                Ok(ClaimOutcome::NotClaimable(status))
            }
            None => Ok(ClaimOutcome::NotFound),
        }
    }

    async fn mark_succeeded(&self, id: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE events
            SET status = 'SUCCEEDED', last_error = NULL, next_attempt_at = NULL
            WHERE id = $1 AND status = 'PROCESSING'
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::TransitionRejected {
                id,
                to: EventStatus::Succeeded,
            });
        }

        debug!(event_id = %id, "event succeeded");
        Ok(())
    }

    async fn mark_failed_retryable(
        &self,
        id: Uuid,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE events
            SET status = 'FAILED_RETRYABLE', last_error = $2, next_attempt_at = $3
            WHERE id = $1 AND status = 'PROCESSING'
            "#,
        )
        .bind(id)
        .bind(sanitize_error(error))
        .bind(next_attempt_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::TransitionRejected {
                id,
                to: EventStatus::FailedRetryable,
            });
        }

        debug!(event_id = %id, next_attempt_at = %next_attempt_at, "event scheduled for retry");
        Ok(())
    }

    async fn mark_failed_terminal(&self, id: Uuid, error: &str) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE events
            SET status = 'FAILED_TERMINAL', last_error = $2, next_attempt_at = NULL
            WHERE id = $1 AND status IN ('PROCESSING', 'FAILED_RETRYABLE')
            "#,
        )
        .bind(id)
        .bind(sanitize_error(error))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::TransitionRejected {
                id,
                to: EventStatus::FailedTerminal,
            });
        }

        debug!(event_id = %id, "event failed terminally");
        Ok(())
    }

    async fn due_for_retry(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<EventEnvelope>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, tenant_id, event_type, occurred_at, received_at, source,
                   idempotency_key, correlation_id, payload, status, attempts,
                   next_attempt_at, last_error
            FROM events
            WHERE status = 'FAILED_RETRYABLE' AND next_attempt_at <= $1
            ORDER BY next_attempt_at ASC
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(envelope_from_row).collect()
    }
}
