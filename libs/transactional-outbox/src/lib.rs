//! # Transactional Outbox
//!
//! Reliable event publishing for the ingestion pipeline. The HTTP admission
//! path writes an event row and an outbox row in one database transaction;
//! the background [`OutboxRelay`] moves committed outbox rows onto the stream
//! broker and marks each row published only after the broker accepts it.
//!
//! This closes both halves of the dual-write gap:
//! - an event can never be committed without a pending publish, and
//! - a publish can never be observed for an event that did not commit.
//!
//! The result is **at-least-once delivery**: a relay crash between broker
//! acceptance and `mark_published` re-emits that row on restart, which
//! worker-side idempotency absorbs.
//!
//! ## Writing an event + outbox row atomically
//!
//! ```rust,no_run
//! use transactional_outbox::{OutboxEntry, SqlxOutboxRepository};
//! use event_domain::EventEnvelope;
//! use chrono::Utc;
//! use sqlx::PgPool;
//!
//! async fn admit(
//!     pool: &PgPool,
//!     outbox: &SqlxOutboxRepository,
//!     envelope: &EventEnvelope,
//! ) -> Result<(), Box<dyn std::error::Error>> {
//!     let mut tx = pool.begin().await?;
//!     // ... insert the event row through the event store ...
//!     let entry = OutboxEntry::for_event(envelope, "events:stream", Utc::now());
//!     outbox.insert(&mut tx, &entry).await?;
//!     tx.commit().await?;
//!     Ok(())
//! }
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use event_domain::EventEnvelope;
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Postgres, Row, Transaction};
use std::sync::Arc;
use stream_broker::StreamBroker;
use tracing::{debug, info, warn};
use uuid::Uuid;

mod error;
pub mod metrics;
mod relay;

pub use error::{OutboxError, OutboxResult};
pub use relay::{OutboxRelay, RelayConfig};

/// One pending publish. Created in the same transaction as its event; mutated
/// only by the relay; deleted by the relay's prune step once published and
/// older than the retention window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxEntry {
    /// Row identifier, distinct from the event id
    pub id: Uuid,

    /// The event this row publishes
    pub event_id: Uuid,

    /// Target broker stream
    pub stream_name: String,

    /// Full envelope snapshot to publish (JSON, `event_id`-keyed)
    pub payload: serde_json::Value,

    pub created_at: DateTime<Utc>,

    /// Set once, after the broker accepts the entry. Null means still
    /// eligible for publish.
    pub published_at: Option<DateTime<Utc>>,

    /// Failed publish attempts so far
    pub publish_attempts: i32,

    /// Most recent publish failure
    pub last_error: Option<String>,
}

impl OutboxEntry {
    /// Build the row for a freshly admitted envelope.
    pub fn for_event(event: &EventEnvelope, stream_name: &str, now: DateTime<Utc>) -> Self {
        OutboxEntry {
            id: Uuid::new_v4(),
            event_id: event.id,
            stream_name: stream_name.to_string(),
            payload: event.snapshot(),
            created_at: now,
            published_at: None,
            publish_attempts: 0,
            last_error: None,
        }
    }

    /// The broker field map for this row: `event_id`, `tenant_id`,
    /// `event_type`, `correlation_id`, and `message` (the snapshot as a JSON
    /// string). Advisory fields missing from the snapshot are omitted.
    pub fn broker_fields(&self) -> OutboxResult<Vec<(String, String)>> {
        let message = serde_json::to_string(&self.payload)?;

        let mut fields = vec![("event_id".to_string(), self.event_id.to_string())];
        for key in ["tenant_id", "event_type", "correlation_id"] {
            if let Some(value) = self.payload.get(key).and_then(|v| v.as_str()) {
                fields.push((key.to_string(), value.to_string()));
            }
        }
        fields.push(("message".to_string(), message));

        Ok(fields)
    }
}

/// Repository for outbox rows. The relay (and tests) see only this trait;
/// the transaction-scoped insert lives on [`SqlxOutboxRepository`] because it
/// must share the admission transaction.
#[async_trait]
pub trait OutboxRepository: Send + Sync {
    /// Unpublished rows, oldest first.
    async fn fetch_unpublished(&self, limit: i64) -> OutboxResult<Vec<OutboxEntry>>;

    /// Record broker acceptance. Called only after the broker returned
    /// success for this row.
    async fn mark_published(&self, id: Uuid) -> OutboxResult<()>;

    /// Record a failed publish attempt; the row stays eligible.
    async fn record_failure(&self, id: Uuid, error: &str) -> OutboxResult<()>;

    /// Delete published rows older than `cutoff`. Returns rows removed.
    async fn prune_published_before(&self, cutoff: DateTime<Utc>) -> OutboxResult<u64>;

    /// Pending count and oldest pending age in seconds (0 when none pending).
    async fn pending_stats(&self) -> OutboxResult<(i64, i64)>;
}

/// PostgreSQL implementation of [`OutboxRepository`].
pub struct SqlxOutboxRepository {
    pool: PgPool,
}

impl SqlxOutboxRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert a new entry within the caller's transaction. This MUST share
    /// the transaction that writes the event row.
    pub async fn insert(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        entry: &OutboxEntry,
    ) -> OutboxResult<()> {
        sqlx::query(
            r#"
            INSERT INTO outbox_entries (
                id,
                event_id,
                stream_name,
                payload,
                created_at,
                published_at,
                publish_attempts,
                last_error
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(entry.id)
        .bind(entry.event_id)
        .bind(&entry.stream_name)
        .bind(&entry.payload)
        .bind(entry.created_at)
        .bind(entry.published_at)
        .bind(entry.publish_attempts)
        .bind(&entry.last_error)
        .execute(&mut **tx)
        .await?;

        debug!(
            entry_id = %entry.id,
            event_id = %entry.event_id,
            stream = %entry.stream_name,
            "outbox entry inserted"
        );

        Ok(())
    }
}

#[async_trait]
impl OutboxRepository for SqlxOutboxRepository {
    async fn fetch_unpublished(&self, limit: i64) -> OutboxResult<Vec<OutboxEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT id, event_id, stream_name, payload, created_at,
                   published_at, publish_attempts, last_error
            FROM outbox_entries
            WHERE published_at IS NULL
            ORDER BY created_at ASC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let entries = rows
            .into_iter()
            .map(|row| {
                Ok(OutboxEntry {
                    id: row.try_get("id")?,
                    event_id: row.try_get("event_id")?,
                    stream_name: row.try_get("stream_name")?,
                    payload: row.try_get("payload")?,
                    created_at: row.try_get("created_at")?,
                    published_at: row.try_get("published_at")?,
                    publish_attempts: row.try_get("publish_attempts")?,
                    last_error: row.try_get("last_error")?,
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()?;

        debug!(count = entries.len(), "fetched unpublished outbox entries");

        Ok(entries)
    }

    async fn mark_published(&self, id: Uuid) -> OutboxResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_entries
            SET published_at = NOW(), last_error = NULL
            WHERE id = $1 AND published_at IS NULL
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            warn!(entry_id = %id, "outbox entry missing or already published");
            return Err(OutboxError::EntryNotFound(id));
        }

        debug!(entry_id = %id, "outbox entry marked published");
        Ok(())
    }

    async fn record_failure(&self, id: Uuid, error: &str) -> OutboxResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_entries
            SET publish_attempts = publish_attempts + 1, last_error = $2
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(error)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            warn!(entry_id = %id, "outbox entry not found when recording failure");
            return Err(OutboxError::EntryNotFound(id));
        }

        Ok(())
    }

    async fn prune_published_before(&self, cutoff: DateTime<Utc>) -> OutboxResult<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM outbox_entries
            WHERE published_at IS NOT NULL AND published_at < $1
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn pending_stats(&self) -> OutboxResult<(i64, i64)> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*)::BIGINT AS pending,
                COALESCE(EXTRACT(EPOCH FROM (NOW() - MIN(created_at)))::BIGINT, 0) AS age_seconds
            FROM outbox_entries
            WHERE published_at IS NULL
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        let pending: i64 = row.try_get("pending").unwrap_or(0);
        let age: i64 = row.try_get("age_seconds").unwrap_or(0);
        Ok((pending, age))
    }
}

/// Publisher side of the relay. Implementations must tolerate retries: the
/// relay re-publishes any row whose `mark_published` did not commit.
#[async_trait]
pub trait OutboxPublisher: Send + Sync {
    async fn publish(&self, entry: &OutboxEntry) -> OutboxResult<()>;
}

/// Publishes outbox rows to their target stream on the broker.
pub struct StreamOutboxPublisher<B> {
    broker: Arc<B>,
}

impl<B: StreamBroker> StreamOutboxPublisher<B> {
    pub fn new(broker: Arc<B>) -> Self {
        Self { broker }
    }
}

#[async_trait]
impl<B: StreamBroker> OutboxPublisher for StreamOutboxPublisher<B> {
    async fn publish(&self, entry: &OutboxEntry) -> OutboxResult<()> {
        let fields = entry.broker_fields()?;
        let broker_id = self.broker.publish(&entry.stream_name, &fields).await?;

        info!(
            entry_id = %entry.id,
            event_id = %entry.event_id,
            stream = %entry.stream_name,
            broker_id = %broker_id,
            "outbox entry published"
        );

        Ok(())
    }
}
