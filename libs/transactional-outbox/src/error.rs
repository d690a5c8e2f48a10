//! Error types for the transactional outbox library.

use stream_broker::BrokerError;
use thiserror::Error;
use uuid::Uuid;

/// Result type alias for outbox operations.
pub type OutboxResult<T> = Result<T, OutboxError>;

/// Errors that can occur during outbox operations.
#[derive(Error, Debug)]
pub enum OutboxError {
    /// Database operation failed
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Entry not found in the outbox table
    #[error("outbox entry not found: {0}")]
    EntryNotFound(Uuid),

    /// The broker refused or failed the publish
    #[error("publish failed: {0}")]
    Publish(#[from] BrokerError),

    /// Snapshot (de)serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
