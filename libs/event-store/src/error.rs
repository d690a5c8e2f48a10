use event_domain::EventStatus;
use thiserror::Error;
use uuid::Uuid;

const UNIQUE_VIOLATION: &str = "23505";

/// Storage failures, classified at the repository boundary. Callers match on
/// these kinds and never on sqlx details.
#[derive(Error, Debug)]
pub enum StoreError {
    /// A unique constraint rejected the write. For event inserts this is the
    /// `(tenant_id, idempotency_key)` index or the primary key.
    #[error("unique constraint violation on {constraint}")]
    Conflict { constraint: String },

    /// Database unavailability, pool exhaustion, statement timeouts.
    #[error("transient storage failure: {0}")]
    Transient(String),

    #[error("row not found")]
    NotFound,

    /// A guarded status UPDATE matched no row in a permitted source state.
    /// The write was not persisted.
    #[error("status write rejected: event {id} is not in a state permitting {to}")]
    TransitionRejected { id: Uuid, to: EventStatus },

    #[error("storage error: {0}")]
    Other(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }
}

/// Classification of a database-reported error by SQLSTATE.
///
/// Class 08 (connection), class 57 (operator intervention, including
/// statement timeouts reported as query_canceled) and 53300 (too many
/// connections) are expected to resolve on retry.
pub(crate) fn classify_database(
    code: Option<&str>,
    constraint: Option<&str>,
    message: &str,
) -> StoreError {
    match code {
        Some(UNIQUE_VIOLATION) => StoreError::Conflict {
            constraint: constraint.unwrap_or("unknown").to_string(),
        },
        Some(code) if code.starts_with("08") || code.starts_with("57") || code == "53300" => {
            StoreError::Transient(message.to_string())
        }
        _ => StoreError::Other(message.to_string()),
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => StoreError::NotFound,
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::WorkerCrashed => {
                StoreError::Transient(err.to_string())
            }
            sqlx::Error::Io(e) => StoreError::Transient(e.to_string()),
            sqlx::Error::Database(db) => classify_database(
                db.code().as_deref(),
                db.constraint(),
                db.message(),
            ),
            other => StoreError::Other(other.to_string()),
        }
    }
}
