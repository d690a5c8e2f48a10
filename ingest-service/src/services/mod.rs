mod ingest;
mod retry_scheduler;

pub use ingest::{IngestOutcome, IngestRequest, IngestService, IngestionSettings};
pub use retry_scheduler::RetryScheduler;

use event_store::StoreError;
use transactional_outbox::OutboxError;

/// Outbox writes share the admission/requeue transaction; fold their errors
/// into the store classification so conflict/transient handling stays in one
/// place.
pub(crate) fn outbox_to_store(err: OutboxError) -> StoreError {
    match err {
        OutboxError::Database(db) => StoreError::from(db),
        other => StoreError::Other(other.to_string()),
    }
}
