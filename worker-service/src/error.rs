use event_store::StoreError;
use stream_broker::BrokerError;
use thiserror::Error;

/// Loop-level worker failures. Per-entry storage problems are absorbed inside
/// entry processing (logged, entry left pending); what surfaces here is
/// broker trouble and cancellation.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("worker cancelled")]
    Cancelled,
}
