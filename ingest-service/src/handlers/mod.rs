mod events;

pub use events::{ingest_event, IngestEventRequest, IngestEventResponse};
