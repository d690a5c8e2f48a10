//! Log-structured stream broker driver.
//!
//! The pipeline talks to the broker exclusively through [`StreamBroker`]:
//! the outbox relay publishes through it, the worker reads, claims and
//! acknowledges through it, and tests substitute an in-memory fake. The
//! production implementation is [`RedisStreamBroker`] over Redis Streams
//! consumer groups.

mod error;
mod redis_streams;

pub use error::BrokerError;
pub use redis_streams::RedisStreamBroker;

use async_trait::async_trait;
use std::collections::HashMap;

/// One broker message: the broker-assigned entry id plus a flat field map.
#[derive(Debug, Clone)]
pub struct StreamEntry {
    pub id: String,
    pub fields: HashMap<String, String>,
}

/// One page of an auto-claim cursor walk.
#[derive(Debug, Clone)]
pub struct AutoClaimPage {
    pub next_cursor: String,
    pub entries: Vec<StreamEntry>,
}

#[async_trait]
pub trait StreamBroker: Send + Sync {
    /// Create the consumer group at the stream tail, creating the stream if
    /// needed. A group that already exists is success.
    async fn ensure_group(&self, stream: &str, group: &str) -> Result<(), BrokerError>;

    /// Append one entry; returns the broker-assigned entry id.
    async fn publish(&self, stream: &str, fields: &[(String, String)])
        -> Result<String, BrokerError>;

    /// Read up to `count` entries on behalf of `consumer`. `read_id` is `"0"`
    /// for this consumer's own pending entries or `">"` for new entries.
    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        read_id: &str,
        count: usize,
    ) -> Result<Vec<StreamEntry>, BrokerError>;

    async fn ack(&self, stream: &str, group: &str, entry_id: &str) -> Result<(), BrokerError>;

    /// Transfer ownership of entries idle for at least `min_idle_ms`,
    /// scanning from `cursor`. Returns [`BrokerError::Unsupported`] on
    /// brokers without the single-command claim.
    async fn auto_claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle_ms: u64,
        cursor: &str,
        count: usize,
    ) -> Result<AutoClaimPage, BrokerError>;

    /// Entry ids from the group's pending list that have idled at least
    /// `min_idle_ms`.
    async fn pending_ids(
        &self,
        stream: &str,
        group: &str,
        min_idle_ms: u64,
        count: usize,
    ) -> Result<Vec<String>, BrokerError>;

    /// Explicitly claim `ids` for `consumer`. Entries that no longer exist
    /// are omitted from the result.
    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle_ms: u64,
        ids: &[String],
    ) -> Result<Vec<StreamEntry>, BrokerError>;
}
