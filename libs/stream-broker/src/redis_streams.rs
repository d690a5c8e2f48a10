//! Redis Streams implementation of the broker driver.
//!
//! Commands are issued raw over a multiplexed async connection; replies are
//! walked as `redis::Value` trees so entries deleted mid-claim or the extra
//! reply element newer servers append do not break parsing.

use crate::error::{is_busy_group, BrokerError};
use crate::{AutoClaimPage, StreamBroker, StreamEntry};
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{Client, Value};
use std::collections::HashMap;
use tracing::debug;

pub struct RedisStreamBroker {
    client: Client,
}

impl RedisStreamBroker {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub fn connect(url: &str) -> Result<Self, BrokerError> {
        let client = Client::open(url).map_err(BrokerError::from)?;
        Ok(Self { client })
    }

    async fn conn(&self) -> Result<MultiplexedConnection, BrokerError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(Into::into)
    }
}

fn text(value: &Value) -> Option<String> {
    match value {
        Value::Data(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
        Value::Status(s) => Some(s.clone()),
        _ => None,
    }
}

/// One entry: `[id, [k1, v1, k2, v2, ...]]`. Nil entries (deleted from the
/// stream but still pending) yield `None`.
fn entry_from_value(value: &Value) -> Option<StreamEntry> {
    let Value::Bulk(parts) = value else {
        return None;
    };
    let id = parts.first().and_then(text)?;

    let mut fields = HashMap::new();
    if let Some(Value::Bulk(kvs)) = parts.get(1) {
        for pair in kvs.chunks(2) {
            if let (Some(k), Some(v)) = (
                pair.first().and_then(text),
                pair.get(1).and_then(text),
            ) {
                fields.insert(k, v);
            }
        }
    }

    Some(StreamEntry { id, fields })
}

fn entries_from_value(value: &Value) -> Vec<StreamEntry> {
    match value {
        Value::Bulk(items) => items.iter().filter_map(entry_from_value).collect(),
        _ => Vec::new(),
    }
}

/// XREADGROUP reply: `[[stream, [entries...]], ...]`, or Nil on an empty read.
fn read_reply_entries(value: &Value) -> Vec<StreamEntry> {
    let Value::Bulk(streams) = value else {
        return Vec::new();
    };
    let mut out = Vec::new();
    for stream in streams {
        if let Value::Bulk(parts) = stream {
            if let Some(entries) = parts.get(1) {
                out.extend(entries_from_value(entries));
            }
        }
    }
    out
}

/// XAUTOCLAIM reply: `[next_cursor, [entries...]]`; Redis 7 appends a third
/// element of deleted ids, which is ignored.
fn auto_claim_page(value: &Value) -> Result<AutoClaimPage, BrokerError> {
    let Value::Bulk(parts) = value else {
        return Err(BrokerError::Protocol(
            "auto-claim reply is not an array".into(),
        ));
    };
    let next_cursor = parts
        .first()
        .and_then(text)
        .ok_or_else(|| BrokerError::Protocol("auto-claim reply missing cursor".into()))?;
    let entries = parts.get(1).map(entries_from_value).unwrap_or_default();
    Ok(AutoClaimPage {
        next_cursor,
        entries,
    })
}

/// XPENDING (extended form) reply: `[[id, consumer, idle_ms, deliveries], ...]`.
/// Filtered client-side by idle time so the command works on servers without
/// the IDLE option.
fn pending_ids_from_value(value: &Value, min_idle_ms: u64) -> Vec<String> {
    let Value::Bulk(items) = value else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| {
            let Value::Bulk(parts) = item else {
                return None;
            };
            let id = parts.first().and_then(text)?;
            let idle_ms = match parts.get(2) {
                Some(Value::Int(ms)) => (*ms).max(0) as u64,
                _ => 0,
            };
            (idle_ms >= min_idle_ms).then_some(id)
        })
        .collect()
}

#[async_trait]
impl StreamBroker for RedisStreamBroker {
    async fn ensure_group(&self, stream: &str, group: &str) -> Result<(), BrokerError> {
        let mut conn = self.conn().await?;
        let created: Result<(), redis::RedisError> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(stream)
            .arg(group)
            .arg("$")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match created {
            Ok(()) => Ok(()),
            Err(e) if is_busy_group(&e) => {
                debug!(stream, group, "consumer group already exists");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn publish(
        &self,
        stream: &str,
        fields: &[(String, String)],
    ) -> Result<String, BrokerError> {
        let mut conn = self.conn().await?;
        let mut cmd = redis::cmd("XADD");
        cmd.arg(stream).arg("*");
        for (key, value) in fields {
            cmd.arg(key).arg(value);
        }
        let entry_id: String = cmd.query_async(&mut conn).await?;
        Ok(entry_id)
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        read_id: &str,
        count: usize,
    ) -> Result<Vec<StreamEntry>, BrokerError> {
        let mut conn = self.conn().await?;
        let raw: Value = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(group)
            .arg(consumer)
            .arg("COUNT")
            .arg(count)
            .arg("STREAMS")
            .arg(stream)
            .arg(read_id)
            .query_async(&mut conn)
            .await?;
        Ok(read_reply_entries(&raw))
    }

    async fn ack(&self, stream: &str, group: &str, entry_id: &str) -> Result<(), BrokerError> {
        let mut conn = self.conn().await?;
        redis::cmd("XACK")
            .arg(stream)
            .arg(group)
            .arg(entry_id)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn auto_claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle_ms: u64,
        cursor: &str,
        count: usize,
    ) -> Result<AutoClaimPage, BrokerError> {
        let mut conn = self.conn().await?;
        let raw: Value = redis::cmd("XAUTOCLAIM")
            .arg(stream)
            .arg(group)
            .arg(consumer)
            .arg(min_idle_ms)
            .arg(cursor)
            .arg("COUNT")
            .arg(count)
            .query_async(&mut conn)
            .await?;
        auto_claim_page(&raw)
    }

    async fn pending_ids(
        &self,
        stream: &str,
        group: &str,
        min_idle_ms: u64,
        count: usize,
    ) -> Result<Vec<String>, BrokerError> {
        let mut conn = self.conn().await?;
        let raw: Value = redis::cmd("XPENDING")
            .arg(stream)
            .arg(group)
            .arg("-")
            .arg("+")
            .arg(count)
            .query_async(&mut conn)
            .await?;
        Ok(pending_ids_from_value(&raw, min_idle_ms))
    }

    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle_ms: u64,
        ids: &[String],
    ) -> Result<Vec<StreamEntry>, BrokerError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn().await?;
        let mut cmd = redis::cmd("XCLAIM");
        cmd.arg(stream).arg(group).arg(consumer).arg(min_idle_ms);
        for id in ids {
            cmd.arg(id);
        }
        let raw: Value = cmd.query_async(&mut conn).await?;
        Ok(entries_from_value(&raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(s: &str) -> Value {
        Value::Data(s.as_bytes().to_vec())
    }

    fn entry(id: &str, kvs: &[(&str, &str)]) -> Value {
        let mut flat = Vec::new();
        for (k, v) in kvs {
            flat.push(data(k));
            flat.push(data(v));
        }
        Value::Bulk(vec![data(id), Value::Bulk(flat)])
    }

    #[test]
    fn parses_entry_with_fields() {
        let parsed = entry_from_value(&entry(
            "1-0",
            &[("event_id", "abc"), ("message", "{}")],
        ))
        .unwrap();
        assert_eq!(parsed.id, "1-0");
        assert_eq!(parsed.fields.get("event_id").unwrap(), "abc");
        assert_eq!(parsed.fields.len(), 2);
    }

    #[test]
    fn skips_nil_entries_left_by_deleted_messages() {
        let value = Value::Bulk(vec![
            Value::Nil,
            entry("2-0", &[("event_id", "x")]),
        ]);
        let entries = entries_from_value(&value);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, "2-0");
    }

    #[test]
    fn read_reply_flattens_across_streams() {
        let reply = Value::Bulk(vec![Value::Bulk(vec![
            data("events:stream"),
            Value::Bulk(vec![
                entry("1-0", &[("event_id", "a")]),
                entry("1-1", &[("event_id", "b")]),
            ]),
        ])]);
        let entries = read_reply_entries(&reply);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].id, "1-1");
    }

    #[test]
    fn empty_read_reply_is_empty() {
        assert!(read_reply_entries(&Value::Nil).is_empty());
    }

    #[test]
    fn auto_claim_reply_without_deleted_list() {
        let reply = Value::Bulk(vec![
            data("3-0"),
            Value::Bulk(vec![entry("2-5", &[("event_id", "e")])]),
        ]);
        let page = auto_claim_page(&reply).unwrap();
        assert_eq!(page.next_cursor, "3-0");
        assert_eq!(page.entries.len(), 1);
    }

    #[test]
    fn auto_claim_reply_with_deleted_list() {
        let reply = Value::Bulk(vec![
            data("0-0"),
            Value::Bulk(vec![]),
            Value::Bulk(vec![data("1-1")]),
        ]);
        let page = auto_claim_page(&reply).unwrap();
        assert_eq!(page.next_cursor, "0-0");
        assert!(page.entries.is_empty());
    }

    #[test]
    fn auto_claim_rejects_malformed_reply() {
        assert!(auto_claim_page(&Value::Nil).is_err());
        assert!(auto_claim_page(&Value::Bulk(vec![])).is_err());
    }

    #[test]
    fn pending_filter_honors_idle_threshold() {
        let reply = Value::Bulk(vec![
            Value::Bulk(vec![
                data("1-0"),
                data("dead-consumer"),
                Value::Int(45_000),
                Value::Int(2),
            ]),
            Value::Bulk(vec![
                data("1-1"),
                data("live-consumer"),
                Value::Int(50),
                Value::Int(1),
            ]),
        ]);
        let ids = pending_ids_from_value(&reply, 30_000);
        assert_eq!(ids, vec!["1-0".to_string()]);
    }
}
