//! Admission: normalize the request, validate it, and write the event row
//! and its outbox row in one transaction.
//!
//! The unique `(tenant_id, idempotency_key)` index is the idempotency
//! arbiter: the insert is attempted first and a conflict is resolved
//! afterwards, so concurrent duplicate submissions race on the index rather
//! than on a read-then-write.

use crate::error::{AppError, FieldErrors};
use crate::services::outbox_to_store;
use chrono::{DateTime, Utc};
use event_domain::{DomainError, EventEnvelope, EventStatus, NewEvent};
use event_store::{SqlxEventStore, StoreError};
use sqlx::PgPool;
use tracing::{debug, info};
use transactional_outbox::{OutboxEntry, SqlxOutboxRepository};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct IngestionSettings {
    /// When non-empty, `event_type` must be a member. An empty list (allowed
    /// outside production) disables the check.
    pub allowed_event_types: Vec<String>,
    /// Target broker stream recorded on outbox rows.
    pub stream_name: String,
}

/// Admission request after HTTP binding: body fields plus the transport
/// headers that participate in precedence resolution.
#[derive(Debug, Default)]
pub struct IngestRequest {
    pub event_id: Option<Uuid>,
    pub tenant_id: Option<String>,
    pub event_type: Option<String>,
    pub occurred_at: Option<DateTime<Utc>>,
    pub source: Option<String>,
    pub idempotency_key_body: Option<String>,
    pub idempotency_key_header: Option<String>,
    pub correlation_id_body: Option<Uuid>,
    pub correlation_id_header: Option<String>,
    pub payload: Option<serde_json::Value>,
}

#[derive(Debug)]
pub enum IngestOutcome {
    /// A new event was admitted and its publish committed to the outbox.
    Accepted { event_id: Uuid, status: EventStatus },
    /// A prior submission with the same (tenant, idempotency key) exists.
    Replayed { event_id: Uuid, status: EventStatus },
}

pub struct IngestService {
    pool: PgPool,
    events: SqlxEventStore,
    outbox: SqlxOutboxRepository,
    settings: IngestionSettings,
}

impl IngestService {
    pub fn new(pool: PgPool, settings: IngestionSettings) -> Self {
        Self {
            events: SqlxEventStore::new(pool.clone()),
            outbox: SqlxOutboxRepository::new(pool.clone()),
            pool,
            settings,
        }
    }

    pub async fn ingest(&self, request: IngestRequest) -> Result<IngestOutcome, AppError> {
        let now = Utc::now();
        let new_event =
            normalize(request, &self.settings, now).map_err(AppError::Validation)?;
        let tenant_id = new_event.tenant_id.clone();
        let idempotency_key = new_event.idempotency_key.clone();

        let mut envelope = EventEnvelope::admit(new_event, now).map_err(domain_to_app)?;
        // The outbox row committed alongside guarantees publication, so the
        // row is queued from the moment it is visible.
        envelope.enqueue().map_err(domain_to_app)?;

        match self.persist_new(&envelope).await {
            Ok(()) => {
                info!(
                    event_id = %envelope.id,
                    tenant_id = %envelope.tenant_id,
                    event_type = %envelope.event_type,
                    correlation_id = %envelope.correlation_id,
                    "event admitted"
                );
                Ok(IngestOutcome::Accepted {
                    event_id: envelope.id,
                    status: envelope.status,
                })
            }
            Err(e) if e.is_conflict() => {
                self.resolve_replay(&tenant_id, idempotency_key.as_deref()).await
            }
            Err(e) => Err(AppError::from(e)),
        }
    }

    /// The critical section: event row and outbox row in one transaction.
    async fn persist_new(&self, envelope: &EventEnvelope) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        self.events.insert(&mut tx, envelope).await?;
        let entry =
            OutboxEntry::for_event(envelope, &self.settings.stream_name, envelope.received_at);
        self.outbox
            .insert(&mut tx, &entry)
            .await
            .map_err(outbox_to_store)?;
        tx.commit().await?;
        Ok(())
    }

    /// A unique-index conflict means a prior submission owns this
    /// (tenant, key) pair; answer with its current state.
    async fn resolve_replay(
        &self,
        tenant_id: &str,
        idempotency_key: Option<&str>,
    ) -> Result<IngestOutcome, AppError> {
        let Some(key) = idempotency_key else {
            // The conflict was not the idempotency index (a client-supplied
            // event id collided); nothing to replay.
            return Err(AppError::Conflict);
        };

        let existing = self
            .events
            .find_by_idempotency_key(tenant_id, key)
            .await
            .map_err(AppError::from)?;
        let Some(existing) = existing else {
            // Race window or a conflict on some other constraint.
            return Err(AppError::Conflict);
        };

        if existing.status == EventStatus::Received {
            // Its original ingestion failed before the outbox row committed.
            // Finish the job: queue it and create the missing outbox row.
            self.repair_received(&existing).await?;
            info!(
                event_id = %existing.id,
                tenant_id = %tenant_id,
                "idempotent replay repaired a half-ingested event"
            );
            return Ok(IngestOutcome::Replayed {
                event_id: existing.id,
                status: EventStatus::Queued,
            });
        }

        debug!(event_id = %existing.id, status = %existing.status, "idempotent replay");
        Ok(IngestOutcome::Replayed {
            event_id: existing.id,
            status: existing.status,
        })
    }

    async fn repair_received(&self, existing: &EventEnvelope) -> Result<(), AppError> {
        let result: Result<(), StoreError> = async {
            let mut tx = self.pool.begin().await?;
            let moved = self.events.mark_queued_from_received(&mut tx, existing.id).await?;
            if moved {
                let mut snapshot = existing.clone();
                snapshot
                    .enqueue()
                    .map_err(|e| StoreError::Other(e.to_string()))?;
                let entry = OutboxEntry::for_event(
                    &snapshot,
                    &self.settings.stream_name,
                    Utc::now(),
                );
                self.outbox
                    .insert(&mut tx, &entry)
                    .await
                    .map_err(outbox_to_store)?;
            }
            tx.commit().await?;
            Ok(())
        }
        .await;

        match result {
            Ok(()) => Ok(()),
            // A concurrent replay repaired it first; the outcome stands.
            Err(e) if e.is_conflict() => Ok(()),
            Err(e) => Err(AppError::from(e)),
        }
    }
}

fn domain_to_app(err: DomainError) -> AppError {
    match err {
        DomainError::Validation(message) => {
            let mut fields = FieldErrors::new();
            fields.push("request", message);
            AppError::Validation(fields)
        }
        other => AppError::Internal(other.to_string()),
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Apply the precedence and defaulting rules, collecting every field
/// rejection instead of stopping at the first.
fn normalize(
    request: IngestRequest,
    settings: &IngestionSettings,
    now: DateTime<Utc>,
) -> Result<NewEvent, FieldErrors> {
    let mut errors = FieldErrors::new();

    let tenant_id = non_blank(request.tenant_id);
    if tenant_id.is_none() {
        errors.push("tenant_id", "must be non-blank");
    }

    let event_type = non_blank(request.event_type);
    match &event_type {
        None => errors.push("event_type", "must be non-blank"),
        Some(event_type) => {
            if !settings.allowed_event_types.is_empty()
                && !settings.allowed_event_types.iter().any(|t| t == event_type)
            {
                errors.push("event_type", "is not a registered event type");
            }
        }
    }

    let source = non_blank(request.source);
    if source.is_none() {
        errors.push("source", "must be non-blank");
    }

    if request.payload.is_none() {
        errors.push("payload", "is required");
    }

    let occurred_at = request.occurred_at.unwrap_or(now);
    if occurred_at > now {
        errors.push("occurred_at", "must not be in the future");
    }

    // Header takes precedence when present and non-blank.
    let idempotency_key = non_blank(request.idempotency_key_header)
        .or_else(|| non_blank(request.idempotency_key_body));

    // A parseable header wins; an unparseable one falls back to the body;
    // a fresh identifier otherwise.
    let correlation_id = request
        .correlation_id_header
        .as_deref()
        .and_then(|raw| Uuid::parse_str(raw.trim()).ok())
        .filter(|id| !id.is_nil())
        .or(request.correlation_id_body.filter(|id| !id.is_nil()))
        .unwrap_or_else(Uuid::new_v4);

    let event_id = request
        .event_id
        .filter(|id| !id.is_nil())
        .unwrap_or_else(Uuid::new_v4);

    match (tenant_id, event_type, source, request.payload) {
        (Some(tenant_id), Some(event_type), Some(source), Some(payload))
            if errors.is_empty() =>
        {
            Ok(NewEvent {
                id: event_id,
                tenant_id,
                event_type,
                occurred_at,
                source,
                idempotency_key,
                correlation_id,
                payload,
            })
        }
        _ => Err(errors),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn settings() -> IngestionSettings {
        IngestionSettings {
            allowed_event_types: vec!["user.created".into(), "order.placed".into()],
            stream_name: "events:stream".into(),
        }
    }

    fn valid_request() -> IngestRequest {
        IngestRequest {
            tenant_id: Some("t1".into()),
            event_type: Some("user.created".into()),
            source: Some("crm".into()),
            payload: Some(serde_json::json!({"id": 1})),
            ..IngestRequest::default()
        }
    }

    #[test]
    fn defaults_are_generated_for_absent_fields() {
        let now = Utc::now();
        let event = normalize(valid_request(), &settings(), now).unwrap();

        assert!(!event.id.is_nil());
        assert!(!event.correlation_id.is_nil());
        assert_eq!(event.occurred_at, now);
        assert!(event.idempotency_key.is_none());
    }

    #[test]
    fn nil_event_id_is_replaced() {
        let mut request = valid_request();
        request.event_id = Some(Uuid::nil());
        let event = normalize(request, &settings(), Utc::now()).unwrap();
        assert!(!event.id.is_nil());
    }

    #[test]
    fn idempotency_header_takes_precedence_over_body() {
        let mut request = valid_request();
        request.idempotency_key_body = Some("B".into());
        request.idempotency_key_header = Some("H".into());
        let event = normalize(request, &settings(), Utc::now()).unwrap();
        assert_eq!(event.idempotency_key.as_deref(), Some("H"));
    }

    #[test]
    fn blank_idempotency_header_falls_back_to_body() {
        let mut request = valid_request();
        request.idempotency_key_body = Some("B".into());
        request.idempotency_key_header = Some("   ".into());
        let event = normalize(request, &settings(), Utc::now()).unwrap();
        assert_eq!(event.idempotency_key.as_deref(), Some("B"));
    }

    #[test]
    fn parseable_correlation_header_wins() {
        let header_id = Uuid::new_v4();
        let body_id = Uuid::new_v4();
        let mut request = valid_request();
        request.correlation_id_header = Some(header_id.to_string());
        request.correlation_id_body = Some(body_id);
        let event = normalize(request, &settings(), Utc::now()).unwrap();
        assert_eq!(event.correlation_id, header_id);
    }

    #[test]
    fn unparseable_correlation_header_falls_back_to_body() {
        let body_id = Uuid::new_v4();
        let mut request = valid_request();
        request.correlation_id_header = Some("not-a-uuid".into());
        request.correlation_id_body = Some(body_id);
        let event = normalize(request, &settings(), Utc::now()).unwrap();
        assert_eq!(event.correlation_id, body_id);
    }

    #[test]
    fn absent_correlation_generates_a_fresh_identifier() {
        let event = normalize(valid_request(), &settings(), Utc::now()).unwrap();
        assert!(!event.correlation_id.is_nil());
    }

    #[test]
    fn future_occurred_at_is_rejected() {
        let now = Utc::now();
        let mut request = valid_request();
        request.occurred_at = Some(now + Duration::seconds(30));
        let errors = normalize(request, &settings(), now).unwrap_err();
        assert!(!errors.messages("occurred_at").is_empty());
    }

    #[test]
    fn field_errors_accumulate() {
        let request = IngestRequest {
            event_type: Some("mystery.event".into()),
            ..IngestRequest::default()
        };
        let errors = normalize(request, &settings(), Utc::now()).unwrap_err();
        assert!(!errors.messages("tenant_id").is_empty());
        assert!(!errors.messages("source").is_empty());
        assert!(!errors.messages("payload").is_empty());
        assert_eq!(
            errors.messages("event_type"),
            &["is not a registered event type".to_string()]
        );
    }

    #[test]
    fn empty_allow_list_disables_the_type_check() {
        let open_settings = IngestionSettings {
            allowed_event_types: Vec::new(),
            stream_name: "events:stream".into(),
        };
        let mut request = valid_request();
        request.event_type = Some("anything.goes".into());
        assert!(normalize(request, &open_settings, Utc::now()).is_ok());
    }

    #[test]
    fn json_null_payload_counts_as_missing() {
        // Serde binds JSON null to None for Option<Value>; the admission
        // contract requires a payload either way.
        let body: crate::handlers::IngestEventRequest = serde_json::from_str(
            r#"{"event_type": "user.created", "source": "crm", "tenant_id": "t1", "payload": null}"#,
        )
        .unwrap();
        assert!(body.payload.is_none());
    }
}
