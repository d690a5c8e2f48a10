/// Event admission endpoint.
use crate::error::Result;
use crate::services::{IngestOutcome, IngestRequest, IngestService};
use actix_web::{web, HttpRequest, HttpResponse};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct IngestEventRequest {
    pub event_id: Option<Uuid>,
    pub event_type: Option<String>,
    pub occurred_at: Option<DateTime<Utc>>,
    pub source: Option<String>,
    pub tenant_id: Option<String>,
    pub idempotency_key: Option<String>,
    pub correlation_id: Option<Uuid>,
    #[serde(default)]
    pub payload: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
pub struct IngestEventResponse {
    pub event_id: Uuid,
    pub status: String,
    pub idempotency_replayed: bool,
}

/// POST /events
///
/// 202 with the new event id on admission; 200 with the existing event's
/// current status on an idempotent replay.
pub async fn ingest_event(
    req: HttpRequest,
    service: web::Data<Arc<IngestService>>,
    body: web::Json<IngestEventRequest>,
) -> Result<HttpResponse> {
    let body = body.into_inner();
    let request = IngestRequest {
        event_id: body.event_id,
        tenant_id: body.tenant_id,
        event_type: body.event_type,
        occurred_at: body.occurred_at,
        source: body.source,
        idempotency_key_body: body.idempotency_key,
        idempotency_key_header: header_value(&req, "Idempotency-Key"),
        correlation_id_body: body.correlation_id,
        correlation_id_header: header_value(&req, "X-Correlation-Id"),
        payload: body.payload,
    };

    match service.ingest(request).await? {
        IngestOutcome::Accepted { event_id, status } => {
            Ok(HttpResponse::Accepted().json(IngestEventResponse {
                event_id,
                status: status.to_string(),
                idempotency_replayed: false,
            }))
        }
        IngestOutcome::Replayed { event_id, status } => {
            Ok(HttpResponse::Ok().json(IngestEventResponse {
                event_id,
                status: status.to_string(),
                idempotency_replayed: true,
            }))
        }
    }
}

fn header_value(req: &HttpRequest, name: &str) -> Option<String> {
    req.headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_body_accepts_minimal_payload() {
        let body: IngestEventRequest = serde_json::from_str(
            r#"{
                "event_type": "user.created",
                "source": "crm",
                "tenant_id": "t1",
                "payload": {"id": 1}
            }"#,
        )
        .unwrap();

        assert!(body.event_id.is_none());
        assert!(body.occurred_at.is_none());
        assert!(body.idempotency_key.is_none());
        assert_eq!(body.payload, Some(serde_json::json!({"id": 1})));
    }

    #[test]
    fn response_serializes_snake_case_contract_fields() {
        let response = IngestEventResponse {
            event_id: Uuid::nil(),
            status: "QUEUED".into(),
            idempotency_replayed: true,
        };
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["status"], "QUEUED");
        assert_eq!(json["idempotency_replayed"], true);
        assert!(json.get("event_id").is_some());
    }
}
