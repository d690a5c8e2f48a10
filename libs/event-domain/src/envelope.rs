use crate::error::DomainError;
use crate::status::EventStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Normalized admission command: every field has already been resolved
/// (generated identifiers, header precedence, defaulted timestamps) by the
/// ingestion layer.
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub id: Uuid,
    pub tenant_id: String,
    pub event_type: String,
    pub occurred_at: DateTime<Utc>,
    pub source: String,
    pub idempotency_key: Option<String>,
    pub correlation_id: Uuid,
    pub payload: serde_json::Value,
}

/// The full event record as stored, including metadata and the opaque payload.
///
/// The envelope serializes with the `id` field named `event_id`; that JSON
/// form is the snapshot written to the outbox and carried in the broker
/// `message` field, so workers can resolve the event from either place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    #[serde(rename = "event_id")]
    pub id: Uuid,
    pub tenant_id: String,
    pub event_type: String,
    pub occurred_at: DateTime<Utc>,
    pub received_at: DateTime<Utc>,
    pub source: String,
    pub idempotency_key: Option<String>,
    pub correlation_id: Uuid,
    pub payload: serde_json::Value,
    pub status: EventStatus,
    pub attempts: i32,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl EventEnvelope {
    /// Construct a freshly admitted envelope in `Received`.
    pub fn admit(new: NewEvent, received_at: DateTime<Utc>) -> Result<Self, DomainError> {
        if new.id.is_nil() {
            return Err(DomainError::Validation("event id must be non-zero".into()));
        }
        if new.correlation_id.is_nil() {
            return Err(DomainError::Validation(
                "correlation id must be non-zero".into(),
            ));
        }
        if new.tenant_id.trim().is_empty() {
            return Err(DomainError::Validation("tenant_id must be non-blank".into()));
        }
        if new.event_type.trim().is_empty() {
            return Err(DomainError::Validation(
                "event_type must be non-blank".into(),
            ));
        }
        if new.source.trim().is_empty() {
            return Err(DomainError::Validation("source must be non-blank".into()));
        }
        if new.occurred_at > received_at {
            return Err(DomainError::Validation(
                "occurred_at must not be later than received_at".into(),
            ));
        }
        if matches!(&new.idempotency_key, Some(k) if k.trim().is_empty()) {
            return Err(DomainError::Validation(
                "idempotency_key must be non-blank when present".into(),
            ));
        }

        Ok(EventEnvelope {
            id: new.id,
            tenant_id: new.tenant_id,
            event_type: new.event_type,
            occurred_at: new.occurred_at,
            received_at,
            source: new.source,
            idempotency_key: new.idempotency_key,
            correlation_id: new.correlation_id,
            payload: new.payload,
            status: EventStatus::Received,
            attempts: 0,
            next_attempt_at: None,
            last_error: None,
        })
    }

    fn transition(&mut self, next: EventStatus) -> Result<(), DomainError> {
        if !self.status.can_transition_to(next) {
            return Err(DomainError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    /// Received -> Queued (ingestion commit) or FailedRetryable -> Queued
    /// (scheduler re-enqueue). Clears the retry schedule.
    pub fn enqueue(&mut self) -> Result<(), DomainError> {
        self.transition(EventStatus::Queued)?;
        self.next_attempt_at = None;
        Ok(())
    }

    /// A worker claims the event. Increments `attempts` and clears the
    /// previous diagnostic and retry schedule.
    pub fn begin_processing(&mut self) -> Result<(), DomainError> {
        self.transition(EventStatus::Processing)?;
        self.attempts += 1;
        self.last_error = None;
        self.next_attempt_at = None;
        Ok(())
    }

    pub fn succeed(&mut self) -> Result<(), DomainError> {
        self.transition(EventStatus::Succeeded)?;
        self.last_error = None;
        self.next_attempt_at = None;
        Ok(())
    }

    /// Record a transient handler failure and schedule the next attempt.
    /// `next_attempt_at` must lie strictly in the future.
    pub fn fail_retryable(
        &mut self,
        error: &str,
        next_attempt_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), DomainError> {
        if next_attempt_at <= now {
            return Err(DomainError::Validation(
                "next_attempt_at must be strictly in the future".into(),
            ));
        }
        self.transition(EventStatus::FailedRetryable)?;
        self.last_error = Some(crate::error::sanitize_error(error));
        self.next_attempt_at = Some(next_attempt_at);
        Ok(())
    }

    pub fn fail_terminal(&mut self, error: &str) -> Result<(), DomainError> {
        self.transition(EventStatus::FailedTerminal)?;
        self.last_error = Some(crate::error::sanitize_error(error));
        self.next_attempt_at = None;
        Ok(())
    }

    /// The snapshot carried by outbox rows and broker messages.
    pub fn snapshot(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn new_event() -> NewEvent {
        NewEvent {
            id: Uuid::new_v4(),
            tenant_id: "t1".into(),
            event_type: "user.created".into(),
            occurred_at: Utc::now() - Duration::seconds(5),
            source: "crm".into(),
            idempotency_key: Some("k1".into()),
            correlation_id: Uuid::new_v4(),
            payload: serde_json::json!({"id": 1}),
        }
    }

    #[test]
    fn admit_creates_received_envelope() {
        let env = EventEnvelope::admit(new_event(), Utc::now()).unwrap();
        assert_eq!(env.status, EventStatus::Received);
        assert_eq!(env.attempts, 0);
        assert!(env.next_attempt_at.is_none());
        assert!(env.last_error.is_none());
    }

    #[test]
    fn admit_rejects_future_occurred_at() {
        let mut new = new_event();
        new.occurred_at = Utc::now() + Duration::seconds(60);
        let err = EventEnvelope::admit(new, Utc::now()).unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn admit_rejects_blank_fields_and_nil_ids() {
        let mut blank_tenant = new_event();
        blank_tenant.tenant_id = "  ".into();
        assert!(EventEnvelope::admit(blank_tenant, Utc::now()).is_err());

        let mut nil_correlation = new_event();
        nil_correlation.correlation_id = Uuid::nil();
        assert!(EventEnvelope::admit(nil_correlation, Utc::now()).is_err());

        let mut blank_key = new_event();
        blank_key.idempotency_key = Some("".into());
        assert!(EventEnvelope::admit(blank_key, Utc::now()).is_err());
    }

    #[test]
    fn full_success_lifecycle() {
        let mut env = EventEnvelope::admit(new_event(), Utc::now()).unwrap();
        env.enqueue().unwrap();
        assert_eq!(env.status, EventStatus::Queued);
        env.begin_processing().unwrap();
        assert_eq!(env.status, EventStatus::Processing);
        assert_eq!(env.attempts, 1);
        env.succeed().unwrap();
        assert_eq!(env.status, EventStatus::Succeeded);
        assert!(env.last_error.is_none());
        assert!(env.next_attempt_at.is_none());
    }

    #[test]
    fn retry_cycle_clears_schedule_on_requeue() {
        let now = Utc::now();
        let mut env = EventEnvelope::admit(new_event(), now).unwrap();
        env.enqueue().unwrap();
        env.begin_processing().unwrap();
        env.fail_retryable("boom", now + Duration::seconds(4), now)
            .unwrap();
        assert_eq!(env.status, EventStatus::FailedRetryable);
        assert_eq!(env.last_error.as_deref(), Some("boom"));
        assert!(env.next_attempt_at.is_some());

        env.enqueue().unwrap();
        assert_eq!(env.status, EventStatus::Queued);
        assert!(env.next_attempt_at.is_none());

        env.begin_processing().unwrap();
        assert_eq!(env.attempts, 2);
        assert!(env.last_error.is_none());
    }

    #[test]
    fn processing_reentry_increments_attempts() {
        let mut env = EventEnvelope::admit(new_event(), Utc::now()).unwrap();
        env.enqueue().unwrap();
        env.begin_processing().unwrap();
        env.begin_processing().unwrap();
        assert_eq!(env.attempts, 2);
        assert_eq!(env.status, EventStatus::Processing);
    }

    #[test]
    fn fail_retryable_demands_future_schedule() {
        let now = Utc::now();
        let mut env = EventEnvelope::admit(new_event(), now).unwrap();
        env.enqueue().unwrap();
        env.begin_processing().unwrap();
        let err = env.fail_retryable("boom", now, now).unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
        // The failed call must not have moved the status.
        assert_eq!(env.status, EventStatus::Processing);
    }

    #[test]
    fn blank_handler_error_becomes_unknown() {
        let now = Utc::now();
        let mut env = EventEnvelope::admit(new_event(), now).unwrap();
        env.enqueue().unwrap();
        env.begin_processing().unwrap();
        env.fail_retryable("  ", now + Duration::seconds(2), now)
            .unwrap();
        assert_eq!(env.last_error.as_deref(), Some("Unknown error"));
    }

    #[test]
    fn forbidden_transitions_do_not_mutate() {
        let mut env = EventEnvelope::admit(new_event(), Utc::now()).unwrap();
        let err = env.succeed().unwrap_err();
        assert_eq!(
            err,
            DomainError::InvalidTransition {
                from: EventStatus::Received,
                to: EventStatus::Succeeded,
            }
        );
        assert_eq!(env.status, EventStatus::Received);
    }

    #[test]
    fn snapshot_renames_id_to_event_id() {
        let env = EventEnvelope::admit(new_event(), Utc::now()).unwrap();
        let snapshot = env.snapshot();
        assert_eq!(
            snapshot.get("event_id").and_then(|v| v.as_str()),
            Some(env.id.to_string().as_str())
        );
        assert!(snapshot.get("id").is_none());
        assert_eq!(
            snapshot.get("status").and_then(|v| v.as_str()),
            Some("RECEIVED")
        );

        let back: EventEnvelope = serde_json::from_value(snapshot).unwrap();
        assert_eq!(back.id, env.id);
        assert_eq!(back.payload, env.payload);
    }
}
