//! Event handler dispatch.
//!
//! Handlers are registered per `event_type`; the worker looks the handler up
//! by the envelope's type tag and invokes it once per delivery.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// One event type's processing logic.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// The `event_type` tag this handler consumes.
    fn event_type(&self) -> &str;

    /// Process one delivery. `message` is the envelope snapshot JSON carried
    /// on the broker entry; `phase` tags which worker phase delivered it.
    ///
    /// Implementations MUST be idempotent: at-least-once delivery means the
    /// same event can arrive again after a crash or a reclaim.
    async fn handle(&self, event_id: Uuid, message: &str, phase: &str) -> anyhow::Result<()>;
}

/// Registry mapping `event_type` to its handler. Later registrations for the
/// same type replace earlier ones.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn EventHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handler: Arc<dyn EventHandler>) {
        self.handlers
            .insert(handler.event_type().to_string(), handler);
    }

    pub fn get(&self, event_type: &str) -> Option<Arc<dyn EventHandler>> {
        self.handlers.get(event_type).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }
}

/// Built-in handler that records each delivery in the structured log. The
/// binary registers it for the types named in `WORKER_EVENT_TYPES`; real
/// deployments register their own handlers instead.
pub struct AuditLogHandler {
    event_type: String,
}

impl AuditLogHandler {
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
        }
    }
}

#[async_trait]
impl EventHandler for AuditLogHandler {
    fn event_type(&self) -> &str {
        &self.event_type
    }

    async fn handle(&self, event_id: Uuid, message: &str, phase: &str) -> anyhow::Result<()> {
        info!(
            event_id = %event_id,
            event_type = %self.event_type,
            phase,
            message_bytes = message.len(),
            "event processed"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_dispatches_by_type_tag() {
        let mut registry = HandlerRegistry::new();
        registry.register(Arc::new(AuditLogHandler::new("user.created")));
        registry.register(Arc::new(AuditLogHandler::new("order.placed")));

        assert_eq!(registry.len(), 2);
        assert!(registry.get("user.created").is_some());
        assert!(registry.get("order.placed").is_some());
        assert!(registry.get("user.deleted").is_none());
    }

    #[test]
    fn later_registration_replaces_earlier() {
        let mut registry = HandlerRegistry::new();
        registry.register(Arc::new(AuditLogHandler::new("user.created")));
        registry.register(Arc::new(AuditLogHandler::new("user.created")));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn audit_handler_accepts_any_message() {
        let handler = AuditLogHandler::new("user.created");
        let result = handler
            .handle(Uuid::new_v4(), "{\"event_id\":\"x\"}", "steady")
            .await;
        assert!(result.is_ok());
    }
}
