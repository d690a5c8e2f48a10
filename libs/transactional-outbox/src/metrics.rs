//! Relay instrumentation.
//!
//! The gauges describe the backlog the relay is currently working through
//! (how deep, how stale); the counters accumulate publish outcomes over the
//! process lifetime. A growing backlog with rising failures means the broker
//! is down and backpressure is piling up in the outbox table.

use prometheus::core::Collector;
use prometheus::{IntCounter, IntGauge, Opts};
use tracing::warn;

#[derive(Clone)]
pub struct OutboxMetrics {
    /// Rows still awaiting a successful publish.
    pub backlog: IntGauge,
    /// Seconds since the oldest waiting row was created.
    pub oldest_age_seconds: IntGauge,
    /// Rows confirmed by the broker and marked published.
    pub published: IntCounter,
    /// Publish attempts the broker failed or refused.
    pub publish_failures: IntCounter,
}

impl OutboxMetrics {
    pub fn new(service: &str) -> Self {
        let opts = |name: &str, help: &str| {
            Opts::new(name, help).const_label("service", service.to_string())
        };

        let backlog = IntGauge::with_opts(opts(
            "outbox_backlog_size",
            "Outbox rows awaiting publish",
        ))
        .expect("outbox_backlog_size opts");
        register(Box::new(backlog.clone()));

        let oldest_age_seconds = IntGauge::with_opts(opts(
            "outbox_backlog_oldest_age_seconds",
            "Age of the oldest outbox row awaiting publish",
        ))
        .expect("outbox_backlog_oldest_age_seconds opts");
        register(Box::new(oldest_age_seconds.clone()));

        let published = IntCounter::with_opts(opts(
            "outbox_published_total",
            "Outbox rows relayed to the broker and marked published",
        ))
        .expect("outbox_published_total opts");
        register(Box::new(published.clone()));

        let publish_failures = IntCounter::with_opts(opts(
            "outbox_publish_failures_total",
            "Publish attempts that failed and were left for a later cycle",
        ))
        .expect("outbox_publish_failures_total opts");
        register(Box::new(publish_failures.clone()));

        Self {
            backlog,
            oldest_age_seconds,
            published,
            publish_failures,
        }
    }
}

/// Registration failures (typically a name collision when two relays share a
/// process) downgrade to unregistered-but-working metrics.
fn register(collector: Box<dyn Collector>) {
    if let Err(e) = prometheus::default_registry().register(collector) {
        warn!(error = %e, "outbox metric registration skipped");
    }
}
