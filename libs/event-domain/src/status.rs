use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle position of an event envelope.
///
/// Events are created in `Received`, become `Queued` the moment their outbox
/// row is committed, and are then driven by workers through `Processing` into
/// one of the result states. `FailedRetryable` events are re-enqueued by the
/// retry scheduler until the attempt cap is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventStatus {
    Received,
    Queued,
    Processing,
    Succeeded,
    FailedRetryable,
    FailedTerminal,
}

impl EventStatus {
    pub const ALL: [EventStatus; 6] = [
        EventStatus::Received,
        EventStatus::Queued,
        EventStatus::Processing,
        EventStatus::Succeeded,
        EventStatus::FailedRetryable,
        EventStatus::FailedTerminal,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Received => "RECEIVED",
            EventStatus::Queued => "QUEUED",
            EventStatus::Processing => "PROCESSING",
            EventStatus::Succeeded => "SUCCEEDED",
            EventStatus::FailedRetryable => "FAILED_RETRYABLE",
            EventStatus::FailedTerminal => "FAILED_TERMINAL",
        }
    }

    pub fn parse(value: &str) -> Option<EventStatus> {
        EventStatus::ALL.iter().copied().find(|s| s.as_str() == value)
    }

    /// Whether a worker may take (or re-take) this event for processing.
    ///
    /// `Processing` is claimable again: reclaim hands a message abandoned by a
    /// crashed consumer to a live one, and the event row is still sitting in
    /// `Processing` from the dead consumer's claim.
    pub fn is_claimable(&self) -> bool {
        matches!(self, EventStatus::Queued | EventStatus::Processing)
    }

    /// Whether a durable outcome (or retry schedule) has already been
    /// committed for this event.
    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            EventStatus::Succeeded | EventStatus::FailedRetryable | EventStatus::FailedTerminal
        )
    }

    /// The transition table. Every pair not listed here is forbidden and must
    /// never be persisted.
    pub fn can_transition_to(self, next: EventStatus) -> bool {
        use EventStatus::*;
        matches!(
            (self, next),
            (Received, Queued)
                | (Queued, Processing)
                | (Processing, Processing)
                | (Processing, Succeeded)
                | (Processing, FailedRetryable)
                | (Processing, FailedTerminal)
                | (FailedRetryable, Queued)
                | (FailedRetryable, FailedTerminal)
        )
    }
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_text() {
        for status in EventStatus::ALL {
            assert_eq!(EventStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(EventStatus::parse("queued"), None);
        assert_eq!(EventStatus::parse(""), None);
    }

    #[test]
    fn transition_table_is_exact() {
        use EventStatus::*;
        let permitted = [
            (Received, Queued),
            (Queued, Processing),
            (Processing, Processing),
            (Processing, Succeeded),
            (Processing, FailedRetryable),
            (Processing, FailedTerminal),
            (FailedRetryable, Queued),
            (FailedRetryable, FailedTerminal),
        ];

        for from in EventStatus::ALL {
            for to in EventStatus::ALL {
                let expected = permitted.contains(&(from, to));
                assert_eq!(
                    from.can_transition_to(to),
                    expected,
                    "transition {} -> {}",
                    from,
                    to
                );
            }
        }
    }

    #[test]
    fn settled_and_claimable_partition() {
        use EventStatus::*;
        assert!(Queued.is_claimable());
        assert!(Processing.is_claimable());
        assert!(!Succeeded.is_claimable());
        assert!(Succeeded.is_settled());
        assert!(FailedRetryable.is_settled());
        assert!(FailedTerminal.is_settled());
        assert!(!Received.is_settled());
        assert!(!Received.is_claimable());
    }

    #[test]
    fn serde_uses_screaming_snake_case() {
        let json = serde_json::to_string(&EventStatus::FailedRetryable).unwrap();
        assert_eq!(json, "\"FAILED_RETRYABLE\"");
        let back: EventStatus = serde_json::from_str("\"QUEUED\"").unwrap();
        assert_eq!(back, EventStatus::Queued);
    }
}
