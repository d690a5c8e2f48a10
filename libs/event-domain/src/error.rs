use crate::status::EventStatus;
use thiserror::Error;

/// Errors raised by the domain layer.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum DomainError {
    /// The requested status change is not in the transition table.
    #[error("invalid status transition {from} -> {to}")]
    InvalidTransition { from: EventStatus, to: EventStatus },

    /// An envelope field violates a domain invariant.
    #[error("invalid envelope: {0}")]
    Validation(String),
}

const MAX_ERROR_LEN: usize = 500;

/// Reduce a raw failure message to a storable diagnostic: control characters
/// become spaces, surrounding whitespace is dropped, and the result is capped
/// at 500 characters. Blank input collapses to "Unknown error".
pub fn sanitize_error(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| if c.is_control() { ' ' } else { c })
        .collect();
    let trimmed = cleaned.trim();

    if trimmed.is_empty() {
        return "Unknown error".to_string();
    }

    trimmed.chars().take(MAX_ERROR_LEN).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_input_becomes_unknown_error() {
        assert_eq!(sanitize_error(""), "Unknown error");
        assert_eq!(sanitize_error("   \n\t "), "Unknown error");
    }

    #[test]
    fn control_characters_are_flattened() {
        assert_eq!(sanitize_error("db\ntimeout\r\n"), "db timeout");
    }

    #[test]
    fn long_messages_are_capped() {
        let long = "x".repeat(2000);
        assert_eq!(sanitize_error(&long).chars().count(), 500);
    }

    #[test]
    fn ordinary_messages_pass_through() {
        assert_eq!(sanitize_error("connection refused"), "connection refused");
    }
}
