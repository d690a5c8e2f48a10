use redis::{ErrorKind, RedisError};
use thiserror::Error;

/// Broker failures, classified at the driver boundary so callers match on
/// kind rather than on driver details.
#[derive(Error, Debug)]
pub enum BrokerError {
    /// The broker does not know the requested command (e.g. auto-claim on an
    /// older server). Callers fall back to the two-step claim path.
    #[error("broker feature unsupported: {0}")]
    Unsupported(String),

    /// Connection loss, timeouts, fail-over windows. Retryable.
    #[error("transient broker failure: {0}")]
    Transient(String),

    /// The broker understood the request and refused it.
    #[error("broker rejected request: {0}")]
    Rejected(String),

    /// A reply did not have the shape this driver expects.
    #[error("malformed broker reply: {0}")]
    Protocol(String),
}

impl BrokerError {
    pub fn is_transient(&self) -> bool {
        matches!(self, BrokerError::Transient(_))
    }
}

pub(crate) fn is_busy_group(err: &RedisError) -> bool {
    err.code() == Some("BUSYGROUP") || err.to_string().contains("BUSYGROUP")
}

fn is_unknown_command(err: &RedisError) -> bool {
    // Servers without XAUTOCLAIM report: "ERR unknown command 'XAUTOCLAIM'".
    err.to_string().to_ascii_lowercase().contains("unknown command")
}

impl From<RedisError> for BrokerError {
    fn from(err: RedisError) -> Self {
        if is_unknown_command(&err) {
            return BrokerError::Unsupported(err.to_string());
        }
        match err.kind() {
            ErrorKind::IoError
            | ErrorKind::TryAgain
            | ErrorKind::BusyLoadingError
            | ErrorKind::ClusterDown
            | ErrorKind::MasterDown
            | ErrorKind::ReadOnly => BrokerError::Transient(err.to_string()),
            _ => BrokerError::Rejected(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_classify_as_transient() {
        let err: BrokerError =
            RedisError::from((ErrorKind::IoError, "broken pipe")).into();
        assert!(err.is_transient());

        let err: BrokerError =
            RedisError::from((ErrorKind::TryAgain, "loading dataset")).into();
        assert!(err.is_transient());
    }

    #[test]
    fn response_errors_classify_as_rejected() {
        let err: BrokerError = RedisError::from((
            ErrorKind::ResponseError,
            "NOGROUP",
            "no such consumer group".to_string(),
        ))
        .into();
        assert!(matches!(err, BrokerError::Rejected(_)));
        assert!(!err.is_transient());
    }

    #[test]
    fn unknown_command_classifies_as_unsupported() {
        let err: BrokerError = RedisError::from((
            ErrorKind::ResponseError,
            "ERR",
            "unknown command 'XAUTOCLAIM'".to_string(),
        ))
        .into();
        assert!(matches!(err, BrokerError::Unsupported(_)));
    }

    #[test]
    fn busy_group_is_detected() {
        let err = RedisError::from((
            ErrorKind::ResponseError,
            "BUSYGROUP",
            "Consumer Group name already exists".to_string(),
        ));
        assert!(is_busy_group(&err));

        let other = RedisError::from((ErrorKind::ResponseError, "WRONGTYPE"));
        assert!(!is_busy_group(&other));
    }
}
