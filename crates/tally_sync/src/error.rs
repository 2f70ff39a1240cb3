//! Error types for the sync connector.

use serde::{Deserialize, Serialize};
use tally_protocol::ProtocolError;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during a sync cycle.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Tally or the remote store is unreachable. Retried with backoff,
    /// never surfaced as fatal.
    #[error("connection error: {0}")]
    Connection(String),

    /// Malformed HTTP exchange (non-2xx status, undecodable body).
    /// Retried with the same policy as connection errors.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Tally reported an application error inside a 200-OK body (no
    /// company open, license issue). Surfaced verbatim and not retried
    /// automatically; it usually needs user action in Tally itself.
    #[error("tally error: {0}")]
    TallyApplication(String),

    /// The remote store rejected a write. A foreign-key violation here
    /// means the plan's dependency ordering was wrong, which is a logic
    /// defect worth alerting on, not a transient condition.
    #[error("constraint violation: {0}")]
    ConstraintViolation(String),

    /// The cycle was cancelled at a stage boundary.
    #[error("sync cancelled")]
    Cancelled,

    /// A cycle was requested while one is already in flight.
    #[error("sync cycle already in flight")]
    CycleInFlight,
}

impl SyncError {
    /// Returns true if the next scheduled cycle should retry after
    /// backoff without user intervention.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::Connection(_) | SyncError::Protocol(_))
    }

    /// The lightweight kind recorded in [`crate::SyncStats`].
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::Connection(_) => ErrorKind::Connection,
            SyncError::Protocol(_) => ErrorKind::Protocol,
            SyncError::TallyApplication(_) => ErrorKind::TallyApplication,
            SyncError::ConstraintViolation(_) => ErrorKind::ConstraintViolation,
            SyncError::Cancelled => ErrorKind::Cancelled,
            SyncError::CycleInFlight => ErrorKind::Cancelled,
        }
    }
}

impl From<ProtocolError> for SyncError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::TallyApplication(text) => SyncError::TallyApplication(text),
            // MalformedRecord is handled per record inside parse_report
            // and only reaches here if a caller misuses the protocol
            // crate directly; treat it like any undecodable exchange.
            other => SyncError::Protocol(other.to_string()),
        }
    }
}

/// Error classification mirrored into [`crate::SyncStats`].
///
/// `MalformedRecord` never aborts a cycle; it appears here so callers
/// reading per-record skip reports can classify them alongside cycle
/// failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Tally or the store unreachable.
    Connection,
    /// Malformed HTTP exchange.
    Protocol,
    /// Tally-level application error.
    TallyApplication,
    /// Single-record parse failure.
    MalformedRecord,
    /// Remote store rejected a write.
    ConstraintViolation,
    /// Cycle cancelled.
    Cancelled,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(SyncError::Connection("refused".into()).is_retryable());
        assert!(SyncError::Protocol("HTTP 500".into()).is_retryable());
        assert!(!SyncError::TallyApplication("No company open".into()).is_retryable());
        assert!(!SyncError::ConstraintViolation("fk".into()).is_retryable());
        assert!(!SyncError::Cancelled.is_retryable());
    }

    #[test]
    fn protocol_error_conversion() {
        let err: SyncError = ProtocolError::TallyApplication("license expired".into()).into();
        assert_eq!(err.kind(), ErrorKind::TallyApplication);
        assert!(err.to_string().contains("license expired"));

        let err: SyncError = ProtocolError::Xml("truncated".into()).into();
        assert_eq!(err.kind(), ErrorKind::Protocol);
    }
}
