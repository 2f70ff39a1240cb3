//! Error types for the protocol layer.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors that can occur while building or parsing Tally envelopes.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// The response body is not well-formed XML.
    #[error("malformed xml: {0}")]
    Xml(String),

    /// Tally reported an application-level error inside a 200-OK body
    /// (no company open, licensing problem, and so on). Carries Tally's
    /// raw error text verbatim.
    #[error("tally error: {0}")]
    TallyApplication(String),

    /// The envelope parsed but did not have the expected structure.
    #[error("unexpected envelope structure: {0}")]
    InvalidStructure(String),

    /// A single record could not be converted into its typed form.
    ///
    /// This never escapes a batch: `parse_report` catches it per record
    /// and turns it into a [`crate::RecordSkip`].
    #[error("malformed record: {0}")]
    MalformedRecord(String),
}

impl ProtocolError {
    /// Creates an invalid-structure error.
    pub fn invalid_structure(message: impl Into<String>) -> Self {
        Self::InvalidStructure(message.into())
    }

    /// Creates a malformed-record error.
    pub fn malformed_record(message: impl Into<String>) -> Self {
        Self::MalformedRecord(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = ProtocolError::TallyApplication("No company open".into());
        assert_eq!(err.to_string(), "tally error: No company open");

        let err = ProtocolError::malformed_record("GUID missing");
        assert!(err.to_string().contains("GUID missing"));
    }
}
