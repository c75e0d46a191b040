//! # Envelope Errors
//!
//! Validation and codec failures for operation envelopes.

use thiserror::Error;

/// Result type for envelope operations
pub type EnvelopeResult<T> = Result<T, EnvelopeError>;

/// Envelope errors
///
/// Every variant describes a payload that can never succeed, so none of
/// them is worth redelivering.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnvelopeError {
    // ==================
    // Codec Errors
    // ==================
    /// Message body was empty
    #[error("Invalid payload: empty message body")]
    EmptyBody,

    /// Message body was not a JSON object
    #[error("Invalid payload: malformed JSON ({0})")]
    MalformedJson(String),

    /// Envelope could not be serialized
    #[error("Envelope serialization failed: {0}")]
    Serialization(String),

    // ==================
    // Validation Errors
    // ==================
    /// A required field was absent or blank
    #[error("Invalid payload: missing required field '{0}'")]
    MissingField(&'static str),

    /// Method is not one of create, update, delete
    #[error("Invalid payload: unsupported method '{0}'")]
    UnsupportedMethod(String),

    /// Create was requested without any column data
    #[error("Invalid payload: create requires data")]
    MissingData,

    /// Update or delete was requested without a row identity
    #[error("Invalid payload: {0} requires record_id and primary_key")]
    MissingRowIdentity(String),

    /// Field had the wrong JSON type
    #[error("Invalid payload: field '{field}' {reason}")]
    InvalidField {
        field: &'static str,
        reason: String,
    },
}

impl EnvelopeError {
    /// Create an invalid field error
    pub fn invalid_field(field: &'static str, reason: impl Into<String>) -> Self {
        EnvelopeError::InvalidField {
            field,
            reason: reason.into(),
        }
    }

    /// Whether the payload itself is at fault (as opposed to local serialization)
    pub fn is_invalid_payload(&self) -> bool {
        !matches!(self, EnvelopeError::Serialization(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages_carry_invalid_payload_marker() {
        let errors = [
            EnvelopeError::EmptyBody,
            EnvelopeError::MalformedJson("eof".into()),
            EnvelopeError::MissingField("table"),
            EnvelopeError::UnsupportedMethod("upsert".into()),
            EnvelopeError::MissingData,
            EnvelopeError::MissingRowIdentity("update".into()),
        ];

        for err in errors {
            assert!(err.is_invalid_payload());
            assert!(err.to_string().starts_with("Invalid payload"));
        }
    }

    #[test]
    fn test_serialization_is_not_a_payload_fault() {
        assert!(!EnvelopeError::Serialization("boom".into()).is_invalid_payload());
    }
}
