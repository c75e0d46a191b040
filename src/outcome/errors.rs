//! # Outcome Reporter Errors

use std::io;

use thiserror::Error;

/// Result type for outcome logging and alerting
pub type OutcomeResult<T> = Result<T, OutcomeError>;

/// Outcome reporting errors
///
/// Never fatal: a failed log line or alert must not change how a message
/// is settled.
#[derive(Debug, Error)]
pub enum OutcomeError {
    /// Outcome log could not be written
    #[error("Outcome log I/O failed: {0}")]
    Io(#[from] io::Error),

    /// Record could not be serialized
    #[error("Outcome record serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Alert could not be built or delivered
    #[error("Alert delivery failed: {0}")]
    Alert(String),
}
