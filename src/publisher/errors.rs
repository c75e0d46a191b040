//! # Publisher Errors

use thiserror::Error;

use crate::broker::BrokerError;
use crate::envelope::EnvelopeError;

/// Result type for publish operations
pub type PublishResult<T> = Result<T, PublishError>;

/// Publish failures, always surfaced to the caller
///
/// The caller's own mutation is never rolled back here; deciding whether a
/// failed publish should undo it is up to the caller.
#[derive(Debug, Clone, Error)]
pub enum PublishError {
    /// Request failed a precondition; nothing reached the broker
    #[error("Publish rejected: {0}")]
    Precondition(#[from] EnvelopeError),

    /// Broker unreachable or refused the publish
    #[error("Publish failed: {0}")]
    Broker(#[from] BrokerError),
}

impl PublishError {
    /// Whether the broker was never contacted
    pub fn is_precondition(&self) -> bool {
        matches!(self, PublishError::Precondition(_))
    }
}
