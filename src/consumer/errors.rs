//! # Consumer Errors

use thiserror::Error;

use crate::broker::BrokerError;
use crate::envelope::EnvelopeError;
use crate::mirror::MirrorError;

/// Result type for the replication worker
pub type ConsumerResult<T> = Result<T, ConsumerError>;

/// Replication worker errors
///
/// Classification lives on the type: payload problems are final, and so is
/// a table or column name the mirror refuses to quote. Everything else that
/// went wrong while executing may succeed on another attempt.
#[derive(Debug, Error)]
pub enum ConsumerError {
    /// Body could not be turned into a valid envelope
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),

    /// Mirror store rejected or could not run the mutation
    #[error(transparent)]
    Mirror(#[from] MirrorError),

    /// Broker failed during startup, settlement or dead-lettering
    #[error(transparent)]
    Broker(#[from] BrokerError),
}

impl ConsumerError {
    /// Whether redelivering the same message could succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            ConsumerError::Envelope(e) => !e.is_invalid_payload(),
            ConsumerError::Mirror(MirrorError::InvalidIdentifier { .. }) => false,
            ConsumerError::Mirror(_) | ConsumerError::Broker(_) => true,
        }
    }
}
