//! # Broker Errors

use thiserror::Error;

/// Result type for broker operations
pub type BrokerResult<T> = Result<T, BrokerError>;

/// Broker connectivity and channel errors
#[derive(Debug, Clone, Error)]
pub enum BrokerError {
    /// Connect did not finish before the deadline
    #[error("Broker connection timed out after {0} ms")]
    ConnectTimeout(u64),

    /// Connection could not be established or was lost
    #[error("Broker connection failed: {0}")]
    Connection(String),

    /// A channel operation (declare, bind, publish, consume, ack) failed
    #[error("Broker channel error: {0}")]
    Channel(String),

    /// Exchange or queue does not exist
    #[error("Broker entity not found: {0}")]
    NotFound(String),

    /// Channel was already closed
    #[error("Broker channel closed")]
    ChannelClosed,
}

impl From<lapin::Error> for BrokerError {
    fn from(err: lapin::Error) -> Self {
        match err {
            lapin::Error::InvalidChannelState(_) => BrokerError::ChannelClosed,
            lapin::Error::IOError(e) => BrokerError::Connection(e.to_string()),
            lapin::Error::InvalidConnectionState(state) => {
                BrokerError::Connection(format!("invalid connection state: {:?}", state))
            }
            other => BrokerError::Channel(other.to_string()),
        }
    }
}
