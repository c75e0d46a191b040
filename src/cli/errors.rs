//! CLI-specific error types
//!
//! Every CLI error ends the process with a non-zero exit code.

use std::fmt;
use std::io;

use crate::broker::BrokerError;
use crate::config::ConfigError;
use crate::consumer::ConsumerError;
use crate::mirror::MirrorError;
use crate::publisher::PublishError;

/// CLI error codes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CliErrorCode {
    /// Configuration file error
    ConfigError,
    /// I/O error (stdin/stdout, request file)
    IoError,
    /// Broker unreachable or rejected the topology
    BrokerError,
    /// Mirror store could not be set up
    MirrorError,
    /// Request rejected or not published
    PublishFailed,
    /// Worker stopped abnormally
    ConsumerFailed,
}

impl CliErrorCode {
    /// Get the error code string
    pub fn code(&self) -> &'static str {
        match self {
            Self::ConfigError => "GATE_CLI_CONFIG_ERROR",
            Self::IoError => "GATE_CLI_IO_ERROR",
            Self::BrokerError => "GATE_CLI_BROKER_ERROR",
            Self::MirrorError => "GATE_CLI_MIRROR_ERROR",
            Self::PublishFailed => "GATE_CLI_PUBLISH_FAILED",
            Self::ConsumerFailed => "GATE_CLI_CONSUMER_FAILED",
        }
    }
}

/// CLI error
#[derive(Debug)]
pub struct CliError {
    code: CliErrorCode,
    message: String,
}

impl CliError {
    /// Create a new CLI error
    pub fn new(code: CliErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Config error
    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::new(CliErrorCode::ConfigError, msg)
    }

    /// I/O error
    pub fn io_error(msg: impl Into<String>) -> Self {
        Self::new(CliErrorCode::IoError, msg)
    }

    /// Get the error code
    pub fn code(&self) -> &CliErrorCode {
        &self.code
    }

    /// Get the error code string
    pub fn code_str(&self) -> &'static str {
        self.code.code()
    }

    /// Get the error message
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code.code(), self.message)
    }
}

impl std::error::Error for CliError {}

impl From<io::Error> for CliError {
    fn from(e: io::Error) -> Self {
        Self::io_error(e.to_string())
    }
}

impl From<serde_json::Error> for CliError {
    fn from(e: serde_json::Error) -> Self {
        Self::io_error(format!("JSON error: {}", e))
    }
}

impl From<ConfigError> for CliError {
    fn from(e: ConfigError) -> Self {
        Self::config_error(e.to_string())
    }
}

impl From<BrokerError> for CliError {
    fn from(e: BrokerError) -> Self {
        Self::new(CliErrorCode::BrokerError, e.to_string())
    }
}

impl From<MirrorError> for CliError {
    fn from(e: MirrorError) -> Self {
        Self::new(CliErrorCode::MirrorError, e.to_string())
    }
}

impl From<PublishError> for CliError {
    fn from(e: PublishError) -> Self {
        Self::new(CliErrorCode::PublishFailed, e.to_string())
    }
}

impl From<ConsumerError> for CliError {
    fn from(e: ConsumerError) -> Self {
        match e {
            ConsumerError::Broker(e) => e.into(),
            other => Self::new(CliErrorCode::ConsumerFailed, other.to_string()),
        }
    }
}

/// CLI result type
pub type CliResult<T> = Result<T, CliError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_carries_code() {
        let err = CliError::config_error("broker.queue must not be empty");
        assert_eq!(
            err.to_string(),
            "GATE_CLI_CONFIG_ERROR: broker.queue must not be empty"
        );
    }

    #[test]
    fn test_consumer_broker_failure_maps_to_broker_code() {
        let err: CliError = ConsumerError::Broker(BrokerError::ConnectTimeout(5000)).into();
        assert_eq!(err.code(), &CliErrorCode::BrokerError);
    }
}
