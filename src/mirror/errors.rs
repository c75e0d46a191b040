//! # Mirror Store Errors

use thiserror::Error;

/// Result type for mirror store operations
pub type MirrorResult<T> = Result<T, MirrorError>;

/// Mirror database errors
#[derive(Debug, Clone, Error)]
pub enum MirrorError {
    /// Store could not be reached (connect, pool checkout)
    #[error("Mirror store unavailable: {0}")]
    Unavailable(String),

    /// Statement was rejected by the store
    #[error("Mirror statement failed: {message}")]
    Statement {
        message: String,
        sql: Option<String>,
    },

    /// Table or column name is not a plain SQL identifier
    #[error("Invalid SQL identifier '{name}': {reason}")]
    InvalidIdentifier { name: String, reason: String },

    /// Table does not exist on the mirror
    #[error("Mirror table not found: {0}")]
    TableNotFound(String),
}

impl MirrorError {
    /// Create a statement error
    pub fn statement(message: impl Into<String>, sql: Option<&str>) -> Self {
        MirrorError::Statement {
            message: message.into(),
            sql: sql.map(str::to_string),
        }
    }

    /// Create an identifier error
    pub fn invalid_identifier(name: &str, reason: impl Into<String>) -> Self {
        MirrorError::InvalidIdentifier {
            name: name.to_string(),
            reason: reason.into(),
        }
    }
}
