//! Outcome records and message dispositions.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::envelope::OperationEnvelope;

/// How a delivery was settled with the broker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    /// Applied to the mirror and acknowledged
    Acked,
    /// Discarded; the payload can never succeed
    NackedNoRequeue,
    /// Returned to the queue for another attempt
    NackedRequeue,
    /// Retry ceiling reached; moved to the dead-letter queue
    DeadLettered,
}

impl Disposition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Disposition::Acked => "acked",
            Disposition::NackedNoRequeue => "nacked_no_requeue",
            Disposition::NackedRequeue => "nacked_requeue",
            Disposition::DeadLettered => "dead_lettered",
        }
    }

    /// Outcome-log line prefix
    pub fn kind(&self) -> OutcomeKind {
        match self {
            Disposition::Acked => OutcomeKind::Success,
            Disposition::NackedRequeue | Disposition::DeadLettered => OutcomeKind::Error,
            Disposition::NackedNoRequeue => OutcomeKind::Failed,
        }
    }
}

impl fmt::Display for Disposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Human-readable outcome prefix
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutcomeKind {
    /// Mutation applied
    Success,
    /// Payload rejected; never retried
    Failed,
    /// Execution failure; message requeued or dead-lettered
    Error,
}

impl OutcomeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeKind::Success => "Success",
            OutcomeKind::Failed => "Failed",
            OutcomeKind::Error => "Error",
        }
    }
}

impl fmt::Display for OutcomeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One terminal state of one delivery
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutcomeRecord {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,

    pub disposition: Disposition,

    /// When the outcome was reached
    pub timestamp: DateTime<Utc>,

    /// Rows returned by the mirror on success
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Retryable failures seen so far for this operation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,
}

impl OutcomeRecord {
    /// Record for an envelope that could be decoded
    pub fn for_envelope(envelope: &OperationEnvelope, disposition: Disposition) -> Self {
        Self {
            operation_id: Some(envelope.operation_id.clone()),
            database: Some(envelope.database.clone()),
            table: Some(envelope.table.clone()),
            method: Some(envelope.method.to_string()),
            ..Self::bare(disposition)
        }
    }

    /// Record for a body that never became an envelope
    pub fn bare(disposition: Disposition) -> Self {
        Self {
            operation_id: None,
            database: None,
            table: None,
            method: None,
            disposition,
            timestamp: Utc::now(),
            result: None,
            error: None,
            attempt: None,
        }
    }

    pub fn with_result(mut self, result: Value) -> Self {
        self.result = Some(result);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = Some(attempt);
        self
    }

    pub fn kind(&self) -> OutcomeKind {
        self.disposition.kind()
    }

    /// `[<timestamp>] <Kind>: <json>`
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        Ok(format!(
            "[{}] {}: {}",
            self.timestamp.to_rfc3339(),
            self.kind(),
            serde_json::to_string(self)?
        ))
    }
}
