//! # Replication Worker
//!
//! Subscribes to the replication queue and applies each operation envelope
//! to the mirror store.
//!
//! ## Message lifecycle
//!
//! ```text
//! Received -> Validating -> Executing -> Acked
//!                  |            |------> NackedRequeue   (retryable, under the ceiling)
//!                  |            |------> DeadLettered    (retryable, ceiling exceeded)
//!                  '------------'------> NackedNoRequeue (payload can never succeed)
//! ```
//!
//! Every terminal state appends one outcome record. Retryable failures also
//! raise an operator alert; alerting never changes how a message is settled.
//! A message that failed with a retryable error is held for an exponential
//! backoff before it is requeued, so a short store outage is ridden out
//! instead of burning through the retry ceiling.
//!
//! ## Concurrency
//!
//! The broker hands over at most `prefetch` unacknowledged deliveries; each
//! runs in its own task. Deliveries touching the same row are applied in
//! the order they were received.
//!
//! On shutdown, running handlers get `shutdown_grace` to settle; any still
//! running after that are aborted and their deliveries return to the queue
//! when the channel closes.

mod errors;
mod ledger;
mod row_lock;
mod worker;

use std::fmt;
use std::time::Duration;

use crate::mirror::SoftDeleteColumns;
use crate::outcome::Disposition;

pub use errors::{ConsumerError, ConsumerResult};
pub use ledger::{
    message_key, RetryBackoff, RetryDecision, RetryLedger, DEFAULT_INITIAL_BACKOFF,
    DEFAULT_MAX_BACKOFF,
};
pub use row_lock::{RowGuard, RowKey, RowLocks, RowTurn};
pub use worker::ReplicationWorker;

/// Unacknowledged deliveries the broker may hand over at once
pub const DEFAULT_PREFETCH: u16 = 5;

/// Retryable failures tolerated per operation before dead-lettering
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Consumer tag announced to the broker
pub const DEFAULT_CONSUMER_TAG: &str = "gate-replicator";

/// How long running handlers may take to settle after shutdown
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Where a message is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageState {
    Received,
    Validating,
    Executing,
    Settled(Disposition),
}

impl MessageState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, MessageState::Settled(_))
    }
}

impl fmt::Display for MessageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageState::Received => write!(f, "received"),
            MessageState::Validating => write!(f, "validating"),
            MessageState::Executing => write!(f, "executing"),
            MessageState::Settled(disposition) => write!(f, "{}", disposition),
        }
    }
}

/// Worker tuning
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSettings {
    pub prefetch: u16,
    pub max_retries: u32,
    pub retry_backoff: RetryBackoff,
    pub shutdown_grace: Duration,
    pub consumer_tag: String,
    pub soft_delete: SoftDeleteColumns,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            prefetch: DEFAULT_PREFETCH,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_backoff: RetryBackoff::default(),
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            consumer_tag: DEFAULT_CONSUMER_TAG.to_string(),
            soft_delete: SoftDeleteColumns::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_state_display() {
        assert_eq!(MessageState::Validating.to_string(), "validating");
        assert_eq!(
            MessageState::Settled(Disposition::NackedRequeue).to_string(),
            "nacked_requeue"
        );
        assert!(MessageState::Settled(Disposition::Acked).is_terminal());
        assert!(!MessageState::Executing.is_terminal());
    }

    #[test]
    fn test_default_settings() {
        let settings = WorkerSettings::default();
        assert_eq!(settings.prefetch, 5);
        assert_eq!(settings.retry_backoff.initial, DEFAULT_INITIAL_BACKOFF);
        assert_eq!(settings.shutdown_grace, DEFAULT_SHUTDOWN_GRACE);
        assert_eq!(settings.soft_delete.marker, "is_delete");
    }
}
