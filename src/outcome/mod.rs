//! # Outcome Reporter
//!
//! Observes every terminal state of the replication worker:
//! - **Log**: durable, append-only, one file per day per category
//! - **Alerts**: best-effort operator notification on failure
//!
//! Neither side can change how a message is settled.

mod alert;
mod errors;
mod log;
mod record;

pub use alert::{
    Alert, AlertConfig, AlertDispatcher, AlertFailure, AlertFailures, AlertSender,
    MemoryAlertSender, SmtpAlertSender,
};
pub use errors::{OutcomeError, OutcomeResult};
pub use log::{DailyFileOutcomeLog, MemoryOutcomeLog, OutcomeLog, CONSUMER_CATEGORY};
pub use record::{Disposition, OutcomeKind, OutcomeRecord};
