//! In-process retry ledger.
//!
//! Counts retryable failures per message so a poison message stops cycling
//! through the queue once the ceiling is reached. Messages are identified by
//! a SHA-256 of their body: a redelivery carries the same bytes, including
//! when the publisher never supplied an operation id. Counts are lost on
//! restart, which only grants a message a fresh set of attempts.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use sha2::{Digest, Sha256};

/// First pause before a failed message goes back to the queue
pub const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_millis(500);

/// Longest pause between two attempts
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Ledger key of a message body
pub fn message_key(body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(body);
    format!("{:x}", hasher.finalize())
}

/// What to do with a message that just failed with a retryable error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Return it to the queue; `attempt` failures seen so far
    Requeue { attempt: u32 },
    /// Ceiling exceeded; move it to the dead-letter queue
    DeadLetter { attempt: u32 },
}

impl RetryDecision {
    pub fn attempt(&self) -> u32 {
        match self {
            RetryDecision::Requeue { attempt } | RetryDecision::DeadLetter { attempt } => *attempt,
        }
    }
}

/// Exponential pause applied before a retryable failure is requeued.
///
/// Attempt `n` waits `initial * 2^(n-1)`, capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryBackoff {
    pub initial: Duration,
    pub max: Duration,
}

impl RetryBackoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self { initial, max }
    }

    /// No pause at all
    pub fn none() -> Self {
        Self::new(Duration::ZERO, Duration::ZERO)
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.initial
            .checked_mul(1u32 << exponent)
            .map_or(self.max, |delay| delay.min(self.max))
    }

    /// Sum of the pauses a message sits through before it is dead-lettered
    pub fn budget(&self, max_retries: u32) -> Duration {
        (1..=max_retries).fold(Duration::ZERO, |total, attempt| {
            total.saturating_add(self.delay(attempt))
        })
    }
}

impl Default for RetryBackoff {
    fn default() -> Self {
        Self::new(DEFAULT_INITIAL_BACKOFF, DEFAULT_MAX_BACKOFF)
    }
}

/// Retryable-failure counts keyed by [`message_key`]
#[derive(Debug)]
pub struct RetryLedger {
    max_retries: u32,
    failures: Mutex<HashMap<String, u32>>,
}

impl RetryLedger {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            failures: Mutex::new(HashMap::new()),
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Count one more failure and decide.
    ///
    /// Up to `max_retries` failures are requeued; every later one
    /// dead-letters until `clear` is called.
    pub fn record_failure(&self, key: &str) -> RetryDecision {
        let mut failures = self.lock();
        let count = failures.entry(key.to_string()).or_insert(0);
        *count = count.saturating_add(1);
        let attempt = *count;

        if attempt > self.max_retries {
            RetryDecision::DeadLetter { attempt }
        } else {
            RetryDecision::Requeue { attempt }
        }
    }

    /// Forget a message (it reached a final state)
    pub fn clear(&self, key: &str) {
        self.lock().remove(key);
    }

    pub fn failures(&self, key: &str) -> u32 {
        self.lock().get(key).copied().unwrap_or(0)
    }

    /// Messages currently being retried
    pub fn tracked(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, u32>> {
        self.failures
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requeues_until_ceiling_then_dead_letters() {
        let ledger = RetryLedger::new(2);

        assert_eq!(ledger.record_failure("op_1"), RetryDecision::Requeue { attempt: 1 });
        assert_eq!(ledger.record_failure("op_1"), RetryDecision::Requeue { attempt: 2 });
        assert_eq!(ledger.record_failure("op_1"), RetryDecision::DeadLetter { attempt: 3 });

        // Still over the ceiling until the message is cleared
        assert_eq!(ledger.record_failure("op_1"), RetryDecision::DeadLetter { attempt: 4 });
        ledger.clear("op_1");
        assert_eq!(ledger.tracked(), 0);
    }

    #[test]
    fn test_zero_ceiling_dead_letters_first_failure() {
        let ledger = RetryLedger::new(0);
        assert_eq!(ledger.record_failure("op_1"), RetryDecision::DeadLetter { attempt: 1 });
    }

    #[test]
    fn test_messages_counted_independently() {
        let ledger = RetryLedger::new(3);
        ledger.record_failure("op_1");
        ledger.record_failure("op_1");
        ledger.record_failure("op_2");

        assert_eq!(ledger.failures("op_1"), 2);
        assert_eq!(ledger.failures("op_2"), 1);

        ledger.clear("op_1");
        assert_eq!(ledger.failures("op_1"), 0);
        assert_eq!(ledger.tracked(), 1);
    }

    #[test]
    fn test_message_key_is_stable_per_body() {
        let body = br#"{"database":"gate","table":"notes","method":"create","data":{"t":1}}"#;

        assert_eq!(message_key(body), message_key(body));
        assert_ne!(message_key(body), message_key(b"{}"));
        assert_eq!(message_key(body).len(), 64);
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let backoff = RetryBackoff::new(Duration::from_millis(100), Duration::from_millis(500));

        assert_eq!(backoff.delay(1), Duration::from_millis(100));
        assert_eq!(backoff.delay(2), Duration::from_millis(200));
        assert_eq!(backoff.delay(3), Duration::from_millis(400));
        assert_eq!(backoff.delay(4), Duration::from_millis(500));
        assert_eq!(backoff.delay(u32::MAX), Duration::from_millis(500));
        assert_eq!(backoff.budget(3), Duration::from_millis(700));
    }

    #[test]
    fn test_default_backoff_outlasts_short_outages() {
        let backoff = RetryBackoff::default();
        assert_eq!(backoff.delay(1), DEFAULT_INITIAL_BACKOFF);
        assert!(backoff.budget(5) >= Duration::from_secs(15));
        assert_eq!(RetryBackoff::none().delay(3), Duration::ZERO);
    }
}
