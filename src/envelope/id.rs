//! Operation identifiers.

use chrono::Utc;
use rand::distributions::Alphanumeric;
use rand::Rng;

const SUFFIX_LEN: usize = 8;

/// Generate a fresh operation id: `op_<unix millis>_<random suffix>`
///
/// Unique per publish attempt. Used to correlate log lines and to spot
/// duplicate deliveries; nothing enforces uniqueness downstream.
pub fn new_operation_id() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(SUFFIX_LEN)
        .map(|b| char::from(b).to_ascii_lowercase())
        .collect();

    format!("op_{}_{}", Utc::now().timestamp_millis(), suffix)
}
