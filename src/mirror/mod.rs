//! # Mirror Store
//!
//! The narrow executor contract the replication worker needs from the
//! mirror database: insert a row, update rows matching a single-column
//! predicate, or run a pre-rendered statement. Results come back as rows
//! the way `RETURNING *` would produce them.
//!
//! Implementations:
//! - `PostgresMirror`: pooled `tokio-postgres` connections
//! - `MemoryMirror`: in-process tables for tests and dry runs

mod errors;
mod identifier;
mod memory;
mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::envelope::Row;

pub use errors::{MirrorError, MirrorResult};
pub use identifier::{quote_identifier, validate_identifier};
pub use memory::MemoryMirror;
pub use postgres::{PostgresMirror, PostgresMirrorConfig};

/// Row selector `column = value`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Predicate {
    pub column: String,
    pub value: String,
}

impl Predicate {
    pub fn eq(column: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            value: value.into(),
        }
    }

    /// Whether a row's column matches, comparing by text form
    pub fn matches(&self, row: &Row) -> bool {
        match row.get(&self.column) {
            Some(Value::String(s)) => *s == self.value,
            Some(Value::Null) | None => false,
            Some(other) => other.to_string() == self.value,
        }
    }
}

/// Column names of the soft-delete convention
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SoftDeleteColumns {
    /// Boolean marker column
    #[serde(default = "default_marker")]
    pub marker: String,

    /// Deletion timestamp column
    #[serde(default = "default_deleted_at")]
    pub deleted_at: String,
}

fn default_marker() -> String {
    "is_delete".to_string()
}

fn default_deleted_at() -> String {
    "delete_at".to_string()
}

impl Default for SoftDeleteColumns {
    fn default() -> Self {
        Self {
            marker: default_marker(),
            deleted_at: default_deleted_at(),
        }
    }
}

impl SoftDeleteColumns {
    /// Build the update that logically deletes a row.
    ///
    /// Auxiliary fields (such as the actor column) are carried over from
    /// `extra`; the marker and timestamp always win.
    pub fn patch(&self, extra: Option<&Row>, now: DateTime<Utc>) -> Row {
        let mut patch = extra.cloned().unwrap_or_default();
        patch.insert(self.marker.clone(), Value::Bool(true));
        patch.insert(self.deleted_at.clone(), Value::String(now.to_rfc3339()));
        patch
    }
}

/// Mirror database executor
#[async_trait]
pub trait MirrorStore: Send + Sync {
    /// Insert one row and return what was stored
    async fn insert(&self, table: &str, data: &Row) -> MirrorResult<Vec<Row>>;

    /// Apply `data` to every row matching `predicate`; returns the updated rows
    async fn update(&self, table: &str, data: &Row, predicate: &Predicate)
        -> MirrorResult<Vec<Row>>;

    /// Run a pre-rendered statement verbatim
    async fn execute(&self, sql: &str) -> MirrorResult<Vec<Row>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_predicate_matches_by_text_form() {
        let mut row = Row::new();
        row.insert("department_id".into(), json!(42));
        row.insert("company_id".into(), json!("abc"));

        assert!(Predicate::eq("department_id", "42").matches(&row));
        assert!(Predicate::eq("company_id", "abc").matches(&row));
        assert!(!Predicate::eq("company_id", "abd").matches(&row));
        assert!(!Predicate::eq("missing", "abc").matches(&row));
    }

    #[test]
    fn test_soft_delete_patch_merges_actor() {
        let columns = SoftDeleteColumns::default();
        let mut extra = Row::new();
        extra.insert("deleted_by".into(), json!("u1"));
        extra.insert("is_delete".into(), json!(false));

        let now = Utc::now();
        let patch = columns.patch(Some(&extra), now);

        assert_eq!(patch["is_delete"], json!(true));
        assert_eq!(patch["delete_at"], json!(now.to_rfc3339()));
        assert_eq!(patch["deleted_by"], json!("u1"));
    }
}
