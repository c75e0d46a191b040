//! # Primary-Key Registry
//!
//! Maps table names to their primary-key column so a mirror row created by
//! replication adopts the identity assigned by the source-of-truth system.
//!
//! Built once at startup and never mutated; the worker holds it behind an
//! `Arc` and only reads it.

use std::collections::HashMap;

use serde_json::Value;
use tracing::{debug, warn};

use crate::envelope::Row;

/// Result of applying a source identity to create data
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeySync {
    /// `data[column]` now holds the source identity
    Applied { column: String },
    /// Table is not registered; the mirror will generate its own identity
    Unregistered,
}

/// Immutable table -> primary-key column lookup
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrimaryKeyRegistry {
    columns: HashMap<String, String>,
}

impl PrimaryKeyRegistry {
    /// Build from `(table, column)` pairs
    pub fn new<I, T, C>(entries: I) -> Self
    where
        I: IntoIterator<Item = (T, C)>,
        T: Into<String>,
        C: Into<String>,
    {
        Self {
            columns: entries
                .into_iter()
                .map(|(table, column)| (table.into(), column.into()))
                .collect(),
        }
    }

    /// Tables of the administrative backend
    pub fn gate_defaults() -> Self {
        Self::new([
            ("companies", "company_id"),
            ("departments", "department_id"),
            ("candidates", "candidate_id"),
            ("interviews", "interview_id"),
            ("documents", "document_id"),
        ])
    }

    /// Primary-key column for a table
    pub fn column_for(&self, table: &str) -> Option<&str> {
        self.columns.get(table).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Force `data` to carry the source identity for `table`.
    ///
    /// Unregistered tables leave `data` untouched; the two systems then
    /// diverge for that row, which is tolerated.
    pub fn synchronize(&self, table: &str, data: &mut Row, value: &Value) -> KeySync {
        match self.column_for(table) {
            Some(column) => {
                debug!(table, column, value = %value, "primary key synchronized");
                data.insert(column.to_string(), value.clone());
                KeySync::Applied {
                    column: column.to_string(),
                }
            }
            None => {
                warn!(table, "table has no registered primary key; mirror identity will diverge");
                KeySync::Unregistered
            }
        }
    }
}
