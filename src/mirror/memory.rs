//! In-memory mirror store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use super::errors::{MirrorError, MirrorResult};
use super::identifier::validate_identifier;
use super::{MirrorStore, Predicate};
use crate::envelope::Row;

#[derive(Debug, Default)]
struct MemoryTable {
    /// Column that receives a generated UUID when an insert omits it
    primary_key: Option<String>,
    rows: Vec<Row>,
}

#[derive(Debug, Default)]
struct MirrorState {
    tables: HashMap<String, MemoryTable>,
    statements: Vec<String>,
}

/// Mirror store holding tables in memory; clones share state
#[derive(Debug, Clone, Default)]
pub struct MemoryMirror {
    state: Arc<Mutex<MirrorState>>,
    unavailable: Arc<AtomicBool>,
}

impl MemoryMirror {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a table; `primary_key` columns are auto-generated when absent
    pub fn with_table(self, name: &str, primary_key: Option<&str>) -> Self {
        self.lock().tables.insert(
            name.to_string(),
            MemoryTable {
                primary_key: primary_key.map(str::to_string),
                rows: Vec::new(),
            },
        );
        self
    }

    /// Simulate an outage; every call fails with `Unavailable` while unset
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.lock()
            .tables
            .get(table)
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }

    pub fn row_count(&self, table: &str) -> usize {
        self.lock().tables.get(table).map(|t| t.rows.len()).unwrap_or(0)
    }

    /// First row matching the predicate
    pub fn find(&self, table: &str, predicate: &Predicate) -> Option<Row> {
        self.lock()
            .tables
            .get(table)
            .and_then(|t| t.rows.iter().find(|r| predicate.matches(r)).cloned())
    }

    /// Raw statements passed to `execute`, in order
    pub fn executed_statements(&self) -> Vec<String> {
        self.lock().statements.clone()
    }

    fn lock(&self) -> MutexGuard<'_, MirrorState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn ensure_available(&self) -> MirrorResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(MirrorError::Unavailable(
                "connection refused".to_string(),
            ));
        }
        Ok(())
    }
}

fn validate_columns(table: &str, data: &Row) -> MirrorResult<()> {
    validate_identifier(table)?;
    data.keys().try_for_each(|column| validate_identifier(column))
}

#[async_trait]
impl MirrorStore for MemoryMirror {
    async fn insert(&self, table: &str, data: &Row) -> MirrorResult<Vec<Row>> {
        self.ensure_available()?;
        validate_columns(table, data)?;

        let mut state = self.lock();
        let target = state
            .tables
            .get_mut(table)
            .ok_or_else(|| MirrorError::TableNotFound(table.to_string()))?;

        let mut row = data.clone();
        if let Some(pk) = &target.primary_key {
            let key = row
                .entry(pk.clone())
                .or_insert_with(|| Value::String(Uuid::new_v4().to_string()))
                .clone();
            if target.rows.iter().any(|r| r.get(pk) == Some(&key)) {
                return Err(MirrorError::statement(
                    format!("duplicate key value violates unique constraint on {}.{}", table, pk),
                    None,
                ));
            }
        }

        target.rows.push(row.clone());
        Ok(vec![row])
    }

    async fn update(
        &self,
        table: &str,
        data: &Row,
        predicate: &Predicate,
    ) -> MirrorResult<Vec<Row>> {
        self.ensure_available()?;
        validate_columns(table, data)?;
        validate_identifier(&predicate.column)?;

        let mut state = self.lock();
        let target = state
            .tables
            .get_mut(table)
            .ok_or_else(|| MirrorError::TableNotFound(table.to_string()))?;

        let mut updated = Vec::new();
        for row in target.rows.iter_mut().filter(|r| predicate.matches(r)) {
            for (column, value) in data {
                row.insert(column.clone(), value.clone());
            }
            updated.push(row.clone());
        }
        Ok(updated)
    }

    async fn execute(&self, sql: &str) -> MirrorResult<Vec<Row>> {
        self.ensure_available()?;
        self.lock().statements.push(sql.to_string());
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(pairs: &[(&str, Value)]) -> Row {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[tokio::test]
    async fn test_insert_generates_missing_identity() {
        let mirror = MemoryMirror::new().with_table("companies", Some("company_id"));

        let inserted = mirror
            .insert("companies", &row(&[("company_name", json!("Acme"))]))
            .await
            .unwrap();

        let id = inserted[0]["company_id"].as_str().unwrap();
        assert!(Uuid::parse_str(id).is_ok());
        assert_eq!(mirror.row_count("companies"), 1);
    }

    #[tokio::test]
    async fn test_duplicate_identity_rejected() {
        let mirror = MemoryMirror::new().with_table("companies", Some("company_id"));
        let data = row(&[("company_id", json!("1")), ("company_name", json!("A"))]);

        mirror.insert("companies", &data).await.unwrap();
        let err = mirror.insert("companies", &data).await.unwrap_err();
        assert!(matches!(err, MirrorError::Statement { .. }));
    }

    #[tokio::test]
    async fn test_update_touches_only_matching_rows() {
        let mirror = MemoryMirror::new().with_table("companies", Some("company_id"));
        for id in ["1", "2"] {
            mirror
                .insert("companies", &row(&[("company_id", json!(id)), ("company_name", json!("Old"))]))
                .await
                .unwrap();
        }

        let updated = mirror
            .update(
                "companies",
                &row(&[("company_name", json!("New"))]),
                &Predicate::eq("company_id", "2"),
            )
            .await
            .unwrap();

        assert_eq!(updated.len(), 1);
        let first = mirror.find("companies", &Predicate::eq("company_id", "1")).unwrap();
        assert_eq!(first["company_name"], json!("Old"));
        let second = mirror.find("companies", &Predicate::eq("company_id", "2")).unwrap();
        assert_eq!(second["company_name"], json!("New"));
    }

    #[tokio::test]
    async fn test_outage_and_unknown_table() {
        let mirror = MemoryMirror::new().with_table("companies", None);

        let err = mirror.insert("notes", &row(&[("a", json!(1))])).await.unwrap_err();
        assert!(matches!(err, MirrorError::TableNotFound(_)));

        mirror.set_available(false);
        let err = mirror.execute("SELECT 1").await.unwrap_err();
        assert!(matches!(err, MirrorError::Unavailable(_)));
        assert!(mirror.executed_statements().is_empty());
    }

    #[tokio::test]
    async fn test_bad_column_name_rejected() {
        let mirror = MemoryMirror::new().with_table("companies", None);
        let err = mirror
            .insert("companies", &row(&[("name; --", json!(1))]))
            .await
            .unwrap_err();
        assert!(matches!(err, MirrorError::InvalidIdentifier { .. }));
    }
}
