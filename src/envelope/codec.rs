//! # Operation Envelope
//!
//! The one structure that crosses the broker. Publisher and consumer share
//! the same validation so a message that leaves the publisher is one the
//! consumer accepts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::errors::{EnvelopeError, EnvelopeResult};
use super::id::new_operation_id;
use super::method::Method;

/// Column name to value mapping
pub type Row = serde_json::Map<String, Value>;

/// A mutation as handed over by the originating code
///
/// Unvalidated; `OperationEnvelope::from_request` checks it.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct MutationRequest {
    pub database: String,
    pub table: String,
    pub method: String,
    pub data: Option<Row>,
    pub query_sql: Option<String>,
    pub record_id: Option<String>,
    pub primary_key: Option<String>,
    pub primary_key_value: Option<Value>,
    pub result: Option<Value>,
}

impl MutationRequest {
    /// Create a request for `method` against `database.table`
    pub fn new(
        database: impl Into<String>,
        table: impl Into<String>,
        method: impl Into<String>,
    ) -> Self {
        Self {
            database: database.into(),
            table: table.into(),
            method: method.into(),
            ..Default::default()
        }
    }

    /// Set column data.
    pub fn with_data(mut self, data: Row) -> Self {
        self.data = Some(data);
        self
    }

    /// Set a pre-rendered statement that replaces data-driven execution.
    pub fn with_query_sql(mut self, sql: impl Into<String>) -> Self {
        self.query_sql = Some(sql.into());
        self
    }

    /// Identify the target row by primary-key column and value.
    pub fn with_record(mut self, primary_key: impl Into<String>, record_id: impl Into<String>) -> Self {
        self.primary_key = Some(primary_key.into());
        self.record_id = Some(record_id.into());
        self
    }

    /// Set the identity the mirror row must adopt on create.
    pub fn with_primary_key_value(mut self, value: impl Into<Value>) -> Self {
        self.primary_key_value = Some(value.into());
        self
    }

    /// Attach a snapshot of the row as seen by the source system.
    pub fn with_result(mut self, result: Value) -> Self {
        self.result = Some(result);
        self
    }
}

/// Validated envelope describing one mutation intent
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OperationEnvelope {
    pub operation_id: String,
    pub database: String,
    pub table: String,
    pub method: Method,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Row>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query_sql: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub primary_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub primary_key_value: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    pub timestamp: DateTime<Utc>,
}

/// Lenient wire shape; every field optional so validation can name what is missing.
#[derive(Debug, Deserialize)]
struct WireEnvelope {
    #[serde(default)]
    operation_id: Option<String>,
    #[serde(default)]
    database: Option<String>,
    #[serde(default)]
    table: Option<String>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    data: Option<Row>,
    #[serde(default)]
    query_sql: Option<String>,
    #[serde(default)]
    record_id: Option<Value>,
    #[serde(default)]
    primary_key: Option<String>,
    #[serde(default)]
    primary_key_value: Option<Value>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    timestamp: Option<DateTime<Utc>>,
}

impl OperationEnvelope {
    /// Build an envelope from a request, stamping a fresh id and timestamp.
    ///
    /// Fails without side effects when the request is incomplete.
    pub fn from_request(request: MutationRequest) -> EnvelopeResult<Self> {
        let method: Method = request.method.parse()?;

        let envelope = Self {
            operation_id: new_operation_id(),
            database: request.database,
            table: request.table,
            method,
            data: request.data,
            query_sql: non_blank(request.query_sql),
            record_id: non_blank(request.record_id),
            primary_key: non_blank(request.primary_key),
            primary_key_value: request.primary_key_value.filter(|v| !v.is_null()),
            result: request.result,
            timestamp: Utc::now(),
        };

        envelope.validate()?;
        Ok(envelope)
    }

    /// Check the method-specific invariants.
    pub fn validate(&self) -> EnvelopeResult<()> {
        if self.database.trim().is_empty() {
            return Err(EnvelopeError::MissingField("database"));
        }
        if self.table.trim().is_empty() {
            return Err(EnvelopeError::MissingField("table"));
        }

        if self.method.requires_row_identity() {
            if self.record_id.is_none() || self.primary_key.is_none() {
                return Err(EnvelopeError::MissingRowIdentity(self.method.to_string()));
            }
        } else if !self.data.as_ref().is_some_and(|d| !d.is_empty()) {
            return Err(EnvelopeError::MissingData);
        }

        Ok(())
    }

    /// Serialize to the UTF-8 JSON wire form.
    pub fn encode(&self) -> EnvelopeResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| EnvelopeError::Serialization(e.to_string()))
    }

    /// Parse and validate a message body.
    ///
    /// A missing operation id is replaced with a fresh one so the message can
    /// still be correlated in logs.
    pub fn decode(body: &[u8]) -> EnvelopeResult<Self> {
        if body.iter().all(u8::is_ascii_whitespace) {
            return Err(EnvelopeError::EmptyBody);
        }

        let wire: WireEnvelope = serde_json::from_slice(body)
            .map_err(|e| EnvelopeError::MalformedJson(e.to_string()))?;

        let database = non_blank(wire.database).ok_or(EnvelopeError::MissingField("database"))?;
        let table = non_blank(wire.table).ok_or(EnvelopeError::MissingField("table"))?;
        let method: Method = non_blank(wire.method)
            .ok_or(EnvelopeError::MissingField("method"))?
            .parse()?;

        let envelope = Self {
            operation_id: non_blank(wire.operation_id).unwrap_or_else(new_operation_id),
            database,
            table,
            method,
            data: wire.data,
            query_sql: non_blank(wire.query_sql),
            record_id: normalize_record_id(wire.record_id)?,
            primary_key: non_blank(wire.primary_key),
            primary_key_value: wire.primary_key_value.filter(|v| !v.is_null()),
            result: wire.result,
            timestamp: wire.timestamp.unwrap_or_else(Utc::now),
        };

        envelope.validate()?;
        Ok(envelope)
    }

    /// Whether a pre-rendered statement replaces data-driven execution
    pub fn has_query_sql(&self) -> bool {
        self.query_sql.is_some()
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.trim().is_empty())
}

/// Record ids arrive as strings or numbers; keep the string form.
fn normalize_record_id(value: Option<Value>) -> EnvelopeResult<Option<String>> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(non_blank(Some(s))),
        Some(Value::Number(n)) => Ok(Some(n.to_string())),
        Some(other) => Err(EnvelopeError::invalid_field(
            "record_id",
            format!("must be a string or number, got {}", json_kind(&other)),
        )),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn company_data() -> Row {
        let mut data = Row::new();
        data.insert("company_name".into(), json!("Acme"));
        data
    }

    #[test]
    fn test_create_requires_data() {
        let request = MutationRequest::new("gate_db", "companies", "create");
        assert_eq!(
            OperationEnvelope::from_request(request),
            Err(EnvelopeError::MissingData)
        );

        let request = MutationRequest::new("gate_db", "companies", "create").with_data(Row::new());
        assert_eq!(
            OperationEnvelope::from_request(request),
            Err(EnvelopeError::MissingData)
        );
    }

    #[test]
    fn test_update_and_delete_require_row_identity() {
        for method in ["update", "delete"] {
            let mut request =
                MutationRequest::new("gate_db", "companies", method).with_data(company_data());
            request.record_id = Some("abc".into());
            assert_eq!(
                OperationEnvelope::from_request(request),
                Err(EnvelopeError::MissingRowIdentity(method.to_string()))
            );

            let mut request = MutationRequest::new("gate_db", "companies", method);
            request.primary_key = Some("company_id".into());
            assert!(OperationEnvelope::from_request(request).is_err());
        }
    }

    #[test]
    fn test_blank_target_rejected() {
        let request = MutationRequest::new(" ", "companies", "create").with_data(company_data());
        assert_eq!(
            OperationEnvelope::from_request(request),
            Err(EnvelopeError::MissingField("database"))
        );

        let request = MutationRequest::new("gate_db", "", "create").with_data(company_data());
        assert_eq!(
            OperationEnvelope::from_request(request),
            Err(EnvelopeError::MissingField("table"))
        );
    }

    #[test]
    fn test_method_normalized_to_lowercase() {
        let request = MutationRequest::new("gate_db", "companies", "CREATE").with_data(company_data());
        let envelope = OperationEnvelope::from_request(request).unwrap();
        assert_eq!(envelope.method, Method::Create);

        let body = String::from_utf8(envelope.encode().unwrap()).unwrap();
        assert!(body.contains("\"method\":\"create\""));
    }

    #[test]
    fn test_encode_omits_absent_fields() {
        let request = MutationRequest::new("gate_db", "companies", "create")
            .with_data(company_data())
            .with_primary_key_value("11111111-1111-1111-1111-111111111111");
        let envelope = OperationEnvelope::from_request(request).unwrap();

        let value: Value = serde_json::from_slice(&envelope.encode().unwrap()).unwrap();
        assert_eq!(
            value["primary_key_value"],
            json!("11111111-1111-1111-1111-111111111111")
        );
        assert!(value.get("query_sql").is_none());
        assert!(value.get("record_id").is_none());
        assert!(value["operation_id"].as_str().unwrap().starts_with("op_"));
    }

    #[test]
    fn test_decode_rejects_empty_and_malformed_bodies() {
        assert_eq!(OperationEnvelope::decode(b""), Err(EnvelopeError::EmptyBody));
        assert_eq!(OperationEnvelope::decode(b"  \n"), Err(EnvelopeError::EmptyBody));
        assert!(matches!(
            OperationEnvelope::decode(b"{not json"),
            Err(EnvelopeError::MalformedJson(_))
        ));
        assert!(matches!(
            OperationEnvelope::decode(b"[1,2,3]"),
            Err(EnvelopeError::MalformedJson(_))
        ));
    }

    #[test]
    fn test_decode_reports_missing_target_fields() {
        let body = json!({"table": "companies", "method": "create", "data": {"a": 1}});
        assert_eq!(
            OperationEnvelope::decode(body.to_string().as_bytes()),
            Err(EnvelopeError::MissingField("database"))
        );

        let body = json!({"database": "gate_db", "table": "companies", "data": {"a": 1}});
        assert_eq!(
            OperationEnvelope::decode(body.to_string().as_bytes()),
            Err(EnvelopeError::MissingField("method"))
        );
    }

    #[test]
    fn test_decode_unsupported_method() {
        let body = json!({"database": "gate_db", "table": "companies", "method": "truncate"});
        assert_eq!(
            OperationEnvelope::decode(body.to_string().as_bytes()),
            Err(EnvelopeError::UnsupportedMethod("truncate".into()))
        );
    }

    #[test]
    fn test_decode_numeric_record_id() {
        let body = json!({
            "operation_id": "op_1_abcdefgh",
            "database": "gate_db",
            "table": "departments",
            "method": "Update",
            "record_id": 42,
            "primary_key": "department_id",
            "data": {"name": "Ops"},
            "timestamp": "2024-05-01T10:00:00Z"
        });

        let envelope = OperationEnvelope::decode(body.to_string().as_bytes()).unwrap();
        assert_eq!(envelope.operation_id, "op_1_abcdefgh");
        assert_eq!(envelope.method, Method::Update);
        assert_eq!(envelope.record_id.as_deref(), Some("42"));
        assert_eq!(envelope.timestamp.to_rfc3339(), "2024-05-01T10:00:00+00:00");
    }

    #[test]
    fn test_decode_rejects_structured_record_id() {
        let body = json!({
            "database": "gate_db",
            "table": "companies",
            "method": "delete",
            "record_id": {"id": 1},
            "primary_key": "company_id"
        });
        assert!(matches!(
            OperationEnvelope::decode(body.to_string().as_bytes()),
            Err(EnvelopeError::InvalidField { field: "record_id", .. })
        ));
    }

    #[test]
    fn test_decode_assigns_missing_operation_id() {
        let body = json!({
            "database": "gate_db",
            "table": "companies",
            "method": "create",
            "data": {"company_name": "Acme"}
        });
        let envelope = OperationEnvelope::decode(body.to_string().as_bytes()).unwrap();
        assert!(envelope.operation_id.starts_with("op_"));
    }

    #[test]
    fn test_published_envelope_decodes_identically() {
        let request = MutationRequest::new("gate_db", "companies", "update")
            .with_record("company_id", "11111111-1111-1111-1111-111111111111")
            .with_data(company_data())
            .with_result(json!({"company_name": "Acme"}));
        let envelope = OperationEnvelope::from_request(request).unwrap();

        let decoded = OperationEnvelope::decode(&envelope.encode().unwrap()).unwrap();
        assert_eq!(decoded, envelope);
    }
}
