//! Mutation methods carried by an envelope.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::errors::EnvelopeError;

/// Kind of mutation to replay on the mirror
///
/// Parsing is case-insensitive; the wire form is always lowercase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", try_from = "String")]
pub enum Method {
    /// Insert a new row
    Create,
    /// Modify an existing row
    Update,
    /// Soft-delete an existing row
    Delete,
}

impl Method {
    /// Returns the wire representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Create => "create",
            Method::Update => "update",
            Method::Delete => "delete",
        }
    }

    /// Whether this method targets an existing row
    pub fn requires_row_identity(&self) -> bool {
        matches!(self, Method::Update | Method::Delete)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Method {
    type Err = EnvelopeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "create" => Ok(Method::Create),
            "update" => Ok(Method::Update),
            "delete" => Ok(Method::Delete),
            "" => Err(EnvelopeError::MissingField("method")),
            _ => Err(EnvelopeError::UnsupportedMethod(s.to_string())),
        }
    }
}

impl TryFrom<String> for Method {
    type Error = EnvelopeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_is_case_insensitive() {
        assert_eq!("CREATE".parse::<Method>().unwrap(), Method::Create);
        assert_eq!("Update".parse::<Method>().unwrap(), Method::Update);
        assert_eq!(" delete ".parse::<Method>().unwrap(), Method::Delete);
    }

    #[test]
    fn test_unknown_method_rejected() {
        assert_eq!(
            "upsert".parse::<Method>(),
            Err(EnvelopeError::UnsupportedMethod("upsert".to_string()))
        );
        assert_eq!("".parse::<Method>(), Err(EnvelopeError::MissingField("method")));
    }

    #[test]
    fn test_wire_form_is_lowercase() {
        let json = serde_json::to_string(&Method::Update).unwrap();
        assert_eq!(json, "\"update\"");

        let parsed: Method = serde_json::from_str("\"DELETE\"").unwrap();
        assert_eq!(parsed, Method::Delete);
    }
}
