//! Query-related data models.
//!
//! This module defines bind parameters and the row representation returned by
//! the executor.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// A result row: column name to JSON value.
pub type Row = serde_json::Map<String, JsonValue>;

/// A positional bind parameter.
///
/// Values are always bound by the driver, never interpolated into SQL text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum QueryParam {
    /// NULL value
    Null,
    /// Boolean value
    Bool(bool),
    /// Integer value (stored as i64 for maximum range)
    Int(i64),
    /// Floating point value
    Float(f64),
    /// String value
    String(String),
    /// Binary data, serialized as base64. JSON input never produces this
    /// variant: an untagged string always deserializes as `String`.
    #[serde(serialize_with = "base64_bytes::serialize", skip_deserializing)]
    Bytes(Vec<u8>),
}

impl QueryParam {
    /// Get the type name of this parameter for debugging.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::String(_) => "string",
            Self::Bytes(_) => "bytes",
        }
    }
}

impl From<bool> for QueryParam {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for QueryParam {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<i32> for QueryParam {
    fn from(v: i32) -> Self {
        Self::Int(v.into())
    }
}

impl From<f64> for QueryParam {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for QueryParam {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for QueryParam {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<Vec<u8>> for QueryParam {
    fn from(v: Vec<u8>) -> Self {
        Self::Bytes(v)
    }
}

impl<T: Into<QueryParam>> From<Option<T>> for QueryParam {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Self::Null)
    }
}

/// Base64 serialization for binary parameters.
mod base64_bytes {
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    use serde::{Serialize, Serializer};

    pub fn serialize<S>(bytes: &Vec<u8>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        STANDARD.encode(bytes).serialize(serializer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_param_types() {
        assert_eq!(QueryParam::Null.type_name(), "null");
        assert_eq!(QueryParam::Int(42).type_name(), "int");
        assert_eq!(QueryParam::from("hello").type_name(), "string");
        assert_eq!(QueryParam::from(vec![1u8, 2]).type_name(), "bytes");
    }

    #[test]
    fn test_option_conversion() {
        assert_eq!(QueryParam::from(None::<i64>), QueryParam::Null);
        assert_eq!(QueryParam::from(Some(7)), QueryParam::Int(7));
    }

    #[test]
    fn test_deserialize_untagged() {
        let params: Vec<QueryParam> =
            serde_json::from_str(r#"[null, true, 3, 1.5, "word"]"#).unwrap();
        assert_eq!(
            params,
            vec![
                QueryParam::Null,
                QueryParam::Bool(true),
                QueryParam::Int(3),
                QueryParam::Float(1.5),
                QueryParam::String("word".to_string()),
            ]
        );
    }

    #[test]
    fn test_bytes_serialize_as_base64_and_read_back_as_string() {
        let json = serde_json::to_string(&QueryParam::from(b"hi".to_vec())).unwrap();
        assert_eq!(json, r#""aGk=""#);
        let back: QueryParam = serde_json::from_str(&json).unwrap();
        assert_eq!(back, QueryParam::String("aGk=".to_string()));
    }
}
