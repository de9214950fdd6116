//! Firestore typed values.
//!
//! The REST API wraps every field in a one-key object naming its type
//! (`{"stringValue": "..."}`, `{"mapValue": {"fields": {...}}}`, ...).

use std::collections::BTreeMap;

use callwire_common::{Error, Result};
use serde_json::{json, Map, Value as Json};

/// Top-level or nested field map of a document.
pub type Fields = BTreeMap<String, Value>;

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Integer(i64),
    Double(f64),
    String(String),
    Timestamp(String),
    Map(Fields),
    Array(Vec<Value>),
    /// Bytes, references and geo points; kept verbatim.
    Other(Json),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&Fields> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn from_wire(wire: &Json) -> Result<Self> {
        let obj = wire
            .as_object()
            .ok_or_else(|| Error::serialization(format!("expected typed value, got {wire}")))?;
        let (kind, inner) = obj
            .iter()
            .next()
            .ok_or_else(|| Error::serialization("empty typed value"))?;

        let value = match kind.as_str() {
            "nullValue" => Value::Null,
            "booleanValue" => Value::Bool(
                inner
                    .as_bool()
                    .ok_or_else(|| Error::serialization("booleanValue is not a bool"))?,
            ),
            // 64-bit integers travel as decimal strings.
            "integerValue" => {
                let parsed = match inner {
                    Json::String(s) => s.parse::<i64>().ok(),
                    Json::Number(n) => n.as_i64(),
                    _ => None,
                };
                Value::Integer(
                    parsed.ok_or_else(|| Error::serialization("integerValue is not an i64"))?,
                )
            }
            "doubleValue" => Value::Double(
                inner
                    .as_f64()
                    .ok_or_else(|| Error::serialization("doubleValue is not a number"))?,
            ),
            "stringValue" => Value::String(
                inner
                    .as_str()
                    .ok_or_else(|| Error::serialization("stringValue is not a string"))?
                    .to_string(),
            ),
            "timestampValue" => Value::Timestamp(
                inner
                    .as_str()
                    .ok_or_else(|| Error::serialization("timestampValue is not a string"))?
                    .to_string(),
            ),
            "mapValue" => Value::Map(fields_from_wire(inner.get("fields"))?),
            "arrayValue" => {
                let values = match inner.get("values") {
                    Some(Json::Array(items)) => items
                        .iter()
                        .map(Value::from_wire)
                        .collect::<Result<Vec<_>>>()?,
                    _ => Vec::new(),
                };
                Value::Array(values)
            }
            _ => Value::Other(wire.clone()),
        };
        Ok(value)
    }

    pub fn to_wire(&self) -> Json {
        match self {
            Value::Null => json!({ "nullValue": null }),
            Value::Bool(b) => json!({ "booleanValue": b }),
            Value::Integer(i) => json!({ "integerValue": i.to_string() }),
            Value::Double(d) => json!({ "doubleValue": d }),
            Value::String(s) => json!({ "stringValue": s }),
            Value::Timestamp(t) => json!({ "timestampValue": t }),
            Value::Map(fields) => json!({ "mapValue": { "fields": fields_to_wire(fields) } }),
            Value::Array(values) => {
                let values: Vec<Json> = values.iter().map(Value::to_wire).collect();
                json!({ "arrayValue": { "values": values } })
            }
            Value::Other(raw) => raw.clone(),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<Fields> for Value {
    fn from(fields: Fields) -> Self {
        Value::Map(fields)
    }
}

/// Decode a `fields` object; an absent object is an empty map.
pub fn fields_from_wire(wire: Option<&Json>) -> Result<Fields> {
    match wire {
        None | Some(Json::Null) => Ok(Fields::new()),
        Some(Json::Object(obj)) => obj
            .iter()
            .map(|(k, v)| Ok((k.clone(), Value::from_wire(v)?)))
            .collect(),
        Some(other) => Err(Error::serialization(format!(
            "expected fields object, got {other}"
        ))),
    }
}

pub fn fields_to_wire(fields: &Fields) -> Json {
    let obj: Map<String, Json> = fields
        .iter()
        .map(|(k, v)| (k.clone(), v.to_wire()))
        .collect();
    Json::Object(obj)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_call_document_fields() {
        let wire = json!({
            "offer": { "mapValue": { "fields": {
                "sdp": { "stringValue": "v=0\r\n" },
                "type": { "stringValue": "offer" }
            }}},
            "hangup": { "booleanValue": false },
            "uid": { "stringValue": "bob" }
        });
        let fields = fields_from_wire(Some(&wire)).expect("decode");
        let offer = fields["offer"].as_map().expect("offer map");
        assert_eq!(offer["sdp"].as_str(), Some("v=0\r\n"));
        assert_eq!(offer["type"].as_str(), Some("offer"));
        assert_eq!(fields["hangup"].as_bool(), Some(false));
    }

    #[test]
    fn test_integer_values_are_decimal_strings() {
        let value = Value::from_wire(&json!({ "integerValue": "2130706431" })).expect("decode");
        assert_eq!(value, Value::Integer(2130706431));
        assert_eq!(value.to_wire(), json!({ "integerValue": "2130706431" }));
    }

    #[test]
    fn test_answer_map_encoding() {
        let mut answer = Fields::new();
        answer.insert("sdp".into(), "v=0".into());
        answer.insert("type".into(), "answer".into());
        let wire = Value::Map(answer).to_wire();
        assert_eq!(
            wire,
            json!({ "mapValue": { "fields": {
                "sdp": { "stringValue": "v=0" },
                "type": { "stringValue": "answer" }
            }}})
        );
    }

    #[test]
    fn test_unknown_kinds_are_kept_verbatim() {
        let raw = json!({ "geoPointValue": { "latitude": 1.0, "longitude": 2.0 } });
        let value = Value::from_wire(&raw).expect("decode");
        assert_eq!(value.to_wire(), raw);
    }

    #[test]
    fn test_rejects_untyped_values() {
        assert!(Value::from_wire(&json!("plain")).is_err());
        assert!(Value::from_wire(&json!({})).is_err());
        assert!(Value::from_wire(&json!({ "booleanValue": "yes" })).is_err());
    }
}
