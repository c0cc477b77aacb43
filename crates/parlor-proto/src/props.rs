//! Flat JSON property maps.
//!
//! Every event and request header is a JSON object. `Props` wraps the map and
//! offers typed accessors: the `require_*` family fails with
//! [`ProtocolError`] when a property is absent or mistyped, the plain getters
//! return `None`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::{ProtocolError, Result};

/// JSON object of named properties.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Props(Map<String, Value>);

impl Props {
    /// Empty property map.
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Builder-style insert.
    #[must_use]
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.set(key, value);
        self
    }

    /// Insert or replace a property.
    pub fn set(&mut self, key: &str, value: impl Into<Value>) {
        self.0.insert(key.to_owned(), value.into());
    }

    /// Raw property value.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Whether the property is present (even if null).
    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// String property, if present and a string.
    pub fn str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    /// Integer property, if present and integral.
    pub fn int(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(Value::as_i64)
    }

    /// Number property, accepting integers and floats.
    pub fn float(&self, key: &str) -> Option<f64> {
        self.get(key).and_then(Value::as_f64)
    }

    /// Boolean property; absent or non-boolean reads as `false`.
    pub fn flag(&self, key: &str) -> bool {
        self.get(key).and_then(Value::as_bool).unwrap_or(false)
    }

    /// Nested object property.
    pub fn object(&self, key: &str) -> Option<Props> {
        match self.get(key) {
            Some(Value::Object(map)) => Some(Self(map.clone())),
            _ => None,
        }
    }

    /// Required string property.
    pub fn require_str(&self, key: &str) -> Result<&str> {
        match self.get(key) {
            None | Some(Value::Null) => Err(ProtocolError::MissingProperty(key.to_owned())),
            Some(value) => value
                .as_str()
                .ok_or_else(|| ProtocolError::WrongType { key: key.to_owned(), expected: "string" }),
        }
    }

    /// Required integer property.
    pub fn require_int(&self, key: &str) -> Result<i64> {
        match self.get(key) {
            None | Some(Value::Null) => Err(ProtocolError::MissingProperty(key.to_owned())),
            Some(value) => value
                .as_i64()
                .ok_or_else(|| ProtocolError::WrongType { key: key.to_owned(), expected: "integer" }),
        }
    }

    /// Required number property.
    pub fn require_float(&self, key: &str) -> Result<f64> {
        match self.get(key) {
            None | Some(Value::Null) => Err(ProtocolError::MissingProperty(key.to_owned())),
            Some(value) => value
                .as_f64()
                .ok_or_else(|| ProtocolError::WrongType { key: key.to_owned(), expected: "number" }),
        }
    }

    /// Required nested object.
    pub fn require_object(&self, key: &str) -> Result<Props> {
        match self.get(key) {
            None | Some(Value::Null) => Err(ProtocolError::MissingProperty(key.to_owned())),
            Some(Value::Object(map)) => Ok(Self(map.clone())),
            Some(_) => Err(ProtocolError::WrongType { key: key.to_owned(), expected: "object" }),
        }
    }

    /// Iterate over `(key, value)` pairs in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    /// Iterate over entries whose values are objects.
    pub fn objects(&self) -> impl Iterator<Item = (&str, Props)> {
        self.0.iter().filter_map(|(key, value)| match value {
            Value::Object(map) => Some((key.as_str(), Self(map.clone()))),
            _ => None,
        })
    }

    /// Number of properties.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the map is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Borrow the underlying JSON map.
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Unwrap into the underlying JSON map.
    pub fn into_map(self) -> Map<String, Value> {
        self.0
    }
}

impl From<Map<String, Value>> for Props {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

impl From<Props> for Value {
    fn from(props: Props) -> Self {
        Value::Object(props.0)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn sample() -> Props {
        let Value::Object(map) = json!({
            "event": "queue_updated",
            "queue_position": 4,
            "message_time": 1_700_000_000.5,
            "closed": true,
            "queue_attrs": { "name": "Sales" },
        }) else {
            unreachable!()
        };
        Props::from(map)
    }

    #[test]
    fn typed_getters() {
        let props = sample();
        assert_eq!(props.str("event"), Some("queue_updated"));
        assert_eq!(props.int("queue_position"), Some(4));
        assert_eq!(props.float("queue_position"), Some(4.0));
        assert!(props.flag("closed"));
        assert!(!props.flag("suspended"));
        assert_eq!(props.object("queue_attrs").and_then(|a| a.str("name").map(str::to_owned)), Some("Sales".into()));
    }

    #[test]
    fn required_getters_report_missing_and_mistyped() {
        let props = sample();
        assert_eq!(props.require_str("channel_id"), Err(ProtocolError::MissingProperty("channel_id".into())));
        assert_eq!(
            props.require_str("queue_position"),
            Err(ProtocolError::WrongType { key: "queue_position".into(), expected: "string" })
        );
        assert!(props.require_float("message_time").is_ok());
        assert!(props.require_object("event").is_err());
    }

    #[test]
    fn null_counts_as_missing() {
        let props = Props::new().with("user_id", Value::Null);
        assert!(props.contains("user_id"));
        assert_eq!(props.require_str("user_id"), Err(ProtocolError::MissingProperty("user_id".into())));
    }
}
