use crate::error::{Result, RustFlowError};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::fmt;

pub type PipelineName = String;
pub type SerialId = u64;

/// A JSON-valued record flowing through a pipeline.
///
/// A message is owned by exactly one logical holder at a time: the source that
/// produced it, the pipeline stage currently mutating it, or the sink consuming it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Message {
    fields: Map<String, JsonValue>,
}

impl Message {
    pub fn new() -> Self {
        Self { fields: Map::new() }
    }

    pub fn from_map(fields: Map<String, JsonValue>) -> Self {
        Self { fields }
    }

    /// Build a message from a JSON value, which must be an object
    pub fn from_json(value: JsonValue) -> Result<Self> {
        match value {
            JsonValue::Object(fields) => Ok(Self { fields }),
            other => Err(RustFlowError::InvalidMessage(format!(
                "message must be a JSON object, got {}",
                json_type_name(&other)
            ))),
        }
    }

    /// Parse a single line of JSON into a message
    pub fn from_line(line: &str) -> Result<Self> {
        let value: JsonValue = serde_json::from_str(line.trim())?;
        Self::from_json(value)
    }

    pub fn get(&self, field: &str) -> Option<&JsonValue> {
        self.fields.get(field)
    }

    pub fn contains(&self, field: &str) -> bool {
        self.fields.contains_key(field)
    }

    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.fields.get(field).and_then(JsonValue::as_str)
    }

    /// Integer value of `field`; numeric strings are parsed, anything else yields `default`
    pub fn get_long(&self, field: &str, default: i64) -> i64 {
        match self.fields.get(field) {
            Some(JsonValue::Number(n)) => n
                .as_i64()
                .or_else(|| n.as_f64().map(|f| f as i64))
                .unwrap_or(default),
            Some(JsonValue::String(s)) => s.trim().parse().unwrap_or(default),
            _ => default,
        }
    }

    pub fn get_double(&self, field: &str, default: f64) -> f64 {
        match self.fields.get(field) {
            Some(JsonValue::Number(n)) => n.as_f64().unwrap_or(default),
            Some(JsonValue::String(s)) => s.trim().parse().unwrap_or(default),
            _ => default,
        }
    }

    /// String form of `field`. Strings are returned unquoted, other values as compact JSON.
    pub fn get_value_as_string(&self, field: &str, default: &str) -> String {
        match self.fields.get(field) {
            None | Some(JsonValue::Null) => default.to_string(),
            Some(value) => value_to_plain_string(value),
        }
    }

    pub fn put_value(&mut self, field: impl Into<String>, value: impl Into<JsonValue>) -> &mut Self {
        self.fields.insert(field.into(), value.into());
        self
    }

    pub fn remove_value(&mut self, field: &str) -> Option<JsonValue> {
        self.fields.remove(field)
    }

    pub fn fields(&self) -> &Map<String, JsonValue> {
        &self.fields
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn to_json(&self) -> JsonValue {
        JsonValue::Object(self.fields.clone())
    }

    pub fn into_json(self) -> JsonValue {
        JsonValue::Object(self.fields)
    }

    /// Single-line JSON form used by line-oriented sinks
    pub fn to_line(&self) -> String {
        // A map of JSON values always serializes
        serde_json::to_string(&self.fields).unwrap_or_else(|_| "{}".to_string())
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_line())
    }
}

impl From<Map<String, JsonValue>> for Message {
    fn from(fields: Map<String, JsonValue>) -> Self {
        Self { fields }
    }
}

/// A message together with the name of the pipeline that should handle it
#[derive(Debug, Clone, PartialEq)]
pub struct MessageAndRouting {
    pub message: Message,
    pub pipeline: PipelineName,
}

impl MessageAndRouting {
    pub fn new(message: Message, pipeline: impl Into<PipelineName>) -> Self {
        Self {
            message,
            pipeline: pipeline.into(),
        }
    }
}

pub(crate) fn value_to_plain_string(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.clone(),
        JsonValue::Null => String::new(),
        other => other.to_string(),
    }
}

pub(crate) fn json_type_name(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "boolean",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_typed_getters_with_defaults() {
        let mut msg = Message::new();
        msg.put_value("count", 42)
            .put_value("ratio", 0.5)
            .put_value("numeric_text", "17")
            .put_value("name", "alpha");

        assert_eq!(msg.get_long("count", 0), 42);
        assert_eq!(msg.get_long("numeric_text", 0), 17);
        assert_eq!(msg.get_long("name", -1), -1);
        assert_eq!(msg.get_long("missing", 9), 9);
        assert_eq!(msg.get_double("ratio", 0.0), 0.5);
        assert_eq!(msg.get_double("count", 0.0), 42.0);
        assert_eq!(msg.get_value_as_string("name", ""), "alpha");
        assert_eq!(msg.get_value_as_string("count", ""), "42");
        assert_eq!(msg.get_value_as_string("missing", "none"), "none");
    }

    #[test]
    fn test_clone_is_independent() {
        let mut original = Message::from_json(json!({"nested": {"a": 1}})).unwrap();
        let copy = original.clone();
        original.put_value("nested", json!({"a": 2}));

        assert_eq!(copy.get("nested"), Some(&json!({"a": 1})));
        assert_eq!(original.get("nested"), Some(&json!({"a": 2})));
    }

    #[test]
    fn test_line_serialization() {
        let msg = Message::from_line(r#"{"ts": 1000, "key": "A"}"#).unwrap();
        assert_eq!(msg.get_long("ts", 0), 1000);

        let line = msg.to_line();
        assert!(!line.contains('\n'));
        assert_eq!(Message::from_line(&line).unwrap(), msg);

        assert!(Message::from_line("[1, 2]").is_err());
        assert!(Message::from_line("not json").is_err());
    }
}
