//! Expression evaluation over layered value sources.
//!
//! Expressions come in three shapes:
//!
//! - a bare dotted path (`device.id`, `readings.0.value`) resolving to a typed value
//! - a template mixing literal text and `${path}` placeholders, rendering a string
//! - a literal: `'quoted text'`, or numeric text that does not resolve as a path
//!
//! A path is resolved against an ordered list of [`ValueSource`]s and the
//! first source that knows the path wins.

use crate::error::{Result, RustFlowError};
use crate::types::{json_type_name, value_to_plain_string, Message};
use serde_json::{Map, Value as JsonValue};
use std::fmt;
use std::str::FromStr;

/// Something an expression path can be resolved against
pub trait ValueSource: Send + Sync {
    fn lookup(&self, path: &str) -> Option<JsonValue>;
}

impl ValueSource for Map<String, JsonValue> {
    fn lookup(&self, path: &str) -> Option<JsonValue> {
        if let Some(value) = self.get(path) {
            return Some(value.clone());
        }
        let (head, rest) = path.split_once('.')?;
        extract_json_path(self.get(head)?, rest)
    }
}

impl ValueSource for Message {
    fn lookup(&self, path: &str) -> Option<JsonValue> {
        self.fields().lookup(path)
    }
}

impl ValueSource for JsonValue {
    fn lookup(&self, path: &str) -> Option<JsonValue> {
        match self {
            JsonValue::Object(map) => map.lookup(path),
            _ => extract_json_path(self, path),
        }
    }
}

/// Walk a dotted path through objects and arrays
fn extract_json_path(value: &JsonValue, path: &str) -> Option<JsonValue> {
    let mut current = value;
    for part in path.split('.') {
        current = match current {
            JsonValue::Object(map) => map.get(part)?,
            JsonValue::Array(items) => items.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current.clone())
}

#[derive(Debug, Clone, PartialEq)]
pub enum Segment {
    Text(String),
    Placeholder(String),
}

/// A parsed expression, reusable across evaluations
#[derive(Debug, Clone, PartialEq)]
pub enum Expression {
    Path(String),
    Literal(JsonValue),
    Template(Vec<Segment>),
}

impl Expression {
    pub fn parse(text: &str) -> Result<Self> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Err(expression_error(text, "empty expression"));
        }

        if trimmed.len() >= 2 && trimmed.starts_with('\'') && trimmed.ends_with('\'') {
            let inner = &trimmed[1..trimmed.len() - 1];
            return Ok(Expression::Literal(JsonValue::String(inner.to_string())));
        }

        if !text.contains("${") {
            return Ok(Expression::Path(trimmed.to_string()));
        }

        let mut segments = Vec::new();
        let mut rest = text;
        while let Some(start) = rest.find("${") {
            if start > 0 {
                segments.push(Segment::Text(rest[..start].to_string()));
            }
            let after = &rest[start + 2..];
            let end = after
                .find('}')
                .ok_or_else(|| expression_error(text, "unterminated placeholder"))?;
            let path = after[..end].trim();
            if path.is_empty() {
                return Err(expression_error(text, "empty placeholder"));
            }
            segments.push(Segment::Placeholder(path.to_string()));
            rest = &after[end + 1..];
        }
        if !rest.is_empty() {
            segments.push(Segment::Text(rest.to_string()));
        }

        // A lone placeholder keeps the resolved value's type
        if let [Segment::Placeholder(path)] = segments.as_slice() {
            return Ok(Expression::Path(path.clone()));
        }

        Ok(Expression::Template(segments))
    }

    /// Evaluate against `sources` in precedence order. `None` means unresolved.
    pub fn evaluate(&self, sources: &[&dyn ValueSource]) -> Option<JsonValue> {
        match self {
            Expression::Literal(value) => Some(value.clone()),
            Expression::Path(path) => resolve_path(path, sources).or_else(|| {
                serde_json::from_str::<serde_json::Number>(path)
                    .ok()
                    .map(JsonValue::Number)
            }),
            Expression::Template(segments) => {
                let mut rendered = String::new();
                for segment in segments {
                    match segment {
                        Segment::Text(text) => rendered.push_str(text),
                        Segment::Placeholder(path) => {
                            let value = resolve_path(path, sources)?;
                            rendered.push_str(&value_to_plain_string(&value));
                        }
                    }
                }
                Some(JsonValue::String(rendered))
            }
        }
    }
}

fn resolve_path(path: &str, sources: &[&dyn ValueSource]) -> Option<JsonValue> {
    sources.iter().find_map(|source| source.lookup(path))
}

fn expression_error(expression: &str, message: &str) -> RustFlowError {
    RustFlowError::Expression {
        expression: expression.to_string(),
        message: message.to_string(),
    }
}

/// Requested result type of an expression evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetType {
    String,
    Integer,
    Long,
    Double,
    JsonArray,
    JsonObject,
}

impl TargetType {
    pub fn coerce(&self, value: JsonValue) -> Result<JsonValue> {
        let coerced = match (self, &value) {
            (TargetType::String, v) => Some(JsonValue::String(value_to_plain_string(v))),
            (TargetType::Integer, v) => as_whole_number(v)
                .filter(|n| i32::try_from(*n).is_ok())
                .map(JsonValue::from),
            (TargetType::Long, v) => as_whole_number(v).map(JsonValue::from),
            (TargetType::Double, JsonValue::Number(n)) => n.as_f64().map(JsonValue::from),
            (TargetType::Double, JsonValue::String(s)) => {
                s.trim().parse::<f64>().ok().map(JsonValue::from)
            }
            (TargetType::JsonArray, JsonValue::Array(_)) => Some(value.clone()),
            (TargetType::JsonObject, JsonValue::Object(_)) => Some(value.clone()),
            (TargetType::JsonArray, JsonValue::String(s)) => serde_json::from_str::<JsonValue>(s)
                .ok()
                .filter(JsonValue::is_array),
            (TargetType::JsonObject, JsonValue::String(s)) => serde_json::from_str::<JsonValue>(s)
                .ok()
                .filter(JsonValue::is_object),
            _ => None,
        };

        coerced.ok_or_else(|| RustFlowError::Coercion {
            value: format!("{} {}", json_type_name(&value), value),
            target: self.to_string(),
        })
    }
}

fn as_whole_number(value: &JsonValue) -> Option<i64> {
    match value {
        JsonValue::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

impl fmt::Display for TargetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TargetType::String => "string",
            TargetType::Integer => "integer",
            TargetType::Long => "long",
            TargetType::Double => "double",
            TargetType::JsonArray => "json_array",
            TargetType::JsonObject => "json_object",
        };
        f.write_str(name)
    }
}

impl FromStr for TargetType {
    type Err = RustFlowError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "string" | "str" => Ok(TargetType::String),
            "integer" | "int" => Ok(TargetType::Integer),
            "long" => Ok(TargetType::Long),
            "double" => Ok(TargetType::Double),
            "json_array" | "jsonarray" | "array" => Ok(TargetType::JsonArray),
            "json_object" | "jsonobject" | "object" => Ok(TargetType::JsonObject),
            _ => Err(RustFlowError::UnsupportedTargetType(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_path_lookup_walks_objects_and_arrays() {
        let doc = json!({"device": {"id": "d-1", "readings": [{"v": 3}, {"v": 4}]}});
        assert_eq!(doc.lookup("device.id"), Some(json!("d-1")));
        assert_eq!(doc.lookup("device.readings.1.v"), Some(json!(4)));
        assert_eq!(doc.lookup("device.readings.x"), None);
        assert_eq!(doc.lookup("device.missing"), None);
    }

    #[test]
    fn test_dotted_field_name_takes_precedence() {
        let msg = Message::from_json(json!({"a.b": 1, "a": {"b": 2}})).unwrap();
        assert_eq!(msg.lookup("a.b"), Some(json!(1)));
    }

    #[test]
    fn test_first_source_wins() {
        let first = json!({"name": "first"});
        let second = json!({"name": "second", "only": true});
        let sources: [&dyn ValueSource; 2] = [&first, &second];

        let expr = Expression::parse("name").unwrap();
        assert_eq!(expr.evaluate(&sources), Some(json!("first")));
        let expr = Expression::parse("${only}").unwrap();
        assert_eq!(expr.evaluate(&sources), Some(json!(true)));
    }

    #[test]
    fn test_template_rendering() {
        let doc = json!({"kind": "click", "n": 3});
        let sources: [&dyn ValueSource; 1] = [&doc];

        let expr = Expression::parse("events-${kind}-${n}").unwrap();
        assert_eq!(expr.evaluate(&sources), Some(json!("events-click-3")));

        let unresolved = Expression::parse("x-${nope}").unwrap();
        assert_eq!(unresolved.evaluate(&sources), None);
    }

    #[test]
    fn test_literals() {
        let sources: [&dyn ValueSource; 0] = [];
        assert_eq!(
            Expression::parse("'hello world'").unwrap().evaluate(&sources),
            Some(json!("hello world"))
        );
        assert_eq!(
            Expression::parse("12.5").unwrap().evaluate(&sources),
            Some(json!(12.5))
        );
        assert_eq!(Expression::parse("unknown").unwrap().evaluate(&sources), None);
    }

    #[test]
    fn test_malformed_expressions() {
        assert!(Expression::parse("").is_err());
        assert!(Expression::parse("a-${b").is_err());
        assert!(Expression::parse("${}").is_err());
    }

    #[test]
    fn test_target_type_coercion() {
        assert_eq!(TargetType::String.coerce(json!(5)).unwrap(), json!("5"));
        assert_eq!(TargetType::Integer.coerce(json!("42")).unwrap(), json!(42));
        assert_eq!(TargetType::Long.coerce(json!(7.0)).unwrap(), json!(7));
        assert_eq!(TargetType::Double.coerce(json!("2.5")).unwrap(), json!(2.5));
        assert_eq!(TargetType::JsonArray.coerce(json!("[1,2]")).unwrap(), json!([1, 2]));
        assert_eq!(
            TargetType::JsonObject.coerce(json!({"a": 1})).unwrap(),
            json!({"a": 1})
        );

        assert!(TargetType::Integer.coerce(json!(5_000_000_000i64)).is_err());
        assert!(TargetType::Long.coerce(json!(1.5)).is_err());
        assert!(TargetType::JsonObject.coerce(json!([1])).is_err());
    }

    #[test]
    fn test_unsupported_target_type() {
        assert_eq!("LONG".parse::<TargetType>().unwrap(), TargetType::Long);
        let err = "timestamp".parse::<TargetType>().unwrap_err();
        assert!(matches!(err, RustFlowError::UnsupportedTargetType(name) if name == "timestamp"));
    }
}
