//! Message filters.
//!
//! A filter is a pure predicate over a message context. Leaf filters look
//! up a dotted field path on the message; combinators compose other filters.

use crate::context::{MessageProcessingContext, ValueSource};
use crate::error::{Result, RustFlowError};
use crate::types::value_to_plain_string;
use chrono::DateTime;
use regex::Regex;
use serde_json::{json, Value as JsonValue};

pub trait Filter: Send + Sync {
    fn passes(&self, ctx: &MessageProcessingContext) -> bool;

    /// Structured descriptor used for introspection and logging
    fn describe(&self) -> JsonValue;
}

fn field_value(ctx: &MessageProcessingContext, field: &str) -> Option<JsonValue> {
    ctx.message().lookup(field)
}

fn as_number(value: &JsonValue) -> Option<f64> {
    match value {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

/// JSON equality that treats `1` and `1.0` as equal
fn values_equal(left: &JsonValue, right: &JsonValue) -> bool {
    match (left, right) {
        (JsonValue::Number(a), JsonValue::Number(b)) => a.as_f64() == b.as_f64(),
        _ => left == right,
    }
}

pub struct Not(pub Box<dyn Filter>);

impl Filter for Not {
    fn passes(&self, ctx: &MessageProcessingContext) -> bool {
        !self.0.passes(ctx)
    }

    fn describe(&self) -> JsonValue {
        json!({"not": self.0.describe()})
    }
}

/// Passes when every inner filter passes. Empty passes.
pub struct AllOf(pub Vec<Box<dyn Filter>>);

impl Filter for AllOf {
    fn passes(&self, ctx: &MessageProcessingContext) -> bool {
        self.0.iter().all(|f| f.passes(ctx))
    }

    fn describe(&self) -> JsonValue {
        json!({"allOf": self.0.iter().map(|f| f.describe()).collect::<Vec<_>>()})
    }
}

/// Passes when any inner filter passes. Empty rejects.
pub struct AnyOf(pub Vec<Box<dyn Filter>>);

impl Filter for AnyOf {
    fn passes(&self, ctx: &MessageProcessingContext) -> bool {
        self.0.iter().any(|f| f.passes(ctx))
    }

    fn describe(&self) -> JsonValue {
        json!({"anyOf": self.0.iter().map(|f| f.describe()).collect::<Vec<_>>()})
    }
}

/// Field value is one of a fixed set
pub struct OneOf {
    field: String,
    values: Vec<JsonValue>,
}

impl OneOf {
    pub fn new(field: impl Into<String>, values: Vec<JsonValue>) -> Self {
        Self {
            field: field.into(),
            values,
        }
    }
}

impl Filter for OneOf {
    fn passes(&self, ctx: &MessageProcessingContext) -> bool {
        match field_value(ctx, &self.field) {
            Some(value) => self.values.iter().any(|candidate| values_equal(&value, candidate)),
            None => false,
        }
    }

    fn describe(&self) -> JsonValue {
        json!({"oneOf": {"field": self.field, "values": self.values}})
    }
}

pub struct Equals {
    field: String,
    value: JsonValue,
}

impl Equals {
    pub fn new(field: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        Self {
            field: field.into(),
            value: value.into(),
        }
    }
}

impl Filter for Equals {
    fn passes(&self, ctx: &MessageProcessingContext) -> bool {
        field_value(ctx, &self.field).map_or(false, |value| values_equal(&value, &self.value))
    }

    fn describe(&self) -> JsonValue {
        json!({"equals": {"field": self.field, "value": self.value}})
    }
}

/// Regex match against the plain string form of a field
pub struct Matches {
    field: String,
    regex: Regex,
}

impl Matches {
    pub fn new(field: impl Into<String>, pattern: &str) -> Result<Self> {
        let regex = Regex::new(pattern).map_err(|e| {
            RustFlowError::InvalidConfig(format!("invalid regex pattern '{}': {}", pattern, e))
        })?;
        Ok(Self {
            field: field.into(),
            regex,
        })
    }
}

impl Filter for Matches {
    fn passes(&self, ctx: &MessageProcessingContext) -> bool {
        match field_value(ctx, &self.field) {
            Some(JsonValue::Null) | None => false,
            Some(value) => self.regex.is_match(&value_to_plain_string(&value)),
        }
    }

    fn describe(&self) -> JsonValue {
        json!({"matches": {"field": self.field, "pattern": self.regex.as_str()}})
    }
}

/// Numeric bounds: `lower <= value < upper`. Missing bounds are open.
pub struct Range {
    field: String,
    lower: Option<f64>,
    upper: Option<f64>,
}

impl Range {
    pub fn new(field: impl Into<String>, lower: Option<f64>, upper: Option<f64>) -> Self {
        Self {
            field: field.into(),
            lower,
            upper,
        }
    }
}

impl Filter for Range {
    fn passes(&self, ctx: &MessageProcessingContext) -> bool {
        let Some(value) = field_value(ctx, &self.field).as_ref().and_then(as_number) else {
            return false;
        };
        self.lower.map_or(true, |lower| value >= lower) && self.upper.map_or(true, |upper| value < upper)
    }

    fn describe(&self) -> JsonValue {
        json!({"range": {"field": self.field, "lower": self.lower, "upper": self.upper}})
    }
}

/// Parse epoch milliseconds or an RFC 3339 timestamp
pub fn parse_timestamp_millis(value: &JsonValue) -> Option<i64> {
    match value {
        JsonValue::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        JsonValue::String(s) => match s.trim().parse::<i64>() {
            Ok(millis) => Some(millis),
            Err(_) => DateTime::parse_from_rfc3339(s.trim())
                .ok()
                .map(|dt| dt.timestamp_millis()),
        },
        _ => None,
    }
}

/// Timestamp field within `[after, before)`
pub struct TimeRange {
    field: String,
    after: Option<i64>,
    before: Option<i64>,
}

impl TimeRange {
    pub fn new(field: impl Into<String>, after: Option<i64>, before: Option<i64>) -> Self {
        Self {
            field: field.into(),
            after,
            before,
        }
    }
}

impl Filter for TimeRange {
    fn passes(&self, ctx: &MessageProcessingContext) -> bool {
        let Some(ts) = field_value(ctx, &self.field).as_ref().and_then(parse_timestamp_millis) else {
            return false;
        };
        self.after.map_or(true, |after| ts >= after) && self.before.map_or(true, |before| ts < before)
    }

    fn describe(&self) -> JsonValue {
        json!({"timeRange": {"field": self.field, "after": self.after, "before": self.before}})
    }
}

pub struct HasField(pub String);

impl Filter for HasField {
    fn passes(&self, ctx: &MessageProcessingContext) -> bool {
        !matches!(field_value(ctx, &self.0), None | Some(JsonValue::Null))
    }

    fn describe(&self) -> JsonValue {
        json!({"hasField": self.0})
    }
}

/// Stream-level flag check
pub struct FlagSet(pub String);

impl Filter for FlagSet {
    fn passes(&self, ctx: &MessageProcessingContext) -> bool {
        ctx.stream().check_flag(&self.0)
    }

    fn describe(&self) -> JsonValue {
        json!({"flagSet": self.0})
    }
}
