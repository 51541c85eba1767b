use crate::types::Message;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Implicit per-entry weight used by [`Combiner::Average`]
pub const COUNT_FIELD: &str = "count";

/// How two entries for the same `(bucket, key)` are merged
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Combiner {
    Sum,
    Average,
    #[serde(other)]
    Unrecognized,
}

impl Default for Combiner {
    fn default() -> Self {
        Combiner::Sum
    }
}

impl Combiner {
    /// Merge `incoming` into `existing`, returning the combined entry.
    /// Fields other than the value (and count) are taken from `existing`.
    pub fn combine(&self, existing: &Message, incoming: &Message, value_field: &str) -> Message {
        match self {
            Combiner::Sum => {
                let mut merged = existing.clone();
                merged.put_value(
                    value_field,
                    add_values(existing.get(value_field), incoming.get(value_field)),
                );
                merged
            }
            Combiner::Average => {
                let left_count = existing.get_double(COUNT_FIELD, 1.0);
                let right_count = incoming.get_double(COUNT_FIELD, 1.0);
                let total = left_count + right_count;
                let mean = if total == 0.0 {
                    0.0
                } else {
                    (existing.get_double(value_field, 0.0) * left_count
                        + incoming.get_double(value_field, 0.0) * right_count)
                        / total
                };

                let mut merged = existing.clone();
                merged
                    .put_value(value_field, mean)
                    .put_value(COUNT_FIELD, whole_if_integral(total));
                merged
            }
            Combiner::Unrecognized => existing.clone(),
        }
    }
}

fn add_values(left: Option<&JsonValue>, right: Option<&JsonValue>) -> JsonValue {
    let as_i64 = |v: Option<&JsonValue>| match v {
        None | Some(JsonValue::Null) => Some(0),
        Some(v) => v.as_i64(),
    };
    let as_f64 = |v: Option<&JsonValue>| match v {
        Some(JsonValue::Number(n)) => n.as_f64().unwrap_or(0.0),
        Some(JsonValue::String(s)) => s.trim().parse().unwrap_or(0.0),
        _ => 0.0,
    };

    match (as_i64(left), as_i64(right)) {
        (Some(a), Some(b)) => match a.checked_add(b) {
            Some(sum) => JsonValue::from(sum),
            None => JsonValue::from(a as f64 + b as f64),
        },
        _ => JsonValue::from(as_f64(left) + as_f64(right)),
    }
}

fn whole_if_integral(value: f64) -> JsonValue {
    if value.fract() == 0.0 && value.abs() < i64::MAX as f64 {
        JsonValue::from(value as i64)
    } else {
        JsonValue::from(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(value: JsonValue) -> Message {
        Message::from_json(value).unwrap()
    }

    #[test]
    fn test_sum_adds_values() {
        let merged = Combiner::Sum.combine(
            &entry(json!({"key": "a", "value": 3})),
            &entry(json!({"key": "a", "value": 4})),
            "value",
        );
        assert_eq!(merged.get("value"), Some(&json!(7)));
        assert_eq!(merged.get_str("key"), Some("a"));

        let merged = Combiner::Sum.combine(
            &entry(json!({"value": 1.5})),
            &entry(json!({"value": 2})),
            "value",
        );
        assert_eq!(merged.get_double("value", 0.0), 3.5);
    }

    #[test]
    fn test_average_is_count_weighted() {
        let merged = Combiner::Average.combine(
            &entry(json!({"value": 10})),
            &entry(json!({"value": 20})),
            "value",
        );
        assert_eq!(merged.get_double("value", 0.0), 15.0);
        assert_eq!(merged.get_long(COUNT_FIELD, 0), 2);

        let merged = Combiner::Average.combine(&merged, &entry(json!({"value": 30, "count": 2})), "value");
        assert_eq!(merged.get_double("value", 0.0), 22.5);
        assert_eq!(merged.get_long(COUNT_FIELD, 0), 4);
    }

    #[test]
    fn test_unrecognized_keeps_original() {
        let combiner: Combiner = serde_json::from_str("\"MEDIAN\"").unwrap();
        assert_eq!(combiner, Combiner::Unrecognized);

        let original = entry(json!({"value": 1}));
        let merged = combiner.combine(&original, &entry(json!({"value": 99})), "value");
        assert_eq!(merged, original);
    }
}
