use crate::bucketing::combiner::Combiner;
use crate::error::{Result, RustFlowError};
use crate::filter::parse_timestamp_millis;
use crate::types::Message;
use serde_json::Value as JsonValue;

/// Adapts entries of some shape to the bucketing service
pub trait AggregationBridge: Send + Sync {
    fn timestamp_of(&self, entry: &Message) -> Result<i64>;

    fn key_of(&self, entry: &Message) -> String;

    /// Copy of `entry` normalized to the bucket timestamp
    fn with_timestamp(&self, bucket: i64, entry: &Message) -> Message;

    fn merge(&self, existing: &Message, incoming: &Message) -> Message;

    /// Zero-value record for an empty window
    fn filler(&self, bucket: i64) -> Message;
}

/// Bridge over flat JSON messages
#[derive(Debug, Clone)]
pub struct JsonFieldBridge {
    timestamp_field: String,
    key_fields: Vec<String>,
    value_field: String,
    combiner: Combiner,
}

impl JsonFieldBridge {
    pub fn new(
        timestamp_field: impl Into<String>,
        key_fields: Vec<String>,
        value_field: impl Into<String>,
        combiner: Combiner,
    ) -> Self {
        Self {
            timestamp_field: timestamp_field.into(),
            key_fields,
            value_field: value_field.into(),
            combiner,
        }
    }

    pub fn combiner(&self) -> Combiner {
        self.combiner
    }
}

impl AggregationBridge for JsonFieldBridge {
    fn timestamp_of(&self, entry: &Message) -> Result<i64> {
        entry
            .get(&self.timestamp_field)
            .and_then(parse_timestamp_millis)
            .ok_or_else(|| {
                RustFlowError::InvalidMessage(format!(
                    "missing or unparseable timestamp field '{}'",
                    self.timestamp_field
                ))
            })
    }

    fn key_of(&self, entry: &Message) -> String {
        self.key_fields
            .iter()
            .map(|field| entry.get_value_as_string(field, ""))
            .collect::<Vec<_>>()
            .join("|")
    }

    fn with_timestamp(&self, bucket: i64, entry: &Message) -> Message {
        let mut normalized = entry.clone();
        normalized.put_value(self.timestamp_field.clone(), bucket);
        normalized
    }

    fn merge(&self, existing: &Message, incoming: &Message) -> Message {
        self.combiner.combine(existing, incoming, &self.value_field)
    }

    fn filler(&self, bucket: i64) -> Message {
        let mut filler = Message::new();
        filler
            .put_value(self.timestamp_field.clone(), bucket)
            .put_value(self.value_field.clone(), JsonValue::from(0));
        filler
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_json_field_bridge() {
        let bridge = JsonFieldBridge::new("ts", vec!["host".into(), "metric".into()], "value", Combiner::Sum);
        let entry = Message::from_json(json!({"ts": 1_234, "host": "a", "metric": "cpu", "value": 2})).unwrap();

        assert_eq!(bridge.timestamp_of(&entry).unwrap(), 1_234);
        assert_eq!(bridge.key_of(&entry), "a|cpu");
        assert_eq!(bridge.with_timestamp(1_500, &entry).get_long("ts", 0), 1_500);
        assert_eq!(bridge.filler(9).to_json(), json!({"ts": 9, "value": 0}));

        let missing = Message::from_json(json!({"value": 1})).unwrap();
        assert!(bridge.timestamp_of(&missing).is_err());
    }
}
