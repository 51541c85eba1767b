use crate::bucketing::service::DEFAULT_MAX_FILLERS;
use crate::bucketing::{AggregationPeriod, Combiner};
use crate::error::{Result, RustFlowError};
use crate::program::StageErrorPolicy;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::collections::HashSet;
use std::path::Path;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub logging: LoggingConfig,
    pub driver: DriverConfig,
    pub program: ProgramConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// One of `trace`, `debug`, `info`, `warn`, `error`
    pub level: String,
    pub ansi: bool,
    pub with_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            ansi: true,
            with_target: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    pub operator: String,
    /// Bounded wait for each `get_next_message` call
    pub poll_timeout_ms: u64,
    pub stage_error_policy: StageErrorPolicy,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            operator: "rustflow".to_string(),
            poll_timeout_ms: 1_000,
            stage_error_policy: StageErrorPolicy::HaltMessage,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgramConfig {
    pub pipelines: Vec<PipelineConfig>,
    pub aggregations: Vec<AggregationConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub name: String,
    #[serde(default)]
    pub stages: Vec<StageConfig>,
    pub sink: StageConfig,
}

/// A registry discriminator plus its free-form options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageConfig {
    pub kind: String,
    #[serde(flatten)]
    pub options: Map<String, JsonValue>,
}

impl StageConfig {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            options: Map::new(),
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    pub fn str_option(&self, key: &str) -> Result<&str> {
        self.options
            .get(key)
            .and_then(JsonValue::as_str)
            .ok_or_else(|| self.missing(key, "a string"))
    }

    pub fn optional_str(&self, key: &str) -> Option<&str> {
        self.options.get(key).and_then(JsonValue::as_str)
    }

    pub fn f64_option(&self, key: &str) -> Option<f64> {
        self.options.get(key).and_then(JsonValue::as_f64)
    }

    pub fn i64_option(&self, key: &str) -> Option<i64> {
        self.options.get(key).and_then(JsonValue::as_i64)
    }

    pub fn value_option(&self, key: &str) -> Result<&JsonValue> {
        self.options.get(key).ok_or_else(|| self.missing(key, "a value"))
    }

    /// A string or an array of strings
    pub fn string_list(&self, key: &str) -> Vec<String> {
        match self.options.get(key) {
            Some(JsonValue::String(s)) => vec![s.clone()],
            Some(JsonValue::Array(items)) => items
                .iter()
                .filter_map(|item| item.as_str().map(str::to_string))
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Nested stage definitions, as used by `not`/`allOf`/`anyOf`
    pub fn nested(&self, key: &str) -> Result<Vec<StageConfig>> {
        match self.options.get(key) {
            Some(JsonValue::Array(items)) => items
                .iter()
                .map(|item| serde_json::from_value(item.clone()).map_err(RustFlowError::from))
                .collect(),
            Some(single @ JsonValue::Object(_)) => Ok(vec![serde_json::from_value(single.clone())?]),
            _ => Err(self.missing(key, "nested stage definitions")),
        }
    }

    /// Deserialize all options into a typed config
    pub fn parse_options<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(JsonValue::Object(self.options.clone())).map_err(|e| {
            RustFlowError::InvalidConfig(format!("{}: invalid options: {}", self.kind, e))
        })
    }

    fn missing(&self, key: &str, expected: &str) -> RustFlowError {
        RustFlowError::InvalidConfig(format!("{}.{} must be {}", self.kind, key, expected))
    }
}

/// Bucket offsets are limited to one leap year either way
pub const MAX_BUCKET_OFFSET_SECONDS: i64 = 366 * 86_400;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregationConfig {
    pub name: String,
    pub period: AggregationPeriod,
    pub bucket_time_offset_seconds: i64,
    /// Pipeline that receives the aggregated output
    pub report_to: String,
    pub timestamp_field: String,
    pub key_fields: Vec<String>,
    pub value_field: String,
    pub combiner: Combiner,
    pub idle_flush_ms: Option<u64>,
    /// Widest gap, in periods, filled with zero-value records
    pub max_fillers: u64,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            period: AggregationPeriod::Minutes,
            bucket_time_offset_seconds: 0,
            report_to: String::new(),
            timestamp_field: "timestamp".to_string(),
            key_fields: Vec::new(),
            value_field: "value".to_string(),
            combiner: Combiner::Sum,
            idle_flush_ms: None,
            max_fillers: DEFAULT_MAX_FILLERS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchSinkConfig {
    pub host: String,
    /// Expression for the topic path segment
    pub topic: Option<String>,
    /// Expression for the stream path segment, used only with a topic
    pub stream: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub max_batch_len: usize,
    pub max_batch_age_ms: u64,
    pub retry_delay_ms: u64,
    pub request_timeout_ms: u64,
}

impl Default for BatchSinkConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            topic: None,
            stream: None,
            username: None,
            password: None,
            max_batch_len: 100,
            max_batch_age_ms: 5_000,
            retry_delay_ms: 1_000,
            request_timeout_ms: 30_000,
        }
    }
}

impl EngineConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| RustFlowError::Config(e.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        self.logging.validate()?;
        self.driver.validate()?;
        self.program.validate()
    }
}

impl LoggingConfig {
    pub fn validate(&self) -> Result<()> {
        crate::logging::parse_level(&self.level).map(|_| ())
    }
}

impl DriverConfig {
    pub fn validate(&self) -> Result<()> {
        if self.operator.is_empty() {
            return Err(RustFlowError::InvalidConfig(
                "driver.operator cannot be empty".to_string(),
            ));
        }
        Ok(())
    }
}

impl ProgramConfig {
    pub fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        for pipeline in &self.pipelines {
            if pipeline.name.is_empty() {
                return Err(RustFlowError::InvalidConfig(
                    "program.pipelines.name cannot be empty".to_string(),
                ));
            }
            if !names.insert(pipeline.name.as_str()) {
                return Err(RustFlowError::InvalidConfig(format!(
                    "program.pipelines: duplicate pipeline '{}'",
                    pipeline.name
                )));
            }
        }

        let mut aggregations = HashSet::new();
        for aggregation in &self.aggregations {
            aggregation.validate()?;
            if !aggregations.insert(aggregation.name.as_str()) {
                return Err(RustFlowError::InvalidConfig(format!(
                    "program.aggregations: duplicate aggregation '{}'",
                    aggregation.name
                )));
            }
            if !names.contains(aggregation.report_to.as_str()) {
                return Err(RustFlowError::InvalidConfig(format!(
                    "program.aggregations.{}.report_to: unknown pipeline '{}'",
                    aggregation.name, aggregation.report_to
                )));
            }
        }
        Ok(())
    }
}

impl AggregationConfig {
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(RustFlowError::InvalidConfig(
                "program.aggregations.name cannot be empty".to_string(),
            ));
        }
        if self.report_to.is_empty() {
            return Err(RustFlowError::InvalidConfig(format!(
                "program.aggregations.{}.report_to cannot be empty",
                self.name
            )));
        }
        if self.timestamp_field.is_empty() || self.value_field.is_empty() {
            return Err(RustFlowError::InvalidConfig(format!(
                "program.aggregations.{}: timestamp_field and value_field are required",
                self.name
            )));
        }
        if self.bucket_time_offset_seconds.unsigned_abs() > MAX_BUCKET_OFFSET_SECONDS as u64 {
            return Err(RustFlowError::InvalidConfig(format!(
                "program.aggregations.{}.bucket_time_offset_seconds must be within +/-{}",
                self.name, MAX_BUCKET_OFFSET_SECONDS
            )));
        }
        if self.combiner == Combiner::Unrecognized {
            return Err(RustFlowError::InvalidConfig(format!(
                "program.aggregations.{}.combiner must be SUM or AVERAGE",
                self.name
            )));
        }
        Ok(())
    }
}

impl BatchSinkConfig {
    pub fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(RustFlowError::InvalidConfig(
                "batch_sink.host cannot be empty".to_string(),
            ));
        }
        if self.max_batch_len == 0 {
            return Err(RustFlowError::InvalidConfig(
                "batch_sink.max_batch_len must be greater than 0".to_string(),
            ));
        }
        if self.request_timeout_ms == 0 {
            return Err(RustFlowError::InvalidConfig(
                "batch_sink.request_timeout_ms must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const SAMPLE: &str = r#"
[logging]
level = "debug"
ansi = false

[driver]
operator = "ingest"
poll_timeout_ms = 250
stage_error_policy = "fail_stream"

[[program.pipelines]]
name = "readings"

[[program.pipelines.stages]]
kind = "range"
field = "value"
lower = 0

[[program.pipelines.stages]]
kind = "removeFields"
fields = ["debug"]

[program.pipelines.sink]
kind = "aggregate"
aggregation = "per_minute"

[[program.pipelines]]
name = "rollups"

[program.pipelines.sink]
kind = "batched"
host = "http://collector:8080"
topic = "'metrics'"
max_batch_len = 50

[[program.aggregations]]
name = "per_minute"
period = "MINUTES"
report_to = "rollups"
key_fields = ["sensor"]
combiner = "AVERAGE"
"#;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.driver.poll_timeout_ms, 1_000);
        assert_eq!(config.driver.stage_error_policy, StageErrorPolicy::HaltMessage);
    }

    #[test]
    fn test_parse_sample() {
        let config = EngineConfig::from_toml_str(SAMPLE).unwrap();
        config.validate().unwrap();

        assert_eq!(config.logging.level, "debug");
        assert!(!config.logging.ansi);
        assert_eq!(config.driver.stage_error_policy, StageErrorPolicy::FailStream);

        let readings = &config.program.pipelines[0];
        assert_eq!(readings.stages.len(), 2);
        assert_eq!(readings.stages[0].kind, "range");
        assert_eq!(readings.stages[0].f64_option("lower"), Some(0.0));
        assert_eq!(readings.stages[1].string_list("fields"), vec!["debug".to_string()]);
        assert_eq!(readings.sink.str_option("aggregation").unwrap(), "per_minute");

        let batch: BatchSinkConfig = config.program.pipelines[1].sink.parse_options().unwrap();
        assert_eq!(batch.host, "http://collector:8080");
        assert_eq!(batch.max_batch_len, 50);
        assert_eq!(batch.retry_delay_ms, 1_000);
        batch.validate().unwrap();

        let aggregation = &config.program.aggregations[0];
        assert_eq!(aggregation.period, AggregationPeriod::Minutes);
        assert_eq!(aggregation.combiner, Combiner::Average);
        assert_eq!(aggregation.timestamp_field, "timestamp");
    }

    #[test]
    fn test_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        let config = EngineConfig::from_file(file.path()).unwrap();
        assert_eq!(config.program.pipelines.len(), 2);
    }

    #[test]
    fn test_validation_failures() {
        let mut config = EngineConfig::from_toml_str(SAMPLE).unwrap();
        config.program.pipelines[1].name = "readings".to_string();
        assert!(matches!(config.validate(), Err(RustFlowError::InvalidConfig(_))));

        let mut config = EngineConfig::from_toml_str(SAMPLE).unwrap();
        config.program.aggregations[0].report_to.clear();
        assert!(config.validate().is_err());

        let mut config = EngineConfig::from_toml_str(SAMPLE).unwrap();
        config.program.aggregations[0].combiner = Combiner::Unrecognized;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::from_toml_str(SAMPLE).unwrap();
        config.program.aggregations[0].report_to = "rolups".to_string();
        let err = config.validate().err().unwrap().to_string();
        assert!(err.contains("unknown pipeline 'rolups'"));

        let mut config = EngineConfig::from_toml_str(SAMPLE).unwrap();
        config.program.aggregations[0].bucket_time_offset_seconds = MAX_BUCKET_OFFSET_SECONDS;
        config.validate().unwrap();
        config.program.aggregations[0].bucket_time_offset_seconds = -(MAX_BUCKET_OFFSET_SECONDS + 1);
        assert!(config.validate().is_err());
        config.program.aggregations[0].bucket_time_offset_seconds = i64::MAX / 100;
        assert!(config.validate().is_err());
        config.program.aggregations[0].bucket_time_offset_seconds = i64::MIN;
        assert!(config.validate().is_err());

        assert!(BatchSinkConfig::default().validate().is_err());
        assert!(matches!(
            EngineConfig::from_toml_str("driver = 3"),
            Err(RustFlowError::Config(_))
        ));
    }

    #[test]
    fn test_nested_stage_options() {
        let stage = StageConfig::new("anyOf").with(
            "filters",
            serde_json::json!([{"kind": "hasField", "field": "a"}, {"kind": "flagSet", "flag": "f"}]),
        );
        let nested = stage.nested("filters").unwrap();
        assert_eq!(nested.len(), 2);
        assert_eq!(nested[1].str_option("flag").unwrap(), "f");
        assert!(StageConfig::new("not").nested("filter").is_err());
    }
}
