//! Pipeline composition.
//!
//! A [`StageRegistry`] maps discriminator strings from configuration to
//! factories for filters, processors and sinks. A [`Program`] is the built
//! result: named pipelines plus the aggregation services and in-memory
//! supplies that connect them.

pub mod driver;

use crate::bucketing::{BucketingService, JsonFieldBridge};
use crate::config::{AggregationConfig, BatchSinkConfig, ProgramConfig, StageConfig};
use crate::context::TargetType;
use crate::error::{Result, RustFlowError};
use crate::filter::{
    parse_timestamp_millis, AllOf, AnyOf, Equals, Filter, FlagSet, HasField, Matches, Not, OneOf,
    Range, TimeRange,
};
use crate::processor::{ClearFlag, Processor, RemoveFields, RunningStatistics, SetField, SetFlag};
use crate::sink::{BatchedRetrySink, HttpBatchTransport, LineWriterSink, Sink};
use crate::source::backoff::CancelSignal;
use crate::source::MemorySupply;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};

pub use driver::{DriverStats, PipelineDriver, StageErrorPolicy};

pub type FilterFactory = Arc<dyn Fn(&StageConfig, &StageRegistry) -> Result<Box<dyn Filter>> + Send + Sync>;
pub type ProcessorFactory = Arc<dyn Fn(&StageConfig) -> Result<Box<dyn Processor>> + Send + Sync>;
pub type SinkFactory = Arc<dyn Fn(&StageConfig, &BuildContext<'_>) -> Result<Arc<dyn Sink>> + Send + Sync>;

/// Objects a sink factory may link against while a program is being built
pub struct BuildContext<'a> {
    pub aggregations: &'a HashMap<String, Arc<BucketingService>>,
}

pub enum Stage {
    /// Halts the message when the filter rejects it
    Filter(Box<dyn Filter>),
    Processor(Box<dyn Processor>),
}

pub struct NamedStage {
    pub name: String,
    pub stage: Stage,
}

pub struct StageRegistry {
    filters: HashMap<String, FilterFactory>,
    processors: HashMap<String, ProcessorFactory>,
    sinks: HashMap<String, SinkFactory>,
}

impl Default for StageRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl StageRegistry {
    pub fn empty() -> Self {
        Self {
            filters: HashMap::new(),
            processors: HashMap::new(),
            sinks: HashMap::new(),
        }
    }

    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        register_builtin_filters(&mut registry);
        register_builtin_processors(&mut registry);
        register_builtin_sinks(&mut registry);
        registry
    }

    pub fn register_filter<F>(&mut self, kind: impl Into<String>, factory: F)
    where
        F: Fn(&StageConfig, &StageRegistry) -> Result<Box<dyn Filter>> + Send + Sync + 'static,
    {
        self.filters.insert(kind.into(), Arc::new(factory));
    }

    pub fn register_processor<F>(&mut self, kind: impl Into<String>, factory: F)
    where
        F: Fn(&StageConfig) -> Result<Box<dyn Processor>> + Send + Sync + 'static,
    {
        self.processors.insert(kind.into(), Arc::new(factory));
    }

    pub fn register_sink<F>(&mut self, kind: impl Into<String>, factory: F)
    where
        F: Fn(&StageConfig, &BuildContext<'_>) -> Result<Arc<dyn Sink>> + Send + Sync + 'static,
    {
        self.sinks.insert(kind.into(), Arc::new(factory));
    }

    pub fn build_filter(&self, config: &StageConfig) -> Result<Box<dyn Filter>> {
        let factory = self.filters.get(&config.kind).ok_or_else(|| RustFlowError::UnknownKind {
            category: "filter",
            kind: config.kind.clone(),
        })?;
        factory(config, self)
    }

    /// Processors take precedence when a kind is registered as both
    pub fn build_stage(&self, config: &StageConfig) -> Result<NamedStage> {
        let stage = if let Some(factory) = self.processors.get(&config.kind) {
            Stage::Processor(factory(config)?)
        } else if self.filters.contains_key(&config.kind) {
            Stage::Filter(self.build_filter(config)?)
        } else {
            return Err(RustFlowError::UnknownKind {
                category: "stage",
                kind: config.kind.clone(),
            });
        };
        Ok(NamedStage {
            name: config.kind.clone(),
            stage,
        })
    }

    pub fn build_sink(&self, config: &StageConfig, ctx: &BuildContext<'_>) -> Result<Arc<dyn Sink>> {
        let factory = self.sinks.get(&config.kind).ok_or_else(|| RustFlowError::UnknownKind {
            category: "sink",
            kind: config.kind.clone(),
        })?;
        factory(config, ctx)
    }
}

fn register_builtin_filters(registry: &mut StageRegistry) {
    registry.register_filter("equals", |c, _| {
        Ok(Box::new(Equals::new(c.str_option("field")?, c.value_option("value")?.clone())))
    });
    registry.register_filter("oneOf", |c, _| {
        let values = c
            .value_option("values")?
            .as_array()
            .cloned()
            .ok_or_else(|| RustFlowError::InvalidConfig("oneOf.values must be an array".to_string()))?;
        Ok(Box::new(OneOf::new(c.str_option("field")?, values)))
    });
    registry.register_filter("matches", |c, _| {
        Ok(Box::new(Matches::new(c.str_option("field")?, c.str_option("pattern")?)?))
    });
    registry.register_filter("range", |c, _| {
        Ok(Box::new(Range::new(
            c.str_option("field")?,
            c.f64_option("lower"),
            c.f64_option("upper"),
        )))
    });
    registry.register_filter("timeRange", |c, _| {
        let bound = |key: &str| c.options.get(key).and_then(parse_timestamp_millis);
        Ok(Box::new(TimeRange::new(c.str_option("field")?, bound("after"), bound("before"))))
    });
    registry.register_filter("hasField", |c, _| Ok(Box::new(HasField(c.str_option("field")?.to_string()))));
    registry.register_filter("flagSet", |c, _| Ok(Box::new(FlagSet(c.str_option("flag")?.to_string()))));
    registry.register_filter("not", |c, r| {
        let mut inner = c.nested("filter")?;
        if inner.len() != 1 {
            return Err(RustFlowError::InvalidConfig("not.filter must be a single filter".to_string()));
        }
        Ok(Box::new(Not(r.build_filter(&inner.remove(0))?)))
    });
    registry.register_filter("allOf", |c, r| {
        let filters = c.nested("filters")?.iter().map(|f| r.build_filter(f)).collect::<Result<_>>()?;
        Ok(Box::new(AllOf(filters)))
    });
    registry.register_filter("anyOf", |c, r| {
        let filters = c.nested("filters")?.iter().map(|f| r.build_filter(f)).collect::<Result<_>>()?;
        Ok(Box::new(AnyOf(filters)))
    });
}

fn register_builtin_processors(registry: &mut StageRegistry) {
    registry.register_processor("runningStatistics", |c| {
        let value_field = c.str_option("value_field")?;
        let prefix = c
            .optional_str("prefix")
            .map(str::to_string)
            .unwrap_or_else(|| format!("{}_stats", value_field));
        Ok(Box::new(RunningStatistics::new(value_field, c.string_list("key_fields"), prefix)))
    });
    registry.register_processor("setField", |c| {
        let target: TargetType = c.optional_str("type").unwrap_or("string").parse()?;
        let processor = SetField::new(c.str_option("field")?, c.str_option("expression")?, target);
        let required = c.options.get("required").and_then(|v| v.as_bool()).unwrap_or(false);
        Ok(Box::new(if required { processor.required() } else { processor }))
    });
    registry.register_processor("removeFields", |c| Ok(Box::new(RemoveFields(c.string_list("fields")))));
    registry.register_processor("setFlag", |c| Ok(Box::new(SetFlag(c.str_option("flag")?.to_string()))));
    registry.register_processor("clearFlag", |c| Ok(Box::new(ClearFlag(c.str_option("flag")?.to_string()))));
}

fn register_builtin_sinks(registry: &mut StageRegistry) {
    registry.register_sink("stdout", |_, _| Ok(Arc::new(LineWriterSink::stdout())));
    registry.register_sink("batched", |c, _| {
        let config: BatchSinkConfig = c.parse_options()?;
        config.validate()?;
        let transport = HttpBatchTransport::from_config(&config);
        Ok(Arc::new(BatchedRetrySink::from_config(transport, &config)))
    });
    registry.register_sink("aggregate", |c, ctx| {
        let name = c.str_option("aggregation")?;
        let service = ctx
            .aggregations
            .get(name)
            .cloned()
            .ok_or_else(|| RustFlowError::NotFound(format!("aggregation '{}'", name)))?;
        Ok(service)
    });
}

pub struct PipelineDefinition {
    pub name: String,
    pub stages: Vec<NamedStage>,
    pub sink: Arc<dyn Sink>,
}

/// Built pipelines and the aggregation plumbing between them
#[derive(Default)]
pub struct Program {
    pipelines: HashMap<String, Arc<PipelineDefinition>>,
    aggregations: HashMap<String, Arc<BucketingService>>,
    idle_flush: HashMap<String, Duration>,
    /// Keyed by the pipeline name aggregated output is routed to
    supplies: HashMap<String, MemorySupply>,
}

impl Program {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn build(config: &ProgramConfig, registry: &StageRegistry) -> Result<Self> {
        config.validate()?;
        let mut program = Program::new();

        for aggregation in &config.aggregations {
            program.add_aggregation(aggregation)?;
        }

        for pipeline in &config.pipelines {
            let stages = pipeline
                .stages
                .iter()
                .map(|stage| registry.build_stage(stage))
                .collect::<Result<Vec<_>>>()?;
            let sink = registry.build_sink(
                &pipeline.sink,
                &BuildContext {
                    aggregations: &program.aggregations,
                },
            )?;
            program.add_pipeline(PipelineDefinition {
                name: pipeline.name.clone(),
                stages,
                sink,
            });
        }

        info!(
            "Built program with {} pipelines and {} aggregations",
            program.pipelines.len(),
            program.aggregations.len()
        );
        Ok(program)
    }

    pub fn add_pipeline(&mut self, pipeline: PipelineDefinition) {
        debug!("Registering pipeline '{}' with {} stages", pipeline.name, pipeline.stages.len());
        self.pipelines.insert(pipeline.name.clone(), Arc::new(pipeline));
    }

    /// Create the bucketing service for `config` and the supply it reports to
    pub fn add_aggregation(&mut self, config: &AggregationConfig) -> Result<Arc<BucketingService>> {
        let supply = self
            .supplies
            .entry(config.report_to.clone())
            .or_insert_with(|| MemorySupply::new(config.report_to.clone()))
            .clone();
        let bridge = JsonFieldBridge::new(
            config.timestamp_field.clone(),
            config.key_fields.clone(),
            config.value_field.clone(),
            config.combiner,
        );
        let service = Arc::new(
            BucketingService::new(
                config.period,
                config.bucket_time_offset_seconds,
                Arc::new(bridge),
                Arc::new(supply),
            )?
            .with_max_fillers(config.max_fillers),
        );
        if let Some(ms) = config.idle_flush_ms {
            self.idle_flush.insert(config.name.clone(), Duration::from_millis(ms));
        }
        self.aggregations.insert(config.name.clone(), service.clone());
        Ok(service)
    }

    pub fn pipeline(&self, name: &str) -> Option<&Arc<PipelineDefinition>> {
        self.pipelines.get(name)
    }

    pub fn pipelines(&self) -> impl Iterator<Item = &Arc<PipelineDefinition>> {
        self.pipelines.values()
    }

    pub fn aggregation(&self, name: &str) -> Option<&Arc<BucketingService>> {
        self.aggregations.get(name)
    }

    /// In-memory supply carrying aggregated output routed to `pipeline`
    pub fn supply(&self, pipeline: &str) -> Option<&MemorySupply> {
        self.supplies.get(pipeline)
    }

    pub fn supplies(&self) -> impl Iterator<Item = (&String, &MemorySupply)> {
        self.supplies.iter()
    }

    /// Sinks of all pipelines, each shared sink listed once
    pub fn sinks(&self) -> Vec<Arc<dyn Sink>> {
        dedup_sinks(self.pipelines.values())
    }

    /// Sinks of the named pipelines, each shared sink listed once
    pub fn sinks_of<'a>(&self, names: impl IntoIterator<Item = &'a str>) -> Vec<Arc<dyn Sink>> {
        dedup_sinks(names.into_iter().filter_map(|name| self.pipelines.get(name)))
    }

    /// Start the idle flush task of every aggregation configured with one
    pub fn spawn_idle_flushes(&self, cancel: &CancelSignal) -> Vec<JoinHandle<()>> {
        self.idle_flush
            .iter()
            .filter_map(|(name, interval)| {
                self.aggregations
                    .get(name)
                    .map(|service| service.spawn_idle_flush(*interval, cancel.clone()))
            })
            .collect()
    }
}

fn dedup_sinks<'a>(pipelines: impl Iterator<Item = &'a Arc<PipelineDefinition>>) -> Vec<Arc<dyn Sink>> {
    let mut sinks: Vec<Arc<dyn Sink>> = Vec::new();
    for pipeline in pipelines {
        if !sinks.iter().any(|s| Arc::ptr_eq(s, &pipeline.sink)) {
            sinks.push(pipeline.sink.clone());
        }
    }
    sinks
}
