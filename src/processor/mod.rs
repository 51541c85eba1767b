//! In-place message transforms.

use crate::context::{MessageProcessingContext, TargetType};
use crate::error::{Result, RustFlowError};
use crate::filter::Filter;
use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::trace;

pub trait Processor: Send + Sync {
    fn process(&self, ctx: &mut MessageProcessingContext) -> Result<()>;
}

/// Welford accumulator for one key
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Accumulator {
    pub count: u64,
    pub mean: f64,
    pub min: f64,
    pub max: f64,
    m2: f64,
}

impl Accumulator {
    pub fn push(&mut self, value: f64) {
        if self.count == 0 {
            self.min = value;
            self.max = value;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }
        self.count += 1;
        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (value - self.mean);
    }

    /// Sample standard deviation, zero until two values have been seen
    pub fn stddev(&self) -> f64 {
        if self.count < 2 {
            0.0
        } else {
            (self.m2 / (self.count - 1) as f64).sqrt()
        }
    }
}

/// Running count/mean/min/max/stddev of a numeric field, tracked separately
/// for every distinct key. Results are written back onto each message as
/// `<prefix>_count`, `<prefix>_mean` and so on.
pub struct RunningStatistics {
    value_field: String,
    key_fields: Vec<String>,
    prefix: String,
    state: Mutex<HashMap<String, Accumulator>>,
}

impl RunningStatistics {
    pub fn new(value_field: impl Into<String>, key_fields: Vec<String>, prefix: impl Into<String>) -> Self {
        Self {
            value_field: value_field.into(),
            key_fields,
            prefix: prefix.into(),
            state: Mutex::new(HashMap::new()),
        }
    }

    pub fn snapshot(&self, key: &str) -> Option<Accumulator> {
        self.state.lock().get(key).cloned()
    }

    fn key_of(&self, ctx: &MessageProcessingContext) -> String {
        self.key_fields
            .iter()
            .map(|field| ctx.message().get_value_as_string(field, ""))
            .collect::<Vec<_>>()
            .join("|")
    }
}

impl Processor for RunningStatistics {
    fn process(&self, ctx: &mut MessageProcessingContext) -> Result<()> {
        let value = ctx.message().get_double(&self.value_field, f64::NAN);
        if value.is_nan() {
            ctx.warn(format!(
                "running statistics: field '{}' is missing or not numeric",
                self.value_field
            ));
            return Ok(());
        }

        let key = self.key_of(ctx);
        let stats = {
            let mut state = self.state.lock();
            let acc = state.entry(key).or_default();
            acc.push(value);
            acc.clone()
        };

        let prefix = &self.prefix;
        ctx.message_mut()
            .put_value(format!("{}_count", prefix), stats.count)
            .put_value(format!("{}_mean", prefix), stats.mean)
            .put_value(format!("{}_min", prefix), stats.min)
            .put_value(format!("{}_max", prefix), stats.max)
            .put_value(format!("{}_stddev", prefix), stats.stddev());
        Ok(())
    }
}

/// Evaluate an expression and store the result in a field
pub struct SetField {
    field: String,
    expression: String,
    target: TargetType,
    required: bool,
}

impl SetField {
    pub fn new(field: impl Into<String>, expression: impl Into<String>, target: TargetType) -> Self {
        Self {
            field: field.into(),
            expression: expression.into(),
            target,
            required: false,
        }
    }

    /// Fail the stage instead of skipping when the expression does not resolve
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }
}

impl Processor for SetField {
    fn process(&self, ctx: &mut MessageProcessingContext) -> Result<()> {
        match ctx.eval_expression(&self.expression, self.target, &[])? {
            Some(value) => {
                ctx.message_mut().put_value(self.field.clone(), value);
                Ok(())
            }
            None if self.required => Err(RustFlowError::stage(
                "setField",
                format!("expression '{}' did not resolve", self.expression),
            )),
            None => {
                trace!("setField: '{}' unresolved, leaving '{}' unset", self.expression, self.field);
                Ok(())
            }
        }
    }
}

pub struct RemoveFields(pub Vec<String>);

impl Processor for RemoveFields {
    fn process(&self, ctx: &mut MessageProcessingContext) -> Result<()> {
        for field in &self.0 {
            ctx.message_mut().remove_value(field);
        }
        Ok(())
    }
}

/// Halts the message when the wrapped filter rejects it
pub struct FilterGate(pub Box<dyn Filter>);

impl Processor for FilterGate {
    fn process(&self, ctx: &mut MessageProcessingContext) -> Result<()> {
        if !self.0.passes(ctx) {
            trace!("Message #{} rejected by {}", ctx.serial(), self.0.describe());
            ctx.stop_processing();
        }
        Ok(())
    }
}

pub struct SetFlag(pub String);

impl Processor for SetFlag {
    fn process(&self, ctx: &mut MessageProcessingContext) -> Result<()> {
        ctx.stream().set_flag(&self.0);
        Ok(())
    }
}

pub struct ClearFlag(pub String);

impl Processor for ClearFlag {
    fn process(&self, ctx: &mut MessageProcessingContext) -> Result<()> {
        ctx.stream().clear_flag(&self.0);
        Ok(())
    }
}
