use crate::context::expression::{Expression, ValueSource};
use crate::error::{Result, RustFlowError};
use crate::metrics::StreamMetrics;
use crate::program::Program;
use crate::source::backoff::CancelSignal;
use crate::source::Source;
use crate::types::{MessageAndRouting, SerialId};
use parking_lot::{Mutex, RwLock};
use serde_json::Value as JsonValue;
use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, warn};
use uuid::Uuid;

type NamedObject = Arc<dyn Any + Send + Sync>;

/// Monotonic serial id generator shared by all message contexts of a stream
#[derive(Debug, Default)]
pub struct SerialGenerator {
    last: AtomicU64,
}

impl SerialGenerator {
    pub fn next(&self) -> SerialId {
        self.last.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn last(&self) -> SerialId {
        self.last.load(Ordering::SeqCst)
    }
}

/// Execution state for one pipeline run.
///
/// The failed flag is sticky: once `fail` has been called the driver stops
/// pulling messages for this stream. Flags and arbitrary side-channel objects
/// share one named-object table.
pub struct StreamProcessingContext {
    stream_id: String,
    operator: String,
    failed: AtomicBool,
    failure_reason: Mutex<Option<String>>,
    named_objects: Mutex<HashMap<String, NamedObject>>,
    evaluators: RwLock<Vec<Arc<dyn ValueSource>>>,
    source: RwLock<Option<Arc<dyn Source>>>,
    program: Option<Arc<Program>>,
    metrics: Arc<StreamMetrics>,
    serials: SerialGenerator,
    cancel: CancelSignal,
}

impl StreamProcessingContext {
    pub fn new(operator: impl Into<String>) -> Self {
        Self {
            stream_id: Uuid::new_v4().to_string(),
            operator: operator.into(),
            failed: AtomicBool::new(false),
            failure_reason: Mutex::new(None),
            named_objects: Mutex::new(HashMap::new()),
            evaluators: RwLock::new(Vec::new()),
            source: RwLock::new(None),
            program: None,
            metrics: StreamMetrics::new(),
            serials: SerialGenerator::default(),
            cancel: CancelSignal::new(),
        }
    }

    pub fn with_stream_id(mut self, stream_id: impl Into<String>) -> Self {
        self.stream_id = stream_id.into();
        self
    }

    pub fn with_program(mut self, program: Arc<Program>) -> Self {
        self.program = Some(program);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<StreamMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_source(self, source: Arc<dyn Source>) -> Self {
        self.set_source(Some(source));
        self
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn operator(&self) -> &str {
        &self.operator
    }

    pub fn program(&self) -> Option<&Arc<Program>> {
        self.program.as_ref()
    }

    pub fn metrics(&self) -> &Arc<StreamMetrics> {
        &self.metrics
    }

    pub fn next_serial(&self) -> SerialId {
        self.serials.next()
    }

    pub fn serials(&self) -> &SerialGenerator {
        &self.serials
    }

    pub fn cancel_signal(&self) -> &CancelSignal {
        &self.cancel
    }

    /// Abort any in-flight bounded wait on this stream
    pub fn cancel(&self) {
        debug!("Cancelling waits on stream {}", self.stream_id);
        self.cancel.cancel();
    }

    pub fn set_source(&self, source: Option<Arc<dyn Source>>) {
        *self.source.write() = source;
    }

    pub fn source(&self) -> Option<Arc<dyn Source>> {
        self.source.read().clone()
    }

    /// Mark the stream as failed. Only the first reason is kept.
    pub fn fail(&self, reason: impl Into<String>) {
        let reason = reason.into();
        if self
            .failed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            error!("Stream {} failed: {}", self.stream_id, reason);
            *self.failure_reason.lock() = Some(reason);
            self.metrics.stream_failures.inc();
        } else {
            debug!("Stream {} already failed, ignoring: {}", self.stream_id, reason);
        }
    }

    pub fn failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    pub fn failure_reason(&self) -> Option<String> {
        self.failure_reason.lock().clone()
    }

    pub fn set_flag(&self, name: &str) {
        self.named_objects
            .lock()
            .insert(name.to_string(), Arc::new(true));
    }

    pub fn check_flag(&self, name: &str) -> bool {
        self.get_named_object::<bool>(name)
            .map(|flag| *flag)
            .unwrap_or(false)
    }

    pub fn clear_flag(&self, name: &str) {
        let mut objects = self.named_objects.lock();
        if objects.get(name).map_or(false, |obj| obj.is::<bool>()) {
            objects.remove(name);
        }
    }

    pub fn add_named_object<T: Any + Send + Sync>(&self, name: impl Into<String>, value: T) {
        self.add_shared_object(name, Arc::new(value));
    }

    pub fn add_shared_object<T: Any + Send + Sync>(&self, name: impl Into<String>, value: Arc<T>) {
        self.named_objects.lock().insert(name.into(), value);
    }

    pub fn get_named_object<T: Any + Send + Sync>(&self, name: &str) -> Option<Arc<T>> {
        let object = self.named_objects.lock().get(name).cloned()?;
        object.downcast::<T>().ok()
    }

    /// Like [`get_named_object`](Self::get_named_object) but distinguishes a
    /// missing entry from one of the wrong type
    pub fn get_required_named_object<T: Any + Send + Sync>(&self, name: &str) -> Result<Arc<T>> {
        let object = self
            .named_objects
            .lock()
            .get(name)
            .cloned()
            .ok_or_else(|| RustFlowError::NamedObjectMissing(name.to_string()))?;
        object.downcast::<T>().map_err(|_| RustFlowError::NamedObjectType {
            name: name.to_string(),
            expected: std::any::type_name::<T>(),
        })
    }

    pub fn remove_named_object(&self, name: &str) -> bool {
        self.named_objects.lock().remove(name).is_some()
    }

    pub fn push_evaluator(&self, evaluator: Arc<dyn ValueSource>) {
        self.evaluators.write().push(evaluator);
    }

    pub fn pop_evaluator(&self) -> Option<Arc<dyn ValueSource>> {
        self.evaluators.write().pop()
    }

    /// Evaluators ordered for lookup, most recently pushed first
    pub fn evaluators(&self) -> Vec<Arc<dyn ValueSource>> {
        self.evaluators.read().iter().rev().cloned().collect()
    }

    /// Evaluate against the evaluator stack only
    pub fn eval_expression(&self, text: &str) -> Result<Option<JsonValue>> {
        let expression = Expression::parse(text)?;
        let evaluators = self.evaluators();
        let sources: Vec<&dyn ValueSource> = evaluators.iter().map(|e| e.as_ref()).collect();
        Ok(expression.evaluate(&sources))
    }

    /// Hand a message back to the active source's retry buffer
    pub fn requeue(&self, message: MessageAndRouting) {
        match self.source() {
            Some(source) => {
                source.requeue(message);
                self.metrics.messages_requeued.inc();
            }
            None => warn!(
                "Stream {} has no active source, dropping requeue for pipeline '{}'",
                self.stream_id, message.pipeline
            ),
        }
    }
}
