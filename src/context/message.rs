use crate::context::expression::{Expression, TargetType, ValueSource};
use crate::context::stream::StreamProcessingContext;
use crate::error::Result;
use crate::types::{value_to_plain_string, Message, MessageAndRouting, PipelineName, SerialId};
use serde_json::Value as JsonValue;
use std::sync::Arc;
use tracing::warn;

/// Execution state for one message travelling through a pipeline
pub struct MessageProcessingContext {
    message: Message,
    pipeline: PipelineName,
    serial: SerialId,
    stream: Arc<StreamProcessingContext>,
    stopped: bool,
}

impl MessageProcessingContext {
    pub fn new(stream: Arc<StreamProcessingContext>, routed: MessageAndRouting) -> Self {
        let serial = stream.next_serial();
        Self {
            message: routed.message,
            pipeline: routed.pipeline,
            serial,
            stream,
            stopped: false,
        }
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn message_mut(&mut self) -> &mut Message {
        &mut self.message
    }

    pub fn pipeline(&self) -> &str {
        &self.pipeline
    }

    pub fn serial(&self) -> SerialId {
        self.serial
    }

    pub fn stream(&self) -> &Arc<StreamProcessingContext> {
        &self.stream
    }

    /// Evaluate `text`, resolving paths against `extra` sources first, then the
    /// message's own fields, then the stream's evaluator stack.
    pub fn eval_expression(
        &self,
        text: &str,
        target: TargetType,
        extra: &[&dyn ValueSource],
    ) -> Result<Option<JsonValue>> {
        let expression = Expression::parse(text)?;
        self.evaluate_with(&expression, extra)
            .map(|value| target.coerce(value))
            .transpose()
    }

    /// Convenience for string-typed expressions such as destination names
    pub fn eval_string(&self, text: &str) -> Result<Option<String>> {
        Ok(self
            .eval_expression(text, TargetType::String, &[])?
            .map(|value| value_to_plain_string(&value)))
    }

    fn evaluate_with(&self, expression: &Expression, extra: &[&dyn ValueSource]) -> Option<JsonValue> {
        let evaluators = self.stream.evaluators();
        let mut sources: Vec<&dyn ValueSource> = Vec::with_capacity(extra.len() + 1 + evaluators.len());
        sources.extend_from_slice(extra);
        sources.push(&self.message);
        sources.extend(evaluators.iter().map(|e| e.as_ref()));
        expression.evaluate(&sources)
    }

    /// Skip the remaining stages for this message only
    pub fn stop_processing(&mut self) {
        self.stopped = true;
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Fail the whole stream, tagging the reason with this message's serial id
    pub fn fail(&self, reason: impl AsRef<str>) {
        self.stream
            .fail(format!("message #{}: {}", self.serial, reason.as_ref()));
    }

    pub fn warn(&self, text: impl AsRef<str>) {
        warn!(
            stream = %self.stream.stream_id(),
            serial = self.serial,
            "{}",
            text.as_ref()
        );
    }

    pub fn into_message(self) -> Message {
        self.message
    }

    pub fn into_routing(self) -> MessageAndRouting {
        MessageAndRouting::new(self.message, self.pipeline)
    }
}
