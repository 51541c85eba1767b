use crate::bucketing::AggregationTarget;
use crate::context::StreamProcessingContext;
use crate::error::Result;
use crate::source::{Retrieval, RetrievalHook};
use crate::types::{Message, MessageAndRouting, PipelineName};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Default)]
struct MemoryState {
    queue: VecDeque<MessageAndRouting>,
    finished: bool,
}

/// In-process supply fed by producers holding a clone of the handle.
///
/// Aggregation output is re-injected through this supply: offered messages
/// are routed to `default_pipeline`.
#[derive(Debug, Clone)]
pub struct MemorySupply {
    default_pipeline: PipelineName,
    state: Arc<Mutex<MemoryState>>,
}

impl MemorySupply {
    pub fn new(default_pipeline: impl Into<PipelineName>) -> Self {
        Self {
            default_pipeline: default_pipeline.into(),
            state: Arc::new(Mutex::new(MemoryState::default())),
        }
    }

    pub fn default_pipeline(&self) -> &str {
        &self.default_pipeline
    }

    pub fn offer(&self, message: MessageAndRouting) {
        self.state.lock().queue.push_back(message);
    }

    pub fn offer_message(&self, message: Message) {
        self.offer(MessageAndRouting::new(message, self.default_pipeline.clone()));
    }

    /// No more messages will be offered; the source reports EOF once drained
    pub fn finish(&self) {
        debug!("Memory supply for '{}' finished", self.default_pipeline);
        self.state.lock().finished = true;
    }

    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().queue.is_empty()
    }

    /// Take everything currently queued
    pub fn drain(&self) -> Vec<MessageAndRouting> {
        self.state.lock().queue.drain(..).collect()
    }
}

#[async_trait]
impl RetrievalHook for MemorySupply {
    async fn retrieve(&self, _ctx: &StreamProcessingContext, _deadline: Instant) -> Result<Retrieval> {
        let mut state = self.state.lock();
        Ok(match state.queue.pop_front() {
            Some(message) => Retrieval::Message(message),
            None if state.finished => Retrieval::Exhausted,
            None => Retrieval::Empty,
        })
    }
}

impl AggregationTarget for MemorySupply {
    fn offer(&self, message: Message) -> Result<()> {
        self.offer_message(message);
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.finish();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{BackoffSource, Source};
    use std::time::Duration;

    #[tokio::test]
    async fn test_offered_messages_flow_through_backoff_source() {
        let ctx = StreamProcessingContext::new("tester");
        let supply = MemorySupply::new("aggregates");
        let source = BackoffSource::new("memory", supply.clone());

        let mut msg = Message::new();
        msg.put_value("value", 1);
        supply.offer_message(msg.clone());

        let next = source
            .get_next_message(&ctx, Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(next.pipeline, "aggregates");
        assert_eq!(next.message, msg);
    }

    #[tokio::test]
    async fn test_message_offered_during_wait_is_returned() {
        let ctx = StreamProcessingContext::new("tester");
        let supply = MemorySupply::new("main");
        let source = BackoffSource::new("memory", supply.clone());

        let producer = supply.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            producer.offer_message(Message::new());
        });

        let next = source
            .get_next_message(&ctx, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(next.is_some());
    }

    #[tokio::test]
    async fn test_finished_supply_reports_eof_after_drain() {
        let ctx = StreamProcessingContext::new("tester");
        let supply = MemorySupply::new("main");
        let source = BackoffSource::new("memory", supply.clone());

        supply.offer_message(Message::new());
        AggregationTarget::close(&supply).unwrap();

        assert!(source.get_next_message(&ctx, Duration::ZERO).await.unwrap().is_some());
        assert!(!source.is_eof());
        assert!(source.get_next_message(&ctx, Duration::ZERO).await.unwrap().is_none());
        assert!(source.is_eof());
    }
}
