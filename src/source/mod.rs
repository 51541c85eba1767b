//! Message sources.
//!
//! Every source shares the same retrieval discipline, implemented once in
//! [`BackoffSource`]:
//!
//! - a FIFO requeue buffer that is always drained before fresh input
//! - bounded-wait polling of a [`RetrievalHook`] with Fibonacci backoff
//!   between empty polls
//! - EOF only when the requeue buffer is empty and the supply is exhausted

pub mod backoff;
pub mod lines;
pub mod memory;
pub mod queuing;

use crate::context::StreamProcessingContext;
use crate::error::{Result, RustFlowError};
use crate::types::MessageAndRouting;
use async_trait::async_trait;
use backoff::{sleep_or_cancel, FibonacciBackoff};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

pub use backoff::{CancelSignal, FIBONACCI_DELAYS_MS};
pub use lines::JsonLineReload;
pub use memory::MemorySupply;
pub use queuing::{BatchReload, QueuingSource};

/// Supplies `(message, routing)` pairs to a pipeline driver
#[async_trait]
pub trait Source: Send + Sync {
    /// Next message, waiting at most `timeout`. `Ok(None)` means nothing arrived in time.
    async fn get_next_message(
        &self,
        ctx: &StreamProcessingContext,
        timeout: Duration,
    ) -> Result<Option<MessageAndRouting>>;

    fn is_eof(&self) -> bool;

    /// Return a message to the front of the retry buffer
    fn requeue(&self, message: MessageAndRouting);

    async fn mark_complete(
        &self,
        _ctx: &StreamProcessingContext,
        _message: &MessageAndRouting,
    ) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Outcome of a single retrieval attempt
#[derive(Debug)]
pub enum Retrieval {
    Message(MessageAndRouting),
    Empty,
    /// The underlying supply will never produce again
    Exhausted,
}

/// Single-item retrieval step plugged into [`BackoffSource`]
#[async_trait]
pub trait RetrievalHook: Send + Sync {
    async fn retrieve(&self, ctx: &StreamProcessingContext, deadline: Instant) -> Result<Retrieval>;

    async fn mark_complete(
        &self,
        _ctx: &StreamProcessingContext,
        _message: &MessageAndRouting,
    ) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Default)]
struct SourceState {
    requeued: VecDeque<MessageAndRouting>,
    eof: bool,
}

/// Bounded-wait source with requeue buffer around a [`RetrievalHook`]
pub struct BackoffSource<H> {
    name: String,
    state: Mutex<SourceState>,
    hook: H,
}

impl<H: RetrievalHook> BackoffSource<H> {
    pub fn new(name: impl Into<String>, hook: H) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(SourceState::default()),
            hook,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn hook(&self) -> &H {
        &self.hook
    }

    /// Record that the underlying supply is exhausted
    pub fn mark_exhausted(&self) {
        self.state.lock().eof = true;
    }

    pub fn requeued_len(&self) -> usize {
        self.state.lock().requeued.len()
    }

    fn pop_requeued(&self) -> Option<MessageAndRouting> {
        self.state.lock().requeued.pop_front()
    }
}

#[async_trait]
impl<H: RetrievalHook> Source for BackoffSource<H> {
    async fn get_next_message(
        &self,
        ctx: &StreamProcessingContext,
        timeout: Duration,
    ) -> Result<Option<MessageAndRouting>> {
        if let Some(message) = self.pop_requeued() {
            debug!("Source '{}' returning requeued message", self.name);
            return Ok(Some(message));
        }

        let deadline = Instant::now() + timeout;
        let mut backoff = FibonacciBackoff::new();

        loop {
            match self.hook.retrieve(ctx, deadline).await? {
                Retrieval::Message(message) => return Ok(Some(message)),
                Retrieval::Exhausted => {
                    debug!("Source '{}' supply exhausted", self.name);
                    self.mark_exhausted();
                    return Ok(self.pop_requeued());
                }
                Retrieval::Empty => {}
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }

            let delay = backoff.next_delay().min(deadline - now);
            trace!(
                "Source '{}' empty poll {}, sleeping {:?}",
                self.name,
                backoff.step(),
                delay
            );
            if !sleep_or_cancel(delay, ctx.cancel_signal()).await {
                return Err(RustFlowError::Cancelled);
            }

            // Pick up requeues made by another task while we were waiting
            if let Some(message) = self.pop_requeued() {
                return Ok(Some(message));
            }
        }
    }

    fn is_eof(&self) -> bool {
        let state = self.state.lock();
        state.requeued.is_empty() && state.eof
    }

    fn requeue(&self, message: MessageAndRouting) {
        self.state.lock().requeued.push_back(message);
    }

    async fn mark_complete(
        &self,
        ctx: &StreamProcessingContext,
        message: &MessageAndRouting,
    ) -> Result<()> {
        self.hook.mark_complete(ctx, message).await
    }

    async fn close(&self) -> Result<()> {
        debug!("Closing source '{}'", self.name);
        self.hook.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Message;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Hook that never produces anything and counts how often it was asked
    #[derive(Default)]
    struct EmptyHook {
        polls: AtomicUsize,
        exhausted: bool,
    }

    #[async_trait]
    impl RetrievalHook for EmptyHook {
        async fn retrieve(&self, _ctx: &StreamProcessingContext, _deadline: Instant) -> Result<Retrieval> {
            self.polls.fetch_add(1, Ordering::SeqCst);
            if self.exhausted {
                Ok(Retrieval::Exhausted)
            } else {
                Ok(Retrieval::Empty)
            }
        }
    }

    struct FailingHook;

    #[async_trait]
    impl RetrievalHook for FailingHook {
        async fn retrieve(&self, _ctx: &StreamProcessingContext, _deadline: Instant) -> Result<Retrieval> {
            Err(RustFlowError::Retrieval("connection reset".to_string()))
        }
    }

    fn routed(id: i64) -> MessageAndRouting {
        let mut message = Message::new();
        message.put_value("id", id);
        MessageAndRouting::new(message, "main")
    }

    #[tokio::test]
    async fn test_requeued_message_returned_even_with_zero_timeout() {
        let ctx = StreamProcessingContext::new("tester");
        let source = BackoffSource::new("empty", EmptyHook::default());

        source.requeue(routed(1));
        let next = source
            .get_next_message(&ctx, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(next, Some(routed(1)));
        assert_eq!(source.hook().polls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_requeues_are_fifo() {
        let ctx = StreamProcessingContext::new("tester");
        let source = BackoffSource::new("empty", EmptyHook::default());

        source.requeue(routed(1));
        source.requeue(routed(2));
        source.requeue(routed(3));

        for expected in 1..=3 {
            let next = source.get_next_message(&ctx, Duration::ZERO).await.unwrap();
            assert_eq!(next, Some(routed(expected)));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_poll_times_out_with_none() {
        let ctx = StreamProcessingContext::new("tester");
        let source = BackoffSource::new("empty", EmptyHook::default());

        let started = Instant::now();
        let next = source
            .get_next_message(&ctx, Duration::from_millis(100))
            .await
            .unwrap();

        assert!(next.is_none());
        assert!(started.elapsed() >= Duration::from_millis(100));
        // 1+1+2+3+5+8+13+21+34 = 88ms, then one sleep clipped to the deadline
        let polls = source.hook().polls.load(Ordering::SeqCst);
        assert!((10..=12).contains(&polls), "unexpected poll count {}", polls);
    }

    #[tokio::test]
    async fn test_eof_requires_empty_requeue_buffer() {
        let ctx = StreamProcessingContext::new("tester");
        let source = BackoffSource::new(
            "exhausted",
            EmptyHook {
                polls: AtomicUsize::new(0),
                exhausted: true,
            },
        );

        assert!(!source.is_eof());
        assert!(source.get_next_message(&ctx, Duration::from_millis(50)).await.unwrap().is_none());
        assert!(source.is_eof());

        source.requeue(routed(7));
        assert!(!source.is_eof());

        let next = source.get_next_message(&ctx, Duration::ZERO).await.unwrap();
        assert_eq!(next, Some(routed(7)));
        assert!(source.is_eof());
    }

    #[tokio::test]
    async fn test_cancel_aborts_wait() {
        let ctx = Arc::new(StreamProcessingContext::new("tester"));
        let source = BackoffSource::new("empty", EmptyHook::default());

        let canceller = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let result = source.get_next_message(&ctx, Duration::from_secs(30)).await;
        assert!(matches!(result, Err(RustFlowError::Cancelled)));
    }

    #[tokio::test]
    async fn test_retrieval_faults_propagate() {
        let ctx = StreamProcessingContext::new("tester");
        let source = BackoffSource::new("broken", FailingHook);

        let result = source.get_next_message(&ctx, Duration::from_millis(10)).await;
        assert!(matches!(result, Err(RustFlowError::Retrieval(_))));
    }
}
