use crate::context::StreamProcessingContext;
use crate::error::{Result, RustFlowError};
use crate::source::backoff::sleep_or_cancel;
use crate::source::{Retrieval, RetrievalHook};
use crate::types::MessageAndRouting;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Interval between reload attempts while the pending queue is empty
pub const RELOAD_CADENCE: Duration = Duration::from_millis(10);

/// Upstream that delivers messages in batches
#[async_trait]
pub trait BatchReload: Send + Sync {
    /// Fetch the next batch. An empty batch means "nothing yet";
    /// `Ok(None)` means the upstream will never produce again.
    async fn reload(&self, ctx: &StreamProcessingContext) -> Result<Option<Vec<MessageAndRouting>>>;
}

/// Retrieval hook that buffers batches from a [`BatchReload`] and hands
/// them out one at a time
pub struct QueuingSource<R> {
    reloader: R,
    pending: Mutex<VecDeque<MessageAndRouting>>,
    exhausted: AtomicBool,
}

impl<R: BatchReload> QueuingSource<R> {
    pub fn new(reloader: R) -> Self {
        Self {
            reloader,
            pending: Mutex::new(VecDeque::new()),
            exhausted: AtomicBool::new(false),
        }
    }

    pub fn reloader(&self) -> &R {
        &self.reloader
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    fn dequeue(&self) -> Option<MessageAndRouting> {
        self.pending.lock().pop_front()
    }
}

#[async_trait]
impl<R: BatchReload> RetrievalHook for QueuingSource<R> {
    async fn retrieve(&self, ctx: &StreamProcessingContext, deadline: Instant) -> Result<Retrieval> {
        loop {
            if let Some(message) = self.dequeue() {
                return Ok(Retrieval::Message(message));
            }
            if self.exhausted.load(Ordering::SeqCst) {
                return Ok(Retrieval::Exhausted);
            }

            match self.reloader.reload(ctx).await? {
                Some(batch) if !batch.is_empty() => {
                    debug!("Reloaded {} messages", batch.len());
                    self.pending.lock().extend(batch);
                    continue;
                }
                Some(_) => trace!("Reload returned an empty batch"),
                None => {
                    debug!("Batch upstream exhausted");
                    self.exhausted.store(true, Ordering::SeqCst);
                    continue;
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(Retrieval::Empty);
            }
            let delay = RELOAD_CADENCE.min(deadline - now);
            if !sleep_or_cancel(delay, ctx.cancel_signal()).await {
                return Err(RustFlowError::Cancelled);
            }
        }
    }
}
