use crate::context::StreamProcessingContext;
use crate::error::Result;
use crate::source::queuing::BatchReload;
use crate::types::{Message, MessageAndRouting};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio::sync::Mutex;
use tracing::warn;

const DEFAULT_BATCH_SIZE: usize = 64;
const LINE_WAIT: Duration = Duration::from_millis(2);

/// Batch upstream reading one JSON object per line
///
/// Blank lines are skipped. Lines that are not JSON objects are logged and
/// counted, never fatal.
pub struct JsonLineReload<R> {
    lines: Mutex<Lines<R>>,
    pipeline: String,
    batch_size: usize,
    finished: AtomicBool,
    rejected: AtomicU64,
}

impl JsonLineReload<BufReader<Stdin>> {
    pub fn stdin(pipeline: impl Into<String>) -> Self {
        Self::new(BufReader::new(tokio::io::stdin()), pipeline)
    }
}

impl<R: AsyncBufRead + Unpin + Send> JsonLineReload<R> {
    pub fn new(reader: R, pipeline: impl Into<String>) -> Self {
        Self {
            lines: Mutex::new(reader.lines()),
            pipeline: pipeline.into(),
            batch_size: DEFAULT_BATCH_SIZE,
            finished: AtomicBool::new(false),
            rejected: AtomicU64::new(0),
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl<R: AsyncBufRead + Unpin + Send> BatchReload for JsonLineReload<R> {
    async fn reload(&self, _ctx: &StreamProcessingContext) -> Result<Option<Vec<MessageAndRouting>>> {
        if self.finished.load(Ordering::SeqCst) {
            return Ok(None);
        }

        let mut lines = self.lines.lock().await;
        let mut batch = Vec::new();
        while batch.len() < self.batch_size {
            // next_line is cancel safe, so a timed-out read loses nothing
            let line = match tokio::time::timeout(LINE_WAIT, lines.next_line()).await {
                Ok(line) => line?,
                Err(_) => break,
            };
            let Some(line) = line else {
                self.finished.store(true, Ordering::SeqCst);
                if batch.is_empty() {
                    return Ok(None);
                }
                break;
            };
            if line.trim().is_empty() {
                continue;
            }
            match Message::from_line(&line) {
                Ok(message) => batch.push(MessageAndRouting::new(message, self.pipeline.clone())),
                Err(e) => {
                    self.rejected.fetch_add(1, Ordering::Relaxed);
                    warn!("Skipping unparseable line: {}", e);
                }
            }
        }
        Ok(Some(batch))
    }
}
