use crate::config::BatchSinkConfig;
use crate::context::{MessageProcessingContext, StreamProcessingContext};
use crate::error::Result;
use crate::sink::Sink;
use crate::source::backoff::{sleep_or_cancel, CancelSignal};
use async_trait::async_trait;
use parking_lot::Mutex as SyncMutex;
use serde_json::Value as JsonValue;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Total delivery attempts per batch, including the first
pub const MAX_ATTEMPTS: u32 = 3;

const EVENTS_ROOT: &str = "events";

/// Delivers one serialized batch to a destination path
#[async_trait]
pub trait BatchTransport: Send + Sync {
    /// Returns the response status code. `Err` means the request never got a response.
    async fn send(&self, path: &str, body: Vec<u8>) -> Result<u16>;
}

/// Delay before retry number `attempt` (1-based)
pub type RetryBackoff = Arc<dyn Fn(u32) -> Duration + Send + Sync>;

#[derive(Debug, Default)]
struct PendingBatch {
    path: Option<String>,
    items: Vec<JsonValue>,
    oldest: Option<Instant>,
}

impl PendingBatch {
    fn is_aged(&self, max_age: Duration) -> bool {
        self.oldest.map_or(false, |oldest| oldest.elapsed() > max_age)
    }
}

#[derive(Debug, Default)]
struct Counters {
    batches_sent: AtomicU64,
    batches_dropped: AtomicU64,
    messages_sent: AtomicU64,
    attempts: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BatchedSinkStats {
    pub batches_sent: u64,
    pub batches_dropped: u64,
    pub messages_sent: u64,
    pub attempts: u64,
}

enum Outcome {
    Delivered,
    Rejected(u16),
    Retryable(String),
}

/// Best-effort sink that groups messages per destination path and delivers
/// each group as one JSON array.
///
/// Only one path is buffered at a time; a message for another path flushes
/// the current batch first. Failed deliveries are retried up to
/// [`MAX_ATTEMPTS`] times and then dropped. A 4xx response drops the batch
/// immediately. Delivery faults are logged and never returned to the caller.
///
/// Retry delays end early when the stream's cancel signal fires; the batch
/// is then dropped.
pub struct BatchedRetrySink<T> {
    transport: T,
    topic: Option<String>,
    stream: Option<String>,
    max_batch_len: usize,
    max_batch_age: Duration,
    backoff: RetryBackoff,
    pending: Mutex<PendingBatch>,
    counters: Counters,
    cancel: SyncMutex<CancelSignal>,
}

impl<T: BatchTransport> BatchedRetrySink<T> {
    pub fn new(transport: T, topic: Option<String>, stream: Option<String>) -> Self {
        let defaults = BatchSinkConfig::default();
        Self {
            transport,
            topic,
            stream,
            max_batch_len: defaults.max_batch_len,
            max_batch_age: Duration::from_millis(defaults.max_batch_age_ms),
            backoff: constant_backoff(Duration::from_millis(defaults.retry_delay_ms)),
            pending: Mutex::new(PendingBatch::default()),
            counters: Counters::default(),
            cancel: SyncMutex::new(CancelSignal::new()),
        }
    }

    pub fn from_config(transport: T, config: &BatchSinkConfig) -> Self {
        Self::new(transport, config.topic.clone(), config.stream.clone())
            .with_max_batch_len(config.max_batch_len)
            .with_max_batch_age(Duration::from_millis(config.max_batch_age_ms))
            .with_retry_delay(Duration::from_millis(config.retry_delay_ms))
    }

    pub fn with_max_batch_len(mut self, max_batch_len: usize) -> Self {
        self.max_batch_len = max_batch_len;
        self
    }

    pub fn with_max_batch_age(mut self, max_batch_age: Duration) -> Self {
        self.max_batch_age = max_batch_age;
        self
    }

    pub fn with_retry_delay(self, delay: Duration) -> Self {
        self.with_backoff(constant_backoff(delay))
    }

    pub fn with_backoff(mut self, backoff: RetryBackoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_cancel_signal(self, cancel: CancelSignal) -> Self {
        *self.cancel.lock() = cancel;
        self
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn stats(&self) -> BatchedSinkStats {
        BatchedSinkStats {
            batches_sent: self.counters.batches_sent.load(Ordering::Relaxed),
            batches_dropped: self.counters.batches_dropped.load(Ordering::Relaxed),
            messages_sent: self.counters.messages_sent.load(Ordering::Relaxed),
            attempts: self.counters.attempts.load(Ordering::Relaxed),
        }
    }

    /// `events`, `events/<topic>` or `events/<topic>/<stream>`. The stream
    /// segment is only used when the topic resolves.
    pub fn resolve_path(&self, ctx: &MessageProcessingContext) -> Result<String> {
        let Some(topic) = self.resolve(ctx, self.topic.as_deref())? else {
            return Ok(EVENTS_ROOT.to_string());
        };
        Ok(match self.resolve(ctx, self.stream.as_deref())? {
            Some(stream) => format!("{}/{}/{}", EVENTS_ROOT, topic, stream),
            None => format!("{}/{}", EVENTS_ROOT, topic),
        })
    }

    fn resolve(&self, ctx: &MessageProcessingContext, expression: Option<&str>) -> Result<Option<String>> {
        match expression {
            Some(expression) => Ok(ctx.eval_string(expression)?.filter(|s| !s.is_empty())),
            None => Ok(None),
        }
    }

    /// Flush only if the oldest buffered message is past the age limit
    pub async fn flush_if_aged(&self) {
        let mut pending = self.pending.lock().await;
        if pending.is_aged(self.max_batch_age) {
            self.flush_locked(&mut pending).await;
        }
    }

    async fn flush_locked(&self, pending: &mut PendingBatch) {
        let items = std::mem::take(&mut pending.items);
        let path = pending.path.take();
        pending.oldest = None;

        let Some(path) = path else { return };
        if items.is_empty() {
            return;
        }

        let count = items.len();
        let body = match serde_json::to_vec(&JsonValue::Array(items)) {
            Ok(body) => body,
            Err(e) => {
                error!("Dropping batch of {} for '{}': serialization failed: {}", count, path, e);
                self.counters.batches_dropped.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        for attempt in 1..=MAX_ATTEMPTS {
            self.counters.attempts.fetch_add(1, Ordering::Relaxed);
            match self.attempt(&path, body.clone()).await {
                Outcome::Delivered => {
                    info!("Delivered batch of {} to '{}' (attempt {})", count, path, attempt);
                    self.counters.batches_sent.fetch_add(1, Ordering::Relaxed);
                    self.counters.messages_sent.fetch_add(count as u64, Ordering::Relaxed);
                    return;
                }
                Outcome::Rejected(status) => {
                    warn!(
                        "Batch of {} for '{}' rejected with status {}, dropping",
                        count, path, status
                    );
                    self.counters.batches_dropped.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                Outcome::Retryable(reason) if attempt < MAX_ATTEMPTS => {
                    let delay = (self.backoff)(attempt);
                    warn!(
                        "Batch for '{}' failed (attempt {}), retrying in {}ms: {}",
                        path,
                        attempt,
                        delay.as_millis(),
                        reason
                    );
                    let cancel = self.cancel.lock().clone();
                    if !sleep_or_cancel(delay, &cancel).await {
                        error!(
                            "Dropping batch of {} for '{}': cancelled while waiting to retry",
                            count, path
                        );
                        self.counters.batches_dropped.fetch_add(1, Ordering::Relaxed);
                        return;
                    }
                }
                Outcome::Retryable(reason) => {
                    error!(
                        "Dropping batch of {} for '{}' after {} attempts: {}",
                        count, path, MAX_ATTEMPTS, reason
                    );
                    self.counters.batches_dropped.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    async fn attempt(&self, path: &str, body: Vec<u8>) -> Outcome {
        match self.transport.send(path, body).await {
            Ok(status) if (200..300).contains(&status) => Outcome::Delivered,
            Ok(status) if (400..500).contains(&status) => Outcome::Rejected(status),
            Ok(status) => Outcome::Retryable(format!("status {}", status)),
            Err(e) => Outcome::Retryable(e.to_string()),
        }
    }
}

pub fn constant_backoff(delay: Duration) -> RetryBackoff {
    Arc::new(move |_: u32| delay)
}

#[async_trait]
impl<T: BatchTransport> Sink for BatchedRetrySink<T> {
    async fn init(&self, ctx: &StreamProcessingContext) -> Result<()> {
        *self.cancel.lock() = ctx.cancel_signal().clone();
        Ok(())
    }

    async fn process(&self, ctx: &MessageProcessingContext) -> Result<()> {
        let path = self.resolve_path(ctx)?;
        let mut pending = self.pending.lock().await;

        if pending.path.as_deref().map_or(false, |current| current != path) {
            debug!("Destination changed to '{}', flushing current batch", path);
            self.flush_locked(&mut pending).await;
        }

        pending.path = Some(path);
        pending.items.push(ctx.message().to_json());
        if pending.oldest.is_none() {
            pending.oldest = Some(Instant::now());
        }

        if pending.items.len() > self.max_batch_len || pending.is_aged(self.max_batch_age) {
            self.flush_locked(&mut pending).await;
        }
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        let mut pending = self.pending.lock().await;
        self.flush_locked(&mut pending).await;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Sink::flush(self).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RustFlowError;
    use crate::types::{Message, MessageAndRouting};
    use serde_json::json;
    use std::collections::VecDeque;

    /// Replays scripted responses and records every request
    #[derive(Default)]
    struct ScriptedTransport {
        responses: SyncMutex<VecDeque<Result<u16>>>,
        requests: SyncMutex<Vec<(String, JsonValue)>>,
    }

    impl ScriptedTransport {
        fn with(responses: Vec<Result<u16>>) -> Self {
            Self {
                responses: SyncMutex::new(responses.into()),
                requests: SyncMutex::new(Vec::new()),
            }
        }

        fn requests(&self) -> Vec<(String, JsonValue)> {
            self.requests.lock().clone()
        }
    }

    #[async_trait]
    impl BatchTransport for ScriptedTransport {
        async fn send(&self, path: &str, body: Vec<u8>) -> Result<u16> {
            let body: JsonValue = serde_json::from_slice(&body)?;
            self.requests.lock().push((path.to_string(), body));
            self.responses.lock().pop_front().unwrap_or(Ok(200))
        }
    }

    fn sink(responses: Vec<Result<u16>>) -> BatchedRetrySink<ScriptedTransport> {
        BatchedRetrySink::new(
            ScriptedTransport::with(responses),
            Some("${topic}".to_string()),
            Some("${stream}".to_string()),
        )
        .with_retry_delay(Duration::from_millis(1))
    }

    fn ctx(stream: &Arc<StreamProcessingContext>, value: JsonValue) -> MessageProcessingContext {
        MessageProcessingContext::new(
            stream.clone(),
            MessageAndRouting::new(Message::from_json(value).unwrap(), "main"),
        )
    }

    #[tokio::test]
    async fn test_batch_is_sent_as_one_array() {
        let stream = Arc::new(StreamProcessingContext::new("tester"));
        let sink = sink(vec![]);

        sink.process(&ctx(&stream, json!({"topic": "orders", "n": 1}))).await.unwrap();
        sink.process(&ctx(&stream, json!({"topic": "orders", "n": 2}))).await.unwrap();
        assert!(sink.transport().requests().is_empty());

        sink.flush().await.unwrap();
        let requests = sink.transport().requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].0, "events/orders");
        assert_eq!(requests[0].1, json!([{"topic": "orders", "n": 1}, {"topic": "orders", "n": 2}]));
        assert_eq!(sink.stats().messages_sent, 2);
    }

    #[tokio::test]
    async fn test_path_change_flushes_previous_batch() {
        let stream = Arc::new(StreamProcessingContext::new("tester"));
        let sink = sink(vec![]);

        sink.process(&ctx(&stream, json!({"topic": "a", "stream": "s1"}))).await.unwrap();
        sink.process(&ctx(&stream, json!({"topic": "b"}))).await.unwrap();

        let requests = sink.transport().requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].0, "events/a/s1");

        sink.close().await.unwrap();
        assert_eq!(sink.transport().requests()[1].0, "events/b");
    }

    #[tokio::test]
    async fn test_stream_ignored_without_topic() {
        let stream = Arc::new(StreamProcessingContext::new("tester"));
        let sink = sink(vec![]);
        let c = ctx(&stream, json!({"stream": "s1"}));
        assert_eq!(sink.resolve_path(&c).unwrap(), "events");
    }

    #[tokio::test]
    async fn test_server_errors_retry_at_most_three_times() {
        let stream = Arc::new(StreamProcessingContext::new("tester"));
        let sink = sink(vec![Ok(503), Ok(500), Ok(502), Ok(200)]);

        sink.process(&ctx(&stream, json!({"topic": "t"}))).await.unwrap();
        sink.flush().await.unwrap();

        assert_eq!(sink.transport().requests().len(), 3);
        let stats = sink.stats();
        assert_eq!(stats.attempts, 3);
        assert_eq!(stats.batches_dropped, 1);
        assert_eq!(stats.batches_sent, 0);
    }

    #[tokio::test]
    async fn test_client_error_is_terminal() {
        let stream = Arc::new(StreamProcessingContext::new("tester"));
        let sink = sink(vec![Ok(400)]);

        sink.process(&ctx(&stream, json!({"topic": "t"}))).await.unwrap();
        sink.flush().await.unwrap();

        assert_eq!(sink.transport().requests().len(), 1);
        assert_eq!(sink.stats().batches_dropped, 1);
    }

    #[tokio::test]
    async fn test_transport_error_then_success() {
        let stream = Arc::new(StreamProcessingContext::new("tester"));
        let sink = sink(vec![Err(RustFlowError::Delivery("connection refused".into())), Ok(204)]);

        sink.process(&ctx(&stream, json!({"topic": "t"}))).await.unwrap();
        sink.flush().await.unwrap();

        assert_eq!(sink.transport().requests().len(), 2);
        assert_eq!(sink.stats().batches_sent, 1);
    }

    #[tokio::test]
    async fn test_length_limit_triggers_flush() {
        let stream = Arc::new(StreamProcessingContext::new("tester"));
        let sink = sink(vec![]).with_max_batch_len(2);

        for n in 0..3 {
            sink.process(&ctx(&stream, json!({"topic": "t", "n": n}))).await.unwrap();
        }
        let requests = sink.transport().requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].1.as_array().unwrap().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_aged_batch_flushes() {
        let stream = Arc::new(StreamProcessingContext::new("tester"));
        let sink = sink(vec![]).with_max_batch_age(Duration::from_secs(5));

        sink.process(&ctx(&stream, json!({"topic": "t"}))).await.unwrap();
        sink.flush_if_aged().await;
        assert!(sink.transport().requests().is_empty());

        tokio::time::advance(Duration::from_secs(6)).await;
        sink.flush_if_aged().await;
        assert_eq!(sink.transport().requests().len(), 1);
    }

    #[tokio::test]
    async fn test_custom_backoff_receives_attempt_numbers() {
        let stream = Arc::new(StreamProcessingContext::new("tester"));
        let seen = Arc::new(SyncMutex::new(Vec::new()));
        let recorder = seen.clone();
        let sink = sink(vec![Ok(500), Ok(500), Ok(500)]).with_backoff(Arc::new(move |attempt: u32| {
            recorder.lock().push(attempt);
            Duration::from_millis(1)
        }));

        sink.process(&ctx(&stream, json!({"topic": "t"}))).await.unwrap();
        sink.flush().await.unwrap();
        assert_eq!(*seen.lock(), vec![1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_cuts_retry_wait_short() {
        let stream = Arc::new(StreamProcessingContext::new("tester"));
        let sink = sink(vec![Ok(500), Ok(500), Ok(500)]).with_retry_delay(Duration::from_secs(5));
        sink.init(&stream).await.unwrap();

        sink.process(&ctx(&stream, json!({"topic": "t"}))).await.unwrap();
        stream.cancel();
        let started = Instant::now();
        sink.flush().await.unwrap();

        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(sink.transport().requests().len(), 1);
        let stats = sink.stats();
        assert_eq!(stats.attempts, 1);
        assert_eq!(stats.batches_dropped, 1);
    }

    #[tokio::test]
    async fn test_explicit_cancel_signal() {
        let stream = Arc::new(StreamProcessingContext::new("tester"));
        let cancel = CancelSignal::new();
        let sink = sink(vec![Ok(502)])
            .with_retry_delay(Duration::from_secs(30))
            .with_cancel_signal(cancel.clone());

        sink.process(&ctx(&stream, json!({"topic": "t"}))).await.unwrap();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });
        tokio::time::timeout(Duration::from_secs(5), sink.flush())
            .await
            .expect("flush should stop waiting once cancelled")
            .unwrap();
        assert_eq!(sink.stats().batches_dropped, 1);
    }
}
