use crate::bucketing::bridge::AggregationBridge;
use crate::bucketing::period::AggregationPeriod;
use crate::bucketing::AggregationTarget;
use crate::context::MessageProcessingContext;
use crate::error::{Result, RustFlowError};
use crate::sink::Sink;
use crate::source::backoff::{sleep_or_cancel, CancelSignal};
use crate::types::Message;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// Largest gap, in periods, that is filled with zero-value records
pub const DEFAULT_MAX_FILLERS: u64 = 10_000;

#[derive(Debug, Default)]
struct WindowState {
    buckets: BTreeMap<i64, BTreeMap<String, Message>>,
    /// Most recent bucket handed to the target, kept across flushes so gaps
    /// between successive flushes are filled too
    last_flushed: Option<i64>,
}

impl WindowState {
    fn high_water(&self) -> Option<i64> {
        let buffered = self.buckets.keys().next_back().copied();
        buffered.max(self.last_flushed)
    }
}

#[derive(Debug, Default)]
struct Counters {
    added: AtomicU64,
    merged: AtomicU64,
    buckets_flushed: AtomicU64,
    fillers: AtomicU64,
    gaps_skipped: AtomicU64,
    late_folded: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BucketingStats {
    pub entries_added: u64,
    pub entries_merged: u64,
    pub buckets_flushed: u64,
    pub fillers_emitted: u64,
    /// Gaps wider than the filler cap, left unfilled
    pub gaps_skipped: u64,
    pub late_folded: u64,
}

/// Time-window aggregation.
///
/// Entries are grouped into windows by bucket timestamp and merged per key.
/// Only one window set is open at a time: an entry for a newer bucket flushes
/// everything buffered before its window opens. Output is ordered by
/// bucket and then key, with a zero-value filler for every skipped window.
///
/// Out-of-order input is not routed back to its own window. An entry older
/// than the newest bucket seen is merged into that newest ("current") bucket.
/// If the current bucket was already flushed it is opened again, so its
/// timestamp can be emitted twice; output timestamps never decrease.
///
/// A gap wider than `max_fillers` periods is not filled at all.
pub struct BucketingService {
    period: AggregationPeriod,
    offset_ms: i64,
    max_fillers: u64,
    bridge: Arc<dyn AggregationBridge>,
    target: Arc<dyn AggregationTarget>,
    state: Mutex<WindowState>,
    counters: Counters,
}

impl BucketingService {
    pub fn new(
        period: AggregationPeriod,
        offset_seconds: i64,
        bridge: Arc<dyn AggregationBridge>,
        target: Arc<dyn AggregationTarget>,
    ) -> Result<Self> {
        let offset_ms = offset_seconds.checked_mul(1_000).ok_or_else(|| {
            RustFlowError::InvalidConfig(format!("bucket time offset {}s is out of range", offset_seconds))
        })?;
        Ok(Self {
            period,
            offset_ms,
            max_fillers: DEFAULT_MAX_FILLERS,
            bridge,
            target,
            state: Mutex::new(WindowState::default()),
            counters: Counters::default(),
        })
    }

    pub fn with_max_fillers(mut self, max_fillers: u64) -> Self {
        self.max_fillers = max_fillers;
        self
    }

    pub fn period(&self) -> AggregationPeriod {
        self.period
    }

    pub fn add(&self, entry: &Message) -> Result<()> {
        let ts = self.bridge.timestamp_of(entry)?;
        let key = self.bridge.key_of(entry);
        let mut bucket = self.period.bucket_of(ts, self.offset_ms)?;

        let mut state = self.state.lock();
        if !state.buckets.contains_key(&bucket) {
            match state.high_water() {
                Some(current) if bucket < current => {
                    debug!("Folding late entry for bucket {} into current bucket {}", bucket, current);
                    self.counters.late_folded.fetch_add(1, Ordering::Relaxed);
                    bucket = current;
                }
                _ => {
                    self.flush_locked(&mut state)?;
                    debug!("Opening bucket {}", bucket);
                }
            }
        }

        self.counters.added.fetch_add(1, Ordering::Relaxed);
        let entries = state.buckets.entry(bucket).or_default();
        let merged = match entries.get(&key) {
            Some(existing) => {
                self.counters.merged.fetch_add(1, Ordering::Relaxed);
                self.bridge.merge(existing, entry)
            }
            None => self.bridge.with_timestamp(bucket, entry),
        };
        entries.insert(key, merged);
        Ok(())
    }

    /// Emit all buffered windows in order and clear them
    pub fn flush(&self) -> Result<()> {
        let mut state = self.state.lock();
        self.flush_locked(&mut state)
    }

    fn flush_locked(&self, state: &mut WindowState) -> Result<()> {
        let buckets = std::mem::take(&mut state.buckets);
        for (bucket, entries) in buckets {
            if let Some(last) = state.last_flushed {
                self.fill_gap(last, bucket)?;
            }

            debug!("Flushing bucket {} with {} entries", bucket, entries.len());
            for (_, entry) in entries {
                self.target.offer(entry)?;
            }
            state.last_flushed = Some(bucket);
            self.counters.buckets_flushed.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    fn fill_gap(&self, last: i64, bucket: i64) -> Result<()> {
        let mut boundaries = Vec::new();
        let mut boundary = self.period.next_bucket(last, self.offset_ms)?;
        while boundary < bucket {
            if boundaries.len() as u64 >= self.max_fillers {
                warn!(
                    "Gap between buckets {} and {} exceeds {} fillers, leaving it unfilled",
                    last, bucket, self.max_fillers
                );
                self.counters.gaps_skipped.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }
            boundaries.push(boundary);
            boundary = self.period.next_bucket(boundary, self.offset_ms)?;
        }

        for boundary in boundaries {
            self.target.offer(self.bridge.filler(boundary))?;
            self.counters.fillers.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Flush, then close the downstream target
    pub fn close(&self) -> Result<()> {
        let mut state = self.state.lock();
        self.flush_locked(&mut state)?;
        self.target.close()
    }

    pub fn buffered_buckets(&self) -> Vec<i64> {
        self.state.lock().buckets.keys().copied().collect()
    }

    pub fn stats(&self) -> BucketingStats {
        BucketingStats {
            entries_added: self.counters.added.load(Ordering::Relaxed),
            entries_merged: self.counters.merged.load(Ordering::Relaxed),
            buckets_flushed: self.counters.buckets_flushed.load(Ordering::Relaxed),
            fillers_emitted: self.counters.fillers.load(Ordering::Relaxed),
            gaps_skipped: self.counters.gaps_skipped.load(Ordering::Relaxed),
            late_folded: self.counters.late_folded.load(Ordering::Relaxed),
        }
    }

    /// Periodically flush buffered windows until `cancel` fires
    pub fn spawn_idle_flush(self: &Arc<Self>, interval: Duration, cancel: CancelSignal) -> JoinHandle<()> {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            while sleep_or_cancel(interval, &cancel).await {
                if let Err(e) = service.flush() {
                    error!("Idle flush failed: {}", e);
                }
            }
            debug!("Idle flush task stopped");
        })
    }
}

#[async_trait]
impl Sink for BucketingService {
    async fn process(&self, ctx: &MessageProcessingContext) -> Result<()> {
        self.add(ctx.message())
    }

    async fn flush(&self) -> Result<()> {
        BucketingService::flush(self)
    }

    async fn close(&self) -> Result<()> {
        BucketingService::close(self)
    }
}
