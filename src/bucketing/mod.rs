//! Time-window aggregation.
//!
//! [`BucketingService`] groups keyed, time-stamped entries into windows of
//! an [`AggregationPeriod`], merges same-key entries with a [`Combiner`] and
//! hands finished windows to an [`AggregationTarget`] in strict time order.

pub mod bridge;
pub mod combiner;
pub mod period;
pub mod service;

use crate::error::Result;
use crate::types::Message;

pub use bridge::{AggregationBridge, JsonFieldBridge};
pub use combiner::{Combiner, COUNT_FIELD};
pub use period::AggregationPeriod;
pub use service::{BucketingService, BucketingStats};

/// Receives aggregated output, typically a source feeding another pipeline
pub trait AggregationTarget: Send + Sync {
    fn offer(&self, message: Message) -> Result<()>;

    fn close(&self) -> Result<()>;
}
