//! Pipeline sinks.

pub mod batched;
pub mod http;
pub mod line;

use crate::context::{MessageProcessingContext, StreamProcessingContext};
use crate::error::Result;
use async_trait::async_trait;

pub use batched::{BatchTransport, BatchedRetrySink, BatchedSinkStats, MAX_ATTEMPTS};
pub use http::HttpBatchTransport;
pub use line::LineWriterSink;

/// Terminal stage of a pipeline
#[async_trait]
pub trait Sink: Send + Sync {
    async fn init(&self, _ctx: &StreamProcessingContext) -> Result<()> {
        Ok(())
    }

    async fn process(&self, ctx: &MessageProcessingContext) -> Result<()>;

    async fn flush(&self) -> Result<()>;

    async fn close(&self) -> Result<()>;
}
