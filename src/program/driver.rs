use crate::config::DriverConfig;
use crate::context::{MessageProcessingContext, StreamProcessingContext};
use crate::error::{Result, RustFlowError};
use crate::program::{PipelineDefinition, Program, Stage};
use crate::source::Source;
use crate::types::MessageAndRouting;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// What happens to a stream when a filter, processor or sink errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageErrorPolicy {
    /// Skip the remaining stages of the failing message only
    #[default]
    HaltMessage,
    /// Fail the stream; no further messages are pulled
    FailStream,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DriverStats {
    pub received: u64,
    pub delivered: u64,
    pub halted: u64,
    pub unrouted: u64,
    pub stage_errors: u64,
    pub retrieval_errors: u64,
}

/// Pulls messages from one source and runs each through its pipeline, one
/// message at a time, until the source is exhausted, the stream fails or
/// the stream is cancelled.
///
/// Every sink of the program is initialized when a run starts. At the end
/// only the sinks of pipelines that received a message in this run are
/// flushed and closed, so runs sharing a program leave each other's sinks
/// open.
pub struct PipelineDriver {
    program: Arc<Program>,
    poll_timeout: Duration,
    policy: StageErrorPolicy,
}

impl PipelineDriver {
    pub fn new(program: Arc<Program>) -> Self {
        Self::from_config(program, &DriverConfig::default())
    }

    pub fn from_config(program: Arc<Program>, config: &DriverConfig) -> Self {
        Self {
            program,
            poll_timeout: Duration::from_millis(config.poll_timeout_ms),
            policy: config.stage_error_policy,
        }
    }

    pub fn with_poll_timeout(mut self, poll_timeout: Duration) -> Self {
        self.poll_timeout = poll_timeout;
        self
    }

    pub fn with_policy(mut self, policy: StageErrorPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn program(&self) -> &Arc<Program> {
        &self.program
    }

    pub async fn run(&self, source: Arc<dyn Source>, ctx: Arc<StreamProcessingContext>) -> Result<DriverStats> {
        let mut stats = DriverStats::default();
        let mut fed = HashSet::new();
        ctx.set_source(Some(source.clone()));

        for sink in self.program.sinks() {
            sink.init(&ctx).await?;
        }
        info!("Stream {} started by '{}'", ctx.stream_id(), ctx.operator());

        while !ctx.failed() && !source.is_eof() {
            match source.get_next_message(&ctx, self.poll_timeout).await {
                Ok(Some(routed)) => self.dispatch(source.as_ref(), &ctx, routed, &mut stats, &mut fed).await,
                Ok(None) => debug!("Stream {}: no message within {:?}", ctx.stream_id(), self.poll_timeout),
                Err(RustFlowError::Cancelled) => {
                    info!("Stream {} cancelled", ctx.stream_id());
                    break;
                }
                Err(e) => {
                    warn!("Stream {}: retrieval failed, polling again: {}", ctx.stream_id(), e);
                    stats.retrieval_errors += 1;
                    ctx.metrics().retrieval_errors.inc();
                }
            }
        }

        self.shutdown(source.as_ref(), &ctx, &fed).await;
        info!(
            "Stream {} finished: {} received, {} delivered, {} halted, failed={}",
            ctx.stream_id(),
            stats.received,
            stats.delivered,
            stats.halted,
            ctx.failed()
        );
        Ok(stats)
    }

    async fn dispatch(
        &self,
        source: &dyn Source,
        ctx: &Arc<StreamProcessingContext>,
        routed: MessageAndRouting,
        stats: &mut DriverStats,
        fed: &mut HashSet<String>,
    ) {
        stats.received += 1;
        ctx.metrics().messages_received.inc();

        let Some(pipeline) = self.program.pipeline(&routed.pipeline).cloned() else {
            warn!(
                "Stream {}: no pipeline named '{}', dropping message",
                ctx.stream_id(),
                routed.pipeline
            );
            stats.unrouted += 1;
            ctx.metrics().messages_unrouted.inc();
            self.mark_complete(source, ctx, &routed).await;
            return;
        };

        fed.insert(pipeline.name.clone());
        let receipt = routed.clone();
        let mut message_ctx = MessageProcessingContext::new(ctx.clone(), routed);
        self.run_stages(&pipeline, &mut message_ctx, stats);

        if ctx.failed() {
            debug!("Stream {} failed during message #{}", ctx.stream_id(), message_ctx.serial());
        } else if message_ctx.is_stopped() {
            stats.halted += 1;
            ctx.metrics().messages_halted.inc();
        } else {
            match pipeline.sink.process(&message_ctx).await {
                Ok(()) => {
                    stats.delivered += 1;
                    ctx.metrics().messages_delivered.inc();
                }
                Err(e) => self.stage_failed(&mut message_ctx, "sink", e, stats),
            }
        }

        self.mark_complete(source, ctx, &receipt).await;
    }

    fn run_stages(&self, pipeline: &PipelineDefinition, message_ctx: &mut MessageProcessingContext, stats: &mut DriverStats) {
        for stage in &pipeline.stages {
            if message_ctx.is_stopped() || message_ctx.stream().failed() {
                return;
            }
            let outcome = match &stage.stage {
                Stage::Filter(filter) => {
                    if !filter.passes(message_ctx) {
                        message_ctx.stop_processing();
                    }
                    Ok(())
                }
                Stage::Processor(processor) => processor.process(message_ctx),
            };
            if let Err(e) = outcome {
                self.stage_failed(message_ctx, &stage.name, e, stats);
            }
        }
    }

    fn stage_failed(&self, message_ctx: &mut MessageProcessingContext, stage: &str, e: RustFlowError, stats: &mut DriverStats) {
        error!(
            stream = %message_ctx.stream().stream_id(),
            serial = message_ctx.serial(),
            pipeline = %message_ctx.pipeline(),
            "Stage '{}' failed: {}",
            stage,
            e
        );
        stats.stage_errors += 1;
        message_ctx.stream().metrics().stage_errors.inc();

        match self.policy {
            StageErrorPolicy::HaltMessage => message_ctx.stop_processing(),
            StageErrorPolicy::FailStream => message_ctx.fail(format!("stage '{}': {}", stage, e)),
        }
    }

    async fn mark_complete(&self, source: &dyn Source, ctx: &StreamProcessingContext, routed: &MessageAndRouting) {
        if let Err(e) = source.mark_complete(ctx, routed).await {
            warn!("Stream {}: mark_complete failed: {}", ctx.stream_id(), e);
        }
    }

    async fn shutdown(&self, source: &dyn Source, ctx: &StreamProcessingContext, fed: &HashSet<String>) {
        for sink in self.program.sinks_of(fed.iter().map(String::as_str)) {
            if let Err(e) = sink.flush().await {
                error!("Stream {}: sink flush failed: {}", ctx.stream_id(), e);
            }
            if let Err(e) = sink.close().await {
                error!("Stream {}: sink close failed: {}", ctx.stream_id(), e);
            }
        }
        if let Err(e) = source.close().await {
            error!("Stream {}: source close failed: {}", ctx.stream_id(), e);
        }
        ctx.set_source(None);
    }
}
