//! RustFlow CLI - drive JSON lines from stdin through a configured program
//!
//! Aggregation output routed to other pipelines is drained after stdin
//! closes, one pipeline at a time, until every supply is empty.

use clap::Parser;
use rustflow::logging::init_logging;
use rustflow::source::{BackoffSource, CancelSignal, JsonLineReload, QueuingSource, Source};
use rustflow::{EngineConfig, PipelineDriver, Program, Result, RustFlowError, StageRegistry, StreamProcessingContext};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "rustflow")]
#[command(about = "Stream-processing runtime: filters, processors, time-window aggregation and batched delivery")]
#[command(version)]
struct Cli {
    /// Engine configuration file
    #[arg(short, long, default_value = "config/rustflow.toml")]
    config: PathBuf,

    /// Pipeline that receives stdin lines (defaults to the first configured pipeline)
    #[arg(short, long)]
    pipeline: Option<String>,

    /// Override the configured log level
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = EngineConfig::from_file(&cli.config)?;
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }
    config.validate()?;
    init_logging(&config.logging)?;
    info!("Loaded configuration from {}", cli.config.display());

    let entry = match cli.pipeline.or_else(|| config.program.pipelines.first().map(|p| p.name.clone())) {
        Some(name) => name,
        None => return Err(RustFlowError::InvalidConfig("program.pipelines is empty".to_string())),
    };

    let program = Arc::new(Program::build(&config.program, &StageRegistry::with_builtins())?);
    if program.pipeline(&entry).is_none() {
        return Err(RustFlowError::NotFound(format!("pipeline '{}'", entry)));
    }

    let driver = PipelineDriver::from_config(program.clone(), &config.driver);
    let shutdown = CancelSignal::new();
    let idle_flushes = program.spawn_idle_flushes(&shutdown);

    let stdin_source: Arc<dyn Source> = Arc::new(BackoffSource::new(
        "stdin",
        QueuingSource::new(JsonLineReload::stdin(entry.clone())),
    ));
    run_stream(&driver, &config, stdin_source, &shutdown).await?;

    // Drain aggregation output; a pass can refill another pipeline's supply
    let mut passes = program.supplies().count() + 1;
    while !shutdown.is_cancelled() && passes > 0 {
        let mut pending: Vec<String> = program
            .supplies()
            .filter(|(_, supply)| !supply.is_empty())
            .map(|(name, _)| name.clone())
            .collect();
        if pending.is_empty() {
            break;
        }
        pending.sort();
        for name in pending {
            if let Some(supply) = program.supply(&name) {
                let source: Arc<dyn Source> = Arc::new(BackoffSource::new(name.clone(), supply.clone()));
                run_stream(&driver, &config, source, &shutdown).await?;
            }
        }
        passes -= 1;
    }
    if passes == 0 {
        warn!("Stopped draining aggregation supplies after the pass limit");
    }

    shutdown.cancel();
    for handle in idle_flushes {
        if let Err(e) = handle.await {
            error!("Idle flush task panicked: {}", e);
        }
    }
    info!("RustFlow finished");
    Ok(())
}

async fn run_stream(
    driver: &PipelineDriver,
    config: &EngineConfig,
    source: Arc<dyn Source>,
    shutdown: &CancelSignal,
) -> Result<()> {
    let ctx = Arc::new(
        StreamProcessingContext::new(config.driver.operator.clone()).with_program(driver.program().clone()),
    );

    let watcher = ctx.clone();
    let shutdown = shutdown.clone();
    let interrupt = tokio::spawn(async move {
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("Received shutdown signal (Ctrl+C)");
                shutdown.cancel();
                watcher.cancel();
            }
            _ = shutdown.cancelled() => watcher.cancel(),
        }
    });

    let stats = driver.run(source, ctx.clone()).await;
    interrupt.abort();
    let stats = stats?;

    info!(
        stream = %ctx.stream_id(),
        received = stats.received,
        delivered = stats.delivered,
        halted = stats.halted,
        stage_errors = stats.stage_errors,
        "Stream complete"
    );
    if let Some(reason) = ctx.failure_reason() {
        error!("Stream {} failed: {}", ctx.stream_id(), reason);
    }
    Ok(())
}
