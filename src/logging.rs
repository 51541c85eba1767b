use crate::config::LoggingConfig;
use crate::error::{Result, RustFlowError};
use tracing::Level;

pub fn parse_level(level: &str) -> Result<Level> {
    level
        .trim()
        .parse::<Level>()
        .map_err(|_| RustFlowError::InvalidConfig(format!("logging.level '{}' is not a log level", level)))
}

/// Install the global `tracing` subscriber. Calling it twice is an error.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let level = parse_level(&config.level)?;
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_ansi(config.ansi)
        .with_target(config.with_target)
        .try_init()
        .map_err(|e| RustFlowError::Config(format!("failed to install logger: {}", e)))
}
