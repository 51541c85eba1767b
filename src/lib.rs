pub mod bucketing;
pub mod config;
pub mod context;
pub mod error;
pub mod filter;
pub mod logging;
pub mod metrics;
pub mod processor;
pub mod program;
pub mod sink;
pub mod source;
pub mod types;

pub use error::{Result, RustFlowError};
pub use config::EngineConfig;
pub use context::{MessageProcessingContext, StreamProcessingContext};
pub use program::{PipelineDriver, Program, StageRegistry};
pub use types::{Message, MessageAndRouting};
