//! Execution contexts threaded through a pipeline run.
//!
//! - **StreamProcessingContext**: one per run. Sticky failure, flags, named
//!   side-channel objects, the evaluator stack and requeue delegation.
//! - **MessageProcessingContext**: one per message. Serial id, message-local
//!   halt and layered expression evaluation.

pub mod expression;
pub mod message;
pub mod stream;

pub use expression::{Expression, TargetType, ValueSource};
pub use message::MessageProcessingContext;
pub use stream::{SerialGenerator, StreamProcessingContext};
