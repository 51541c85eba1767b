use thiserror::Error;

pub type Result<T> = std::result::Result<T, RustFlowError>;

#[derive(Error, Debug)]
pub enum RustFlowError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Expression error in '{expression}': {message}")]
    Expression { expression: String, message: String },

    #[error("Cannot coerce {value} to {target}")]
    Coercion { value: String, target: String },

    #[error("Unsupported target type: {0}")]
    UnsupportedTargetType(String),

    #[error("Named object not found: {0}")]
    NamedObjectMissing(String),

    #[error("Named object '{name}' is not of type {expected}")]
    NamedObjectType { name: String, expected: &'static str },

    #[error("Retrieval error: {0}")]
    Retrieval(String),

    #[error("Delivery error: {0}")]
    Delivery(String),

    #[error("Stage '{stage}' failed: {message}")]
    Stage { stage: String, message: String },

    #[error("Unknown {category} kind: {kind}")]
    UnknownKind { category: &'static str, kind: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Wait cancelled")]
    Cancelled,

    #[error("Operation timeout")]
    Timeout,
}

impl RustFlowError {
    pub fn stage(stage: impl Into<String>, message: impl Into<String>) -> Self {
        RustFlowError::Stage {
            stage: stage.into(),
            message: message.into(),
        }
    }
}
