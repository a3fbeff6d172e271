use thiserror::Error;

#[derive(Debug, Error)]
pub enum FlowError {
    // Start-time errors — surfaced synchronously, never produce a run
    #[error("Flow not found: {0}")]
    FlowNotFound(String),

    #[error("Flow is inactive: {0}")]
    FlowInactive(String),

    #[error("Flow has no trigger node: {0}")]
    MissingTrigger(String),

    #[error("Run not found: {0}")]
    RunNotFound(String),

    // Execution errors — recorded on the run, not propagated
    #[error("Node {node} failed: {message}")]
    NodeExecution { node: String, message: String },

    #[error("Run exceeded step limit ({0})")]
    StepLimitExceeded(usize),

    // Definition errors
    #[error("Flow validation failed: {0}")]
    Validation(String),

    // Capability errors (message transport, AI service, contact store)
    #[error("{0}")]
    Capability(String),

    // Storage errors
    #[error("Database error: {0}")]
    Database(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, FlowError>;
