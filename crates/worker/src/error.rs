use thiserror::Error;

use crate::command::CommandResult;

/// Failures raised by an engine implementation
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Failed to start engine process {bin}: {source}")]
    Spawn {
        bin: String,
        #[source]
        source: std::io::Error,
    },

    #[error("The engine does not support {0}")]
    Unsupported(&'static str),

    #[error("The engine rejected the job: {0}")]
    Rejected(String),

    #[error("The engine has not been initialised")]
    NotInitialised,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Reasons the router refuses or fails a command
#[derive(Debug, Error)]
pub enum RouterError {
    #[error("The worker has not been initialised")]
    NotInitialised,

    #[error("The current {0} job is still in progress")]
    JobActive(&'static str),

    #[error("Previews are not available while an encode is in progress")]
    EncodeActive,

    #[error("{0}")]
    Payload(String),

    #[error("Engine failure: {0}")]
    Engine(#[from] EngineError),

    #[error("Preview generation timed out after {0}s")]
    PreviewTimeout(u64),

    #[error("Failed to configure logging: {0}")]
    Logging(String),
}

impl From<RouterError> for CommandResult {
    fn from(err: RouterError) -> Self {
        CommandResult::failure(err.to_string())
    }
}
