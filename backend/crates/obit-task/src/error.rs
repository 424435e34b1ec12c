//! Error types for obit-task

use thiserror::Error;

/// Result type for obit-task operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur when preparing or launching a task
#[derive(Error, Debug)]
pub enum Error {
    /// Task executable could not be started
    #[error("Failed to spawn task {task}: {source}")]
    Spawn {
        task: String,
        #[source]
        source: std::io::Error,
    },

    /// Parameter name or value rejected
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// Assignment string could not be parsed
    #[error("Parse error: {0}")]
    Parse(String),

    /// I/O error (parameter files, log capture)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
