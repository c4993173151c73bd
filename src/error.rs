//! Error types for Ralph
//!
//! Centralized error handling using thiserror.

use thiserror::Error;

/// All error types that can occur in Ralph
#[derive(Debug, Error)]
pub enum RalphError {
    /// State document exists but cannot be parsed
    #[error("State corrupt: {0}")]
    StateCorrupt(String),

    /// State document has not been initialized
    #[error("State missing: {0}")]
    StateMissing(String),

    /// Required configuration is absent or invalid
    #[error("Config error: {0}")]
    Config(String),

    /// The agent process could not be started at all
    #[error("Agent failed to start: {0}")]
    AgentSpawn(String),

    /// History artifact could not be written or read
    #[error("History error: {0}")]
    History(String),

    /// Caller supplied an argument outside the accepted range
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for Ralph operations
pub type Result<T> = std::result::Result<T, RalphError>;
