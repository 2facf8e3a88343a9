//! Error types for the pipeline engine

use pipeline_contracts::ContractError;
use thiserror::Error;

/// Result type alias using EngineError
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors that can occur in the pipeline engine
#[derive(Debug, Error)]
pub enum EngineError {
    /// Target record does not exist
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// Optimistic update observed a stale version
    #[error("Version conflict on {kind} '{id}': expected {expected}, found {actual}")]
    VersionConflict {
        kind: &'static str,
        id: String,
        expected: u64,
        actual: u64,
    },

    /// Unknown type tag, unmapped enum value or malformed request
    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Compression error
    #[error("Compression error: {0}")]
    Compression(String),

    /// Message bus failure
    #[error("Event bus error: {0}")]
    Bus(String),

    /// Step or engine execution failed
    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    /// Invalid engine configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidArguments(msg.into())
    }

    /// Create an execution failed error with a message
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::ExecutionFailed(msg.into())
    }

    /// Version conflicts are the only errors a caller retries blindly.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::VersionConflict { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Errors that will fail the same way on every delivery of a message.
    pub fn is_poison(&self) -> bool {
        matches!(self, Self::Serialization(_) | Self::InvalidArguments(_))
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<ContractError> for EngineError {
    fn from(err: ContractError) -> Self {
        Self::InvalidArguments(err.to_string())
    }
}
