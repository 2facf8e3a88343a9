//! Error types for the shared contracts

use thiserror::Error;

/// Result type alias using ContractError
pub type Result<T> = std::result::Result<T, ContractError>;

/// Errors raised while reading or parsing contract values
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContractError {
    /// The ambiance has no levels, so there is no current node
    #[error("Ambiance has no levels")]
    EmptyAmbiance,

    /// A string did not name a known enum variant
    #[error("Unknown {kind}: '{value}'")]
    UnknownValue { kind: &'static str, value: String },
}

impl ContractError {
    pub fn unknown(kind: &'static str, value: impl Into<String>) -> Self {
        Self::UnknownValue {
            kind,
            value: value.into(),
        }
    }
}
