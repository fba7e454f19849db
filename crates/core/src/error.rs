use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    #[error("Invalid cluster name '{0}': must start with a letter, contain only alphanumerics or '-' and be at most 25 characters")]
    InvalidClusterName(String),

    #[error("Invalid phase: {0}")]
    InvalidPhase(String),

    #[error("Invalid version '{version}': {reason}")]
    InvalidVersion { version: String, reason: String },

    #[error("Validation error: {0}")]
    Validation(String),
}

pub type Result<T> = std::result::Result<T, CoreError>;
