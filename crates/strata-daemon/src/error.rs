//! Error types for the Strata daemon

use strata_core::ErrorKind;
use thiserror::Error;

/// Result type alias for daemon operations
pub type Result<T> = std::result::Result<T, DaemonError>;

/// Errors raised outside the evidence operations themselves
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Core library error
    #[error("Core error: {0}")]
    Core(#[from] strata_core::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Queue error
    #[error("Queue error: {0}")]
    Queue(String),

    /// Task socket error
    #[error("Intake error: {0}")]
    Intake(String),
}

impl DaemonError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DaemonError::Core(e) => e.kind(),
            DaemonError::Serialization(_) => ErrorKind::Format,
            DaemonError::Io(_)
            | DaemonError::Config(_)
            | DaemonError::Queue(_)
            | DaemonError::Intake(_) => ErrorKind::Internal,
        }
    }
}

impl From<serde_json::Error> for DaemonError {
    fn from(e: serde_json::Error) -> Self {
        DaemonError::Serialization(e.to_string())
    }
}
