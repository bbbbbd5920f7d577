//! Error types for live query synchronization.

use thiserror::Error;

/// Main error type for sync operations.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Store error: {0}")]
    Store(String),

    #[error("Bus error: {0}")]
    Bus(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    /// An internal ordering contract was broken. Never retried.
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Invalid selector: {0}")]
    InvalidSelector(String),

    #[error("Invalid modifier: {0}")]
    InvalidModifier(String),

    #[error("Unsupported operator: {0}")]
    UnsupportedOperator(String),

    #[error("Initial query failed: {0}")]
    QueryFailed(String),

    #[error("Task aborted on queue {0}")]
    TaskAborted(String),

    #[error("Registry is shut down")]
    ShutDown,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for SyncError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        SyncError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for SyncError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        SyncError::Deserialization(e.to_string())
    }
}

impl From<regex::Error> for SyncError {
    fn from(e: regex::Error) -> Self {
        SyncError::InvalidSelector(e.to_string())
    }
}

/// Result type for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;
