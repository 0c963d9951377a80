//! Error types for the sync layer.

use thiserror::Error;

/// Push or query collaborator could not be reached.
///
/// Never surfaced to readers: affected entries are marked stale and a
/// resync is scheduled.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("Collaborator unreachable: {0}")]
    Unreachable(String),

    #[error("Request timed out")]
    Timeout,

    #[error("Request rejected: {0}")]
    Rejected(String),
}

/// A durable write was not accepted.
///
/// Reported per mutation, keyed by its local id.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum WriteError {
    #[error("Write rejected: {0}")]
    Rejected(String),

    #[error("Write timed out")]
    TimedOut,

    #[error("Write conflict: {0}")]
    Conflict(String),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Main error type for sync operations.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("No signed-in user")]
    NotSignedIn,

    #[error("Invalid topic: {0}")]
    InvalidTopic(String),

    #[error("Invalid view: {0}")]
    InvalidView(String),

    #[error("Unknown view token: {0}")]
    UnknownView(u64),

    #[error("Invalid mutation: {0}")]
    InvalidMutation(String),

    #[error(transparent)]
    Write(#[from] WriteError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::Serialization(e.to_string())
    }
}

/// Result type for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;
