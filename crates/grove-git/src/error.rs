//! Git protocol error types.

use thiserror::Error;

/// Errors that can occur during git protocol operations.
#[derive(Debug, Error)]
pub enum GitError {
    /// Invalid pack file format.
    #[error("invalid pack file: {0}")]
    InvalidPack(String),

    /// Invalid pkt-line format.
    #[error("invalid pkt-line: {0}")]
    InvalidPktLine(String),

    /// Protocol error.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The remote refused to serve an object it does not have.
    #[error("remote does not have object: {0}")]
    NotOurRef(String),

    /// The remote reported an error (`ERR` line or side-band channel 3).
    #[error("remote error: {0}")]
    Remote(String),

    /// Storage error.
    #[error("storage error: {0}")]
    Storage(#[from] grove_storage::StorageError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl GitError {
    /// Classifies a remote error message.
    ///
    /// Servers phrase "unknown object" differently; every variant maps to
    /// [`GitError::NotOurRef`].
    pub fn from_remote_message(message: &str) -> Self {
        let message = message.trim_end_matches('\n').to_string();
        let lower = message.to_ascii_lowercase();
        if lower.contains("not our ref")
            || lower.contains("not a valid object")
            || lower.contains("no such object")
            || lower.contains("not found")
        {
            Self::NotOurRef(message)
        } else {
            Self::Remote(message)
        }
    }
}
