//! Error types for client operations.

use grove_git::GitError;
use grove_storage::StorageError;
use std::fmt;
use thiserror::Error;

/// Broad classes of failure, for callers deciding how to react.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The request itself is invalid; retrying cannot help.
    Precondition,
    /// A ref or object does not exist.
    NotFound,
    /// The remote refused a ref update.
    Conflict,
    /// Network, protocol or I/O failure.
    Transient,
    /// Local state is inconsistent.
    Internal,
    /// The caller cancelled the operation.
    Cancelled,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Precondition => "precondition",
            Self::NotFound => "not found",
            Self::Conflict => "conflict",
            Self::Transient => "transient",
            Self::Internal => "internal",
            Self::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// The error type for client operations.
#[derive(Debug, Error)]
pub enum Error {
    /// A content hash was not 40 hex digits.
    #[error("invalid hash: {0:?}")]
    InvalidHash(String),

    /// The configured identity cannot be written into a commit.
    #[error("invalid identity: {0}")]
    InvalidIdentity(String),

    /// A write was attempted without an identity.
    #[error("an identity is required to create commits")]
    MissingIdentity,

    /// A path in a change set is malformed.
    #[error("invalid path {path:?}: {reason}")]
    InvalidPath {
        /// The offending path.
        path: String,
        /// What is wrong with it.
        reason: &'static str,
    },

    /// A reference name is malformed.
    #[error("invalid reference name: {0:?}")]
    InvalidReference(String),

    /// The endpoint could not be parsed or has no transport.
    #[error("unsupported endpoint: {0}")]
    UnsupportedEndpoint(String),

    /// The requested ref or object does not exist.
    #[error("not found: {resource_type} '{id}'")]
    NotFound {
        /// What was looked up (`ref`, `commit`, `tree`, `object`, ...).
        resource_type: &'static str,
        /// The name or hash looked up.
        id: String,
    },

    /// Branch creation targeted an existing ref.
    #[error("branch already exists: {0}")]
    BranchExists(String),

    /// The remote rejected a ref update.
    #[error("update of {reference} rejected: {reason}")]
    Rejected {
        /// The ref that was being updated.
        reference: String,
        /// The remote's reason, verbatim.
        reason: String,
    },

    /// The transport failed to talk to the remote.
    #[error("transport error: {0}")]
    Transport(String),

    /// Wire-level failure.
    #[error(transparent)]
    Git(#[from] GitError),

    /// Local object decoding failure.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Local state violates an invariant, e.g. an object that must be held is missing.
    #[error("internal error: {0}")]
    Internal(String),

    /// The operation was cancelled.
    #[error("operation cancelled")]
    Cancelled,
}

/// A specialized Result type for client operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Creates a new not found error.
    #[must_use]
    pub fn not_found(resource_type: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            resource_type,
            id: id.into(),
        }
    }

    /// Creates a new invalid path error.
    #[must_use]
    pub fn invalid_path(path: impl Into<String>, reason: &'static str) -> Self {
        Self::InvalidPath {
            path: path.into(),
            reason,
        }
    }

    /// Classifies the error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidHash(_)
            | Self::InvalidIdentity(_)
            | Self::MissingIdentity
            | Self::InvalidPath { .. }
            | Self::InvalidReference(_)
            | Self::UnsupportedEndpoint(_) => ErrorKind::Precondition,
            Self::NotFound { .. } | Self::Git(GitError::NotOurRef(_)) => ErrorKind::NotFound,
            Self::BranchExists(_) | Self::Rejected { .. } => ErrorKind::Conflict,
            Self::Transport(_) | Self::Git(_) | Self::Io(_) => ErrorKind::Transient,
            Self::Storage(_) | Self::Internal(_) => ErrorKind::Internal,
            Self::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Returns true if a fresh session might succeed where this attempt failed.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Internal(format!("background task failed: {err}"))
    }
}
