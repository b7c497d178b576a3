//! Storage error types.

use thiserror::Error;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A hex object id could not be parsed.
    #[error("invalid object id: {0}")]
    InvalidHash(String),

    /// An object's encoding is malformed.
    #[error("invalid object: {0}")]
    InvalidObject(String),

    /// The requested object is not in the store.
    #[error("object not found: {0}")]
    ObjectNotFound(String),

    /// The requested reference does not exist.
    #[error("ref not found: {0}")]
    RefNotFound(String),

    /// Zlib compression or decompression failed.
    #[error("compression error: {0}")]
    Compression(String),
}
