//! Git object model for Grove.
//!
//! This crate provides the content-addressed objects (blobs, trees, commits),
//! their binary encodings, the client-side object cache and a ref store used
//! by in-process remotes.

mod commit;
mod error;
mod object;
mod refs;
mod store;
mod tree;

pub use commit::{Commit, Signature};
pub use error::StorageError;
pub use object::{GitObject, ObjectId, ObjectType};
pub use refs::{Ref, RefStore, RefUpdateError, Reference};
pub use store::{ObjectStore, Repository};
pub use tree::{EntryMode, TreeEntry};

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;
