//! Git reference management.

use crate::{ObjectId, Result, StorageError};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use tracing::debug;

/// A listed reference: fully-qualified name and the object it points to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Ref {
    /// Fully-qualified name, e.g. `refs/heads/main`.
    pub name: String,
    /// Target object.
    pub id: ObjectId,
}

impl Ref {
    /// Creates a new listed reference.
    pub fn new(name: impl Into<String>, id: ObjectId) -> Self {
        Self {
            name: name.into(),
            id,
        }
    }
}

impl fmt::Display for Ref {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.id, self.name)
    }
}

/// A git reference (branch, tag, or symbolic ref).
#[derive(Debug, Clone)]
pub enum Reference {
    /// Direct reference to an object.
    Direct(ObjectId),
    /// Symbolic reference (e.g., HEAD -> refs/heads/main).
    Symbolic(String),
}

impl Reference {
    /// Returns the object ID if this is a direct reference.
    pub fn as_direct(&self) -> Option<ObjectId> {
        match self {
            Self::Direct(id) => Some(*id),
            Self::Symbolic(_) => None,
        }
    }
}

/// Why a compare-and-swap update was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefUpdateError {
    /// The ref's current value differs from the expected old value.
    Stale {
        /// Value the caller expected.
        expected: ObjectId,
        /// Value actually stored (zero when the ref does not exist).
        actual: ObjectId,
    },
}

impl fmt::Display for RefUpdateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stale { actual, .. } if actual.is_zero() => f.write_str("stale info"),
            Self::Stale { expected, .. } if expected.is_zero() => f.write_str("already exists"),
            Self::Stale { .. } => f.write_str("fetch first"),
        }
    }
}

/// Thread-safe reference store.
#[derive(Debug, Default)]
pub struct RefStore {
    refs: RwLock<HashMap<String, Reference>>,
}

impl RefStore {
    /// Creates a new empty reference store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Gets a reference by name.
    pub fn get(&self, name: &str) -> Result<Reference> {
        self.refs
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| StorageError::RefNotFound(name.to_string()))
    }

    /// Sets a reference to point to an object.
    pub fn set(&self, name: &str, target: ObjectId) {
        self.refs
            .write()
            .insert(name.to_string(), Reference::Direct(target));
    }

    /// Sets a symbolic reference.
    pub fn set_symbolic(&self, name: &str, target: &str) {
        self.refs
            .write()
            .insert(name.to_string(), Reference::Symbolic(target.to_string()));
    }

    /// Atomically moves `name` from `old` to `new`.
    ///
    /// A zero `old` means the ref must not exist yet; a zero `new` deletes it.
    /// The check and the write happen under one write lock.
    pub fn compare_and_swap(
        &self,
        name: &str,
        old: ObjectId,
        new: ObjectId,
    ) -> std::result::Result<(), RefUpdateError> {
        let mut refs = self.refs.write();
        let actual = refs
            .get(name)
            .and_then(Reference::as_direct)
            .unwrap_or(ObjectId::ZERO);
        if actual != old {
            debug!(name, %old, %actual, "ref update rejected");
            return Err(RefUpdateError::Stale {
                expected: old,
                actual,
            });
        }
        if new.is_zero() {
            refs.remove(name);
        } else {
            refs.insert(name.to_string(), Reference::Direct(new));
        }
        debug!(name, %old, %new, "ref updated");
        Ok(())
    }

    /// Deletes a reference.
    pub fn delete(&self, name: &str) -> Result<()> {
        self.refs
            .write()
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| StorageError::RefNotFound(name.to_string()))
    }

    /// Lists all references with a given prefix.
    pub fn list(&self, prefix: &str) -> Vec<(String, Reference)> {
        self.refs
            .read()
            .iter()
            .filter(|(name, _)| name.starts_with(prefix))
            .map(|(name, refr)| (name.clone(), refr.clone()))
            .collect()
    }

    /// Lists all references.
    pub fn list_all(&self) -> Vec<(String, Reference)> {
        self.list("")
    }

    /// Resolves HEAD to the commit it points at.
    pub fn resolve_head(&self) -> Result<ObjectId> {
        match self.get("HEAD")? {
            Reference::Direct(id) => Ok(id),
            Reference::Symbolic(target) => match self.get(&target)? {
                Reference::Direct(id) => Ok(id),
                Reference::Symbolic(_) => Err(StorageError::RefNotFound(format!(
                    "{target} (nested symbolic refs are not supported)"
                ))),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(byte: u8) -> ObjectId {
        ObjectId::from_bytes([byte; 20])
    }

    #[test]
    fn test_ref_listing() {
        let store = RefStore::new();
        store.set("refs/heads/main", id(1));
        store.set("refs/heads/feature", id(1));
        store.set("refs/tags/v1.0", id(1));

        assert_eq!(store.list("refs/heads/").len(), 2);
        assert_eq!(store.list("refs/tags/").len(), 1);
        assert!(store.list("refs/remotes/").is_empty());
        assert_eq!(store.list_all().len(), 3);
    }

    #[test]
    fn test_ref_store_get_not_found() {
        let store = RefStore::new();
        let result = store.get("refs/heads/nonexistent");
        assert!(matches!(result, Err(StorageError::RefNotFound(_))));
    }

    #[test]
    fn test_ref_store_delete() {
        let store = RefStore::new();
        store.set("refs/heads/feature", id(1));
        store.delete("refs/heads/feature").unwrap();
        assert!(store.get("refs/heads/feature").is_err());
        assert!(store.delete("refs/heads/feature").is_err());
    }

    #[test]
    fn test_cas_create_update_delete() {
        let store = RefStore::new();
        store
            .compare_and_swap("refs/heads/main", ObjectId::ZERO, id(1))
            .unwrap();
        store
            .compare_and_swap("refs/heads/main", id(1), id(2))
            .unwrap();
        assert_eq!(
            store.get("refs/heads/main").unwrap().as_direct(),
            Some(id(2))
        );
        store
            .compare_and_swap("refs/heads/main", id(2), ObjectId::ZERO)
            .unwrap();
        assert!(store.get("refs/heads/main").is_err());
    }

    #[test]
    fn test_cas_rejects_stale_old() {
        let store = RefStore::new();
        store.set("refs/heads/main", id(2));

        let err = store
            .compare_and_swap("refs/heads/main", id(1), id(3))
            .unwrap_err();
        assert_eq!(
            err,
            RefUpdateError::Stale {
                expected: id(1),
                actual: id(2)
            }
        );
        assert_eq!(err.to_string(), "fetch first");
        assert_eq!(
            store.get("refs/heads/main").unwrap().as_direct(),
            Some(id(2))
        );
    }

    #[test]
    fn test_cas_rejects_create_over_existing() {
        let store = RefStore::new();
        store.set("refs/heads/main", id(2));
        let err = store
            .compare_and_swap("refs/heads/main", ObjectId::ZERO, id(3))
            .unwrap_err();
        assert_eq!(err.to_string(), "already exists");
    }

    #[test]
    fn test_resolve_head() {
        let store = RefStore::new();
        assert!(store.resolve_head().is_err());

        store.set_symbolic("HEAD", "refs/heads/main");
        assert!(store.resolve_head().is_err());

        store.set("refs/heads/main", id(1));
        assert_eq!(store.resolve_head().unwrap(), id(1));

        store.set("HEAD", id(4));
        assert_eq!(store.resolve_head().unwrap(), id(4));
    }

    #[test]
    fn test_ref_display() {
        let r = Ref::new("refs/heads/main", id(0xab));
        assert_eq!(r.to_string(), format!("{} refs/heads/main", "ab".repeat(20)));
    }
}
