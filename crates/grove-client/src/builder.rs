//! Tree builder: merges a change set onto the tree of a base commit.
//!
//! The base tree is flattened into `path -> (mode, id)` without reading any
//! blob content, the changes are applied in path order, and the result is
//! regrouped by directory and encoded bottom-up.

use crate::{Error, Result};
use bytes::Bytes;
use grove_storage::{Commit, EntryMode, GitObject, ObjectId, ObjectStore, ObjectType, TreeEntry};
use std::cmp::Reverse;
use std::collections::BTreeMap;
use tracing::debug;

/// A change to one path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathChange {
    /// Create or overwrite the file with this content.
    Write(Bytes),
    /// Remove the file, or everything below the directory (tombstone).
    Delete,
}

/// A change set, applied in path order.
pub type Changes = BTreeMap<String, PathChange>;

type FlatTree = BTreeMap<String, (EntryMode, ObjectId)>;

/// Normalizes a relative, slash-separated path.
///
/// A leading `/` is stripped; empty segments, `.` and `..` are rejected.
pub(crate) fn normalize_path(path: &str) -> Result<String> {
    let trimmed = path.strip_prefix('/').unwrap_or(path);
    if trimmed.is_empty() {
        return Err(Error::invalid_path(path, "path is empty"));
    }
    if trimmed.contains('\0') {
        return Err(Error::invalid_path(path, "path contains a NUL byte"));
    }
    for segment in trimmed.split('/') {
        match segment {
            "" => return Err(Error::invalid_path(path, "empty path segment")),
            "." | ".." => return Err(Error::invalid_path(path, "relative path segment")),
            _ => {}
        }
    }
    Ok(trimmed.to_string())
}

/// Checks every path of a change set.
pub(crate) fn validate_changes(changes: &Changes) -> Result<()> {
    for path in changes.keys() {
        normalize_path(path)?;
    }
    Ok(())
}

/// Builds the tree of `base` with `changes` applied and returns its id.
///
/// A zero or non-local `base` starts from the empty tree. Blobs of the base
/// that are not local are recorded as promised.
pub fn build_tree(store: &mut ObjectStore, base: ObjectId, changes: &Changes) -> Result<ObjectId> {
    let mut flat = FlatTree::new();
    if !base.is_zero() && store.contains(&base) {
        let commit = Commit::from_object(&store.get_typed(&base, ObjectType::Commit)?)?;
        flatten(store, commit.tree, &mut flat)?;
    }

    let mut normalized = BTreeMap::new();
    for (path, change) in changes {
        normalized.insert(normalize_path(path)?, change);
    }

    for (path, change) in normalized {
        match change {
            PathChange::Delete => {
                flat.remove(&path);
                remove_below(&mut flat, &path);
            }
            PathChange::Write(content) => {
                let mode = match flat.get(&path) {
                    Some((EntryMode::Executable, _)) => EntryMode::Executable,
                    _ => EntryMode::File,
                };
                let id = store.put_blob(content.clone());
                for (i, _) in path.match_indices('/') {
                    flat.remove(&path[..i]);
                }
                remove_below(&mut flat, &path);
                flat.insert(path, (mode, id));
            }
        }
    }

    let root = write_trees(store, flat);
    debug!(%base, %root, changes = changes.len(), "built tree");
    Ok(root)
}

/// Collects every non-directory entry below `tree`.
fn flatten(store: &mut ObjectStore, tree: ObjectId, flat: &mut FlatTree) -> Result<()> {
    let mut stack = vec![(String::new(), tree)];
    while let Some((prefix, id)) = stack.pop() {
        let object = store.get_typed(&id, ObjectType::Tree).map_err(|_| {
            Error::Internal(format!("tree {id} of the base commit is not in the local store"))
        })?;
        for entry in TreeEntry::decode(&object.data)? {
            let path = if prefix.is_empty() {
                entry.name
            } else {
                format!("{prefix}/{}", entry.name)
            };
            if entry.mode.is_directory() {
                stack.push((path, entry.id));
                continue;
            }
            if entry.mode.is_blob() && !store.contains(&entry.id) {
                store.promise(entry.id);
            }
            flat.insert(path, (entry.mode, entry.id));
        }
    }
    Ok(())
}

fn remove_below(flat: &mut FlatTree, path: &str) {
    let prefix = format!("{path}/");
    flat.retain(|key, _| !key.starts_with(&prefix));
}

fn split_parent(path: &str) -> (&str, &str) {
    path.rsplit_once('/').unwrap_or(("", path))
}

fn depth(dir: &str) -> usize {
    if dir.is_empty() {
        0
    } else {
        dir.matches('/').count() + 1
    }
}

/// Encodes the directories of `flat` deepest first and returns the root id.
fn write_trees(store: &mut ObjectStore, flat: FlatTree) -> ObjectId {
    let mut dirs: BTreeMap<String, Vec<TreeEntry>> = BTreeMap::new();
    dirs.insert(String::new(), Vec::new());

    for (path, (mode, id)) in &flat {
        let (dir, name) = split_parent(path);
        let mut ancestor = dir;
        while !dirs.contains_key(ancestor) {
            dirs.insert(ancestor.to_string(), Vec::new());
            ancestor = split_parent(ancestor).0;
        }
        dirs.entry(dir.to_string())
            .or_default()
            .push(TreeEntry::new(*mode, name, *id));
    }

    let mut order: Vec<String> = dirs.keys().cloned().collect();
    order.sort_by_key(|dir| Reverse(depth(dir)));

    let mut root = ObjectId::empty_tree();
    for dir in order {
        let entries = dirs.remove(&dir).unwrap_or_default();
        let id = store.put(GitObject::tree(entries));
        if dir.is_empty() {
            root = id;
        } else {
            let (parent, name) = split_parent(&dir);
            dirs.entry(parent.to_string())
                .or_default()
                .push(TreeEntry::new(EntryMode::Directory, name, id));
        }
    }
    root
}
