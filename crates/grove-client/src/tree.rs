//! Tree materialization: turning a commit hash into a [`TreeNode`] hierarchy.

use crate::connection::Connection;
use crate::{Error, Result};
use bytes::Bytes;
use grove_git::Filter;
use grove_storage::{Commit, EntryMode, ObjectId, ObjectStore, ObjectType, TreeEntry};
use std::collections::BTreeMap;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// A node of a materialized tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TreeNode {
    /// A regular file.
    Blob {
        /// Id of the file content.
        id: ObjectId,
        /// File or executable.
        mode: EntryMode,
    },
    /// A directory.
    Tree {
        /// Id of the tree object.
        id: ObjectId,
        /// Entries by name.
        children: BTreeMap<String, TreeNode>,
    },
}

impl TreeNode {
    /// The id of the blob or tree behind this node.
    pub fn id(&self) -> ObjectId {
        match self {
            Self::Blob { id, .. } | Self::Tree { id, .. } => *id,
        }
    }

    /// Returns true for files.
    pub fn is_leaf(&self) -> bool {
        matches!(self, Self::Blob { .. })
    }

    /// Directory entries; `None` for files.
    pub fn children(&self) -> Option<&BTreeMap<String, TreeNode>> {
        match self {
            Self::Tree { children, .. } => Some(children),
            Self::Blob { .. } => None,
        }
    }

    /// Looks up a slash-separated path below this node.
    ///
    /// The empty path returns the node itself.
    pub fn get(&self, path: &str) -> Option<&TreeNode> {
        path.split('/')
            .filter(|segment| !segment.is_empty())
            .try_fold(self, |node, segment| node.children()?.get(segment))
    }

    /// Every file path below this node, sorted.
    pub fn paths(&self) -> Vec<String> {
        self.files().into_keys().collect()
    }

    /// Every file below this node, by path.
    pub fn files(&self) -> BTreeMap<String, ObjectId> {
        let mut files = BTreeMap::new();
        let mut stack = vec![(String::new(), self)];
        while let Some((prefix, node)) = stack.pop() {
            match node {
                Self::Blob { id, .. } => {
                    files.insert(prefix, *id);
                }
                Self::Tree { children, .. } => {
                    for (name, child) in children {
                        let path = if prefix.is_empty() {
                            name.clone()
                        } else {
                            format!("{prefix}/{name}")
                        };
                        stack.push((path, child));
                    }
                }
            }
        }
        files
    }
}

/// Parses a 40-character hex hash.
pub(crate) fn parse_hash(hex: &str) -> Result<ObjectId> {
    ObjectId::from_hex(hex).map_err(|_| Error::InvalidHash(hex.to_string()))
}

/// Materializes the tree of commit `commit_hex`, fetching what is missing.
pub(crate) async fn get_tree(
    conn: &mut Connection,
    store: &mut ObjectStore,
    commit_hex: &str,
    filter: Option<Filter>,
    cancel: &CancellationToken,
) -> Result<TreeNode> {
    let id = parse_hash(commit_hex)?;
    conn.fetch(store, &[id], filter, cancel).await?;

    let object = store
        .get(&id)
        .map_err(|_| Error::not_found("commit", commit_hex))?;
    if object.object_type != ObjectType::Commit {
        return Err(Error::not_found("commit", commit_hex));
    }
    let root = Commit::from_object(&object)?.tree;

    // Make sure every subtree is local before building the hierarchy.
    let mut pending = vec![root];
    while let Some(tree) = pending.pop() {
        if !store.contains(&tree) {
            debug!(%tree, "tree missing after commit fetch");
            conn.fetch(store, &[tree], filter, cancel).await?;
        }
        let object = store
            .get_typed(&tree, ObjectType::Tree)
            .map_err(|_| Error::not_found("tree", tree.to_hex()))?;
        pending.extend(
            TreeEntry::decode(&object.data)?
                .into_iter()
                .filter(|entry| entry.mode.is_directory())
                .map(|entry| entry.id),
        );
    }

    build_node(store, root)
}

fn build_node(store: &ObjectStore, id: ObjectId) -> Result<TreeNode> {
    let object = store
        .get_typed(&id, ObjectType::Tree)
        .map_err(|_| Error::not_found("tree", id.to_hex()))?;

    let mut children = BTreeMap::new();
    for entry in TreeEntry::decode(&object.data)? {
        let node = match entry.mode {
            EntryMode::Directory => build_node(store, entry.id)?,
            EntryMode::File | EntryMode::Executable => TreeNode::Blob {
                id: entry.id,
                mode: entry.mode,
            },
            EntryMode::Symlink | EntryMode::Submodule => continue,
        };
        children.insert(entry.name, node);
    }
    Ok(TreeNode::Tree { id, children })
}

/// Reads one object's content, fetching it (unfiltered) on a miss.
pub(crate) async fn get_object(
    conn: &mut Connection,
    store: &mut ObjectStore,
    hex: &str,
    cancel: &CancellationToken,
) -> Result<Bytes> {
    let id = parse_hash(hex)?;
    if id == ObjectId::empty_blob() {
        return Ok(Bytes::new());
    }
    conn.fetch_objects(store, &[id], cancel).await?;
    store
        .get(&id)
        .map(|object| object.data)
        .map_err(|_| Error::not_found("object", hex))
}

/// Reads the message of commit `hex`.
pub(crate) async fn get_commit_message(
    conn: &mut Connection,
    store: &mut ObjectStore,
    hex: &str,
    filter: Option<Filter>,
    cancel: &CancellationToken,
) -> Result<String> {
    let id = parse_hash(hex)?;
    conn.fetch(store, &[id], filter, cancel).await?;
    let object = store
        .get_typed(&id, ObjectType::Commit)
        .map_err(|_| Error::not_found("commit", hex))?;
    Ok(Commit::from_object(&object)?.message)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(byte: u8) -> TreeNode {
        TreeNode::Blob {
            id: ObjectId::from_bytes([byte; 20]),
            mode: EntryMode::File,
        }
    }

    fn sample() -> TreeNode {
        let docs = TreeNode::Tree {
            id: ObjectId::from_bytes([9; 20]),
            children: BTreeMap::from([("guide.md".to_string(), leaf(2))]),
        };
        TreeNode::Tree {
            id: ObjectId::from_bytes([8; 20]),
            children: BTreeMap::from([
                ("README".to_string(), leaf(1)),
                ("docs".to_string(), docs),
            ]),
        }
    }

    #[test]
    fn test_get() {
        let root = sample();
        assert_eq!(root.get("").unwrap(), &root);
        assert_eq!(root.get("docs/guide.md").unwrap().id(), ObjectId::from_bytes([2; 20]));
        assert!(root.get("docs").unwrap().children().is_some());
        assert!(root.get("docs/missing").is_none());
        assert!(root.get("README/below").is_none());
    }

    #[test]
    fn test_paths_and_files() {
        let root = sample();
        assert_eq!(root.paths(), vec!["README", "docs/guide.md"]);
        let files = root.files();
        assert_eq!(files["README"], ObjectId::from_bytes([1; 20]));
        assert!(root.get("README").unwrap().is_leaf());
        assert!(!root.is_leaf());
    }

    #[test]
    fn test_parse_hash() {
        assert!(parse_hash(&"a".repeat(40)).is_ok());
        assert!(parse_hash(&"A".repeat(40)).is_ok());
        assert!(matches!(parse_hash("abc"), Err(Error::InvalidHash(_))));
        assert!(matches!(parse_hash(&"g".repeat(40)), Err(Error::InvalidHash(_))));
    }
}
