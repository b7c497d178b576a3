//! Packs the objects a new commit introduces.

use crate::{Error, Result};
use grove_git::PackBuilder;
use grove_storage::{Commit, EntryMode, ObjectId, ObjectStore, ObjectType, TreeEntry};
use std::collections::HashSet;
use tracing::debug;

/// Encodes `commit`, its root tree, every subtree and every blob as a pack.
///
/// Parents are not walked. Promised blobs are left out since the remote
/// already holds them; any other missing object is an error.
pub fn package_closure(store: &ObjectStore, commit: ObjectId) -> Result<Vec<u8>> {
    let object = store
        .get_typed(&commit, ObjectType::Commit)
        .map_err(|_| Error::Internal(format!("commit {commit} is not in the local store")))?;
    let root = Commit::from_object(&object)?.tree;

    let mut pack = PackBuilder::new();
    pack.add(object);

    let mut seen = HashSet::new();
    let mut trees = vec![root];
    let mut skipped = 0usize;
    while let Some(id) = trees.pop() {
        if !seen.insert(id) {
            continue;
        }
        let tree = store
            .get_typed(&id, ObjectType::Tree)
            .map_err(|_| Error::Internal(format!("tree {id} is not in the local store")))?;
        for entry in TreeEntry::decode(&tree.data)? {
            match entry.mode {
                EntryMode::Directory => trees.push(entry.id),
                EntryMode::Submodule => {}
                _ => {
                    if !seen.insert(entry.id) {
                        continue;
                    }
                    if store.contains(&entry.id) {
                        pack.add_from_store(store, &entry.id)?;
                    } else if store.is_promised(&entry.id) {
                        skipped += 1;
                    } else {
                        return Err(Error::Internal(format!(
                            "blob {} ({}) is neither local nor promised",
                            entry.id, entry.name
                        )));
                    }
                }
            }
        }
        pack.add(tree);
    }

    if pack.is_empty() {
        return Err(Error::Internal(format!("nothing to pack for {commit}")));
    }
    debug!(%commit, objects = pack.len(), promised = skipped, "packaged commit closure");
    Ok(pack.build()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use grove_git::PackParser;
    use grove_storage::GitObject;

    fn commit(store: &mut ObjectStore, tree: ObjectId, parents: &[ObjectId]) -> ObjectId {
        store.put(GitObject::commit(
            &tree,
            parents,
            "A <a@example.com> 0 +0000",
            "A <a@example.com> 0 +0000",
            "msg",
        ))
    }

    #[test]
    fn test_packs_commit_trees_and_blobs() {
        let mut store = ObjectStore::new();
        let blob = store.put_blob(b"shared".to_vec());
        let sub = store.put(GitObject::tree(vec![TreeEntry::new(EntryMode::File, "x", blob)]));
        let root = store.put(GitObject::tree(vec![
            TreeEntry::new(EntryMode::File, "same", blob),
            TreeEntry::new(EntryMode::Directory, "sub", sub),
        ]));
        let parent = commit(&mut store, ObjectId::empty_tree(), &[]);
        let head = commit(&mut store, root, &[parent]);

        let pack = package_closure(&store, head).unwrap();
        let mut remote = ObjectStore::new();
        let ids: HashSet<_> = PackParser::new(&pack)
            .parse(&mut remote)
            .unwrap()
            .into_iter()
            .collect();
        assert_eq!(ids, HashSet::from([head, root, sub, blob]));
        assert!(!remote.contains(&parent));
    }

    #[test]
    fn test_promised_blobs_are_skipped() {
        let mut store = ObjectStore::new();
        let promised = ObjectId::from_bytes([5; 20]);
        store.promise(promised);
        let root = store.put(GitObject::tree(vec![TreeEntry::new(
            EntryMode::File,
            "remote-only",
            promised,
        )]));
        let head = commit(&mut store, root, &[]);

        let pack = package_closure(&store, head).unwrap();
        let mut remote = ObjectStore::new();
        let ids = PackParser::new(&pack).parse(&mut remote).unwrap();
        assert_eq!(ids.len(), 2);
    }

    #[test]
    fn test_missing_objects_are_internal_errors() {
        let mut store = ObjectStore::new();
        let root = store.put(GitObject::tree(vec![TreeEntry::new(
            EntryMode::File,
            "lost",
            ObjectId::from_bytes([6; 20]),
        )]));
        let head = commit(&mut store, root, &[]);
        assert!(matches!(package_closure(&store, head), Err(Error::Internal(_))));

        let absent = ObjectId::from_bytes([1; 20]);
        assert!(matches!(package_closure(&store, absent), Err(Error::Internal(_))));
    }
}
