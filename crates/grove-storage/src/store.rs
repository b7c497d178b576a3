//! Object store and in-process repositories.

use crate::{GitObject, ObjectId, ObjectType, Ref, RefStore, Result, StorageError};
use bytes::Bytes;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::io::{Read, Write};

/// Content-addressed object store.
///
/// A plain keyed map owned by a single client; it performs no locking of its
/// own. Besides the objects themselves it tracks *promised* ids: blobs known to
/// exist on the remote that were deliberately not downloaded.
#[derive(Debug, Default)]
pub struct ObjectStore {
    /// Objects indexed by their SHA-1 hash.
    objects: HashMap<ObjectId, GitObject>,
    promised: HashSet<ObjectId>,
}

impl ObjectStore {
    /// Creates a new empty object store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores an object and returns its ID.
    pub fn put(&mut self, object: GitObject) -> ObjectId {
        let id = object.id;
        self.promised.remove(&id);
        self.objects.insert(id, object);
        id
    }

    /// Retrieves an object by ID.
    pub fn get(&self, id: &ObjectId) -> Result<GitObject> {
        self.objects
            .get(id)
            .cloned()
            .ok_or_else(|| StorageError::ObjectNotFound(id.to_hex()))
    }

    /// Retrieves an object by ID, checking its type.
    pub fn get_typed(&self, id: &ObjectId, expected: ObjectType) -> Result<GitObject> {
        let object = self.get(id)?;
        if object.object_type != expected {
            return Err(StorageError::InvalidObject(format!(
                "{} is a {}, expected a {}",
                id, object.object_type, expected
            )));
        }
        Ok(object)
    }

    /// Checks if an object exists.
    pub fn contains(&self, id: &ObjectId) -> bool {
        self.objects.contains_key(id)
    }

    /// Returns the number of objects in the store.
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// Returns true if the store is empty.
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Lists all object IDs.
    pub fn list_objects(&self) -> Vec<ObjectId> {
        self.objects.keys().copied().collect()
    }

    /// Ids of every stored object of the given type.
    pub fn ids_of_type(&self, object_type: ObjectType) -> Vec<ObjectId> {
        self.objects
            .values()
            .filter(|o| o.object_type == object_type)
            .map(|o| o.id)
            .collect()
    }

    /// Stores a blob and returns its ID.
    pub fn put_blob(&mut self, content: impl Into<Bytes>) -> ObjectId {
        self.put(GitObject::blob(content))
    }

    /// Records that `id` exists remotely without being held locally.
    ///
    /// Ids already present are not recorded.
    pub fn promise(&mut self, id: ObjectId) {
        if !self.objects.contains_key(&id) {
            self.promised.insert(id);
        }
    }

    /// Returns true if `id` is absent but known to exist remotely.
    pub fn is_promised(&self, id: &ObjectId) -> bool {
        self.promised.contains(id)
    }

    /// Compresses an object into the loose-object format.
    pub fn compress(object: &GitObject) -> Result<Vec<u8>> {
        let header = format!("{} {}\0", object.object_type.as_str(), object.data.len());
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(header.as_bytes())
            .map_err(|e| StorageError::Compression(e.to_string()))?;
        encoder
            .write_all(&object.data)
            .map_err(|e| StorageError::Compression(e.to_string()))?;
        encoder
            .finish()
            .map_err(|e| StorageError::Compression(e.to_string()))
    }

    /// Decompresses a loose object.
    pub fn decompress(compressed: &[u8]) -> Result<GitObject> {
        let mut decoder = ZlibDecoder::new(compressed);
        let mut decompressed = Vec::new();
        decoder
            .read_to_end(&mut decompressed)
            .map_err(|e| StorageError::Compression(e.to_string()))?;

        // Parse header: "type size\0data"
        let null_pos = decompressed.iter().position(|&b| b == 0).ok_or_else(|| {
            StorageError::InvalidObject("missing null byte in header".to_string())
        })?;

        let header = String::from_utf8_lossy(&decompressed[..null_pos]);
        let parts: Vec<&str> = header.split(' ').collect();
        if parts.len() != 2 {
            return Err(StorageError::InvalidObject(format!(
                "invalid header: {}",
                header
            )));
        }

        let object_type = ObjectType::parse(parts[0])?;
        let size: usize = parts[1]
            .parse()
            .map_err(|_| StorageError::InvalidObject("invalid size".to_string()))?;

        let data = Bytes::from(decompressed[null_pos + 1..].to_vec());
        if data.len() != size {
            return Err(StorageError::InvalidObject(format!(
                "size mismatch: header says {}, found {}",
                size,
                data.len()
            )));
        }
        Ok(GitObject::new(object_type, data))
    }
}

/// A repository held in memory: objects plus references.
///
/// This is the server side of the in-process `memory://` remote; unlike the
/// client's [`ObjectStore`] it is shared between sessions and locks internally.
#[derive(Debug)]
pub struct Repository {
    /// Repository name.
    pub name: String,
    /// Object store.
    pub objects: RwLock<ObjectStore>,
    /// Reference store.
    pub refs: RefStore,
}

impl Repository {
    /// Creates a new empty repository.
    pub fn new(name: impl Into<String>) -> Self {
        let refs = RefStore::new();
        refs.set_symbolic("HEAD", "refs/heads/main");

        Self {
            name: name.into(),
            objects: RwLock::new(ObjectStore::new()),
            refs,
        }
    }

    /// Lists every direct reference, plus HEAD when it resolves.
    pub fn list_refs(&self) -> Vec<Ref> {
        let mut refs: Vec<Ref> = self
            .refs
            .list_all()
            .into_iter()
            .filter(|(name, _)| name != "HEAD")
            .filter_map(|(name, reference)| reference.as_direct().map(|id| Ref::new(name, id)))
            .collect();
        refs.sort_by(|a, b| a.name.cmp(&b.name));
        if let Ok(head) = self.refs.resolve_head() {
            refs.insert(0, Ref::new("HEAD", head));
        }
        refs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_store_roundtrip() {
        let mut store = ObjectStore::new();
        let blob = GitObject::blob(b"Hello, World!".to_vec());
        let id = blob.id;

        store.put(blob);

        let retrieved = store.get(&id).unwrap();
        assert_eq!(retrieved.data.as_ref(), b"Hello, World!");
        assert!(store.contains(&id));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_object_store_missing() {
        let store = ObjectStore::new();
        let result = store.get(&ObjectId::empty_blob());
        assert!(matches!(result, Err(StorageError::ObjectNotFound(_))));
        assert!(store.is_empty());
    }

    #[test]
    fn test_get_typed_rejects_other_type() {
        let mut store = ObjectStore::new();
        let id = store.put_blob(b"data".to_vec());
        assert!(store.get_typed(&id, ObjectType::Blob).is_ok());
        assert!(store.get_typed(&id, ObjectType::Commit).is_err());
    }

    #[test]
    fn test_promised_cleared_on_put() {
        let mut store = ObjectStore::new();
        let blob = GitObject::blob(b"later".to_vec());

        store.promise(blob.id);
        assert!(store.is_promised(&blob.id));

        store.put(blob.clone());
        assert!(!store.is_promised(&blob.id));

        // Present objects are never recorded as promised.
        store.promise(blob.id);
        assert!(!store.is_promised(&blob.id));
    }

    #[test]
    fn test_ids_of_type() {
        let mut store = ObjectStore::new();
        store.put_blob(b"a".to_vec());
        let tree = store.put(GitObject::tree(Vec::new()));
        assert_eq!(store.ids_of_type(ObjectType::Tree), vec![tree]);
        assert_eq!(store.ids_of_type(ObjectType::Blob).len(), 1);
        assert!(store.ids_of_type(ObjectType::Commit).is_empty());
    }

    #[test]
    fn test_object_compression_roundtrip() {
        let original = GitObject::blob(b"Hello, World!".to_vec());
        let compressed = ObjectStore::compress(&original).unwrap();
        let decompressed = ObjectStore::decompress(&compressed).unwrap();

        assert_eq!(original.id, decompressed.id);
        assert_eq!(original.object_type, decompressed.object_type);
        assert_eq!(original.data, decompressed.data);
    }

    #[test]
    fn test_decompress_rejects_garbage() {
        assert!(ObjectStore::decompress(b"not zlib").is_err());
    }

    #[test]
    fn test_repository_lists_head_first() {
        let repo = Repository::new("test-repo");
        assert!(repo.list_refs().is_empty());

        let id = repo.objects.write().put_blob(b"x".to_vec());
        repo.refs.set("refs/heads/main", id);
        repo.refs.set("refs/tags/v1", id);

        let refs = repo.list_refs();
        let names: Vec<_> = refs.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["HEAD", "refs/heads/main", "refs/tags/v1"]);
    }
}
