//! Git pack file format implementation.
//!
//! Pack files are the format used by git for efficient object transfer.
//! See: https://git-scm.com/docs/pack-format

use crate::{GitError, Result};
use bytes::Bytes;
use flate2::bufread::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use grove_storage::{GitObject, ObjectId, ObjectStore, ObjectType};
use sha1::{Digest, Sha1};
use std::collections::HashMap;
use std::io::{Read, Write};

/// Magic bytes at the start of a pack file.
const PACK_SIGNATURE: &[u8; 4] = b"PACK";
/// Pack file version we support.
const PACK_VERSION: u32 = 2;
/// Header (12 bytes) plus trailing checksum (20 bytes).
const MIN_PACK_LEN: usize = 32;

const OFS_DELTA: u8 = 6;
const REF_DELTA: u8 = 7;

/// Builds a pack file from a set of objects.
pub struct PackBuilder {
    objects: Vec<GitObject>,
}

impl PackBuilder {
    /// Creates a new pack builder.
    pub fn new() -> Self {
        Self {
            objects: Vec::new(),
        }
    }

    /// Adds an object to the pack.
    pub fn add(&mut self, object: GitObject) {
        self.objects.push(object);
    }

    /// Adds an object from the store by ID.
    pub fn add_from_store(&mut self, store: &ObjectStore, id: &ObjectId) -> Result<()> {
        let object = store.get(id)?;
        self.objects.push(object);
        Ok(())
    }

    /// Number of objects added so far.
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// Returns true when no object has been added.
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Builds the pack file.
    pub fn build(self) -> Result<Vec<u8>> {
        let mut pack = Vec::new();

        pack.extend_from_slice(PACK_SIGNATURE);
        pack.extend_from_slice(&PACK_VERSION.to_be_bytes());
        pack.extend_from_slice(&(self.objects.len() as u32).to_be_bytes());

        for object in &self.objects {
            write_entry_header(&mut pack, object.object_type.pack_type(), object.data.len());
            pack.extend_from_slice(&deflate(&object.data)?);
        }

        let checksum = Sha1::digest(&pack);
        pack.extend_from_slice(&checksum);

        Ok(pack)
    }
}

impl Default for PackBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Writes the variable-length type and size header of an entry.
///
/// First byte: (MSB=more bytes) (3 bits type) (4 bits size), then 7 bits of
/// size per byte.
fn write_entry_header(pack: &mut Vec<u8>, type_code: u8, size: usize) {
    let mut first_byte = (type_code << 4) | ((size & 0x0F) as u8);
    let mut remaining_size = size >> 4;

    if remaining_size > 0 {
        first_byte |= 0x80;
    }
    pack.push(first_byte);

    while remaining_size > 0 {
        let mut byte = (remaining_size & 0x7F) as u8;
        remaining_size >>= 7;
        if remaining_size > 0 {
            byte |= 0x80;
        }
        pack.push(byte);
    }
}

fn deflate(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(data)
        .map_err(|e| GitError::InvalidPack(e.to_string()))?;
    encoder
        .finish()
        .map_err(|e| GitError::InvalidPack(e.to_string()))
}

/// Where a delta entry finds its base.
#[derive(Debug, Clone, Copy)]
enum DeltaBase {
    /// Byte offset of an earlier entry in the same pack.
    Offset(usize),
    /// Object id, in the pack or already in the store (thin packs).
    Id(ObjectId),
}

/// One decoded pack entry before delta resolution.
enum Entry {
    Whole(ObjectType, Vec<u8>),
    Delta(DeltaBase, Vec<u8>),
}

#[derive(Debug)]
struct DeltaEntry {
    offset: usize,
    base: DeltaBase,
    delta: Vec<u8>,
}

/// Parses a pack file and extracts objects.
pub struct PackParser<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> PackParser<'a> {
    /// Creates a new pack parser.
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Parses the pack file and stores objects.
    ///
    /// Deltified entries are resolved against earlier entries or against
    /// objects already in `store`. Returns ids in pack order.
    pub fn parse(&mut self, store: &mut ObjectStore) -> Result<Vec<ObjectId>> {
        if self.data.len() < MIN_PACK_LEN {
            return Err(GitError::InvalidPack("pack too small".to_string()));
        }

        if &self.data[0..4] != PACK_SIGNATURE {
            return Err(GitError::InvalidPack("invalid signature".to_string()));
        }

        let version = u32::from_be_bytes([self.data[4], self.data[5], self.data[6], self.data[7]]);
        if version != PACK_VERSION {
            return Err(GitError::InvalidPack(format!(
                "unsupported version: {}",
                version
            )));
        }

        let checksum_start = self.data.len() - 20;
        let computed = Sha1::digest(&self.data[..checksum_start]);
        if computed.as_slice() != &self.data[checksum_start..] {
            return Err(GitError::InvalidPack("checksum mismatch".to_string()));
        }

        let object_count =
            u32::from_be_bytes([self.data[8], self.data[9], self.data[10], self.data[11]]) as usize;

        self.pos = 12;

        let mut by_offset: HashMap<usize, (ObjectType, Bytes)> = HashMap::new();
        let mut ids_by_offset: HashMap<usize, ObjectId> = HashMap::new();
        let mut order = Vec::with_capacity(object_count.min(checksum_start));
        let mut pending = Vec::new();

        for _ in 0..object_count {
            let offset = self.pos;
            order.push(offset);
            match self.parse_entry(checksum_start)? {
                Entry::Whole(object_type, data) => {
                    let object = GitObject::new(object_type, data);
                    ids_by_offset.insert(offset, object.id);
                    by_offset.insert(offset, (object_type, object.data.clone()));
                    store.put(object);
                }
                Entry::Delta(base, delta) => pending.push(DeltaEntry {
                    offset,
                    base,
                    delta,
                }),
            }
        }

        if self.pos != checksum_start {
            return Err(GitError::InvalidPack(format!(
                "{} trailing bytes after last entry",
                checksum_start - self.pos
            )));
        }

        while !pending.is_empty() {
            let before = pending.len();
            let mut still_pending = Vec::new();

            for entry in pending {
                let base = match entry.base {
                    DeltaBase::Offset(base_offset) => by_offset.get(&base_offset).cloned(),
                    DeltaBase::Id(id) => store.get(&id).ok().map(|o| (o.object_type, o.data)),
                };
                let Some((object_type, base_data)) = base else {
                    still_pending.push(entry);
                    continue;
                };

                let data = apply_delta(&base_data, &entry.delta)?;
                let object = GitObject::new(object_type, data);
                ids_by_offset.insert(entry.offset, object.id);
                by_offset.insert(entry.offset, (object_type, object.data.clone()));
                store.put(object);
            }

            if still_pending.len() == before {
                return Err(GitError::InvalidPack(format!(
                    "{} delta entries have no resolvable base",
                    before
                )));
            }
            pending = still_pending;
        }

        order
            .iter()
            .map(|offset| {
                ids_by_offset
                    .get(offset)
                    .copied()
                    .ok_or_else(|| GitError::InvalidPack(format!("unresolved entry at {offset}")))
            })
            .collect()
    }

    /// Parses one entry header and inflates its payload.
    fn parse_entry(&mut self, end: usize) -> Result<Entry> {
        let entry_offset = self.pos;
        let first_byte = self.next_byte(end)?;

        let type_code = (first_byte >> 4) & 0x07;
        let mut size = (first_byte & 0x0F) as usize;
        let mut shift = 4;

        let mut byte = first_byte;
        while byte & 0x80 != 0 {
            byte = self.next_byte(end)?;
            if shift > 57 {
                return Err(GitError::InvalidPack("entry size overflow".to_string()));
            }
            size |= ((byte & 0x7F) as usize) << shift;
            shift += 7;
        }

        let base = match type_code {
            OFS_DELTA => {
                let mut byte = self.next_byte(end)?;
                let mut distance = (byte & 0x7F) as usize;
                while byte & 0x80 != 0 {
                    byte = self.next_byte(end)?;
                    distance = distance
                        .checked_add(1)
                        .and_then(|d| d.checked_mul(128))
                        .map(|d| d | (byte & 0x7F) as usize)
                        .ok_or_else(|| GitError::InvalidPack("delta offset overflow".into()))?;
                }
                let base_offset = entry_offset
                    .checked_sub(distance)
                    .filter(|_| distance > 0)
                    .ok_or_else(|| {
                        GitError::InvalidPack(format!("bad delta base offset at {entry_offset}"))
                    })?;
                Some(DeltaBase::Offset(base_offset))
            }
            REF_DELTA => {
                let raw = self
                    .data
                    .get(self.pos..self.pos + 20)
                    .filter(|_| self.pos + 20 <= end)
                    .ok_or_else(|| GitError::InvalidPack("truncated delta base id".into()))?;
                let id = ObjectId::from_slice(raw)?;
                self.pos += 20;
                Some(DeltaBase::Id(id))
            }
            _ => None,
        };

        match base {
            Some(base) => Ok(Entry::Delta(base, self.inflate(end, size)?)),
            None => {
                let object_type = ObjectType::from_pack_type(type_code)?;
                Ok(Entry::Whole(object_type, self.inflate(end, size)?))
            }
        }
    }

    fn next_byte(&mut self, end: usize) -> Result<u8> {
        if self.pos >= end {
            return Err(GitError::InvalidPack("unexpected end of pack".to_string()));
        }
        let byte = self.data[self.pos];
        self.pos += 1;
        Ok(byte)
    }

    /// Inflates one zlib stream and advances past it.
    fn inflate(&mut self, end: usize, size: usize) -> Result<Vec<u8>> {
        let remaining = &self.data[self.pos..end];
        let mut decoder = ZlibDecoder::new(remaining);
        let mut decompressed = Vec::with_capacity(size.min(remaining.len() * 4));
        (&mut decoder)
            .take((size as u64).saturating_add(1))
            .read_to_end(&mut decompressed)
            .map_err(|e| GitError::InvalidPack(format!("decompression failed: {}", e)))?;

        if decompressed.len() != size {
            return Err(GitError::InvalidPack(format!(
                "entry size mismatch: header says {}, inflated {}",
                size,
                decompressed.len()
            )));
        }

        self.pos += decoder.total_in() as usize;
        Ok(decompressed)
    }
}

/// Applies a git delta to `base`, producing the target object data.
pub fn apply_delta(base: &[u8], delta: &[u8]) -> Result<Vec<u8>> {
    let mut pos = 0;
    let source_size = read_delta_size(delta, &mut pos)?;
    let target_size = read_delta_size(delta, &mut pos)?;

    if source_size != base.len() {
        return Err(GitError::InvalidPack(format!(
            "delta expects base of {} bytes, got {}",
            source_size,
            base.len()
        )));
    }

    let mut out = Vec::with_capacity(target_size);
    while pos < delta.len() {
        let op = delta[pos];
        pos += 1;

        if op & 0x80 != 0 {
            let mut offset = 0usize;
            for i in 0..4 {
                if op & (1 << i) != 0 {
                    let byte = *delta
                        .get(pos)
                        .ok_or_else(|| GitError::InvalidPack("truncated copy op".into()))?;
                    offset |= (byte as usize) << (8 * i);
                    pos += 1;
                }
            }
            let mut len = 0usize;
            for i in 0..3 {
                if op & (0x10 << i) != 0 {
                    let byte = *delta
                        .get(pos)
                        .ok_or_else(|| GitError::InvalidPack("truncated copy op".into()))?;
                    len |= (byte as usize) << (8 * i);
                    pos += 1;
                }
            }
            if len == 0 {
                len = 0x10000;
            }
            let chunk = offset
                .checked_add(len)
                .and_then(|stop| base.get(offset..stop))
                .ok_or_else(|| GitError::InvalidPack("copy op outside base".into()))?;
            out.extend_from_slice(chunk);
        } else if op != 0 {
            let len = op as usize;
            let chunk = delta
                .get(pos..pos + len)
                .ok_or_else(|| GitError::InvalidPack("truncated insert op".into()))?;
            out.extend_from_slice(chunk);
            pos += len;
        } else {
            return Err(GitError::InvalidPack("reserved delta opcode 0".into()));
        }

        if out.len() > target_size {
            return Err(GitError::InvalidPack("delta overruns target size".into()));
        }
    }

    if out.len() != target_size {
        return Err(GitError::InvalidPack(format!(
            "delta produced {} bytes, expected {}",
            out.len(),
            target_size
        )));
    }
    Ok(out)
}

fn read_delta_size(delta: &[u8], pos: &mut usize) -> Result<usize> {
    let mut size = 0usize;
    let mut shift = 0;
    loop {
        let byte = *delta
            .get(*pos)
            .ok_or_else(|| GitError::InvalidPack("truncated delta header".into()))?;
        *pos += 1;
        if shift > 57 {
            return Err(GitError::InvalidPack("delta size overflow".into()));
        }
        size |= ((byte & 0x7F) as usize) << shift;
        shift += 7;
        if byte & 0x80 == 0 {
            return Ok(size);
        }
    }
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        /// Property: every object put into a pack comes back with the same id.
        #[test]
        fn prop_pack_preserves_objects(
            blobs in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..300), 0..8)
        ) {
            let mut builder = PackBuilder::new();
            let mut expected = Vec::new();
            for blob in blobs {
                let object = GitObject::blob(blob);
                expected.push(object.id);
                builder.add(object);
            }
            let pack = builder.build().unwrap();

            let mut store = ObjectStore::new();
            let ids = PackParser::new(&pack).parse(&mut store).unwrap();
            prop_assert_eq!(ids, expected);
        }

        /// Property: arbitrary input never panics the parser.
        #[test]
        fn prop_pack_parser_no_panic(data in prop::collection::vec(any::<u8>(), 0..512)) {
            let mut store = ObjectStore::new();
            let _ = PackParser::new(&data).parse(&mut store);
        }

        /// Property: arbitrary deltas never panic.
        #[test]
        fn prop_apply_delta_no_panic(
            base in prop::collection::vec(any::<u8>(), 0..64),
            delta in prop::collection::vec(any::<u8>(), 0..64)
        ) {
            let _ = apply_delta(&base, &delta);
        }
    }
}
