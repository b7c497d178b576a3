//! Tree (directory) object encoding.
//!
//! A tree is a sequence of `<mode> SP <name> NUL <20-byte id>` entries sorted
//! in git order: by name, with directory names compared as if they ended in `/`.

use crate::{GitObject, ObjectId, ObjectType, Result, StorageError};
use std::cmp::Ordering;

/// File mode of a tree entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryMode {
    /// Regular file (`100644`).
    File,
    /// Executable file (`100755`).
    Executable,
    /// Subdirectory (`40000`).
    Directory,
    /// Symbolic link (`120000`).
    Symlink,
    /// Submodule commit link (`160000`).
    Submodule,
}

impl EntryMode {
    /// Returns the octal representation written into tree objects.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::File => "100644",
            Self::Executable => "100755",
            Self::Directory => "40000",
            Self::Symlink => "120000",
            Self::Submodule => "160000",
        }
    }

    /// Parses a mode as found in tree objects.
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "100644" | "100664" => Ok(Self::File),
            "100755" => Ok(Self::Executable),
            "40000" | "040000" => Ok(Self::Directory),
            "120000" => Ok(Self::Symlink),
            "160000" => Ok(Self::Submodule),
            _ => Err(StorageError::InvalidObject(format!(
                "unknown tree entry mode: {}",
                s
            ))),
        }
    }

    /// Returns true for modes whose target is a plain blob of file content.
    pub fn is_regular_file(&self) -> bool {
        matches!(self, Self::File | Self::Executable)
    }

    /// Returns true for modes that point at a blob (files and symlinks).
    pub fn is_blob(&self) -> bool {
        matches!(self, Self::File | Self::Executable | Self::Symlink)
    }

    /// Returns true for subdirectories.
    pub fn is_directory(&self) -> bool {
        matches!(self, Self::Directory)
    }
}

/// A single entry of a tree object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeEntry {
    /// Entry mode.
    pub mode: EntryMode,
    /// Entry name (a single path component).
    pub name: String,
    /// Id of the referenced blob, tree or commit.
    pub id: ObjectId,
}

impl TreeEntry {
    /// Creates a new tree entry.
    pub fn new(mode: EntryMode, name: impl Into<String>, id: ObjectId) -> Self {
        Self {
            mode,
            name: name.into(),
            id,
        }
    }

    /// Compares two entries in git tree order.
    pub fn git_cmp(&self, other: &Self) -> Ordering {
        let a = self.name.as_bytes();
        let b = other.name.as_bytes();
        let common = a.len().min(b.len());
        match a[..common].cmp(&b[..common]) {
            Ordering::Equal => {}
            ord => return ord,
        }
        let tail = |bytes: &[u8], mode: EntryMode| -> Option<u8> {
            bytes
                .get(common)
                .copied()
                .or(mode.is_directory().then_some(b'/'))
        };
        tail(a, self.mode).cmp(&tail(b, other.mode))
    }

    /// Encodes entries as tree object data, sorting them in git order.
    pub fn encode(entries: &mut [TreeEntry]) -> Vec<u8> {
        entries.sort_by(TreeEntry::git_cmp);
        let mut data = Vec::new();
        for entry in entries.iter() {
            data.extend_from_slice(entry.mode.as_str().as_bytes());
            data.push(b' ');
            data.extend_from_slice(entry.name.as_bytes());
            data.push(0);
            data.extend_from_slice(entry.id.as_bytes());
        }
        data
    }

    /// Decodes tree object data into its entries.
    pub fn decode(data: &[u8]) -> Result<Vec<TreeEntry>> {
        let mut entries = Vec::new();
        let mut pos = 0;

        while pos < data.len() {
            let space = data[pos..]
                .iter()
                .position(|&b| b == b' ')
                .ok_or_else(|| StorageError::InvalidObject("tree entry missing mode".into()))?;
            let mode = std::str::from_utf8(&data[pos..pos + space])
                .map_err(|_| StorageError::InvalidObject("tree entry mode not utf-8".into()))?;
            let mode = EntryMode::parse(mode)?;
            pos += space + 1;

            let nul = data[pos..]
                .iter()
                .position(|&b| b == 0)
                .ok_or_else(|| StorageError::InvalidObject("tree entry missing name".into()))?;
            let name = String::from_utf8(data[pos..pos + nul].to_vec())
                .map_err(|_| StorageError::InvalidObject("tree entry name not utf-8".into()))?;
            if name.is_empty() || name.contains('/') {
                return Err(StorageError::InvalidObject(format!(
                    "invalid tree entry name: {:?}",
                    name
                )));
            }
            pos += nul + 1;

            let raw = data.get(pos..pos + 20).ok_or_else(|| {
                StorageError::InvalidObject("tree entry truncated before id".into())
            })?;
            let id = ObjectId::from_slice(raw)?;
            pos += 20;

            entries.push(TreeEntry { mode, name, id });
        }

        Ok(entries)
    }
}

impl GitObject {
    /// Creates a tree object from its entries.
    pub fn tree(mut entries: Vec<TreeEntry>) -> Self {
        Self::new(ObjectType::Tree, TreeEntry::encode(&mut entries))
    }
}
