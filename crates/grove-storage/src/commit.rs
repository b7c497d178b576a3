//! Commit object decoding and author signatures.

use crate::{GitObject, ObjectId, ObjectType, Result, StorageError};
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// An author or committer line: `name <email> <seconds> <offset>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    /// Display name.
    pub name: String,
    /// Email address.
    pub email: String,
    /// Seconds since the Unix epoch.
    pub when: i64,
    /// Timezone offset as written by git, e.g. `+0000`.
    pub offset: String,
}

impl Signature {
    /// Creates a signature stamped with the current time in UTC.
    pub fn now(name: impl Into<String>, email: impl Into<String>) -> Self {
        let when = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_secs() as i64;
        Self {
            name: name.into(),
            email: email.into(),
            when,
            offset: "+0000".to_string(),
        }
    }

    /// Parses a signature line (without the `author `/`committer ` prefix).
    pub fn parse(line: &str) -> Result<Self> {
        let open = line
            .find('<')
            .ok_or_else(|| StorageError::InvalidObject(format!("malformed signature: {line}")))?;
        let close = line[open..]
            .find('>')
            .map(|i| open + i)
            .ok_or_else(|| StorageError::InvalidObject(format!("malformed signature: {line}")))?;

        let name = line[..open].trim_end().to_string();
        let email = line[open + 1..close].to_string();

        let mut rest = line[close + 1..].split_whitespace();
        let when = rest
            .next()
            .map(|s| s.parse::<i64>())
            .transpose()
            .map_err(|_| StorageError::InvalidObject(format!("malformed timestamp: {line}")))?
            .unwrap_or(0);
        let offset = rest.next().unwrap_or("+0000").to_string();

        Ok(Self {
            name,
            email,
            when,
            offset,
        })
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} <{}> {} {}",
            self.name, self.email, self.when, self.offset
        )
    }
}

/// A decoded commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Commit {
    /// Root tree.
    pub tree: ObjectId,
    /// Parent commits, in order.
    pub parents: Vec<ObjectId>,
    /// Author signature.
    pub author: Signature,
    /// Committer signature.
    pub committer: Signature,
    /// Commit message (everything after the blank line).
    pub message: String,
}

impl Commit {
    /// Encodes the commit as a git object.
    pub fn to_object(&self) -> GitObject {
        GitObject::commit(
            &self.tree,
            &self.parents,
            &self.author.to_string(),
            &self.committer.to_string(),
            &self.message,
        )
    }

    /// Decodes a commit object.
    pub fn from_object(object: &GitObject) -> Result<Self> {
        if object.object_type != ObjectType::Commit {
            return Err(StorageError::InvalidObject(format!(
                "{} is a {}, not a commit",
                object.id, object.object_type
            )));
        }
        Self::decode(&object.data)
    }

    /// Decodes commit data.
    ///
    /// Unknown headers (`gpgsig`, `encoding`, `mergetag`, ...) and their
    /// continuation lines are skipped.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let text = String::from_utf8_lossy(data);
        let (headers, message) = match text.find("\n\n") {
            Some(pos) => (&text[..pos], &text[pos + 2..]),
            None => (text.as_ref(), ""),
        };

        let mut tree = None;
        let mut parents = Vec::new();
        let mut author = None;
        let mut committer = None;

        for line in headers.lines() {
            if line.starts_with(' ') {
                continue;
            }
            if let Some(hex) = line.strip_prefix("tree ") {
                tree = Some(ObjectId::from_hex(hex.trim()).map_err(corrupt_header)?);
            } else if let Some(hex) = line.strip_prefix("parent ") {
                parents.push(ObjectId::from_hex(hex.trim()).map_err(corrupt_header)?);
            } else if let Some(sig) = line.strip_prefix("author ") {
                author = Some(Signature::parse(sig)?);
            } else if let Some(sig) = line.strip_prefix("committer ") {
                committer = Some(Signature::parse(sig)?);
            }
        }

        let tree =
            tree.ok_or_else(|| StorageError::InvalidObject("commit has no tree header".into()))?;
        let author =
            author.ok_or_else(|| StorageError::InvalidObject("commit has no author".into()))?;
        let committer = committer.unwrap_or_else(|| author.clone());

        Ok(Self {
            tree,
            parents,
            author,
            committer,
            message: message.to_string(),
        })
    }
}

fn corrupt_header(err: StorageError) -> StorageError {
    StorageError::InvalidObject(format!("commit header: {err}"))
}
