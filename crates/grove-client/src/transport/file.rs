//! Local repository on disk (`file://` and plain paths).
//!
//! Objects are read from loose files and pack files, refs from loose files
//! and `packed-refs`. Pushes write loose objects and loose refs. Each ref
//! update takes a `<ref>.lock` file the way git does, so concurrent writers
//! that honour lock files are serialised; anything else can race.
//!
//! Pack files are parsed once per session. A repack by another process while
//! a session is open is not seen until the next session.

use super::{FetchResponse, Session, Transport};
use crate::{Error, Result};
use async_trait::async_trait;
use grove_git::{
    collect_closure, Advertisement, Command, FetchRequest, GitError, ObjectSource, PackBuilder,
    PackParser, PushReport, RefStatus, Service,
};
use grove_storage::{GitObject, ObjectId, ObjectStore, Ref, RefUpdateError};
use std::collections::BTreeMap;
use std::fs;
use std::io::{ErrorKind as IoErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Serves a git directory on the local filesystem.
#[derive(Debug, Clone)]
pub struct FileTransport {
    path: PathBuf,
}

impl FileTransport {
    /// Creates a transport for the repository at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Creates an empty bare repository at `path` and returns a transport for it.
    pub fn init(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        for dir in ["objects/pack", "objects/info", "refs/heads", "refs/tags"] {
            fs::create_dir_all(path.join(dir))?;
        }
        fs::write(path.join("HEAD"), "ref: refs/heads/main\n")?;
        fs::write(
            path.join("config"),
            "[core]\n\trepositoryformatversion = 0\n\tbare = true\n",
        )?;
        Ok(Self::new(path))
    }
}

#[async_trait]
impl Transport for FileTransport {
    async fn open(&self, service: Service) -> Result<Box<dyn Session>> {
        let path = self.path.clone();
        let (dir, refs) = tokio::task::spawn_blocking(move || {
            let dir = GitDir::locate(&path)?;
            let refs = dir.list_refs()?;
            Ok::<_, Error>((dir, refs))
        })
        .await??;

        debug!(path = %dir.root.display(), %service, refs = refs.len(), "file session opened");
        let advertisement = Advertisement {
            refs,
            capabilities: ["report-status", "delete-refs", "ofs-delta", "filter"]
                .into_iter()
                .map(str::to_string)
                .collect(),
        };
        Ok(Box::new(FileSession {
            dir,
            advertisement,
            packs: PackCache::default(),
        }))
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

struct FileSession {
    dir: GitDir,
    advertisement: Advertisement,
    packs: PackCache,
}

/// Objects of the repository's pack files, loaded on first use.
#[derive(Debug, Clone, Default)]
struct PackCache(Option<Arc<ObjectStore>>);

impl PackCache {
    fn get(&mut self, dir: &GitDir) -> Result<Arc<ObjectStore>> {
        if let Some(packed) = &self.0 {
            return Ok(Arc::clone(packed));
        }
        let packed = Arc::new(dir.load_packs()?);
        self.0 = Some(Arc::clone(&packed));
        Ok(packed)
    }
}

#[async_trait]
impl Session for FileSession {
    fn advertisement(&self) -> &Advertisement {
        &self.advertisement
    }

    async fn fetch(&mut self, request: &FetchRequest) -> Result<FetchResponse> {
        let dir = self.dir.clone();
        let request = request.clone();
        let mut packs = self.packs.clone();
        let (response, packs) = tokio::task::spawn_blocking(move || -> Result<_> {
            let objects = DiskObjects {
                dir: &dir,
                packed: packs.get(&dir)?,
            };
            let closure =
                collect_closure(&objects, &request.wants, &request.haves, request.filter)?;
            let response = if closure.is_empty() {
                FetchResponse::default()
            } else {
                let mut builder = PackBuilder::new();
                for object in closure {
                    builder.add(object);
                }
                FetchResponse {
                    pack: builder.build()?,
                    filtered: request.filter.is_some(),
                }
            };
            Ok((response, packs))
        })
        .await??;
        self.packs = packs;
        Ok(response)
    }

    async fn push(&mut self, commands: &[Command], pack: Vec<u8>) -> Result<PushReport> {
        let dir = self.dir.clone();
        let commands = commands.to_vec();
        let mut packs = self.packs.clone();
        let (report, packs) = tokio::task::spawn_blocking(move || {
            let report = dir.receive(&commands, &pack, &mut packs)?;
            Ok::<_, Error>((report, packs))
        })
        .await??;
        self.packs = packs;
        Ok(report)
    }
}

/// A resolved git directory.
#[derive(Debug, Clone)]
struct GitDir {
    root: PathBuf,
}

impl GitDir {
    fn locate(path: &Path) -> Result<Self> {
        let dotgit = path.join(".git");
        let root = if dotgit.join("objects").is_dir() {
            dotgit
        } else if path.join("objects").is_dir() {
            path.to_path_buf()
        } else {
            return Err(Error::not_found(
                "repository",
                path.display().to_string(),
            ));
        };
        Ok(Self { root })
    }

    fn loose_path(&self, id: &ObjectId) -> PathBuf {
        let hex = id.to_hex();
        self.root.join("objects").join(&hex[..2]).join(&hex[2..])
    }

    fn read_loose(&self, id: &ObjectId) -> Result<Option<GitObject>> {
        let data = match fs::read(self.loose_path(id)) {
            Ok(data) => data,
            Err(e) if e.kind() == IoErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let object = ObjectStore::decompress(&data)?;
        if object.id != *id {
            return Err(Error::Internal(format!(
                "loose object {} hashes to {}",
                id, object.id
            )));
        }
        Ok(Some(object))
    }

    fn write_loose(&self, object: &GitObject) -> Result<()> {
        let path = self.loose_path(&object.id);
        if path.exists() {
            return Ok(());
        }
        let parent = path
            .parent()
            .ok_or_else(|| Error::Internal(format!("bad object path {}", path.display())))?;
        fs::create_dir_all(parent)?;
        let tmp = parent.join(format!("tmp_obj_{}", object.id));
        fs::write(&tmp, ObjectStore::compress(object)?)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Reads every object stored in pack files.
    fn load_packs(&self) -> Result<ObjectStore> {
        let mut store = ObjectStore::new();
        let pack_dir = self.root.join("objects").join("pack");
        let entries = match fs::read_dir(&pack_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == IoErrorKind::NotFound => return Ok(store),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("pack") {
                continue;
            }
            let data = fs::read(&path)?;
            let ids = PackParser::new(&data).parse(&mut store)?;
            debug!(pack = %path.display(), objects = ids.len(), "loaded pack");
        }
        Ok(store)
    }

    fn packed_refs(&self) -> Result<BTreeMap<String, ObjectId>> {
        let text = match fs::read_to_string(self.root.join("packed-refs")) {
            Ok(text) => text,
            Err(e) if e.kind() == IoErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => return Err(e.into()),
        };
        let mut refs = BTreeMap::new();
        for line in text.lines() {
            if line.starts_with('#') || line.starts_with('^') || line.trim().is_empty() {
                continue;
            }
            if let Some((hex, name)) = line.split_once(' ') {
                refs.insert(name.trim().to_string(), ObjectId::from_hex(hex)?);
            }
        }
        Ok(refs)
    }

    fn loose_refs(
        &self,
        dir: &Path,
        prefix: &str,
        out: &mut BTreeMap<String, ObjectId>,
    ) -> Result<()> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == IoErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let full = format!("{prefix}/{name}");
            if entry.file_type()?.is_dir() {
                self.loose_refs(&entry.path(), &full, out)?;
            } else if !name.ends_with(".lock") {
                let text = fs::read_to_string(entry.path())?;
                match ObjectId::from_hex(text.trim()) {
                    Ok(id) => {
                        out.insert(full, id);
                    }
                    Err(e) => warn!(reference = %full, error = %e, "skipping unreadable ref"),
                }
            }
        }
        Ok(())
    }

    fn read_ref(&self, name: &str) -> Result<Option<ObjectId>> {
        match fs::read_to_string(self.root.join(name)) {
            Ok(text) => {
                let text = text.trim();
                match text.strip_prefix("ref: ") {
                    Some(target) if target != name => self.read_ref(target),
                    Some(_) => Ok(None),
                    None => Ok(Some(ObjectId::from_hex(text)?)),
                }
            }
            Err(e) if e.kind() == IoErrorKind::NotFound => {
                Ok(self.packed_refs()?.get(name).copied())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn list_refs(&self) -> Result<Vec<Ref>> {
        let mut refs = self.packed_refs()?;
        self.loose_refs(&self.root.join("refs"), "refs", &mut refs)?;

        let mut listed: Vec<Ref> = refs.into_iter().map(|(name, id)| Ref::new(name, id)).collect();
        if let Some(head) = self.read_ref("HEAD")? {
            listed.insert(0, Ref::new("HEAD", head));
        }
        Ok(listed)
    }

    /// Applies a push: stores the pack's objects, then each command.
    fn receive(
        &self,
        commands: &[Command],
        pack: &[u8],
        packs: &mut PackCache,
    ) -> Result<PushReport> {
        let mut staged = ObjectStore::new();
        let unpack = if pack.is_empty() {
            Ok(())
        } else {
            PackParser::new(pack).parse(&mut staged).map(|_| ())
        };
        if let Err(e) = &unpack {
            warn!(path = %self.root.display(), error = %e, "rejecting corrupt pack");
        }
        if unpack.is_ok() {
            for id in staged.list_objects() {
                self.write_loose(&staged.get(&id)?)?;
            }
        }

        let mut statuses = Vec::with_capacity(commands.len());
        for command in commands {
            let error = match &unpack {
                Err(_) => Some("unpacker error".to_string()),
                Ok(()) => self.update_ref(command, &staged, packs)?,
            };
            statuses.push(RefStatus {
                reference: command.ref_name.clone(),
                error,
            });
        }

        Ok(PushReport {
            unpack: match unpack {
                Ok(()) => "ok".to_string(),
                Err(e) => e.to_string(),
            },
            statuses,
        })
    }

    /// Applies one command; returns the rejection reason, if any.
    fn update_ref(
        &self,
        command: &Command,
        staged: &ObjectStore,
        packs: &mut PackCache,
    ) -> Result<Option<String>> {
        let name = &command.ref_name;
        if !name.starts_with("refs/") || name.split('/').any(|s| s.is_empty() || s == "..") {
            return Ok(Some("invalid ref name".to_string()));
        }
        if !command.is_delete()
            && !staged.contains(&command.new_id)
            && self.read_loose(&command.new_id)?.is_none()
            && !packs.get(self)?.contains(&command.new_id)
        {
            return Ok(Some("missing necessary objects".to_string()));
        }

        let path = self.root.join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let lock_path = path.with_file_name(format!(
            "{}.lock",
            path.file_name().and_then(|n| n.to_str()).unwrap_or("ref")
        ));
        let mut lock = match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&lock_path)
        {
            Ok(lock) => lock,
            Err(e) if e.kind() == IoErrorKind::AlreadyExists => {
                return Ok(Some("failed to lock".to_string()))
            }
            Err(e) => return Err(e.into()),
        };

        let outcome = (|| -> Result<Option<String>> {
            let actual = self.read_ref(name)?.unwrap_or(ObjectId::ZERO);
            if actual != command.old_id {
                return Ok(Some(
                    RefUpdateError::Stale {
                        expected: command.old_id,
                        actual,
                    }
                    .to_string(),
                ));
            }
            if command.is_delete() {
                match fs::remove_file(&path) {
                    Ok(()) => {}
                    Err(e) if e.kind() == IoErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
                self.remove_packed_ref(name)?;
                fs::remove_file(&lock_path)?;
            } else {
                lock.write_all(format!("{}\n", command.new_id).as_bytes())?;
                lock.sync_all()?;
                fs::rename(&lock_path, &path)?;
            }
            debug!(reference = %name, new = %command.new_id, "ref updated on disk");
            Ok(None)
        })();

        // Whatever happened, the lock must not outlive the update.
        if lock_path.exists() {
            let _ = fs::remove_file(&lock_path);
        }
        outcome
    }

    fn remove_packed_ref(&self, name: &str) -> Result<()> {
        let path = self.root.join("packed-refs");
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == IoErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let mut kept = String::new();
        let mut skipping_peel = false;
        for line in text.lines() {
            if line.starts_with('^') && skipping_peel {
                continue;
            }
            skipping_peel = line.split_once(' ').is_some_and(|(_, n)| n.trim() == name);
            if !skipping_peel {
                kept.push_str(line);
                kept.push('\n');
            }
        }
        if kept != text {
            fs::write(&path, kept)?;
        }
        Ok(())
    }
}

struct DiskObjects<'a> {
    dir: &'a GitDir,
    packed: Arc<ObjectStore>,
}

impl ObjectSource for DiskObjects<'_> {
    fn load(&self, id: &ObjectId) -> grove_git::Result<Option<GitObject>> {
        match self.dir.read_loose(id) {
            Ok(Some(object)) => Ok(Some(object)),
            Ok(None) => Ok(self.packed.get(id).ok()),
            Err(Error::Storage(e)) => Err(e.into()),
            Err(Error::Io(e)) => Err(e.into()),
            Err(other) => Err(GitError::Protocol(other.to_string())),
        }
    }
}
