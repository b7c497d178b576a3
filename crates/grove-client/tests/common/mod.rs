//! Shared fixtures for the client integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use grove_client::transport::{FetchResponse, MemoryTransport, Session, Transport};
use grove_client::{Client, ClientConfig, Error, Identity, ObjectId, Result};
use grove_git::{Advertisement, Command, FetchRequest, PushReport, Service};
use grove_storage::{EntryMode, GitObject, Repository, TreeEntry};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

pub const SIGNATURE: &str = "Seed <seed@example.com> 1700000000 +0000";

/// Ids of the objects in a seeded remote.
pub struct Seed {
    pub commit: ObjectId,
    pub tree: ObjectId,
    pub readme: ObjectId,
    pub lib: ObjectId,
}

/// A remote holding one commit on `main`:
/// `README.md`, `src/lib.rs` and a symlink `link`.
pub fn seeded_remote(name: &str) -> (Arc<Repository>, Seed) {
    let repo = Repository::new(name);
    let (commit, tree, readme, lib) = {
        let mut objects = repo.objects.write();
        let readme = objects.put(GitObject::blob(b"# Seed\n".to_vec()));
        let lib = objects.put(GitObject::blob(b"pub fn seed() {}\n".to_vec()));
        let target = objects.put(GitObject::blob(b"README.md".to_vec()));
        let src = objects.put(GitObject::tree(vec![TreeEntry::new(
            EntryMode::File,
            "lib.rs",
            lib,
        )]));
        let tree = objects.put(GitObject::tree(vec![
            TreeEntry::new(EntryMode::File, "README.md", readme),
            TreeEntry::new(EntryMode::Symlink, "link", target),
            TreeEntry::new(EntryMode::Directory, "src", src),
        ]));
        let commit = objects.put(GitObject::commit(&tree, &[], SIGNATURE, SIGNATURE, "seed\n"));
        (commit, tree, readme, lib)
    };
    repo.refs.set("refs/heads/main", commit);
    repo.refs.set("refs/tags/v1", commit);
    (
        Arc::new(repo),
        Seed {
            commit,
            tree,
            readme,
            lib,
        },
    )
}

pub fn identity() -> Identity {
    Identity::new("Grove Test", "test@example.com").expect("valid identity")
}

/// A client with an identity talking to `repo` in process.
pub fn client(repo: &Arc<Repository>) -> Client {
    client_with(repo, true)
}

pub fn client_with(repo: &Arc<Repository>, partial_fetch: bool) -> Client {
    let config = ClientConfig::new(format!("memory://{}", repo.name))
        .with_identity(identity())
        .with_partial_fetch(partial_fetch);
    Client::with_transport(config, Arc::new(MemoryTransport::new(Arc::clone(repo))))
        .expect("valid config")
}

/// Wraps a transport and injects failures into opens and fetches.
pub struct FlakyTransport {
    inner: MemoryTransport,
    /// Number of upcoming opens that fail.
    pub failing_opens: Arc<AtomicUsize>,
    /// Number of upcoming fetches that fail.
    pub failing_fetches: Arc<AtomicUsize>,
    /// Opens attempted so far.
    pub opens: Arc<AtomicUsize>,
}

impl FlakyTransport {
    pub fn new(repo: Arc<Repository>) -> Self {
        Self {
            inner: MemoryTransport::new(repo),
            failing_opens: Arc::new(AtomicUsize::new(0)),
            failing_fetches: Arc::new(AtomicUsize::new(0)),
            opens: Arc::new(AtomicUsize::new(0)),
        }
    }
}

/// Decrements `counter` if positive; returns true when a failure is due.
fn take_failure(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl Transport for FlakyTransport {
    async fn open(&self, service: Service) -> Result<Box<dyn Session>> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        if take_failure(&self.failing_opens) {
            return Err(Error::Transport("connection reset".to_string()));
        }
        Ok(Box::new(FlakySession {
            inner: self.inner.open(service).await?,
            failing_fetches: Arc::clone(&self.failing_fetches),
        }))
    }

    fn describe(&self) -> String {
        format!("flaky+{}", self.inner.describe())
    }
}

struct FlakySession {
    inner: Box<dyn Session>,
    failing_fetches: Arc<AtomicUsize>,
}

#[async_trait]
impl Session for FlakySession {
    fn advertisement(&self) -> &Advertisement {
        self.inner.advertisement()
    }

    async fn fetch(&mut self, request: &FetchRequest) -> Result<FetchResponse> {
        if take_failure(&self.failing_fetches) {
            return Err(Error::Transport("broken pipe".to_string()));
        }
        self.inner.fetch(request).await
    }

    async fn push(&mut self, commands: &[Command], pack: Vec<u8>) -> Result<PushReport> {
        self.inner.push(commands, pack).await
    }
}

/// A transport whose handshake never completes.
pub struct StalledTransport {
    pub opens: Arc<AtomicUsize>,
}

#[async_trait]
impl Transport for StalledTransport {
    async fn open(&self, _service: Service) -> Result<Box<dyn Session>> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        std::future::pending().await
    }

    fn describe(&self) -> String {
        "stalled".to_string()
    }
}
