//! The client facade.

use crate::builder::Changes;
use crate::config::ClientConfig;
use crate::connection::Connection;
use crate::publisher::Publisher;
use crate::transport::{transport_for, Transport};
use crate::tree::{self, TreeNode};
use crate::{Error, Result};
use bytes::Bytes;
use grove_git::Filter;
use grove_storage::{ObjectId, ObjectStore, Ref};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// A client bound to one remote repository.
///
/// A client caches one read session and owns its object store; it is not
/// meant to be shared. Use one client per concurrent task.
pub struct Client {
    config: ClientConfig,
    connection: Connection,
    store: ObjectStore,
}

fn check(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        Err(Error::Cancelled)
    } else {
        Ok(())
    }
}

impl Client {
    /// Creates a client, picking the transport from the endpoint.
    pub fn new(config: ClientConfig) -> Result<Self> {
        config.validate()?;
        let transport = transport_for(&config.endpoint, &config.user_agent)?;
        Self::with_transport(config, transport)
    }

    /// Creates a client over an explicit transport.
    pub fn with_transport(config: ClientConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            connection: Connection::new(transport),
            store: ObjectStore::new(),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// The local object store.
    pub fn store(&self) -> &ObjectStore {
        &self.store
    }

    /// Filter used for tree and commit reads.
    fn read_filter(&self) -> Option<Filter> {
        self.config.partial_fetch.then_some(Filter::BlobNone)
    }

    /// Lists every ref of the remote, HEAD first.
    pub async fn list_refs(&mut self, cancel: &CancellationToken) -> Result<Vec<Ref>> {
        check(cancel)?;
        self.connection.list_refs(cancel).await
    }

    /// Lists the remote's branches (`refs/heads/`).
    pub async fn list_branches(&mut self, cancel: &CancellationToken) -> Result<Vec<Ref>> {
        self.list_prefixed("refs/heads/", cancel).await
    }

    /// Lists the remote's tags (`refs/tags/`).
    pub async fn list_tags(&mut self, cancel: &CancellationToken) -> Result<Vec<Ref>> {
        self.list_prefixed("refs/tags/", cancel).await
    }

    async fn list_prefixed(&mut self, prefix: &str, cancel: &CancellationToken) -> Result<Vec<Ref>> {
        let mut refs = self.list_refs(cancel).await?;
        refs.retain(|r| r.name.starts_with(prefix));
        Ok(refs)
    }

    /// Materializes the tree of a commit.
    pub async fn get_tree(&mut self, commit: &str, cancel: &CancellationToken) -> Result<TreeNode> {
        check(cancel)?;
        let filter = self.read_filter();
        tree::get_tree(&mut self.connection, &mut self.store, commit, filter, cancel).await
    }

    /// Reads the raw content of any object, usually a file blob.
    pub async fn get_object(&mut self, hash: &str, cancel: &CancellationToken) -> Result<Bytes> {
        check(cancel)?;
        tree::get_object(&mut self.connection, &mut self.store, hash, cancel).await
    }

    /// Reads a commit's message.
    pub async fn get_commit_message(
        &mut self,
        commit: &str,
        cancel: &CancellationToken,
    ) -> Result<String> {
        check(cancel)?;
        let filter = self.read_filter();
        tree::get_commit_message(&mut self.connection, &mut self.store, commit, filter, cancel)
            .await
    }

    /// Commits `changes` on top of `reference` and pushes it.
    ///
    /// Bare names are branches. The ref is created when it does not exist.
    /// An empty change set still produces a commit.
    pub async fn push(
        &mut self,
        reference: &str,
        changes: &Changes,
        message: &str,
        cancel: &CancellationToken,
    ) -> Result<ObjectId> {
        check(cancel)?;
        self.publisher()
            .push(reference, changes, message, cancel)
            .await
    }

    /// Creates branch `name` pointing at `source`.
    ///
    /// `source` may be a commit hash, a ref name or a branch name. When it is
    /// empty an orphan commit with an empty tree and `message` is created.
    pub async fn create_branch(
        &mut self,
        name: &str,
        source: &str,
        message: &str,
        cancel: &CancellationToken,
    ) -> Result<ObjectId> {
        check(cancel)?;
        self.publisher()
            .create_branch(name, source, message, cancel)
            .await
    }

    /// Drops the cached session; the next call opens a fresh one.
    pub async fn invalidate_connection(&mut self) {
        self.connection.invalidate().await;
    }

    fn publisher(&mut self) -> Publisher<'_> {
        Publisher {
            filter: self.read_filter(),
            conn: &mut self.connection,
            store: &mut self.store,
            identity: self.config.identity.as_ref(),
        }
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("endpoint", &self.config.endpoint)
            .field("objects", &self.store.len())
            .finish()
    }
}
