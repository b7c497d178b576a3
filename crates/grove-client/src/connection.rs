//! Session caching, retry-once and cancellation.

use crate::transport::{Session, Transport};
use crate::{Error, Result};
use grove_git::{FetchRequest, Filter, PackParser, Service};
use grove_storage::{ObjectId, ObjectStore, ObjectType, Ref, TreeEntry};
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Runs `fut` unless `cancel` fires first.
pub(crate) async fn cancellable<T, F>(cancel: &CancellationToken, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::Cancelled),
        result = fut => result,
    }
}

/// Owns the transport of one client and its cached read session.
pub(crate) struct Connection {
    transport: Arc<dyn Transport>,
    session: Option<Box<dyn Session>>,
}

impl Connection {
    pub(crate) fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            session: None,
        }
    }

    pub(crate) fn describe(&self) -> String {
        self.transport.describe()
    }

    /// Returns the cached upload-pack session, opening one if needed.
    pub(crate) async fn session(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<&mut Box<dyn Session>> {
        let session = match self.session.take() {
            Some(session) => session,
            None => {
                let session =
                    cancellable(cancel, self.transport.open(Service::UploadPack)).await?;
                debug!(remote = %self.transport.describe(), "opened read session");
                session
            }
        };
        Ok(self.session.insert(session))
    }

    /// Closes and forgets the cached session. A no-op when none is cached.
    pub(crate) async fn invalidate(&mut self) {
        if let Some(mut session) = self.session.take() {
            if let Err(e) = session.close().await {
                debug!(error = %e, "closing session failed");
            }
        }
    }

    /// Lists the remote's refs, retrying once with a fresh session.
    pub(crate) async fn list_refs(&mut self, cancel: &CancellationToken) -> Result<Vec<Ref>> {
        match self.session(cancel).await {
            Ok(session) => Ok(session.list_refs()),
            Err(e) if e.is_retryable() => {
                warn!(error = %e, remote = %self.describe(), "listing refs failed, retrying with a new session");
                self.invalidate().await;
                Ok(self.session(cancel).await?.list_refs())
            }
            Err(e) => Err(e),
        }
    }

    /// Fetches `wants` and everything they reach into `store`, retrying once.
    ///
    /// Wants already held locally are skipped; nothing left to fetch is success.
    pub(crate) async fn fetch(
        &mut self,
        store: &mut ObjectStore,
        wants: &[ObjectId],
        filter: Option<Filter>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.fetch_with(store, wants, filter, true, cancel).await
    }

    /// Fetches single objects by id, unfiltered and without negotiation.
    pub(crate) async fn fetch_objects(
        &mut self,
        store: &mut ObjectStore,
        wants: &[ObjectId],
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.fetch_with(store, wants, None, false, cancel).await
    }

    async fn fetch_with(
        &mut self,
        store: &mut ObjectStore,
        wants: &[ObjectId],
        filter: Option<Filter>,
        negotiate: bool,
        cancel: &CancellationToken,
    ) -> Result<()> {
        match self.try_fetch(store, wants, filter, negotiate, cancel).await {
            Err(e) if e.is_retryable() => {
                warn!(error = %e, remote = %self.describe(), "fetch failed, retrying with a new session");
                self.invalidate().await;
                self.try_fetch(store, wants, filter, negotiate, cancel).await
            }
            result => result,
        }
    }

    async fn try_fetch(
        &mut self,
        store: &mut ObjectStore,
        wants: &[ObjectId],
        filter: Option<Filter>,
        negotiate: bool,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let wants: Vec<ObjectId> = wants
            .iter()
            .filter(|id| !store.contains(id))
            .copied()
            .collect();
        if wants.is_empty() {
            debug!("already up to date");
            return Ok(());
        }

        // Local commits may sit on promised blobs, so they say nothing about
        // which blobs are held here.
        let negotiate = negotiate && !wants.iter().any(|id| store.is_promised(id));
        let request = FetchRequest {
            haves: if negotiate {
                store.ids_of_type(ObjectType::Commit)
            } else {
                Vec::new()
            },
            wants,
            filter,
        };
        let result = match self.session(cancel).await {
            Ok(session) => cancellable(cancel, session.fetch(&request)).await,
            Err(e) => Err(e),
        };
        if matches!(result, Err(Error::Cancelled)) {
            // The exchange may have been cut mid-stream.
            self.session = None;
        }
        let response = result?;

        if response.pack.is_empty() {
            debug!(wants = request.wants.len(), "remote sent no pack");
            return Ok(());
        }

        let received = PackParser::new(&response.pack).parse(store)?;
        debug!(
            objects = received.len(),
            bytes = response.pack.len(),
            filtered = response.filtered,
            "fetched pack"
        );
        if response.filtered {
            promise_missing_blobs(store, &received)?;
        }
        Ok(())
    }

    /// Opens a dedicated receive-pack session. It is never cached.
    pub(crate) async fn open_push_session(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<Box<dyn Session>> {
        self.invalidate().await;
        let session = cancellable(cancel, self.transport.open(Service::ReceivePack)).await?;
        debug!(remote = %self.describe(), "opened push session");
        Ok(session)
    }
}

/// Marks file blobs referenced by the received trees that were not sent.
fn promise_missing_blobs(store: &mut ObjectStore, received: &[ObjectId]) -> Result<()> {
    let mut promised = Vec::new();
    for id in received {
        let object = store.get(id)?;
        if object.object_type != ObjectType::Tree {
            continue;
        }
        for entry in TreeEntry::decode(&object.data)? {
            if entry.mode.is_blob() && !store.contains(&entry.id) {
                promised.push(entry.id);
            }
        }
    }
    debug!(count = promised.len(), "blobs promised by remote");
    for id in promised {
        store.promise(id);
    }
    Ok(())
}
