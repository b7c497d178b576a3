//! Transports: how sessions with a remote are opened.
//!
//! Every transport speaks the git v0 smart protocol through `grove-git`;
//! they differ only in how bytes reach the other side.

mod file;
mod http;
mod memory;
mod stream;

pub use file::FileTransport;
pub use http::HttpTransport;
pub use memory::MemoryTransport;
pub use stream::StreamTransport;

use crate::endpoint::Endpoint;
use crate::{Error, Result};
use async_trait::async_trait;
use grove_git::{Advertisement, Command, FetchRequest, PushReport, Service};
use grove_storage::Ref;
use std::sync::Arc;

/// Raw result of a fetch.
#[derive(Debug, Clone, Default)]
pub struct FetchResponse {
    /// Pack bytes; empty when the remote had nothing to send.
    pub pack: Vec<u8>,
    /// True when the remote applied the requested object filter.
    pub filtered: bool,
}

/// Opens sessions with one remote.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Opens a session for `service`, performing the handshake.
    async fn open(&self, service: Service) -> Result<Box<dyn Session>>;

    /// Human-readable remote location, for logs.
    fn describe(&self) -> String;
}

/// A stateful handle to one remote service.
#[async_trait]
pub trait Session: Send {
    /// The ref advertisement received by the handshake.
    fn advertisement(&self) -> &Advertisement;

    /// Refs as advertised when the session was opened.
    fn list_refs(&self) -> Vec<Ref> {
        self.advertisement().refs.clone()
    }

    /// Requests a pack for `request`.
    async fn fetch(&mut self, request: &FetchRequest) -> Result<FetchResponse>;

    /// Sends ref update commands and the pack they need.
    async fn push(&mut self, commands: &[Command], pack: Vec<u8>) -> Result<PushReport>;

    /// Releases the session.
    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Picks the transport for an endpoint string.
///
/// `memory://` endpoints have no registry to resolve against; inject a
/// [`MemoryTransport`] through [`Client::with_transport`](crate::Client::with_transport).
pub fn transport_for(endpoint: &str, user_agent: &str) -> Result<Arc<dyn Transport>> {
    let transport: Arc<dyn Transport> = match Endpoint::parse(endpoint)? {
        Endpoint::Memory { name } => {
            return Err(Error::UnsupportedEndpoint(format!(
                "memory://{name} must be injected with Client::with_transport"
            )))
        }
        Endpoint::File { path } => Arc::new(FileTransport::new(path)),
        Endpoint::Http { url } => Arc::new(HttpTransport::new(url, user_agent)?),
        endpoint @ (Endpoint::Git { .. } | Endpoint::Ssh { .. }) => {
            Arc::new(StreamTransport::new(endpoint, user_agent))
        }
    };
    Ok(transport)
}
