//! In-process remote backed by a shared [`Repository`].

use super::{FetchResponse, Session, Transport};
use crate::Result;
use async_trait::async_trait;
use grove_git::{
    advertise_refs, decode_push_report, decode_upload_response, encode_push_request,
    encode_upload_request, receive_pack, upload_pack, Advertisement, Command, FetchRequest,
    PktLineReader, PushReport, Service,
};
use grove_storage::Repository;
use std::io::Cursor;
use std::sync::Arc;
use tracing::debug;

/// Serves a [`Repository`] living in this process.
///
/// Requests still go through the wire encoders, so this exercises the same
/// code paths as a network remote. Ref updates are atomic compare-and-swaps.
#[derive(Debug, Clone)]
pub struct MemoryTransport {
    repo: Arc<Repository>,
    agent: String,
}

impl MemoryTransport {
    /// Creates a transport serving `repo`.
    pub fn new(repo: Arc<Repository>) -> Self {
        Self {
            repo,
            agent: concat!("grove/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }

    /// The served repository.
    pub fn repository(&self) -> &Arc<Repository> {
        &self.repo
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn open(&self, service: Service) -> Result<Box<dyn Session>> {
        let mut wire = Vec::new();
        advertise_refs(&mut wire, &self.repo, service)?;
        let advertisement = Advertisement::read(&mut PktLineReader::new(Cursor::new(wire)))?;
        debug!(repo = %self.repo.name, %service, refs = advertisement.refs.len(), "memory session opened");

        Ok(Box::new(MemorySession {
            repo: Arc::clone(&self.repo),
            agent: self.agent.clone(),
            advertisement,
        }))
    }

    fn describe(&self) -> String {
        format!("memory://{}", self.repo.name)
    }
}

struct MemorySession {
    repo: Arc<Repository>,
    agent: String,
    advertisement: Advertisement,
}

#[async_trait]
impl Session for MemorySession {
    fn advertisement(&self) -> &Advertisement {
        &self.advertisement
    }

    async fn fetch(&mut self, request: &FetchRequest) -> Result<FetchResponse> {
        let (body, filtered) = encode_upload_request(request, &self.advertisement, &self.agent)?;
        let mut response = Vec::new();
        upload_pack(&mut Cursor::new(body), &mut response, &self.repo)?;
        let pack = decode_upload_response(
            &response,
            self.advertisement.supports("side-band-64k"),
        )?;
        Ok(FetchResponse { pack, filtered })
    }

    async fn push(&mut self, commands: &[Command], pack: Vec<u8>) -> Result<PushReport> {
        let body = encode_push_request(commands, &self.advertisement, &pack, &self.agent)?;
        let mut response = Vec::new();
        receive_pack(&mut Cursor::new(body), &mut response, &self.repo)?;
        Ok(decode_push_report(&response)?)
    }
}
