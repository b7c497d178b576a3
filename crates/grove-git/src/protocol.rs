//! Git smart protocol (v0) implementation.
//!
//! Both halves live here: the client side encodes fetch and push requests
//! and decodes what the remote sends back, the server side serves an
//! in-process [`Repository`].
//! See: https://git-scm.com/docs/pack-protocol and
//! https://git-scm.com/docs/http-protocol

use crate::pack::{PackBuilder, PackParser};
use crate::pktline::{AsyncPktLineReader, PktLine, PktLineReader, PktLineWriter};
use crate::{GitError, Result};
use grove_storage::{
    Commit, EntryMode, GitObject, ObjectId, ObjectStore, ObjectType, Ref, Repository,
    StorageError, TreeEntry,
};
use std::collections::HashSet;
use std::io::{Cursor, Read, Write};
use tokio::io::AsyncRead;
use tracing::{debug, warn};

/// Agent string advertised by the in-process server.
const SERVER_AGENT: &str = concat!("grove/", env!("CARGO_PKG_VERSION"));

/// Largest side-band payload: max packet minus length prefix and band byte.
const MAX_SIDEBAND_PAYLOAD: usize = 65515;

/// The two git services.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Service {
    /// Fetch side (`git-upload-pack`).
    UploadPack,
    /// Push side (`git-receive-pack`).
    ReceivePack,
}

impl Service {
    /// Returns the service name used on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UploadPack => "git-upload-pack",
            Self::ReceivePack => "git-receive-pack",
        }
    }

    fn capabilities(&self) -> String {
        match self {
            Self::UploadPack => format!("side-band-64k ofs-delta filter agent={SERVER_AGENT}"),
            Self::ReceivePack => {
                format!("report-status delete-refs ofs-delta agent={SERVER_AGENT}")
            }
        }
    }
}

impl std::fmt::Display for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Object filter for partial fetches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Filter {
    /// Omit every blob not explicitly wanted.
    BlobNone,
}

impl Filter {
    /// Returns the filter spec sent on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BlobNone => "blob:none",
        }
    }

    /// Parses a filter spec.
    pub fn parse(spec: &str) -> Option<Self> {
        match spec {
            "blob:none" => Some(Self::BlobNone),
            _ => None,
        }
    }
}

/// The ref advertisement a remote sends when a session starts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Advertisement {
    /// Advertised refs, peeled tag entries excluded.
    pub refs: Vec<Ref>,
    /// Capabilities from the first line.
    pub capabilities: Vec<String>,
}

impl Advertisement {
    /// Builds an advertisement from the packets before the terminating flush.
    ///
    /// A leading `# service=` line (smart HTTP) is ignored.
    pub fn from_packets(packets: &[PktLine]) -> Result<Self> {
        let mut advertisement = Self::default();
        let mut first = true;

        for pkt in packets {
            let Some(data) = pkt.data() else { continue };

            let (line, caps) = match data.iter().position(|&b| b == 0) {
                Some(nul) => (&data[..nul], Some(&data[nul + 1..])),
                None => (data, None),
            };
            let line = String::from_utf8_lossy(line);
            let line = line.trim_end_matches('\n');

            if let Some(message) = line.strip_prefix("ERR ") {
                return Err(GitError::from_remote_message(message));
            }
            if line.starts_with("# service=") || line == "version 1" {
                continue;
            }

            if first {
                if let Some(caps) = caps {
                    advertisement.capabilities = String::from_utf8_lossy(caps)
                        .split_whitespace()
                        .map(str::to_string)
                        .collect();
                }
                first = false;
            }

            let (hex, name) = line
                .split_once(' ')
                .ok_or_else(|| GitError::Protocol(format!("malformed ref line: {line:?}")))?;
            if name == "capabilities^{}" || name.ends_with("^{}") {
                continue;
            }
            let id = ObjectId::from_hex(hex)
                .map_err(|e| GitError::Protocol(format!("ref {name}: {e}")))?;
            advertisement.refs.push(Ref::new(name, id));
        }

        Ok(advertisement)
    }

    /// Reads an advertisement from a pkt-line stream.
    pub fn read<R: Read>(reader: &mut PktLineReader<R>) -> Result<Self> {
        let mut packets = Vec::new();
        while let Some(pkt) = reader.read()? {
            match pkt {
                PktLine::Flush if is_service_header(&packets) => packets.clear(),
                PktLine::Flush => break,
                other => packets.push(other),
            }
        }
        Self::from_packets(&packets)
    }

    /// Reads an advertisement from an async pkt-line stream.
    pub async fn read_async<R: AsyncRead + Unpin>(
        reader: &mut AsyncPktLineReader<R>,
    ) -> Result<Self> {
        let mut packets = Vec::new();
        while let Some(pkt) = reader.read().await? {
            match pkt {
                PktLine::Flush if is_service_header(&packets) => packets.clear(),
                PktLine::Flush => break,
                other => packets.push(other),
            }
        }
        Self::from_packets(&packets)
    }

    /// Returns true if the remote advertised `capability` (bare or `name=value`).
    pub fn supports(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|c| {
            c == capability
                || c.strip_prefix(capability)
                    .is_some_and(|rest| rest.starts_with('='))
        })
    }

    /// Looks up an advertised ref by exact name.
    pub fn find(&self, name: &str) -> Option<&Ref> {
        self.refs.iter().find(|r| r.name == name)
    }
}

fn is_service_header(packets: &[PktLine]) -> bool {
    matches!(packets, [only] if only.as_str().is_some_and(|s| s.starts_with("# service=")))
}

/// What a client asks upload-pack for.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchRequest {
    /// Objects to fetch, with everything they reach.
    pub wants: Vec<ObjectId>,
    /// Commits the client already has.
    pub haves: Vec<ObjectId>,
    /// Optional object filter.
    pub filter: Option<Filter>,
}

/// Encodes an upload-pack request.
///
/// Capabilities are requested only when advertised. The second value is true
/// when the filter was sent, i.e. requested and supported by the remote.
pub fn encode_upload_request(
    request: &FetchRequest,
    advertisement: &Advertisement,
    agent: &str,
) -> Result<(Vec<u8>, bool)> {
    let mut caps = Vec::new();
    for cap in ["side-band-64k", "ofs-delta"] {
        if advertisement.supports(cap) {
            caps.push(cap.to_string());
        }
    }
    if advertisement.supports("agent") {
        caps.push(format!("agent={agent}"));
    }
    let filter = request
        .filter
        .filter(|_| advertisement.supports("filter"));

    let mut buf = Vec::new();
    let mut writer = PktLineWriter::new(&mut buf);
    for (i, want) in request.wants.iter().enumerate() {
        if i == 0 && !caps.is_empty() {
            writer.write_line(&format!("want {} {}", want, caps.join(" ")))?;
        } else {
            writer.write_line(&format!("want {}", want))?;
        }
    }
    if let Some(filter) = filter {
        writer.write_line(&format!("filter {}", filter.as_str()))?;
    }
    writer.flush_pkt()?;
    for have in &request.haves {
        writer.write_line(&format!("have {}", have))?;
    }
    writer.write_line("done")?;

    Ok((buf, filter.is_some()))
}

/// Decodes an upload-pack response into raw pack bytes.
///
/// Returns an empty vector when the remote sent no pack.
pub fn decode_upload_response(data: &[u8], sideband: bool) -> Result<Vec<u8>> {
    let mut reader = PktLineReader::new(Cursor::new(data));

    loop {
        match reader.read()? {
            None => return Ok(Vec::new()),
            Some(PktLine::Data(line)) => {
                let text = String::from_utf8_lossy(&line);
                if let Some(message) = text.strip_prefix("ERR ") {
                    return Err(GitError::from_remote_message(message));
                }
                if text.starts_with("NAK") || text.starts_with("ACK ") {
                    break;
                }
                if text.starts_with("shallow ") || text.starts_with("unshallow ") {
                    continue;
                }
                return Err(GitError::Protocol(format!(
                    "unexpected negotiation line: {:?}",
                    text.trim_end()
                )));
            }
            Some(_) => continue,
        }
    }

    if !sideband {
        let pos = reader.into_inner().position() as usize;
        return Ok(data[pos..].to_vec());
    }

    let mut pack = Vec::new();
    loop {
        match reader.read()? {
            None | Some(PktLine::Flush) => break,
            Some(PktLine::Data(packet)) => match packet.split_first() {
                Some((1, payload)) => pack.extend_from_slice(payload),
                Some((2, payload)) => {
                    debug!(progress = %String::from_utf8_lossy(payload).trim_end(), "remote")
                }
                Some((3, payload)) => {
                    return Err(GitError::from_remote_message(&String::from_utf8_lossy(
                        payload,
                    )))
                }
                _ => {
                    return Err(GitError::Protocol(
                        "side-band packet with unknown channel".to_string(),
                    ))
                }
            },
            Some(_) => continue,
        }
    }
    Ok(pack)
}

/// A ref update command sent to receive-pack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    /// Old object ID (zeros for create).
    pub old_id: ObjectId,
    /// New object ID (zeros for delete).
    pub new_id: ObjectId,
    /// Reference name.
    pub ref_name: String,
}

impl Command {
    /// Creates a new update command.
    pub fn new(ref_name: impl Into<String>, old_id: ObjectId, new_id: ObjectId) -> Self {
        Self {
            old_id,
            new_id,
            ref_name: ref_name.into(),
        }
    }

    /// Checks if this is a create command.
    pub fn is_create(&self) -> bool {
        self.old_id.is_zero()
    }

    /// Checks if this is a delete command.
    pub fn is_delete(&self) -> bool {
        self.new_id.is_zero()
    }

    /// Parses `old new ref[\0caps]`, returning the command and any capabilities.
    fn parse(line: &[u8]) -> Result<(Self, Vec<String>)> {
        let (line, caps) = match line.iter().position(|&b| b == 0) {
            Some(nul) => (&line[..nul], String::from_utf8_lossy(&line[nul + 1..])),
            None => (line, Default::default()),
        };
        let line = String::from_utf8_lossy(line);
        let parts: Vec<&str> = line.trim_end().splitn(3, ' ').collect();
        let [old, new, name] = parts.as_slice() else {
            return Err(GitError::Protocol(format!("malformed command: {line:?}")));
        };
        let command = Self::new(*name, ObjectId::from_hex(old)?, ObjectId::from_hex(new)?);
        let caps = caps.split_whitespace().map(str::to_string).collect();
        Ok((command, caps))
    }
}

/// Encodes a receive-pack request: commands, flush, then the pack.
pub fn encode_push_request(
    commands: &[Command],
    advertisement: &Advertisement,
    pack: &[u8],
    agent: &str,
) -> Result<Vec<u8>> {
    let mut caps = Vec::new();
    if advertisement.supports("report-status") {
        caps.push("report-status".to_string());
    }
    if advertisement.supports("agent") {
        caps.push(format!("agent={agent}"));
    }

    let mut buf = Vec::new();
    let mut writer = PktLineWriter::new(&mut buf);
    for (i, command) in commands.iter().enumerate() {
        let mut line = format!("{} {} {}", command.old_id, command.new_id, command.ref_name);
        if i == 0 {
            line.push('\0');
            line.push_str(&caps.join(" "));
        }
        line.push('\n');
        writer.write_data(line.as_bytes())?;
    }
    writer.flush_pkt()?;
    buf.extend_from_slice(pack);
    Ok(buf)
}

/// Outcome of one ref update in a push report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefStatus {
    /// Reference name.
    pub reference: String,
    /// Rejection reason; `None` when the update was applied.
    pub error: Option<String>,
}

impl RefStatus {
    /// Returns true if the update was applied.
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// The `report-status` answer of receive-pack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushReport {
    /// `ok` or the unpack error message.
    pub unpack: String,
    /// Per-ref outcomes in command order.
    pub statuses: Vec<RefStatus>,
}

impl PushReport {
    /// Returns true if the remote unpacked the pack.
    pub fn unpack_ok(&self) -> bool {
        self.unpack == "ok"
    }

    /// Returns the status reported for `reference`.
    pub fn status(&self, reference: &str) -> Option<&RefStatus> {
        self.statuses.iter().find(|s| s.reference == reference)
    }
}

/// Decodes a receive-pack status report.
pub fn decode_push_report(data: &[u8]) -> Result<PushReport> {
    let mut reader = PktLineReader::new(Cursor::new(data));
    let mut unpack = None;
    let mut statuses = Vec::new();

    for pkt in reader.read_until_flush()? {
        let Some(line) = pkt.as_str() else { continue };
        if let Some(message) = line.strip_prefix("ERR ") {
            return Err(GitError::from_remote_message(message));
        } else if let Some(result) = line.strip_prefix("unpack ") {
            unpack = Some(result.to_string());
        } else if let Some(name) = line.strip_prefix("ok ") {
            statuses.push(RefStatus {
                reference: name.to_string(),
                error: None,
            });
        } else if let Some(rest) = line.strip_prefix("ng ") {
            let (name, reason) = rest.split_once(' ').unwrap_or((rest, "rejected"));
            statuses.push(RefStatus {
                reference: name.to_string(),
                error: Some(reason.to_string()),
            });
        }
    }

    let unpack =
        unpack.ok_or_else(|| GitError::Protocol("remote sent no push report".to_string()))?;
    Ok(PushReport { unpack, statuses })
}

/// Anything objects can be read from when building a closure.
pub trait ObjectSource {
    /// Loads an object, or `None` if it is not held.
    fn load(&self, id: &ObjectId) -> Result<Option<GitObject>>;
}

impl ObjectSource for ObjectStore {
    fn load(&self, id: &ObjectId) -> Result<Option<GitObject>> {
        Ok(self.get(id).ok())
    }
}

/// Collects every object reachable from `wants` that the other side lacks.
///
/// History is walked until a commit in `haves`; objects in the root trees of
/// those commits are assumed present, except for ids that are wanted
/// explicitly. Submodule entries are never followed.
/// With [`Filter::BlobNone`] blobs reached through trees are left out, while
/// explicitly wanted blobs are still returned.
pub fn collect_closure<S: ObjectSource + ?Sized>(
    source: &S,
    wants: &[ObjectId],
    haves: &[ObjectId],
    filter: Option<Filter>,
) -> Result<Vec<GitObject>> {
    let mut excluded = HashSet::new();
    for have in haves {
        excluded.insert(*have);
        if let Some(object) = source.load(have)? {
            if object.object_type == ObjectType::Commit {
                let commit = Commit::from_object(&object)?;
                mark_tree(source, commit.tree, &mut excluded)?;
            }
        }
    }

    let mut seen = HashSet::new();
    let mut objects = Vec::new();
    let mut stack: Vec<(ObjectId, bool)> = wants.iter().rev().map(|id| (*id, true)).collect();

    while let Some((id, wanted)) = stack.pop() {
        // Explicit wants are sent even when a have implies the other side holds them.
        if (!wanted && excluded.contains(&id)) || !seen.insert(id) {
            continue;
        }
        let object = match source.load(&id)? {
            Some(object) => object,
            None if wanted => return Err(GitError::NotOurRef(format!("not our ref {id}"))),
            None => return Err(StorageError::ObjectNotFound(id.to_hex()).into()),
        };

        match object.object_type {
            ObjectType::Commit => {
                let commit = Commit::from_object(&object)?;
                for parent in commit.parents.iter().rev() {
                    stack.push((*parent, false));
                }
                stack.push((commit.tree, false));
            }
            ObjectType::Tree => {
                for entry in TreeEntry::decode(&object.data)?.into_iter().rev() {
                    match entry.mode {
                        EntryMode::Submodule => {}
                        EntryMode::Directory => stack.push((entry.id, false)),
                        _ if filter == Some(Filter::BlobNone) => {}
                        _ => stack.push((entry.id, false)),
                    }
                }
            }
            ObjectType::Tag => {
                let target = std::str::from_utf8(&object.data)
                    .ok()
                    .and_then(|text| text.lines().next())
                    .and_then(|line| line.strip_prefix("object "))
                    .ok_or_else(|| GitError::Protocol(format!("tag {id} has no object line")))?;
                stack.push((ObjectId::from_hex(target)?, false));
            }
            ObjectType::Blob => {}
        }
        objects.push(object);
    }

    Ok(objects)
}

/// Adds a tree and everything below it to `marked`, ignoring absent objects.
fn mark_tree<S: ObjectSource + ?Sized>(
    source: &S,
    tree: ObjectId,
    marked: &mut HashSet<ObjectId>,
) -> Result<()> {
    let mut stack = vec![tree];
    while let Some(id) = stack.pop() {
        if !marked.insert(id) {
            continue;
        }
        let Some(object) = source.load(&id)? else {
            continue;
        };
        for entry in TreeEntry::decode(&object.data)? {
            match entry.mode {
                EntryMode::Directory => stack.push(entry.id),
                EntryMode::Submodule => {}
                _ => {
                    marked.insert(entry.id);
                }
            }
        }
    }
    Ok(())
}

/// Advertises references to a client, smart-HTTP style.
pub fn advertise_refs<W: Write>(writer: &mut W, repo: &Repository, service: Service) -> Result<()> {
    let mut pkt_writer = PktLineWriter::new(writer);
    let refs = repo.list_refs();
    let capabilities = service.capabilities();

    pkt_writer.write(&PktLine::from_string(&format!("# service={}\n", service)))?;
    pkt_writer.flush_pkt()?;

    // First line carries the capabilities
    match refs.split_first() {
        Some((first, rest)) => {
            pkt_writer.write(&PktLine::from_string(&format!(
                "{} {}\0{}\n",
                first.id, first.name, capabilities
            )))?;
            for r in rest {
                pkt_writer.write_line(&format!("{} {}", r.id, r.name))?;
            }
        }
        None => {
            pkt_writer.write(&PktLine::from_string(&format!(
                "{} capabilities^{{}}\0{}\n",
                ObjectId::ZERO,
                capabilities
            )))?;
        }
    }

    pkt_writer.flush_pkt()?;
    pkt_writer.flush()?;

    Ok(())
}

/// Want/Have negotiation for upload-pack.
#[derive(Debug, Clone, Default)]
pub struct WantHave {
    /// Object IDs the client wants.
    pub wants: Vec<ObjectId>,
    /// Object IDs the client has.
    pub haves: Vec<ObjectId>,
    /// Requested object filter.
    pub filter: Option<Filter>,
    /// Capabilities sent on the first want line.
    pub capabilities: Vec<String>,
}

impl WantHave {
    /// Parses want/have lines from the client, up to `done`.
    pub fn parse<R: Read>(reader: &mut R) -> Result<Self> {
        let mut pkt_reader = PktLineReader::new(reader);
        let mut request = Self::default();

        loop {
            match pkt_reader.read()? {
                Some(PktLine::Data(data)) => {
                    let line = String::from_utf8_lossy(&data);
                    let line = line.trim();

                    if let Some(rest) = line.strip_prefix("want ") {
                        let mut words = rest.split_whitespace();
                        let hex = words.next().unwrap_or_default();
                        request.wants.push(ObjectId::from_hex(hex)?);
                        if request.capabilities.is_empty() {
                            request.capabilities = words.map(str::to_string).collect();
                        }
                    } else if let Some(hex) = line.strip_prefix("have ") {
                        request.haves.push(ObjectId::from_hex(hex.trim())?);
                    } else if let Some(spec) = line.strip_prefix("filter ") {
                        request.filter = Some(Filter::parse(spec).ok_or_else(|| {
                            GitError::Protocol(format!("unsupported filter: {spec}"))
                        })?);
                    } else if line == "done" {
                        break;
                    }
                }
                Some(PktLine::Flush) => continue,
                _ => break,
            }
        }

        Ok(request)
    }

    /// Returns true if the client asked for `capability`.
    pub fn requested(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|c| c == capability)
    }
}

/// Handles git-upload-pack (fetch/clone).
pub fn upload_pack<R: Read, W: Write>(
    reader: &mut R,
    writer: &mut W,
    repo: &Repository,
) -> Result<()> {
    let want_have = WantHave::parse(reader)?;
    let mut pkt_writer = PktLineWriter::new(writer);

    if want_have.wants.is_empty() {
        pkt_writer.write_line("NAK")?;
        pkt_writer.flush()?;
        return Ok(());
    }

    let objects = {
        let store = repo.objects.read();
        collect_closure(
            &*store,
            &want_have.wants,
            &want_have.haves,
            want_have.filter,
        )
    };
    let objects = match objects {
        Ok(objects) => objects,
        Err(GitError::NotOurRef(message)) => {
            warn!(repo = %repo.name, reason = %message, "upload-pack refused");
            pkt_writer.write_line(&format!("ERR upload-pack: {message}"))?;
            pkt_writer.flush()?;
            return Ok(());
        }
        Err(e) => return Err(e),
    };

    let count = objects.len();
    let mut builder = PackBuilder::new();
    for object in objects {
        builder.add(object);
    }
    let pack = builder.build()?;
    debug!(repo = %repo.name, objects = count, bytes = pack.len(), "serving pack");

    // No common-ancestor negotiation: the haves only trim the pack.
    pkt_writer.write_line("NAK")?;

    if want_have.requested("side-band-64k") {
        let mut progress = vec![2u8];
        progress.extend_from_slice(format!("Total {count}\n").as_bytes());
        pkt_writer.write(&PktLine::Data(progress))?;

        for chunk in pack.chunks(MAX_SIDEBAND_PAYLOAD) {
            let mut data = vec![1u8];
            data.extend_from_slice(chunk);
            pkt_writer.write(&PktLine::Data(data))?;
        }
        pkt_writer.flush_pkt()?;
    } else {
        pkt_writer.inner_mut().write_all(&pack)?;
    }
    pkt_writer.flush()?;

    Ok(())
}

/// Handles git-receive-pack (push).
///
/// Each command is applied as an atomic compare-and-swap against the ref
/// store. Returns the commands together with their outcome.
pub fn receive_pack<R: Read, W: Write>(
    reader: &mut R,
    writer: &mut W,
    repo: &Repository,
) -> Result<Vec<(Command, RefStatus)>> {
    let mut pkt_reader = PktLineReader::new(reader);
    let mut commands = Vec::new();
    let mut capabilities = Vec::new();

    loop {
        match pkt_reader.read()? {
            Some(PktLine::Data(data)) => {
                let (command, caps) = Command::parse(&data)?;
                if commands.is_empty() {
                    capabilities = caps;
                }
                commands.push(command);
            }
            Some(PktLine::Flush) | None => break,
            _ => continue,
        }
    }

    let mut pack_data = Vec::new();
    pkt_reader.inner_mut().read_to_end(&mut pack_data)?;

    let unpack = if pack_data.is_empty() {
        Ok(())
    } else {
        let mut objects = repo.objects.write();
        PackParser::new(&pack_data).parse(&mut objects).map(|_| ())
    };

    let mut results = Vec::with_capacity(commands.len());
    for command in commands {
        let error = match &unpack {
            Err(_) => Some("unpacker error".to_string()),
            Ok(()) if !command.is_delete() && !repo.objects.read().contains(&command.new_id) => {
                Some("missing necessary objects".to_string())
            }
            Ok(()) => repo
                .refs
                .compare_and_swap(&command.ref_name, command.old_id, command.new_id)
                .err()
                .map(|e| e.to_string()),
        };
        match &error {
            None => debug!(repo = %repo.name, reference = %command.ref_name, new = %command.new_id, "ref updated"),
            Some(reason) => warn!(repo = %repo.name, reference = %command.ref_name, %reason, "ref update rejected"),
        }
        let status = RefStatus {
            reference: command.ref_name.clone(),
            error,
        };
        results.push((command, status));
    }

    if capabilities.iter().any(|c| c == "report-status") {
        let mut pkt_writer = PktLineWriter::new(writer);
        match &unpack {
            Ok(()) => pkt_writer.write_line("unpack ok")?,
            Err(e) => pkt_writer.write_line(&format!("unpack {e}"))?,
        }
        for (_, status) in &results {
            match &status.error {
                None => pkt_writer.write_line(&format!("ok {}", status.reference))?,
                Some(reason) => {
                    pkt_writer.write_line(&format!("ng {} {}", status.reference, reason))?
                }
            }
        }
        pkt_writer.flush_pkt()?;
        pkt_writer.flush()?;
    }

    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use grove_storage::Signature;

    const AGENT: &str = "grove-test/1";

    /// A repository holding one commit with `docs/readme.md` and `main.rs`.
    fn sample_repo() -> (Repository, ObjectId) {
        let repo = Repository::new("sample");
        let commit = {
            let mut store = repo.objects.write();
            let readme = store.put_blob(b"# readme\n".to_vec());
            let main = store.put_blob(b"fn main() {}\n".to_vec());
            let docs = store.put(GitObject::tree(vec![TreeEntry::new(
                EntryMode::File,
                "readme.md",
                readme,
            )]));
            let root = store.put(GitObject::tree(vec![
                TreeEntry::new(EntryMode::Directory, "docs", docs),
                TreeEntry::new(EntryMode::File, "main.rs", main),
            ]));
            let sig = Signature::parse("A <a@example.com> 1700000000 +0000").unwrap();
            store.put(
                Commit {
                    tree: root,
                    parents: Vec::new(),
                    author: sig.clone(),
                    committer: sig,
                    message: "init\n".into(),
                }
                .to_object(),
            )
        };
        repo.refs.set("refs/heads/main", commit);
        (repo, commit)
    }

    fn advertisement(repo: &Repository, service: Service) -> Advertisement {
        let mut output = Vec::new();
        advertise_refs(&mut output, repo, service).unwrap();
        Advertisement::read(&mut PktLineReader::new(Cursor::new(output))).unwrap()
    }

    #[test]
    fn test_ref_advertisement() {
        let (repo, commit) = sample_repo();
        let adv = advertisement(&repo, Service::UploadPack);

        assert_eq!(adv.refs.len(), 2);
        assert_eq!(adv.refs[0], Ref::new("HEAD", commit));
        assert_eq!(adv.find("refs/heads/main").map(|r| r.id), Some(commit));
        assert!(adv.supports("side-band-64k"));
        assert!(adv.supports("filter"));
        assert!(adv.supports("agent"));
        assert!(!adv.supports("report-status"));
    }

    #[test]
    fn test_empty_repo_advertisement() {
        let repo = Repository::new("empty");
        let adv = advertisement(&repo, Service::ReceivePack);
        assert!(adv.refs.is_empty());
        assert!(adv.supports("report-status"));
    }

    #[test]
    fn test_advertisement_skips_peeled_tags() {
        let tag = "1".repeat(40);
        let peeled = "2".repeat(40);
        let packets = vec![
            PktLine::from_string(&format!("{tag} refs/tags/v1\0ofs-delta\n")),
            PktLine::from_string(&format!("{peeled} refs/tags/v1^{{}}\n")),
        ];
        let adv = Advertisement::from_packets(&packets).unwrap();
        assert_eq!(adv.refs.len(), 1);
        assert_eq!(adv.refs[0].name, "refs/tags/v1");
        assert_eq!(adv.capabilities, vec!["ofs-delta"]);
    }

    #[test]
    fn test_advertisement_without_service_header() {
        let mut buf = Vec::new();
        {
            let mut writer = PktLineWriter::new(&mut buf);
            writer
                .write_data(format!("{} refs/heads/main\0agent=x\n", "a".repeat(40)).as_bytes())
                .unwrap();
            writer.flush_pkt().unwrap();
        }
        let adv = Advertisement::read(&mut PktLineReader::new(Cursor::new(buf))).unwrap();
        assert_eq!(adv.refs.len(), 1);
        assert!(adv.supports("agent"));
    }

    #[test]
    fn test_advertisement_err_line() {
        let packets = vec![PktLine::from_string("ERR access denied\n")];
        let err = Advertisement::from_packets(&packets).unwrap_err();
        assert!(matches!(err, GitError::Remote(ref m) if m == "access denied"));
    }

    #[test]
    fn test_advertisement_rejects_bad_hash() {
        let packets = vec![PktLine::from_string("nothex refs/heads/main\n")];
        assert!(Advertisement::from_packets(&packets).is_err());
    }

    #[test]
    fn test_upload_request_filter_only_when_advertised() {
        let request = FetchRequest {
            wants: vec![ObjectId::from_bytes([1; 20])],
            haves: vec![ObjectId::from_bytes([2; 20])],
            filter: Some(Filter::BlobNone),
        };

        let with_filter = Advertisement {
            refs: Vec::new(),
            capabilities: vec!["filter".into(), "side-band-64k".into()],
        };
        let (bytes, applied) = encode_upload_request(&request, &with_filter, AGENT).unwrap();
        let text = String::from_utf8_lossy(&bytes);
        assert!(applied);
        assert!(text.contains("filter blob:none"));
        assert!(text.contains("side-band-64k"));
        assert!(text.contains(&format!("have {}", "02".repeat(20))));
        assert!(text.ends_with("0009done\n"));

        let (bytes, applied) =
            encode_upload_request(&request, &Advertisement::default(), AGENT).unwrap();
        assert!(!applied);
        assert!(!String::from_utf8_lossy(&bytes).contains("filter"));
    }

    #[test]
    fn test_fetch_roundtrip_through_server() {
        let (repo, commit) = sample_repo();
        let adv = advertisement(&repo, Service::UploadPack);
        let request = FetchRequest {
            wants: vec![commit],
            ..Default::default()
        };
        let (body, _) = encode_upload_request(&request, &adv, AGENT).unwrap();

        let mut response = Vec::new();
        upload_pack(&mut Cursor::new(body), &mut response, &repo).unwrap();

        let pack = decode_upload_response(&response, adv.supports("side-band-64k")).unwrap();
        let mut store = ObjectStore::new();
        let ids = PackParser::new(&pack).parse(&mut store).unwrap();
        // commit, two trees, two blobs
        assert_eq!(ids.len(), 5);
        assert!(store.contains(&commit));
    }

    #[test]
    fn test_fetch_without_sideband_returns_raw_pack() {
        let (repo, commit) = sample_repo();
        let request = FetchRequest {
            wants: vec![commit],
            ..Default::default()
        };
        let (body, _) = encode_upload_request(&request, &Advertisement::default(), AGENT).unwrap();

        let mut response = Vec::new();
        upload_pack(&mut Cursor::new(body), &mut response, &repo).unwrap();
        assert!(response.starts_with(b"0008NAK\n"));

        let pack = decode_upload_response(&response, false).unwrap();
        assert_eq!(&pack[..4], b"PACK");
    }

    #[test]
    fn test_filtered_fetch_omits_blobs() {
        let (repo, commit) = sample_repo();
        let adv = advertisement(&repo, Service::UploadPack);
        let request = FetchRequest {
            wants: vec![commit],
            haves: Vec::new(),
            filter: Some(Filter::BlobNone),
        };
        let (body, applied) = encode_upload_request(&request, &adv, AGENT).unwrap();
        assert!(applied);

        let mut response = Vec::new();
        upload_pack(&mut Cursor::new(body), &mut response, &repo).unwrap();
        let pack = decode_upload_response(&response, true).unwrap();

        let mut store = ObjectStore::new();
        PackParser::new(&pack).parse(&mut store).unwrap();
        assert_eq!(store.len(), 3);
        assert!(store.ids_of_type(ObjectType::Blob).is_empty());
    }

    #[test]
    fn test_unknown_want_is_reported() {
        let (repo, _) = sample_repo();
        let adv = advertisement(&repo, Service::UploadPack);
        let request = FetchRequest {
            wants: vec![ObjectId::from_bytes([0xEE; 20])],
            ..Default::default()
        };
        let (body, _) = encode_upload_request(&request, &adv, AGENT).unwrap();

        let mut response = Vec::new();
        upload_pack(&mut Cursor::new(body), &mut response, &repo).unwrap();
        let err = decode_upload_response(&response, true).unwrap_err();
        assert!(matches!(err, GitError::NotOurRef(_)));
    }

    #[test]
    fn test_sideband_error_channel() {
        let mut buf = Vec::new();
        {
            let mut writer = PktLineWriter::new(&mut buf);
            writer.write_line("NAK").unwrap();
            writer.write_data(b"\x03disk full\n").unwrap();
        }
        let err = decode_upload_response(&buf, true).unwrap_err();
        assert!(matches!(err, GitError::Remote(ref m) if m == "disk full"));
    }

    #[test]
    fn test_empty_response_is_empty_pack() {
        assert!(decode_upload_response(b"", true).unwrap().is_empty());
        assert!(decode_upload_response(b"0008NAK\n", true).unwrap().is_empty());
    }

    #[test]
    fn test_collect_closure_respects_haves() {
        let (repo, first) = sample_repo();
        let store = repo.objects.read();
        let all = collect_closure(&*store, &[first], &[], None).unwrap();
        assert_eq!(all.len(), 5);

        // The have covers the tree and blobs; only the wanted commit is sent.
        let trimmed = collect_closure(&*store, &[first], &[first], None).unwrap();
        assert_eq!(trimmed.len(), 1);
        assert_eq!(trimmed[0].id, first);
    }

    #[test]
    fn test_collect_closure_wanted_blob_under_have() {
        let (repo, first) = sample_repo();
        let store = repo.objects.read();
        let blob = store.ids_of_type(ObjectType::Blob)[0];
        let objects = collect_closure(&*store, &[blob], &[first], None).unwrap();
        assert_eq!(objects.len(), 1);
        assert_eq!(objects[0].id, blob);
    }

    #[test]
    fn test_collect_closure_wanted_blob_survives_filter() {
        let (repo, _) = sample_repo();
        let store = repo.objects.read();
        let blob = store.ids_of_type(ObjectType::Blob)[0];
        let objects = collect_closure(&*store, &[blob], &[], Some(Filter::BlobNone)).unwrap();
        assert_eq!(objects.len(), 1);
        assert_eq!(objects[0].id, blob);
    }

    fn push(repo: &Repository, commands: &[Command], pack: &[u8]) -> PushReport {
        let adv = advertisement(repo, Service::ReceivePack);
        let body = encode_push_request(commands, &adv, pack, AGENT).unwrap();
        let mut response = Vec::new();
        receive_pack(&mut Cursor::new(body), &mut response, repo).unwrap();
        decode_push_report(&response).unwrap()
    }

    #[test]
    fn test_receive_pack_applies_cas() {
        let (source, commit) = sample_repo();
        let pack = {
            let store = source.objects.read();
            let mut builder = PackBuilder::new();
            for object in collect_closure(&*store, &[commit], &[], None).unwrap() {
                builder.add(object);
            }
            builder.build().unwrap()
        };

        let target = Repository::new("target");
        let create = Command::new("refs/heads/main", ObjectId::ZERO, commit);
        assert!(create.is_create());
        let report = push(&target, &[create.clone()], &pack);
        assert!(report.unpack_ok());
        assert!(report.status("refs/heads/main").unwrap().is_ok());
        assert_eq!(target.refs.resolve_head().unwrap(), commit);

        // Same command again: the ref already exists.
        let report = push(&target, &[create], &pack);
        let status = report.status("refs/heads/main").unwrap();
        assert_eq!(status.error.as_deref(), Some("already exists"));
    }

    #[test]
    fn test_receive_pack_rejects_missing_objects() {
        let target = Repository::new("target");
        let command = Command::new("refs/heads/main", ObjectId::ZERO, ObjectId::from_bytes([5; 20]));
        let report = push(&target, &[command], &[]);
        assert_eq!(
            report.statuses[0].error.as_deref(),
            Some("missing necessary objects")
        );
        assert!(target.refs.get("refs/heads/main").is_err());
    }

    #[test]
    fn test_receive_pack_reports_corrupt_pack() {
        let target = Repository::new("target");
        let command = Command::new("refs/heads/x", ObjectId::ZERO, ObjectId::from_bytes([5; 20]));
        let report = push(&target, &[command], b"PACK garbage that is long enough to parse");
        assert!(!report.unpack_ok());
        assert_eq!(report.statuses[0].error.as_deref(), Some("unpacker error"));
    }

    #[test]
    fn test_decode_push_report() {
        let mut buf = Vec::new();
        {
            let mut writer = PktLineWriter::new(&mut buf);
            writer.write_line("unpack ok").unwrap();
            writer.write_line("ok refs/heads/a").unwrap();
            writer.write_line("ng refs/heads/b fetch first").unwrap();
            writer.flush_pkt().unwrap();
        }
        let report = decode_push_report(&buf).unwrap();
        assert!(report.unpack_ok());
        assert!(report.status("refs/heads/a").unwrap().is_ok());
        assert_eq!(
            report.status("refs/heads/b").unwrap().error.as_deref(),
            Some("fetch first")
        );
        assert!(decode_push_report(b"0000").is_err());
    }

    #[test]
    fn test_command_parse() {
        let line = format!("{} {} refs/heads/main\0report-status agent=x\n", ObjectId::ZERO, "ab".repeat(20));
        let (command, caps) = Command::parse(line.as_bytes()).unwrap();
        assert!(command.is_create());
        assert!(!command.is_delete());
        assert_eq!(command.ref_name, "refs/heads/main");
        assert_eq!(caps, vec!["report-status", "agent=x"]);
        assert!(Command::parse(b"short").is_err());
    }

    #[test]
    fn test_want_have_parse_filter_and_caps() {
        let mut buf = Vec::new();
        {
            let mut writer = PktLineWriter::new(&mut buf);
            writer
                .write_line(&format!("want {} side-band-64k ofs-delta", "a".repeat(40)))
                .unwrap();
            writer.write_line(&format!("want {}", "b".repeat(40))).unwrap();
            writer.write_line("filter blob:none").unwrap();
            writer.flush_pkt().unwrap();
            writer.write_line(&format!("have {}", "c".repeat(40))).unwrap();
            writer.write_line("done").unwrap();
        }
        let request = WantHave::parse(&mut Cursor::new(buf)).unwrap();
        assert_eq!(request.wants.len(), 2);
        assert_eq!(request.haves.len(), 1);
        assert_eq!(request.filter, Some(Filter::BlobNone));
        assert!(request.requested("side-band-64k"));

        let mut buf = Vec::new();
        PktLineWriter::new(&mut buf)
            .write_line("filter tree:0")
            .unwrap();
        assert!(WantHave::parse(&mut Cursor::new(buf)).is_err());
    }

    #[tokio::test]
    async fn test_async_advertisement_read() {
        let (repo, commit) = sample_repo();
        let mut output = Vec::new();
        advertise_refs(&mut output, &repo, Service::UploadPack).unwrap();

        let mut reader = AsyncPktLineReader::new(&output[..]);
        let adv = Advertisement::read_async(&mut reader).await.unwrap();
        assert_eq!(adv.find("HEAD").map(|r| r.id), Some(commit));
    }
}
