//! Git wire formats for Grove.
//!
//! This crate implements the pkt-line framing, the pack file format (including
//! delta resolution) and both halves of the v0 smart protocol: the client side
//! used by every transport, and the server side that backs in-process remotes.

mod error;
mod pack;
mod pktline;
mod protocol;

pub use error::GitError;
pub use pack::{apply_delta, PackBuilder, PackParser};
pub use pktline::{AsyncPktLineReader, PktLine, PktLineReader, PktLineWriter};
pub use protocol::{
    advertise_refs, collect_closure, decode_push_report, decode_upload_response,
    encode_push_request, encode_upload_request, receive_pack, upload_pack, Advertisement,
    Command, FetchRequest, Filter, ObjectSource, PushReport, RefStatus, Service, WantHave,
};

/// Result type for git protocol operations.
pub type Result<T> = std::result::Result<T, GitError>;
