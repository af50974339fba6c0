//! Git wire protocol pieces for Gitway.
//!
//! This crate knows how git frames bytes on the wire. The proxy never parses
//! pack data; it only needs to recognise a handful of lines (a `deepen`
//! request, a side-channel handshake) and to craft wire-legal error payloads
//! that a git client will print instead of choking on.

mod error;
mod pktline;
mod protocol;

pub use error::GitError;
pub use pktline::{
    scan_deepen, scan_for_prefix, AsyncPktLineReader, Band, PktLine, PktLineReader,
    PktLineWriter, MAX_PKT_LEN,
};
pub use protocol::{
    write_receive_pack_busy, write_receive_pack_error, write_upload_pack_busy,
    write_upload_pack_error, BusyWriter, GitService, BUSY_MESSAGE,
};

/// Result type for git protocol operations.
pub type Result<T> = std::result::Result<T, GitError>;
