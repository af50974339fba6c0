//! Git smart protocol services and in-band error payloads.
//!
//! Once a git response has started, the HTTP status is committed and the only
//! way to tell the client something went wrong is in its own framing. Each
//! service has its own convention: upload-pack clients understand an `ERR`
//! packet, receive-pack clients expect a side-band `unpack` status followed by
//! a progress message.

use crate::{Band, GitError, PktLineWriter, Result};
use std::io::Write;

/// Message sent to clients when the backend refuses work due to load.
pub const BUSY_MESSAGE: &str = "GitLab is currently unable to handle this request due to load.";

const BUSY_UNPACK_REASON: &str = "server is busy";

/// Writes an operation-specific busy payload.
pub type BusyWriter = fn(&mut dyn Write) -> Result<()>;

/// Git smart protocol service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GitService {
    /// Fetch and clone.
    UploadPack,
    /// Push.
    ReceivePack,
}

impl GitService {
    /// Wire name, as used in `?service=` and URL paths.
    pub fn name(self) -> &'static str {
        match self {
            Self::UploadPack => "git-upload-pack",
            Self::ReceivePack => "git-receive-pack",
        }
    }

    /// Parses a wire name.
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "git-upload-pack" => Ok(Self::UploadPack),
            "git-receive-pack" => Ok(Self::ReceivePack),
            other => Err(GitError::UnknownService(other.to_string())),
        }
    }

    /// Content type of the ref advertisement response.
    pub fn advertisement_content_type(self) -> &'static str {
        match self {
            Self::UploadPack => "application/x-git-upload-pack-advertisement",
            Self::ReceivePack => "application/x-git-receive-pack-advertisement",
        }
    }

    /// Content type clients send with the pack request.
    pub fn request_content_type(self) -> &'static str {
        match self {
            Self::UploadPack => "application/x-git-upload-pack-request",
            Self::ReceivePack => "application/x-git-receive-pack-request",
        }
    }

    /// Content type of the pack response.
    pub fn result_content_type(self) -> &'static str {
        match self {
            Self::UploadPack => "application/x-git-upload-pack-result",
            Self::ReceivePack => "application/x-git-receive-pack-result",
        }
    }

    /// In-band busy payload for this service.
    pub fn busy_writer(self) -> BusyWriter {
        match self {
            Self::UploadPack => write_upload_pack_busy,
            Self::ReceivePack => write_receive_pack_busy,
        }
    }

    /// Writes `message` as an in-band error in this service's framing.
    pub fn write_error(self, w: &mut dyn Write, message: &str) -> Result<()> {
        match self {
            Self::UploadPack => write_upload_pack_error(w, message),
            Self::ReceivePack => write_receive_pack_error(w, "error", message),
        }
    }
}

impl std::fmt::Display for GitService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Writes a single `ERR <message>\n` packet.
pub fn write_upload_pack_error(w: &mut dyn Write, message: &str) -> Result<()> {
    let mut writer = PktLineWriter::new(w);
    writer.write_data(format!("ERR {}\n", message).as_bytes())?;
    writer.flush()
}

/// Writes a failed `unpack` status on band 1 and `message` on band 2.
pub fn write_receive_pack_error(w: &mut dyn Write, unpack_reason: &str, message: &str) -> Result<()> {
    let mut writer = PktLineWriter::new(w);
    writer.write_sideband(Band::Data, format!("unpack {}\n", unpack_reason).as_bytes())?;
    writer.flush_pkt()?;
    writer.write_sideband(Band::Progress, format!("{}\n", message).as_bytes())?;
    writer.flush_pkt()?;
    writer.flush()
}

/// Busy payload for upload-pack.
pub fn write_upload_pack_busy(w: &mut dyn Write) -> Result<()> {
    write_upload_pack_error(w, BUSY_MESSAGE)
}

/// Busy payload for receive-pack.
pub fn write_receive_pack_busy(w: &mut dyn Write) -> Result<()> {
    write_receive_pack_error(w, BUSY_UNPACK_REASON, BUSY_MESSAGE)
}
