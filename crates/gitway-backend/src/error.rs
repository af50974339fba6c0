//! Backend error types.

use gitway_git::GitError;
use thiserror::Error;

/// Errors that can occur while talking to the backend or relaying its data.
#[derive(Debug, Error)]
pub enum BackendError {
    /// The backend answered with a non-OK status.
    #[error("backend call failed: {0}")]
    Rpc(#[from] tonic::Status),

    /// The channel could not be set up.
    #[error("backend transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    /// Unusable backend address.
    #[error("invalid backend address {address:?}: {reason}")]
    InvalidAddress { address: String, reason: String },

    /// Reading the request or writing the response failed.
    #[error("relay I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A git payload could not be framed.
    #[error(transparent)]
    Git(#[from] GitError),

    /// The call finished without the backend opening its side-channel.
    #[error("sidechannel was never connected")]
    SidechannelNotConnected,

    /// The backend connected for a call that is no longer waiting.
    #[error("sidechannel {0}: callback de-registered")]
    SidechannelDeregistered(u64),

    /// The backend connected with an id nobody registered.
    #[error("unknown sidechannel id {0}")]
    UnknownSidechannel(u64),

    /// Malformed side-channel handshake.
    #[error("sidechannel handshake failed: {0}")]
    Handshake(String),

    /// A relay task panicked or was cancelled.
    #[error("relay task aborted: {0}")]
    RelayAborted(String),
}

impl BackendError {
    /// True if the backend refused the call because of a limit.
    pub fn is_overloaded(&self) -> bool {
        crate::is_overloaded(self)
    }

    /// True if the backend could not be reached at all.
    pub fn is_unavailable(&self) -> bool {
        crate::is_unavailable(self)
    }

    /// True if the request body ran past its read deadline.
    pub fn is_deadline_exceeded(&self) -> bool {
        matches!(self, Self::Io(err) if gitway_io::is_deadline_exceeded(err))
    }
}
