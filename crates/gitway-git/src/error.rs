//! Git protocol error types.

use thiserror::Error;

/// Errors that can occur while framing or parsing git wire data.
#[derive(Debug, Error)]
pub enum GitError {
    /// Malformed pkt-line input, or a payload that cannot be framed.
    #[error("invalid pkt-line: {0}")]
    Framing(String),

    /// Unknown git service name.
    #[error("unknown git service: {0}")]
    UnknownService(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
