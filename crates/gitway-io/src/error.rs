use std::io;
use thiserror::Error;

/// A bounded read ran past its deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("request body read deadline exceeded")]
pub struct DeadlineExceeded;

/// A bounded read was cancelled by its owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("request body read cancelled")]
pub struct Cancelled;

/// An I/O failure recorded once and replayed on every later call.
#[derive(Debug, Clone)]
pub(crate) struct StickyError {
    kind: io::ErrorKind,
    message: String,
    deadline: bool,
}

impl StickyError {
    pub(crate) fn capture(err: &io::Error) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
            deadline: crate::is_deadline_exceeded(err),
        }
    }

    pub(crate) fn to_io(&self) -> io::Error {
        if self.deadline {
            return io::Error::new(io::ErrorKind::TimedOut, DeadlineExceeded);
        }
        io::Error::new(self.kind, self.message.clone())
    }
}
