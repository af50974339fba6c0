//! Deadline-bounded reads.
//!
//! A client that trickles its request body can otherwise hold a backend call
//! open forever. [`BoundedReader`] checks its deadline before every read and
//! again when the read completes; a read that is still pending when the
//! deadline passes is abandoned and reported as timed out. Bytes produced by
//! a read that finished after the deadline are discarded.

use crate::error::{Cancelled, DeadlineExceeded};
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, ReadBuf};
use tokio::time::{Instant, Sleep};
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

/// Returns true if `err` came from an expired [`BoundedReader`].
pub fn is_deadline_exceeded(err: &io::Error) -> bool {
    err.get_ref()
        .is_some_and(|inner| inner.is::<DeadlineExceeded>())
}

/// Returns true if `err` came from a cancelled [`BoundedReader`].
pub fn is_cancelled(err: &io::Error) -> bool {
    err.get_ref().is_some_and(|inner| inner.is::<Cancelled>())
}

fn deadline_error() -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, DeadlineExceeded)
}

fn cancelled_error() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionAborted, Cancelled)
}

/// Reader that fails once its deadline has passed or its token is cancelled.
pub struct BoundedReader<R> {
    inner: R,
    deadline: Instant,
    timer: Pin<Box<Sleep>>,
    cancelled: Option<Pin<Box<WaitForCancellationFutureOwned>>>,
}

impl<R> BoundedReader<R> {
    /// Bounds `inner` to `timeout` from now.
    pub fn new(inner: R, timeout: Duration) -> Self {
        Self::with_deadline(inner, Instant::now() + timeout)
    }

    /// Bounds `inner` to an absolute deadline.
    pub fn with_deadline(inner: R, deadline: Instant) -> Self {
        Self {
            inner,
            deadline,
            timer: Box::pin(tokio::time::sleep_until(deadline)),
            cancelled: None,
        }
    }

    /// Also fails reads once `token` is cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancelled = Some(Box::pin(token.cancelled_owned()));
        self
    }

    fn check(&mut self, cx: &mut Context<'_>) -> io::Result<()> {
        if let Some(cancelled) = self.cancelled.as_mut() {
            if cancelled.as_mut().poll(cx).is_ready() {
                return Err(cancelled_error());
            }
        }
        if Instant::now() >= self.deadline {
            return Err(deadline_error());
        }
        Ok(())
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for BoundedReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if let Err(err) = this.check(cx) {
            return Poll::Ready(Err(err));
        }

        let before = buf.filled().len();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(result) => {
                if let Err(err) = this.check(cx) {
                    buf.set_filled(before);
                    return Poll::Ready(Err(err));
                }
                Poll::Ready(result)
            }
            Poll::Pending => {
                // Registers the wakeup; the deadline check on the next poll
                // turns it into an error.
                if this.timer.as_mut().poll(cx).is_ready() {
                    return Poll::Ready(Err(deadline_error()));
                }
                Poll::Pending
            }
        }
    }
}
