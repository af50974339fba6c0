//! Byte stream plumbing for Gitway.
//!
//! A git request body and its response are two independently paced streams.
//! This crate holds the pieces that keep them in line:
//!
//! - [`BoundedReader`] puts a deadline on a request body.
//! - [`couple`] holds back response bytes until the request body is drained,
//!   spilling them to an anonymous temporary file in the meantime.
//! - [`CountingReader`] and [`CountingWriter`] feed per-request byte metrics.

mod bounded;
mod counter;
mod coupler;
mod error;
mod sink;

pub use bounded::{is_cancelled, is_deadline_exceeded, BoundedReader};
pub use counter::{ByteCounters, CountingReader, CountingWriter};
pub use coupler::{couple, GatedReader, GatedWriter};
pub use error::{Cancelled, DeadlineExceeded};
pub use sink::{DirectSink, ResponseSink};
