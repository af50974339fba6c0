//! Recognising backend refusals.
//!
//! The backend rejects work it cannot take on with a gRPC status whose
//! `google.rpc.Status` details contain a `gitaly.LimitError`. The status may be
//! buried in any number of wrapping errors by the time it reaches a handler.

use crate::proto::{LimitError, RpcStatus};
use bytes::Bytes;
use prost::Message;
use std::error::Error;
use std::time::Duration;
use tonic::{Code, Status};

pub const LIMIT_ERROR_TYPE_URL: &str = "type.googleapis.com/gitaly.LimitError";

/// True if any error in the chain is a status carrying a limit error detail.
pub fn is_overloaded(err: &(dyn Error + 'static)) -> bool {
    find_status(err, has_limit_error)
}

/// True if any error in the chain is an `UNAVAILABLE` status.
pub fn is_unavailable(err: &(dyn Error + 'static)) -> bool {
    find_status(err, |status| status.code() == Code::Unavailable)
}

/// Builds the status a backend returns when a limit rejects a call.
pub fn limit_exceeded_status(message: &str, retry_after: Option<Duration>) -> Status {
    let detail = LimitError {
        error_message: message.to_string(),
        retry_after: retry_after.map(|d| prost_types::Duration {
            seconds: i64::try_from(d.as_secs()).unwrap_or(i64::MAX),
            nanos: d.subsec_nanos() as i32,
        }),
    };
    let status = RpcStatus {
        code: Code::ResourceExhausted as i32,
        message: message.to_string(),
        details: vec![prost_types::Any {
            type_url: LIMIT_ERROR_TYPE_URL.to_string(),
            value: detail.encode_to_vec(),
        }],
    };
    Status::with_details(
        Code::ResourceExhausted,
        message,
        Bytes::from(status.encode_to_vec()),
    )
}

fn has_limit_error(status: &Status) -> bool {
    if status.details().is_empty() {
        return false;
    }
    match RpcStatus::decode(status.details()) {
        Ok(rpc_status) => rpc_status
            .details
            .iter()
            .any(|any| any.type_url.ends_with("gitaly.LimitError")),
        Err(e) => {
            tracing::debug!(error = %e, "undecodable status details");
            false
        }
    }
}

/// Walks `err` and its sources, looking inside `io::Error` wrappers too.
fn find_status(err: &(dyn Error + 'static), matches: impl Fn(&Status) -> bool) -> bool {
    let mut current = Some(err);
    while let Some(err) = current {
        if let Some(status) = err.downcast_ref::<Status>() {
            if matches(status) {
                return true;
            }
        }
        // io::Error::source skips the wrapped error itself.
        current = match err.downcast_ref::<std::io::Error>() {
            Some(io) => io.get_ref().map(|inner| inner as &(dyn Error + 'static)),
            None => err.source(),
        };
    }
    false
}
