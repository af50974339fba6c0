//! Running git operations against the backend.
//!
//! Each operation runs in its own task that reads the request body, talks to
//! the backend and writes the response into an in-memory pipe. The handler
//! waits for the first response byte (or for the task to end) before it
//! commits to a status: failures that produce no output become HTTP errors,
//! and once a byte has been produced the response is a 200 whatever happens
//! next, so later failures can only be reported in the git framing itself.

use crate::api::{ApiError, AppState};
use crate::auth::RepoContext;
use crate::observability::METRICS;
use crate::operation::{Operation, Route};
use axum::body::Body;
use axum::extract::Request;
use axum::http::{header, HeaderMap, HeaderValue, StatusCode, Version};
use axum::response::Response;
use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt};
use gitway_backend::proto::{
    InfoRefsRequest, PostReceivePackRequest, PostUploadPackWithSidechannelRequest,
    SshUploadPackWithSidechannelRequest,
};
use gitway_backend::{BackendError, CallMetadata, Relayed, StreamClient};
use gitway_git::{scan_deepen, GitService};
use gitway_io::{
    couple, BoundedReader, ByteCounters, CountingReader, DirectSink, ResponseSink,
};
use std::io::{self, Cursor};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, DuplexStream};
use tokio::task::JoinHandle;
use tokio_util::io::{ReaderStream, StreamReader};
use tokio_util::sync::CancellationToken;

/// Buffer between the relay task and the response body.
const PIPE_CAPACITY: usize = 64 * 1024;

/// Bytes of an upload-pack request inspected before relaying.
const PEEK_LIMIT: u64 = 64 * 1024;

const FIRST_READ: usize = 32 * 1024;

/// Header carrying the client's protocol version request.
pub const GIT_PROTOCOL_HEADER: &str = "git-protocol";

/// Reported in-band when the client stops sending mid-request.
const DEADLINE_MESSAGE: &str = "request body timed out";

/// How a relay task ended.
struct Outcome {
    result: Result<(), BackendError>,
    busy: bool,
}

impl Outcome {
    fn failed(err: BackendError) -> Self {
        Self {
            result: Err(err),
            busy: false,
        }
    }
}

type BodyReader = StreamReader<BoxStream<'static, io::Result<Bytes>>, Bytes>;

/// Serves one git operation.
pub async fn serve(
    state: &AppState,
    route: Route,
    ctx: RepoContext,
    request: Request,
) -> Result<Response, ApiError> {
    let operation = route.operation;
    // Full duplex needs a protocol that can send while still receiving.
    if operation.is_full_duplex() && request.version() < Version::HTTP_11 {
        return Err(ApiError::Internal(format!(
            "{} requires HTTP/1.1 or newer, got {:?}",
            operation,
            request.version()
        )));
    }

    let smart_http = state.connections.get(&ctx.server).map_err(|e| {
        tracing::error!(error = %e, address = %ctx.server.address, "backend connection failed");
        ApiError::Internal(e.to_string())
    })?;
    METRICS
        .backend_connections
        .set(state.connections.len() as i64);

    let client = StreamClient::new(smart_http, state.sidechannels.clone());
    let metadata = CallMetadata::for_server(&ctx.server).with_identity(&ctx.identity);
    let git_protocol = header_str(request.headers(), GIT_PROTOCOL_HEADER).to_string();
    let gzip = accepts_gzip(request.headers());
    let body = request.into_body();

    let counters = ByteCounters::new();
    let (response, pipe) = tokio::io::duplex(PIPE_CAPACITY);
    let pipe = counters.writer(pipe);
    let cancel = state.shutdown.child_token();

    tracing::debug!(
        operation = %operation,
        repository = %ctx.repository.relative_path,
        git_protocol = %git_protocol,
        "relaying git operation"
    );

    let task: JoinHandle<Outcome> = match operation {
        Operation::InfoRefs(service) => {
            let request = InfoRefsRequest {
                repository: Some(ctx.repository.clone()),
                git_config_options: ctx.fetch_config_options(),
                git_protocol,
            };
            tokio::spawn(async move {
                let mut sink = DirectSink::new(pipe);
                let result = client
                    .info_refs(service, request, metadata, &mut sink, gzip)
                    .await;
                if let (Err(err), true) = (&result, counters.written() > 0) {
                    tracing::warn!(error = %err, "ref advertisement cut short");
                }
                let outcome = Outcome {
                    result,
                    busy: false,
                };
                record(operation, &counters, &outcome);
                outcome
            })
        }
        Operation::UploadPack => {
            let request = upload_pack_request(&ctx, git_protocol);
            let source = bounded_body(body, &counters, state.config.read_deadline(), cancel);
            let spill_dir = state.config.spill_dir.clone();
            tokio::spawn(async move {
                let outcome = match peek_deepen(source).await {
                    Ok(source) => {
                        let (source, sink) = couple(source, pipe);
                        let sink = match spill_dir {
                            Some(dir) => sink.spill_in(dir),
                            None => sink,
                        };
                        let relayed = client
                            .upload_pack(
                                request,
                                metadata,
                                source,
                                sink,
                                GitService::UploadPack.busy_writer(),
                            )
                            .await;
                        conclude(GitService::UploadPack, relayed, &counters).await
                    }
                    Err(e) => Outcome::failed(e.into()),
                };
                record(operation, &counters, &outcome);
                outcome
            })
        }
        Operation::SshUploadPack => {
            let request = SshUploadPackWithSidechannelRequest {
                repository: Some(ctx.repository.clone()),
                git_config_options: ctx.fetch_config_options(),
                git_protocol,
            };
            let source = bounded_body(body, &counters, state.config.read_deadline(), cancel);
            tokio::spawn(async move {
                let relayed = client
                    .ssh_upload_pack(
                        request,
                        metadata,
                        source,
                        DirectSink::new(pipe),
                        GitService::UploadPack.busy_writer(),
                    )
                    .await;
                let outcome = conclude(GitService::UploadPack, relayed, &counters).await;
                record(operation, &counters, &outcome);
                outcome
            })
        }
        Operation::ReceivePack => {
            let request = receive_pack_request(&ctx, git_protocol);
            let source = bounded_body(body, &counters, state.config.read_deadline(), cancel);
            let spill_dir = state.config.spill_dir.clone();
            tokio::spawn(async move {
                let (source, sink) = couple(source, pipe);
                let sink = match spill_dir {
                    Some(dir) => sink.spill_in(dir),
                    None => sink,
                };
                let relayed = client
                    .receive_pack(
                        request,
                        metadata,
                        source,
                        sink,
                        GitService::ReceivePack.busy_writer(),
                    )
                    .await;
                let outcome = conclude(GitService::ReceivePack, relayed, &counters).await;
                record(operation, &counters, &outcome);
                outcome
            })
        }
        Operation::SshReceivePack => {
            let request = receive_pack_request(&ctx, git_protocol);
            let source = bounded_body(body, &counters, state.config.read_deadline(), cancel);
            tokio::spawn(async move {
                let relayed = client
                    .receive_pack(
                        request,
                        metadata,
                        source,
                        DirectSink::new(pipe),
                        GitService::ReceivePack.busy_writer(),
                    )
                    .await;
                let outcome = conclude(GitService::ReceivePack, relayed, &counters).await;
                record(operation, &counters, &outcome);
                outcome
            })
        }
    };

    respond(operation, gzip, response, task).await
}

/// Waits for the first response bytes and builds the response around them.
async fn respond(
    operation: Operation,
    gzip: bool,
    mut response: DuplexStream,
    task: JoinHandle<Outcome>,
) -> Result<Response, ApiError> {
    let mut first = vec![0u8; FIRST_READ];
    let n = response.read(&mut first).await.map_err(|e| {
        tracing::error!(error = %e, "reading relay output failed");
        ApiError::Internal(e.to_string())
    })?;

    let body = if n == 0 {
        let outcome = task.await.map_err(|e| {
            tracing::error!(error = %e, operation = %operation, "relay task failed");
            ApiError::Internal(e.to_string())
        })?;
        if let Err(err) = outcome.result {
            return Err(backend_failure(operation, err));
        }
        Body::empty()
    } else {
        first.truncate(n);
        let head = futures::stream::once(async move { Ok::<_, io::Error>(Bytes::from(first)) });
        Body::from_stream(head.chain(ReaderStream::new(response)))
    };

    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, operation.content_type())
        .header(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    if gzip && matches!(operation, Operation::InfoRefs(_)) {
        builder = builder.header(header::CONTENT_ENCODING, "gzip");
    }
    builder
        .body(body)
        .map_err(|e| ApiError::Internal(e.to_string()))
}

/// Maps a failure that happened before any response byte to an HTTP error.
fn backend_failure(operation: Operation, err: BackendError) -> ApiError {
    if err.is_overloaded() {
        tracing::warn!(error = %err, operation = %operation, "backend overloaded");
        return ApiError::TooManyRequests;
    }
    if err.is_unavailable() {
        tracing::error!(error = %err, operation = %operation, "backend unavailable");
        return ApiError::Unavailable;
    }
    tracing::error!(error = %err, operation = %operation, "git operation failed");
    ApiError::Internal(err.to_string())
}

/// Finishes a relay: reports a timed-out request in-band if the client has
/// already seen part of the response, then drops the sink so the response
/// body ends.
async fn conclude<S: ResponseSink>(
    service: GitService,
    relayed: Relayed<S>,
    counters: &ByteCounters,
) -> Outcome {
    let Relayed { sink, result, busy } = relayed;

    let timed_out = match &result {
        Err(err) if counters.written() > 0 => {
            tracing::warn!(error = %err, service = %service, "git operation failed after response started");
            err.is_deadline_exceeded()
        }
        _ => false,
    };
    if let (true, Some(mut sink)) = (timed_out, sink) {
        if let Err(e) = write_in_band_error(service, &mut sink, DEADLINE_MESSAGE).await {
            tracing::debug!(error = %e, "could not report timeout to client");
        }
    }

    Outcome { result, busy }
}

async fn write_in_band_error<S: ResponseSink>(
    service: GitService,
    sink: &mut S,
    message: &str,
) -> Result<(), BackendError> {
    let mut payload = Vec::new();
    service.write_error(&mut payload, message)?;
    sink.send(&payload).await?;
    sink.finish().await?;
    Ok(())
}

fn upload_pack_request(ctx: &RepoContext, git_protocol: String) -> PostUploadPackWithSidechannelRequest {
    PostUploadPackWithSidechannelRequest {
        repository: Some(ctx.repository.clone()),
        git_config_options: ctx.fetch_config_options(),
        git_protocol,
    }
}

fn receive_pack_request(ctx: &RepoContext, git_protocol: String) -> PostReceivePackRequest {
    PostReceivePackRequest {
        repository: Some(ctx.repository.clone()),
        gl_id: ctx.identity.user_id.clone(),
        gl_repository: ctx.identity.gl_repository.clone(),
        gl_username: ctx.identity.username.clone(),
        git_protocol,
        git_config_options: ctx.git_config_options.clone(),
        ..Default::default()
    }
}

fn record(operation: Operation, counters: &ByteCounters, outcome: &Outcome) {
    METRICS.record_transfer(operation.name(), counters.read(), counters.written());
    if outcome.busy {
        METRICS.record_busy(operation.name());
    }
}

/// The request body as a counted reader that gives up at `deadline` or when
/// the server shuts down.
fn bounded_body(
    body: Body,
    counters: &ByteCounters,
    deadline: Duration,
    cancel: CancellationToken,
) -> BoundedReader<CountingReader<BodyReader>> {
    let stream = body
        .into_data_stream()
        .map(|chunk| chunk.map_err(io::Error::other))
        .boxed();
    BoundedReader::new(counters.reader(StreamReader::new(stream)), deadline).with_cancellation(cancel)
}

/// Reads the start of an upload-pack request to see whether the client asked
/// for a shallow fetch, then hands back a reader that replays it.
async fn peek_deepen<R>(mut source: R) -> io::Result<impl AsyncRead + Send + Unpin + 'static>
where
    R: AsyncRead + Send + Unpin + 'static,
{
    let mut head = Vec::new();
    AsyncReadExt::take(&mut source, PEEK_LIMIT)
        .read_to_end(&mut head)
        .await?;

    let shallow = scan_deepen(&head[..]);
    tracing::debug!(shallow, peeked = head.len(), "upload-pack request");
    METRICS.record_upload_pack(shallow);

    Ok(AsyncReadExt::chain(Cursor::new(head), source))
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> &'a str {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
}

/// True if the client accepts a gzip-encoded response.
fn accepts_gzip(headers: &HeaderMap) -> bool {
    headers
        .get_all(header::ACCEPT_ENCODING)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|coding| coding.split(';').next().map(str::trim) == Some("gzip"))
}
