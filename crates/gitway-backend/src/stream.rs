//! Byte relays over SmartHTTP calls.

use crate::proto::{
    InfoRefsRequest, PostReceivePackRequest, PostReceivePackResponse,
    PostUploadPackWithSidechannelRequest, SshUploadPackWithSidechannelRequest,
};
use crate::{
    BackendError, BoxPipe, CallMetadata, ResponseStream, Result, SidechannelRegistration,
    SidechannelRegistry, SmartHttp,
};
use flate2::write::GzEncoder;
use flate2::Compression;
use futures::StreamExt;
use gitway_git::{BusyWriter, GitService};
use gitway_io::ResponseSink;
use std::future::Future;
use std::io::Write;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tonic::Status;

/// Size of the data frames sent to the backend.
const CHUNK_SIZE: usize = 32 * 1024;

/// Outcome of a relay that consumed the response sink.
pub struct Relayed<S> {
    /// The sink, unless the task holding it died.
    pub sink: Option<S>,
    pub result: Result<()>,
    /// The backend was overloaded and the busy message was sent instead.
    pub busy: bool,
}

enum Finished<S> {
    Request(Result<()>),
    Response(S, Result<()>),
}

/// Runs git operations against one backend.
#[derive(Clone)]
pub struct StreamClient {
    smart_http: Arc<dyn SmartHttp>,
    sidechannels: Arc<SidechannelRegistry>,
}

impl StreamClient {
    pub fn new(smart_http: Arc<dyn SmartHttp>, sidechannels: Arc<SidechannelRegistry>) -> Self {
        Self {
            smart_http,
            sidechannels,
        }
    }

    /// Copies the ref advertisement for `service` into `sink`, gzip-encoded
    /// if `gzip` is set.
    pub async fn info_refs<S: ResponseSink + ?Sized>(
        &self,
        service: GitService,
        request: InfoRefsRequest,
        metadata: CallMetadata,
        sink: &mut S,
        gzip: bool,
    ) -> Result<()> {
        let mut responses = self
            .smart_http
            .info_refs(service, request, metadata)
            .await?;

        if gzip {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            while let Some(response) = responses.next().await {
                encoder.write_all(&response?.data)?;
                let compressed = encoder.get_mut();
                if !compressed.is_empty() {
                    sink.send(compressed).await?;
                    compressed.clear();
                }
            }
            let tail = encoder.finish()?;
            sink.send(&tail).await?;
        } else {
            while let Some(response) = responses.next().await {
                sink.send(&response?.data).await?;
            }
        }

        sink.finish().await?;
        Ok(())
    }

    /// Relays a push.
    ///
    /// `request` is the first frame and carries the repository and identity.
    /// One task feeds `source` to the backend in data frames and half-closes
    /// at end of input; another copies the backend's answer into `sink`. Both
    /// are joined before this returns, and the first error either reports
    /// wins.
    pub async fn receive_pack<R, S>(
        &self,
        request: PostReceivePackRequest,
        metadata: CallMetadata,
        source: R,
        sink: S,
        busy: BusyWriter,
    ) -> Relayed<S>
    where
        R: AsyncRead + Send + Unpin + 'static,
        S: ResponseSink + 'static,
    {
        let (frames, frames_rx) = mpsc::channel(16);
        if frames.send(request).await.is_err() {
            return Relayed {
                sink: Some(sink),
                result: Err(BackendError::RelayAborted("request queue closed".to_string())),
                busy: false,
            };
        }

        // The backend may not answer until it has the whole push, so input
        // must flow before the call is opened.
        let (done, done_rx) = mpsc::channel::<Finished<S>>(2);
        let request_done = done.clone();
        let request_task = tokio::spawn(async move {
            let result = send_frames(source, frames).await;
            let _ = request_done.send(Finished::Request(result)).await;
        });

        let requests = ReceiverStream::new(frames_rx).boxed();
        let mut responses = match self.smart_http.post_receive_pack(requests, metadata).await {
            Ok(responses) => responses,
            Err(status) => {
                request_task.abort();
                let _ = request_task.await;
                return settle(Some(sink), Err(status.into()), busy).await;
            }
        };

        tokio::spawn(async move {
            let mut sink = sink;
            let result = copy_responses(&mut responses, &mut sink).await;
            let _ = done.send(Finished::Response(sink, result)).await;
        });

        let (sink, result) = join_relays(done_rx).await;
        settle(sink, result, busy).await
    }

    /// Relays a stateless fetch over a side-channel.
    ///
    /// The side-channel callback copies `source` into the pipe, half-closes
    /// it, then copies everything the backend sends back into `sink`. The
    /// registration is released exactly once whatever happens, and the first
    /// error observed is reported.
    pub async fn upload_pack<R, S>(
        &self,
        request: PostUploadPackWithSidechannelRequest,
        metadata: CallMetadata,
        source: R,
        sink: S,
        busy: BusyWriter,
    ) -> Relayed<S>
    where
        R: AsyncRead + Send + Unpin + 'static,
        S: ResponseSink + 'static,
    {
        let (registration, pipe) = self.sidechannels.register();
        let metadata = metadata.with_sidechannel(registration.id(), self.sidechannels.address());

        let relay = tokio::spawn(async move {
            let mut sink = sink;
            let result = relay_sidechannel(pipe, source, &mut sink).await;
            (Some(sink), result)
        });

        let rpc = async {
            self.smart_http
                .post_upload_pack_with_sidechannel(request, metadata)
                .await
                .map(|_| ())
        };

        finish_sidechannel(registration, rpc, relay, busy).await
    }

    /// Relays an interactive fetch over a side-channel.
    ///
    /// The backend may speak first, so unlike [`upload_pack`](Self::upload_pack)
    /// both directions run at once: one task copies `source` into the pipe and
    /// half-closes it, the other copies backend output into `sink` as it
    /// arrives. Both are joined before the call is considered finished.
    pub async fn ssh_upload_pack<R, S>(
        &self,
        request: SshUploadPackWithSidechannelRequest,
        metadata: CallMetadata,
        source: R,
        sink: S,
        busy: BusyWriter,
    ) -> Relayed<S>
    where
        R: AsyncRead + Send + Unpin + 'static,
        S: ResponseSink + 'static,
    {
        let (registration, pipe) = self.sidechannels.register();
        let metadata = metadata.with_sidechannel(registration.id(), self.sidechannels.address());

        let relay = tokio::spawn(relay_full_duplex(pipe, source, sink));

        let rpc = async {
            self.smart_http
                .ssh_upload_pack_with_sidechannel(request, metadata)
                .await
                .map(|_| ())
        };

        finish_sidechannel(registration, rpc, relay, busy).await
    }
}

/// Waits for a side-channel call and its relay task, then releases the
/// registration. A refused call never connects the side-channel, so its error
/// takes precedence over the relay's.
async fn finish_sidechannel<S, F>(
    registration: SidechannelRegistration,
    rpc: F,
    mut relay: JoinHandle<(Option<S>, Result<()>)>,
    busy: BusyWriter,
) -> Relayed<S>
where
    S: ResponseSink,
    F: Future<Output = std::result::Result<(), Status>>,
{
    tokio::pin!(rpc);

    let (rpc_result, outcome, rpc_first) = tokio::select! {
        rpc_result = &mut rpc => {
            registration.close();
            (rpc_result, (&mut relay).await, true)
        }
        outcome = &mut relay => {
            let rpc_result = rpc.await;
            registration.close();
            (rpc_result, outcome, false)
        }
    };

    let (sink, relay_result) = match outcome {
        Ok(relayed) => relayed,
        Err(e) => (None, Err(BackendError::RelayAborted(e.to_string()))),
    };

    let rpc_error = rpc_result.err().map(BackendError::from);
    let result = match (rpc_error, relay_result.err()) {
        (None, None) => Ok(()),
        (Some(err), None) | (None, Some(err)) => Err(err),
        (Some(rpc_err), Some(relay_err)) => {
            tracing::debug!(error = %relay_err, "sidechannel relay failed");
            if rpc_first || rpc_err.is_overloaded() {
                Err(rpc_err)
            } else {
                Err(relay_err)
            }
        }
    };

    settle(sink, result, busy).await
}

/// Collects both directions of a relay. Returns only after each has
/// reported, with the first error either saw.
async fn join_relays<S>(mut done: mpsc::Receiver<Finished<S>>) -> (Option<S>, Result<()>) {
    let mut sink = None;
    let mut first_error = None;
    for _ in 0..2 {
        let result = match done.recv().await {
            Some(Finished::Request(result)) => result,
            Some(Finished::Response(returned, result)) => {
                sink = Some(returned);
                result
            }
            None => Err(BackendError::RelayAborted(
                "relay task ended without reporting".to_string(),
            )),
        };
        if let Err(err) = result {
            tracing::debug!(error = %err, "relay direction failed");
            first_error.get_or_insert(err);
        }
    }
    (sink, first_error.map_or(Ok(()), Err))
}

async fn send_frames<R>(mut source: R, frames: mpsc::Sender<PostReceivePackRequest>) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = source.read(&mut buf).await?;
        if n == 0 {
            // Dropping the sender half-closes the call.
            return Ok(());
        }
        let frame = PostReceivePackRequest {
            data: buf[..n].to_vec(),
            ..Default::default()
        };
        if frames.send(frame).await.is_err() {
            // The call is over; its own result says why.
            return Ok(());
        }
    }
}

async fn copy_responses<S: ResponseSink>(
    responses: &mut ResponseStream<PostReceivePackResponse>,
    sink: &mut S,
) -> Result<()> {
    while let Some(response) = responses.next().await {
        sink.send(&response?.data).await?;
    }
    sink.finish().await?;
    Ok(())
}

async fn relay_sidechannel<R, S>(
    pipe: oneshot::Receiver<BoxPipe>,
    source: R,
    sink: &mut S,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    S: ResponseSink,
{
    let mut pipe = pipe
        .await
        .map_err(|_| BackendError::SidechannelNotConnected)?;

    send_to_pipe(source, &mut pipe).await?;
    copy_from_pipe(&mut pipe, sink).await
}

async fn relay_full_duplex<R, S>(
    pipe: oneshot::Receiver<BoxPipe>,
    source: R,
    sink: S,
) -> (Option<S>, Result<()>)
where
    R: AsyncRead + Send + Unpin + 'static,
    S: ResponseSink + 'static,
{
    let pipe = match pipe.await {
        Ok(pipe) => pipe,
        Err(_) => return (Some(sink), Err(BackendError::SidechannelNotConnected)),
    };
    let (mut from_backend, to_backend) = tokio::io::split(pipe);

    let (done, done_rx) = mpsc::channel::<Finished<S>>(2);
    let request_done = done.clone();
    tokio::spawn(async move {
        let result = send_to_pipe(source, to_backend).await;
        let _ = request_done.send(Finished::Request(result)).await;
    });
    tokio::spawn(async move {
        let mut sink = sink;
        let result = copy_from_pipe(&mut from_backend, &mut sink).await;
        let _ = done.send(Finished::Response(sink, result)).await;
    });

    join_relays(done_rx).await
}

/// Copies `source` into the pipe and half-closes it, also when `source`
/// failed, so the backend always sees the end of input.
async fn send_to_pipe<R, W>(mut source: R, mut pipe: W) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let copied = tokio::io::copy(&mut source, &mut pipe).await;
    let closed = pipe.shutdown().await;
    let sent = copied?;
    closed?;
    tracing::trace!(bytes = sent, "sidechannel request sent");
    Ok(())
}

async fn copy_from_pipe<R, S>(pipe: &mut R, sink: &mut S) -> Result<()>
where
    R: AsyncRead + Unpin,
    S: ResponseSink,
{
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = pipe.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        sink.send(&buf[..n]).await?;
    }
    sink.finish().await?;
    Ok(())
}

/// Replaces an overload failure with the operation's busy message.
async fn settle<S: ResponseSink>(
    mut sink: Option<S>,
    result: Result<()>,
    busy: BusyWriter,
) -> Relayed<S> {
    match result {
        Err(err) if err.is_overloaded() => {
            tracing::warn!(error = %err, "backend overloaded, sending busy response");
            let result = match sink.as_mut() {
                Some(sink) => write_busy(sink, busy).await,
                None => Err(err),
            };
            Relayed {
                sink,
                result,
                busy: true,
            }
        }
        result => Relayed {
            sink,
            result,
            busy: false,
        },
    }
}

async fn write_busy<S: ResponseSink>(sink: &mut S, busy: BusyWriter) -> Result<()> {
    let mut message = Vec::new();
    busy(&mut message)?;
    sink.send(&message).await?;
    sink.finish().await?;
    Ok(())
}
