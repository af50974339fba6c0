//! Side-channels for upload-pack.
//!
//! Pack data for upload-pack does not travel inside gRPC messages. Before the
//! call the proxy registers a waiter and passes its id in the call metadata;
//! the backend then dials the proxy's side-channel listener, identifies itself
//! with a `sidechannel <id>\n` pkt-line, and both ends exchange raw bytes over
//! that socket.

use crate::{BackendError, Result};
use gitway_git::{AsyncPktLineReader, PktLine};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// Time the backend gets to send its handshake after connecting.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

const HANDSHAKE_PREFIX: &str = "sidechannel ";

/// A full-duplex byte pipe.
pub trait DuplexPipe: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> DuplexPipe for T {}

pub type BoxPipe = Box<dyn DuplexPipe>;

/// Identifies one registered side-channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SidechannelId(u64);

impl SidechannelId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SidechannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SidechannelId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        s.parse().map(Self)
    }
}

/// Waiters for backend side-channel connections.
pub struct SidechannelRegistry {
    next_id: AtomicU64,
    waiters: Mutex<HashMap<u64, oneshot::Sender<BoxPipe>>>,
    address: Option<String>,
}

impl SidechannelRegistry {
    /// `address` is what the backend is told to dial.
    pub fn new(address: Option<String>) -> Self {
        Self {
            next_id: AtomicU64::new(1),
            waiters: Mutex::new(HashMap::new()),
            address,
        }
    }

    pub fn address(&self) -> Option<&str> {
        self.address.as_deref()
    }

    /// Number of registrations still waiting for a connection.
    pub fn pending(&self) -> usize {
        self.waiters.lock().len()
    }

    /// Registers a waiter. The receiver resolves when the backend connects,
    /// or fails once the registration is closed.
    pub fn register(self: &Arc<Self>) -> (SidechannelRegistration, oneshot::Receiver<BoxPipe>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().insert(id, tx);
        tracing::trace!(sidechannel_id = id, "registered sidechannel");

        let registration = SidechannelRegistration {
            id: SidechannelId(id),
            registry: Arc::clone(self),
            closed: false,
        };
        (registration, rx)
    }

    /// Hands a connected pipe to the waiter registered under `id`.
    pub fn accept(&self, id: SidechannelId, pipe: BoxPipe) -> Result<()> {
        let waiter = self
            .waiters
            .lock()
            .remove(&id.0)
            .ok_or(BackendError::UnknownSidechannel(id.0))?;
        waiter
            .send(pipe)
            .map_err(|_| BackendError::SidechannelDeregistered(id.0))
    }

    fn remove(&self, id: SidechannelId) {
        self.waiters.lock().remove(&id.0);
    }
}

/// Owned by the request that registered a side-channel.
///
/// Closing (or dropping) it removes the waiter exactly once.
pub struct SidechannelRegistration {
    id: SidechannelId,
    registry: Arc<SidechannelRegistry>,
    closed: bool,
}

impl SidechannelRegistration {
    pub fn id(&self) -> SidechannelId {
        self.id
    }

    pub fn close(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if !self.closed {
            self.closed = true;
            self.registry.remove(self.id);
        }
    }
}

impl Drop for SidechannelRegistration {
    fn drop(&mut self) {
        self.release();
    }
}

/// Accepts backend side-channel connections until `shutdown` is cancelled.
pub async fn serve_sidechannels(
    listener: TcpListener,
    registry: Arc<SidechannelRegistry>,
    shutdown: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer)) => {
                let registry = registry.clone();
                tokio::spawn(async move {
                    if let Err(e) = handshake(stream, &registry).await {
                        tracing::warn!(%peer, error = %e, "rejected sidechannel connection");
                    }
                });
            }
            Err(e) => {
                tracing::error!(error = %e, "sidechannel accept failed");
            }
        }
    }
}

async fn handshake(stream: TcpStream, registry: &SidechannelRegistry) -> Result<()> {
    let _ = stream.set_nodelay(true);
    let mut reader = AsyncPktLineReader::new(stream);
    let pkt = tokio::time::timeout(HANDSHAKE_TIMEOUT, reader.read())
        .await
        .map_err(|_| BackendError::Handshake("timed out".to_string()))??;

    let id = pkt
        .as_ref()
        .and_then(PktLine::as_str)
        .and_then(|line| line.strip_prefix(HANDSHAKE_PREFIX))
        .and_then(|id| id.parse::<SidechannelId>().ok())
        .ok_or_else(|| BackendError::Handshake(format!("unexpected packet {:?}", pkt)))?;

    registry.accept(id, Box::new(reader.into_inner()))
}

/// Connects to a side-channel listener and identifies as `id`.
///
/// This is the backend's half of the handshake.
pub async fn dial_sidechannel(address: &str, id: SidechannelId) -> std::io::Result<TcpStream> {
    let mut stream = TcpStream::connect(address).await?;
    let hello = PktLine::from_string(&format!("{}{}\n", HANDSHAKE_PREFIX, id));
    stream.write_all(&hello.encode()).await?;
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_register_accept() {
        let registry = Arc::new(SidechannelRegistry::new(None));
        let (registration, rx) = registry.register();
        assert_eq!(registry.pending(), 1);

        let (ours, mut theirs) = tokio::io::duplex(64);
        registry.accept(registration.id(), Box::new(ours)).unwrap();
        assert_eq!(registry.pending(), 0);

        let mut pipe = rx.await.unwrap();
        pipe.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        theirs.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        registration.close();
    }

    #[tokio::test]
    async fn test_close_releases_waiter() {
        let registry = Arc::new(SidechannelRegistry::new(None));
        let (registration, rx) = registry.register();
        let id = registration.id();
        registration.close();

        assert_eq!(registry.pending(), 0);
        assert!(rx.await.is_err());

        let (pipe, _other) = tokio::io::duplex(8);
        assert!(matches!(
            registry.accept(id, Box::new(pipe)),
            Err(BackendError::UnknownSidechannel(_))
        ));
    }

    #[tokio::test]
    async fn test_drop_releases_waiter() {
        let registry = Arc::new(SidechannelRegistry::new(None));
        {
            let (_registration, _rx) = registry.register();
            let (_registration2, _rx2) = registry.register();
            assert_eq!(registry.pending(), 2);
        }
        assert_eq!(registry.pending(), 0);
    }

    #[tokio::test]
    async fn test_accept_after_waiter_gave_up() {
        let registry = Arc::new(SidechannelRegistry::new(None));
        let (registration, rx) = registry.register();
        drop(rx);

        let (pipe, _other) = tokio::io::duplex(8);
        assert!(matches!(
            registry.accept(registration.id(), Box::new(pipe)),
            Err(BackendError::SidechannelDeregistered(_))
        ));
    }

    #[tokio::test]
    async fn test_listener_handshake() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let registry = Arc::new(SidechannelRegistry::new(Some(address.clone())));
        let shutdown = CancellationToken::new();
        let server = tokio::spawn(serve_sidechannels(
            listener,
            registry.clone(),
            shutdown.clone(),
        ));

        let (registration, rx) = registry.register();
        let mut backend = dial_sidechannel(&address, registration.id()).await.unwrap();
        backend.write_all(b"pack data").await.unwrap();

        let mut pipe = rx.await.unwrap();
        let mut buf = [0u8; 9];
        pipe.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pack data");

        shutdown.cancel();
        server.await.unwrap();
    }

    #[test]
    fn test_sidechannel_id_parse() {
        assert_eq!("17".parse::<SidechannelId>().unwrap(), SidechannelId::new(17));
        assert!("x".parse::<SidechannelId>().is_err());
        assert_eq!(SidechannelId::new(5).to_string(), "5");
    }
}
