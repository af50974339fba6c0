//! Process-wide backend connection cache.

use crate::{BackendError, BackendServer, CacheKey, GrpcSmartHttp, Result, SmartHttp};
use hyper_util::rt::TokioIo;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tonic::transport::{Endpoint, Uri};
use tower::service_fn;

/// Opens a client for a backend server.
pub trait Connector: Send + Sync {
    fn connect(&self, server: &BackendServer) -> Result<Arc<dyn SmartHttp>>;
}

/// Connects lazily over gRPC; the first call dials.
#[derive(Debug, Clone)]
pub struct GrpcConnector {
    connect_timeout: Duration,
}

impl GrpcConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for GrpcConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

impl Connector for GrpcConnector {
    fn connect(&self, server: &BackendServer) -> Result<Arc<dyn SmartHttp>> {
        let invalid = |reason: &str| BackendError::InvalidAddress {
            address: server.address.clone(),
            reason: reason.to_string(),
        };

        let channel = if let Some(path) = unix_socket_path(&server.address) {
            let path = PathBuf::from(path);
            // The URI is required but unused; the connector ignores it.
            Endpoint::from_static("http://[::]:50051")
                .connect_timeout(self.connect_timeout)
                .connect_with_connector_lazy(service_fn(move |_: Uri| {
                    let path = path.clone();
                    async move {
                        let stream = tokio::net::UnixStream::connect(path).await?;
                        Ok::<_, std::io::Error>(TokioIo::new(stream))
                    }
                }))
        } else {
            let url = match server.address.split_once("://") {
                Some(("tcp", rest)) => format!("http://{}", rest),
                Some(("http", _)) => server.address.clone(),
                Some((scheme, _)) => return Err(invalid(&format!("unsupported scheme {}", scheme))),
                None => return Err(invalid("missing scheme")),
            };
            Endpoint::from_shared(url)?
                .connect_timeout(self.connect_timeout)
                .connect_lazy()
        };

        Ok(Arc::new(GrpcSmartHttp::new(channel)))
    }
}

fn unix_socket_path(address: &str) -> Option<&str> {
    address
        .strip_prefix("unix://")
        .or_else(|| address.strip_prefix("unix:"))
        .filter(|path| !path.is_empty())
}

/// One shared client per backend address and token.
///
/// Entries live for the life of the process.
pub struct ConnectionCache {
    connector: Arc<dyn Connector>,
    connections: RwLock<HashMap<CacheKey, Arc<dyn SmartHttp>>>,
}

impl ConnectionCache {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            connections: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the cached client for `server`, connecting on first use.
    pub fn get(&self, server: &BackendServer) -> Result<Arc<dyn SmartHttp>> {
        let key = server.cache_key();
        if let Some(conn) = self.connections.read().get(&key) {
            return Ok(conn.clone());
        }

        let mut connections = self.connections.write();
        // Another request may have connected while we waited for the lock.
        if let Some(conn) = connections.get(&key) {
            return Ok(conn.clone());
        }

        let conn = self.connector.connect(server)?;
        tracing::info!(address = %server.address, "opened backend connection");
        connections.insert(key, conn.clone());
        Ok(conn)
    }

    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::*;
    use crate::{CallMetadata, ResponseStream};
    use async_trait::async_trait;
    use futures::stream::BoxStream;
    use gitway_git::GitService;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tonic::Status;

    struct Unused;

    #[async_trait]
    impl SmartHttp for Unused {
        async fn info_refs(
            &self,
            _service: GitService,
            _request: InfoRefsRequest,
            _metadata: CallMetadata,
        ) -> std::result::Result<ResponseStream<InfoRefsResponse>, Status> {
            Err(Status::unimplemented("info_refs"))
        }

        async fn post_receive_pack(
            &self,
            _requests: BoxStream<'static, PostReceivePackRequest>,
            _metadata: CallMetadata,
        ) -> std::result::Result<ResponseStream<PostReceivePackResponse>, Status> {
            Err(Status::unimplemented("post_receive_pack"))
        }

        async fn post_upload_pack_with_sidechannel(
            &self,
            _request: PostUploadPackWithSidechannelRequest,
            _metadata: CallMetadata,
        ) -> std::result::Result<PostUploadPackWithSidechannelResponse, Status> {
            Err(Status::unimplemented("post_upload_pack_with_sidechannel"))
        }

        async fn ssh_upload_pack_with_sidechannel(
            &self,
            _request: SshUploadPackWithSidechannelRequest,
            _metadata: CallMetadata,
        ) -> std::result::Result<SshUploadPackWithSidechannelResponse, Status> {
            Err(Status::unimplemented("ssh_upload_pack_with_sidechannel"))
        }
    }

    #[derive(Default)]
    struct CountingConnector {
        dials: AtomicUsize,
    }

    impl Connector for CountingConnector {
        fn connect(&self, _server: &BackendServer) -> Result<Arc<dyn SmartHttp>> {
            self.dials.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(Unused))
        }
    }

    #[test]
    fn test_same_key_shares_connection() {
        let connector = Arc::new(CountingConnector::default());
        let cache = ConnectionCache::new(connector.clone());

        let a = cache.get(&BackendServer::new("tcp://gitaly:8075", "t1")).unwrap();
        let b = cache.get(&BackendServer::new("tcp://gitaly:8075", "t1")).unwrap();
        let c = cache.get(&BackendServer::new("tcp://gitaly:8075", "t2")).unwrap();

        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(connector.dials.load(Ordering::SeqCst), 2);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_concurrent_lookups_dial_once() {
        let connector = Arc::new(CountingConnector::default());
        let cache = Arc::new(ConnectionCache::new(connector.clone()));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                std::thread::spawn(move || {
                    cache
                        .get(&BackendServer::new("unix:/run/gitaly.sock", "t"))
                        .unwrap()
                })
            })
            .collect();
        let conns: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert!(conns.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
        assert_eq!(connector.dials.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_grpc_connector_addresses() {
        let connector = GrpcConnector::default();
        assert!(connector
            .connect(&BackendServer::new("tcp://127.0.0.1:8075", ""))
            .is_ok());
        assert!(connector
            .connect(&BackendServer::new("unix:/tmp/gitaly.socket", ""))
            .is_ok());
        assert!(matches!(
            connector.connect(&BackendServer::new("tls://gitaly:8075", "")),
            Err(BackendError::InvalidAddress { .. })
        ));
        assert!(matches!(
            connector.connect(&BackendServer::new("gitaly:8075", "")),
            Err(BackendError::InvalidAddress { .. })
        ));
    }

    #[test]
    fn test_unix_socket_path() {
        assert_eq!(unix_socket_path("unix:/run/g.sock"), Some("/run/g.sock"));
        assert_eq!(unix_socket_path("unix:///run/g.sock"), Some("/run/g.sock"));
        assert_eq!(unix_socket_path("unix:"), None);
        assert_eq!(unix_socket_path("tcp://h:1"), None);
    }
}
