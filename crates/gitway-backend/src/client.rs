//! `gitaly.SmartHTTPService` client, plus the one `gitaly.SSHService` call
//! the SSH front end needs.

use crate::proto::{
    InfoRefsRequest, InfoRefsResponse, PostReceivePackRequest, PostReceivePackResponse,
    PostUploadPackWithSidechannelRequest, PostUploadPackWithSidechannelResponse,
    SshUploadPackWithSidechannelRequest, SshUploadPackWithSidechannelResponse,
};
use crate::CallMetadata;
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use gitway_git::GitService;
use tonic::client::Grpc;
use tonic::codec::ProstCodec;
use tonic::codegen::http::uri::PathAndQuery;
use tonic::transport::Channel;
use tonic::{Request, Status};

/// Stream of backend responses.
pub type ResponseStream<T> = BoxStream<'static, Result<T, Status>>;

/// The SmartHTTP calls the proxy makes.
///
/// [`GrpcSmartHttp`] is the real implementation; tests substitute in-process
/// fakes.
#[async_trait]
pub trait SmartHttp: Send + Sync {
    /// Streams the ref advertisement for `service`.
    async fn info_refs(
        &self,
        service: GitService,
        request: InfoRefsRequest,
        metadata: CallMetadata,
    ) -> Result<ResponseStream<InfoRefsResponse>, Status>;

    /// Opens a push. The first request carries the repository and identity,
    /// later ones only data; the stream ending is the half-close.
    async fn post_receive_pack(
        &self,
        requests: BoxStream<'static, PostReceivePackRequest>,
        metadata: CallMetadata,
    ) -> Result<ResponseStream<PostReceivePackResponse>, Status>;

    /// Runs a fetch whose pack data flows over the side-channel named in
    /// `metadata`. Returns once the backend is done with the side-channel.
    async fn post_upload_pack_with_sidechannel(
        &self,
        request: PostUploadPackWithSidechannelRequest,
        metadata: CallMetadata,
    ) -> Result<PostUploadPackWithSidechannelResponse, Status>;

    /// Runs an interactive fetch over the side-channel named in `metadata`.
    /// The backend may write before it has read anything.
    async fn ssh_upload_pack_with_sidechannel(
        &self,
        request: SshUploadPackWithSidechannelRequest,
        metadata: CallMetadata,
    ) -> Result<SshUploadPackWithSidechannelResponse, Status>;
}

/// SmartHTTP over a tonic channel.
#[derive(Debug, Clone)]
pub struct GrpcSmartHttp {
    inner: Grpc<Channel>,
}

impl GrpcSmartHttp {
    pub fn new(channel: Channel) -> Self {
        Self {
            inner: Grpc::new(channel),
        }
    }

    /// A ready client for one call. Clones share the channel.
    async fn ready(&self) -> Result<Grpc<Channel>, Status> {
        let mut grpc = self.inner.clone();
        grpc.ready()
            .await
            .map_err(|e| Status::unknown(format!("service was not ready: {}", e)))?;
        Ok(grpc)
    }
}

fn request<T>(message: T, metadata: &CallMetadata) -> Request<T> {
    let mut request = Request::new(message);
    metadata.apply(request.metadata_mut());
    request
}

#[async_trait]
impl SmartHttp for GrpcSmartHttp {
    async fn info_refs(
        &self,
        service: GitService,
        message: InfoRefsRequest,
        metadata: CallMetadata,
    ) -> Result<ResponseStream<InfoRefsResponse>, Status> {
        let path = match service {
            GitService::UploadPack => {
                PathAndQuery::from_static("/gitaly.SmartHTTPService/InfoRefsUploadPack")
            }
            GitService::ReceivePack => {
                PathAndQuery::from_static("/gitaly.SmartHTTPService/InfoRefsReceivePack")
            }
        };

        let mut grpc = self.ready().await?;
        let response = grpc
            .server_streaming(request(message, &metadata), path, ProstCodec::default())
            .await?;
        Ok(response.into_inner().boxed())
    }

    async fn post_receive_pack(
        &self,
        requests: BoxStream<'static, PostReceivePackRequest>,
        metadata: CallMetadata,
    ) -> Result<ResponseStream<PostReceivePackResponse>, Status> {
        let path = PathAndQuery::from_static("/gitaly.SmartHTTPService/PostReceivePack");

        let mut grpc = self.ready().await?;
        let response = grpc
            .streaming(request(requests, &metadata), path, ProstCodec::default())
            .await?;
        Ok(response.into_inner().boxed())
    }

    async fn post_upload_pack_with_sidechannel(
        &self,
        message: PostUploadPackWithSidechannelRequest,
        metadata: CallMetadata,
    ) -> Result<PostUploadPackWithSidechannelResponse, Status> {
        let path =
            PathAndQuery::from_static("/gitaly.SmartHTTPService/PostUploadPackWithSidechannel");

        let mut grpc = self.ready().await?;
        let response = grpc
            .unary(request(message, &metadata), path, ProstCodec::default())
            .await?;
        Ok(response.into_inner())
    }

    async fn ssh_upload_pack_with_sidechannel(
        &self,
        message: SshUploadPackWithSidechannelRequest,
        metadata: CallMetadata,
    ) -> Result<SshUploadPackWithSidechannelResponse, Status> {
        let path = PathAndQuery::from_static("/gitaly.SSHService/SSHUploadPackWithSidechannel");

        let mut grpc = self.ready().await?;
        let response = grpc
            .unary(request(message, &metadata), path, ProstCodec::default())
            .await?;
        Ok(response.into_inner())
    }
}
