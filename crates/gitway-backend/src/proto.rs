//! Messages of `gitaly.SmartHTTPService` and the status details it attaches.
//!
//! Only the fields the proxy reads or writes are declared; prost skips
//! unknown fields when decoding.

/// Repository on a backend storage.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Repository {
    #[prost(string, tag = "2")]
    pub storage_name: String,
    #[prost(string, tag = "3")]
    pub relative_path: String,
    #[prost(string, tag = "6")]
    pub gl_repository: String,
    #[prost(string, tag = "8")]
    pub gl_project_path: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct InfoRefsRequest {
    #[prost(message, optional, tag = "1")]
    pub repository: Option<Repository>,
    /// `key=value` pairs passed to git as `-c` options.
    #[prost(string, repeated, tag = "5")]
    pub git_config_options: Vec<String>,
    #[prost(string, tag = "6")]
    pub git_protocol: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct InfoRefsResponse {
    #[prost(bytes = "vec", tag = "1")]
    pub data: Vec<u8>,
}

/// One frame of a push. Only the first frame carries anything but `data`.
#[derive(Clone, PartialEq, prost::Message)]
pub struct PostReceivePackRequest {
    #[prost(message, optional, tag = "1")]
    pub repository: Option<Repository>,
    #[prost(bytes = "vec", tag = "2")]
    pub data: Vec<u8>,
    #[prost(string, tag = "3")]
    pub gl_id: String,
    #[prost(string, tag = "4")]
    pub gl_repository: String,
    #[prost(string, tag = "5")]
    pub gl_username: String,
    #[prost(string, tag = "6")]
    pub git_protocol: String,
    #[prost(string, repeated, tag = "7")]
    pub git_config_options: Vec<String>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct PostReceivePackResponse {
    #[prost(bytes = "vec", tag = "1")]
    pub data: Vec<u8>,
}

/// Pack data for this call flows over the side-channel named in the call
/// metadata.
#[derive(Clone, PartialEq, prost::Message)]
pub struct PostUploadPackWithSidechannelRequest {
    #[prost(message, optional, tag = "1")]
    pub repository: Option<Repository>,
    #[prost(string, repeated, tag = "2")]
    pub git_config_options: Vec<String>,
    #[prost(string, tag = "3")]
    pub git_protocol: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct PostUploadPackWithSidechannelResponse {}

/// Interactive fetch for an SSH front end. Negotiation runs over the
/// side-channel in both directions at once.
#[derive(Clone, PartialEq, prost::Message)]
pub struct SshUploadPackWithSidechannelRequest {
    #[prost(message, optional, tag = "1")]
    pub repository: Option<Repository>,
    #[prost(string, repeated, tag = "2")]
    pub git_config_options: Vec<String>,
    #[prost(string, tag = "3")]
    pub git_protocol: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct SshUploadPackWithSidechannelResponse {}

/// Status detail sent when a concurrency or rate limit rejected the call.
#[derive(Clone, PartialEq, prost::Message)]
pub struct LimitError {
    #[prost(string, tag = "1")]
    pub error_message: String,
    #[prost(message, optional, tag = "2")]
    pub retry_after: Option<prost_types::Duration>,
}

/// `google.rpc.Status`, carried in the `grpc-status-details-bin` trailer.
#[derive(Clone, PartialEq, prost::Message)]
pub struct RpcStatus {
    #[prost(int32, tag = "1")]
    pub code: i32,
    #[prost(string, tag = "2")]
    pub message: String,
    #[prost(message, repeated, tag = "3")]
    pub details: Vec<prost_types::Any>,
}
