//! Gitway backend client.
//!
//! Talks to the repository service over gRPC (`gitaly.SmartHTTPService`) and
//! turns its calls into plain byte relays:
//!
//! - [`ConnectionCache`] shares one channel per backend address and token.
//! - [`StreamClient`] runs info-refs, receive-pack and side-channel
//!   upload-pack (stateless or interactive) against a [`SmartHttp`]
//!   implementation.
//! - [`SidechannelRegistry`] pairs upload-pack calls with the raw duplex
//!   connection the backend opens back to the proxy.
//! - [`is_overloaded`] finds the backend's structured limit error in any
//!   error chain so callers can answer with a git-native busy message.

mod cache;
mod client;
mod error;
pub mod proto;
mod overload;
mod server;
mod sidechannel;
mod stream;

pub use cache::{ConnectionCache, Connector, GrpcConnector};
pub use client::{GrpcSmartHttp, ResponseStream, SmartHttp};
pub use error::BackendError;
pub use overload::{is_overloaded, is_unavailable, limit_exceeded_status, LIMIT_ERROR_TYPE_URL};
pub use server::{BackendServer, CacheKey, CallMetadata, ClientIdentity, FEATURE_PREFIX};
pub use sidechannel::{
    dial_sidechannel, serve_sidechannels, BoxPipe, DuplexPipe, SidechannelId,
    SidechannelRegistration, SidechannelRegistry,
};
pub use stream::{Relayed, StreamClient};

/// Result type for backend operations.
pub type Result<T> = std::result::Result<T, BackendError>;
