//! Backend server identity and per-call metadata.

use crate::SidechannelId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tonic::metadata::{AsciiMetadataValue, MetadataKey, MetadataMap};

/// Only feature flags with this prefix are forwarded to the backend.
pub const FEATURE_PREFIX: &str = "gitaly-feature-";

/// A backend the proxy can call.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendServer {
    /// `tcp://host:port`, `http://host:port` or `unix:/path/to/socket`.
    pub address: String,
    /// Bearer token sent with every call.
    pub token: String,
    /// Feature flags forwarded as call metadata.
    pub features: BTreeMap<String, String>,
}

impl BackendServer {
    pub fn new(address: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            token: token.into(),
            features: BTreeMap::new(),
        }
    }

    /// Connections are shared between servers with the same key.
    pub fn cache_key(&self) -> CacheKey {
        CacheKey {
            address: self.address.clone(),
            token: self.token.clone(),
        }
    }
}

impl fmt::Debug for BackendServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendServer")
            .field("address", &self.address)
            .field("token", &"[REDACTED]")
            .field("features", &self.features)
            .finish()
    }
}

/// Key of the connection cache.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    address: String,
    token: String,
}

impl fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheKey")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

/// Who is making the request, as resolved by authorization.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientIdentity {
    /// `user-<id>` or `key-<id>`.
    pub user_id: String,
    pub username: String,
    /// `project-<id>`, `wiki-<id>` or `snippet-<id>`.
    pub gl_repository: String,
    /// Set when a deploy token or job token acts on behalf of a user.
    pub scoped_user_id: Option<String>,
}

/// Metadata attached to one backend call.
#[derive(Clone, Default)]
pub struct CallMetadata {
    entries: BTreeMap<String, String>,
    authorization: Option<String>,
}

impl CallMetadata {
    /// Metadata every call to `server` carries: its token and feature flags.
    pub fn for_server(server: &BackendServer) -> Self {
        let entries = server
            .features
            .iter()
            .filter(|(key, _)| key.starts_with(FEATURE_PREFIX))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        let authorization =
            (!server.token.is_empty()).then(|| format!("Bearer {}", server.token));

        Self {
            entries,
            authorization,
        }
    }

    /// Adds the client identity. Empty fields are left out.
    pub fn with_identity(mut self, identity: &ClientIdentity) -> Self {
        self.insert_non_empty("user_id", &identity.user_id);
        self.insert_non_empty("username", &identity.username);
        self.insert_non_empty("gl_repository", &identity.gl_repository);
        if let Some(scoped) = &identity.scoped_user_id {
            self.insert_non_empty("scoped_user_id", scoped);
        }
        self
    }

    /// Points the backend at a registered side-channel.
    pub fn with_sidechannel(mut self, id: SidechannelId, address: Option<&str>) -> Self {
        self.insert("sidechannel-id", id.to_string());
        if let Some(address) = address {
            self.insert("sidechannel-address", address);
        }
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn authorization(&self) -> Option<&str> {
        self.authorization.as_deref()
    }

    /// The side-channel this call refers to, if any.
    pub fn sidechannel_id(&self) -> Option<SidechannelId> {
        self.get("sidechannel-id").and_then(|id| id.parse().ok())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Copies the metadata onto an outgoing request. Keys or values that are
    /// not valid gRPC ASCII metadata are skipped.
    pub fn apply(&self, map: &mut MetadataMap) {
        let auth = self
            .authorization
            .as_deref()
            .map(|value| ("authorization", value));

        for (key, value) in self.iter().chain(auth) {
            let Ok(key) = MetadataKey::from_bytes(key.as_bytes()) else {
                tracing::warn!(key, "skipping invalid metadata key");
                continue;
            };
            let Ok(value) = AsciiMetadataValue::try_from(value) else {
                tracing::warn!(key = key.as_str(), "skipping invalid metadata value");
                continue;
            };
            map.insert(key, value);
        }
    }

    fn insert_non_empty(&mut self, key: &str, value: &str) {
        if !value.is_empty() {
            self.insert(key, value);
        }
    }
}

impl fmt::Debug for CallMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallMetadata")
            .field("entries", &self.entries)
            .field("authorization", &self.authorization.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server() -> BackendServer {
        let mut server = BackendServer::new("tcp://gitaly:8075", "secret");
        server
            .features
            .insert("gitaly-feature-cache".to_string(), "true".to_string());
        server
            .features
            .insert("bad-feature-name".to_string(), "true".to_string());
        server
    }

    #[test]
    fn test_only_prefixed_features_forwarded() {
        let md = CallMetadata::for_server(&server());
        assert_eq!(md.get("gitaly-feature-cache"), Some("true"));
        assert_eq!(md.get("bad-feature-name"), None);
        assert_eq!(md.authorization(), Some("Bearer secret"));
    }

    #[test]
    fn test_identity_metadata() {
        let identity = ClientIdentity {
            user_id: "user-123".to_string(),
            username: "alice".to_string(),
            gl_repository: "project-7".to_string(),
            scoped_user_id: None,
        };
        let md = CallMetadata::for_server(&server()).with_identity(&identity);
        assert_eq!(md.get("user_id"), Some("user-123"));
        assert_eq!(md.get("username"), Some("alice"));
        assert_eq!(md.get("gl_repository"), Some("project-7"));
        assert_eq!(md.get("scoped_user_id"), None);
    }

    #[test]
    fn test_apply_to_grpc_metadata() {
        let md = CallMetadata::for_server(&server())
            .with_sidechannel(SidechannelId::new(42), Some("tcp://proxy:9999"));
        let mut map = MetadataMap::new();
        md.apply(&mut map);

        assert_eq!(map.get("authorization").unwrap(), "Bearer secret");
        assert_eq!(map.get("sidechannel-id").unwrap(), "42");
        assert_eq!(map.get("sidechannel-address").unwrap(), "tcp://proxy:9999");
        assert_eq!(md.sidechannel_id(), Some(SidechannelId::new(42)));
    }

    #[test]
    fn test_invalid_metadata_skipped() {
        let mut md = CallMetadata::default();
        md.insert("Not A Key", "value");
        md.insert("username", "caf\u{e9}\n");
        md.insert("user_id", "user-1");
        let mut map = MetadataMap::new();
        md.apply(&mut map);
        assert_eq!(map.len(), 1);
        assert_eq!(map.get("user_id").unwrap(), "user-1");
    }

    #[test]
    fn test_cache_key_and_debug_hide_token() {
        let a = server();
        let mut b = server();
        b.features.clear();
        assert_eq!(a.cache_key(), b.cache_key());

        let c = BackendServer::new("tcp://gitaly:8075", "other");
        assert_ne!(a.cache_key(), c.cache_key());

        assert!(!format!("{:?}", a).contains("secret"));
        assert!(!format!("{:?}", CallMetadata::for_server(&a)).contains("secret"));
    }
}
