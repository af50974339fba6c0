//! Node configuration.
//!
//! Loaded from YAML; every field has a default, so a partial file (or none at
//! all) is valid. Command-line flags override individual fields in `main`.

use gitway_backend::BackendServer;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Errors loading a configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },
}

/// Configuration for the proxy.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// HTTP listen address.
    pub listen_addr: SocketAddr,
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
    /// `pretty` or `json`.
    pub log_format: String,

    /// Backend every repository is served from.
    pub backend: BackendServer,
    /// Backend storage holding the repositories.
    pub storage_name: String,

    /// Time a client gets to send a request body.
    pub read_deadline_secs: u64,
    /// Directory for held-back response data. Defaults to the system
    /// temporary directory.
    pub spill_dir: Option<PathBuf>,

    /// Where the backend dials back for side-channels. Without it upload-pack
    /// cannot be served.
    pub sidechannel_addr: Option<SocketAddr>,

    /// Advertise hidden refs too.
    pub show_all_refs: bool,
    /// Extra `key=value` git config options sent with every call.
    pub git_config_options: Vec<String>,

    /// Headers a trusted front end sets with the caller's identity.
    pub identity_headers: IdentityHeaders,
}

/// Names of the headers carrying the caller's identity.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct IdentityHeaders {
    pub user_id: String,
    pub username: String,
    pub gl_repository: String,
    pub scoped_user_id: String,
}

impl Default for IdentityHeaders {
    fn default() -> Self {
        Self {
            user_id: "x-gitway-user-id".to_string(),
            username: "x-gitway-username".to_string(),
            gl_repository: "x-gitway-gl-repository".to_string(),
            scoped_user_id: "x-gitway-scoped-user-id".to_string(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 8181)),
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
            backend: BackendServer::new("unix:/var/run/gitaly/gitaly.socket", ""),
            storage_name: "default".to_string(),
            read_deadline_secs: 600,
            spill_dir: None,
            sidechannel_addr: None,
            show_all_refs: false,
            git_config_options: Vec::new(),
            identity_headers: IdentityHeaders::default(),
        }
    }
}

impl Config {
    /// Reads and parses a YAML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_yaml(text: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(text)
    }

    pub fn read_deadline(&self) -> Duration {
        Duration::from_secs(self.read_deadline_secs)
    }

    /// Address handed to the backend for dialing back side-channels.
    pub fn sidechannel_address(&self) -> Option<String> {
        self.sidechannel_addr.map(|addr| format!("tcp://{}", addr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.read_deadline(), Duration::from_secs(600));
        assert!(config.sidechannel_address().is_none());
        assert_eq!(config.identity_headers.user_id, "x-gitway-user-id");
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let config = Config::from_yaml(
            r#"
listen_addr: "0.0.0.0:9000"
backend:
  address: "tcp://gitaly:8075"
  token: "secret"
  features:
    gitaly-feature-fast-fetch: "true"
sidechannel_addr: "10.0.0.5:9001"
show_all_refs: true
identity_headers:
  username: "x-forwarded-user"
"#,
        )
        .unwrap();

        assert_eq!(config.listen_addr, "0.0.0.0:9000".parse().unwrap());
        assert_eq!(config.backend.address, "tcp://gitaly:8075");
        assert_eq!(config.backend.token, "secret");
        assert_eq!(config.backend.features.len(), 1);
        assert_eq!(config.storage_name, "default");
        assert_eq!(config.read_deadline_secs, 600);
        assert!(config.show_all_refs);
        assert_eq!(
            config.sidechannel_address().as_deref(),
            Some("tcp://10.0.0.5:9001")
        );
        assert_eq!(config.identity_headers.username, "x-forwarded-user");
        assert_eq!(config.identity_headers.user_id, "x-gitway-user-id");
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gitway.yaml");
        std::fs::write(&path, "read_deadline_secs: 30\nlog_format: json\n").unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.read_deadline(), Duration::from_secs(30));
        assert_eq!(config.log_format, "json");
    }

    #[test]
    fn test_load_errors() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.yaml");
        assert!(matches!(
            Config::load(&missing),
            Err(ConfigError::Read { .. })
        ));

        let bad = dir.path().join("bad.yaml");
        std::fs::write(&bad, "read_deadline_secs: [not, a, number]\n").unwrap();
        assert!(matches!(Config::load(&bad), Err(ConfigError::Parse { .. })));
    }
}
