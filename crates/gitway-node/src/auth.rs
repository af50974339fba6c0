//! Resolving who may do what to which repository.

use crate::config::{Config, IdentityHeaders};
use async_trait::async_trait;
use axum::http::HeaderMap;
use gitway_backend::proto::Repository;
use gitway_backend::{BackendServer, ClientIdentity};
use thiserror::Error;

/// Git config option that makes hidden refs visible.
pub const SHOW_ALL_REFS_OPTION: &str = "transfer.hideRefs=!refs";

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("access denied: {0}")]
    Forbidden(String),
    #[error("invalid header {0}")]
    InvalidHeader(String),
}

/// Everything a git operation needs to know about its repository.
#[derive(Debug, Clone)]
pub struct RepoContext {
    pub repository: Repository,
    pub server: BackendServer,
    pub identity: ClientIdentity,
    pub show_all_refs: bool,
    pub git_config_options: Vec<String>,
}

impl RepoContext {
    /// Options for ref advertisement and fetches.
    pub fn fetch_config_options(&self) -> Vec<String> {
        let mut options = self.git_config_options.clone();
        if self.show_all_refs {
            options.push(SHOW_ALL_REFS_OPTION.to_string());
        }
        options
    }
}

/// Decides whether a request may touch a repository and where it lives.
#[async_trait]
pub trait Authorizer: Send + Sync {
    async fn authorize(&self, repo_path: &str, headers: &HeaderMap)
        -> Result<RepoContext, AuthError>;
}

/// Serves every repository from one configured backend and takes the caller's
/// identity from headers set by a trusted front end.
pub struct StaticAuthorizer {
    server: BackendServer,
    storage_name: String,
    headers: IdentityHeaders,
    show_all_refs: bool,
    git_config_options: Vec<String>,
}

impl StaticAuthorizer {
    pub fn from_config(config: &Config) -> Self {
        Self {
            server: config.backend.clone(),
            storage_name: config.storage_name.clone(),
            headers: config.identity_headers.clone(),
            show_all_refs: config.show_all_refs,
            git_config_options: config.git_config_options.clone(),
        }
    }

    fn header(&self, headers: &HeaderMap, name: &str) -> Result<String, AuthError> {
        match headers.get(name) {
            Some(value) => value
                .to_str()
                .map(|v| v.trim().to_string())
                .map_err(|_| AuthError::InvalidHeader(name.to_string())),
            None => Ok(String::new()),
        }
    }
}

#[async_trait]
impl Authorizer for StaticAuthorizer {
    async fn authorize(
        &self,
        repo_path: &str,
        headers: &HeaderMap,
    ) -> Result<RepoContext, AuthError> {
        let relative_path = repo_path.trim_start_matches('/');
        if relative_path.is_empty() {
            return Err(AuthError::Forbidden("empty repository path".to_string()));
        }

        let scoped_user_id = self.header(headers, &self.headers.scoped_user_id)?;
        let identity = ClientIdentity {
            user_id: self.header(headers, &self.headers.user_id)?,
            username: self.header(headers, &self.headers.username)?,
            gl_repository: self.header(headers, &self.headers.gl_repository)?,
            scoped_user_id: (!scoped_user_id.is_empty()).then_some(scoped_user_id),
        };

        let repository = Repository {
            storage_name: self.storage_name.clone(),
            relative_path: relative_path.to_string(),
            gl_repository: identity.gl_repository.clone(),
            gl_project_path: relative_path
                .strip_suffix(".git")
                .unwrap_or(relative_path)
                .to_string(),
        };

        Ok(RepoContext {
            repository,
            server: self.server.clone(),
            identity,
            show_all_refs: self.show_all_refs,
            git_config_options: self.git_config_options.clone(),
        })
    }
}
